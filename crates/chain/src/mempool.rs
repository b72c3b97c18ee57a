//! Transaction pool.
//!
//! Transactions move through three lists. `queued` holds statically verified
//! transactions waiting for the next fill tick, `unconfirmed` holds the ones
//! whose effect is reflected in the unconfirmed half of the ledger, and
//! `pending` holds multisignature transactions still collecting member
//! signatures. Only `unconfirmed` transactions are eligible for forging.

use crate::processor::{TransactionError, TransactionProcessor, TxContext};
use dposchain_consensus::{Classify, ErrorClass};
use dposchain_core::{Asset, Hash, MemberSignature, PublicKey, Signature, Transaction};
use dposchain_storage::{LedgerReader, LedgerWriter};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;
use tracing::debug;

const SECONDS_PER_HOUR: u64 = 3_600;

/// Errors that can occur during pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("transaction {0} already in pool")]
    AlreadyInPool(Hash),

    #[error("{list:?} list is full (capacity: {capacity})")]
    PoolFull { list: PoolList, capacity: usize },

    #[error("transaction {0} not found in pool")]
    NotFound(Hash),

    #[error("transaction {0} is not waiting for signatures")]
    NotPending(Hash),

    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

impl Classify for PoolError {
    fn class(&self) -> ErrorClass {
        match self {
            PoolError::AlreadyInPool(_) | PoolError::NotFound(_) | PoolError::NotPending(_) => {
                ErrorClass::Malformed
            }
            PoolError::PoolFull { .. } => ErrorClass::Transient,
            PoolError::Transaction(err) => err.class(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;

/// Which list a pooled transaction sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolList {
    Queued,
    Unconfirmed,
    Pending,
}

/// Configuration for the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_unconfirmed: usize,
    pub max_queued: usize,
    pub max_pending: usize,
    /// Seconds a queued or unconfirmed transaction may stay in the pool.
    pub unconfirmed_expiry: u64,
    /// Hours a pending transaction waits when no multisig lifetime applies.
    pub pending_expiry_default: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_unconfirmed: 1_000,
            max_queued: 5_000,
            max_pending: 1_000,
            unconfirmed_expiry: 10_800,
            pending_expiry_default: 24,
        }
    }
}

/// What block processing needs from the pool: taking its unconfirmed
/// effects off a ledger and putting the survivors back.
pub trait PoolView {
    /// Undo every unconfirmed transaction on `ledger`, newest first. The
    /// pool itself is unchanged.
    fn undo_unconfirmed<L: LedgerWriter>(
        &self,
        ledger: &mut L,
    ) -> std::result::Result<(), TransactionError>;

    /// Re-apply unconfirmed transactions on `ledger` after a block changed
    /// the state beneath them. Transactions in `exclude` or that no longer
    /// apply are skipped; their ids are returned so the caller can drop
    /// them once the block is committed.
    fn reapply_unconfirmed<L: LedgerWriter>(
        &self,
        ctx: &TxContext,
        ledger: &mut L,
        exclude: &HashSet<Hash>,
    ) -> std::result::Result<Vec<Hash>, TransactionError>;

    /// Forging candidates, in pool order.
    fn candidates(&self) -> Vec<&Transaction>;
}

#[derive(Debug, Clone)]
struct PoolEntry {
    transaction: Transaction,
    list: PoolList,
    received_at: u64,
    /// Seconds after `received_at` at which the entry is dropped.
    expires_after: u64,
}

/// Transaction pool.
pub struct TransactionPool {
    config: PoolConfig,
    processor: TransactionProcessor,
    entries: HashMap<Hash, PoolEntry>,
    queued: VecDeque<Hash>,
    unconfirmed: VecDeque<Hash>,
    pending: VecDeque<Hash>,
}

impl TransactionPool {
    pub fn new(processor: TransactionProcessor) -> Self {
        Self::with_config(processor, PoolConfig::default())
    }

    pub fn with_config(processor: TransactionProcessor, config: PoolConfig) -> Self {
        Self {
            config,
            processor,
            entries: HashMap::new(),
            queued: VecDeque::new(),
            unconfirmed: VecDeque::new(),
            pending: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &Hash) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &Hash) -> Option<&Transaction> {
        self.entries.get(id).map(|entry| &entry.transaction)
    }

    pub fn list_of(&self, id: &Hash) -> Option<PoolList> {
        self.entries.get(id).map(|entry| entry.list)
    }

    /// Transactions in `list`, oldest first.
    pub fn transactions(&self, list: PoolList) -> Vec<&Transaction> {
        self.order(list)
            .iter()
            .filter_map(|id| self.get(id))
            .collect()
    }

    /// Unconfirmed transactions in the order they were applied.
    pub fn unconfirmed(&self) -> Vec<&Transaction> {
        self.transactions(PoolList::Unconfirmed)
    }

    /// Admit a transaction. It lands in `pending` when member signatures are
    /// still missing, in `queued` otherwise.
    pub fn add<L: LedgerReader>(
        &mut self,
        tx: Transaction,
        ctx: &TxContext,
        ledger: &L,
        now: u64,
    ) -> Result<PoolList> {
        let id = tx.id();
        if self.contains(&id) {
            return Err(PoolError::AlreadyInPool(id));
        }
        self.processor.verify_static(&tx, ctx)?;
        let missing = self.processor.missing_signatures(&tx, ledger)?;

        let list = if missing.is_some() {
            PoolList::Pending
        } else {
            PoolList::Queued
        };
        self.ensure_capacity(list)?;
        let expires_after = match list {
            PoolList::Pending => self.pending_lifetime(&tx, ledger)?,
            _ => self.config.unconfirmed_expiry,
        };
        self.insert(id, tx, list, now, expires_after);
        debug!(id = %id, ?list, "Added transaction to pool");
        Ok(list)
    }

    /// Attach a member signature to a pending transaction. Returns `true`
    /// once the transaction is fully signed and has moved to `queued`.
    pub fn add_signature<L: LedgerReader>(
        &mut self,
        id: &Hash,
        public_key: PublicKey,
        signature: Signature,
        ledger: &L,
    ) -> Result<bool> {
        let entry = self.entries.get_mut(id).ok_or(PoolError::NotFound(*id))?;
        if entry.list != PoolList::Pending {
            return Err(PoolError::NotPending(*id));
        }
        entry.transaction.signatures.push(MemberSignature {
            public_key,
            signature,
        });
        let missing = match self.processor.missing_signatures(&entry.transaction, ledger) {
            Ok(missing) => missing,
            Err(err) => {
                entry.transaction.signatures.pop();
                return Err(err.into());
            }
        };
        if missing.is_some() {
            return Ok(false);
        }
        if self.queued.len() >= self.config.max_queued {
            return Err(PoolError::PoolFull {
                list: PoolList::Queued,
                capacity: self.config.max_queued,
            });
        }
        entry.list = PoolList::Queued;
        entry.expires_after = self.config.unconfirmed_expiry;
        self.pending.retain(|pending| pending != id);
        self.queued.push_back(*id);
        debug!(id = %id, "Multisignature transaction ready");
        Ok(true)
    }

    /// Move queued transactions into `unconfirmed` until the list is full.
    /// Transactions that no longer verify or apply are dropped. Returns the
    /// number applied.
    pub fn fill<L: LedgerWriter>(&mut self, ctx: &TxContext, ledger: &mut L) -> Result<usize> {
        let mut applied = 0;
        while self.unconfirmed.len() < self.config.max_unconfirmed {
            let Some(id) = self.queued.pop_front() else {
                break;
            };
            let Some(entry) = self.entries.get(&id) else {
                continue;
            };
            let outcome = self
                .processor
                .verify(&entry.transaction, ctx, &*ledger)
                .and_then(|()| self.processor.apply_unconfirmed(&entry.transaction, ledger));
            match outcome {
                Ok(()) => {
                    if let Some(entry) = self.entries.get_mut(&id) {
                        entry.list = PoolList::Unconfirmed;
                    }
                    self.unconfirmed.push_back(id);
                    applied += 1;
                }
                Err(err) if err.class().is_fatal() => {
                    self.queued.push_front(id);
                    return Err(err.into());
                }
                Err(err) => {
                    debug!(id = %id, error = %err, "Dropped queued transaction");
                    self.entries.remove(&id);
                }
            }
        }
        Ok(applied)
    }

    /// Remove transactions from whichever list holds them.
    pub fn remove(&mut self, ids: &[Hash]) -> Vec<Transaction> {
        let set: HashSet<&Hash> = ids.iter().collect();
        self.queued.retain(|id| !set.contains(id));
        self.unconfirmed.retain(|id| !set.contains(id));
        self.pending.retain(|id| !set.contains(id));
        ids.iter()
            .filter_map(|id| self.entries.remove(id))
            .map(|entry| entry.transaction)
            .collect()
    }

    /// Put transactions from a rolled-back block back at the front of
    /// `queued` so the next fill re-verifies them.
    pub fn requeue(&mut self, transactions: Vec<Transaction>, now: u64) {
        for tx in transactions.into_iter().rev() {
            let id = tx.id();
            if self.contains(&id) {
                continue;
            }
            self.entries.insert(
                id,
                PoolEntry {
                    transaction: tx,
                    list: PoolList::Queued,
                    received_at: now,
                    expires_after: self.config.unconfirmed_expiry,
                },
            );
            self.queued.push_front(id);
        }
    }

    /// Drop expired transactions. Expired unconfirmed transactions are
    /// undone on `ledger` first; unconfirmed survivors that no longer apply
    /// without them are dropped as well. Returns every removed id.
    pub fn expire<L: LedgerWriter>(&mut self, now: u64, ledger: &mut L) -> Result<Vec<Hash>> {
        let mut removed: Vec<Hash> = self
            .entries
            .iter()
            .filter(|(_, entry)| now.saturating_sub(entry.received_at) >= entry.expires_after)
            .map(|(id, _)| *id)
            .collect();
        if removed.is_empty() {
            return Ok(removed);
        }

        let (survivors, touches_unconfirmed) = {
            let set: HashSet<&Hash> = removed.iter().collect();
            let survivors: Vec<Hash> = self
                .unconfirmed
                .iter()
                .filter(|id| !set.contains(id))
                .copied()
                .collect();
            (survivors, self.unconfirmed.iter().any(|id| set.contains(id)))
        };
        if touches_unconfirmed {
            // Undo newest first so every undo sees the state its apply left.
            self.undo_unconfirmed(ledger)?;
            for id in survivors {
                let Some(entry) = self.entries.get(&id) else {
                    continue;
                };
                match self.processor.apply_unconfirmed(&entry.transaction, ledger) {
                    Ok(()) => {}
                    Err(err) if err.class().is_fatal() => return Err(err.into()),
                    Err(err) => {
                        debug!(id = %id, error = %err, "Dropped transaction orphaned by expiry");
                        removed.push(id);
                    }
                }
            }
        }

        self.remove(&removed);
        debug!(count = removed.len(), "Expired pool transactions");
        Ok(removed)
    }

    /// Drop everything. Callers must reset unconfirmed ledger state too.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.queued.clear();
        self.unconfirmed.clear();
        self.pending.clear();
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            queued: self.queued.len(),
            unconfirmed: self.unconfirmed.len(),
            pending: self.pending.len(),
            capacity: self.config.max_unconfirmed,
        }
    }

    fn order(&self, list: PoolList) -> &VecDeque<Hash> {
        match list {
            PoolList::Queued => &self.queued,
            PoolList::Unconfirmed => &self.unconfirmed,
            PoolList::Pending => &self.pending,
        }
    }

    fn ensure_capacity(&self, list: PoolList) -> Result<()> {
        let capacity = match list {
            PoolList::Queued => self.config.max_queued,
            PoolList::Unconfirmed => self.config.max_unconfirmed,
            PoolList::Pending => self.config.max_pending,
        };
        if self.order(list).len() >= capacity {
            return Err(PoolError::PoolFull { list, capacity });
        }
        Ok(())
    }

    fn insert(&mut self, id: Hash, tx: Transaction, list: PoolList, now: u64, expires_after: u64) {
        self.entries.insert(
            id,
            PoolEntry {
                transaction: tx,
                list,
                received_at: now,
                expires_after,
            },
        );
        match list {
            PoolList::Queued => self.queued.push_back(id),
            PoolList::Unconfirmed => self.unconfirmed.push_back(id),
            PoolList::Pending => self.pending.push_back(id),
        }
    }

    /// Multisig lifetime in seconds: from the registration asset, else the
    /// sender's registered settings, else the configured default.
    fn pending_lifetime<L: LedgerReader>(&self, tx: &Transaction, ledger: &L) -> Result<u64> {
        let hours = match &tx.asset {
            Asset::Multisignature { lifetime, .. } => u64::from(*lifetime),
            _ => ledger
                .account(&tx.sender_address)
                .map_err(TransactionError::from)?
                .and_then(|account| account.confirmed.multisig)
                .map(|settings| u64::from(settings.lifetime))
                .unwrap_or(self.config.pending_expiry_default),
        };
        Ok(hours * SECONDS_PER_HOUR)
    }
}

impl PoolView for TransactionPool {
    fn undo_unconfirmed<L: LedgerWriter>(
        &self,
        ledger: &mut L,
    ) -> std::result::Result<(), TransactionError> {
        for id in self.unconfirmed.iter().rev() {
            if let Some(entry) = self.entries.get(id) {
                self.processor.undo_unconfirmed(&entry.transaction, ledger)?;
            }
        }
        Ok(())
    }

    fn reapply_unconfirmed<L: LedgerWriter>(
        &self,
        ctx: &TxContext,
        ledger: &mut L,
        exclude: &HashSet<Hash>,
    ) -> std::result::Result<Vec<Hash>, TransactionError> {
        let mut dropped = Vec::new();
        for id in &self.unconfirmed {
            let Some(entry) = self.entries.get(id) else {
                continue;
            };
            if exclude.contains(id) {
                dropped.push(*id);
                continue;
            }
            let outcome = self
                .processor
                .verify(&entry.transaction, ctx, &*ledger)
                .and_then(|()| self.processor.apply_unconfirmed(&entry.transaction, ledger));
            match outcome {
                Ok(()) => {}
                Err(err) if err.class().is_fatal() => return Err(err),
                Err(err) => {
                    debug!(id = %id, error = %err, "Unconfirmed transaction no longer applies");
                    dropped.push(*id);
                }
            }
        }
        Ok(dropped)
    }

    fn candidates(&self) -> Vec<&Transaction> {
        self.unconfirmed()
    }
}

/// Pool statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub queued: usize,
    pub unconfirmed: usize,
    pub pending: usize,
    /// Maximum size of the unconfirmed list.
    pub capacity: usize,
}
