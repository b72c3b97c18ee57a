//! Block processing.
//!
//! A received block moves through
//! `Received -> SlotVerified -> PayloadVerified -> TransactionsApplied ->
//! Committed`. Each stage is its own type, so a block can only be committed
//! after every check ran. Transactions are applied to a [`ScratchLedger`];
//! nothing reaches storage until the final commit writes the touched
//! accounts, the block and any round records in one batch.

use crate::mempool::PoolView;
use crate::processor::{TransactionError, TransactionProcessor, TxContext};
use dposchain_consensus::{
    BlockForger, BlockValidator, Classify, ConsensusError, DelegateSelector, ErrorClass,
    ForgedBlock, RoundAccountant, RoundAnchor,
};
use dposchain_core::{Block, ChainConstants, Hash, PublicKey, RoundSettlement, Transaction};
use dposchain_storage::{
    AccountStore, BalanceKind, BlockCommit, BlockRollback, ChainReader, ChainStore, ChainTip,
    LedgerWriter, ScratchLedger, StorageError,
};
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, info};

/// Errors that can occur while processing or undoing a block.
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("block {0} is already known")]
    AlreadyKnown(Hash),

    #[error("parent block {0} is not in the chain")]
    UnknownParent(Hash),

    #[error("chain has no genesis block")]
    NotInitialized,

    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error("transaction {0} appears twice in the block")]
    DuplicateTransaction(Hash),

    #[error("transaction {index} ({id}) rejected: {source}")]
    Transaction {
        index: usize,
        id: Hash,
        source: TransactionError,
    },

    #[error("failed to undo transaction {id}: {source}")]
    UndoFailed { id: Hash, source: TransactionError },

    #[error("pool reconciliation failed: {0}")]
    Pool(TransactionError),

    #[error("no settlement stored for round {0}")]
    MissingSettlement(u64),

    #[error("genesis block cannot be undone")]
    CannotUndoGenesis,

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl Classify for BlockError {
    fn class(&self) -> ErrorClass {
        match self {
            BlockError::AlreadyKnown(_) | BlockError::UnknownParent(_) => ErrorClass::Malformed,
            BlockError::DuplicateTransaction(_) | BlockError::CannotUndoGenesis => {
                ErrorClass::Consistency
            }
            BlockError::Consensus(err) => err.class(),
            BlockError::Transaction { source, .. } => source.class(),
            BlockError::NotInitialized
            | BlockError::UndoFailed { .. }
            | BlockError::Pool(_)
            | BlockError::MissingSettlement(_)
            | BlockError::Storage(_) => ErrorClass::Fatal,
        }
    }
}

pub type Result<T> = std::result::Result<T, BlockError>;

/// A block part-way through processing. `S` is the last stage it passed.
pub struct Staged<S> {
    block: Block,
    stage: S,
}

impl<S> Staged<S> {
    pub fn block(&self) -> &Block {
        &self.block
    }
}

pub struct Received {
    parent: Block,
}

pub struct SlotVerified;

pub struct PayloadVerified;

pub struct TransactionsApplied {
    scratch: ScratchLedger<AccountStore>,
    settlement: Option<RoundSettlement>,
    next_forgers: Option<(u64, Vec<PublicKey>)>,
    pool_dropped: Vec<Hash>,
}

impl Staged<TransactionsApplied> {
    pub fn settlement(&self) -> Option<&RoundSettlement> {
        self.stage.settlement.as_ref()
    }
}

/// Result of committing a block.
#[derive(Debug, Clone)]
pub struct Committed {
    pub tip: ChainTip,
    /// Ids of the block's transactions.
    pub confirmed: Vec<Hash>,
    /// Pool transactions that no longer apply on top of the block.
    pub pool_dropped: Vec<Hash>,
    pub settled_round: Option<u64>,
}

/// Result of removing the tip block.
#[derive(Debug, Clone)]
pub struct RolledBack {
    pub block: Block,
    pub tip: ChainTip,
    pub pool_dropped: Vec<Hash>,
}

/// Verifies, applies, commits and undoes blocks.
pub struct BlockProcessor {
    constants: ChainConstants,
    store: ChainStore,
    validator: BlockValidator,
    accountant: RoundAccountant,
    processor: TransactionProcessor,
    selector: DelegateSelector,
}

impl BlockProcessor {
    pub fn new(store: ChainStore, constants: ChainConstants) -> Self {
        Self {
            validator: BlockValidator::new(constants.clone()),
            accountant: RoundAccountant::new(constants.clone()),
            processor: TransactionProcessor::new(constants.clone()),
            selector: DelegateSelector::new(constants.clone()),
            constants,
            store,
        }
    }

    pub fn constants(&self) -> &ChainConstants {
        &self.constants
    }

    pub fn store(&self) -> &ChainStore {
        &self.store
    }

    pub fn transactions(&self) -> &TransactionProcessor {
        &self.processor
    }

    pub fn validator(&self) -> &BlockValidator {
        &self.validator
    }

    pub fn tip(&self) -> Result<ChainTip> {
        self.store.tip()?.ok_or(BlockError::NotInitialized)
    }

    /// Ordered forgers for the round containing `height`.
    pub fn forgers_at(&mut self, height: u64) -> Result<Vec<PublicKey>> {
        let accounts = self.store.accounts();
        Ok(self.selector.select_forgers(height, &accounts, &self.store)?)
    }

    // =========================================================================
    // Genesis
    // =========================================================================

    /// Apply and store the genesis block on an empty chain.
    ///
    /// The genesis generator is minted exactly what its transfers hand out,
    /// so it ends with a zero balance.
    pub fn commit_genesis(&mut self, block: &Block) -> Result<ChainTip> {
        if self.store.is_initialized()? {
            return Err(BlockError::AlreadyKnown(block.id()));
        }
        if !block.verify_signature() {
            return Err(ConsensusError::InvalidBlockSignature.into());
        }
        self.validator.validate_payload(block)?;

        let mut scratch = ScratchLedger::new(self.store.accounts());
        let generator = block.generator().to_address();
        let minted: u64 = block
            .transactions
            .iter()
            .filter(|tx| tx.sender_address == generator)
            .map(Transaction::total_cost)
            .sum();
        scratch.credit(&generator, minted, BalanceKind::Confirmed)?;
        scratch.credit(&generator, minted, BalanceKind::Unconfirmed)?;

        let ctx = TxContext::block(0, block.header.timestamp);
        self.apply_all(block, &ctx, &mut scratch)?;
        self.accountant.refresh_votes(&mut scratch)?;

        let anchor = RoundAnchor::from_block(block);
        let forgers = self.selector.compute_forgers(1, &anchor, &scratch)?;
        let commit = BlockCommit {
            block: block.clone(),
            accounts: scratch.into_changes().into_values().collect(),
            settlement: None,
            next_forgers: Some((1, forgers.clone())),
        };
        self.store.commit_block(&commit)?;
        self.selector.remember(1, forgers);
        info!(id = %block.id(), transactions = block.tx_count(), "Committed genesis block");
        Ok(ChainTip {
            id: block.id(),
            height: 0,
        })
    }

    // =========================================================================
    // Stages
    // =========================================================================

    /// Structural checks against the stored parent.
    pub fn receive(&self, block: Block) -> Result<Staged<Received>> {
        let id = block.id();
        if self.store.has_block(&id)? {
            return Err(BlockError::AlreadyKnown(id));
        }
        let parent = self
            .store
            .block(&block.previous_block_id())?
            .ok_or(BlockError::UnknownParent(block.previous_block_id()))?;
        self.validator.validate_received(&block, &parent)?;
        Ok(Staged {
            block,
            stage: Received { parent },
        })
    }

    /// The generator must own the block's slot, which must follow the
    /// parent's and not lie in the future.
    pub fn verify_slot(&mut self, staged: Staged<Received>, unix_now: u64) -> Result<Staged<SlotVerified>> {
        let forgers = self.forgers_at(staged.block.height())?;
        self.validator
            .validate_slot(&staged.block, &staged.stage.parent, &forgers, unix_now)?;
        Ok(Staged {
            block: staged.block,
            stage: SlotVerified,
        })
    }

    pub fn verify_payload(&self, staged: Staged<SlotVerified>) -> Result<Staged<PayloadVerified>> {
        self.validator.validate_payload(&staged.block)?;
        Ok(Staged {
            block: staged.block,
            stage: PayloadVerified,
        })
    }

    /// Apply the block on a scratch ledger: take the pool's unconfirmed
    /// effects off, apply every transaction, settle the round when the block
    /// closes one, then put surviving pool transactions back.
    pub fn apply_transactions<P: PoolView>(
        &mut self,
        staged: Staged<PayloadVerified>,
        pool: &P,
        pool_timestamp: u64,
    ) -> Result<Staged<TransactionsApplied>> {
        let block = staged.block;
        let height = block.height();
        let mut scratch = ScratchLedger::new(self.store.accounts());
        pool.undo_unconfirmed(&mut scratch).map_err(BlockError::Pool)?;

        let mut seen = HashSet::new();
        for tx in &block.transactions {
            let id = tx.id();
            if !seen.insert(id) {
                return Err(BlockError::DuplicateTransaction(id));
            }
        }
        let ctx = TxContext::block(height, block.header.timestamp);
        self.apply_all(&block, &ctx, &mut scratch)?;

        let (settlement, next_forgers) = if self.accountant.closes_round(height) {
            let round = self.constants.round_of(height);
            let scheduled = self.forgers_at(height)?;
            let mut forged: Vec<ForgedBlock> = self
                .store
                .blocks_range(self.constants.first_height(round), height - 1)?
                .iter()
                .map(ForgedBlock::from)
                .collect();
            forged.push(ForgedBlock::from(&block));
            let settlement = self
                .accountant
                .settle_round(round, &forged, &scheduled, &mut scratch)?;
            let anchor = RoundAnchor::from_block(&block);
            let next = self.selector.compute_forgers(round + 1, &anchor, &scratch)?;
            (Some(settlement), Some((round + 1, next)))
        } else {
            (None, None)
        };

        let pool_ctx = TxContext {
            height: height + 1,
            timestamp_limit: pool_timestamp.max(block.header.timestamp),
        };
        let pool_dropped = pool
            .reapply_unconfirmed(&pool_ctx, &mut scratch, &seen)
            .map_err(BlockError::Pool)?;

        Ok(Staged {
            block,
            stage: TransactionsApplied {
                scratch,
                settlement,
                next_forgers,
                pool_dropped,
            },
        })
    }

    /// Persist the block and everything it changed in one batch.
    pub fn commit(&mut self, staged: Staged<TransactionsApplied>) -> Result<Committed> {
        let Staged { block, stage } = staged;
        let id = block.id();
        let settled_round = stage.settlement.as_ref().map(|s| s.round);
        let commit = BlockCommit {
            accounts: stage.scratch.into_changes().into_values().collect(),
            settlement: stage.settlement,
            next_forgers: stage.next_forgers,
            block,
        };
        self.store.commit_block(&commit)?;
        if let Some((round, list)) = &commit.next_forgers {
            self.selector.remember(*round, list.clone());
        }

        let block = &commit.block;
        info!(
            height = block.height(),
            id = %id,
            generator = %block.generator(),
            transactions = block.tx_count(),
            "Committed block"
        );
        Ok(Committed {
            tip: ChainTip {
                id,
                height: block.height(),
            },
            confirmed: block.transactions.iter().map(Transaction::id).collect(),
            pool_dropped: stage.pool_dropped,
            settled_round,
        })
    }

    /// Run every stage for a block that extends the tip.
    pub fn process_block<P: PoolView>(
        &mut self,
        block: Block,
        pool: &P,
        unix_now: u64,
    ) -> Result<Committed> {
        let received = self.receive(block)?;
        let slotted = self.verify_slot(received, unix_now)?;
        let verified = self.verify_payload(slotted)?;
        let pool_timestamp = self.validator.clock().timestamp(unix_now);
        let applied = self.apply_transactions(verified, pool, pool_timestamp)?;
        self.commit(applied)
    }

    // =========================================================================
    // Undo
    // =========================================================================

    /// Remove the tip block, reversing its transactions in reverse order and
    /// its round settlement if it closed one.
    pub fn undo_tip<P: PoolView>(&mut self, pool: &P, pool_timestamp: u64) -> Result<RolledBack> {
        let block = self
            .store
            .latest_block()?
            .ok_or(BlockError::NotInitialized)?;
        if block.is_genesis() {
            return Err(BlockError::CannotUndoGenesis);
        }
        let height = block.height();
        let mut scratch = ScratchLedger::new(self.store.accounts());
        pool.undo_unconfirmed(&mut scratch).map_err(BlockError::Pool)?;

        let closes_round = self.accountant.closes_round(height);
        let round = self.constants.round_of(height);
        if closes_round {
            let settlement = self
                .store
                .settlement(round)?
                .ok_or(BlockError::MissingSettlement(round))?;
            self.accountant.revert_round(&settlement, &mut scratch)?;
        }

        for tx in block.transactions.iter().rev() {
            let undo = self
                .processor
                .undo(tx, &mut scratch)
                .and_then(|()| self.processor.undo_unconfirmed(tx, &mut scratch));
            undo.map_err(|source| BlockError::UndoFailed { id: tx.id(), source })?;
        }

        let pool_ctx = TxContext {
            height,
            timestamp_limit: pool_timestamp,
        };
        let pool_dropped = pool
            .reapply_unconfirmed(&pool_ctx, &mut scratch, &HashSet::new())
            .map_err(BlockError::Pool)?;

        let rollback = BlockRollback {
            accounts: scratch.into_changes().into_values().collect(),
            settled_round: closes_round.then_some(round),
            forgers_round: closes_round.then_some(round + 1),
            block,
        };
        let tip = self.store.rollback_block(&rollback)?;
        if closes_round {
            self.selector.invalidate_from(round + 1);
        }
        info!(height, id = %rollback.block.id(), "Rolled back block");
        Ok(RolledBack {
            block: rollback.block,
            tip,
            pool_dropped,
        })
    }

    // =========================================================================
    // Forging
    // =========================================================================

    /// Pick pool candidates that apply cleanly on top of the tip, in pool
    /// order, up to the block limit.
    pub fn select_transactions<P: PoolView>(
        &self,
        pool: &P,
        height: u64,
        timestamp: u64,
    ) -> Result<Vec<Transaction>> {
        let mut scratch = ScratchLedger::new(self.store.accounts());
        pool.undo_unconfirmed(&mut scratch).map_err(BlockError::Pool)?;
        let ctx = TxContext::block(height, timestamp);
        let mut selected = Vec::new();
        for tx in pool.candidates() {
            if selected.len() >= self.constants.max_transactions_per_block {
                break;
            }
            if self.store.has_transaction(&tx.id())? {
                continue;
            }
            let checkpoint = scratch.checkpoint();
            let outcome = self
                .processor
                .verify(tx, &ctx, &scratch)
                .and_then(|()| self.processor.apply_unconfirmed(tx, &mut scratch))
                .and_then(|()| self.processor.apply(tx, &mut scratch));
            match outcome {
                Ok(()) => selected.push(tx.clone()),
                Err(err) if err.class().is_fatal() => return Err(BlockError::Pool(err)),
                Err(err) => {
                    debug!(id = %tx.id(), error = %err, "Skipped transaction while forging");
                    scratch.restore(checkpoint);
                }
            }
        }
        Ok(selected)
    }

    /// Forge a block on the tip at `timestamp` with the given forger keys.
    pub fn forge<P: PoolView>(&mut self, forger: &BlockForger, pool: &P, timestamp: u64) -> Result<Block> {
        let parent = self
            .store
            .latest_block()?
            .ok_or(BlockError::NotInitialized)?;
        let height = parent.height() + 1;
        let forgers = self.forgers_at(height)?;
        let transactions = self.select_transactions(pool, height, timestamp)?;
        Ok(forger.forge(&parent, timestamp, &forgers, transactions)?)
    }

    fn apply_all(
        &self,
        block: &Block,
        ctx: &TxContext,
        scratch: &mut ScratchLedger<AccountStore>,
    ) -> Result<()> {
        for (index, tx) in block.transactions.iter().enumerate() {
            let id = tx.id();
            let rejected = |source| BlockError::Transaction { index, id, source };
            if !block.is_genesis() && self.store.has_transaction(&id)? {
                return Err(rejected(TransactionError::AlreadyConfirmed(id)));
            }
            self.processor.verify(tx, ctx, &*scratch).map_err(rejected)?;
            self.processor
                .apply_unconfirmed(tx, scratch)
                .map_err(rejected)?;
            self.processor.apply(tx, scratch).map_err(rejected)?;
            debug!(index, id = %id, kind = ?tx.tx_type(), "Applied transaction");
        }
        Ok(())
    }
}
