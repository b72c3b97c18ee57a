//! Account state.
//!
//! An account carries two independent views of its spendable state:
//! [`ConfirmedAccountState`] only changes when a block is committed or
//! rolled back, [`UnconfirmedAccountState`] additionally reflects the
//! transactions sitting in the pool. Keeping them in separate structs means
//! each transaction hook can only touch the half it owns.

use crate::crypto::{Address, PublicKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// m-of-n settings of a multisignature account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultisigSettings {
    /// Signatures required for an outgoing transaction.
    pub min: u8,
    /// Hours a pending transaction may wait for signatures.
    pub lifetime: u8,
    pub members: BTreeSet<PublicKey>,
}

impl MultisigSettings {
    pub fn is_member(&self, key: &PublicKey) -> bool {
        self.members.contains(key)
    }
}

/// State that changes only on block commit or rollback.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmedAccountState {
    pub balance: u64,
    /// Established by the first outgoing transaction.
    pub public_key: Option<PublicKey>,
    /// Number of confirmed outgoing transactions.
    pub outgoing: u64,
    pub second_public_key: Option<PublicKey>,
    /// Delegate name; `Some` marks a registered delegate.
    pub username: Option<String>,
    pub votes: BTreeSet<PublicKey>,
    pub multisig: Option<MultisigSettings>,
}

/// Tentative state including uncommitted pool transactions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnconfirmedAccountState {
    pub balance: u64,
    pub second_public_key: Option<PublicKey>,
    pub username: Option<String>,
    pub votes: BTreeSet<PublicKey>,
    pub multisig: Option<MultisigSettings>,
}

/// Forging and voting bookkeeping of a delegate, settled once per round.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegateStats {
    /// Sum of confirmed balances of accounts voting for this delegate.
    pub vote: u64,
    /// `vote` scaled by historical productivity.
    pub vote_weight: u64,
    pub produced_blocks: u64,
    pub missed_blocks: u64,
    pub consecutive_missed_blocks: u64,
    pub rewards: u64,
    pub fees: u64,
    /// Last round in which this delegate forged the closing block.
    pub last_round_closed: Option<u64>,
}

impl DelegateStats {
    /// Productivity-adjusted vote weight, rounded half up:
    /// `vote * min(1, produced / (produced + missed))`.
    pub fn weighted_vote(&self) -> u64 {
        let total = self.produced_blocks.saturating_add(self.missed_blocks);
        if total == 0 {
            return self.vote;
        }
        let produced = self.produced_blocks.min(total) as u128;
        let total = total as u128;
        let scaled = (2 * self.vote as u128 * produced + total) / (2 * total);
        scaled as u64
    }
}

/// A ledger account. Created on first reference, never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub address: Address,
    pub confirmed: ConfirmedAccountState,
    pub unconfirmed: UnconfirmedAccountState,
    pub delegate: DelegateStats,
}

impl Account {
    /// An empty account at `address`.
    pub fn new(address: Address) -> Self {
        Self {
            address,
            confirmed: ConfirmedAccountState::default(),
            unconfirmed: UnconfirmedAccountState::default(),
            delegate: DelegateStats::default(),
        }
    }

    pub fn is_delegate(&self) -> bool {
        self.confirmed.username.is_some()
    }

    pub fn is_multisig(&self) -> bool {
        self.confirmed.multisig.is_some()
    }

    pub fn balance(&self) -> u64 {
        self.confirmed.balance
    }

    pub fn unconfirmed_balance(&self) -> u64 {
        self.unconfirmed.balance
    }

    /// Drop every tentative change, making the unconfirmed half mirror the
    /// confirmed half again.
    pub fn reset_unconfirmed(&mut self) {
        self.unconfirmed = UnconfirmedAccountState {
            balance: self.confirmed.balance,
            second_public_key: self.confirmed.second_public_key.clone(),
            username: self.confirmed.username.clone(),
            votes: self.confirmed.votes.clone(),
            multisig: self.confirmed.multisig.clone(),
        };
    }

    /// Whether this account is the delegate identified by `key`.
    pub fn is_delegate_key(&self, key: &PublicKey) -> bool {
        self.is_delegate() && self.confirmed.public_key.as_ref() == Some(key)
    }
}
