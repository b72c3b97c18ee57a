//! Records describing what a round settlement changed.
//!
//! A settlement is stored alongside the block that closed the round so that
//! rolling the block back can subtract exactly what was added instead of
//! recomputing anything.

use crate::account::DelegateStats;
use crate::crypto::{Address, PublicKey};
use serde::{Deserialize, Serialize};

/// Balance credited to one delegate for the round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegateCredit {
    pub public_key: PublicKey,
    pub address: Address,
    /// Sum of block rewards for the blocks this delegate forged.
    pub reward: u64,
    /// Fee shares, including the remainder for the closing generator.
    pub fee: u64,
}

impl DelegateCredit {
    pub fn total(&self) -> u64 {
        self.reward.saturating_add(self.fee)
    }
}

/// Delegate statistics before and after settlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsChange {
    pub address: Address,
    pub before: DelegateStats,
    pub after: DelegateStats,
}

/// Everything one round settlement changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundSettlement {
    pub round: u64,
    /// Blocks forged in the round, closing block included.
    pub blocks: u64,
    pub total_fees: u64,
    pub total_rewards: u64,
    /// `total_fees % blocks`, paid to the closing generator.
    pub fee_remainder: u64,
    pub credits: Vec<DelegateCredit>,
    pub stats: Vec<StatsChange>,
}

impl RoundSettlement {
    /// Sum of all fee credits; equals `total_fees` for a well-formed record.
    pub fn distributed_fees(&self) -> u64 {
        self.credits.iter().map(|c| c.fee).sum()
    }

    pub fn credit_for(&self, key: &PublicKey) -> Option<&DelegateCredit> {
        self.credits.iter().find(|c| &c.public_key == key)
    }
}
