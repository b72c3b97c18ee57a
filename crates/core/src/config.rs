//! Chain-wide constants: round size, slot timing, fees and rewards.
//!
//! Every node on a network must run with identical values; they are part of
//! consensus, not local tuning.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Smallest unit is the beddow; one coin is 10^8 beddows.
pub const COIN: u64 = 100_000_000;

/// A constant that would make round or slot arithmetic meaningless.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Base fees per transaction type, in beddows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub transfer: u64,
    pub second_signature: u64,
    pub delegate: u64,
    pub vote: u64,
    /// Charged once per keysgroup member plus one.
    pub multisignature: u64,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            transfer: COIN / 10,
            second_signature: 5 * COIN,
            delegate: 25 * COIN,
            vote: COIN,
            multisignature: 5 * COIN,
        }
    }
}

/// Block reward schedule.
///
/// Nothing is paid below `offset`; from there the reward steps down through
/// `milestones` every `distance` heights and stays at the last one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardSchedule {
    pub offset: u64,
    pub distance: u64,
    pub milestones: Vec<u64>,
}

impl Default for RewardSchedule {
    fn default() -> Self {
        Self {
            offset: 1_451_520,
            distance: 3_000_000,
            milestones: vec![5 * COIN, 4 * COIN, 3 * COIN, 2 * COIN, COIN],
        }
    }
}

impl RewardSchedule {
    pub fn reward_at(&self, height: u64) -> u64 {
        if height < self.offset || self.milestones.is_empty() || self.distance == 0 {
            return 0;
        }
        let step = ((height - self.offset) / self.distance) as usize;
        self.milestones[step.min(self.milestones.len() - 1)]
    }
}

/// Consensus parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConstants {
    /// Forgers per round and heights per round.
    pub active_delegates: u64,
    /// Seconds per slot.
    pub block_time: u64,
    /// Unix time of slot 0; block timestamps count seconds from here.
    pub epoch_time: u64,
    pub max_transactions_per_block: usize,
    pub max_payload_length: usize,
    pub fees: FeeSchedule,
    pub rewards: RewardSchedule,
    /// First height whose round uses weighted (v2) delegate selection.
    pub selection_v2_height: u64,
    /// Delegates past this many consecutive misses are not eligible under v2.
    pub max_consecutive_missed_blocks: u64,
    pub max_votes_per_transaction: usize,
    pub max_votes_per_account: usize,
}

impl Default for ChainConstants {
    fn default() -> Self {
        Self {
            active_delegates: 101,
            block_time: 10,
            epoch_time: 1_464_109_200,
            max_transactions_per_block: 25,
            max_payload_length: 1024 * 1024,
            fees: FeeSchedule::default(),
            rewards: RewardSchedule::default(),
            selection_v2_height: 0,
            max_consecutive_missed_blocks: 50,
            max_votes_per_transaction: 33,
            max_votes_per_account: 101,
        }
    }
}

impl ChainConstants {
    /// Reject values the round and slot arithmetic divides by.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.active_delegates == 0 {
            return Err(ConfigError::Zero("active_delegates"));
        }
        if self.block_time == 0 {
            return Err(ConfigError::Zero("block_time"));
        }
        Ok(())
    }

    /// Round containing `height`. Genesis (height 0) belongs to round 0.
    pub fn round_of(&self, height: u64) -> u64 {
        if height == 0 {
            return 0;
        }
        (height - 1) / self.active_delegates + 1
    }

    pub fn first_height(&self, round: u64) -> u64 {
        round.saturating_sub(1) * self.active_delegates + 1
    }

    pub fn last_height(&self, round: u64) -> u64 {
        round * self.active_delegates
    }

    /// Whether `height` closes its round.
    pub fn is_round_end(&self, height: u64) -> bool {
        height > 0 && height % self.active_delegates == 0
    }

    /// Whether `round` is scheduled with the weighted algorithm.
    pub fn uses_weighted_selection(&self, round: u64) -> bool {
        self.first_height(round) >= self.selection_v2_height
    }

    /// Slot number of an epoch-relative timestamp.
    pub fn slot_of(&self, timestamp: u64) -> u64 {
        timestamp / self.block_time
    }

    /// Epoch-relative start time of a slot.
    pub fn slot_time(&self, slot: u64) -> u64 {
        slot * self.block_time
    }

    /// Convert a unix time to an epoch-relative timestamp.
    pub fn epoch_timestamp(&self, unix_time: u64) -> u64 {
        unix_time.saturating_sub(self.epoch_time)
    }
}
