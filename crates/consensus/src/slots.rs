//! Slot clock.
//!
//! Time is divided into fixed slots counted from the network epoch. Each
//! slot belongs to exactly one delegate of the active round.

use dposchain_core::ChainConstants;
use std::time::{SystemTime, UNIX_EPOCH};

/// Get the current Unix timestamp in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Clone)]
pub struct SlotClock {
    block_time: u64,
    epoch_time: u64,
}

impl SlotClock {
    pub fn new(constants: &ChainConstants) -> Self {
        Self {
            block_time: constants.block_time.max(1),
            epoch_time: constants.epoch_time,
        }
    }

    /// Epoch-relative timestamp of a unix time.
    pub fn timestamp(&self, unix_time: u64) -> u64 {
        unix_time.saturating_sub(self.epoch_time)
    }

    pub fn slot_of(&self, timestamp: u64) -> u64 {
        timestamp / self.block_time
    }

    pub fn slot_time(&self, slot: u64) -> u64 {
        slot * self.block_time
    }

    /// Slot containing the given unix time.
    pub fn current_slot(&self, unix_time: u64) -> u64 {
        self.slot_of(self.timestamp(unix_time))
    }

    /// First slot strictly after the one containing `timestamp`.
    pub fn next_slot(&self, timestamp: u64) -> u64 {
        self.slot_of(timestamp) + 1
    }
}
