//! Delegated proof-of-stake consensus for dposchain.
//!
//! This crate provides:
//! - The slot clock mapping time to forging slots
//! - Per-round forger selection (legacy and weighted algorithms)
//! - Round settlement of rewards, fees, votes and productivity, with exact
//!   reversal
//! - Block validation (structure, slot, payload)
//! - Block forging for local delegate keys
//! - The error classification used for every rejection

pub mod delegates;
pub mod error;
pub mod forger;
pub mod rounds;
pub mod slots;
pub mod validator;

// Re-export commonly used types
pub use delegates::{shuffle, DelegateSelector, RoundAnchor, RoundSeed};
pub use error::{Classify, ConsensusError, ErrorClass, Result};
pub use forger::BlockForger;
pub use rounds::{ForgedBlock, RoundAccountant};
pub use slots::{unix_now, SlotClock};
pub use validator::BlockValidator;
