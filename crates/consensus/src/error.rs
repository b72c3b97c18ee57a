//! Consensus errors and the classification shared by every rejection.

use dposchain_core::{Hash, PublicKey};
use dposchain_storage::StorageError;
use thiserror::Error;

/// How a failure must be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Bad shape, signature or fee. Rejected before any mutation.
    Malformed,
    /// Conflicts with chain state. The enclosing block is rejected whole.
    Consistency,
    /// Timeouts and unreachable peers. Retried, never touches the ledger.
    Transient,
    /// Broken invariant. The node stops accepting work.
    Fatal,
}

impl ErrorClass {
    /// Whether a peer that sent the offending data should lose standing.
    pub fn penalizes_peer(self) -> bool {
        matches!(self, ErrorClass::Consistency)
    }

    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorClass::Fatal)
    }
}

/// Classification of an error value.
pub trait Classify {
    fn class(&self) -> ErrorClass;
}

impl Classify for StorageError {
    fn class(&self) -> ErrorClass {
        // A storage failure means the ledger can no longer be trusted.
        ErrorClass::Fatal
    }
}

/// Errors that can occur during consensus operations.
#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("unsupported block version {0}")]
    InvalidVersion(u32),

    #[error("block height mismatch (expected {expected}, got {got})")]
    InvalidHeight { expected: u64, got: u64 },

    #[error("block previous id {got} does not match parent {expected}")]
    InvalidPreviousBlock { expected: Hash, got: Hash },

    #[error("too many transactions ({count}, max {max})")]
    TooManyTransactions { count: usize, max: usize },

    #[error("payload too large ({length} bytes, max {max})")]
    PayloadTooLarge { length: usize, max: usize },

    #[error("invalid block signature")]
    InvalidBlockSignature,

    #[error("block slot {slot} is not after parent slot {parent_slot}")]
    SlotNotAfterParent { slot: u64, parent_slot: u64 },

    #[error("block slot {slot} is in the future (current slot {current})")]
    SlotInFuture { slot: u64, current: u64 },

    #[error("wrong generator for slot {slot} (expected {expected}, got {got})")]
    WrongGenerator {
        slot: u64,
        expected: PublicKey,
        got: PublicKey,
    },

    #[error("payload hash mismatch")]
    PayloadHashMismatch,

    #[error("payload length mismatch (declared {declared}, actual {actual})")]
    PayloadLengthMismatch { declared: u32, actual: u32 },

    #[error("transaction count mismatch (declared {declared}, actual {actual})")]
    TransactionCountMismatch { declared: u32, actual: u32 },

    #[error("total amount mismatch (declared {declared}, actual {actual})")]
    TotalAmountMismatch { declared: u64, actual: u64 },

    #[error("total fee mismatch (declared {declared}, actual {actual})")]
    TotalFeeMismatch { declared: u64, actual: u64 },

    #[error("reward mismatch (declared {declared}, expected {expected})")]
    RewardMismatch { declared: u64, expected: u64 },

    #[error("no eligible delegates for round {0}")]
    NoEligibleDelegates(u64),

    #[error("closing block of round {round} (height {height}) is missing")]
    MissingRoundSeed { round: u64, height: u64 },

    #[error("forger list of committed round {0} is missing")]
    MissingForgerList(u64),

    #[error("height {height} lies beyond the schedulable range (max {max})")]
    HeightOutOfRange { height: u64, max: u64 },

    #[error("round {0} has no forged blocks to settle")]
    EmptyRound(u64),

    #[error("delegate {0} no longer matches its settled state")]
    SettlementMismatch(PublicKey),

    #[error("settlement credit of {amount} cannot be taken back from {delegate}")]
    CreditUnderflow { delegate: PublicKey, amount: u64 },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl Classify for ConsensusError {
    fn class(&self) -> ErrorClass {
        use ConsensusError::*;
        match self {
            InvalidVersion(_)
            | HeightOutOfRange { .. }
            | TooManyTransactions { .. }
            | PayloadTooLarge { .. }
            | InvalidBlockSignature => ErrorClass::Malformed,
            InvalidHeight { .. }
            | InvalidPreviousBlock { .. }
            | SlotNotAfterParent { .. }
            | SlotInFuture { .. }
            | WrongGenerator { .. }
            | PayloadHashMismatch
            | PayloadLengthMismatch { .. }
            | TransactionCountMismatch { .. }
            | TotalAmountMismatch { .. }
            | TotalFeeMismatch { .. }
            | RewardMismatch { .. } => ErrorClass::Consistency,
            NoEligibleDelegates(_)
            | MissingRoundSeed { .. }
            | MissingForgerList(_)
            | EmptyRound(_)
            | SettlementMismatch(_)
            | CreditUnderflow { .. } => ErrorClass::Fatal,
            Storage(err) => err.class(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ConsensusError>;
