//! Persistent storage layer for dposchain.
//!
//! This crate provides the storage backend for the node:
//! - Accounts keyed by address, confirmed and unconfirmed halves together
//! - Blocks by id with a height index
//! - A transaction index pointing at the including block
//! - Round settlement records and persisted forger lists
//! - The ledger capability traits the rest of the node is written against
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    Application Layer                     │
//! │      (TransactionProcessor, BlockProcessor, Selector)    │
//! └────────────────────────┬────────────────────────────────┘
//!                          │ LedgerReader / LedgerWriter / ChainReader
//! ┌────────────────────────▼────────────────────────────────┐
//! │                   Storage Layer                          │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────┐  │
//! │  │ScratchLedger│  │ ChainStore  │  │ Storage (DB)    │  │
//! │  │ AccountStore│  │  - Blocks   │  │  - sled wrapper │  │
//! │  │ MemoryLedger│  │  - Tx index │  │  - serialization│  │
//! │  │             │  │  - Rounds   │  │  - key helpers  │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────┘  │
//! └────────────────────────┬────────────────────────────────┘
//!                          │
//! ┌────────────────────────▼────────────────────────────────┐
//! │                    sled Database                         │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod chain;
pub mod db;
pub mod ledger;
pub mod state;

// Re-export commonly used types
pub use chain::{BlockCommit, BlockRollback, ChainReader, ChainStore, ChainTip, StoredTransaction};
pub use db::{BatchOp, Result, Storage, StorageError};
pub use ledger::{BalanceKind, Checkpoint, LedgerReader, LedgerWriter, MemoryLedger, ScratchLedger};
pub use state::AccountStore;
