//! Block processing and node orchestration for dposchain.
//!
//! This crate brings the lower layers together into a working full node:
//! - **Transactions**: per-type verification, apply and undo on both ledger halves
//! - **Pool**: queued, unconfirmed and pending (multisignature) transactions
//! - **Blocks**: a typed pipeline from receipt to commit, plus rollback
//! - **Forks**: classification of incoming blocks and branch switching
//! - **Node**: serialized sequences, peer sync and the pool ticker
//!
//! # Example
//!
//! ```rust,no_run
//! use dposchain_chain::{dev_delegates, Chain, ChainConfig, GenesisBuilder};
//! use dposchain_consensus::{unix_now, BlockForger};
//! use dposchain_core::{Keypair, COIN};
//! use dposchain_storage::{ChainStore, Storage};
//!
//! let config = ChainConfig::default();
//! let delegates = dev_delegates(101);
//!
//! let mut genesis = GenesisBuilder::new(Keypair::from_passphrase("genesis"));
//! for (i, kp) in delegates.iter().enumerate() {
//!     genesis = genesis.delegate(kp.clone(), &format!("genesis_{}", i), 1_000 * COIN);
//! }
//!
//! let store = ChainStore::new(Storage::open("./chain_data").unwrap());
//! let mut chain = Chain::open(store, config.clone()).unwrap();
//! chain.init_genesis(&genesis.build()).unwrap();
//!
//! // Forge when one of our delegates owns the slot.
//! let forger = BlockForger::new(delegates, config.constants);
//! let block = chain.forge(&forger, unix_now()).unwrap();
//! ```

pub mod blockchain;
pub mod blocks;
pub mod fork;
pub mod genesis;
pub mod mempool;
pub mod node;
pub mod processor;
pub mod sequence;
pub mod transport;

// Re-export commonly used types
pub use blockchain::{Chain, ChainConfig, ChainError, ChainStats, ProcessOutcome};
pub use blocks::{BlockError, BlockProcessor, Committed, RolledBack, Staged};
pub use fork::{BlockRelation, ChainOps, ForkConfig, ForkError, ForkKind, ForkOutcome, ForkResolver};
pub use genesis::{dev_delegates, GenesisBuilder};
pub use mempool::{PoolConfig, PoolError, PoolList, PoolStats, PoolView, TransactionPool};
pub use node::{Node, NodeConfig, NodeError};
pub use processor::{TransactionError, TransactionProcessor, TxContext};
pub use sequence::{Sequence, SequenceError};
pub use transport::{fetch_with_retry, PeerClient, RetryPolicy, TransportError};
