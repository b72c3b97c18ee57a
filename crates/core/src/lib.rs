//! Core primitives for dposchain.
//!
//! This crate provides the fundamental types used throughout the node:
//! - Cryptographic primitives (hashing, signing, addresses)
//! - Account state, split into confirmed and unconfirmed halves
//! - Transactions and their typed assets
//! - Blocks and block headers
//! - Chain constants and round arithmetic

pub mod account;
pub mod block;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod hash;
pub mod round;
pub mod transaction;

// Re-export commonly used types at the crate root
pub use account::{Account, ConfirmedAccountState, DelegateStats, MultisigSettings, UnconfirmedAccountState};
pub use block::{Block, BlockHeader, PayloadSummary, BLOCK_VERSION};
pub use codec::{decode, encode, CodecError};
pub use config::{ChainConstants, ConfigError, FeeSchedule, RewardSchedule, COIN};
pub use crypto::{Address, CryptoError, Keypair, PublicKey, Signature};
pub use hash::{hash, hash_concat, Hash, H256};
pub use round::{DelegateCredit, RoundSettlement, StatsChange};
pub use transaction::{
    Asset, MemberSignature, SignatureError, Transaction, TransactionType, VoteEntry,
};
