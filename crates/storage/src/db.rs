//! sled database wrapper with serialization helpers.

use dposchain_core::{Address, Hash};
use sled::Db;
use std::path::Path;
use thiserror::Error;

/// Storage errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Key not found: {0}")]
    NotFound(String),

    /// Last-line guard: a debit would take a balance below zero.
    #[error("Negative balance: address {address}, balance {balance}, debit {amount}")]
    NegativeBalance {
        address: Address,
        balance: u64,
        amount: u64,
    },

    #[error("Balance overflow: address {0}")]
    BalanceOverflow(Address),

    #[error("Invalid genesis: {0}")]
    InvalidGenesis(String),

    #[error("Corrupted store: {0}")]
    Corrupted(String),
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Wrapper around sled database with serialization helpers.
///
/// Cloning is cheap and every clone sees the same database.
#[derive(Clone)]
pub struct Storage {
    db: Db,
}

impl Storage {
    /// Open a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// Open an in-memory database (for testing).
    pub fn open_temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    /// Store a serializable value.
    pub fn put<K, V>(&self, key: K, value: &V) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: serde::Serialize,
    {
        let encoded = bincode::serialize(value)?;
        self.db.insert(key, encoded)?;
        Ok(())
    }

    /// Retrieve and deserialize a value.
    pub fn get<K, V>(&self, key: K) -> Result<Option<V>>
    where
        K: AsRef<[u8]>,
        V: serde::de::DeserializeOwned,
    {
        match self.db.get(key)? {
            Some(bytes) => {
                let value = bincode::deserialize(&bytes)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Retrieve a value, returning error if not found.
    pub fn get_or_err<K, V>(&self, key: K) -> Result<V>
    where
        K: AsRef<[u8]> + std::fmt::Debug + Clone,
        V: serde::de::DeserializeOwned,
    {
        self.get(key.clone())?
            .ok_or_else(|| StorageError::NotFound(format!("{:?}", key)))
    }

    /// Delete a key.
    pub fn delete<K: AsRef<[u8]>>(&self, key: K) -> Result<()> {
        self.db.remove(key)?;
        Ok(())
    }

    /// Check if a key exists.
    pub fn contains<K: AsRef<[u8]>>(&self, key: K) -> Result<bool> {
        Ok(self.db.contains_key(key)?)
    }

    /// Decode every value stored under `prefix`, in key order.
    pub fn scan_prefix<V>(&self, prefix: &[u8]) -> Result<Vec<V>>
    where
        V: serde::de::DeserializeOwned,
    {
        let mut values = Vec::new();
        for entry in self.db.scan_prefix(prefix) {
            let (_, bytes) = entry?;
            values.push(bincode::deserialize(&bytes)?);
        }
        Ok(values)
    }

    /// Apply multiple operations atomically.
    ///
    /// sled's `apply_batch` writes the whole batch or nothing.
    pub fn batch(&self, operations: Vec<BatchOp>) -> Result<()> {
        let mut batch = sled::Batch::default();
        for op in operations {
            match op {
                BatchOp::Insert { key, value } => batch.insert(key, value),
                BatchOp::Remove { key } => batch.remove(key),
            }
        }
        self.db.apply_batch(batch)?;
        Ok(())
    }

    /// Flush all pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    // =========================================================================
    // Key Construction Helpers
    // =========================================================================

    /// Format: "account:" + address_bytes
    pub fn account_key(address: &Address) -> Vec<u8> {
        let mut key = ACCOUNT_PREFIX.to_vec();
        key.extend_from_slice(&address.0);
        key
    }

    /// Format: "block:height:" + big-endian height, so keys sort by height.
    pub fn block_height_key(height: u64) -> Vec<u8> {
        let mut key = b"block:height:".to_vec();
        key.extend_from_slice(&height.to_be_bytes());
        key
    }

    /// Format: "block:id:" + id_bytes
    pub fn block_id_key(id: &Hash) -> Vec<u8> {
        let mut key = b"block:id:".to_vec();
        key.extend_from_slice(&id.0);
        key
    }

    /// Format: "tx:" + id_bytes
    pub fn transaction_key(id: &Hash) -> Vec<u8> {
        let mut key = b"tx:".to_vec();
        key.extend_from_slice(&id.0);
        key
    }

    /// Format: "round:settlement:" + big-endian round
    pub fn settlement_key(round: u64) -> Vec<u8> {
        let mut key = b"round:settlement:".to_vec();
        key.extend_from_slice(&round.to_be_bytes());
        key
    }

    /// Format: "round:forgers:" + big-endian round
    pub fn forgers_key(round: u64) -> Vec<u8> {
        let mut key = b"round:forgers:".to_vec();
        key.extend_from_slice(&round.to_be_bytes());
        key
    }
}

/// Prefix shared by every account key.
pub const ACCOUNT_PREFIX: &[u8] = b"account:";

/// Batch operation for atomic updates.
pub enum BatchOp {
    Insert { key: Vec<u8>, value: Vec<u8> },
    Remove { key: Vec<u8> },
}

impl BatchOp {
    /// Encode `value` into an insert.
    pub fn put<V: serde::Serialize>(key: Vec<u8>, value: &V) -> Result<Self> {
        Ok(BatchOp::Insert {
            key,
            value: bincode::serialize(value)?,
        })
    }

    pub fn remove(key: Vec<u8>) -> Self {
        BatchOp::Remove { key }
    }
}
