//! Committed account state.

use crate::db::{BatchOp, Result, Storage, ACCOUNT_PREFIX};
use crate::ledger::LedgerReader;
use dposchain_core::{Account, Address};
use tracing::debug;

/// Reads committed accounts out of the database.
///
/// Writes only happen through the block commit batch; see
/// [`crate::ChainStore::commit_block`].
#[derive(Clone)]
pub struct AccountStore {
    storage: Storage,
}

impl AccountStore {
    /// Create a new AccountStore wrapping the given storage.
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Check if an account exists (has been explicitly stored).
    pub fn account_exists(&self, address: &Address) -> Result<bool> {
        self.storage.contains(Storage::account_key(address))
    }

    /// Batch operations writing `accounts`.
    pub fn write_ops<'a, I>(accounts: I) -> Result<Vec<BatchOp>>
    where
        I: IntoIterator<Item = &'a Account>,
    {
        accounts
            .into_iter()
            .map(|account| BatchOp::put(Storage::account_key(&account.address), account))
            .collect()
    }

    /// Make every unconfirmed half mirror its confirmed half.
    ///
    /// The pool lives in memory, so after a restart any tentative state left
    /// on disk no longer has transactions behind it.
    pub fn reset_unconfirmed(&self) -> Result<usize> {
        let mut ops = Vec::new();
        for mut account in self.accounts()? {
            let before = account.unconfirmed.clone();
            account.reset_unconfirmed();
            if account.unconfirmed != before {
                ops.push(BatchOp::put(Storage::account_key(&account.address), &account)?);
            }
        }
        let reset = ops.len();
        if reset > 0 {
            self.storage.batch(ops)?;
            debug!(accounts = reset, "Reset unconfirmed account state");
        }
        Ok(reset)
    }
}

impl LedgerReader for AccountStore {
    fn account(&self, address: &Address) -> Result<Option<Account>> {
        self.storage.get(Storage::account_key(address))
    }

    fn accounts(&self) -> Result<Vec<Account>> {
        self.storage.scan_prefix(ACCOUNT_PREFIX)
    }
}
