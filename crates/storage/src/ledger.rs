//! Capability traits over the account ledger and the in-memory ledgers
//! built on them.
//!
//! Components never reach into the database directly. They receive a
//! [`LedgerReader`] when they only inspect state and a [`LedgerWriter`] when
//! they mutate it. Block application runs against a [`ScratchLedger`] whose
//! writes stay in memory until the block commits.

use crate::db::{Result, StorageError};
use dposchain_core::{Account, Address, PublicKey};
use std::collections::BTreeMap;

/// Which half of an account a balance operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceKind {
    Confirmed,
    Unconfirmed,
}

/// Read access to accounts.
pub trait LedgerReader {
    /// The stored account, if it was ever referenced.
    fn account(&self, address: &Address) -> Result<Option<Account>>;

    /// Every stored account, ordered by address.
    fn accounts(&self) -> Result<Vec<Account>>;

    /// The account at `address`, or an empty one.
    fn account_or_default(&self, address: &Address) -> Result<Account> {
        Ok(self
            .account(address)?
            .unwrap_or_else(|| Account::new(*address)))
    }

    /// The confirmed delegate registered under `key`.
    fn delegate(&self, key: &PublicKey) -> Result<Option<Account>> {
        Ok(self
            .account(&key.to_address())?
            .filter(|account| account.is_delegate_key(key)))
    }

    /// Every confirmed delegate, ordered by address.
    fn delegates(&self) -> Result<Vec<Account>> {
        Ok(self
            .accounts()?
            .into_iter()
            .filter(Account::is_delegate)
            .collect())
    }

    /// Whether a delegate name is taken in confirmed or unconfirmed state.
    fn username_taken(&self, username: &str) -> Result<bool> {
        Ok(self.accounts()?.iter().any(|account| {
            account.confirmed.username.as_deref() == Some(username)
                || account.unconfirmed.username.as_deref() == Some(username)
        }))
    }
}

/// Write access to accounts.
pub trait LedgerWriter: LedgerReader {
    fn put_account(&mut self, account: Account) -> Result<()>;

    fn credit(&mut self, address: &Address, amount: u64, kind: BalanceKind) -> Result<()> {
        let mut account = self.account_or_default(address)?;
        let balance = balance_mut(&mut account, kind);
        *balance = balance
            .checked_add(amount)
            .ok_or(StorageError::BalanceOverflow(*address))?;
        self.put_account(account)
    }

    /// Subtract from a balance. Refuses to go below zero regardless of what
    /// the caller checked beforehand.
    fn debit(&mut self, address: &Address, amount: u64, kind: BalanceKind) -> Result<()> {
        let mut account = self.account_or_default(address)?;
        let balance = balance_mut(&mut account, kind);
        *balance = balance
            .checked_sub(amount)
            .ok_or(StorageError::NegativeBalance {
                address: *address,
                balance: *balance,
                amount,
            })?;
        self.put_account(account)
    }
}

fn balance_mut(account: &mut Account, kind: BalanceKind) -> &mut u64 {
    match kind {
        BalanceKind::Confirmed => &mut account.confirmed.balance,
        BalanceKind::Unconfirmed => &mut account.unconfirmed.balance,
    }
}

impl<T: LedgerReader + ?Sized> LedgerReader for &T {
    fn account(&self, address: &Address) -> Result<Option<Account>> {
        (**self).account(address)
    }

    fn accounts(&self) -> Result<Vec<Account>> {
        (**self).accounts()
    }
}

impl<T: LedgerReader + ?Sized> LedgerReader for &mut T {
    fn account(&self, address: &Address) -> Result<Option<Account>> {
        (**self).account(address)
    }

    fn accounts(&self) -> Result<Vec<Account>> {
        (**self).accounts()
    }
}

impl<T: LedgerWriter + ?Sized> LedgerWriter for &mut T {
    fn put_account(&mut self, account: Account) -> Result<()> {
        (**self).put_account(account)
    }
}

/// Copy-on-write overlay over a base ledger.
///
/// Reads fall through to the base until an account is written; writes never
/// reach the base. [`ScratchLedger::into_changes`] hands the touched
/// accounts to the commit batch.
pub struct ScratchLedger<L> {
    base: L,
    changes: BTreeMap<Address, Account>,
}

/// Saved overlay state for [`ScratchLedger::restore`].
#[derive(Clone)]
pub struct Checkpoint(BTreeMap<Address, Account>);

impl<L: LedgerReader> ScratchLedger<L> {
    pub fn new(base: L) -> Self {
        Self {
            base,
            changes: BTreeMap::new(),
        }
    }

    pub fn base(&self) -> &L {
        &self.base
    }

    /// Accounts written so far.
    pub fn changes(&self) -> &BTreeMap<Address, Account> {
        &self.changes
    }

    pub fn into_changes(self) -> BTreeMap<Address, Account> {
        self.changes
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.changes.clone())
    }

    /// Discard everything written since `checkpoint`.
    pub fn restore(&mut self, checkpoint: Checkpoint) {
        self.changes = checkpoint.0;
    }
}

impl<L: LedgerReader> LedgerReader for ScratchLedger<L> {
    fn account(&self, address: &Address) -> Result<Option<Account>> {
        match self.changes.get(address) {
            Some(account) => Ok(Some(account.clone())),
            None => self.base.account(address),
        }
    }

    fn accounts(&self) -> Result<Vec<Account>> {
        let mut merged: BTreeMap<Address, Account> = self
            .base
            .accounts()?
            .into_iter()
            .map(|account| (account.address, account))
            .collect();
        for (address, account) in &self.changes {
            merged.insert(*address, account.clone());
        }
        Ok(merged.into_values().collect())
    }
}

impl<L: LedgerReader> LedgerWriter for ScratchLedger<L> {
    fn put_account(&mut self, account: Account) -> Result<()> {
        self.changes.insert(account.address, account);
        Ok(())
    }
}

/// Ledger held entirely in memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryLedger {
    accounts: BTreeMap<Address, Account>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a set of changes (e.g. from a [`ScratchLedger`]) in.
    pub fn apply_changes(&mut self, changes: BTreeMap<Address, Account>) {
        self.accounts.extend(changes);
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

impl LedgerReader for MemoryLedger {
    fn account(&self, address: &Address) -> Result<Option<Account>> {
        Ok(self.accounts.get(address).cloned())
    }

    fn accounts(&self) -> Result<Vec<Account>> {
        Ok(self.accounts.values().cloned().collect())
    }
}

impl LedgerWriter for MemoryLedger {
    fn put_account(&mut self, account: Account) -> Result<()> {
        self.accounts.insert(account.address, account);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dposchain_core::Keypair;

    fn funded(balance: u64) -> (MemoryLedger, Address) {
        let address = Keypair::from_passphrase("funded").address();
        let mut ledger = MemoryLedger::new();
        ledger
            .credit(&address, balance, BalanceKind::Confirmed)
            .unwrap();
        ledger
            .credit(&address, balance, BalanceKind::Unconfirmed)
            .unwrap();
        (ledger, address)
    }

    #[test]
    fn test_debit_refuses_negative_balance() {
        let (mut ledger, address) = funded(100);
        ledger.debit(&address, 60, BalanceKind::Confirmed).unwrap();
        let result = ledger.debit(&address, 41, BalanceKind::Confirmed);
        assert!(matches!(
            result,
            Err(StorageError::NegativeBalance {
                balance: 40,
                amount: 41,
                ..
            })
        ));
        assert_eq!(ledger.account(&address).unwrap().unwrap().balance(), 40);
        assert_eq!(
            ledger.account(&address).unwrap().unwrap().unconfirmed_balance(),
            100
        );
    }

    #[test]
    fn test_credit_overflow() {
        let (mut ledger, address) = funded(u64::MAX);
        assert!(matches!(
            ledger.credit(&address, 1, BalanceKind::Unconfirmed),
            Err(StorageError::BalanceOverflow(_))
        ));
    }

    #[test]
    fn test_scratch_does_not_touch_base() {
        let (ledger, address) = funded(100);
        let other = Address::from_bytes([9u8; 20]);
        let mut scratch = ScratchLedger::new(&ledger);
        scratch.debit(&address, 30, BalanceKind::Confirmed).unwrap();
        scratch.credit(&other, 30, BalanceKind::Confirmed).unwrap();

        assert_eq!(scratch.account(&address).unwrap().unwrap().balance(), 70);
        assert_eq!(ledger.account(&address).unwrap().unwrap().balance(), 100);
        assert!(ledger.account(&other).unwrap().is_none());
        assert_eq!(scratch.accounts().unwrap().len(), 2);

        let changes = scratch.into_changes();
        assert_eq!(changes.len(), 2);
    }

    #[test]
    fn test_checkpoint_restore() {
        let (ledger, address) = funded(100);
        let mut scratch = ScratchLedger::new(&ledger);
        scratch.debit(&address, 10, BalanceKind::Confirmed).unwrap();
        let checkpoint = scratch.checkpoint();
        scratch.debit(&address, 50, BalanceKind::Confirmed).unwrap();
        scratch.restore(checkpoint);
        assert_eq!(scratch.account(&address).unwrap().unwrap().balance(), 90);
    }

    #[test]
    fn test_delegate_lookup_and_usernames() {
        let kp = Keypair::from_passphrase("delegate");
        let mut ledger = MemoryLedger::new();
        let mut account = Account::new(kp.address());
        account.confirmed.public_key = Some(kp.public_key.clone());
        account.confirmed.username = Some("forger".into());
        ledger.put_account(account).unwrap();

        let mut pending = Account::new(Address::from_bytes([1u8; 20]));
        pending.unconfirmed.username = Some("pending".into());
        ledger.put_account(pending).unwrap();

        assert!(ledger.delegate(&kp.public_key).unwrap().is_some());
        assert_eq!(ledger.delegates().unwrap().len(), 1);
        assert!(ledger.username_taken("forger").unwrap());
        assert!(ledger.username_taken("pending").unwrap());
        assert!(!ledger.username_taken("free").unwrap());
    }
}
