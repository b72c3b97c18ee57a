//! Transaction verification and application.
//!
//! Every transaction has four effects that come in mirrored pairs:
//! `apply_unconfirmed`/`undo_unconfirmed` touch only the unconfirmed half of
//! accounts (pool residency), `apply`/`undo` touch only the confirmed half
//! (block commit). Each half is checked before it is written, and the ledger
//! refuses to drive any balance below zero on top of that.

use dposchain_consensus::{Classify, ErrorClass};
use dposchain_core::{
    Account, Address, Asset, ChainConstants, Hash, MultisigSettings, PublicKey, SignatureError,
    Transaction, VoteEntry,
};
use dposchain_core::transaction::{
    MAX_USERNAME_LENGTH, MULTISIG_MAX_LIFETIME, MULTISIG_MAX_MEMBERS, MULTISIG_MIN_LIFETIME,
    MULTISIG_MIN_MEMBERS,
};
use dposchain_storage::{BalanceKind, LedgerReader, LedgerWriter, StorageError};
use std::collections::BTreeSet;
use thiserror::Error;

/// Errors that can occur while verifying or applying a transaction.
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("invalid signature: {0}")]
    Signature(#[from] SignatureError),

    #[error("sender address {claimed} does not belong to the sender key ({derived})")]
    SenderAddressMismatch { claimed: Address, derived: Address },

    #[error("sender key does not match the key registered for {0}")]
    PublicKeyMismatch(Address),

    #[error("member signatures on a transaction from a regular account")]
    UnexpectedMemberSignatures,

    #[error("insufficient fee (required {required}, got {got})")]
    InsufficientFee { required: u64, got: u64 },

    #[error("invalid amount {0} for this transaction type")]
    InvalidAmount(u64),

    #[error("invalid recipient")]
    InvalidRecipient,

    #[error("timestamp {timestamp} is later than {limit}")]
    TimestampInFuture { timestamp: u64, limit: u64 },

    #[error("invalid username: {0}")]
    InvalidUsername(String),

    #[error("vote list must hold between 1 and {max} entries, got {count}")]
    InvalidVoteCount { count: usize, max: usize },

    #[error("invalid multisignature settings: {0}")]
    InvalidMultisig(String),

    #[error("vote list names {0} more than once")]
    DuplicateVoteEntry(PublicKey),

    #[error("insufficient balance for {address} (required {required}, available {available})")]
    InsufficientBalance {
        address: Address,
        required: u64,
        available: u64,
    },

    #[error("already voted for {0}")]
    AlreadyVoted(PublicKey),

    #[error("not voting for {0}")]
    NotVoted(PublicKey),

    #[error("{0} is not a delegate")]
    NotADelegate(PublicKey),

    #[error("vote limit exceeded ({count}, max {max})")]
    VoteLimitExceeded { count: usize, max: usize },

    #[error("username {0} is already taken")]
    UsernameTaken(String),

    #[error("account is already a delegate")]
    AlreadyDelegate,

    #[error("second signature already registered")]
    SecondSignatureAlreadyRegistered,

    #[error("account is already a multisignature account")]
    AlreadyMultisig,

    #[error("missing member signatures ({have} of {need})")]
    MissingMemberSignatures { have: usize, need: usize },

    #[error("transaction {0} is already confirmed")]
    AlreadyConfirmed(Hash),

    #[error("ledger error: {0}")]
    Ledger(#[from] StorageError),
}

impl Classify for TransactionError {
    fn class(&self) -> ErrorClass {
        use TransactionError::*;
        match self {
            Signature(_)
            | UnexpectedMemberSignatures
            | InsufficientFee { .. }
            | InvalidAmount(_)
            | InvalidRecipient
            | TimestampInFuture { .. }
            | InvalidUsername(_)
            | InvalidVoteCount { .. }
            | InvalidMultisig(_)
            | MissingMemberSignatures { .. } => ErrorClass::Malformed,
            SenderAddressMismatch { .. }
            | PublicKeyMismatch(_)
            | DuplicateVoteEntry(_)
            | InsufficientBalance { .. }
            | AlreadyVoted(_)
            | NotVoted(_)
            | NotADelegate(_)
            | VoteLimitExceeded { .. }
            | UsernameTaken(_)
            | AlreadyDelegate
            | SecondSignatureAlreadyRegistered
            | AlreadyMultisig
            | AlreadyConfirmed(_) => ErrorClass::Consistency,
            Ledger(err) => err.class(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TransactionError>;

/// Where a transaction is being verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxContext {
    /// Height of the including block, or the next height for the pool.
    pub height: u64,
    /// Latest acceptable transaction timestamp.
    pub timestamp_limit: u64,
}

impl TxContext {
    pub fn block(height: u64, block_timestamp: u64) -> Self {
        Self {
            height,
            timestamp_limit: block_timestamp,
        }
    }

    fn is_genesis(&self) -> bool {
        self.height == 0
    }
}

/// Validates transactions and applies/undoes their effects.
#[derive(Debug, Clone)]
pub struct TransactionProcessor {
    constants: ChainConstants,
}

impl TransactionProcessor {
    pub fn new(constants: ChainConstants) -> Self {
        Self { constants }
    }

    pub fn constants(&self) -> &ChainConstants {
        &self.constants
    }

    // =========================================================================
    // Verification
    // =========================================================================

    /// Checks that need no ledger: sender address, sender signature, fee,
    /// amount and asset shape.
    pub fn verify_static(&self, tx: &Transaction, ctx: &TxContext) -> Result<()> {
        let derived = tx.sender_public_key.to_address();
        if tx.sender_address != derived {
            return Err(TransactionError::SenderAddressMismatch {
                claimed: tx.sender_address,
                derived,
            });
        }
        tx.verify_signature()?;

        if tx.timestamp > ctx.timestamp_limit {
            return Err(TransactionError::TimestampInFuture {
                timestamp: tx.timestamp,
                limit: ctx.timestamp_limit,
            });
        }
        if !ctx.is_genesis() {
            let required = tx.required_fee(&self.constants.fees);
            if tx.fee < required {
                return Err(TransactionError::InsufficientFee {
                    required,
                    got: tx.fee,
                });
            }
        }

        match &tx.asset {
            Asset::Transfer => {
                if tx.amount == 0 {
                    return Err(TransactionError::InvalidAmount(0));
                }
                if tx.recipient.is_none() {
                    return Err(TransactionError::InvalidRecipient);
                }
            }
            Asset::Vote { votes } => {
                self.require_no_amount(tx)?;
                if tx.recipient != Some(tx.sender_address) {
                    return Err(TransactionError::InvalidRecipient);
                }
                let max = self.constants.max_votes_per_transaction;
                if votes.is_empty() || votes.len() > max {
                    return Err(TransactionError::InvalidVoteCount {
                        count: votes.len(),
                        max,
                    });
                }
                let mut seen = BTreeSet::new();
                for entry in votes {
                    if !seen.insert(entry.key()) {
                        return Err(TransactionError::DuplicateVoteEntry(entry.key().clone()));
                    }
                }
            }
            Asset::Delegate { username } => {
                self.require_no_amount(tx)?;
                self.require_no_recipient(tx)?;
                validate_username(username)?;
            }
            Asset::SecondSignature { .. } => {
                self.require_no_amount(tx)?;
                self.require_no_recipient(tx)?;
            }
            Asset::Multisignature {
                min,
                lifetime,
                keysgroup,
            } => {
                self.require_no_amount(tx)?;
                self.require_no_recipient(tx)?;
                validate_multisig(&tx.sender_public_key, *min, *lifetime, keysgroup)?;
            }
        }
        Ok(())
    }

    /// Full verification against current ledger state: everything in
    /// [`Self::verify_static`] plus key ownership, second and member
    /// signatures, and type rules checked against both account halves.
    pub fn verify<L: LedgerReader>(&self, tx: &Transaction, ctx: &TxContext, ledger: &L) -> Result<()> {
        self.verify_static(tx, ctx)?;
        let sender = ledger.account_or_default(&tx.sender_address)?;
        self.verify_ownership(tx, &sender)?;
        if let Some((have, need)) = self.missing_signatures_for(tx, &sender)? {
            return Err(TransactionError::MissingMemberSignatures { have, need });
        }

        match &tx.asset {
            Asset::Transfer => {}
            Asset::SecondSignature { .. } => {
                if sender.confirmed.second_public_key.is_some()
                    || sender.unconfirmed.second_public_key.is_some()
                {
                    return Err(TransactionError::SecondSignatureAlreadyRegistered);
                }
            }
            Asset::Delegate { username } => {
                if sender.confirmed.username.is_some() || sender.unconfirmed.username.is_some() {
                    return Err(TransactionError::AlreadyDelegate);
                }
                if ledger.username_taken(username)? {
                    return Err(TransactionError::UsernameTaken(username.clone()));
                }
            }
            Asset::Vote { votes } => {
                for entry in votes {
                    if ledger.delegate(entry.key())?.is_none() {
                        return Err(TransactionError::NotADelegate(entry.key().clone()));
                    }
                    match entry {
                        VoteEntry::Add(key) => {
                            if sender.confirmed.votes.contains(key)
                                || sender.unconfirmed.votes.contains(key)
                            {
                                return Err(TransactionError::AlreadyVoted(key.clone()));
                            }
                        }
                        // A removal already waiting in the pool is caught by
                        // apply_unconfirmed against the unconfirmed set.
                        VoteEntry::Remove(key) => {
                            if !sender.confirmed.votes.contains(key) {
                                return Err(TransactionError::NotVoted(key.clone()));
                            }
                        }
                    }
                }
                self.check_vote_limit(&sender.unconfirmed.votes, votes)?;
                self.check_vote_limit(&sender.confirmed.votes, votes)?;
            }
            Asset::Multisignature { .. } => {
                if sender.confirmed.multisig.is_some() || sender.unconfirmed.multisig.is_some() {
                    return Err(TransactionError::AlreadyMultisig);
                }
            }
        }
        Ok(())
    }

    /// `Some((have, need))` when the transaction still lacks member
    /// signatures and must wait in the pending list.
    pub fn missing_signatures<L: LedgerReader>(
        &self,
        tx: &Transaction,
        ledger: &L,
    ) -> Result<Option<(usize, usize)>> {
        let sender = ledger.account_or_default(&tx.sender_address)?;
        self.missing_signatures_for(tx, &sender)
    }

    fn missing_signatures_for(&self, tx: &Transaction, sender: &Account) -> Result<Option<(usize, usize)>> {
        let (members, need) = match (&tx.asset, &sender.confirmed.multisig) {
            (_, Some(settings)) => (settings.members.clone(), settings.min as usize),
            (Asset::Multisignature { keysgroup, .. }, None) => {
                let members: BTreeSet<PublicKey> = keysgroup.iter().cloned().collect();
                let need = members.len();
                (members, need)
            }
            (_, None) => {
                if !tx.signatures.is_empty() {
                    return Err(TransactionError::UnexpectedMemberSignatures);
                }
                return Ok(None);
            }
        };
        let have = tx.verify_member_signatures(&members)?.len();
        Ok((have < need).then_some((have, need)))
    }

    fn verify_ownership(&self, tx: &Transaction, sender: &Account) -> Result<()> {
        if let Some(key) = &sender.confirmed.public_key {
            if key != &tx.sender_public_key {
                return Err(TransactionError::PublicKeyMismatch(sender.address));
            }
        }
        tx.verify_second_signature(sender.confirmed.second_public_key.as_ref())?;
        Ok(())
    }

    fn check_vote_limit(&self, current: &BTreeSet<PublicKey>, votes: &[VoteEntry]) -> Result<()> {
        let added = votes.iter().filter(|v| matches!(v, VoteEntry::Add(_))).count();
        let removed = votes.len() - added;
        let count = (current.len() + added).saturating_sub(removed);
        let max = self.constants.max_votes_per_account;
        if count > max {
            return Err(TransactionError::VoteLimitExceeded { count, max });
        }
        Ok(())
    }

    fn require_no_amount(&self, tx: &Transaction) -> Result<()> {
        if tx.amount != 0 {
            return Err(TransactionError::InvalidAmount(tx.amount));
        }
        Ok(())
    }

    fn require_no_recipient(&self, tx: &Transaction) -> Result<()> {
        if tx.recipient.is_some() {
            return Err(TransactionError::InvalidRecipient);
        }
        Ok(())
    }

    // =========================================================================
    // Unconfirmed state
    // =========================================================================

    /// Reflect a pool transaction in the unconfirmed half.
    pub fn apply_unconfirmed<L: LedgerWriter>(&self, tx: &Transaction, ledger: &mut L) -> Result<()> {
        let mut sender = ledger.account_or_default(&tx.sender_address)?;
        let cost = tx.total_cost();
        if sender.unconfirmed.balance < cost {
            return Err(TransactionError::InsufficientBalance {
                address: sender.address,
                required: cost,
                available: sender.unconfirmed.balance,
            });
        }
        let state = &mut sender.unconfirmed;
        match &tx.asset {
            Asset::Transfer => {}
            Asset::SecondSignature { public_key } => {
                if state.second_public_key.is_some() {
                    return Err(TransactionError::SecondSignatureAlreadyRegistered);
                }
                state.second_public_key = Some(public_key.clone());
            }
            Asset::Delegate { username } => {
                if state.username.is_some() {
                    return Err(TransactionError::AlreadyDelegate);
                }
                state.username = Some(username.clone());
            }
            Asset::Vote { votes } => {
                edit_votes(&mut state.votes, votes)?;
                let max = self.constants.max_votes_per_account;
                if state.votes.len() > max {
                    return Err(TransactionError::VoteLimitExceeded {
                        count: state.votes.len(),
                        max,
                    });
                }
            }
            Asset::Multisignature {
                min,
                lifetime,
                keysgroup,
            } => {
                if state.multisig.is_some() {
                    return Err(TransactionError::AlreadyMultisig);
                }
                state.multisig = Some(settings(*min, *lifetime, keysgroup));
            }
        }
        ledger.put_account(sender)?;
        ledger.debit(&tx.sender_address, cost, BalanceKind::Unconfirmed)?;
        if let (Asset::Transfer, Some(recipient)) = (&tx.asset, &tx.recipient) {
            ledger.credit(recipient, tx.amount, BalanceKind::Unconfirmed)?;
        }
        Ok(())
    }

    /// Exact inverse of [`Self::apply_unconfirmed`].
    pub fn undo_unconfirmed<L: LedgerWriter>(&self, tx: &Transaction, ledger: &mut L) -> Result<()> {
        if let (Asset::Transfer, Some(recipient)) = (&tx.asset, &tx.recipient) {
            ledger.debit(recipient, tx.amount, BalanceKind::Unconfirmed)?;
        }
        let mut sender = ledger.account_or_default(&tx.sender_address)?;
        let state = &mut sender.unconfirmed;
        match &tx.asset {
            Asset::Transfer => {}
            Asset::SecondSignature { .. } => state.second_public_key = None,
            Asset::Delegate { .. } => state.username = None,
            Asset::Vote { votes } => revert_votes(&mut state.votes, votes)?,
            Asset::Multisignature { .. } => state.multisig = None,
        }
        ledger.put_account(sender)?;
        ledger.credit(&tx.sender_address, tx.total_cost(), BalanceKind::Unconfirmed)?;
        Ok(())
    }

    // =========================================================================
    // Confirmed state
    // =========================================================================

    /// Apply a transaction's confirmed effect at block commit.
    pub fn apply<L: LedgerWriter>(&self, tx: &Transaction, ledger: &mut L) -> Result<()> {
        let mut sender = ledger.account_or_default(&tx.sender_address)?;
        let cost = tx.total_cost();
        if sender.confirmed.balance < cost {
            return Err(TransactionError::InsufficientBalance {
                address: sender.address,
                required: cost,
                available: sender.confirmed.balance,
            });
        }
        let state = &mut sender.confirmed;
        match &state.public_key {
            Some(key) if key != &tx.sender_public_key => {
                return Err(TransactionError::PublicKeyMismatch(tx.sender_address))
            }
            Some(_) => {}
            None => state.public_key = Some(tx.sender_public_key.clone()),
        }
        state.outgoing += 1;
        match &tx.asset {
            Asset::Transfer => {}
            Asset::SecondSignature { public_key } => {
                if state.second_public_key.is_some() {
                    return Err(TransactionError::SecondSignatureAlreadyRegistered);
                }
                state.second_public_key = Some(public_key.clone());
            }
            Asset::Delegate { username } => {
                if state.username.is_some() {
                    return Err(TransactionError::AlreadyDelegate);
                }
                state.username = Some(username.clone());
            }
            Asset::Vote { votes } => {
                edit_votes(&mut state.votes, votes)?;
                let max = self.constants.max_votes_per_account;
                if state.votes.len() > max {
                    return Err(TransactionError::VoteLimitExceeded {
                        count: state.votes.len(),
                        max,
                    });
                }
            }
            Asset::Multisignature {
                min,
                lifetime,
                keysgroup,
            } => {
                if state.multisig.is_some() {
                    return Err(TransactionError::AlreadyMultisig);
                }
                state.multisig = Some(settings(*min, *lifetime, keysgroup));
            }
        }
        ledger.put_account(sender)?;
        ledger.debit(&tx.sender_address, cost, BalanceKind::Confirmed)?;
        if let (Asset::Transfer, Some(recipient)) = (&tx.asset, &tx.recipient) {
            ledger.credit(recipient, tx.amount, BalanceKind::Confirmed)?;
        }
        Ok(())
    }

    /// Exact inverse of [`Self::apply`].
    pub fn undo<L: LedgerWriter>(&self, tx: &Transaction, ledger: &mut L) -> Result<()> {
        if let (Asset::Transfer, Some(recipient)) = (&tx.asset, &tx.recipient) {
            ledger.debit(recipient, tx.amount, BalanceKind::Confirmed)?;
        }
        let mut sender = ledger.account_or_default(&tx.sender_address)?;
        let state = &mut sender.confirmed;
        match &tx.asset {
            Asset::Transfer => {}
            Asset::SecondSignature { .. } => state.second_public_key = None,
            Asset::Delegate { .. } => state.username = None,
            Asset::Vote { votes } => revert_votes(&mut state.votes, votes)?,
            Asset::Multisignature { .. } => state.multisig = None,
        }
        state.outgoing = state.outgoing.saturating_sub(1);
        if state.outgoing == 0 {
            state.public_key = None;
        }
        ledger.put_account(sender)?;
        ledger.credit(&tx.sender_address, tx.total_cost(), BalanceKind::Confirmed)?;
        Ok(())
    }
}

/// Delegate names: 1-20 chars of `[a-z0-9!@$&_.]` that do not parse as an
/// address.
fn validate_username(username: &str) -> Result<()> {
    if username.is_empty() || username.len() > MAX_USERNAME_LENGTH {
        return Err(TransactionError::InvalidUsername(format!(
            "length must be 1..={}",
            MAX_USERNAME_LENGTH
        )));
    }
    let allowed = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || "!@$&_.".contains(c);
    if !username.chars().all(allowed) {
        return Err(TransactionError::InvalidUsername(username.to_string()));
    }
    if Address::from_hex(username).is_ok() {
        return Err(TransactionError::InvalidUsername(format!(
            "{} reads as an address",
            username
        )));
    }
    Ok(())
}

fn validate_multisig(sender: &PublicKey, min: u8, lifetime: u8, keysgroup: &[PublicKey]) -> Result<()> {
    let len = keysgroup.len();
    if !(MULTISIG_MIN_MEMBERS..=MULTISIG_MAX_MEMBERS).contains(&len) {
        return Err(TransactionError::InvalidMultisig(format!(
            "keysgroup must hold {}..={} members",
            MULTISIG_MIN_MEMBERS, MULTISIG_MAX_MEMBERS
        )));
    }
    if min == 0 || min as usize > len {
        return Err(TransactionError::InvalidMultisig(format!(
            "min {} outside 1..={}",
            min, len
        )));
    }
    if !(MULTISIG_MIN_LIFETIME..=MULTISIG_MAX_LIFETIME).contains(&lifetime) {
        return Err(TransactionError::InvalidMultisig(format!(
            "lifetime {} outside {}..={} hours",
            lifetime, MULTISIG_MIN_LIFETIME, MULTISIG_MAX_LIFETIME
        )));
    }
    let unique: BTreeSet<&PublicKey> = keysgroup.iter().collect();
    if unique.len() != len {
        return Err(TransactionError::InvalidMultisig("duplicate member".into()));
    }
    if unique.contains(sender) {
        return Err(TransactionError::InvalidMultisig("sender cannot be a member".into()));
    }
    Ok(())
}

fn settings(min: u8, lifetime: u8, keysgroup: &[PublicKey]) -> MultisigSettings {
    MultisigSettings {
        min,
        lifetime,
        members: keysgroup.iter().cloned().collect(),
    }
}

/// Apply vote entries; every entry must change the set.
fn edit_votes(votes: &mut BTreeSet<PublicKey>, entries: &[VoteEntry]) -> Result<()> {
    for entry in entries {
        match entry {
            VoteEntry::Add(key) => {
                if !votes.insert(key.clone()) {
                    return Err(TransactionError::AlreadyVoted(key.clone()));
                }
            }
            VoteEntry::Remove(key) => {
                if !votes.remove(key) {
                    return Err(TransactionError::NotVoted(key.clone()));
                }
            }
        }
    }
    Ok(())
}

fn revert_votes(votes: &mut BTreeSet<PublicKey>, entries: &[VoteEntry]) -> Result<()> {
    for entry in entries.iter().rev() {
        match entry {
            VoteEntry::Add(key) => {
                if !votes.remove(key) {
                    return Err(TransactionError::NotVoted(key.clone()));
                }
            }
            VoteEntry::Remove(key) => {
                if !votes.insert(key.clone()) {
                    return Err(TransactionError::AlreadyVoted(key.clone()));
                }
            }
        }
    }
    Ok(())
}
