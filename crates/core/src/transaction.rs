//! Transactions, their typed assets, and signing.
//!
//! Three digests matter:
//! - the signing hash covers every field except signatures and is what the
//!   sender signs;
//! - the second signing hash additionally covers the sender signature;
//! - the id covers the signing bytes plus sender and second signature.
//!
//! Multisignature members sign the id, so collecting their signatures never
//! changes it.

use crate::config::FeeSchedule;
use crate::crypto::{Address, Keypair, PublicKey, Signature};
use crate::hash::{hash, Hash};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Smallest and largest multisignature keysgroup.
pub const MULTISIG_MIN_MEMBERS: usize = 1;
pub const MULTISIG_MAX_MEMBERS: usize = 15;
/// Bounds on a multisignature lifetime, in hours.
pub const MULTISIG_MIN_LIFETIME: u8 = 1;
pub const MULTISIG_MAX_LIFETIME: u8 = 72;
/// Longest delegate name.
pub const MAX_USERNAME_LENGTH: usize = 20;

/// Signature checks performed on a transaction in isolation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("sender signature verification failed")]
    InvalidSignature,
    #[error("second signature verification failed")]
    InvalidSecondSignature,
    #[error("missing second signature")]
    MissingSecondSignature,
    #[error("unexpected second signature")]
    UnexpectedSecondSignature,
    #[error("invalid member signature from {0:?}")]
    InvalidMemberSignature(PublicKey),
    #[error("signature from {0:?} which is not a multisignature member")]
    NotAMember(PublicKey),
    #[error("duplicate member signature from {0:?}")]
    DuplicateMemberSignature(PublicKey),
}

/// Wire tag of each transaction kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransactionType {
    Transfer = 0,
    SecondSignature = 1,
    Delegate = 2,
    Vote = 3,
    Multisignature = 4,
}

/// One entry in a vote asset: `+pk` or `-pk`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteEntry {
    Add(PublicKey),
    Remove(PublicKey),
}

impl VoteEntry {
    pub fn key(&self) -> &PublicKey {
        match self {
            VoteEntry::Add(pk) | VoteEntry::Remove(pk) => pk,
        }
    }
}

impl fmt::Display for VoteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoteEntry::Add(pk) => write!(f, "+{}", pk),
            VoteEntry::Remove(pk) => write!(f, "-{}", pk),
        }
    }
}

/// Type-specific payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Asset {
    Transfer,
    SecondSignature {
        public_key: PublicKey,
    },
    Delegate {
        username: String,
    },
    Vote {
        votes: Vec<VoteEntry>,
    },
    Multisignature {
        min: u8,
        lifetime: u8,
        keysgroup: Vec<PublicKey>,
    },
}

impl Asset {
    pub fn tx_type(&self) -> TransactionType {
        match self {
            Asset::Transfer => TransactionType::Transfer,
            Asset::SecondSignature { .. } => TransactionType::SecondSignature,
            Asset::Delegate { .. } => TransactionType::Delegate,
            Asset::Vote { .. } => TransactionType::Vote,
            Asset::Multisignature { .. } => TransactionType::Multisignature,
        }
    }
}

/// A co-signature from a multisignature member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSignature {
    pub public_key: PublicKey,
    pub signature: Signature,
}

/// A transaction. Immutable once signed; its id is a pure function of its
/// fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Epoch-relative seconds.
    pub timestamp: u64,
    pub sender_public_key: PublicKey,
    /// Claimed sender; must match the address of `sender_public_key`.
    pub sender_address: Address,
    pub recipient: Option<Address>,
    pub amount: u64,
    pub fee: u64,
    pub asset: Asset,
    pub signature: Signature,
    pub second_signature: Option<Signature>,
    pub signatures: Vec<MemberSignature>,
}

/// Canonical signable form.
#[derive(Serialize)]
struct SignableTransaction<'a> {
    tx_type: TransactionType,
    timestamp: u64,
    sender_public_key: &'a PublicKey,
    sender_address: &'a Address,
    recipient: &'a Option<Address>,
    amount: u64,
    fee: u64,
    asset: &'a Asset,
}

impl Transaction {
    /// An unsigned transaction from `sender`.
    pub fn new(
        sender: &PublicKey,
        recipient: Option<Address>,
        amount: u64,
        fee: u64,
        asset: Asset,
        timestamp: u64,
    ) -> Self {
        Self {
            timestamp,
            sender_public_key: sender.clone(),
            sender_address: sender.to_address(),
            recipient,
            amount,
            fee,
            asset,
            signature: Signature::default(),
            second_signature: None,
            signatures: Vec::new(),
        }
    }

    pub fn transfer(
        sender: &PublicKey,
        recipient: Address,
        amount: u64,
        fee: u64,
        timestamp: u64,
    ) -> Self {
        Self::new(sender, Some(recipient), amount, fee, Asset::Transfer, timestamp)
    }

    pub fn register_second_signature(
        sender: &PublicKey,
        second: &PublicKey,
        fee: u64,
        timestamp: u64,
    ) -> Self {
        let asset = Asset::SecondSignature {
            public_key: second.clone(),
        };
        Self::new(sender, None, 0, fee, asset, timestamp)
    }

    pub fn register_delegate(sender: &PublicKey, username: &str, fee: u64, timestamp: u64) -> Self {
        let asset = Asset::Delegate {
            username: username.to_string(),
        };
        Self::new(sender, None, 0, fee, asset, timestamp)
    }

    pub fn vote(sender: &PublicKey, votes: Vec<VoteEntry>, fee: u64, timestamp: u64) -> Self {
        Self::new(
            sender,
            Some(sender.to_address()),
            0,
            fee,
            Asset::Vote { votes },
            timestamp,
        )
    }

    pub fn register_multisignature(
        sender: &PublicKey,
        min: u8,
        lifetime: u8,
        keysgroup: Vec<PublicKey>,
        fee: u64,
        timestamp: u64,
    ) -> Self {
        let asset = Asset::Multisignature {
            min,
            lifetime,
            keysgroup,
        };
        Self::new(sender, None, 0, fee, asset, timestamp)
    }

    pub fn tx_type(&self) -> TransactionType {
        self.asset.tx_type()
    }

    /// Canonical bytes covering every field except signatures.
    pub fn signable_bytes(&self) -> Vec<u8> {
        let signable = SignableTransaction {
            tx_type: self.tx_type(),
            timestamp: self.timestamp,
            sender_public_key: &self.sender_public_key,
            sender_address: &self.sender_address,
            recipient: &self.recipient,
            amount: self.amount,
            fee: self.fee,
            asset: &self.asset,
        };
        bincode::serialize(&signable).expect("serialization should not fail")
    }

    /// Hash signed by the sender key.
    pub fn signing_hash(&self) -> Hash {
        hash(&self.signable_bytes())
    }

    /// Hash signed by the registered second key.
    pub fn second_signing_hash(&self) -> Hash {
        let mut bytes = self.signable_bytes();
        bytes.extend_from_slice(self.signature.as_bytes());
        hash(&bytes)
    }

    /// Transaction id. Excludes member signatures.
    pub fn id(&self) -> Hash {
        let mut bytes = self.signable_bytes();
        bytes.extend_from_slice(self.signature.as_bytes());
        if let Some(second) = &self.second_signature {
            bytes.extend_from_slice(second.as_bytes());
        }
        hash(&bytes)
    }

    /// Full encoded bytes as carried in a block payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("serialization should not fail")
    }

    pub fn sign(&mut self, keypair: &Keypair) {
        self.signature = keypair.sign_hash(&self.signing_hash());
    }

    pub fn signed(mut self, keypair: &Keypair) -> Self {
        self.sign(keypair);
        self
    }

    /// Add the second signature. Must come after [`Transaction::sign`].
    pub fn second_signed(mut self, second: &Keypair) -> Self {
        self.second_signature = Some(second.sign_hash(&self.second_signing_hash()));
        self
    }

    /// Append a member co-signature over the id.
    pub fn add_member_signature(&mut self, member: &Keypair) {
        let signature = member.sign_hash(&self.id());
        self.signatures.push(MemberSignature {
            public_key: member.public_key.clone(),
            signature,
        });
    }

    pub fn member_signed(mut self, member: &Keypair) -> Self {
        self.add_member_signature(member);
        self
    }

    pub fn verify_signature(&self) -> Result<(), SignatureError> {
        self.sender_public_key
            .verify(self.signing_hash().as_bytes(), &self.signature)
            .map_err(|_| SignatureError::InvalidSignature)
    }

    /// Check the second signature against the sender's registered second key.
    pub fn verify_second_signature(&self, registered: Option<&PublicKey>) -> Result<(), SignatureError> {
        match (registered, &self.second_signature) {
            (None, None) => Ok(()),
            (None, Some(_)) => Err(SignatureError::UnexpectedSecondSignature),
            (Some(_), None) => Err(SignatureError::MissingSecondSignature),
            (Some(key), Some(sig)) => key
                .verify(self.second_signing_hash().as_bytes(), sig)
                .map_err(|_| SignatureError::InvalidSecondSignature),
        }
    }

    /// Verify member signatures against `members` and return the distinct
    /// signers. Any invalid, foreign or repeated signature is an error.
    pub fn verify_member_signatures(
        &self,
        members: &BTreeSet<PublicKey>,
    ) -> Result<BTreeSet<PublicKey>, SignatureError> {
        let id = self.id();
        let mut signers = BTreeSet::new();
        for entry in &self.signatures {
            if !members.contains(&entry.public_key) {
                return Err(SignatureError::NotAMember(entry.public_key.clone()));
            }
            entry
                .public_key
                .verify(id.as_bytes(), &entry.signature)
                .map_err(|_| SignatureError::InvalidMemberSignature(entry.public_key.clone()))?;
            if !signers.insert(entry.public_key.clone()) {
                return Err(SignatureError::DuplicateMemberSignature(
                    entry.public_key.clone(),
                ));
            }
        }
        Ok(signers)
    }

    /// Fee required by `schedule` for this transaction.
    pub fn required_fee(&self, schedule: &FeeSchedule) -> u64 {
        match &self.asset {
            Asset::Transfer => schedule.transfer,
            Asset::SecondSignature { .. } => schedule.second_signature,
            Asset::Delegate { .. } => schedule.delegate,
            Asset::Vote { .. } => schedule.vote,
            Asset::Multisignature { keysgroup, .. } => schedule
                .multisignature
                .saturating_mul(keysgroup.len() as u64 + 1),
        }
    }

    /// Amount plus fee debited from the sender.
    pub fn total_cost(&self) -> u64 {
        self.amount.saturating_add(self.fee)
    }
}
