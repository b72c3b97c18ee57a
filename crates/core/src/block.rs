//! Block and block header structures.

use crate::crypto::{Keypair, PublicKey, Signature};
use crate::hash::{hash, Hash};
use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};

/// Current block format version.
pub const BLOCK_VERSION: u32 = 1;

/// The header of a block. Everything except the generator signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: u32,
    /// Block height (0 for genesis).
    pub height: u64,
    pub previous_block_id: Hash,
    /// Epoch-relative seconds; determines the slot.
    pub timestamp: u64,
    pub generator_public_key: PublicKey,
    pub number_of_transactions: u32,
    /// Byte length of the concatenated encoded transactions.
    pub payload_length: u32,
    pub payload_hash: Hash,
    pub total_amount: u64,
    pub total_fee: u64,
    pub reward: u64,
}

impl BlockHeader {
    /// Hash signed by the generator.
    pub fn signing_hash(&self) -> Hash {
        let encoded = bincode::serialize(self).expect("serialization should not fail");
        hash(&encoded)
    }
}

/// Payload digest and totals derived from an ordered transaction list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadSummary {
    pub number_of_transactions: u32,
    pub payload_length: u32,
    pub payload_hash: Hash,
    pub total_amount: u64,
    pub total_fee: u64,
}

impl PayloadSummary {
    pub fn compute(transactions: &[Transaction]) -> Self {
        let mut hasher = blake3::Hasher::new();
        let mut length = 0usize;
        let mut total_amount = 0u64;
        let mut total_fee = 0u64;
        for tx in transactions {
            let bytes = tx.to_bytes();
            length += bytes.len();
            hasher.update(&bytes);
            total_amount = total_amount.saturating_add(tx.amount);
            total_fee = total_fee.saturating_add(tx.fee);
        }
        Self {
            number_of_transactions: transactions.len() as u32,
            payload_length: length.min(u32::MAX as usize) as u32,
            payload_hash: Hash(hasher.finalize().into()),
            total_amount,
            total_fee,
        }
    }
}

/// A complete block including header, transactions, and signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    /// Generator signature over the header.
    pub signature: Signature,
}

impl Block {
    /// Create a new unsigned block whose payload fields are derived from
    /// `transactions`.
    pub fn new(
        height: u64,
        previous_block_id: Hash,
        timestamp: u64,
        generator: &PublicKey,
        reward: u64,
        transactions: Vec<Transaction>,
    ) -> Self {
        let payload = PayloadSummary::compute(&transactions);
        Self {
            header: BlockHeader {
                version: BLOCK_VERSION,
                height,
                previous_block_id,
                timestamp,
                generator_public_key: generator.clone(),
                number_of_transactions: payload.number_of_transactions,
                payload_length: payload.payload_length,
                payload_hash: payload.payload_hash,
                total_amount: payload.total_amount,
                total_fee: payload.total_fee,
                reward,
            },
            transactions,
            signature: Signature::default(),
        }
    }

    /// Create the genesis block carrying the initial transactions.
    pub fn genesis(generator: &Keypair, timestamp: u64, transactions: Vec<Transaction>) -> Self {
        Self::new(0, Hash::ZERO, timestamp, &generator.public_key, 0, transactions)
            .signed(generator)
    }

    /// Block id: hash of the header and the signature.
    pub fn id(&self) -> Hash {
        let mut bytes = bincode::serialize(&self.header).expect("serialization should not fail");
        bytes.extend_from_slice(self.signature.as_bytes());
        hash(&bytes)
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    pub fn previous_block_id(&self) -> Hash {
        self.header.previous_block_id
    }

    pub fn generator(&self) -> &PublicKey {
        &self.header.generator_public_key
    }

    pub fn is_genesis(&self) -> bool {
        self.header.height == 0 && self.header.previous_block_id == Hash::ZERO
    }

    pub fn tx_count(&self) -> usize {
        self.transactions.len()
    }

    pub fn sign(&mut self, keypair: &Keypair) {
        self.signature = keypair.sign_hash(&self.header.signing_hash());
    }

    pub fn signed(mut self, keypair: &Keypair) -> Self {
        self.sign(keypair);
        self
    }

    /// Verify the signature against the declared generator.
    pub fn verify_signature(&self) -> bool {
        self.header
            .generator_public_key
            .verify(self.header.signing_hash().as_bytes(), &self.signature)
            .is_ok()
    }

    /// Payload recomputed from the carried transactions.
    pub fn compute_payload(&self) -> PayloadSummary {
        PayloadSummary::compute(&self.transactions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Address;

    fn sample_txs(kp: &Keypair) -> Vec<Transaction> {
        (0..3)
            .map(|i| {
                Transaction::transfer(&kp.public_key, Address::ZERO, 100 + i, 10, 1).signed(kp)
            })
            .collect()
    }

    #[test]
    fn test_genesis_block() {
        let kp = Keypair::from_passphrase("genesis");
        let genesis = Block::genesis(&kp, 0, vec![]);
        assert!(genesis.is_genesis());
        assert_eq!(genesis.height(), 0);
        assert!(genesis.verify_signature());
    }

    #[test]
    fn test_block_signing() {
        let kp = Keypair::generate();
        let block = Block::new(1, Hash::ZERO, 10, &kp.public_key, 0, vec![]).signed(&kp);
        assert!(block.verify_signature());

        let mut other = block.clone();
        other.header.generator_public_key = Keypair::generate().public_key;
        assert!(!other.verify_signature());
    }

    #[test]
    fn test_payload_summary() {
        let kp = Keypair::from_passphrase("payer");
        let txs = sample_txs(&kp);
        let block = Block::new(1, Hash::ZERO, 10, &kp.public_key, 5, txs.clone());
        assert_eq!(block.header.number_of_transactions, 3);
        assert_eq!(block.header.total_amount, 100 + 101 + 102);
        assert_eq!(block.header.total_fee, 30);
        let length: usize = txs.iter().map(|tx| tx.to_bytes().len()).sum();
        assert_eq!(block.header.payload_length as usize, length);
        assert_eq!(block.compute_payload().payload_hash, block.header.payload_hash);
    }

    #[test]
    fn test_payload_hash_is_order_sensitive() {
        let kp = Keypair::from_passphrase("payer");
        let txs = sample_txs(&kp);
        let mut reversed = txs.clone();
        reversed.reverse();
        assert_ne!(
            PayloadSummary::compute(&txs).payload_hash,
            PayloadSummary::compute(&reversed).payload_hash
        );
    }

    #[test]
    fn test_id_depends_on_signature() {
        let a = Keypair::from_passphrase("a");
        let unsigned = Block::new(1, Hash::ZERO, 10, &a.public_key, 0, vec![]);
        let signed = unsigned.clone().signed(&a);
        assert_ne!(unsigned.id(), signed.id());
        assert_eq!(signed.id(), signed.clone().id());
    }
}
