//! Block validation rules that need no ledger access.
//!
//! Each method covers one stage of block processing: the structural checks
//! done on receipt, the slot check, and the payload check.

use crate::delegates::DelegateSelector;
use crate::error::{ConsensusError, Result};
use crate::slots::SlotClock;
use dposchain_core::{Block, ChainConstants, PublicKey, BLOCK_VERSION};

/// Block validator.
#[derive(Debug, Clone)]
pub struct BlockValidator {
    constants: ChainConstants,
    clock: SlotClock,
}

impl BlockValidator {
    pub fn new(constants: ChainConstants) -> Self {
        let clock = SlotClock::new(&constants);
        Self { constants, clock }
    }

    pub fn clock(&self) -> &SlotClock {
        &self.clock
    }

    /// Structural checks: version, link to the parent, size limits and the
    /// generator signature.
    pub fn validate_received(&self, block: &Block, parent: &Block) -> Result<()> {
        if block.header.version != BLOCK_VERSION {
            return Err(ConsensusError::InvalidVersion(block.header.version));
        }
        let count = block.transactions.len();
        if count > self.constants.max_transactions_per_block {
            return Err(ConsensusError::TooManyTransactions {
                count,
                max: self.constants.max_transactions_per_block,
            });
        }
        let length = block.header.payload_length as usize;
        if length > self.constants.max_payload_length {
            return Err(ConsensusError::PayloadTooLarge {
                length,
                max: self.constants.max_payload_length,
            });
        }
        if !block.verify_signature() {
            return Err(ConsensusError::InvalidBlockSignature);
        }
        self.validate_extends(block, parent)
    }

    /// Validate block extends the parent correctly.
    pub fn validate_extends(&self, block: &Block, parent: &Block) -> Result<()> {
        if block.height() != parent.height() + 1 {
            return Err(ConsensusError::InvalidHeight {
                expected: parent.height() + 1,
                got: block.height(),
            });
        }
        if block.previous_block_id() != parent.id() {
            return Err(ConsensusError::InvalidPreviousBlock {
                expected: parent.id(),
                got: block.previous_block_id(),
            });
        }
        Ok(())
    }

    /// The block must sit in a slot after its parent's, not in the future,
    /// and be signed by the delegate scheduled for that slot.
    pub fn validate_slot(
        &self,
        block: &Block,
        parent: &Block,
        forgers: &[PublicKey],
        unix_now: u64,
    ) -> Result<()> {
        let slot = self.clock.slot_of(block.header.timestamp);
        let parent_slot = self.clock.slot_of(parent.header.timestamp);
        if !parent.is_genesis() && slot <= parent_slot {
            return Err(ConsensusError::SlotNotAfterParent { slot, parent_slot });
        }
        let current = self.clock.current_slot(unix_now);
        if slot > current {
            return Err(ConsensusError::SlotInFuture { slot, current });
        }
        let expected = DelegateSelector::generator_for_slot(forgers, slot)
            .ok_or(ConsensusError::NoEligibleDelegates(self.constants.round_of(block.height())))?;
        if expected != block.generator() {
            return Err(ConsensusError::WrongGenerator {
                slot,
                expected: expected.clone(),
                got: block.generator().clone(),
            });
        }
        Ok(())
    }

    /// Declared payload fields must equal the recomputed ones.
    pub fn validate_payload(&self, block: &Block) -> Result<()> {
        let header = &block.header;
        let actual = block.compute_payload();
        if header.number_of_transactions != actual.number_of_transactions {
            return Err(ConsensusError::TransactionCountMismatch {
                declared: header.number_of_transactions,
                actual: actual.number_of_transactions,
            });
        }
        if header.payload_length != actual.payload_length {
            return Err(ConsensusError::PayloadLengthMismatch {
                declared: header.payload_length,
                actual: actual.payload_length,
            });
        }
        if header.payload_hash != actual.payload_hash {
            return Err(ConsensusError::PayloadHashMismatch);
        }
        if header.total_amount != actual.total_amount {
            return Err(ConsensusError::TotalAmountMismatch {
                declared: header.total_amount,
                actual: actual.total_amount,
            });
        }
        if header.total_fee != actual.total_fee {
            return Err(ConsensusError::TotalFeeMismatch {
                declared: header.total_fee,
                actual: actual.total_fee,
            });
        }
        let expected = self.constants.rewards.reward_at(block.height());
        if header.reward != expected {
            return Err(ConsensusError::RewardMismatch {
                declared: header.reward,
                expected,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dposchain_core::{Address, Hash, Keypair, Transaction};

    const EPOCH: u64 = 1_000_000;

    fn constants() -> ChainConstants {
        ChainConstants {
            active_delegates: 3,
            epoch_time: EPOCH,
            ..Default::default()
        }
    }

    fn forger() -> Keypair {
        Keypair::from_passphrase("validator forger")
    }

    fn genesis() -> Block {
        Block::genesis(&Keypair::from_passphrase("genesis"), 0, vec![])
    }

    fn child(parent: &Block, timestamp: u64, txs: Vec<Transaction>) -> Block {
        let kp = forger();
        Block::new(parent.height() + 1, parent.id(), timestamp, &kp.public_key, 0, txs).signed(&kp)
    }

    #[test]
    fn test_received_checks() {
        let validator = BlockValidator::new(constants());
        let parent = genesis();
        let block = child(&parent, 10, vec![]);
        assert!(validator.validate_received(&block, &parent).is_ok());

        let mut bad_version = block.clone();
        bad_version.header.version = 9;
        assert!(matches!(
            validator.validate_received(&bad_version, &parent),
            Err(ConsensusError::InvalidVersion(9))
        ));

        let mut unsigned = block.clone();
        unsigned.header.timestamp += 1;
        assert!(matches!(
            validator.validate_received(&unsigned, &parent),
            Err(ConsensusError::InvalidBlockSignature)
        ));

        let orphan = child(&block, 20, vec![]);
        assert!(matches!(
            validator.validate_received(&orphan, &parent),
            Err(ConsensusError::InvalidHeight { .. })
        ));

        let kp = forger();
        let wrong_parent =
            Block::new(1, Hash::ZERO, 10, &kp.public_key, 0, vec![]).signed(&kp);
        assert!(matches!(
            validator.validate_received(&wrong_parent, &parent),
            Err(ConsensusError::InvalidPreviousBlock { .. })
        ));
    }

    #[test]
    fn test_too_many_transactions() {
        let validator = BlockValidator::new(ChainConstants {
            max_transactions_per_block: 1,
            ..constants()
        });
        let kp = forger();
        let txs = (0..2)
            .map(|i| Transaction::transfer(&kp.public_key, Address::ZERO, 1 + i, 1, 0).signed(&kp))
            .collect();
        let parent = genesis();
        let block = child(&parent, 10, txs);
        assert!(matches!(
            validator.validate_received(&block, &parent),
            Err(ConsensusError::TooManyTransactions { count: 2, max: 1 })
        ));
    }

    #[test]
    fn test_slot_checks() {
        let validator = BlockValidator::new(constants());
        let parent = genesis();
        let other = Keypair::from_passphrase("other");
        let forgers = vec![other.public_key.clone(), forger().public_key, other.public_key.clone()];

        // slot 1 belongs to the forger
        let block = child(&parent, 10, vec![]);
        assert!(validator
            .validate_slot(&block, &parent, &forgers, EPOCH + 15)
            .is_ok());

        assert!(matches!(
            validator.validate_slot(&block, &parent, &forgers, EPOCH + 5),
            Err(ConsensusError::SlotInFuture { slot: 1, current: 0 })
        ));

        let wrong_slot = child(&parent, 20, vec![]);
        assert!(matches!(
            validator.validate_slot(&wrong_slot, &parent, &forgers, EPOCH + 100),
            Err(ConsensusError::WrongGenerator { slot: 2, .. })
        ));

        let same_slot = child(&block, 12, vec![]);
        assert!(matches!(
            validator.validate_slot(&same_slot, &block, &forgers, EPOCH + 100),
            Err(ConsensusError::SlotNotAfterParent { .. })
        ));
    }

    #[test]
    fn test_payload_checks() {
        let validator = BlockValidator::new(constants());
        let kp = forger();
        let tx = Transaction::transfer(&kp.public_key, Address::ZERO, 5, 1, 0).signed(&kp);
        let block = child(&genesis(), 10, vec![tx.clone()]);
        assert!(validator.validate_payload(&block).is_ok());

        let mut swapped = block.clone();
        swapped.transactions[0] =
            Transaction::transfer(&kp.public_key, Address::ZERO, 5, 1, 1).signed(&kp);
        assert!(matches!(
            validator.validate_payload(&swapped),
            Err(ConsensusError::PayloadHashMismatch)
        ));

        let mut fee = block.clone();
        fee.header.total_fee = 2;
        assert!(matches!(
            validator.validate_payload(&fee),
            Err(ConsensusError::TotalFeeMismatch { declared: 2, actual: 1 })
        ));

        let mut reward = block;
        reward.header.reward = 1;
        assert!(matches!(
            validator.validate_payload(&reward),
            Err(ConsensusError::RewardMismatch { declared: 1, expected: 0 })
        ));
    }
}
