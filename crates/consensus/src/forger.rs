//! Block forging for delegates whose keys this node holds.

use crate::delegates::DelegateSelector;
use crate::error::{ConsensusError, Result};
use crate::slots::SlotClock;
use dposchain_core::{Block, ChainConstants, Keypair, PublicKey, Transaction};
use std::collections::BTreeMap;

/// Holds delegate keypairs and produces signed blocks in their slots.
pub struct BlockForger {
    keypairs: BTreeMap<PublicKey, Keypair>,
    constants: ChainConstants,
    clock: SlotClock,
}

impl BlockForger {
    pub fn new(keypairs: Vec<Keypair>, constants: ChainConstants) -> Self {
        let clock = SlotClock::new(&constants);
        let keypairs = keypairs
            .into_iter()
            .map(|kp| (kp.public_key.clone(), kp))
            .collect();
        Self {
            keypairs,
            constants,
            clock,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &PublicKey> {
        self.keypairs.keys()
    }

    pub fn clock(&self) -> &SlotClock {
        &self.clock
    }

    /// Our keypair scheduled for the slot containing `timestamp`, if any.
    pub fn keypair_for_slot(&self, forgers: &[PublicKey], timestamp: u64) -> Option<&Keypair> {
        let slot = self.clock.slot_of(timestamp);
        DelegateSelector::generator_for_slot(forgers, slot).and_then(|key| self.keypairs.get(key))
    }

    /// Create and sign a block on top of `parent` at `timestamp`.
    pub fn forge(
        &self,
        parent: &Block,
        timestamp: u64,
        forgers: &[PublicKey],
        transactions: Vec<Transaction>,
    ) -> Result<Block> {
        let slot = self.clock.slot_of(timestamp);
        let height = parent.height() + 1;
        let expected = DelegateSelector::generator_for_slot(forgers, slot)
            .ok_or(ConsensusError::NoEligibleDelegates(self.constants.round_of(height)))?;
        let keypair = self
            .keypairs
            .get(expected)
            .ok_or_else(|| ConsensusError::WrongGenerator {
                slot,
                expected: expected.clone(),
                got: self
                    .keypairs
                    .keys()
                    .next()
                    .cloned()
                    .unwrap_or_else(|| expected.clone()),
            })?;

        let reward = self.constants.rewards.reward_at(height);
        let block = Block::new(
            height,
            parent.id(),
            self.clock.slot_time(slot),
            &keypair.public_key,
            reward,
            transactions,
        )
        .signed(keypair);
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::BlockValidator;

    fn keys(n: usize) -> Vec<Keypair> {
        (0..n)
            .map(|i| Keypair::from_passphrase(&format!("forger {}", i)))
            .collect()
    }

    #[test]
    fn test_forge_in_own_slot() {
        let constants = ChainConstants {
            active_delegates: 3,
            epoch_time: 0,
            ..Default::default()
        };
        let kps = keys(3);
        let forgers: Vec<PublicKey> = kps.iter().map(|kp| kp.public_key.clone()).collect();
        let forger = BlockForger::new(vec![kps[1].clone()], constants.clone());
        let genesis = Block::genesis(&Keypair::from_passphrase("genesis"), 0, vec![]);

        assert!(forger.keypair_for_slot(&forgers, 10).is_some());
        assert!(forger.keypair_for_slot(&forgers, 20).is_none());

        let block = forger.forge(&genesis, 14, &forgers, vec![]).unwrap();
        assert_eq!(block.height(), 1);
        assert_eq!(block.header.timestamp, 10);
        assert_eq!(block.generator(), &kps[1].public_key);

        let validator = BlockValidator::new(constants);
        validator.validate_received(&block, &genesis).unwrap();
        validator.validate_slot(&block, &genesis, &forgers, 100).unwrap();
        validator.validate_payload(&block).unwrap();
    }

    #[test]
    fn test_forge_outside_slot_fails() {
        let kps = keys(2);
        let forgers: Vec<PublicKey> = kps.iter().map(|kp| kp.public_key.clone()).collect();
        let forger = BlockForger::new(vec![kps[0].clone()], ChainConstants::default());
        let genesis = Block::genesis(&Keypair::from_passphrase("genesis"), 0, vec![]);
        let result = forger.forge(&genesis, 10, &forgers, vec![]);
        assert!(matches!(result, Err(ConsensusError::WrongGenerator { slot: 1, .. })));
    }
}
