//! Genesis block construction.

use dposchain_core::{Address, Block, Keypair, Transaction, VoteEntry};

/// Builds a genesis block that funds accounts and registers an initial set
/// of self-voting delegates.
///
/// Genesis transactions carry no fee. Transfers come first, then delegate
/// registrations, then votes, so every vote targets an existing delegate.
pub struct GenesisBuilder {
    generator: Keypair,
    timestamp: u64,
    delegates: Vec<(Keypair, String, u64)>,
    accounts: Vec<(Address, u64)>,
}

impl GenesisBuilder {
    pub fn new(generator: Keypair) -> Self {
        Self {
            generator,
            timestamp: 0,
            delegates: Vec::new(),
            accounts: Vec::new(),
        }
    }

    pub fn timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Register `keypair` as a delegate named `username` holding `balance`.
    pub fn delegate(mut self, keypair: Keypair, username: &str, balance: u64) -> Self {
        self.delegates.push((keypair, username.to_string(), balance));
        self
    }

    /// Fund a plain account.
    pub fn account(mut self, address: Address, balance: u64) -> Self {
        self.accounts.push((address, balance));
        self
    }

    pub fn build(self) -> Block {
        let generator = &self.generator;
        let mut transactions = Vec::new();

        let funded = self
            .delegates
            .iter()
            .map(|(kp, _, balance)| (kp.address(), *balance))
            .chain(self.accounts.iter().copied());
        for (address, balance) in funded {
            if balance > 0 {
                transactions.push(
                    Transaction::transfer(&generator.public_key, address, balance, 0, self.timestamp)
                        .signed(generator),
                );
            }
        }
        for (kp, username, _) in &self.delegates {
            transactions.push(
                Transaction::register_delegate(&kp.public_key, username, 0, self.timestamp).signed(kp),
            );
        }
        for (kp, _, _) in &self.delegates {
            let votes = vec![VoteEntry::Add(kp.public_key.clone())];
            transactions.push(Transaction::vote(&kp.public_key, votes, 0, self.timestamp).signed(kp));
        }

        Block::genesis(generator, self.timestamp, transactions)
    }
}

/// Deterministic delegate keypairs, for tests and local networks.
pub fn dev_delegates(count: usize) -> Vec<Keypair> {
    (0..count)
        .map(|i| Keypair::from_passphrase(&format!("dposchain dev delegate {}", i)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dposchain_core::{Asset, COIN};

    #[test]
    fn test_genesis_layout() {
        let delegates = dev_delegates(3);
        let mut builder = GenesisBuilder::new(Keypair::from_passphrase("genesis"));
        for (i, kp) in delegates.iter().enumerate() {
            builder = builder.delegate(kp.clone(), &format!("genesis_{}", i), 100 * COIN);
        }
        let block = builder.account(Address::from_bytes([7u8; 20]), COIN).build();

        assert!(block.is_genesis());
        assert!(block.verify_signature());
        assert_eq!(block.tx_count(), 4 + 3 + 3);
        assert!(block.transactions[..4]
            .iter()
            .all(|tx| matches!(tx.asset, Asset::Transfer)));
        assert!(matches!(block.transactions[4].asset, Asset::Delegate { .. }));
        assert!(matches!(block.transactions[9].asset, Asset::Vote { .. }));
        assert_eq!(block.header.total_amount, 301 * COIN);
        assert_eq!(block.header.total_fee, 0);
    }

    #[test]
    fn test_dev_delegates_are_stable() {
        assert_eq!(dev_delegates(2)[1].public_key, dev_delegates(5)[1].public_key);
    }
}
