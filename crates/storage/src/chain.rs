//! Block storage, transaction index, round records and the chain tip.

use crate::db::{BatchOp, Result, Storage, StorageError};
use crate::state::AccountStore;
use dposchain_core::{Account, Block, Hash, PublicKey, RoundSettlement, Transaction};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Key for the chain tip.
const CHAIN_TIP_KEY: &[u8] = b"chain:tip";

/// The block the chain currently ends at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTip {
    pub id: Hash,
    pub height: u64,
}

/// A confirmed transaction together with where it was included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTransaction {
    pub transaction: Transaction,
    pub block_id: Hash,
    pub height: u64,
}

/// Read access to committed chain data.
pub trait ChainReader {
    fn tip(&self) -> Result<Option<ChainTip>>;
    fn block(&self, id: &Hash) -> Result<Option<Block>>;
    fn block_id_at(&self, height: u64) -> Result<Option<Hash>>;
    fn transaction(&self, id: &Hash) -> Result<Option<StoredTransaction>>;
    fn settlement(&self, round: u64) -> Result<Option<RoundSettlement>>;
    /// Forger list persisted for `round`.
    fn forgers(&self, round: u64) -> Result<Option<Vec<PublicKey>>>;

    fn block_at(&self, height: u64) -> Result<Option<Block>> {
        match self.block_id_at(height)? {
            Some(id) => self.block(&id),
            None => Ok(None),
        }
    }

    fn has_transaction(&self, id: &Hash) -> Result<bool> {
        Ok(self.transaction(id)?.is_some())
    }

    fn height(&self) -> Result<u64> {
        Ok(self.tip()?.map(|tip| tip.height).unwrap_or(0))
    }
}

/// Everything committing one block writes, in a single batch.
#[derive(Debug, Clone)]
pub struct BlockCommit {
    pub block: Block,
    /// Accounts touched while applying the block.
    pub accounts: Vec<Account>,
    /// Present when the block closed a round.
    pub settlement: Option<RoundSettlement>,
    /// Forger list computed for the next round.
    pub next_forgers: Option<(u64, Vec<PublicKey>)>,
}

/// Everything rolling the tip back writes, in a single batch.
#[derive(Debug, Clone)]
pub struct BlockRollback {
    pub block: Block,
    /// Accounts with the block's effects undone.
    pub accounts: Vec<Account>,
    /// Round whose settlement record is dropped.
    pub settled_round: Option<u64>,
    /// Round whose persisted forger list is dropped.
    pub forgers_round: Option<u64>,
}

/// Manages block storage and chain state.
#[derive(Clone)]
pub struct ChainStore {
    storage: Storage,
}

impl ChainStore {
    /// Create a new ChainStore wrapping the given storage.
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Accounts as committed in the same database.
    pub fn accounts(&self) -> AccountStore {
        AccountStore::new(self.storage.clone())
    }

    /// Check if the chain is initialized (has a genesis block).
    pub fn is_initialized(&self) -> Result<bool> {
        Ok(self.tip()?.is_some())
    }

    pub fn has_block(&self, id: &Hash) -> Result<bool> {
        self.storage.contains(Storage::block_id_key(id))
    }

    /// Get the latest block.
    pub fn latest_block(&self) -> Result<Option<Block>> {
        match self.tip()? {
            Some(tip) => self.block(&tip.id),
            None => Ok(None),
        }
    }

    /// Commit a block and all of its effects atomically.
    ///
    /// A height-0 block is accepted only on an empty chain; any other block
    /// must extend the tip.
    pub fn commit_block(&self, commit: &BlockCommit) -> Result<()> {
        let block = &commit.block;
        let id = block.id();
        match self.tip()? {
            None if block.height() != 0 => {
                return Err(StorageError::InvalidGenesis(
                    "Genesis block must have height 0".into(),
                ))
            }
            Some(_) if block.height() == 0 => {
                return Err(StorageError::InvalidGenesis(
                    "Chain already initialized".into(),
                ))
            }
            Some(tip) if block.previous_block_id() != tip.id || block.height() != tip.height + 1 => {
                return Err(StorageError::Corrupted(format!(
                    "block {} at height {} does not extend tip {} at height {}",
                    id,
                    block.height(),
                    tip.id,
                    tip.height
                )))
            }
            _ => {}
        }

        let mut ops = AccountStore::write_ops(&commit.accounts)?;
        ops.push(BatchOp::put(Storage::block_id_key(&id), block)?);
        ops.push(BatchOp::put(Storage::block_height_key(block.height()), &id)?);
        for tx in &block.transactions {
            let stored = StoredTransaction {
                transaction: tx.clone(),
                block_id: id,
                height: block.height(),
            };
            ops.push(BatchOp::put(Storage::transaction_key(&tx.id()), &stored)?);
        }
        if let Some(settlement) = &commit.settlement {
            ops.push(BatchOp::put(
                Storage::settlement_key(settlement.round),
                settlement,
            )?);
        }
        if let Some((round, forgers)) = &commit.next_forgers {
            ops.push(BatchOp::put(Storage::forgers_key(*round), forgers)?);
        }
        let tip = ChainTip {
            id,
            height: block.height(),
        };
        ops.push(BatchOp::put(CHAIN_TIP_KEY.to_vec(), &tip)?);

        self.storage.batch(ops)?;
        debug!(height = tip.height, id = %id, "Stored block");
        Ok(())
    }

    /// Remove the tip block and restore its parent as tip atomically.
    pub fn rollback_block(&self, rollback: &BlockRollback) -> Result<ChainTip> {
        let block = &rollback.block;
        let id = block.id();
        let tip = self
            .tip()?
            .ok_or_else(|| StorageError::NotFound("chain tip".into()))?;
        if tip.id != id {
            return Err(StorageError::Corrupted(format!(
                "cannot roll back {} which is not the tip {}",
                id, tip.id
            )));
        }
        if block.height() == 0 {
            return Err(StorageError::InvalidGenesis(
                "Genesis block cannot be rolled back".into(),
            ));
        }

        let mut ops = AccountStore::write_ops(&rollback.accounts)?;
        ops.push(BatchOp::remove(Storage::block_id_key(&id)));
        ops.push(BatchOp::remove(Storage::block_height_key(block.height())));
        for tx in &block.transactions {
            ops.push(BatchOp::remove(Storage::transaction_key(&tx.id())));
        }
        if let Some(round) = rollback.settled_round {
            ops.push(BatchOp::remove(Storage::settlement_key(round)));
        }
        if let Some(round) = rollback.forgers_round {
            ops.push(BatchOp::remove(Storage::forgers_key(round)));
        }
        let parent = ChainTip {
            id: block.previous_block_id(),
            height: block.height() - 1,
        };
        ops.push(BatchOp::put(CHAIN_TIP_KEY.to_vec(), &parent)?);

        self.storage.batch(ops)?;
        debug!(height = block.height(), id = %id, "Removed block");
        Ok(parent)
    }

    /// Get blocks in a range [from_height, to_height].
    pub fn blocks_range(&self, from_height: u64, to_height: u64) -> Result<Vec<Block>> {
        let mut blocks = Vec::new();
        for height in from_height..=to_height {
            match self.block_at(height)? {
                Some(block) => blocks.push(block),
                None => break,
            }
        }
        Ok(blocks)
    }

    /// Get the last N blocks (most recent first).
    pub fn recent_blocks(&self, count: u64) -> Result<Vec<Block>> {
        let Some(tip) = self.tip()? else {
            return Ok(Vec::new());
        };
        if count == 0 {
            return Ok(Vec::new());
        }
        let from_height = tip.height.saturating_sub(count - 1);
        let mut blocks = self.blocks_range(from_height, tip.height)?;
        blocks.reverse();
        Ok(blocks)
    }
}

impl ChainReader for ChainStore {
    fn tip(&self) -> Result<Option<ChainTip>> {
        self.storage.get(CHAIN_TIP_KEY)
    }

    fn block(&self, id: &Hash) -> Result<Option<Block>> {
        self.storage.get(Storage::block_id_key(id))
    }

    fn block_id_at(&self, height: u64) -> Result<Option<Hash>> {
        self.storage.get(Storage::block_height_key(height))
    }

    fn transaction(&self, id: &Hash) -> Result<Option<StoredTransaction>> {
        self.storage.get(Storage::transaction_key(id))
    }

    fn settlement(&self, round: u64) -> Result<Option<RoundSettlement>> {
        self.storage.get(Storage::settlement_key(round))
    }

    fn forgers(&self, round: u64) -> Result<Option<Vec<PublicKey>>> {
        self.storage.get(Storage::forgers_key(round))
    }
}
