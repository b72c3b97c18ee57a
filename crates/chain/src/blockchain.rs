//! Main chain orchestration.
//!
//! [`Chain`] owns the block processor, the transaction pool and the fork
//! resolver and keeps them consistent: every commit or rollback is followed
//! by the matching pool update before anything else can run.

use crate::blocks::{BlockError, BlockProcessor, Committed};
use crate::fork::{BlockRelation, ChainOps, ForkConfig, ForkError, ForkKind, ForkOutcome, ForkResolver};
use crate::mempool::{PoolConfig, PoolError, PoolList, PoolStats, TransactionPool};
use crate::processor::{TransactionError, TxContext};
use dposchain_consensus::{BlockForger, Classify, ConsensusError, ErrorClass, SlotClock};
use dposchain_core::{Block, ChainConstants, ConfigError, Hash, PublicKey, Signature, Transaction};
use dposchain_storage::{
    AccountStore, ChainReader, ChainStore, ChainTip, ScratchLedger, StorageError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that can occur during chain operations.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("block error: {0}")]
    Block(#[from] BlockError),

    #[error("fork error: {0}")]
    Fork(#[from] ForkError),

    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("consensus error: {0}")]
    Consensus(#[from] ConsensusError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("chain already initialized")]
    AlreadyInitialized,
}

impl Classify for ChainError {
    fn class(&self) -> ErrorClass {
        match self {
            ChainError::Block(err) => err.class(),
            ChainError::Fork(err) => err.class(),
            ChainError::Pool(err) => err.class(),
            ChainError::Consensus(err) => err.class(),
            ChainError::Storage(err) => err.class(),
            ChainError::Config(_) => ErrorClass::Fatal,
            ChainError::AlreadyInitialized => ErrorClass::Consistency,
        }
    }
}

pub type Result<T> = std::result::Result<T, ChainError>;

/// Chain configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    pub constants: ChainConstants,
    pub pool: PoolConfig,
    pub fork: ForkConfig,
}

/// What happened to a received block.
#[derive(Debug)]
pub enum ProcessOutcome {
    Accepted(ChainTip),
    Forked(ForkKind),
    Rejected(ChainError),
}

impl ProcessOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ProcessOutcome::Accepted(_))
    }
}

/// Chain statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainStats {
    pub height: u64,
    pub tip: Hash,
    pub round: u64,
    pub pool: PoolStats,
}

/// Orchestrates block processing, the pool and fork handling.
pub struct Chain {
    config: ChainConfig,
    blocks: BlockProcessor,
    pool: TransactionPool,
    forks: ForkResolver,
}

impl Chain {
    /// Open a chain over `store`. Unconfirmed account state is reset to the
    /// confirmed state, since the pool that produced it did not survive.
    pub fn open(store: ChainStore, config: ChainConfig) -> Result<Self> {
        config.constants.validate()?;
        if store.is_initialized()? {
            let reset = store.accounts().reset_unconfirmed()?;
            info!(height = store.height()?, reset, "Opened chain");
        }
        let blocks = BlockProcessor::new(store, config.constants.clone());
        let pool = TransactionPool::with_config(blocks.transactions().clone(), config.pool.clone());
        let forks = ForkResolver::new(config.fork.clone());
        Ok(Self {
            config,
            blocks,
            pool,
            forks,
        })
    }

    pub fn init_genesis(&mut self, genesis: &Block) -> Result<ChainTip> {
        if self.store().is_initialized()? {
            return Err(ChainError::AlreadyInitialized);
        }
        Ok(self.blocks.commit_genesis(genesis)?)
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn constants(&self) -> &ChainConstants {
        &self.config.constants
    }

    pub fn store(&self) -> &ChainStore {
        self.blocks.store()
    }

    pub fn pool(&self) -> &TransactionPool {
        &self.pool
    }

    pub fn clock(&self) -> &SlotClock {
        self.blocks.validator().clock()
    }

    pub fn tip(&self) -> Result<ChainTip> {
        Ok(self.blocks.tip()?)
    }

    pub fn latest_block(&self) -> Result<Block> {
        self.store()
            .latest_block()?
            .ok_or(ChainError::Block(BlockError::NotInitialized))
    }

    pub fn stats(&self) -> Result<ChainStats> {
        let tip = self.tip()?;
        Ok(ChainStats {
            height: tip.height,
            tip: tip.id,
            round: self.constants().round_of(tip.height),
            pool: self.pool.stats(),
        })
    }

    /// Ordered forgers of the round containing `height`.
    pub fn get_delegate_list(&mut self, height: u64) -> Result<Vec<PublicKey>> {
        Ok(self.blocks.forgers_at(height)?)
    }

    /// Handle a block from a peer. Only fatal failures are returned as
    /// errors; every other rejection is reported in the outcome.
    pub fn process_received_block(&mut self, block: Block, unix_now: u64) -> Result<ProcessOutcome> {
        let id = block.id();
        let height = block.height();
        let forks = self.forks.clone();
        let relation = match forks.classify(&block, &ChainAt::new(self, unix_now)) {
            Ok(relation) => relation,
            Err(err) => return self.rejected(err.into(), id, height),
        };

        match relation {
            BlockRelation::Known => {
                debug!(height, id = %id, "Ignoring known block");
                Ok(ProcessOutcome::Rejected(BlockError::AlreadyKnown(id).into()))
            }
            BlockRelation::Extends => match self.apply_block(block, unix_now) {
                Ok(committed) => Ok(ProcessOutcome::Accepted(committed.tip)),
                Err(err) => self.rejected(err.into(), id, height),
            },
            BlockRelation::Fork(ForkKind::CompetingBlock) => {
                self.handle_competing(block, unix_now)
            }
            BlockRelation::Fork(kind) => {
                info!(height, id = %id, ?kind, "Received block off the local chain");
                Ok(ProcessOutcome::Forked(kind))
            }
        }
    }

    fn handle_competing(&mut self, block: Block, unix_now: u64) -> Result<ProcessOutcome> {
        let id = block.id();
        let height = block.height();
        let local = self.latest_block()?;
        let parent = self
            .store()
            .block(&block.previous_block_id())?
            .ok_or(BlockError::UnknownParent(block.previous_block_id()))?;
        if let Err(err) = self.blocks.validator().validate_received(&block, &parent) {
            return self.rejected(err.into(), id, height);
        }
        if !ForkResolver::competing_wins(&block, &local) {
            info!(height, id = %id, local = %local.id(), "Competing block loses to local tip");
            return Ok(ProcessOutcome::Forked(ForkKind::CompetingBlock));
        }

        info!(height, id = %id, local = %local.id(), "Competing block wins, replacing tip");
        match self.resolve_fork(vec![block], unix_now) {
            Ok(_) => Ok(ProcessOutcome::Forked(ForkKind::CompetingBlock)),
            Err(err) => self.rejected(err, id, height),
        }
    }

    fn rejected(&self, err: ChainError, id: Hash, height: u64) -> Result<ProcessOutcome> {
        if err.class().is_fatal() {
            return Err(err);
        }
        warn!(height, id = %id, class = ?err.class(), error = %err, "Rejected block");
        Ok(ProcessOutcome::Rejected(err))
    }

    /// Switch to `branch` if it beats the local chain.
    pub fn resolve_fork(&mut self, branch: Vec<Block>, unix_now: u64) -> Result<ForkOutcome> {
        let forks = self.forks.clone();
        Ok(forks.resolve_fork(&mut ChainAt::new(self, unix_now), branch)?)
    }

    /// Admit transactions to the pool. One result per transaction.
    pub fn receive_transactions(
        &mut self,
        transactions: Vec<Transaction>,
        unix_now: u64,
    ) -> Vec<Result<PoolList>> {
        let ctx = self.pool_context(unix_now);
        let now = ctx.timestamp_limit;
        let accounts = self.blocks.store().accounts();
        let mut results = Vec::with_capacity(transactions.len());
        for tx in transactions {
            let id = tx.id();
            let result = match self.blocks.store().has_transaction(&id) {
                Ok(true) => Err(PoolError::from(TransactionError::AlreadyConfirmed(id)).into()),
                Ok(false) => self.pool.add(tx, &ctx, &accounts, now).map_err(ChainError::from),
                Err(err) => Err(err.into()),
            };
            results.push(result);
        }
        results
    }

    /// Attach a member signature to a pending multisignature transaction.
    pub fn add_signature(&mut self, id: &Hash, public_key: PublicKey, signature: Signature) -> Result<bool> {
        let accounts = self.store().accounts();
        Ok(self.pool.add_signature(id, public_key, signature, &accounts)?)
    }

    /// Expire old pool entries and move queued transactions into the
    /// unconfirmed state. Returns how many were applied.
    pub fn fill_pool(&mut self, unix_now: u64) -> Result<usize> {
        let ctx = self.pool_context(unix_now);
        let mut scratch = ScratchLedger::new(self.store().accounts());
        let expired = self.pool.expire(ctx.timestamp_limit, &mut scratch)?;
        let applied = self.pool.fill(&ctx, &mut scratch)?;
        let ops = AccountStore::write_ops(scratch.changes().values())?;
        self.store().storage().batch(ops)?;
        if applied > 0 || !expired.is_empty() {
            debug!(applied, expired = expired.len(), "Filled pool");
        }
        Ok(applied)
    }

    /// Forge a block if one of `forger`'s delegates owns the current slot.
    pub fn forge(&mut self, forger: &BlockForger, unix_now: u64) -> Result<Option<Block>> {
        let tip = self.latest_block()?;
        let timestamp = self.clock().timestamp(unix_now);
        let slot = self.clock().slot_of(timestamp);
        if !tip.is_genesis() && slot <= self.clock().slot_of(tip.header.timestamp) {
            return Ok(None);
        }
        let forgers = self.get_delegate_list(tip.height() + 1)?;
        if forger.keypair_for_slot(&forgers, timestamp).is_none() {
            return Ok(None);
        }
        let block = self.blocks.forge(forger, &self.pool, timestamp)?;
        self.apply_block(block.clone(), unix_now)?;
        Ok(Some(block))
    }

    /// Remove the tip block and return its transactions to the pool.
    pub fn undo_tip(&mut self, unix_now: u64) -> Result<Block> {
        Ok(self.undo_block(unix_now)?)
    }

    fn apply_block(&mut self, block: Block, unix_now: u64) -> std::result::Result<Committed, BlockError> {
        let committed = self.blocks.process_block(block, &self.pool, unix_now)?;
        self.pool.remove(&committed.confirmed);
        self.pool.remove(&committed.pool_dropped);
        Ok(committed)
    }

    fn undo_block(&mut self, unix_now: u64) -> std::result::Result<Block, BlockError> {
        let timestamp = self.clock().timestamp(unix_now);
        let rolled_back = self.blocks.undo_tip(&self.pool, timestamp)?;
        self.pool.remove(&rolled_back.pool_dropped);
        self.pool.requeue(rolled_back.block.transactions.clone(), timestamp);
        Ok(rolled_back.block)
    }

    fn pool_context(&self, unix_now: u64) -> TxContext {
        let height = self.store().height().unwrap_or(0) + 1;
        TxContext {
            height,
            timestamp_limit: self.clock().timestamp(unix_now),
        }
    }
}

/// The chain at a fixed wall-clock time, as seen by fork resolution.
struct ChainAt<'a> {
    chain: &'a mut Chain,
    unix_now: u64,
}

impl<'a> ChainAt<'a> {
    fn new(chain: &'a mut Chain, unix_now: u64) -> Self {
        Self { chain, unix_now }
    }
}

impl ChainOps for ChainAt<'_> {
    fn tip_block(&self) -> std::result::Result<Block, BlockError> {
        self.chain
            .store()
            .latest_block()?
            .ok_or(BlockError::NotInitialized)
    }

    fn block_at(&self, height: u64) -> std::result::Result<Option<Block>, BlockError> {
        Ok(ChainReader::block_at(self.chain.store(), height)?)
    }

    fn contains_block(&self, id: &Hash) -> std::result::Result<bool, BlockError> {
        Ok(self.chain.store().has_block(id)?)
    }

    fn undo_block(&mut self) -> std::result::Result<Block, BlockError> {
        self.chain.undo_block(self.unix_now)
    }

    fn apply_block(&mut self, block: Block) -> std::result::Result<(), BlockError> {
        self.chain.apply_block(block, self.unix_now).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genesis::{dev_delegates, GenesisBuilder};
    use dposchain_core::{Account, Address, Keypair, VoteEntry, COIN};
    use dposchain_storage::{LedgerReader, Storage};

    const EPOCH: u64 = 1_000_000;

    fn config() -> ChainConfig {
        ChainConfig {
            constants: ChainConstants {
                active_delegates: 3,
                epoch_time: EPOCH,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn setup() -> (Chain, BlockForger, Keypair) {
        let delegates = dev_delegates(3);
        let whale = Keypair::from_passphrase("whale");
        let mut builder = GenesisBuilder::new(Keypair::from_passphrase("genesis"))
            .account(whale.address(), 1_000 * COIN);
        for (i, kp) in delegates.iter().enumerate() {
            builder = builder.delegate(kp.clone(), &format!("delegate_{}", i), 100 * COIN);
        }
        let store = ChainStore::new(Storage::open_temporary().unwrap());
        let mut chain = Chain::open(store, config()).unwrap();
        chain.init_genesis(&builder.build()).unwrap();
        let forger = BlockForger::new(delegates, config().constants);
        (chain, forger, whale)
    }

    #[test]
    fn test_genesis_state() {
        let (mut chain, _, whale) = setup();
        assert_eq!(chain.tip().unwrap().height, 0);
        let account = chain.store().accounts().account(&whale.address()).unwrap().unwrap();
        assert_eq!(account.balance(), 1_000 * COIN);
        assert_eq!(chain.get_delegate_list(1).unwrap().len(), 3);
        let genesis = chain.latest_block().unwrap();
        assert!(matches!(chain.init_genesis(&genesis), Err(ChainError::AlreadyInitialized)));
    }

    #[test]
    fn test_transactions_flow_into_a_forged_block() {
        let (mut chain, forger, whale) = setup();
        let recipient = Address::from_bytes([5u8; 20]);
        let tx = Transaction::transfer(&whale.public_key, recipient, 10 * COIN, COIN / 10, 0).signed(&whale);
        let results = chain.receive_transactions(vec![tx.clone()], EPOCH + 5);
        assert_eq!(results[0].as_ref().unwrap(), &PoolList::Queued);
        assert_eq!(chain.fill_pool(EPOCH + 5).unwrap(), 1);

        let block = chain.forge(&forger, EPOCH + 10).unwrap().unwrap();
        assert_eq!(block.transactions, vec![tx.clone()]);
        assert!(chain.pool().is_empty());

        let accounts = chain.store().accounts();
        assert_eq!(accounts.account(&recipient).unwrap().unwrap().balance(), 10 * COIN);
        let sender = accounts.account(&whale.address()).unwrap().unwrap();
        assert_eq!(sender.balance(), sender.unconfirmed_balance());

        let again = chain.receive_transactions(vec![tx], EPOCH + 15);
        assert!(matches!(
            again[0],
            Err(ChainError::Pool(PoolError::Transaction(TransactionError::AlreadyConfirmed(_))))
        ));
    }

    #[test]
    fn test_forge_only_in_own_slot_once() {
        let (mut chain, forger, _) = setup();
        assert!(chain.forge(&forger, EPOCH + 10).unwrap().is_some());
        assert!(chain.forge(&forger, EPOCH + 12).unwrap().is_none());
        let lonely = BlockForger::new(vec![Keypair::from_passphrase("nobody")], config().constants);
        assert!(chain.forge(&lonely, EPOCH + 20).unwrap().is_none());
    }

    #[test]
    fn test_undo_returns_transactions_to_pool() {
        let (mut chain, forger, whale) = setup();
        let tx = Transaction::transfer(&whale.public_key, Address::from_bytes([5u8; 20]), COIN, COIN / 10, 0)
            .signed(&whale);
        chain.receive_transactions(vec![tx.clone()], EPOCH);
        chain.fill_pool(EPOCH).unwrap();
        chain.forge(&forger, EPOCH + 10).unwrap().unwrap();

        let removed = chain.undo_tip(EPOCH + 11).unwrap();
        assert_eq!(removed.height(), 1);
        assert_eq!(chain.tip().unwrap().height, 0);
        assert_eq!(chain.pool().list_of(&tx.id()), Some(PoolList::Queued));
        let sender = chain.store().accounts().account(&whale.address()).unwrap().unwrap();
        assert_eq!(sender.balance(), 1_000 * COIN);
        assert_eq!(sender.unconfirmed_balance(), 1_000 * COIN);
    }

    #[test]
    fn test_known_block_rejected_without_penalty() {
        let (mut chain, forger, _) = setup();
        let block = chain.forge(&forger, EPOCH + 10).unwrap().unwrap();
        match chain.process_received_block(block, EPOCH + 11).unwrap() {
            ProcessOutcome::Rejected(err) => {
                assert!(matches!(err, ChainError::Block(BlockError::AlreadyKnown(_))));
                assert!(!err.class().penalizes_peer());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_reopen_resets_unconfirmed_state() {
        let (mut chain, _, whale) = setup();
        let tx = Transaction::transfer(&whale.public_key, Address::from_bytes([5u8; 20]), COIN, COIN / 10, 0)
            .signed(&whale);
        chain.receive_transactions(vec![tx], EPOCH);
        chain.fill_pool(EPOCH).unwrap();
        let store = chain.store().clone();
        let sender = store.accounts().account(&whale.address()).unwrap().unwrap();
        assert!(sender.unconfirmed_balance() < sender.balance());

        drop(chain);
        let reopened = Chain::open(store, config()).unwrap();
        let sender = reopened.store().accounts().account(&whale.address()).unwrap().unwrap();
        assert_eq!(sender.unconfirmed_balance(), sender.balance());
        assert!(reopened.pool().is_empty());
    }

    #[test]
    fn test_open_rejects_zero_delegates() {
        let store = ChainStore::new(Storage::open_temporary().unwrap());
        let mut config = config();
        config.constants.active_delegates = 0;
        assert!(matches!(Chain::open(store, config), Err(ChainError::Config(_))));
    }

    #[test]
    fn test_delegate_list_beyond_next_round_is_out_of_range() {
        let (mut chain, forger, _) = setup();
        assert_eq!(chain.get_delegate_list(3).unwrap().len(), 3);
        let err = chain.get_delegate_list(4).unwrap_err();
        assert!(matches!(
            err,
            ChainError::Block(BlockError::Consensus(ConsensusError::HeightOutOfRange {
                height: 4,
                max: 3
            }))
        ));
        assert_eq!(err.class(), ErrorClass::Malformed);

        for slot in 1..=3 {
            chain.forge(&forger, EPOCH + slot * 10).unwrap().unwrap();
        }
        // closing round 1 makes round 2 schedulable
        assert_eq!(chain.get_delegate_list(6).unwrap().len(), 3);
        assert!(chain.get_delegate_list(7).is_err());
    }

    #[test]
    fn test_pool_tick_drops_transactions_orphaned_by_expiry() {
        let (mut chain, _, whale) = setup();
        let bob = Keypair::from_passphrase("bob");
        let funding = Transaction::transfer(&whale.public_key, bob.address(), 10 * COIN, COIN / 10, 0)
            .signed(&whale);
        chain.receive_transactions(vec![funding], EPOCH + 5);
        assert_eq!(chain.fill_pool(EPOCH + 5).unwrap(), 1);
        let spend = Transaction::transfer(&bob.public_key, Address::from_bytes([6u8; 20]), 9 * COIN, COIN / 10, 5_000)
            .signed(&bob);
        chain.receive_transactions(vec![spend], EPOCH + 5_005);
        assert_eq!(chain.fill_pool(EPOCH + 5_005).unwrap(), 1);

        assert_eq!(chain.fill_pool(EPOCH + 10_805).unwrap(), 0);
        assert!(chain.pool().is_empty());
        let accounts = chain.store().accounts();
        let sender = accounts.account_or_default(&whale.address()).unwrap();
        assert_eq!(sender.unconfirmed_balance(), sender.balance());
        assert_eq!(accounts.account_or_default(&bob.address()).unwrap().unconfirmed_balance(), 0);
        assert_eq!(chain.fill_pool(EPOCH + 10_905).unwrap(), 0);
    }

    #[test]
    fn test_vote_added_then_removed_in_next_block() {
        let (mut chain, forger, whale) = setup();
        let delegate = dev_delegates(3)[0].public_key.clone();
        let add = Transaction::vote(&whale.public_key, vec![VoteEntry::Add(delegate.clone())], COIN, 0)
            .signed(&whale);
        chain.receive_transactions(vec![add], EPOCH + 5);
        chain.fill_pool(EPOCH + 5).unwrap();
        assert_eq!(chain.forge(&forger, EPOCH + 10).unwrap().unwrap().tx_count(), 1);
        let account = chain.store().accounts().account_or_default(&whale.address()).unwrap();
        assert!(account.confirmed.votes.contains(&delegate));

        let remove = Transaction::vote(&whale.public_key, vec![VoteEntry::Remove(delegate.clone())], COIN, 11)
            .signed(&whale);
        let results = chain.receive_transactions(vec![remove], EPOCH + 15);
        assert!(results[0].is_ok());
        assert_eq!(chain.fill_pool(EPOCH + 15).unwrap(), 1);
        assert_eq!(chain.forge(&forger, EPOCH + 20).unwrap().unwrap().tx_count(), 1);

        let account = chain.store().accounts().account_or_default(&whale.address()).unwrap();
        assert!(account.confirmed.votes.is_empty());
        assert!(account.unconfirmed.votes.is_empty());
    }

    fn snapshot(chain: &mut Chain, addresses: &[Address]) -> (ChainTip, Vec<Option<Account>>, Vec<PublicKey>) {
        let accounts = chain.store().accounts();
        let states = addresses
            .iter()
            .map(|address| accounts.account(address).unwrap())
            .collect();
        (chain.tip().unwrap(), states, chain.get_delegate_list(3).unwrap())
    }

    #[test]
    fn test_failed_fork_branch_restores_local_chain() {
        let (mut local, forger, whale) = setup();
        let recipient = Address::from_bytes([5u8; 20]);
        let tx = Transaction::transfer(&whale.public_key, recipient, 10 * COIN, COIN / 10, 0).signed(&whale);
        local.receive_transactions(vec![tx.clone()], EPOCH + 5);
        local.fill_pool(EPOCH + 5).unwrap();
        local.forge(&forger, EPOCH + 10).unwrap().unwrap();
        local.forge(&forger, EPOCH + 20).unwrap().unwrap();

        let mut addresses = vec![whale.address(), recipient];
        addresses.extend(dev_delegates(3).iter().map(Keypair::address));
        let before = snapshot(&mut local, &addresses);

        let (mut remote, _, _) = setup();
        let mut branch: Vec<Block> = (3..=5)
            .map(|slot| remote.forge(&forger, EPOCH + slot * 10).unwrap().unwrap())
            .collect();
        // breaks the generator signature of the last block only
        branch[2].header.total_fee += 1;
        let first_remote = branch[0].id();

        let err = local.resolve_fork(branch, EPOCH + 60).unwrap_err();
        assert!(matches!(
            err,
            ChainError::Fork(ForkError::BranchRejected { height: 3, .. })
        ));
        assert!(!err.class().is_fatal());

        assert_eq!(snapshot(&mut local, &addresses), before);
        assert!(!local.store().has_block(&first_remote).unwrap());
        assert!(local.pool().is_empty());
        let sender = local.store().accounts().account_or_default(&whale.address()).unwrap();
        assert_eq!(sender.unconfirmed_balance(), sender.balance());
    }
}
