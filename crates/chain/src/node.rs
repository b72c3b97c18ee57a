//! The async node surface.
//!
//! [`Node`] wraps a [`Chain`] and routes every ledger mutation through one
//! of two [`Sequence`]s: `balances` for transaction intake and `default` for
//! blocks, forks and pool ticks. A fatal error halts the node until restart.

use crate::blockchain::{Chain, ChainConfig, ChainError, ProcessOutcome};
use crate::fork::ForkOutcome;
use crate::mempool::PoolList;
use crate::sequence::{Sequence, SequenceError};
use crate::transport::{fetch_with_retry, PeerClient, RetryPolicy, TransportError};
use dposchain_consensus::{unix_now, BlockForger, Classify, ErrorClass};
use dposchain_core::{Block, PublicKey, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Blocks requested per sync round trip.
const SYNC_BATCH: usize = 100;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node halted after a fatal error")]
    Halted,

    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("sequence error: {0}")]
    Sequence(#[from] SequenceError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl Classify for NodeError {
    fn class(&self) -> ErrorClass {
        match self {
            NodeError::Halted | NodeError::Sequence(_) => ErrorClass::Fatal,
            NodeError::Chain(err) => err.class(),
            NodeError::Transport(err) => err.class(),
        }
    }
}

pub type Result<T> = std::result::Result<T, NodeError>;

/// Node configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub chain: ChainConfig,
    /// Queue depth past which a sequence logs a backpressure warning.
    pub sequence_warn_depth: usize,
    pub peer_request_timeout_ms: u64,
    pub peer_retry_backoff_ms: u64,
    pub pool_tick_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            chain: ChainConfig::default(),
            sequence_warn_depth: 1000,
            peer_request_timeout_ms: 5000,
            peer_retry_backoff_ms: 1000,
            pool_tick_ms: 5000,
        }
    }
}

impl NodeConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_millis(self.peer_request_timeout_ms, self.peer_retry_backoff_ms)
    }
}

type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

/// A running full node.
pub struct Node {
    config: NodeConfig,
    chain: Arc<Mutex<Chain>>,
    balances: Sequence,
    default: Sequence,
    halted: Arc<AtomicBool>,
    strikes: Mutex<HashMap<String, u32>>,
    relay: broadcast::Sender<Transaction>,
    clock: Clock,
}

impl Node {
    /// Start a node on the system clock. Must be called inside a tokio
    /// runtime.
    pub fn new(chain: Chain, config: NodeConfig) -> Self {
        Self::with_clock(chain, config, Arc::new(unix_now))
    }

    /// Start a node reading unix time from `clock`.
    pub fn with_clock(chain: Chain, config: NodeConfig, clock: Clock) -> Self {
        let (relay, _) = broadcast::channel(1024);
        Self {
            balances: Sequence::spawn("balances", config.sequence_warn_depth),
            default: Sequence::spawn("default", config.sequence_warn_depth),
            chain: Arc::new(Mutex::new(chain)),
            halted: Arc::new(AtomicBool::new(false)),
            strikes: Mutex::new(HashMap::new()),
            relay,
            config,
            clock,
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Times `peer` sent data that conflicted with chain state.
    pub fn strikes(&self, peer: &str) -> u32 {
        self.strikes
            .lock()
            .map(|strikes| strikes.get(peer).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Transactions accepted with `broadcast` set, for the relay layer.
    pub fn subscribe_transactions(&self) -> broadcast::Receiver<Transaction> {
        self.relay.subscribe()
    }

    /// Run `job` against the chain on `sequence`, halting on fatal errors.
    async fn on<T, F>(&self, sequence: &Sequence, job: F) -> Result<T>
    where
        F: FnOnce(&mut Chain, u64) -> std::result::Result<T, ChainError> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_halted() {
            return Err(NodeError::Halted);
        }
        let chain = self.chain.clone();
        let halted = self.halted.clone();
        let now = (self.clock)();
        let result = sequence
            .run(move || {
                if halted.load(Ordering::SeqCst) {
                    return Err(NodeError::Halted);
                }
                let mut chain = lock(&chain)?;
                job(&mut chain, now).map_err(NodeError::from)
            })
            .await;
        match result {
            Ok(inner) => self.check(inner),
            Err(err) => self.check(Err(err.into())),
        }
    }

    fn check<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.class().is_fatal() && !self.halted.swap(true, Ordering::SeqCst) {
                error!(error = %err, "Fatal error, node halted");
            }
        }
        result
    }

    fn strike(&self, peer: &str, err: &ChainError) {
        if !err.class().penalizes_peer() {
            return;
        }
        if let Ok(mut strikes) = self.strikes.lock() {
            let count = strikes.entry(peer.to_string()).or_insert(0);
            *count += 1;
            warn!(peer, strikes = *count, error = %err, "Peer sent conflicting data");
        }
    }

    /// Handle a block received from `peer`, or produced locally when `peer`
    /// is `None`.
    pub async fn process_received_block(&self, block: Block, peer: Option<&str>) -> Result<ProcessOutcome> {
        let outcome = self
            .on(&self.default, move |chain, now| chain.process_received_block(block, now))
            .await?;
        if let (ProcessOutcome::Rejected(err), Some(peer)) = (&outcome, peer) {
            self.strike(peer, err);
        }
        Ok(outcome)
    }

    /// Admit transactions to the pool. With `broadcast` set, accepted
    /// transactions are handed to relay subscribers.
    pub async fn receive_transactions(
        &self,
        transactions: Vec<Transaction>,
        peer: Option<&str>,
        broadcast: bool,
    ) -> Result<Vec<std::result::Result<PoolList, ChainError>>> {
        let submitted = transactions.clone();
        let results = self
            .on(&self.balances, move |chain, now| {
                let mut checked = Vec::with_capacity(transactions.len());
                for result in chain.receive_transactions(transactions, now) {
                    match result {
                        Err(err) if err.class().is_fatal() => return Err(err),
                        other => checked.push(other),
                    }
                }
                Ok(checked)
            })
            .await?;

        for (tx, result) in submitted.into_iter().zip(&results) {
            match result {
                Ok(_) if broadcast => {
                    // No subscribers is fine.
                    let _ = self.relay.send(tx);
                }
                Ok(_) => {}
                Err(err) => {
                    debug!(id = %tx.id(), error = %err, "Transaction not admitted");
                    if let Some(peer) = peer {
                        self.strike(peer, err);
                    }
                }
            }
        }
        Ok(results)
    }

    /// Expire old pool entries and apply queued transactions.
    pub async fn fill_pool(&self) -> Result<usize> {
        self.on(&self.default, |chain, now| chain.fill_pool(now)).await
    }

    /// Ordered forgers of the round containing `height`.
    pub async fn get_delegate_list(&self, height: u64) -> Result<Vec<PublicKey>> {
        self.on(&self.default, move |chain, _| chain.get_delegate_list(height))
            .await
    }

    pub async fn resolve_fork(&self, branch: Vec<Block>) -> Result<ForkOutcome> {
        self.on(&self.default, move |chain, now| chain.resolve_fork(branch, now))
            .await
    }

    /// Forge in the current slot if `forger` holds its delegate.
    pub async fn forge(&self, forger: Arc<BlockForger>) -> Result<Option<Block>> {
        self.on(&self.default, move |chain, now| chain.forge(&forger, now))
            .await
    }

    /// Pull blocks from `peer` until it has nothing past our tip. Returns how
    /// many blocks were accepted.
    pub async fn sync_from<P: PeerClient + ?Sized>(&self, peer: &P) -> Result<usize> {
        let policy = self.config.retry_policy();
        let mut accepted = 0;
        loop {
            let height = self.on(&self.default, |chain, _| chain.tip()).await?.height;
            let blocks = fetch_with_retry(peer.id(), policy, || peer.blocks_from(height + 1, SYNC_BATCH)).await?;
            if blocks.is_empty() {
                break;
            }
            for block in blocks {
                match self.process_received_block(block, Some(peer.id())).await? {
                    ProcessOutcome::Accepted(_) => accepted += 1,
                    outcome => {
                        info!(peer = peer.id(), accepted, ?outcome, "Stopped syncing");
                        return Ok(accepted);
                    }
                }
            }
        }
        if accepted > 0 {
            info!(peer = peer.id(), accepted, "Synced blocks from peer");
        }
        Ok(accepted)
    }

    /// Fill the pool every `pool_tick_ms` until the node halts.
    pub fn spawn_pool_ticker(self: &Arc<Self>) -> JoinHandle<()> {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(node.config.pool_tick_ms));
            loop {
                ticker.tick().await;
                if node.is_halted() {
                    break;
                }
                if let Err(err) = node.fill_pool().await {
                    warn!(error = %err, "Pool tick failed");
                }
            }
        })
    }
}

fn lock(chain: &Mutex<Chain>) -> Result<MutexGuard<'_, Chain>> {
    // A poisoned lock means a job panicked mid-mutation.
    chain.lock().map_err(|_| NodeError::Halted)
}
