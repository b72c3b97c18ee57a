//! Fork classification and resolution.
//!
//! Resolution always walks back to the common ancestor one block at a time
//! and then applies the winning branch in order. If the branch fails part
//! way, the original blocks are re-applied so the node never ends up with
//! neither chain.

use crate::blocks::BlockError;
use dposchain_consensus::{Classify, ErrorClass};
use dposchain_core::{Block, Hash};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

/// Errors that can occur while resolving a fork.
#[derive(Debug, Error)]
pub enum ForkError {
    #[error("empty branch")]
    EmptyBranch,

    #[error("branch is not contiguous at height {0}")]
    NotContiguous(u64),

    #[error("branch does not attach to the local chain (parent {0})")]
    UnknownAncestor(Hash),

    #[error("fork is {depth} blocks deep (max {max})")]
    TooDeep { depth: u64, max: u64 },

    #[error("branch block at height {height} rejected: {source}")]
    BranchRejected { height: u64, source: BlockError },

    #[error("failed to restore the original chain: {0}")]
    RestoreFailed(BlockError),

    #[error(transparent)]
    Block(#[from] BlockError),
}

impl Classify for ForkError {
    fn class(&self) -> ErrorClass {
        match self {
            ForkError::EmptyBranch | ForkError::NotContiguous(_) | ForkError::UnknownAncestor(_) => {
                ErrorClass::Malformed
            }
            ForkError::TooDeep { .. } => ErrorClass::Consistency,
            ForkError::BranchRejected { source, .. } => source.class(),
            ForkError::RestoreFailed(_) => ErrorClass::Fatal,
            ForkError::Block(err) => err.class(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ForkError>;

/// How an incoming block diverges from the local chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForkKind {
    /// Same height and parent as the tip, different id.
    CompetingBlock,
    /// Next height, but its parent is not the tip.
    DivergentParent,
    /// More than one block ahead of the tip.
    AheadOfTip,
    /// Below the tip, within the rollback window.
    Stale,
}

/// Where an incoming block sits relative to the local chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRelation {
    Known,
    Extends,
    Fork(ForkKind),
}

/// Outcome of [`ForkResolver::resolve_fork`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForkOutcome {
    /// The branch already is the local chain.
    NoChange,
    /// The local chain is preferred over the branch.
    LocalPreferred,
    /// The local chain was replaced from the common ancestor.
    Switched {
        ancestor_height: u64,
        rolled_back: usize,
        applied: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkConfig {
    /// Deepest rollback a fork may require.
    pub max_rollback_depth: u64,
}

impl Default for ForkConfig {
    fn default() -> Self {
        Self {
            max_rollback_depth: 202,
        }
    }
}

/// Chain operations fork resolution drives.
pub trait ChainOps {
    fn tip_block(&self) -> std::result::Result<Block, BlockError>;

    /// Block at `height` on the local chain.
    fn block_at(&self, height: u64) -> std::result::Result<Option<Block>, BlockError>;

    fn contains_block(&self, id: &Hash) -> std::result::Result<bool, BlockError>;

    /// Remove the tip and return it.
    fn undo_block(&mut self) -> std::result::Result<Block, BlockError>;

    /// Fully verify and commit a block extending the tip.
    fn apply_block(&mut self, block: Block) -> std::result::Result<(), BlockError>;
}

#[derive(Debug, Clone, Default)]
pub struct ForkResolver {
    config: ForkConfig,
}

impl ForkResolver {
    pub fn new(config: ForkConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ForkConfig {
        &self.config
    }

    /// Classify an incoming block against the local chain.
    pub fn classify<C: ChainOps>(&self, block: &Block, chain: &C) -> Result<BlockRelation> {
        if chain.contains_block(&block.id())? {
            return Ok(BlockRelation::Known);
        }
        let tip = chain.tip_block()?;
        let height = block.height();
        let tip_height = tip.height();

        if height == tip_height + 1 {
            if block.previous_block_id() == tip.id() {
                return Ok(BlockRelation::Extends);
            }
            return Ok(BlockRelation::Fork(ForkKind::DivergentParent));
        }
        if height > tip_height + 1 {
            return Ok(BlockRelation::Fork(ForkKind::AheadOfTip));
        }

        let depth = tip_height - height;
        if depth >= self.config.max_rollback_depth {
            return Err(ForkError::TooDeep {
                depth,
                max: self.config.max_rollback_depth,
            });
        }
        if height == tip_height && block.previous_block_id() == tip.previous_block_id() {
            return Ok(BlockRelation::Fork(ForkKind::CompetingBlock));
        }
        Ok(BlockRelation::Fork(ForkKind::Stale))
    }

    /// Whether a block competing with the tip at the same height replaces
    /// it. The smaller id wins.
    pub fn competing_wins(incoming: &Block, local: &Block) -> bool {
        incoming.id().as_bytes() < local.id().as_bytes()
    }

    /// Switch to `branch` if it beats the local chain.
    ///
    /// `branch` must be contiguous and its first block's parent must be on
    /// the local chain within the rollback window. Blocks the local chain
    /// already holds are skipped, so resolving the same branch twice changes
    /// nothing the second time.
    pub fn resolve_fork<C: ChainOps>(&self, chain: &mut C, branch: Vec<Block>) -> Result<ForkOutcome> {
        let first = branch.first().ok_or(ForkError::EmptyBranch)?;
        for pair in branch.windows(2) {
            if pair[1].previous_block_id() != pair[0].id() || pair[1].height() != pair[0].height() + 1 {
                return Err(ForkError::NotContiguous(pair[1].height()));
            }
        }
        if first.height() == 0 {
            return Err(ForkError::UnknownAncestor(first.previous_block_id()));
        }
        chain
            .block_at(first.height() - 1)?
            .filter(|block| block.id() == first.previous_block_id())
            .ok_or(ForkError::UnknownAncestor(first.previous_block_id()))?;

        // Skip the prefix the local chain already has.
        let mut new_blocks = Vec::new();
        for block in branch {
            let local = chain.block_at(block.height())?;
            if new_blocks.is_empty() && local.map(|b| b.id()) == Some(block.id()) {
                continue;
            }
            new_blocks.push(block);
        }
        let Some(first_new) = new_blocks.first() else {
            return Ok(ForkOutcome::NoChange);
        };
        let ancestor_height = first_new.height() - 1;

        let tip = chain.tip_block()?;
        let depth = tip.height().saturating_sub(ancestor_height);
        if depth > self.config.max_rollback_depth {
            return Err(ForkError::TooDeep {
                depth,
                max: self.config.max_rollback_depth,
            });
        }
        let Some(branch_tip) = new_blocks.last() else {
            return Ok(ForkOutcome::NoChange);
        };
        let branch_wins = branch_tip.height() > tip.height()
            || (branch_tip.height() == tip.height()
                && branch_tip.id().as_bytes() < tip.id().as_bytes());
        if !branch_wins {
            info!(
                local_height = tip.height(),
                branch_height = branch_tip.height(),
                "Keeping local chain over fork"
            );
            return Ok(ForkOutcome::LocalPreferred);
        }

        info!(
            ancestor_height,
            depth,
            branch = new_blocks.len(),
            "Switching to fork"
        );
        let mut removed = Vec::new();
        while chain.tip_block()?.height() > ancestor_height {
            removed.push(chain.undo_block()?);
        }
        removed.reverse();

        let mut applied = 0;
        for block in new_blocks {
            let height = block.height();
            if let Err(source) = chain.apply_block(block) {
                warn!(height, error = %source, "Fork branch rejected, restoring local chain");
                self.restore(chain, ancestor_height, removed)?;
                return Err(ForkError::BranchRejected { height, source });
            }
            applied += 1;
        }

        Ok(ForkOutcome::Switched {
            ancestor_height,
            rolled_back: removed.len(),
            applied,
        })
    }

    fn restore<C: ChainOps>(&self, chain: &mut C, ancestor_height: u64, original: Vec<Block>) -> Result<()> {
        let outcome = (|| -> std::result::Result<(), BlockError> {
            while chain.tip_block()?.height() > ancestor_height {
                chain.undo_block()?;
            }
            for block in original {
                chain.apply_block(block)?;
            }
            Ok(())
        })();
        outcome.map_err(|err| {
            error!(error = %err, "Could not restore original chain");
            ForkError::RestoreFailed(err)
        })
    }
}
