//! Round settlement.
//!
//! When the last block of a round is applied, every forger is paid its block
//! rewards and an equal share of the round's fees, vote totals and
//! productivity counters are refreshed, and the closing generator is noted.
//! The full change is returned as a [`RoundSettlement`] so that rolling the
//! closing block back subtracts exactly what was added.

use crate::error::{ConsensusError, Result};
use dposchain_core::{
    Block, ChainConstants, DelegateCredit, PublicKey, RoundSettlement, StatsChange,
};
use dposchain_storage::{BalanceKind, LedgerWriter, StorageError};
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

/// What settlement needs to know about one forged block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForgedBlock {
    pub generator: PublicKey,
    pub reward: u64,
    pub total_fee: u64,
}

impl From<&Block> for ForgedBlock {
    fn from(block: &Block) -> Self {
        Self {
            generator: block.generator().clone(),
            reward: block.header.reward,
            total_fee: block.header.total_fee,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoundAccountant {
    constants: ChainConstants,
}

impl RoundAccountant {
    pub fn new(constants: ChainConstants) -> Self {
        Self { constants }
    }

    /// Settle `round`. `blocks` are the round's blocks in height order, the
    /// closing block last; `scheduled` is the round's forger list.
    pub fn settle_round<L: LedgerWriter>(
        &self,
        round: u64,
        blocks: &[ForgedBlock],
        scheduled: &[PublicKey],
        ledger: &mut L,
    ) -> Result<RoundSettlement> {
        let closing = blocks.last().ok_or(ConsensusError::EmptyRound(round))?;
        let count = blocks.len() as u64;
        let total_fees: u64 = blocks.iter().map(|b| b.total_fee).sum();
        let total_rewards: u64 = blocks.iter().map(|b| b.reward).sum();
        let share = total_fees / count;
        let fee_remainder = total_fees - share * count;

        let credits = credits_for(blocks, share, fee_remainder, &closing.generator);
        for credit in &credits {
            let amount = credit.total();
            ledger.credit(&credit.address, amount, BalanceKind::Confirmed)?;
            ledger.credit(&credit.address, amount, BalanceKind::Unconfirmed)?;
        }

        let forged: BTreeMap<&PublicKey, u64> = blocks.iter().fold(BTreeMap::new(), |mut acc, b| {
            *acc.entry(&b.generator).or_insert(0) += 1;
            acc
        });
        let missed: BTreeSet<&PublicKey> = scheduled
            .iter()
            .filter(|key| !forged.contains_key(key))
            .collect();
        let credit_by_key: BTreeMap<&PublicKey, &DelegateCredit> =
            credits.iter().map(|c| (&c.public_key, c)).collect();
        let votes = vote_totals(&*ledger)?;

        let mut stats = Vec::new();
        for mut account in ledger.delegates()? {
            let Some(key) = account.confirmed.public_key.clone() else {
                continue;
            };
            let before = account.delegate.clone();
            let after = &mut account.delegate;
            after.vote = votes.get(&key).copied().unwrap_or(0);
            if let Some(blocks) = forged.get(&key) {
                after.produced_blocks += blocks;
                after.consecutive_missed_blocks = 0;
            } else if missed.contains(&key) {
                after.missed_blocks += 1;
                after.consecutive_missed_blocks += 1;
            }
            if let Some(credit) = credit_by_key.get(&key) {
                after.rewards = after.rewards.saturating_add(credit.reward);
                after.fees = after.fees.saturating_add(credit.fee);
            }
            if key == closing.generator {
                after.last_round_closed = Some(round);
            }
            after.vote_weight = after.weighted_vote();

            if account.delegate != before {
                stats.push(StatsChange {
                    address: account.address,
                    before,
                    after: account.delegate.clone(),
                });
                ledger.put_account(account)?;
            }
        }

        let settlement = RoundSettlement {
            round,
            blocks: count,
            total_fees,
            total_rewards,
            fee_remainder,
            credits,
            stats,
        };
        info!(
            round,
            blocks = count,
            total_fees,
            total_rewards,
            fee_remainder,
            missed = missed.len(),
            "Settled round"
        );
        Ok(settlement)
    }

    /// Undo a settlement. Delegate stats must still equal what settlement
    /// left behind; anything else means the ledger diverged.
    pub fn revert_round<L: LedgerWriter>(&self, settlement: &RoundSettlement, ledger: &mut L) -> Result<()> {
        for change in &settlement.stats {
            let mut account = ledger.account_or_default(&change.address)?;
            if account.delegate != change.after {
                let key = account
                    .confirmed
                    .public_key
                    .clone()
                    .ok_or_else(|| StorageError::Corrupted(format!("delegate {} has no key", change.address)))?;
                return Err(ConsensusError::SettlementMismatch(key));
            }
            account.delegate = change.before.clone();
            ledger.put_account(account)?;
        }

        for credit in &settlement.credits {
            let amount = credit.total();
            for kind in [BalanceKind::Confirmed, BalanceKind::Unconfirmed] {
                ledger
                    .debit(&credit.address, amount, kind)
                    .map_err(|err| match err {
                        StorageError::NegativeBalance { .. } => ConsensusError::CreditUnderflow {
                            delegate: credit.public_key.clone(),
                            amount,
                        },
                        other => other.into(),
                    })?;
            }
        }
        info!(round = settlement.round, "Reverted round settlement");
        Ok(())
    }

    /// Recompute every delegate's vote and vote weight from confirmed
    /// balances without touching productivity. Used once, for genesis state.
    pub fn refresh_votes<L: LedgerWriter>(&self, ledger: &mut L) -> Result<()> {
        let votes = vote_totals(&*ledger)?;
        for mut account in ledger.delegates()? {
            let Some(key) = &account.confirmed.public_key else {
                continue;
            };
            account.delegate.vote = votes.get(key).copied().unwrap_or(0);
            account.delegate.vote_weight = account.delegate.weighted_vote();
            ledger.put_account(account)?;
        }
        Ok(())
    }

    /// Whether the block at `height` triggers settlement.
    pub fn closes_round(&self, height: u64) -> bool {
        self.constants.is_round_end(height)
    }
}

/// Credits in order of first appearance; the remainder goes to `closer`.
fn credits_for(blocks: &[ForgedBlock], share: u64, remainder: u64, closer: &PublicKey) -> Vec<DelegateCredit> {
    let mut credits: Vec<DelegateCredit> = Vec::new();
    for block in blocks {
        let position = match credits.iter().position(|c| c.public_key == block.generator) {
            Some(position) => position,
            None => {
                credits.push(DelegateCredit {
                    public_key: block.generator.clone(),
                    address: block.generator.to_address(),
                    reward: 0,
                    fee: 0,
                });
                credits.len() - 1
            }
        };
        credits[position].reward += block.reward;
        credits[position].fee += share;
    }
    if let Some(credit) = credits.iter_mut().find(|c| &c.public_key == closer) {
        credit.fee += remainder;
    }
    credits
}

/// Confirmed balance behind each voted-for key.
fn vote_totals<L: LedgerWriter>(ledger: &L) -> Result<BTreeMap<PublicKey, u64>> {
    let mut totals: BTreeMap<PublicKey, u64> = BTreeMap::new();
    for account in ledger.accounts()? {
        for key in &account.confirmed.votes {
            let total = totals.entry(key.clone()).or_insert(0);
            *total = total.saturating_add(account.confirmed.balance);
        }
    }
    Ok(totals)
}
