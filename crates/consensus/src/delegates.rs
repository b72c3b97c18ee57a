//! Per-round forger selection.
//!
//! Two algorithms exist and are gated by height, since historical rounds
//! were scheduled with the legacy one:
//!
//! - **v1 (legacy)**: delegates ranked by raw vote, top N shuffled with a
//!   seed derived from the round number.
//! - **v2 (weighted)**: weighted random sampling seeded from the previous
//!   round's closing block, then shuffled, then the delegate that has gone
//!   longest without closing a round is moved into the final slot.
//!
//! Both produce the same list on every node with the same history. Lists are
//! persisted when the round before them closes and cached here by round.

use crate::error::{ConsensusError, Result};
use dposchain_core::{hash, Block, ChainConstants, DelegateStats, Hash, PublicKey};
use dposchain_storage::{ChainReader, LedgerReader};
use rand::Rng;
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha20Rng;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Deterministic seed for a round, read as four little-endian words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundSeed {
    words: [u64; 4],
}

impl RoundSeed {
    /// Seed derived from the id of the previous round's closing block.
    pub fn from_block_id(id: &Hash) -> Self {
        Self {
            words: hash(id.as_bytes()).to_words(),
        }
    }

    pub fn words(&self) -> [u64; 4] {
        self.words
    }

    pub fn digest(&self) -> Hash {
        let mut bytes = [0u8; 32];
        for (i, word) in self.words.iter().enumerate() {
            bytes[i * 8..i * 8 + 8].copy_from_slice(&word.to_le_bytes());
        }
        Hash(bytes)
    }

    pub fn rng(&self) -> ChaCha20Rng {
        ChaCha20Rng::from_seed(self.digest().0)
    }
}

/// The block that closed the round before the one being scheduled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundAnchor {
    pub block_id: Hash,
    pub generator: PublicKey,
}

impl RoundAnchor {
    pub fn from_block(block: &Block) -> Self {
        Self {
            block_id: block.id(),
            generator: block.generator().clone(),
        }
    }
}

/// A delegate as seen by the selection algorithms.
#[derive(Debug, Clone)]
struct Candidate {
    key: PublicKey,
    stats: DelegateStats,
}

/// Computes and memoizes the ordered forger list of each round.
#[derive(Debug, Clone)]
pub struct DelegateSelector {
    constants: ChainConstants,
    cache: BTreeMap<u64, Vec<PublicKey>>,
}

impl DelegateSelector {
    pub fn new(constants: ChainConstants) -> Self {
        Self {
            constants,
            cache: BTreeMap::new(),
        }
    }

    pub fn constants(&self) -> &ChainConstants {
        &self.constants
    }

    /// Ordered forgers of the round containing `height`.
    ///
    /// Looks in the cache, then at the persisted list. Only the round right
    /// after a just-committed closing block may be recomputed, since the
    /// current ledger is its anchor state. Rounds past the tip's next round
    /// are out of range.
    pub fn select_forgers<L, C>(&mut self, height: u64, ledger: &L, chain: &C) -> Result<Vec<PublicKey>>
    where
        L: LedgerReader,
        C: ChainReader,
    {
        let round = self.constants.round_of(height).max(1);
        let tip_height = chain.height()?;
        let next_round = self.constants.round_of(tip_height + 1).max(1);
        if round > next_round {
            return Err(ConsensusError::HeightOutOfRange {
                height,
                max: self.constants.last_height(next_round),
            });
        }
        if let Some(list) = self.cache.get(&round) {
            return Ok(list.clone());
        }
        let list = match chain.forgers(round)? {
            Some(list) => list,
            None if self.constants.first_height(round) - 1 == tip_height => {
                warn!(round, "Forger list not persisted, recomputing from the anchor state");
                let anchor = self.anchor(round, chain)?;
                self.compute_forgers(round, &anchor, ledger)?
            }
            None => return Err(ConsensusError::MissingForgerList(round)),
        };
        self.cache.insert(round, list.clone());
        Ok(list)
    }

    /// Closing block of the round before `round`. Genesis anchors round 1.
    pub fn anchor<C: ChainReader>(&self, round: u64, chain: &C) -> Result<RoundAnchor> {
        let height = self.constants.first_height(round.max(1)) - 1;
        let block = chain
            .block_at(height)?
            .ok_or(ConsensusError::MissingRoundSeed { round, height })?;
        Ok(RoundAnchor::from_block(&block))
    }

    /// Run the selection algorithm for `round` against `ledger`, which must
    /// reflect the state right after `anchor` was committed.
    pub fn compute_forgers<L: LedgerReader>(
        &self,
        round: u64,
        anchor: &RoundAnchor,
        ledger: &L,
    ) -> Result<Vec<PublicKey>> {
        let candidates: Vec<Candidate> = ledger
            .delegates()?
            .into_iter()
            .filter_map(|account| {
                account.confirmed.public_key.map(|key| Candidate {
                    key,
                    stats: account.delegate,
                })
            })
            .collect();

        let list = if self.constants.uses_weighted_selection(round) {
            self.weighted(anchor, candidates)
        } else {
            self.legacy(round, candidates)
        };
        if list.is_empty() {
            return Err(ConsensusError::NoEligibleDelegates(round));
        }
        debug!(
            round,
            forgers = list.len(),
            weighted = self.constants.uses_weighted_selection(round),
            "Computed forger list"
        );
        Ok(list)
    }

    /// Delegate scheduled for `slot` in a round's list.
    pub fn generator_for_slot(list: &[PublicKey], slot: u64) -> Option<&PublicKey> {
        if list.is_empty() {
            return None;
        }
        list.get((slot % list.len() as u64) as usize)
    }

    /// Cache a list computed or loaded elsewhere.
    pub fn remember(&mut self, round: u64, list: Vec<PublicKey>) {
        self.cache.insert(round, list);
    }

    /// Drop cached lists for `round` and every later round.
    pub fn invalidate_from(&mut self, round: u64) {
        let dropped = self.cache.split_off(&round);
        if !dropped.is_empty() {
            debug!(round, dropped = dropped.len(), "Invalidated forger lists");
        }
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }

    fn active(&self) -> usize {
        self.constants.active_delegates as usize
    }

    fn legacy(&self, round: u64, mut candidates: Vec<Candidate>) -> Vec<PublicKey> {
        candidates.sort_by(|a, b| {
            b.stats
                .vote
                .cmp(&a.stats.vote)
                .then_with(|| a.key.cmp(&b.key))
        });
        candidates.truncate(self.active());
        let mut list: Vec<PublicKey> = candidates.into_iter().map(|c| c.key).collect();
        shuffle(&mut list, hash(round.to_string().as_bytes()));
        list
    }

    fn weighted(&self, anchor: &RoundAnchor, candidates: Vec<Candidate>) -> Vec<PublicKey> {
        let max_missed = self.constants.max_consecutive_missed_blocks;
        let mut eligible: Vec<Candidate> = candidates
            .into_iter()
            .filter(|c| c.key != anchor.generator)
            .filter(|c| c.stats.consecutive_missed_blocks <= max_missed)
            .collect();
        // Draws are taken in key order so every node consumes the stream alike.
        eligible.sort_by(|a, b| a.key.cmp(&b.key));

        let seed = RoundSeed::from_block_id(&anchor.block_id);
        let mut rng = seed.rng();
        let mut weighted: Vec<(f64, Candidate)> = eligible
            .into_iter()
            .map(|c| {
                let draw: f64 = rng.gen();
                (sampling_key(draw, c.stats.vote_weight), c)
            })
            .collect();
        weighted.sort_by(|a, b| match b.0.total_cmp(&a.0) {
            Ordering::Equal => b.1.key.cmp(&a.1.key),
            other => other,
        });
        weighted.truncate(self.active());

        let closed: BTreeMap<PublicKey, Option<u64>> = weighted
            .iter()
            .map(|(_, c)| (c.key.clone(), c.stats.last_round_closed))
            .collect();
        let mut list: Vec<PublicKey> = weighted.into_iter().map(|(_, c)| c.key).collect();
        shuffle(&mut list, seed.digest());
        move_least_recent_closer_last(&mut list, &closed);
        list
    }
}

/// Weighted sampling key `u^(1/w)`, compared in log space where it reads
/// `ln(u) / w`. Both order identically; the log form keeps precision for
/// large weights.
fn sampling_key(draw: f64, vote_weight: u64) -> f64 {
    if vote_weight == 0 {
        return f64::NEG_INFINITY;
    }
    draw.ln() / vote_weight as f64
}

/// Seeded in-place shuffle: swap position `i` with a position read from four
/// bytes of the seed digest, rehashing the digest every four swaps.
pub fn shuffle(list: &mut [PublicKey], seed: Hash) {
    let n = list.len();
    let mut current = seed;
    for i in 0..n {
        let word = i % 4;
        let index = current.u32_at(word) as usize % n;
        list.swap(i, index);
        if word == 3 {
            current = current.rehash();
        }
    }
}

/// Move the delegate that closed a round least recently (never counts as
/// oldest) into the final slot, swapping with whoever held it.
fn move_least_recent_closer_last(list: &mut [PublicKey], closed: &BTreeMap<PublicKey, Option<u64>>) {
    if list.len() < 2 {
        return;
    }
    let oldest = list
        .iter()
        .enumerate()
        .min_by_key(|(position, key)| (closed.get(*key).copied().flatten(), *position))
        .map(|(position, _)| position);
    if let Some(position) = oldest {
        let last = list.len() - 1;
        list.swap(position, last);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Classify, ErrorClass};
    use dposchain_core::{Account, Keypair, RoundSettlement};
    use dposchain_storage::{
        BlockCommit, ChainStore, ChainTip, LedgerWriter, MemoryLedger, Storage, StoredTransaction,
    };
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn keypair(i: usize) -> Keypair {
        Keypair::from_passphrase(&format!("delegate {}", i))
    }

    fn delegate(i: usize, vote: u64) -> Account {
        let kp = keypair(i);
        let mut account = Account::new(kp.address());
        account.confirmed.public_key = Some(kp.public_key.clone());
        account.confirmed.username = Some(format!("delegate_{}", i));
        account.delegate.vote = vote;
        account.delegate.vote_weight = vote;
        account
    }

    fn ledger(count: usize) -> MemoryLedger {
        let mut ledger = MemoryLedger::new();
        for i in 0..count {
            ledger.put_account(delegate(i, 1_000 + i as u64)).unwrap();
        }
        ledger
    }

    fn constants(active: u64, v2_height: u64) -> ChainConstants {
        ChainConstants {
            active_delegates: active,
            selection_v2_height: v2_height,
            ..Default::default()
        }
    }

    fn anchor() -> RoundAnchor {
        RoundAnchor {
            block_id: hash(b"closing block"),
            generator: Keypair::from_passphrase("outsider").public_key,
        }
    }

    #[test]
    fn test_weighted_selection_is_deterministic() {
        let selector = DelegateSelector::new(constants(5, 0));
        let ledger = ledger(12);
        let first = selector.compute_forgers(3, &anchor(), &ledger).unwrap();
        let second = DelegateSelector::new(constants(5, 0))
            .compute_forgers(3, &anchor(), &ledger.clone())
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 5);
        let unique: BTreeSet<_> = first.iter().collect();
        assert_eq!(unique.len(), 5);
    }

    #[test]
    fn test_weighted_selection_depends_on_seed() {
        let selector = DelegateSelector::new(constants(5, 0));
        let ledger = ledger(30);
        let other = RoundAnchor {
            block_id: hash(b"another closing block"),
            ..anchor()
        };
        let a = selector.compute_forgers(3, &anchor(), &ledger).unwrap();
        let b = selector.compute_forgers(3, &other, &ledger).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_weighted_excludes_previous_closer_and_missers() {
        let selector = DelegateSelector::new(constants(10, 0));
        let mut ledger = ledger(6);
        let mut misser = delegate(5, 10_000);
        misser.delegate.consecutive_missed_blocks = 51;
        ledger.put_account(misser).unwrap();

        let closer = RoundAnchor {
            block_id: hash(b"seed"),
            generator: keypair(0).public_key,
        };
        let list = selector.compute_forgers(2, &closer, &ledger).unwrap();
        assert_eq!(list.len(), 4);
        assert!(!list.contains(&keypair(0).public_key));
        assert!(!list.contains(&keypair(5).public_key));
    }

    #[test]
    fn test_zero_weight_ranks_last() {
        let selector = DelegateSelector::new(constants(3, 0));
        let mut ledger = ledger(3);
        let mut idle = delegate(3, 0);
        idle.delegate.vote_weight = 0;
        ledger.put_account(idle).unwrap();
        let list = selector.compute_forgers(2, &anchor(), &ledger).unwrap();
        assert!(!list.contains(&keypair(3).public_key));
    }

    #[test]
    fn test_least_recent_closer_takes_final_slot() {
        let selector = DelegateSelector::new(constants(6, 0));
        let mut ledger = MemoryLedger::new();
        for i in 0..6 {
            let mut account = delegate(i, 1_000);
            account.delegate.last_round_closed = Some(10 + i as u64);
            ledger.put_account(account).unwrap();
        }
        let mut stale = delegate(6, 1_000);
        stale.delegate.last_round_closed = Some(1);
        ledger.put_account(stale).unwrap();

        let list = selector.compute_forgers(12, &anchor(), &ledger).unwrap();
        if list.contains(&keypair(6).public_key) {
            assert_eq!(list.last(), Some(&keypair(6).public_key));
        } else {
            // Otherwise the oldest closer among the selected is last.
            let oldest = list
                .iter()
                .map(|key| ledger.delegate(key).unwrap().unwrap().delegate.last_round_closed)
                .min()
                .unwrap();
            let last = ledger.delegate(list.last().unwrap()).unwrap().unwrap();
            assert_eq!(last.delegate.last_round_closed, oldest);
        }
    }

    #[test]
    fn test_never_closed_counts_as_oldest() {
        let keys: Vec<PublicKey> = (0..4).map(|i| keypair(i).public_key).collect();
        let mut closed = BTreeMap::new();
        closed.insert(keys[0].clone(), Some(3));
        closed.insert(keys[1].clone(), None);
        closed.insert(keys[2].clone(), Some(1));
        closed.insert(keys[3].clone(), None);
        let mut list = keys.clone();
        move_least_recent_closer_last(&mut list, &closed);
        assert_eq!(list, vec![keys[0].clone(), keys[3].clone(), keys[2].clone(), keys[1].clone()]);
    }

    #[test]
    fn test_legacy_ranks_by_vote() {
        let selector = DelegateSelector::new(constants(3, u64::MAX));
        let ledger = ledger(6);
        let list = selector.compute_forgers(1, &anchor(), &ledger).unwrap();
        let chosen: BTreeSet<_> = list.into_iter().collect();
        let expected: BTreeSet<_> = (3..6).map(|i| keypair(i).public_key).collect();
        assert_eq!(chosen, expected);
    }

    #[test]
    fn test_legacy_ignores_anchor_generator() {
        let selector = DelegateSelector::new(constants(3, u64::MAX));
        let ledger = ledger(3);
        let closer = RoundAnchor {
            block_id: hash(b"x"),
            generator: keypair(2).public_key,
        };
        let list = selector.compute_forgers(4, &closer, &ledger).unwrap();
        assert!(list.contains(&keypair(2).public_key));
    }

    #[test]
    fn test_no_delegates_is_fatal() {
        let selector = DelegateSelector::new(constants(3, 0));
        let result = selector.compute_forgers(1, &anchor(), &MemoryLedger::new());
        assert!(matches!(result, Err(ConsensusError::NoEligibleDelegates(1))));
    }

    #[test]
    fn test_missing_anchor_block_is_fatal() {
        let mut selector = DelegateSelector::new(constants(3, 0));
        let chain = ChainStore::new(Storage::open_temporary().unwrap());
        let result = selector.select_forgers(1, &ledger(3), &chain);
        assert!(matches!(
            result,
            Err(ConsensusError::MissingRoundSeed { round: 1, height: 0 })
        ));
    }

    #[test]
    fn test_select_prefers_cache_then_persisted() {
        let mut selector = DelegateSelector::new(constants(3, 0));
        let chain = ChainStore::new(Storage::open_temporary().unwrap());
        let genesis = Block::genesis(&Keypair::from_passphrase("genesis"), 0, vec![]);
        let persisted = vec![keypair(7).public_key, keypair(8).public_key];
        chain
            .commit_block(&BlockCommit {
                block: genesis,
                accounts: vec![],
                settlement: None,
                next_forgers: Some((1, persisted.clone())),
            })
            .unwrap();

        let list = selector.select_forgers(2, &ledger(3), &chain).unwrap();
        assert_eq!(list, persisted);

        let cached = vec![keypair(9).public_key];
        selector.remember(1, cached.clone());
        assert_eq!(selector.select_forgers(3, &ledger(3), &chain).unwrap(), cached);

        selector.invalidate_from(1);
        assert_eq!(selector.select_forgers(3, &ledger(3), &chain).unwrap(), persisted);
    }

    #[test]
    fn test_recompute_from_anchor_block() {
        let mut selector = DelegateSelector::new(constants(3, 0));
        let chain = ChainStore::new(Storage::open_temporary().unwrap());
        let genesis = Block::genesis(&Keypair::from_passphrase("genesis"), 0, vec![]);
        chain
            .commit_block(&BlockCommit {
                block: genesis.clone(),
                accounts: vec![],
                settlement: None,
                next_forgers: None,
            })
            .unwrap();
        let ledger = ledger(5);
        let list = selector.select_forgers(1, &ledger, &chain).unwrap();
        let expected = selector
            .compute_forgers(1, &RoundAnchor::from_block(&genesis), &ledger)
            .unwrap();
        assert_eq!(list, expected);
    }

    /// Chain view at `tip` that has every block but no persisted lists.
    struct Forgetful {
        tip: u64,
    }

    impl ChainReader for Forgetful {
        fn tip(&self) -> dposchain_storage::Result<Option<ChainTip>> {
            Ok(Some(ChainTip {
                id: hash(b"tip"),
                height: self.tip,
            }))
        }

        fn block(&self, _id: &Hash) -> dposchain_storage::Result<Option<Block>> {
            Ok(Some(Block::genesis(&Keypair::from_passphrase("genesis"), 0, vec![])))
        }

        fn block_id_at(&self, height: u64) -> dposchain_storage::Result<Option<Hash>> {
            Ok((height <= self.tip).then(|| hash(&height.to_le_bytes())))
        }

        fn transaction(&self, _id: &Hash) -> dposchain_storage::Result<Option<StoredTransaction>> {
            Ok(None)
        }

        fn settlement(&self, _round: u64) -> dposchain_storage::Result<Option<RoundSettlement>> {
            Ok(None)
        }

        fn forgers(&self, _round: u64) -> dposchain_storage::Result<Option<Vec<PublicKey>>> {
            Ok(None)
        }
    }

    #[test]
    fn test_missing_list_of_committed_round_is_fatal() {
        let mut selector = DelegateSelector::new(constants(3, 0));
        let mid_round = Forgetful { tip: 4 };
        for height in [1, 4] {
            let err = selector.select_forgers(height, &ledger(3), &mid_round).unwrap_err();
            assert!(matches!(err, ConsensusError::MissingForgerList(_)));
            assert!(err.class().is_fatal());
        }

        // right after a closing block the next round is still computable
        let closed = Forgetful { tip: 3 };
        assert_eq!(selector.select_forgers(4, &ledger(3), &closed).unwrap().len(), 3);
    }

    #[test]
    fn test_rounds_past_the_next_are_out_of_range() {
        let mut selector = DelegateSelector::new(constants(3, 0));
        let err = selector
            .select_forgers(7, &ledger(3), &Forgetful { tip: 4 })
            .unwrap_err();
        assert!(matches!(
            err,
            ConsensusError::HeightOutOfRange { height: 7, max: 6 }
        ));
        assert_eq!(err.class(), ErrorClass::Malformed);
    }

    #[test]
    fn test_generator_for_slot_wraps() {
        let keys: Vec<PublicKey> = (0..3).map(|i| keypair(i).public_key).collect();
        assert_eq!(DelegateSelector::generator_for_slot(&keys, 4), Some(&keys[1]));
        assert_eq!(DelegateSelector::generator_for_slot(&[], 4), None);
    }

    #[test]
    fn test_round_seed_words() {
        let id = hash(b"block");
        let seed = RoundSeed::from_block_id(&id);
        assert_eq!(seed.words(), hash(id.as_bytes()).to_words());
        assert_eq!(seed.digest(), hash(id.as_bytes()));
    }

    proptest! {
        #[test]
        fn shuffle_is_a_permutation(count in 1usize..40, seed in any::<[u8; 32]>()) {
            let keys: Vec<PublicKey> = (0..count).map(|i| keypair(i).public_key).collect();
            let mut shuffled = keys.clone();
            shuffle(&mut shuffled, Hash(seed));
            let mut sorted = shuffled.clone();
            sorted.sort();
            let mut expected = keys;
            expected.sort();
            prop_assert_eq!(sorted, expected);
        }
    }
}
