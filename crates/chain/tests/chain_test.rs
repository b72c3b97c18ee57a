use dposchain_chain::{
    dev_delegates, BlockError, Chain, ChainConfig, ChainError, ForkKind, ForkOutcome, GenesisBuilder,
    PoolError, ProcessOutcome, TransactionError,
};
use dposchain_consensus::{BlockForger, Classify, ErrorClass};
use dposchain_core::{Account, Address, Block, ChainConstants, Keypair, Transaction, VoteEntry, COIN};
use dposchain_storage::{ChainReader, ChainStore, LedgerReader, Storage};
use proptest::prelude::*;
use std::collections::BTreeMap;

const EPOCH: u64 = 1_000_000;
const BLOCK_TIME: u64 = 10;
const FEE: u64 = COIN / 10;

fn constants() -> ChainConstants {
    ChainConstants {
        active_delegates: 3,
        block_time: BLOCK_TIME,
        epoch_time: EPOCH,
        ..Default::default()
    }
}

fn whale() -> Keypair {
    Keypair::from_passphrase("whale")
}

fn poor() -> Keypair {
    Keypair::from_passphrase("poor")
}

fn genesis() -> Block {
    let mut builder = GenesisBuilder::new(Keypair::from_passphrase("genesis"))
        .account(whale().address(), 1_000 * COIN)
        .account(poor().address(), 10 * COIN);
    for (i, kp) in dev_delegates(3).into_iter().enumerate() {
        builder = builder.delegate(kp, &format!("delegate_{}", i), 100 * COIN);
    }
    builder.build()
}

fn open_chain_with(constants: ChainConstants) -> Chain {
    let store = ChainStore::new(Storage::open_temporary().unwrap());
    let config = ChainConfig {
        constants,
        ..Default::default()
    };
    let mut chain = Chain::open(store, config).unwrap();
    chain.init_genesis(&genesis()).unwrap();
    chain
}

fn open_chain() -> Chain {
    open_chain_with(constants())
}

fn forger() -> BlockForger {
    BlockForger::new(dev_delegates(3), constants())
}

/// Unix time at the start of `slot`.
fn unix_at(slot: u64) -> u64 {
    EPOCH + slot * BLOCK_TIME
}

fn forge_at(chain: &mut Chain, slot: u64) -> Block {
    chain.forge(&forger(), unix_at(slot)).unwrap().expect("slot belongs to a local delegate")
}

/// Forge a block on the current tip without going through the pool.
fn block_with(chain: &mut Chain, slot: u64, transactions: Vec<Transaction>) -> Block {
    let parent = chain.latest_block().unwrap();
    let forgers = chain.get_delegate_list(parent.height() + 1).unwrap();
    forger()
        .forge(&parent, slot * BLOCK_TIME, &forgers, transactions)
        .unwrap()
}

fn transfer(from: &Keypair, to: Address, amount: u64, timestamp: u64) -> Transaction {
    Transaction::transfer(&from.public_key, to, amount, FEE, timestamp).signed(from)
}

fn balance(chain: &Chain, address: &Address) -> u64 {
    chain
        .store()
        .accounts()
        .account(address)
        .unwrap()
        .map(|account| account.balance())
        .unwrap_or(0)
}

fn account(chain: &Chain, address: &Address) -> Account {
    chain.store().accounts().account_or_default(address).unwrap()
}

fn snapshot(chain: &Chain) -> BTreeMap<Address, Account> {
    chain
        .store()
        .accounts()
        .accounts()
        .unwrap()
        .into_iter()
        .map(|account| (account.address, account))
        .collect()
}

fn rejection(outcome: ProcessOutcome) -> ChainError {
    match outcome {
        ProcessOutcome::Rejected(err) => err,
        other => panic!("expected a rejection, got {:?}", other),
    }
}

#[test]
fn test_overspend_in_pool_applies_exactly_one() {
    let mut chain = open_chain();
    let poor = poor();
    let first = transfer(&poor, Address::from_bytes([1u8; 20]), 6 * COIN, 0);
    let second = transfer(&poor, Address::from_bytes([2u8; 20]), 6 * COIN, 0);

    let results = chain.receive_transactions(vec![first.clone(), second], unix_at(0));
    assert!(results.iter().all(|result| result.is_ok()));
    assert_eq!(chain.fill_pool(unix_at(0)).unwrap(), 1);
    assert_eq!(chain.pool().len(), 1);

    let block = forge_at(&mut chain, 1);
    assert_eq!(block.transactions, vec![first]);
    assert_eq!(balance(&chain, &poor.address()), 10 * COIN - 6 * COIN - FEE);
}

#[test]
fn test_overspend_in_block_rejects_block() {
    let mut chain = open_chain();
    let poor = poor();
    let txs = vec![
        transfer(&poor, Address::from_bytes([1u8; 20]), 6 * COIN, 0),
        transfer(&poor, Address::from_bytes([2u8; 20]), 6 * COIN, 0),
    ];
    let before = snapshot(&chain);
    let block = block_with(&mut chain, 1, txs);

    let err = rejection(chain.process_received_block(block, unix_at(1)).unwrap());
    assert!(matches!(
        err,
        ChainError::Block(BlockError::Transaction {
            index: 1,
            source: TransactionError::InsufficientBalance { .. },
            ..
        })
    ));
    assert_eq!(err.class(), ErrorClass::Consistency);
    assert_eq!(chain.tip().unwrap().height, 0);
    assert_eq!(snapshot(&chain), before);
}

#[test]
fn test_voting_for_same_delegate_twice_is_rejected() {
    let mut chain = open_chain();
    let whale = whale();
    let delegate = dev_delegates(3)[0].public_key.clone();
    let vote = |timestamp| {
        Transaction::vote(&whale.public_key, vec![VoteEntry::Add(delegate.clone())], COIN, timestamp)
            .signed(&whale)
    };

    let doubled = Transaction::vote(
        &whale.public_key,
        vec![VoteEntry::Add(delegate.clone()), VoteEntry::Add(delegate.clone())],
        COIN,
        0,
    )
    .signed(&whale);
    let results = chain.receive_transactions(vec![doubled], unix_at(0));
    assert!(matches!(
        results[0],
        Err(ChainError::Pool(PoolError::Transaction(TransactionError::DuplicateVoteEntry(_))))
    ));

    // Two separate votes in one block: the second finds the vote already cast.
    let block = block_with(&mut chain, 1, vec![vote(0), vote(1)]);
    let err = rejection(chain.process_received_block(block, unix_at(1)).unwrap());
    assert!(matches!(
        err,
        ChainError::Block(BlockError::Transaction {
            index: 1,
            source: TransactionError::AlreadyVoted(_),
            ..
        })
    ));

    // Through the pool only one of them survives.
    chain.receive_transactions(vec![vote(0), vote(1)], unix_at(1));
    assert_eq!(chain.fill_pool(unix_at(1)).unwrap(), 1);
    let block = forge_at(&mut chain, 1);
    assert_eq!(block.tx_count(), 1);
    assert!(account(&chain, &whale.address()).confirmed.votes.contains(&delegate));
}

#[test]
fn test_competing_block_with_smaller_id_replaces_tip() {
    let mut chain = open_chain();
    let local = forge_at(&mut chain, 1);
    let genesis = chain.store().block_at(0).unwrap().unwrap();
    let forgers = chain.get_delegate_list(1).unwrap();
    let recipient = Address::from_bytes([3u8; 20]);

    let rival = (1..=64)
        .map(|n| {
            let tx = transfer(&whale(), recipient, n * COIN, 0);
            forger().forge(&genesis, 2 * BLOCK_TIME, &forgers, vec![tx]).unwrap()
        })
        .find(|block| block.id() < local.id())
        .expect("some rival sorts before the local block");

    let outcome = chain.process_received_block(rival.clone(), unix_at(2)).unwrap();
    assert!(matches!(outcome, ProcessOutcome::Forked(ForkKind::CompetingBlock)));
    assert_eq!(chain.tip().unwrap().id, rival.id());
    assert!(!chain.store().has_block(&local.id()).unwrap());
    assert_eq!(balance(&chain, &recipient), rival.header.total_amount);
}

#[test]
fn test_competing_block_with_larger_id_is_ignored() {
    let mut chain = open_chain();
    let local = forge_at(&mut chain, 1);
    let genesis = chain.store().block_at(0).unwrap().unwrap();
    let forgers = chain.get_delegate_list(1).unwrap();
    let recipient = Address::from_bytes([3u8; 20]);

    let rival = (1..=64)
        .map(|n| {
            let tx = transfer(&whale(), recipient, n * COIN, 0);
            forger().forge(&genesis, 2 * BLOCK_TIME, &forgers, vec![tx]).unwrap()
        })
        .find(|block| block.id() > local.id())
        .expect("some rival sorts after the local block");

    let outcome = chain.process_received_block(rival, unix_at(2)).unwrap();
    assert!(matches!(outcome, ProcessOutcome::Forked(ForkKind::CompetingBlock)));
    assert_eq!(chain.tip().unwrap().id, local.id());
    assert_eq!(balance(&chain, &recipient), 0);
}

#[test]
fn test_fork_resolution_is_idempotent() {
    let mut ours = open_chain();
    for slot in 1..=3 {
        forge_at(&mut ours, slot);
    }
    let mut theirs = open_chain();
    theirs.receive_transactions(vec![transfer(&whale(), Address::from_bytes([4u8; 20]), COIN, 0)], unix_at(0));
    theirs.fill_pool(unix_at(0)).unwrap();
    for slot in 2..=5 {
        forge_at(&mut theirs, slot);
    }
    let branch = theirs.store().blocks_range(1, 4).unwrap();

    let shorter = branch[..2].to_vec();
    assert_eq!(
        ours.resolve_fork(shorter, unix_at(5)).unwrap(),
        ForkOutcome::LocalPreferred
    );

    let outcome = ours.resolve_fork(branch.clone(), unix_at(5)).unwrap();
    assert_eq!(
        outcome,
        ForkOutcome::Switched {
            ancestor_height: 0,
            rolled_back: 3,
            applied: 4,
        }
    );
    assert_eq!(ours.tip().unwrap(), theirs.tip().unwrap());
    assert_eq!(ours.resolve_fork(branch, unix_at(5)).unwrap(), ForkOutcome::NoChange);
    assert_eq!(snapshot(&ours), snapshot(&theirs));
}

#[test]
fn test_blocks_from_unknown_branches_are_classified() {
    let mut ours = open_chain();
    let mut theirs = open_chain();
    forge_at(&mut ours, 1);
    forge_at(&mut theirs, 2);
    // Height 2 on their chain sits on a parent we never saw.
    let divergent = forge_at(&mut theirs, 3);

    let outcome = ours.process_received_block(divergent, unix_at(3)).unwrap();
    assert!(matches!(outcome, ProcessOutcome::Forked(ForkKind::DivergentParent)));

    let far = forge_at(&mut theirs, 4);
    let outcome = ours.process_received_block(far, unix_at(4)).unwrap();
    assert!(matches!(outcome, ProcessOutcome::Forked(ForkKind::AheadOfTip)));
    assert_eq!(ours.tip().unwrap().height, 1);
}

fn assert_replicas_agree(constants: ChainConstants) {
    let mut producer = open_chain_with(constants.clone());
    let mut replica = open_chain_with(constants);
    let whale = whale();
    let delegates = dev_delegates(3);

    for slot in 1..=7u64 {
        let tx = Transaction::vote(
            &whale.public_key,
            vec![VoteEntry::Add(delegates[(slot % 3) as usize].public_key.clone())],
            COIN,
            slot,
        )
        .signed(&whale);
        if slot <= 3 {
            producer.receive_transactions(vec![tx], unix_at(slot));
            producer.fill_pool(unix_at(slot)).unwrap();
        }
        let block = producer.forge(&forger(), unix_at(slot)).unwrap().unwrap();
        let outcome = replica.process_received_block(block, unix_at(slot)).unwrap();
        assert!(outcome.is_accepted(), "slot {}: {:?}", slot, outcome);
    }

    for height in 1..=9 {
        assert_eq!(
            producer.get_delegate_list(height).unwrap(),
            replica.get_delegate_list(height).unwrap(),
            "height {}",
            height
        );
    }
    assert_eq!(snapshot(&producer), snapshot(&replica));
}

#[test]
fn test_replicas_agree_on_weighted_selection() {
    assert_replicas_agree(constants());
}

#[test]
fn test_replicas_agree_on_legacy_selection() {
    assert_replicas_agree(ChainConstants {
        selection_v2_height: u64::MAX,
        ..constants()
    });
}

#[test]
fn test_round_settlement_and_rollback() {
    let mut chain = open_chain();
    let whale = whale();
    let delegates = dev_delegates(3);
    let delegate_total = |chain: &Chain| -> u64 {
        delegates.iter().map(|kp| balance(chain, &kp.address())).sum()
    };

    chain.receive_transactions(vec![transfer(&whale, Address::from_bytes([6u8; 20]), COIN, 0)], unix_at(0));
    chain.fill_pool(unix_at(0)).unwrap();
    let mut blocks = Vec::new();
    for slot in 1..=2 {
        blocks.push(forge_at(&mut chain, slot));
    }
    assert_eq!(blocks[0].tx_count(), 1);
    // Fees are paid out only when the round closes.
    assert_eq!(delegate_total(&chain), 300 * COIN);
    assert!(chain.store().settlement(1).unwrap().is_none());

    blocks.push(forge_at(&mut chain, 3));
    let settlement = chain.store().settlement(1).unwrap().unwrap();
    assert_eq!(settlement.blocks, 3);
    assert_eq!(settlement.total_fees, FEE);
    assert_eq!(settlement.distributed_fees(), FEE);
    assert_eq!(settlement.fee_remainder, FEE % 3);
    assert_eq!(delegate_total(&chain), 300 * COIN + FEE);
    for block in &blocks {
        let generator = account(&chain, &block.generator().to_address());
        assert_eq!(generator.delegate.produced_blocks, 1);
        assert_eq!(generator.delegate.missed_blocks, 0);
    }
    assert!(chain.store().forgers(2).unwrap().is_some());

    let removed = chain.undo_tip(unix_at(4)).unwrap();
    assert_eq!(removed.id(), blocks[2].id());
    assert!(chain.store().settlement(1).unwrap().is_none());
    assert!(chain.store().forgers(2).unwrap().is_none());
    assert_eq!(delegate_total(&chain), 300 * COIN);
    for kp in &delegates {
        assert_eq!(account(&chain, &kp.address()).delegate.produced_blocks, 0);
    }
}

#[test]
fn test_genesis_cannot_be_undone() {
    let mut chain = open_chain();
    let err = chain.undo_tip(unix_at(1)).unwrap_err();
    assert!(matches!(err, ChainError::Block(BlockError::CannotUndoGenesis)));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn block_apply_then_undo_restores_accounts(amounts in proptest::collection::vec(1u64..50, 1..6)) {
        let mut chain = open_chain();
        let whale = whale();
        let before = snapshot(&chain);

        let txs: Vec<Transaction> = amounts
            .iter()
            .enumerate()
            .map(|(i, amount)| transfer(&whale, Address::from_bytes([i as u8 + 10; 20]), amount * COIN, i as u64))
            .collect();
        chain.receive_transactions(txs.clone(), unix_at(1));
        chain.fill_pool(unix_at(1)).unwrap();
        let block = forge_at(&mut chain, 1);
        prop_assert_eq!(block.transactions.len(), txs.len());

        chain.undo_tip(unix_at(2)).unwrap();
        let after = snapshot(&chain);
        for (address, account) in &after {
            match before.get(address) {
                Some(original) => prop_assert_eq!(account, original),
                None => prop_assert_eq!(account, &Account::new(*address)),
            }
        }
        prop_assert_eq!(chain.pool().len(), txs.len());
    }
}
