//! Integration tests for fork choice, reorganizations and chain events.

mod common;

use chaincore::config::{ChainConfig, TieBreak};
use chaincore::events::ChainEventKind;
use chaincore::store::schema;
use chaincore::types::{Hash, Transaction};
use common::{addr, harness, transfer};
use std::collections::HashSet;

fn fork_transfer(nonce: u64, value: u128) -> Transaction {
    Transaction {
        to: addr(3),
        ..transfer(nonce, value)
    }
}

#[test]
fn heavier_fork_reorgs_with_removed_logs() -> Result<(), Box<dyn std::error::Error>> {
    let h = harness(ChainConfig { tie_break: TieBreak::PreferOld, ..ChainConfig::default() })?;
    let events = h.chain.subscribe_events();

    // Canonical: three light blocks with transfers to addr(2).
    let main = h.extend(&h.genesis.header, 3, 0, 100)?;
    let old_head = main.last().unwrap().hash();
    let old_tx = main[2].transactions()[0].hash();
    h.chain.insert_chain(main.clone())?;
    while events.try_recv().is_ok() {}

    // Fork from genesis: two heavy blocks, different recipient.
    let f1 = h.build(&h.genesis.header, vec![fork_transfer(0, 5)], 250)?;
    let f2 = h.build(&f1.header, vec![fork_transfer(1, 5)], 250)?;
    let new_head = f2.hash();
    // Fork td 100+250+250 = 600 beats 100+3*100 = 400.
    assert_eq!(h.chain.insert_chain(vec![f1, f2])?, 2);

    assert_eq!(h.chain.current_block().hash(), new_head);
    assert_eq!(h.chain.current_block().number(), 2);

    // Canonical index rewritten and trimmed above the new head.
    assert_eq!(schema::read_canonical_hash(h.store.as_ref(), 2)?, Some(new_head));
    assert_eq!(schema::read_canonical_hash(h.store.as_ref(), 3)?, None);

    // Lookups for retired transactions are gone, fork lookups present.
    assert!(schema::read_tx_lookup(h.store.as_ref(), &old_tx)?.is_none());
    let fork_tx = h.chain.current_block().transactions()[0].hash();
    assert!(schema::read_tx_lookup(h.store.as_ref(), &fork_tx)?.is_some());

    // The retired branch is still reachable by hash.
    assert!(h.chain.block_by_hash(&old_head).is_some());

    // Event order: removed logs and side events for the retired blocks,
    // then chain events for the fork, then the head event.
    let mut kinds = Vec::new();
    let mut removed = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event.kind());
        if let ChainEventKind::RemovedLogs { logs } = event {
            removed.extend(logs);
        }
    }
    assert!(kinds.iter().filter(|k| **k == "side").count() >= 3);
    assert_eq!(kinds.last(), Some(&"head"));

    // The removed-logs payload is exactly the retired branch's logs, one
    // transfer log per block, all flagged.
    assert!(removed.iter().all(|log| log.removed));
    let got: HashSet<Hash> = removed.iter().map(|log| log.tx_hash).collect();
    let want: HashSet<Hash> =
        main.iter().map(|b| b.transactions()[0].hash()).collect();
    assert_eq!(removed.len(), main.len());
    assert_eq!(got, want);

    h.chain.stop();
    Ok(())
}

#[test]
fn equal_td_prefers_lower_height() -> Result<(), Box<dyn std::error::Error>> {
    let h = harness(ChainConfig { tie_break: TieBreak::PreferOld, ..ChainConfig::default() })?;

    // Canonical: two blocks of difficulty 100 (td 300).
    let main = h.extend(&h.genesis.header, 2, 0, 100)?;
    h.chain.insert_chain(main)?;
    assert_eq!(h.chain.current_block().number(), 2);

    // One block of difficulty 200 reaches the same td at lower height.
    let fork = h.build(&h.genesis.header, vec![fork_transfer(0, 1)], 200)?;
    let fork_hash = fork.hash();
    h.chain.insert_chain(vec![fork])?;

    assert_eq!(h.chain.current_block().number(), 1);
    assert_eq!(h.chain.current_block().hash(), fork_hash);

    h.chain.stop();
    Ok(())
}

#[test]
fn exact_tie_follows_configured_policy() -> Result<(), Box<dyn std::error::Error>> {
    for (policy, switches) in [(TieBreak::PreferOld, false), (TieBreak::PreferNew, true)] {
        let h = harness(ChainConfig { tie_break: policy, ..ChainConfig::default() })?;

        let a = h.build(&h.genesis.header, vec![transfer(0, 1)], 100)?;
        let b = h.build(&h.genesis.header, vec![fork_transfer(0, 1)], 100)?;
        let a_hash = a.hash();
        let b_hash = b.hash();

        h.chain.insert_chain(vec![a])?;
        h.chain.insert_chain(vec![b])?;

        let expected = if switches { b_hash } else { a_hash };
        assert_eq!(h.chain.current_block().hash(), expected, "policy {:?}", policy);
        h.chain.stop();
    }
    Ok(())
}

#[test]
fn side_blocks_do_not_move_the_head() -> Result<(), Box<dyn std::error::Error>> {
    let h = harness(ChainConfig { tie_break: TieBreak::PreferOld, ..ChainConfig::default() })?;
    let events = h.chain.subscribe_events();

    let main = h.extend(&h.genesis.header, 3, 0, 100)?;
    let head = main.last().unwrap().hash();
    h.chain.insert_chain(main)?;
    while events.try_recv().is_ok() {}

    // A lighter fork lands as a side chain, state and all.
    let fork = h.build(&h.genesis.header, vec![fork_transfer(0, 9)], 100)?;
    let fork_hash = fork.hash();
    assert_eq!(h.chain.insert_chain(vec![fork])?, 1);

    assert_eq!(h.chain.current_block().hash(), head);
    assert!(h.chain.has_block_and_state(&fork_hash, 1));

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event.kind());
    }
    assert_eq!(kinds, vec!["side"]);

    h.chain.stop();
    Ok(())
}
