//! Integration tests for header-first insertion and header fork choice.

mod common;

use chaincore::config::{ChainConfig, TieBreak};
use chaincore::error::ChainError;
use chaincore::types::Header;
use common::harness;

#[test]
fn header_only_insertion_advances_header_head() -> Result<(), Box<dyn std::error::Error>> {
    let h = harness(ChainConfig::default())?;
    let headers: Vec<Header> = h
        .extend(&h.genesis.header, 5, 0, 100)?
        .into_iter()
        .map(|b| b.header)
        .collect();

    let store = h.chain.header_store();
    store.validate_header_chain(&headers, 1)?;
    assert_eq!(store.insert_header_chain(&headers)?, 5);

    // Header head moved; the block head did not.
    assert_eq!(h.chain.current_header().number, 5);
    assert_eq!(h.chain.current_block().number(), 0);
    assert_eq!(store.header_by_number(3).map(|hdr| hdr.hash()), Some(headers[2].hash()));

    // Reinsertion writes nothing.
    assert_eq!(store.insert_header_chain(&headers)?, 0);

    h.chain.stop();
    Ok(())
}

#[test]
fn heavier_header_fork_reroutes_canonical_index() -> Result<(), Box<dyn std::error::Error>> {
    let h = harness(ChainConfig { tie_break: TieBreak::PreferOld, ..ChainConfig::default() })?;

    let main: Vec<Header> = h
        .extend(&h.genesis.header, 5, 0, 100)?
        .into_iter()
        .map(|b| b.header)
        .collect();
    let store = h.chain.header_store();
    store.insert_header_chain(&main)?;

    // A shorter but heavier branch from genesis.
    let fork: Vec<Header> = h
        .extend(&h.genesis.header, 3, 0, 300)?
        .into_iter()
        .map(|b| b.header)
        .collect();
    store.insert_header_chain(&fork)?;

    // Fork td 100+3*300 beats 100+5*100; the index follows it and the
    // numbers above the fork head are unassigned again.
    assert_eq!(h.chain.current_header().number, 3);
    assert_eq!(store.header_by_number(2).map(|hdr| hdr.hash()), Some(fork[1].hash()));
    assert_eq!(store.header_by_number(5), None);

    // Both branches stay reachable by hash.
    assert!(store.header_by_hash(&main[4].hash()).is_some());

    h.chain.stop();
    Ok(())
}

#[test]
fn contiguity_violations_are_position_exact() -> Result<(), Box<dyn std::error::Error>> {
    let h = harness(ChainConfig::default())?;
    let headers: Vec<Header> = h
        .extend(&h.genesis.header, 4, 0, 100)?
        .into_iter()
        .map(|b| b.header)
        .collect();

    let gapped = vec![headers[0].clone(), headers[1].clone(), headers[3].clone()];
    assert!(matches!(
        h.chain.header_store().validate_header_chain(&gapped, 1),
        Err(ChainError::NonContiguous { index: 2, .. })
    ));

    h.chain.stop();
    Ok(())
}

#[test]
fn ancestor_walks_cross_branches() -> Result<(), Box<dyn std::error::Error>> {
    let h = harness(ChainConfig::default())?;

    let blocks = h.extend(&h.genesis.header, 6, 0, 100)?;
    h.chain.insert_chain(blocks.clone())?;
    let store = h.chain.header_store();

    let head_hash = blocks[5].hash();
    assert_eq!(store.ancestor_hash(&head_hash, 6, 2), Some(blocks[1].hash()));
    assert_eq!(store.ancestor_hash(&head_hash, 6, 0), Some(h.genesis.hash()));
    assert_eq!(store.ancestor_hash(&head_hash, 6, 7), None);

    let walked = store.block_hashes_from(&blocks[3].hash(), 3);
    assert_eq!(walked, vec![blocks[3].hash(), blocks[2].hash(), blocks[1].hash()]);

    h.chain.stop();
    Ok(())
}
