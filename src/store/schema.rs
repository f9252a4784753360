//! Typed chain schema over the raw key-value store.
//!
//! Key layout (all numbers big-endian so range order follows block order):
//!
//! ```text
//! h  + number + hash   -> header (bincode)
//! n  + hash            -> header number
//! t  + number + hash   -> total difficulty
//! b  + number + hash   -> block body
//! c  + number          -> canonical hash for that height
//! l  + tx hash         -> tx lookup entry (block hash, number, index)
//! r  + number + hash   -> receipts
//! LastBlock / LastHeader / LastFast -> head pointer hashes
//! ```

use super::{PersistentStore, WriteBatch};
use crate::error::Result;
use crate::types::{Block, Body, Hash, Header, Receipt, Td};
use serde::{Deserialize, Serialize};

const HEADER_PREFIX: u8 = b'h';
const NUMBER_PREFIX: u8 = b'n';
const TD_PREFIX: u8 = b't';
const BODY_PREFIX: u8 = b'b';
const CANONICAL_PREFIX: u8 = b'c';
const LOOKUP_PREFIX: u8 = b'l';
const RECEIPTS_PREFIX: u8 = b'r';
const STATE_PREFIX: u8 = b's';

const HEAD_BLOCK_KEY: &[u8] = b"LastBlock";
const HEAD_HEADER_KEY: &[u8] = b"LastHeader";
const HEAD_FAST_KEY: &[u8] = b"LastFast";

/// Position of a transaction inside a canonical block, for hash lookups.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxLookupEntry {
    pub block_hash: Hash,
    pub block_number: u64,
    pub index: u64,
}

fn numbered_key(prefix: u8, number: u64, hash: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + 8 + 32);
    key.push(prefix);
    key.extend_from_slice(&number.to_be_bytes());
    key.extend_from_slice(hash.as_bytes());
    key
}

fn hashed_key(prefix: u8, hash: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + 32);
    key.push(prefix);
    key.extend_from_slice(hash.as_bytes());
    key
}

fn canonical_key(number: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + 8);
    key.push(CANONICAL_PREFIX);
    key.extend_from_slice(&number.to_be_bytes());
    key
}

// ---------------------------------------------------------------------------
// Headers and numbers

pub fn write_header(batch: &mut WriteBatch, header: &Header) -> Result<()> {
    let hash = header.hash();
    batch.put(
        numbered_key(HEADER_PREFIX, header.number, &hash),
        bincode::serialize(header)?,
    );
    batch.put(hashed_key(NUMBER_PREFIX, &hash), header.number.to_be_bytes().to_vec());
    Ok(())
}

pub fn read_header(store: &dyn PersistentStore, hash: &Hash, number: u64) -> Result<Option<Header>> {
    match store.get(&numbered_key(HEADER_PREFIX, number, hash))? {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
        None => Ok(None),
    }
}

pub fn has_header(store: &dyn PersistentStore, hash: &Hash, number: u64) -> Result<bool> {
    store.has(&numbered_key(HEADER_PREFIX, number, hash))
}

pub fn read_header_number(store: &dyn PersistentStore, hash: &Hash) -> Result<Option<u64>> {
    match store.get(&hashed_key(NUMBER_PREFIX, hash))? {
        Some(bytes) if bytes.len() == 8 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes);
            Ok(Some(u64::from_be_bytes(raw)))
        }
        _ => Ok(None),
    }
}

pub fn delete_header(batch: &mut WriteBatch, hash: &Hash, number: u64) {
    batch.delete(numbered_key(HEADER_PREFIX, number, hash));
    batch.delete(hashed_key(NUMBER_PREFIX, hash));
}

// ---------------------------------------------------------------------------
// Total difficulty

pub fn write_td(batch: &mut WriteBatch, hash: &Hash, number: u64, td: Td) {
    batch.put(numbered_key(TD_PREFIX, number, hash), td.to_be_bytes().to_vec());
}

pub fn read_td(store: &dyn PersistentStore, hash: &Hash, number: u64) -> Result<Option<Td>> {
    match store.get(&numbered_key(TD_PREFIX, number, hash))? {
        Some(bytes) if bytes.len() == 16 => {
            let mut raw = [0u8; 16];
            raw.copy_from_slice(&bytes);
            Ok(Some(Td::from_be_bytes(raw)))
        }
        _ => Ok(None),
    }
}

pub fn delete_td(batch: &mut WriteBatch, hash: &Hash, number: u64) {
    batch.delete(numbered_key(TD_PREFIX, number, hash));
}

// ---------------------------------------------------------------------------
// Bodies and blocks

pub fn write_body(batch: &mut WriteBatch, hash: &Hash, number: u64, body: &Body) -> Result<()> {
    batch.put(numbered_key(BODY_PREFIX, number, hash), bincode::serialize(body)?);
    Ok(())
}

pub fn read_body(store: &dyn PersistentStore, hash: &Hash, number: u64) -> Result<Option<Body>> {
    match store.get(&numbered_key(BODY_PREFIX, number, hash))? {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
        None => Ok(None),
    }
}

pub fn has_body(store: &dyn PersistentStore, hash: &Hash, number: u64) -> Result<bool> {
    store.has(&numbered_key(BODY_PREFIX, number, hash))
}

pub fn delete_body(batch: &mut WriteBatch, hash: &Hash, number: u64) {
    batch.delete(numbered_key(BODY_PREFIX, number, hash));
}

/// Header plus body in one call.
pub fn write_block(batch: &mut WriteBatch, block: &Block) -> Result<()> {
    write_header(batch, &block.header)?;
    write_body(batch, &block.hash(), block.number(), &block.body)
}

pub fn read_block(store: &dyn PersistentStore, hash: &Hash, number: u64) -> Result<Option<Block>> {
    let header = match read_header(store, hash, number)? {
        Some(h) => h,
        None => return Ok(None),
    };
    let body = match read_body(store, hash, number)? {
        Some(b) => b,
        None => return Ok(None),
    };
    Ok(Some(Block::new(header, body)))
}

// ---------------------------------------------------------------------------
// Canonical index

pub fn write_canonical_hash(batch: &mut WriteBatch, hash: &Hash, number: u64) {
    batch.put(canonical_key(number), hash.as_bytes().to_vec());
}

pub fn read_canonical_hash(store: &dyn PersistentStore, number: u64) -> Result<Option<Hash>> {
    match store.get(&canonical_key(number))? {
        Some(bytes) => Ok(Hash::from_slice(&bytes)),
        None => Ok(None),
    }
}

pub fn delete_canonical_hash(batch: &mut WriteBatch, number: u64) {
    batch.delete(canonical_key(number));
}

// ---------------------------------------------------------------------------
// Head pointers

pub fn write_head_block_hash(batch: &mut WriteBatch, hash: &Hash) {
    batch.put(HEAD_BLOCK_KEY.to_vec(), hash.as_bytes().to_vec());
}

pub fn write_head_header_hash(batch: &mut WriteBatch, hash: &Hash) {
    batch.put(HEAD_HEADER_KEY.to_vec(), hash.as_bytes().to_vec());
}

pub fn write_head_fast_hash(batch: &mut WriteBatch, hash: &Hash) {
    batch.put(HEAD_FAST_KEY.to_vec(), hash.as_bytes().to_vec());
}

pub fn read_head_block_hash(store: &dyn PersistentStore) -> Result<Option<Hash>> {
    Ok(store.get(HEAD_BLOCK_KEY)?.and_then(|b| Hash::from_slice(&b)))
}

pub fn read_head_header_hash(store: &dyn PersistentStore) -> Result<Option<Hash>> {
    Ok(store.get(HEAD_HEADER_KEY)?.and_then(|b| Hash::from_slice(&b)))
}

pub fn read_head_fast_hash(store: &dyn PersistentStore) -> Result<Option<Hash>> {
    Ok(store.get(HEAD_FAST_KEY)?.and_then(|b| Hash::from_slice(&b)))
}

// ---------------------------------------------------------------------------
// Receipts and transaction lookups

pub fn write_receipts(
    batch: &mut WriteBatch,
    hash: &Hash,
    number: u64,
    receipts: &[Receipt],
) -> Result<()> {
    batch.put(numbered_key(RECEIPTS_PREFIX, number, hash), bincode::serialize(receipts)?);
    Ok(())
}

pub fn read_receipts(store: &dyn PersistentStore, hash: &Hash, number: u64) -> Result<Option<Vec<Receipt>>> {
    match store.get(&numbered_key(RECEIPTS_PREFIX, number, hash))? {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
        None => Ok(None),
    }
}

pub fn delete_receipts(batch: &mut WriteBatch, hash: &Hash, number: u64) {
    batch.delete(numbered_key(RECEIPTS_PREFIX, number, hash));
}

pub fn write_tx_lookup_entries(batch: &mut WriteBatch, block: &Block) -> Result<()> {
    let block_hash = block.hash();
    for (index, tx) in block.transactions().iter().enumerate() {
        let entry = TxLookupEntry {
            block_hash,
            block_number: block.number(),
            index: index as u64,
        };
        batch.put(hashed_key(LOOKUP_PREFIX, &tx.hash()), bincode::serialize(&entry)?);
    }
    Ok(())
}

pub fn read_tx_lookup(store: &dyn PersistentStore, tx_hash: &Hash) -> Result<Option<TxLookupEntry>> {
    match store.get(&hashed_key(LOOKUP_PREFIX, tx_hash))? {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
        None => Ok(None),
    }
}

pub fn delete_tx_lookup(batch: &mut WriteBatch, tx_hash: &Hash) {
    batch.delete(hashed_key(LOOKUP_PREFIX, tx_hash));
}

// ---------------------------------------------------------------------------
// Committed state blobs

pub fn write_state_blob(store: &dyn PersistentStore, root: &Hash, blob: &[u8]) -> Result<()> {
    store.put(&hashed_key(STATE_PREFIX, root), blob)
}

pub fn read_state_blob(store: &dyn PersistentStore, root: &Hash) -> Result<Option<Vec<u8>>> {
    store.get(&hashed_key(STATE_PREFIX, root))
}

pub fn has_state_blob(store: &dyn PersistentStore, root: &Hash) -> Result<bool> {
    store.has(&hashed_key(STATE_PREFIX, root))
}
