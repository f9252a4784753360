//! Header chain: cached header storage, total-difficulty bookkeeping and
//! header-level fork choice.
//!
//! The header chain can run ahead of the block chain (headers without
//! bodies during sync), so it owns its own canonical re-routing. Fork
//! choice here is the same rule the block chain applies: higher total
//! difficulty wins, equal difficulty prefers the lower height, an exact
//! tie falls to the configured tie-break policy.

use crate::config::{ChainConfig, TieBreak};
use crate::consensus::{verify_headers, ConsensusEngine, HeaderReader};
use crate::error::{ChainError, Result};
use crate::head::HeadPointers;
use crate::store::{schema, PersistentStore, WriteBatch};
use crate::types::{Hash, Header, Td};
use lru::LruCache;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Where a written header landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderWriteStatus {
    Canonical,
    SideChain,
}

/// Parent lookups straight from the store, for the concurrent verifier.
pub(crate) struct DbHeaderReader {
    pub(crate) store: Arc<dyn PersistentStore>,
}

impl HeaderReader for DbHeaderReader {
    fn header(&self, hash: &Hash, number: u64) -> Option<Header> {
        schema::read_header(self.store.as_ref(), hash, number).ok().flatten()
    }

    fn total_difficulty(&self, hash: &Hash, number: u64) -> Option<Td> {
        schema::read_td(self.store.as_ref(), hash, number).ok().flatten()
    }
}

pub struct HeaderStore {
    store: Arc<dyn PersistentStore>,
    heads: Arc<HeadPointers>,
    engine: Arc<dyn ConsensusEngine>,
    config: Arc<ChainConfig>,
    interrupt: Arc<AtomicBool>,

    header_cache: Mutex<LruCache<Hash, Header>>,
    td_cache: Mutex<LruCache<Hash, Td>>,
    number_cache: Mutex<LruCache<Hash, u64>>,
}

impl HeaderStore {
    pub fn new(
        store: Arc<dyn PersistentStore>,
        heads: Arc<HeadPointers>,
        engine: Arc<dyn ConsensusEngine>,
        config: Arc<ChainConfig>,
        interrupt: Arc<AtomicBool>,
    ) -> Self {
        HeaderStore {
            header_cache: Mutex::new(LruCache::new(ChainConfig::cache_capacity(
                config.header_cache,
            ))),
            td_cache: Mutex::new(LruCache::new(ChainConfig::cache_capacity(config.td_cache))),
            number_cache: Mutex::new(LruCache::new(ChainConfig::cache_capacity(
                config.number_cache,
            ))),
            store,
            heads,
            engine,
            config,
            interrupt,
        }
    }

    fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------
    // Reads

    pub fn current_header(&self) -> Arc<Header> {
        self.heads.current_header()
    }

    pub fn number(&self, hash: &Hash) -> Option<u64> {
        if let Some(number) = self.number_cache.lock().get(hash) {
            return Some(*number);
        }
        let number = schema::read_header_number(self.store.as_ref(), hash).ok().flatten()?;
        self.number_cache.lock().put(*hash, number);
        Some(number)
    }

    pub fn header(&self, hash: &Hash, number: u64) -> Option<Header> {
        if let Some(header) = self.header_cache.lock().get(hash) {
            return Some(header.clone());
        }
        let header = schema::read_header(self.store.as_ref(), hash, number).ok().flatten()?;
        self.header_cache.lock().put(*hash, header.clone());
        Some(header)
    }

    pub fn header_by_hash(&self, hash: &Hash) -> Option<Header> {
        let number = self.number(hash)?;
        self.header(hash, number)
    }

    pub fn header_by_number(&self, number: u64) -> Option<Header> {
        let hash = schema::read_canonical_hash(self.store.as_ref(), number).ok().flatten()?;
        self.header(&hash, number)
    }

    pub fn has_header(&self, hash: &Hash, number: u64) -> bool {
        if self.header_cache.lock().contains(hash) {
            return true;
        }
        schema::has_header(self.store.as_ref(), hash, number).unwrap_or(false)
    }

    pub fn td(&self, hash: &Hash, number: u64) -> Option<Td> {
        if let Some(td) = self.td_cache.lock().get(hash) {
            return Some(*td);
        }
        let td = schema::read_td(self.store.as_ref(), hash, number).ok().flatten()?;
        self.td_cache.lock().put(*hash, td);
        Some(td)
    }

    /// Hash of the ancestor of `(hash, number)` at height `target`.
    /// Shortcuts through the canonical index where the walk is canonical.
    pub fn ancestor_hash(&self, hash: &Hash, number: u64, target: u64) -> Option<Hash> {
        if target > number {
            return None;
        }
        let mut hash = *hash;
        let mut number = number;
        while number > target {
            if schema::read_canonical_hash(self.store.as_ref(), number).ok().flatten()
                == Some(hash)
            {
                return schema::read_canonical_hash(self.store.as_ref(), target).ok().flatten();
            }
            hash = self.header(&hash, number)?.parent_hash;
            number -= 1;
        }
        Some(hash)
    }

    /// Up to `max` hashes walking back from `hash`, starting with it.
    pub fn block_hashes_from(&self, hash: &Hash, max: usize) -> Vec<Hash> {
        let mut hashes = Vec::with_capacity(max);
        let Some(mut number) = self.number(hash) else { return hashes };
        let mut hash = *hash;
        while hashes.len() < max {
            hashes.push(hash);
            if number == 0 {
                break;
            }
            match self.header(&hash, number) {
                Some(header) => {
                    hash = header.parent_hash;
                    number -= 1;
                }
                None => break,
            }
        }
        hashes
    }

    // -----------------------------------------------------------------
    // Writes

    fn reroutes_canonical(&self, ext_td: Td, number: u64) -> bool {
        let head = self.heads.current_header();
        let local_td = self.td(&head.hash(), head.number).unwrap_or(0);
        if ext_td != local_td {
            return ext_td > local_td;
        }
        if number != head.number {
            return number < head.number;
        }
        match self.config.tie_break {
            TieBreak::Randomized => rand::thread_rng().gen_bool(0.5),
            TieBreak::PreferNew => true,
            TieBreak::PreferOld => false,
        }
    }

    /// Persist a header and its total difficulty; re-route the canonical
    /// header chain when it outweighs the current head.
    pub fn write_header(&self, header: &Header) -> Result<HeaderWriteStatus> {
        let hash = header.hash();
        let number = header.number;

        let parent_td = self
            .td(&header.parent_hash, number.wrapping_sub(1))
            .ok_or(ChainError::UnknownAncestor)?;
        let ext_td = parent_td + header.difficulty as Td;

        let reroute = self.reroutes_canonical(ext_td, number);

        let mut batch = WriteBatch::new();
        schema::write_td(&mut batch, &hash, number, ext_td);
        schema::write_header(&mut batch, header)?;

        if reroute {
            // Remove stale canonical assignments above the new head.
            let mut stale = number + 1;
            while schema::read_canonical_hash(self.store.as_ref(), stale)?.is_some() {
                schema::delete_canonical_hash(&mut batch, stale);
                stale += 1;
            }

            // Re-route the index back to the fork point.
            let mut walk_hash = header.parent_hash;
            let mut walk_number = number.wrapping_sub(1);
            while number > 0
                && schema::read_canonical_hash(self.store.as_ref(), walk_number)?
                    != Some(walk_hash)
            {
                schema::write_canonical_hash(&mut batch, &walk_hash, walk_number);
                let parent = self
                    .header(&walk_hash, walk_number)
                    .ok_or(ChainError::InvalidChain("header chain gap during re-route"))?;
                walk_hash = parent.parent_hash;
                walk_number = walk_number.wrapping_sub(1);
            }
            schema::write_canonical_hash(&mut batch, &hash, number);
        }

        self.store.write(batch)?;

        self.header_cache.lock().put(hash, header.clone());
        self.td_cache.lock().put(hash, ext_td);
        self.number_cache.lock().put(hash, number);

        if reroute {
            self.heads.set_header(Arc::new(header.clone()));
            debug!(number, hash = %hash.short(), td = ext_td, "header chain re-routed");
            Ok(HeaderWriteStatus::Canonical)
        } else {
            Ok(HeaderWriteStatus::SideChain)
        }
    }

    /// Pre-validate a batch of headers: contiguity, deny-list, then the
    /// consensus engine on worker threads with sparse seal sampling. One
    /// in `check_freq` headers gets the full seal check; the last always
    /// does.
    pub fn validate_header_chain(&self, headers: &[Header], check_freq: usize) -> Result<()> {
        for (index, window) in headers.windows(2).enumerate() {
            let prev_hash = window[0].hash();
            if window[1].number != window[0].number + 1 || window[1].parent_hash != prev_hash {
                return Err(ChainError::NonContiguous {
                    index: index + 1,
                    number: window[1].number,
                    parent: window[1].parent_hash,
                    prev_hash,
                });
            }
        }
        for header in headers {
            let hash = header.hash();
            if self.config.bad_hashes.contains(&hash) {
                return Err(ChainError::BlacklistedHash(hash));
            }
        }

        let mut rng = rand::thread_rng();
        let mut seals: Vec<bool> = if check_freq <= 1 {
            vec![true; headers.len()]
        } else {
            headers.iter().map(|_| rng.gen_ratio(1, check_freq as u32)).collect()
        };
        if let Some(last) = seals.last_mut() {
            *last = true;
        }

        let reader = Arc::new(DbHeaderReader { store: Arc::clone(&self.store) });
        let (abort, results) = verify_headers(
            Arc::clone(&self.engine),
            reader,
            headers.to_vec(),
            seals,
            self.config.worker_count(),
        );

        for _ in 0..headers.len() {
            if self.interrupted() {
                abort.abort();
                return Err(ChainError::Aborted);
            }
            match results.recv() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    abort.abort();
                    return Err(e);
                }
                Err(_) => return Err(ChainError::Aborted),
            }
        }
        Ok(())
    }

    /// Write a validated batch, skipping headers already present.
    /// Returns how many were new.
    pub fn insert_header_chain(&self, headers: &[Header]) -> Result<usize> {
        let mut written = 0;
        for header in headers {
            if self.interrupted() {
                return Err(ChainError::Aborted);
            }
            if self.has_header(&header.hash(), header.number) {
                continue;
            }
            self.write_header(header)?;
            written += 1;
        }
        Ok(written)
    }

    /// Rewind the header chain to `head`. `on_delete` collects extra
    /// deletions (bodies, receipts) into the same batch as each header
    /// removal.
    pub fn set_head(
        &self,
        head: u64,
        on_delete: &mut dyn FnMut(&mut WriteBatch, &Hash, u64),
    ) -> Result<()> {
        let mut current = (*self.heads.current_header()).clone();

        let mut batch = WriteBatch::new();
        while current.number > head {
            let hash = current.hash();
            schema::delete_header(&mut batch, &hash, current.number);
            schema::delete_td(&mut batch, &hash, current.number);
            schema::delete_canonical_hash(&mut batch, current.number);
            on_delete(&mut batch, &hash, current.number);

            current = match self.header(&current.parent_hash, current.number - 1) {
                Some(parent) => parent,
                None => {
                    // A gap in the ancestry leaves nothing between here
                    // and genesis to land on.
                    warn!(
                        number = current.number - 1,
                        "missing parent during rewind, landing on genesis"
                    );
                    schema::read_canonical_hash(self.store.as_ref(), 0)?
                        .and_then(|hash| self.header(&hash, 0))
                        .ok_or(ChainError::MissingGenesis)?
                }
            };
        }
        schema::write_head_header_hash(&mut batch, &current.hash());
        self.store.write(batch)?;

        self.header_cache.lock().clear();
        self.td_cache.lock().clear();
        self.number_cache.lock().clear();

        self.heads.set_header(Arc::new(current));
        Ok(())
    }
}

impl HeaderReader for HeaderStore {
    fn header(&self, hash: &Hash, number: u64) -> Option<Header> {
        HeaderStore::header(self, hash, number)
    }

    fn total_difficulty(&self, hash: &Hash, number: u64) -> Option<Td> {
        self.td(hash, number)
    }
}
