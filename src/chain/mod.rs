//! The chain orchestrator: block acceptance, fork choice, reorgs, state
//! garbage collection and crash recovery.
//!
//! One coarse lock serializes every mutation of canonical structure;
//! reads go through immutable head snapshots and never wait on an
//! insertion. Submodules carry the insertion state machine
//! ([`insert`]), reorg handling ([`reorg`]), trie garbage collection
//! ([`triegc`]) and import statistics ([`stats`]).

mod insert;
mod reorg;
mod stats;
mod triegc;

use crate::config::{ChainConfig, TieBreak};
use crate::consensus::ConsensusEngine;
use crate::error::{ChainError, Result};
use crate::events::{ChainEventKind, EventFeed};
use crate::head::{HeadPointers, HeadSnapshot};
use crate::headers::HeaderStore;
use crate::processor::{BlockProcessor, ProducerRegistry, TransferProcessor};
use crate::state::StateEngine;
use crate::store::{schema, PersistentStore, WriteBatch};
use crate::types::{Block, Body, Hash, Receipt, Td};
use crate::validator::{BlockValidator, CoreValidator};
use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use lru::LruCache;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};
use triegc::TrieGc;

/// Where a written block landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Canonical,
    Side,
}

/// Diagnostic record for a block that failed validation.
#[derive(Clone, Debug, Serialize)]
pub struct BadBlockReport {
    pub hash: Hash,
    pub number: u64,
    pub reason: String,
}

pub struct Blockchain {
    pub(crate) config: Arc<ChainConfig>,
    pub(crate) store: Arc<dyn PersistentStore>,
    pub(crate) state: Arc<dyn StateEngine>,
    pub(crate) engine: Arc<dyn ConsensusEngine>,
    pub(crate) validator: Arc<dyn BlockValidator>,
    pub(crate) processor: Arc<dyn BlockProcessor>,
    pub(crate) producers: Arc<ProducerRegistry>,
    pub(crate) heads: Arc<HeadPointers>,
    pub(crate) headers: Arc<HeaderStore>,
    pub(crate) events: EventFeed,
    genesis: Arc<Block>,

    pub(crate) insert_lock: Mutex<()>,
    pub(crate) interrupt: Arc<AtomicBool>,
    running: AtomicBool,

    block_cache: Mutex<LruCache<Hash, Arc<Block>>>,
    body_cache: Mutex<LruCache<Hash, Body>>,
    pub(crate) future_blocks: Mutex<LruCache<Hash, Arc<Block>>>,
    bad_blocks: Mutex<LruCache<Hash, BadBlockReport>>,
    pub(crate) bad_hashes: HashSet<Hash>,
    pub(crate) triegc: Mutex<TrieGc>,

    shutdown: Sender<()>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl Blockchain {
    /// Open a chain with the default execution stack: transfer
    /// processing, no chain-state producers.
    pub fn new(
        store: Arc<dyn PersistentStore>,
        state: Arc<dyn StateEngine>,
        engine: Arc<dyn ConsensusEngine>,
        config: ChainConfig,
    ) -> Result<Arc<Blockchain>> {
        Self::with_execution(
            store,
            state,
            engine,
            config,
            Arc::new(TransferProcessor::new()),
            Arc::new(ProducerRegistry::new()),
        )
    }

    pub fn with_execution(
        store: Arc<dyn PersistentStore>,
        state: Arc<dyn StateEngine>,
        engine: Arc<dyn ConsensusEngine>,
        config: ChainConfig,
        processor: Arc<dyn BlockProcessor>,
        producers: Arc<ProducerRegistry>,
    ) -> Result<Arc<Blockchain>> {
        config.validate()?;
        let config = Arc::new(config);

        let genesis_hash = schema::read_canonical_hash(store.as_ref(), 0)?
            .ok_or(ChainError::MissingGenesis)?;
        let genesis = schema::read_block(store.as_ref(), &genesis_hash, 0)?
            .map(Arc::new)
            .ok_or(ChainError::MissingGenesis)?;

        let heads = Arc::new(HeadPointers::new(HeadSnapshot::at_block(Arc::clone(&genesis))));
        let interrupt = Arc::new(AtomicBool::new(false));
        let headers = Arc::new(HeaderStore::new(
            Arc::clone(&store),
            Arc::clone(&heads),
            Arc::clone(&engine),
            Arc::clone(&config),
            Arc::clone(&interrupt),
        ));
        let validator: Arc<dyn BlockValidator> =
            Arc::new(CoreValidator::new(Arc::clone(&store), Arc::clone(&state)));

        let (shutdown, shutdown_rx) = bounded(1);
        let chain = Arc::new(Blockchain {
            block_cache: Mutex::new(LruCache::new(ChainConfig::cache_capacity(
                config.block_cache,
            ))),
            body_cache: Mutex::new(LruCache::new(ChainConfig::cache_capacity(config.body_cache))),
            future_blocks: Mutex::new(LruCache::new(ChainConfig::cache_capacity(
                config.max_future_blocks,
            ))),
            bad_blocks: Mutex::new(LruCache::new(ChainConfig::cache_capacity(
                config.bad_block_limit,
            ))),
            bad_hashes: config.bad_hash_set(),
            triegc: Mutex::new(TrieGc::new()),
            config,
            store,
            state,
            engine,
            validator,
            processor,
            producers,
            heads,
            headers,
            events: EventFeed::new(),
            genesis,
            insert_lock: Mutex::new(()),
            interrupt,
            running: AtomicBool::new(true),
            shutdown,
            ticker: Mutex::new(None),
        });

        chain.load_last_state()?;

        // A denied hash that made it into the canonical chain forces a
        // rewind below it.
        for bad in chain.bad_hashes.clone() {
            if let Some(header) = chain.headers.header_by_hash(&bad) {
                if schema::read_canonical_hash(chain.store.as_ref(), header.number)? == Some(bad) {
                    warn!(number = header.number, hash = %bad.short(), "rewinding past denied block");
                    chain.set_head(header.number.saturating_sub(1))?;
                    info!("chain rewind was successful, resuming normal operation");
                }
            }
        }

        let worker = Arc::clone(&chain);
        let handle = std::thread::spawn(move || worker.future_loop(shutdown_rx));
        *chain.ticker.lock() = Some(handle);

        Ok(chain)
    }

    // -----------------------------------------------------------------
    // Startup and recovery

    /// Restore the head snapshot from the persisted pointers, repairing
    /// past any state lost in a crash.
    fn load_last_state(&self) -> Result<()> {
        let head = schema::read_head_block_hash(self.store.as_ref())?
            .and_then(|hash| self.block_by_hash(&hash));
        let mut current = match head {
            Some(block) => block,
            None => {
                warn!("empty database, resetting chain to genesis");
                return self.reset_heads_to_genesis();
            }
        };

        if !self.state.has_state(&current.header.state_root) {
            warn!(
                number = current.number(),
                hash = %current.hash().short(),
                "head state missing, repairing chain"
            );
            current = self.repair(current)?;
            let mut batch = WriteBatch::new();
            schema::write_head_block_hash(&mut batch, &current.hash());
            self.store.write(batch)?;
        }

        let header = schema::read_head_header_hash(self.store.as_ref())?
            .and_then(|hash| self.headers.header_by_hash(&hash))
            .map(Arc::new)
            .unwrap_or_else(|| Arc::new(current.header.clone()));
        let fast = schema::read_head_fast_hash(self.store.as_ref())?
            .and_then(|hash| self.block_by_hash(&hash))
            .unwrap_or_else(|| Arc::clone(&current));

        info!(
            number = current.number(),
            hash = %current.hash().short(),
            header_number = header.number,
            fast_number = fast.number(),
            "loaded chain state"
        );
        self.heads.swap(HeadSnapshot { block: current, header, fast });
        Ok(())
    }

    /// Walk back from `block` to the most recent ancestor whose state is
    /// still openable.
    fn repair(&self, mut block: Arc<Block>) -> Result<Arc<Block>> {
        loop {
            if self.state.has_state(&block.header.state_root) {
                info!(number = block.number(), hash = %block.hash().short(), "rewound chain to past state");
                return Ok(block);
            }
            if block.number() == 0 {
                return Err(ChainError::StateUnavailable(block.header.state_root));
            }
            debug!(number = block.number(), "state missing, rewinding one block");
            block = self
                .block(&block.parent_hash(), block.number() - 1)
                .ok_or(ChainError::InvalidChain("missing parent during repair"))?;
        }
    }

    fn reset_heads_to_genesis(&self) -> Result<()> {
        let hash = self.genesis.hash();
        let mut batch = WriteBatch::new();
        schema::write_canonical_hash(&mut batch, &hash, 0);
        schema::write_head_block_hash(&mut batch, &hash);
        schema::write_head_header_hash(&mut batch, &hash);
        schema::write_head_fast_hash(&mut batch, &hash);
        self.store.write(batch)?;
        self.heads.swap(HeadSnapshot::at_block(Arc::clone(&self.genesis)));
        Ok(())
    }

    /// Drop the whole chain above genesis.
    pub fn reset(&self) -> Result<()> {
        self.set_head(0)
    }

    /// Rewind the canonical chain to `head`, dropping every block above
    /// it together with its receipts and lookups.
    pub fn set_head(&self, head: u64) -> Result<()> {
        let _guard = self.insert_lock.lock();

        let store = Arc::clone(&self.store);
        self.headers.set_head(head, &mut |batch, hash, number| {
            if let Ok(Some(body)) = schema::read_body(store.as_ref(), hash, number) {
                for tx in &body.transactions {
                    schema::delete_tx_lookup(batch, &tx.hash());
                }
            }
            schema::delete_body(batch, hash, number);
            schema::delete_receipts(batch, hash, number);
        })?;

        self.block_cache.lock().clear();
        self.body_cache.lock().clear();
        self.future_blocks.lock().clear();

        let head_header = self.headers.current_header();
        let mut current = self.current_block();
        if current.number() > head_header.number {
            current = self
                .block_by_hash(&head_header.hash())
                .unwrap_or_else(|| Arc::clone(&self.genesis));
        }
        if !self.state.has_state(&current.header.state_root) {
            current = self.repair(current)?;
        }
        let mut fast = self.current_fast_block();
        if fast.number() > head {
            fast = self.block_by_number(head).unwrap_or_else(|| Arc::clone(&self.genesis));
        }

        let mut batch = WriteBatch::new();
        schema::write_head_block_hash(&mut batch, &current.hash());
        schema::write_head_fast_hash(&mut batch, &fast.hash());
        self.store.write(batch)?;

        let header = self.headers.current_header();
        self.heads.swap(HeadSnapshot { block: current, header, fast });
        Ok(())
    }

    /// Retract head pointers from specific blocks, for when a downstream
    /// component discovers previously accepted data is invalid. Walks the
    /// given hashes newest-first.
    pub fn rollback(&self, hashes: &[Hash]) -> Result<()> {
        let _guard = self.insert_lock.lock();
        for hash in hashes.iter().rev() {
            let snapshot = self.heads.snapshot();

            if snapshot.header.hash() == *hash {
                let parent = self
                    .headers
                    .header_by_hash(&snapshot.header.parent_hash)
                    .ok_or(ChainError::InvalidChain("missing parent during rollback"))?;
                let mut batch = WriteBatch::new();
                schema::write_head_header_hash(&mut batch, &parent.hash());
                self.store.write(batch)?;
                self.heads.set_header(Arc::new(parent));
            }
            let snapshot = self.heads.snapshot();
            if snapshot.fast.hash() == *hash {
                let parent = self
                    .block_by_hash(&snapshot.fast.parent_hash())
                    .ok_or(ChainError::InvalidChain("missing parent during rollback"))?;
                let mut batch = WriteBatch::new();
                schema::write_head_fast_hash(&mut batch, &parent.hash());
                self.store.write(batch)?;
                self.heads.set_fast(parent);
            }
            let snapshot = self.heads.snapshot();
            if snapshot.block.hash() == *hash {
                let parent = self
                    .block_by_hash(&snapshot.block.parent_hash())
                    .ok_or(ChainError::InvalidChain("missing parent during rollback"))?;
                let mut batch = WriteBatch::new();
                schema::write_head_block_hash(&mut batch, &parent.hash());
                self.store.write(batch)?;
                self.heads.set_block(parent);
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Shutdown

    /// Stop accepting work, flush the recent states the retention policy
    /// wants durable, and release everything pinned in memory.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.interrupt.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(());
        if let Some(handle) = self.ticker.lock().take() {
            let _ = handle.join();
        }

        // Wait out any in-flight insertion before touching state.
        let _guard = self.insert_lock.lock();
        if !self.config.disable_trie_gc {
            self.flush_recent_states();
        }
        info!("blockchain manager stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------
    // Future block retry loop

    fn future_loop(&self, shutdown: Receiver<()>) {
        let ticker = tick(self.config.future_retry_interval());
        loop {
            select! {
                recv(ticker) -> _ => self.process_future_blocks(),
                recv(shutdown) -> _ => return,
            }
        }
    }

    /// Drain the future-block queue through the normal insertion path.
    /// The background ticker calls this on its own interval.
    pub fn process_future_blocks(&self) {
        let mut blocks: Vec<Arc<Block>> = {
            let cache = self.future_blocks.lock();
            cache.iter().map(|(_, block)| Arc::clone(block)).collect()
        };
        if blocks.is_empty() {
            return;
        }
        blocks.sort_by_key(|b| b.number());
        // One at a time: the queue holds unrelated forks, so a batch
        // would trip the contiguity check.
        for block in blocks {
            if let Err(e) = self.insert_chain(vec![(*block).clone()]) {
                debug!(number = block.number(), error = %e, "future block retry failed");
            }
        }
    }

    // -----------------------------------------------------------------
    // Reads

    pub fn genesis_block(&self) -> Arc<Block> {
        Arc::clone(&self.genesis)
    }

    pub fn current_block(&self) -> Arc<Block> {
        self.heads.current_block()
    }

    pub fn current_header(&self) -> Arc<crate::types::Header> {
        self.heads.current_header()
    }

    pub fn current_fast_block(&self) -> Arc<Block> {
        self.heads.current_fast()
    }

    pub fn gas_limit(&self) -> u64 {
        self.current_block().header.gas_limit
    }

    pub fn header_store(&self) -> &Arc<HeaderStore> {
        &self.headers
    }

    pub fn subscribe_events(&self) -> Receiver<ChainEventKind> {
        self.events.subscribe()
    }

    pub fn block(&self, hash: &Hash, number: u64) -> Option<Arc<Block>> {
        if let Some(block) = self.block_cache.lock().get(hash) {
            return Some(Arc::clone(block));
        }
        let block = schema::read_block(self.store.as_ref(), hash, number).ok().flatten()?;
        let block = Arc::new(block);
        self.block_cache.lock().put(*hash, Arc::clone(&block));
        Some(block)
    }

    pub fn block_by_hash(&self, hash: &Hash) -> Option<Arc<Block>> {
        let number = self.headers.number(hash)?;
        self.block(hash, number)
    }

    pub fn block_by_number(&self, number: u64) -> Option<Arc<Block>> {
        let hash = schema::read_canonical_hash(self.store.as_ref(), number).ok().flatten()?;
        self.block(&hash, number)
    }

    pub fn body_by_hash(&self, hash: &Hash) -> Option<Body> {
        if let Some(body) = self.body_cache.lock().get(hash) {
            return Some(body.clone());
        }
        let number = self.headers.number(hash)?;
        let body = schema::read_body(self.store.as_ref(), hash, number).ok().flatten()?;
        self.body_cache.lock().put(*hash, body.clone());
        Some(body)
    }

    pub fn has_block(&self, hash: &Hash, number: u64) -> bool {
        if self.block_cache.lock().contains(hash) {
            return true;
        }
        schema::has_body(self.store.as_ref(), hash, number).unwrap_or(false)
    }

    pub fn has_state(&self, root: &Hash) -> bool {
        self.state.has_state(root)
    }

    pub fn has_block_and_state(&self, hash: &Hash, number: u64) -> bool {
        match self.headers.header(hash, number) {
            Some(header) => self.has_block(hash, number) && self.has_state(&header.state_root),
            None => false,
        }
    }

    pub fn td(&self, hash: &Hash, number: u64) -> Option<Td> {
        self.headers.td(hash, number)
    }

    pub fn receipts_by_hash(&self, hash: &Hash) -> Option<Vec<Receipt>> {
        let number = self.headers.number(hash)?;
        schema::read_receipts(self.store.as_ref(), hash, number).ok().flatten()
    }

    /// Up to `count` blocks walking back from `hash`, newest first.
    pub fn blocks_from_hash(&self, hash: &Hash, count: usize) -> Vec<Arc<Block>> {
        let mut blocks = Vec::with_capacity(count);
        let Some(mut number) = self.headers.number(hash) else { return blocks };
        let mut hash = *hash;
        while blocks.len() < count {
            let Some(block) = self.block(&hash, number) else { break };
            hash = block.parent_hash();
            blocks.push(block);
            if number == 0 {
                break;
            }
            number -= 1;
        }
        blocks
    }

    pub fn bad_blocks(&self) -> Vec<BadBlockReport> {
        self.bad_blocks.lock().iter().map(|(_, report)| report.clone()).collect()
    }

    // -----------------------------------------------------------------
    // Shared write helpers

    pub(crate) fn tie_break_prefers_new(&self) -> bool {
        match self.config.tie_break {
            TieBreak::Randomized => rand::thread_rng().gen_bool(0.5),
            TieBreak::PreferNew => true,
            TieBreak::PreferOld => false,
        }
    }

    /// Make `block` the canonical head: canonical index entry, tx
    /// lookups, persisted head pointers, head snapshot.
    pub(crate) fn promote_canonical(&self, block: &Arc<Block>) -> Result<()> {
        let hash = block.hash();
        let mut batch = WriteBatch::new();
        schema::write_canonical_hash(&mut batch, &hash, block.number());
        schema::write_tx_lookup_entries(&mut batch, block)?;
        schema::write_head_block_hash(&mut batch, &hash);
        schema::write_head_header_hash(&mut batch, &hash);
        self.store.write(batch)?;
        self.heads.set_canonical(Arc::clone(block));
        Ok(())
    }

    pub(crate) fn cache_block(&self, block: &Arc<Block>) {
        self.block_cache.lock().put(block.hash(), Arc::clone(block));
    }

    pub(crate) fn report_bad_block(&self, block: &Block, reason: &str) {
        let hash = block.hash();
        let header_json = serde_json::to_string(&block.header).unwrap_or_default();
        error!(
            number = block.number(),
            hash = %hash,
            reason,
            header = %header_json,
            "bad block found"
        );
        self.bad_blocks.lock().put(
            hash,
            BadBlockReport { hash, number: block.number(), reason: reason.to_string() },
        );
    }
}
