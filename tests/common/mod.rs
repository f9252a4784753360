//! Shared harness for chain integration tests.
#![allow(dead_code)]

use chaincore::chain::Blockchain;
use chaincore::config::ChainConfig;
use chaincore::consensus::NoSealEngine;
use chaincore::genesis::GenesisSpec;
use chaincore::processor::{BlockBuilder, ProducerRegistry, TransferProcessor};
use chaincore::state::{MemoryStateEngine, StateEngine};
use chaincore::store::{MemoryStore, PersistentStore};
use chaincore::types::{Address, Block, Header, Transaction};
use std::sync::{Arc, Once};

pub const FUNDED: u64 = 1;

static TRACING: Once = Once::new();

/// Route crate logs through the captured test output, once per process.
fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

pub fn addr(n: u64) -> Address {
    Address::from_low_u64(n)
}

pub fn transfer(nonce: u64, value: u128) -> Transaction {
    Transaction {
        from: addr(FUNDED),
        to: addr(2),
        value,
        nonce,
        gas: 21_000,
        payload: vec![],
    }
}

pub struct Harness {
    pub store: Arc<dyn PersistentStore>,
    pub state: Arc<MemoryStateEngine>,
    pub chain: Arc<Blockchain>,
    pub builder: BlockBuilder,
    pub genesis: Block,
}

impl Harness {
    /// Child of `parent` carrying `txs`, executed so it passes state
    /// validation.
    pub fn build(
        &self,
        parent: &Header,
        txs: Vec<Transaction>,
        difficulty: u64,
    ) -> Result<Block, Box<dyn std::error::Error>> {
        Ok(self.builder.build(parent, txs, difficulty, parent.timestamp + 10)?)
    }

    /// A linear run of `count` empty-ish blocks on top of `parent`, one
    /// transfer each so every state root is distinct.
    pub fn extend(
        &self,
        parent: &Header,
        count: usize,
        start_nonce: u64,
        difficulty: u64,
    ) -> Result<Vec<Block>, Box<dyn std::error::Error>> {
        let mut blocks = Vec::with_capacity(count);
        let mut parent = parent.clone();
        for i in 0..count {
            let block = self.build(&parent, vec![transfer(start_nonce + i as u64, 1)], difficulty)?;
            parent = block.header.clone();
            blocks.push(block);
        }
        Ok(blocks)
    }

    /// Drop the builder's scratch copies of these blocks' states, leaving
    /// only what the chain itself pinned. For forks that must look pruned
    /// to the insertion machinery.
    pub fn forget_built_states(&self, blocks: &[Block]) {
        for block in blocks {
            self.state.dereference(&block.header.state_root);
        }
    }
}

pub fn genesis_spec() -> GenesisSpec {
    GenesisSpec {
        difficulty: 100,
        gas_limit: 8_000_000,
        timestamp: 1_000,
        alloc: vec![(addr(FUNDED), 1_000_000_000)],
    }
}

/// Chain over a fresh in-memory store.
pub fn harness(config: ChainConfig) -> Result<Harness, Box<dyn std::error::Error>> {
    harness_over(Arc::new(MemoryStore::new()), config)
}

/// Chain over an existing store, seeding genesis if absent. The state
/// engine is always fresh, as after a process restart.
pub fn harness_over(
    store: Arc<dyn PersistentStore>,
    config: ChainConfig,
) -> Result<Harness, Box<dyn std::error::Error>> {
    init_tracing();
    let state = Arc::new(MemoryStateEngine::new(Arc::clone(&store)));
    let spec = genesis_spec();
    // Seed genesis only on a virgin store; reopening must keep the
    // persisted head pointers.
    let genesis = if chaincore::store::schema::read_canonical_hash(store.as_ref(), 0)?.is_none() {
        spec.commit(store.as_ref(), state.as_ref())?
    } else {
        spec.block()
    };

    let chain = Blockchain::new(
        store.clone(),
        state.clone() as Arc<dyn StateEngine>,
        Arc::new(NoSealEngine::new()),
        config,
    )?;
    let builder = BlockBuilder::new(
        state.clone() as Arc<dyn StateEngine>,
        Arc::new(TransferProcessor::new()),
        Arc::new(ProducerRegistry::new()),
        Arc::new(NoSealEngine::new()),
    );
    Ok(Harness { store, state, chain, builder, genesis })
}
