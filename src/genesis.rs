//! Genesis bootstrap.
//!
//! Parsing a genesis file is someone else's job; this module takes an
//! already-decided genesis (allocation plus header parameters) and seeds
//! the store: state, block, total difficulty, canonical index and all
//! three head pointers. The chain constructor refuses to start without
//! block zero present.

use crate::error::Result;
use crate::state::{StateEngine, StateView};
use crate::store::{schema, PersistentStore, WriteBatch};
use crate::types::{Address, Block, Body, Hash, Header, Seal, Td};

/// Everything needed to mint block zero.
pub struct GenesisSpec {
    pub difficulty: u64,
    pub gas_limit: u64,
    pub timestamp: u64,
    /// Initial balances.
    pub alloc: Vec<(Address, u128)>,
}

impl Default for GenesisSpec {
    fn default() -> Self {
        GenesisSpec {
            difficulty: 100,
            gas_limit: 8_000_000,
            timestamp: 0,
            alloc: Vec::new(),
        }
    }
}

impl GenesisSpec {
    /// The genesis state, before commit.
    pub fn state(&self) -> StateView {
        let mut view = StateView::default();
        for (address, balance) in &self.alloc {
            view.add_balance(address, *balance);
        }
        view
    }

    /// The genesis block this spec produces. Pure; does not touch storage.
    pub fn block(&self) -> Block {
        let body = Body::default();
        Block::new(
            Header {
                number: 0,
                parent_hash: Hash::ZERO,
                state_root: self.state().root(),
                tx_root: body.tx_root(),
                receipts_root: crate::types::receipts_root(&[]),
                difficulty: self.difficulty,
                gas_limit: self.gas_limit,
                gas_used: 0,
                timestamp: self.timestamp,
                seal: Seal::default(),
            },
            body,
        )
    }

    /// Write the genesis block, its state and the head pointers. Safe to
    /// call on a store that already holds this genesis.
    pub fn commit(&self, store: &dyn PersistentStore, state: &dyn StateEngine) -> Result<Block> {
        let view = self.state();
        let root = view.commit(state)?;
        state.reference(&root);
        state.commit_root(&root)?;
        // Durable on disk now; no need to hold the memory copy.
        state.dereference(&root);

        let block = self.block();
        let hash = block.hash();

        let mut batch = WriteBatch::new();
        schema::write_block(&mut batch, &block)?;
        schema::write_td(&mut batch, &hash, 0, self.difficulty as Td);
        schema::write_canonical_hash(&mut batch, &hash, 0);
        schema::write_head_block_hash(&mut batch, &hash);
        schema::write_head_header_hash(&mut batch, &hash);
        schema::write_head_fast_hash(&mut batch, &hash);
        store.write(batch)?;
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStateEngine;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    #[test]
    fn commit_seeds_block_state_and_heads() {
        let store = Arc::new(MemoryStore::new());
        let state = MemoryStateEngine::new(store.clone() as Arc<dyn PersistentStore>);

        let spec = GenesisSpec {
            alloc: vec![(Address::from_low_u64(1), 500)],
            ..GenesisSpec::default()
        };
        let block = spec.commit(store.as_ref(), &state).unwrap();
        let hash = block.hash();

        assert_eq!(schema::read_canonical_hash(store.as_ref(), 0).unwrap(), Some(hash));
        assert_eq!(schema::read_head_block_hash(store.as_ref()).unwrap(), Some(hash));
        assert_eq!(schema::read_td(store.as_ref(), &hash, 0).unwrap(), Some(100));
        assert!(state.has_state(&block.header.state_root));

        let view = state.view(&block.header.state_root).unwrap();
        assert_eq!(view.balance(&Address::from_low_u64(1)), 500);
    }

    #[test]
    fn genesis_hash_depends_on_alloc() {
        let plain = GenesisSpec::default();
        let funded = GenesisSpec {
            alloc: vec![(Address::from_low_u64(7), 1)],
            ..GenesisSpec::default()
        };
        assert_ne!(plain.block().hash(), funded.block().hash());
    }
}
