//! Reference-counted state engine over the key-value store.
//!
//! Fresh states live in an in-memory map keyed by root. `reference` pins
//! a root, `dereference` unpins and drops unpinned uncommitted entries,
//! `commit_root` flushes the blob to the store so it survives restarts
//! and eviction. This is the behavior the trie garbage collector drives.

use super::{StateEngine, StateView};
use crate::error::{ChainError, Result};
use crate::store::{schema, PersistentStore};
use crate::types::Hash;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

struct NodeEntry {
    blob: Vec<u8>,
    refs: usize,
    committed: bool,
}

pub struct MemoryStateEngine {
    store: Arc<dyn PersistentStore>,
    nodes: Mutex<HashMap<Hash, NodeEntry>>,
}

impl MemoryStateEngine {
    pub fn new(store: Arc<dyn PersistentStore>) -> Self {
        MemoryStateEngine { store, nodes: Mutex::new(HashMap::new()) }
    }

    /// Number of states currently held in memory, for assertions.
    pub fn in_memory(&self) -> usize {
        self.nodes.lock().len()
    }
}

impl StateEngine for MemoryStateEngine {
    fn view(&self, root: &Hash) -> Result<StateView> {
        if let Some(entry) = self.nodes.lock().get(root) {
            return Ok(bincode::deserialize(&entry.blob)?);
        }
        match schema::read_state_blob(self.store.as_ref(), root)? {
            Some(blob) => Ok(bincode::deserialize(&blob)?),
            None => Err(ChainError::StateUnavailable(*root)),
        }
    }

    fn has_state(&self, root: &Hash) -> bool {
        if self.nodes.lock().contains_key(root) {
            return true;
        }
        schema::has_state_blob(self.store.as_ref(), root).unwrap_or(false)
    }

    fn insert(&self, view: StateView) -> Result<Hash> {
        let root = view.root();
        let blob = bincode::serialize(&view)?;
        self.nodes
            .lock()
            .entry(root)
            .or_insert(NodeEntry { blob, refs: 0, committed: false });
        Ok(root)
    }

    fn reference(&self, root: &Hash) {
        if let Some(entry) = self.nodes.lock().get_mut(root) {
            entry.refs += 1;
        }
    }

    fn dereference(&self, root: &Hash) {
        let mut nodes = self.nodes.lock();
        if let Some(entry) = nodes.get_mut(root) {
            entry.refs = entry.refs.saturating_sub(1);
            if entry.refs == 0 {
                // Committed states are already durable; either way the
                // memory copy goes.
                nodes.remove(root);
            }
        }
    }

    fn commit_root(&self, root: &Hash) -> Result<()> {
        let mut nodes = self.nodes.lock();
        match nodes.get_mut(root) {
            Some(entry) => {
                schema::write_state_blob(self.store.as_ref(), root, &entry.blob)?;
                entry.committed = true;
                Ok(())
            }
            // Already flushed and evicted, or never existed; only error
            // when the store has no copy either.
            None => {
                if schema::has_state_blob(self.store.as_ref(), root)? {
                    Ok(())
                } else {
                    Err(ChainError::StateUnavailable(*root))
                }
            }
        }
    }

    fn memory_size(&self) -> usize {
        self.nodes.lock().values().map(|e| e.blob.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::Address;

    fn engine() -> MemoryStateEngine {
        MemoryStateEngine::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn uncommitted_state_vanishes_on_dereference() {
        let engine = engine();
        let mut view = StateView::default();
        view.add_balance(&Address::from_low_u64(1), 50);
        let root = view.commit(&engine).unwrap();

        engine.reference(&root);
        assert!(engine.has_state(&root));
        engine.dereference(&root);
        assert!(!engine.has_state(&root));
        assert!(matches!(engine.view(&root), Err(ChainError::StateUnavailable(_))));
    }

    #[test]
    fn committed_state_survives_eviction() {
        let engine = engine();
        let mut view = StateView::default();
        view.add_balance(&Address::from_low_u64(2), 7);
        let root = view.commit(&engine).unwrap();

        engine.reference(&root);
        engine.commit_root(&root).unwrap();
        engine.dereference(&root);

        assert_eq!(engine.in_memory(), 0);
        assert!(engine.has_state(&root));
        let reopened = engine.view(&root).unwrap();
        assert_eq!(reopened.balance(&Address::from_low_u64(2)), 7);
    }

    #[test]
    fn memory_size_tracks_live_blobs() {
        let engine = engine();
        assert_eq!(engine.memory_size(), 0);

        let mut view = StateView::default();
        view.add_balance(&Address::from_low_u64(3), 1);
        let root = view.commit(&engine).unwrap();
        engine.reference(&root);
        assert!(engine.memory_size() > 0);

        engine.dereference(&root);
        assert_eq!(engine.memory_size(), 0);
    }
}
