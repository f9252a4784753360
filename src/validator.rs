//! Block validation: structural checks before execution, semantic checks
//! after.
//!
//! `validate_body` classifies a block for the insertion state machine by
//! returning `KnownBlock`, `UnknownAncestor` or `PrunedAncestor` where
//! those apply; the insertion loop pattern-matches on them rather than
//! treating them as failures.

use crate::error::{ChainError, Result};
use crate::state::StateEngine;
use crate::store::{schema, PersistentStore};
use crate::types::{receipts_root, Block, Hash, Receipt};
use std::sync::Arc;

pub trait BlockValidator: Send + Sync {
    /// Structural checks that need no execution: presence, ancestry,
    /// transaction commitment.
    fn validate_body(&self, block: &Block) -> Result<()>;

    /// Compare the header's claims against what execution produced.
    fn validate_state(
        &self,
        block: &Block,
        receipts: &[Receipt],
        gas_used: u64,
        computed_root: Hash,
    ) -> Result<()>;
}

pub struct CoreValidator {
    store: Arc<dyn PersistentStore>,
    state: Arc<dyn StateEngine>,
}

impl CoreValidator {
    pub fn new(store: Arc<dyn PersistentStore>, state: Arc<dyn StateEngine>) -> Self {
        CoreValidator { store, state }
    }
}

impl BlockValidator for CoreValidator {
    fn validate_body(&self, block: &Block) -> Result<()> {
        let hash = block.hash();
        let store = self.store.as_ref();

        if schema::has_body(store, &hash, block.number())?
            && self.state.has_state(&block.header.state_root)
        {
            return Err(ChainError::KnownBlock);
        }

        let parent_number = block.number().wrapping_sub(1);
        let parent = match schema::read_header(store, &block.parent_hash(), parent_number)? {
            Some(parent) => parent,
            None => return Err(ChainError::UnknownAncestor),
        };
        if !schema::has_body(store, &block.parent_hash(), parent_number)? {
            return Err(ChainError::UnknownAncestor);
        }
        if !self.state.has_state(&parent.state_root) {
            return Err(ChainError::PrunedAncestor);
        }

        let tx_root = block.body.tx_root();
        if tx_root != block.header.tx_root {
            return Err(ChainError::InvalidBody(format!(
                "transaction root mismatch: header {}, computed {}",
                block.header.tx_root, tx_root
            )));
        }
        Ok(())
    }

    fn validate_state(
        &self,
        block: &Block,
        receipts: &[Receipt],
        gas_used: u64,
        computed_root: Hash,
    ) -> Result<()> {
        if gas_used != block.header.gas_used {
            return Err(ChainError::GasMismatch {
                expected: block.header.gas_used,
                got: gas_used,
            });
        }
        let root = receipts_root(receipts);
        if root != block.header.receipts_root {
            return Err(ChainError::InvalidBody(format!(
                "receipts root mismatch: header {}, computed {}",
                block.header.receipts_root, root
            )));
        }
        if computed_root != block.header.state_root {
            return Err(ChainError::StateRootMismatch {
                expected: block.header.state_root,
                got: computed_root,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{MemoryStateEngine, StateView};
    use crate::store::{MemoryStore, WriteBatch};
    use crate::types::{Body, Header, Seal};

    fn setup() -> (Arc<MemoryStore>, Arc<MemoryStateEngine>, CoreValidator) {
        let store = Arc::new(MemoryStore::new());
        let state = Arc::new(MemoryStateEngine::new(store.clone() as Arc<dyn PersistentStore>));
        let validator = CoreValidator::new(store.clone(), state.clone());
        (store, state, validator)
    }

    fn block_with_parent(parent: Option<&Block>, state_root: Hash) -> Block {
        let body = Body::default();
        Block::new(
            Header {
                number: parent.map(|p| p.number() + 1).unwrap_or(0),
                parent_hash: parent.map(|p| p.hash()).unwrap_or(Hash::ZERO),
                state_root,
                tx_root: body.tx_root(),
                receipts_root: receipts_root(&[]),
                difficulty: 100,
                gas_limit: 1_000_000,
                gas_used: 0,
                timestamp: parent.map(|p| p.header.timestamp + 10).unwrap_or(1_000),
                seal: Seal::default(),
            },
            body,
        )
    }

    #[test]
    fn classifies_unknown_and_pruned_ancestors() {
        let (store, state, validator) = setup();

        let root = StateView::default().commit(state.as_ref()).unwrap();
        state.reference(&root);
        let genesis = block_with_parent(None, root);
        let child = block_with_parent(Some(&genesis), root);

        // Parent absent entirely.
        assert!(matches!(validator.validate_body(&child), Err(ChainError::UnknownAncestor)));

        let mut batch = WriteBatch::new();
        schema::write_block(&mut batch, &genesis).unwrap();
        store.write(batch).unwrap();
        validator.validate_body(&child).unwrap();

        // Parent present but its state dropped.
        state.dereference(&root);
        assert!(matches!(validator.validate_body(&child), Err(ChainError::PrunedAncestor)));
    }

    #[test]
    fn known_block_is_reported_as_such() {
        let (store, state, validator) = setup();
        let root = StateView::default().commit(state.as_ref()).unwrap();
        state.reference(&root);

        let genesis = block_with_parent(None, root);
        let mut batch = WriteBatch::new();
        schema::write_block(&mut batch, &genesis).unwrap();
        store.write(batch).unwrap();

        assert!(matches!(validator.validate_body(&genesis), Err(ChainError::KnownBlock)));
    }

    #[test]
    fn state_checks_catch_each_mismatch() {
        let (_, state, validator) = setup();
        let root = StateView::default().commit(state.as_ref()).unwrap();
        let block = block_with_parent(None, root);

        assert!(matches!(
            validator.validate_state(&block, &[], 5, root),
            Err(ChainError::GasMismatch { .. })
        ));
        assert!(matches!(
            validator.validate_state(&block, &[], 0, Hash::of(b"other")),
            Err(ChainError::StateRootMismatch { .. })
        ));
        validator.validate_state(&block, &[], 0, root).unwrap();
    }
}
