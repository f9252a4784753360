//! Shared head pointers.
//!
//! All three chain heads live in one immutable snapshot behind a single
//! lock, swapped as a whole. Readers clone the `Arc` and never observe a
//! half-updated head during an insertion or reorg.

use crate::types::{Block, Header};
use parking_lot::RwLock;
use std::sync::Arc;

/// One consistent view of the chain heads.
///
/// `block` is the head of the full chain (body and state present),
/// `header` the head of the header chain, `fast` the head of the
/// fast-sync chain. `header` is always at or ahead of `block`.
#[derive(Clone)]
pub struct HeadSnapshot {
    pub block: Arc<Block>,
    pub header: Arc<Header>,
    pub fast: Arc<Block>,
}

impl HeadSnapshot {
    /// Snapshot with all three heads on one block, as after genesis or a
    /// full reset.
    pub fn at_block(block: Arc<Block>) -> Self {
        HeadSnapshot {
            header: Arc::new(block.header.clone()),
            fast: Arc::clone(&block),
            block,
        }
    }
}

/// The swap point shared by the header store and the chain orchestrator.
pub struct HeadPointers {
    current: RwLock<Arc<HeadSnapshot>>,
}

impl HeadPointers {
    pub fn new(snapshot: HeadSnapshot) -> Self {
        HeadPointers { current: RwLock::new(Arc::new(snapshot)) }
    }

    pub fn snapshot(&self) -> Arc<HeadSnapshot> {
        Arc::clone(&self.current.read())
    }

    pub fn current_block(&self) -> Arc<Block> {
        Arc::clone(&self.current.read().block)
    }

    pub fn current_header(&self) -> Arc<Header> {
        Arc::clone(&self.current.read().header)
    }

    pub fn current_fast(&self) -> Arc<Block> {
        Arc::clone(&self.current.read().fast)
    }

    /// Replace the whole snapshot.
    pub fn swap(&self, snapshot: HeadSnapshot) {
        *self.current.write() = Arc::new(snapshot);
    }

    /// Advance the block head; the header head follows when it is behind.
    pub fn set_block(&self, block: Arc<Block>) {
        let mut guard = self.current.write();
        let mut next = (**guard).clone();
        if next.header.number < block.number() {
            next.header = Arc::new(block.header.clone());
        }
        next.block = block;
        *guard = Arc::new(next);
    }

    /// Point both the block and header heads at this block, regardless of
    /// direction. Used when a block is promoted to canonical head.
    pub fn set_canonical(&self, block: Arc<Block>) {
        let mut guard = self.current.write();
        let mut next = (**guard).clone();
        next.header = Arc::new(block.header.clone());
        next.block = block;
        *guard = Arc::new(next);
    }

    /// Advance the header head only.
    pub fn set_header(&self, header: Arc<Header>) {
        let mut guard = self.current.write();
        let mut next = (**guard).clone();
        next.header = header;
        *guard = Arc::new(next);
    }

    pub fn set_fast(&self, block: Arc<Block>) {
        let mut guard = self.current.write();
        let mut next = (**guard).clone();
        next.fast = block;
        *guard = Arc::new(next);
    }
}
