//! Persistence layer: the key-value store abstraction and the typed schema
//! on top of it.
//!
//! Implementations provide raw byte get/put/delete/has plus an atomic
//! batch; everything chain-shaped (headers, bodies, total difficulty,
//! canonical index, head pointers) lives in [`schema`].

pub mod memory;
pub mod schema;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::Result;

/// A buffered set of writes applied atomically via
/// [`PersistentStore::write`].
#[derive(Default)]
pub struct WriteBatch {
    pub(crate) ops: Vec<BatchOp>,
}

pub(crate) enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put(key, value));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete(key));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Abstraction over the node's persistent key-value store. Implementations
/// must be safe for concurrent readers during an insertion.
pub trait PersistentStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;
    fn delete(&self, key: &[u8]) -> Result<()>;
    fn has(&self, key: &[u8]) -> Result<bool>;

    /// Apply a batch of writes atomically: either all ops land or none.
    fn write(&self, batch: WriteBatch) -> Result<()>;
}
