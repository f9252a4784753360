//! Trie garbage collection.
//!
//! Every accepted block pins its state root in memory. Once the chain
//! grows past the retention window the oldest pins are released, and the
//! state falling out of the window is flushed to disk first whenever the
//! memory or time thresholds say so. Shutdown flushes the head, its
//! parent and the oldest retained state so a restart finds something
//! recent to stand on.

use super::Blockchain;
use crate::error::Result;
use crate::types::Hash;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::collections::HashSet;
use std::time::Instant;
use tracing::{error, info};

/// Pinned state roots ordered oldest-first, plus the flush clock.
pub(crate) struct TrieGc {
    pins: BinaryHeap<Reverse<(u64, Hash)>>,
    last_flush: Instant,
}

impl TrieGc {
    pub(crate) fn new() -> Self {
        TrieGc { pins: BinaryHeap::new(), last_flush: Instant::now() }
    }

    fn pin(&mut self, number: u64, root: Hash) {
        self.pins.push(Reverse((number, root)));
    }

    /// Pop every pin at or below `limit`, oldest first.
    fn release_upto(&mut self, limit: u64) -> Vec<(u64, Hash)> {
        let mut released = Vec::new();
        while let Some(Reverse((number, root))) = self.pins.peek().copied() {
            if number > limit {
                break;
            }
            self.pins.pop();
            released.push((number, root));
        }
        released
    }

    fn drain(&mut self) -> Vec<(u64, Hash)> {
        self.release_upto(u64::MAX)
    }
}

impl Blockchain {
    /// Account for a freshly written state root: commit immediately in
    /// archive mode, otherwise pin it and enforce the retention window.
    pub(crate) fn gc_after_write(&self, root: Hash, number: u64) -> Result<()> {
        if self.config.disable_trie_gc {
            self.state.commit_root(&root)?;
            self.state.dereference(&root);
            return Ok(());
        }

        let retention = self.config.retention_window;
        let mut gc = self.triegc.lock();
        gc.pin(number, root);

        if number <= retention {
            return Ok(());
        }
        let chosen = number - retention;

        // Flush the state leaving the window when memory or elapsed time
        // crosses the configured thresholds.
        let size = self.state.memory_size();
        let elapsed = gc.last_flush.elapsed();
        let over_size = size > self.config.trie_node_limit_bytes;
        let over_time = elapsed > self.config.trie_time_limit();
        if over_size || over_time {
            if let Some(header) = self.headers.header_by_number(chosen) {
                self.state.commit_root(&header.state_root)?;
                gc.last_flush = Instant::now();
                info!(
                    number = chosen,
                    memory = size,
                    elapsed_ms = elapsed.as_millis() as u64,
                    forced_by_time = over_time,
                    "committed recent state to disk"
                );
            }
        }

        for (_, old_root) in gc.release_upto(chosen) {
            self.state.dereference(&old_root);
        }
        Ok(())
    }

    /// Shutdown flush: commit the states a restart will want, release
    /// everything else.
    pub(crate) fn flush_recent_states(&self) {
        let head = self.current_block();
        let retention = self.config.retention_window;

        let mut flushed: HashSet<Hash> = HashSet::new();
        for offset in [0, 1, retention - 1] {
            if head.number() < offset {
                continue;
            }
            let number = head.number() - offset;
            let Some(header) = self.headers.header_by_number(number) else { continue };
            if !flushed.insert(header.state_root) {
                continue;
            }
            match self.state.commit_root(&header.state_root) {
                Ok(()) => info!(number, root = %header.state_root.short(), "writing cached state to disk"),
                Err(e) => error!(number, error = %e, "failed to commit recent state"),
            }
        }

        let mut gc = self.triegc.lock();
        for (_, root) in gc.drain() {
            self.state.dereference(&root);
        }
        if self.state.memory_size() > 0 {
            error!("dangling state in memory after shutdown flush");
        }
    }
}
