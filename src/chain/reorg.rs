//! Chain reorganization: retire one canonical segment and adopt another.

use super::Blockchain;
use crate::error::{ChainError, Result};
use crate::events::ChainEventKind;
use crate::store::{schema, WriteBatch};
use crate::types::{Block, Hash, LogEntry};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

/// A retirement deeper than this is suspicious enough to warn about.
const REORG_WARN_DEPTH: usize = 63;

impl Blockchain {
    /// Switch the canonical chain from `old_head`'s branch to the branch
    /// ending in `new_head`. Rewrites the canonical index and transaction
    /// lookups back to the common ancestor and emits removed-log and
    /// side-chain events for the retired blocks. The caller promotes
    /// `new_head` itself afterwards.
    pub(crate) fn reorg(&self, old_head: Arc<Block>, new_head: &Arc<Block>) -> Result<()> {
        let mut old_chain: Vec<Arc<Block>> = Vec::new();
        let mut new_chain: Vec<Arc<Block>> = Vec::new();

        let mut old = old_head;
        let mut new = Arc::clone(new_head);

        while new.number() > old.number() {
            new_chain.push(Arc::clone(&new));
            new = self
                .block(&new.parent_hash(), new.number() - 1)
                .ok_or(ChainError::InvalidChain("new chain broke below fork block"))?;
        }
        while old.number() > new.number() {
            old_chain.push(Arc::clone(&old));
            old = self
                .block(&old.parent_hash(), old.number() - 1)
                .ok_or(ChainError::InvalidChain("old chain broke below head"))?;
        }
        while old.hash() != new.hash() {
            old_chain.push(Arc::clone(&old));
            new_chain.push(Arc::clone(&new));
            if old.number() == 0 {
                return Err(ChainError::InvalidChain("chains have no common ancestor"));
            }
            old = self
                .block(&old.parent_hash(), old.number() - 1)
                .ok_or(ChainError::InvalidChain("old chain broke during walk"))?;
            new = self
                .block(&new.parent_hash(), new.number() - 1)
                .ok_or(ChainError::InvalidChain("new chain broke during walk"))?;
        }
        let ancestor = old;

        if old_chain.len() >= REORG_WARN_DEPTH {
            warn!(
                depth = old_chain.len(),
                ancestor = ancestor.number(),
                "deep chain reorganization detected"
            );
        } else if !old_chain.is_empty() {
            info!(
                retired = old_chain.len(),
                adopted = new_chain.len(),
                ancestor = ancestor.number(),
                old_head = %old_chain[0].hash().short(),
                new_head = %new_head.hash().short(),
                "chain reorganization"
            );
        }

        let mut batch = WriteBatch::new();

        // Adopt the new branch below the head; the head itself is
        // promoted by the caller.
        let mut added_txs: HashSet<Hash> = new_head.transactions().iter().map(|t| t.hash()).collect();
        for block in new_chain.iter().skip(1) {
            schema::write_canonical_hash(&mut batch, &block.hash(), block.number());
            schema::write_tx_lookup_entries(&mut batch, block)?;
            for tx in block.transactions() {
                added_txs.insert(tx.hash());
            }
        }

        // Retire the old branch: lookups for transactions that did not
        // carry over, canonical entries above the new head, and logs
        // flagged as removed.
        let mut removed_logs: Vec<LogEntry> = Vec::new();
        for block in &old_chain {
            for tx in block.transactions() {
                let tx_hash = tx.hash();
                if !added_txs.contains(&tx_hash) {
                    schema::delete_tx_lookup(&mut batch, &tx_hash);
                }
            }
            if block.number() > new_head.number() {
                schema::delete_canonical_hash(&mut batch, block.number());
            }
            if let Some(receipts) = self.receipts_by_hash(&block.hash()) {
                for receipt in receipts {
                    for mut log in receipt.logs {
                        log.removed = true;
                        removed_logs.push(log);
                    }
                }
            }
        }

        self.store.write(batch)?;

        if !removed_logs.is_empty() {
            self.events.post(ChainEventKind::RemovedLogs { logs: removed_logs });
        }
        for block in old_chain {
            self.events.post(ChainEventKind::Side { block });
        }
        Ok(())
    }
}
