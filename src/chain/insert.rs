//! The insertion state machine.
//!
//! Each block in a batch is classified before execution: already known,
//! too far in the future, orphaned, sitting on a pruned ancestor, or
//! ready. Ready blocks execute, validate and persist; the classification
//! outcomes route the rest without failing the batch. Events collect
//! during the batch and post after it commits.

use super::{Blockchain, WriteStatus};
use crate::error::{ChainError, Result};
use crate::events::ChainEventKind;
use crate::processor::execute;
use crate::state::StateView;
use crate::store::{schema, WriteBatch};
use crate::types::{Block, Hash, LogEntry, Receipt, Td};
use parking_lot::MutexGuard;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

use super::stats::InsertStats;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Attach the batch position to a hard failure so callers know where the
/// insertion stopped. Already-positioned errors pass through untouched.
fn batch_error(index: usize, cause: ChainError) -> ChainError {
    match cause {
        ChainError::BatchAborted { .. } => cause,
        cause => ChainError::BatchAborted { index, cause: Box::new(cause) },
    }
}

/// Stamp the final block hash into receipts and logs; the hash is not
/// known during execution.
fn hydrate(mut receipts: Vec<Receipt>, hash: Hash) -> (Vec<Receipt>, Vec<LogEntry>) {
    let mut logs = Vec::new();
    for receipt in &mut receipts {
        for log in &mut receipt.logs {
            log.block_hash = hash;
            logs.push(log.clone());
        }
    }
    (receipts, logs)
}

impl Blockchain {
    /// Insert a batch of blocks, which must be linked and ascending.
    /// Returns how many were processed; events post after the batch. A
    /// hard failure carries the offending batch position.
    pub fn insert_chain(&self, blocks: Vec<Block>) -> Result<usize> {
        self.insert_chain_inner(blocks, true)
    }

    /// Like [`insert_chain`](Self::insert_chain) but without posting the
    /// batch's chain events, for imports whose blocks the caller already
    /// announced. Reorg retirement events still fire.
    pub fn insert_chain_silent(&self, blocks: Vec<Block>) -> Result<usize> {
        self.insert_chain_inner(blocks, false)
    }

    pub fn insert_block(&self, block: Block) -> Result<usize> {
        self.insert_chain(vec![block])
    }

    fn insert_chain_inner(&self, blocks: Vec<Block>, notify: bool) -> Result<usize> {
        for (index, window) in blocks.windows(2).enumerate() {
            let prev_hash = window[0].hash();
            if window[1].number() != window[0].number() + 1
                || window[1].parent_hash() != prev_hash
            {
                return Err(ChainError::NonContiguous {
                    index: index + 1,
                    number: window[1].number(),
                    parent: window[1].parent_hash(),
                    prev_hash,
                });
            }
        }

        let blocks: Vec<Arc<Block>> = blocks.into_iter().map(Arc::new).collect();
        let mut guard = Some(self.insert_lock.lock());
        self.insert_guarded(&blocks, &mut guard, notify)
    }

    fn insert_guarded<'a>(
        &'a self,
        blocks: &[Arc<Block>],
        guard: &mut Option<MutexGuard<'a, ()>>,
        notify: bool,
    ) -> Result<usize> {
        if blocks.is_empty() {
            return Ok(0);
        }
        if !self.is_running() {
            return Err(ChainError::Aborted);
        }

        // Verify every header concurrently up front; outcomes are
        // consumed per block so an orphan can still be routed to the
        // future queue instead of failing the batch.
        let headers: Vec<_> = blocks.iter().map(|b| b.header.clone()).collect();
        let seals = vec![true; headers.len()];
        let reader = Arc::new(crate::headers::DbHeaderReader { store: Arc::clone(&self.store) });
        let (_abort, verify_rx) = crate::consensus::verify_headers(
            Arc::clone(&self.engine),
            reader,
            headers,
            seals,
            self.config.worker_count(),
        );
        let mut verify: Vec<Result<()>> = Vec::with_capacity(blocks.len());
        for _ in 0..blocks.len() {
            verify.push(verify_rx.recv().unwrap_or(Err(ChainError::Aborted)));
        }

        let mut stats = InsertStats::new();
        let mut events: Vec<ChainEventKind> = Vec::new();
        let mut last_canonical: Option<Arc<Block>> = None;
        let mut processed = 0usize;

        let mut index = 0usize;
        while index < blocks.len() {
            let block = &blocks[index];
            if self.interrupt.load(Ordering::SeqCst) {
                debug!("premature abort during block insertion");
                break;
            }

            let hash = block.hash();
            if self.bad_hashes.contains(&hash) {
                self.report_bad_block(block, "hash on deny-list");
                return Err(batch_error(index, ChainError::BlacklistedHash(hash)));
            }

            let now = unix_now();
            if block.header.timestamp > now + self.config.allowed_future_secs {
                if block.header.timestamp > now + self.config.max_future_secs {
                    return Err(batch_error(
                        index,
                        ChainError::FutureBlock {
                            timestamp: block.header.timestamp,
                            limit: now + self.config.max_future_secs,
                        },
                    ));
                }
                self.future_blocks.lock().put(hash, Arc::clone(block));
                stats.queued += 1;
                index += 1;
                continue;
            }

            match std::mem::replace(&mut verify[index], Ok(())) {
                Ok(()) => {}
                Err(ChainError::UnknownAncestor) => {
                    if self.future_blocks.lock().contains(&block.parent_hash()) {
                        self.future_blocks.lock().put(hash, Arc::clone(block));
                        stats.queued += 1;
                        index += 1;
                        continue;
                    }
                    return Err(batch_error(index, ChainError::UnknownAncestor));
                }
                Err(e) => {
                    self.report_bad_block(block, &e.to_string());
                    return Err(batch_error(index, e));
                }
            }

            match self.validator.validate_body(block) {
                Ok(()) => {}
                Err(ChainError::KnownBlock) => {
                    // Fully present already. A rollback can leave the
                    // head below a known block though, and then it must
                    // run through processing again to be re-adopted.
                    if self.current_block().number() >= block.number() {
                        stats.ignored += 1;
                        index += 1;
                        continue;
                    }
                }
                Err(ChainError::UnknownAncestor) => {
                    if self.future_blocks.lock().contains(&block.parent_hash()) {
                        self.future_blocks.lock().put(hash, Arc::clone(block));
                        stats.queued += 1;
                        index += 1;
                        continue;
                    }
                    return Err(batch_error(index, ChainError::UnknownAncestor));
                }
                Err(ChainError::PrunedAncestor) => {
                    // The parent's block data survives but its state was
                    // collected. Only a branch outweighing the local
                    // head is worth recomputing; a lighter one is stored
                    // with its difficulty and no state until it catches
                    // up.
                    let parent_td = self
                        .headers
                        .td(&block.parent_hash(), block.number().wrapping_sub(1))
                        .ok_or_else(|| batch_error(index, ChainError::UnknownAncestor))?;
                    let ext_td = parent_td + block.difficulty() as Td;
                    let current = self.current_block();
                    let local_td =
                        self.headers.td(&current.hash(), current.number()).unwrap_or(0);
                    if local_td > ext_td {
                        self.write_block_without_state(block, ext_td)
                            .map_err(|e| batch_error(index, e))?;
                        self.cache_block(block);
                        debug!(
                            number = block.number(),
                            hash = %hash.short(),
                            td = ext_td,
                            "stored losing side block without state"
                        );
                        stats.ignored += 1;
                        index += 1;
                        continue;
                    }

                    // The branch wins: recompute the missing ancestor
                    // states first. The lock is released so the
                    // recursive import takes it like any other caller.
                    let ancestors =
                        self.pruned_ancestors(block).map_err(|e| batch_error(index, e))?;
                    debug!(
                        count = ancestors.len(),
                        number = block.number(),
                        "re-importing pruned ancestors"
                    );
                    drop(guard.take());
                    let outcome = self.insert_chain_inner(ancestors, notify);
                    *guard = Some(self.insert_lock.lock());
                    outcome?;
                    continue;
                }
                Err(e) => {
                    self.report_bad_block(block, &e.to_string());
                    return Err(batch_error(index, e));
                }
            }

            let parent = self
                .headers
                .header_by_hash(&block.parent_hash())
                .ok_or_else(|| batch_error(index, ChainError::UnknownAncestor))?;

            let (view, outcome) = match execute(
                self.state.as_ref(),
                self.processor.as_ref(),
                self.producers.as_ref(),
                self.engine.as_ref(),
                block,
                &parent,
            ) {
                Ok(result) => result,
                Err(e) => {
                    self.report_bad_block(block, &e.to_string());
                    return Err(batch_error(index, e));
                }
            };
            if let Err(e) =
                self.validator
                    .validate_state(block, &outcome.receipts, outcome.gas_used, view.root())
            {
                self.report_bad_block(block, &e.to_string());
                return Err(batch_error(index, e));
            }

            let (receipts, logs) = hydrate(outcome.receipts, hash);
            let status = self
                .write_block_with_state(block, &receipts, view)
                .map_err(|e| batch_error(index, e))?;
            match status {
                WriteStatus::Canonical => {
                    debug!(
                        number = block.number(),
                        hash = %hash.short(),
                        txs = block.transactions().len(),
                        gas = outcome.gas_used,
                        "inserted new block"
                    );
                    events.push(ChainEventKind::Chain { block: Arc::clone(block), hash, logs });
                    last_canonical = Some(Arc::clone(block));
                }
                WriteStatus::Side => {
                    debug!(
                        number = block.number(),
                        hash = %hash.short(),
                        diff = block.difficulty(),
                        "inserted forked block"
                    );
                    events.push(ChainEventKind::Side { block: Arc::clone(block) });
                }
            }
            processed += 1;
            stats.processed += 1;
            stats.used_gas += outcome.gas_used;
            stats.report(blocks, index);
            index += 1;
        }

        if let Some(head) = last_canonical {
            events.push(ChainEventKind::Head { block: head });
        }
        if notify {
            self.events.post_all(events);
        }
        Ok(processed)
    }

    /// The contiguous run of ancestors whose blocks survive but whose
    /// states were pruned, oldest first.
    fn pruned_ancestors(&self, block: &Block) -> Result<Vec<Block>> {
        let mut chain = Vec::new();
        let mut hash = block.parent_hash();
        let mut number = block.number().saturating_sub(1);
        loop {
            let parent = self.block(&hash, number).ok_or(ChainError::UnknownAncestor)?;
            if self.state.has_state(&parent.header.state_root) {
                break;
            }
            chain.push((*parent).clone());
            if number == 0 {
                break;
            }
            hash = parent.parent_hash();
            number -= 1;
        }
        chain.reverse();
        Ok(chain)
    }

    /// Persist a fully-validated block with its state and receipts, then
    /// run fork choice. The heavier total difficulty wins; on equal
    /// difficulty the lower height wins; an exact tie goes to the
    /// configured tie-break.
    pub fn write_block_with_state(
        &self,
        block: &Arc<Block>,
        receipts: &[Receipt],
        view: StateView,
    ) -> Result<WriteStatus> {
        let hash = block.hash();
        let number = block.number();

        let parent_td = self
            .headers
            .td(&block.parent_hash(), number.wrapping_sub(1))
            .ok_or(ChainError::UnknownAncestor)?;
        let current = self.current_block();
        let local_td = self.headers.td(&current.hash(), current.number()).unwrap_or(0);
        let ext_td = parent_td + block.difficulty() as Td;

        let root = view.commit(self.state.as_ref())?;
        self.state.reference(&root);

        let mut batch = WriteBatch::new();
        schema::write_td(&mut batch, &hash, number, ext_td);
        schema::write_block(&mut batch, block)?;
        schema::write_receipts(&mut batch, &hash, number, receipts)?;
        self.store.write(batch)?;

        self.gc_after_write(root, number)?;

        let takes_over = ext_td > local_td
            || (ext_td == local_td
                && (number < current.number()
                    || (number == current.number() && self.tie_break_prefers_new())));

        let status = if takes_over {
            if block.parent_hash() != current.hash() {
                self.reorg(current, block)?;
            }
            self.promote_canonical(block)?;
            self.future_blocks.lock().pop(&hash);
            WriteStatus::Canonical
        } else {
            WriteStatus::Side
        };
        self.cache_block(block);
        Ok(status)
    }

    /// Persist a block and its difficulty without state, for losing side
    /// branches on pruned ancestors and for data that arrived out of
    /// band (fast sync).
    pub fn write_block_without_state(&self, block: &Block, td: Td) -> Result<()> {
        let mut batch = WriteBatch::new();
        schema::write_td(&mut batch, &block.hash(), block.number(), td);
        schema::write_block(&mut batch, block)?;
        self.store.write(batch)?;
        Ok(())
    }
}
