//! Chain event feed.
//!
//! Events are posted after a batch commits, in commit order, and carry
//! everything a subscriber needs; no downcasting. Slow subscribers never
//! block insertion, and a dropped receiver is pruned on the next post.

use crate::types::{Block, Hash, LogEntry};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;

/// One chain notification.
#[derive(Clone)]
pub enum ChainEventKind {
    /// A block joined the canonical chain.
    Chain {
        block: Arc<Block>,
        hash: Hash,
        logs: Vec<LogEntry>,
    },
    /// The canonical head moved to this block.
    Head { block: Arc<Block> },
    /// A block was written to a side chain.
    Side { block: Arc<Block> },
    /// Logs from blocks that left the canonical chain during a reorg,
    /// with `removed` set.
    RemovedLogs { logs: Vec<LogEntry> },
}

impl ChainEventKind {
    /// Label for log lines and tests.
    pub fn kind(&self) -> &'static str {
        match self {
            ChainEventKind::Chain { .. } => "chain",
            ChainEventKind::Head { .. } => "head",
            ChainEventKind::Side { .. } => "side",
            ChainEventKind::RemovedLogs { .. } => "removed_logs",
        }
    }
}

/// Fan-out feed over crossbeam channels.
#[derive(Default)]
pub struct EventFeed {
    subscribers: Mutex<Vec<Sender<ChainEventKind>>>,
}

impl EventFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<ChainEventKind> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn post(&self, event: ChainEventKind) {
        let mut subs = self.subscribers.lock();
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn post_all(&self, events: Vec<ChainEventKind>) {
        for event in events {
            self.post(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Body, Header, Seal};

    fn block() -> Arc<Block> {
        Arc::new(Block::new(
            Header {
                number: 1,
                parent_hash: Hash::ZERO,
                state_root: Hash::ZERO,
                tx_root: Hash::ZERO,
                receipts_root: Hash::ZERO,
                difficulty: 1,
                gas_limit: 0,
                gas_used: 0,
                timestamp: 0,
                seal: Seal::default(),
            },
            Body::default(),
        ))
    }

    #[test]
    fn events_reach_every_subscriber_in_order() {
        let feed = EventFeed::new();
        let a = feed.subscribe();
        let b = feed.subscribe();

        let blk = block();
        feed.post(ChainEventKind::Side { block: Arc::clone(&blk) });
        feed.post(ChainEventKind::Head { block: blk });

        for rx in [a, b] {
            assert_eq!(rx.recv().unwrap().kind(), "side");
            assert_eq!(rx.recv().unwrap().kind(), "head");
        }
    }

    #[test]
    fn dropped_subscriber_is_pruned() {
        let feed = EventFeed::new();
        let rx = feed.subscribe();
        drop(rx);

        feed.post(ChainEventKind::RemovedLogs { logs: vec![] });
        assert_eq!(feed.subscriber_count(), 0);
    }
}
