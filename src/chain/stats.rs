//! Import statistics with periodic reporting.

use crate::types::Block;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

const STATS_REPORT_INTERVAL: Duration = Duration::from_secs(8);

pub(crate) struct InsertStats {
    pub processed: usize,
    pub queued: usize,
    pub ignored: usize,
    pub used_gas: u64,
    start: Instant,
    last_report: Instant,
}

impl InsertStats {
    pub(crate) fn new() -> Self {
        let now = Instant::now();
        InsertStats {
            processed: 0,
            queued: 0,
            ignored: 0,
            used_gas: 0,
            start: now,
            last_report: now,
        }
    }

    /// Log a progress line at the end of the batch or every report
    /// interval during a long import.
    pub(crate) fn report(&mut self, blocks: &[Arc<Block>], index: usize) {
        let at_end = index == blocks.len() - 1;
        if !at_end && self.last_report.elapsed() < STATS_REPORT_INTERVAL {
            return;
        }
        let end = &blocks[index];
        info!(
            blocks = self.processed,
            queued = self.queued,
            ignored = self.ignored,
            gas = self.used_gas,
            number = end.number(),
            hash = %end.hash().short(),
            elapsed_ms = self.start.elapsed().as_millis() as u64,
            "imported new chain segment"
        );
        self.last_report = Instant::now();
    }
}
