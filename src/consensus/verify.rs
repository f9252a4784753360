//! Concurrent header verification.
//!
//! A fixed pool of worker threads verifies a batch of headers, with
//! results delivered over a channel in submission order as soon as each
//! becomes available. Every channel in the pipeline is bounded, so the
//! pool never runs far ahead of the consumer. The returned [`AbortHandle`]
//! cancels outstanding work: workers check it before starting a unit,
//! in-flight units may finish, and no thread ever blocks forever on a
//! channel whose receiver is gone.

use super::{ConsensusEngine, HeaderReader};
use crate::error::Result;
use crate::types::{Hash, Header, Td};
use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const SEND_POLL: Duration = Duration::from_millis(25);

/// Cancellation token for a running verification batch.
#[derive(Clone)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
}

impl AbortHandle {
    fn new() -> Self {
        AbortHandle { flag: Arc::new(AtomicBool::new(false)) }
    }

    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Send that gives up once the batch is aborted or the receiver is gone.
fn send_guarded<T>(tx: &Sender<T>, flag: &AtomicBool, mut msg: T) -> bool {
    loop {
        if flag.load(Ordering::SeqCst) {
            return false;
        }
        match tx.send_timeout(msg, SEND_POLL) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(returned)) => msg = returned,
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

/// Resolves parents inside the batch being verified before falling back
/// to the database, so headers chained on each other verify in one pass.
struct BatchReader {
    inner: Arc<dyn HeaderReader>,
    batch: HashMap<Hash, Header>,
}

impl HeaderReader for BatchReader {
    fn header(&self, hash: &Hash, number: u64) -> Option<Header> {
        if let Some(h) = self.batch.get(hash) {
            return Some(h.clone());
        }
        self.inner.header(hash, number)
    }

    fn total_difficulty(&self, hash: &Hash, number: u64) -> Option<Td> {
        self.inner.total_difficulty(hash, number)
    }
}

/// Verify `headers` on `workers` threads. `seals[i]` gates the seal check
/// for the matching header; a short `seals` slice defaults to checking.
///
/// The receiver yields one `Result` per header in input order. After an
/// abort the stream ends early; at most `2 * workers` further results
/// arrive once [`AbortHandle::abort`] returns.
pub fn verify_headers(
    engine: Arc<dyn ConsensusEngine>,
    reader: Arc<dyn HeaderReader>,
    headers: Vec<Header>,
    seals: Vec<bool>,
    workers: usize,
) -> (AbortHandle, Receiver<Result<()>>) {
    let total = headers.len();
    let workers = workers.max(1).min(total.max(1));
    let handle = AbortHandle::new();

    let batch = Arc::new(BatchReader {
        inner: reader,
        batch: headers.iter().map(|h| (h.hash(), h.clone())).collect(),
    });

    // Tasks queue up to one per worker; finished units hand over at a
    // rendezvous; at most one extra result per worker sits in the output
    // buffer. Together that caps post-abort leakage at two results per
    // worker.
    let (task_tx, task_rx) = bounded::<(usize, Header, bool)>(workers);
    let (done_tx, done_rx) = bounded::<(usize, Result<()>)>(0);
    let (out_tx, out_rx) = bounded::<Result<()>>(workers);

    let feeder_flag = Arc::clone(&handle.flag);
    thread::spawn(move || {
        for (index, header) in headers.into_iter().enumerate() {
            let seal = seals.get(index).copied().unwrap_or(true);
            if !send_guarded(&task_tx, &feeder_flag, (index, header, seal)) {
                break;
            }
        }
    });

    for _ in 0..workers {
        let engine = Arc::clone(&engine);
        let batch = Arc::clone(&batch);
        let task_rx = task_rx.clone();
        let done_tx = done_tx.clone();
        let flag = Arc::clone(&handle.flag);
        thread::spawn(move || {
            while let Ok((index, header, seal)) = task_rx.recv() {
                if flag.load(Ordering::SeqCst) {
                    break;
                }
                let outcome = engine.verify_header(&*batch, &header, seal);
                if !send_guarded(&done_tx, &flag, (index, outcome)) {
                    break;
                }
            }
        });
    }
    drop(task_rx);
    drop(done_tx);

    // Reorder worker output into submission order.
    let collector_flag = Arc::clone(&handle.flag);
    thread::spawn(move || {
        let mut pending: BTreeMap<usize, Result<()>> = BTreeMap::new();
        let mut next = 0usize;
        while next < total {
            let (index, outcome) = match done_rx.recv() {
                Ok(pair) => pair,
                Err(_) => break,
            };
            pending.insert(index, outcome);
            while let Some(outcome) = pending.remove(&next) {
                if !send_guarded(&out_tx, &collector_flag, outcome) {
                    return;
                }
                next += 1;
            }
        }
    });

    (handle, out_rx)
}
