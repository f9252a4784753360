//! Error types for chaincore

use crate::types::Hash;
use thiserror::Error;

/// Errors produced by chain acceptance, validation and persistence.
///
/// The classification variants (`KnownBlock`, `FutureBlock`,
/// `UnknownAncestor`, `PrunedAncestor`) are matched by the insertion loop
/// to route blocks through the acceptance state machine; they only escape
/// as hard errors where the operation says so.
#[derive(Debug, Error)]
pub enum ChainError {
    /// Block (and its state) is already fully present.
    #[error("block already known")]
    KnownBlock,

    /// Header timestamp is ahead of the local clock tolerance.
    #[error("future block: timestamp {timestamp} > limit {limit}")]
    FutureBlock { timestamp: u64, limit: u64 },

    /// Parent is entirely unknown to the chain.
    #[error("unknown ancestor")]
    UnknownAncestor,

    /// Parent block exists but its state has been pruned.
    #[error("pruned ancestor")]
    PrunedAncestor,

    /// Hash is on the configured deny-list.
    #[error("blacklisted hash {0}")]
    BlacklistedHash(Hash),

    /// Batch items do not form a linked, ascending sequence.
    #[error("non contiguous insert: item {index} is #{number}, parent {parent} does not match previous {prev_hash}")]
    NonContiguous {
        index: usize,
        number: u64,
        parent: Hash,
        prev_hash: Hash,
    },

    /// A batch insertion failed at a specific position; `cause` is the
    /// error of the offending block.
    #[error("block {index} of batch failed: {cause}")]
    BatchAborted { index: usize, cause: Box<ChainError> },

    /// Reorg walked off the end of one of the two chains.
    #[error("invalid chain during reorg: {0}")]
    InvalidChain(&'static str),

    #[error("invalid seal: {0}")]
    InvalidSeal(String),

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("invalid body: {0}")]
    InvalidBody(String),

    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("state root mismatch: header {expected}, computed {got}")]
    StateRootMismatch { expected: Hash, got: Hash },

    #[error("gas used mismatch: header {expected}, computed {got}")]
    GasMismatch { expected: u64, got: u64 },

    #[error("gas limit reached: requested {requested}, remaining {remaining}")]
    OutOfGas { requested: u64, remaining: u64 },

    /// No state view can be opened at the given root.
    #[error("state unavailable for root {0}")]
    StateUnavailable(Hash),

    #[error("genesis not found in chain")]
    MissingGenesis,

    /// Batch/verification cut short by shutdown.
    #[error("aborted")]
    Aborted,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("config error: {0}")]
    Config(String),
}

impl ChainError {
    /// Position of the failing item within its batch, where one is known.
    pub fn batch_index(&self) -> Option<usize> {
        match self {
            ChainError::BatchAborted { index, .. } => Some(*index),
            ChainError::NonContiguous { index, .. } => Some(*index),
            _ => None,
        }
    }

    /// The underlying failure, with any batch position unwrapped.
    pub fn root_cause(&self) -> &ChainError {
        match self {
            ChainError::BatchAborted { cause, .. } => cause.root_cause(),
            other => other,
        }
    }
}

impl From<rusqlite::Error> for ChainError {
    fn from(err: rusqlite::Error) -> Self {
        ChainError::Storage(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for ChainError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        ChainError::Codec(err.to_string())
    }
}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::Storage(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, ChainError>;
