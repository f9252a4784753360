//! Consensus engine boundary.
//!
//! The chain core never interprets seals itself; it hands headers to a
//! [`ConsensusEngine`] and trusts its verdict. Engines read ancestors
//! through a [`HeaderReader`] so verification works the same against the
//! database or against an in-flight batch.

pub mod verify;

pub use verify::{verify_headers, AbortHandle};

use crate::error::{ChainError, Result};
use crate::state::StateView;
use crate::types::{Hash, Header, Td};

/// Read access to already-known headers, for parent lookups during
/// verification.
pub trait HeaderReader: Send + Sync {
    fn header(&self, hash: &Hash, number: u64) -> Option<Header>;
    fn total_difficulty(&self, hash: &Hash, number: u64) -> Option<Td>;
}

/// Seal-aware header verification plus block finalization.
pub trait ConsensusEngine: Send + Sync {
    /// Verify one header against its parent. `check_seal` gates the
    /// expensive proof check; structural checks always run.
    fn verify_header(
        &self,
        reader: &dyn HeaderReader,
        header: &Header,
        check_seal: bool,
    ) -> Result<()>;

    /// Apply consensus state transitions (rewards and the like) after the
    /// block's transactions have executed.
    fn finalize(&self, _header: &Header, _view: &mut StateView) -> Result<()> {
        Ok(())
    }
}

/// Engine that checks header structure but accepts any seal. Used in
/// tests and light contexts where seals were verified elsewhere.
#[derive(Default)]
pub struct NoSealEngine;

impl NoSealEngine {
    pub fn new() -> Self {
        NoSealEngine
    }
}

impl ConsensusEngine for NoSealEngine {
    fn verify_header(
        &self,
        reader: &dyn HeaderReader,
        header: &Header,
        _check_seal: bool,
    ) -> Result<()> {
        let parent = reader
            .header(&header.parent_hash, header.number.wrapping_sub(1))
            .ok_or(ChainError::UnknownAncestor)?;

        if header.number != parent.number + 1 {
            return Err(ChainError::InvalidHeader(format!(
                "number {} does not follow parent {}",
                header.number, parent.number
            )));
        }
        if header.timestamp <= parent.timestamp {
            return Err(ChainError::InvalidHeader(
                "timestamp not after parent".into(),
            ));
        }
        if header.gas_used > header.gas_limit {
            return Err(ChainError::InvalidHeader(format!(
                "gas used {} exceeds limit {}",
                header.gas_used, header.gas_limit
            )));
        }
        if header.difficulty == 0 {
            return Err(ChainError::InvalidHeader("zero difficulty".into()));
        }
        Ok(())
    }
}
