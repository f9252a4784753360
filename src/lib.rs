//! chaincore - the block-chain core of a hybrid PoW/PoS ledger node
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Chain Core
//! - [`chain`] - Block acceptance, fork choice, reorgs, trie GC, recovery
//! - [`headers`] - Header chain with cached reads and header fork choice
//! - [`genesis`] - Genesis bootstrap
//!
//! ## Execution & Validation
//! - [`processor`] - Transaction execution, gas, chain-state producers
//! - [`validator`] - Pre- and post-execution block validation
//! - [`state`] - State views and the reference-counted state engine
//!
//! ## Consensus Boundary
//! - [`consensus`] - Engine trait and concurrent header verification
//!
//! ## Persistence
//! - [`store`] - Key-value store backends and the typed chain schema
//!
//! ## Shared Infrastructure
//! - [`types`] - Hashes, headers, blocks, transactions, receipts
//! - [`head`] - Single-swap head snapshots
//! - [`events`] - Chain event feed
//! - [`config`] - Configuration management
//! - [`error`] - Error types

#![forbid(unsafe_code)]

// ============================================================================
// Chain Core
// ============================================================================
pub mod chain;
pub mod genesis;
pub mod headers;

// ============================================================================
// Execution & Validation
// ============================================================================
pub mod processor;
pub mod state;
pub mod validator;

// ============================================================================
// Consensus Boundary
// ============================================================================
pub mod consensus;

// ============================================================================
// Persistence
// ============================================================================
pub mod store;

// ============================================================================
// Shared Infrastructure
// ============================================================================
pub mod config;
pub mod error;
pub mod events;
pub mod head;
pub mod types;

pub use chain::{BadBlockReport, Blockchain, WriteStatus};
pub use config::{ChainConfig, TieBreak};
pub use error::{ChainError, Result};
