//! Chain configuration.
//!
//! Every tunable the chain core consults lives here; nothing is read from
//! globals. Loadable from TOML, with defaults matching mainnet behavior.

use crate::error::{ChainError, Result};
use crate::types::Hash;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::num::NonZeroUsize;
use std::time::Duration;

/// How to break an exact total-difficulty tie between the local head and
/// an incoming block of the same height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Coin flip. Splits the network's choice so a selfish miner cannot
    /// count on everyone switching to (or away from) its block.
    #[default]
    Randomized,
    /// Always adopt the incoming block. Deterministic, for tests.
    PreferNew,
    /// Always keep the current head. Deterministic, for tests.
    PreferOld,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// Blocks whose timestamp exceeds local time by more than this are
    /// rejected outright.
    #[serde(default = "default_max_future_secs")]
    pub max_future_secs: u64,
    /// Blocks within the window are queued and retried instead.
    #[serde(default = "default_allowed_future_secs")]
    pub allowed_future_secs: u64,
    /// Retry interval for queued future blocks.
    #[serde(default = "default_future_retry_secs")]
    pub future_retry_secs: u64,

    /// Recent states kept in memory before the oldest is garbage
    /// collected or flushed.
    #[serde(default = "default_retention_window")]
    pub retention_window: u64,
    /// In-memory trie size that forces a flush of the oldest pinned root.
    #[serde(default = "default_trie_node_limit")]
    pub trie_node_limit_bytes: usize,
    /// Accumulated unflushed interval that forces a commit.
    #[serde(default = "default_trie_time_limit_secs")]
    pub trie_time_limit_secs: u64,
    /// When set, every state is committed immediately and nothing is held
    /// in memory (archive mode).
    #[serde(default)]
    pub disable_trie_gc: bool,

    #[serde(default = "default_header_cache")]
    pub header_cache: usize,
    #[serde(default = "default_td_cache")]
    pub td_cache: usize,
    #[serde(default = "default_number_cache")]
    pub number_cache: usize,
    #[serde(default = "default_block_cache")]
    pub block_cache: usize,
    #[serde(default = "default_body_cache")]
    pub body_cache: usize,
    #[serde(default = "default_max_future_blocks")]
    pub max_future_blocks: usize,
    #[serde(default = "default_bad_block_limit")]
    pub bad_block_limit: usize,

    /// Hard-banned block hashes; hitting one rejects the block and, at
    /// startup, rewinds the chain below it.
    #[serde(default)]
    pub bad_hashes: Vec<Hash>,

    #[serde(default)]
    pub tie_break: TieBreak,

    /// Worker threads for concurrent header verification. Zero means one
    /// per CPU.
    #[serde(default)]
    pub verify_workers: usize,
}

impl Default for ChainConfig {
    fn default() -> Self {
        ChainConfig {
            max_future_secs: default_max_future_secs(),
            allowed_future_secs: default_allowed_future_secs(),
            future_retry_secs: default_future_retry_secs(),
            retention_window: default_retention_window(),
            trie_node_limit_bytes: default_trie_node_limit(),
            trie_time_limit_secs: default_trie_time_limit_secs(),
            disable_trie_gc: false,
            header_cache: default_header_cache(),
            td_cache: default_td_cache(),
            number_cache: default_number_cache(),
            block_cache: default_block_cache(),
            body_cache: default_body_cache(),
            max_future_blocks: default_max_future_blocks(),
            bad_block_limit: default_bad_block_limit(),
            bad_hashes: Vec::new(),
            tie_break: TieBreak::default(),
            verify_workers: 0,
        }
    }
}

impl ChainConfig {
    pub fn load(path: &str) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let config: ChainConfig =
            toml::from_str(&raw).map_err(|e| ChainError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retention_window < 2 {
            return Err(ChainError::Config(
                "retention_window must be at least 2".into(),
            ));
        }
        if self.allowed_future_secs > self.max_future_secs {
            return Err(ChainError::Config(
                "allowed_future_secs must not exceed max_future_secs".into(),
            ));
        }
        Ok(())
    }

    pub fn bad_hash_set(&self) -> HashSet<Hash> {
        self.bad_hashes.iter().copied().collect()
    }

    pub fn trie_time_limit(&self) -> Duration {
        Duration::from_secs(self.trie_time_limit_secs)
    }

    pub fn future_retry_interval(&self) -> Duration {
        Duration::from_secs(self.future_retry_secs)
    }

    pub fn worker_count(&self) -> usize {
        if self.verify_workers == 0 {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            self.verify_workers
        }
    }

    pub(crate) fn cache_capacity(entries: usize) -> NonZeroUsize {
        NonZeroUsize::new(entries.max(1)).unwrap_or(NonZeroUsize::MIN)
    }
}

fn default_max_future_secs() -> u64 {
    30
}

fn default_allowed_future_secs() -> u64 {
    30
}

fn default_future_retry_secs() -> u64 {
    5
}

fn default_retention_window() -> u64 {
    128
}

fn default_trie_node_limit() -> usize {
    256 * 1024 * 1024
}

fn default_trie_time_limit_secs() -> u64 {
    5 * 60
}

fn default_header_cache() -> usize {
    512
}

fn default_td_cache() -> usize {
    1024
}

fn default_number_cache() -> usize {
    2048
}

fn default_block_cache() -> usize {
    256
}

fn default_body_cache() -> usize {
    256
}

fn default_max_future_blocks() -> usize {
    256
}

fn default_bad_block_limit() -> usize {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_mainnet_values() {
        let config = ChainConfig::default();
        assert_eq!(config.retention_window, 128);
        assert_eq!(config.max_future_blocks, 256);
        assert_eq!(config.allowed_future_secs, 30);
        assert_eq!(config.tie_break, TieBreak::Randomized);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: ChainConfig = toml::from_str(
            r#"
            retention_window = 16
            tie_break = "prefer_new"
            "#,
        )
        .unwrap();
        assert_eq!(config.retention_window, 16);
        assert_eq!(config.tie_break, TieBreak::PreferNew);
        assert_eq!(config.header_cache, 512);
    }

    #[test]
    fn rejects_unusable_retention() {
        let config = ChainConfig { retention_window: 1, ..ChainConfig::default() };
        assert!(config.validate().is_err());
    }
}
