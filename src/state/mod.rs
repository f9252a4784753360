//! State boundary.
//!
//! The chain core treats world state as opaque: it opens a [`StateView`]
//! at a parent root, executes into it, commits to obtain the child root,
//! and pins roots through the [`StateEngine`] so recent states survive
//! until the garbage collector lets go of them.

pub mod memory;

pub use memory::MemoryStateEngine;

use crate::error::{ChainError, Result};
use crate::types::{Address, Hash};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-account record.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub balance: u128,
    pub nonce: u64,
}

/// Mutable world state opened at some root. Ordered maps keep the
/// serialization, and therefore the committed root, deterministic.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateView {
    accounts: BTreeMap<Address, Account>,
    /// Named per-chain entries maintained by state producers, separate
    /// from account state.
    chain_state: BTreeMap<String, Vec<u8>>,
}

impl StateView {
    pub fn balance(&self, address: &Address) -> u128 {
        self.accounts.get(address).map(|a| a.balance).unwrap_or(0)
    }

    pub fn nonce(&self, address: &Address) -> u64 {
        self.accounts.get(address).map(|a| a.nonce).unwrap_or(0)
    }

    pub fn add_balance(&mut self, address: &Address, amount: u128) {
        self.accounts.entry(*address).or_default().balance += amount;
    }

    pub fn sub_balance(&mut self, address: &Address, amount: u128) -> Result<()> {
        let account = self.accounts.entry(*address).or_default();
        if account.balance < amount {
            return Err(ChainError::InvalidTransaction(format!(
                "insufficient balance: have {}, need {}",
                account.balance, amount
            )));
        }
        account.balance -= amount;
        Ok(())
    }

    pub fn bump_nonce(&mut self, address: &Address) {
        self.accounts.entry(*address).or_default().nonce += 1;
    }

    pub fn chain_state(&self, key: &str) -> Option<&[u8]> {
        self.chain_state.get(key).map(|v| v.as_slice())
    }

    pub fn set_chain_state(&mut self, key: &str, value: Vec<u8>) {
        self.chain_state.insert(key.to_string(), value);
    }

    /// Root this view would commit to. Pure function of the contents.
    pub fn root(&self) -> Hash {
        // BTreeMap serialization order is fixed, so equal states always
        // produce equal roots.
        let bytes = bincode::serialize(self).expect("state serialization is infallible");
        Hash::of(&bytes)
    }

    /// Hand the view to the engine, which keeps it in memory under its
    /// root until committed or dereferenced away.
    pub fn commit(self, engine: &dyn StateEngine) -> Result<Hash> {
        engine.insert(self)
    }
}

/// Keeps recent states in memory, reference-counted, and flushes them to
/// durable storage on demand.
pub trait StateEngine: Send + Sync {
    /// Open a mutable view at `root`, whether the state is in memory or
    /// already on disk. `StateUnavailable` when it is neither.
    fn view(&self, root: &Hash) -> Result<StateView>;

    fn has_state(&self, root: &Hash) -> bool;

    /// Take ownership of a freshly-built state; returns its root.
    fn insert(&self, view: StateView) -> Result<Hash>;

    /// Pin an in-memory state so dereferencing cannot drop it yet.
    fn reference(&self, root: &Hash);

    /// Unpin; an unpinned, uncommitted state is dropped from memory.
    fn dereference(&self, root: &Hash);

    /// Flush the state at `root` to durable storage.
    fn commit_root(&self, root: &Hash) -> Result<()>;

    /// Bytes held by uncommitted in-memory states.
    fn memory_size(&self) -> usize;
}
