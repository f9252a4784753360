//! Core chain data types: hashes, headers, blocks, transactions, receipts.
//!
//! Everything here is immutable once constructed and identified by its
//! content hash. Encoding for persistence is bincode; `Hash` values render
//! as hex for logs and diagnostics.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Cumulative consensus weight from genesis, the fork-choice metric.
pub type Td = u128;

/// 32-byte content hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; 32]);

    pub fn of(bytes: &[u8]) -> Self {
        let mut out = [0u8; 32];
        out.copy_from_slice(&Sha256::digest(bytes));
        Hash(out)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 32 {
            return None;
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(bytes);
        Some(Hash(out))
    }

    /// Short hex prefix for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// 20-byte account address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub fn from_low_u64(v: u64) -> Self {
        let mut out = [0u8; 20];
        out[12..].copy_from_slice(&v.to_be_bytes());
        Address(out)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// Consensus-specific proof attached to a header: a PoW nonce plus an
/// optional PoS signature blob. Interpreting either is the engine's job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Seal {
    pub nonce: u64,
    pub signatures: Vec<u8>,
}

/// Block header. Immutable, identified by `hash()`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub number: u64,
    pub parent_hash: Hash,
    pub state_root: Hash,
    pub tx_root: Hash,
    pub receipts_root: Hash,
    pub difficulty: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub timestamp: u64,
    pub seal: Seal,
}

impl Header {
    /// Content hash over the full header, seal included.
    pub fn hash(&self) -> Hash {
        let bytes = bincode::serialize(self).expect("header serialization is infallible");
        Hash::of(&bytes)
    }
}

/// A transfer between accounts. The wire format of real transactions is
/// delegated; this carries just enough to exercise execution and gas
/// accounting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub from: Address,
    pub to: Address,
    pub value: u128,
    pub nonce: u64,
    pub gas: u64,
    pub payload: Vec<u8>,
}

impl Transaction {
    pub fn hash(&self) -> Hash {
        let bytes = bincode::serialize(self).expect("tx serialization is infallible");
        Hash::of(&bytes)
    }
}

/// Block body: the transactions plus room for auxiliary data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Body {
    pub transactions: Vec<Transaction>,
}

impl Body {
    /// Commitment over the ordered transaction list.
    pub fn tx_root(&self) -> Hash {
        let mut hasher = Sha256::new();
        for tx in &self.transactions {
            hasher.update(tx.hash().as_bytes());
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&hasher.finalize());
        Hash(out)
    }
}

/// Header plus body. Immutable.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: Header,
    pub body: Body,
}

impl Block {
    pub fn new(header: Header, body: Body) -> Self {
        Block { header, body }
    }

    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn parent_hash(&self) -> Hash {
        self.header.parent_hash
    }

    pub fn difficulty(&self) -> u64 {
        self.header.difficulty
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.body.transactions
    }
}

/// Log emitted during transaction execution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub address: Address,
    pub data: Vec<u8>,
    pub block_number: u64,
    pub block_hash: Hash,
    pub tx_hash: Hash,
    /// Set when the log's block left the canonical chain.
    pub removed: bool,
}

/// Outcome of executing one transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: Hash,
    pub success: bool,
    pub gas_used: u64,
    pub cumulative_gas: u64,
    pub logs: Vec<LogEntry>,
}

/// Commitment over an ordered receipt list.
///
/// Hashes consensus fields only. Log block context (block hash, number)
/// is derived data filled in at store time, after the header hash is
/// known, so it must stay out of the commitment.
pub fn receipts_root(receipts: &[Receipt]) -> Hash {
    let mut hasher = Sha256::new();
    for r in receipts {
        hasher.update(r.tx_hash.as_bytes());
        hasher.update([r.success as u8]);
        hasher.update(r.gas_used.to_be_bytes());
        hasher.update(r.cumulative_gas.to_be_bytes());
        for log in &r.logs {
            hasher.update(log.address.0);
            hasher.update(&log.data);
        }
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    Hash(out)
}
