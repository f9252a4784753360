//! SQLite-backed persistent store.
//!
//! A single `kv` table keeps the whole chain database; batches map onto
//! SQLite transactions so a crash mid-batch leaves no partial write.

use super::{BatchOp, PersistentStore, WriteBatch};
use crate::error::{ChainError, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| ChainError::Storage(format!("failed to open database: {}", e)))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key BLOB PRIMARY KEY,
                value BLOB NOT NULL
            )",
            [],
        )
        .map_err(|e| ChainError::Storage(format!("failed to create kv table: {}", e)))?;

        Ok(SqliteStore { conn: Mutex::new(conn) })
    }
}

impl PersistentStore for SqliteStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT value FROM kv WHERE key = ?1")?;
        let mut rows = stmt.query(params![key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn has(&self, key: &[u8]) -> Result<bool> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT 1 FROM kv WHERE key = ?1")?;
        let found = stmt.exists(params![key])?;
        Ok(found)
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        let conn = self.conn.lock();
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| ChainError::Storage(format!("failed to start transaction: {}", e)))?;

        for op in &batch.ops {
            match op {
                BatchOp::Put(k, v) => {
                    tx.execute(
                        "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
                        params![k, v],
                    )?;
                }
                BatchOp::Delete(k) => {
                    tx.execute("DELETE FROM kv WHERE key = ?1", params![k])?;
                }
            }
        }

        tx.commit()
            .map_err(|e| ChainError::Storage(format!("failed to commit batch: {}", e)))?;
        Ok(())
    }
}
