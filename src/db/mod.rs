//! SQLite-backed canonical store.
//!
//! One mutex-guarded connection owns all writes; WAL mode admits
//! concurrent readers from other processes. `with_transaction` wraps
//! multi-row updates, and `with_busy_retry` absorbs transient contention
//! with capped exponential backoff. A `cosine_distance` scalar function
//! is registered on every connection so search ranking runs inside a
//! single SQL statement.

use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::functions::FunctionFlags;
use rusqlite::Connection;

use crate::embeddings;
use crate::error::{BrainError, Result};
use crate::migrations;

mod entities;
mod embeddings_table;
mod jobs;
mod types;

pub use types::*;

/// Initial delay for the busy-retry helper.
const BUSY_RETRY_INITIAL_MS: u64 = 10;
/// Attempts before a busy error surfaces.
const BUSY_RETRY_ATTEMPTS: u32 = 3;

pub struct BrainDb {
    conn: Mutex<Connection>,
}

impl BrainDb {
    /// Open (or create) the database at `<data_dir>/brainstore.db` and
    /// apply pending migrations.
    pub fn open(data_dir: &Path) -> Result<Self> {
        Self::open_at(data_dir.join("brainstore.db"))
    }

    /// Open a database at an explicit path. Useful for testing.
    pub fn open_at(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        Self::configure(conn)
    }

    /// Fully in-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::configure(Connection::open_in_memory()?)
    }

    fn configure(conn: Connection) -> Result<Self> {
        // WAL for concurrent readers alongside the single writer.
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(Duration::from_millis(250))?;

        migrations::run_migrations(&conn)?;

        // Enforce the embeddings → entities cascade.
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        register_cosine_distance(&conn)?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Run a closure against the connection.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run a closure inside a SQLite transaction. Commits on Ok, rolls
    /// back on Err.
    pub fn with_transaction<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(&conn) {
            Ok(value) => {
                conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Retry a transient-failure-prone operation with capped exponential
    /// backoff (10 ms doubling, 3 attempts). Permanent errors surface
    /// immediately.
    pub fn with_busy_retry<T>(&self, mut f: impl FnMut(&Self) -> Result<T>) -> Result<T> {
        let mut delay = Duration::from_millis(BUSY_RETRY_INITIAL_MS);
        let mut attempt = 0u32;
        loop {
            match f(self) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < BUSY_RETRY_ATTEMPTS => {
                    log::debug!("BrainDb: busy, retrying in {:?} ({})", delay, e);
                    std::thread::sleep(delay);
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// `cosine_distance(blob, blob) → REAL` over little-endian f32 vectors.
/// Mismatched or empty vectors read as maximally distant (2.0) so they
/// fall below every search cut.
fn register_cosine_distance(conn: &Connection) -> Result<()> {
    conn.create_scalar_function(
        "cosine_distance",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let a = ctx.get::<Vec<u8>>(0)?;
            let b = ctx.get::<Vec<u8>>(1)?;
            let va = embeddings::blob_to_vector(&a)
                .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))?;
            let vb = embeddings::blob_to_vector(&b)
                .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))?;
            Ok(embeddings::cosine_distance(&va, &vb) as f64)
        },
    )?;
    Ok(())
}

/// Map a primary-key collision onto the domain `Duplicate` error.
pub(crate) fn map_insert_error(err: rusqlite::Error, entity_type: &str, id: &str) -> BrainError {
    if BrainError::is_unique_violation(&err) {
        BrainError::Duplicate {
            entity_type: entity_type.to_string(),
            id: id.to_string(),
        }
    } else {
        BrainError::Storage(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory_applies_schema() {
        let db = BrainDb::open_in_memory().unwrap();
        let count: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM entities", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_open_at_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.db");
        let db = BrainDb::open_at(path.clone()).unwrap();
        drop(db);
        assert!(path.exists());
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = BrainDb::open_in_memory().unwrap();
        let result: Result<()> = db.with_transaction(|conn| {
            conn.execute(
                "INSERT INTO entities (id, entity_type, content, content_hash, metadata, created, updated)
                 VALUES ('a', 'note', 'x', 'h', '{}', 1, 1)",
                [],
            )?;
            Err(BrainError::Validation("forced".into()))
        });
        assert!(result.is_err());

        let count: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM entities", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_cosine_distance_function_registered() {
        let db = BrainDb::open_in_memory().unwrap();
        let a = embeddings::vector_to_blob(&[1.0, 0.0]);
        let b = embeddings::vector_to_blob(&[0.0, 1.0]);
        let distance: f64 = db
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT cosine_distance(?1, ?2)",
                    rusqlite::params![a, b],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert!((distance - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_busy_retry_gives_up_on_permanent_error() {
        let db = BrainDb::open_in_memory().unwrap();
        let mut calls = 0;
        let result: Result<()> = db.with_busy_retry(|_| {
            calls += 1;
            Err(BrainError::Validation("permanent".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
