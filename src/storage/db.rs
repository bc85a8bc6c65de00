//! Connection ownership, schema and transaction helper.
//!
//! One `rusqlite::Connection` lives behind a `std::sync::Mutex`. The lock is
//! held for a single store operation only and never across an `.await`, so
//! gateway calls in flight never block other workers' claims and commits.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::errors::{EmbedError, Result};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS embedding_jobs (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_type      TEXT    NOT NULL,
    entity_id        INTEGER NOT NULL,
    status           TEXT    NOT NULL,
    priority         INTEGER NOT NULL,
    attempt          INTEGER NOT NULL DEFAULT 0,
    max_attempts     INTEGER NOT NULL,
    next_retry_at    INTEGER,
    last_error       TEXT,
    model            TEXT,
    lease_owner      TEXT,
    lease_expires_at INTEGER,
    created_at       INTEGER NOT NULL,
    updated_at       INTEGER NOT NULL,
    started_at       INTEGER,
    completed_at     INTEGER
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_embedding_jobs_live_entity
    ON embedding_jobs (entity_type, entity_id)
    WHERE status IN ('PENDING', 'IN_PROGRESS', 'RETRY_PENDING');

CREATE INDEX IF NOT EXISTS idx_embedding_jobs_claim
    ON embedding_jobs (status, priority, created_at, id);

CREATE INDEX IF NOT EXISTS idx_embedding_jobs_lease
    ON embedding_jobs (status, lease_expires_at);

CREATE TABLE IF NOT EXISTS embedding_chunks (
    entity_type TEXT    NOT NULL,
    entity_id   INTEGER NOT NULL,
    chunk_index INTEGER NOT NULL,
    text        TEXT    NOT NULL,
    vector      BLOB    NOT NULL,
    dimensions  INTEGER NOT NULL,
    model       TEXT    NOT NULL,
    token_count INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL,
    PRIMARY KEY (entity_type, entity_id, chunk_index)
);

CREATE TABLE IF NOT EXISTS provider_health (
    provider             TEXT PRIMARY KEY,
    is_available         INTEGER NOT NULL,
    consecutive_failures INTEGER NOT NULL,
    circuit_state        TEXT    NOT NULL,
    last_checked_at      INTEGER,
    last_success_at      INTEGER,
    last_error           TEXT
);
";

/// Shared handle to the pipeline database
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a database file and apply the schema
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;

        tracing::debug!(
            target: "embedline.storage",
            path = %path.display(),
            "opened database"
        );
        Self::init(conn)
    }

    /// In-memory database, used by tests and dry runs
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| EmbedError::Generic("database connection lock poisoned".to_string()))
    }

    /// Run `f` against the connection outside of an explicit transaction
    pub fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Run `f` inside an IMMEDIATE transaction; any error rolls everything back
    pub fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

/// Milliseconds since the Unix epoch, the on-disk timestamp format
pub fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

/// True when a statement failed on a UNIQUE / PRIMARY KEY constraint
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_applies_twice() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = Database::open_in_memory().unwrap();
        let result: Result<()> = db.transaction(|tx| {
            tx.execute(
                "INSERT INTO provider_health (provider, is_available, consecutive_failures, circuit_state) \
                 VALUES ('ollama', 1, 0, 'CLOSED')",
                [],
            )?;
            Err(EmbedError::Generic("abort".to_string()))
        });
        assert!(result.is_err());

        let count: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM provider_health", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_open_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("embedline.db");
        let db = Database::open(&path).unwrap();
        drop(db);
        assert!(path.exists());
    }

    #[test]
    fn test_millis_round_trip() {
        let now = Utc.timestamp_millis_opt(1_700_000_000_123).single().unwrap();
        assert_eq!(from_millis(to_millis(now)), now);
    }
}
