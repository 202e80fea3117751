//! SQLite-backed policy store: uniqueness hashes, block relations, and
//! messaged records.
//!
//! The store is the only state shared across connection pairs. All three
//! operations are single statements so "insert if absent" is atomic at the
//! store level — two pairs racing on the same hash cannot both observe an
//! insert. rusqlite is synchronous, so every call runs on the blocking pool
//! to keep store round-trips from stalling unrelated connections.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store task cancelled: {0}")]
    Join(#[from] tokio::task::JoinError),
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS message_hash (
    hash TEXT PRIMARY KEY
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS block_relation (
    subject_id INTEGER NOT NULL,
    object_id  INTEGER NOT NULL,
    PRIMARY KEY (subject_id, object_id)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS messaged (
    subject_id INTEGER NOT NULL,
    object_id  INTEGER NOT NULL,
    PRIMARY KEY (subject_id, object_id)
) WITHOUT ROWID;
";

/// Handle to the policy store. Cheap to clone; one handle per connection pair.
#[derive(Clone)]
pub struct ChatStore {
    conn: Arc<Mutex<Connection>>,
}

impl ChatStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        // WAL plus a busy timeout so concurrent pairs block briefly on the
        // write lock instead of failing with SQLITE_BUSY.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool.
    async fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        let out = tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&conn)
        })
        .await??;
        Ok(out)
    }

    /// Atomic insert-if-absent of a content hash. Returns `false` when the
    /// hash was already present (the message is a duplicate).
    pub async fn insert_uniqueness_hash(&self, hash: String) -> Result<bool, StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO message_hash (hash) VALUES (?1) ON CONFLICT DO NOTHING",
                params![hash],
            )
            .map(|inserted| inserted == 1)
        })
        .await
    }

    /// Whether either identity has blocked the other. The relation is stored
    /// directed but checked symmetrically.
    pub async fn is_blocked(&self, a: i64, b: i64) -> Result<bool, StoreError> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT 1 FROM block_relation
                 WHERE (subject_id = ?1 AND object_id = ?2)
                    OR (subject_id = ?2 AND object_id = ?1)
                 LIMIT 1",
                params![a, b],
                |_| Ok(()),
            )
            .optional()
            .map(|row| row.is_some())
        })
        .await
    }

    /// Record that `sender` has messaged `recipient` at least once.
    /// Idempotent: a repeat insert is a no-op.
    pub async fn record_messaged(&self, sender: i64, recipient: i64) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO messaged (subject_id, object_id) VALUES (?1, ?2)
                 ON CONFLICT DO NOTHING",
                params![sender, recipient],
            )
            .map(|_| ())
        })
        .await
    }
}

#[cfg(test)]
impl ChatStore {
    /// Seed a block relation. In production this table is written by the
    /// account system, not the relay.
    pub async fn insert_block(&self, subject: i64, object: i64) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO block_relation (subject_id, object_id) VALUES (?1, ?2)
                 ON CONFLICT DO NOTHING",
                params![subject, object],
            )
            .map(|_| ())
        })
        .await
    }
}
