//! Embedded SQLite backing store
//!
//! Read/write split over WAL: a pool of reader connections served
//! round-robin, plus one dedicated writer connection for mutations and
//! transactions. Reads from different sessions run concurrently on
//! separate connections; the writer mutex reflects SQLite's
//! single-writer constraint, while per-session write ordering is
//! enforced above this layer by the history store's keyed locks.
//! Every statement runs inside `spawn_blocking` so rusqlite never
//! blocks a runtime worker. The schema is equivalent to the document
//! collections the gateway persists: api_keys, system_prompts,
//! sessions, messages, users.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;

use crate::StoreError;

const READER_POOL_SIZE: usize = 4;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS api_keys (
    id            TEXT PRIMARY KEY,
    token         TEXT NOT NULL UNIQUE,
    client_name   TEXT NOT NULL,
    adapter_name  TEXT NOT NULL,
    prompt_id     TEXT,
    active        INTEGER NOT NULL DEFAULT 1,
    created_at    TEXT NOT NULL,
    last_used_at  TEXT,
    notes         TEXT
);

CREATE TABLE IF NOT EXISTS system_prompts (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    text        TEXT NOT NULL,
    version     INTEGER NOT NULL DEFAULT 1,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    session_id        TEXT PRIMARY KEY,
    created_at        TEXT NOT NULL,
    last_activity_at  TEXT NOT NULL,
    message_count     INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS messages (
    session_id      TEXT NOT NULL,
    ordinal         INTEGER NOT NULL,
    role            TEXT NOT NULL,
    content         TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    token_estimate  INTEGER,
    blocked         INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (session_id, ordinal)
);

CREATE INDEX IF NOT EXISTS idx_messages_session
    ON messages(session_id, ordinal);

CREATE TABLE IF NOT EXISTS users (
    id             TEXT PRIMARY KEY,
    username       TEXT NOT NULL UNIQUE,
    password_hash  TEXT NOT NULL,
    created_at     TEXT NOT NULL
);
"#;

/// Shared handle to the embedded database.
#[derive(Clone)]
pub struct Db {
    writer: Arc<Mutex<Connection>>,
    readers: Arc<Vec<Mutex<Connection>>>,
    next_reader: Arc<AtomicUsize>,
}

impl Db {
    /// Open (or create) the database file, apply the schema, and build
    /// the reader pool.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();

        let writer = Connection::open(path).map_err(|e| StoreError::Open(e.to_string()))?;
        writer
            .pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| StoreError::Open(e.to_string()))?;
        writer
            .pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| StoreError::Open(e.to_string()))?;
        writer
            .pragma_update(None, "busy_timeout", 5_000)
            .map_err(|e| StoreError::Open(e.to_string()))?;
        writer
            .execute_batch(SCHEMA)
            .map_err(|e| StoreError::Schema(e.to_string()))?;

        let mut readers = Vec::with_capacity(READER_POOL_SIZE);
        for _ in 0..READER_POOL_SIZE {
            let reader = Connection::open(path).map_err(|e| StoreError::Open(e.to_string()))?;
            reader
                .pragma_update(None, "busy_timeout", 5_000)
                .map_err(|e| StoreError::Open(e.to_string()))?;
            reader
                .pragma_update(None, "query_only", "ON")
                .map_err(|e| StoreError::Open(e.to_string()))?;
            readers.push(Mutex::new(reader));
        }

        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
            readers: Arc::new(readers),
            next_reader: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// In-memory database, used by tests and the `memory` persistence
    /// backend. Shared-cache mode lets the reader pool see the writer's
    /// tables; the database lives while the writer stays open.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let uri = format!("file:orbit-mem-{}?mode=memory&cache=shared", uuid::Uuid::new_v4());

        let writer = Connection::open(&uri).map_err(|e| StoreError::Open(e.to_string()))?;
        writer
            .execute_batch(SCHEMA)
            .map_err(|e| StoreError::Schema(e.to_string()))?;

        let mut readers = Vec::with_capacity(READER_POOL_SIZE);
        for _ in 0..READER_POOL_SIZE {
            let reader = Connection::open(&uri).map_err(|e| StoreError::Open(e.to_string()))?;
            readers.push(Mutex::new(reader));
        }

        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
            readers: Arc::new(readers),
            next_reader: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Run a read-only statement on the next reader connection.
    pub async fn read<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
    {
        let readers = Arc::clone(&self.readers);
        let index = self.next_reader.fetch_add(1, Ordering::Relaxed) % readers.len();
        tokio::task::spawn_blocking(move || {
            let guard = readers[index].lock();
            f(&guard).map_err(StoreError::from)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// Run a single mutating statement on the writer connection.
    pub async fn write<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
    {
        let writer = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || {
            let guard = writer.lock();
            f(&guard).map_err(StoreError::from)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// Run a multi-statement transaction on the writer connection.
    pub async fn transaction<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, rusqlite::Error> + Send + 'static,
    {
        let writer = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || {
            let mut guard = writer.lock();
            f(&mut guard).map_err(StoreError::from)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_schema_applies() {
        let db = Db::open_in_memory().unwrap();
        let count: i64 = db
            .read(|conn| {
                conn.query_row(
                    "SELECT count(*) FROM sqlite_master WHERE type = 'table'",
                    [],
                    |row| row.get(0),
                )
            })
            .await
            .unwrap();
        assert!(count >= 5);
    }

    #[tokio::test]
    async fn test_readers_see_writes() {
        let db = Db::open_in_memory().unwrap();
        db.write(|conn| {
            conn.execute(
                "INSERT INTO sessions (session_id, created_at, last_activity_at, message_count)
                 VALUES ('s1', 't', 't', 0)",
                [],
            )
        })
        .await
        .unwrap();

        // Every reader connection observes the write
        for _ in 0..READER_POOL_SIZE {
            let count: i64 = db
                .read(|conn| {
                    conn.query_row("SELECT count(*) FROM sessions", [], |row| row.get(0))
                })
                .await
                .unwrap();
            assert_eq!(count, 1);
        }
    }

    #[tokio::test]
    async fn test_read_propagates_errors() {
        let db = Db::open_in_memory().unwrap();
        let result = db
            .read(|conn| conn.execute("SELECT * FROM no_such_table", []))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_reads_do_not_serialize_on_writer() {
        let db = Db::open_in_memory().unwrap();

        // Hold the writer busy while reads proceed
        let slow_write = {
            let db = db.clone();
            tokio::spawn(async move {
                db.transaction(|conn| {
                    let tx = conn.transaction()?;
                    std::thread::sleep(std::time::Duration::from_millis(100));
                    tx.commit()
                })
                .await
            })
        };

        let started = std::time::Instant::now();
        let count: i64 = db
            .read(|conn| conn.query_row("SELECT count(*) FROM sessions", [], |row| row.get(0)))
            .await
            .unwrap();
        assert_eq!(count, 0);
        assert!(started.elapsed() < std::time::Duration::from_millis(90));

        slow_write.await.unwrap().unwrap();
    }
}
