//! Conversation history store
//!
//! Writes are serialized per session through a keyed mutex so ordinals
//! stay strictly monotonic; sessions do not contend with each other,
//! and reads go straight to the reader pool without touching any
//! session lock. Retention is enforced on every append: once a session
//! exceeds the configured cap, the oldest non-system messages are
//! dropped.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tokio::sync::Mutex;

use orbit_core::{HistoryStore, Result, Role, SessionInfo, StoredMessage};

use crate::sqlite::Db;

/// SQLite-backed history store.
pub struct SqliteHistoryStore {
    db: Db,
    /// Per-session write locks. Entries are never removed; sessions are
    /// bounded by the retention janitor.
    locks: DashMap<String, Arc<Mutex<()>>>,
    /// Retention cap per session
    max_messages: usize,
}

impl SqliteHistoryStore {
    pub fn new(db: Db, max_messages: usize) -> Self {
        Self { db, locks: DashMap::new(), max_messages }
    }

    fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// One-shot compaction over every stored session. Runs at boot when
    /// `session.compact_on_start` is set.
    pub async fn compact_all(&self) -> Result<usize> {
        let cap = self.max_messages;
        let dropped = self
            .db
            .transaction(move |conn| {
                let sessions: Vec<String> = {
                    let mut stmt = conn.prepare("SELECT session_id FROM sessions")?;
                    let rows = stmt
                        .query_map([], |row| row.get(0))?
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    rows
                };
                let tx = conn.transaction()?;
                let mut total = 0usize;
                for session_id in sessions {
                    total += enforce_cap(&tx, &session_id, cap)?;
                }
                tx.commit()?;
                Ok(total)
            })
            .await?;
        if dropped > 0 {
            tracing::info!(dropped, "compacted over-cap sessions at boot");
        }
        Ok(dropped)
    }

    /// Sessions idle longer than `idle_secs`, for the janitor.
    pub async fn idle_sessions(&self, idle_secs: u64) -> Result<Vec<String>> {
        let cutoff = (Utc::now() - chrono::Duration::seconds(idle_secs as i64)).to_rfc3339();
        let ids = self
            .db
            .read(move |conn| {
                let mut stmt = conn
                    .prepare("SELECT session_id FROM sessions WHERE last_activity_at < ?1")?;
                let rows = stmt
                    .query_map(params![cutoff], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(ids)
    }

    /// Delete a session row and all its messages.
    pub async fn remove_session(&self, session_id: &str) -> Result<()> {
        let _guard = self.session_lock(session_id).lock_owned().await;
        let id = session_id.to_string();
        self.db
            .write(move |conn| {
                conn.execute("DELETE FROM messages WHERE session_id = ?1", params![id])?;
                conn.execute("DELETE FROM sessions WHERE session_id = ?1", params![id])
            })
            .await?;
        self.locks.remove(session_id);
        Ok(())
    }
}

/// Next ordinal within an open transaction. `MAX + 1` is safe because
/// retention only ever drops the oldest rows.
fn next_ordinal(tx: &Transaction<'_>, session_id: &str) -> std::result::Result<u64, rusqlite::Error> {
    let max: Option<i64> = tx.query_row(
        "SELECT MAX(ordinal) FROM messages WHERE session_id = ?1",
        params![session_id],
        |row| row.get(0),
    )?;
    Ok((max.unwrap_or(0) as u64) + 1)
}

fn touch_session(tx: &Transaction<'_>, session_id: &str, added: u64) -> std::result::Result<(), rusqlite::Error> {
    let now = Utc::now().to_rfc3339();
    tx.execute(
        "INSERT INTO sessions (session_id, created_at, last_activity_at, message_count)
         VALUES (?1, ?2, ?2, ?3)
         ON CONFLICT(session_id) DO UPDATE SET
             last_activity_at = ?2,
             message_count = message_count + ?3",
        params![session_id, now, added as i64],
    )?;
    Ok(())
}

fn insert_message(
    tx: &Transaction<'_>,
    session_id: &str,
    ordinal: u64,
    role: Role,
    content: &str,
    blocked: bool,
) -> std::result::Result<(), rusqlite::Error> {
    tx.execute(
        "INSERT INTO messages
         (session_id, ordinal, role, content, created_at, token_estimate, blocked)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            session_id,
            ordinal as i64,
            role.to_string(),
            content,
            Utc::now().to_rfc3339(),
            orbit_core::estimate_tokens(content) as i64,
            blocked as i64,
        ],
    )?;
    Ok(())
}

/// Drop oldest non-system messages beyond `cap`. Returns rows removed.
fn enforce_cap(
    tx: &Transaction<'_>,
    session_id: &str,
    cap: usize,
) -> std::result::Result<usize, rusqlite::Error> {
    let count: i64 = tx.query_row(
        "SELECT count(*) FROM messages WHERE session_id = ?1",
        params![session_id],
        |row| row.get(0),
    )?;
    let excess = (count as usize).saturating_sub(cap);
    if excess == 0 {
        return Ok(0);
    }

    let removed = tx.execute(
        "DELETE FROM messages WHERE session_id = ?1 AND ordinal IN (
             SELECT ordinal FROM messages
             WHERE session_id = ?1 AND role != 'system'
             ORDER BY ordinal ASC LIMIT ?2
         )",
        params![session_id, excess as i64],
    )?;
    tx.execute(
        "UPDATE sessions SET message_count = message_count - ?2 WHERE session_id = ?1",
        params![session_id, removed as i64],
    )?;
    Ok(removed)
}

fn row_to_message(row: &rusqlite::Row<'_>) -> std::result::Result<StoredMessage, rusqlite::Error> {
    let role_text: String = row.get(2)?;
    Ok(StoredMessage {
        session_id: row.get(0)?,
        ordinal: row.get::<_, i64>(1)? as u64,
        role: Role::parse(&role_text).unwrap_or(Role::User),
        content: row.get(3)?,
        created_at: chrono::DateTime::parse_from_rfc3339(&row.get::<_, String>(4)?)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        token_estimate: row.get::<_, Option<i64>>(5)?.map(|t| t as u32),
        blocked: row.get::<_, i64>(6)? != 0,
    })
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn append(&self, session_id: &str, role: Role, content: &str, blocked: bool) -> Result<u64> {
        let _guard = self.session_lock(session_id).lock_owned().await;

        let (sid, text, cap) = (session_id.to_string(), content.to_string(), self.max_messages);
        let ordinal = self
            .db
            .transaction(move |conn: &mut Connection| {
                let tx = conn.transaction()?;
                let ordinal = next_ordinal(&tx, &sid)?;
                insert_message(&tx, &sid, ordinal, role, &text, blocked)?;
                touch_session(&tx, &sid, 1)?;
                enforce_cap(&tx, &sid, cap)?;
                tx.commit()?;
                Ok(ordinal)
            })
            .await?;
        Ok(ordinal)
    }

    async fn append_turn(
        &self,
        session_id: &str,
        user_content: &str,
        assistant_content: &str,
        assistant_blocked: bool,
    ) -> Result<(u64, u64)> {
        let _guard = self.session_lock(session_id).lock_owned().await;

        let (sid, user, assistant, cap) = (
            session_id.to_string(),
            user_content.to_string(),
            assistant_content.to_string(),
            self.max_messages,
        );
        let ordinals = self
            .db
            .transaction(move |conn: &mut Connection| {
                let tx = conn.transaction()?;
                let first = next_ordinal(&tx, &sid)?;
                insert_message(&tx, &sid, first, Role::User, &user, false)?;
                insert_message(&tx, &sid, first + 1, Role::Assistant, &assistant, assistant_blocked)?;
                touch_session(&tx, &sid, 2)?;
                enforce_cap(&tx, &sid, cap)?;
                tx.commit()?;
                Ok((first, first + 1))
            })
            .await?;
        Ok(ordinals)
    }

    async fn recent(&self, session_id: &str, limit: usize) -> Result<Vec<StoredMessage>> {
        let sid = session_id.to_string();
        let mut messages = self
            .db
            .read(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT session_id, ordinal, role, content, created_at, token_estimate, blocked
                     FROM messages WHERE session_id = ?1
                     ORDER BY ordinal DESC LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(params![sid, limit as i64], row_to_message)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        messages.reverse();
        Ok(messages)
    }

    async fn clear(&self, session_id: &str) -> Result<()> {
        let _guard = self.session_lock(session_id).lock_owned().await;
        let sid = session_id.to_string();
        self.db
            .write(move |conn| {
                conn.execute("DELETE FROM messages WHERE session_id = ?1", params![sid])?;
                conn.execute(
                    "UPDATE sessions SET message_count = 0 WHERE session_id = ?1",
                    params![sid],
                )
            })
            .await?;
        Ok(())
    }

    async fn prune(&self, session_id: &str, keep_last: usize) -> Result<usize> {
        let _guard = self.session_lock(session_id).lock_owned().await;
        let sid = session_id.to_string();
        let removed = self
            .db
            .transaction(move |conn: &mut Connection| {
                let tx = conn.transaction()?;
                let removed = enforce_cap(&tx, &sid, keep_last)?;
                tx.commit()?;
                Ok(removed)
            })
            .await?;
        Ok(removed)
    }

    async fn info(&self, session_id: &str) -> Result<Option<SessionInfo>> {
        let sid = session_id.to_string();
        let info = self
            .db
            .read(move |conn| {
                conn.query_row(
                    "SELECT session_id, created_at, last_activity_at, message_count
                     FROM sessions WHERE session_id = ?1",
                    params![sid],
                    |row| {
                        Ok(SessionInfo {
                            session_id: row.get(0)?,
                            created_at: chrono::DateTime::parse_from_rfc3339(
                                &row.get::<_, String>(1)?,
                            )
                            .map(|dt| dt.with_timezone(&Utc))
                            .unwrap_or_else(|_| Utc::now()),
                            last_activity_at: chrono::DateTime::parse_from_rfc3339(
                                &row.get::<_, String>(2)?,
                            )
                            .map(|dt| dt.with_timezone(&Utc))
                            .unwrap_or_else(|_| Utc::now()),
                            message_count: row.get::<_, i64>(3)? as u64,
                        })
                    },
                )
                .optional()
            })
            .await?;
        Ok(info)
    }
}
