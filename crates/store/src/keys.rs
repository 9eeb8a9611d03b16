//! API key and system prompt store
//!
//! `resolve` is the request hot path. A write-through in-memory cache
//! keeps it O(1) once warmed; mutations update the database first and
//! the cache second, so the cache is authoritative between restarts of
//! the backing store. If the database fails after warmup, cached keys
//! keep resolving and a warning is logged; unknown tokens stay unknown.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use rusqlite::{params, OptionalExtension, Row};

use orbit_core::{ApiKeyRecord, ApiKeyStore, KeyBinding, PromptStore, Result, SystemPrompt};

use crate::sqlite::Db;
use crate::StoreError;

const TOKEN_PREFIX: &str = "orbit_";
const TOKEN_SUFFIX_LEN: usize = 32;

/// Generate an opaque printable token: fixed prefix + random suffix.
pub fn generate_token() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..TOKEN_SUFFIX_LEN)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect();
    format!("{TOKEN_PREFIX}{suffix}")
}

/// SQLite-backed key and prompt store with a resolve cache.
pub struct SqliteKeyStore {
    db: Db,
    cache: DashMap<String, KeyBinding>,
    warmed: AtomicBool,
}

impl SqliteKeyStore {
    pub fn new(db: Db) -> Self {
        Self { db, cache: DashMap::new(), warmed: AtomicBool::new(false) }
    }

    /// Preload every active binding. Called once at startup.
    pub async fn warm(&self) -> Result<usize> {
        let rows = self
            .db
            .read(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT token, client_name, adapter_name, prompt_id, active FROM api_keys",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            KeyBinding {
                                client_name: row.get(1)?,
                                adapter_name: row.get(2)?,
                                system_prompt_id: row.get(3)?,
                                active: row.get::<_, i64>(4)? != 0,
                            },
                        ))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let count = rows.len();
        for (token, binding) in rows {
            self.cache.insert(token, binding);
        }
        self.warmed.store(true, Ordering::Release);
        tracing::info!(keys = count, "api key cache warmed");
        Ok(count)
    }

    fn row_to_record(row: &Row<'_>) -> std::result::Result<ApiKeyRecord, rusqlite::Error> {
        Ok(ApiKeyRecord {
            id: row.get(0)?,
            token: row.get(1)?,
            client_name: row.get(2)?,
            adapter_name: row.get(3)?,
            system_prompt_id: row.get(4)?,
            active: row.get::<_, i64>(5)? != 0,
            created_at: parse_ts(row.get::<_, String>(6)?),
            last_used_at: row.get::<_, Option<String>>(7)?.map(parse_ts),
            notes: row.get(8)?,
        })
    }

    const RECORD_COLUMNS: &'static str =
        "id, token, client_name, adapter_name, prompt_id, active, created_at, last_used_at, notes";
}

fn parse_ts(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait]
impl ApiKeyStore for SqliteKeyStore {
    async fn create_key(
        &self,
        client_name: &str,
        adapter_name: &str,
        system_prompt_id: Option<&str>,
        notes: Option<&str>,
    ) -> Result<ApiKeyRecord> {
        let record = ApiKeyRecord {
            id: uuid::Uuid::new_v4().to_string(),
            token: generate_token(),
            client_name: client_name.to_string(),
            adapter_name: adapter_name.to_string(),
            system_prompt_id: system_prompt_id.map(String::from),
            active: true,
            created_at: Utc::now(),
            last_used_at: None,
            notes: notes.map(String::from),
        };

        let insert = record.clone();
        self.db
            .write(move |conn| {
                conn.execute(
                    "INSERT INTO api_keys
                     (id, token, client_name, adapter_name, prompt_id, active, created_at, notes)
                     VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7)",
                    params![
                        insert.id,
                        insert.token,
                        insert.client_name,
                        insert.adapter_name,
                        insert.system_prompt_id,
                        insert.created_at.to_rfc3339(),
                        insert.notes,
                    ],
                )
            })
            .await?;

        self.cache.insert(record.token.clone(), KeyBinding::from(&record));
        Ok(record)
    }

    async fn resolve(&self, token: &str) -> Result<Option<KeyBinding>> {
        if let Some(binding) = self.cache.get(token) {
            return Ok(Some(binding.clone()));
        }

        let token_owned = token.to_string();
        let result = self
            .db
            .read(move |conn| {
                conn.query_row(
                    "SELECT token, client_name, adapter_name, prompt_id, active
                     FROM api_keys WHERE token = ?1",
                    params![token_owned],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            KeyBinding {
                                client_name: row.get(1)?,
                                adapter_name: row.get(2)?,
                                system_prompt_id: row.get(3)?,
                                active: row.get::<_, i64>(4)? != 0,
                            },
                        ))
                    },
                )
                .optional()
            })
            .await;

        match result {
            Ok(Some((token, binding))) => {
                self.cache.insert(token, binding.clone());
                Ok(Some(binding))
            }
            Ok(None) => Ok(None),
            Err(e) if self.warmed.load(Ordering::Acquire) => {
                // Backing store unavailable after warmup: serve the
                // cached snapshot. This token was not cached, so it
                // stays unknown rather than being waved through.
                tracing::warn!(error = %e, "key store degraded, serving cached snapshot");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, token: &str) -> Result<Option<ApiKeyRecord>> {
        let token = token.to_string();
        let record = self
            .db
            .read(move |conn| {
                conn.query_row(
                    &format!("SELECT {} FROM api_keys WHERE token = ?1", Self::RECORD_COLUMNS),
                    params![token],
                    Self::row_to_record,
                )
                .optional()
            })
            .await?;
        Ok(record)
    }

    async fn list(&self) -> Result<Vec<ApiKeyRecord>> {
        let records = self
            .db
            .read(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM api_keys ORDER BY created_at",
                    Self::RECORD_COLUMNS
                ))?;
                let rows = stmt
                    .query_map([], Self::row_to_record)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(records)
    }

    async fn rename(&self, token: &str, client_name: &str) -> Result<bool> {
        let (t, name) = (token.to_string(), client_name.to_string());
        let changed = self
            .db
            .write(move |conn| {
                conn.execute(
                    "UPDATE api_keys SET client_name = ?2 WHERE token = ?1",
                    params![t, name],
                )
            })
            .await?;

        if changed > 0 {
            if let Some(mut binding) = self.cache.get_mut(token) {
                binding.client_name = client_name.to_string();
            }
        }
        Ok(changed > 0)
    }

    async fn deactivate(&self, token: &str) -> Result<bool> {
        let t = token.to_string();
        let changed = self
            .db
            .write(move |conn| {
                conn.execute("UPDATE api_keys SET active = 0 WHERE token = ?1", params![t])
            })
            .await?;

        if changed > 0 {
            if let Some(mut binding) = self.cache.get_mut(token) {
                binding.active = false;
            }
        }
        Ok(changed > 0)
    }

    async fn delete(&self, token: &str) -> Result<bool> {
        let t = token.to_string();
        let changed = self
            .db
            .write(move |conn| conn.execute("DELETE FROM api_keys WHERE token = ?1", params![t]))
            .await?;
        self.cache.remove(token);
        Ok(changed > 0)
    }

    async fn touch_last_used(&self, token: &str) -> Result<()> {
        let t = token.to_string();
        let now = Utc::now().to_rfc3339();
        self.db
            .write(move |conn| {
                conn.execute(
                    "UPDATE api_keys SET last_used_at = ?2 WHERE token = ?1",
                    params![t, now],
                )
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PromptStore for SqliteKeyStore {
    async fn create(&self, name: &str, text: &str) -> Result<SystemPrompt> {
        let prompt = SystemPrompt::new(uuid::Uuid::new_v4().to_string(), name, text);
        let insert = prompt.clone();
        self.db
            .write(move |conn| {
                conn.execute(
                    "INSERT INTO system_prompts (id, name, text, version, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        insert.id,
                        insert.name,
                        insert.text,
                        insert.version,
                        insert.created_at.to_rfc3339(),
                        insert.updated_at.to_rfc3339(),
                    ],
                )
            })
            .await?;
        Ok(prompt)
    }

    async fn get(&self, id: &str) -> Result<Option<SystemPrompt>> {
        let id = id.to_string();
        let prompt = self
            .db
            .read(move |conn| {
                conn.query_row(
                    "SELECT id, name, text, version, created_at, updated_at
                     FROM system_prompts WHERE id = ?1",
                    params![id],
                    row_to_prompt,
                )
                .optional()
            })
            .await?;
        Ok(prompt)
    }

    async fn list(&self) -> Result<Vec<SystemPrompt>> {
        let prompts = self
            .db
            .read(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, text, version, created_at, updated_at
                     FROM system_prompts ORDER BY created_at",
                )?;
                let rows = stmt
                    .query_map([], row_to_prompt)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(prompts)
    }

    async fn update(&self, id: &str, text: &str) -> Result<Option<SystemPrompt>> {
        let (id_owned, text_owned) = (id.to_string(), text.to_string());
        let now = Utc::now().to_rfc3339();
        let changed = self
            .db
            .write(move |conn| {
                conn.execute(
                    "UPDATE system_prompts
                     SET text = ?2, version = version + 1, updated_at = ?3
                     WHERE id = ?1",
                    params![id_owned, text_owned, now],
                )
            })
            .await?;

        if changed == 0 {
            return Ok(None);
        }
        PromptStore::get(self, id).await
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        let changed = self
            .db
            .write(move |conn| {
                conn.execute("DELETE FROM system_prompts WHERE id = ?1", params![id])
            })
            .await?;
        Ok(changed > 0)
    }

    async fn associate(&self, token: &str, prompt_id: &str) -> Result<bool> {
        let (t, p) = (token.to_string(), prompt_id.to_string());
        let changed = self
            .db
            .write(move |conn| {
                let exists: i64 = conn.query_row(
                    "SELECT count(*) FROM system_prompts WHERE id = ?1",
                    params![p],
                    |row| row.get(0),
                )?;
                if exists == 0 {
                    return Ok(0);
                }
                conn.execute("UPDATE api_keys SET prompt_id = ?2 WHERE token = ?1", params![t, p])
            })
            .await?;

        if changed > 0 {
            if let Some(mut binding) = self.cache.get_mut(token) {
                binding.system_prompt_id = Some(prompt_id.to_string());
            }
        }
        Ok(changed > 0)
    }
}

fn row_to_prompt(row: &Row<'_>) -> std::result::Result<SystemPrompt, rusqlite::Error> {
    Ok(SystemPrompt {
        id: row.get(0)?,
        name: row.get(1)?,
        text: row.get(2)?,
        version: row.get(3)?,
        created_at: parse_ts(row.get::<_, String>(4)?),
        updated_at: parse_ts(row.get::<_, String>(5)?),
    })
}

impl From<StoreError> for orbit_core::Error {
    fn from(err: StoreError) -> Self {
        orbit_core::Error::Store(err.to_string())
    }
}
