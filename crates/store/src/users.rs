//! Admin-plane user store
//!
//! Credentials are stored as salted SHA-256 digests. Verification is
//! constant-time over the digest bytes.

use async_trait::async_trait;
use chrono::Utc;
use rand::RngCore;
use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};

use orbit_core::{Result, UserRecord, UserStore};

use crate::sqlite::Db;
use crate::StoreError;

/// SQLite-backed user store.
pub struct SqliteUserStore {
    db: Db,
}

impl SqliteUserStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

fn hash_password(password: &str, salt: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    format!("{}${}", hex::encode(salt), hex::encode(hasher.finalize()))
}

fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt_hex, _)) = stored.split_once('$') else {
        return false;
    };
    let Ok(salt) = hex::decode(salt_hex) else {
        return false;
    };
    constant_time_eq(hash_password(password, &salt).as_bytes(), stored.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[async_trait]
impl UserStore for SqliteUserStore {
    async fn register(&self, username: &str, password: &str) -> Result<UserRecord> {
        if username.is_empty() || password.len() < 8 {
            return Err(orbit_core::Error::Validation(
                "username required and password must be at least 8 characters".into(),
            ));
        }

        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);

        let record = UserRecord {
            id: uuid::Uuid::new_v4().to_string(),
            username: username.to_string(),
            password_hash: hash_password(password, &salt),
            created_at: Utc::now(),
        };

        let insert = record.clone();
        let result = self
            .db
            .write(move |conn| {
                conn.execute(
                    "INSERT INTO users (id, username, password_hash, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![insert.id, insert.username, insert.password_hash, insert.created_at.to_rfc3339()],
                )
            })
            .await;

        match result {
            Ok(_) => Ok(record),
            Err(StoreError::Constraint(_)) => Err(orbit_core::Error::Validation(format!(
                "username '{username}' is taken"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn verify(&self, username: &str, password: &str) -> Result<Option<UserRecord>> {
        let Some(record) = self.get(username).await? else {
            return Ok(None);
        };
        if verify_password(password, &record.password_hash) {
            Ok(Some(record))
        } else {
            Ok(None)
        }
    }

    async fn get(&self, username: &str) -> Result<Option<UserRecord>> {
        let name = username.to_string();
        let record = self
            .db
            .read(move |conn| {
                conn.query_row(
                    "SELECT id, username, password_hash, created_at FROM users WHERE username = ?1",
                    params![name],
                    |row| {
                        Ok(UserRecord {
                            id: row.get(0)?,
                            username: row.get(1)?,
                            password_hash: row.get(2)?,
                            created_at: chrono::DateTime::parse_from_rfc3339(
                                &row.get::<_, String>(3)?,
                            )
                            .map(|dt| dt.with_timezone(&Utc))
                            .unwrap_or_else(|_| Utc::now()),
                        })
                    },
                )
                .optional()
            })
            .await?;
        Ok(record)
    }
}
