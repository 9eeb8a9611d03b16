//! API key, prompt, and user store capability sets

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api_key::{ApiKeyRecord, KeyBinding};
use crate::error::Result;
use crate::prompt::SystemPrompt;

/// API key persistence and resolution.
///
/// `resolve` is the hot path: O(1) under a bounded in-memory cache,
/// never blocking on the network once warmed. Mutations are
/// write-through so the cache stays authoritative.
#[async_trait]
pub trait ApiKeyStore: Send + Sync + 'static {
    async fn create_key(
        &self,
        client_name: &str,
        adapter_name: &str,
        system_prompt_id: Option<&str>,
        notes: Option<&str>,
    ) -> Result<ApiKeyRecord>;

    /// Resolve a token to its binding. `Ok(None)` means unknown token.
    async fn resolve(&self, token: &str) -> Result<Option<KeyBinding>>;

    async fn get(&self, token: &str) -> Result<Option<ApiKeyRecord>>;

    async fn list(&self) -> Result<Vec<ApiKeyRecord>>;

    /// Rename the owning client. Returns false if the token is unknown.
    async fn rename(&self, token: &str, client_name: &str) -> Result<bool>;

    /// Soft deactivation; history is preserved.
    async fn deactivate(&self, token: &str) -> Result<bool>;

    async fn delete(&self, token: &str) -> Result<bool>;

    /// Record key usage. Called off the hot path; failures are logged,
    /// not surfaced.
    async fn touch_last_used(&self, token: &str) -> Result<()>;
}

/// System prompt CRUD.
#[async_trait]
pub trait PromptStore: Send + Sync + 'static {
    async fn create(&self, name: &str, text: &str) -> Result<SystemPrompt>;

    async fn get(&self, id: &str) -> Result<Option<SystemPrompt>>;

    async fn list(&self) -> Result<Vec<SystemPrompt>>;

    /// Update text, bumping version/updated_at. `Ok(None)` if unknown.
    async fn update(&self, id: &str, text: &str) -> Result<Option<SystemPrompt>>;

    async fn delete(&self, id: &str) -> Result<bool>;

    /// Bind a prompt to an API key token.
    async fn associate(&self, token: &str, prompt_id: &str) -> Result<bool>;
}

/// Admin-plane user record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    /// Salted hash, never the raw password
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Admin-plane user auth.
#[async_trait]
pub trait UserStore: Send + Sync + 'static {
    async fn register(&self, username: &str, password: &str) -> Result<UserRecord>;

    /// Verify credentials; `Ok(None)` on mismatch or unknown user.
    async fn verify(&self, username: &str, password: &str) -> Result<Option<UserRecord>>;

    async fn get(&self, username: &str) -> Result<Option<UserRecord>>;
}
