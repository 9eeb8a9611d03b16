//! API key records and bindings

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted API key record.
///
/// `token` is unique. Deactivation is soft (`active = false`) and never
/// deletes conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: String,
    pub token: String,
    pub client_name: String,
    pub adapter_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt_id: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Resolved binding for a token: what the pipeline needs on the hot path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyBinding {
    pub client_name: String,
    pub adapter_name: String,
    pub system_prompt_id: Option<String>,
    pub active: bool,
}

impl From<&ApiKeyRecord> for KeyBinding {
    fn from(record: &ApiKeyRecord) -> Self {
        Self {
            client_name: record.client_name.clone(),
            adapter_name: record.adapter_name.clone(),
            system_prompt_id: record.system_prompt_id.clone(),
            active: record.active,
        }
    }
}
