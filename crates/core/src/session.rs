//! Session and message records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chat::{ChatMessage, Role};

/// Session summary row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub message_count: u64,
}

/// One persisted conversation message.
///
/// Ordinals are strictly increasing within a session and never reused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub session_id: String,
    pub ordinal: u64,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_estimate: Option<u32>,
    /// Set when moderation replaced the original content with a refusal
    #[serde(default)]
    pub blocked: bool,
}

impl StoredMessage {
    pub fn as_chat_message(&self) -> ChatMessage {
        ChatMessage { role: self.role, content: self.content.clone() }
    }
}

/// Mint a new session id when the client did not supply one.
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_id_unique() {
        assert_ne!(new_session_id(), new_session_id());
    }

    #[test]
    fn test_stored_message_conversion() {
        let stored = StoredMessage {
            session_id: "s1".into(),
            ordinal: 3,
            role: Role::User,
            content: "hello".into(),
            created_at: Utc::now(),
            token_estimate: Some(2),
            blocked: false,
        };
        let msg = stored.as_chat_message();
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content, "hello");
    }
}
