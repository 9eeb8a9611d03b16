//! System prompt records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stored system prompt.
///
/// Immutable once associated with a live key except through an explicit
/// update, which bumps `version` and `updated_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemPrompt {
    pub id: String,
    pub name: String,
    pub text: String,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SystemPrompt {
    pub fn new(id: impl Into<String>, name: impl Into<String>, text: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            text: text.into(),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply an update, bumping version and timestamp.
    pub fn apply_update(&mut self, text: impl Into<String>) {
        self.text = text.into();
        self.version += 1;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_bumps_version() {
        let mut prompt = SystemPrompt::new("p1", "default", "You are helpful.");
        assert_eq!(prompt.version, 1);

        prompt.apply_update("You are terse.");
        assert_eq!(prompt.version, 2);
        assert_eq!(prompt.text, "You are terse.");
        assert!(prompt.updated_at >= prompt.created_at);
    }
}
