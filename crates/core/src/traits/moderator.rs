//! Content-safety moderator capability set

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Which side of the model the text came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// User message, checked before retrieval
    Input,
    /// Full generated assistant text, checked before persistence
    Output,
}

/// Moderation verdict
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub safe: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
    /// Moderator that produced the verdict
    pub moderator: String,
}

impl Verdict {
    pub fn safe(moderator: impl Into<String>) -> Self {
        Self { safe: true, reason: None, score: None, moderator: moderator.into() }
    }

    pub fn blocked(moderator: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            safe: false,
            reason: Some(reason.into()),
            score: None,
            moderator: moderator.into(),
        }
    }

    pub fn with_score(mut self, score: f32) -> Self {
        self.score = Some(score);
        self
    }
}

/// One content-safety checker.
///
/// Implementations:
/// - `RuleGuard` - keyword + refusal-marker heuristics, no network
/// - `OpenAiModerator` - OpenAI moderation endpoint
#[async_trait]
pub trait Moderator: Send + Sync + 'static {
    async fn check(&self, text: &str, direction: Direction) -> Result<Verdict>;

    fn name(&self) -> &str;
}
