//! Streaming response envelope
//!
//! One JSON object per line on the wire. Every stream ends with exactly
//! one `done` event; nothing may follow it.

use serde::{Deserialize, Serialize};

use crate::document::Document;

/// One line of the newline-delimited response stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChatEvent {
    /// Incremental assistant text
    Text { content: String },
    /// Base64-encoded audio payload
    Audio { content: String },
    /// Grounding sources used for the response
    Sources { content: Vec<SourceEntry> },
    /// User-visible failure; the stream still terminates with `done`
    Error { content: String },
    /// Terminal event
    Done,
}

impl ChatEvent {
    pub fn text(content: impl Into<String>) -> Self {
        ChatEvent::Text { content: content.into() }
    }

    pub fn error(content: impl Into<String>) -> Self {
        ChatEvent::Error { content: content.into() }
    }

    /// Serialize as one NDJSON line, newline included.
    pub fn to_line(&self) -> String {
        // Serialization of this enum cannot fail: all payloads are
        // strings, floats, and vectors thereof.
        let mut line = serde_json::to_string(self).unwrap_or_else(|_| "{\"type\":\"error\"}".into());
        line.push('\n');
        line
    }
}

/// One entry of a `sources` event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceEntry {
    pub source: String,
    pub score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Set to "diagnostic" for warnings carried alongside real sources
    /// (e.g. retrieval failed and the turn continued inference-only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl SourceEntry {
    pub fn diagnostic(message: impl Into<String>) -> Self {
        Self {
            source: "diagnostics".into(),
            score: 0.0,
            question: None,
            answer: None,
            content: Some(message.into()),
            kind: Some("diagnostic".into()),
        }
    }
}

impl From<&Document> for SourceEntry {
    fn from(doc: &Document) -> Self {
        Self {
            source: doc.metadata.source.clone(),
            score: doc.score,
            question: doc.metadata.question.clone(),
            answer: doc.metadata.answer.clone(),
            content: if doc.metadata.answer.is_some() {
                None
            } else {
                Some(doc.content.clone())
            },
            kind: None,
        }
    }
}
