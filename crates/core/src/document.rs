//! Retrieved document types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Result of a retriever call.
///
/// A retriever that finds nothing returns an empty `Vec<Document>`;
/// placeholder documents are never fabricated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Document content
    pub content: String,
    /// Relevance score in [0, 1], highest first
    pub score: f32,
    /// Document metadata
    #[serde(default)]
    pub metadata: DocumentMetadata,
}

/// Metadata attached to a retrieved document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Origin of the document (table, collection, file name)
    pub source: String,
    /// Structured answer for QA-family datasources
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    /// Matched question for QA-family datasources
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    /// Raw distance reported by the datasource, before confidence mapping
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<f32>,
    /// Mapped confidence in [0, 1]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    /// Extra datasource-specific fields
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, serde_json::Value>,
}

impl Document {
    pub fn new(content: impl Into<String>, score: f32) -> Self {
        Self {
            content: content.into(),
            score,
            metadata: DocumentMetadata::default(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.metadata.source = source.into();
        self
    }

    pub fn with_answer(mut self, answer: impl Into<String>) -> Self {
        self.metadata.answer = Some(answer.into());
        self
    }

    pub fn with_question(mut self, question: impl Into<String>) -> Self {
        self.metadata.question = Some(question.into());
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.metadata.confidence = Some(confidence);
        self
    }

    /// Whether this document can serve as a direct answer at the given
    /// confidence threshold: it carries a structured `answer` and its
    /// confidence meets the bar.
    pub fn qualifies_as_direct_answer(&self, threshold: f32) -> bool {
        self.metadata.answer.is_some()
            && self.metadata.confidence.unwrap_or(self.score) >= threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_builder() {
        let doc = Document::new("Park info", 0.82)
            .with_source("city_faq")
            .with_answer("1,234,567")
            .with_confidence(0.9);

        assert_eq!(doc.metadata.source, "city_faq");
        assert_eq!(doc.metadata.answer.as_deref(), Some("1,234,567"));
        assert_eq!(doc.score, 0.82);
    }

    #[test]
    fn test_direct_answer_qualification() {
        let qualified = Document::new("", 0.5)
            .with_answer("42")
            .with_confidence(0.9);
        assert!(qualified.qualifies_as_direct_answer(0.7));

        // No structured answer field
        let content_only = Document::new("some text", 0.99);
        assert!(!content_only.qualifies_as_direct_answer(0.7));

        // Confidence below threshold
        let weak = Document::new("", 0.5).with_answer("42").with_confidence(0.5);
        assert!(!weak.qualifies_as_direct_answer(0.7));
    }

    #[test]
    fn test_confidence_falls_back_to_score() {
        let doc = Document::new("", 0.8).with_answer("yes");
        assert!(doc.qualifies_as_direct_answer(0.7));
        assert!(!doc.qualifies_as_direct_answer(0.9));
    }
}
