//! Retriever capability set
//!
//! One retriever per datasource kind:
//! - `SqlRetriever` - templated parameterized SQL
//! - `VectorRetriever` - embedding similarity search
//! - `FileRetriever` - chunked uploaded files in a local index

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::document::Document;
use crate::error::Result;

/// Retriever interface.
///
/// # Example
///
/// ```ignore
/// let retriever: Arc<dyn Retriever> = registry.get("qa-vector-chroma")?;
/// let options = RetrieveOptions::default().with_top_k(5);
/// let docs = retriever.get_relevant_documents("Tell me about parks", &options).await?;
/// ```
#[async_trait]
pub trait Retriever: Send + Sync + 'static {
    /// Retrieve relevant documents, sorted by descending score.
    ///
    /// Returning an empty vec means "no relevant context" and is a
    /// first-class outcome, distinct from an `Err`.
    async fn get_relevant_documents(
        &self,
        query: &str,
        options: &RetrieveOptions,
    ) -> Result<Vec<Document>>;

    /// Probe the backing datasource.
    async fn health_check(&self) -> HealthStatus;

    /// Retriever name for logging and circuit-breaker keying.
    fn name(&self) -> &str;
}

/// Datasource health as seen from a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Down,
}

/// Retrieval options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieveOptions {
    /// Number of candidates to pull from the datasource
    pub top_k: usize,
    /// Filter by metadata
    #[serde(default)]
    pub filters: Vec<MetadataFilter>,
}

impl Default for RetrieveOptions {
    fn default() -> Self {
        Self { top_k: 5, filters: Vec::new() }
    }
}

impl RetrieveOptions {
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_filter(mut self, filter: MetadataFilter) -> Self {
        self.filters.push(filter);
        self
    }
}

/// Metadata filter for retrieval
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataFilter {
    pub field: String,
    pub op: FilterOp,
    pub value: serde_json::Value,
}

impl MetadataFilter {
    pub fn eq(field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self { field: field.into(), op: FilterOp::Equals, value: value.into() }
    }
}

/// Filter operations
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum FilterOp {
    Equals,
    NotEquals,
    Contains,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_builder() {
        let options = RetrieveOptions::default()
            .with_top_k(10)
            .with_filter(MetadataFilter::eq("category", "parks"));

        assert_eq!(options.top_k, 10);
        assert_eq!(options.filters.len(), 1);
    }

    #[test]
    fn test_health_status_serde() {
        assert_eq!(serde_json::to_string(&HealthStatus::Ok).unwrap(), "\"ok\"");
        assert_eq!(serde_json::to_string(&HealthStatus::Down).unwrap(), "\"down\"");
    }
}
