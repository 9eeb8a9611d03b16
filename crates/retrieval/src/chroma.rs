//! Chroma-backed vector index
//!
//! Talks to Chroma's HTTP API. Collections are addressed by name; the
//! collection id is resolved on first use and cached.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use orbit_core::{HealthStatus, Result};

use crate::vector::{RawHit, VectorIndex};
use crate::RetrievalError;

/// Chroma REST index.
pub struct ChromaIndex {
    client: Client,
    base_url: String,
    collection_name: String,
    collection_id: Mutex<Option<String>>,
    source: String,
    target: String,
}

impl ChromaIndex {
    pub fn connect(name: &str, source: &str, url: &str, collection: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| RetrievalError::Datasource(e.to_string()).into_core(name))?;

        Ok(Self {
            client,
            base_url: url.trim_end_matches('/').to_string(),
            collection_name: collection.to_string(),
            collection_id: Mutex::new(None),
            source: source.to_string(),
            target: name.to_string(),
        })
    }

    async fn resolve_collection_id(&self) -> std::result::Result<String, RetrievalError> {
        if let Some(id) = self.collection_id.lock().clone() {
            return Ok(id);
        }

        let response = self
            .client
            .get(format!("{}/api/v1/collections/{}", self.base_url, self.collection_name))
            .send()
            .await
            .map_err(|e| RetrievalError::Datasource(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(RetrievalError::Datasource(format!(
                "collection '{}' lookup failed: HTTP {status}",
                self.collection_name
            )));
        }

        let collection: CollectionInfo = response
            .json()
            .await
            .map_err(|e| RetrievalError::Datasource(format!("invalid response: {e}")))?;

        *self.collection_id.lock() = Some(collection.id.clone());
        Ok(collection.id)
    }
}

#[async_trait]
impl VectorIndex for ChromaIndex {
    async fn search(&self, vector: &[f32], top_k: usize) -> Result<Vec<RawHit>> {
        let collection_id = self
            .resolve_collection_id()
            .await
            .map_err(|e| e.into_core(&self.target))?;

        let body = json!({
            "query_embeddings": [vector],
            "n_results": top_k,
            "include": ["documents", "metadatas", "distances"],
        });

        let response = self
            .client
            .post(format!("{}/api/v1/collections/{collection_id}/query", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| RetrievalError::Datasource(e.to_string()).into_core(&self.target))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(RetrievalError::Datasource(format!("HTTP {status}: {text}"))
                .into_core(&self.target));
        }

        let parsed: QueryResponse = response.json().await.map_err(|e| {
            RetrievalError::Datasource(format!("invalid response: {e}")).into_core(&self.target)
        })?;

        // Chroma nests one result set per query embedding; we send one.
        let documents = parsed.documents.into_iter().next().unwrap_or_default();
        let metadatas = parsed.metadatas.into_iter().next().unwrap_or_default();
        let distances = parsed.distances.into_iter().next().unwrap_or_default();

        let hits = documents
            .into_iter()
            .enumerate()
            .map(|(i, content)| {
                let metadata = metadatas.get(i).cloned().flatten().unwrap_or_default();
                let text_field = |key: &str| {
                    metadata.get(key).and_then(|v| v.as_str()).map(String::from)
                };
                RawHit {
                    content: content.unwrap_or_default(),
                    source: text_field("source").unwrap_or_else(|| self.source.clone()),
                    answer: text_field("answer"),
                    question: text_field("question"),
                    distance: distances.get(i).copied().unwrap_or(1.0),
                }
            })
            .collect();
        Ok(hits)
    }

    async fn health_check(&self) -> HealthStatus {
        let reachable = self
            .client
            .get(format!("{}/api/v1/heartbeat", self.base_url))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false);
        if reachable {
            HealthStatus::Ok
        } else {
            HealthStatus::Down
        }
    }
}

#[derive(Debug, Deserialize)]
struct CollectionInfo {
    id: String,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    documents: Vec<Vec<Option<String>>>,
    #[serde(default)]
    metadatas: Vec<Vec<Option<serde_json::Map<String, serde_json::Value>>>>,
    #[serde(default)]
    distances: Vec<Vec<f32>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_response_parsing() {
        let body = r#"{
            "ids": [["a", "b"]],
            "documents": [["Central park covers 40 acres.", "Riverside trails."]],
            "metadatas": [[{"source": "parks_kb"}, null]],
            "distances": [[0.18, 0.29]]
        }"#;
        let parsed: QueryResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.documents[0].len(), 2);
        assert_eq!(parsed.distances[0][0], 0.18);
        assert!(parsed.metadatas[0][1].is_none());
    }

    #[test]
    fn test_connect_normalizes_url() {
        let index =
            ChromaIndex::connect("qa-chroma", "kb", "http://localhost:8000/", "city_kb").unwrap();
        assert_eq!(index.base_url, "http://localhost:8000");
    }
}
