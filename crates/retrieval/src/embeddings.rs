//! Query embedding providers
//!
//! The vector retriever embeds each query exactly once and hands the
//! vector to its datasource. Two providers:
//! - `HashEmbedder` - deterministic feature hashing, no network
//! - `OllamaEmbedder` - Ollama embeddings endpoint

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use orbit_config::{EmbeddingConfig, EmbeddingProvider};

use crate::RetrievalError;

/// Embedding provider interface.
#[async_trait]
pub trait Embedder: Send + Sync + 'static {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError>;

    fn dimension(&self) -> usize;

    fn name(&self) -> &str;
}

/// Build the configured embedder.
pub fn build_embedder(config: &EmbeddingConfig) -> Result<Box<dyn Embedder>, RetrievalError> {
    match config.provider {
        EmbeddingProvider::Hash => Ok(Box::new(HashEmbedder::new(config.dimension))),
        EmbeddingProvider::Ollama => Ok(Box::new(OllamaEmbedder::new(config)?)),
    }
}

/// Deterministic bag-of-words feature-hash embedder.
///
/// Not a learned embedding; good enough for the local file index and
/// for tests, and fully reproducible.
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension: dimension.max(8) }
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError> {
        let mut vector = vec![0.0f32; self.dimension];
        for word in text.to_lowercase().split_whitespace() {
            let mut hasher = DefaultHasher::new();
            word.hash(&mut hasher);
            let hash = hasher.finish();
            let index = (hash % self.dimension as u64) as usize;
            // Sign hashing keeps the expectation at zero
            let sign = if (hash >> 32) & 1 == 0 { 1.0 } else { -1.0 };
            vector[index] += sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        "hash"
    }
}

/// Embedder backed by Ollama's embeddings endpoint.
pub struct OllamaEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    dimension: usize,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, RetrievalError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| RetrievalError::Embedding(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            dimension: config.dimension,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError> {
        let request = EmbeddingRequest { model: self.model.clone(), prompt: text.to_string() };

        let response = self
            .client
            .post(format!("{}/api/embeddings", self.endpoint))
            .json(&request)
            .send()
            .await
            .map_err(|e| RetrievalError::Embedding(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RetrievalError::Embedding(format!("HTTP {status}: {body}")));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| RetrievalError::Embedding(format!("invalid response: {e}")))?;

        if parsed.embedding.is_empty() {
            return Err(RetrievalError::Embedding("empty embedding returned".into()));
        }
        Ok(parsed.embedding)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        "ollama"
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    model: String,
    prompt: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

/// Cosine similarity of two equal-length vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hash_embedder_deterministic() {
        let embedder = HashEmbedder::new(64);
        let a = embedder.embed("city parks and gardens").await.unwrap();
        let b = embedder.embed("city parks and gardens").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn test_hash_embedder_normalized() {
        let embedder = HashEmbedder::new(64);
        let vector = embedder.embed("some text here").await.unwrap();
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_similar_texts_score_higher() {
        let embedder = HashEmbedder::new(128);
        let parks = embedder.embed("the city parks are green").await.unwrap();
        let parks2 = embedder.embed("green parks in the city").await.unwrap();
        let tax = embedder.embed("quarterly tax filing deadline").await.unwrap();

        assert!(cosine_similarity(&parks, &parks2) > cosine_similarity(&parks, &tax));
    }

    #[test]
    fn test_cosine_similarity_edges() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
    }
}
