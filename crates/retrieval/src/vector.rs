//! Vector retriever
//!
//! Embeds the query once, searches the datasource for `max_results`
//! candidates, maps raw distance to confidence with the adapter's
//! declared mapping, drops sub-threshold results, optionally reranks,
//! and returns up to `return_results` documents sorted by score.

use std::sync::Arc;

use async_trait::async_trait;
use qdrant_client::qdrant::value::Kind;
use qdrant_client::qdrant::SearchPointsBuilder;
use qdrant_client::Qdrant;

use orbit_config::AdapterTuning;
use orbit_core::{Document, HealthStatus, Result, RetrieveOptions, Retriever};

use crate::embeddings::Embedder;
use crate::reranker::rerank;
use crate::RetrievalError;

/// One raw hit from a vector datasource, before confidence mapping.
#[derive(Debug, Clone)]
pub struct RawHit {
    pub content: String,
    pub source: String,
    pub answer: Option<String>,
    pub question: Option<String>,
    /// Raw distance (lower is closer)
    pub distance: f32,
}

/// Similarity search over one datasource.
#[async_trait]
pub trait VectorIndex: Send + Sync + 'static {
    async fn search(&self, vector: &[f32], top_k: usize) -> Result<Vec<RawHit>>;

    async fn health_check(&self) -> HealthStatus;
}

/// Retriever over any [`VectorIndex`].
pub struct VectorRetriever {
    name: String,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    tuning: AdapterTuning,
}

impl VectorRetriever {
    pub fn new(
        name: &str,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        tuning: AdapterTuning,
    ) -> Self {
        Self { name: name.to_string(), embedder, index, tuning }
    }
}

#[async_trait]
impl Retriever for VectorRetriever {
    async fn get_relevant_documents(
        &self,
        query: &str,
        _options: &RetrieveOptions,
    ) -> Result<Vec<Document>> {
        // One embedding per request
        let vector = self
            .embedder
            .embed(query)
            .await
            .map_err(|e| e.into_core(&self.name))?;

        let hits = self.index.search(&vector, self.tuning.max_results).await?;

        let mut documents: Vec<Document> = hits
            .into_iter()
            .map(|hit| {
                let confidence = self
                    .tuning
                    .confidence_mapping
                    .apply(hit.distance, self.tuning.distance_scaling_factor);
                let mut doc = Document::new(hit.content, confidence).with_source(hit.source);
                doc.metadata.answer = hit.answer;
                doc.metadata.question = hit.question;
                doc.metadata.distance = Some(hit.distance);
                doc.metadata.confidence = Some(confidence);
                doc
            })
            .filter(|doc| doc.score >= self.tuning.confidence_threshold)
            .collect();

        if self.tuning.rerank {
            documents = rerank(query, documents);
        }

        // Stable sort keeps datasource order as the tie-break
        documents
            .sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        documents.truncate(self.tuning.return_results);
        Ok(documents)
    }

    async fn health_check(&self) -> HealthStatus {
        self.index.health_check().await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Qdrant-backed index.
pub struct QdrantIndex {
    client: Qdrant,
    collection: String,
    source: String,
    target: String,
}

impl QdrantIndex {
    pub fn connect(
        name: &str,
        source: &str,
        url: &str,
        collection: &str,
        api_key: Option<&str>,
    ) -> Result<Self> {
        let mut builder = Qdrant::from_url(url);
        if let Some(key) = api_key {
            builder = builder.api_key(key.to_string());
        }
        let client = builder
            .build()
            .map_err(|e| RetrievalError::Datasource(e.to_string()).into_core(name))?;

        Ok(Self {
            client,
            collection: collection.to_string(),
            source: source.to_string(),
            target: name.to_string(),
        })
    }

    fn payload_text(payload: &std::collections::HashMap<String, qdrant_client::qdrant::Value>, key: &str) -> Option<String> {
        payload.get(key).and_then(|value| match &value.kind {
            Some(Kind::StringValue(s)) => Some(s.clone()),
            _ => None,
        })
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn search(&self, vector: &[f32], top_k: usize) -> Result<Vec<RawHit>> {
        let response = self
            .client
            .search_points(
                SearchPointsBuilder::new(&self.collection, vector.to_vec(), top_k as u64)
                    .with_payload(true),
            )
            .await
            .map_err(|e| RetrievalError::Datasource(e.to_string()).into_core(&self.target))?;

        let hits = response
            .result
            .into_iter()
            .map(|point| {
                let payload = point.payload;
                RawHit {
                    content: Self::payload_text(&payload, "content").unwrap_or_default(),
                    source: Self::payload_text(&payload, "source")
                        .unwrap_or_else(|| self.source.clone()),
                    answer: Self::payload_text(&payload, "answer"),
                    question: Self::payload_text(&payload, "question"),
                    // Qdrant reports cosine similarity; convert back to
                    // a distance so the adapter mapping applies uniformly.
                    distance: 1.0 - point.score,
                }
            })
            .collect();
        Ok(hits)
    }

    async fn health_check(&self) -> HealthStatus {
        match self.client.health_check().await {
            Ok(_) => HealthStatus::Ok,
            Err(_) => HealthStatus::Down,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashEmbedder;
    use orbit_config::ConfidenceMapping;

    /// Scripted index used across retriever tests.
    pub struct FixedIndex {
        pub hits: Vec<RawHit>,
    }

    #[async_trait]
    impl VectorIndex for FixedIndex {
        async fn search(&self, _vector: &[f32], top_k: usize) -> Result<Vec<RawHit>> {
            Ok(self.hits.iter().take(top_k).cloned().collect())
        }

        async fn health_check(&self) -> HealthStatus {
            HealthStatus::Ok
        }
    }

    fn hit(content: &str, distance: f32) -> RawHit {
        RawHit {
            content: content.into(),
            source: "kb".into(),
            answer: None,
            question: None,
            distance,
        }
    }

    fn retriever(hits: Vec<RawHit>, tuning: AdapterTuning) -> VectorRetriever {
        VectorRetriever::new(
            "qa-vector",
            Arc::new(HashEmbedder::new(32)),
            Arc::new(FixedIndex { hits }),
            tuning,
        )
    }

    #[tokio::test]
    async fn test_threshold_and_return_limit() {
        // Cosine mapping: distances 0.18/0.29/0.40 -> scores 0.82/0.71/0.60
        let retriever = retriever(
            vec![hit("a", 0.18), hit("b", 0.29), hit("c", 0.40)],
            AdapterTuning {
                confidence_threshold: 0.65,
                max_results: 10,
                return_results: 2,
                confidence_mapping: ConfidenceMapping::Cosine,
                ..Default::default()
            },
        );

        let docs = retriever
            .get_relevant_documents("parks", &RetrieveOptions::default())
            .await
            .unwrap();

        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].content, "a");
        assert!((docs[0].score - 0.82).abs() < 1e-5);
        assert_eq!(docs[1].content, "b");
    }

    #[tokio::test]
    async fn test_scaled_exponential_mapping() {
        let retriever = retriever(
            vec![hit("a", 0.0), hit("b", 200.0)],
            AdapterTuning {
                confidence_threshold: 0.0,
                distance_scaling_factor: 200.0,
                confidence_mapping: ConfidenceMapping::ScaledExponential,
                ..Default::default()
            },
        );

        let docs = retriever
            .get_relevant_documents("anything", &RetrieveOptions::default())
            .await
            .unwrap();

        assert!((docs[0].score - 1.0).abs() < 1e-5);
        assert!((docs[1].score - (-1.0f32).exp()).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_empty_result_is_first_class() {
        let retriever = retriever(
            Vec::new(),
            AdapterTuning { confidence_threshold: 0.9, ..Default::default() },
        );
        let docs = retriever
            .get_relevant_documents("no matches", &RetrieveOptions::default())
            .await
            .unwrap();
        assert!(docs.is_empty());
    }

    #[tokio::test]
    async fn test_distance_recorded_in_metadata() {
        let retriever = retriever(
            vec![hit("a", 0.25)],
            AdapterTuning { confidence_threshold: 0.0, ..Default::default() },
        );
        let docs = retriever
            .get_relevant_documents("q", &RetrieveOptions::default())
            .await
            .unwrap();
        assert_eq!(docs[0].metadata.distance, Some(0.25));
    }
}
