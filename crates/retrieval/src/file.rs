//! File retriever
//!
//! Queries chunked uploaded files held in a local in-process vector
//! index. Chunking itself happens at ingestion time, outside the
//! gateway; this module loads pre-chunked text (one chunk per blank-
//! line-separated block) and embeds each chunk once at startup.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use orbit_config::AdapterTuning;
use orbit_core::{HealthStatus, Result};

use crate::embeddings::{cosine_similarity, Embedder};
use crate::vector::{RawHit, VectorIndex, VectorRetriever};
use crate::RetrievalError;

struct IndexedChunk {
    vector: Vec<f32>,
    content: String,
    source: String,
}

/// In-process vector index over file chunks.
pub struct LocalVectorIndex {
    chunks: RwLock<Vec<IndexedChunk>>,
}

impl LocalVectorIndex {
    pub fn empty() -> Self {
        Self { chunks: RwLock::new(Vec::new()) }
    }

    /// Load every `.txt`/`.md` file under `dir`; each blank-line-
    /// separated block becomes one chunk.
    pub async fn load_dir(
        name: &str,
        dir: impl AsRef<Path>,
        embedder: &dyn Embedder,
    ) -> Result<Self> {
        let index = Self::empty();
        let dir = dir.as_ref();

        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| RetrievalError::Datasource(format!("{}: {e}", dir.display())).into_core(name))?;

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| RetrievalError::Datasource(e.to_string()).into_core(name))?
        {
            let path = entry.path();
            let is_text = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext == "txt" || ext == "md")
                .unwrap_or(false);
            if is_text {
                files.push(path);
            }
        }
        files.sort();

        for path in files {
            let text = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| RetrievalError::Datasource(e.to_string()).into_core(name))?;
            let source = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            index.add_chunks(&source, &text, embedder).await?;
        }

        let count = index.chunks.read().len();
        tracing::info!(retriever = name, chunks = count, "file index loaded");
        Ok(index)
    }

    /// Index one document's chunks under `source`.
    pub async fn add_chunks(
        &self,
        source: &str,
        text: &str,
        embedder: &dyn Embedder,
    ) -> Result<()> {
        for block in text.split("\n\n") {
            let chunk = block.trim();
            if chunk.is_empty() {
                continue;
            }
            let vector = embedder
                .embed(chunk)
                .await
                .map_err(|e| e.into_core(source))?;
            self.chunks.write().push(IndexedChunk {
                vector,
                content: chunk.to_string(),
                source: source.to_string(),
            });
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.chunks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.read().is_empty()
    }
}

#[async_trait]
impl VectorIndex for LocalVectorIndex {
    async fn search(&self, vector: &[f32], top_k: usize) -> Result<Vec<RawHit>> {
        let chunks = self.chunks.read();
        let mut scored: Vec<RawHit> = chunks
            .iter()
            .map(|chunk| RawHit {
                content: chunk.content.clone(),
                source: chunk.source.clone(),
                answer: None,
                question: None,
                // Cosine distance for the adapter mapping
                distance: 1.0 - cosine_similarity(vector, &chunk.vector),
            })
            .collect();

        scored.sort_by(|a, b| {
            a.distance.partial_cmp(&b.distance).unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn health_check(&self) -> HealthStatus {
        if self.chunks.read().is_empty() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Ok
        }
    }
}

/// File retriever: a [`VectorRetriever`] over a [`LocalVectorIndex`].
pub async fn open_file_retriever(
    name: &str,
    dir: impl AsRef<Path>,
    embedder: Arc<dyn Embedder>,
    tuning: AdapterTuning,
) -> Result<VectorRetriever> {
    let index = LocalVectorIndex::load_dir(name, dir, embedder.as_ref()).await?;
    Ok(VectorRetriever::new(name, embedder, Arc::new(index), tuning))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashEmbedder;
    use orbit_core::{RetrieveOptions, Retriever};

    #[tokio::test]
    async fn test_chunking_on_blank_lines() {
        let embedder = HashEmbedder::new(64);
        let index = LocalVectorIndex::empty();
        index
            .add_chunks("guide.md", "First chunk about parks.\n\nSecond chunk about budgets.", &embedder)
            .await
            .unwrap();
        assert_eq!(index.len(), 2);
    }

    #[tokio::test]
    async fn test_search_prefers_matching_chunk() {
        let embedder = HashEmbedder::new(128);
        let index = LocalVectorIndex::empty();
        index
            .add_chunks(
                "guide.md",
                "The city parks are open from dawn to dusk.\n\n\
                 Property tax bills are issued each spring.",
                &embedder,
            )
            .await
            .unwrap();

        let query_vector = embedder.embed("city parks open hours").await.unwrap();
        let hits = index.search(&query_vector, 2).await.unwrap();
        assert!(hits[0].content.contains("parks"));
        assert!(hits[0].distance <= hits[1].distance);
    }

    #[tokio::test]
    async fn test_empty_index_degraded() {
        let index = LocalVectorIndex::empty();
        assert_eq!(index.health_check().await, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_file_retriever_end_to_end() {
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(128));
        let index = LocalVectorIndex::empty();
        index
            .add_chunks(
                "faq.md",
                "Parks close at sunset every day.\n\nThe pool opens in June.",
                embedder.as_ref(),
            )
            .await
            .unwrap();

        let retriever = VectorRetriever::new(
            "files",
            embedder,
            Arc::new(index),
            AdapterTuning { confidence_threshold: 0.0, return_results: 1, ..Default::default() },
        );

        let docs = retriever
            .get_relevant_documents("when do parks close", &RetrieveOptions::default())
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].metadata.source, "faq.md");
    }
}
