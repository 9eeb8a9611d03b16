//! Retrieval for the inference gateway
//!
//! Features:
//! - Retriever registry keyed by adapter name (closed factory)
//! - SQL retriever over declared parameterized templates
//! - Vector retrievers over Qdrant and Chroma with per-adapter
//!   confidence mapping
//! - File retriever over a local in-process chunk index
//! - Query embedding (feature hash or Ollama)
//! - Lexical reranking

pub mod embeddings;
pub mod sql;
pub mod vector;
pub mod chroma;
pub mod file;
pub mod reranker;
pub mod registry;

pub use embeddings::{Embedder, HashEmbedder, OllamaEmbedder, build_embedder, cosine_similarity};
pub use sql::SqlRetriever;
pub use vector::{VectorRetriever, VectorIndex, QdrantIndex, RawHit};
pub use chroma::ChromaIndex;
pub use file::{LocalVectorIndex, open_file_retriever};
pub use reranker::{lexical_overlap, rerank};
pub use registry::{RetrieverRegistry, default_qa_template};

use thiserror::Error;

/// Retrieval errors
#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Datasource error: {0}")]
    Datasource(String),

    #[error("Template error: {0}")]
    Template(String),
}

impl RetrievalError {
    /// Map into the gateway taxonomy against a retriever target.
    /// Datasource and embedding failures are transient (retryable);
    /// template problems are configuration errors.
    pub fn into_core(self, retriever: &str) -> orbit_core::Error {
        let target = format!("retriever:{retriever}");
        match self {
            RetrievalError::Embedding(message) | RetrievalError::Datasource(message) => {
                orbit_core::Error::UpstreamTransient { target, message }
            }
            RetrievalError::Template(message) => orbit_core::Error::Config(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        let err = RetrievalError::Datasource("connection refused".into()).into_core("qa");
        assert!(err.is_transient());

        let err = RetrievalError::Template("bad placeholder".into()).into_core("qa");
        assert!(matches!(err, orbit_core::Error::Config(_)));
    }
}
