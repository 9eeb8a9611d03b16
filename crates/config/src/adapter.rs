//! Adapter and datasource configuration
//!
//! An adapter is a named binding of a retriever implementation, a
//! datasource, and tuning parameters. API keys reference adapters by
//! name; the set is enumerated at startup and append-only until
//! restart.

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Adapter kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    /// Retrieval-augmented: runs a retriever before inference
    #[default]
    Retriever,
    /// Inference-only: no retrieval stage
    Passthrough,
}

/// Retriever family selected by the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterFamily {
    /// Question/answer datasource with structured answer fields
    Qa,
    /// Generic passage retrieval
    Generic,
    /// Chunked uploaded files
    File,
}

/// Distance-to-confidence mapping, declared per adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceMapping {
    /// s = 1 - d (cosine distance)
    #[default]
    Cosine,
    /// s = exp(-d / distance_scaling_factor)
    ScaledExponential,
}

impl ConfidenceMapping {
    /// Map a raw datasource distance to a confidence in [0, 1].
    pub fn apply(&self, distance: f32, scaling_factor: f32) -> f32 {
        let score = match self {
            ConfidenceMapping::Cosine => 1.0 - distance,
            ConfidenceMapping::ScaledExponential => (-distance / scaling_factor).exp(),
        };
        score.clamp(0.0, 1.0)
    }
}

/// Per-adapter tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterTuning {
    /// Results below this confidence are dropped
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,

    /// Candidates pulled from the datasource
    #[serde(default = "default_max_results")]
    pub max_results: usize,

    /// Documents returned to the pipeline after filtering
    #[serde(default = "default_return_results")]
    pub return_results: usize,

    /// Embedding provider name, for vector families
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_provider: Option<String>,

    /// k for the scaled_exponential mapping
    #[serde(default = "default_distance_scaling")]
    pub distance_scaling_factor: f32,

    #[serde(default)]
    pub confidence_mapping: ConfidenceMapping,

    /// Enable the lexical reranker over candidates
    #[serde(default)]
    pub rerank: bool,
}

fn default_confidence_threshold() -> f32 {
    0.3
}
fn default_max_results() -> usize {
    10
}
fn default_return_results() -> usize {
    5
}
fn default_distance_scaling() -> f32 {
    200.0
}

impl Default for AdapterTuning {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            max_results: default_max_results(),
            return_results: default_return_results(),
            embedding_provider: None,
            distance_scaling_factor: default_distance_scaling(),
            confidence_mapping: ConfidenceMapping::default(),
            rerank: false,
        }
    }
}

/// One configured adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub name: String,

    #[serde(default)]
    pub kind: AdapterKind,

    /// Datasource name, resolved against `[datasources]`
    #[serde(default)]
    pub datasource: Option<String>,

    #[serde(default = "default_family")]
    pub adapter_family: AdapterFamily,

    /// Registered implementation the factory instantiates
    /// (e.g. "sql", "qdrant", "file")
    pub implementation_ref: String,

    /// Inference provider this adapter routes to; falls back to
    /// `inference.default_provider`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    #[serde(default)]
    pub config: AdapterTuning,

    /// Deprecated legacy field. Keys bind to adapters by name only;
    /// configurations carrying this are rejected at load.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
}

fn default_family() -> AdapterFamily {
    AdapterFamily::Generic
}

impl AdapterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.collection.is_some() {
            return Err(ConfigError::InvalidValue {
                field: format!("adapters.{}.collection", self.name),
                message: "legacy per-key collection binding is not supported; \
                          bind keys to adapters by name"
                    .into(),
            });
        }
        if !(0.0..=1.0).contains(&self.config.confidence_threshold) {
            return Err(ConfigError::InvalidValue {
                field: format!("adapters.{}.config.confidence_threshold", self.name),
                message: "must be within [0, 1]".into(),
            });
        }
        if self.config.distance_scaling_factor <= 0.0 {
            return Err(ConfigError::InvalidValue {
                field: format!("adapters.{}.config.distance_scaling_factor", self.name),
                message: "must be positive".into(),
            });
        }
        if self.config.return_results > self.config.max_results {
            return Err(ConfigError::InvalidValue {
                field: format!("adapters.{}.config.return_results", self.name),
                message: "cannot exceed max_results".into(),
            });
        }
        if self.kind == AdapterKind::Retriever && self.datasource.is_none() {
            return Err(ConfigError::MissingField(format!(
                "adapters.{}.datasource",
                self.name
            )));
        }
        Ok(())
    }
}

/// Datasource kinds. A closed set: the registry instantiates only these;
/// runtime code loading is forbidden.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DatasourceConfig {
    Sqlite {
        path: String,
        #[serde(default)]
        sql: Option<SqlTemplate>,
    },
    Postgres {
        url: String,
        #[serde(default)]
        sql: Option<SqlTemplate>,
    },
    Mysql {
        url: String,
        #[serde(default)]
        sql: Option<SqlTemplate>,
    },
    Qdrant {
        url: String,
        collection: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        api_key: Option<String>,
    },
    Chroma {
        url: String,
        collection: String,
    },
    Elasticsearch {
        url: String,
        index: String,
    },
    /// Local index over chunked uploaded files
    File {
        /// Directory holding the ingested chunk index
        path: String,
    },
}

impl DatasourceConfig {
    pub fn kind_name(&self) -> &'static str {
        match self {
            DatasourceConfig::Sqlite { .. } => "sqlite",
            DatasourceConfig::Postgres { .. } => "postgres",
            DatasourceConfig::Mysql { .. } => "mysql",
            DatasourceConfig::Qdrant { .. } => "qdrant",
            DatasourceConfig::Chroma { .. } => "chroma",
            DatasourceConfig::Elasticsearch { .. } => "elasticsearch",
            DatasourceConfig::File { .. } => "file",
        }
    }
}

/// Parameterized SQL template for the SQL retriever family.
///
/// Placeholders use `{param_name}` and must be declared with a type;
/// undeclared placeholders are rejected at load, never interpolated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlTemplate {
    pub query: String,
    #[serde(default)]
    pub params: Vec<SqlParamDecl>,
    /// Column carrying the structured answer, for QA families
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_column: Option<String>,
    /// Column carrying the matched question text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_column: Option<String>,
    /// Column carrying document content
    #[serde(default = "default_content_column")]
    pub content_column: String,
}

fn default_content_column() -> String {
    "content".to_string()
}

/// Declared template parameter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlParamDecl {
    pub name: String,
    #[serde(rename = "type", default)]
    pub param_type: SqlParamType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SqlParamType {
    #[default]
    Text,
    Integer,
    Real,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(name: &str) -> AdapterConfig {
        AdapterConfig {
            name: name.into(),
            kind: AdapterKind::Retriever,
            datasource: Some("kb".into()),
            adapter_family: AdapterFamily::Qa,
            implementation_ref: "sql".into(),
            provider: None,
            config: AdapterTuning::default(),
            collection: None,
        }
    }

    #[test]
    fn test_confidence_mappings() {
        let cosine = ConfidenceMapping::Cosine;
        assert!((cosine.apply(0.2, 200.0) - 0.8).abs() < 1e-6);
        // Distances above 1.0 clamp to zero confidence
        assert_eq!(cosine.apply(1.5, 200.0), 0.0);

        let scaled = ConfidenceMapping::ScaledExponential;
        assert!((scaled.apply(0.0, 200.0) - 1.0).abs() < 1e-6);
        let s = scaled.apply(100.0, 200.0);
        assert!(s > 0.6 && s < 0.61);
    }

    #[test]
    fn test_legacy_collection_rejected() {
        let mut cfg = adapter("qa-sql");
        cfg.collection = Some("old_collection".into());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_threshold_range_checked() {
        let mut cfg = adapter("qa-sql");
        cfg.config.confidence_threshold = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_retriever_requires_datasource() {
        let mut cfg = adapter("qa-sql");
        cfg.datasource = None;
        assert!(cfg.validate().is_err());

        cfg.kind = AdapterKind::Passthrough;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_return_results_bounded_by_max() {
        let mut cfg = adapter("qa-sql");
        cfg.config.return_results = 50;
        cfg.config.max_results = 10;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_datasource_deserialization() {
        let yaml = r#"
kind: qdrant
url: http://localhost:6334
collection: city_kb
"#;
        let ds: DatasourceConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(ds.kind_name(), "qdrant");
    }
}
