//! Retriever registry
//!
//! Instantiates one retriever per configured adapter at startup, keyed
//! by adapter name. The set is a closed factory over
//! `implementation_ref`; the registry is append-only until restart and
//! instances are shared read-only across pipeline invocations.

use std::collections::HashMap;
use std::sync::Arc;

use orbit_config::{
    AdapterConfig, AdapterKind, DatasourceConfig, EmbeddingConfig, Settings, SqlTemplate,
};
use orbit_core::{Error, HealthStatus, Result, Retriever};

use crate::chroma::ChromaIndex;
use crate::embeddings::{build_embedder, Embedder};
use crate::file::open_file_retriever;
use crate::sql::SqlRetriever;
use crate::vector::{QdrantIndex, VectorRetriever};

/// Registry of retriever instances keyed by adapter name.
pub struct RetrieverRegistry {
    retrievers: HashMap<String, Arc<dyn Retriever>>,
    /// Adapters with no retrieval stage
    passthrough: Vec<String>,
}

impl RetrieverRegistry {
    /// Build every configured adapter. Unknown implementation refs and
    /// unsupported datasource kinds are startup configuration errors.
    pub async fn build(settings: &Settings) -> Result<Self> {
        let embedder: Arc<dyn Embedder> = build_embedder(&settings.embeddings)
            .map_err(|e| Error::Config(e.to_string()))?
            .into();

        let mut retrievers: HashMap<String, Arc<dyn Retriever>> = HashMap::new();
        let mut passthrough = Vec::new();

        for adapter in &settings.adapters {
            if adapter.kind == AdapterKind::Passthrough {
                passthrough.push(adapter.name.clone());
                continue;
            }

            let retriever =
                Self::instantiate(adapter, settings, Arc::clone(&embedder)).await?;
            tracing::info!(
                adapter = %adapter.name,
                implementation = %adapter.implementation_ref,
                "retriever registered"
            );
            retrievers.insert(adapter.name.clone(), retriever);
        }

        Ok(Self { retrievers, passthrough })
    }

    /// Assemble a registry from pre-built retrievers. Used by tests and
    /// by embedders that bring their own datasources.
    pub fn from_parts(
        retrievers: HashMap<String, Arc<dyn Retriever>>,
        passthrough: Vec<String>,
    ) -> Self {
        Self { retrievers, passthrough }
    }

    async fn instantiate(
        adapter: &AdapterConfig,
        settings: &Settings,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Arc<dyn Retriever>> {
        let datasource_name = adapter
            .datasource
            .as_deref()
            .ok_or_else(|| Error::Config(format!("adapter '{}' has no datasource", adapter.name)))?;
        let datasource = settings.datasources.get(datasource_name).ok_or_else(|| {
            Error::Config(format!(
                "adapter '{}' references unknown datasource '{datasource_name}'",
                adapter.name
            ))
        })?;

        let retriever: Arc<dyn Retriever> = match (adapter.implementation_ref.as_str(), datasource) {
            ("sql", DatasourceConfig::Sqlite { path, sql }) => {
                let template = sql.clone().ok_or_else(|| {
                    Error::Config(format!(
                        "datasource '{datasource_name}' needs a sql template for adapter '{}'",
                        adapter.name
                    ))
                })?;
                Arc::new(SqlRetriever::open(
                    &adapter.name,
                    datasource_name,
                    path,
                    template,
                    adapter.config.clone(),
                )?)
            }
            ("sql", DatasourceConfig::Postgres { .. } | DatasourceConfig::Mysql { .. }) => {
                return Err(Error::Config(format!(
                    "adapter '{}': datasource kind '{}' is declared but not compiled into \
                     this build; use sqlite or a vector datasource",
                    adapter.name,
                    datasource.kind_name()
                )));
            }
            ("vector" | "qdrant", DatasourceConfig::Qdrant { url, collection, api_key }) => {
                let index = QdrantIndex::connect(
                    &adapter.name,
                    datasource_name,
                    url,
                    collection,
                    api_key.as_deref(),
                )?;
                Arc::new(VectorRetriever::new(
                    &adapter.name,
                    resolve_embedder(adapter, settings, embedder)?,
                    Arc::new(index),
                    adapter.config.clone(),
                ))
            }
            ("vector" | "chroma", DatasourceConfig::Chroma { url, collection }) => {
                let index = ChromaIndex::connect(&adapter.name, datasource_name, url, collection)?;
                Arc::new(VectorRetriever::new(
                    &adapter.name,
                    resolve_embedder(adapter, settings, embedder)?,
                    Arc::new(index),
                    adapter.config.clone(),
                ))
            }
            ("vector" | "qdrant", DatasourceConfig::Elasticsearch { .. }) => {
                return Err(Error::Config(format!(
                    "adapter '{}': datasource kind '{}' is declared but not compiled into \
                     this build",
                    adapter.name,
                    datasource.kind_name()
                )));
            }
            ("file", DatasourceConfig::File { path }) => Arc::new(
                open_file_retriever(
                    &adapter.name,
                    path,
                    resolve_embedder(adapter, settings, embedder)?,
                    adapter.config.clone(),
                )
                .await?,
            ),
            (implementation, datasource) => {
                return Err(Error::Config(format!(
                    "adapter '{}': implementation '{implementation}' does not support \
                     datasource kind '{}'",
                    adapter.name,
                    datasource.kind_name()
                )));
            }
        };
        Ok(retriever)
    }

    /// Retriever bound to an adapter name. `Ok(None)` for passthrough
    /// adapters; unknown names are configuration errors.
    pub fn get(&self, adapter_name: &str) -> Result<Option<Arc<dyn Retriever>>> {
        if let Some(retriever) = self.retrievers.get(adapter_name) {
            return Ok(Some(Arc::clone(retriever)));
        }
        if self.passthrough.iter().any(|name| name == adapter_name) {
            return Ok(None);
        }
        Err(Error::Config(format!("adapter '{adapter_name}' is not registered")))
    }

    /// Whether the adapter name exists at all (retriever or passthrough).
    pub fn contains(&self, adapter_name: &str) -> bool {
        self.retrievers.contains_key(adapter_name)
            || self.passthrough.iter().any(|name| name == adapter_name)
    }

    /// Probe every retriever, for readiness and the status surface.
    pub async fn health(&self) -> HashMap<String, HealthStatus> {
        let mut statuses = HashMap::new();
        for (name, retriever) in &self.retrievers {
            statuses.insert(name.clone(), retriever.health_check().await);
        }
        statuses
    }

    pub fn adapter_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .retrievers
            .keys()
            .cloned()
            .chain(self.passthrough.iter().cloned())
            .collect();
        names.sort();
        names
    }
}

fn resolve_embedder(
    adapter: &AdapterConfig,
    settings: &Settings,
    default_embedder: Arc<dyn Embedder>,
) -> Result<Arc<dyn Embedder>> {
    match &adapter.config.embedding_provider {
        None => Ok(default_embedder),
        Some(provider) => {
            // Per-adapter override: rebuild with the named provider
            let config = EmbeddingConfig {
                provider: match provider.as_str() {
                    "hash" => orbit_config::EmbeddingProvider::Hash,
                    "ollama" => orbit_config::EmbeddingProvider::Ollama,
                    other => {
                        return Err(Error::Config(format!(
                            "adapter '{}': unknown embedding provider '{other}'",
                            adapter.name
                        )))
                    }
                },
                ..settings.embeddings.clone()
            };
            Ok(build_embedder(&config).map_err(|e| Error::Config(e.to_string()))?.into())
        }
    }
}

/// Convenience for tests and seed tooling: a QA template over a
/// `qa(question, answer, content)` table.
pub fn default_qa_template() -> SqlTemplate {
    SqlTemplate {
        query: "SELECT question, answer, content FROM qa \
                WHERE question LIKE '%' || {query} || '%' LIMIT {top_k}"
            .into(),
        params: Vec::new(),
        answer_column: Some("answer".into()),
        question_column: Some("question".into()),
        content_column: "content".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_config::{AdapterFamily, AdapterTuning};

    fn settings_with(adapter: AdapterConfig, datasources: Vec<(&str, DatasourceConfig)>) -> Settings {
        let mut settings = Settings::default();
        settings.adapters.push(adapter);
        for (name, ds) in datasources {
            settings.datasources.insert(name.into(), ds);
        }
        settings
    }

    fn sql_adapter(name: &str, datasource: &str) -> AdapterConfig {
        AdapterConfig {
            name: name.into(),
            kind: AdapterKind::Retriever,
            datasource: Some(datasource.into()),
            adapter_family: AdapterFamily::Qa,
            implementation_ref: "sql".into(),
            provider: None,
            config: AdapterTuning::default(),
            collection: None,
        }
    }

    #[tokio::test]
    async fn test_registry_builds_sql_adapter() {
        let settings = settings_with(
            sql_adapter("qa-sql", "kb"),
            vec![(
                "kb",
                DatasourceConfig::Sqlite {
                    path: ":memory:".into(),
                    sql: Some(default_qa_template()),
                },
            )],
        );

        let registry = RetrieverRegistry::build(&settings).await.unwrap();
        assert!(registry.contains("qa-sql"));
        assert!(registry.get("qa-sql").unwrap().is_some());
        assert_eq!(registry.adapter_names(), vec!["qa-sql"]);
    }

    #[tokio::test]
    async fn test_unknown_adapter_is_config_error() {
        let registry = RetrieverRegistry::build(&Settings::default()).await.unwrap();
        assert!(matches!(registry.get("missing"), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_passthrough_has_no_retriever() {
        let mut settings = Settings::default();
        settings.adapters.push(AdapterConfig {
            name: "chat-only".into(),
            kind: AdapterKind::Passthrough,
            datasource: None,
            adapter_family: AdapterFamily::Generic,
            implementation_ref: "passthrough".into(),
                provider: None,
            config: AdapterTuning::default(),
            collection: None,
        });

        let registry = RetrieverRegistry::build(&settings).await.unwrap();
        assert!(registry.contains("chat-only"));
        assert!(registry.get("chat-only").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sql_template_required() {
        let settings = settings_with(
            sql_adapter("qa-sql", "kb"),
            vec![("kb", DatasourceConfig::Sqlite { path: ":memory:".into(), sql: None })],
        );
        assert!(RetrieverRegistry::build(&settings).await.is_err());
    }

    #[tokio::test]
    async fn test_mismatched_implementation_rejected() {
        let mut adapter = sql_adapter("qa-sql", "kb");
        adapter.implementation_ref = "vector".into();
        let settings = settings_with(
            adapter,
            vec![("kb", DatasourceConfig::Sqlite { path: ":memory:".into(), sql: None })],
        );
        assert!(RetrieverRegistry::build(&settings).await.is_err());
    }
}
