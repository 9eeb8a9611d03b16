//! Inference client factory
//!
//! One streaming client per configured provider, selected by a closed
//! set of protocol kinds. Clients are built once at startup and shared.

use std::collections::HashMap;
use std::sync::Arc;

use orbit_config::{InferenceConfig, ProviderKind};
use orbit_core::{Error, GenerationParams, InferenceClient, Result};

use crate::{AnthropicClient, OllamaClient, OpenAiCompatClient};

/// Builds and holds all configured inference clients.
pub struct ClientFactory {
    clients: HashMap<String, Arc<dyn InferenceClient>>,
    default_provider: String,
}

impl ClientFactory {
    pub fn build(config: &InferenceConfig) -> Result<Self> {
        let mut clients: HashMap<String, Arc<dyn InferenceClient>> = HashMap::new();

        for (name, provider) in &config.providers {
            let client: Arc<dyn InferenceClient> = match provider.kind {
                ProviderKind::Ollama => Arc::new(OllamaClient::new(name, provider)?),
                ProviderKind::Openai => Arc::new(OpenAiCompatClient::new(name, provider)?),
                ProviderKind::Anthropic => Arc::new(AnthropicClient::new(name, provider)?),
            };
            tracing::info!(provider = %name, model = %client.model_name(), "inference client ready");
            clients.insert(name.clone(), client);
        }

        if !clients.contains_key(&config.default_provider) {
            return Err(Error::Config(format!(
                "default inference provider '{}' is not configured",
                config.default_provider
            )));
        }

        Ok(Self { clients, default_provider: config.default_provider.clone() })
    }

    /// Assemble a factory from pre-built clients. Used by tests and by
    /// embedders of the pipeline that bring their own backends.
    pub fn from_clients(
        clients: HashMap<String, Arc<dyn InferenceClient>>,
        default_provider: impl Into<String>,
    ) -> Result<Self> {
        let default_provider = default_provider.into();
        if !clients.contains_key(&default_provider) {
            return Err(Error::Config(format!(
                "default inference provider '{default_provider}' is not configured"
            )));
        }
        Ok(Self { clients, default_provider })
    }

    /// Client for a named provider.
    pub fn get(&self, name: &str) -> Result<Arc<dyn InferenceClient>> {
        self.clients
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Config(format!("unknown inference provider '{name}'")))
    }

    pub fn default_client(&self) -> Arc<dyn InferenceClient> {
        // Presence is checked in build()
        self.clients[&self.default_provider].clone()
    }

    pub fn default_provider(&self) -> &str {
        &self.default_provider
    }

    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clients.keys().cloned().collect();
        names.sort();
        names
    }

    /// Generation defaults from config, for requests that do not
    /// override them.
    pub fn default_params(config: &InferenceConfig) -> GenerationParams {
        GenerationParams {
            model: String::new(),
            temperature: Some(config.temperature),
            top_p: Some(config.top_p),
            max_tokens: Some(config.max_tokens),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_config::ProviderConfig;

    #[test]
    fn test_build_default_config() {
        let factory = ClientFactory::build(&InferenceConfig::default()).unwrap();
        assert_eq!(factory.default_provider(), "ollama");
        assert!(factory.get("ollama").is_ok());
        assert!(factory.get("missing").is_err());
    }

    #[test]
    fn test_unknown_default_rejected() {
        let config = InferenceConfig {
            default_provider: "nope".into(),
            ..Default::default()
        };
        assert!(ClientFactory::build(&config).is_err());
    }

    #[test]
    fn test_multiple_providers() {
        let mut config = InferenceConfig::default();
        config.providers.insert(
            "vllm".into(),
            ProviderConfig {
                kind: ProviderKind::Openai,
                base_url: "http://localhost:8000".into(),
                model: "mistral-7b".into(),
                ..Default::default()
            },
        );

        let factory = ClientFactory::build(&config).unwrap();
        assert_eq!(factory.provider_names(), vec!["ollama", "vllm"]);
        assert_eq!(factory.get("vllm").unwrap().model_name(), "mistral-7b");
    }

    #[test]
    fn test_default_params_from_config() {
        let params = ClientFactory::default_params(&InferenceConfig::default());
        assert_eq!(params.temperature, Some(0.7));
        assert_eq!(params.max_tokens, Some(1024));
    }
}
