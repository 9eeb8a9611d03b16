//! Configuration management for the inference gateway
//!
//! Supports loading configuration from:
//! - YAML/TOML files
//! - Environment variables (ORBIT__ prefix)
//! - A whitelisted set of bare secret variables

pub mod settings;
pub mod adapter;

pub use settings::{
    Settings, ServerConfig, RateLimitConfig, SessionConfig, PersistenceConfig,
    PersistenceBackend, ModerationConfig, ModeratorConfig, ModeratorKind,
    FaultToleranceConfig, InferenceConfig, ProviderConfig, ProviderKind,
    EmbeddingConfig, EmbeddingProvider, TimeoutConfig, load_settings, validate,
};
pub use adapter::{
    AdapterConfig, AdapterKind, AdapterFamily, AdapterTuning, ConfidenceMapping,
    DatasourceConfig, SqlTemplate, SqlParamDecl, SqlParamType,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Environment error: {0}")]
    Environment(String),
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}

impl From<ConfigError> for orbit_core::Error {
    fn from(err: ConfigError) -> Self {
        orbit_core::Error::Config(err.to_string())
    }
}
