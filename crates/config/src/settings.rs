//! Settings tree
//!
//! Layered resolution: built-in defaults, then the config file, then
//! environment overrides with the `ORBIT__` prefix (`__` separates
//! nesting, e.g. `ORBIT__SERVER__PORT=3001`). A whitelisted set of
//! bare environment variables overlays secrets last.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::adapter::{AdapterConfig, AdapterKind, DatasourceConfig};
use crate::ConfigError;

/// Root configuration tree
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub persistence: PersistenceConfig,

    #[serde(default)]
    pub moderation: ModerationConfig,

    #[serde(default)]
    pub fault_tolerance: FaultToleranceConfig,

    #[serde(default)]
    pub inference: InferenceConfig,

    #[serde(default)]
    pub embeddings: EmbeddingConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub adapters: Vec<AdapterConfig>,

    #[serde(default)]
    pub datasources: HashMap<String, DatasourceConfig>,

    /// Verify every provider and datasource at boot; exit 2 on failure.
    #[serde(default)]
    pub strict_startup: bool,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Require `X-API-Key` on the chat surface
    #[serde(default = "default_true")]
    pub require_api_key: bool,

    /// Bearer token protecting `/admin/*`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_token: Option<String>,

    #[serde(default = "default_true")]
    pub cors_enabled: bool,

    #[serde(default)]
    pub cors_origins: Vec<String>,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            require_api_key: true,
            admin_token: None,
            cors_enabled: true,
            cors_origins: Vec::new(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

/// Per-key token-bucket rate limit on chat ingress
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_rpm")]
    pub requests_per_minute: u32,

    #[serde(default = "default_burst")]
    pub burst: u32,
}

fn default_rpm() -> u32 {
    60
}
fn default_burst() -> u32 {
    10
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            requests_per_minute: default_rpm(),
            burst: default_burst(),
        }
    }
}

/// Session retention and history behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Prior messages loaded into the prompt
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Per-session retention cap; oldest non-system messages drop first
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,

    /// Idle seconds before the janitor prunes a session
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Janitor sweep interval
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Compact over-cap sessions once at boot instead of lazily
    #[serde(default)]
    pub compact_on_start: bool,
}

fn default_history_limit() -> usize {
    20
}
fn default_max_messages() -> usize {
    200
}
fn default_idle_timeout() -> u64 {
    3600
}
fn default_cleanup_interval() -> u64 {
    300
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            max_messages: default_max_messages(),
            idle_timeout_secs: default_idle_timeout(),
            cleanup_interval_secs: default_cleanup_interval(),
            compact_on_start: false,
        }
    }
}

/// Where admin metadata and history live
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_backend")]
    pub backend: PersistenceBackend,

    #[serde(default = "default_db_path")]
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceBackend {
    Sqlite,
    Memory,
}

fn default_backend() -> PersistenceBackend {
    PersistenceBackend::Sqlite
}
fn default_db_path() -> String {
    "orbit.db".to_string()
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self { backend: default_backend(), path: default_db_path() }
    }
}

/// Moderator chain configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Ordered list; the chain stops on the first unsafe verdict
    #[serde(default)]
    pub moderators: Vec<ModeratorConfig>,

    #[serde(default = "default_refusal")]
    pub refusal_message: String,

    /// Reserved. Only `false` is implemented: history stores the
    /// refusal text, never the raw blocked completion.
    #[serde(default)]
    pub store_raw_blocked_output: bool,
}

fn default_refusal() -> String {
    "I'm sorry, but I can't help with that request.".to_string()
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            moderators: vec![ModeratorConfig {
                kind: ModeratorKind::Rules,
                api_key: None,
                base_url: None,
                model: None,
            }],
            refusal_message: default_refusal(),
            store_raw_blocked_output: false,
        }
    }
}

/// One moderator in the chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeratorConfig {
    pub kind: ModeratorKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModeratorKind {
    /// Keyword + refusal-marker heuristics, no network
    Rules,
    /// OpenAI moderation endpoint
    Openai,
}

/// Circuit breaker and retry tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultToleranceConfig {
    /// Consecutive failures within the window that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Sliding window for the failure count
    #[serde(default = "default_window")]
    pub window_secs: u64,

    /// Open-state duration before a half-open probe is admitted
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_backoff")]
    pub base_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_window() -> u64 {
    60
}
fn default_cooldown() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_base_backoff() -> u64 {
    100
}
fn default_max_backoff() -> u64 {
    10_000
}

impl Default for FaultToleranceConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            window_secs: default_window(),
            cooldown_secs: default_cooldown(),
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

/// Inference providers and generation defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    #[serde(default = "default_provider")]
    pub default_provider: String,

    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    /// Tokens reserved for the completion when pruning prior messages
    #[serde(default = "default_reserved_output")]
    pub reserved_output_tokens: usize,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_top_p")]
    pub top_p: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_provider() -> String {
    "ollama".to_string()
}
fn default_reserved_output() -> usize {
    1024
}
fn default_temperature() -> f32 {
    0.7
}
fn default_top_p() -> f32 {
    0.9
}
fn default_max_tokens() -> u32 {
    1024
}

impl Default for InferenceConfig {
    fn default() -> Self {
        let mut providers = HashMap::new();
        providers.insert("ollama".to_string(), ProviderConfig::default());
        Self {
            default_provider: default_provider(),
            providers,
            reserved_output_tokens: default_reserved_output(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            max_tokens: default_max_tokens(),
        }
    }
}

/// One configured inference provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_kind")]
    pub kind: ProviderKind,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,

    /// Context window used for prompt pruning
    #[serde(default = "default_num_ctx")]
    pub num_ctx: usize,
}

/// Closed set of provider protocols. Remote OpenAI-compatible vendors
/// (vLLM, llama.cpp server, Groq, DeepSeek, Mistral) all speak
/// `openai`; only the base_url and api_key differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Ollama,
    Openai,
    Anthropic,
}

fn default_provider_kind() -> ProviderKind {
    ProviderKind::Ollama
}
fn default_base_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_model() -> String {
    "llama3.1:8b-instruct-q4_K_M".to_string()
}
fn default_provider_timeout() -> u64 {
    120
}
fn default_num_ctx() -> usize {
    8192
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: default_provider_kind(),
            base_url: default_base_url(),
            api_key: None,
            model: default_model(),
            timeout_secs: default_provider_timeout(),
            num_ctx: default_num_ctx(),
        }
    }
}

/// Embedding provider for vector retrieval
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: EmbeddingProvider,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_embedding_model")]
    pub model: String,

    #[serde(default = "default_dimension")]
    pub dimension: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// Deterministic feature-hash embedder, no network
    Hash,
    /// Ollama embeddings endpoint
    Ollama,
}

fn default_embedding_provider() -> EmbeddingProvider {
    EmbeddingProvider::Hash
}
fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}
fn default_dimension() -> usize {
    384
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            base_url: default_base_url(),
            model: default_embedding_model(),
            dimension: default_dimension(),
        }
    }
}

/// Per-stage soft timeouts and the end-to-end deadline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_moderation_ms")]
    pub moderation_ms: u64,

    #[serde(default = "default_retrieval_ms")]
    pub retrieval_ms: u64,

    #[serde(default = "default_first_token_ms")]
    pub inference_first_token_ms: u64,

    #[serde(default = "default_inference_total_ms")]
    pub inference_total_ms: u64,

    #[serde(default = "default_request_deadline_ms")]
    pub request_deadline_ms: u64,

    /// Grace period for releasing upstream calls after cancellation
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
}

fn default_moderation_ms() -> u64 {
    5_000
}
fn default_retrieval_ms() -> u64 {
    10_000
}
fn default_first_token_ms() -> u64 {
    15_000
}
fn default_inference_total_ms() -> u64 {
    120_000
}
fn default_request_deadline_ms() -> u64 {
    180_000
}
fn default_cancel_grace_ms() -> u64 {
    2_000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            moderation_ms: default_moderation_ms(),
            retrieval_ms: default_retrieval_ms(),
            inference_first_token_ms: default_first_token_ms(),
            inference_total_ms: default_inference_total_ms(),
            request_deadline_ms: default_request_deadline_ms(),
            cancel_grace_ms: default_cancel_grace_ms(),
        }
    }
}

/// Load settings from an optional file plus `ORBIT__` environment
/// overrides, then apply the secret whitelist and validate.
pub fn load_settings(path: Option<&Path>) -> Result<Settings, ConfigError> {
    let mut builder = config::Config::builder();

    if let Some(path) = path {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        builder = builder.add_source(config::File::from(path));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("ORBIT")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let mut settings: Settings = builder
        .build()?
        .try_deserialize()
        .map_err(|e| ConfigError::ParseError(e.to_string()))?;

    apply_secret_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

/// Whitelisted bare environment variables. Everything else is ignored.
fn apply_secret_overrides(settings: &mut Settings) {
    const PROVIDER_KEYS: &[(&str, &str)] = &[
        ("openai", "OPENAI_API_KEY"),
        ("anthropic", "ANTHROPIC_API_KEY"),
        ("mistral", "MISTRAL_API_KEY"),
        ("groq", "GROQ_API_KEY"),
        ("deepseek", "DEEPSEEK_API_KEY"),
        ("cohere", "COHERE_API_KEY"),
        ("gemini", "GEMINI_API_KEY"),
    ];

    for (provider, var) in PROVIDER_KEYS {
        if let (Some(cfg), Ok(value)) =
            (settings.inference.providers.get_mut(*provider), std::env::var(var))
        {
            if !value.is_empty() {
                cfg.api_key = Some(value);
            }
        }
    }

    if let Ok(value) = std::env::var("ORBIT_MODERATION_API_KEY") {
        for moderator in &mut settings.moderation.moderators {
            if moderator.kind == ModeratorKind::Openai && moderator.api_key.is_none() {
                moderator.api_key = Some(value.clone());
            }
        }
    }

    if let Ok(value) = std::env::var("QDRANT_API_KEY") {
        for ds in settings.datasources.values_mut() {
            if let DatasourceConfig::Qdrant { api_key, .. } = ds {
                if api_key.is_none() {
                    *api_key = Some(value.clone());
                }
            }
        }
    }
}

/// Cross-field validation. Failures here are exit-code-1 startup errors.
pub fn validate(settings: &Settings) -> Result<(), ConfigError> {
    let mut names = std::collections::HashSet::new();
    for adapter in &settings.adapters {
        adapter.validate()?;
        if !names.insert(adapter.name.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "adapters".into(),
                message: format!("duplicate adapter name '{}'", adapter.name),
            });
        }
        if let Some(ds) = &adapter.datasource {
            if adapter.kind == AdapterKind::Retriever && !settings.datasources.contains_key(ds) {
                return Err(ConfigError::InvalidValue {
                    field: format!("adapters.{}.datasource", adapter.name),
                    message: format!("unknown datasource '{ds}'"),
                });
            }
        }
    }

    if !settings
        .inference
        .providers
        .contains_key(&settings.inference.default_provider)
    {
        return Err(ConfigError::InvalidValue {
            field: "inference.default_provider".into(),
            message: format!(
                "provider '{}' is not configured",
                settings.inference.default_provider
            ),
        });
    }

    if settings.moderation.store_raw_blocked_output {
        return Err(ConfigError::InvalidValue {
            field: "moderation.store_raw_blocked_output".into(),
            message: "storing raw blocked output is not implemented; history \
                      always receives the refusal text"
                .into(),
        });
    }

    Ok(())
}
