//! Core traits and types for the inference gateway
//!
//! This crate provides foundational types used across all other crates:
//! - The gateway error taxonomy
//! - Chat message and generation types
//! - Retrieved document types
//! - The streaming response envelope
//! - Persisted record shapes (keys, prompts, sessions)
//! - Trait seams for pluggable collaborators

pub mod error;
pub mod chat;
pub mod document;
pub mod event;
pub mod api_key;
pub mod prompt;
pub mod session;
pub mod traits;

pub use error::{AuthFailure, Error, Result};
pub use chat::{
    ChatMessage, Role, GenerationParams, StreamChunk, FinishReason, TokenUsage,
    estimate_tokens,
};
pub use document::{Document, DocumentMetadata};
pub use event::{ChatEvent, SourceEntry};
pub use api_key::{ApiKeyRecord, KeyBinding};
pub use prompt::SystemPrompt;
pub use session::{SessionInfo, StoredMessage, new_session_id};

pub use traits::{
    // Retrieval
    Retriever, RetrieveOptions, MetadataFilter, FilterOp, HealthStatus,
    // Inference
    InferenceClient, TokenStream,
    // Moderation
    Moderator, Direction, Verdict,
    // Stores
    HistoryStore, ApiKeyStore, PromptStore, UserStore,
};
pub use traits::keystore::UserRecord;
