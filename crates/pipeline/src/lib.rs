//! Chat pipeline for the inference gateway
//!
//! The staged, streaming request path from wire ingress to wire
//! egress: auth, session assignment, input moderation, retrieval,
//! prompt assembly, backend streaming, output moderation, and history
//! persistence. Every collaborator comes in by injection; the pipeline
//! holds no module-level state.

pub mod prompt;
pub mod pipeline;

pub use prompt::{PromptBuilder, format_context};
pub use pipeline::{ChatPipeline, ChatRequest, ChatStream};
