//! Inference gateway server
//!
//! HTTP/SSE front door over the chat pipeline: ingress auth, the
//! streaming chat surfaces (/chat, /v1/chat/completions, /mcp), the
//! admin plane, health and readiness, and the session janitor.
//! Failures surface through `orbit_core::Error`; pre-stream errors map
//! to HTTP statuses via `Error::status_code`, everything later is an
//! in-stream `error` event.

pub mod state;
pub mod http;
pub mod auth;
pub mod admin;
pub mod openai;
pub mod mcp;
pub mod rate_limit;
pub mod admin_sessions;
pub mod metrics;
pub mod janitor;

pub use http::create_router;
pub use state::AppState;
pub use rate_limit::RateLimiter;
pub use metrics::init_metrics;
