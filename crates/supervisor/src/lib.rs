//! Fault tolerance for outbound calls
//!
//! Per-target circuit breakers, exponential-backoff retry with jitter,
//! and the health snapshots behind `/admin/system-status`.

pub mod breaker;
pub mod retry;
pub mod supervisor;

pub use breaker::{CircuitBreaker, CircuitSnapshot, CircuitState, Admission};
pub use retry::RetryPolicy;
pub use supervisor::Supervisor;

/// Build the breaker key for a retriever target.
pub fn retriever_target(name: &str) -> String {
    format!("retriever:{name}")
}

/// Build the breaker key for an inference target.
pub fn inference_target(name: &str) -> String {
    format!("inference:{name}")
}
