//! Inference clients
//!
//! Streaming clients for local and remote model backends behind the
//! `InferenceClient` trait:
//! - Ollama (local engine)
//! - OpenAI-compatible HTTP (OpenAI, vLLM, llama.cpp server, Groq,
//!   DeepSeek, Mistral)
//! - Anthropic messages API

pub mod ollama;
pub mod openai;
pub mod anthropic;
pub mod factory;

pub use ollama::OllamaClient;
pub use openai::OpenAiCompatClient;
pub use anthropic::AnthropicClient;
pub use factory::ClientFactory;

use orbit_core::Error;

/// Map a reqwest failure into the gateway taxonomy. Connection and
/// timeout failures are transient; anything else on the transport
/// level is treated the same way.
pub(crate) fn transport_error(target: &str, err: reqwest::Error) -> Error {
    Error::UpstreamTransient { target: target.to_string(), message: err.to_string() }
}

/// Map an HTTP status from a backend: 5xx and 429 are transient,
/// other 4xx are permanent.
pub(crate) fn status_error(target: &str, status: u16, body: String) -> Error {
    let message = format!("HTTP {status}: {body}");
    if status >= 500 || status == 429 {
        Error::UpstreamTransient { target: target.to_string(), message }
    } else {
        Error::UpstreamPermanent { target: target.to_string(), message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(status_error("inference:x", 503, String::new()).is_transient());
        assert!(status_error("inference:x", 429, String::new()).is_transient());
        assert!(!status_error("inference:x", 400, String::new()).is_transient());
        assert!(!status_error("inference:x", 401, String::new()).is_transient());
    }
}
