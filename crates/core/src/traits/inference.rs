//! Inference client capability set

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::pin::Pin;

use crate::chat::{ChatMessage, GenerationParams, StreamChunk};
use crate::error::Result;

/// A lazy, finite, non-restartable sequence of completion chunks.
///
/// Consumer-pull: the client only reads from the upstream provider when
/// the caller polls, so dropping the stream releases the connection and
/// stops the upstream generation within the provider's flush window.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// Unified streaming interface to one model backend.
///
/// Implementations:
/// - `OllamaClient` - local Ollama engine
/// - `OpenAiCompatClient` - OpenAI and compatible engines (vLLM,
///   llama.cpp server, Groq, DeepSeek, Mistral)
/// - `AnthropicClient` - Anthropic messages API
#[async_trait]
pub trait InferenceClient: Send + Sync + 'static {
    /// Establish a streaming completion. Errors returned here are
    /// connection/establishment failures and are retryable when
    /// transient; errors yielded by the stream itself are mid-flight
    /// and are not.
    ///
    /// Chunks are delivered in backend order; reordering is forbidden.
    async fn stream(&self, messages: &[ChatMessage], params: &GenerationParams)
        -> Result<TokenStream>;

    /// Full-text completion, built on `stream` unless the backend has a
    /// cheaper non-streaming path.
    async fn complete(&self, messages: &[ChatMessage], params: &GenerationParams) -> Result<String> {
        let mut params = params.clone();
        params.stream = true;

        let mut stream = self.stream(messages, &params).await?;
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            text.push_str(&chunk.delta);
            if chunk.is_final {
                break;
            }
        }
        Ok(text)
    }

    /// Cheap connectivity probe, used at startup and by readiness.
    async fn verify_connection(&self) -> bool;

    /// Provider name for logging and circuit-breaker keying.
    fn provider_name(&self) -> &str;

    /// Default model for this client.
    fn model_name(&self) -> &str;

    /// Context window size in tokens.
    fn context_size(&self) -> usize {
        4096
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::FinishReason;

    struct ScriptedClient;

    #[async_trait]
    impl InferenceClient for ScriptedClient {
        async fn stream(
            &self,
            _messages: &[ChatMessage],
            _params: &GenerationParams,
        ) -> Result<TokenStream> {
            Ok(Box::pin(futures::stream::iter(vec![
                Ok(StreamChunk::text("Hello ")),
                Ok(StreamChunk::text("world")),
                Ok(StreamChunk::final_chunk(FinishReason::Stop)),
            ])))
        }

        async fn verify_connection(&self) -> bool {
            true
        }

        fn provider_name(&self) -> &str {
            "scripted"
        }

        fn model_name(&self) -> &str {
            "scripted-model"
        }
    }

    #[tokio::test]
    async fn test_complete_drains_stream() {
        let client = ScriptedClient;
        let text = client
            .complete(&[ChatMessage::user("hi")], &GenerationParams::default())
            .await
            .unwrap();
        assert_eq!(text, "Hello world");
    }

    #[tokio::test]
    async fn test_defaults() {
        let client = ScriptedClient;
        assert!(client.verify_connection().await);
        assert_eq!(client.context_size(), 4096);
    }
}
