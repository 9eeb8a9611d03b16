//! OpenAI-compatible backend client
//!
//! Speaks `/v1/chat/completions` with SSE streaming. Covers OpenAI
//! itself plus compatible engines (vLLM, llama.cpp server, Groq,
//! DeepSeek, Mistral); only base_url, api_key, and model differ.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use orbit_config::ProviderConfig;
use orbit_core::{
    ChatMessage, Error, FinishReason, GenerationParams, InferenceClient, Result, StreamChunk,
    TokenStream,
};

use crate::{status_error, transport_error};

/// Client for an OpenAI-compatible chat completions endpoint.
pub struct OpenAiCompatClient {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    num_ctx: usize,
    target: String,
}

impl OpenAiCompatClient {
    pub fn new(name: &str, config: &ProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            num_ctx: config.num_ctx,
            target: format!("inference:{name}"),
        })
    }

    fn request_builder(&self, body: &ChatRequest) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(format!("{}/v1/chat/completions", self.endpoint))
            .json(body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }

    fn build_request(&self, messages: &[ChatMessage], params: &GenerationParams, stream: bool) -> ChatRequest {
        let model = if params.model.is_empty() { self.model.clone() } else { params.model.clone() };
        ChatRequest {
            model,
            messages: messages
                .iter()
                .map(|m| WireMessage { role: m.role.to_string(), content: m.content.clone() })
                .collect(),
            stream,
            temperature: params.temperature,
            top_p: params.top_p,
            max_tokens: params.max_tokens,
            stop: params.stop_tokens.clone(),
        }
    }
}

#[async_trait]
impl InferenceClient for OpenAiCompatClient {
    async fn stream(&self, messages: &[ChatMessage], params: &GenerationParams) -> Result<TokenStream> {
        let request = self.build_request(messages, params, true);
        let target = self.target.clone();

        let response = self
            .request_builder(&request)
            .send()
            .await
            .map_err(|e| transport_error(&target, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(&target, status.as_u16(), body));
        }

        let mut bytes = response.bytes_stream();
        let stream = async_stream::try_stream! {
            let mut buf = String::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(|e| transport_error(&target, e))?;
                buf.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = buf.find('\n') {
                    let line: String = buf.drain(..=pos).collect();
                    let line = line.trim();
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data == "[DONE]" {
                        yield StreamChunk::final_chunk(FinishReason::Stop);
                        return;
                    }
                    if let Ok(parsed) = serde_json::from_str::<StreamResponse>(data) {
                        if let Some(choice) = parsed.choices.first() {
                            if let Some(content) = &choice.delta.content {
                                if !content.is_empty() {
                                    yield StreamChunk::text(content.clone());
                                }
                            }
                            if let Some(reason) = &choice.finish_reason {
                                let finish = match reason.as_str() {
                                    "length" => FinishReason::Length,
                                    "content_filter" => FinishReason::ContentFilter,
                                    _ => FinishReason::Stop,
                                };
                                yield StreamChunk::final_chunk(finish);
                                return;
                            }
                        }
                    }
                }
            }
            yield StreamChunk::final_chunk(FinishReason::Stop);
        };
        Ok(Box::pin(stream))
    }

    async fn complete(&self, messages: &[ChatMessage], params: &GenerationParams) -> Result<String> {
        let request = self.build_request(messages, params, false);

        let response = self
            .request_builder(&request)
            .send()
            .await
            .map_err(|e| transport_error(&self.target, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(&self.target, status.as_u16(), body));
        }

        let parsed: CompletionResponse =
            response.json().await.map_err(|e| Error::UpstreamTransient {
                target: self.target.clone(),
                message: format!("invalid response: {e}"),
            })?;
        Ok(parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default())
    }

    async fn verify_connection(&self) -> bool {
        let mut builder = self.client.get(format!("{}/v1/models", self.endpoint));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    fn provider_name(&self) -> &str {
        &self.target
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn context_size(&self) -> usize {
        self.num_ctx
    }
}

// OpenAI wire types
#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: WireMessage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_delta_parsing() {
        let data = r#"{"choices":[{"delta":{"content":"Hel"},"finish_reason":null}]}"#;
        let parsed: StreamResponse = serde_json::from_str(data).unwrap();
        assert_eq!(parsed.choices[0].delta.content.as_deref(), Some("Hel"));

        let last = r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#;
        let parsed: StreamResponse = serde_json::from_str(last).unwrap();
        assert_eq!(parsed.choices[0].finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_request_model_fallback() {
        let client = OpenAiCompatClient::new(
            "openai",
            &ProviderConfig {
                model: "gpt-4o-mini".into(),
                ..Default::default()
            },
        )
        .unwrap();

        let request = client.build_request(&[], &GenerationParams::default(), true);
        assert_eq!(request.model, "gpt-4o-mini");
    }
}
