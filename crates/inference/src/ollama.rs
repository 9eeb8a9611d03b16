//! Ollama backend client

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

/// Client for a local Ollama engine.
pub struct OllamaClient {
    client: Client,
    endpoint: String,
    model: String,
    num_ctx: usize,
    target: String,
}

impl OllamaClient {
    pub fn new(name: &str, config: &ProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            num_ctx: config.num_ctx,
            target: format!("inference:{name}"),
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api{}", self.endpoint, path)
    }

    fn build_request(&self, messages: &[ChatMessage], params: &GenerationParams, stream: bool) -> ChatRequest {
        let model = if params.model.is_empty() { self.model.clone() } else { params.model.clone() };
        ChatRequest {
            model,
            messages: messages.iter().map(WireMessage::from).collect(),
            stream,
            options: Options {
                temperature: params.temperature,
                top_p: params.top_p,
                top_k: params.top_k,
                num_predict: params.max_tokens.map(|t| t as i32),
                repeat_penalty: params.repeat_penalty,
                stop: params.stop_tokens.clone(),
                num_ctx: params.num_ctx,
            },
        }
    }
}

#[async_trait]
impl InferenceClient for OllamaClient {
    async fn stream(&self, messages: &[ChatMessage], params: &GenerationParams) -> Result<TokenStream> {
        let request = self.build_request(messages, params, true);
        let target = self.target.clone();

        let response = self
            .client
            .post(self.api_url("/chat"))
            .json(&request)
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
            // NDJSON: one JSON object per line, possibly split across
            // network chunks.
            let mut buf = String::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(|e| transport_error(&target, e))?;
                buf.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = buf.find('\n') {
                    let line: String = buf.drain(..=pos).collect();
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let parsed: StreamLine = serde_json::from_str(line).map_err(|e| {
                        Error::UpstreamTransient {
                            target: target.clone(),
                            message: format!("malformed stream line: {e}"),
                        }
                    })?;
                    if !parsed.message.content.is_empty() {
                        yield StreamChunk::text(parsed.message.content);
                    }
                    if parsed.done {
                        yield StreamChunk::final_chunk(FinishReason::Stop);
                        return;
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
            .client
            .post(self.api_url("/chat"))
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error(&self.target, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(&self.target, status.as_u16(), body));
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| Error::UpstreamTransient {
            target: self.target.clone(),
            message: format!("invalid response: {e}"),
        })?;
        Ok(parsed.message.content)
    }

    async fn verify_connection(&self) -> bool {
        self.client
            .get(format!("{}/api/tags", self.endpoint))
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

// Ollama wire types
#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
    options: Options,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    content: String,
}

impl From<&ChatMessage> for WireMessage {
    fn from(msg: &ChatMessage) -> Self {
        Self { role: msg.role.to_string(), content: msg.content.clone() }
    }
}

#[derive(Debug, Serialize)]
struct Options {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    repeat_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_ctx: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: WireMessage,
}

#[derive(Debug, Deserialize)]
struct StreamLine {
    message: WireMessage,
    #[serde(default)]
    done: bool,
}
