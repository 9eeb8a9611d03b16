//! Anthropic messages API client

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use orbit_config::ProviderConfig;
use orbit_core::{
    ChatMessage, Error, FinishReason, GenerationParams, InferenceClient, Result, Role,
    StreamChunk, TokenStream,
};

use crate::{status_error, transport_error};

const API_VERSION: &str = "2023-06-01";

/// Client for the Anthropic messages API.
pub struct AnthropicClient {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    num_ctx: usize,
    target: String,
}

impl AnthropicClient {
    pub fn new(name: &str, config: &ProviderConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| Error::Config(format!("provider '{name}' requires an api_key")))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            num_ctx: config.num_ctx,
            target: format!("inference:{name}"),
        })
    }

    /// The messages API takes the system prompt as a separate field.
    fn build_request(&self, messages: &[ChatMessage], params: &GenerationParams, stream: bool) -> MessagesRequest {
        let model = if params.model.is_empty() { self.model.clone() } else { params.model.clone() };

        let system = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.clone())
            .collect::<Vec<_>>()
            .join("\n\n");

        MessagesRequest {
            model,
            system: if system.is_empty() { None } else { Some(system) },
            messages: messages
                .iter()
                .filter(|m| m.role != Role::System)
                .map(|m| WireMessage { role: m.role.to_string(), content: m.content.clone() })
                .collect(),
            max_tokens: params.max_tokens.unwrap_or(1024),
            temperature: params.temperature,
            top_p: params.top_p,
            top_k: params.top_k,
            stop_sequences: params.stop_tokens.clone(),
            stream,
        }
    }

    fn post(&self, body: &MessagesRequest) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}/v1/messages", self.endpoint))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(body)
    }
}

#[async_trait]
impl InferenceClient for AnthropicClient {
    async fn stream(&self, messages: &[ChatMessage], params: &GenerationParams) -> Result<TokenStream> {
        let request = self.build_request(messages, params, true);
        let target = self.target.clone();

        let response = self.post(&request).send().await.map_err(|e| transport_error(&target, e))?;

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
                    let Ok(event) = serde_json::from_str::<StreamEvent>(data.trim()) else {
                        continue;
                    };
                    match event {
                        StreamEvent::ContentBlockDelta { delta } => {
                            if let Some(text) = delta.text {
                                if !text.is_empty() {
                                    yield StreamChunk::text(text);
                                }
                            }
                        }
                        StreamEvent::MessageDelta { delta } => {
                            if delta.stop_reason.as_deref() == Some("max_tokens") {
                                yield StreamChunk::final_chunk(FinishReason::Length);
                                return;
                            }
                        }
                        StreamEvent::MessageStop => {
                            yield StreamChunk::final_chunk(FinishReason::Stop);
                            return;
                        }
                        StreamEvent::Error { error } => {
                            Err(Error::UpstreamTransient {
                                target: target.clone(),
                                message: error.message,
                            })?;
                        }
                        StreamEvent::Other => {}
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
            .post(&request)
            .send()
            .await
            .map_err(|e| transport_error(&self.target, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(&self.target, status.as_u16(), body));
        }

        let parsed: MessagesResponse =
            response.json().await.map_err(|e| Error::UpstreamTransient {
                target: self.target.clone(),
                message: format!("invalid response: {e}"),
            })?;
        Ok(parsed
            .content
            .into_iter()
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join(""))
    }

    async fn verify_connection(&self) -> bool {
        // No cheap unauthenticated probe; a minimal request settles it.
        let request = MessagesRequest {
            model: self.model.clone(),
            system: None,
            messages: vec![WireMessage { role: "user".into(), content: "ping".into() }],
            max_tokens: 1,
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: None,
            stream: false,
        };
        self.post(&request)
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

// Anthropic wire types
#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    ContentBlockDelta { delta: TextDelta },
    MessageDelta { delta: StopDelta },
    MessageStop,
    Error { error: ApiError },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct TextDelta {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StopDelta {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> AnthropicClient {
        AnthropicClient::new(
            "anthropic",
            &ProviderConfig {
                api_key: Some("test-key".into()),
                base_url: "https://api.anthropic.com".into(),
                model: "claude-3-5-haiku-latest".into(),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_missing_api_key_rejected() {
        let result = AnthropicClient::new("anthropic", &ProviderConfig::default());
        assert!(result.is_err());
    }

    #[test]
    fn test_system_prompt_extracted() {
        let client = client();
        let request = client.build_request(
            &[
                ChatMessage::system("Be terse."),
                ChatMessage::user("hi"),
                ChatMessage::assistant("hello"),
            ],
            &GenerationParams::default(),
            true,
        );
        assert_eq!(request.system.as_deref(), Some("Be terse."));
        assert_eq!(request.messages.len(), 2);
        assert!(request.messages.iter().all(|m| m.role != "system"));
    }

    #[test]
    fn test_stream_event_parsing() {
        let delta =
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#;
        let event: StreamEvent = serde_json::from_str(delta).unwrap();
        assert!(matches!(event, StreamEvent::ContentBlockDelta { .. }));

        let stop = r#"{"type":"message_stop"}"#;
        let event: StreamEvent = serde_json::from_str(stop).unwrap();
        assert!(matches!(event, StreamEvent::MessageStop));

        let ping = r#"{"type":"ping"}"#;
        let event: StreamEvent = serde_json::from_str(ping).unwrap();
        assert!(matches!(event, StreamEvent::Other));
    }
}
