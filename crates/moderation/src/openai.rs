//! OpenAI moderation API moderator

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use orbit_core::{Direction, Error, Moderator, Result, Verdict};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_MODEL: &str = "omni-moderation-latest";

/// Moderator backed by the OpenAI moderation endpoint.
pub struct OpenAiModerator {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiModerator {
    pub fn new(api_key: String, base_url: Option<String>, model: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        })
    }
}

#[async_trait]
impl Moderator for OpenAiModerator {
    async fn check(&self, text: &str, _direction: Direction) -> Result<Verdict> {
        let request = ModerationRequest { model: self.model.clone(), input: text.to_string() };

        let response = self
            .client
            .post(format!("{}/v1/moderations", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::UpstreamTransient {
                target: "moderation:openai".into(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("HTTP {status}: {body}");
            return Err(if status.is_server_error() || status.as_u16() == 429 {
                Error::UpstreamTransient { target: "moderation:openai".into(), message }
            } else {
                Error::UpstreamPermanent { target: "moderation:openai".into(), message }
            });
        }

        let parsed: ModerationResponse =
            response.json().await.map_err(|e| Error::UpstreamTransient {
                target: "moderation:openai".into(),
                message: format!("invalid response: {e}"),
            })?;

        let Some(result) = parsed.results.into_iter().next() else {
            return Ok(Verdict::safe(self.name()));
        };

        if result.flagged {
            let category = result
                .categories
                .iter()
                .filter(|(_, flagged)| **flagged)
                .map(|(name, _)| name.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            let top_score = result
                .category_scores
                .values()
                .fold(0.0f32, |acc, score| acc.max(*score));
            Ok(Verdict::blocked(self.name(), format!("flagged: {category}")).with_score(top_score))
        } else {
            Ok(Verdict::safe(self.name()))
        }
    }

    fn name(&self) -> &str {
        "openai-moderation"
    }
}

#[derive(Debug, Serialize)]
struct ModerationRequest {
    model: String,
    input: String,
}

#[derive(Debug, Deserialize)]
struct ModerationResponse {
    results: Vec<ModerationResult>,
}

#[derive(Debug, Deserialize)]
struct ModerationResult {
    flagged: bool,
    #[serde(default)]
    categories: std::collections::HashMap<String, bool>,
    #[serde(default)]
    category_scores: std::collections::HashMap<String, f32>,
}
