//! Anthropic messages-API provider adapter.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::Provider;

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MODEL: &str = "claude-3-5-haiku-20241022";

pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    model: String,
}

impl AnthropicProvider {
    pub fn new(api_key: &str, model: Option<&str>, client: Client) -> Self {
        Self {
            client,
            api_key: api_key.to_string(),
            model: model.unwrap_or(DEFAULT_MODEL).to_string(),
        }
    }
}

// ── API request/response types ──────────────────────────────────────

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: [RequestMessage<'a>; 1],
}

#[derive(Serialize)]
struct RequestMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

#[async_trait]
impl Provider for AnthropicProvider {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let request_body = MessagesRequest {
            model: &self.model,
            max_tokens: 1000,
            messages: [RequestMessage {
                role: "user",
                content: prompt,
            }],
        };

        debug!(model = %self.model, "Sending Anthropic messages request");

        let response = self
            .client
            .post(API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&request_body)
            .send()
            .await
            .context("Anthropic request failed")?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("Failed to read Anthropic response body")?;

        if !status.is_success() {
            let err_msg = serde_json::from_str::<ErrorBody>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            anyhow::bail!("Anthropic API error ({}): {}", status, err_msg);
        }

        let parsed: MessagesResponse =
            serde_json::from_str(&body).context("Failed to parse Anthropic response")?;

        let text = parsed
            .content
            .into_iter()
            .find(|block| block.block_type == "text")
            .map(|block| block.text)
            .unwrap_or_default();

        Ok(text)
    }

    fn name(&self) -> &str {
        "anthropic"
    }
}
