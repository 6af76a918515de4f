//! OpenAI chat-completions provider adapter.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::Provider;

const API_URL: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    model: String,
}

impl OpenAiProvider {
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
struct CompletionRequest<'a> {
    model: &'a str,
    messages: [RequestMessage<'a>; 1],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct RequestMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageResponse,
}

#[derive(Deserialize)]
struct MessageResponse {
    content: Option<String>,
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
impl Provider for OpenAiProvider {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let request_body = CompletionRequest {
            model: &self.model,
            messages: [RequestMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens: 1000,
            temperature: 0.7,
        };

        debug!(model = %self.model, "Sending OpenAI completion request");

        let response = self
            .client
            .post(API_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request_body)
            .send()
            .await
            .context("OpenAI request failed")?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("Failed to read OpenAI response body")?;

        if !status.is_success() {
            let err_msg = serde_json::from_str::<ErrorBody>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            anyhow::bail!("OpenAI API error ({}): {}", status, err_msg);
        }

        let completion: CompletionResponse =
            serde_json::from_str(&body).context("Failed to parse OpenAI response")?;

        let choice = completion
            .choices
            .into_iter()
            .next()
            .context("OpenAI returned no choices")?;

        Ok(choice.message.content.unwrap_or_default())
    }

    fn name(&self) -> &str {
        "openai"
    }
}
