//! Google Gemini generateContent provider adapter.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::Provider;

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const DEFAULT_MODEL: &str = "gemini-1.5-flash";

pub struct GeminiProvider {
    client: Client,
    api_key: String,
    model: String,
}

impl GeminiProvider {
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
struct GenerateRequest<'a> {
    contents: [Content<'a>; 1],
}

#[derive(Serialize)]
struct Content<'a> {
    parts: [Part<'a>; 1],
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct GenerateResponse {
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Deserialize)]
struct CandidateContent {
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
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
impl Provider for GeminiProvider {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let url = format!(
            "{}/{}:generateContent?key={}",
            API_BASE, self.model, self.api_key
        );

        let request_body = GenerateRequest {
            contents: [Content {
                parts: [Part { text: prompt }],
            }],
        };

        debug!(model = %self.model, "Sending Gemini generateContent request");

        let response = self
            .client
            .post(&url)
            .json(&request_body)
            .send()
            .await
            .context("Gemini request failed")?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("Failed to read Gemini response body")?;

        if !status.is_success() {
            let err_msg = serde_json::from_str::<ErrorBody>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            anyhow::bail!("Gemini API error ({}): {}", status, err_msg);
        }

        let parsed: GenerateResponse =
            serde_json::from_str(&body).context("Failed to parse Gemini response")?;

        let text = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
            .unwrap_or_default();

        Ok(text)
    }

    fn name(&self) -> &str {
        "gemini"
    }
}
