//! Model runtime abstraction and the Ollama implementation.
//!
//! The engine manager never talks HTTP directly; everything goes
//! through [`ModelRuntime`] so tests can script the model's output.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

/// One turn in the chat transcript sent to the model.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// Download progress for a model pull.
#[derive(Debug, Clone)]
pub struct PullProgress {
    pub status: String,
    pub completed: u64,
    pub total: u64,
}

/// Backend that can download, load, and stream from one model at a
/// time.
#[async_trait]
pub trait ModelRuntime: Send + Sync {
    /// Whether the runtime is up and answering at all.
    async fn is_reachable(&self) -> bool;

    /// Download the model, reporting progress as it goes. A no-op if
    /// the model is already present locally.
    async fn pull_model(
        &self,
        model_id: &str,
        progress: &mut (dyn FnMut(PullProgress) + Send),
    ) -> Result<()>;

    /// Load the model into memory so the first real turn is fast.
    async fn warm_up(&self, model_id: &str) -> Result<()>;

    /// Stream a chat completion token-by-token.
    async fn chat_stream(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
    ) -> Result<BoxStream<'static, Result<String>>>;

    /// Evict the model from memory.
    async fn unload(&self, model_id: &str) -> Result<()>;
}

/// Ollama daemon runtime over its native HTTP API.
pub struct OllamaRuntime {
    client: Client,
    base_url: String,
}

impl OllamaRuntime {
    pub fn new(base_url: &str, client: Client) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

/// Split a byte stream into trimmed non-empty NDJSON lines.
fn ndjson_lines(response: reqwest::Response) -> BoxStream<'static, Result<String>> {
    let mut buf = String::new();
    let lines = response
        .bytes_stream()
        .map(move |chunk| -> Result<Vec<String>> {
            let chunk = chunk.context("reading response stream")?;
            buf.push_str(&String::from_utf8_lossy(&chunk));
            let mut lines = Vec::new();
            while let Some(pos) = buf.find('\n') {
                let line: String = buf.drain(..=pos).collect();
                let line = line.trim();
                if !line.is_empty() {
                    lines.push(line.to_string());
                }
            }
            Ok(lines)
        })
        .flat_map(|result| match result {
            Ok(lines) => stream::iter(lines.into_iter().map(Ok).collect::<Vec<_>>()),
            Err(e) => stream::iter(vec![Err(e)]),
        });
    Box::pin(lines)
}

#[async_trait]
impl ModelRuntime for OllamaRuntime {
    async fn is_reachable(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn pull_model(
        &self,
        model_id: &str,
        progress: &mut (dyn FnMut(PullProgress) + Send),
    ) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/api/pull", self.base_url))
            .json(&json!({ "name": model_id, "stream": true }))
            .send()
            .await
            .context("model pull request failed")?
            .error_for_status()
            .context("model pull rejected")?;

        let mut lines = ndjson_lines(response);
        while let Some(line) = lines.next().await {
            let line = line?;
            let value: Value =
                serde_json::from_str(&line).context("malformed pull progress line")?;
            if let Some(error) = value.get("error").and_then(|e| e.as_str()) {
                return Err(anyhow!("model pull failed: {error}"));
            }
            progress(PullProgress {
                status: value
                    .get("status")
                    .and_then(|s| s.as_str())
                    .unwrap_or_default()
                    .to_string(),
                completed: value.get("completed").and_then(|v| v.as_u64()).unwrap_or(0),
                total: value.get("total").and_then(|v| v.as_u64()).unwrap_or(0),
            });
        }
        Ok(())
    }

    async fn warm_up(&self, model_id: &str) -> Result<()> {
        debug!(model = model_id, "Warming up model");
        self.client
            .post(format!("{}/api/generate", self.base_url))
            .json(&json!({ "model": model_id, "prompt": "", "stream": false }))
            .send()
            .await
            .context("model warm-up request failed")?
            .error_for_status()
            .context("model warm-up rejected")?;
        Ok(())
    }

    async fn chat_stream(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
    ) -> Result<BoxStream<'static, Result<String>>> {
        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&json!({
                "model": model_id,
                "messages": messages,
                "stream": true,
            }))
            .send()
            .await
            .context("chat request failed")?
            .error_for_status()
            .context("chat request rejected")?;

        let deltas = ndjson_lines(response)
            .map(|line| -> Result<Option<String>> {
                let line = line?;
                let value: Value =
                    serde_json::from_str(&line).context("malformed chat stream line")?;
                if let Some(error) = value.get("error").and_then(|e| e.as_str()) {
                    return Err(anyhow!("generation failed: {error}"));
                }
                if value.get("done").and_then(|d| d.as_bool()).unwrap_or(false) {
                    return Ok(None);
                }
                Ok(value
                    .pointer("/message/content")
                    .and_then(|c| c.as_str())
                    .map(str::to_string))
            })
            .take_while(|item| futures::future::ready(!matches!(item, Ok(None))))
            .filter_map(|item| async move {
                match item {
                    Ok(Some(delta)) if !delta.is_empty() => Some(Ok(delta)),
                    Ok(_) => None,
                    Err(e) => Some(Err(e)),
                }
            });

        Ok(Box::pin(deltas))
    }

    async fn unload(&self, model_id: &str) -> Result<()> {
        debug!(model = model_id, "Unloading model");
        self.client
            .post(format!("{}/api/generate", self.base_url))
            .json(&json!({ "model": model_id, "keep_alive": 0 }))
            .send()
            .await
            .context("model unload request failed")?;
        Ok(())
    }
}
