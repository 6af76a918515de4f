//! Trust-boundary HTTP gateway.
//!
//! Two endpoints back the browser-facing surfaces: `POST /session`
//! mints a short-lived realtime credential (the long-lived API key
//! never leaves this process), and `POST /tools/execute` runs a tool
//! on behalf of a client that cannot hold scheduling credentials.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    routing::post,
    Json, Router,
};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::{GatewayConfig, RealtimeConfig};
use crate::tools::executor::ToolExecutor;

const SESSIONS_URL: &str = "https://api.openai.com/v1/realtime/sessions";

pub struct GatewayState {
    pub executor: Arc<ToolExecutor>,
    pub http: Client,
    pub gateway: GatewayConfig,
    pub realtime: RealtimeConfig,
}

#[derive(Debug, Deserialize)]
struct ExecuteRequest {
    #[serde(default)]
    id: Option<String>,
    name: Option<String>,
    #[serde(default)]
    arguments: Option<Value>,
}

fn error_body(error: &str, message: impl Into<String>) -> Json<Value> {
    Json(json!({ "error": error, "message": message.into() }))
}

/// Mint a short-lived realtime credential for a browser client.
async fn mint_session(State(state): State<Arc<GatewayState>>) -> (StatusCode, Json<Value>) {
    if state.gateway.realtime_api_key.is_empty() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_body("NOT_CONFIGURED", "No realtime API key is configured"),
        );
    }

    let response = state
        .http
        .post(SESSIONS_URL)
        .bearer_auth(&state.gateway.realtime_api_key)
        .json(&json!({
            "model": state.realtime.model,
            "voice": state.realtime.voice,
        }))
        .send()
        .await;

    let response = match response {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "Session minting request failed");
            return (
                StatusCode::BAD_GATEWAY,
                error_body("UPSTREAM_UNREACHABLE", e.to_string()),
            );
        }
    };

    let status = response.status();
    let body: Value = match response.json().await {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "Session minting response was not JSON");
            return (
                StatusCode::BAD_GATEWAY,
                error_body("UPSTREAM_ERROR", e.to_string()),
            );
        }
    };

    if !status.is_success() {
        error!(status = %status, "Session minting rejected upstream");
        return (
            StatusCode::BAD_GATEWAY,
            error_body("UPSTREAM_ERROR", format!("upstream returned {status}")),
        );
    }

    info!("Minted ephemeral realtime credential");
    (StatusCode::OK, Json(body))
}

/// Execute a tool for a client across the trust boundary.
async fn execute_tool(
    State(state): State<Arc<GatewayState>>,
    Json(request): Json<ExecuteRequest>,
) -> (StatusCode, Json<Value>) {
    let Some(name) = request.name.filter(|n| !n.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            error_body("MISSING_NAME", "Request body must include a tool name"),
        );
    };

    // Arguments may arrive as a JSON object or a pre-encoded string.
    let arguments = match request.arguments {
        None => "{}".to_string(),
        Some(Value::String(s)) => s,
        Some(other) => other.to_string(),
    };

    info!(tool = %name, id = ?request.id, "Gateway tool execution");
    let result = state.executor.execute(&name, &arguments).await;

    match result.get("error").and_then(|e| e.as_str()) {
        Some("UNKNOWN_TOOL") | Some("INVALID_TOOL_ARGUMENTS") => {
            (StatusCode::BAD_REQUEST, Json(result))
        }
        _ => (
            StatusCode::OK,
            Json(json!({ "success": true, "result": result })),
        ),
    }
}

pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/session", post(mint_session))
        .route("/tools/execute", post(execute_tool))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn serve(state: Arc<GatewayState>) -> Result<()> {
    let addr = format!("{}:{}", state.gateway.host, state.gateway.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind gateway on {addr}"))?;
    info!(addr = %addr, "Gateway listening");
    axum::serve(listener, router(state))
        .await
        .context("gateway server error")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::Scheduler;
    use crate::tools::executor::tests::CountingScheduler;

    fn test_state() -> (Arc<GatewayState>, Arc<CountingScheduler>) {
        let scheduler = Arc::new(CountingScheduler::default());
        let executor = Arc::new(ToolExecutor::new(
            Arc::clone(&scheduler) as Arc<dyn Scheduler>
        ));
        let state = Arc::new(GatewayState {
            executor,
            http: Client::new(),
            gateway: GatewayConfig::default(),
            realtime: RealtimeConfig::default(),
        });
        (state, scheduler)
    }

    #[tokio::test]
    async fn test_execute_requires_a_name() {
        let (state, _) = test_state();
        let (status, Json(body)) = execute_tool(
            State(state),
            Json(ExecuteRequest {
                id: None,
                name: None,
                arguments: None,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "MISSING_NAME");
    }

    #[tokio::test]
    async fn test_execute_unknown_tool_is_bad_request() {
        let (state, _) = test_state();
        let (status, Json(body)) = execute_tool(
            State(state),
            Json(ExecuteRequest {
                id: Some("1".into()),
                name: Some("launch_rocket".into()),
                arguments: None,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "UNKNOWN_TOOL");
    }

    #[tokio::test]
    async fn test_execute_accepts_object_and_string_arguments() {
        let (state, scheduler) = test_state();

        let (status, Json(body)) = execute_tool(
            State(Arc::clone(&state)),
            Json(ExecuteRequest {
                id: None,
                name: Some("check_availability".into()),
                arguments: Some(json!({"date": "2025-01-15", "timezone": "UTC"})),
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["result"]["date"], "2025-01-15");

        let (status, _) = execute_tool(
            State(state),
            Json(ExecuteRequest {
                id: None,
                name: Some("check_availability".into()),
                arguments: Some(Value::String(
                    r#"{"date":"2025-01-16","timezone":"UTC"}"#.into(),
                )),
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            scheduler
                .slots_calls
                .load(std::sync::atomic::Ordering::SeqCst),
            2
        );
    }

    #[tokio::test]
    async fn test_mint_without_key_is_an_error_object() {
        let (state, _) = test_state();
        let (status, Json(body)) = mint_session(State(state)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "NOT_CONFIGURED");
        assert!(body["message"].is_string());
    }
}
