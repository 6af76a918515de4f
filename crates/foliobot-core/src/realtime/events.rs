//! Wire events for the realtime duplex protocol.
//!
//! Client messages are built as JSON values; server messages are
//! parsed leniently — unknown event types are ignored rather than
//! failing the read loop, since the provider adds event types over
//! time.

use serde_json::{json, Value};

use super::SessionConfig;

// ── Client → server ─────────────────────────────────────────────────

pub fn session_update(config: &SessionConfig) -> Value {
    json!({
        "type": "session.update",
        "session": config,
    })
}

pub fn user_text_item(text: &str) -> Value {
    json!({
        "type": "conversation.item.create",
        "item": {
            "type": "message",
            "role": "user",
            "content": [{ "type": "input_text", "text": text }],
        },
    })
}

pub fn function_call_output(call_id: &str, output: &str) -> Value {
    json!({
        "type": "conversation.item.create",
        "item": {
            "type": "function_call_output",
            "call_id": call_id,
            "output": output,
        },
    })
}

pub fn response_create() -> Value {
    json!({ "type": "response.create" })
}

pub fn input_audio_append(base64_pcm: &str) -> Value {
    json!({
        "type": "input_audio_buffer.append",
        "audio": base64_pcm,
    })
}

// ── Server → client ─────────────────────────────────────────────────

/// The subset of server events the session manager acts on.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// A new response began; its id tags every following delta.
    ResponseCreated { response_id: String },
    /// Incremental assistant text.
    TextDelta { response_id: String, delta: String },
    /// Incremental function-call argument fragment.
    FunctionCallArgumentsDelta { item_id: String, delta: String },
    /// Terminal notice for an output item. Only a `function_call`
    /// item carries a name and correlation id.
    OutputItemDone {
        item_id: String,
        call_id: Option<String>,
        name: Option<String>,
        arguments: Option<String>,
    },
    /// The response finished; the session returns to idle.
    ResponseDone,
    Error { message: String },
    /// Anything we don't handle.
    Ignored,
}

impl ServerEvent {
    /// Parse a raw text frame. Never fails: unparseable frames and
    /// unknown types come back as [`ServerEvent::Ignored`].
    pub fn parse(raw: &str) -> Self {
        let Ok(value) = serde_json::from_str::<Value>(raw) else {
            return ServerEvent::Ignored;
        };

        let event_type = value.get("type").and_then(|t| t.as_str()).unwrap_or("");

        match event_type {
            "response.created" => {
                let response_id = value
                    .pointer("/response/id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                ServerEvent::ResponseCreated { response_id }
            }
            "response.text.delta" | "response.output_text.delta" => {
                let response_id = value
                    .get("response_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let delta = value
                    .get("delta")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                ServerEvent::TextDelta { response_id, delta }
            }
            "response.function_call_arguments.delta" => {
                let item_id = value
                    .get("item_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let delta = value
                    .get("delta")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                ServerEvent::FunctionCallArgumentsDelta { item_id, delta }
            }
            "response.output_item.done" => {
                let item = value.get("item").cloned().unwrap_or(Value::Null);
                let is_function_call =
                    item.get("type").and_then(|t| t.as_str()) == Some("function_call");
                ServerEvent::OutputItemDone {
                    item_id: item
                        .get("id")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    call_id: item
                        .get("call_id")
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                    name: is_function_call
                        .then(|| item.get("name").and_then(|v| v.as_str()))
                        .flatten()
                        .map(str::to_string),
                    arguments: item
                        .get("arguments")
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                }
            }
            "response.done" => ServerEvent::ResponseDone,
            "error" => {
                let message = value
                    .pointer("/error/message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown realtime error")
                    .to_string();
                ServerEvent::Error { message }
            }
            _ => ServerEvent::Ignored,
        }
    }
}
