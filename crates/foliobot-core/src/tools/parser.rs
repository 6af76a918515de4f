//! In-band tool marker parser.
//!
//! Scans free-form generated text for `<tool>{...}</tool>` blocks.
//! Runs on every streamed token against the whole accumulated buffer,
//! so every function here must be idempotent on already-processed
//! regions and must never touch a trailing unterminated block.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::warn;

use super::ParsedToolCall;

static TOOL_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<tool>(.*?)</tool>").expect("tool block regex"));

static TOOL_RESULT_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<tool_result>(.*?)</tool_result>").expect("tool result regex")
});

/// Extract every complete tool call from the text.
///
/// A block whose JSON is malformed, is not an object, or lacks a string
/// `action` field is skipped with a log line — the rest of the text is
/// still parsed. Truncated blocks are never parsed.
pub fn extract_calls(text: &str) -> Vec<ParsedToolCall> {
    let mut calls = Vec::new();

    for caps in TOOL_BLOCK.captures_iter(text) {
        let json_content = caps[1].trim();

        let parsed: Value = match serde_json::from_str(json_content) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, content = json_content, "Skipping malformed tool JSON");
                continue;
            }
        };

        let Value::Object(mut fields) = parsed else {
            warn!(content = json_content, "Tool block is not a JSON object, skipping");
            continue;
        };

        let Some(Value::String(action)) = fields.remove("action") else {
            warn!(content = json_content, "Tool block missing action field, skipping");
            continue;
        };

        calls.push(ParsedToolCall {
            action,
            args: fields,
        });
    }

    calls
}

/// Remove every complete tool block for display.
///
/// A trailing unterminated block is left as-is; callers combine this
/// with [`has_incomplete_block`] to keep it off the screen until the
/// closing marker (or the end of the stream) arrives.
pub fn strip_blocks(text: &str) -> String {
    TOOL_BLOCK.replace_all(text, "").into_owned()
}

/// True iff an opened block has not been closed yet.
pub fn has_incomplete_block(text: &str) -> bool {
    text.matches("<tool>").count() > text.matches("</tool>").count()
}

/// Trim a trailing fragment that could still grow into a `<tool>`
/// open marker. Streamed tokens can split the marker anywhere, so the
/// fragment stays off the screen until it resolves one way or the
/// other.
pub fn trim_partial_marker(text: &str) -> &str {
    const OPEN: &str = "<tool>";
    for len in (1..OPEN.len()).rev() {
        if text.ends_with(&OPEN[..len]) {
            return &text[..text.len() - len];
        }
    }
    text
}

/// Wrap an executed tool's result for re-injection into the model's
/// accumulating text on the local-engine path. The wrapper keeps the
/// result visible to the model but strippable for display.
pub fn wrap_result(result: &Value) -> String {
    format!("<tool_result>{result}</tool_result>")
}

/// What the user should see: complete tool blocks, injected tool
/// results, and any trailing unterminated block all removed.
pub fn display_text(text: &str) -> String {
    let without_blocks = strip_blocks(text);
    let stripped = TOOL_RESULT_BLOCK.replace_all(&without_blocks, "");
    if has_incomplete_block(&stripped) {
        if let Some(pos) = stripped.rfind("<tool>") {
            return stripped[..pos].to_string();
        }
    }
    stripped.into_owned()
}
