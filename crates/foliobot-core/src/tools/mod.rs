//! Tool system: in-band call parser, executor, and tool schemas.
//!
//! The assistant exposes two side-effecting actions (calendar lookup
//! and meeting booking). The realtime backend requests them through
//! native function calls; the local engine has no structured tool
//! support, so [`parser`] bridges the gap with a `<tool>` marker
//! protocol embedded in generated text. Both paths converge on
//! [`executor::ToolExecutor`], the single point where side effects
//! happen.

pub mod executor;
pub mod parser;
pub mod schema;

use serde_json::{Map, Value};

/// A tool call extracted from model output.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedToolCall {
    /// Tool name (`check_availability`, `book_meeting`).
    pub action: String,
    /// Remaining JSON fields as arguments.
    pub args: Map<String, Value>,
}

impl ParsedToolCall {
    /// Arguments serialized back to a JSON string for the executor.
    pub fn arguments_json(&self) -> String {
        serde_json::to_string(&self.args).unwrap_or_else(|_| "{}".into())
    }
}
