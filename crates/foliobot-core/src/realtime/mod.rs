//! Persistent duplex session to the cloud realtime API.
//!
//! The session manager owns the WebSocket exclusively; no other
//! component sends on it directly. Connecting never sees the
//! long-lived API key — an ephemeral credential is minted by the
//! trusted gateway endpoint first.

pub mod events;
pub mod session;

pub use session::{RealtimeSession, SessionStatus, SessionUpdate};

use serde::Serialize;
use serde_json::Value;

use crate::prompt::{self, PageContext};
use crate::tools::schema;

/// Interaction mode. Voice changes the session modalities and enables
/// the microphone path; it does not change which tools are attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Text,
    Voice,
}

/// The `session.update` payload. Recomputed and re-sent on every
/// context change, never cached across changes.
#[derive(Debug, Clone, Serialize)]
pub struct SessionConfig {
    pub instructions: String,
    pub tools: Vec<Value>,
    pub modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_format: Option<String>,
}

/// Derive the session configuration from the mode and page context.
pub fn build_session_config(
    mode: Mode,
    context: Option<&PageContext>,
    voice: &str,
) -> SessionConfig {
    let (modalities, voice, audio_format) = match mode {
        Mode::Text => (vec!["text".to_string()], None, None),
        Mode::Voice => (
            vec!["text".to_string(), "audio".to_string()],
            Some(voice.to_string()),
            Some("pcm16".to_string()),
        ),
    };

    SessionConfig {
        instructions: prompt::build_instructions(context),
        tools: schema::realtime_tools(),
        modalities,
        voice,
        output_audio_format: audio_format,
    }
}
