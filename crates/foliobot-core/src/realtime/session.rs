//! Realtime session manager.
//!
//! Owns the duplex WebSocket for its whole lifetime. Event handling is
//! split in two: [`EventRouter`] is a pure state machine from server
//! events to actions, and the connection task applies those actions
//! (emitting updates, executing tools, sending the continuation).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::{SinkExt, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::connect_async;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::events::{self, ServerEvent};
use super::{build_session_config, Mode};
use crate::config::RealtimeConfig;
use crate::prompt::PageContext;
use crate::tools::executor::ToolExecutor;

/// Connection lifecycle. `Error` is reachable from any state on
/// transport failure; recovery is a manual reconnect, never automatic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connecting,
    Idle,
    Listening,
    Speaking,
    Closed,
    Error,
}

/// Updates pushed to the session's consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    Status(SessionStatus),
    Delta(String),
    Completed(String),
    Error(String),
}

/// A function call being accumulated from streamed argument
/// fragments. At most one is outstanding per active generation.
#[derive(Debug, Clone, Default)]
pub struct PendingToolCall {
    pub item_id: String,
    pub arguments: String,
}

/// What the connection task should do in response to a server event.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Action {
    EmitDelta(String),
    ExecuteTool {
        call_id: String,
        name: String,
        arguments: String,
    },
    Completed(String),
    Fail(String),
}

/// Pure event-to-action state machine. Tracks the current response id
/// so stale deltas after a reconnect are dropped, and guarantees a
/// tool call is executed at most once.
#[derive(Default)]
pub(crate) struct EventRouter {
    current_response_id: Option<String>,
    transcript: String,
    pending: Option<PendingToolCall>,
}

impl EventRouter {
    pub(crate) fn route(&mut self, event: ServerEvent) -> Vec<Action> {
        match event {
            ServerEvent::ResponseCreated { response_id } => {
                self.current_response_id = Some(response_id);
                self.transcript.clear();
                Vec::new()
            }
            ServerEvent::TextDelta { response_id, delta } => {
                if self.current_response_id.as_deref() != Some(response_id.as_str()) {
                    debug!(response_id, "Dropping delta for untracked response");
                    return Vec::new();
                }
                self.transcript.push_str(&delta);
                vec![Action::EmitDelta(delta)]
            }
            ServerEvent::FunctionCallArgumentsDelta { item_id, delta } => {
                match &mut self.pending {
                    Some(pending) if pending.item_id == item_id => {
                        pending.arguments.push_str(&delta);
                    }
                    Some(stale) => {
                        warn!(
                            stale = %stale.item_id,
                            new = %item_id,
                            "New tool call started while one was pending, dropping the stale one"
                        );
                        self.pending = Some(PendingToolCall {
                            item_id,
                            arguments: delta,
                        });
                    }
                    None => {
                        self.pending = Some(PendingToolCall {
                            item_id,
                            arguments: delta,
                        });
                    }
                }
                Vec::new()
            }
            ServerEvent::OutputItemDone {
                item_id,
                call_id,
                name,
                arguments,
            } => {
                let Some(name) = name else {
                    // Not a function call; nothing to execute.
                    return Vec::new();
                };

                let accumulated = match self.pending.take() {
                    Some(pending) if pending.item_id == item_id => pending.arguments,
                    other => {
                        self.pending = other;
                        String::new()
                    }
                };

                let Some(call_id) = call_id else {
                    // No correlation id means the result could not be
                    // attributed. Drop the call, never guess.
                    warn!(item_id, tool = %name, "Function call finished without a call id, dropping");
                    return Vec::new();
                };

                let arguments = arguments.filter(|a| !a.is_empty()).unwrap_or(accumulated);
                vec![Action::ExecuteTool {
                    call_id,
                    name,
                    arguments,
                }]
            }
            ServerEvent::ResponseDone => {
                self.current_response_id = None;
                vec![Action::Completed(std::mem::take(&mut self.transcript))]
            }
            ServerEvent::Error { message } => vec![Action::Fail(message)],
            ServerEvent::Ignored => Vec::new(),
        }
    }
}

#[derive(Deserialize)]
struct MintedCredential {
    client_secret: ClientSecret,
}

#[derive(Deserialize)]
struct ClientSecret {
    value: String,
}

/// Handle to an open realtime session.
pub struct RealtimeSession {
    outbound: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
    status: Arc<Mutex<SessionStatus>>,
    listening: Arc<AtomicBool>,
    voice: String,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl RealtimeSession {
    /// Mint an ephemeral credential, open the duplex channel, and push
    /// the initial session configuration.
    ///
    /// The long-lived API key stays behind the minting endpoint; this
    /// component only ever sees the short-lived secret.
    pub async fn connect(
        config: &RealtimeConfig,
        http: &Client,
        mode: Mode,
        context: Option<&PageContext>,
        executor: Arc<ToolExecutor>,
        updates: mpsc::UnboundedSender<SessionUpdate>,
    ) -> Result<Self> {
        let status = Arc::new(Mutex::new(SessionStatus::Connecting));
        let _ = updates.send(SessionUpdate::Status(SessionStatus::Connecting));

        let minted: MintedCredential = http
            .post(&config.session_endpoint)
            .send()
            .await
            .context("credential minting request failed")?
            .error_for_status()
            .context("credential minting endpoint rejected the request")?
            .json()
            .await
            .context("credential minting response was not valid JSON")?;

        let url = format!("{}?model={}", config.base_url, config.model);
        let mut request = url
            .into_client_request()
            .context("invalid realtime endpoint URL")?;
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {}", minted.client_secret.value)
                .parse()
                .context("ephemeral credential is not a valid header value")?,
        );
        request
            .headers_mut()
            .insert("OpenAI-Beta", "realtime=v1".parse().expect("static header"));

        let (ws, _) = connect_async(request)
            .await
            .context("realtime WebSocket connect failed")?;
        info!(model = %config.model, "Realtime session connected");

        let (mut sink, mut stream) = ws.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let cancel = CancellationToken::new();
        let listening = Arc::new(AtomicBool::new(false));

        let writer_cancel = cancel.clone();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => {
                        let _ = sink.send(Message::Close(None)).await;
                        return;
                    }
                    msg = outbound_rx.recv() => {
                        let Some(msg) = msg else { return };
                        if let Err(e) = sink.send(msg).await {
                            error!(error = %e, "Realtime send failed");
                            return;
                        }
                    }
                }
            }
        });

        let reader_cancel = cancel.clone();
        let reader_status = Arc::clone(&status);
        let reader_outbound = outbound.clone();
        let reader_updates = updates.clone();
        let reader = tokio::spawn(async move {
            let mut router = EventRouter::default();
            loop {
                let frame = tokio::select! {
                    _ = reader_cancel.cancelled() => return,
                    frame = stream.next() => frame,
                };

                let event = match frame {
                    Some(Ok(Message::Text(text))) => ServerEvent::parse(text.as_str()),
                    Some(Ok(Message::Close(_))) | None => {
                        set_status(&reader_status, &reader_updates, SessionStatus::Closed);
                        return;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        error!(error = %e, "Realtime transport error");
                        set_status(&reader_status, &reader_updates, SessionStatus::Error);
                        let _ = reader_updates.send(SessionUpdate::Error(e.to_string()));
                        return;
                    }
                };

                for action in router.route(event) {
                    match action {
                        Action::EmitDelta(delta) => {
                            set_status(&reader_status, &reader_updates, SessionStatus::Speaking);
                            let _ = reader_updates.send(SessionUpdate::Delta(delta));
                        }
                        Action::ExecuteTool {
                            call_id,
                            name,
                            arguments,
                        } => {
                            info!(tool = %name, call_id, "Executing realtime tool call");
                            let result = executor.execute(&name, &arguments).await;
                            let output = result.to_string();
                            // The protocol requires an explicit
                            // continuation after a tool result.
                            let _ = reader_outbound
                                .send(json_message(events::function_call_output(&call_id, &output)));
                            let _ = reader_outbound.send(json_message(events::response_create()));
                        }
                        Action::Completed(text) => {
                            set_status(&reader_status, &reader_updates, SessionStatus::Idle);
                            let _ = reader_updates.send(SessionUpdate::Completed(text));
                        }
                        Action::Fail(message) => {
                            error!(message, "Realtime server reported an error");
                            set_status(&reader_status, &reader_updates, SessionStatus::Error);
                            let _ = reader_updates.send(SessionUpdate::Error(message));
                        }
                    }
                }
            }
        });

        let session = Self {
            outbound,
            cancel,
            status,
            listening,
            voice: config.voice.clone(),
            reader,
            writer,
        };

        session.send(events::session_update(&build_session_config(
            mode,
            context,
            &session.voice,
        )))?;
        set_status(&session.status, &updates, SessionStatus::Idle);

        Ok(session)
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.lock().expect("status lock")
    }

    /// Handle with no live socket, for driving the consumer side from
    /// tests. Sends land in `outbound` and nothing is ever received.
    #[cfg(test)]
    pub(crate) fn detached(outbound: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            outbound,
            cancel: CancellationToken::new(),
            status: Arc::new(Mutex::new(SessionStatus::Idle)),
            listening: Arc::new(AtomicBool::new(false)),
            voice: "alloy".into(),
            reader: tokio::spawn(async {}),
            writer: tokio::spawn(async {}),
        }
    }

    /// Send a user turn and request a response.
    pub fn send_text(&self, text: &str) -> Result<()> {
        self.send(events::user_text_item(text))?;
        self.send(events::response_create())
    }

    /// Re-derive and push the session configuration after a mode or
    /// page-context change.
    pub fn update_context(&self, mode: Mode, context: Option<&PageContext>) -> Result<()> {
        self.send(events::session_update(&build_session_config(
            mode, context, &self.voice,
        )))
    }

    /// Toggle the microphone. The outbound audio path is muted by
    /// default; turning listening off also requests a response for
    /// whatever was captured.
    pub fn set_listening(&self, listening: bool) -> Result<()> {
        self.listening.store(listening, Ordering::SeqCst);
        let mut status = self.status.lock().expect("status lock");
        if listening {
            *status = SessionStatus::Listening;
            Ok(())
        } else {
            *status = SessionStatus::Idle;
            drop(status);
            self.send(events::response_create())
        }
    }

    /// Forward captured PCM audio. Dropped silently while muted.
    pub fn send_audio_chunk(&self, pcm: &[u8]) -> Result<()> {
        if !self.listening.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.send(events::input_audio_append(&BASE64.encode(pcm)))
    }

    /// Full teardown: stop both connection tasks, close the socket,
    /// and remute the microphone path.
    pub async fn close(self) {
        self.listening.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        let _ = self.writer.await;
        let _ = self.reader.await;
        *self.status.lock().expect("status lock") = SessionStatus::Closed;
        info!("Realtime session closed");
    }

    fn send(&self, payload: Value) -> Result<()> {
        self.outbound
            .send(json_message(payload))
            .map_err(|_| anyhow::anyhow!("realtime session is closed"))
    }
}

fn json_message(payload: Value) -> Message {
    Message::Text(payload.to_string().into())
}

fn set_status(
    status: &Arc<Mutex<SessionStatus>>,
    updates: &mpsc::UnboundedSender<SessionUpdate>,
    next: SessionStatus,
) {
    let mut current = status.lock().expect("status lock");
    if *current != next {
        *current = next;
        let _ = updates.send(SessionUpdate::Status(next));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(response_id: &str, text: &str) -> ServerEvent {
        ServerEvent::TextDelta {
            response_id: response_id.into(),
            delta: text.into(),
        }
    }

    #[test]
    fn test_deltas_for_untracked_response_ignored() {
        let mut router = EventRouter::default();
        router.route(ServerEvent::ResponseCreated {
            response_id: "r1".into(),
        });

        assert_eq!(
            router.route(delta("r1", "Hello")),
            vec![Action::EmitDelta("Hello".into())]
        );
        // Stale id after a reconnect: dropped, not appended.
        assert!(router.route(delta("r2", "ghost")).is_empty());

        let done = router.route(ServerEvent::ResponseDone);
        assert_eq!(done, vec![Action::Completed("Hello".into())]);
    }

    #[test]
    fn test_tool_arguments_accumulate_until_done() {
        let mut router = EventRouter::default();
        for fragment in [r#"{"date":"#, r#""2025-01-15","#, r#""timezone":"UTC"}"#] {
            let actions = router.route(ServerEvent::FunctionCallArgumentsDelta {
                item_id: "item_1".into(),
                delta: fragment.into(),
            });
            // Accumulation alone never triggers execution.
            assert!(actions.is_empty());
        }

        let actions = router.route(ServerEvent::OutputItemDone {
            item_id: "item_1".into(),
            call_id: Some("call_7".into()),
            name: Some("check_availability".into()),
            arguments: None,
        });
        assert_eq!(
            actions,
            vec![Action::ExecuteTool {
                call_id: "call_7".into(),
                name: "check_availability".into(),
                arguments: r#"{"date":"2025-01-15","timezone":"UTC"}"#.into(),
            }]
        );
    }

    #[test]
    fn test_done_arguments_take_precedence_over_buffer() {
        let mut router = EventRouter::default();
        router.route(ServerEvent::FunctionCallArgumentsDelta {
            item_id: "item_1".into(),
            delta: "{\"partial\"".into(),
        });
        let actions = router.route(ServerEvent::OutputItemDone {
            item_id: "item_1".into(),
            call_id: Some("call_1".into()),
            name: Some("book_meeting".into()),
            arguments: Some("{\"complete\":true}".into()),
        });
        assert_eq!(
            actions,
            vec![Action::ExecuteTool {
                call_id: "call_1".into(),
                name: "book_meeting".into(),
                arguments: "{\"complete\":true}".into(),
            }]
        );
    }

    #[test]
    fn test_missing_call_id_drops_the_call() {
        let mut router = EventRouter::default();
        router.route(ServerEvent::FunctionCallArgumentsDelta {
            item_id: "item_1".into(),
            delta: "{}".into(),
        });
        let actions = router.route(ServerEvent::OutputItemDone {
            item_id: "item_1".into(),
            call_id: None,
            name: Some("book_meeting".into()),
            arguments: None,
        });
        assert!(actions.is_empty());
    }

    #[test]
    fn test_message_item_done_is_not_a_tool_call() {
        let mut router = EventRouter::default();
        let actions = router.route(ServerEvent::OutputItemDone {
            item_id: "item_2".into(),
            call_id: None,
            name: None,
            arguments: None,
        });
        assert!(actions.is_empty());
    }

    #[test]
    fn test_new_response_resets_transcript() {
        let mut router = EventRouter::default();
        router.route(ServerEvent::ResponseCreated {
            response_id: "r1".into(),
        });
        router.route(delta("r1", "first"));
        router.route(ServerEvent::ResponseDone);

        router.route(ServerEvent::ResponseCreated {
            response_id: "r2".into(),
        });
        router.route(delta("r2", "second"));
        let done = router.route(ServerEvent::ResponseDone);
        assert_eq!(done, vec![Action::Completed("second".into())]);
    }
}
