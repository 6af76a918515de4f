//! Chat orchestrator: backend selection, history, and turn dispatch.
//!
//! Backend and mode are independent axes. Voice always rides the
//! realtime cloud path; leaving voice restores whatever text backend
//! was selected before. Mid-turn failures degrade to the failover
//! client rather than surfacing a raw error to the user.

pub mod commands;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::engine::runtime::ChatMessage;
use crate::engine::{GenerationEvent, HardwareCapabilities, LocalEngine};
use crate::prompt::{self, PageContext};
use crate::provider::FailoverClient;
use crate::realtime::{Mode, RealtimeSession, SessionStatus, SessionUpdate};
use crate::tools::executor::ToolExecutor;

pub use commands::Command;

/// Fixed sentinel shown when even the failover chain cannot produce
/// text. Users never see a raw error.
pub const CONNECTION_TROUBLE_MESSAGE: &str = "I'm having trouble connecting right now";

/// Which backend handles text turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Local,
    Cloud,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

/// One conversation turn. Owned exclusively by the orchestrator;
/// backends receive snapshots, never references.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// What a call to [`ChatOrchestrator::send`] produced.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// A side-channel command reply; not a model turn.
    Command(String),
    /// An assistant reply, already recorded in history.
    Reply(String),
}

pub struct ChatOrchestrator {
    failover: FailoverClient,
    engine: Arc<LocalEngine>,
    executor: Arc<ToolExecutor>,
    caps: HardwareCapabilities,
    config: Config,
    history: Vec<Message>,
    backend: Backend,
    text_backend: Backend,
    mode: Mode,
    page_context: Option<PageContext>,
    user_color: Option<String>,
    session: Option<(RealtimeSession, mpsc::UnboundedReceiver<SessionUpdate>)>,
    abort: CancellationToken,
}

impl ChatOrchestrator {
    pub fn new(
        failover: FailoverClient,
        engine: Arc<LocalEngine>,
        executor: Arc<ToolExecutor>,
        caps: HardwareCapabilities,
        config: Config,
    ) -> Self {
        Self {
            failover,
            engine,
            executor,
            caps,
            config,
            history: Vec::new(),
            backend: Backend::Cloud,
            text_backend: Backend::Cloud,
            mode: Mode::Text,
            page_context: None,
            user_color: None,
            session: None,
            abort: CancellationToken::new(),
        }
    }

    /// Pick and prepare the initial backend.
    ///
    /// Local inference is the default when the hardware probe allows
    /// it; a failed model load degrades to the cloud backend instead
    /// of failing the whole chat feature.
    pub async fn startup(&mut self) {
        if !self.caps.local_inference_supported {
            info!(reason = %self.caps.reason, "Local inference unavailable, using cloud backend");
            self.set_text_backend(Backend::Cloud);
            return;
        }

        match self.engine.initialize(None).await {
            Ok(()) => {
                info!(model = %self.caps.recommended_model_id, "Local backend ready");
                self.set_text_backend(Backend::Local);
            }
            Err(e) => {
                warn!(error = %e, "Local engine failed to initialize, falling back to cloud");
                self.set_text_backend(Backend::Cloud);
            }
        }
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn user_color(&self) -> Option<&str> {
        self.user_color.as_deref()
    }

    fn set_text_backend(&mut self, backend: Backend) {
        self.text_backend = backend;
        if self.mode == Mode::Text {
            self.backend = backend;
        }
    }

    /// Explicit user backend choice for text mode.
    pub async fn select_backend(&mut self, backend: Backend) -> anyhow::Result<()> {
        if backend == Backend::Local {
            if !self.caps.local_inference_supported {
                anyhow::bail!("local inference is not supported on this machine: {}", self.caps.reason);
            }
            self.engine.initialize(None).await?;
        }
        self.set_text_backend(backend);
        Ok(())
    }

    /// Switch interaction mode. Voice always uses the realtime cloud
    /// path; switching back restores the prior text backend.
    pub async fn set_mode(&mut self, mode: Mode) {
        if self.mode == mode {
            return;
        }
        self.mode = mode;
        match mode {
            Mode::Voice => {
                self.backend = Backend::Cloud;
            }
            Mode::Text => {
                self.drop_session().await;
                self.backend = self.text_backend;
            }
        }
    }

    /// Replace the page context and re-push the session configuration
    /// if a realtime session is open.
    pub fn set_page_context(&mut self, context: Option<PageContext>) {
        self.page_context = context;
        if let Some((session, _)) = &self.session {
            if let Err(e) = session.update_context(self.mode, self.page_context.as_ref()) {
                warn!(error = %e, "Failed to push session configuration");
            }
        }
    }

    /// Toggle the microphone in voice mode.
    pub async fn set_listening(&mut self, listening: bool) -> anyhow::Result<()> {
        self.ensure_session().await?;
        let (session, _) = self.session.as_ref().expect("session connected");
        session.set_listening(listening)
    }

    /// Cooperatively abort the in-flight local generation.
    pub fn abort_generation(&mut self) {
        self.abort.cancel();
        self.abort = CancellationToken::new();
    }

    /// Handle one line of user input.
    ///
    /// Side-channel commands short-circuit before any backend; all
    /// other input is dispatched to exactly one backend and recorded
    /// in history. `on_delta` observes streaming text as it arrives.
    pub async fn send(
        &mut self,
        input: &str,
        mut on_delta: impl FnMut(&str) + Send,
    ) -> anyhow::Result<TurnOutcome> {
        if let Some(command) = commands::parse(input) {
            return Ok(TurnOutcome::Command(self.run_command(command)));
        }

        let reply = match (self.mode, self.backend) {
            (Mode::Voice, _) => self.send_realtime(input, &mut on_delta).await?,
            (Mode::Text, Backend::Local) => self.send_local(input, &mut on_delta).await,
            (Mode::Text, Backend::Cloud) => self.send_cloud(input).await,
        };

        self.history.push(Message::new(Role::User, input));
        self.history.push(Message::new(Role::Assistant, reply.clone()));
        let window = self.config.assistant.history_window;
        if self.history.len() > window {
            self.history.drain(..self.history.len() - window);
        }

        Ok(TurnOutcome::Reply(reply))
    }

    fn run_command(&mut self, command: Command) -> String {
        match command {
            Command::Help => commands::HELP_TEXT.to_string(),
            Command::SetColor(color) if color.is_empty() => {
                "Usage: \\color <value> (a color name or hex value)".to_string()
            }
            Command::SetColor(color) => {
                let reply = format!("Your messages will now be shown in {color}.");
                self.user_color = Some(color);
                reply
            }
        }
    }

    async fn send_cloud(&self, input: &str) -> String {
        let history = self
            .history
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                };
                format!("{role}: {}", m.text)
            })
            .collect::<Vec<_>>()
            .join("\n");

        match self
            .failover
            .call(&prompt::build_ask_prompt(input, &history))
            .await
        {
            Ok(text) => text,
            Err(e) => {
                error!(error = %e, "Failover chain exhausted");
                CONNECTION_TROUBLE_MESSAGE.to_string()
            }
        }
    }

    async fn send_local(&mut self, input: &str, on_delta: &mut (impl FnMut(&str) + Send)) -> String {
        let history: Vec<ChatMessage> = self
            .history
            .iter()
            .map(|m| match m.role {
                Role::User => ChatMessage::user(m.text.clone()),
                Role::Assistant => ChatMessage::assistant(m.text.clone()),
            })
            .collect();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = Arc::clone(&self.engine);
        let abort = self.abort.clone();
        let context = self.page_context.clone();
        let input_owned = input.to_string();

        let send_fut = async move {
            engine
                .send_message(&input_owned, &history, context.as_ref(), abort, tx)
                .await
        };
        tokio::pin!(send_fut);

        let mut result = None;
        loop {
            tokio::select! {
                r = &mut send_fut, if result.is_none() => {
                    result = Some(r);
                }
                event = rx.recv() => match event {
                    Some(GenerationEvent::Delta(delta)) => on_delta(&delta),
                    Some(_) => {}
                    None => break,
                }
            }
        }

        match result.expect("generation future completed") {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Local generation failed, degrading to cloud for this turn");
                self.send_cloud(input).await
            }
        }
    }

    async fn ensure_session(&mut self) -> anyhow::Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let session = RealtimeSession::connect(
            &self.config.realtime,
            &reqwest::Client::new(),
            self.mode,
            self.page_context.as_ref(),
            Arc::clone(&self.executor),
            updates_tx,
        )
        .await?;
        self.session = Some((session, updates_rx));
        Ok(())
    }

    async fn drop_session(&mut self) {
        if let Some((session, _)) = self.session.take() {
            session.close().await;
        }
    }

    async fn send_realtime(
        &mut self,
        input: &str,
        on_delta: &mut (impl FnMut(&str) + Send),
    ) -> anyhow::Result<String> {
        self.ensure_session().await?;

        let sent = {
            let (session, _) = self.session.as_ref().expect("session connected");
            session.send_text(input)
        };
        if let Err(e) = sent {
            warn!(error = %e, "Realtime send failed, dropping the session");
            self.drop_session().await;
            return Ok(CONNECTION_TROUBLE_MESSAGE.to_string());
        }

        loop {
            let Some((_, updates)) = self.session.as_mut() else {
                break;
            };
            match updates.recv().await {
                Some(SessionUpdate::Delta(delta)) => on_delta(&delta),
                Some(SessionUpdate::Completed(text)) => return Ok(text),
                Some(SessionUpdate::Error(message)) => {
                    error!(message, "Realtime turn failed");
                    break;
                }
                Some(SessionUpdate::Status(SessionStatus::Closed)) => break,
                Some(SessionUpdate::Status(_)) => {}
                None => break,
            }
        }

        // A dead session would swallow every later turn; discard it so
        // the next turn mints a fresh credential and reconnects.
        self.drop_session().await;
        Ok(CONNECTION_TROUBLE_MESSAGE.to_string())
    }

    /// Tear down the session and any in-flight generation.
    pub async fn shutdown(&mut self) {
        self.abort_generation();
        self.drop_session().await;
        self.engine.dispose().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use futures::stream::{self, BoxStream};
    use std::sync::atomic::Ordering;

    use crate::calendar::Scheduler;
    use crate::engine::runtime::{ModelRuntime, PullProgress};
    use crate::provider::Provider;
    use crate::tools::executor::tests::CountingScheduler;

    struct StaticProvider(&'static str);

    #[async_trait]
    impl Provider for StaticProvider {
        async fn generate(&self, _prompt: &str) -> Result<String> {
            Ok(self.0.to_string())
        }

        fn name(&self) -> &str {
            "static"
        }
    }

    struct ScriptedRuntime {
        deltas: Vec<String>,
        fail_pull: bool,
    }

    impl ScriptedRuntime {
        fn new(deltas: &[&str]) -> Self {
            Self {
                deltas: deltas.iter().map(|d| d.to_string()).collect(),
                fail_pull: false,
            }
        }
    }

    #[async_trait]
    impl ModelRuntime for ScriptedRuntime {
        async fn is_reachable(&self) -> bool {
            !self.fail_pull
        }

        async fn pull_model(
            &self,
            _model_id: &str,
            _progress: &mut (dyn FnMut(PullProgress) + Send),
        ) -> Result<()> {
            if self.fail_pull {
                anyhow::bail!("runtime is down");
            }
            Ok(())
        }

        async fn warm_up(&self, _model_id: &str) -> Result<()> {
            Ok(())
        }

        async fn chat_stream(
            &self,
            _model_id: &str,
            _messages: &[ChatMessage],
        ) -> Result<BoxStream<'static, Result<String>>> {
            let deltas: Vec<Result<String>> = self.deltas.iter().cloned().map(Ok).collect();
            Ok(Box::pin(stream::iter(deltas)))
        }

        async fn unload(&self, _model_id: &str) -> Result<()> {
            Ok(())
        }
    }

    fn capable_caps() -> HardwareCapabilities {
        HardwareCapabilities {
            local_inference_supported: true,
            total_memory_gb: 16,
            recommended_model_id: "llama3.2:3b".into(),
            reason: "test".into(),
        }
    }

    fn incapable_caps() -> HardwareCapabilities {
        HardwareCapabilities {
            local_inference_supported: false,
            total_memory_gb: 1,
            recommended_model_id: String::new(),
            reason: "not enough memory".into(),
        }
    }

    fn orchestrator_with(
        runtime: ScriptedRuntime,
        caps: HardwareCapabilities,
        reply: &'static str,
    ) -> (ChatOrchestrator, Arc<CountingScheduler>) {
        let scheduler = Arc::new(CountingScheduler::default());
        let executor = Arc::new(ToolExecutor::new(
            Arc::clone(&scheduler) as Arc<dyn Scheduler>
        ));
        let engine = Arc::new(LocalEngine::new(
            Arc::new(runtime),
            Arc::clone(&executor),
            "llama3.2:3b",
        ));
        let failover = FailoverClient::new(vec![Box::new(StaticProvider(reply))]);
        let orchestrator =
            ChatOrchestrator::new(failover, engine, executor, caps, Config::default());
        (orchestrator, scheduler)
    }

    #[tokio::test]
    async fn test_incapable_hardware_forces_cloud() {
        let (mut chat, _) =
            orchestrator_with(ScriptedRuntime::new(&[]), incapable_caps(), "from cloud");
        chat.startup().await;
        assert_eq!(chat.backend(), Backend::Cloud);

        let outcome = chat.send("hello", |_| {}).await.unwrap();
        assert_eq!(outcome, TurnOutcome::Reply("from cloud".into()));
    }

    #[tokio::test]
    async fn test_failed_local_init_falls_back_to_cloud() {
        let runtime = ScriptedRuntime {
            fail_pull: true,
            ..ScriptedRuntime::new(&[])
        };
        let (mut chat, _) = orchestrator_with(runtime, capable_caps(), "cloud answer");
        chat.startup().await;
        assert_eq!(chat.backend(), Backend::Cloud);
    }

    #[tokio::test]
    async fn test_local_backend_streams_and_records_history() {
        let (mut chat, scheduler) = orchestrator_with(
            ScriptedRuntime::new(&["Pablo knows ", "Rust."]),
            capable_caps(),
            "unused",
        );
        chat.startup().await;
        assert_eq!(chat.backend(), Backend::Local);

        let mut streamed = String::new();
        let outcome = chat
            .send("What are Pablo's skills?", |d| streamed.push_str(d))
            .await
            .unwrap();

        assert_eq!(outcome, TurnOutcome::Reply("Pablo knows Rust.".into()));
        assert_eq!(streamed, "Pablo knows Rust.");
        assert_eq!(chat.history().len(), 2);
        assert_eq!(chat.history()[0].role, Role::User);
        assert_eq!(chat.history()[1].role, Role::Assistant);
        assert_eq!(scheduler.booking_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_booking_not_attempted_until_details_collected() {
        // The model asks for the missing email instead of emitting a
        // book_meeting block; no booking side effect may occur.
        let (mut chat, scheduler) = orchestrator_with(
            ScriptedRuntime::new(&["Happy to book that. ", "What email should I use?"]),
            capable_caps(),
            "unused",
        );
        chat.startup().await;

        chat.send("Book me a meeting tomorrow at 2pm, I'm Jane", |_| {})
            .await
            .unwrap();

        assert_eq!(scheduler.booking_calls.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.slots_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_commands_never_reach_a_backend_or_history() {
        let (mut chat, _) = orchestrator_with(
            ScriptedRuntime::new(&["should never stream"]),
            capable_caps(),
            "should never be called",
        );
        chat.startup().await;

        let help = chat.send("\\help", |_| {}).await.unwrap();
        let TurnOutcome::Command(help_text) = help else {
            panic!("expected a command outcome");
        };
        assert!(help_text.contains("\\color"));

        let color = chat.send("\\color teal", |_| {}).await.unwrap();
        assert!(matches!(color, TurnOutcome::Command(_)));
        assert_eq!(chat.user_color(), Some("teal"));

        assert!(chat.history().is_empty());
    }

    #[tokio::test]
    async fn test_voice_mode_forces_cloud_and_restores_on_exit() {
        let (mut chat, _) = orchestrator_with(
            ScriptedRuntime::new(&[]),
            capable_caps(),
            "unused",
        );
        chat.startup().await;
        assert_eq!(chat.backend(), Backend::Local);

        chat.set_mode(Mode::Voice).await;
        assert_eq!(chat.backend(), Backend::Cloud);
        assert_eq!(chat.mode(), Mode::Voice);

        chat.set_mode(Mode::Text).await;
        assert_eq!(chat.backend(), Backend::Local);
    }

    #[tokio::test]
    async fn test_realtime_error_drops_session_for_reconnect() {
        let (mut chat, _) =
            orchestrator_with(ScriptedRuntime::new(&[]), incapable_caps(), "unused");
        chat.startup().await;
        chat.set_mode(Mode::Voice).await;

        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        chat.session = Some((RealtimeSession::detached(out_tx), updates_rx));
        updates_tx
            .send(SessionUpdate::Delta("par".into()))
            .unwrap();
        updates_tx
            .send(SessionUpdate::Error("transport dropped".into()))
            .unwrap();

        let outcome = chat.send("hello?", |_| {}).await.unwrap();
        assert_eq!(
            outcome,
            TurnOutcome::Reply(CONNECTION_TROUBLE_MESSAGE.into())
        );
        // The dead session is gone, so the next turn reconnects.
        assert!(chat.session.is_none());
    }

    #[tokio::test]
    async fn test_closed_session_yields_sentinel_not_raw_error() {
        let (mut chat, _) =
            orchestrator_with(ScriptedRuntime::new(&[]), incapable_caps(), "unused");
        chat.startup().await;
        chat.set_mode(Mode::Voice).await;

        // Writer side already gone: sends fail immediately.
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        drop(out_rx);
        let (_updates_tx, updates_rx) = mpsc::unbounded_channel();
        chat.session = Some((RealtimeSession::detached(out_tx), updates_rx));

        let outcome = chat.send("hello?", |_| {}).await.unwrap();
        assert_eq!(
            outcome,
            TurnOutcome::Reply(CONNECTION_TROUBLE_MESSAGE.into())
        );
        assert!(chat.session.is_none());
    }

    #[tokio::test]
    async fn test_history_window_is_enforced() {
        let (mut chat, _) = orchestrator_with(
            ScriptedRuntime::new(&[]),
            incapable_caps(),
            "short answer",
        );
        chat.startup().await;

        let window = chat.config.assistant.history_window;
        for i in 0..window {
            chat.send(&format!("question {i}"), |_| {}).await.unwrap();
        }
        assert_eq!(chat.history().len(), window);
    }
}
