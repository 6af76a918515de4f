//! Local inference engine manager.
//!
//! A singleton over the model runtime: at most one loaded model, one
//! in-flight load, and one in-flight generation at a time. Loading is
//! observable through a staged progress record; generation streams
//! deltas and executes in-band tool calls as they complete.

pub mod hardware;
pub mod runtime;

pub use hardware::HardwareCapabilities;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::prompt::{self, PageContext};
use crate::tools::executor::ToolExecutor;
use crate::tools::parser;
use runtime::{ChatMessage, ModelRuntime, PullProgress};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Idle,
    Loading,
    Switching,
    Ready,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStage {
    Downloading,
    Initializing,
    Compiling,
    Ready,
}

#[derive(Debug, Clone)]
pub struct LoadProgress {
    pub stage: LoadStage,
    pub percent: u8,
    pub text: String,
}

/// Observable engine state. The UI reads it; only the engine writes it.
#[derive(Debug, Clone)]
pub struct EngineState {
    pub status: EngineStatus,
    pub progress: Option<LoadProgress>,
    pub current_model_id: Option<String>,
    pub error: Option<String>,
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            status: EngineStatus::Idle,
            progress: None,
            current_model_id: None,
            error: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("another generation is already in flight")]
    Busy,
    #[error("engine is not ready (status {0:?})")]
    NotReady(EngineStatus),
    #[error("model load was superseded by a different model")]
    Superseded,
    #[error("model load failed: {0}")]
    Load(String),
    #[error("generation failed: {0}")]
    Generation(String),
}

/// Streamed output of one generation.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    /// Newly visible display text (tool blocks already stripped).
    Delta(String),
    /// A tool call completed mid-stream and was executed.
    ToolResult { name: String, result: Value },
    /// Final display text, free of any tool residue.
    Completed(String),
}

type LoadOutcome = Option<Result<(), String>>;

struct InflightLoad {
    model_id: String,
    seq: u64,
    cancel: CancellationToken,
    done: watch::Receiver<LoadOutcome>,
}

enum Entry {
    AlreadyReady,
    Join(watch::Receiver<LoadOutcome>),
    Run {
        seq: u64,
        cancel: CancellationToken,
        done: watch::Sender<LoadOutcome>,
    },
}

pub struct LocalEngine {
    runtime: Arc<dyn ModelRuntime>,
    executor: Arc<ToolExecutor>,
    default_model_id: String,
    state: Mutex<EngineState>,
    inflight: Mutex<Option<InflightLoad>>,
    seq: AtomicU64,
    generation: tokio::sync::Mutex<()>,
}

impl LocalEngine {
    pub fn new(
        runtime: Arc<dyn ModelRuntime>,
        executor: Arc<ToolExecutor>,
        default_model_id: &str,
    ) -> Self {
        Self {
            runtime,
            executor,
            default_model_id: default_model_id.to_string(),
            state: Mutex::new(EngineState::default()),
            inflight: Mutex::new(None),
            seq: AtomicU64::new(0),
            generation: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> EngineState {
        self.state.lock().expect("state lock").clone()
    }

    pub fn status(&self) -> EngineStatus {
        self.state.lock().expect("state lock").status
    }

    /// Load a model, defaulting to the hardware-recommended one.
    ///
    /// Concurrent calls for the same model collapse into the single
    /// in-flight load. A call for a different model cancels the stale
    /// attempt first.
    pub async fn initialize(&self, model_id: Option<&str>) -> Result<(), EngineError> {
        let model_id = model_id.unwrap_or(&self.default_model_id).to_string();

        let entry = {
            let mut inflight = self.inflight.lock().expect("inflight lock");

            let join = match inflight.as_ref() {
                Some(load) if load.model_id == model_id => Some(load.done.clone()),
                Some(load) => {
                    warn!(
                        stale = %load.model_id,
                        new = %model_id,
                        "Cancelling stale model load"
                    );
                    load.cancel.cancel();
                    None
                }
                None => None,
            };

            match join {
                Some(rx) => Entry::Join(rx),
                None => {
                    let state_snapshot = self.state.lock().expect("state lock").clone();
                    if inflight.is_none()
                        && state_snapshot.status == EngineStatus::Ready
                        && state_snapshot.current_model_id.as_deref() == Some(model_id.as_str())
                    {
                        Entry::AlreadyReady
                    } else {
                        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
                        let cancel = CancellationToken::new();
                        let (done_tx, done_rx) = watch::channel(None);
                        *inflight = Some(InflightLoad {
                            model_id: model_id.clone(),
                            seq,
                            cancel: cancel.clone(),
                            done: done_rx,
                        });

                        let mut state = self.state.lock().expect("state lock");
                        state.status = if matches!(
                            state.status,
                            EngineStatus::Ready | EngineStatus::Switching
                        ) {
                            EngineStatus::Switching
                        } else {
                            EngineStatus::Loading
                        };
                        state.error = None;
                        state.progress = Some(LoadProgress {
                            stage: LoadStage::Downloading,
                            percent: 0,
                            text: format!("Preparing {model_id}"),
                        });

                        Entry::Run {
                            seq,
                            cancel,
                            done: done_tx,
                        }
                    }
                }
            }
        };

        match entry {
            Entry::AlreadyReady => Ok(()),
            Entry::Join(mut rx) => loop {
                if let Some(outcome) = rx.borrow_and_update().clone() {
                    return outcome.map_err(EngineError::Load);
                }
                rx.changed()
                    .await
                    .map_err(|_| EngineError::Superseded)?;
            },
            Entry::Run { seq, cancel, done } => {
                let result = tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = done.send(Some(Err("superseded by a newer load".into())));
                        return Err(EngineError::Superseded);
                    }
                    result = self.run_load(&model_id) => result,
                };

                {
                    let mut inflight = self.inflight.lock().expect("inflight lock");
                    // A stale finisher must not clobber a newer load.
                    if inflight.as_ref().map(|l| l.seq) == Some(seq) {
                        *inflight = None;
                        let mut state = self.state.lock().expect("state lock");
                        match &result {
                            Ok(()) => {
                                state.status = EngineStatus::Ready;
                                state.current_model_id = Some(model_id.clone());
                                state.error = None;
                                state.progress = Some(LoadProgress {
                                    stage: LoadStage::Ready,
                                    percent: 100,
                                    text: "Model ready".into(),
                                });
                                info!(model = %model_id, "Model ready");
                            }
                            Err(e) => {
                                state.status = EngineStatus::Error;
                                state.error = Some(e.clone());
                                state.progress = None;
                            }
                        }
                    }
                }

                let _ = done.send(Some(result.clone()));
                result.map_err(EngineError::Load)
            }
        }
    }

    async fn run_load(&self, model_id: &str) -> Result<(), String> {
        let mut last_percent = 0u8;
        let mut on_progress = |p: PullProgress| {
            let percent = if p.total > 0 {
                ((p.completed as f64 / p.total as f64) * 80.0) as u8
            } else {
                last_percent
            };
            let percent = percent.max(last_percent);
            last_percent = percent;
            let mut state = self.state.lock().expect("state lock");
            state.progress = Some(LoadProgress {
                stage: LoadStage::Downloading,
                percent,
                text: p.status,
            });
        };

        self.runtime
            .pull_model(model_id, &mut on_progress)
            .await
            .map_err(|e| e.to_string())?;

        self.set_progress(LoadStage::Initializing, 85, "Loading model into memory");
        self.runtime
            .warm_up(model_id)
            .await
            .map_err(|e| e.to_string())?;

        self.set_progress(LoadStage::Compiling, 95, "Preparing inference state");
        Ok(())
    }

    fn set_progress(&self, stage: LoadStage, percent: u8, text: &str) {
        let mut state = self.state.lock().expect("state lock");
        state.progress = Some(LoadProgress {
            stage,
            percent,
            text: text.to_string(),
        });
    }

    /// Unload the current model and load another. Callers observe
    /// `Switching` and get no generation capability until `Ready`.
    pub async fn switch_model(&self, model_id: &str) -> Result<(), EngineError> {
        let previous = {
            let mut state = self.state.lock().expect("state lock");
            if state.status == EngineStatus::Ready
                && state.current_model_id.as_deref() == Some(model_id)
            {
                return Ok(());
            }
            if state.status == EngineStatus::Ready {
                state.status = EngineStatus::Switching;
            }
            state.current_model_id.clone()
        };

        if let Some(previous) = previous.filter(|p| p != model_id) {
            if let Err(e) = self.runtime.unload(&previous).await {
                warn!(model = %previous, error = %e, "Unload failed, continuing with switch");
            }
        }

        self.initialize(Some(model_id)).await
    }

    /// Stream one assistant turn.
    ///
    /// The accumulated text is scanned after every delta; a newly
    /// completed tool call is executed immediately and its result is
    /// appended to the model-visible buffer. Aborting mid-stream is
    /// not an error: the text produced so far is returned.
    pub async fn send_message(
        &self,
        text: &str,
        history: &[ChatMessage],
        context: Option<&PageContext>,
        abort: CancellationToken,
        events: mpsc::UnboundedSender<GenerationEvent>,
    ) -> Result<String, EngineError> {
        let _guard = self.generation.try_lock().map_err(|_| EngineError::Busy)?;

        let model_id = {
            let state = self.state.lock().expect("state lock");
            if state.status != EngineStatus::Ready {
                return Err(EngineError::NotReady(state.status));
            }
            state
                .current_model_id
                .clone()
                .ok_or(EngineError::NotReady(EngineStatus::Idle))?
        };

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(prompt::build_local_system_prompt(
            context,
        )));
        messages.extend_from_slice(history);
        messages.push(ChatMessage::user(text));

        let mut stream = self
            .runtime
            .chat_stream(&model_id, &messages)
            .await
            .map_err(|e| EngineError::Generation(e.to_string()))?;

        let mut buffer = String::new();
        let mut emitted = String::new();
        let mut executed = 0usize;

        loop {
            let delta = tokio::select! {
                _ = abort.cancelled() => {
                    debug!("Generation aborted");
                    break;
                }
                delta = stream.next() => delta,
            };
            let Some(delta) = delta else { break };
            let delta = delta.map_err(|e| EngineError::Generation(e.to_string()))?;
            buffer.push_str(&delta);

            let calls = parser::extract_calls(&buffer);
            for call in calls.iter().skip(executed) {
                info!(tool = %call.action, "Executing in-stream tool call");
                let result = self
                    .executor
                    .execute(&call.action, &call.arguments_json())
                    .await;
                let _ = events.send(GenerationEvent::ToolResult {
                    name: call.action.clone(),
                    result: result.clone(),
                });
                buffer.push_str(&parser::wrap_result(&result));
            }
            executed = calls.len();

            // Display text is not a simple prefix extension of itself:
            // a marker arriving split across deltas first shows up as
            // plain text, then disappears once it completes. Emit only
            // what strictly extends the text already shown, holding
            // back anything that could still become a marker.
            if !parser::has_incomplete_block(&buffer) {
                let display = parser::display_text(&buffer);
                let display = parser::trim_partial_marker(&display);
                if display.len() > emitted.len() && display.starts_with(&emitted) {
                    let delta = display[emitted.len()..].to_string();
                    emitted.push_str(&delta);
                    let _ = events.send(GenerationEvent::Delta(delta));
                }
            }
        }

        let final_text = parser::display_text(&buffer);
        if final_text.len() > emitted.len() && final_text.starts_with(&emitted) {
            let _ = events.send(GenerationEvent::Delta(final_text[emitted.len()..].to_string()));
        }
        let _ = events.send(GenerationEvent::Completed(final_text.clone()));
        Ok(final_text)
    }

    /// Release everything. A later `initialize` fully reconstructs
    /// state.
    pub async fn dispose(&self) {
        {
            let mut inflight = self.inflight.lock().expect("inflight lock");
            if let Some(load) = inflight.take() {
                load.cancel.cancel();
            }
        }

        let model = {
            let mut state = self.state.lock().expect("state lock");
            let model = state.current_model_id.take();
            *state = EngineState::default();
            model
        };

        if let Some(model) = model {
            if let Err(e) = self.runtime.unload(&model).await {
                warn!(model = %model, error = %e, "Unload during dispose failed");
            }
        }
        info!("Engine disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use futures::stream::{self, BoxStream};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Semaphore;

    use crate::calendar::Scheduler;
    use crate::tools::executor::tests::CountingScheduler;

    struct FakeRuntime {
        pull_calls: AtomicUsize,
        unload_calls: AtomicUsize,
        pull_gate: Option<Semaphore>,
        deltas: Vec<String>,
        hang_after_deltas: bool,
    }

    impl FakeRuntime {
        fn with_deltas(deltas: &[&str]) -> Self {
            Self {
                pull_calls: AtomicUsize::new(0),
                unload_calls: AtomicUsize::new(0),
                pull_gate: None,
                deltas: deltas.iter().map(|d| d.to_string()).collect(),
                hang_after_deltas: false,
            }
        }

        fn gated() -> Self {
            Self {
                pull_gate: Some(Semaphore::new(0)),
                ..Self::with_deltas(&[])
            }
        }
    }

    #[async_trait]
    impl ModelRuntime for FakeRuntime {
        async fn is_reachable(&self) -> bool {
            true
        }

        async fn pull_model(
            &self,
            _model_id: &str,
            progress: &mut (dyn FnMut(PullProgress) + Send),
        ) -> Result<()> {
            self.pull_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.pull_gate {
                let _permit = gate.acquire().await?;
            }
            progress(PullProgress {
                status: "downloading".into(),
                completed: 1,
                total: 1,
            });
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
            let deltas: Vec<Result<String>> =
                self.deltas.iter().cloned().map(Ok).collect();
            if self.hang_after_deltas {
                Ok(Box::pin(stream::iter(deltas).chain(stream::pending())))
            } else {
                Ok(Box::pin(stream::iter(deltas)))
            }
        }

        async fn unload(&self, _model_id: &str) -> Result<()> {
            self.unload_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn engine_with(
        runtime: Arc<FakeRuntime>,
    ) -> (Arc<LocalEngine>, Arc<CountingScheduler>) {
        let scheduler = Arc::new(CountingScheduler::default());
        let executor = Arc::new(ToolExecutor::new(
            Arc::clone(&scheduler) as Arc<dyn Scheduler>
        ));
        let engine = Arc::new(LocalEngine::new(runtime, executor, "llama3.2:1b"));
        (engine, scheduler)
    }

    async fn ready_engine(
        deltas: &[&str],
    ) -> (Arc<LocalEngine>, Arc<FakeRuntime>, Arc<CountingScheduler>) {
        let runtime = Arc::new(FakeRuntime::with_deltas(deltas));
        let (engine, scheduler) = engine_with(Arc::clone(&runtime));
        engine.initialize(None).await.unwrap();
        (engine, runtime, scheduler)
    }

    #[tokio::test]
    async fn test_concurrent_initialize_collapses_into_one_load() {
        let runtime = Arc::new(FakeRuntime::gated());
        let (engine, _) = engine_with(Arc::clone(&runtime));

        let a = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.initialize(None).await }
        });
        let b = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.initialize(None).await }
        });

        runtime.pull_gate.as_ref().unwrap().add_permits(1);
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(runtime.pull_calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.status(), EngineStatus::Ready);
    }

    #[tokio::test]
    async fn test_initialize_uses_recommended_default() {
        let (engine, _, _) = ready_engine(&[]).await;
        assert_eq!(
            engine.state().current_model_id.as_deref(),
            Some("llama3.2:1b")
        );
    }

    #[tokio::test]
    async fn test_switch_model_unloads_previous() {
        let (engine, runtime, _) = ready_engine(&[]).await;
        engine.switch_model("llama3.2:3b").await.unwrap();

        assert_eq!(runtime.unload_calls.load(Ordering::SeqCst), 1);
        assert_eq!(runtime.pull_calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            engine.state().current_model_id.as_deref(),
            Some("llama3.2:3b")
        );
    }

    #[tokio::test]
    async fn test_send_message_before_initialize_is_not_ready() {
        let runtime = Arc::new(FakeRuntime::with_deltas(&[]));
        let (engine, _) = engine_with(runtime);
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = engine
            .send_message("hi", &[], None, CancellationToken::new(), tx)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotReady(EngineStatus::Idle)));
    }

    #[tokio::test]
    async fn test_plain_reply_streams_without_tools() {
        let (engine, _, scheduler) =
            ready_engine(&["Pablo knows ", "Python and ", "Rust."]).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let final_text = engine
            .send_message(
                "What are Pablo's skills?",
                &[],
                None,
                CancellationToken::new(),
                tx,
            )
            .await
            .unwrap();

        assert_eq!(final_text, "Pablo knows Python and Rust.");
        assert!(!final_text.contains("<tool>"));
        assert_eq!(
            scheduler.slots_calls.load(std::sync::atomic::Ordering::SeqCst),
            0
        );

        let mut deltas = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, GenerationEvent::Delta(_)) {
                deltas += 1;
            }
        }
        assert!(deltas >= 1);
    }

    #[tokio::test]
    async fn test_tool_call_executes_mid_stream() {
        let (engine, _, scheduler) = ready_engine(&[
            "Checking. ",
            r#"<tool>{"action":"check_availability","#,
            r#""date":"2025-01-15","timezone":"UTC"}</tool>"#,
            " All set.",
        ])
        .await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let final_text = engine
            .send_message("Any slots?", &[], None, CancellationToken::new(), tx)
            .await
            .unwrap();

        assert_eq!(
            scheduler.slots_calls.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
        assert_eq!(final_text, "Checking.  All set.");

        let mut saw_tool_result = false;
        while let Ok(event) = rx.try_recv() {
            if let GenerationEvent::ToolResult { name, result } = event {
                assert_eq!(name, "check_availability");
                assert_eq!(result["date"], "2025-01-15");
                saw_tool_result = true;
            }
        }
        assert!(saw_tool_result);
    }

    #[tokio::test]
    async fn test_marker_split_across_deltas_stays_hidden() {
        // The open marker arrives in pieces right after a multi-byte
        // character; streamed text must match the final text exactly,
        // with no marker residue.
        let (engine, _, scheduler) = ready_engine(&[
            "Hi x\u{1F4A5}",
            " <to",
            r#"ol>{"action":"check_availability","date":"2025-01-15","timezone":"UTC"}</tool>"#,
            " all done here.",
        ])
        .await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let final_text = engine
            .send_message("Any slots?", &[], None, CancellationToken::new(), tx)
            .await
            .unwrap();

        assert_eq!(
            scheduler.slots_calls.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
        assert_eq!(final_text, "Hi x\u{1F4A5}  all done here.");

        let mut streamed = String::new();
        while let Ok(event) = rx.try_recv() {
            if let GenerationEvent::Delta(delta) = event {
                streamed.push_str(&delta);
            }
        }
        assert_eq!(streamed, final_text);
        assert!(!streamed.contains('<'));
    }

    #[tokio::test]
    async fn test_abort_is_not_an_error() {
        let runtime = Arc::new(FakeRuntime {
            hang_after_deltas: true,
            ..FakeRuntime::with_deltas(&["partial "])
        });
        let (engine, _) = engine_with(runtime);
        engine.initialize(None).await.unwrap();

        let abort = CancellationToken::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let task = tokio::spawn({
            let engine = Arc::clone(&engine);
            let abort = abort.clone();
            async move {
                engine
                    .send_message("hello", &[], None, abort, tx)
                    .await
            }
        });

        tokio::task::yield_now().await;
        abort.cancel();

        let result = task.await.unwrap().unwrap();
        assert_eq!(result, "partial ");
    }

    #[tokio::test]
    async fn test_second_generation_is_rejected_while_busy() {
        let runtime = Arc::new(FakeRuntime {
            hang_after_deltas: true,
            ..FakeRuntime::with_deltas(&["thinking"])
        });
        let (engine, _) = engine_with(runtime);
        engine.initialize(None).await.unwrap();

        let abort = CancellationToken::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let first = tokio::spawn({
            let engine = Arc::clone(&engine);
            let abort = abort.clone();
            async move { engine.send_message("one", &[], None, abort, tx).await }
        });

        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        let (tx2, _rx2) = mpsc::unbounded_channel();
        let err = engine
            .send_message("two", &[], None, CancellationToken::new(), tx2)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Busy));

        abort.cancel();
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_dispose_returns_to_idle() {
        let (engine, runtime, _) = ready_engine(&[]).await;
        engine.dispose().await;

        let state = engine.state();
        assert_eq!(state.status, EngineStatus::Idle);
        assert!(state.current_model_id.is_none());
        assert_eq!(runtime.unload_calls.load(Ordering::SeqCst), 1);

        // A later initialize fully reconstructs state.
        engine.initialize(None).await.unwrap();
        assert_eq!(engine.status(), EngineStatus::Ready);
    }
}
