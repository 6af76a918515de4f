//! foliobot-core: chat orchestration core for a personal portfolio assistant.
//!
//! This crate contains the building blocks for an assistant that answers
//! questions about its owner across three interchangeable backends:
//!
//! - [`config`] — Typed configuration loading from JSON
//! - [`provider`] — Cloud provider trait, vendor adapters, and the failover client
//! - [`tools`] — In-band tool-call parser, executor, and tool schemas
//! - [`calendar`] — Cal.com scheduling collaborator behind the `Scheduler` trait
//! - [`prompt`] — Owner profile, page context, and system-prompt builders
//! - [`realtime`] — Persistent duplex session to the cloud realtime API
//! - [`engine`] — Singleton local inference engine with staged loading
//! - [`orchestrator`] — Backend selection, history, and turn dispatch
//! - [`gateway`] — Trust-boundary HTTP endpoints (credential minting, tool execution)
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use foliobot_core::calendar::CalComScheduler;
//! use foliobot_core::config::Config;
//! use foliobot_core::engine::{hardware, runtime::OllamaRuntime, LocalEngine};
//! use foliobot_core::orchestrator::ChatOrchestrator;
//! use foliobot_core::provider::FailoverClient;
//! use foliobot_core::tools::executor::ToolExecutor;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Config::load()?;
//! let client = reqwest::Client::new();
//!
//! let scheduler = Arc::new(CalComScheduler::from_config(&config.calendar, client.clone()));
//! let executor = Arc::new(ToolExecutor::new(scheduler));
//!
//! let caps = hardware::probe_with_runtime(&config.engine.base_url, &client).await;
//! let runtime = Arc::new(OllamaRuntime::new(&config.engine.base_url, client.clone()));
//! let engine = Arc::new(LocalEngine::new(runtime, Arc::clone(&executor), &caps.recommended_model_id));
//!
//! let failover = FailoverClient::from_config(&config.providers, client.clone());
//! let mut chat = ChatOrchestrator::new(failover, engine, executor, caps, config);
//! chat.startup().await;
//! # Ok(())
//! # }
//! ```

pub mod calendar;
pub mod config;
pub mod engine;
pub mod gateway;
pub mod orchestrator;
pub mod prompt;
pub mod provider;
pub mod realtime;
pub mod tools;
