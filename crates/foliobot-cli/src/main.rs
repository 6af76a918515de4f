//! foliobot CLI — interactive chat, onboarding, status, and the gateway.
//!
//! Usage:
//!   foliobot chat      — Start an interactive chat session
//!   foliobot onboard   — Create a default configuration
//!   foliobot status    — Show current configuration and health
//!   foliobot serve     — Run the trust-boundary HTTP gateway

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::io::{self, Write};
use std::sync::Arc;

use foliobot_core::calendar::{CalComScheduler, Scheduler};
use foliobot_core::config::Config;
use foliobot_core::engine::runtime::OllamaRuntime;
use foliobot_core::engine::{hardware, LocalEngine};
use foliobot_core::gateway::{self, GatewayState};
use foliobot_core::orchestrator::{Backend, ChatOrchestrator, TurnOutcome};
use foliobot_core::provider::FailoverClient;
use foliobot_core::realtime::Mode;
use foliobot_core::tools::executor::ToolExecutor;

#[derive(Parser)]
#[command(
    name = "foliobot",
    version,
    about = "A portfolio AI assistant",
    long_about = "foliobot — a portfolio assistant with cloud failover, realtime voice, and local inference.\n\nAnswers questions about Pablo, checks calendar availability, and books meetings."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive chat session
    Chat {
        /// Local model to use (overrides the hardware recommendation)
        #[arg(short, long)]
        model: Option<String>,

        /// Force the cloud backend even when local inference works
        #[arg(long)]
        cloud: bool,
    },

    /// Create or reset the default configuration
    Onboard,

    /// Show configuration status and health
    Status,

    /// Run the HTTP gateway (credential minting and tool execution)
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Chat { model, cloud }) => cmd_chat(model.as_deref(), cloud).await?,
        Some(Commands::Onboard) => cmd_onboard()?,
        Some(Commands::Status) => cmd_status().await?,
        Some(Commands::Serve) => cmd_serve().await?,
        None => cmd_chat(None, false).await?,
    }

    Ok(())
}

// ── Shared Setup ────────────────────────────────────────────────────

/// Wire the full orchestrator: scheduler, executor, hardware probe,
/// engine, and failover client.
async fn setup_orchestrator(
    config: Config,
    model_override: Option<&str>,
) -> (ChatOrchestrator, String) {
    let client = reqwest::Client::new();

    let scheduler = Arc::new(CalComScheduler::from_config(&config.calendar, client.clone()));
    let executor = Arc::new(ToolExecutor::new(scheduler as Arc<dyn Scheduler>));

    let caps = hardware::probe_with_runtime(&config.engine.base_url, &client).await;
    let default_model = model_override
        .map(str::to_string)
        .or_else(|| config.engine.default_model.clone())
        .unwrap_or_else(|| caps.recommended_model_id.clone());

    let runtime = Arc::new(OllamaRuntime::new(&config.engine.base_url, client.clone()));
    let engine = Arc::new(LocalEngine::new(
        runtime,
        Arc::clone(&executor),
        &default_model,
    ));

    let failover = FailoverClient::from_config(&config.providers, client);
    let orchestrator = ChatOrchestrator::new(failover, engine, executor, caps, config);
    (orchestrator, default_model)
}

// ── Chat Command ────────────────────────────────────────────────────

async fn cmd_chat(model_override: Option<&str>, force_cloud: bool) -> Result<()> {
    let config = Config::load()?;
    let (mut chat, model) = setup_orchestrator(config, model_override).await;

    chat.startup().await;
    if force_cloud {
        chat.select_backend(Backend::Cloud).await?;
    }

    println!();
    println!("  foliobot v{}", env!("CARGO_PKG_VERSION"));
    let backend = match chat.backend() {
        Backend::Local => format!("local ({model})"),
        Backend::Cloud => "cloud (failover)".to_string(),
    };
    println!("  Backend: {backend}");
    println!();
    println!("  Type your message, \\help for commands, or /quit to exit.");
    println!("  ─────────────────────────────────────");
    println!();

    let stdin = io::stdin();
    loop {
        print!("  \x1b[36m>\x1b[0m ");
        io::stdout().flush()?;

        let mut input = String::new();
        if stdin.read_line(&mut input)? == 0 {
            break;
        }
        let input = input.trim();

        if input.is_empty() {
            continue;
        }

        match input {
            "/quit" | "/exit" | "/q" => {
                println!("  Goodbye!");
                break;
            }
            "/voice" => {
                let next = match chat.mode() {
                    Mode::Text => Mode::Voice,
                    Mode::Voice => Mode::Text,
                };
                chat.set_mode(next).await;
                println!(
                    "  Mode: {}",
                    if next == Mode::Voice { "voice (realtime)" } else { "text" }
                );
                continue;
            }
            "/local" | "/cloud" => {
                let backend = if input == "/local" {
                    Backend::Local
                } else {
                    Backend::Cloud
                };
                match chat.select_backend(backend).await {
                    Ok(()) => println!("  Backend switched."),
                    Err(e) => eprintln!("  \x1b[31m{e}\x1b[0m"),
                }
                continue;
            }
            _ => {}
        }

        println!();
        let mut streamed = false;
        let outcome = chat
            .send(input, |delta| {
                streamed = true;
                print!("\x1b[32m{delta}\x1b[0m");
                let _ = io::stdout().flush();
            })
            .await;

        match outcome {
            Ok(TurnOutcome::Command(reply)) => println!("  {reply}\n"),
            Ok(TurnOutcome::Reply(reply)) => {
                if streamed {
                    println!("\n");
                } else {
                    println!("  \x1b[32m{reply}\x1b[0m\n");
                }
            }
            Err(e) => eprintln!("  \x1b[31mError: {e}\x1b[0m\n"),
        }
    }

    chat.shutdown().await;
    Ok(())
}

// ── Onboard Command ─────────────────────────────────────────────────

fn cmd_onboard() -> Result<()> {
    let path = Config::write_default_template()?;
    println!();
    println!("  Configuration created at:");
    println!("     {}", path.display());
    println!();
    println!("  Next steps:");
    println!("  1. Edit the config file and add at least one provider API key");
    println!("  2. Optionally add a calendar API key to enable meeting booking");
    println!("  3. Run `foliobot chat` to start chatting");
    println!();
    Ok(())
}

// ── Status Command ──────────────────────────────────────────────────

async fn cmd_status() -> Result<()> {
    let config_path = Config::default_path();
    let config = Config::load()?;

    println!();
    println!("  foliobot status");
    println!("  ─────────────────────────────────────");

    if config_path.exists() {
        println!("  Config:    {}", config_path.display());
    } else {
        println!("  Config:    not found (run `foliobot onboard`)");
    }

    let client = reqwest::Client::new();
    let failover = FailoverClient::from_config(&config.providers, client.clone());
    let chain = failover.provider_names();
    if chain.len() == 1 {
        println!("  Providers: none configured (maintenance fallback only)");
    } else {
        println!("  Providers: {}", chain.join(" -> "));
    }

    let calendar_ready =
        !config.calendar.api_key.is_empty() && !config.calendar.event_type_id.is_empty();
    println!(
        "  Calendar:  {}",
        if calendar_ready { "configured" } else { "not configured" }
    );

    let caps = hardware::probe_with_runtime(&config.engine.base_url, &client).await;
    if caps.local_inference_supported {
        println!(
            "  Local:     {} ({} GiB memory)",
            caps.recommended_model_id, caps.total_memory_gb
        );
    } else {
        println!("  Local:     unavailable ({})", caps.reason);
    }

    println!(
        "  Gateway:   {}:{}",
        config.gateway.host, config.gateway.port
    );
    println!();
    Ok(())
}

// ── Serve Command ───────────────────────────────────────────────────

async fn cmd_serve() -> Result<()> {
    let config = Config::load()?;
    let client = reqwest::Client::new();

    let scheduler = Arc::new(CalComScheduler::from_config(&config.calendar, client.clone()));
    let executor = Arc::new(ToolExecutor::new(scheduler as Arc<dyn Scheduler>));

    let state = Arc::new(GatewayState {
        executor,
        http: client,
        gateway: config.gateway.clone(),
        realtime: config.realtime.clone(),
    });

    println!(
        "  Gateway listening on {}:{} (Ctrl+C to stop)",
        state.gateway.host, state.gateway.port
    );

    tokio::select! {
        result = gateway::serve(state) => result?,
        _ = tokio::signal::ctrl_c() => {
            println!("\n  Shutting down.");
        }
    }

    Ok(())
}
