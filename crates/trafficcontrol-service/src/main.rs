#![forbid(unsafe_code)]

//! **trafficcontrol** – Autonomous agent orchestrator service.
//!
//! Admits work from an external backlog, runs coding agents under
//! per-model concurrency limits, and keeps a human in the loop over chat.
//!
//! ## Usage
//!
//! ```bash
//! # Start against the environment-configured backlog and chat channel
//! trafficcontrol
//!
//! # Development mode: skip operator confirmation, verbose logs
//! trafficcontrol --yes --log-level debug
//! ```
//!
//! Exit codes: 0 on clean shutdown, non-zero on fatal startup failure
//! (database unreachable past the retry budget, missing or invalid
//! configuration, aborted confirmation).

mod config;
mod http;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use trafficcontrol_agents::{
    AgentAdapter, CapacityTracker, CliAdapter, SessionManager,
};
use trafficcontrol_bus::EventBus;
use trafficcontrol_chat::{
    ApprovalConfig, ApprovalController, ChatTransport, EventfulTransport, InboundDispatcher,
    MemoryChatTransport, NotificationController, NotifierConfig, QuestionRouter, SlackTransport,
    ThreadReplyHandler,
};
use trafficcontrol_orchestration::{
    BasicBacklogValidator, ContextBudget, Orchestrator, OrchestratorDeps, Scheduler,
};
use trafficcontrol_store::MemoryTaskStore;

use crate::config::{AgentMode, ServiceConfig};
use crate::http::DashboardState;

#[derive(Parser)]
#[command(name = "trafficcontrol")]
#[command(about = "TrafficControl - agent orchestration with human-in-the-loop control")]
#[command(version)]
struct Cli {
    /// Skip the pre-flight operator confirmation
    #[arg(long)]
    yes: bool,

    /// Log filter (overrides TC_LOG_LEVEL)
    #[arg(long)]
    log_level: Option<String>,

    /// State snapshot file path (overrides TC_STATE_FILE_PATH)
    #[arg(long)]
    state_file: Option<String>,

    /// Disable the health/status HTTP endpoints
    #[arg(long)]
    no_dashboard: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let mut config = match ServiceConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("fatal: {err}");
            return ExitCode::FAILURE;
        }
    };
    if cli.yes {
        config.orchestrator.skip_confirmation = true;
    }
    if let Some(path) = cli.state_file {
        config.orchestrator.state_file_path = path;
    }
    if cli.no_dashboard {
        config.dashboard_enabled = false;
    }
    let log_level = cli.log_level.unwrap_or_else(|| config.log_level.clone());

    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "fatal startup failure");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: ServiceConfig) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        agent_mode = ?config.agent_mode,
        relay_timeout_ms = config.relay_timeout_ms,
        relay_model = ?config.relay_model,
        learnings_path = ?config.learnings_path,
        has_db_service_key = config.database_service_key.is_some(),
        "trafficcontrol starting"
    );

    let bus = Arc::new(EventBus::default());

    // The production store driver is provided by the deployment; this
    // binary ships the in-memory driver for development runs.
    if config.database_url.is_some() {
        warn!("DATABASE_URL set but no external store driver is linked; using the in-memory store");
    } else {
        info!("no DATABASE_URL configured, using the in-memory store");
    }
    let store = Arc::new(MemoryTaskStore::new());

    let raw_transport: Arc<dyn ChatTransport> = match &config.chat_token {
        Some(token) => {
            info!(channel = config.chat_channel_id, "using the Slack transport");
            Arc::new(SlackTransport::new(token.clone())?)
        }
        None => {
            warn!("CHAT_TOKEN not set; chat output goes to the in-memory transport");
            Arc::new(MemoryChatTransport::new())
        }
    };
    let transport: Arc<dyn ChatTransport> =
        Arc::new(EventfulTransport::new(raw_transport, bus.clone()));

    let adapter: Arc<dyn AgentAdapter> = match config.agent_mode {
        AgentMode::Cli => Arc::new(CliAdapter::new(config.relay_cli_path.clone())),
        AgentMode::Sdk => {
            anyhow::bail!(
                "AGENT_MODE=sdk requires an embedded SDK client; this binary ships the cli adapter"
            );
        }
    };

    let orchestrator_config = config.orchestrator.clone();
    let capacity = Arc::new(CapacityTracker::new(
        orchestrator_config.capacity.clone(),
        bus.clone(),
    ));
    let sessions = SessionManager::new(
        adapter,
        capacity.clone(),
        bus.clone(),
        orchestrator_config.session_close_grace(),
    );
    let scheduler = Arc::new(Scheduler::new(store.clone(), capacity.clone()));
    let budget = Arc::new(ContextBudget::new(
        orchestrator_config.context_max_tokens,
        orchestrator_config.context_target_utilization,
        orchestrator_config.context_warn_utilization,
        bus.clone(),
    ));
    let notifier = NotificationController::new(
        NotifierConfig {
            channel_id: config.chat_channel_id.clone(),
            ..Default::default()
        },
        transport.clone(),
    );
    let approvals = ApprovalController::new(
        ApprovalConfig {
            channel_id: config.chat_channel_id.clone(),
            timeout: orchestrator_config.approval_timeout(),
        },
        transport.clone(),
        store.clone(),
    );
    let questions = QuestionRouter::new(
        config.chat_channel_id.clone(),
        transport.clone(),
        sessions.clone(),
    );

    let orchestrator = Orchestrator::new(
        orchestrator_config,
        OrchestratorDeps {
            bus: bus.clone(),
            store: store.clone(),
            capacity,
            sessions,
            scheduler,
            budget,
            notifier,
            approvals: approvals.clone(),
            questions: questions.clone(),
            transport: transport.clone(),
            validator: Arc::new(BasicBacklogValidator),
            channel_id: config.chat_channel_id.clone(),
        },
    )?;

    // Inbound chat enters through this dispatcher; the deployment's
    // transport integration calls handle_message / handle_reaction.
    let thread_handlers: Vec<Arc<dyn ThreadReplyHandler>> = vec![
        orchestrator.clone(),
        questions.clone(),
        approvals.clone(),
    ];
    let _dispatcher = InboundDispatcher::new(
        config.chat_channel_id.clone(),
        transport,
        thread_handlers,
        approvals,
        orchestrator.clone(),
        bus.clone(),
    );

    let dashboard_cancel = CancellationToken::new();
    if config.dashboard_enabled {
        let state = DashboardState {
            orchestrator: orchestrator.clone(),
        };
        let port = config.dashboard_port;
        let cancel = dashboard_cancel.clone();
        tokio::spawn(async move {
            http::serve(port, state, cancel).await;
        });
    }

    orchestrator.start().await?;

    shutdown_signal().await;
    info!("shutdown signal received");
    orchestrator.stop().await;
    dashboard_cancel.cancel();
    bus.destroy();
    info!("trafficcontrol stopped cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
