//! Uniform interface over agent runtimes.
//!
//! Two interchangeable variants exist: an in-process SDK client
//! ([`SdkAdapter`]) and a CLI subprocess speaking line-delimited JSON
//! ([`CliAdapter`]). Both produce the same normalized message stream and the
//! same usage accounting, so the session manager never knows which one it is
//! talking to.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use trafficcontrol_types::{Model, RawUsage, SessionId, Usage};

pub mod cli;
pub mod sdk;

pub use cli::CliAdapter;
pub use sdk::{ScriptStep, ScriptedClient, SdkAdapter, SdkClient, SessionScript};

/// Buffer size of the normalized message channel per query.
const MESSAGE_BUFFER: usize = 64;

/// Buffer size of the injection channel per query.
const INJECT_BUFFER: usize = 8;

//─────────────────────────────
//  Query configuration
//─────────────────────────────

/// Permission behavior requested from the agent runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    /// Skip permission prompts entirely.
    Bypass,
    /// Runtime default prompting behavior.
    Default,
}

/// Configuration for one agent query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Working directory the agent operates in.
    pub working_dir: PathBuf,
    /// Model to run on.
    pub model: Model,
    /// Extra system-prompt text appended to the runtime's own.
    pub system_prompt_suffix: Option<String>,
    /// Turn budget for the run.
    pub max_turns: u32,
    /// Permission behavior.
    pub permission_mode: PermissionMode,
    /// Runtime session id to resume, if any.
    pub resume_session: Option<String>,
}

impl QueryConfig {
    /// Reasonable defaults for `model` in the current directory.
    pub fn for_model(model: Model) -> Self {
        Self {
            working_dir: PathBuf::from("."),
            model,
            system_prompt_suffix: None,
            max_turns: 50,
            permission_mode: PermissionMode::Bypass,
            resume_session: None,
        }
    }
}

//─────────────────────────────
//  Normalized messages
//─────────────────────────────

/// Normalized message produced by every adapter variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AgentMessage {
    /// The agent invoked a tool.
    ToolUse {
        /// Runtime tool-use id.
        tool_id: String,
        /// Tool name.
        tool_name: String,
        /// Tool input record.
        input: serde_json::Value,
    },
    /// Progress heartbeat for a long-running tool call.
    ToolProgress {
        /// Runtime tool-use id.
        tool_id: String,
        /// Tool name.
        tool_name: String,
        /// Seconds since the call started.
        elapsed_secs: f64,
    },
    /// Terminal: the run finished successfully.
    ResultSuccess {
        /// Final response text.
        text: String,
        /// Wall-clock duration of the run.
        duration_ms: u64,
        /// Raw usage as reported by the runtime.
        usage: RawUsage,
    },
    /// Terminal: the run failed.
    ResultError {
        /// Error descriptions, most significant first.
        errors: Vec<String>,
        /// Raw usage up to the failure.
        usage: RawUsage,
    },
    /// Adapter bookkeeping; suppressed by higher layers.
    System {
        /// Runtime-specific subtype.
        subtype: String,
    },
}

impl AgentMessage {
    /// Whether this message terminates the session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentMessage::ResultSuccess { .. } | AgentMessage::ResultError { .. }
        )
    }
}

//─────────────────────────────
//  Active query handle
//─────────────────────────────

/// Control half of an active query, cheap to clone.
#[derive(Clone)]
pub struct QueryControl {
    cancel: CancellationToken,
    inject_tx: mpsc::Sender<String>,
    running: Arc<AtomicBool>,
}

impl QueryControl {
    /// Whether the underlying runtime is still producing messages.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Request runtime shutdown. Idempotent; the stream ends shortly after.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Feed operator text into the running agent.
    pub async fn inject(&self, text: String) -> Result<(), AdapterError> {
        self.inject_tx
            .send(text)
            .await
            .map_err(|_| AdapterError::QueryClosed)
    }
}

/// One live agent invocation: a normalized message stream plus control.
pub struct ActiveQuery {
    session_id: SessionId,
    messages: mpsc::Receiver<AgentMessage>,
    control: QueryControl,
}

/// Producer half handed to adapter implementations.
///
/// Runtime drivers hold the feeder, pushing normalized messages into `tx`
/// and draining `inject_rx` until `cancel` fires or their stream ends, at
/// which point they clear `running` and drop the feeder.
pub struct QueryFeeder {
    /// Sink for normalized messages.
    pub tx: mpsc::Sender<AgentMessage>,
    /// Operator text injected into the run.
    pub inject_rx: mpsc::Receiver<String>,
    /// Cooperative shutdown signal.
    pub cancel: CancellationToken,
    /// Liveness flag, cleared when the producer stops.
    pub running: Arc<AtomicBool>,
}

impl ActiveQuery {
    /// Create a connected query/feeder pair for `session_id`.
    pub fn channel(session_id: SessionId) -> (Self, QueryFeeder) {
        let (tx, messages) = mpsc::channel(MESSAGE_BUFFER);
        let (inject_tx, inject_rx) = mpsc::channel(INJECT_BUFFER);
        let cancel = CancellationToken::new();
        let running = Arc::new(AtomicBool::new(true));
        let query = Self {
            session_id,
            messages,
            control: QueryControl {
                cancel: cancel.clone(),
                inject_tx,
                running: running.clone(),
            },
        };
        let feeder = QueryFeeder {
            tx,
            inject_rx,
            cancel,
            running,
        };
        (query, feeder)
    }

    /// Session this query belongs to.
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Clone the control half.
    pub fn control(&self) -> QueryControl {
        self.control.clone()
    }

    /// Whether the underlying runtime is still producing messages.
    pub fn is_running(&self) -> bool {
        self.control.is_running()
    }

    /// Next normalized message; `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<AgentMessage> {
        self.messages.recv().await
    }
}

//─────────────────────────────
//  Adapter contract
//─────────────────────────────

/// Uniform interface over an agent runtime.
#[async_trait]
pub trait AgentAdapter: Send + Sync {
    /// Start a query for `session_id` and return its live handle.
    async fn start_query(
        &self,
        session_id: SessionId,
        prompt: &str,
        config: &QueryConfig,
    ) -> Result<ActiveQuery, AdapterError>;

    /// Normalize raw runtime usage, consulting the session→model memory
    /// when `model` is not supplied.
    fn extract_usage(&self, session_id: SessionId, model: Option<Model>, raw: &RawUsage) -> Usage;
}

/// Remembers which model each session ran on, so usage reported after the
/// fact still costs correctly.
#[derive(Debug, Default)]
pub struct ModelMemory {
    models: DashMap<SessionId, Model>,
}

impl ModelMemory {
    /// Create an empty memory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the model `session` runs on.
    pub fn remember(&self, session: SessionId, model: Model) {
        self.models.insert(session, model);
    }

    /// Model previously recorded for `session`, if any.
    pub fn recall(&self, session: SessionId) -> Option<Model> {
        self.models.get(&session).map(|entry| *entry)
    }

    /// Normalize `raw`, preferring the explicit `model` over the memory.
    pub fn normalize(&self, session: SessionId, model: Option<Model>, raw: &RawUsage) -> Usage {
        Usage::from_raw(model.or_else(|| self.recall(session)), raw)
    }
}

//─────────────────────────────
//  Error types
//─────────────────────────────

/// Errors raised by adapter operations.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// The runtime process or client failed to start.
    #[error("failed to start agent runtime: {0}")]
    SpawnFailed(String),
    /// I/O failure talking to the runtime.
    #[error("agent runtime i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// The query has already terminated.
    #[error("query is no longer running")]
    QueryClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_memory_costs_late_usage() {
        let memory = ModelMemory::new();
        let session = SessionId::new();
        memory.remember(session, Model::Opus);

        let raw = RawUsage {
            input_tokens: 1_000_000,
            output_tokens: 100_000,
            ..Default::default()
        };
        let usage = memory.normalize(session, None, &raw);
        assert!((usage.cost_usd - 22.50).abs() < 1e-9);
    }

    #[test]
    fn explicit_model_wins_over_memory() {
        let memory = ModelMemory::new();
        let session = SessionId::new();
        memory.remember(session, Model::Opus);

        let raw = RawUsage {
            input_tokens: 1_000_000,
            output_tokens: 1_000_000,
            ..Default::default()
        };
        let usage = memory.normalize(session, Some(Model::Haiku), &raw);
        assert!((usage.cost_usd - 4.80).abs() < 1e-9);
    }

    #[test]
    fn unknown_session_and_model_costs_zero_without_report() {
        let memory = ModelMemory::new();
        let raw = RawUsage {
            input_tokens: 500,
            output_tokens: 500,
            total_cost_usd: None,
            ..Default::default()
        };
        assert_eq!(memory.normalize(SessionId::new(), None, &raw).cost_usd, 0.0);
    }

    #[tokio::test]
    async fn query_channel_round_trips_messages() {
        let session = SessionId::new();
        let (mut query, feeder) = ActiveQuery::channel(session);
        assert_eq!(query.session_id(), session);
        assert!(query.is_running());

        feeder
            .tx
            .send(AgentMessage::System {
                subtype: "init".into(),
            })
            .await
            .unwrap();
        drop(feeder);

        assert!(matches!(
            query.next().await,
            Some(AgentMessage::System { .. })
        ));
        assert!(query.next().await.is_none());
    }
}
