#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **trafficcontrol-types** – Shared primitive data structures for TrafficControl.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing cycles.
//! It holds the model/status enums, the task, project and session records,
//! usage accounting with the per-model price table, and the orchestrator
//! configuration. It intentionally makes no assumptions about I/O, chat
//! transports, or storage.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

//─────────────────────────────
//  Limits
//─────────────────────────────

/// Maximum allowed size for task descriptions to bound memory use per row.
pub const MAX_TASK_DESCRIPTION_LEN: usize = 16_384;

/// Maximum allowed size for a single chat message body.
pub const MAX_CHAT_MESSAGE_LEN: usize = 40_000;

//─────────────────────────────
//  Core identifiers
//─────────────────────────────

/// Identifier of an externally owned task row.
///
/// Task ids are opaque strings minted by the backing store. Ordering is
/// lexicographic, which the scheduler relies on as the final tie-breaker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of an externally owned project row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub String);

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProjectId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Globally unique identifier of one agent invocation.
///
/// Minted by the session manager at spawn time; never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Mint a fresh, globally unique session id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

//─────────────────────────────
//  Models and pricing
//─────────────────────────────

/// Agent model family a session runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Model {
    /// Highest-capability, most expensive tier.
    Opus,
    /// Mid tier.
    Sonnet,
    /// Fastest, cheapest tier.
    Haiku,
}

/// Fallback preference order used when a task's preferred model is at capacity.
pub const MODEL_FALLBACK_ORDER: [Model; 3] = [Model::Opus, Model::Sonnet, Model::Haiku];

impl Model {
    /// Price in USD per million input tokens.
    pub fn input_price_per_mtok(&self) -> f64 {
        match self {
            Model::Opus => 15.00,
            Model::Sonnet => 3.00,
            Model::Haiku => 0.80,
        }
    }

    /// Price in USD per million output tokens.
    pub fn output_price_per_mtok(&self) -> f64 {
        match self {
            Model::Opus => 75.00,
            Model::Sonnet => 15.00,
            Model::Haiku => 4.00,
        }
    }

    /// Canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Model::Opus => "opus",
            Model::Sonnet => "sonnet",
            Model::Haiku => "haiku",
        }
    }

    /// All known models.
    pub fn all() -> [Model; 3] {
        MODEL_FALLBACK_ORDER
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Model {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "opus" => Ok(Model::Opus),
            "sonnet" => Ok(Model::Sonnet),
            "haiku" => Ok(Model::Haiku),
            other => Err(TypeError::UnknownModel(other.to_string())),
        }
    }
}

//─────────────────────────────
//  Usage accounting
//─────────────────────────────

/// Raw usage figures as reported by an agent runtime, before normalization.
///
/// Field names follow the wire protocol of the CLI runtime; the SDK variant
/// produces the same shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawUsage {
    /// Input tokens consumed.
    #[serde(default)]
    pub input_tokens: u64,
    /// Output tokens produced.
    #[serde(default)]
    pub output_tokens: u64,
    /// Tokens served from the provider's prompt cache.
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    /// Tokens written into the provider's prompt cache.
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    /// Cost reported by the runtime itself, if any.
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
}

/// Normalized usage accumulator attached to every session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    /// Input tokens consumed.
    pub input_tokens: u64,
    /// Output tokens produced.
    pub output_tokens: u64,
    /// `input_tokens + output_tokens`.
    pub total_tokens: u64,
    /// Tokens served from the prompt cache.
    pub cache_read_tokens: u64,
    /// Tokens written into the prompt cache.
    pub cache_creation_tokens: u64,
    /// Cost in USD, computed from the price table when the model is known.
    pub cost_usd: f64,
}

impl Usage {
    /// Cost in USD for `input`/`output` tokens on `model`.
    ///
    /// Zero tokens cost zero regardless of model.
    pub fn cost_for(model: Model, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1_000_000.0) * model.input_price_per_mtok()
            + (output_tokens as f64 / 1_000_000.0) * model.output_price_per_mtok()
    }

    /// Normalize raw runtime usage into the canonical accumulator shape.
    ///
    /// When the model is known the cost is computed from the price table.
    /// When it is not, any runtime-reported cost is trusted, else zero.
    pub fn from_raw(model: Option<Model>, raw: &RawUsage) -> Self {
        let cost_usd = match model {
            Some(m) => Self::cost_for(m, raw.input_tokens, raw.output_tokens),
            None => raw.total_cost_usd.unwrap_or(0.0),
        };
        Self {
            input_tokens: raw.input_tokens,
            output_tokens: raw.output_tokens,
            total_tokens: raw.input_tokens + raw.output_tokens,
            cache_read_tokens: raw.cache_read_input_tokens,
            cache_creation_tokens: raw.cache_creation_input_tokens,
            cost_usd,
        }
    }

    /// Fold another usage report into this accumulator.
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_creation_tokens += other.cache_creation_tokens;
        self.cost_usd += other.cost_usd;
    }
}

//─────────────────────────────
//  Status enums
//─────────────────────────────

/// Lifecycle status of an externally owned task row.
///
/// Only the orchestrator transitions
/// `queued → assigned → in_progress → {complete | failed | blocked}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in the backlog; the only admissible status.
    Queued,
    /// Picked by the scheduler, session not yet streaming.
    Assigned,
    /// A live session is working on it.
    InProgress,
    /// Parked on a blocker.
    Blocked,
    /// Finished successfully.
    Complete,
    /// Finished unsuccessfully.
    Failed,
}

impl TaskStatus {
    /// Whether a task in this status may be admitted by the scheduler.
    pub fn is_admissible(&self) -> bool {
        matches!(self, TaskStatus::Queued)
    }
}

/// Status of a project; only `active` projects contribute tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    /// Contributing tasks to the backlog.
    Active,
    /// Tasks are skipped in place while paused.
    Paused,
}

/// Category of a context entry, driving its compression strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextCategory {
    /// Task descriptions handed to agents.
    Task,
    /// Conversation history.
    History,
    /// Agent responses.
    Response,
    /// System context; effectively incompressible.
    System,
}

/// Resolution state of a per-task approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Awaiting operator response.
    Pending,
    /// Operator approved the task.
    Approved,
    /// Operator rejected the task.
    Rejected,
    /// Deadline elapsed with no response; never an implicit approval.
    Timeout,
}

/// Status of one agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Streaming events from the agent runtime.
    Running,
    /// Waiting on a human reply to an agent question.
    Blocked,
    /// Terminal: finished successfully.
    Complete,
    /// Terminal: finished unsuccessfully (includes cancellation).
    Failed,
}

impl SessionStatus {
    /// Terminal sessions accept no further events.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Complete | SessionStatus::Failed)
    }

    /// Sessions counted against capacity.
    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }
}

//─────────────────────────────
//  Records
//─────────────────────────────

/// Externally owned task row, as read from the task store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Task id, opaque and lexicographically ordered.
    pub id: TaskId,
    /// Owning project.
    pub project_id: ProjectId,
    /// One-line title.
    pub title: String,
    /// Free-form description; may be empty.
    #[serde(default)]
    pub description: String,
    /// Larger runs earlier.
    pub priority: i64,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Model the task prefers to run on, if any.
    #[serde(default)]
    pub preferred_model: Option<Model>,
    /// Estimated session token spend per model, used for cost previews.
    #[serde(default)]
    pub session_estimates: HashMap<Model, u64>,
    /// Acceptance criteria the agent is asked to satisfy.
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Task id this task is blocked on, if any.
    #[serde(default)]
    pub blocked_on: Option<TaskId>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last row update time.
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Estimated cost in USD of running this task on `model`.
    ///
    /// The session estimate is interpreted as a combined token figure split
    /// between input and output the way observed sessions split on average.
    pub fn estimated_cost(&self, model: Model) -> f64 {
        let tokens = self.session_estimates.get(&model).copied().unwrap_or(0);
        // Observed sessions skew roughly 3:1 input to output.
        let input = tokens * 3 / 4;
        let output = tokens - input;
        Usage::cost_for(model, input, output)
    }
}

/// Externally owned project row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRecord {
    /// Project id.
    pub id: ProjectId,
    /// Display name.
    pub name: String,
    /// Active or paused.
    pub status: ProjectStatus,
    /// Project-level priority; reserved for cross-project ordering.
    pub priority: i64,
}

/// One agent invocation, owned and mutated exclusively by the session manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Globally unique session id.
    pub id: SessionId,
    /// Task this session is executing.
    pub task_id: TaskId,
    /// Model the session runs on.
    pub model: Model,
    /// Current status.
    pub status: SessionStatus,
    /// Accumulated usage from result events.
    pub usage: Usage,
    /// Spawn time.
    pub started_at: DateTime<Utc>,
    /// Last adapter event time.
    pub last_activity: DateTime<Utc>,
}

//─────────────────────────────
//  Orchestrator configuration
//─────────────────────────────

/// Per-model concurrency limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacityLimits {
    /// Concurrent opus sessions.
    pub opus: usize,
    /// Concurrent sonnet sessions.
    pub sonnet: usize,
    /// Concurrent haiku sessions.
    pub haiku: usize,
}

impl CapacityLimits {
    /// Limit for one model.
    pub fn limit(&self, model: Model) -> usize {
        match model {
            Model::Opus => self.opus,
            Model::Sonnet => self.sonnet,
            Model::Haiku => self.haiku,
        }
    }

    /// Sum of all per-model limits.
    pub fn total(&self) -> usize {
        self.opus + self.sonnet + self.haiku
    }
}

impl Default for CapacityLimits {
    fn default() -> Self {
        Self {
            opus: 1,
            sonnet: 2,
            haiku: 2,
        }
    }
}

/// Configuration of the main control loop and its collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Interval between scheduling ticks.
    pub poll_interval_ms: u64,
    /// Consecutive DB-classified tick failures before entering degraded mode.
    pub max_consecutive_db_failures: u32,
    /// Bound on the graceful-shutdown wait for active sessions.
    pub graceful_shutdown_timeout_ms: u64,
    /// Whether startup runs the DB health probe before anything else.
    pub validate_database_on_startup: bool,
    /// Path of the state snapshot file.
    pub state_file_path: String,
    /// Per-model concurrency limits.
    pub capacity: CapacityLimits,
    /// Approval deadline for a single task.
    pub approval_timeout_ms: u64,
    /// Grace window between a session close request and the synthesized failure.
    pub session_close_grace_ms: u64,
    /// Bound on the operator-confirmation wait during pre-flight.
    pub confirmation_timeout_ms: u64,
    /// Skip the operator confirmation (development mode).
    pub skip_confirmation: bool,
    /// Retry budget for the startup DB health probe.
    pub db_startup_retries: u32,
    /// Directory agents are spawned in.
    pub workspace_root: String,
    /// Context window size in tokens.
    pub context_max_tokens: u64,
    /// Budget compression target as a fraction of the window.
    pub context_target_utilization: f64,
    /// Warn threshold as a fraction of the window.
    pub context_warn_utilization: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            max_consecutive_db_failures: 3,
            graceful_shutdown_timeout_ms: 30_000,
            validate_database_on_startup: true,
            state_file_path: "./trafficcontrol-state.json".to_string(),
            capacity: CapacityLimits::default(),
            approval_timeout_ms: 300_000,
            session_close_grace_ms: 5_000,
            confirmation_timeout_ms: 120_000,
            skip_confirmation: false,
            db_startup_retries: 5,
            workspace_root: ".".to_string(),
            context_max_tokens: 200_000,
            context_target_utilization: 0.5,
            context_warn_utilization: 0.4,
        }
    }
}

impl OrchestratorConfig {
    /// Interval between scheduling ticks as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Graceful-shutdown bound as a [`Duration`].
    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_shutdown_timeout_ms)
    }

    /// Approval deadline as a [`Duration`].
    pub fn approval_timeout(&self) -> Duration {
        Duration::from_millis(self.approval_timeout_ms)
    }

    /// Session close grace window as a [`Duration`].
    pub fn session_close_grace(&self) -> Duration {
        Duration::from_millis(self.session_close_grace_ms)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<(), TypeError> {
        if self.poll_interval_ms == 0 {
            return Err(TypeError::InvalidConfig("poll_interval_ms must be > 0".into()));
        }
        if self.capacity.total() == 0 {
            return Err(TypeError::InvalidConfig("all capacity limits are zero".into()));
        }
        if !(0.0..=1.0).contains(&self.context_target_utilization)
            || !(0.0..=1.0).contains(&self.context_warn_utilization)
        {
            return Err(TypeError::InvalidConfig(
                "context utilization thresholds must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors produced by this crate's constructors and parsers.
#[derive(Debug, thiserror::Error)]
pub enum TypeError {
    /// Model name not in the closed set.
    #[error("unknown model: {0}")]
    UnknownModel(String),
    /// Configuration failed cross-field validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
