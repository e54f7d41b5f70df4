#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **trafficcontrol-store** – Task-store abstraction for TrafficControl.
//!
//! This crate defines the contract over the externally owned row store the
//! orchestrator reads its backlog from and writes task state back into. It
//! deliberately contains no storage-engine semantics: the backing system may
//! be any transactional row store exposing this interface.
//!
//! The in-memory driver in [`memory`] backs the test suites and development
//! mode. All data is lost when the process terminates.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use trafficcontrol_types::{
    ApprovalStatus, Model, ProjectRecord, ProjectStatus, SessionId, TaskId, TaskRecord,
    TaskStatus, Usage,
};

pub mod memory;

pub use memory::MemoryTaskStore;

//─────────────────────────────
//  Approval log rows
//─────────────────────────────

/// One resolved approval, persisted best-effort for auditing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalLogEntry {
    /// Task the approval gated.
    pub task_id: TaskId,
    /// Final resolution.
    pub status: ApprovalStatus,
    /// User who resolved it, if any.
    pub responder: Option<String>,
    /// Free-form reason, if any.
    pub reason: Option<String>,
    /// Resolution time.
    pub decided_at: DateTime<Utc>,
}

//─────────────────────────────
//  Store contract
//─────────────────────────────

/// Contract over the external task row store.
///
/// Ordering guarantee: task listings are returned by priority descending,
/// then creation time ascending. Failures propagate as [`StoreError`]; the
/// main loop classifies them for degraded-mode handling.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// List projects in `status`.
    async fn list_projects(&self, status: ProjectStatus) -> Result<Vec<ProjectRecord>, StoreError>;

    /// List tasks in `status`, ordered (priority desc, created_at asc).
    async fn list_tasks(&self, status: TaskStatus) -> Result<Vec<TaskRecord>, StoreError>;

    /// Read a single task row.
    async fn get_task(&self, id: &TaskId) -> Result<Option<TaskRecord>, StoreError>;

    /// Move a task to `status`.
    async fn update_task_status(&self, id: &TaskId, status: TaskStatus) -> Result<(), StoreError>;

    /// Record or clear the session/model assignment of a task.
    async fn update_task_assignment(
        &self,
        id: &TaskId,
        session: Option<SessionId>,
        model: Option<Model>,
    ) -> Result<(), StoreError>;

    /// Fold a session's usage into the task's usage counters.
    async fn update_task_usage(&self, id: &TaskId, usage: &Usage) -> Result<(), StoreError>;

    /// Delete a task row.
    async fn delete_task(&self, id: &TaskId) -> Result<(), StoreError>;

    /// Append an approval outcome to the approval log. Best-effort for
    /// callers; an error here must not fail the approval itself.
    async fn record_approval(&self, entry: &ApprovalLogEntry) -> Result<(), StoreError>;

    /// Cheap liveness probe used by startup validation and degraded-mode
    /// recovery.
    async fn health_check(&self) -> Result<(), StoreError>;
}

//─────────────────────────────
//  Error types
//─────────────────────────────

/// Errors surfaced by task-store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The referenced row does not exist.
    #[error("row not found: {0}")]
    NotFound(String),
    /// The backing store is unreachable or unhealthy.
    #[error("database unavailable: {0}")]
    Unavailable(String),
    /// Any other backend failure.
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether this error should count toward degraded-mode entry.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}
