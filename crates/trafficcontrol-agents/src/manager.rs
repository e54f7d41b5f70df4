//! Session lifecycle management.
//!
//! The manager is the only component that mutates session records. It
//! reserves capacity before asking the adapter to start, pumps the
//! normalized message stream into bus events, and guarantees that capacity
//! is released exactly once per session no matter how the session ends.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use trafficcontrol_bus::{EventBus, EventPayload};
use trafficcontrol_types::{
    Model, RawUsage, SessionId, SessionRecord, SessionStatus, TaskId, TaskRecord, Usage,
};

use crate::adapter::{AgentAdapter, AgentMessage, QueryConfig, QueryControl};
use crate::capacity::{CapacityError, CapacityTracker};
use crate::ASK_USER_QUESTION_TOOL;

/// Errors raised by session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// No capacity on the requested model.
    #[error(transparent)]
    Capacity(#[from] CapacityError),
    /// The adapter failed to start the runtime.
    #[error("adapter failed to start session: {0}")]
    AdapterStart(String),
    /// The session id is unknown or already terminal.
    #[error("unknown or finished session: {0}")]
    UnknownSession(SessionId),
    /// Injection into the running session failed.
    #[error("failed to inject into session {0}")]
    InjectFailed(SessionId),
}

/// Counters accumulated over the lifetime of the manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    /// Sessions spawned successfully.
    pub sessions_started: u64,
    /// Sessions that completed.
    pub sessions_completed: u64,
    /// Sessions that failed, including cancellations.
    pub sessions_failed: u64,
    /// Tokens consumed across all sessions.
    pub total_tokens: u64,
    /// Cost in USD across all sessions.
    pub total_cost_usd: f64,
}

enum TerminalOutcome {
    Completed {
        text: String,
        duration_ms: u64,
        raw: RawUsage,
    },
    Failed {
        errors: Vec<String>,
        raw: RawUsage,
    },
}

/// Owns running sessions and maps adapter messages to domain events.
pub struct SessionManager {
    sessions: DashMap<SessionId, SessionRecord>,
    controls: DashMap<SessionId, QueryControl>,
    /// Sessions with a close request in flight; their stream ending counts
    /// as a cancellation, not an unexpected stream loss.
    closing: DashMap<SessionId, ()>,
    adapter: Arc<dyn AgentAdapter>,
    capacity: Arc<CapacityTracker>,
    bus: Arc<EventBus>,
    close_grace: Duration,
    stats: Mutex<RunStats>,
}

impl SessionManager {
    /// Create a manager wired to `adapter`, `capacity` and `bus`.
    ///
    /// `close_grace` bounds the wait between a close request and the
    /// synthesized cancellation failure.
    pub fn new(
        adapter: Arc<dyn AgentAdapter>,
        capacity: Arc<CapacityTracker>,
        bus: Arc<EventBus>,
        close_grace: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            controls: DashMap::new(),
            closing: DashMap::new(),
            adapter,
            capacity,
            bus,
            close_grace,
            stats: Mutex::new(RunStats::default()),
        })
    }

    /// Spawn a session for `task` on `model`.
    ///
    /// Capacity is reserved before the adapter is called; if the adapter
    /// fails to start, the reservation is released and `agent:failed` is
    /// emitted before the error returns.
    #[instrument(skip(self, task, prompt, config), fields(task_id = %task.id, model = %model))]
    pub async fn spawn(
        self: &Arc<Self>,
        task: &TaskRecord,
        model: Model,
        prompt: String,
        config: QueryConfig,
    ) -> Result<SessionId, SessionError> {
        let session_id = SessionId::new();
        self.capacity.reserve(model, session_id)?;

        let mut query = match self.adapter.start_query(session_id, &prompt, &config).await {
            Ok(query) => query,
            Err(error) => {
                self.capacity.release(model, session_id);
                self.bus.emit(EventPayload::AgentFailed {
                    session_id,
                    task_id: task.id.clone(),
                    errors: vec![format!("adapter start failed: {error}")],
                    usage: Usage::default(),
                });
                return Err(SessionError::AdapterStart(error.to_string()));
            }
        };

        let now = Utc::now();
        self.sessions.insert(
            session_id,
            SessionRecord {
                id: session_id,
                task_id: task.id.clone(),
                model,
                status: SessionStatus::Running,
                usage: Usage::default(),
                started_at: now,
                last_activity: now,
            },
        );
        self.controls.insert(session_id, query.control());
        {
            let mut stats = self.lock_stats();
            stats.sessions_started += 1;
        }
        info!(%session_id, "agent session spawned");
        self.bus.emit(EventPayload::AgentSpawned {
            session_id,
            task_id: task.id.clone(),
            model,
        });

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(message) = query.next().await {
                if manager.handle_message(session_id, message) {
                    return;
                }
            }
            // Stream ended without a terminal event; the session must not
            // hold capacity forever. A stream that ends because close was
            // requested is a cancellation.
            let reason = if manager.closing.contains_key(&session_id) {
                "cancelled"
            } else {
                "agent stream closed unexpectedly"
            };
            manager.finalize(
                session_id,
                TerminalOutcome::Failed {
                    errors: vec![reason.to_string()],
                    raw: RawUsage::default(),
                },
            );
        });

        Ok(session_id)
    }

    /// Feed operator text into a live session.
    ///
    /// A blocked session transitions back to running.
    pub async fn inject(&self, session_id: SessionId, text: String) -> Result<(), SessionError> {
        let control = self
            .controls
            .get(&session_id)
            .map(|entry| entry.value().clone())
            .ok_or(SessionError::UnknownSession(session_id))?;
        control
            .inject(text)
            .await
            .map_err(|_| SessionError::InjectFailed(session_id))?;
        if let Some(mut session) = self.sessions.get_mut(&session_id) {
            if session.status == SessionStatus::Blocked {
                session.status = SessionStatus::Running;
                debug!(%session_id, "session unblocked by injected reply");
            }
            session.last_activity = Utc::now();
        }
        Ok(())
    }

    /// Request shutdown of a live session.
    ///
    /// If no terminal event arrives within the grace window, an
    /// `agent:failed` with reason `cancelled` is synthesized.
    #[instrument(skip(self))]
    pub async fn close(self: &Arc<Self>, session_id: SessionId) -> Result<(), SessionError> {
        let control = self
            .controls
            .get(&session_id)
            .map(|entry| entry.value().clone())
            .ok_or(SessionError::UnknownSession(session_id))?;
        self.closing.insert(session_id, ());
        control.close();

        let manager = Arc::clone(self);
        let grace = self.close_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let synthesized = manager.finalize(
                session_id,
                TerminalOutcome::Failed {
                    errors: vec!["cancelled".to_string()],
                    raw: RawUsage::default(),
                },
            );
            if synthesized {
                warn!(%session_id, "session force-failed after close grace window");
            }
        });
        Ok(())
    }

    /// Close every live session. Used by graceful shutdown.
    pub async fn close_all(self: &Arc<Self>) {
        let live: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| entry.status.is_live())
            .map(|entry| entry.id)
            .collect();
        for session_id in live {
            let _ = self.close(session_id).await;
        }
    }

    /// Snapshot of one session.
    pub fn get(&self, session_id: SessionId) -> Option<SessionRecord> {
        self.sessions.get(&session_id).map(|entry| entry.clone())
    }

    /// Snapshots of all live (running or blocked) sessions.
    pub fn active(&self) -> Vec<SessionRecord> {
        self.sessions
            .iter()
            .filter(|entry| entry.status.is_live())
            .map(|entry| entry.clone())
            .collect()
    }

    /// `(session, model)` pairs for all live sessions; capacity ground truth.
    pub fn live_models(&self) -> Vec<(SessionId, Model)> {
        self.sessions
            .iter()
            .filter(|entry| entry.status.is_live())
            .map(|entry| (entry.id, entry.model))
            .collect()
    }

    /// Whether any session is still live.
    pub fn has_live_sessions(&self) -> bool {
        self.sessions.iter().any(|entry| entry.status.is_live())
    }

    /// Lifetime counters.
    pub fn stats(&self) -> RunStats {
        *self.lock_stats()
    }

    /// Translate one adapter message. Returns true on a terminal message.
    fn handle_message(&self, session_id: SessionId, message: AgentMessage) -> bool {
        match message {
            AgentMessage::ToolUse {
                tool_id,
                tool_name,
                input,
            } => {
                if tool_name == ASK_USER_QUESTION_TOOL {
                    self.handle_question(session_id, &input);
                } else {
                    debug!(%session_id, tool_id, tool_name, "tool call");
                    self.touch(session_id);
                }
                false
            }
            AgentMessage::ToolProgress {
                tool_id,
                tool_name,
                elapsed_secs,
            } => {
                debug!(%session_id, tool_id, tool_name, elapsed_secs, "tool progress");
                self.touch(session_id);
                false
            }
            AgentMessage::ResultSuccess {
                text,
                duration_ms,
                usage,
            } => self.finalize(
                session_id,
                TerminalOutcome::Completed {
                    text,
                    duration_ms,
                    raw: usage,
                },
            ),
            AgentMessage::ResultError { errors, usage } => self.finalize(
                session_id,
                TerminalOutcome::Failed { errors, raw: usage },
            ),
            AgentMessage::System { subtype } => {
                debug!(%session_id, subtype, "adapter system message suppressed");
                false
            }
        }
    }

    fn handle_question(&self, session_id: SessionId, input: &serde_json::Value) {
        let question = first_question_text(input);
        let task_id = match self.sessions.get_mut(&session_id) {
            Some(mut session) => {
                if session.status.is_terminal() {
                    warn!(%session_id, "question from terminal session ignored");
                    return;
                }
                session.status = SessionStatus::Blocked;
                session.last_activity = Utc::now();
                session.task_id.clone()
            }
            None => return,
        };
        info!(%session_id, question, "agent asked the operator a question");
        self.bus.emit(EventPayload::AgentQuestion {
            session_id,
            task_id: task_id.clone(),
            question,
        });
        self.bus.emit(EventPayload::AgentBlocked {
            session_id,
            task_id,
            reason: "awaiting operator reply".to_string(),
        });
    }

    fn touch(&self, session_id: SessionId) {
        if let Some(mut session) = self.sessions.get_mut(&session_id) {
            session.last_activity = Utc::now();
        }
    }

    /// Apply a terminal outcome exactly once.
    ///
    /// Returns true if this call performed the transition; false when the
    /// session is unknown or already terminal. All side effects (capacity
    /// release, stats, bus events) run outside the record lock.
    fn finalize(&self, session_id: SessionId, outcome: TerminalOutcome) -> bool {
        let (task_id, model, usage, event) = {
            let mut session = match self.sessions.get_mut(&session_id) {
                Some(session) => session,
                None => return false,
            };
            if session.status.is_terminal() {
                return false;
            }
            let (status, usage, event) = match outcome {
                TerminalOutcome::Completed {
                    text,
                    duration_ms,
                    raw,
                } => {
                    let usage = self.adapter.extract_usage(session_id, Some(session.model), &raw);
                    (
                        SessionStatus::Complete,
                        usage,
                        EventPayload::AgentCompleted {
                            session_id,
                            task_id: session.task_id.clone(),
                            final_text: text,
                            duration_ms,
                            usage,
                        },
                    )
                }
                TerminalOutcome::Failed { errors, raw } => {
                    let usage = self.adapter.extract_usage(session_id, Some(session.model), &raw);
                    (
                        SessionStatus::Failed,
                        usage,
                        EventPayload::AgentFailed {
                            session_id,
                            task_id: session.task_id.clone(),
                            errors,
                            usage,
                        },
                    )
                }
            };
            session.status = status;
            session.usage.add(&usage);
            session.last_activity = Utc::now();
            (session.task_id.clone(), session.model, usage, event)
        };

        self.controls.remove(&session_id);
        self.closing.remove(&session_id);
        self.capacity.release(model, session_id);
        {
            let mut stats = self.lock_stats();
            match event {
                EventPayload::AgentCompleted { .. } => stats.sessions_completed += 1,
                _ => stats.sessions_failed += 1,
            }
            stats.total_tokens += usage.total_tokens;
            stats.total_cost_usd += usage.cost_usd;
        }
        info!(%session_id, task_id = %task_id, ?model, "session reached terminal state");
        self.bus.emit(event);
        true
    }

    fn lock_stats(&self) -> std::sync::MutexGuard<'_, RunStats> {
        self.stats.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Pull the first question text out of an `AskUserQuestion` tool input.
fn first_question_text(input: &serde_json::Value) -> String {
    input
        .get("questions")
        .and_then(|qs| qs.get(0))
        .and_then(|q| q.get("question"))
        .and_then(|q| q.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| input.to_string())
}
