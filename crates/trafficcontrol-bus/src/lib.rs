#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **trafficcontrol-bus** – Typed event bus for TrafficControl.
//!
//! This crate provides the single-process publish/subscribe fabric every
//! runtime component communicates over. It is deliberately synchronous:
//! `emit` fans an event out to every matching subscriber before returning,
//! in registration order, with handler failures isolated from one another.
//!
//! A bounded ring buffer retains the most recent events for the dashboard
//! and the chat `status` command. Pattern subscribers match the textual
//! event kind (`"agent:completed"`, `"database:degraded"`, …) against a
//! regular expression and run after all typed subscribers for the same
//! event.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use trafficcontrol_types::{Model, SessionId, TaskId, Usage};

/// Default number of events retained in the history ring.
pub const DEFAULT_HISTORY_SIZE: usize = 100;

//─────────────────────────────
//  Event kinds and payloads
//─────────────────────────────

/// Closed set of event kinds carried by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// A session was spawned for a task.
    AgentSpawned,
    /// An agent asked the operator a question.
    AgentQuestion,
    /// A session became blocked waiting on a human.
    AgentBlocked,
    /// A session finished successfully.
    AgentCompleted,
    /// A session finished unsuccessfully.
    AgentFailed,
    /// A task entered the backlog.
    TaskQueued,
    /// A task was assigned to a session.
    TaskAssigned,
    /// A task reached a terminal status.
    TaskCompleted,
    /// A model transitioned from full back to available.
    CapacityAvailable,
    /// A model transitioned from available to full.
    CapacityExhausted,
    /// The database health probe succeeded.
    DatabaseHealthy,
    /// Repeated database failures put the loop into degraded mode.
    DatabaseDegraded,
    /// The database recovered from degraded mode.
    DatabaseRecovered,
    /// The orchestrator started.
    SystemStarted,
    /// The orchestrator stopped.
    SystemStopped,
    /// An isolated component error.
    SystemError,
    /// An inbound chat message was received.
    ChatIn,
    /// An outbound chat message was sent.
    ChatOut,
    /// Pre-flight backlog validation completed.
    BacklogValidated,
}

impl EventKind {
    /// Textual name, the form pattern subscribers match against.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::AgentSpawned => "agent:spawned",
            EventKind::AgentQuestion => "agent:question",
            EventKind::AgentBlocked => "agent:blocked",
            EventKind::AgentCompleted => "agent:completed",
            EventKind::AgentFailed => "agent:failed",
            EventKind::TaskQueued => "task:queued",
            EventKind::TaskAssigned => "task:assigned",
            EventKind::TaskCompleted => "task:completed",
            EventKind::CapacityAvailable => "capacity:available",
            EventKind::CapacityExhausted => "capacity:exhausted",
            EventKind::DatabaseHealthy => "database:healthy",
            EventKind::DatabaseDegraded => "database:degraded",
            EventKind::DatabaseRecovered => "database:recovered",
            EventKind::SystemStarted => "system:started",
            EventKind::SystemStopped => "system:stopped",
            EventKind::SystemError => "system:error",
            EventKind::ChatIn => "chat:in",
            EventKind::ChatOut => "chat:out",
            EventKind::BacklogValidated => "backlog:validated",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Statically typed payload, one variant per [`EventKind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum EventPayload {
    /// A session was spawned for a task.
    AgentSpawned {
        /// The new session.
        session_id: SessionId,
        /// The task it executes.
        task_id: TaskId,
        /// The model it runs on.
        model: Model,
    },
    /// An agent asked the operator a question.
    AgentQuestion {
        /// The asking session.
        session_id: SessionId,
        /// The task it executes.
        task_id: TaskId,
        /// First question text from the tool call.
        question: String,
    },
    /// A session became blocked waiting on a human.
    AgentBlocked {
        /// The blocked session.
        session_id: SessionId,
        /// The task it executes.
        task_id: TaskId,
        /// Why it is blocked.
        reason: String,
    },
    /// A session finished successfully.
    AgentCompleted {
        /// The finished session.
        session_id: SessionId,
        /// The task it executed.
        task_id: TaskId,
        /// Final response text.
        final_text: String,
        /// Wall-clock duration of the run.
        duration_ms: u64,
        /// Normalized usage for the run.
        usage: Usage,
    },
    /// A session finished unsuccessfully.
    AgentFailed {
        /// The failed session.
        session_id: SessionId,
        /// The task it executed.
        task_id: TaskId,
        /// Error descriptions, most significant first.
        errors: Vec<String>,
        /// Normalized usage up to the failure.
        usage: Usage,
    },
    /// A task entered the backlog.
    TaskQueued {
        /// The queued task.
        task_id: TaskId,
    },
    /// A task was assigned to a session.
    TaskAssigned {
        /// The assigned task.
        task_id: TaskId,
        /// The session executing it.
        session_id: SessionId,
        /// The model chosen for it.
        model: Model,
    },
    /// A task reached a terminal status.
    TaskCompleted {
        /// The finished task.
        task_id: TaskId,
        /// Whether it completed successfully.
        success: bool,
    },
    /// A model transitioned from full back to available.
    CapacityAvailable {
        /// The model with fresh capacity.
        model: Model,
    },
    /// A model transitioned from available to full.
    CapacityExhausted {
        /// The saturated model.
        model: Model,
    },
    /// The database health probe succeeded.
    DatabaseHealthy,
    /// Repeated database failures put the loop into degraded mode.
    DatabaseDegraded {
        /// Last observed database error.
        error: String,
    },
    /// The database recovered from degraded mode.
    DatabaseRecovered,
    /// The orchestrator started.
    SystemStarted,
    /// The orchestrator stopped.
    SystemStopped,
    /// An isolated component error.
    SystemError {
        /// Component or operation that failed.
        source: String,
        /// Error description.
        message: String,
    },
    /// An inbound chat message was received.
    ChatIn {
        /// Sending user.
        user_id: String,
        /// Message text.
        text: String,
        /// Thread the message belongs to, if any.
        thread_ts: Option<String>,
    },
    /// An outbound chat message was sent.
    ChatOut {
        /// Destination channel.
        channel: String,
        /// Message text.
        text: String,
        /// Thread the message was posted into, if any.
        thread_ts: Option<String>,
    },
    /// Pre-flight backlog validation completed.
    BacklogValidated {
        /// Number of warnings reported.
        warnings: usize,
        /// Number of hard errors reported.
        errors: usize,
    },
}

impl EventPayload {
    /// The kind tag of this payload.
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::AgentSpawned { .. } => EventKind::AgentSpawned,
            EventPayload::AgentQuestion { .. } => EventKind::AgentQuestion,
            EventPayload::AgentBlocked { .. } => EventKind::AgentBlocked,
            EventPayload::AgentCompleted { .. } => EventKind::AgentCompleted,
            EventPayload::AgentFailed { .. } => EventKind::AgentFailed,
            EventPayload::TaskQueued { .. } => EventKind::TaskQueued,
            EventPayload::TaskAssigned { .. } => EventKind::TaskAssigned,
            EventPayload::TaskCompleted { .. } => EventKind::TaskCompleted,
            EventPayload::CapacityAvailable { .. } => EventKind::CapacityAvailable,
            EventPayload::CapacityExhausted { .. } => EventKind::CapacityExhausted,
            EventPayload::DatabaseHealthy => EventKind::DatabaseHealthy,
            EventPayload::DatabaseDegraded { .. } => EventKind::DatabaseDegraded,
            EventPayload::DatabaseRecovered => EventKind::DatabaseRecovered,
            EventPayload::SystemStarted => EventKind::SystemStarted,
            EventPayload::SystemStopped => EventKind::SystemStopped,
            EventPayload::SystemError { .. } => EventKind::SystemError,
            EventPayload::ChatIn { .. } => EventKind::ChatIn,
            EventPayload::ChatOut { .. } => EventKind::ChatOut,
            EventPayload::BacklogValidated { .. } => EventKind::BacklogValidated,
        }
    }
}

/// Immutable event record as delivered to subscribers and kept in history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event id.
    pub id: Uuid,
    /// Typed payload.
    pub payload: EventPayload,
    /// Emit time.
    pub timestamp: DateTime<Utc>,
    /// Correlation id linking related events, if any.
    pub correlation_id: Option<Uuid>,
}

impl Event {
    /// Create an event record for `payload`, stamped now.
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            timestamp: Utc::now(),
            correlation_id: None,
        }
    }

    /// Attach a correlation id.
    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// The kind tag of this event.
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Wall-clock age of this event.
    pub fn age(&self) -> Duration {
        (Utc::now() - self.timestamp).to_std().unwrap_or(Duration::ZERO)
    }
}

//─────────────────────────────
//  Bus
//─────────────────────────────

/// Handle returned by `on`/`on_pattern`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

struct BusInner {
    next_subscription: u64,
    typed: HashMap<EventKind, Vec<(SubscriptionId, Handler)>>,
    patterns: Vec<(SubscriptionId, Regex, Handler)>,
    history: VecDeque<Event>,
    history_size: usize,
    destroyed: bool,
}

/// Synchronous, in-process event bus.
///
/// Fan-out is performed on the emitting thread or task: all typed handlers
/// run in registration order, then all matching pattern handlers, before
/// `emit` returns. A handler returning an error is logged, re-emitted as
/// `system:error`, and never prevents later handlers from running.
pub struct EventBus {
    inner: Mutex<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_SIZE)
    }
}

impl EventBus {
    /// Create a bus retaining up to `history_size` events.
    pub fn new(history_size: usize) -> Self {
        Self {
            inner: Mutex::new(BusInner {
                next_subscription: 0,
                typed: HashMap::new(),
                patterns: Vec::new(),
                history: VecDeque::with_capacity(history_size),
                history_size,
                destroyed: false,
            }),
        }
    }

    /// Subscribe to one event kind. Handlers run in registration order.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        let id = SubscriptionId(inner.next_subscription);
        inner.next_subscription += 1;
        inner.typed.entry(kind).or_default().push((id, Arc::new(handler)));
        id
    }

    /// Subscribe to every event whose kind name matches `pattern`.
    ///
    /// Pattern handlers run after all typed handlers for the same event.
    pub fn on_pattern<F>(&self, pattern: &str, handler: F) -> Result<SubscriptionId, BusError>
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let regex = Regex::new(pattern)
            .map_err(|e| BusError::InvalidPattern(pattern.to_string(), e.to_string()))?;
        let mut inner = self.lock();
        let id = SubscriptionId(inner.next_subscription);
        inner.next_subscription += 1;
        inner.patterns.push((id, regex, Arc::new(handler)));
        Ok(id)
    }

    /// Remove a subscription. Unknown ids are a no-op.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut inner = self.lock();
        for handlers in inner.typed.values_mut() {
            handlers.retain(|(hid, _)| *hid != id);
        }
        inner.patterns.retain(|(pid, _, _)| *pid != id);
    }

    /// Emit `payload` to every matching subscriber and record it in history.
    ///
    /// Returns the event record that was delivered.
    pub fn emit(&self, payload: EventPayload) -> Event {
        self.emit_event(Event::new(payload))
    }

    /// Emit a pre-built event record (used to carry a correlation id).
    pub fn emit_event(&self, event: Event) -> Event {
        let kind = event.kind();
        let handlers: Vec<Handler> = {
            let mut inner = self.lock();
            if inner.destroyed {
                return event;
            }
            if inner.history.len() == inner.history_size {
                inner.history.pop_front();
            }
            if inner.history_size > 0 {
                inner.history.push_back(event.clone());
            }
            let mut matched: Vec<Handler> = inner
                .typed
                .get(&kind)
                .map(|hs| hs.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default();
            matched.extend(
                inner
                    .patterns
                    .iter()
                    .filter(|(_, regex, _)| regex.is_match(kind.as_str()))
                    .map(|(_, _, h)| h.clone()),
            );
            matched
        };

        let mut failures = Vec::new();
        for handler in &handlers {
            if let Err(error) = handler(&event) {
                warn!(kind = %kind, %error, "event handler failed");
                failures.push(error);
            }
        }

        // Handler failures on the error channel itself are only logged,
        // otherwise a failing error handler would recurse forever.
        if kind != EventKind::SystemError {
            for error in failures {
                self.emit(EventPayload::SystemError {
                    source: format!("handler:{kind}"),
                    message: error.to_string(),
                });
            }
        }

        debug!(kind = %kind, subscribers = handlers.len(), "event emitted");
        event
    }

    /// Most recent events, oldest first, optionally filtered by kind.
    pub fn history(&self, filter: Option<EventKind>) -> Vec<Event> {
        let inner = self.lock();
        inner
            .history
            .iter()
            .filter(|e| filter.map_or(true, |k| e.kind() == k))
            .cloned()
            .collect()
    }

    /// Number of live subscriptions, typed and pattern combined.
    pub fn subscriber_count(&self) -> usize {
        let inner = self.lock();
        inner.typed.values().map(Vec::len).sum::<usize>() + inner.patterns.len()
    }

    /// Drop all subscribers and clear history. Idempotent; emits after
    /// `destroy` are silently discarded.
    pub fn destroy(&self) {
        let mut inner = self.lock();
        inner.typed.clear();
        inner.patterns.clear();
        inner.history.clear();
        inner.destroyed = true;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusInner> {
        // A poisoned bus lock means a panic mid-registration; the bus state
        // itself is still consistent for read/append operations.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

//─────────────────────────────
//  Error types
//─────────────────────────────

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Pattern subscription received an invalid regular expression.
    #[error("invalid subscription pattern {0:?}: {1}")]
    InvalidPattern(String, String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn task_queued(id: &str) -> EventPayload {
        EventPayload::TaskQueued {
            task_id: TaskId::from(id),
        }
    }

    #[test]
    fn delivers_to_typed_subscriber_with_identical_payload() {
        let bus = EventBus::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        bus.on(EventKind::TaskQueued, move |event| {
            seen_clone.lock().unwrap().push(event.payload.clone());
            Ok(())
        });

        let emitted = bus.emit(task_queued("t-1"));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], emitted.payload);
    }

    #[test]
    fn handlers_run_in_registration_order_then_patterns() {
        let bus = EventBus::default();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        bus.on_pattern("^task:", move |_| {
            o.lock().unwrap().push("pattern");
            Ok(())
        })
        .unwrap();
        let o = order.clone();
        bus.on(EventKind::TaskQueued, move |_| {
            o.lock().unwrap().push("first");
            Ok(())
        });
        let o = order.clone();
        bus.on(EventKind::TaskQueued, move |_| {
            o.lock().unwrap().push("second");
            Ok(())
        });

        bus.emit(task_queued("t-1"));
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "pattern"]);
    }

    #[test]
    fn failing_handler_is_isolated_and_reported() {
        let bus = EventBus::default();
        let later_ran = Arc::new(AtomicUsize::new(0));
        let errors_seen = Arc::new(AtomicUsize::new(0));

        bus.on(EventKind::TaskQueued, |_| anyhow::bail!("boom"));
        let later = later_ran.clone();
        bus.on(EventKind::TaskQueued, move |_| {
            later.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let errors = errors_seen.clone();
        bus.on(EventKind::SystemError, move |event| {
            if let EventPayload::SystemError { message, .. } = &event.payload {
                assert!(message.contains("boom"));
            }
            errors.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit(task_queued("t-1"));

        assert_eq!(later_ran.load(Ordering::SeqCst), 1);
        assert_eq!(errors_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_error_handler_does_not_recurse() {
        let bus = EventBus::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        bus.on(EventKind::SystemError, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("error handler itself fails")
        });

        bus.emit(EventPayload::SystemError {
            source: "test".into(),
            message: "original".into(),
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn history_is_bounded_and_newest_last() {
        let bus = EventBus::new(100);
        for i in 0..10_000u32 {
            bus.emit(task_queued(&format!("t-{i}")));
        }

        let history = bus.history(None);
        assert_eq!(history.len(), 100);
        match &history.last().unwrap().payload {
            EventPayload::TaskQueued { task_id } => assert_eq!(task_id.0, "t-9999"),
            other => panic!("unexpected payload: {other:?}"),
        }
        match &history[0].payload {
            EventPayload::TaskQueued { task_id } => assert_eq!(task_id.0, "t-9900"),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn history_filter_by_kind() {
        let bus = EventBus::default();
        bus.emit(task_queued("t-1"));
        bus.emit(EventPayload::DatabaseHealthy);
        bus.emit(task_queued("t-2"));

        assert_eq!(bus.history(Some(EventKind::TaskQueued)).len(), 2);
        assert_eq!(bus.history(Some(EventKind::DatabaseHealthy)).len(), 1);
        assert_eq!(bus.history(None).len(), 3);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let sub = bus.on(EventKind::TaskQueued, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit(task_queued("t-1"));
        bus.unsubscribe(sub);
        bus.emit(task_queued("t-2"));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn destroy_is_idempotent_and_silences_emits() {
        let bus = EventBus::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        bus.on(EventKind::TaskQueued, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.destroy();
        bus.destroy();
        bus.emit(task_queued("t-1"));

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(bus.history(None).is_empty());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let bus = EventBus::default();
        assert!(bus.on_pattern("(unclosed", |_| Ok(())).is_err());
    }

    #[test]
    fn correlation_id_survives_delivery() {
        let bus = EventBus::default();
        let correlation = Uuid::new_v4();
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        bus.on(EventKind::TaskQueued, move |event| {
            *s.lock().unwrap() = event.correlation_id;
            Ok(())
        });

        bus.emit_event(Event::new(task_queued("t-1")).with_correlation(correlation));
        assert_eq!(*seen.lock().unwrap(), Some(correlation));
    }
}
