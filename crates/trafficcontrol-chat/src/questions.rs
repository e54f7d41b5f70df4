//! Pending-question routing.
//!
//! When an agent asks a question, the router posts it to chat and remembers
//! the thread. The first reply in that thread is injected back into the
//! owning session; session termination drops the pending entry silently.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use trafficcontrol_agents::SessionManager;
use trafficcontrol_bus::{Event, EventBus, EventKind, EventPayload};
use trafficcontrol_types::{SessionId, TaskId};

use crate::commands::ThreadReplyHandler;
use crate::transport::{ChatTransport, OutboundMessage};

/// An agent question awaiting a human reply.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingQuestion {
    /// Session that asked.
    pub session_id: SessionId,
    /// Task the session is executing.
    pub task_id: TaskId,
    /// Chat thread carrying the question.
    pub thread_ts: String,
    /// Question text.
    pub question: String,
    /// When it was asked.
    pub asked_at: DateTime<Utc>,
}

/// Correlates agent questions with chat-thread replies.
pub struct QuestionRouter {
    channel_id: String,
    transport: Arc<dyn ChatTransport>,
    sessions: Arc<SessionManager>,
    pending: DashMap<SessionId, PendingQuestion>,
    threads: DashMap<String, SessionId>,
}

impl QuestionRouter {
    /// Create a router posting questions to `channel_id`.
    pub fn new(
        channel_id: String,
        transport: Arc<dyn ChatTransport>,
        sessions: Arc<SessionManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            channel_id,
            transport,
            sessions,
            pending: DashMap::new(),
            threads: DashMap::new(),
        })
    }

    /// Subscribe to agent events on `bus` and start the routing task.
    ///
    /// Bus handlers are synchronous, so they forward into a channel the
    /// routing task drains; chat sends happen off the emitter's stack.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) -> CancellationToken {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        for kind in [
            EventKind::AgentQuestion,
            EventKind::AgentCompleted,
            EventKind::AgentFailed,
        ] {
            let tx = tx.clone();
            bus.on(kind, move |event| {
                // Routing must never fail the emitter; a closed channel
                // just means the router is gone.
                let _ = tx.send(event.clone());
                Ok(())
            });
        }

        let cancel = CancellationToken::new();
        let router = Arc::clone(self);
        let stop = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    event = rx.recv() => {
                        let Some(event) = event else { break };
                        router.handle_event(event).await;
                    }
                }
            }
            debug!("question router stopped");
        });
        cancel
    }

    async fn handle_event(&self, event: Event) {
        match event.payload {
            EventPayload::AgentQuestion {
                session_id,
                task_id,
                question,
            } => {
                self.post_question(session_id, task_id, question).await;
            }
            EventPayload::AgentCompleted { session_id, .. }
            | EventPayload::AgentFailed { session_id, .. } => {
                self.drop_for_session(session_id);
            }
            _ => {}
        }
    }

    /// Post a question to chat and register the pending entry.
    pub async fn post_question(&self, session_id: SessionId, task_id: TaskId, question: String) {
        let text = format!(
            "Agent working on task {task_id} asks:\n> {question}\nReply in this thread to answer."
        );
        match self
            .transport
            .send(OutboundMessage::new(self.channel_id.clone(), text))
            .await
        {
            Ok(thread_ts) => {
                info!(%session_id, thread_ts, "agent question posted");
                self.threads.insert(thread_ts.clone(), session_id);
                self.pending.insert(
                    session_id,
                    PendingQuestion {
                        session_id,
                        task_id,
                        thread_ts,
                        question,
                        asked_at: Utc::now(),
                    },
                );
            }
            Err(error) => {
                // The agent stays blocked; the operator can still find the
                // question via the status command.
                warn!(%session_id, %error, "agent question could not be posted");
            }
        }
    }

    /// Drop any pending question for a terminated session.
    pub fn drop_for_session(&self, session_id: SessionId) {
        if let Some((_, pending)) = self.pending.remove(&session_id) {
            self.threads.remove(&pending.thread_ts);
            debug!(%session_id, "pending question dropped on session end");
        }
    }

    /// Number of questions awaiting replies.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Pending question for `session_id`, if any.
    pub fn pending_for(&self, session_id: SessionId) -> Option<PendingQuestion> {
        self.pending.get(&session_id).map(|entry| entry.clone())
    }
}

#[async_trait]
impl ThreadReplyHandler for QuestionRouter {
    async fn handle_thread_reply(&self, thread_ts: &str, text: &str, _user_id: &str) -> bool {
        let Some(session_id) = self.threads.get(thread_ts).map(|entry| *entry) else {
            return false;
        };
        match self.sessions.inject(session_id, text.to_string()).await {
            Ok(()) => {
                info!(%session_id, "operator reply injected into session");
            }
            Err(error) => {
                warn!(%session_id, %error, "reply could not be injected, dropping question");
            }
        }
        self.drop_for_session(session_id);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use trafficcontrol_agents::{
        CapacityTracker, ScriptStep, ScriptedClient, SdkAdapter, SessionScript,
        ASK_USER_QUESTION_TOOL,
    };
    use trafficcontrol_agents::adapter::{AgentMessage, QueryConfig};
    use trafficcontrol_types::{
        CapacityLimits, Model, ProjectId, RawUsage, SessionStatus, TaskRecord, TaskStatus,
    };

    use crate::transport::MemoryChatTransport;

    fn task(id: &str) -> TaskRecord {
        let now = Utc::now();
        TaskRecord {
            id: TaskId::from(id),
            project_id: ProjectId::from("proj-1"),
            title: format!("task {id}"),
            description: String::new(),
            priority: 1,
            status: TaskStatus::Queued,
            preferred_model: None,
            session_estimates: HashMap::new(),
            acceptance_criteria: vec![],
            blocked_on: None,
            created_at: now,
            updated_at: now,
        }
    }

    struct Harness {
        router: Arc<QuestionRouter>,
        manager: Arc<SessionManager>,
        client: Arc<ScriptedClient>,
        transport: Arc<MemoryChatTransport>,
        bus: Arc<EventBus>,
        _stop: CancellationToken,
    }

    fn harness() -> Harness {
        let bus = Arc::new(EventBus::default());
        let capacity = Arc::new(CapacityTracker::new(CapacityLimits::default(), bus.clone()));
        let client = Arc::new(ScriptedClient::new());
        let adapter = Arc::new(SdkAdapter::new(client.clone()));
        let manager = SessionManager::new(adapter, capacity, bus.clone(), Duration::from_secs(5));
        let transport = Arc::new(MemoryChatTransport::new());
        let router = QuestionRouter::new("C-ops".into(), transport.clone(), manager.clone());
        let stop = router.attach(&bus);
        Harness {
            router,
            manager,
            client,
            transport,
            bus,
            _stop: stop,
        }
    }

    fn question_script() -> SessionScript {
        SessionScript {
            steps: vec![
                ScriptStep::Emit(AgentMessage::ToolUse {
                    tool_id: "tu_1".into(),
                    tool_name: ASK_USER_QUESTION_TOOL.into(),
                    input: serde_json::json!({"questions": [{"question": "Deploy to prod?"}]}),
                }),
                ScriptStep::AwaitInjection,
                ScriptStep::Emit(AgentMessage::ResultSuccess {
                    text: "done".into(),
                    duration_ms: 1,
                    usage: RawUsage::default(),
                }),
            ],
            fail_start: false,
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn question_flows_to_chat_and_reply_unblocks_session() {
        let h = harness();
        h.client.push_script(question_script());

        let session = h
            .manager
            .spawn(&task("t-1"), Model::Sonnet, "go".into(), QueryConfig::for_model(Model::Sonnet))
            .await
            .unwrap();

        let router = h.router.clone();
        wait_until(|| router.pending_count() == 1).await;
        let posted = h.transport.last().unwrap();
        assert!(posted.text.contains("Deploy to prod?"));

        let handled = h
            .router
            .handle_thread_reply(&posted.ts, "yes, ship it", "U-ops")
            .await;
        assert!(handled);
        assert_eq!(h.router.pending_count(), 0);

        let manager = h.manager.clone();
        wait_until(move || {
            manager
                .get(session)
                .map_or(false, |s| s.status == SessionStatus::Complete)
        })
        .await;
        assert_eq!(h.client.injections(), vec![(session, "yes, ship it".to_string())]);
    }

    #[tokio::test]
    async fn unrelated_thread_replies_are_not_handled() {
        let h = harness();
        assert!(!h.router.handle_thread_reply("999.000001", "hello", "U-x").await);
    }

    #[tokio::test]
    async fn session_end_drops_pending_question() {
        let h = harness();
        h.client.push_script(SessionScript {
            steps: vec![
                ScriptStep::Emit(AgentMessage::ToolUse {
                    tool_id: "tu_1".into(),
                    tool_name: ASK_USER_QUESTION_TOOL.into(),
                    input: serde_json::json!({"questions": [{"question": "Still there?"}]}),
                }),
                ScriptStep::Emit(AgentMessage::ResultError {
                    errors: vec!["gave up".into()],
                    usage: RawUsage::default(),
                }),
            ],
            fail_start: false,
        });

        h.manager
            .spawn(&task("t-1"), Model::Haiku, "go".into(), QueryConfig::for_model(Model::Haiku))
            .await
            .unwrap();

        let router = h.router.clone();
        let bus = h.bus.clone();
        wait_until(move || {
            !bus.history(Some(EventKind::AgentFailed)).is_empty() && router.pending_count() == 0
        })
        .await;
        assert_eq!(h.router.pending_count(), 0);
    }
}
