//! Inbound message dispatch and operator commands.
//!
//! Inbound chat arrives from the deployment's transport integration and is
//! routed here: threaded replies go to whichever handler claims the thread
//! (question router, approval controller, startup confirmation), top-level
//! messages are interpreted as `status` / `tasks` / `help` commands.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use trafficcontrol_bus::{EventBus, EventPayload};

use crate::approval::ApprovalController;
use crate::transport::{ChatTransport, OutboundMessage};

/// A component that may claim replies in chat threads it owns.
#[async_trait]
pub trait ThreadReplyHandler: Send + Sync {
    /// Handle a reply in `thread_ts`. Returns whether the thread was
    /// claimed; unclaimed replies fall through to the next handler.
    async fn handle_thread_reply(&self, thread_ts: &str, text: &str, user_id: &str) -> bool;
}

/// Live orchestrator state rendered for operator commands.
#[async_trait]
pub trait StatusSource: Send + Sync {
    /// One-paragraph status summary for the `status` command.
    async fn status_text(&self) -> String;
    /// Backlog and active-session listing for the `tasks` command.
    async fn tasks_text(&self) -> String;
}

const HELP_TEXT: &str = "Commands: `status` (loop and capacity summary), \
`tasks` (backlog and active sessions), `help`.\n\
Reply in an approval or question thread to answer it.";

/// Routes inbound chat messages and reactions.
pub struct InboundDispatcher {
    channel_id: String,
    transport: Arc<dyn ChatTransport>,
    thread_handlers: Vec<Arc<dyn ThreadReplyHandler>>,
    approvals: Arc<ApprovalController>,
    status: Arc<dyn StatusSource>,
    bus: Arc<EventBus>,
}

impl InboundDispatcher {
    /// Create a dispatcher answering commands in `channel_id`.
    ///
    /// `thread_handlers` are consulted in order; the first to claim a
    /// thread wins.
    pub fn new(
        channel_id: String,
        transport: Arc<dyn ChatTransport>,
        thread_handlers: Vec<Arc<dyn ThreadReplyHandler>>,
        approvals: Arc<ApprovalController>,
        status: Arc<dyn StatusSource>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            channel_id,
            transport,
            thread_handlers,
            approvals,
            status,
            bus,
        }
    }

    /// Handle one inbound message.
    pub async fn handle_message(&self, user_id: &str, text: &str, thread_ts: Option<&str>) {
        self.bus.emit(EventPayload::ChatIn {
            user_id: user_id.to_string(),
            text: text.to_string(),
            thread_ts: thread_ts.map(str::to_string),
        });

        if let Some(thread_ts) = thread_ts {
            for handler in &self.thread_handlers {
                if handler.handle_thread_reply(thread_ts, text, user_id).await {
                    return;
                }
            }
            debug!(thread_ts, "reply in unclaimed thread ignored");
            return;
        }

        match text.trim().to_lowercase().as_str() {
            "status" => {
                let reply = self.status.status_text().await;
                self.reply(reply).await;
            }
            "tasks" => {
                let reply = self.status.tasks_text().await;
                self.reply(reply).await;
            }
            "help" => {
                self.reply(HELP_TEXT.to_string()).await;
            }
            other => {
                debug!(text = other, "unrecognized chat message ignored");
            }
        }
    }

    /// Handle one inbound reaction on a message.
    pub async fn handle_reaction(&self, user_id: &str, reaction: &str, message_ts: &str) {
        if let Some(task_id) = self.approvals.task_for_thread(message_ts) {
            self.approvals
                .handle_reaction(reaction, &task_id, Some(user_id));
        }
    }

    async fn reply(&self, text: String) {
        let _ = self
            .transport
            .send(OutboundMessage::new(self.channel_id.clone(), text))
            .await;
    }
}
