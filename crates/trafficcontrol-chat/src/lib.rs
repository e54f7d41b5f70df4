#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **trafficcontrol-chat** – Chat-facing controllers for TrafficControl.
//!
//! Everything the orchestrator says to, or hears from, the human operator
//! flows through this crate:
//!
//! - **ChatTransport**: pluggable outbound send primitive (Slack Web API
//!   driver included; an in-memory recorder backs the tests).
//! - **NotificationController**: batched outbound notifications with quiet
//!   hours and do-not-disturb handling.
//! - **ApprovalController**: per-task approval protocol over reactions,
//!   replies and deadlines.
//! - **QuestionRouter**: correlates agent questions with chat-thread
//!   replies and injects answers back into the owning session.
//! - **InboundDispatcher**: routes inbound messages to thread handlers or
//!   the status / tasks / help commands.
//!
//! Retries and rate limiting are the transport's responsibility; these
//! controllers treat a failed send as final.

pub mod approval;
pub mod commands;
pub mod notify;
pub mod questions;
pub mod transport;

pub use approval::{ApprovalConfig, ApprovalController, ApprovalResult};
pub use commands::{InboundDispatcher, StatusSource, ThreadReplyHandler};
pub use notify::{
    Notification, NotificationController, NotificationKind, NotificationPriority,
    NotificationStats, NotifierConfig,
};
pub use questions::{PendingQuestion, QuestionRouter};
pub use transport::{
    ChatTransport, EventfulTransport, MemoryChatTransport, OutboundMessage, SentMessage,
    SlackTransport,
};

/// Errors raised by chat operations.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// The transport failed to deliver a message.
    #[error("chat send failed: {0}")]
    SendFailed(String),
    /// The chat service rejected the request.
    #[error("chat API error: {0}")]
    Api(String),
}
