//! Per-task approval protocol over chat.
//!
//! `request_approval` posts a formatted request and then waits for the
//! first of: an approve/reject reaction, an approve/reject reply in the
//! thread, an explicit cancel, or the deadline. Exactly one resolution
//! happens per task; a deadline expiry is a `timeout`, never an implicit
//! approval. Outcomes are logged to the approval log best-effort.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use trafficcontrol_store::{ApprovalLogEntry, TaskStore};
use trafficcontrol_types::{ApprovalStatus, Model, TaskId, TaskRecord};

use crate::commands::ThreadReplyHandler;
use crate::transport::{ChatTransport, OutboundMessage};

/// Reactions treated as approval.
const APPROVE_REACTIONS: [&str; 5] = [
    "white_check_mark",
    "heavy_check_mark",
    "check",
    "+1",
    "thumbsup",
];

/// Reactions treated as rejection.
const REJECT_REACTIONS: [&str; 5] = [
    "x",
    "heavy_multiplication_x",
    "negative_squared_cross_mark",
    "-1",
    "thumbsdown",
];

/// Reply keywords treated as approval; any `approve…` prefix also counts.
const APPROVE_KEYWORDS: [&str; 6] = ["approve", "approved", "yes", "ok", "go", "lgtm"];

/// Reply keywords treated as rejection; any `reject…` prefix also counts.
const REJECT_KEYWORDS: [&str; 5] = ["reject", "rejected", "no", "stop", "cancel"];

/// Approval controller configuration.
#[derive(Debug, Clone)]
pub struct ApprovalConfig {
    /// Channel approval requests are posted to.
    pub channel_id: String,
    /// Deadline for one approval.
    pub timeout: Duration,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            channel_id: String::new(),
            timeout: Duration::from_secs(300),
        }
    }
}

/// Outcome of one approval request.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalResult {
    /// Task the approval gated.
    pub task_id: TaskId,
    /// Final resolution.
    pub status: ApprovalStatus,
    /// User who resolved it, if any.
    pub responder: Option<String>,
    /// Free-form reason, if any.
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
struct Resolution {
    status: ApprovalStatus,
    responder: Option<String>,
    reason: Option<String>,
}

struct PendingApproval {
    resolve_tx: oneshot::Sender<Resolution>,
    thread_ts: String,
    deadline_timer: JoinHandle<()>,
}

/// Gates task admission through the operator.
pub struct ApprovalController {
    config: ApprovalConfig,
    transport: Arc<dyn ChatTransport>,
    store: Arc<dyn TaskStore>,
    pending: DashMap<TaskId, PendingApproval>,
    threads: DashMap<String, TaskId>,
}

impl ApprovalController {
    /// Create a controller posting to `transport` and logging to `store`.
    pub fn new(
        config: ApprovalConfig,
        transport: Arc<dyn ChatTransport>,
        store: Arc<dyn TaskStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            transport,
            store,
            pending: DashMap::new(),
            threads: DashMap::new(),
        })
    }

    /// Request approval for `task` and wait for its resolution.
    ///
    /// `queue_position` and `model` feed the posted summary. A failed post
    /// resolves immediately as `timeout` with the send failure recorded.
    pub async fn request_approval(
        self: &Arc<Self>,
        task: &TaskRecord,
        queue_position: usize,
        model: Model,
    ) -> ApprovalResult {
        let text = format_approval_message(task, queue_position, model);
        let message = OutboundMessage::new(self.config.channel_id.clone(), text);

        let thread_ts = match self.transport.send(message).await {
            Ok(ts) => ts,
            Err(error) => {
                warn!(task_id = %task.id, %error, "approval request could not be posted");
                let result = ApprovalResult {
                    task_id: task.id.clone(),
                    status: ApprovalStatus::Timeout,
                    responder: None,
                    reason: Some("Failed to send Slack message".to_string()),
                };
                self.log_outcome(&result).await;
                return result;
            }
        };

        let (resolve_tx, resolve_rx) = oneshot::channel();
        let deadline_timer = {
            let controller = Arc::clone(self);
            let task_id = task.id.clone();
            let timeout = self.config.timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                controller.resolve(
                    &task_id,
                    Resolution {
                        status: ApprovalStatus::Timeout,
                        responder: None,
                        reason: Some(format!(
                            "No response within {} seconds",
                            timeout.as_secs()
                        )),
                    },
                );
            })
        };
        self.pending.insert(
            task.id.clone(),
            PendingApproval {
                resolve_tx,
                thread_ts: thread_ts.clone(),
                deadline_timer,
            },
        );
        self.threads.insert(thread_ts, task.id.clone());
        info!(task_id = %task.id, "approval requested");

        let resolution = resolve_rx.await.unwrap_or(Resolution {
            status: ApprovalStatus::Rejected,
            responder: None,
            reason: Some("approval controller dropped".to_string()),
        });

        let result = ApprovalResult {
            task_id: task.id.clone(),
            status: resolution.status,
            responder: resolution.responder,
            reason: resolution.reason,
        };
        self.log_outcome(&result).await;
        result
    }

    /// Apply a reaction on an approval message. Unknown reactions are
    /// ignored.
    pub fn handle_reaction(&self, reaction: &str, task_id: &TaskId, user_id: Option<&str>) {
        let status = if APPROVE_REACTIONS.contains(&reaction) {
            ApprovalStatus::Approved
        } else if REJECT_REACTIONS.contains(&reaction) {
            ApprovalStatus::Rejected
        } else {
            debug!(reaction, task_id = %task_id, "irrelevant reaction ignored");
            return;
        };
        self.resolve(
            task_id,
            Resolution {
                status,
                responder: user_id.map(str::to_string),
                reason: None,
            },
        );
    }

    /// Apply a reply in an approval thread. Unrecognized text is ignored.
    pub fn handle_reply(&self, text: &str, task_id: &TaskId, user_id: Option<&str>) {
        let Some((approved, reason)) = parse_reply(text) else {
            debug!(task_id = %task_id, "approval reply not recognized, ignored");
            return;
        };
        self.resolve(
            task_id,
            Resolution {
                status: if approved {
                    ApprovalStatus::Approved
                } else {
                    ApprovalStatus::Rejected
                },
                responder: user_id.map(str::to_string),
                reason,
            },
        );
    }

    /// Resolve a pending approval as rejected, e.g. on shutdown of the
    /// requesting flow.
    pub fn cancel_approval(&self, task_id: &TaskId, reason: Option<String>) {
        self.resolve(
            task_id,
            Resolution {
                status: ApprovalStatus::Rejected,
                responder: None,
                reason,
            },
        );
    }

    /// Task whose approval lives in `thread_ts`, if any.
    pub fn task_for_thread(&self, thread_ts: &str) -> Option<TaskId> {
        self.threads.get(thread_ts).map(|entry| entry.clone())
    }

    /// Number of approvals still pending.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Cancel all timers and resolve every pending approval as rejected.
    pub fn destroy(&self) {
        let task_ids: Vec<TaskId> = self.pending.iter().map(|entry| entry.key().clone()).collect();
        for task_id in task_ids {
            self.resolve(
                &task_id,
                Resolution {
                    status: ApprovalStatus::Rejected,
                    responder: None,
                    reason: Some("Manager destroyed".to_string()),
                },
            );
        }
    }

    /// Deliver a resolution exactly once. Later calls for the same task are
    /// no-ops.
    fn resolve(&self, task_id: &TaskId, resolution: Resolution) {
        let Some((_, pending)) = self.pending.remove(task_id) else {
            debug!(task_id = %task_id, "resolution for unknown or settled approval ignored");
            return;
        };
        pending.deadline_timer.abort();
        self.threads.remove(&pending.thread_ts);
        info!(task_id = %task_id, status = ?resolution.status, "approval resolved");
        let _ = pending.resolve_tx.send(resolution);
    }

    async fn log_outcome(&self, result: &ApprovalResult) {
        let entry = ApprovalLogEntry {
            task_id: result.task_id.clone(),
            status: result.status,
            responder: result.responder.clone(),
            reason: result.reason.clone(),
            decided_at: Utc::now(),
        };
        if let Err(error) = self.store.record_approval(&entry).await {
            warn!(task_id = %result.task_id, %error, "approval outcome not persisted");
        }
    }
}

#[async_trait]
impl ThreadReplyHandler for ApprovalController {
    async fn handle_thread_reply(&self, thread_ts: &str, text: &str, user_id: &str) -> bool {
        let Some(task_id) = self.task_for_thread(thread_ts) else {
            return false;
        };
        self.handle_reply(text, &task_id, Some(user_id));
        true
    }
}

/// Classify a reply as approve (`true`) / reject (`false`), with an
/// optional reason split off after a colon on rejections.
fn parse_reply(text: &str) -> Option<(bool, Option<String>)> {
    let normalized = text.trim().to_lowercase();
    let head = normalized
        .split([':', ' '])
        .next()
        .unwrap_or_default()
        .to_string();

    if APPROVE_KEYWORDS.contains(&head.as_str()) || head.starts_with("approve") {
        return Some((true, None));
    }
    if REJECT_KEYWORDS.contains(&head.as_str()) || head.starts_with("reject") {
        let reason = text
            .split_once(':')
            .map(|(_, tail)| tail.trim().to_string())
            .filter(|reason| !reason.is_empty());
        return Some((false, reason));
    }
    None
}

/// Message posted to the approval channel for one task.
fn format_approval_message(task: &TaskRecord, queue_position: usize, model: Model) -> String {
    let cost = task.estimated_cost(model);
    let mut text = format!(
        "Approval needed: *{}* (task {})\nQueue position: {} | Model: {} | Estimated cost: ${:.2}",
        task.title, task.id, queue_position, model, cost
    );
    if !task.description.is_empty() {
        text.push_str(&format!("\n> {}", task.description));
    }
    text.push_str("\nReply `approve` / `reject: <reason>` or react within the deadline.");
    text
}
