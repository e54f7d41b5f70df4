//! Batched notification delivery with quiet hours and do-not-disturb.
//!
//! Notifications are held in four FIFO queues (questions, blockers,
//! reviews, completions) and flushed on a timer. During quiet hours or an
//! active DND window only high-priority items go out; everything else stays
//! queued. A failed send is dropped and counted — the transport owns
//! retries.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{Local, Timelike};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::transport::{ChatTransport, OutboundMessage};

/// Queue a notification belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// Agent question awaiting a reply.
    Question,
    /// Task or agent blocker.
    Blocker,
    /// Work ready for review.
    Review,
    /// Completed work announcement.
    Completion,
}

/// Delivery priority; high bypasses quiet hours and DND.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPriority {
    /// Deliverable whenever convenient.
    Low,
    /// Default priority.
    Normal,
    /// Must go out immediately, quiet hours or not.
    High,
}

/// One outbound notification.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Queue this belongs to.
    pub kind: NotificationKind,
    /// Delivery priority.
    pub priority: NotificationPriority,
    /// Message text.
    pub text: String,
    /// Thread to post into, if any.
    pub thread_ts: Option<String>,
}

impl Notification {
    /// Normal-priority notification of `kind`.
    pub fn new(kind: NotificationKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            priority: NotificationPriority::Normal,
            text: text.into(),
            thread_ts: None,
        }
    }

    /// Raise to high priority.
    pub fn high_priority(mut self) -> Self {
        self.priority = NotificationPriority::High;
        self
    }
}

/// Notification controller configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifierConfig {
    /// Channel notifications are posted to.
    pub channel_id: String,
    /// Batch flush interval in milliseconds.
    pub batch_interval_ms: u64,
    /// Quiet hours start, local hour of day, inclusive.
    pub quiet_hours_start: u32,
    /// Quiet hours end, local hour of day, exclusive. Equal start and end
    /// disables quiet hours.
    pub quiet_hours_end: u32,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            channel_id: String::new(),
            batch_interval_ms: 30_000,
            quiet_hours_start: 22,
            quiet_hours_end: 6,
        }
    }
}

/// Counters and queue depth reported by `stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationStats {
    /// Items currently queued across all queues.
    pub queued: usize,
    /// Successfully delivered notifications.
    pub total_sent: u64,
    /// Notifications dropped after a failed send.
    pub total_failed: u64,
    /// Whether a DND window is currently active.
    pub dnd_active: bool,
}

#[derive(Default)]
struct Queues {
    questions: VecDeque<Notification>,
    blockers: VecDeque<Notification>,
    reviews: VecDeque<Notification>,
    completions: VecDeque<Notification>,
}

impl Queues {
    fn queue_mut(&mut self, kind: NotificationKind) -> &mut VecDeque<Notification> {
        match kind {
            NotificationKind::Question => &mut self.questions,
            NotificationKind::Blocker => &mut self.blockers,
            NotificationKind::Review => &mut self.reviews,
            NotificationKind::Completion => &mut self.completions,
        }
    }

    fn len(&self) -> usize {
        self.questions.len() + self.blockers.len() + self.reviews.len() + self.completions.len()
    }

    fn clear(&mut self) {
        self.questions.clear();
        self.blockers.clear();
        self.reviews.clear();
        self.completions.clear();
    }
}

/// Whether `hour` falls inside the `[start, end)` quiet window.
///
/// Windows wrapping midnight are handled: 22→6 means `hour >= 22 || hour < 6`.
/// Equal start and end means no quiet window.
pub fn is_quiet_hour(hour: u32, start: u32, end: u32) -> bool {
    if start == end {
        return false;
    }
    if start < end {
        hour >= start && hour < end
    } else {
        hour >= start || hour < end
    }
}

/// Queues outbound notifications and flushes them on a timer.
pub struct NotificationController {
    config: NotifierConfig,
    transport: Arc<dyn ChatTransport>,
    queues: Mutex<Queues>,
    dnd_until: Mutex<Option<Instant>>,
    total_sent: AtomicU64,
    total_failed: AtomicU64,
    cancel: CancellationToken,
    timer_started: AtomicBool,
}

impl NotificationController {
    /// Create a controller sending through `transport`.
    pub fn new(config: NotifierConfig, transport: Arc<dyn ChatTransport>) -> Arc<Self> {
        Arc::new(Self {
            config,
            transport,
            queues: Mutex::new(Queues::default()),
            dnd_until: Mutex::new(None),
            total_sent: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            timer_started: AtomicBool::new(false),
        })
    }

    /// Start the batch timer. Calling twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.timer_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let controller = Arc::clone(self);
        let interval = Duration::from_millis(self.config.batch_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = controller.cancel.cancelled() => break,
                    _ = ticker.tick() => controller.flush().await,
                }
            }
            debug!("notification batch timer stopped");
        });
    }

    /// Add a notification to its queue.
    pub fn queue(&self, notification: Notification) {
        let mut queues = self.lock_queues();
        queues.queue_mut(notification.kind).push_back(notification);
    }

    /// Walk every queue once, sending what the current window allows.
    ///
    /// Suppressed items stay queued in order; failed sends are dropped and
    /// counted.
    pub async fn flush(&self) {
        let suppressing = self.suppressing_now();
        let batch: Vec<Notification> = {
            let mut queues = self.lock_queues();
            let mut batch = Vec::new();
            for kind in [
                NotificationKind::Question,
                NotificationKind::Blocker,
                NotificationKind::Review,
                NotificationKind::Completion,
            ] {
                let queue = queues.queue_mut(kind);
                let mut kept = VecDeque::new();
                while let Some(notification) = queue.pop_front() {
                    if suppressing && notification.priority != NotificationPriority::High {
                        kept.push_back(notification);
                    } else {
                        batch.push(notification);
                    }
                }
                *queue = kept;
            }
            batch
        };

        for notification in batch {
            self.deliver(notification).await;
        }
    }

    /// Send one notification now, still honoring quiet hours and DND unless
    /// it is high priority. Returns whether it was sent.
    pub async fn send_immediate(&self, notification: Notification) -> bool {
        if self.suppressing_now() && notification.priority != NotificationPriority::High {
            debug!("immediate notification suppressed by quiet hours/DND, queued instead");
            self.queue(notification);
            return false;
        }
        self.deliver(notification).await;
        true
    }

    /// Suppress non-high notifications for `duration`.
    pub fn set_dnd(&self, duration: Duration) {
        let until = Instant::now() + duration;
        *self.lock_dnd() = Some(until);
        info!(?duration, "do-not-disturb enabled");
    }

    /// Clear any DND window.
    pub fn disable_dnd(&self) {
        *self.lock_dnd() = None;
        info!("do-not-disturb disabled");
    }

    /// Current counters and queue depth.
    pub fn stats(&self) -> NotificationStats {
        NotificationStats {
            queued: self.lock_queues().len(),
            total_sent: self.total_sent.load(Ordering::SeqCst),
            total_failed: self.total_failed.load(Ordering::SeqCst),
            dnd_active: self.dnd_active(),
        }
    }

    /// Stop the timer and clear all queues. Idempotent.
    pub fn destroy(&self) {
        self.cancel.cancel();
        self.lock_queues().clear();
    }

    async fn deliver(&self, notification: Notification) {
        let mut message =
            OutboundMessage::new(self.config.channel_id.clone(), notification.text.clone());
        if let Some(ts) = &notification.thread_ts {
            message = message.in_thread(ts.clone());
        }
        match self.transport.send(message).await {
            Ok(_) => {
                self.total_sent.fetch_add(1, Ordering::SeqCst);
            }
            Err(error) => {
                // The send function owns retries; a failure here is final.
                warn!(%error, kind = ?notification.kind, "notification dropped after failed send");
                self.total_failed.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn suppressing_now(&self) -> bool {
        self.quiet_hours_now() || self.dnd_active()
    }

    fn quiet_hours_now(&self) -> bool {
        is_quiet_hour(
            Local::now().hour(),
            self.config.quiet_hours_start,
            self.config.quiet_hours_end,
        )
    }

    fn dnd_active(&self) -> bool {
        let mut dnd = self.lock_dnd();
        match *dnd {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                *dnd = None;
                false
            }
            None => false,
        }
    }

    fn lock_queues(&self) -> MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_dnd(&self) -> MutexGuard<'_, Option<Instant>> {
        self.dnd_until.lock().unwrap_or_else(|p| p.into_inner())
    }
}
