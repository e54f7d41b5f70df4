//! Token-budgeted context assembly.
//!
//! Entries are added when tasks are dispatched and removed when their
//! sessions end. When the estimate exceeds the target utilization, the
//! budget compresses compressible entries oldest-first with a
//! category-specific strategy until it fits again.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use trafficcontrol_bus::{EventBus, EventPayload};
use trafficcontrol_types::ContextCategory;

/// Fixed per-entry token overhead added to the length-based estimate.
const ENTRY_OVERHEAD_TOKENS: u64 = 3;

/// One entry of assembled context.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextEntry {
    /// Entry id.
    pub id: Uuid,
    /// Category, driving the compression strategy.
    pub category: ContextCategory,
    /// Whether the budget may compress this entry.
    pub compressible: bool,
    /// Reference id, typically a task id.
    pub reference: String,
    /// Entry content.
    pub content: String,
    /// Estimated token count of the content.
    pub tokens: u64,
    /// Insertion time; compression walks oldest-first.
    pub added_at: DateTime<Utc>,
}

/// Result of one `compress` pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressOutcome {
    /// Entries rewritten to a compact marker.
    pub compressed: usize,
    /// Entries removed outright.
    pub removed: usize,
    /// True when the pass ended still over budget with nothing left to
    /// compress.
    pub exhausted: bool,
}

/// Estimate tokens for `content`: one token per four bytes, rounded up,
/// plus a small constant overhead.
pub fn estimate_tokens(content: &str) -> u64 {
    (content.len() as u64).div_ceil(4) + ENTRY_OVERHEAD_TOKENS
}

/// Token-budgeted context store with category-based compression.
pub struct ContextBudget {
    max_tokens: u64,
    target_utilization: f64,
    warn_utilization: f64,
    entries: Mutex<Vec<ContextEntry>>,
    bus: Arc<EventBus>,
}

impl ContextBudget {
    /// Create a budget over a `max_tokens` window.
    pub fn new(
        max_tokens: u64,
        target_utilization: f64,
        warn_utilization: f64,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            max_tokens,
            target_utilization,
            warn_utilization,
            entries: Mutex::new(Vec::new()),
            bus,
        }
    }

    /// Add an entry, returning its id.
    pub fn add_entry(
        &self,
        category: ContextCategory,
        compressible: bool,
        reference: impl Into<String>,
        content: impl Into<String>,
    ) -> Uuid {
        let content = content.into();
        let entry = ContextEntry {
            id: Uuid::new_v4(),
            category,
            compressible,
            reference: reference.into(),
            tokens: estimate_tokens(&content),
            content,
            added_at: Utc::now(),
        };
        let id = entry.id;
        self.lock().push(entry);
        id
    }

    /// Replace an entry's content, re-estimating its tokens.
    pub fn update_entry(&self, id: Uuid, content: impl Into<String>) -> bool {
        let content = content.into();
        let mut entries = self.lock();
        match entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                entry.tokens = estimate_tokens(&content);
                entry.content = content;
                true
            }
            None => false,
        }
    }

    /// Remove one entry.
    pub fn remove_entry(&self, id: Uuid) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        entries.len() != before
    }

    /// Remove every entry carrying `reference`, returning the count.
    pub fn remove_entries_by_reference(&self, reference: &str) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|e| e.reference != reference);
        before - entries.len()
    }

    /// Sum of all entry estimates.
    pub fn current_estimate(&self) -> u64 {
        self.lock().iter().map(|e| e.tokens).sum()
    }

    /// True while the estimate is at or under the target utilization.
    pub fn is_within_budget(&self) -> bool {
        self.current_estimate() as f64 <= self.max_tokens as f64 * self.target_utilization
    }

    /// True once the estimate reaches the warn utilization.
    pub fn should_warn(&self) -> bool {
        self.current_estimate() as f64 >= self.max_tokens as f64 * self.warn_utilization
    }

    /// Compressible entries, oldest first.
    pub fn compressible_entries(&self) -> Vec<ContextEntry> {
        let mut compressible: Vec<ContextEntry> = self
            .lock()
            .iter()
            .filter(|e| e.compressible)
            .cloned()
            .collect();
        compressible.sort_by_key(|e| e.added_at);
        compressible
    }

    /// Compress oldest-first until back within budget.
    ///
    /// Task entries shrink to a delegation marker; history and response
    /// entries are dropped; system entries that were accidentally marked
    /// compressible leave a marker. If everything compressible is spent and
    /// the budget is still exceeded, `system:error` is emitted and the loop
    /// carries on.
    pub fn compress(&self) -> CompressOutcome {
        let mut outcome = CompressOutcome {
            compressed: 0,
            removed: 0,
            exhausted: false,
        };

        loop {
            if self.is_within_budget() {
                return outcome;
            }
            let oldest = self
                .compressible_entries()
                .into_iter()
                .next();
            let Some(entry) = oldest else { break };

            match entry.category {
                ContextCategory::Task => {
                    let marker = format!("Task {}: delegated", entry.reference);
                    let mut entries = self.lock();
                    if let Some(stored) = entries.iter_mut().find(|e| e.id == entry.id) {
                        stored.tokens = estimate_tokens(&marker);
                        stored.content = marker;
                        stored.compressible = false;
                    }
                    outcome.compressed += 1;
                }
                ContextCategory::History | ContextCategory::Response => {
                    self.remove_entry(entry.id);
                    outcome.removed += 1;
                }
                ContextCategory::System => {
                    let marker = "[system context compressed]".to_string();
                    let mut entries = self.lock();
                    if let Some(stored) = entries.iter_mut().find(|e| e.id == entry.id) {
                        stored.tokens = estimate_tokens(&marker);
                        stored.content = marker;
                        stored.compressible = false;
                    }
                    outcome.compressed += 1;
                }
            }
            debug!(category = ?entry.category, reference = entry.reference, "context entry compressed");
        }

        if !self.is_within_budget() {
            outcome.exhausted = true;
            warn!(
                estimate = self.current_estimate(),
                max = self.max_tokens,
                "context budget exhausted with nothing left to compress"
            );
            self.bus.emit(EventPayload::SystemError {
                source: "context-budget".to_string(),
                message: "context-budget-exhausted".to_string(),
            });
        }
        outcome
    }

    /// Number of entries currently held.
    pub fn entry_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ContextEntry>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }
}
