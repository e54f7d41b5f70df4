//! Pre-flight backlog validation.
//!
//! Runs before the first scheduling tick: warnings are reported to the
//! operator, hard errors block startup.

use std::collections::HashSet;

use async_trait::async_trait;

use trafficcontrol_types::{ProjectRecord, TaskRecord};

/// Outcome of a backlog validation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    /// Non-blocking findings, reported and ignored.
    pub warnings: Vec<String>,
    /// Blocking findings; startup aborts while any exist.
    pub errors: Vec<String>,
}

impl ValidationReport {
    /// Whether startup may proceed.
    pub fn is_startable(&self) -> bool {
        self.errors.is_empty()
    }

    /// Human-readable summary for the pre-flight chat post.
    pub fn summary_text(&self, queued: usize) -> String {
        let mut text = format!(
            "Pre-flight: {queued} queued task(s), {} warning(s), {} error(s).",
            self.warnings.len(),
            self.errors.len()
        );
        for warning in &self.warnings {
            text.push_str(&format!("\n:warning: {warning}"));
        }
        for error in &self.errors {
            text.push_str(&format!("\n:x: {error}"));
        }
        if self.is_startable() {
            text.push_str("\nReply `confirm` to start or `abort` to cancel.");
        } else {
            text.push_str("\nStartup blocked until errors are resolved.");
        }
        text
    }
}

/// Validates the backlog before the orchestrator starts scheduling.
#[async_trait]
pub trait BacklogValidator: Send + Sync {
    /// Validate `tasks` against `projects`.
    async fn validate(&self, tasks: &[TaskRecord], projects: &[ProjectRecord])
        -> ValidationReport;
}

/// Structural validation of the queued backlog.
#[derive(Debug, Default)]
pub struct BasicBacklogValidator;

#[async_trait]
impl BacklogValidator for BasicBacklogValidator {
    async fn validate(
        &self,
        tasks: &[TaskRecord],
        projects: &[ProjectRecord],
    ) -> ValidationReport {
        let mut report = ValidationReport::default();
        let known_projects: HashSet<_> = projects.iter().map(|p| &p.id).collect();
        let known_tasks: HashSet<_> = tasks.iter().map(|t| &t.id).collect();

        for task in tasks {
            if task.title.trim().is_empty() {
                report.errors.push(format!("task {} has an empty title", task.id));
            }
            if !known_projects.contains(&task.project_id) {
                report.errors.push(format!(
                    "task {} references unknown project {}",
                    task.id, task.project_id
                ));
            }
            if task.description.trim().is_empty() {
                report
                    .warnings
                    .push(format!("task {} has no description", task.id));
            }
            if task.acceptance_criteria.is_empty() {
                report
                    .warnings
                    .push(format!("task {} has no acceptance criteria", task.id));
            }
            if let Some(blocked_on) = &task.blocked_on {
                if !known_tasks.contains(blocked_on) {
                    report.warnings.push(format!(
                        "task {} is blocked on unknown task {blocked_on}",
                        task.id
                    ));
                }
            }
        }
        report
    }
}
