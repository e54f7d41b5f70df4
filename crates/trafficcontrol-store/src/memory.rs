//! In-memory task-store driver.
//!
//! Fast, non-persistent backend suitable for tests and development. Mirrors
//! the ordering contract of the real store and adds a health toggle so the
//! degraded-mode paths can be exercised without a database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;

use trafficcontrol_types::{
    Model, ProjectRecord, ProjectStatus, SessionId, TaskId, TaskRecord, TaskStatus, Usage,
};

use crate::{ApprovalLogEntry, StoreError, TaskStore};

#[derive(Debug, Clone, Default)]
struct TaskMeta {
    session: Option<SessionId>,
    model: Option<Model>,
    usage: Usage,
}

/// An in-memory, non-persistent task store.
#[derive(Clone, Default)]
pub struct MemoryTaskStore {
    projects: Arc<RwLock<HashMap<String, ProjectRecord>>>,
    tasks: Arc<RwLock<HashMap<TaskId, TaskRecord>>>,
    meta: Arc<RwLock<HashMap<TaskId, TaskMeta>>>,
    approvals: Arc<RwLock<Vec<ApprovalLogEntry>>>,
    healthy: Arc<AtomicBool>,
}

impl MemoryTaskStore {
    /// Create an empty, healthy store.
    pub fn new() -> Self {
        Self {
            healthy: Arc::new(AtomicBool::new(true)),
            ..Default::default()
        }
    }

    /// Insert or replace a project row.
    pub async fn put_project(&self, project: ProjectRecord) {
        self.projects.write().await.insert(project.id.0.clone(), project);
    }

    /// Insert or replace a task row.
    pub async fn put_task(&self, task: TaskRecord) {
        self.tasks.write().await.insert(task.id.clone(), task);
    }

    /// Flip the health toggle; an unhealthy store fails every operation
    /// with [`StoreError::Unavailable`].
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Recorded approval log, oldest first.
    pub async fn approval_log(&self) -> Vec<ApprovalLogEntry> {
        self.approvals.read().await.clone()
    }

    /// Usage counters accumulated against a task.
    pub async fn task_usage(&self, id: &TaskId) -> Option<Usage> {
        self.meta.read().await.get(id).map(|m| m.usage)
    }

    /// Session/model assignment recorded for a task.
    pub async fn task_assignment(&self, id: &TaskId) -> Option<(Option<SessionId>, Option<Model>)> {
        self.meta.read().await.get(id).map(|m| (m.session, m.model))
    }

    fn check_health(&self) -> Result<(), StoreError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store marked unhealthy".into()))
        }
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn list_projects(&self, status: ProjectStatus) -> Result<Vec<ProjectRecord>, StoreError> {
        self.check_health()?;
        let mut projects: Vec<ProjectRecord> = self
            .projects
            .read()
            .await
            .values()
            .filter(|p| p.status == status)
            .cloned()
            .collect();
        projects.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.0.cmp(&b.id.0)));
        Ok(projects)
    }

    async fn list_tasks(&self, status: TaskStatus) -> Result<Vec<TaskRecord>, StoreError> {
        self.check_health()?;
        let mut tasks: Vec<TaskRecord> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(tasks)
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<TaskRecord>, StoreError> {
        self.check_health()?;
        Ok(self.tasks.read().await.get(id).cloned())
    }

    async fn update_task_status(&self, id: &TaskId, status: TaskStatus) -> Result<(), StoreError> {
        self.check_health()?;
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.0.clone()))?;
        debug!(task = %id, from = ?task.status, to = ?status, "task status updated");
        task.status = status;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn update_task_assignment(
        &self,
        id: &TaskId,
        session: Option<SessionId>,
        model: Option<Model>,
    ) -> Result<(), StoreError> {
        self.check_health()?;
        if !self.tasks.read().await.contains_key(id) {
            return Err(StoreError::NotFound(id.0.clone()));
        }
        let mut meta = self.meta.write().await;
        let entry = meta.entry(id.clone()).or_default();
        entry.session = session;
        entry.model = model;
        Ok(())
    }

    async fn update_task_usage(&self, id: &TaskId, usage: &Usage) -> Result<(), StoreError> {
        self.check_health()?;
        if !self.tasks.read().await.contains_key(id) {
            return Err(StoreError::NotFound(id.0.clone()));
        }
        let mut meta = self.meta.write().await;
        meta.entry(id.clone()).or_default().usage.add(usage);
        Ok(())
    }

    async fn delete_task(&self, id: &TaskId) -> Result<(), StoreError> {
        self.check_health()?;
        self.tasks.write().await.remove(id);
        self.meta.write().await.remove(id);
        Ok(())
    }

    async fn record_approval(&self, entry: &ApprovalLogEntry) -> Result<(), StoreError> {
        self.check_health()?;
        self.approvals.write().await.push(entry.clone());
        Ok(())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.check_health()
    }
}
