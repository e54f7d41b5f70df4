//! Priority scheduler over the external backlog.
//!
//! The queue is stable-sorted by (priority desc, created_at asc, id lex).
//! Tasks from paused projects are skipped in place. Model choice prefers
//! the task's own model when it has capacity, else falls back through the
//! fixed opus → sonnet → haiku order; a task admitted on a fallback model
//! is not re-queued.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::{debug, warn};

use trafficcontrol_agents::CapacityTracker;
use trafficcontrol_store::{StoreError, TaskStore};
use trafficcontrol_types::{
    Model, ProjectId, ProjectStatus, SessionId, TaskId, TaskRecord, TaskStatus,
    MODEL_FALLBACK_ORDER,
};

/// Callback that turns an admission decision into a live session.
#[async_trait]
pub trait SpawnHandler: Send + Sync {
    /// Spawn a session for `task` on `model`.
    async fn spawn(&self, task: &TaskRecord, model: Model) -> anyhow::Result<SessionId>;
}

/// Result of one admission attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleOutcome {
    /// A task was admitted.
    Scheduled {
        /// The admitted task.
        task_id: TaskId,
        /// The model chosen for it.
        model: Model,
        /// The session now executing it.
        session_id: SessionId,
    },
    /// No admissible task is queued.
    QueueEmpty,
    /// Tasks are queued but every candidate model is at its limit.
    NoCapacity,
    /// The spawn callback failed; the task stays queued and holds nothing.
    Error {
        /// The task whose spawn failed.
        task_id: TaskId,
        /// Failure description.
        message: String,
    },
}

struct SchedulerState {
    queue: Vec<TaskRecord>,
    paused_projects: HashSet<ProjectId>,
}

/// Priority queue over queued tasks plus the admission predicate.
pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    capacity: Arc<CapacityTracker>,
    state: Mutex<SchedulerState>,
}

impl Scheduler {
    /// Create a scheduler reading from `store` under `capacity`.
    pub fn new(store: Arc<dyn TaskStore>, capacity: Arc<CapacityTracker>) -> Self {
        Self {
            store,
            capacity,
            state: Mutex::new(SchedulerState {
                queue: Vec::new(),
                paused_projects: HashSet::new(),
            }),
        }
    }

    /// Insert one task into the queue, keeping sort order.
    ///
    /// Non-queued tasks and duplicates are ignored.
    pub fn add_task(&self, task: TaskRecord) {
        if task.status != TaskStatus::Queued {
            debug!(task_id = %task.id, status = ?task.status, "non-queued task not added");
            return;
        }
        let mut state = self.lock();
        if state.queue.iter().any(|t| t.id == task.id) {
            return;
        }
        state.queue.push(task);
        sort_queue(&mut state.queue);
    }

    /// Replace the queue and paused-project set from the store.
    ///
    /// Returns the number of queued tasks after the refresh.
    pub async fn refresh(&self) -> Result<usize, StoreError> {
        let mut queue = self.store.list_tasks(TaskStatus::Queued).await?;
        let paused: HashSet<ProjectId> = self
            .store
            .list_projects(ProjectStatus::Paused)
            .await?
            .into_iter()
            .map(|p| p.id)
            .collect();
        sort_queue(&mut queue);
        let mut state = self.lock();
        state.queue = queue;
        state.paused_projects = paused;
        Ok(state.queue.len())
    }

    /// Admission predicate: some model has capacity and some non-paused
    /// task is queued.
    pub fn can_schedule(&self) -> bool {
        if !self.capacity.any_available() {
            return false;
        }
        let state = self.lock();
        state
            .queue
            .iter()
            .any(|t| !state.paused_projects.contains(&t.project_id))
    }

    /// Next admissible `(task, model)` pair without removing it, skipping
    /// any task in `exclude`.
    pub fn peek_next(&self, exclude: &HashSet<TaskId>) -> Option<(TaskRecord, Model)> {
        let state = self.lock();
        for task in &state.queue {
            if exclude.contains(&task.id) || state.paused_projects.contains(&task.project_id) {
                continue;
            }
            if let Some(model) = self.choose_model(task) {
                return Some((task.clone(), model));
            }
        }
        None
    }

    /// 1-based queue position of `task_id` among admissible tasks.
    pub fn position(&self, task_id: &TaskId) -> Option<usize> {
        let state = self.lock();
        state
            .queue
            .iter()
            .filter(|t| !state.paused_projects.contains(&t.project_id))
            .position(|t| &t.id == task_id)
            .map(|i| i + 1)
    }

    /// Admit at most one task through `spawn`.
    pub async fn schedule_next(&self, spawn: &dyn SpawnHandler) -> ScheduleOutcome {
        self.schedule_next_excluding(spawn, &HashSet::new()).await
    }

    /// Admit tasks greedily until the queue is drained or capacity is gone.
    pub async fn schedule_all(&self, spawn: &dyn SpawnHandler) -> Vec<ScheduleOutcome> {
        let mut outcomes = Vec::new();
        // Tasks whose spawn failed stay queued; skip them for the rest of
        // this pass so the loop always makes progress.
        let mut failed: HashSet<TaskId> = HashSet::new();
        loop {
            match self.schedule_next_excluding(spawn, &failed).await {
                ScheduleOutcome::QueueEmpty | ScheduleOutcome::NoCapacity => break,
                ScheduleOutcome::Error { task_id, message } => {
                    failed.insert(task_id.clone());
                    outcomes.push(ScheduleOutcome::Error { task_id, message });
                }
                outcome => outcomes.push(outcome),
            }
        }
        outcomes
    }

    /// Re-align the capacity tracker with the ground-truth live set.
    pub fn sync_capacity(&self, live: &[(SessionId, Model)]) {
        self.capacity.sync(live);
    }

    /// Number of tasks currently queued, paused projects included.
    pub fn queue_len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Snapshot of the queue, in admission order.
    pub fn queued_tasks(&self) -> Vec<TaskRecord> {
        self.lock().queue.clone()
    }

    async fn schedule_next_excluding(
        &self,
        spawn: &dyn SpawnHandler,
        exclude: &HashSet<TaskId>,
    ) -> ScheduleOutcome {
        let candidate = {
            let state = self.lock();
            if !state
                .queue
                .iter()
                .any(|t| !exclude.contains(&t.id) && !state.paused_projects.contains(&t.project_id))
            {
                return ScheduleOutcome::QueueEmpty;
            }
            let mut found = None;
            for task in &state.queue {
                if exclude.contains(&task.id) || state.paused_projects.contains(&task.project_id) {
                    continue;
                }
                if let Some(model) = self.choose_model(task) {
                    found = Some((task.clone(), model));
                    break;
                }
            }
            match found {
                Some(candidate) => candidate,
                None => return ScheduleOutcome::NoCapacity,
            }
        };

        let (task, model) = candidate;
        match spawn.spawn(&task, model).await {
            Ok(session_id) => {
                let mut state = self.lock();
                state.queue.retain(|t| t.id != task.id);
                debug!(task_id = %task.id, %model, %session_id, "task admitted");
                ScheduleOutcome::Scheduled {
                    task_id: task.id,
                    model,
                    session_id,
                }
            }
            Err(error) => {
                // The task was never removed, so it stays queued.
                warn!(task_id = %task.id, %error, "spawn failed, task left queued");
                ScheduleOutcome::Error {
                    task_id: task.id,
                    message: error.to_string(),
                }
            }
        }
    }

    /// Preferred model when it has capacity, else the first fallback with
    /// capacity.
    fn choose_model(&self, task: &TaskRecord) -> Option<Model> {
        if let Some(preferred) = task.preferred_model {
            if self.capacity.available(preferred) > 0 {
                return Some(preferred);
            }
        }
        MODEL_FALLBACK_ORDER
            .iter()
            .copied()
            .find(|m| self.capacity.available(*m) > 0)
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn sort_queue(queue: &mut [TaskRecord]) {
    queue.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    use chrono::{Duration, Utc};

    use trafficcontrol_bus::EventBus;
    use trafficcontrol_store::MemoryTaskStore;
    use trafficcontrol_types::{CapacityLimits, ProjectRecord};

    fn task(id: &str, priority: i64, age_secs: i64) -> TaskRecord {
        let created = Utc::now() - Duration::seconds(age_secs);
        TaskRecord {
            id: TaskId::from(id),
            project_id: ProjectId::from("proj-1"),
            title: format!("task {id}"),
            description: String::new(),
            priority,
            status: TaskStatus::Queued,
            preferred_model: None,
            session_estimates: HashMap::new(),
            acceptance_criteria: vec![],
            blocked_on: None,
            created_at: created,
            updated_at: created,
        }
    }

    fn project(id: &str, status: ProjectStatus) -> ProjectRecord {
        ProjectRecord {
            id: ProjectId::from(id),
            name: id.to_string(),
            status,
            priority: 0,
        }
    }

    /// Records spawn calls; optionally fails every call.
    struct RecordingSpawner {
        calls: Mutex<Vec<(TaskId, Model)>>,
        failing: AtomicBool,
    }

    impl RecordingSpawner {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                failing: AtomicBool::new(false),
            }
        }

        fn calls(&self) -> Vec<(TaskId, Model)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SpawnHandler for RecordingSpawner {
        async fn spawn(&self, task: &TaskRecord, model: Model) -> anyhow::Result<SessionId> {
            if self.failing.load(Ordering::SeqCst) {
                anyhow::bail!("spawn refused");
            }
            self.calls.lock().unwrap().push((task.id.clone(), model));
            Ok(SessionId::new())
        }
    }

    struct Harness {
        scheduler: Scheduler,
        store: Arc<MemoryTaskStore>,
        capacity: Arc<CapacityTracker>,
    }

    fn harness(limits: CapacityLimits) -> Harness {
        let bus = Arc::new(EventBus::default());
        let store = Arc::new(MemoryTaskStore::new());
        let capacity = Arc::new(CapacityTracker::new(limits, bus));
        let scheduler = Scheduler::new(store.clone(), capacity.clone());
        Harness {
            scheduler,
            store,
            capacity,
        }
    }

    #[tokio::test]
    async fn admits_in_priority_then_age_order() {
        let h = harness(CapacityLimits { opus: 3, sonnet: 0, haiku: 0 });
        h.store.put_project(project("proj-1", ProjectStatus::Active)).await;
        // (priority 5, newer), (priority 5, older), (priority 7, newest)
        h.store.put_task(task("t-a", 5, 10)).await;
        h.store.put_task(task("t-b", 5, 20)).await;
        h.store.put_task(task("t-c", 7, 5)).await;
        h.scheduler.refresh().await.unwrap();

        let spawner = RecordingSpawner::new();
        for _ in 0..3 {
            h.scheduler.schedule_next(&spawner).await;
        }

        let ids: Vec<String> = spawner.calls().into_iter().map(|(id, _)| id.0).collect();
        assert_eq!(ids, vec!["t-c", "t-b", "t-a"]);
    }

    #[tokio::test]
    async fn preferred_model_with_fallback() {
        let h = harness(CapacityLimits { opus: 0, sonnet: 1, haiku: 1 });
        h.store.put_project(project("proj-1", ProjectStatus::Active)).await;
        let mut t = task("t-a", 5, 0);
        t.preferred_model = Some(Model::Opus);
        h.store.put_task(t).await;
        h.scheduler.refresh().await.unwrap();

        let spawner = RecordingSpawner::new();
        let outcome = h.scheduler.schedule_next(&spawner).await;

        // Opus is full, sonnet is the first fallback with capacity.
        match outcome {
            ScheduleOutcome::Scheduled { model, .. } => assert_eq!(model, Model::Sonnet),
            other => panic!("unexpected outcome: {other:?}"),
        }
        // The fallback admission removed the task; nothing is re-queued.
        assert_eq!(h.scheduler.queue_len(), 0);
    }

    #[tokio::test]
    async fn paused_projects_are_skipped_in_place() {
        let h = harness(CapacityLimits::default());
        h.store.put_project(project("proj-1", ProjectStatus::Active)).await;
        h.store.put_project(project("proj-paused", ProjectStatus::Paused)).await;
        let mut high = task("t-high", 9, 0);
        high.project_id = ProjectId::from("proj-paused");
        h.store.put_task(high).await;
        h.store.put_task(task("t-low", 1, 0)).await;
        h.scheduler.refresh().await.unwrap();

        let spawner = RecordingSpawner::new();
        let outcome = h.scheduler.schedule_next(&spawner).await;
        match outcome {
            ScheduleOutcome::Scheduled { task_id, .. } => assert_eq!(task_id.0, "t-low"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        // The paused task is still queued, just not admissible.
        assert_eq!(h.scheduler.queue_len(), 1);
        assert!(!h.scheduler.can_schedule());
    }

    #[tokio::test]
    async fn spawn_failure_leaves_task_queued_without_capacity() {
        let h = harness(CapacityLimits { opus: 1, sonnet: 0, haiku: 0 });
        h.store.put_project(project("proj-1", ProjectStatus::Active)).await;
        h.store.put_task(task("t-a", 5, 0)).await;
        h.scheduler.refresh().await.unwrap();

        let spawner = RecordingSpawner::new();
        spawner.failing.store(true, Ordering::SeqCst);
        let outcome = h.scheduler.schedule_next(&spawner).await;

        assert!(matches!(outcome, ScheduleOutcome::Error { .. }));
        assert_eq!(h.scheduler.queue_len(), 1);
        assert_eq!(h.capacity.available(Model::Opus), 1);
    }

    #[tokio::test]
    async fn schedule_all_is_greedy_until_capacity() {
        let h = harness(CapacityLimits { opus: 1, sonnet: 1, haiku: 0 });
        h.store.put_project(project("proj-1", ProjectStatus::Active)).await;
        for i in 0..4 {
            h.store.put_task(task(&format!("t-{i}"), 5, i)).await;
        }
        h.scheduler.refresh().await.unwrap();

        // The recording spawner does not reserve capacity, so take the
        // slots here to model the session manager's reservations.
        struct ReservingSpawner {
            capacity: Arc<CapacityTracker>,
        }
        #[async_trait]
        impl SpawnHandler for ReservingSpawner {
            async fn spawn(&self, _task: &TaskRecord, model: Model) -> anyhow::Result<SessionId> {
                let id = SessionId::new();
                self.capacity.reserve(model, id)?;
                Ok(id)
            }
        }
        let spawner = ReservingSpawner {
            capacity: h.capacity.clone(),
        };

        let outcomes = h.scheduler.schedule_all(&spawner).await;
        let scheduled = outcomes
            .iter()
            .filter(|o| matches!(o, ScheduleOutcome::Scheduled { .. }))
            .count();
        assert_eq!(scheduled, 2);
        assert_eq!(h.scheduler.queue_len(), 2);
        assert!(!h.scheduler.can_schedule());
    }

    #[tokio::test]
    async fn empty_queue_reports_queue_empty() {
        let h = harness(CapacityLimits::default());
        let spawner = RecordingSpawner::new();
        assert_eq!(
            h.scheduler.schedule_next(&spawner).await,
            ScheduleOutcome::QueueEmpty
        );
    }

    #[tokio::test]
    async fn position_counts_only_admissible_tasks() {
        let h = harness(CapacityLimits::default());
        h.store.put_project(project("proj-1", ProjectStatus::Active)).await;
        h.store.put_project(project("proj-paused", ProjectStatus::Paused)).await;
        let mut parked = task("t-parked", 9, 0);
        parked.project_id = ProjectId::from("proj-paused");
        h.store.put_task(parked).await;
        h.store.put_task(task("t-next", 5, 0)).await;
        h.store.put_task(task("t-later", 4, 0)).await;
        h.scheduler.refresh().await.unwrap();

        assert_eq!(h.scheduler.position(&TaskId::from("t-next")), Some(1));
        assert_eq!(h.scheduler.position(&TaskId::from("t-later")), Some(2));
        assert_eq!(h.scheduler.position(&TaskId::from("t-parked")), None);
    }
}
