//! The tick-driven main control loop.
//!
//! Startup runs the database probe, snapshot restore, capacity sync,
//! pre-flight validation and operator confirmation before the first tick.
//! Each tick checks the context budget, refreshes the queue, and hands at
//! most one candidate to a detached admission flow that gates it through
//! the approval controller before spawning. Repeated database failures put
//! the loop into degraded mode: existing sessions keep running, scheduling
//! stops, and a recovery probe runs once per tick until the store is
//! healthy again.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use trafficcontrol_agents::{SessionManager, CapacityTracker};
use trafficcontrol_agents::adapter::QueryConfig;
use trafficcontrol_bus::{Event, EventBus, EventKind, EventPayload};
use trafficcontrol_chat::{
    ApprovalController, ChatTransport, Notification, NotificationController, NotificationKind,
    OutboundMessage, QuestionRouter, StatusSource, ThreadReplyHandler,
};
use trafficcontrol_store::{StoreError, TaskStore};
use trafficcontrol_types::{
    ApprovalStatus, ContextCategory, Model, OrchestratorConfig, TaskId, TaskRecord, TaskStatus,
};

use crate::context::ContextBudget;
use crate::preflight::BacklogValidator;
use crate::scheduler::Scheduler;
use crate::snapshot::{SnapshotAgent, StateSnapshot};

/// Error-message markers classified as database connectivity problems.
const DB_ERROR_MARKERS: [&str; 7] = [
    "supabase",
    "database",
    "connection",
    "network",
    "timeout",
    "econnrefused",
    "enotfound",
];

/// Words accepted as a startup confirmation.
const CONFIRM_WORDS: [&str; 3] = ["confirm", "yes", "start"];

/// Words accepted as a startup abort.
const ABORT_WORDS: [&str; 4] = ["abort", "cancel", "no", "stop"];

/// Whether `message` looks like a database connectivity failure.
pub fn is_database_error(message: &str) -> bool {
    let lowered = message.to_lowercase();
    DB_ERROR_MARKERS.iter().any(|marker| lowered.contains(marker))
}

/// Errors that abort orchestrator startup. Runtime errors never surface
/// here; they are classified inside the tick.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(#[from] trafficcontrol_types::TypeError),
    /// The database probe failed past the retry budget.
    #[error("database unavailable: {0}")]
    DatabaseUnavailable(String),
    /// Pre-flight validation reported hard errors.
    #[error("backlog validation failed: {0:?}")]
    ValidationFailed(Vec<String>),
    /// The operator aborted, or never confirmed, startup.
    #[error("startup aborted: {0}")]
    StartupAborted(String),
    /// The pre-flight summary could not be posted.
    #[error("chat transport failure during startup: {0}")]
    Transport(String),
}

/// Observable loop state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopState {
    /// The loop has started and has not been stopped.
    pub running: bool,
    /// Scheduling is suspended by the operator.
    pub paused: bool,
    /// Scheduling is suspended by repeated database failures.
    pub degraded: bool,
    /// Consecutive DB-classified tick failures.
    pub consecutive_db_failures: u32,
    /// Last successful health probe.
    pub last_db_healthy_at: Option<DateTime<Utc>>,
    /// Last observed database error.
    pub last_db_error: Option<String>,
}

#[derive(Default)]
struct AdmissionState {
    /// Tasks currently in a detached approval/spawn flow.
    pending: HashSet<TaskId>,
    /// Tasks declined this run; not re-proposed until restart.
    declined: HashSet<TaskId>,
}

struct ConfirmationWait {
    thread_ts: String,
    tx: mpsc::UnboundedSender<bool>,
}

/// Collaborators handed to [`Orchestrator::new`].
pub struct OrchestratorDeps {
    /// Event bus shared by every component.
    pub bus: Arc<EventBus>,
    /// External task store.
    pub store: Arc<dyn TaskStore>,
    /// Capacity tracker.
    pub capacity: Arc<CapacityTracker>,
    /// Session manager.
    pub sessions: Arc<SessionManager>,
    /// Task scheduler.
    pub scheduler: Arc<Scheduler>,
    /// Context budget.
    pub budget: Arc<ContextBudget>,
    /// Notification controller.
    pub notifier: Arc<NotificationController>,
    /// Approval controller.
    pub approvals: Arc<ApprovalController>,
    /// Question router.
    pub questions: Arc<QuestionRouter>,
    /// Outbound chat transport.
    pub transport: Arc<dyn ChatTransport>,
    /// Pre-flight backlog validator.
    pub validator: Arc<dyn BacklogValidator>,
    /// Channel pre-flight and status messages post to.
    pub channel_id: String,
}

/// The main control loop.
pub struct Orchestrator {
    config: OrchestratorConfig,
    bus: Arc<EventBus>,
    store: Arc<dyn TaskStore>,
    capacity: Arc<CapacityTracker>,
    sessions: Arc<SessionManager>,
    scheduler: Arc<Scheduler>,
    budget: Arc<ContextBudget>,
    notifier: Arc<NotificationController>,
    approvals: Arc<ApprovalController>,
    questions: Arc<QuestionRouter>,
    transport: Arc<dyn ChatTransport>,
    validator: Arc<dyn BacklogValidator>,
    channel_id: String,
    state: Mutex<LoopState>,
    admissions: Mutex<AdmissionState>,
    confirmation: Mutex<Option<ConfirmationWait>>,
    ticker: Mutex<Option<CancellationToken>>,
    consumers: Mutex<Vec<CancellationToken>>,
}

impl Orchestrator {
    /// Create the loop after validating `config`.
    pub fn new(
        config: OrchestratorConfig,
        deps: OrchestratorDeps,
    ) -> Result<Arc<Self>, OrchestratorError> {
        config.validate()?;
        Ok(Arc::new(Self {
            config,
            bus: deps.bus,
            store: deps.store,
            capacity: deps.capacity,
            sessions: deps.sessions,
            scheduler: deps.scheduler,
            budget: deps.budget,
            notifier: deps.notifier,
            approvals: deps.approvals,
            questions: deps.questions,
            transport: deps.transport,
            validator: deps.validator,
            channel_id: deps.channel_id,
            state: Mutex::new(LoopState::default()),
            admissions: Mutex::new(AdmissionState::default()),
            confirmation: Mutex::new(None),
            ticker: Mutex::new(None),
            consumers: Mutex::new(Vec::new()),
        }))
    }

    //─────────────────────────────
    //  Startup
    //─────────────────────────────

    /// Run the startup sequence and begin ticking.
    #[instrument(skip(self))]
    pub async fn start(self: &Arc<Self>) -> Result<(), OrchestratorError> {
        info!("orchestrator starting");

        if self.config.validate_database_on_startup {
            self.probe_database_with_backoff().await?;
        }

        self.restore_snapshot();
        self.scheduler.sync_capacity(&self.sessions.live_models());
        let preflight_thread = self.run_preflight().await?;

        if !self.config.skip_confirmation {
            let thread = preflight_thread.ok_or_else(|| {
                OrchestratorError::Transport("no pre-flight thread to confirm in".to_string())
            })?;
            self.wait_for_confirmation(thread).await?;
        }

        {
            let mut state = self.lock_state();
            state.running = true;
        }
        self.bus.emit(EventPayload::SystemStarted);
        self.notifier.start();

        {
            let mut consumers = self.lock_consumers();
            consumers.push(self.questions.attach(&self.bus));
            consumers.push(self.attach_agent_event_consumer());
        }

        let cancel = CancellationToken::new();
        *self.lock_ticker() = Some(cancel.clone());
        let orchestrator = Arc::clone(self);
        let interval = self.config.poll_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => orchestrator.tick().await,
                }
            }
            debug!("orchestrator ticker stopped");
        });

        info!("orchestrator started");
        Ok(())
    }

    async fn probe_database_with_backoff(&self) -> Result<(), OrchestratorError> {
        let retries = self.config.db_startup_retries.max(1);
        let mut delay = Duration::from_millis(500);
        for attempt in 1..=retries {
            match self.store.health_check().await {
                Ok(()) => {
                    let mut state = self.lock_state();
                    state.last_db_healthy_at = Some(Utc::now());
                    drop(state);
                    self.bus.emit(EventPayload::DatabaseHealthy);
                    return Ok(());
                }
                Err(err) if attempt == retries => {
                    error!(%err, attempt, "database probe exhausted its retry budget");
                    return Err(OrchestratorError::DatabaseUnavailable(err.to_string()));
                }
                Err(err) => {
                    warn!(%err, attempt, "database probe failed, retrying");
                    let jitter = rand::thread_rng().gen_range(0..250);
                    tokio::time::sleep(delay + Duration::from_millis(jitter)).await;
                    delay = (delay * 2).min(Duration::from_secs(10));
                }
            }
        }
        unreachable!("retry loop always returns")
    }

    fn restore_snapshot(&self) {
        let path = PathBuf::from(&self.config.state_file_path);
        let Some(snapshot) = StateSnapshot::load(&path) else {
            debug!("no usable state snapshot, starting clean");
            return;
        };
        // Adapter sessions do not survive a restart; the entries only tell
        // the operator what was in flight when the previous run ended.
        for agent in &snapshot.active_agents {
            warn!(
                session_id = %agent.session_id,
                task_id = %agent.task_id,
                model = %agent.model,
                "session from previous run was lost on restart"
            );
        }
        let mut state = self.lock_state();
        state.paused = snapshot.is_paused;
        info!(
            was_running = snapshot.is_running,
            paused = snapshot.is_paused,
            lost_sessions = snapshot.active_agents.len(),
            "state snapshot restored"
        );
    }

    async fn run_preflight(&self) -> Result<Option<String>, OrchestratorError> {
        let tasks = self
            .store
            .list_tasks(TaskStatus::Queued)
            .await
            .map_err(|e| OrchestratorError::DatabaseUnavailable(e.to_string()))?;
        let mut projects = self
            .store
            .list_projects(trafficcontrol_types::ProjectStatus::Active)
            .await
            .map_err(|e| OrchestratorError::DatabaseUnavailable(e.to_string()))?;
        let paused = self
            .store
            .list_projects(trafficcontrol_types::ProjectStatus::Paused)
            .await
            .map_err(|e| OrchestratorError::DatabaseUnavailable(e.to_string()))?;
        projects.extend(paused);

        let report = self.validator.validate(&tasks, &projects).await;
        self.bus.emit(EventPayload::BacklogValidated {
            warnings: report.warnings.len(),
            errors: report.errors.len(),
        });

        let summary = report.summary_text(tasks.len());
        let thread = match self
            .transport
            .send(OutboundMessage::new(self.channel_id.clone(), summary))
            .await
        {
            Ok(ts) => Some(ts),
            Err(err) if self.config.skip_confirmation => {
                warn!(%err, "pre-flight summary could not be posted");
                None
            }
            Err(err) => return Err(OrchestratorError::Transport(err.to_string())),
        };

        if !report.is_startable() {
            return Err(OrchestratorError::ValidationFailed(report.errors));
        }
        Ok(thread)
    }

    async fn wait_for_confirmation(&self, thread_ts: String) -> Result<(), OrchestratorError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        *self.lock_confirmation() = Some(ConfirmationWait { thread_ts, tx });

        let timeout = Duration::from_millis(self.config.confirmation_timeout_ms);
        let decision = tokio::time::timeout(timeout, rx.recv()).await;
        *self.lock_confirmation() = None;

        match decision {
            Ok(Some(true)) => {
                info!("operator confirmed startup");
                Ok(())
            }
            Ok(_) => Err(OrchestratorError::StartupAborted(
                "operator aborted startup".to_string(),
            )),
            Err(_) => Err(OrchestratorError::StartupAborted(format!(
                "no confirmation within {} seconds",
                timeout.as_secs()
            ))),
        }
    }

    //─────────────────────────────
    //  Tick
    //─────────────────────────────

    /// Run one scheduling tick. Normally driven by the internal ticker.
    pub async fn tick(self: &Arc<Self>) {
        enum Phase {
            Idle,
            Recovery,
            Normal,
        }
        let phase = {
            let state = self.lock_state();
            if !state.running || state.paused {
                Phase::Idle
            } else if state.degraded {
                Phase::Recovery
            } else {
                Phase::Normal
            }
        };
        match phase {
            Phase::Idle => {}
            Phase::Recovery => self.attempt_recovery().await,
            Phase::Normal => {
                match self.tick_inner().await {
                    Ok(()) => {
                        let mut state = self.lock_state();
                        state.consecutive_db_failures = 0;
                        state.last_db_healthy_at = Some(Utc::now());
                    }
                    Err(err) => self.classify_tick_error(err),
                }
            }
        }
    }

    async fn attempt_recovery(&self) {
        match self.store.health_check().await {
            Ok(()) => {
                {
                    let mut state = self.lock_state();
                    state.degraded = false;
                    state.consecutive_db_failures = 0;
                    state.last_db_healthy_at = Some(Utc::now());
                    state.last_db_error = None;
                }
                info!("database recovered, scheduling resumes");
                self.bus.emit(EventPayload::DatabaseRecovered);
            }
            Err(err) => {
                debug!(%err, "database still unhealthy, staying degraded");
            }
        }
    }

    async fn tick_inner(self: &Arc<Self>) -> anyhow::Result<()> {
        if self.budget.should_warn() {
            warn!(
                estimate = self.budget.current_estimate(),
                "context budget nearing its limit"
            );
        }
        if !self.budget.is_within_budget() {
            self.budget.compress();
        }

        self.scheduler.refresh().await?;

        if self.scheduler.can_schedule() {
            let exclude = {
                let admissions = self.lock_admissions();
                admissions
                    .pending
                    .union(&admissions.declined)
                    .cloned()
                    .collect::<HashSet<_>>()
            };
            if let Some((task, model)) = self.scheduler.peek_next(&exclude) {
                {
                    let mut admissions = self.lock_admissions();
                    admissions.pending.insert(task.id.clone());
                }
                let orchestrator = Arc::clone(self);
                tokio::spawn(async move {
                    orchestrator.admit(task, model).await;
                });
            }
        }
        Ok(())
    }

    /// Detached admission flow: approval gate, then spawn.
    #[instrument(skip(self, task), fields(task_id = %task.id, model = %model))]
    async fn admit(self: &Arc<Self>, task: TaskRecord, model: Model) {
        let position = self.scheduler.position(&task.id).unwrap_or(1);
        let approval = self.approvals.request_approval(&task, position, model).await;

        match approval.status {
            ApprovalStatus::Approved => {
                if let Err(err) = self.launch(&task, model).await {
                    warn!(%err, "approved task could not be launched, re-queueing");
                    if let Err(err) = self
                        .store
                        .update_task_status(&task.id, TaskStatus::Queued)
                        .await
                    {
                        warn!(%err, "failed to re-queue task after launch failure");
                    }
                }
            }
            status => {
                info!(?status, reason = ?approval.reason, "task admission declined");
                {
                    let mut admissions = self.lock_admissions();
                    admissions.declined.insert(task.id.clone());
                }
                let reason = approval.reason.unwrap_or_default();
                self.notifier.queue(Notification::new(
                    NotificationKind::Blocker,
                    format!("Task {} not started ({status:?}) {reason}", task.id),
                ));
            }
        }

        let mut admissions = self.lock_admissions();
        admissions.pending.remove(&task.id);
    }

    async fn launch(self: &Arc<Self>, task: &TaskRecord, model: Model) -> anyhow::Result<()> {
        self.store
            .update_task_status(&task.id, TaskStatus::Assigned)
            .await?;

        // The status moves to in_progress before the spawn so the terminal
        // event consumer is the only writer of this row afterwards.
        self.store
            .update_task_status(&task.id, TaskStatus::InProgress)
            .await?;

        // The context entry exists only while a spawn is possible; every
        // failure path below removes it again, so a flaky store cannot
        // accumulate orphaned entries across repeated attempts.
        let prompt = build_prompt(task);
        self.budget
            .add_entry(ContextCategory::Task, true, task.id.0.clone(), prompt.clone());

        let mut query_config = QueryConfig::for_model(model);
        query_config.working_dir = PathBuf::from(&self.config.workspace_root);

        match self.sessions.spawn(task, model, prompt, query_config).await {
            Ok(session_id) => {
                // The session is live now; bookkeeping failures are logged
                // rather than propagated, or the caller would re-queue a
                // task that is already running.
                if let Err(err) = self
                    .store
                    .update_task_assignment(&task.id, Some(session_id), Some(model))
                    .await
                {
                    warn!(task_id = %task.id, %err, "task assignment not persisted");
                }
                self.bus.emit(EventPayload::TaskAssigned {
                    task_id: task.id.clone(),
                    session_id,
                    model,
                });
                self.save_snapshot();
                Ok(())
            }
            Err(err) => {
                self.budget.remove_entries_by_reference(&task.id.0);
                Err(err.into())
            }
        }
    }

    /// Consume terminal agent events: write task state back, notify, and
    /// refresh the snapshot.
    fn attach_agent_event_consumer(self: &Arc<Self>) -> CancellationToken {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        for kind in [EventKind::AgentCompleted, EventKind::AgentFailed] {
            let tx = tx.clone();
            self.bus.on(kind, move |event| {
                let _ = tx.send(event.clone());
                Ok(())
            });
        }

        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    event = rx.recv() => {
                        let Some(event) = event else { break };
                        orchestrator.handle_terminal_agent_event(event).await;
                    }
                }
            }
        });
        cancel
    }

    async fn handle_terminal_agent_event(self: &Arc<Self>, event: Event) {
        let (session_id, task_id, usage, success, detail) = match event.payload {
            EventPayload::AgentCompleted {
                session_id,
                task_id,
                usage,
                ..
            } => (session_id, task_id, usage, true, String::new()),
            EventPayload::AgentFailed {
                session_id,
                task_id,
                usage,
                errors,
                ..
            } => (session_id, task_id, usage, false, errors.join("; ")),
            _ => return,
        };

        // An agent:failed whose session never existed is an adapter start
        // failure; the task stays queued and is retried by the scheduler.
        if self.sessions.get(session_id).is_none() {
            debug!(%task_id, "terminal event without a session record, task left queued");
            return;
        }

        let status = if success {
            TaskStatus::Complete
        } else {
            TaskStatus::Failed
        };
        if let Err(err) = self.store.update_task_status(&task_id, status).await {
            warn!(%task_id, %err, "terminal task status not persisted");
        }
        if let Err(err) = self.store.update_task_usage(&task_id, &usage).await {
            warn!(%task_id, %err, "task usage not persisted");
        }
        self.budget.remove_entries_by_reference(&task_id.0);
        self.bus.emit(EventPayload::TaskCompleted {
            task_id: task_id.clone(),
            success,
        });
        let notification = if success {
            Notification::new(
                NotificationKind::Completion,
                format!("Task {task_id} completed (${:.2})", usage.cost_usd),
            )
        } else {
            Notification::new(
                NotificationKind::Blocker,
                format!("Task {task_id} failed: {detail}"),
            )
        };
        self.notifier.queue(notification);
        self.save_snapshot();
    }

    fn classify_tick_error(&self, err: anyhow::Error) {
        let message = err.to_string();
        // A typed store error is authoritative; the message markers cover
        // errors that arrive without one in their chain.
        let connectivity = err
            .downcast_ref::<StoreError>()
            .map_or(false, StoreError::is_connectivity);
        if connectivity || is_database_error(&message) {
            let entering = {
                let mut state = self.lock_state();
                state.consecutive_db_failures += 1;
                state.last_db_error = Some(message.clone());
                let entering =
                    !state.degraded && state.consecutive_db_failures >= self.config.max_consecutive_db_failures;
                if entering {
                    state.degraded = true;
                }
                entering
            };
            warn!(%message, "tick failed with a database error");
            if entering {
                error!("entering degraded mode: scheduling stops, sessions keep running");
                self.bus.emit(EventPayload::DatabaseDegraded { error: message });
            }
        } else {
            warn!(%message, "tick failed with a non-database error");
            self.bus.emit(EventPayload::SystemError {
                source: "tick".to_string(),
                message,
            });
        }
    }

    //─────────────────────────────
    //  Shutdown and control
    //─────────────────────────────

    /// Stop the loop: bounded graceful wait, force-close, snapshot, teardown.
    #[instrument(skip(self))]
    pub async fn stop(self: &Arc<Self>) {
        info!("orchestrator stopping");
        {
            let mut state = self.lock_state();
            state.running = false;
        }
        if let Some(cancel) = self.lock_ticker().take() {
            cancel.cancel();
        }

        let deadline = Instant::now() + self.config.graceful_shutdown_timeout();
        while self.sessions.has_live_sessions() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        if self.sessions.has_live_sessions() {
            warn!("graceful shutdown deadline reached, force-closing sessions");
            self.sessions.close_all().await;
            let force_deadline =
                Instant::now() + self.config.session_close_grace() + Duration::from_secs(1);
            while self.sessions.has_live_sessions() && Instant::now() < force_deadline {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }

        self.save_snapshot();
        self.approvals.destroy();
        self.notifier.destroy();
        for cancel in self.lock_consumers().drain(..) {
            cancel.cancel();
        }
        self.bus.emit(EventPayload::SystemStopped);
        info!("orchestrator stopped");
    }

    /// Suspend scheduling; sessions and event routing continue.
    pub fn pause(&self) {
        let mut state = self.lock_state();
        state.paused = true;
        info!("orchestrator paused");
    }

    /// Resume scheduling.
    pub fn resume(&self) {
        let mut state = self.lock_state();
        state.paused = false;
        info!("orchestrator resumed");
    }

    /// Current loop state.
    pub fn state(&self) -> LoopState {
        self.lock_state().clone()
    }

    fn save_snapshot(&self) {
        let snapshot = {
            let state = self.lock_state();
            StateSnapshot {
                is_running: state.running,
                is_paused: state.paused,
                active_agents: self
                    .sessions
                    .active()
                    .into_iter()
                    .map(|s| SnapshotAgent {
                        session_id: s.id,
                        task_id: s.task_id,
                        model: s.model,
                        status: s.status,
                        started_at: s.started_at,
                    })
                    .collect(),
            }
        };
        if let Err(err) = snapshot.save(Path::new(&self.config.state_file_path)) {
            warn!(%err, "state snapshot not saved");
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, LoopState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_admissions(&self) -> MutexGuard<'_, AdmissionState> {
        self.admissions.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_confirmation(&self) -> MutexGuard<'_, Option<ConfirmationWait>> {
        self.confirmation.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_ticker(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.ticker.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_consumers(&self) -> MutexGuard<'_, Vec<CancellationToken>> {
        self.consumers.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl ThreadReplyHandler for Orchestrator {
    async fn handle_thread_reply(&self, thread_ts: &str, text: &str, _user_id: &str) -> bool {
        let tx = {
            let confirmation = self.lock_confirmation();
            match confirmation.as_ref() {
                Some(wait) if wait.thread_ts == thread_ts => Some(wait.tx.clone()),
                _ => None,
            }
        };
        let Some(tx) = tx else { return false };
        if let Some(decision) = parse_confirmation(text) {
            let _ = tx.send(decision);
        } else {
            debug!(text, "unrecognized reply in confirmation thread");
        }
        true
    }
}

#[async_trait]
impl StatusSource for Orchestrator {
    async fn status_text(&self) -> String {
        let state = self.state();
        let stats = self.sessions.stats();
        let counts = self.capacity.counts();
        let mode = if !state.running {
            "stopped"
        } else if state.degraded {
            "degraded"
        } else if state.paused {
            "paused"
        } else {
            "running"
        };
        let mut capacity_line = String::new();
        for model in Model::all() {
            capacity_line.push_str(&format!(
                "{}: {}/{} ",
                model,
                counts.get(&model).copied().unwrap_or(0),
                self.capacity.limit(model)
            ));
        }
        format!(
            "Mode: {mode}\nCapacity: {}\nQueued: {} | Pending questions: {}\n\
             Sessions: {} started, {} completed, {} failed | Spend: ${:.2}\n\
             Context: {} tokens estimated",
            capacity_line.trim_end(),
            self.scheduler.queue_len(),
            self.questions.pending_count(),
            stats.sessions_started,
            stats.sessions_completed,
            stats.sessions_failed,
            stats.total_cost_usd,
            self.budget.current_estimate(),
        )
    }

    async fn tasks_text(&self) -> String {
        let queued = self.scheduler.queued_tasks();
        let active = self.sessions.active();
        let mut text = format!("Queued ({}):", queued.len());
        for task in queued.iter().take(10) {
            text.push_str(&format!("\n  [p{}] {} - {}", task.priority, task.id, task.title));
        }
        if queued.len() > 10 {
            text.push_str(&format!("\n  ... and {} more", queued.len() - 10));
        }
        text.push_str(&format!("\nActive sessions ({}):", active.len()));
        for session in &active {
            text.push_str(&format!(
                "\n  {} on {} ({:?}) for task {}",
                session.id, session.model, session.status, session.task_id
            ));
        }
        text
    }
}

/// Parse an operator confirmation reply.
fn parse_confirmation(text: &str) -> Option<bool> {
    let normalized = text.trim().to_lowercase();
    if CONFIRM_WORDS.contains(&normalized.as_str()) {
        Some(true)
    } else if ABORT_WORDS.contains(&normalized.as_str()) {
        Some(false)
    } else {
        None
    }
}

/// Prompt handed to the agent for one task.
fn build_prompt(task: &TaskRecord) -> String {
    let mut prompt = format!("# {}\n", task.title);
    if !task.description.is_empty() {
        prompt.push_str(&format!("\n{}\n", task.description));
    }
    if !task.acceptance_criteria.is_empty() {
        prompt.push_str("\nAcceptance criteria:\n");
        for criterion in &task.acceptance_criteria {
            prompt.push_str(&format!("- {criterion}\n"));
        }
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use tempfile::TempDir;

    use trafficcontrol_agents::{ScriptedClient, SdkAdapter, SessionScript};
    use trafficcontrol_chat::{ApprovalConfig, MemoryChatTransport, NotifierConfig};
    use trafficcontrol_store::MemoryTaskStore;
    use trafficcontrol_types::{
        CapacityLimits, ProjectId, ProjectRecord, ProjectStatus, RawUsage,
    };

    use crate::preflight::BasicBacklogValidator;

    fn project(id: &str) -> ProjectRecord {
        ProjectRecord {
            id: ProjectId::from(id),
            name: id.to_string(),
            status: ProjectStatus::Active,
            priority: 0,
        }
    }

    fn task(id: &str, priority: i64) -> TaskRecord {
        let now = Utc::now();
        TaskRecord {
            id: TaskId::from(id),
            project_id: ProjectId::from("proj-1"),
            title: format!("task {id}"),
            description: "implement the thing".to_string(),
            priority,
            status: TaskStatus::Queued,
            preferred_model: Some(Model::Sonnet),
            session_estimates: HashMap::new(),
            acceptance_criteria: vec!["it works".to_string()],
            blocked_on: None,
            created_at: now,
            updated_at: now,
        }
    }

    struct Harness {
        orchestrator: Arc<Orchestrator>,
        store: Arc<MemoryTaskStore>,
        transport: Arc<MemoryChatTransport>,
        client: Arc<ScriptedClient>,
        approvals: Arc<ApprovalController>,
        bus: Arc<EventBus>,
        _dir: TempDir,
    }

    fn harness(mut config: OrchestratorConfig) -> Harness {
        let dir = TempDir::new().unwrap();
        config.state_file_path = dir
            .path()
            .join("state.json")
            .to_string_lossy()
            .into_owned();

        let bus = Arc::new(EventBus::default());
        let store = Arc::new(MemoryTaskStore::new());
        let transport = Arc::new(MemoryChatTransport::new());
        let capacity = Arc::new(CapacityTracker::new(config.capacity.clone(), bus.clone()));
        let client = Arc::new(ScriptedClient::new());
        let adapter = Arc::new(SdkAdapter::new(client.clone()));
        let sessions = SessionManager::new(
            adapter,
            capacity.clone(),
            bus.clone(),
            config.session_close_grace(),
        );
        let scheduler = Arc::new(Scheduler::new(store.clone(), capacity.clone()));
        let budget = Arc::new(ContextBudget::new(
            config.context_max_tokens,
            config.context_target_utilization,
            config.context_warn_utilization,
            bus.clone(),
        ));
        let notifier = NotificationController::new(
            NotifierConfig {
                channel_id: "C-ops".into(),
                batch_interval_ms: 60_000,
                quiet_hours_start: 0,
                quiet_hours_end: 0,
            },
            transport.clone(),
        );
        let approvals = ApprovalController::new(
            ApprovalConfig {
                channel_id: "C-ops".into(),
                timeout: config.approval_timeout(),
            },
            transport.clone(),
            store.clone(),
        );
        let questions = QuestionRouter::new("C-ops".into(), transport.clone(), sessions.clone());

        let orchestrator = Orchestrator::new(
            config,
            OrchestratorDeps {
                bus: bus.clone(),
                store: store.clone(),
                capacity,
                sessions,
                scheduler,
                budget,
                notifier,
                approvals: approvals.clone(),
                questions,
                transport: transport.clone(),
                validator: Arc::new(BasicBacklogValidator),
                channel_id: "C-ops".into(),
            },
        )
        .unwrap();

        Harness {
            orchestrator,
            store,
            transport,
            client,
            approvals,
            bus,
            _dir: dir,
        }
    }

    fn fast_config() -> OrchestratorConfig {
        OrchestratorConfig {
            poll_interval_ms: 3_600_000, // ticks driven manually in tests
            approval_timeout_ms: 5_000,
            session_close_grace_ms: 50,
            graceful_shutdown_timeout_ms: 500,
            skip_confirmation: true,
            db_startup_retries: 1,
            capacity: CapacityLimits {
                opus: 1,
                sonnet: 1,
                haiku: 1,
            },
            ..Default::default()
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn startup_fails_fatal_when_database_is_down() {
        let h = harness(fast_config());
        h.store.set_healthy(false);
        let result = h.orchestrator.start().await;
        assert!(matches!(result, Err(OrchestratorError::DatabaseUnavailable(_))));
        assert!(!h.orchestrator.state().running);
    }

    #[tokio::test]
    async fn validation_errors_block_startup() {
        let h = harness(fast_config());
        h.store.put_project(project("proj-1")).await;
        let mut bad = task("t-bad", 5);
        bad.title = String::new();
        h.store.put_task(bad).await;

        let result = h.orchestrator.start().await;
        assert!(matches!(result, Err(OrchestratorError::ValidationFailed(_))));
    }

    #[tokio::test]
    async fn full_admission_flow_runs_a_task_to_completion() {
        let h = harness(fast_config());
        h.store.put_project(project("proj-1")).await;
        h.store.put_task(task("t-1", 5)).await;
        h.client.push_script(SessionScript::success(
            "shipped",
            RawUsage {
                input_tokens: 2_000,
                output_tokens: 500,
                ..Default::default()
            },
        ));

        h.orchestrator.start().await.unwrap();
        assert!(h.orchestrator.state().running);

        h.orchestrator.tick().await;
        // The detached admission flow posts the approval request.
        let approvals = h.approvals.clone();
        wait_until(move || approvals.pending_count() == 1).await;
        h.approvals
            .handle_reaction("white_check_mark", &TaskId::from("t-1"), Some("U-lead"));

        let mut status = TaskStatus::Queued;
        for _ in 0..400 {
            status = h
                .store
                .get_task(&TaskId::from("t-1"))
                .await
                .unwrap()
                .unwrap()
                .status;
            if status == TaskStatus::Complete {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(status, TaskStatus::Complete);

        let usage = h.store.task_usage(&TaskId::from("t-1")).await.unwrap();
        assert_eq!(usage.total_tokens, 2_500);
        assert_eq!(h.bus.history(Some(EventKind::TaskAssigned)).len(), 1);
        assert_eq!(h.bus.history(Some(EventKind::TaskCompleted)).len(), 1);

        h.orchestrator.stop().await;
        let snapshot =
            StateSnapshot::load(Path::new(&h.orchestrator.config.state_file_path)).unwrap();
        assert!(!snapshot.is_running);
        assert!(snapshot.active_agents.is_empty());
        assert_eq!(h.bus.history(Some(EventKind::SystemStopped)).len(), 1);
    }

    #[tokio::test]
    async fn approval_timeout_declines_without_requeue_loop() {
        let mut config = fast_config();
        config.approval_timeout_ms = 150;
        let h = harness(config);
        h.store.put_project(project("proj-1")).await;
        h.store.put_task(task("t-1", 5)).await;

        h.orchestrator.start().await.unwrap();
        let sent_before = h.transport.sent().len();

        h.orchestrator.tick().await;
        // Approval request goes out and times out unanswered.
        let transport = h.transport.clone();
        wait_until(move || transport.sent().len() > sent_before).await;
        let orchestrator = h.orchestrator.clone();
        wait_until(move || {
            let o = orchestrator.clone();
            let declined = o.lock_admissions().declined.contains(&TaskId::from("t-1"));
            declined
        })
        .await;

        // The task is still queued in the store but never re-proposed.
        let row = h.store.get_task(&TaskId::from("t-1")).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Queued);
        let sent_after_decline = h.transport.sent().len();
        h.orchestrator.tick().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.transport.sent().len(), sent_after_decline);
    }

    #[tokio::test]
    async fn degraded_mode_entry_and_recovery() {
        let h = harness(fast_config());
        h.store.put_project(project("proj-1")).await;
        h.orchestrator.start().await.unwrap();

        h.store.set_healthy(false);
        for _ in 0..3 {
            h.orchestrator.tick().await;
        }
        let state = h.orchestrator.state();
        assert!(state.degraded);
        assert_eq!(state.consecutive_db_failures, 3);
        assert_eq!(h.bus.history(Some(EventKind::DatabaseDegraded)).len(), 1);

        // Still degraded: the tick only probes, no scheduling happens.
        h.orchestrator.tick().await;
        assert!(h.orchestrator.state().degraded);

        h.store.set_healthy(true);
        h.orchestrator.tick().await;
        let state = h.orchestrator.state();
        assert!(!state.degraded);
        assert_eq!(state.consecutive_db_failures, 0);
        assert_eq!(h.bus.history(Some(EventKind::DatabaseRecovered)).len(), 1);
    }

    #[tokio::test]
    async fn pause_suspends_scheduling() {
        let h = harness(fast_config());
        h.store.put_project(project("proj-1")).await;
        h.store.put_task(task("t-1", 5)).await;
        h.orchestrator.start().await.unwrap();

        let sent_before = h.transport.sent().len();
        h.orchestrator.pause();
        h.orchestrator.tick().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        // No approval request went out while paused.
        assert_eq!(h.transport.sent().len(), sent_before);

        h.orchestrator.resume();
        h.orchestrator.tick().await;
        let transport = h.transport.clone();
        wait_until(move || transport.sent().len() > sent_before).await;
    }

    #[tokio::test]
    async fn confirmation_reply_gates_startup() {
        let mut config = fast_config();
        config.skip_confirmation = false;
        config.confirmation_timeout_ms = 2_000;
        let h = harness(config);
        h.store.put_project(project("proj-1")).await;

        let orchestrator = h.orchestrator.clone();
        let start = tokio::spawn(async move { orchestrator.start().await });

        let transport = h.transport.clone();
        wait_until(move || !transport.sent().is_empty()).await;
        let thread_ts = h.transport.last().unwrap().ts;

        // Noise first, then a real confirmation.
        assert!(
            h.orchestrator
                .handle_thread_reply(&thread_ts, "what is this?", "U-1")
                .await
        );
        assert!(
            h.orchestrator
                .handle_thread_reply(&thread_ts, "confirm", "U-1")
                .await
        );

        start.await.unwrap().unwrap();
        assert!(h.orchestrator.state().running);
        h.orchestrator.stop().await;
    }

    #[tokio::test]
    async fn abort_reply_cancels_startup() {
        let mut config = fast_config();
        config.skip_confirmation = false;
        config.confirmation_timeout_ms = 2_000;
        let h = harness(config);

        let orchestrator = h.orchestrator.clone();
        let start = tokio::spawn(async move { orchestrator.start().await });
        let transport = h.transport.clone();
        wait_until(move || !transport.sent().is_empty()).await;
        let thread_ts = h.transport.last().unwrap().ts;

        h.orchestrator
            .handle_thread_reply(&thread_ts, "abort", "U-1")
            .await;
        assert!(matches!(
            start.await.unwrap(),
            Err(OrchestratorError::StartupAborted(_))
        ));
        assert!(!h.orchestrator.state().running);
    }

    #[tokio::test]
    async fn confirmation_timeout_aborts_startup() {
        let mut config = fast_config();
        config.skip_confirmation = false;
        config.confirmation_timeout_ms = 80;
        let h = harness(config);

        let result = h.orchestrator.start().await;
        assert!(matches!(result, Err(OrchestratorError::StartupAborted(_))));
    }

    #[test]
    fn database_error_classification() {
        assert!(is_database_error("Supabase connection refused"));
        assert!(is_database_error("request timeout after 30s"));
        assert!(is_database_error("getaddrinfo ENOTFOUND db.internal"));
        assert!(is_database_error("database unavailable: memory store marked unhealthy"));
        assert!(!is_database_error("task title missing"));
    }

    #[test]
    fn confirmation_parsing() {
        assert_eq!(parse_confirmation("confirm"), Some(true));
        assert_eq!(parse_confirmation(" YES "), Some(true));
        assert_eq!(parse_confirmation("start"), Some(true));
        assert_eq!(parse_confirmation("abort"), Some(false));
        assert_eq!(parse_confirmation("no"), Some(false));
        assert_eq!(parse_confirmation("maybe"), None);
    }
}
