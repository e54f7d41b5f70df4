//! End-to-end exercise of the orchestrated question flow: a scheduled task
//! whose agent asks a question, gets the operator's threaded reply injected
//! back, and runs to completion.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use trafficcontrol_agents::adapter::AgentMessage;
use trafficcontrol_agents::{
    CapacityTracker, ScriptStep, ScriptedClient, SdkAdapter, SessionManager, SessionScript,
    ASK_USER_QUESTION_TOOL,
};
use trafficcontrol_bus::{EventBus, EventKind};
use trafficcontrol_chat::{
    ApprovalConfig, ApprovalController, MemoryChatTransport, NotificationController,
    NotifierConfig, QuestionRouter, ThreadReplyHandler,
};
use trafficcontrol_orchestration::{
    BasicBacklogValidator, ContextBudget, Orchestrator, OrchestratorDeps, Scheduler,
};
use trafficcontrol_store::{MemoryTaskStore, TaskStore};
use trafficcontrol_types::{
    CapacityLimits, Model, OrchestratorConfig, ProjectId, ProjectRecord, ProjectStatus, RawUsage,
    TaskId, TaskRecord, TaskStatus,
};

struct World {
    orchestrator: Arc<Orchestrator>,
    store: Arc<MemoryTaskStore>,
    transport: Arc<MemoryChatTransport>,
    client: Arc<ScriptedClient>,
    approvals: Arc<ApprovalController>,
    questions: Arc<QuestionRouter>,
    bus: Arc<EventBus>,
    _dir: tempfile::TempDir,
}

fn world() -> World {
    let dir = tempfile::TempDir::new().unwrap();
    let config = OrchestratorConfig {
        poll_interval_ms: 3_600_000,
        approval_timeout_ms: 5_000,
        session_close_grace_ms: 50,
        graceful_shutdown_timeout_ms: 1_000,
        skip_confirmation: true,
        db_startup_retries: 1,
        capacity: CapacityLimits {
            opus: 1,
            sonnet: 1,
            haiku: 1,
        },
        state_file_path: dir
            .path()
            .join("state.json")
            .to_string_lossy()
            .into_owned(),
        ..Default::default()
    };

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
            questions: questions.clone(),
            transport: transport.clone(),
            validator: Arc::new(BasicBacklogValidator),
            channel_id: "C-ops".into(),
        },
    )
    .unwrap();

    World {
        orchestrator,
        store,
        transport,
        client,
        approvals,
        questions,
        bus,
        _dir: dir,
    }
}

fn queued_task(id: &str) -> TaskRecord {
    let now = Utc::now();
    TaskRecord {
        id: TaskId::from(id),
        project_id: ProjectId::from("proj-1"),
        title: format!("task {id}"),
        description: "wire the flux capacitor".to_string(),
        priority: 5,
        status: TaskStatus::Queued,
        preferred_model: Some(Model::Sonnet),
        session_estimates: HashMap::new(),
        acceptance_criteria: vec!["it hums".to_string()],
        blocked_on: None,
        created_at: now,
        updated_at: now,
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..600 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never became true");
}

#[tokio::test]
async fn question_is_answered_in_thread_and_task_completes() {
    let w = world();
    w.store
        .put_project(ProjectRecord {
            id: ProjectId::from("proj-1"),
            name: "proj-1".into(),
            status: ProjectStatus::Active,
            priority: 0,
        })
        .await;
    w.store.put_task(queued_task("t-1")).await;
    w.client.push_script(SessionScript {
        steps: vec![
            ScriptStep::Emit(AgentMessage::ToolUse {
                tool_id: "tu_1".into(),
                tool_name: ASK_USER_QUESTION_TOOL.into(),
                input: serde_json::json!({
                    "questions": [{"question": "1.21 gigawatts ok?"}]
                }),
            }),
            ScriptStep::AwaitInjection,
            ScriptStep::Emit(AgentMessage::ResultSuccess {
                text: "flux capacitor wired".into(),
                duration_ms: 42,
                usage: RawUsage {
                    input_tokens: 1_000,
                    output_tokens: 200,
                    ..Default::default()
                },
            }),
        ],
        fail_start: false,
    });

    w.orchestrator.start().await.unwrap();
    w.orchestrator.tick().await;

    // Approve the admission when the request lands.
    let approvals = w.approvals.clone();
    wait_until(move || approvals.pending_count() == 1).await;
    w.approvals
        .handle_reaction("+1", &TaskId::from("t-1"), Some("U-lead"));

    // The agent's question reaches chat through the router.
    let questions = w.questions.clone();
    wait_until(move || questions.pending_count() == 1).await;
    let question_post = w
        .transport
        .sent()
        .into_iter()
        .find(|m| m.text.contains("1.21 gigawatts ok?"))
        .expect("question posted to chat");

    // A threaded reply is injected back into the owning session.
    assert!(
        w.questions
            .handle_thread_reply(&question_post.ts, "yes, great scott", "U-doc")
            .await
    );
    assert_eq!(w.questions.pending_count(), 0);
    assert_eq!(w.client.injections().len(), 1);

    // The session finishes and the task row reflects it.
    let mut status = TaskStatus::Queued;
    for _ in 0..600 {
        status = w
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

    let usage = w.store.task_usage(&TaskId::from("t-1")).await.unwrap();
    assert_eq!(usage.total_tokens, 1_200);

    assert_eq!(w.bus.history(Some(EventKind::AgentQuestion)).len(), 1);
    assert_eq!(w.bus.history(Some(EventKind::AgentBlocked)).len(), 1);
    assert_eq!(w.bus.history(Some(EventKind::TaskCompleted)).len(), 1);

    w.orchestrator.stop().await;
    assert_eq!(w.bus.history(Some(EventKind::SystemStopped)).len(), 1);
}
