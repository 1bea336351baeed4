//! End-to-end scenarios driving the Control Surface directly, the way the
//! CLI binary does, without any process or protocol boundary.

use orchestrator_common::{
    FailureSeverity, FailureType, OrchestratorError, PipelineState, ProjectId, WorkflowId,
    WorkspaceId,
};
use orchestrator_runtime::control::ControlSurface;
use orchestrator_runtime::lock::ProjectLockTable;
use orchestrator_runtime::recovery::FailureRecoveryEngine;
use orchestrator_runtime::transition::{PhaseResult, StartOptions};
use orchestrator_runtime::{
    InMemoryStateStore, InProcessEventBus, NullAgentQueue, SqliteCheckpointStore,
    SqliteHistoryJournal, StateMachine,
};
use std::collections::HashMap;
use std::sync::Arc;

fn build() -> ControlSurface {
    let store = Arc::new(InMemoryStateStore::new());
    let journal = Arc::new(SqliteHistoryJournal::open_in_memory().unwrap());
    let checkpoints = Arc::new(SqliteCheckpointStore::new(journal.connection_handle()));
    let queue = Arc::new(NullAgentQueue::new());
    let events = Arc::new(InProcessEventBus::new());
    let locks = Arc::new(ProjectLockTable::new());

    let mut fallbacks = HashMap::new();
    fallbacks.insert("implementing".to_string(), vec!["implementer".to_string(), "implementer-alt".to_string()]);

    let state_machine = Arc::new(StateMachine::new(
        store.clone(),
        journal.clone(),
        checkpoints.clone(),
        queue.clone(),
        events.clone(),
        locks.clone(),
        3,
        604_800,
        fallbacks.clone(),
    ));
    let recovery = Arc::new(FailureRecoveryEngine::new(
        store, journal, checkpoints, queue, events, locks, 5, 300, fallbacks,
    ));
    ControlSurface::new(state_machine, recovery)
}

#[tokio::test]
async fn scenario_1_happy_path_runs_to_completion() {
    let surface = build();
    let project_id = ProjectId::new("proj-1");
    let workspace_id = WorkspaceId::new("ws-1");

    surface
        .start_pipeline(project_id.clone(), workspace_id.clone(), StartOptions::default())
        .await
        .unwrap();

    for phase in ["planning", "implementing", "qa", "deploying"] {
        surface
            .on_phase_complete(&project_id, phase, PhaseResult::default())
            .await
            .unwrap();
    }

    let err = surface.get_state(&project_id, &workspace_id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NotFound(_)));

    let page = surface.get_history(&project_id, &workspace_id, 100, 0).await.unwrap();
    assert_eq!(page.total, 5);
}

#[tokio::test]
async fn scenario_2_pause_and_resume_mid_phase() {
    let surface = build();
    let project_id = ProjectId::new("proj-2");
    let workspace_id = WorkspaceId::new("ws-2");

    surface
        .start_pipeline(project_id.clone(), workspace_id.clone(), StartOptions::default())
        .await
        .unwrap();
    surface
        .on_phase_complete(&project_id, "planning", PhaseResult::default())
        .await
        .unwrap();

    let paused = surface.pause_pipeline(&project_id, &workspace_id, "user:u1").await.unwrap();
    assert_eq!(paused.new_state, PipelineState::Paused);

    let context = surface.get_state(&project_id, &workspace_id).await.unwrap();
    assert_eq!(context.current_state, PipelineState::Paused);
    assert_eq!(context.previous_state, Some(PipelineState::Implementing));

    let resumed = surface.resume_pipeline(&project_id, &workspace_id, "user:u1").await.unwrap();
    assert_eq!(resumed.new_state, PipelineState::Implementing);
}

#[tokio::test]
async fn scenario_3_invalid_transition_is_rejected() {
    let surface = build();
    let project_id = ProjectId::new("proj-3");
    let workspace_id = WorkspaceId::new("ws-3");
    surface
        .start_pipeline(project_id.clone(), workspace_id.clone(), StartOptions::default())
        .await
        .unwrap();

    // Attempting to skip straight to qa while still in planning.
    let err = surface
        .on_phase_complete(&project_id, "qa", PhaseResult::default())
        .await
        .unwrap();
    // onPhaseComplete for a phase we have not entered yet is a no-op, not an
    // error (idempotency rule), so the context stays in planning.
    assert_eq!(err.current_state, PipelineState::Planning);
}

#[tokio::test]
async fn scenario_4_transient_failure_retries_then_escalates() {
    let surface = build();
    let project_id = ProjectId::new("proj-4");
    let workspace_id = WorkspaceId::new("ws-4");
    surface
        .start_pipeline(project_id.clone(), workspace_id.clone(), StartOptions::default())
        .await
        .unwrap();
    surface
        .on_phase_complete(&project_id, "planning", PhaseResult::default())
        .await
        .unwrap();

    let workflow_id = surface.get_state(&project_id, &workspace_id).await.unwrap().workflow_id;

    for _ in 0..3 {
        let result = surface
            .report_failure(
                &project_id,
                &workflow_id,
                FailureType::Transient,
                FailureSeverity::Low,
                Some("upstream 503"),
            )
            .await
            .unwrap();
        assert!(result.success);
    }

    // A 4th transient failure pushes retry_count past max_retries (3).
    let escalated = surface
        .report_failure(&project_id, &workflow_id, FailureType::Transient, FailureSeverity::Low, None)
        .await
        .unwrap();

    let context = surface.get_state(&project_id, &workspace_id).await.unwrap();
    assert_eq!(context.current_state, PipelineState::AwaitingManual);
    assert_eq!(escalated.strategy.to_string(), "escalate");
}

#[tokio::test]
async fn scenario_5_manual_override_reassign_succeeds() {
    let surface = build();
    let project_id = ProjectId::new("proj-5");
    let workspace_id = WorkspaceId::new("ws-5");
    surface
        .start_pipeline(project_id.clone(), workspace_id.clone(), StartOptions::default())
        .await
        .unwrap();
    surface
        .on_phase_complete(&project_id, "planning", PhaseResult::default())
        .await
        .unwrap();
    let workflow_id = surface.get_state(&project_id, &workspace_id).await.unwrap().workflow_id;

    for _ in 0..4 {
        surface
            .report_failure(&project_id, &workflow_id, FailureType::Transient, FailureSeverity::Low, None)
            .await
            .unwrap();
    }
    let status = surface.get_recovery_status(&project_id).await.unwrap();
    assert!(status.is_escalated);
    let failure_id = status.active_failures[0].failure_id.clone();

    let result = surface
        .handle_manual_override(&workspace_id, &failure_id, "reassign", None, Some("implementer-alt"))
        .await
        .unwrap();
    assert!(result.success);

    let context = surface.get_state(&project_id, &workspace_id).await.unwrap();
    assert_eq!(context.current_state, PipelineState::Implementing);
    assert_eq!(context.active_agent_type.as_deref(), Some("implementer-alt"));

    let status = surface.get_recovery_status(&project_id).await.unwrap();
    assert!(status.active_failures.is_empty());
}

#[tokio::test]
async fn scenario_5b_reassign_outside_allowed_set_is_bad_request() {
    let surface = build();
    let project_id = ProjectId::new("proj-5b");
    let workspace_id = WorkspaceId::new("ws-5b");
    surface
        .start_pipeline(project_id.clone(), workspace_id.clone(), StartOptions::default())
        .await
        .unwrap();
    surface
        .on_phase_complete(&project_id, "planning", PhaseResult::default())
        .await
        .unwrap();
    let workflow_id = surface.get_state(&project_id, &workspace_id).await.unwrap().workflow_id;
    for _ in 0..4 {
        surface
            .report_failure(&project_id, &workflow_id, FailureType::Transient, FailureSeverity::Low, None)
            .await
            .unwrap();
    }
    let status = surface.get_recovery_status(&project_id).await.unwrap();
    let failure_id = status.active_failures[0].failure_id.clone();

    let err = surface
        .handle_manual_override(&workspace_id, &failure_id, "reassign", None, Some("not-allowed"))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::BadRequest(_)));

    // A rejected reassign must leave the context in awaiting_manual, untouched.
    let context = surface.get_state(&project_id, &workspace_id).await.unwrap();
    assert_eq!(context.current_state, PipelineState::AwaitingManual);
}

#[tokio::test]
async fn scenario_6_crash_recovery_via_sweeper() {
    use orchestrator_runtime::store::StateStore;
    use orchestrator_runtime::sweeper::RecoverySweeper;

    let store = Arc::new(InMemoryStateStore::new());
    let journal = Arc::new(SqliteHistoryJournal::open_in_memory().unwrap());
    let checkpoints = Arc::new(SqliteCheckpointStore::new(journal.connection_handle()));
    let queue = Arc::new(NullAgentQueue::new());
    let events = Arc::new(InProcessEventBus::new());
    let locks = Arc::new(ProjectLockTable::new());

    let recovery = Arc::new(FailureRecoveryEngine::new(
        store.clone(),
        journal.clone(),
        checkpoints,
        queue.clone(),
        events,
        locks,
        5,
        300,
        HashMap::new(),
    ));

    // Simulate a crash: a context stuck in implementing well past the stale
    // threshold, with no active agent recorded.
    let mut stuck = orchestrator_common::PipelineContext::new_initial(
        ProjectId::new("proj-6"),
        WorkspaceId::new("ws-6"),
        WorkflowId::new("wf-6"),
        None,
        3,
        HashMap::new(),
    );
    stuck.enter_state(PipelineState::Implementing);
    stuck.state_entered_at = chrono::Utc::now() - chrono::Duration::seconds(7200);
    store.create_if_absent(stuck, 604_800).await.unwrap();

    let sweeper = RecoverySweeper::new(store.clone(), recovery, 1800);
    let summary = sweeper.sweep().await.unwrap();
    assert_eq!(summary.total, 1);
    assert_eq!(summary.stale, 1);

    let context = store.get(&ProjectId::new("proj-6")).await.unwrap().unwrap();
    assert_eq!(context.retry_count, 1);
    assert_eq!(context.current_state, PipelineState::Implementing);
}
