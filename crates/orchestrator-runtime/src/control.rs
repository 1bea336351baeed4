//! The Control Surface (C9): the one entry point external callers use.
//! Binds `workspaceId`, validates bounded inputs, and delegates to the
//! state machine (C4) and failure recovery engine (C6). Holds no state of
//! its own beyond the `Arc`s it was built with.

use crate::recovery::{FailureRecoveryEngine, OverrideAction, RecoveryResult, RecoveryStatus};
use crate::transition::{PhaseResult, StartOptions, StartResult, StateChangeResult, StateMachine};
use orchestrator_common::{
    FailureSeverity, FailureType, HistoryPage, OrchestratorError, PipelineContext, ProjectId,
    StateHistoryEntry, WorkflowId, WorkspaceId,
};
use std::sync::Arc;

const MAX_HISTORY_LIMIT: u32 = 100;

pub struct ControlSurface {
    state_machine: Arc<StateMachine>,
    recovery: Arc<FailureRecoveryEngine>,
}

impl ControlSurface {
    pub fn new(state_machine: Arc<StateMachine>, recovery: Arc<FailureRecoveryEngine>) -> Self {
        Self {
            state_machine,
            recovery,
        }
    }

    pub async fn start_pipeline(
        &self,
        project_id: ProjectId,
        workspace_id: WorkspaceId,
        options: StartOptions,
    ) -> Result<StartResult, OrchestratorError> {
        self.state_machine
            .start_pipeline(project_id, workspace_id, options)
            .await
    }

    /// Returns the context only if it belongs to `workspace_id`, hiding
    /// cross-tenant contexts behind the same `NotFound` a caller would see
    /// for an unknown project.
    pub async fn get_state(
        &self,
        project_id: &ProjectId,
        workspace_id: &WorkspaceId,
    ) -> Result<PipelineContext, OrchestratorError> {
        let context = self
            .state_machine
            .get_state(project_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("no pipeline for {project_id}")))?;
        if &context.workspace_id != workspace_id {
            return Err(OrchestratorError::NotFound(format!(
                "no pipeline for {project_id}"
            )));
        }
        Ok(context)
    }

    pub async fn pause_pipeline(
        &self,
        project_id: &ProjectId,
        workspace_id: &WorkspaceId,
        triggered_by: &str,
    ) -> Result<StateChangeResult, OrchestratorError> {
        self.get_state(project_id, workspace_id).await?;
        self.state_machine
            .pause_pipeline(project_id, triggered_by)
            .await
    }

    pub async fn resume_pipeline(
        &self,
        project_id: &ProjectId,
        workspace_id: &WorkspaceId,
        triggered_by: &str,
    ) -> Result<StateChangeResult, OrchestratorError> {
        self.get_state(project_id, workspace_id).await?;
        self.state_machine
            .resume_pipeline(project_id, triggered_by)
            .await
    }

    pub async fn get_history(
        &self,
        project_id: &ProjectId,
        workspace_id: &WorkspaceId,
        limit: u32,
        offset: u32,
    ) -> Result<HistoryPage<StateHistoryEntry>, OrchestratorError> {
        if limit > MAX_HISTORY_LIMIT {
            return Err(OrchestratorError::BadRequest(format!(
                "limit must be <= {MAX_HISTORY_LIMIT}"
            )));
        }
        self.state_machine
            .journal_history(project_id, workspace_id, limit, offset)
            .await
    }

    pub async fn on_phase_complete(
        &self,
        project_id: &ProjectId,
        phase_name: &str,
        result: PhaseResult,
    ) -> Result<PipelineContext, OrchestratorError> {
        self.state_machine
            .on_phase_complete(project_id, phase_name, result)
            .await
    }

    pub async fn report_failure(
        &self,
        project_id: &ProjectId,
        workflow_id: &WorkflowId,
        failure_type: FailureType,
        severity: FailureSeverity,
        details: Option<&str>,
    ) -> Result<RecoveryResult, OrchestratorError> {
        self.recovery
            .handle_failure(project_id, workflow_id, failure_type, severity, details)
            .await
    }

    pub async fn handle_manual_override(
        &self,
        workspace_id: &WorkspaceId,
        failure_id: &orchestrator_common::FailureId,
        action: &str,
        guidance: Option<&str>,
        reassign_to_agent_type: Option<&str>,
    ) -> Result<RecoveryResult, OrchestratorError> {
        let action = OverrideAction::parse(action)
            .ok_or_else(|| OrchestratorError::BadRequest(format!("unknown override action {action}")))?;
        self.recovery
            .handle_manual_override(workspace_id, failure_id, action, guidance, reassign_to_agent_type)
            .await
    }

    pub async fn get_recovery_status(
        &self,
        project_id: &ProjectId,
    ) -> Result<RecoveryStatus, OrchestratorError> {
        self.recovery.get_recovery_status(project_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::SqliteCheckpointStore;
    use crate::events::InProcessEventBus;
    use crate::journal::SqliteHistoryJournal;
    use crate::lock::ProjectLockTable;
    use crate::queue::NullAgentQueue;
    use crate::store::InMemoryStateStore;
    use std::collections::HashMap;

    fn surface() -> ControlSurface {
        let store: Arc<dyn crate::store::StateStore> = Arc::new(InMemoryStateStore::new());
        let journal = Arc::new(SqliteHistoryJournal::open_in_memory().unwrap());
        let checkpoints: Arc<dyn crate::checkpoint::CheckpointStore> =
            Arc::new(SqliteCheckpointStore::new(journal.connection_handle()));
        let queue = Arc::new(NullAgentQueue::new());
        let events = Arc::new(InProcessEventBus::new());
        let locks = Arc::new(ProjectLockTable::new());

        let state_machine = Arc::new(StateMachine::new(
            store.clone(),
            journal.clone(),
            checkpoints.clone(),
            queue.clone(),
            events.clone(),
            locks.clone(),
            3,
            604_800,
            HashMap::new(),
        ));
        let recovery = Arc::new(FailureRecoveryEngine::new(
            store, journal, checkpoints, queue, events, locks, 5, 300, HashMap::new(),
        ));
        ControlSurface::new(state_machine, recovery)
    }

    #[tokio::test]
    async fn get_state_hides_cross_workspace_contexts() {
        let surface = surface();
        let project_id = ProjectId::new("p1");
        surface
            .start_pipeline(project_id.clone(), WorkspaceId::new("w1"), StartOptions::default())
            .await
            .unwrap();

        let err = surface
            .get_state(&project_id, &WorkspaceId::new("w2"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));

        let ok = surface.get_state(&project_id, &WorkspaceId::new("w1")).await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn get_history_rejects_limit_over_cap() {
        let surface = surface();
        let err = surface
            .get_history(&ProjectId::new("p1"), &WorkspaceId::new("w1"), 101, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::BadRequest(_)));
    }

    #[tokio::test]
    async fn handle_manual_override_rejects_unknown_action() {
        let surface = surface();
        let err = surface
            .handle_manual_override(
                &WorkspaceId::new("w1"),
                &orchestrator_common::FailureId::new("f1"),
                "not_a_real_action",
                None,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::BadRequest(_)));
    }
}
