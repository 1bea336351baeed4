//! Recovery sweeper (C5): a one-shot startup scan that reconciles hot
//! context left behind by a crash, either by deleting a stale terminal row
//! or handing a stalled project to the failure recovery engine.
//!
//! Never transitions a context directly (spec.md section 4.5's final line:
//! "the sweeper must not transition contexts itself") — every corrective
//! action either deletes a terminal leftover or goes through
//! [`crate::recovery::FailureRecoveryEngine`], preserving the single-writer
//! discipline C4/C6 already enforce.

use crate::recovery::FailureRecoveryEngine;
use crate::store::StateStore;
use chrono::Utc;
use orchestrator_common::{FailureSeverity, FailureType, OrchestratorError};
use std::sync::Arc;
use tracing::{info, warn};

/// Result of one sweep, published to the event bus by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub total: usize,
    pub recovered: usize,
    pub stale: usize,
}

pub struct RecoverySweeper {
    store: Arc<dyn StateStore>,
    recovery: Arc<FailureRecoveryEngine>,
    stale_threshold_seconds: i64,
}

impl RecoverySweeper {
    pub fn new(
        store: Arc<dyn StateStore>,
        recovery: Arc<FailureRecoveryEngine>,
        stale_threshold_seconds: u64,
    ) -> Self {
        Self {
            store,
            recovery,
            stale_threshold_seconds: stale_threshold_seconds as i64,
        }
    }

    /// Run the startup scan once. Safe to call more than once, but is
    /// intended to run exactly once at process start before any Control
    /// Surface traffic is accepted.
    pub async fn sweep(&self) -> Result<SweepSummary, OrchestratorError> {
        let project_ids = self
            .store
            .scan_project_ids()
            .await
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?;

        let mut summary = SweepSummary {
            total: project_ids.len(),
            ..Default::default()
        };

        for project_id in project_ids {
            let Some(context) = self
                .store
                .get(&project_id)
                .await
                .map_err(|e| OrchestratorError::Internal(e.to_string()))?
            else {
                continue;
            };

            if context.current_state.is_terminal() {
                // Crash between the terminal history write and the C1
                // delete; the journal already has the authoritative row.
                self.store
                    .delete(&project_id)
                    .await
                    .map_err(|e| OrchestratorError::Internal(e.to_string()))?;
                info!(%project_id, "sweeper reconciled a stale terminal context");
                summary.recovered += 1;
                continue;
            }

            let age_seconds = (Utc::now() - context.state_entered_at).num_seconds();
            let has_reachable_agent = context.active_agent_id.is_some();

            if age_seconds >= self.stale_threshold_seconds && !has_reachable_agent {
                summary.stale += 1;
                match self
                    .recovery
                    .handle_failure(
                        &project_id,
                        &context.workflow_id,
                        FailureType::Stalled,
                        FailureSeverity::Medium,
                        Some("no heartbeat past the stale threshold"),
                    )
                    .await
                {
                    Ok(_) => summary.recovered += 1,
                    Err(err) => warn!(%project_id, error = %err, "sweeper failed to hand off a stalled project"),
                }
            }
        }

        Ok(summary)
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
    use orchestrator_common::{PipelineContext, PipelineState, ProjectId, WorkflowId, WorkspaceId};
    use std::collections::HashMap;

    fn harness() -> (Arc<dyn StateStore>, RecoverySweeper, Arc<NullAgentQueue>) {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
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

        let sweeper = RecoverySweeper::new(store.clone(), recovery, 1800);
        (store, sweeper, queue)
    }

    fn context_in(state: PipelineState, entered_seconds_ago: i64) -> PipelineContext {
        let mut ctx = PipelineContext::new_initial(
            ProjectId::new("p1"),
            WorkspaceId::new("w1"),
            WorkflowId::new("wf1"),
            None,
            3,
            HashMap::new(),
        );
        ctx.enter_state(state);
        ctx.state_entered_at = Utc::now() - chrono::Duration::seconds(entered_seconds_ago);
        ctx
    }

    #[tokio::test]
    async fn fresh_context_is_left_untouched() {
        let (store, sweeper, queue) = harness();
        store
            .create_if_absent(context_in(PipelineState::Implementing, 5), 604_800)
            .await
            .unwrap();

        let summary = sweeper.sweep().await.unwrap();
        assert_eq!(summary, SweepSummary { total: 1, recovered: 0, stale: 0 });
        assert_eq!(queue.dispatch_count().await, 0);
        assert!(store.get(&ProjectId::new("p1")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn terminal_leftover_is_deleted_without_touching_recovery() {
        let (store, sweeper, _queue) = harness();
        store
            .create_if_absent(context_in(PipelineState::Complete, 5), 604_800)
            .await
            .unwrap();

        let summary = sweeper.sweep().await.unwrap();
        assert_eq!(summary.recovered, 1);
        assert!(store.get(&ProjectId::new("p1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_context_without_active_agent_goes_to_recovery() {
        let (store, sweeper, _queue) = harness();
        store
            .create_if_absent(context_in(PipelineState::Implementing, 3600), 604_800)
            .await
            .unwrap();

        let summary = sweeper.sweep().await.unwrap();
        assert_eq!(summary.stale, 1);
        assert_eq!(summary.recovered, 1);
        // stalled -> default strategy rollback; no checkpoint exists, so it
        // falls back to a same-phase retry and stays active.
        let ctx = store.get(&ProjectId::new("p1")).await.unwrap().unwrap();
        assert_eq!(ctx.retry_count, 1);
    }
}
