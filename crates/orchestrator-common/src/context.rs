//! `PipelineContext`: the hot record owned by the state store (C1).

use crate::ids::{JobId, ProjectId, StoryId, WorkflowId, WorkspaceId};
use crate::state::PipelineState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The live record of a pipeline's state and metadata.
///
/// For a given `project_id` at most one `PipelineContext` exists at any
/// time — it is created by `startPipeline`, mutated only by the state
/// machine or the failure recovery engine, and deleted once a transition
/// lands in a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineContext {
    pub project_id: ProjectId,
    pub workspace_id: WorkspaceId,
    pub workflow_id: WorkflowId,
    pub current_state: PipelineState,
    /// `None` only for the initial row created by `startPipeline`.
    pub previous_state: Option<PipelineState>,
    pub state_entered_at: DateTime<Utc>,
    pub active_agent_id: Option<JobId>,
    pub active_agent_type: Option<String>,
    pub current_story_id: Option<StoryId>,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineContext {
    /// Build the initial context for a freshly started pipeline: enters
    /// `Planning` directly (`idle -> planning` is recorded as the first
    /// history row, but `Idle` is never a persisted `current_state`).
    pub fn new_initial(
        project_id: ProjectId,
        workspace_id: WorkspaceId,
        workflow_id: WorkflowId,
        story_id: Option<StoryId>,
        max_retries: u32,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            project_id,
            workspace_id,
            workflow_id,
            current_state: PipelineState::Planning,
            previous_state: Some(PipelineState::Idle),
            state_entered_at: now,
            active_agent_id: None,
            active_agent_type: None,
            current_story_id: story_id,
            retry_count: 0,
            max_retries,
            metadata,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move into `target`, recording the prior state and refreshing
    /// timestamps. Callers are responsible for validating the transition
    /// against the transition table before calling this.
    pub fn enter_state(&mut self, target: PipelineState) {
        self.previous_state = Some(self.current_state);
        self.current_state = target;
        let now = Utc::now();
        self.state_entered_at = now;
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (ProjectId, WorkspaceId, WorkflowId) {
        (
            ProjectId::new("p1"),
            WorkspaceId::new("w1"),
            WorkflowId::new("wf1"),
        )
    }

    #[test]
    fn initial_context_enters_planning_with_idle_previous() {
        let (p, w, wf) = ids();
        let ctx = PipelineContext::new_initial(p, w, wf, None, 3, HashMap::new());
        assert_eq!(ctx.current_state, PipelineState::Planning);
        assert_eq!(ctx.previous_state, Some(PipelineState::Idle));
        assert_eq!(ctx.retry_count, 0);
    }

    #[test]
    fn enter_state_tracks_previous_state() {
        let (p, w, wf) = ids();
        let mut ctx = PipelineContext::new_initial(p, w, wf, None, 3, HashMap::new());
        ctx.enter_state(PipelineState::Implementing);
        assert_eq!(ctx.current_state, PipelineState::Implementing);
        assert_eq!(ctx.previous_state, Some(PipelineState::Planning));
    }
}
