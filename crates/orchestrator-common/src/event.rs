//! The fixed event vocabulary published by the event bus adapter (C8).

use crate::failure::{FailureSeverity, FailureType, RecoveryStrategy};
use crate::ids::{FailureId, ProjectId, WorkflowId};
use crate::state::PipelineState;
use serde::{Deserialize, Serialize};

/// Events fanned out to in-process listeners (metrics, notifications).
/// Publication is fire-and-forget: the publisher never awaits subscribers,
/// and a subscriber failure never affects the publisher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    Started {
        project_id: ProjectId,
        workflow_id: WorkflowId,
    },
    StateChanged {
        project_id: ProjectId,
        from: Option<PipelineState>,
        to: PipelineState,
    },
    Paused {
        project_id: ProjectId,
        previous_state: PipelineState,
    },
    Resumed {
        project_id: ProjectId,
        new_state: PipelineState,
    },
    PhaseCompleted {
        project_id: ProjectId,
        phase: String,
    },
    FailureRecovered {
        project_id: ProjectId,
        failure_id: FailureId,
        strategy: RecoveryStrategy,
    },
    FailureEscalated {
        project_id: ProjectId,
        failure_id: FailureId,
        failure_type: FailureType,
        severity: FailureSeverity,
    },
    ManualOverrideRequired {
        project_id: ProjectId,
        failure_id: FailureId,
    },
    Aborted {
        project_id: ProjectId,
        reason: String,
    },
    Completed {
        project_id: ProjectId,
        workflow_id: WorkflowId,
    },
}

impl PipelineEvent {
    /// Stable topic name, for listeners that dispatch on a string key
    /// rather than matching the enum directly (mirrors the teacher's
    /// `pipeline.*` / `pipeline_events` naming convention in factory/ws.rs).
    pub fn topic(&self) -> &'static str {
        match self {
            Self::Started { .. } => "pipeline.started",
            Self::StateChanged { .. } => "pipeline.stateChanged",
            Self::Paused { .. } => "pipeline.paused",
            Self::Resumed { .. } => "pipeline.resumed",
            Self::PhaseCompleted { .. } => "pipeline.phaseCompleted",
            Self::FailureRecovered { .. } => "pipeline.failureRecovered",
            Self::FailureEscalated { .. } => "pipeline.failureEscalated",
            Self::ManualOverrideRequired { .. } => "pipeline.manualOverrideRequired",
            Self::Aborted { .. } => "pipeline.aborted",
            Self::Completed { .. } => "pipeline.completed",
        }
    }
}
