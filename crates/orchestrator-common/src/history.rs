//! Durable, append-only records written by the history journal (C2).

use crate::failure::FailureSeverity;
use crate::ids::{FailureId, ProjectId, WorkflowId, WorkspaceId};
use crate::state::PipelineState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One row of the transition audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateHistoryEntry {
    pub id: i64,
    pub project_id: ProjectId,
    pub workspace_id: WorkspaceId,
    pub workflow_id: WorkflowId,
    /// `None` only for the very first row of a run.
    pub previous_state: Option<PipelineState>,
    pub new_state: PipelineState,
    /// Free-form principal: `user:<id>`, `system`, or `agent:<type>`.
    pub triggered_by: String,
    pub reason: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// One row of the failure-recovery audit log (sibling table to
/// [`StateHistoryEntry`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecoveryHistoryEntry {
    pub id: i64,
    pub project_id: ProjectId,
    pub workspace_id: WorkspaceId,
    pub failure_id: FailureId,
    pub failure_type: String,
    pub severity: FailureSeverity,
    pub recovery_strategy: String,
    pub success: bool,
    pub retry_count_before: u32,
    pub retry_count_after: u32,
    pub checkpoint_id: Option<String>,
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A page of history rows, ordered `created_at desc`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPage<T> {
    pub items: Vec<T>,
    pub total: u64,
}
