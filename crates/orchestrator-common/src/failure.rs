//! Failure taxonomy, severity, and the transient Active Failure Record.

use crate::ids::{FailureId, ProjectId, WorkspaceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cause classification for a reported failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    /// Rate limit, upstream 5xx, timeout.
    Transient,
    /// No heartbeat past the stale threshold.
    Stalled,
    /// Agent returned a structured error the runtime couldn't handle.
    AgentError,
    /// Agent output failed post-conditions.
    ValidationFailed,
    /// Non-recoverable: policy violation, signed-off abort.
    Fatal,
}

impl FailureType {
    /// The default recovery strategy for this failure type (spec.md
    /// section 4.6's taxonomy table), before the priority overrides in
    /// `handleFailure` step 3 are applied.
    pub fn default_strategy(self) -> RecoveryStrategy {
        match self {
            Self::Transient => RecoveryStrategy::Retry,
            Self::Stalled => RecoveryStrategy::Rollback,
            Self::AgentError => RecoveryStrategy::Reassign,
            Self::ValidationFailed => RecoveryStrategy::Rollback,
            Self::Fatal => RecoveryStrategy::Abort,
        }
    }
}

/// Severity of a reported failure. Severity raises after each retry;
/// `Critical` bypasses further retries and escalates immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// The strategy selected by the failure recovery engine for one
/// `handleFailure` invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    Pending,
    Retry,
    Rollback,
    Reassign,
    Escalate,
    Abort,
}

impl std::fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Retry => "retry",
            Self::Rollback => "rollback",
            Self::Reassign => "reassign",
            Self::Escalate => "escalate",
            Self::Abort => "abort",
        };
        f.write_str(s)
    }
}

/// A transient record of an unresolved failure awaiting either automatic
/// resolution or a human override. Lives in a C1-adjacent namespace; at
/// most one exists per `project_id` at any time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveFailureRecord {
    pub failure_id: FailureId,
    pub project_id: ProjectId,
    pub workspace_id: WorkspaceId,
    pub failure_type: FailureType,
    pub severity: FailureSeverity,
    pub retry_count: u32,
    pub escalated: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_strategies_match_taxonomy_table() {
        assert_eq!(FailureType::Transient.default_strategy(), RecoveryStrategy::Retry);
        assert_eq!(FailureType::Stalled.default_strategy(), RecoveryStrategy::Rollback);
        assert_eq!(FailureType::AgentError.default_strategy(), RecoveryStrategy::Reassign);
        assert_eq!(FailureType::ValidationFailed.default_strategy(), RecoveryStrategy::Rollback);
        assert_eq!(FailureType::Fatal.default_strategy(), RecoveryStrategy::Abort);
    }

    #[test]
    fn severity_ordering_supports_critical_check() {
        assert!(FailureSeverity::Critical > FailureSeverity::High);
        assert!(FailureSeverity::Low < FailureSeverity::Medium);
    }
}
