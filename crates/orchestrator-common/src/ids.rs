//! Opaque identifier newtypes.
//!
//! Every id here is a thin wrapper over a `String`. The orchestrator never
//! interprets these values — workspace and project identity are owned by
//! the external systems that mint them; `workflowId` and `failureId` are
//! minted by the orchestrator itself but are otherwise opaque tokens.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a raw string as this id type.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow the underlying string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(ProjectId, "Primary key for a pipeline context (C1).");
string_id!(WorkspaceId, "Tenant-scoping key; all operations are workspace-scoped.");
string_id!(WorkflowId, "Stable identifier for one start-to-terminal pipeline run.");
string_id!(StoryId, "Optional unit-of-work label attached to a run.");
string_id!(FailureId, "Identifies an Active Failure Record pending override.");
string_id!(JobId, "Identifier returned by the external agent job queue.");

/// Mint a fresh [`WorkflowId`] for a pipeline start.
pub fn new_workflow_id() -> WorkflowId {
    WorkflowId::new(uuid::Uuid::new_v4().to_string())
}

/// Mint a fresh [`FailureId`] for a classified failure.
pub fn new_failure_id() -> FailureId {
    FailureId::new(uuid::Uuid::new_v4().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_round_trip_through_json() {
        let id = ProjectId::new("proj-1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"proj-1\"");
        let back: ProjectId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn minted_ids_are_distinct() {
        assert_ne!(new_workflow_id(), new_workflow_id());
        assert_ne!(new_failure_id(), new_failure_id());
    }
}
