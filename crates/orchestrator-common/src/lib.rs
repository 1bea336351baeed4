//! Shared domain types for the pipeline orchestrator.
//!
//! This crate holds the pure data model — states, identifiers, the
//! transition table, and the records persisted by the hot store (C1) and
//! the history journal (C2) — with no I/O of its own. `orchestrator-runtime`
//! depends on these types; the CLI binary re-exports what it needs through
//! `orchestrator-runtime`.

pub mod context;
pub mod error;
pub mod event;
pub mod failure;
pub mod history;
pub mod ids;
pub mod state;
pub mod transitions;

pub use context::PipelineContext;
pub use error::OrchestratorError;
pub use event::PipelineEvent;
pub use failure::{ActiveFailureRecord, FailureSeverity, FailureType, RecoveryStrategy};
pub use history::{FailureRecoveryHistoryEntry, HistoryPage, StateHistoryEntry};
pub use ids::{FailureId, JobId, ProjectId, StoryId, WorkflowId, WorkspaceId};
pub use state::PipelineState;
