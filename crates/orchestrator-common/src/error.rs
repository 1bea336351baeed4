//! The error taxonomy surfaced at the Control Surface boundary (C9).
//!
//! The component-local typed errors (`StoreError`, `JournalError`,
//! `CheckpointError`, `QueueError`, defined alongside their owning
//! components in `orchestrator-runtime`) have no direct conversion into
//! this enum: each call site maps its component error into the
//! `OrchestratorError` variant that fits the surrounding operation (a
//! store conflict becomes `Conflict`, everything else becomes
//! `Internal`). Every public operation still returns
//! `Result<T, OrchestratorError>`, and the boundary maps it to a
//! protocol-specific status without ever seeing the internals.

use crate::state::PipelineState;
use thiserror::Error;

/// The error kinds spec.md section 7 requires the Control Surface to surface.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// No such project context, history, or failure record, or a
    /// workspace/project mismatch.
    #[error("not found: {0}")]
    NotFound(String),

    /// Active pipeline exists for `start`, illegal state for
    /// `pause`/`resume`.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Malformed input: unknown action, incompatible reassignment target,
    /// negative counters, bounded parameter out of range.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// A specific subtype of `Conflict` carrying `(from, to)` for
    /// diagnostics.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        from: PipelineState,
        to: PipelineState,
    },

    /// Store/queue/event-bus failure; retryable by the caller at their
    /// discretion.
    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// `true` for the error kinds spec.md section 7 maps to a 4xx class at the boundary.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, Self::Internal(_))
    }
}
