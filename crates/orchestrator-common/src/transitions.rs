//! The legal-transitions graph (C3).
//!
//! Pure data: no I/O, no locking, every query is O(1) (a handful of
//! `matches!` arms compiled to a jump table). This is the single place the
//! forward-transition grammar from the spec's transition graph lives; the
//! state machine and the failure recovery engine both consult it instead of
//! re-deriving the graph.

use crate::state::PipelineState;

/// `phaseToEntryState`: which state a named phase dispatch lands in.
pub fn phase_to_entry_state(phase_name: &str) -> Option<PipelineState> {
    match phase_name {
        "planning" => Some(PipelineState::Planning),
        "implementing" => Some(PipelineState::Implementing),
        "qa" => Some(PipelineState::Qa),
        "deploying" => Some(PipelineState::Deploying),
        _ => None,
    }
}

/// The phase that follows `phase_name` in the forward graph, or the
/// rework target when `result.rework == true` for `qa`.
pub fn next_phase(phase_name: &str, rework: bool) -> Option<&'static str> {
    match (phase_name, rework) {
        ("planning", _) => Some("implementing"),
        ("implementing", _) => Some("qa"),
        ("qa", true) => Some("implementing"),
        ("qa", false) => Some("deploying"),
        ("deploying", _) => Some("complete"),
        _ => None,
    }
}

/// Whether `(from, to)` is a legal *forward* transition (the spec's grammar,
/// excluding the pause/resume/escalate/abort exceptional pairs which are
/// governed by dedicated operations rather than `transition`).
pub fn is_legal_forward(from: PipelineState, to: PipelineState) -> bool {
    use PipelineState::*;
    matches!(
        (from, to),
        (Idle, Planning)
            | (Planning, Implementing)
            | (Implementing, Qa)
            | (Qa, Deploying)
            | (Qa, Implementing)
            | (Deploying, Complete)
            | (Deploying, Failed)
    )
}
