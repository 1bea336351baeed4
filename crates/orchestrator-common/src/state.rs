//! The pipeline state alphabet.

use serde::{Deserialize, Serialize};

/// A pipeline's position in the finite state machine.
///
/// `Idle` only ever appears as the synthetic `previousState` of the very
/// first history row; no context is ever persisted while `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Planning,
    Implementing,
    Qa,
    Deploying,
    Complete,
    Failed,
    Paused,
    AwaitingManual,
}

impl PipelineState {
    /// Active states hold exactly one hot record in the state store.
    pub fn is_active(self) -> bool {
        !self.is_terminal() && self != Self::Idle
    }

    /// Terminal states have no live hot record once the sweeper converges.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Whether `pausePipeline` accepts a context currently in this state.
    pub fn is_pausable(self) -> bool {
        self.is_active() && self != Self::Paused
    }

    /// The four phase-bearing states, in forward execution order.
    pub fn phase_states() -> [PipelineState; 4] {
        [Self::Planning, Self::Implementing, Self::Qa, Self::Deploying]
    }

    /// Name used for dispatch to the agent job queue and for checkpoint
    /// keys (`pipeline:checkpoint:{projectId}:{phase}`).
    pub fn phase_name(self) -> Option<&'static str> {
        match self {
            Self::Planning => Some("planning"),
            Self::Implementing => Some("implementing"),
            Self::Qa => Some("qa"),
            Self::Deploying => Some("deploying"),
            _ => None,
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Planning => "planning",
            Self::Implementing => "implementing",
            Self::Qa => "qa",
            Self::Deploying => "deploying",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Paused => "paused",
            Self::AwaitingManual => "awaiting_manual",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_not_active() {
        assert!(!PipelineState::Complete.is_active());
        assert!(!PipelineState::Failed.is_active());
    }

    #[test]
    fn paused_is_active_but_not_pausable() {
        assert!(PipelineState::Paused.is_active());
        assert!(!PipelineState::Paused.is_pausable());
    }

    #[test]
    fn idle_is_neither_active_nor_terminal() {
        assert!(!PipelineState::Idle.is_active());
        assert!(!PipelineState::Idle.is_terminal());
    }

    #[test]
    fn phase_name_only_for_phase_states() {
        assert_eq!(PipelineState::Planning.phase_name(), Some("planning"));
        assert_eq!(PipelineState::Paused.phase_name(), None);
        assert_eq!(PipelineState::AwaitingManual.phase_name(), None);
    }
}
