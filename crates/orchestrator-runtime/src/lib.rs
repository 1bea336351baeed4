//! The pipeline orchestrator's runtime: the hot store (C1), history
//! journal (C2), state machine (C4), recovery sweeper (C5), failure
//! recovery engine (C6), checkpoint store (C7), event bus adapter (C8),
//! and the thin Control Surface (C9) that wires them together.
//!
//! ## Persistence ownership
//!
//! | Layer                  | What it persists                                    |
//! |-------------------------|-----------------------------------------------------|
//! | `store` (C1)            | Hot `PipelineContext`, single source of truth for "is this pipeline active and what is it doing now" |
//! | `journal` (C2)           | Append-only transition and failure-recovery history, never the source of truth for liveness |
//! | `checkpoint` (C7)        | Named per-phase snapshots, read only by the recovery engine |
//!
//! Context is exclusively mutated by the state machine or the recovery
//! engine; the Control Surface only reads or forwards command requests.

pub mod checkpoint;
pub mod config;
pub mod control;
pub mod events;
pub mod journal;
pub mod lock;
pub mod queue;
pub mod recovery;
pub mod store;
pub mod sweeper;
pub mod transition;

pub use checkpoint::{CheckpointStore, SqliteCheckpointStore};
pub use config::OrchestratorConfig;
pub use control::ControlSurface;
pub use events::{EventBus, InProcessEventBus};
pub use journal::{HistoryJournal, SqliteHistoryJournal};
pub use queue::{AgentQueue, JobPayload, NullAgentQueue};
pub use recovery::FailureRecoveryEngine;
pub use store::{InMemoryStateStore, StateStore};
pub use sweeper::{RecoverySweeper, SweepSummary};
pub use transition::StateMachine;
