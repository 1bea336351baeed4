//! The hot state store (C1): hot KV store of per-project pipeline context.
//!
//! `StateStore` is the typed projection of the external KV host's contract
//! (`get/set/delete/setIfNotExists/scanKeys/expire`) onto the one value type
//! the core actually reads and writes: [`PipelineContext`]. A real
//! deployment backs this with Redis or similar; [`InMemoryStateStore`] is a
//! `DashMap`-backed implementation good enough to run the whole orchestrator
//! in a single process (and in tests).

mod memory;

pub use memory::InMemoryStateStore;

use async_trait::async_trait;
use orchestrator_common::{PipelineContext, ProjectId};
use thiserror::Error;

/// Boxed mutator passed to [`StateStore::update`]. Pulled into a type alias
/// so `#[async_trait]`'s argument-lifetime rewriting leaves the `'static`
/// bound on the trait object intact.
pub type ContextMutator = Box<dyn FnOnce(&mut PipelineContext) + Send + 'static>;

/// Failures from the state store. `Internal` maps to
/// [`orchestrator_common::OrchestratorError::Internal`] and is fatal to the
/// calling command (spec.md section 4.1: "store-unavailable is fatal").
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("pipeline already active for project {0}")]
    Conflict(ProjectId),
    #[error("store unavailable: {0}")]
    Internal(String),
}

/// Hot KV surface for per-project pipeline context.
///
/// Abstraction over the external KV host for testability. Real deployment:
/// a Redis-backed implementation (not included; the contract in spec.md
/// section 6 is all a deployment needs to satisfy). Test double / reference
/// implementation here: [`InMemoryStateStore`].
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Atomic create; fails with [`StoreError::Conflict`] if a context
    /// already exists for `context.project_id`. Sets the advisory TTL
    /// (`hot_context_ttl_seconds`) to bound orphaned hot rows.
    async fn create_if_absent(
        &self,
        context: PipelineContext,
        ttl_seconds: u64,
    ) -> Result<(), StoreError>;

    async fn get(&self, project_id: &ProjectId) -> Result<Option<PipelineContext>, StoreError>;

    /// Optimistic single-writer update: read, apply `mutator`, write back.
    /// Callers must hold the per-project lock (see [`crate::lock`]) before
    /// calling this — the store itself performs no locking beyond the
    /// atomicity of `create_if_absent`.
    async fn update(
        &self,
        project_id: &ProjectId,
        mutator: ContextMutator,
    ) -> Result<Option<PipelineContext>, StoreError>;

    async fn delete(&self, project_id: &ProjectId) -> Result<(), StoreError>;

    /// All live project ids, for the recovery sweeper's startup scan.
    async fn scan_project_ids(&self) -> Result<Vec<ProjectId>, StoreError>;
}
