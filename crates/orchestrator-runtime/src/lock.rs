//! Per-project single-writer lock table (spec.md section 5).
//!
//! A mapping from `ProjectId` to a single-permit mutex, guarded by
//! `DashMap`'s own sharded locking rather than one coarse
//! `std::sync::Mutex` around the whole map — this is the Rust-idiomatic
//! reading of "the lock table is itself guarded by a coarse mutex; entries
//! are reaped when the project terminates." Locks must be acquired before
//! any read-modify-write sequence on an existing context and released
//! before dispatching agent jobs or publishing events (dispatch happens
//! outside the critical section).

use dashmap::DashMap;
use orchestrator_common::ProjectId;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Holds one `tokio::sync::Mutex<()>` per live project.
#[derive(Default)]
pub struct ProjectLockTable {
    locks: DashMap<ProjectId, Arc<Mutex<()>>>,
}

impl ProjectLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `project_id`, creating its entry if this is the
    /// first mutator to touch it. The returned guard releases the lock on
    /// drop; callers must drop it before any suspension point that is not
    /// part of the serialized write (event publish, queue dispatch).
    pub async fn acquire(&self, project_id: &ProjectId) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(project_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Drop the table's reference to `project_id`'s lock once its pipeline
    /// has reached a terminal state. Safe to call while other holders still
    /// have the `Arc` — the mutex itself is only freed once the last
    /// reference drops.
    pub fn reap(&self, project_id: &ProjectId) {
        self.locks.remove(project_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn concurrent_acquires_for_same_project_serialize() {
        let table = Arc::new(ProjectLockTable::new());
        let project_id = ProjectId::new("p1");

        let guard = table.acquire(&project_id).await;
        let table2 = table.clone();
        let project_id2 = project_id.clone();
        let handle = tokio::spawn(async move {
            let _guard = table2.acquire(&project_id2).await;
        });

        tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        drop(guard);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn different_projects_do_not_contend() {
        let table = ProjectLockTable::new();
        let _g1 = table.acquire(&ProjectId::new("p1")).await;
        let g2 = tokio::time::timeout(
            tokio::time::Duration::from_millis(50),
            table.acquire(&ProjectId::new("p2")),
        )
        .await;
        assert!(g2.is_ok());
    }

    #[tokio::test]
    async fn reap_removes_the_table_entry() {
        let table = ProjectLockTable::new();
        let project_id = ProjectId::new("p1");
        drop(table.acquire(&project_id).await);
        table.reap(&project_id);
        assert!(!table.locks.contains_key(&project_id));
    }
}
