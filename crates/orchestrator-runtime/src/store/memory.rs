//! `DashMap`-backed [`StateStore`] — a single-process stand-in for the
//! external KV host.

use super::{ContextMutator, StateStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use orchestrator_common::{PipelineContext, ProjectId};
use std::time::Duration;

struct Entry {
    context: PipelineContext,
    expires_at: DateTime<Utc>,
}

/// In-process hot store. Expired entries are reaped lazily on access (`get`,
/// `update`, `scan_project_ids`) rather than by a background timer, which is
/// sufficient because the advisory TTL only bounds *orphaned* rows — a
/// healthy pipeline keeps refreshing its own entry via `update`.
#[derive(Default)]
pub struct InMemoryStateStore {
    entries: DashMap<ProjectId, Entry>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_expired(entry: &Entry) -> bool {
        Utc::now() >= entry.expires_at
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn create_if_absent(
        &self,
        context: PipelineContext,
        ttl_seconds: u64,
    ) -> Result<(), StoreError> {
        let project_id = context.project_id.clone();
        // `DashMap::entry` takes the shard lock for the key's bucket,
        // giving us the atomic set-if-absent the external KV host
        // guarantees (spec.md section 4.1).
        match self.entries.entry(project_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(occupied) if !Self::is_expired(occupied.get()) => {
                Err(StoreError::Conflict(project_id))
            }
            entry => {
                let expires_at = Utc::now()
                    + chrono::Duration::from_std(Duration::from_secs(ttl_seconds))
                        .unwrap_or(chrono::Duration::zero());
                entry.insert(Entry { context, expires_at });
                Ok(())
            }
        }
    }

    async fn get(&self, project_id: &ProjectId) -> Result<Option<PipelineContext>, StoreError> {
        let entry = self.entries.get(project_id);
        match entry {
            Some(entry) if !Self::is_expired(&entry) => Ok(Some(entry.context.clone())),
            Some(entry) => {
                drop(entry);
                self.entries.remove(project_id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn update(
        &self,
        project_id: &ProjectId,
        mutator: ContextMutator,
    ) -> Result<Option<PipelineContext>, StoreError> {
        let Some(mut entry) = self.entries.get_mut(project_id) else {
            return Ok(None);
        };
        if Self::is_expired(&entry) {
            drop(entry);
            self.entries.remove(project_id);
            return Ok(None);
        }
        mutator(&mut entry.context);
        Ok(Some(entry.context.clone()))
    }

    async fn delete(&self, project_id: &ProjectId) -> Result<(), StoreError> {
        self.entries.remove(project_id);
        Ok(())
    }

    async fn scan_project_ids(&self) -> Result<Vec<ProjectId>, StoreError> {
        let expired: Vec<ProjectId> = self
            .entries
            .iter()
            .filter(|e| Self::is_expired(e.value()))
            .map(|e| e.key().clone())
            .collect();
        for id in &expired {
            self.entries.remove(id);
        }
        Ok(self.entries.iter().map(|e| e.key().clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_common::{PipelineState, WorkflowId, WorkspaceId};
    use std::collections::HashMap;

    fn ctx(project: &str) -> PipelineContext {
        PipelineContext::new_initial(
            ProjectId::new(project),
            WorkspaceId::new("w1"),
            WorkflowId::new("wf1"),
            None,
            3,
            HashMap::new(),
        )
    }

    #[tokio::test]
    async fn create_if_absent_rejects_second_create() {
        let store = InMemoryStateStore::new();
        store.create_if_absent(ctx("p1"), 604_800).await.unwrap();
        let err = store.create_if_absent(ctx("p1"), 604_800).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn update_applies_mutator_and_persists() {
        let store = InMemoryStateStore::new();
        store.create_if_absent(ctx("p1"), 604_800).await.unwrap();
        let updated = store
            .update(
                &ProjectId::new("p1"),
                Box::new(|c| c.enter_state(PipelineState::Implementing)),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.current_state, PipelineState::Implementing);
        let fetched = store.get(&ProjectId::new("p1")).await.unwrap().unwrap();
        assert_eq!(fetched.current_state, PipelineState::Implementing);
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let store = InMemoryStateStore::new();
        store.create_if_absent(ctx("p1"), 604_800).await.unwrap();
        store.delete(&ProjectId::new("p1")).await.unwrap();
        assert!(store.get(&ProjectId::new("p1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_entries_are_reaped_on_access() {
        let store = InMemoryStateStore::new();
        store.create_if_absent(ctx("p1"), 0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(store.get(&ProjectId::new("p1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn scan_project_ids_lists_all_live_projects() {
        let store = InMemoryStateStore::new();
        store.create_if_absent(ctx("p1"), 604_800).await.unwrap();
        store.create_if_absent(ctx("p2"), 604_800).await.unwrap();
        let mut ids = store.scan_project_ids().await.unwrap();
        ids.sort();
        assert_eq!(ids, vec![ProjectId::new("p1"), ProjectId::new("p2")]);
    }
}
