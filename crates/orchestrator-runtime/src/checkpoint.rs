//! Checkpoint store (C7): named per-phase snapshots used by the failure
//! recovery engine for rollback.
//!
//! Owned by C6 — only the recovery engine reads checkpoints; the state
//! machine writes via `save` on entry to each non-initial phase. Shares its
//! `rusqlite::Connection` with [`crate::journal::SqliteHistoryJournal`] via
//! [`SqliteHistoryJournal::connection_handle`] so both write the same
//! `pipeline_checkpoints` table the journal's migration creates.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orchestrator_common::{PipelineContext, ProjectId};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint store unavailable: {0}")]
    Internal(String),
}

impl From<rusqlite::Error> for CheckpointError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for CheckpointError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

/// A stored snapshot of context at a phase boundary.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub project_id: ProjectId,
    pub phase: String,
    pub context_snapshot: PipelineContext,
    pub created_at: DateTime<Utc>,
}

/// `save`/`load` only — spec.md section 4.7. Creating a new checkpoint for
/// the same `(project_id, phase)` key replaces the previous one.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(
        &self,
        project_id: &ProjectId,
        phase: &str,
        snapshot: &PipelineContext,
    ) -> Result<(), CheckpointError>;

    async fn load(
        &self,
        project_id: &ProjectId,
        phase: &str,
    ) -> Result<Option<Checkpoint>, CheckpointError>;

    /// Delete all checkpoints for `project_id` — called on terminal
    /// transition or explicit abort.
    async fn delete_all(&self, project_id: &ProjectId) -> Result<(), CheckpointError>;
}

pub struct SqliteCheckpointStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCheckpointStore {
    /// Share an existing connection (typically the journal's).
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Open a standalone connection, running the `pipeline_checkpoints`
    /// migration itself. Useful for tests that exercise C7 in isolation.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let conn = Connection::open(path)?;
        Self::migrate_and_wrap(conn)
    }

    pub fn open_in_memory() -> Result<Self, CheckpointError> {
        let conn = Connection::open_in_memory()?;
        Self::migrate_and_wrap(conn)
    }

    fn migrate_and_wrap(conn: Connection) -> Result<Self, CheckpointError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS pipeline_checkpoints (
                project_id TEXT NOT NULL,
                phase TEXT NOT NULL,
                context_snapshot TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                PRIMARY KEY (project_id, phase)
            );",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn save(
        &self,
        project_id: &ProjectId,
        phase: &str,
        snapshot: &PipelineContext,
    ) -> Result<(), CheckpointError> {
        let json = serde_json::to_string(snapshot)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO pipeline_checkpoints (project_id, phase, context_snapshot)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(project_id, phase) DO UPDATE SET
                context_snapshot = excluded.context_snapshot,
                created_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
            params![project_id.as_str(), phase, json],
        )?;
        Ok(())
    }

    async fn load(
        &self,
        project_id: &ProjectId,
        phase: &str,
    ) -> Result<Option<Checkpoint>, CheckpointError> {
        let conn = self.conn.lock().await;
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT context_snapshot, created_at FROM pipeline_checkpoints
                 WHERE project_id = ?1 AND phase = ?2",
                params![project_id.as_str(), phase],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((snapshot_json, created_at)) = row else {
            return Ok(None);
        };
        let snapshot: PipelineContext = serde_json::from_str(&snapshot_json)?;
        let created_at = DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());
        Ok(Some(Checkpoint {
            project_id: project_id.clone(),
            phase: phase.to_string(),
            context_snapshot: snapshot,
            created_at,
        }))
    }

    async fn delete_all(&self, project_id: &ProjectId) -> Result<(), CheckpointError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM pipeline_checkpoints WHERE project_id = ?1",
            params![project_id.as_str()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_common::{WorkflowId, WorkspaceId};
    use std::collections::HashMap;

    fn snapshot() -> PipelineContext {
        PipelineContext::new_initial(
            ProjectId::new("p1"),
            WorkspaceId::new("w1"),
            WorkflowId::new("wf1"),
            None,
            3,
            HashMap::new(),
        )
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let store = SqliteCheckpointStore::open_in_memory().unwrap();
        let project_id = ProjectId::new("p1");
        store.save(&project_id, "implementing", &snapshot()).await.unwrap();
        let loaded = store.load(&project_id, "implementing").await.unwrap().unwrap();
        assert_eq!(loaded.phase, "implementing");
    }

    #[tokio::test]
    async fn saving_twice_for_same_key_replaces_the_checkpoint() {
        let store = SqliteCheckpointStore::open_in_memory().unwrap();
        let project_id = ProjectId::new("p1");
        let mut first = snapshot();
        first.retry_count = 1;
        store.save(&project_id, "implementing", &first).await.unwrap();
        let mut second = snapshot();
        second.retry_count = 2;
        store.save(&project_id, "implementing", &second).await.unwrap();

        let loaded = store.load(&project_id, "implementing").await.unwrap().unwrap();
        assert_eq!(loaded.context_snapshot.retry_count, 2);
    }

    #[tokio::test]
    async fn delete_all_removes_every_phase_for_the_project() {
        let store = SqliteCheckpointStore::open_in_memory().unwrap();
        let project_id = ProjectId::new("p1");
        store.save(&project_id, "planning", &snapshot()).await.unwrap();
        store.save(&project_id, "implementing", &snapshot()).await.unwrap();
        store.delete_all(&project_id).await.unwrap();
        assert!(store.load(&project_id, "planning").await.unwrap().is_none());
        assert!(store.load(&project_id, "implementing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_checkpoint_returns_none() {
        let store = SqliteCheckpointStore::open_in_memory().unwrap();
        assert!(
            store
                .load(&ProjectId::new("p1"), "qa")
                .await
                .unwrap()
                .is_none()
        );
    }
}
