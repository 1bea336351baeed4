//! The history journal (C2): an append-only durable log of state
//! transitions and failure-recovery events.
//!
//! `SqliteHistoryJournal` wraps a `rusqlite::Connection` behind a thin
//! `Arc<Mutex<_>>` (mirroring the teacher's `DbHandle` around `FactoryDb`)
//! so the synchronous SQLite calls can be driven from async callers without
//! a connection pool — SQLite itself serializes writers, and the journal's
//! own per-project lock (see [`crate::lock`]) already serializes writers
//! per project, so a single connection behind one mutex adds no additional
//! contention beyond what the spec already requires.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orchestrator_common::{
    FailureId, FailureRecoveryHistoryEntry, FailureSeverity, HistoryPage, PipelineState,
    ProjectId, StateHistoryEntry, WorkflowId, WorkspaceId,
};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal unavailable: {0}")]
    Internal(String),
}

impl From<rusqlite::Error> for JournalError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

/// Durable, append-only store for [`StateHistoryEntry`] and
/// [`FailureRecoveryHistoryEntry`] rows, plus the checkpoint table C7
/// shares the same connection with (see [`crate::checkpoint`]).
///
/// Abstraction over the relational store for testability. Real
/// implementation: [`SqliteHistoryJournal`]. A deployment that prefers
/// Postgres/MySQL need only provide another implementation of this trait —
/// the state machine and recovery engine depend on the trait, not on
/// SQLite.
#[async_trait]
pub trait HistoryJournal: Send + Sync {
    async fn append_state_transition(
        &self,
        project_id: &ProjectId,
        workspace_id: &WorkspaceId,
        workflow_id: &WorkflowId,
        previous_state: Option<PipelineState>,
        new_state: PipelineState,
        triggered_by: &str,
        reason: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) -> Result<StateHistoryEntry, JournalError>;

    async fn append_failure_recovery(
        &self,
        project_id: &ProjectId,
        workspace_id: &WorkspaceId,
        failure_id: &FailureId,
        failure_type: &str,
        severity: FailureSeverity,
        recovery_strategy: &str,
        success: bool,
        retry_count_before: u32,
        retry_count_after: u32,
        checkpoint_id: Option<&str>,
        details: Option<&str>,
    ) -> Result<FailureRecoveryHistoryEntry, JournalError>;

    async fn list_by_project(
        &self,
        project_id: &ProjectId,
        workspace_id: &WorkspaceId,
        limit: u32,
        offset: u32,
    ) -> Result<HistoryPage<StateHistoryEntry>, JournalError>;

    async fn list_failure_recovery_by_project(
        &self,
        project_id: &ProjectId,
    ) -> Result<Vec<FailureRecoveryHistoryEntry>, JournalError>;

    /// Whether the most recent row for `project_id` recorded a terminal
    /// `new_state` — used by the sweeper to recognise a crash between
    /// history-write and hot-context delete.
    async fn latest_state_is_terminal(
        &self,
        project_id: &ProjectId,
    ) -> Result<bool, JournalError>;

    /// Fill in the outcome of a failure-recovery row that was opened with
    /// `recovery_strategy = "pending"` in `append_failure_recovery` (spec.md
    /// section 4.6 step 5: "Update the recovery-history row with the final
    /// recoveryStrategy, success, and retryCountAfter"). This is the one
    /// place the journal departs from pure append-only semantics — the
    /// *sequence* of rows is still immutable, only the single row
    /// representing the in-flight classification is completed.
    async fn finalize_failure_recovery(
        &self,
        id: i64,
        recovery_strategy: &str,
        success: bool,
        retry_count_after: u32,
        checkpoint_id: Option<&str>,
        details: Option<&str>,
    ) -> Result<(), JournalError>;
}

/// `rusqlite`-backed [`HistoryJournal`].
pub struct SqliteHistoryJournal {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteHistoryJournal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, JournalError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, JournalError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, JournalError> {
        run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Share the underlying connection with a [`crate::checkpoint::SqliteCheckpointStore`]
    /// so C2 and C7 read/write the same SQLite file without a second
    /// connection (spec.md section 6 allows "relational row; implementer's
    /// choice" for checkpoints).
    pub fn connection_handle(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }
}

fn run_migrations(conn: &Connection) -> Result<(), JournalError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS pipeline_state_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id TEXT NOT NULL,
            workspace_id TEXT NOT NULL,
            workflow_id TEXT NOT NULL,
            previous_state TEXT,
            new_state TEXT NOT NULL,
            triggered_by TEXT NOT NULL,
            reason TEXT,
            metadata TEXT,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS failure_recovery_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id TEXT NOT NULL,
            workspace_id TEXT NOT NULL,
            failure_id TEXT NOT NULL,
            failure_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            recovery_strategy TEXT NOT NULL,
            success INTEGER NOT NULL,
            retry_count_before INTEGER NOT NULL,
            retry_count_after INTEGER NOT NULL,
            checkpoint_id TEXT,
            details TEXT,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS pipeline_checkpoints (
            project_id TEXT NOT NULL,
            phase TEXT NOT NULL,
            context_snapshot TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            PRIMARY KEY (project_id, phase)
        );

        CREATE INDEX IF NOT EXISTS idx_state_history_project
            ON pipeline_state_history(project_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_failure_history_project
            ON failure_recovery_history(project_id, created_at);
        ",
    )?;
    Ok(())
}

fn state_to_str(state: PipelineState) -> String {
    state.to_string()
}

fn parse_state(raw: &str) -> Result<PipelineState, JournalError> {
    match raw {
        "idle" => Ok(PipelineState::Idle),
        "planning" => Ok(PipelineState::Planning),
        "implementing" => Ok(PipelineState::Implementing),
        "qa" => Ok(PipelineState::Qa),
        "deploying" => Ok(PipelineState::Deploying),
        "complete" => Ok(PipelineState::Complete),
        "failed" => Ok(PipelineState::Failed),
        "paused" => Ok(PipelineState::Paused),
        "awaiting_manual" => Ok(PipelineState::AwaitingManual),
        other => Err(JournalError::Internal(format!("unknown state {other}"))),
    }
}

fn severity_to_str(severity: FailureSeverity) -> &'static str {
    match severity {
        FailureSeverity::Low => "low",
        FailureSeverity::Medium => "medium",
        FailureSeverity::High => "high",
        FailureSeverity::Critical => "critical",
    }
}

fn parse_severity(raw: &str) -> Result<FailureSeverity, JournalError> {
    match raw {
        "low" => Ok(FailureSeverity::Low),
        "medium" => Ok(FailureSeverity::Medium),
        "high" => Ok(FailureSeverity::High),
        "critical" => Ok(FailureSeverity::Critical),
        other => Err(JournalError::Internal(format!("unknown severity {other}"))),
    }
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait]
impl HistoryJournal for SqliteHistoryJournal {
    async fn append_state_transition(
        &self,
        project_id: &ProjectId,
        workspace_id: &WorkspaceId,
        workflow_id: &WorkflowId,
        previous_state: Option<PipelineState>,
        new_state: PipelineState,
        triggered_by: &str,
        reason: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) -> Result<StateHistoryEntry, JournalError> {
        let conn = self.conn.lock().await;
        let metadata_json = metadata.as_ref().map(|v| v.to_string());
        conn.execute(
            "INSERT INTO pipeline_state_history
                (project_id, workspace_id, workflow_id, previous_state, new_state, triggered_by, reason, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                project_id.as_str(),
                workspace_id.as_str(),
                workflow_id.as_str(),
                previous_state.map(state_to_str),
                state_to_str(new_state),
                triggered_by,
                reason,
                metadata_json,
            ],
        )?;
        let id = conn.last_insert_rowid();
        let created_at: String = conn.query_row(
            "SELECT created_at FROM pipeline_state_history WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(StateHistoryEntry {
            id,
            project_id: project_id.clone(),
            workspace_id: workspace_id.clone(),
            workflow_id: workflow_id.clone(),
            previous_state,
            new_state,
            triggered_by: triggered_by.to_string(),
            reason: reason.map(str::to_string),
            metadata,
            created_at: parse_timestamp(&created_at),
        })
    }

    async fn append_failure_recovery(
        &self,
        project_id: &ProjectId,
        workspace_id: &WorkspaceId,
        failure_id: &FailureId,
        failure_type: &str,
        severity: FailureSeverity,
        recovery_strategy: &str,
        success: bool,
        retry_count_before: u32,
        retry_count_after: u32,
        checkpoint_id: Option<&str>,
        details: Option<&str>,
    ) -> Result<FailureRecoveryHistoryEntry, JournalError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO failure_recovery_history
                (project_id, workspace_id, failure_id, failure_type, severity, recovery_strategy,
                 success, retry_count_before, retry_count_after, checkpoint_id, details)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                project_id.as_str(),
                workspace_id.as_str(),
                failure_id.as_str(),
                failure_type,
                severity_to_str(severity),
                recovery_strategy,
                success,
                retry_count_before,
                retry_count_after,
                checkpoint_id,
                details,
            ],
        )?;
        let id = conn.last_insert_rowid();
        let created_at: String = conn.query_row(
            "SELECT created_at FROM failure_recovery_history WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(FailureRecoveryHistoryEntry {
            id,
            project_id: project_id.clone(),
            workspace_id: workspace_id.clone(),
            failure_id: failure_id.clone(),
            failure_type: failure_type.to_string(),
            severity,
            recovery_strategy: recovery_strategy.to_string(),
            success,
            retry_count_before,
            retry_count_after,
            checkpoint_id: checkpoint_id.map(str::to_string),
            details: details.map(str::to_string),
            created_at: parse_timestamp(&created_at),
        })
    }

    async fn list_by_project(
        &self,
        project_id: &ProjectId,
        workspace_id: &WorkspaceId,
        limit: u32,
        offset: u32,
    ) -> Result<HistoryPage<StateHistoryEntry>, JournalError> {
        let conn = self.conn.lock().await;
        let total: u64 = conn.query_row(
            "SELECT COUNT(*) FROM pipeline_state_history WHERE project_id = ?1 AND workspace_id = ?2",
            params![project_id.as_str(), workspace_id.as_str()],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(
            "SELECT id, project_id, workspace_id, workflow_id, previous_state, new_state,
                    triggered_by, reason, metadata, created_at
             FROM pipeline_state_history
             WHERE project_id = ?1 AND workspace_id = ?2
             ORDER BY created_at DESC, id DESC
             LIMIT ?3 OFFSET ?4",
        )?;
        let rows = stmt.query_map(
            params![project_id.as_str(), workspace_id.as_str(), limit, offset],
            |row| {
                let previous_state: Option<String> = row.get(4)?;
                let new_state: String = row.get(5)?;
                let metadata: Option<String> = row.get(8)?;
                let created_at: String = row.get(9)?;
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    previous_state,
                    new_state,
                    row.get::<_, String>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    metadata,
                    created_at,
                ))
            },
        )?;

        let mut items = Vec::new();
        for row in rows {
            let (id, pid, wid, wfid, previous_state, new_state, triggered_by, reason, metadata, created_at) =
                row?;
            items.push(StateHistoryEntry {
                id,
                project_id: ProjectId::new(pid),
                workspace_id: WorkspaceId::new(wid),
                workflow_id: WorkflowId::new(wfid),
                previous_state: previous_state.map(|s| parse_state(&s)).transpose()?,
                new_state: parse_state(&new_state)?,
                triggered_by,
                reason,
                metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
                created_at: parse_timestamp(&created_at),
            });
        }

        Ok(HistoryPage { items, total })
    }

    async fn list_failure_recovery_by_project(
        &self,
        project_id: &ProjectId,
    ) -> Result<Vec<FailureRecoveryHistoryEntry>, JournalError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, project_id, workspace_id, failure_id, failure_type, severity,
                    recovery_strategy, success, retry_count_before, retry_count_after,
                    checkpoint_id, details, created_at
             FROM failure_recovery_history
             WHERE project_id = ?1
             ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![project_id.as_str()], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, bool>(7)?,
                row.get::<_, u32>(8)?,
                row.get::<_, u32>(9)?,
                row.get::<_, Option<String>>(10)?,
                row.get::<_, Option<String>>(11)?,
                row.get::<_, String>(12)?,
            ))
        })?;

        let mut items = Vec::new();
        for row in rows {
            let (id, pid, wid, fid, ftype, severity, strategy, success, before, after, checkpoint_id, details, created_at) =
                row?;
            items.push(FailureRecoveryHistoryEntry {
                id,
                project_id: ProjectId::new(pid),
                workspace_id: WorkspaceId::new(wid),
                failure_id: FailureId::new(fid),
                failure_type: ftype,
                severity: parse_severity(&severity)?,
                recovery_strategy: strategy,
                success,
                retry_count_before: before,
                retry_count_after: after,
                checkpoint_id,
                details,
                created_at: parse_timestamp(&created_at),
            });
        }
        Ok(items)
    }

    async fn latest_state_is_terminal(
        &self,
        project_id: &ProjectId,
    ) -> Result<bool, JournalError> {
        let conn = self.conn.lock().await;
        let latest: Option<String> = conn
            .query_row(
                "SELECT new_state FROM pipeline_state_history
                 WHERE project_id = ?1
                 ORDER BY created_at DESC, id DESC LIMIT 1",
                params![project_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match latest {
            Some(raw) => parse_state(&raw)?.is_terminal(),
            None => false,
        })
    }

    async fn finalize_failure_recovery(
        &self,
        id: i64,
        recovery_strategy: &str,
        success: bool,
        retry_count_after: u32,
        checkpoint_id: Option<&str>,
        details: Option<&str>,
    ) -> Result<(), JournalError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE failure_recovery_history
             SET recovery_strategy = ?1, success = ?2, retry_count_after = ?3,
                 checkpoint_id = COALESCE(?4, checkpoint_id),
                 details = COALESCE(?5, details)
             WHERE id = ?6",
            params![recovery_strategy, success, retry_count_after, checkpoint_id, details, id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (ProjectId, WorkspaceId, WorkflowId) {
        (
            ProjectId::new("p1"),
            WorkspaceId::new("w1"),
            WorkflowId::new("wf1"),
        )
    }

    #[tokio::test]
    async fn append_and_list_round_trips() {
        let journal = SqliteHistoryJournal::open_in_memory().unwrap();
        let (p, w, wf) = ids();
        journal
            .append_state_transition(&p, &w, &wf, None, PipelineState::Planning, "system", None, None)
            .await
            .unwrap();
        journal
            .append_state_transition(
                &p,
                &w,
                &wf,
                Some(PipelineState::Planning),
                PipelineState::Implementing,
                "agent:planner",
                None,
                None,
            )
            .await
            .unwrap();

        let page = journal.list_by_project(&p, &w, 100, 0).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items.len(), 2);
        // ordered created_at desc: most recent first
        assert_eq!(page.items[0].new_state, PipelineState::Implementing);
        assert_eq!(page.items[1].new_state, PipelineState::Planning);
    }

    #[tokio::test]
    async fn list_with_limit_zero_returns_empty_page_with_correct_total() {
        let journal = SqliteHistoryJournal::open_in_memory().unwrap();
        let (p, w, wf) = ids();
        journal
            .append_state_transition(&p, &w, &wf, None, PipelineState::Planning, "system", None, None)
            .await
            .unwrap();
        let page = journal.list_by_project(&p, &w, 0, 0).await.unwrap();
        assert_eq!(page.total, 1);
        assert!(page.items.is_empty());
    }

    #[tokio::test]
    async fn latest_state_is_terminal_reflects_most_recent_row() {
        let journal = SqliteHistoryJournal::open_in_memory().unwrap();
        let (p, w, wf) = ids();
        assert!(!journal.latest_state_is_terminal(&p).await.unwrap());
        journal
            .append_state_transition(&p, &w, &wf, None, PipelineState::Planning, "system", None, None)
            .await
            .unwrap();
        assert!(!journal.latest_state_is_terminal(&p).await.unwrap());
        journal
            .append_state_transition(
                &p,
                &w,
                &wf,
                Some(PipelineState::Planning),
                PipelineState::Failed,
                "system",
                Some("aborted"),
                None,
            )
            .await
            .unwrap();
        assert!(journal.latest_state_is_terminal(&p).await.unwrap());
    }

    #[tokio::test]
    async fn failure_recovery_rows_persist_retry_counts() {
        let journal = SqliteHistoryJournal::open_in_memory().unwrap();
        let (p, w, _wf) = ids();
        let failure_id = FailureId::new("f1");
        journal
            .append_failure_recovery(
                &p,
                &w,
                &failure_id,
                "transient",
                FailureSeverity::Low,
                "retry",
                true,
                0,
                1,
                None,
                None,
            )
            .await
            .unwrap();
        let rows = journal.list_failure_recovery_by_project(&p).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].retry_count_after, 1);
        assert!(rows[0].success);
    }

    #[tokio::test]
    async fn finalize_failure_recovery_updates_the_pending_row() {
        let journal = SqliteHistoryJournal::open_in_memory().unwrap();
        let (p, w, _wf) = ids();
        let failure_id = FailureId::new("f1");
        let entry = journal
            .append_failure_recovery(
                &p,
                &w,
                &failure_id,
                "transient",
                FailureSeverity::Low,
                "pending",
                false,
                0,
                0,
                None,
                None,
            )
            .await
            .unwrap();

        journal
            .finalize_failure_recovery(entry.id, "retry", true, 1, None, Some("retried once"))
            .await
            .unwrap();

        let rows = journal.list_failure_recovery_by_project(&p).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].recovery_strategy, "retry");
        assert!(rows[0].success);
        assert_eq!(rows[0].retry_count_after, 1);
        assert_eq!(rows[0].details.as_deref(), Some("retried once"));
    }
}
