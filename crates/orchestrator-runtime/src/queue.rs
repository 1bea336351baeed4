//! The agent job queue: an external collaborator the orchestrator only
//! enqueues to. Workers callback via the Control Surface
//! (`onPhaseComplete` / `reportFailure`); the orchestrator never polls or
//! awaits job completion directly.

use async_trait::async_trait;
use orchestrator_common::{JobId, ProjectId, StoryId, WorkflowId};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// The payload handed to `enqueue`. Workers receive this verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub project_id: ProjectId,
    pub workflow_id: WorkflowId,
    pub phase: String,
    pub agent_type: String,
    pub story_id: Option<StoryId>,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),
}

/// Abstraction over the external agent job queue, for testability. Real
/// deployment: a background job queue (Sidekiq/BullMQ-style) that runs
/// planner/implementer/QA/deploy agents. Test double here: [`NullAgentQueue`]
/// records dispatches without running anything.
#[async_trait]
pub trait AgentQueue: Send + Sync {
    async fn enqueue(
        &self,
        queue_name: &str,
        payload: JobPayload,
        delay: Option<Duration>,
    ) -> Result<JobId, QueueError>;
}

/// Records every dispatch in memory; never fails. Used by the CLI demo and
/// by tests that assert on dispatch counts (spec.md section 8 end-to-end
/// scenario 1: "four queue dispatches, one per non-terminal entry").
#[derive(Default)]
pub struct NullAgentQueue {
    dispatches: tokio::sync::Mutex<Vec<(String, JobPayload, Option<Duration>)>>,
}

impl NullAgentQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn dispatch_count(&self) -> usize {
        self.dispatches.lock().await.len()
    }

    pub async fn dispatches(&self) -> Vec<(String, JobPayload, Option<Duration>)> {
        self.dispatches.lock().await.clone()
    }
}

#[async_trait]
impl AgentQueue for NullAgentQueue {
    async fn enqueue(
        &self,
        queue_name: &str,
        payload: JobPayload,
        delay: Option<Duration>,
    ) -> Result<JobId, QueueError> {
        let id = JobId::new(uuid::Uuid::new_v4().to_string());
        self.dispatches
            .lock()
            .await
            .push((queue_name.to_string(), payload, delay));
        Ok(id)
    }
}
