//! The state machine (C4): start / transition / pause / resume /
//! phase-completion. Validates against the transition table, writes to the
//! state store and history journal, dispatches the next-phase agent job.

use crate::checkpoint::CheckpointStore;
use crate::events::EventBus;
use crate::journal::HistoryJournal;
use crate::lock::ProjectLockTable;
use crate::queue::{AgentQueue, JobPayload};
use crate::store::StateStore;
use orchestrator_common::{
    HistoryPage, OrchestratorError, PipelineContext, PipelineEvent, PipelineState, ProjectId,
    StateHistoryEntry, StoryId, WorkflowId, WorkspaceId, ids, transitions,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Options accepted by `startPipeline`.
#[derive(Debug, Default)]
pub struct StartOptions {
    pub triggered_by: String,
    pub story_id: Option<StoryId>,
    pub max_retries: Option<u32>,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Result of `startPipeline`.
#[derive(Debug, Clone)]
pub struct StartResult {
    pub workflow_id: WorkflowId,
    pub state: PipelineState,
    pub message: String,
}

/// Result shared by `pausePipeline` / `resumePipeline`.
#[derive(Debug, Clone)]
pub struct StateChangeResult {
    pub previous_state: PipelineState,
    pub new_state: PipelineState,
    pub message: String,
}

/// The outcome of an agent phase, handed to `onPhaseComplete`.
#[derive(Debug, Clone, Default)]
pub struct PhaseResult {
    /// QA-fail rework: route back to `implementing` instead of forward.
    pub rework: bool,
}

pub struct StateMachine {
    store: Arc<dyn StateStore>,
    journal: Arc<dyn HistoryJournal>,
    checkpoints: Arc<dyn CheckpointStore>,
    queue: Arc<dyn AgentQueue>,
    events: Arc<dyn EventBus>,
    locks: Arc<ProjectLockTable>,
    default_max_retries: u32,
    hot_context_ttl_seconds: u64,
    agent_fallbacks: HashMap<String, Vec<String>>,
}

impl StateMachine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn StateStore>,
        journal: Arc<dyn HistoryJournal>,
        checkpoints: Arc<dyn CheckpointStore>,
        queue: Arc<dyn AgentQueue>,
        events: Arc<dyn EventBus>,
        locks: Arc<ProjectLockTable>,
        default_max_retries: u32,
        hot_context_ttl_seconds: u64,
        agent_fallbacks: HashMap<String, Vec<String>>,
    ) -> Self {
        Self {
            store,
            journal,
            checkpoints,
            queue,
            events,
            locks,
            default_max_retries,
            hot_context_ttl_seconds,
            agent_fallbacks,
        }
    }

    fn primary_agent_for(&self, phase: &str) -> String {
        self.agent_fallbacks
            .get(phase)
            .and_then(|list| list.first())
            .cloned()
            .unwrap_or_else(|| format!("{phase}-agent"))
    }

    async fn dispatch_phase(
        &self,
        project_id: &ProjectId,
        workflow_id: &WorkflowId,
        phase: &str,
        story_id: Option<StoryId>,
    ) {
        let agent_type = self.primary_agent_for(phase);
        let payload = JobPayload {
            project_id: project_id.clone(),
            workflow_id: workflow_id.clone(),
            phase: phase.to_string(),
            agent_type,
            story_id,
        };
        if let Err(err) = self.queue.enqueue(phase, payload, None).await {
            // spec.md section 7: queue dispatch failures do not roll back the
            // transition; they are recorded and surfaced as a transient
            // failure, leaving the pipeline in the new phase awaiting retry.
            warn!(%project_id, phase, error = %err, "failed to dispatch agent job");
        }
    }

    /// `startPipeline`.
    pub async fn start_pipeline(
        &self,
        project_id: ProjectId,
        workspace_id: WorkspaceId,
        options: StartOptions,
    ) -> Result<StartResult, OrchestratorError> {
        let _guard = self.locks.acquire(&project_id).await;

        let workflow_id = ids::new_workflow_id();
        let max_retries = options.max_retries.unwrap_or(self.default_max_retries);
        let context = PipelineContext::new_initial(
            project_id.clone(),
            workspace_id.clone(),
            workflow_id.clone(),
            options.story_id.clone(),
            max_retries,
            options.metadata,
        );

        self.store
            .create_if_absent(context, self.hot_context_ttl_seconds)
            .await
            .map_err(|err| match err {
                crate::store::StoreError::Conflict(id) => {
                    OrchestratorError::Conflict(format!("pipeline already active for project {id}"))
                }
                crate::store::StoreError::Internal(msg) => OrchestratorError::Internal(msg),
            })?;

        self.journal
            .append_state_transition(
                &project_id,
                &workspace_id,
                &workflow_id,
                Some(PipelineState::Idle),
                PipelineState::Planning,
                &options.triggered_by,
                None,
                None,
            )
            .await
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?;

        info!(%project_id, %workflow_id, "pipeline started");
        self.events.publish(PipelineEvent::Started {
            project_id: project_id.clone(),
            workflow_id: workflow_id.clone(),
        });

        self.dispatch_phase(&project_id, &workflow_id, "planning", options.story_id)
            .await;

        Ok(StartResult {
            workflow_id,
            state: PipelineState::Planning,
            message: "pipeline started".to_string(),
        })
    }

    /// `transition`: validated against the forward-transition graph only.
    /// Pause/resume/escalate/abort have dedicated entry points because they
    /// are exceptional pairs the spec deliberately keeps outside this
    /// operation's legality check (spec.md section 3: "any other pair is
    /// rejected").
    pub async fn transition(
        &self,
        project_id: &ProjectId,
        target: PipelineState,
        triggered_by: &str,
        reason: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) -> Result<PipelineContext, OrchestratorError> {
        let _guard = self.locks.acquire(project_id).await;

        let context = self
            .store
            .get(project_id)
            .await
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?
            .ok_or_else(|| OrchestratorError::NotFound(format!("no pipeline for {project_id}")))?;

        if !transitions::is_legal_forward(context.current_state, target) {
            return Err(OrchestratorError::InvalidTransition {
                from: context.current_state,
                to: target,
            });
        }

        self.write_transition(context, target, triggered_by, reason, metadata)
            .await
    }

    /// Shared write path for every legal transition, regardless of which
    /// public operation validated it: append the C2 row before mutating
    /// C1 (spec.md section 2's crash-recovery invariant), then update or
    /// delete the hot context.
    async fn write_transition(
        &self,
        context: PipelineContext,
        target: PipelineState,
        triggered_by: &str,
        reason: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) -> Result<PipelineContext, OrchestratorError> {
        let project_id = context.project_id.clone();
        let from = context.current_state;

        self.journal
            .append_state_transition(
                &project_id,
                &context.workspace_id,
                &context.workflow_id,
                Some(from),
                target,
                triggered_by,
                reason,
                metadata,
            )
            .await
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?;

        let updated = self
            .store
            .update(
                &project_id,
                Box::new(move |c| c.enter_state(target)),
            )
            .await
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?
            .ok_or_else(|| OrchestratorError::NotFound(format!("no pipeline for {project_id}")))?;

        if target.is_terminal() {
            self.store
                .delete(&project_id)
                .await
                .map_err(|e| OrchestratorError::Internal(e.to_string()))?;
            self.checkpoints
                .delete_all(&project_id)
                .await
                .map_err(|e| OrchestratorError::Internal(e.to_string()))?;
            self.locks.reap(&project_id);
        }

        info!(%project_id, from = %from, to = %target, "pipeline transitioned");
        self.events.publish(PipelineEvent::StateChanged {
            project_id,
            from: Some(from),
            to: target,
        });

        Ok(updated)
    }

    /// `pausePipeline`.
    pub async fn pause_pipeline(
        &self,
        project_id: &ProjectId,
        triggered_by: &str,
    ) -> Result<StateChangeResult, OrchestratorError> {
        let guard = self.locks.acquire(project_id).await;

        let context = self
            .store
            .get(project_id)
            .await
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?
            .ok_or_else(|| OrchestratorError::NotFound(format!("no pipeline for {project_id}")))?;

        if !context.current_state.is_pausable() {
            return Err(OrchestratorError::Conflict(format!(
                "project {project_id} is not pausable from {}",
                context.current_state
            )));
        }

        let previous_state = context.current_state;
        self.write_transition(context, PipelineState::Paused, triggered_by, None, None)
            .await?;
        drop(guard);

        self.events.publish(PipelineEvent::Paused {
            project_id: project_id.clone(),
            previous_state,
        });

        Ok(StateChangeResult {
            previous_state,
            new_state: PipelineState::Paused,
            message: "pipeline paused".to_string(),
        })
    }

    /// `resumePipeline`. Re-dispatches the entry job for the restored phase
    /// only if no active agent is recorded (spec.md section 9 ambiguity
    /// (a): pause may or may not have cancelled the in-flight agent; we
    /// take the safer reading).
    pub async fn resume_pipeline(
        &self,
        project_id: &ProjectId,
        triggered_by: &str,
    ) -> Result<StateChangeResult, OrchestratorError> {
        let guard = self.locks.acquire(project_id).await;

        let context = self
            .store
            .get(project_id)
            .await
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?
            .ok_or_else(|| OrchestratorError::NotFound(format!("no pipeline for {project_id}")))?;

        if context.current_state != PipelineState::Paused {
            return Err(OrchestratorError::Conflict(format!(
                "project {project_id} is not paused"
            )));
        }
        let Some(target) = context.previous_state.filter(|s| s.is_active() && !s.is_terminal())
        else {
            return Err(OrchestratorError::Conflict(format!(
                "project {project_id} has no resumable previous state"
            )));
        };

        let had_active_agent = context.active_agent_id.is_some();
        let workflow_id = context.workflow_id.clone();
        let story_id = context.current_story_id.clone();

        self.write_transition(context, target, triggered_by, None, None)
            .await?;
        drop(guard);

        self.events.publish(PipelineEvent::Resumed {
            project_id: project_id.clone(),
            new_state: target,
        });

        if !had_active_agent && let Some(phase) = target.phase_name() {
            self.dispatch_phase(project_id, &workflow_id, phase, story_id)
                .await;
        }

        Ok(StateChangeResult {
            previous_state: PipelineState::Paused,
            new_state: target,
            message: "pipeline resumed".to_string(),
        })
    }

    /// `onPhaseComplete`. Idempotent under duplicate delivery: a call for a
    /// phase the context has already moved past is a no-op.
    pub async fn on_phase_complete(
        &self,
        project_id: &ProjectId,
        phase_name: &str,
        result: PhaseResult,
    ) -> Result<PipelineContext, OrchestratorError> {
        let guard = self.locks.acquire(project_id).await;

        let context = self
            .store
            .get(project_id)
            .await
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?
            .ok_or_else(|| OrchestratorError::NotFound(format!("no pipeline for {project_id}")))?;

        let Some(expected_entry_state) = transitions::phase_to_entry_state(phase_name) else {
            return Err(OrchestratorError::BadRequest(format!(
                "unknown phase {phase_name}"
            )));
        };

        if context.current_state != expected_entry_state {
            info!(
                %project_id,
                phase_name,
                current = %context.current_state,
                "onPhaseComplete is a no-op: pipeline already past this phase"
            );
            return Ok(context);
        }

        let target = match transitions::next_phase(phase_name, result.rework) {
            Some("complete") => PipelineState::Complete,
            Some(next) => transitions::phase_to_entry_state(next).ok_or_else(|| {
                OrchestratorError::Internal(format!("phase table missing entry for {next}"))
            })?,
            None => {
                return Err(OrchestratorError::BadRequest(format!(
                    "phase {phase_name} has no successor"
                )));
            }
        };

        let workflow_id = context.workflow_id.clone();
        let story_id = context.current_story_id.clone();
        let triggered_by = format!("agent:{phase_name}");

        let updated = self
            .write_transition(context, target, &triggered_by, None, None)
            .await?;
        drop(guard);

        self.events.publish(PipelineEvent::PhaseCompleted {
            project_id: project_id.clone(),
            phase: phase_name.to_string(),
        });

        if let Some(next_phase_name) = target.phase_name() {
            self.checkpoints
                .save(project_id, next_phase_name, &updated)
                .await
                .map_err(|e| OrchestratorError::Internal(e.to_string()))?;
            self.dispatch_phase(project_id, &workflow_id, next_phase_name, story_id)
                .await;
        } else if target == PipelineState::Complete {
            self.events.publish(PipelineEvent::Completed {
                project_id: project_id.clone(),
                workflow_id,
            });
        }

        Ok(updated)
    }

    /// Plain read from C1; workspace scoping is enforced by the Control
    /// Surface (C9), not here.
    pub async fn get_state(
        &self,
        project_id: &ProjectId,
    ) -> Result<Option<PipelineContext>, OrchestratorError> {
        self.store
            .get(project_id)
            .await
            .map_err(|e| OrchestratorError::Internal(e.to_string()))
    }

    /// `getHistory`: a bounded page from C2.
    pub async fn journal_history(
        &self,
        project_id: &ProjectId,
        workspace_id: &WorkspaceId,
        limit: u32,
        offset: u32,
    ) -> Result<HistoryPage<StateHistoryEntry>, OrchestratorError> {
        self.journal
            .list_by_project(project_id, workspace_id, limit, offset)
            .await
            .map_err(|e| OrchestratorError::Internal(e.to_string()))
    }
}
