//! The failure recovery engine (C6): classifies a reported failure into a
//! strategy, executes it, and tracks Active Failure Records pending human
//! override.

use crate::checkpoint::CheckpointStore;
use crate::events::EventBus;
use crate::journal::HistoryJournal;
use crate::lock::ProjectLockTable;
use crate::queue::{AgentQueue, JobPayload};
use crate::store::StateStore;
use dashmap::DashMap;
use orchestrator_common::{
    ActiveFailureRecord, FailureId, FailureSeverity, FailureType, OrchestratorError,
    PipelineContext, PipelineEvent, PipelineState, ProjectId, RecoveryStrategy, WorkflowId,
    WorkspaceId, ids,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};

/// The outcome of one `handleFailure` or `handleManualOverride` invocation.
#[derive(Debug, Clone)]
pub struct RecoveryResult {
    pub failure_id: Option<FailureId>,
    pub strategy: RecoveryStrategy,
    pub success: bool,
    pub message: String,
}

/// `getRecoveryStatus` response.
#[derive(Debug, Clone)]
pub struct RecoveryStatus {
    pub project_id: ProjectId,
    pub active_failures: Vec<ActiveFailureRecord>,
    pub is_escalated: bool,
    pub total_retries: u32,
    pub max_retries: u32,
}

/// `handleManualOverride`'s `action` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideAction {
    Retry,
    Rollback,
    Reassign,
    ProvideGuidance,
    Terminate,
}

impl OverrideAction {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "retry" => Some(Self::Retry),
            "rollback" => Some(Self::Rollback),
            "reassign" => Some(Self::Reassign),
            "provide_guidance" => Some(Self::ProvideGuidance),
            "terminate" => Some(Self::Terminate),
            _ => None,
        }
    }
}

pub struct FailureRecoveryEngine {
    store: Arc<dyn StateStore>,
    journal: Arc<dyn HistoryJournal>,
    checkpoints: Arc<dyn CheckpointStore>,
    queue: Arc<dyn AgentQueue>,
    events: Arc<dyn EventBus>,
    locks: Arc<ProjectLockTable>,
    retry_base_delay_seconds: u64,
    retry_max_delay_seconds: u64,
    agent_fallbacks: HashMap<String, Vec<String>>,
    /// Keyed by `failureId`; at most one live entry per `projectId`.
    active: DashMap<FailureId, ActiveFailureRecord>,
    by_project: DashMap<ProjectId, FailureId>,
}

impl FailureRecoveryEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn StateStore>,
        journal: Arc<dyn HistoryJournal>,
        checkpoints: Arc<dyn CheckpointStore>,
        queue: Arc<dyn AgentQueue>,
        events: Arc<dyn EventBus>,
        locks: Arc<ProjectLockTable>,
        retry_base_delay_seconds: u64,
        retry_max_delay_seconds: u64,
        agent_fallbacks: HashMap<String, Vec<String>>,
    ) -> Self {
        Self {
            store,
            journal,
            checkpoints,
            queue,
            events,
            locks,
            retry_base_delay_seconds,
            retry_max_delay_seconds,
            agent_fallbacks,
            active: DashMap::new(),
            by_project: DashMap::new(),
        }
    }

    fn backoff_delay(&self, retry_count: u32) -> Duration {
        let exp = retry_count.saturating_sub(1).min(16);
        let seconds = self
            .retry_base_delay_seconds
            .saturating_mul(1u64 << exp)
            .min(self.retry_max_delay_seconds);
        Duration::from_secs(seconds)
    }

    /// Whether `context`'s phase has a configured fallback agent distinct
    /// from the one currently active (spec.md: reassign "if the phase
    /// allows," else retry).
    fn has_reassign_target(&self, context: &PipelineContext) -> bool {
        let Some(phase) = context.current_state.phase_name() else {
            return false;
        };
        self.agent_fallbacks.get(phase).is_some_and(|fallbacks| {
            fallbacks
                .iter()
                .any(|a| Some(a.as_str()) != context.active_agent_type.as_deref())
        })
    }

    async fn dispatch(
        &self,
        context: &PipelineContext,
        phase: &str,
        agent_type: &str,
        delay: Option<Duration>,
    ) {
        let payload = JobPayload {
            project_id: context.project_id.clone(),
            workflow_id: context.workflow_id.clone(),
            phase: phase.to_string(),
            agent_type: agent_type.to_string(),
            story_id: context.current_story_id.clone(),
        };
        if let Err(err) = self.queue.enqueue(phase, payload, delay).await {
            warn!(project_id = %context.project_id, phase, error = %err, "recovery dispatch failed");
        }
    }

    /// `reportFailure` / `handleFailure`.
    pub async fn handle_failure(
        &self,
        project_id: &ProjectId,
        _workflow_id: &WorkflowId,
        failure_type: FailureType,
        severity: FailureSeverity,
        details: Option<&str>,
    ) -> Result<RecoveryResult, OrchestratorError> {
        let guard = self.locks.acquire(project_id).await;

        let Some(context) = self
            .store
            .get(project_id)
            .await
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?
        else {
            return Ok(RecoveryResult {
                failure_id: None,
                strategy: RecoveryStrategy::Pending,
                success: true,
                message: "already_resolved".to_string(),
            });
        };
        if context.current_state.is_terminal() {
            return Ok(RecoveryResult {
                failure_id: None,
                strategy: RecoveryStrategy::Pending,
                success: true,
                message: "already_resolved".to_string(),
            });
        }

        let failure_id = ids::new_failure_id();
        let failure_type_str = failure_type_to_str(failure_type);
        let row = self
            .journal
            .append_failure_recovery(
                project_id,
                &context.workspace_id,
                &failure_id,
                failure_type_str,
                severity,
                "pending",
                false,
                context.retry_count,
                context.retry_count,
                None,
                details,
            )
            .await
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?;

        let selected = if matches!(failure_type, FailureType::Fatal)
            || (severity == FailureSeverity::Critical && context.retry_count > 0)
        {
            RecoveryStrategy::Abort
        } else if context.retry_count >= context.max_retries {
            RecoveryStrategy::Escalate
        } else {
            let default = failure_type.default_strategy();
            if default == RecoveryStrategy::Reassign && !self.has_reassign_target(&context) {
                RecoveryStrategy::Retry
            } else {
                default
            }
        };

        let (final_strategy, success, retry_count_after) = self
            .execute_strategy(context, &failure_id, failure_type, severity, selected, guard)
            .await?;

        self.journal
            .finalize_failure_recovery(
                row.id,
                recovery_strategy_to_str(final_strategy),
                success,
                retry_count_after,
                None,
                details,
            )
            .await
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?;

        info!(%project_id, strategy = %final_strategy, success, "failure recovery executed");

        match final_strategy {
            RecoveryStrategy::Escalate => {
                self.events.publish(PipelineEvent::FailureEscalated {
                    project_id: project_id.clone(),
                    failure_id: failure_id.clone(),
                    failure_type,
                    severity,
                });
                // Escalation's concrete actionable signal for humans (spec.md
                // section 4.6.4), distinct from the classification-level
                // failureEscalated event above.
                self.events.publish(PipelineEvent::ManualOverrideRequired {
                    project_id: project_id.clone(),
                    failure_id: failure_id.clone(),
                });
            }
            RecoveryStrategy::Abort => self.events.publish(PipelineEvent::Aborted {
                project_id: project_id.clone(),
                reason: details.unwrap_or("aborted").to_string(),
            }),
            _ => self.events.publish(PipelineEvent::FailureRecovered {
                project_id: project_id.clone(),
                failure_id: failure_id.clone(),
                strategy: final_strategy,
            }),
        }

        Ok(RecoveryResult {
            failure_id: Some(failure_id),
            strategy: final_strategy,
            success,
            message: format!("{final_strategy}"),
        })
    }

    /// Executes the selected strategy, escalating in place if retry would
    /// exceed the budget (spec.md section 4.6.1: "retryCount > maxRetries
    /// after the increment -> promote to escalate in a single pass").
    async fn execute_strategy(
        &self,
        context: PipelineContext,
        failure_id: &FailureId,
        failure_type: FailureType,
        severity: FailureSeverity,
        strategy: RecoveryStrategy,
        guard: OwnedMutexGuard<()>,
    ) -> Result<(RecoveryStrategy, bool, u32), OrchestratorError> {
        match strategy {
            RecoveryStrategy::Retry => {
                self.retry(context, failure_id, failure_type, severity, guard).await
            }
            RecoveryStrategy::Rollback => self.rollback(context, guard).await,
            RecoveryStrategy::Reassign => self.reassign(context, None, guard).await,
            RecoveryStrategy::Escalate => {
                self.escalate(context, failure_id, failure_type, severity, guard).await
            }
            RecoveryStrategy::Abort => self.abort(context, guard).await,
            RecoveryStrategy::Pending => unreachable!("pending is never a selected strategy"),
        }
    }

    async fn retry(
        &self,
        context: PipelineContext,
        failure_id: &FailureId,
        failure_type: FailureType,
        severity: FailureSeverity,
        guard: OwnedMutexGuard<()>,
    ) -> Result<(RecoveryStrategy, bool, u32), OrchestratorError> {
        let project_id = context.project_id.clone();
        let new_retry_count = context.retry_count + 1;

        if new_retry_count > context.max_retries {
            return self.escalate(context, failure_id, failure_type, severity, guard).await;
        }

        let phase = context
            .current_state
            .phase_name()
            .ok_or_else(|| OrchestratorError::Conflict("retry target is not a phase".to_string()))?
            .to_string();
        let agent_type = context
            .active_agent_type
            .clone()
            .unwrap_or_else(|| format!("{phase}-agent"));

        self.store
            .update(
                &project_id,
                Box::new(move |c| c.retry_count = new_retry_count),
            )
            .await
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?;
        drop(guard);

        let delay = self.backoff_delay(new_retry_count);
        self.dispatch(&context, &phase, &agent_type, Some(delay)).await;

        Ok((RecoveryStrategy::Retry, true, new_retry_count))
    }

    async fn rollback(
        &self,
        context: PipelineContext,
        guard: OwnedMutexGuard<()>,
    ) -> Result<(RecoveryStrategy, bool, u32), OrchestratorError> {
        let project_id = context.project_id.clone();
        let phases = PipelineState::phase_states();
        let current_idx = phases
            .iter()
            .position(|s| *s == context.current_state)
            .ok_or_else(|| OrchestratorError::Conflict("rollback target is not a phase".to_string()))?;

        let current_phase = phases[current_idx].phase_name().unwrap();
        let checkpoint = match self
            .checkpoints
            .load(&project_id, current_phase)
            .await
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?
        {
            Some(cp) => Some(cp),
            None if current_idx > 0 => {
                let prev_phase = phases[current_idx - 1].phase_name().unwrap();
                self.checkpoints
                    .load(&project_id, prev_phase)
                    .await
                    .map_err(|e| OrchestratorError::Internal(e.to_string()))?
            }
            None => None,
        };

        let Some(checkpoint) = checkpoint else {
            // No checkpoint to roll back to: fall back to a same-phase retry.
            return self.retry_without_escalation_check(context, guard).await;
        };

        let mut restored = checkpoint.context_snapshot;
        restored.retry_count = context.retry_count + 1;
        restored.max_retries = context.max_retries;
        restored.workflow_id = context.workflow_id.clone();
        let restored_state = restored.current_state;
        let retry_count_after = restored.retry_count;

        self.journal
            .append_state_transition(
                &project_id,
                &context.workspace_id,
                &context.workflow_id,
                Some(context.current_state),
                restored_state,
                "system:recovery",
                Some("rollback to checkpoint"),
                None,
            )
            .await
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?;

        self.store
            .update(&project_id, Box::new(move |c| *c = restored))
            .await
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?;
        drop(guard);

        if let Some(phase) = restored_state.phase_name() {
            let agent_type = context
                .active_agent_type
                .clone()
                .unwrap_or_else(|| format!("{phase}-agent"));
            self.dispatch(&context, phase, &agent_type, None).await;
        }

        Ok((RecoveryStrategy::Rollback, true, retry_count_after))
    }

    /// Used when rollback has no checkpoint to restore from.
    async fn retry_without_escalation_check(
        &self,
        context: PipelineContext,
        guard: OwnedMutexGuard<()>,
    ) -> Result<(RecoveryStrategy, bool, u32), OrchestratorError> {
        let project_id = context.project_id.clone();
        let new_retry_count = context.retry_count + 1;
        let phase = context
            .current_state
            .phase_name()
            .ok_or_else(|| OrchestratorError::Conflict("retry target is not a phase".to_string()))?
            .to_string();
        let agent_type = context
            .active_agent_type
            .clone()
            .unwrap_or_else(|| format!("{phase}-agent"));
        self.store
            .update(
                &project_id,
                Box::new(move |c| c.retry_count = new_retry_count),
            )
            .await
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?;
        drop(guard);
        self.dispatch(&context, &phase, &agent_type, None).await;
        Ok((RecoveryStrategy::Rollback, true, new_retry_count))
    }

    /// Validates `reassign_to` (when explicit) against the phase's
    /// configured fallback set without mutating anything. Callers that
    /// restore state before reassigning (`handleManualOverride`) must run
    /// this first so a rejected request leaves the context untouched.
    fn validate_reassign_target(
        &self,
        phase: &str,
        reassign_to: &str,
    ) -> Result<(), OrchestratorError> {
        let fallbacks = self.agent_fallbacks.get(phase);
        if !fallbacks.is_some_and(|f| f.iter().any(|a| a == reassign_to)) {
            return Err(OrchestratorError::BadRequest(format!(
                "{reassign_to} is not an allowed agent type for phase {phase}"
            )));
        }
        Ok(())
    }

    async fn reassign(
        &self,
        context: PipelineContext,
        reassign_to: Option<&str>,
        guard: OwnedMutexGuard<()>,
    ) -> Result<(RecoveryStrategy, bool, u32), OrchestratorError> {
        let project_id = context.project_id.clone();
        let phase = context
            .current_state
            .phase_name()
            .ok_or_else(|| OrchestratorError::Conflict("reassign target is not a phase".to_string()))?
            .to_string();

        let fallbacks = self
            .agent_fallbacks
            .get(&phase)
            .cloned()
            .unwrap_or_default();

        let chosen = if let Some(requested) = reassign_to {
            self.validate_reassign_target(&phase, requested)?;
            requested.to_string()
        } else {
            fallbacks
                .iter()
                .find(|a| Some(a.as_str()) != context.active_agent_type.as_deref())
                .cloned()
                .ok_or_else(|| {
                    OrchestratorError::Conflict(format!(
                        "no fallback agent configured for phase {phase}"
                    ))
                })?
        };

        let chosen_clone = chosen.clone();
        self.store
            .update(
                &project_id,
                Box::new(move |c| {
                    c.active_agent_type = Some(chosen_clone.clone());
                    c.active_agent_id = None;
                }),
            )
            .await
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?;
        drop(guard);

        self.dispatch(&context, &phase, &chosen, None).await;

        Ok((RecoveryStrategy::Reassign, true, context.retry_count))
    }

    async fn escalate(
        &self,
        context: PipelineContext,
        failure_id: &FailureId,
        failure_type: FailureType,
        severity: FailureSeverity,
        guard: OwnedMutexGuard<()>,
    ) -> Result<(RecoveryStrategy, bool, u32), OrchestratorError> {
        let project_id = context.project_id.clone();
        let retry_count = context.retry_count;

        self.journal
            .append_state_transition(
                &project_id,
                &context.workspace_id,
                &context.workflow_id,
                Some(context.current_state),
                PipelineState::AwaitingManual,
                "system:recovery",
                Some("escalated to manual review"),
                None,
            )
            .await
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?;

        self.store
            .update(
                &project_id,
                Box::new(move |c| c.enter_state(PipelineState::AwaitingManual)),
            )
            .await
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?;

        let record = ActiveFailureRecord {
            failure_id: failure_id.clone(),
            project_id: project_id.clone(),
            workspace_id: context.workspace_id.clone(),
            failure_type,
            severity,
            retry_count,
            escalated: true,
            created_at: chrono::Utc::now(),
        };
        self.active.insert(failure_id.clone(), record);
        self.by_project.insert(project_id.clone(), failure_id.clone());
        drop(guard);

        Ok((RecoveryStrategy::Escalate, true, retry_count))
    }

    async fn abort(
        &self,
        context: PipelineContext,
        guard: OwnedMutexGuard<()>,
    ) -> Result<(RecoveryStrategy, bool, u32), OrchestratorError> {
        let project_id = context.project_id.clone();
        let retry_count = context.retry_count;

        self.journal
            .append_state_transition(
                &project_id,
                &context.workspace_id,
                &context.workflow_id,
                Some(context.current_state),
                PipelineState::Failed,
                "system:recovery",
                Some("aborted"),
                None,
            )
            .await
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?;

        self.store
            .delete(&project_id)
            .await
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?;
        self.checkpoints
            .delete_all(&project_id)
            .await
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?;
        self.locks.reap(&project_id);
        drop(guard);

        Ok((RecoveryStrategy::Abort, true, retry_count))
    }

    /// `handleManualOverride`.
    pub async fn handle_manual_override(
        &self,
        workspace_id: &WorkspaceId,
        failure_id: &FailureId,
        action: OverrideAction,
        guidance: Option<&str>,
        reassign_to_agent_type: Option<&str>,
    ) -> Result<RecoveryResult, OrchestratorError> {
        let record = self
            .active
            .get(failure_id)
            .map(|r| r.clone())
            .ok_or_else(|| OrchestratorError::NotFound(format!("no active failure {failure_id}")))?;
        if &record.workspace_id != workspace_id {
            return Err(OrchestratorError::NotFound(format!(
                "no active failure {failure_id}"
            )));
        }

        let project_id = record.project_id.clone();
        let guard = self.locks.acquire(&project_id).await;

        let context = self
            .store
            .get(&project_id)
            .await
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?
            .ok_or_else(|| OrchestratorError::NotFound(format!("no pipeline for {project_id}")))?;

        if let OverrideAction::ProvideGuidance = action {
            if guidance.is_none() {
                return Err(OrchestratorError::BadRequest(
                    "provide_guidance requires a guidance string".to_string(),
                ));
            }
        }
        if let OverrideAction::Reassign = action {
            if reassign_to_agent_type.is_none() {
                return Err(OrchestratorError::BadRequest(
                    "reassign requires reassignToAgentType".to_string(),
                ));
            }
        }

        // First restore the context to its pre-escalation active state, since
        // every override action (except terminate) resumes execution there.
        let Some(prior_state) = context.previous_state.filter(|s| s.is_active() && !s.is_terminal())
        else {
            return Err(OrchestratorError::Conflict(
                "no resumable prior state for override".to_string(),
            ));
        };

        // Reassign must be validated against the phase's allowed fallback
        // set before the context is restored to active, so a rejected
        // request leaves the `awaiting_manual` context untouched.
        if let OverrideAction::Reassign = action {
            let requested = reassign_to_agent_type.unwrap();
            let phase = prior_state.phase_name().ok_or_else(|| {
                OrchestratorError::Conflict("reassign target is not a phase".to_string())
            })?;
            self.validate_reassign_target(phase, requested)?;
        }

        let (strategy, success, retry_count_after) = match action {
            OverrideAction::Retry => {
                let restored = self.restore_to_active(context, prior_state).await?;
                self.retry_without_escalation_check(restored, guard).await?
            }
            OverrideAction::Rollback => {
                let restored = self.restore_to_active(context, prior_state).await?;
                self.rollback(restored, guard).await?
            }
            OverrideAction::Reassign => {
                let restored = self.restore_to_active(context, prior_state).await?;
                self.reassign(restored, reassign_to_agent_type, guard).await?
            }
            OverrideAction::ProvideGuidance => {
                let guidance = guidance.unwrap().to_string();
                let project_id_clone = project_id.clone();
                self.store
                    .update(
                        &project_id_clone,
                        Box::new(move |c| {
                            c.metadata
                                .insert("userGuidance".to_string(), serde_json::json!(guidance));
                        }),
                    )
                    .await
                    .map_err(|e| OrchestratorError::Internal(e.to_string()))?;
                let restored = self.restore_to_active(context, prior_state).await?;
                self.retry_without_escalation_check(restored, guard).await?
            }
            OverrideAction::Terminate => self.abort(context, guard).await?,
        };

        self.journal
            .append_failure_recovery(
                &project_id,
                workspace_id,
                failure_id,
                "manual_override",
                record.severity,
                recovery_strategy_to_str(strategy),
                success,
                record.retry_count,
                retry_count_after,
                None,
                guidance,
            )
            .await
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?;

        self.active.remove(failure_id);
        self.by_project.remove(&project_id);

        Ok(RecoveryResult {
            failure_id: Some(failure_id.clone()),
            strategy,
            success,
            message: format!("manual override applied: {strategy}"),
        })
    }

    async fn restore_to_active(
        &self,
        context: PipelineContext,
        target: PipelineState,
    ) -> Result<PipelineContext, OrchestratorError> {
        let project_id = context.project_id.clone();
        self.journal
            .append_state_transition(
                &project_id,
                &context.workspace_id,
                &context.workflow_id,
                Some(context.current_state),
                target,
                "system:recovery",
                Some("manual override restoring active state"),
                None,
            )
            .await
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?;
        self.store
            .update(&project_id, Box::new(move |c| c.enter_state(target)))
            .await
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?
            .ok_or_else(|| OrchestratorError::NotFound(format!("no pipeline for {project_id}")))
    }

    /// `getRecoveryStatus`.
    pub async fn get_recovery_status(
        &self,
        project_id: &ProjectId,
    ) -> Result<RecoveryStatus, OrchestratorError> {
        let context = self
            .store
            .get(project_id)
            .await
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?;

        let active_failures: Vec<ActiveFailureRecord> = self
            .by_project
            .get(project_id)
            .and_then(|fid| self.active.get(fid.value()).map(|r| r.clone()))
            .into_iter()
            .collect();

        let (is_escalated, total_retries, max_retries) = match &context {
            Some(c) => (c.current_state == PipelineState::AwaitingManual, c.retry_count, c.max_retries),
            None => (!active_failures.is_empty(), 0, 0),
        };

        Ok(RecoveryStatus {
            project_id: project_id.clone(),
            active_failures,
            is_escalated,
            total_retries,
            max_retries,
        })
    }
}

fn failure_type_to_str(ft: FailureType) -> &'static str {
    match ft {
        FailureType::Transient => "transient",
        FailureType::Stalled => "stalled",
        FailureType::AgentError => "agent_error",
        FailureType::ValidationFailed => "validation_failed",
        FailureType::Fatal => "fatal",
    }
}

fn recovery_strategy_to_str(strategy: RecoveryStrategy) -> &'static str {
    match strategy {
        RecoveryStrategy::Pending => "pending",
        RecoveryStrategy::Retry => "retry",
        RecoveryStrategy::Rollback => "rollback",
        RecoveryStrategy::Reassign => "reassign",
        RecoveryStrategy::Escalate => "escalate",
        RecoveryStrategy::Abort => "abort",
    }
}
