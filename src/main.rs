//! CLI front-end for the pipeline orchestrator. Wires the runtime
//! components together behind a single-process, single-SQLite-file
//! deployment and exposes the Control Surface operations as subcommands.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use orchestrator_common::{FailureId, FailureSeverity, FailureType, ProjectId, WorkflowId, WorkspaceId};
use orchestrator_runtime::{
    ControlSurface, FailureRecoveryEngine, InMemoryStateStore, InProcessEventBus, NullAgentQueue,
    OrchestratorConfig, RecoverySweeper, SqliteCheckpointStore, SqliteHistoryJournal, StateMachine,
};
use orchestrator_runtime::lock::ProjectLockTable;
use orchestrator_runtime::transition::{PhaseResult, StartOptions};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pipeline-orchestrator", about = "Durable workspace pipeline orchestrator", version)]
struct Cli {
    /// Path to the SQLite file backing the history journal and checkpoints.
    /// `:memory:` runs an ephemeral in-process database.
    #[arg(long, global = true, default_value = ".pipeline/orchestrator.db")]
    db_path: String,

    /// Path to an `orchestrator.toml` config file.
    #[arg(long, global = true, default_value = ".pipeline/orchestrator.toml")]
    config_path: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a new pipeline run for a project.
    Start {
        project_id: String,
        workspace_id: String,
        #[arg(long)]
        story_id: Option<String>,
        #[arg(long)]
        triggered_by: Option<String>,
    },
    /// Print the current context for a project.
    State { project_id: String, workspace_id: String },
    /// Pause an active pipeline.
    Pause {
        project_id: String,
        workspace_id: String,
        #[arg(long, default_value = "user:cli")]
        triggered_by: String,
    },
    /// Resume a paused pipeline.
    Resume {
        project_id: String,
        workspace_id: String,
        #[arg(long, default_value = "user:cli")]
        triggered_by: String,
    },
    /// Print the transition history for a project.
    History {
        project_id: String,
        workspace_id: String,
        #[arg(long, default_value_t = 20)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },
    /// Simulate an agent phase callback.
    CompletePhase {
        project_id: String,
        phase: String,
        #[arg(long)]
        rework: bool,
    },
    /// Report a failure for a project.
    ReportFailure {
        project_id: String,
        workflow_id: String,
        #[arg(long, value_enum)]
        failure_type: CliFailureType,
        #[arg(long, value_enum, default_value = "medium")]
        severity: CliSeverity,
        #[arg(long)]
        details: Option<String>,
    },
    /// Resolve an Active Failure Record with a human decision.
    Override {
        workspace_id: String,
        failure_id: String,
        #[arg(long)]
        action: String,
        #[arg(long)]
        guidance: Option<String>,
        #[arg(long)]
        reassign_to: Option<String>,
    },
    /// Print recovery status for a project.
    RecoveryStatus { project_id: String },
    /// Run the startup recovery sweep and exit.
    Sweep,
}

#[derive(Clone, clap::ValueEnum)]
enum CliFailureType {
    Transient,
    Stalled,
    AgentError,
    ValidationFailed,
    Fatal,
}

impl From<CliFailureType> for FailureType {
    fn from(value: CliFailureType) -> Self {
        match value {
            CliFailureType::Transient => FailureType::Transient,
            CliFailureType::Stalled => FailureType::Stalled,
            CliFailureType::AgentError => FailureType::AgentError,
            CliFailureType::ValidationFailed => FailureType::ValidationFailed,
            CliFailureType::Fatal => FailureType::Fatal,
        }
    }
}

#[derive(Clone, clap::ValueEnum)]
enum CliSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl From<CliSeverity> for FailureSeverity {
    fn from(value: CliSeverity) -> Self {
        match value {
            CliSeverity::Low => FailureSeverity::Low,
            CliSeverity::Medium => FailureSeverity::Medium,
            CliSeverity::High => FailureSeverity::High,
            CliSeverity::Critical => FailureSeverity::Critical,
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

struct Runtime {
    control: ControlSurface,
    sweeper: RecoverySweeper,
}

fn build_runtime(cli: &Cli) -> Result<Runtime> {
    let config = OrchestratorConfig::load_or_default(&cli.config_path)
        .with_context(|| format!("loading config from {}", cli.config_path.display()))?;

    let store = Arc::new(InMemoryStateStore::new());
    let journal: Arc<SqliteHistoryJournal> = Arc::new(if cli.db_path == ":memory:" {
        SqliteHistoryJournal::open_in_memory().context("opening in-memory journal")?
    } else {
        if let Some(parent) = PathBuf::from(&cli.db_path).parent() {
            std::fs::create_dir_all(parent).ok();
        }
        SqliteHistoryJournal::open(&cli.db_path)
            .with_context(|| format!("opening journal at {}", cli.db_path))?
    });
    let checkpoints = Arc::new(SqliteCheckpointStore::new(journal.connection_handle()));
    let queue = Arc::new(NullAgentQueue::new());
    let events = Arc::new(InProcessEventBus::new());
    let locks = Arc::new(ProjectLockTable::new());

    let state_machine = Arc::new(StateMachine::new(
        store.clone(),
        journal.clone(),
        checkpoints.clone(),
        queue.clone(),
        events.clone(),
        locks.clone(),
        config.max_retries,
        config.hot_context_ttl_seconds,
        config.agent_fallbacks.clone(),
    ));
    let recovery = Arc::new(FailureRecoveryEngine::new(
        store.clone(),
        journal,
        checkpoints,
        queue,
        events,
        locks,
        config.retry_base_delay_seconds,
        config.retry_max_delay_seconds,
        config.agent_fallbacks.clone(),
    ));

    let sweeper = RecoverySweeper::new(store, recovery.clone(), config.stale_threshold_seconds);
    let control = ControlSurface::new(state_machine, recovery);

    Ok(Runtime { control, sweeper })
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let runtime = build_runtime(&cli)?;

    let summary = runtime.sweeper.sweep().await?;
    tracing::info!(
        total = summary.total,
        recovered = summary.recovered,
        stale = summary.stale,
        "startup recovery sweep complete"
    );

    match cli.command {
        Command::Start { project_id, workspace_id, story_id, triggered_by } => {
            let result = runtime
                .control
                .start_pipeline(
                    ProjectId::new(project_id),
                    WorkspaceId::new(workspace_id),
                    StartOptions {
                        triggered_by: triggered_by.unwrap_or_else(|| "user:cli".to_string()),
                        story_id: story_id.map(orchestrator_common::StoryId::new),
                        ..Default::default()
                    },
                )
                .await?;
            println!("{} workflow {} state {}", result.message, result.workflow_id, result.state);
        }
        Command::State { project_id, workspace_id } => {
            let context = runtime
                .control
                .get_state(&ProjectId::new(project_id), &WorkspaceId::new(workspace_id))
                .await?;
            println!("{}", serde_json::to_string_pretty(&context)?);
        }
        Command::Pause { project_id, workspace_id, triggered_by } => {
            let result = runtime
                .control
                .pause_pipeline(&ProjectId::new(project_id), &WorkspaceId::new(workspace_id), &triggered_by)
                .await?;
            println!("paused: {} -> {}", result.previous_state, result.new_state);
        }
        Command::Resume { project_id, workspace_id, triggered_by } => {
            let result = runtime
                .control
                .resume_pipeline(&ProjectId::new(project_id), &WorkspaceId::new(workspace_id), &triggered_by)
                .await?;
            println!("resumed: {} -> {}", result.previous_state, result.new_state);
        }
        Command::History { project_id, workspace_id, limit, offset } => {
            let page = runtime
                .control
                .get_history(&ProjectId::new(project_id), &WorkspaceId::new(workspace_id), limit, offset)
                .await?;
            for entry in &page.items {
                println!(
                    "{} {:?} -> {} ({})",
                    entry.created_at, entry.previous_state, entry.new_state, entry.triggered_by
                );
            }
            println!("total: {}", page.total);
        }
        Command::CompletePhase { project_id, phase, rework } => {
            let context = runtime
                .control
                .on_phase_complete(&ProjectId::new(project_id), &phase, PhaseResult { rework })
                .await?;
            println!("now in {}", context.current_state);
        }
        Command::ReportFailure { project_id, workflow_id, failure_type, severity, details } => {
            let result = runtime
                .control
                .report_failure(
                    &ProjectId::new(project_id),
                    &WorkflowId::new(workflow_id),
                    failure_type.into(),
                    severity.into(),
                    details.as_deref(),
                )
                .await?;
            println!("strategy: {} success: {}", result.strategy, result.success);
        }
        Command::Override { workspace_id, failure_id, action, guidance, reassign_to } => {
            let result = runtime
                .control
                .handle_manual_override(
                    &WorkspaceId::new(workspace_id),
                    &FailureId::new(failure_id),
                    &action,
                    guidance.as_deref(),
                    reassign_to.as_deref(),
                )
                .await?;
            println!("override applied: {}", result.message);
        }
        Command::RecoveryStatus { project_id } => {
            let status = runtime.control.get_recovery_status(&ProjectId::new(project_id)).await?;
            println!(
                "escalated: {} totalRetries: {} maxRetries: {} activeFailures: {}",
                status.is_escalated,
                status.total_retries,
                status.max_retries,
                status.active_failures.len()
            );
        }
        Command::Sweep => {
            println!("sweep already ran at startup: {summary:?}");
        }
    }

    Ok(())
}
