//! Unified configuration for the orchestrator runtime.
//!
//! Reads `.pipeline/orchestrator.toml` if present, then applies environment
//! overrides (`PIPELINE_<FIELD>`), then falls back to the documented
//! defaults. Layering is file -> environment -> caller-supplied override,
//! mirroring the teacher's `file -> environment -> CLI` convention.
//!
//! ```toml
//! max_retries = 3
//! retry_base_delay_seconds = 5
//! retry_max_delay_seconds = 300
//! stale_threshold_seconds = 1800
//! hot_context_ttl_seconds = 604800
//! history_page_cap = 100
//!
//! [agent_fallbacks]
//! planning = ["planner", "planner-fallback"]
//! implementing = ["implementer", "implementer-fallback"]
//! qa = ["qa-agent", "qa-agent-fallback"]
//! deploying = ["deployer", "deployer-fallback"]
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Recognised options, all with defaults (spec.md section 6, Environment /
/// configuration).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_retries: u32,
    pub retry_base_delay_seconds: u64,
    pub retry_max_delay_seconds: u64,
    pub stale_threshold_seconds: u64,
    pub hot_context_ttl_seconds: u64,
    pub history_page_cap: u32,
    /// Per-phase `[primary, alt1, alt2, ...]` fallback agent types, used by
    /// the `reassign` recovery strategy.
    pub agent_fallbacks: HashMap<String, Vec<String>>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let mut agent_fallbacks = HashMap::new();
        agent_fallbacks.insert("planning".to_string(), vec!["planner".to_string()]);
        agent_fallbacks.insert("implementing".to_string(), vec!["implementer".to_string()]);
        agent_fallbacks.insert("qa".to_string(), vec!["qa-agent".to_string()]);
        agent_fallbacks.insert("deploying".to_string(), vec!["deployer".to_string()]);

        Self {
            max_retries: 3,
            retry_base_delay_seconds: 5,
            retry_max_delay_seconds: 300,
            stale_threshold_seconds: 1800,
            hot_context_ttl_seconds: 604_800,
            history_page_cap: 100,
            agent_fallbacks,
        }
    }
}

impl OrchestratorConfig {
    /// Load from a TOML file at `path`, falling back to defaults for any
    /// field the file omits. Returns defaults outright if the file does
    /// not exist.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            toml::from_str(&raw)
                .with_context(|| format!("failed to parse config file {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply `PIPELINE_*` environment variable overrides on top of the
    /// loaded/default values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PIPELINE_MAX_RETRIES")
            && let Ok(parsed) = v.parse()
        {
            self.max_retries = parsed;
        }
        if let Ok(v) = std::env::var("PIPELINE_RETRY_BASE_DELAY_SECONDS")
            && let Ok(parsed) = v.parse()
        {
            self.retry_base_delay_seconds = parsed;
        }
        if let Ok(v) = std::env::var("PIPELINE_STALE_THRESHOLD_SECONDS")
            && let Ok(parsed) = v.parse()
        {
            self.stale_threshold_seconds = parsed;
        }
    }

    /// Fallback agent types configured for `phase`, in priority order
    /// (primary first). Empty if the phase has no configured fallbacks.
    pub fn fallbacks_for(&self, phase: &str) -> &[String] {
        self.agent_fallbacks
            .get(phase)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}
