//! Configuration management for Warden.
//!
//! Loads settings from `$XDG_CONFIG_HOME/warden/config.toml` or uses defaults.
//! Every field has a serde default so partial files are fine.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::Result;

/// Config file name under the user config directory
pub const CONFIG_FILE: &str = "warden/config.toml";

/// Reasoning pipeline switches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningConfig {
    /// Master switch; when off every request is passed through untouched
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Classify requests automatically
    #[serde(default = "default_true")]
    pub auto_assess: bool,

    /// Plan even SIMPLE requests
    #[serde(default)]
    pub always_confirm: bool,

    /// Include per-step explanations in plan text
    #[serde(default = "default_true")]
    pub explain_steps: bool,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_assess: true,
            always_confirm: false,
            explain_steps: true,
        }
    }
}

/// Backup and rollback policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Backup root; defaults to `<data_local_dir>/warden/backups`
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,

    /// Back up critical files before steps that touch them
    #[serde(default = "default_true")]
    pub auto_backup_configs: bool,

    /// Roll back a HIGH/CRITICAL step's own action when it fails
    #[serde(default = "default_true")]
    pub rollback_on_failure: bool,

    /// Completed rollback entries older than this are pruned
    #[serde(default = "default_retention_days")]
    pub rollback_retention_days: u32,

    /// Timeout for a single rollback command
    #[serde(default = "default_rollback_timeout")]
    pub rollback_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_retention_days() -> u32 {
    7
}

fn default_rollback_timeout() -> u64 {
    60
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            backup_dir: None,
            auto_backup_configs: true,
            rollback_on_failure: true,
            rollback_retention_days: default_retention_days(),
            rollback_timeout_secs: default_rollback_timeout(),
        }
    }
}

impl SafetyConfig {
    /// Resolved backup directory
    pub fn backup_dir(&self) -> PathBuf {
        self.backup_dir.clone().unwrap_or_else(default_backup_dir)
    }
}

/// Default backup root
pub fn default_backup_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("warden")
        .join("backups")
}

/// Step execution limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Timeout for unscored steps and the floor for scored ones
    #[serde(default = "default_step_timeout")]
    pub default_step_timeout_secs: u64,

    /// Ceiling for any single step
    #[serde(default = "default_max_step_timeout")]
    pub max_step_timeout_secs: u64,

    /// Captured stdout/stderr is truncated to this many bytes
    #[serde(default = "default_max_output")]
    pub max_output_bytes: usize,

    /// With no step approver configured, park confirmation-requiring steps
    /// in WAITING_APPROVAL instead of running them on plan approval alone
    #[serde(default)]
    pub pause_for_step_approval: bool,

    /// Hard cap on operations (steps + alternatives) per execution
    #[serde(default = "default_max_operations")]
    pub max_total_operations: usize,

    /// Wall-clock cap per execution
    #[serde(default = "default_max_execution_time")]
    pub max_execution_time_secs: u64,

    /// Classify failed steps and try an injected fix before giving up
    #[serde(default = "default_true")]
    pub adaptive_recovery: bool,

    /// Injected fixes that add `sudo`, per execution
    #[serde(default = "default_max_escalations")]
    pub max_privilege_escalations: usize,

    /// Injected fix steps per execution
    #[serde(default = "default_max_injected")]
    pub max_injected_steps: usize,

    /// Automatic recoveries before control returns to the user
    #[serde(default = "default_recovery_checkpoint")]
    pub recovery_checkpoint_after: usize,

    /// Step signatures kept in the execution memory file
    #[serde(default = "default_max_learned")]
    pub max_learned_patterns: usize,
}

fn default_step_timeout() -> u64 {
    120
}

fn default_max_step_timeout() -> u64 {
    300
}

fn default_max_output() -> usize {
    10_000
}

fn default_max_operations() -> usize {
    25
}

fn default_max_execution_time() -> u64 {
    300
}

fn default_max_escalations() -> usize {
    3
}

fn default_max_injected() -> usize {
    5
}

fn default_recovery_checkpoint() -> usize {
    2
}

fn default_max_learned() -> usize {
    1000
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_secs: default_step_timeout(),
            max_step_timeout_secs: default_max_step_timeout(),
            max_output_bytes: default_max_output(),
            pause_for_step_approval: false,
            max_total_operations: default_max_operations(),
            max_execution_time_secs: default_max_execution_time(),
            adaptive_recovery: true,
            max_privilege_escalations: default_max_escalations(),
            max_injected_steps: default_max_injected(),
            recovery_checkpoint_after: default_recovery_checkpoint(),
            max_learned_patterns: default_max_learned(),
        }
    }
}

/// Planner tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// External planner output below this confidence defers to local planning
    #[serde(default = "default_min_confidence")]
    pub min_external_confidence: f32,
}

fn default_min_confidence() -> f32 {
    0.3
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            min_external_confidence: default_min_confidence(),
        }
    }
}

/// How much detail plan text carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Minimal,
    #[default]
    Normal,
    Detailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    #[serde(default)]
    pub verbosity: Verbosity,

    /// Show the literal command next to each step
    #[serde(default = "default_true")]
    pub show_commands: bool,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            verbosity: Verbosity::Normal,
            show_commands: true,
        }
    }
}

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    #[serde(default)]
    pub reasoning: ReasoningConfig,

    #[serde(default)]
    pub safety: SafetyConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub planner: PlannerConfig,

    #[serde(default)]
    pub conversation: ConversationConfig,
}

impl WardenConfig {
    /// Default config path (`$XDG_CONFIG_HOME/warden/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_FILE))
    }

    /// Load config from the default location, falling back to defaults
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_or_default(&path),
            None => {
                warn!("No config directory available, using defaults");
                Self::default()
            }
        }
    }

    /// Load config from a path, falling back to defaults on any error
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            info!("Config not found at {}, using defaults", path.display());
            return Self::default();
        }
        Self::load_from_path(path).unwrap_or_else(|e| {
            warn!("Failed to load config from {}: {}", path.display(), e);
            Self::default()
        })
    }

    /// Load config from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: WardenConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        use crate::error::WardenError;

        if self.execution.max_step_timeout_secs < self.execution.default_step_timeout_secs {
            return Err(WardenError::Config(format!(
                "max_step_timeout_secs ({}) is below default_step_timeout_secs ({})",
                self.execution.max_step_timeout_secs, self.execution.default_step_timeout_secs
            )));
        }
        if !(0.0..=1.0).contains(&self.planner.min_external_confidence) {
            return Err(WardenError::Config(format!(
                "min_external_confidence must be within 0..=1, got {}",
                self.planner.min_external_confidence
            )));
        }
        if self.execution.max_total_operations == 0 {
            return Err(WardenError::Config(
                "max_total_operations must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
