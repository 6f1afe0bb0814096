//! Error types for Warden.
//!
//! Only caller-level misuse surfaces as `WardenError`. A single bad step is
//! reported through `StepResult`, never through `Err`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WardenError {
    #[error("Plan '{0}' must be approved before execution")]
    PlanNotApproved(String),

    #[error("Invalid step '{step}': {reason}")]
    InvalidStep { step: String, reason: String },

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Execution is not paused")]
    NotPaused,

    #[error("Step '{0}' is waiting for user input")]
    InputRequired(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl WardenError {
    pub fn code(&self) -> i32 {
        match self {
            WardenError::PlanNotApproved(_) => -32010,
            WardenError::InvalidStep { .. } => -32011,
            WardenError::InvalidPlan(_) => -32012,
            WardenError::NotPaused => -32013,
            WardenError::InputRequired(_) => -32014,
            WardenError::Config(_) => -32015,
            WardenError::Io(_) => -32006,
            WardenError::Json(_) => -32700,
            WardenError::Toml(_) => -32701,
        }
    }

    pub(crate) fn invalid_step(step: &str, reason: impl Into<String>) -> Self {
        WardenError::InvalidStep {
            step: step.to_string(),
            reason: reason.into(),
        }
    }
}

/// Error raised by a host tool executor.
///
/// The code and message are preserved verbatim in the failed `StepResult`.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("[{code}] {message}")]
pub struct ToolError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ToolError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Error raised by an external planner callback. Always degrades to local planning.
#[derive(Error, Debug, Clone)]
pub enum PlannerError {
    #[error("Planner unavailable: {0}")]
    Unavailable(String),

    #[error("Planner returned malformed output: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, WardenError>;
