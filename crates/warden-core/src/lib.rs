//! Planning, safety and execution core for Warden.
//!
//! A request is classified, turned into a dependency-ordered plan of
//! risk-scored steps, held for approval, then executed with backups and a
//! persisted rollback stack.

pub mod adaptive;
pub mod complexity;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod executor;
pub mod intent;
pub mod plan;
pub mod planner;
pub mod presentation;
pub mod resolve;
pub mod risk;
pub mod safety;
pub mod session;
pub mod shell;
pub mod templates;

pub use adaptive::{
    classify_error, scope_drift, ErrorCategory, ErrorDiagnosis, ExecutionLearner, RecoveryBudget,
};
pub use complexity::{ComplexityAssessor, ComplexityLevel, ComplexityResult};
pub use config::{Verbosity, WardenConfig};
pub use context::{ContainerInfo, ContainerInventory, PackageManager, ServiceInfo, SystemContext};
pub use engine::{ProcessingResult, ReasoningEngine, RollbackEntry};
pub use error::{PlannerError, Result, ToolError, WardenError};
pub use executor::{
    ExecutionContext, ExecutionEngine, ExecutionState, ExecutionSummary, RecoveryPhase,
    StepApprover, StepResult, ToolExecutor,
};
pub use plan::{Probe, StepAction, StepStatus, StepType, TaskPlan, TaskStep};
pub use planner::{ExternalPlanner, PlanSource, PlannerProposal, StepDescriptor, TaskPlanner};
pub use risk::{assess_command_risk, assess_tool_risk, RiskAssessment, RiskLevel};
pub use safety::{RollbackAction, RollbackOutcome, SafetyManager, SystemSnapshot};
pub use session::{EngineFactory, SessionStore};
pub use shell::{CommandOutput, CommandRunner, ShellRunner};

/// Tool name for shell commands routed through a host tool executor
pub use plan::RUN_COMMAND_TOOL;
