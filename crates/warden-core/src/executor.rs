//! Step execution.
//!
//! Runs an approved plan one step at a time. A failing step never escapes as
//! an `Err`: it becomes a failed `StepResult` and, for high-risk steps, an
//! attempt to undo the step's own recorded action. Only misuse (starting an
//! unapproved plan, resuming something that is not paused) returns `Err`.
//!
//! Once a step's alternatives are exhausted its error is classified and, when
//! a fix is known, the fix runs as an injected step ahead of a retry. Fixes
//! that drift outside the request or exceed the recovery budget pause the
//! plan instead. Step outcomes feed the execution memory kept next to the
//! rollback stack.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::adaptive::{
    classify_error, fix_step, scope_drift, ErrorCategory, ErrorDiagnosis, ExecutionLearner,
    RecoveryBudget, RecoveryLimits,
};
use crate::config::{ExecutionConfig, WardenConfig};
use crate::context::PackageManager;
use crate::error::{Result, ToolError, WardenError};
use crate::plan::{Probe, StepAction, StepStatus, StepType, TaskPlan, TaskStep};
use crate::risk::RiskLevel;
use crate::safety::{RollbackOutcome, SafetyManager, ORIGINAL_PATHS_KEY, ORIGINAL_PATH_KEY};
use crate::shell::{truncate_output, CommandRunner, ExecutionStatus};

const OUTPUT_PREVIEW_CHARS: usize = 200;
const SKIPPED_BY_USER: &str = "Step skipped by user";

// =============================================================================
// Host seams
// =============================================================================

/// Host tool dispatch for TOOL_CALL steps and tool probes
pub trait ToolExecutor: Send + Sync {
    fn execute(&self, name: &str, args: &Map<String, Value>) -> std::result::Result<Value, ToolError>;
}

/// Per-step confirmation for steps whose risk requires it
pub trait StepApprover: Send + Sync {
    fn approve(&self, step: &TaskStep) -> bool;
}

// =============================================================================
// Results and state
// =============================================================================

/// Where a step ended up in the retry/rollback state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPhase {
    Executing,
    Alternative(usize),
    /// Running an injected fix for the classified failure
    Adapting,
    RollingBack,
    /// Primary action succeeded
    Succeeded,
    /// An alternative succeeded
    Recovered,
    Failed,
    /// Failed, and the step's own action was undone
    RolledBack,
}

impl RecoveryPhase {
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Recovered | Self::Failed | Self::RolledBack
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub success: bool,
    pub output: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub duration_seconds: f64,
    #[serde(default)]
    pub needs_user_input: bool,
    #[serde(default)]
    pub user_prompt: Option<String>,
    /// Non-fatal safety problems, e.g. a backup that could not be taken
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub recovery: Option<RecoveryPhase>,
    /// Branch taken by a conditional step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<bool>,
    /// Every action run for this step, in order: primary, alternatives,
    /// injected fixes and retries
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<StepResult>,
    /// Classification of the primary action's failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnosis: Option<ErrorDiagnosis>,
}

impl StepResult {
    pub fn ok(step_id: &str, output: impl Into<String>) -> Self {
        Self {
            step_id: step_id.to_string(),
            success: true,
            output: output.into(),
            error: None,
            duration_seconds: 0.0,
            needs_user_input: false,
            user_prompt: None,
            warnings: Vec::new(),
            recovery: None,
            condition: None,
            attempts: Vec::new(),
            diagnosis: None,
        }
    }

    pub fn failed(step_id: &str, error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::ok(step_id, "")
        }
    }

    fn input_needed(step_id: &str, prompt: impl Into<String>) -> Self {
        Self {
            needs_user_input: true,
            user_prompt: Some(prompt.into()),
            ..Self::ok(step_id, "")
        }
    }

    /// Copy kept in `attempts`
    fn attempt(&self) -> Self {
        Self {
            attempts: Vec::new(),
            warnings: Vec::new(),
            ..self.clone()
        }
    }

    /// Hand control back to the user without running anything further
    fn checkpoint(&mut self, reason: impl Into<String>) {
        self.needs_user_input = true;
        self.user_prompt = Some(reason.into());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Idle,
    Running,
    Paused,
    WaitingApproval,
    Completed,
    Failed,
    RolledBack,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::WaitingApproval => "waiting_approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::RolledBack)
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub plan: TaskPlan,
    pub state: ExecutionState,
    /// Id of the step most recently started
    pub current_step: Option<String>,
    /// Latest result per step, in execution order
    pub step_results: Vec<StepResult>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Commands, tool calls and probes run so far, alternatives included
    pub operations_executed: usize,
    #[serde(default)]
    pub failure_reason: Option<String>,
    /// Steps approved one by one after WAITING_APPROVAL
    #[serde(default)]
    pub approved_steps: BTreeSet<String>,
    /// Injected fixes, escalations and recoveries so far
    #[serde(default)]
    pub recovery: RecoveryBudget,
}

impl ExecutionContext {
    pub fn new(plan: TaskPlan) -> Self {
        Self {
            plan,
            state: ExecutionState::Idle,
            current_step: None,
            step_results: Vec::new(),
            start_time: None,
            end_time: None,
            operations_executed: 0,
            failure_reason: None,
            approved_steps: BTreeSet::new(),
            recovery: RecoveryBudget::default(),
        }
    }

    pub fn result(&self, step_id: &str) -> Option<&StepResult> {
        self.step_results.iter().find(|r| r.step_id == step_id)
    }

    pub fn current(&self) -> Option<&TaskStep> {
        self.current_step.as_deref().and_then(|id| self.plan.step(id))
    }

    /// First failed result, if any
    pub fn first_failure(&self) -> Option<&StepResult> {
        self.step_results.iter().find(|r| !r.success)
    }

    fn record(&mut self, result: StepResult) {
        match self
            .step_results
            .iter_mut()
            .find(|r| r.step_id == result.step_id)
        {
            Some(existing) => *existing = result,
            None => self.step_results.push(result),
        }
    }

    fn finish(&mut self, state: ExecutionState) {
        self.state = state;
        self.end_time = Some(Utc::now());
    }

    fn fail(&mut self, reason: impl Into<String>) {
        self.failure_reason = Some(reason.into());
        self.finish(ExecutionState::Failed);
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        let start = self.start_time?;
        let end = self.end_time.unwrap_or_else(Utc::now);
        Some((end - start).num_milliseconds() as f64 / 1000.0)
    }

    pub fn summary(&self) -> ExecutionSummary {
        let (completed, total) = self.plan.progress();
        ExecutionSummary {
            plan_id: self.plan.id.clone(),
            title: self.plan.title.clone(),
            state: self.state,
            progress: format!("{}/{}", completed, total),
            duration_seconds: self.duration_seconds(),
            steps_completed: self.plan.count_status(StepStatus::Completed),
            steps_failed: self.plan.failed_steps.len(),
            steps_skipped: self.plan.count_status(StepStatus::Skipped),
            steps_blocked: self.plan.count_status(StepStatus::Blocked),
            current_step: self.current().map(|s| s.title.clone()),
            failure_reason: self.failure_reason.clone(),
            results: self
                .step_results
                .iter()
                .map(|r| ResultPreview {
                    step_id: r.step_id.clone(),
                    success: r.success,
                    output_preview: r.output.chars().take(OUTPUT_PREVIEW_CHARS).collect(),
                    error: r.error.clone(),
                    warnings: r.warnings.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultPreview {
    pub step_id: String,
    pub success: bool,
    pub output_preview: String,
    pub error: Option<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub plan_id: String,
    pub title: String,
    pub state: ExecutionState,
    /// "completed/total", where skipped steps count as completed
    pub progress: String,
    pub duration_seconds: Option<f64>,
    pub steps_completed: usize,
    pub steps_failed: usize,
    pub steps_skipped: usize,
    pub steps_blocked: usize,
    pub current_step: Option<String>,
    pub failure_reason: Option<String>,
    pub results: Vec<ResultPreview>,
}

// =============================================================================
// Engine
// =============================================================================

/// Outcome of running a probe
struct ProbeOutput {
    /// The probe could be run at all (it may still have exited non-zero)
    ran: bool,
    success: bool,
    output: String,
    error: Option<String>,
}

pub struct ExecutionEngine {
    safety: SafetyManager,
    runner: Arc<dyn CommandRunner>,
    tools: Option<Arc<dyn ToolExecutor>>,
    approver: Option<Arc<dyn StepApprover>>,
    execution: ExecutionConfig,
    auto_backup: bool,
    rollback_on_failure: bool,
    learner: ExecutionLearner,
    /// Source of install commands for missing dependencies
    package_manager: Option<PackageManager>,
}

impl fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("safety", &self.safety)
            .field("tools", &self.tools.is_some())
            .field("approver", &self.approver.is_some())
            .field("package_manager", &self.package_manager)
            .finish()
    }
}

impl ExecutionEngine {
    /// Commands run through the safety manager's runner
    pub fn new(safety: SafetyManager, config: &WardenConfig) -> Self {
        let runner = safety.runner().clone();
        let learner =
            ExecutionLearner::open(safety.backup_dir(), config.execution.max_learned_patterns);
        Self {
            safety,
            runner,
            tools: None,
            approver: None,
            execution: config.execution.clone(),
            auto_backup: config.safety.auto_backup_configs,
            rollback_on_failure: config.safety.rollback_on_failure,
            learner,
            package_manager: None,
        }
    }

    pub fn set_package_manager(&mut self, package_manager: Option<PackageManager>) {
        self.package_manager = package_manager;
    }

    pub fn with_tool_executor(mut self, tools: Arc<dyn ToolExecutor>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_approver(mut self, approver: Arc<dyn StepApprover>) -> Self {
        self.approver = Some(approver);
        self
    }

    pub fn safety(&self) -> &SafetyManager {
        &self.safety
    }

    pub fn safety_mut(&mut self) -> &mut SafetyManager {
        &mut self.safety
    }

    pub fn learner(&self) -> &ExecutionLearner {
        &self.learner
    }

    pub fn start_execution(&self, plan: TaskPlan) -> Result<ExecutionContext> {
        if !plan.approved {
            return Err(WardenError::PlanNotApproved(plan.id));
        }
        plan.validate()?;

        let mut ctx = ExecutionContext::new(plan);
        ctx.state = ExecutionState::Running;
        ctx.start_time = Some(Utc::now());
        info!(
            "Started execution of plan '{}' ({} steps)",
            ctx.plan.title,
            ctx.plan.steps.len()
        );
        Ok(ctx)
    }

    /// Run the next ready step. `None` when nothing ran.
    pub fn execute_next_step(&mut self, ctx: &mut ExecutionContext) -> Option<StepResult> {
        if ctx.state != ExecutionState::Running {
            return None;
        }

        let Some(index) = ctx.plan.next_ready_step() else {
            if ctx.plan.is_complete() {
                info!("Plan completed: {}", ctx.plan.title);
                ctx.finish(ExecutionState::Completed);
            } else {
                warn!("Plan {} has unfinished steps but none can run", ctx.plan.id);
                ctx.fail("No runnable step left but the plan is incomplete");
            }
            return None;
        };

        if let Some(reason) = self.budget_exceeded(ctx) {
            warn!("Stopping plan {}: {}", ctx.plan.id, reason);
            ctx.fail(reason);
            return None;
        }

        let step = ctx.plan.steps[index].clone();
        ctx.current_step = Some(step.id.clone());

        let mut warnings = Vec::new();
        let repeated = mutates(&step.action)
            .then(|| self.learner.repeated_failure(&step.action))
            .flatten();
        if (step.requires_confirmation() || repeated.is_some())
            && !ctx.approved_steps.contains(&step.id)
        {
            match &self.approver {
                Some(approver) => {
                    if !approver.approve(&step) {
                        info!("Step {} rejected", step.id);
                        return Some(skip_step(ctx, index, SKIPPED_BY_USER));
                    }
                }
                None if self.execution.pause_for_step_approval => {
                    info!("Waiting for approval of step {}", step.id);
                    ctx.state = ExecutionState::WaitingApproval;
                    return Some(StepResult::input_needed(
                        &step.id,
                        approval_prompt(&step, repeated),
                    ));
                }
                None => {
                    debug!("Step {} covered by plan approval", step.id);
                    if let Some(category) = repeated {
                        warnings.push(repeated_failure_note(category));
                    }
                }
            }
        }

        let started = Instant::now();
        {
            let running = &mut ctx.plan.steps[index];
            running.status = StepStatus::InProgress;
            running.started_at = Some(Utc::now());
        }
        info!("Executing step {} ({})", step.id, step.step_type());

        let recorded = if mutates(&step.action) {
            self.prepare_rollback(&step, &mut warnings)
        } else {
            None
        };

        let mut result = self.run_with_recovery(ctx, &step, recorded.as_deref());
        warnings.append(&mut result.warnings);
        result.warnings = warnings;
        result.duration_seconds = started.elapsed().as_secs_f64();

        if mutates(&step.action) {
            self.learn(&step, &result);
        }
        // Injected fixes shift the step
        let index = ctx.plan.index_of(&step.id).unwrap_or(index);
        apply_result(ctx, index, &step, &result);
        Some(result)
    }

    /// Run until nothing is ready, input is needed, or a high-risk step fails.
    ///
    /// True when every step finished and none failed.
    pub fn execute_all(&mut self, ctx: &mut ExecutionContext) -> bool {
        while ctx.state == ExecutionState::Running {
            let Some(result) = self.execute_next_step(ctx) else {
                break;
            };
            if result.needs_user_input {
                break;
            }
        }
        ctx.state == ExecutionState::Completed && !ctx.plan.has_failed()
    }

    /// Answer a WAITING_APPROVAL step; approval runs it immediately
    pub fn resolve_step_approval(
        &mut self,
        ctx: &mut ExecutionContext,
        approved: bool,
    ) -> Result<Option<StepResult>> {
        if ctx.state != ExecutionState::WaitingApproval {
            return Err(WardenError::NotPaused);
        }
        let Some((id, index)) = ctx
            .current_step
            .clone()
            .and_then(|id| ctx.plan.index_of(&id).map(|i| (id, i)))
        else {
            return Err(WardenError::InvalidPlan(
                "no step is waiting for approval".to_string(),
            ));
        };

        ctx.state = ExecutionState::Running;
        if approved {
            info!("Step {} approved", id);
            ctx.approved_steps.insert(id);
            Ok(self.execute_next_step(ctx))
        } else {
            info!("Step {} rejected", id);
            Ok(Some(skip_step(ctx, index, SKIPPED_BY_USER)))
        }
    }

    pub fn pause_execution(&self, ctx: &mut ExecutionContext) {
        if ctx.state == ExecutionState::Running {
            info!("Paused plan {}", ctx.plan.id);
            ctx.state = ExecutionState::Paused;
        }
    }

    /// Continue a paused execution; a waiting prompt step consumes `input`
    pub fn resume_execution(&mut self, ctx: &mut ExecutionContext, input: Option<&str>) -> Result<()> {
        if ctx.state != ExecutionState::Paused {
            return Err(WardenError::NotPaused);
        }

        let prompt_index = ctx
            .current_step
            .as_deref()
            .and_then(|id| ctx.plan.index_of(id))
            .filter(|&i| {
                let step = &ctx.plan.steps[i];
                step.status == StepStatus::InProgress && step.step_type() == StepType::UserPrompt
            });

        if let Some(index) = prompt_index {
            let id = ctx.plan.steps[index].id.clone();
            let Some(input) = input else {
                return Err(WardenError::InputRequired(id));
            };
            let step = &mut ctx.plan.steps[index];
            step.status = StepStatus::Completed;
            step.result = Some(input.to_string());
            step.completed_at = Some(Utc::now());
            ctx.plan.mark_completed(&id);
            ctx.record(StepResult::ok(&id, input));
            debug!("Step {} answered", id);
        }

        ctx.state = ExecutionState::Running;
        info!("Resumed plan {}", ctx.plan.id);
        Ok(())
    }

    /// Stop the plan. With `rollback`, every pending rollback action is
    /// attempted once, most recent first.
    pub fn abort_execution(
        &mut self,
        ctx: &mut ExecutionContext,
        rollback: bool,
    ) -> Vec<RollbackOutcome> {
        for step in ctx
            .plan
            .steps
            .iter_mut()
            .filter(|s| s.status.is_waiting() || s.status == StepStatus::InProgress)
        {
            step.status = StepStatus::Skipped;
            step.error = Some("Execution aborted".to_string());
        }
        ctx.fail("Execution aborted");
        warn!("Aborted plan {}", ctx.plan.id);

        if !rollback {
            return Vec::new();
        }

        let outcomes = self.safety.rollback_all();
        let failed = outcomes.iter().filter(|o| !o.success).count();
        if failed == 0 {
            ctx.state = ExecutionState::RolledBack;
            info!("Rolled back {} actions", outcomes.len());
        } else {
            warn!("{} of {} rollbacks failed", failed, outcomes.len());
        }
        outcomes
    }

    pub fn execution_summary(&self, ctx: &ExecutionContext) -> ExecutionSummary {
        ctx.summary()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn budget_exceeded(&self, ctx: &ExecutionContext) -> Option<String> {
        if ctx.operations_executed >= self.execution.max_total_operations {
            return Some(format!(
                "Operation budget of {} exhausted",
                self.execution.max_total_operations
            ));
        }
        let elapsed = ctx
            .start_time
            .map(|start| (Utc::now() - start).num_seconds().max(0) as u64)?;
        (elapsed >= self.execution.max_execution_time_secs).then(|| {
            format!(
                "Execution time budget of {}s exhausted",
                self.execution.max_execution_time_secs
            )
        })
    }

    /// Twice the estimate, clamped to the configured floor and ceiling
    fn step_timeout(&self, step: &TaskStep) -> Duration {
        let floor = self.execution.default_step_timeout_secs;
        let ceiling = self.execution.max_step_timeout_secs.max(floor);
        let secs = match &step.risk {
            Some(risk) => (risk.estimated_duration_seconds * 2).clamp(floor, ceiling),
            None => floor,
        };
        Duration::from_secs(secs)
    }

    /// Take backups and record one rollback action. Returns the action id.
    fn prepare_rollback(&mut self, step: &TaskStep, warnings: &mut Vec<String>) -> Option<String> {
        let mut saved: Vec<(PathBuf, PathBuf)> = Vec::new();
        if step.requires_backup() && !step.backup_paths.is_empty() {
            if self.auto_backup {
                for path in &step.backup_paths {
                    match self.safety.backup_file(path) {
                        Some(backup) => saved.push((path.clone(), backup)),
                        None => warnings.push(format!(
                            "Backup of {} failed; it cannot be restored automatically",
                            path.display()
                        )),
                    }
                }
            } else {
                debug!("Automatic backups disabled for step {}", step.id);
            }
        }

        if step.rollback_command.is_none() && saved.is_empty() {
            return None;
        }

        let mut state = BTreeMap::new();
        state.insert("step_id".to_string(), Value::String(step.id.clone()));
        if let Some((path, _)) = saved.first() {
            state.insert(
                ORIGINAL_PATH_KEY.to_string(),
                Value::String(path.display().to_string()),
            );
        }
        if saved.len() > 1 {
            let paths = saved
                .iter()
                .map(|(p, _)| Value::String(p.display().to_string()))
                .collect();
            state.insert(ORIGINAL_PATHS_KEY.to_string(), Value::Array(paths));
        }
        if !saved.is_empty() {
            let backups = saved
                .iter()
                .map(|(_, b)| Value::String(b.display().to_string()))
                .collect();
            state.insert("backup_paths".to_string(), Value::Array(backups));
        }

        match self.safety.record_action(
            &step.title,
            step.rollback_command.clone(),
            saved.first().map(|(_, b)| b.clone()),
            Some(state),
        ) {
            Ok(action) => Some(action.id),
            Err(e) => {
                warnings.push(format!("Could not record rollback for '{}': {}", step.title, e));
                None
            }
        }
    }

    /// Executing -> Alternative(n) -> Adapting -> RollingBack -> Failed | RolledBack
    fn run_with_recovery(
        &mut self,
        ctx: &mut ExecutionContext,
        step: &TaskStep,
        recorded: Option<&str>,
    ) -> StepResult {
        let timeout = self.step_timeout(step);
        let mut phase = RecoveryPhase::Executing;
        let mut result = StepResult::failed(&step.id, "Step did not run");
        let mut attempts = Vec::new();

        while !phase.is_terminal() {
            phase = match phase {
                RecoveryPhase::Executing => {
                    result = self.dispatch(ctx, &step.id, &step.action, timeout);
                    attempts.push(result.attempt());
                    if result.success {
                        RecoveryPhase::Succeeded
                    } else {
                        result.diagnosis = Some(self.diagnose(&step.action, &result));
                        self.after_failure(step, 0)
                    }
                }
                RecoveryPhase::Alternative(n) => match step.alternatives.get(n) {
                    Some(alternative) => {
                        info!("Trying alternative {} for step {}", n + 1, step.id);
                        let attempt = self.dispatch(ctx, &step.id, alternative, timeout);
                        attempts.push(attempt.attempt());
                        if attempt.success {
                            let warnings = std::mem::take(&mut result.warnings);
                            let diagnosis = result.diagnosis.take();
                            result = StepResult {
                                warnings,
                                diagnosis,
                                ..attempt
                            };
                            RecoveryPhase::Recovered
                        } else {
                            result.warnings.push(format!(
                                "Alternative {} failed: {}",
                                n + 1,
                                attempt.error.unwrap_or_default()
                            ));
                            self.after_failure(step, n + 1)
                        }
                    }
                    None => RecoveryPhase::Failed,
                },
                RecoveryPhase::Adapting => {
                    if self.adapt(ctx, step, &mut result, &mut attempts, timeout) {
                        RecoveryPhase::Recovered
                    } else {
                        self.give_up(step)
                    }
                }
                RecoveryPhase::RollingBack => {
                    warn!("High-risk step {} failed, rolling back", step.id);
                    match recorded {
                        Some(id) => {
                            let (ok, message) = self.safety.rollback_action(id);
                            if ok {
                                result.warnings.push(message);
                                RecoveryPhase::RolledBack
                            } else {
                                result
                                    .warnings
                                    .push(format!("Automatic rollback failed: {}", message));
                                RecoveryPhase::Failed
                            }
                        }
                        None => {
                            result
                                .warnings
                                .push("No rollback was recorded for this step".to_string());
                            RecoveryPhase::Failed
                        }
                    }
                }
                terminal => terminal,
            };
        }

        result.recovery = Some(phase);
        result.attempts = attempts;
        result
    }

    fn after_failure(&self, step: &TaskStep, next_alternative: usize) -> RecoveryPhase {
        if next_alternative < step.alternatives.len() {
            RecoveryPhase::Alternative(next_alternative)
        } else if self.execution.adaptive_recovery {
            RecoveryPhase::Adapting
        } else {
            self.give_up(step)
        }
    }

    fn give_up(&self, step: &TaskStep) -> RecoveryPhase {
        if self.rollback_on_failure && step.risk_level() >= RiskLevel::High {
            RecoveryPhase::RollingBack
        } else {
            RecoveryPhase::Failed
        }
    }

    fn diagnose(&self, action: &StepAction, result: &StepResult) -> ErrorDiagnosis {
        let error = result.error.as_deref().unwrap_or_default();
        classify_error(error, action.shell_command(), self.package_manager)
    }

    /// Run the diagnosed fix as a new plan step. True when the step is
    /// recovered; `result` then holds the recovered output.
    fn adapt(
        &self,
        ctx: &mut ExecutionContext,
        step: &TaskStep,
        result: &mut StepResult,
        attempts: &mut Vec<StepResult>,
        timeout: Duration,
    ) -> bool {
        let Some(diagnosis) = result.diagnosis.clone() else {
            return false;
        };
        if !diagnosis.is_retryable {
            return false;
        }
        let Some(fix) = fix_step(step, &diagnosis) else {
            debug!("No automatic fix for {} failure of {}", diagnosis.category, step.id);
            return false;
        };
        if ctx.plan.step(&fix.id).is_some() {
            debug!("Fix {} was already tried", fix.id);
            return false;
        }
        let Some(command) = fix.action.shell_command().map(str::to_string) else {
            return false;
        };

        if let Some(reason) = scope_drift(&ctx.plan.original_request, &command) {
            warn!("Fix for {} goes beyond the request: {}", step.id, reason);
            result.checkpoint(format!(
                "Step '{}' failed ({}). The fix `{}` was not run: {}. Continue with the remaining steps?",
                step.title, diagnosis.category, command, reason
            ));
            return false;
        }

        if fix.requires_confirmation() {
            match &self.approver {
                Some(approver) => {
                    if !approver.approve(&fix) {
                        info!("Fix {} rejected", fix.id);
                        result.warnings.push(format!("Fix `{}` was declined", command));
                        return false;
                    }
                }
                None if self.execution.pause_for_step_approval => {
                    result.checkpoint(format!(
                        "Step '{}' failed ({}). Suggested fix `{}` is {} risk and needs approval. Continue with the remaining steps?",
                        step.title,
                        diagnosis.category,
                        command,
                        fix.risk_level()
                    ));
                    return false;
                }
                None => debug!("Fix {} covered by plan approval", fix.id),
            }
        }

        let limits = RecoveryLimits::from(&self.execution);
        if let Err(reason) = ctx.recovery.admit(&command, &limits) {
            warn!(
                "Recovery limit for plan {}: {} ({})",
                ctx.plan.id,
                reason,
                ctx.recovery.status(&limits)
            );
            result.checkpoint(format!(
                "{}. Step '{}' failed ({}); suggested fix: `{}`. Continue with the remaining steps?",
                reason, step.title, diagnosis.category, command
            ));
            return false;
        }
        if let Some(reason) = self.budget_exceeded(ctx) {
            result.checkpoint(format!("{}. Continue with the remaining steps?", reason));
            return false;
        }

        let fixed = self.run_injected(ctx, step, fix, timeout);
        attempts.push(fixed.attempt());
        if !fixed.success {
            result.warnings.push(format!(
                "Fix `{}` failed: {}",
                command,
                fixed.error.unwrap_or_default()
            ));
            return false;
        }

        if diagnosis.fix_replaces_step {
            info!("Step {} recovered by {}", step.id, command);
            result.success = true;
            result.error = None;
            result.output = fixed.output;
            return true;
        }

        info!("Retrying step {} after {}", step.id, command);
        let retry = self.dispatch(ctx, &step.id, &step.action, timeout);
        attempts.push(retry.attempt());
        result.success = retry.success;
        result.error = retry.error;
        result.output = retry.output;
        retry.success
    }

    /// Insert `fix` ahead of `step`, run it and make `step` depend on it
    fn run_injected(
        &self,
        ctx: &mut ExecutionContext,
        step: &TaskStep,
        mut fix: TaskStep,
        timeout: Duration,
    ) -> StepResult {
        info!("Injecting step {} ({})", fix.id, fix.title);
        fix.status = StepStatus::InProgress;
        fix.started_at = Some(Utc::now());
        let action = fix.action.clone();
        let fix_id = fix.id.clone();

        let position = ctx.plan.index_of(&step.id).unwrap_or(ctx.plan.steps.len());
        ctx.plan.steps.insert(position, fix);
        if let Some(failed) = ctx.plan.step_mut(&step.id) {
            failed.depends_on.insert(fix_id.clone());
        }

        let fixed = self.dispatch(ctx, &fix_id, &action, timeout);
        if let Some(injected) = ctx.plan.step_mut(&fix_id) {
            injected.completed_at = Some(Utc::now());
            if fixed.success {
                injected.status = StepStatus::Completed;
                injected.result = Some(fixed.output.clone());
            } else {
                injected.status = StepStatus::Failed;
                injected.error = fixed.error.clone();
            }
        }
        if fixed.success {
            ctx.plan.mark_completed(&fix_id);
        } else {
            ctx.plan.mark_failed(&fix_id);
        }
        ctx.record(fixed.clone());
        fixed
    }

    /// Record the primary action's outcome in execution memory
    fn learn(&mut self, step: &TaskStep, result: &StepResult) {
        let primary = result.attempts.first().unwrap_or(result);
        if primary.success {
            self.learner
                .record_success(&step.action, primary.duration_seconds);
        } else {
            let category = result
                .diagnosis
                .as_ref()
                .map_or(ErrorCategory::Unknown, |d| d.category);
            self.learner.record_failure(
                &step.action,
                category,
                primary.error.as_deref().unwrap_or_default(),
            );
        }
        if let Err(e) = self.learner.save() {
            warn!("Failed to save execution memory: {}", e);
        }
    }

    fn dispatch(
        &self,
        ctx: &mut ExecutionContext,
        step_id: &str,
        action: &StepAction,
        timeout: Duration,
    ) -> StepResult {
        let started = Instant::now();
        let mut result = self.run_action(ctx, step_id, action, timeout);
        result.duration_seconds = started.elapsed().as_secs_f64();
        result
    }

    fn run_action(
        &self,
        ctx: &mut ExecutionContext,
        step_id: &str,
        action: &StepAction,
        timeout: Duration,
    ) -> StepResult {
        if !matches!(action, StepAction::UserPrompt { .. }) {
            ctx.operations_executed += 1;
        }

        match action {
            StepAction::UserPrompt { prompt } => StepResult::input_needed(step_id, prompt.clone()),
            StepAction::Command { command } => {
                let output = self.runner.run(command, timeout);
                if output.success() {
                    StepResult::ok(step_id, output.stdout)
                } else {
                    StepResult {
                        output: output.stdout.clone(),
                        ..StepResult::failed(step_id, output.error_message())
                    }
                }
            }
            StepAction::ToolCall { tool, args } => match self.invoke_tool(tool, args) {
                Ok(output) => StepResult::ok(step_id, output),
                Err(error) => StepResult::failed(step_id, error),
            },
            StepAction::Diagnostic { probe } => {
                let probe = self.run_probe(probe, timeout);
                if probe.success {
                    StepResult::ok(step_id, probe.output)
                } else {
                    StepResult {
                        output: probe.output,
                        ..StepResult::failed(
                            step_id,
                            probe.error.unwrap_or_else(|| "Diagnostic failed".to_string()),
                        )
                    }
                }
            }
            StepAction::Verification { check, expected } => {
                let probe = self.run_probe(check, timeout);
                if check_passed(&probe, expected.as_deref()) {
                    StepResult::ok(step_id, probe.output)
                } else {
                    let error = match expected.as_deref() {
                        Some(e) if probe.ran && !e.is_empty() => {
                            format!("Expected '{}' in output", e)
                        }
                        _ => probe
                            .error
                            .unwrap_or_else(|| "Verification failed".to_string()),
                    };
                    StepResult {
                        output: probe.output,
                        ..StepResult::failed(step_id, error)
                    }
                }
            }
            StepAction::Conditional {
                check, expected, ..
            } => {
                let probe = self.run_probe(check, timeout);
                if !probe.ran {
                    return StepResult::failed(
                        step_id,
                        probe.error.unwrap_or_else(|| "Condition check failed".to_string()),
                    );
                }
                let taken = check_passed(&probe, expected.as_deref());
                StepResult {
                    condition: Some(taken),
                    ..StepResult::ok(step_id, probe.output)
                }
            }
        }
    }

    fn run_probe(&self, probe: &Probe, timeout: Duration) -> ProbeOutput {
        match probe {
            Probe::Command { command } => {
                let output = self.runner.run(command, timeout);
                let success = output.success();
                ProbeOutput {
                    ran: !matches!(
                        output.status,
                        ExecutionStatus::Timeout | ExecutionStatus::OsError
                    ),
                    success,
                    error: (!success).then(|| output.error_message()),
                    output: output.stdout,
                }
            }
            Probe::Tool { tool, args } => match self.invoke_tool(tool, args) {
                Ok(output) => ProbeOutput {
                    ran: true,
                    success: true,
                    output,
                    error: None,
                },
                Err(error) => ProbeOutput {
                    ran: false,
                    success: false,
                    output: String::new(),
                    error: Some(error),
                },
            },
        }
    }

    fn invoke_tool(&self, tool: &str, args: &Map<String, Value>) -> std::result::Result<String, String> {
        let Some(tools) = &self.tools else {
            return Err("Tool executor not available".to_string());
        };
        let value = tools.execute(tool, args).map_err(|e| {
            warn!("Tool {} failed: {}", tool, e);
            e.to_string()
        })?;
        let text = match value {
            Value::Null => String::new(),
            Value::String(s) => s,
            other => other.to_string(),
        };
        Ok(truncate_output(text.as_bytes(), self.execution.max_output_bytes).0)
    }
}

fn mutates(action: &StepAction) -> bool {
    matches!(action, StepAction::Command { .. } | StepAction::ToolCall { .. })
}

fn approval_prompt(step: &TaskStep, repeated: Option<ErrorCategory>) -> String {
    match repeated {
        Some(category) => format!(
            "{}. Run step '{}' again?",
            repeated_failure_note(category),
            step.title
        ),
        None => format!(
            "Step '{}' is {} risk. Approve it?",
            step.title,
            step.risk_level()
        ),
    }
}

fn repeated_failure_note(category: ErrorCategory) -> String {
    format!("This step failed the last 3 runs ({})", category)
}

/// Expected text passes when it appears anywhere in the probe output
fn check_passed(probe: &ProbeOutput, expected: Option<&str>) -> bool {
    match expected.filter(|e| !e.is_empty()) {
        Some(expected) => probe.ran && probe.output.contains(expected),
        None => probe.success,
    }
}

fn skip_step(ctx: &mut ExecutionContext, index: usize, reason: &str) -> StepResult {
    let step = &mut ctx.plan.steps[index];
    step.status = StepStatus::Skipped;
    step.result = Some(reason.to_string());
    step.completed_at = Some(Utc::now());
    let result = StepResult::ok(&step.id, reason);
    ctx.record(result.clone());
    result
}

fn apply_result(ctx: &mut ExecutionContext, index: usize, step: &TaskStep, result: &StepResult) {
    if result.needs_user_input && result.success {
        // Prompt steps stay IN_PROGRESS until resume supplies the answer
        info!("Step {} is waiting for input", step.id);
        ctx.state = ExecutionState::Paused;
    } else if result.success {
        let done = &mut ctx.plan.steps[index];
        done.status = StepStatus::Completed;
        done.result = Some(result.output.clone());
        done.completed_at = Some(Utc::now());
        ctx.plan.mark_completed(&step.id);
        info!("Step {} completed", step.id);

        if let (
            StepAction::Conditional {
                when_true,
                when_false,
                ..
            },
            Some(taken),
        ) = (&step.action, result.condition)
        {
            let (keep, drop) = if taken {
                (when_true, when_false)
            } else {
                (when_false, when_true)
            };
            for id in drop.iter().filter(|id| !keep.contains(id)) {
                if let Some(skipped) = ctx.plan.step_mut(id).filter(|s| s.status.is_waiting()) {
                    skipped.status = StepStatus::Skipped;
                    skipped.result = Some(format!("Branch not taken at {}", step.id));
                    debug!("Skipped {} (branch not taken)", id);
                }
            }
        }
    } else {
        let failed = &mut ctx.plan.steps[index];
        failed.status = StepStatus::Failed;
        failed.error = result.error.clone();
        failed.completed_at = Some(Utc::now());
        ctx.plan.mark_failed(&step.id);
        warn!(
            "Step {} failed: {}",
            step.id,
            result.error.as_deref().unwrap_or("unknown error")
        );

        if step.risk_level() >= RiskLevel::High {
            ctx.fail(format!(
                "{} step '{}' failed",
                step.risk_level().as_str(),
                step.title
            ));
        } else if result.needs_user_input {
            info!("Pausing after failed step {} for review", step.id);
            ctx.state = ExecutionState::Paused;
        }
    }
    ctx.record(result.clone());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptive::EXECUTION_MEMORY_FILE;
    use crate::shell::CommandOutput;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Exit code and stdout per command prefix; unknown commands succeed
    #[derive(Default)]
    struct Script {
        rules: Vec<(String, i32, String)>,
        /// Prefix, failures left, stderr
        failing: Mutex<Vec<(String, usize, String)>>,
        seen: Mutex<Vec<String>>,
    }

    impl Script {
        fn with(mut self, prefix: &str, exit_code: i32, stdout: &str) -> Self {
            self.rules
                .push((prefix.to_string(), exit_code, stdout.to_string()));
            self
        }

        /// Fail the first `times` matching commands with `stderr`
        fn failing(self, prefix: &str, times: usize, stderr: &str) -> Self {
            self.failing
                .lock()
                .unwrap()
                .push((prefix.to_string(), times, stderr.to_string()));
            self
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl CommandRunner for Script {
        fn run(&self, command: &str, _timeout: Duration) -> CommandOutput {
            self.seen.lock().unwrap().push(command.to_string());
            let mut failing = self.failing.lock().unwrap();
            if let Some((_, left, stderr)) = failing
                .iter_mut()
                .find(|(prefix, left, _)| *left > 0 && command.starts_with(prefix.as_str()))
            {
                *left -= 1;
                return CommandOutput::new(command, 1, "", stderr);
            }
            drop(failing);
            let (code, stdout) = self
                .rules
                .iter()
                .find(|(prefix, _, _)| command.starts_with(prefix.as_str()))
                .map(|(_, code, out)| (*code, out.clone()))
                .unwrap_or((0, String::new()));
            CommandOutput::new(command, code, &stdout, if code == 0 { "" } else { "boom" })
        }
    }

    struct Answer(bool);

    impl StepApprover for Answer {
        fn approve(&self, _step: &TaskStep) -> bool {
            self.0
        }
    }

    struct Echo;

    impl ToolExecutor for Echo {
        fn execute(
            &self,
            name: &str,
            _args: &Map<String, Value>,
        ) -> std::result::Result<Value, ToolError> {
            match name {
                "broken" => Err(ToolError::new("E_TOOL", "tool exploded")),
                _ => Ok(Value::String(format!("ran {}", name))),
            }
        }
    }

    fn engine(dir: &TempDir, script: Arc<Script>, config: WardenConfig) -> ExecutionEngine {
        let safety = SafetyManager::open(dir.path().join("backups"), script).unwrap();
        ExecutionEngine::new(safety, &config)
    }

    fn cmd(id: &str, command: &str) -> TaskStep {
        TaskStep::new(id, id, StepAction::command(command))
    }

    fn approved(steps: Vec<TaskStep>) -> TaskPlan {
        let mut plan = TaskPlan::with_steps("test", steps).unwrap();
        plan.approve();
        plan
    }

    #[test]
    fn test_unapproved_plan_rejected() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, Arc::new(Script::default()), WardenConfig::default());
        let plan = TaskPlan::with_steps("x", vec![cmd("a", "ls")]).unwrap();
        assert!(matches!(
            engine.start_execution(plan),
            Err(WardenError::PlanNotApproved(_))
        ));
    }

    #[test]
    fn test_runs_in_dependency_order() {
        let dir = TempDir::new().unwrap();
        let script = Arc::new(Script::default().with("echo hi", 0, "hi\n"));
        let mut engine = engine(&dir, script.clone(), WardenConfig::default());
        let mut ctx = engine
            .start_execution(approved(vec![
                cmd("second", "echo hi").depends_on(["first"]),
                cmd("first", "ls /").with_rollback("true"),
            ]))
            .unwrap();

        assert!(engine.execute_all(&mut ctx));
        assert_eq!(ctx.state, ExecutionState::Completed);
        assert_eq!(script.seen(), vec!["ls /", "echo hi"]);
        assert_eq!(ctx.result("second").unwrap().output, "hi\n");
        assert_eq!(engine.safety().get_rollback_stack().len(), 1);
        assert!(ctx.end_time.is_some());
    }

    #[test]
    fn test_low_risk_failure_blocks_dependents_only() {
        let dir = TempDir::new().unwrap();
        let script = Arc::new(Script::default().with("false", 1, ""));
        let mut engine = engine(&dir, script, WardenConfig::default());
        let mut ctx = engine
            .start_execution(approved(vec![
                cmd("a", "false"),
                cmd("b", "ls").depends_on(["a"]),
                cmd("c", "ls"),
            ]))
            .unwrap();

        assert!(!engine.execute_all(&mut ctx));
        assert_eq!(ctx.state, ExecutionState::Completed);
        assert_eq!(ctx.plan.steps[1].status, StepStatus::Blocked);
        assert_eq!(ctx.plan.steps[2].status, StepStatus::Completed);
        assert_eq!(ctx.result("a").unwrap().error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_high_risk_failure_rolls_back_own_action() {
        let dir = TempDir::new().unwrap();
        let script = Arc::new(Script::default().with("docker rm", 1, ""));
        let mut engine = engine(&dir, script.clone(), WardenConfig::default());
        let mut ctx = engine
            .start_execution(approved(vec![
                cmd("rm", "docker rm web").with_rollback("docker start web"),
                cmd("after", "ls"),
            ]))
            .unwrap();

        assert!(!engine.execute_all(&mut ctx));
        assert_eq!(ctx.state, ExecutionState::Failed);
        let result = ctx.result("rm").unwrap();
        assert_eq!(result.recovery, Some(RecoveryPhase::RolledBack));
        assert!(script.seen().contains(&"docker start web".to_string()));
        assert!(engine.safety().get_rollback_stack().is_empty());
        // The loop stopped before the independent step
        assert_eq!(ctx.plan.steps[1].status, StepStatus::Pending);
    }

    #[test]
    fn test_high_risk_failure_without_rollback_policy() {
        let dir = TempDir::new().unwrap();
        let script = Arc::new(Script::default().with("docker rm", 1, ""));
        let mut config = WardenConfig::default();
        config.safety.rollback_on_failure = false;
        let mut engine = engine(&dir, script, config);
        let mut ctx = engine
            .start_execution(approved(vec![
                cmd("rm", "docker rm web").with_rollback("docker start web")
            ]))
            .unwrap();

        let result = engine.execute_next_step(&mut ctx).unwrap();
        assert_eq!(result.recovery, Some(RecoveryPhase::Failed));
        assert_eq!(ctx.state, ExecutionState::Failed);
        assert_eq!(engine.safety().get_rollback_stack().len(), 1);
    }

    #[test]
    fn test_alternative_recovers() {
        let dir = TempDir::new().unwrap();
        let script = Arc::new(Script::default().with("apt-get", 1, ""));
        let mut engine = engine(&dir, script, WardenConfig::default());
        let step = cmd("install", "apt-get install -y htop")
            .with_alternative(StepAction::command("dnf install -y htop"));
        let mut ctx = engine.start_execution(approved(vec![step])).unwrap();

        let result = engine.execute_next_step(&mut ctx).unwrap();
        assert!(result.success);
        assert_eq!(result.recovery, Some(RecoveryPhase::Recovered));
        assert_eq!(ctx.operations_executed, 2);
        assert!(ctx.plan.completed_steps.contains("install"));
        assert!(ctx.plan.failed_steps.is_empty());
    }

    #[test]
    fn test_exhausted_alternatives_fail() {
        let dir = TempDir::new().unwrap();
        let script = Arc::new(Script::default().with("apt-get", 1, "").with("dnf", 1, ""));
        let mut engine = engine(&dir, script, WardenConfig::default());
        let step = cmd("install", "apt-get install -y htop")
            .with_alternative(StepAction::command("dnf install -y htop"));
        let mut ctx = engine.start_execution(approved(vec![step])).unwrap();

        let result = engine.execute_next_step(&mut ctx).unwrap();
        assert!(!result.success);
        assert_eq!(result.recovery, Some(RecoveryPhase::Failed));
        assert_eq!(result.warnings, vec!["Alternative 1 failed: boom"]);
    }

    #[test]
    fn test_every_attempt_is_kept() {
        let dir = TempDir::new().unwrap();
        let script = Arc::new(Script::default().with("apt-get", 1, "").with("dnf", 1, ""));
        let mut engine = engine(&dir, script, WardenConfig::default());
        let step = cmd("install", "apt-get install -y htop")
            .with_alternative(StepAction::command("dnf install -y htop"))
            .with_alternative(StepAction::command("pacman -S --noconfirm htop"));
        let mut ctx = engine.start_execution(approved(vec![step])).unwrap();

        let result = engine.execute_next_step(&mut ctx).unwrap();
        assert!(result.success);
        assert_eq!(result.recovery, Some(RecoveryPhase::Recovered));
        assert_eq!(result.attempts.len(), 3);
        assert!(!result.attempts[0].success);
        assert!(!result.attempts[1].success);
        assert!(result.attempts[2].success);
        assert_eq!(result.attempts[0].error.as_deref(), Some("boom"));
        assert!(result.attempts.iter().all(|a| a.step_id == "install"));
        assert_eq!(result.warnings, vec!["Alternative 1 failed: boom"]);
        assert_eq!(
            result.diagnosis.as_ref().map(|d| d.category),
            Some(ErrorCategory::Unknown)
        );
    }

    const DENIED: &str = "mkdir: cannot create directory '/srv/x': Permission denied";

    #[test]
    fn test_permission_failure_recovered_with_sudo() {
        let dir = TempDir::new().unwrap();
        let script = Arc::new(Script::default().failing("mkdir /srv/x", usize::MAX, DENIED));
        let mut engine = engine(&dir, script.clone(), WardenConfig::default());
        let mut ctx = engine
            .start_execution(approved(vec![cmd("mkdir", "mkdir /srv/x")]))
            .unwrap();

        assert!(engine.execute_all(&mut ctx));
        assert_eq!(script.seen(), vec!["mkdir /srv/x", "sudo mkdir /srv/x"]);

        let result = ctx.result("mkdir").unwrap();
        assert_eq!(result.recovery, Some(RecoveryPhase::Recovered));
        assert_eq!(
            result.diagnosis.as_ref().map(|d| d.category),
            Some(ErrorCategory::PermissionDenied)
        );
        assert_eq!(result.attempts.len(), 2);
        assert_eq!(result.attempts[1].step_id, "mkdir_fix_permission_denied");

        let fix = ctx.plan.step("mkdir_fix_permission_denied").unwrap();
        assert_eq!(fix.status, StepStatus::Completed);
        assert_eq!(ctx.plan.index_of(&fix.id), Some(0));
        assert!(ctx.plan.step("mkdir").unwrap().depends_on.contains(&fix.id));
        assert_eq!(ctx.recovery.privilege_escalations, 1);
        assert_eq!(ctx.recovery.injected_steps, 1);
    }

    #[test]
    fn test_missing_dependency_installed_then_retried() {
        let dir = TempDir::new().unwrap();
        let script = Arc::new(Script::default().failing(
            "htop -b",
            1,
            "sh: 1: htop: command not found",
        ));
        let mut engine = engine(&dir, script.clone(), WardenConfig::default());
        engine.set_package_manager(Some(PackageManager::Apt));
        let mut ctx = engine
            .start_execution(approved(vec![cmd("top", "htop -b -n 1")]))
            .unwrap();

        assert!(engine.execute_all(&mut ctx));
        assert_eq!(
            script.seen(),
            vec!["htop -b -n 1", "sudo apt-get install -y htop", "htop -b -n 1"]
        );
        let result = ctx.result("top").unwrap();
        let outcomes: Vec<bool> = result.attempts.iter().map(|a| a.success).collect();
        assert_eq!(outcomes, vec![false, true, true]);
        assert!(ctx.plan.completed_steps.contains("top_fix_missing_dependency"));
    }

    #[test]
    fn test_adaptive_recovery_can_be_disabled() {
        let dir = TempDir::new().unwrap();
        let script = Arc::new(Script::default().failing("mkdir /srv/x", usize::MAX, DENIED));
        let mut config = WardenConfig::default();
        config.execution.adaptive_recovery = false;
        let mut engine = engine(&dir, script.clone(), config);
        let mut ctx = engine
            .start_execution(approved(vec![cmd("mkdir", "mkdir /srv/x")]))
            .unwrap();

        let result = engine.execute_next_step(&mut ctx).unwrap();
        assert!(!result.success);
        assert_eq!(result.recovery, Some(RecoveryPhase::Failed));
        assert_eq!(script.seen(), vec!["mkdir /srv/x"]);
        assert_eq!(ctx.plan.steps.len(), 1);
    }

    #[test]
    fn test_fix_beyond_request_pauses() {
        let dir = TempDir::new().unwrap();
        let script = Arc::new(Script::default().failing(
            "chmod",
            usize::MAX,
            "chmod: changing permissions of '/srv/share': Operation not permitted",
        ));
        let mut engine = engine(&dir, script.clone(), WardenConfig::default());
        let mut plan = approved(vec![cmd("share", "chmod -R 777 /srv/share")]);
        plan.original_request = "let everyone write to the share".to_string();
        plan.steps[0].risk = None;
        let mut ctx = engine.start_execution(plan).unwrap();

        assert!(!engine.execute_all(&mut ctx));
        assert_eq!(ctx.state, ExecutionState::Paused);
        assert_eq!(script.seen(), vec!["chmod -R 777 /srv/share"]);
        assert_eq!(ctx.plan.steps.len(), 1);

        let result = ctx.result("share").unwrap();
        assert!(result.needs_user_input);
        assert!(result
            .user_prompt
            .as_deref()
            .unwrap()
            .contains("Recursive world-writable permissions"));

        engine.resume_execution(&mut ctx, None).unwrap();
        assert_eq!(ctx.state, ExecutionState::Running);
    }

    #[test]
    fn test_recovery_checkpoint_pauses_at_limit() {
        let dir = TempDir::new().unwrap();
        let script = Arc::new(
            Script::default()
                .failing("touch /srv/a", 1, "touch: cannot touch '/srv/a': Permission denied")
                .failing("touch /srv/b", 1, "touch: cannot touch '/srv/b': Permission denied"),
        );
        let mut engine = engine(&dir, script.clone(), WardenConfig::default());
        let mut ctx = engine
            .start_execution(approved(vec![
                cmd("a", "touch /srv/a"),
                cmd("b", "touch /srv/b").depends_on(["a"]),
            ]))
            .unwrap();

        assert!(!engine.execute_all(&mut ctx));
        assert_eq!(ctx.state, ExecutionState::Paused);
        assert!(ctx.plan.completed_steps.contains("a"));
        assert!(ctx.plan.failed_steps.contains("b"));
        assert!(!script.seen().contains(&"sudo touch /srv/b".to_string()));
        assert_eq!(ctx.recovery.recoveries, 2);

        let prompt = ctx.result("b").unwrap().user_prompt.clone().unwrap();
        assert!(prompt.contains("after 2 automatic recoveries"));
        assert!(prompt.contains("sudo touch /srv/b"));
    }

    #[test]
    fn test_escalation_limit_pauses() {
        let dir = TempDir::new().unwrap();
        let script = Arc::new(Script::default().failing("mkdir /srv/x", usize::MAX, DENIED));
        let mut config = WardenConfig::default();
        config.execution.max_privilege_escalations = 1;
        let mut engine = engine(&dir, script.clone(), config);
        let mut ctx = engine
            .start_execution(approved(vec![cmd("mkdir", "mkdir /srv/x")]))
            .unwrap();

        let result = engine.execute_next_step(&mut ctx).unwrap();
        assert!(!result.success);
        assert!(result
            .user_prompt
            .as_deref()
            .unwrap()
            .starts_with("Maximum privilege escalations reached (1)"));
        assert_eq!(ctx.state, ExecutionState::Paused);
        assert_eq!(script.seen(), vec!["mkdir /srv/x"]);
    }

    #[test]
    fn test_declined_fix_is_not_run() {
        let dir = TempDir::new().unwrap();
        let script = Arc::new(Script::default().failing(
            "rm /srv/old.log",
            usize::MAX,
            "rm: cannot remove '/srv/old.log': Permission denied",
        ));
        let mut engine = engine(&dir, script.clone(), WardenConfig::default())
            .with_approver(Arc::new(Answer(false)));
        let mut plan = approved(vec![cmd("clean", "rm /srv/old.log")]);
        plan.steps[0].risk = None;
        let mut ctx = engine.start_execution(plan).unwrap();

        let result = engine.execute_next_step(&mut ctx).unwrap();
        assert!(!result.success);
        assert!(!result.needs_user_input);
        assert_eq!(result.warnings, vec!["Fix `sudo rm /srv/old.log` was declined"]);
        assert_eq!(script.seen(), vec!["rm /srv/old.log"]);
        assert_eq!(ctx.state, ExecutionState::Running);
        assert_eq!(ctx.recovery, RecoveryBudget::default());
    }

    #[test]
    fn test_execution_memory_kept_next_to_rollback_stack() {
        let dir = TempDir::new().unwrap();
        let script = Arc::new(Script::default());
        let mut engine = engine(&dir, script.clone(), WardenConfig::default());
        let mut ctx = engine
            .start_execution(approved(vec![cmd("uptime", "uptime")]))
            .unwrap();
        assert!(engine.execute_all(&mut ctx));

        let path = dir.path().join("backups").join(EXECUTION_MEMORY_FILE);
        assert!(path.exists());
        assert_eq!(engine.learner().path(), path.as_path());

        let safety = SafetyManager::open(dir.path().join("backups"), script).unwrap();
        let reopened = ExecutionEngine::new(safety, &WardenConfig::default());
        assert_eq!(reopened.learner().success_rate(&StepAction::command("uptime")), 1.0);
    }

    #[test]
    fn test_repeated_failures_need_approval() {
        let dir = TempDir::new().unwrap();
        let script = Arc::new(Script::default().with("make deploy", 2, ""));
        let mut config = WardenConfig::default();
        config.execution.pause_for_step_approval = true;
        let mut engine = engine(&dir, script.clone(), config);

        for _ in 0..3 {
            let mut ctx = engine
                .start_execution(approved(vec![cmd("deploy", "make deploy")]))
                .unwrap();
            assert!(!engine.execute_all(&mut ctx));
        }
        assert_eq!(
            engine.learner().repeated_failure(&StepAction::command("make deploy")),
            Some(ErrorCategory::Unknown)
        );

        let mut ctx = engine
            .start_execution(approved(vec![cmd("deploy", "make deploy")]))
            .unwrap();
        let result = engine.execute_next_step(&mut ctx).unwrap();
        assert_eq!(ctx.state, ExecutionState::WaitingApproval);
        assert!(result
            .user_prompt
            .as_deref()
            .unwrap()
            .contains("failed the last 3 runs"));
        assert_eq!(script.seen().len(), 3);
    }

    #[test]
    fn test_prompt_pauses_and_resume_consumes_input() {
        let dir = TempDir::new().unwrap();
        let mut engine = engine(&dir, Arc::new(Script::default()), WardenConfig::default());
        let mut ctx = engine
            .start_execution(approved(vec![
                TaskStep::new("ask", "Ask", StepAction::prompt("Which disk?")),
                cmd("after", "lsblk").depends_on(["ask"]),
            ]))
            .unwrap();

        assert!(!engine.execute_all(&mut ctx));
        assert_eq!(ctx.state, ExecutionState::Paused);
        assert_eq!(
            ctx.result("ask").unwrap().user_prompt.as_deref(),
            Some("Which disk?")
        );

        assert!(matches!(
            engine.resume_execution(&mut ctx, None),
            Err(WardenError::InputRequired(_))
        ));
        engine.resume_execution(&mut ctx, Some("/dev/sdb")).unwrap();
        assert!(engine.execute_all(&mut ctx));
        assert_eq!(ctx.result("ask").unwrap().output, "/dev/sdb");
    }

    #[test]
    fn test_resume_when_not_paused() {
        let dir = TempDir::new().unwrap();
        let mut engine = engine(&dir, Arc::new(Script::default()), WardenConfig::default());
        let mut ctx = engine.start_execution(approved(vec![cmd("a", "ls")])).unwrap();
        assert!(matches!(
            engine.resume_execution(&mut ctx, None),
            Err(WardenError::NotPaused)
        ));

        engine.pause_execution(&mut ctx);
        assert!(engine.execute_next_step(&mut ctx).is_none());
        engine.resume_execution(&mut ctx, None).unwrap();
        assert!(engine.execute_all(&mut ctx));
    }

    #[test]
    fn test_rejected_step_is_skipped_with_dependents() {
        let dir = TempDir::new().unwrap();
        let script = Arc::new(Script::default());
        let safety = SafetyManager::open(dir.path().join("b"), script.clone()).unwrap();
        let mut engine =
            ExecutionEngine::new(safety, &WardenConfig::default()).with_approver(Arc::new(Answer(false)));
        let mut ctx = engine
            .start_execution(approved(vec![
                cmd("wipe", "rm -rf /srv/old"),
                cmd("after", "ls /srv").depends_on(["wipe"]),
            ]))
            .unwrap();

        assert!(engine.execute_all(&mut ctx));
        assert_eq!(ctx.plan.steps[0].status, StepStatus::Skipped);
        assert_eq!(ctx.plan.steps[1].status, StepStatus::Skipped);
        assert!(script.seen().is_empty());
    }

    #[test]
    fn test_waiting_approval_then_approved() {
        let dir = TempDir::new().unwrap();
        let script = Arc::new(Script::default());
        let mut config = WardenConfig::default();
        config.execution.pause_for_step_approval = true;
        let mut engine = engine(&dir, script.clone(), config);
        let mut ctx = engine
            .start_execution(approved(vec![cmd("rm", "docker rm web")]))
            .unwrap();

        let waiting = engine.execute_next_step(&mut ctx).unwrap();
        assert!(waiting.needs_user_input);
        assert_eq!(ctx.state, ExecutionState::WaitingApproval);
        assert!(script.seen().is_empty());

        let result = engine.resolve_step_approval(&mut ctx, true).unwrap().unwrap();
        assert!(result.success);
        assert_eq!(script.seen(), vec!["docker rm web"]);
        assert!(engine.execute_all(&mut ctx));
    }

    #[test]
    fn test_resolve_without_waiting_is_misuse() {
        let dir = TempDir::new().unwrap();
        let mut engine = engine(&dir, Arc::new(Script::default()), WardenConfig::default());
        let mut ctx = engine.start_execution(approved(vec![cmd("a", "ls")])).unwrap();
        assert!(engine.resolve_step_approval(&mut ctx, true).is_err());
    }

    #[test]
    fn test_verification_matches_substring() {
        let dir = TempDir::new().unwrap();
        let script = Arc::new(
            Script::default()
                .with("systemctl is-active nginx", 3, "inactive\n")
                .with("nginx -v", 0, "nginx version: nginx/1.24.0\n")
                .with("systemctl status cups", 3, "dead\n"),
        );
        let mut engine = engine(&dir, script, WardenConfig::default());
        let verify = |id: &str, command: &str, expected: &str| {
            TaskStep::new(
                id,
                id,
                StepAction::Verification {
                    check: Probe::command(command),
                    expected: Some(expected.to_string()),
                },
            )
        };
        let mut ctx = engine
            .start_execution(approved(vec![
                verify("inactive", "systemctl is-active nginx", "active"),
                verify("version", "nginx -v", "nginx/1.24"),
                verify("cups", "systemctl status cups", "running"),
            ]))
            .unwrap();

        engine.execute_all(&mut ctx);
        // Non-zero exit still verifies when the text is present
        assert!(ctx.result("inactive").unwrap().success);
        assert!(ctx.result("version").unwrap().success);
        let missing = ctx.result("cups").unwrap();
        assert!(!missing.success);
        assert_eq!(missing.error.as_deref(), Some("Expected 'running' in output"));
    }

    #[test]
    fn test_conditional_skips_untaken_branch() {
        let dir = TempDir::new().unwrap();
        let script = Arc::new(Script::default().with("test -f", 1, ""));
        let mut engine = engine(&dir, script, WardenConfig::default());
        let check = TaskStep::new(
            "check",
            "check",
            StepAction::Conditional {
                check: Probe::command("test -f /etc/app.conf"),
                expected: None,
                when_true: vec!["edit".to_string()],
                when_false: vec!["create".to_string()],
            },
        );
        let mut ctx = engine
            .start_execution(approved(vec![
                check,
                cmd("edit", "touch /etc/app.conf").depends_on(["check"]),
                cmd("create", "echo created").depends_on(["check"]),
                cmd("reload", "ls").depends_on(["edit"]),
            ]))
            .unwrap();

        assert!(engine.execute_all(&mut ctx));
        assert_eq!(ctx.result("check").unwrap().condition, Some(false));
        assert_eq!(ctx.plan.step("edit").unwrap().status, StepStatus::Skipped);
        assert_eq!(ctx.plan.step("reload").unwrap().status, StepStatus::Skipped);
        assert_eq!(ctx.plan.step("create").unwrap().status, StepStatus::Completed);
    }

    #[test]
    fn test_tool_calls_and_errors() {
        let dir = TempDir::new().unwrap();
        let script = Arc::new(Script::default());
        let safety = SafetyManager::open(dir.path().join("b"), script).unwrap();
        let mut engine =
            ExecutionEngine::new(safety, &WardenConfig::default()).with_tool_executor(Arc::new(Echo));
        let mut ctx = engine
            .start_execution(approved(vec![
                TaskStep::new("ok", "ok", StepAction::tool_call("linux_system_info", Map::new())),
                TaskStep::new("bad", "bad", StepAction::tool_call("broken", Map::new())),
            ]))
            .unwrap();

        engine.execute_all(&mut ctx);
        assert_eq!(ctx.result("ok").unwrap().output, "ran linux_system_info");
        assert_eq!(
            ctx.result("bad").unwrap().error.as_deref(),
            Some("[E_TOOL] tool exploded")
        );
    }

    #[test]
    fn test_tool_call_without_executor_fails() {
        let dir = TempDir::new().unwrap();
        let mut engine = engine(&dir, Arc::new(Script::default()), WardenConfig::default());
        let mut ctx = engine
            .start_execution(approved(vec![TaskStep::new(
                "t",
                "t",
                StepAction::tool_call("linux_system_info", Map::new()),
            )]))
            .unwrap();
        let result = engine.execute_next_step(&mut ctx).unwrap();
        assert_eq!(result.error.as_deref(), Some("Tool executor not available"));
    }

    #[test]
    fn test_operation_budget_stops_loop() {
        let dir = TempDir::new().unwrap();
        let mut config = WardenConfig::default();
        config.execution.max_total_operations = 1;
        let mut engine = engine(&dir, Arc::new(Script::default()), config);
        let mut ctx = engine
            .start_execution(approved(vec![cmd("a", "ls"), cmd("b", "ls")]))
            .unwrap();

        assert!(!engine.execute_all(&mut ctx));
        assert_eq!(ctx.state, ExecutionState::Failed);
        assert!(ctx.failure_reason.as_deref().unwrap().contains("budget"));
        assert_eq!(ctx.operations_executed, 1);
    }

    #[test]
    fn test_abort_with_rollback_drains_stack() {
        let dir = TempDir::new().unwrap();
        let script = Arc::new(Script::default().with("ask", 0, ""));
        let mut engine = engine(&dir, script.clone(), WardenConfig::default());
        let mut ctx = engine
            .start_execution(approved(vec![
                cmd("one", "mkdir /srv/a").with_rollback("rmdir /srv/a"),
                cmd("two", "mkdir /srv/b").with_rollback("rmdir /srv/b"),
                TaskStep::new("ask", "ask", StepAction::prompt("continue?")),
            ]))
            .unwrap();
        engine.execute_all(&mut ctx);
        assert_eq!(ctx.state, ExecutionState::Paused);

        let outcomes = engine.abort_execution(&mut ctx, true);
        assert_eq!(outcomes.len(), 2);
        assert_eq!(ctx.state, ExecutionState::RolledBack);
        let seen = script.seen();
        assert_eq!(&seen[seen.len() - 2..], ["rmdir /srv/b", "rmdir /srv/a"]);
        assert!(ctx.plan.is_complete());
    }

    #[test]
    fn test_abort_without_rollback() {
        let dir = TempDir::new().unwrap();
        let mut engine = engine(&dir, Arc::new(Script::default()), WardenConfig::default());
        let mut ctx = engine
            .start_execution(approved(vec![cmd("one", "mkdir /srv/a").with_rollback("rmdir /srv/a")]))
            .unwrap();
        engine.execute_all(&mut ctx);

        assert!(engine.abort_execution(&mut ctx, false).is_empty());
        assert_eq!(ctx.state, ExecutionState::Failed);
        assert_eq!(engine.safety().get_rollback_stack().len(), 1);
    }

    #[test]
    fn test_backup_recorded_and_failures_warned() {
        let dir = TempDir::new().unwrap();
        let config_file = dir.path().join("app.conf");
        fs::write(&config_file, "key=1\n").unwrap();
        let missing = dir.path().join("missing.conf");

        let mut plan = approved(vec![cmd("edit", "sed -i s/1/2/ app.conf")]);
        plan.steps[0].backup_paths = vec![config_file.clone(), missing.clone()];
        if let Some(risk) = plan.steps[0].risk.as_mut() {
            risk.requires_backup = true;
        }

        let mut engine = engine(&dir, Arc::new(Script::default()), WardenConfig::default());
        let mut ctx = engine.start_execution(plan).unwrap();
        let result = engine.execute_next_step(&mut ctx).unwrap();

        assert!(result.success);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("missing.conf"));

        let stack = engine.safety().get_rollback_stack();
        assert_eq!(stack.len(), 1);
        assert!(stack[0].backup_path.is_some());
        assert_eq!(stack[0].original_paths(), vec![config_file]);
    }

    #[test]
    fn test_step_timeout_clamped() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, Arc::new(Script::default()), WardenConfig::default());
        let plan = TaskPlan::with_steps(
            "x",
            vec![
                cmd("ls", "ls"),
                cmd("pkg", "apt-get install -y htop"),
                cmd("dd", "dd if=/dev/zero of=/dev/sdz"),
            ],
        )
        .unwrap();
        assert_eq!(engine.step_timeout(&plan.steps[0]), Duration::from_secs(120));
        assert_eq!(engine.step_timeout(&plan.steps[1]), Duration::from_secs(240));
        assert_eq!(engine.step_timeout(&plan.steps[2]), Duration::from_secs(300));
        let prompt = TaskStep::new("p", "p", StepAction::prompt("?"));
        assert_eq!(engine.step_timeout(&prompt), Duration::from_secs(120));
    }

    #[test]
    fn test_summary() {
        let dir = TempDir::new().unwrap();
        let script = Arc::new(Script::default().with("false", 1, ""));
        let mut engine = engine(&dir, script, WardenConfig::default());
        let mut ctx = engine
            .start_execution(approved(vec![cmd("a", "ls"), cmd("b", "false")]))
            .unwrap();
        engine.execute_all(&mut ctx);

        let summary = engine.execution_summary(&ctx);
        assert_eq!(summary.progress, "1/2");
        assert_eq!(summary.steps_completed, 1);
        assert_eq!(summary.steps_failed, 1);
        assert_eq!(summary.results.len(), 2);
        assert!(summary.duration_seconds.is_some());
    }
}
