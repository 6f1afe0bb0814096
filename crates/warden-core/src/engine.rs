//! Request routing for one conversation.
//!
//! Owns at most one pending plan and at most one suspended execution. Meta
//! phrases ("yes", "cancel", "undo that") act on those before anything is
//! assessed, and a pending plan blocks new requests until it is answered.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::complexity::{ComplexityAssessor, ComplexityLevel, ComplexityResult};
use crate::config::{ReasoningConfig, Verbosity, WardenConfig};
use crate::context::{PackageManager, SystemContext};
use crate::error::Result;
use crate::executor::{ExecutionContext, ExecutionEngine, ExecutionState, StepApprover, ToolExecutor};
use crate::plan::{StepAction, TaskPlan};
use crate::planner::{ExternalPlanner, PlanSource, TaskPlanner};
use crate::presentation::Presenter;
use crate::safety::SafetyManager;
use crate::shell::CommandRunner;

const APPROVALS: &[&str] = &[
    "yes", "y", "ok", "okay", "go ahead", "do it", "proceed", "yep", "sure", "go",
];
const APPROVAL_PREFIXES: &[&str] = &["yes", "go ahead", "do it"];
const REJECTIONS: &[&str] = &[
    "no", "n", "cancel", "stop", "don't", "abort", "nope", "nevermind",
];

static UNDO_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^(please )?(undo|rollback|roll back|revert)( that| it| the last (change|action|step))?[.!]?$")
        .map_err(|e| warn!("Undo pattern failed to compile: {}", e))
        .ok()
});

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingResult {
    /// Text for the user. Empty means "handle this request directly".
    pub response: String,
    pub complexity: Option<ComplexityResult>,
    pub plan: Option<TaskPlan>,
    pub execution_context: Option<ExecutionContext>,
    pub needs_approval: bool,
    pub needs_input: bool,
    pub input_prompt: Option<String>,
}

impl ProcessingResult {
    fn message(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            ..Self::default()
        }
    }
}

/// One entry of the undo list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackEntry {
    pub id: String,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub can_undo: bool,
}

pub struct ReasoningEngine {
    config: ReasoningConfig,
    assessor: ComplexityAssessor,
    planner: TaskPlanner,
    executor: ExecutionEngine,
    presenter: Presenter,
    pending: Option<TaskPlan>,
    /// Execution suspended on a prompt or a step approval
    active: Option<ExecutionContext>,
}

impl std::fmt::Debug for ReasoningEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReasoningEngine")
            .field("enabled", &self.config.enabled)
            .field("pending", &self.pending.as_ref().map(|p| &p.id))
            .field("active", &self.active.as_ref().map(|c| c.state))
            .finish()
    }
}

impl ReasoningEngine {
    pub fn new(config: &WardenConfig, safety: SafetyManager) -> Self {
        Self {
            config: config.reasoning.clone(),
            assessor: ComplexityAssessor::new(),
            planner: TaskPlanner::new(&config.planner),
            executor: ExecutionEngine::new(safety, config),
            presenter: Presenter::new(
                config.conversation.clone(),
                config.reasoning.explain_steps,
            ),
            pending: None,
            active: None,
        }
    }

    /// Open the configured backup directory and build an engine on it
    pub fn open(config: &WardenConfig, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        let safety = SafetyManager::open(config.safety.backup_dir(), runner)?
            .with_rollback_timeout(Duration::from_secs(config.safety.rollback_timeout_secs));
        Ok(Self::new(config, safety))
    }

    pub fn with_tool_executor(mut self, tools: Arc<dyn ToolExecutor>) -> Self {
        self.executor = self.executor.with_tool_executor(tools);
        self
    }

    pub fn with_external_planner(mut self, planner: Arc<dyn ExternalPlanner>) -> Self {
        self.planner = self.planner.with_external_planner(planner);
        self
    }

    pub fn with_approver(mut self, approver: Arc<dyn StepApprover>) -> Self {
        self.executor = self.executor.with_approver(approver);
        self
    }

    pub fn with_planner(mut self, planner: TaskPlanner) -> Self {
        self.planner = planner;
        self
    }

    pub fn config(&self) -> &ReasoningConfig {
        &self.config
    }

    pub fn set_verbosity(&mut self, verbosity: Verbosity) {
        self.presenter.set_verbosity(verbosity);
    }

    pub fn safety(&self) -> &SafetyManager {
        self.executor.safety()
    }

    pub fn safety_mut(&mut self) -> &mut SafetyManager {
        self.executor.safety_mut()
    }

    pub fn pending_plan(&self) -> Option<&TaskPlan> {
        self.pending.as_ref()
    }

    pub fn active_execution(&self) -> Option<&ExecutionContext> {
        self.active.as_ref()
    }

    pub fn cancel_pending(&mut self) {
        if let Some(plan) = self.pending.take() {
            info!("Cancelled pending plan {}", plan.id);
        }
    }

    /// Requests simple enough to skip the pipeline entirely
    pub fn should_bypass_reasoning(&self, request: &str) -> bool {
        if !self.config.enabled || !self.config.auto_assess {
            return true;
        }
        let complexity = self.assessor.assess(request);
        complexity.level == ComplexityLevel::Simple
            && complexity.confidence > 0.8
            && !self.config.always_confirm
    }

    pub fn process(&mut self, request: &str, context: &SystemContext) -> ProcessingResult {
        if !self.config.enabled {
            return ProcessingResult::message(
                "Reasoning system is disabled. Passing request directly to agent.",
            );
        }

        let normalized = normalize(request);
        self.executor
            .set_package_manager(PackageManager::detect(context, None));

        if let Some(ctx) = self.active.take() {
            return self.continue_execution(ctx, request, &normalized);
        }

        if is_approval(&normalized) {
            return self.handle_approval();
        }
        if is_rejection(&normalized) {
            return self.handle_rejection();
        }
        if is_undo(&normalized) {
            return self.handle_undo();
        }

        if let Some(plan) = &self.pending {
            debug!("Plan {} still pending, holding new request", plan.id);
            return ProcessingResult {
                response: format!(
                    "I'm still waiting on the plan for \"{}\". Say yes to run it or no to cancel.\n\n{}",
                    plan.original_request,
                    self.presenter.plan(plan)
                ),
                plan: Some(plan.clone()),
                needs_approval: true,
                ..ProcessingResult::default()
            };
        }

        let complexity = self.assessor.assess(request);
        debug!(
            "Assessed '{}' as {} ({:.2})",
            request, complexity.level, complexity.confidence
        );

        if complexity.level == ComplexityLevel::Simple && !self.config.always_confirm {
            return ProcessingResult {
                complexity: Some(complexity),
                ..ProcessingResult::default()
            };
        }

        let plan = self.planner.create_plan(request, context);

        if self.planner.last_source() == Some(PlanSource::Clarification) {
            let question = clarification(&plan);
            return ProcessingResult {
                response: question.clone(),
                complexity: Some(complexity),
                plan: Some(plan),
                needs_input: true,
                input_prompt: Some(question),
                ..ProcessingResult::default()
            };
        }

        let intro = self.presenter.complexity_intro(complexity.level, request);
        let plan_text = self.presenter.plan(&plan);
        let response = if intro.is_empty() {
            plan_text
        } else {
            format!("{}\n\n{}", intro, plan_text)
        };

        info!("Holding plan {} for approval", plan.id);
        self.pending = Some(plan.clone());

        ProcessingResult {
            response,
            complexity: Some(complexity),
            plan: Some(plan),
            needs_approval: true,
            ..ProcessingResult::default()
        }
    }

    /// Pending rollback actions, most recent first
    pub fn rollback_stack(&self) -> Vec<RollbackEntry> {
        self.safety()
            .get_rollback_stack()
            .into_iter()
            .map(|a| RollbackEntry {
                can_undo: a.rollback_command.is_some() || a.backup_path.is_some(),
                id: a.id,
                description: a.description,
                timestamp: a.timestamp,
            })
            .collect()
    }

    pub fn explain_last_operation(&self) -> String {
        let stack = self.safety().get_rollback_stack();
        let Some(last) = stack.first() else {
            return "No recent operations to explain.".to_string();
        };

        let mut lines = vec![format!("Last operation: {}", last.description)];
        if let Some(command) = &last.rollback_command {
            lines.push(format!("Can be undone with: {}", command));
        }
        if let Some(backup) = &last.backup_path {
            lines.push(format!("Backup saved at: {}", backup.display()));
        }
        lines.join("\n")
    }

    // =========================================================================
    // Handlers
    // =========================================================================

    fn handle_approval(&mut self) -> ProcessingResult {
        let Some(mut plan) = self.pending.take() else {
            return ProcessingResult::message(
                "Nothing pending to approve. What would you like me to do?",
            );
        };

        plan.approve();
        info!("Plan {} approved", plan.id);
        match self.executor.start_execution(plan) {
            Ok(ctx) => self.drive(ctx),
            Err(e) => {
                warn!("Could not start execution: {}", e);
                ProcessingResult::message(format!("Couldn't start that plan: {}", e))
            }
        }
    }

    fn handle_rejection(&mut self) -> ProcessingResult {
        match self.pending.take() {
            Some(plan) => {
                info!("Plan {} rejected", plan.id);
                ProcessingResult::message("No problem, cancelled. What else can I help with?")
            }
            None => ProcessingResult::message("Nothing to cancel. What would you like me to do?"),
        }
    }

    fn handle_undo(&mut self) -> ProcessingResult {
        let stack = self.safety().get_rollback_stack();
        let Some(last) = stack.first() else {
            return ProcessingResult::message("Nothing to undo - no recent actions recorded.");
        };

        let (success, message) = self.safety_mut().rollback_last();
        if success {
            ProcessingResult::message(format!("Done! Undid: {}\n{}", last.description, message))
        } else {
            ProcessingResult::message(format!(
                "Couldn't undo automatically: {}\nYou may need to manually revert: {}",
                message, last.description
            ))
        }
    }

    /// Feed the user's reply into a suspended execution
    fn continue_execution(
        &mut self,
        mut ctx: ExecutionContext,
        request: &str,
        normalized: &str,
    ) -> ProcessingResult {
        if ctx.state == ExecutionState::WaitingApproval {
            let approved = is_approval(normalized);
            if !approved && !is_rejection(normalized) {
                return self.suspend(ctx);
            }
            // A declined step is skipped; the rest of the plan carries on
            if let Err(e) = self.executor.resolve_step_approval(&mut ctx, approved) {
                warn!("Could not resolve step approval: {}", e);
            }
            return self.drive(ctx);
        }

        if is_rejection(normalized) {
            self.executor.abort_execution(&mut ctx, false);
            info!("Suspended plan {} stopped by user", ctx.plan.id);
            return ProcessingResult {
                response: "Okay, stopped. Anything that already ran was left in place; say 'undo' to revert the last change.".to_string(),
                plan: Some(ctx.plan.clone()),
                execution_context: Some(ctx),
                ..ProcessingResult::default()
            };
        }

        if let Err(e) = self.executor.resume_execution(&mut ctx, Some(request.trim())) {
            warn!("Could not resume plan {}: {}", ctx.plan.id, e);
            return ProcessingResult {
                response: format!("Couldn't continue: {}", e),
                execution_context: Some(ctx),
                ..ProcessingResult::default()
            };
        }
        self.drive(ctx)
    }

    /// Run until finished or suspended
    fn drive(&mut self, mut ctx: ExecutionContext) -> ProcessingResult {
        self.executor.execute_all(&mut ctx);

        if matches!(
            ctx.state,
            ExecutionState::Paused | ExecutionState::WaitingApproval
        ) {
            return self.suspend(ctx);
        }

        info!("Plan {} finished: {}", ctx.plan.id, ctx.state);
        ProcessingResult {
            response: self.presenter.execution(&ctx),
            plan: Some(ctx.plan.clone()),
            execution_context: Some(ctx),
            ..ProcessingResult::default()
        }
    }

    fn suspend(&mut self, ctx: ExecutionContext) -> ProcessingResult {
        let prompt = match ctx.state {
            ExecutionState::WaitingApproval => ctx
                .current()
                .map(|step| self.presenter.approval_request(step)),
            _ => ctx
                .current_step
                .as_deref()
                .and_then(|id| ctx.result(id))
                .and_then(|r| r.user_prompt.clone()),
        }
        .unwrap_or_else(|| "Waiting for your input.".to_string());

        let result = ProcessingResult {
            response: prompt.clone(),
            plan: Some(ctx.plan.clone()),
            execution_context: Some(ctx.clone()),
            needs_input: true,
            input_prompt: Some(prompt),
            ..ProcessingResult::default()
        };
        self.active = Some(ctx);
        result
    }
}

fn normalize(text: &str) -> String {
    text.trim()
        .trim_end_matches(['.', '!'])
        .trim()
        .to_lowercase()
}

fn is_approval(text: &str) -> bool {
    APPROVALS.contains(&text)
        || APPROVAL_PREFIXES.iter().any(|p| {
            text.strip_prefix(p)
                .is_some_and(|rest| rest.starts_with([' ', ',']))
        })
}

fn is_rejection(text: &str) -> bool {
    REJECTIONS.contains(&text)
}

fn is_undo(text: &str) -> bool {
    UNDO_RE.as_ref().is_some_and(|re| re.is_match(text))
}

fn clarification(plan: &TaskPlan) -> String {
    plan.steps
        .iter()
        .find_map(|s| match &s.action {
            StepAction::UserPrompt { prompt } => Some(prompt.clone()),
            _ => None,
        })
        .unwrap_or_else(|| "Could you tell me a bit more about what you want?".to_string())
}
