//! Plans and steps.
//!
//! A step's action is a closed tagged enum with one variant per step type, so
//! execution never sees an ill-formed action. Plans are validated once when
//! built; after that only step status fields change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use tracing::debug;

use crate::error::{Result, WardenError};
use crate::risk::{
    assess_command_risk, assess_tool_risk, critical_paths_in, RiskAssessment, RiskLevel,
};

/// Tool name hosts use for plain shell execution
pub const RUN_COMMAND_TOOL: &str = "linux_run_command";

const TITLE_WORDS: usize = 6;

// =============================================================================
// Step actions
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Command,
    ToolCall,
    Verification,
    UserPrompt,
    Diagnostic,
    Conditional,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::ToolCall => "tool_call",
            Self::Verification => "verification",
            Self::UserPrompt => "user_prompt",
            Self::Diagnostic => "diagnostic",
            Self::Conditional => "conditional",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that can be run to observe system state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Probe {
    Command {
        command: String,
    },
    Tool {
        tool: String,
        #[serde(default)]
        args: Map<String, Value>,
    },
}

impl Probe {
    pub fn command(command: impl Into<String>) -> Self {
        Probe::Command {
            command: command.into(),
        }
    }

    pub fn tool(tool: impl Into<String>, args: Map<String, Value>) -> Self {
        Probe::Tool {
            tool: tool.into(),
            args,
        }
    }

    fn validate(&self, step: &str) -> Result<()> {
        match self {
            Probe::Command { command } if command.trim().is_empty() => {
                Err(WardenError::invalid_step(step, "probe command is empty"))
            }
            Probe::Tool { tool, .. } if tool.trim().is_empty() => {
                Err(WardenError::invalid_step(step, "probe tool name is empty"))
            }
            _ => Ok(()),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Probe::Command { command } => command.clone(),
            Probe::Tool { tool, .. } => format!("tool {}", tool),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepAction {
    Command {
        command: String,
    },
    ToolCall {
        tool: String,
        #[serde(default)]
        args: Map<String, Value>,
    },
    Verification {
        check: Probe,
        #[serde(default)]
        expected: Option<String>,
    },
    UserPrompt {
        prompt: String,
    },
    Diagnostic {
        probe: Probe,
    },
    Conditional {
        check: Probe,
        #[serde(default)]
        expected: Option<String>,
        #[serde(default)]
        when_true: Vec<String>,
        #[serde(default)]
        when_false: Vec<String>,
    },
}

impl StepAction {
    pub fn command(command: impl Into<String>) -> Self {
        StepAction::Command {
            command: command.into(),
        }
    }

    pub fn tool_call(tool: impl Into<String>, args: Map<String, Value>) -> Self {
        StepAction::ToolCall {
            tool: tool.into(),
            args,
        }
    }

    pub fn prompt(prompt: impl Into<String>) -> Self {
        StepAction::UserPrompt {
            prompt: prompt.into(),
        }
    }

    pub fn step_type(&self) -> StepType {
        match self {
            StepAction::Command { .. } => StepType::Command,
            StepAction::ToolCall { .. } => StepType::ToolCall,
            StepAction::Verification { .. } => StepType::Verification,
            StepAction::UserPrompt { .. } => StepType::UserPrompt,
            StepAction::Diagnostic { .. } => StepType::Diagnostic,
            StepAction::Conditional { .. } => StepType::Conditional,
        }
    }

    /// Shell command this action will run, if any.
    ///
    /// Includes run-command tool calls so they are risk-scored like shell steps.
    pub fn shell_command(&self) -> Option<&str> {
        match self {
            StepAction::Command { command } => Some(command),
            StepAction::ToolCall { tool, args } if tool == RUN_COMMAND_TOOL => {
                args.get("command").and_then(Value::as_str)
            }
            _ => None,
        }
    }

    /// Text shown next to a step when commands are displayed
    pub fn display_command(&self) -> Option<String> {
        match self {
            StepAction::Command { command } => Some(command.clone()),
            StepAction::ToolCall { tool, .. } => Some(
                self.shell_command()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("tool {}", tool)),
            ),
            StepAction::Verification { check, .. }
            | StepAction::Diagnostic { probe: check }
            | StepAction::Conditional { check, .. } => Some(check.describe()),
            StepAction::UserPrompt { .. } => None,
        }
    }

    fn validate(&self, step: &str) -> Result<()> {
        match self {
            StepAction::Command { command } if command.trim().is_empty() => {
                Err(WardenError::invalid_step(step, "command is empty"))
            }
            StepAction::ToolCall { tool, .. } if tool.trim().is_empty() => {
                Err(WardenError::invalid_step(step, "tool name is empty"))
            }
            StepAction::UserPrompt { prompt } if prompt.trim().is_empty() => {
                Err(WardenError::invalid_step(step, "prompt is empty"))
            }
            StepAction::Verification { check, .. } => check.validate(step),
            StepAction::Diagnostic { probe } => probe.validate(step),
            StepAction::Conditional {
                check,
                when_true,
                when_false,
                ..
            } => {
                check.validate(step)?;
                if when_true.iter().chain(when_false).any(|id| id == step) {
                    return Err(WardenError::invalid_step(step, "conditional branches to itself"));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

// =============================================================================
// Steps
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Ready,
    InProgress,
    Completed,
    Failed,
    Skipped,
    Blocked,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Blocked => "blocked",
        }
    }

    /// Not yet run
    pub fn is_waiting(&self) -> bool {
        matches!(self, Self::Pending | Self::Ready)
    }

    /// Will never run again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::Blocked
        )
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStep {
    pub id: String,
    pub title: String,
    pub description: String,
    pub action: StepAction,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    #[serde(default)]
    pub risk: Option<RiskAssessment>,
    #[serde(default)]
    pub rollback_command: Option<String>,
    #[serde(default)]
    pub backup_paths: Vec<PathBuf>,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Fallback actions of the same type, tried in order on failure
    #[serde(default)]
    pub alternatives: Vec<StepAction>,
    #[serde(default)]
    pub explanation: String,
}

impl TaskStep {
    pub fn new(id: impl Into<String>, title: impl Into<String>, action: StepAction) -> Self {
        let title = title.into();
        Self {
            id: id.into(),
            description: title.clone(),
            title,
            action,
            depends_on: BTreeSet::new(),
            risk: None,
            rollback_command: None,
            backup_paths: Vec::new(),
            status: StepStatus::Pending,
            result: None,
            error: None,
            started_at: None,
            completed_at: None,
            alternatives: Vec::new(),
            explanation: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_explanation(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = explanation.into();
        self
    }

    pub fn with_rollback(mut self, command: impl Into<String>) -> Self {
        self.rollback_command = Some(command.into());
        self
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn with_alternative(mut self, action: StepAction) -> Self {
        self.alternatives.push(action);
        self
    }

    pub fn step_type(&self) -> StepType {
        self.action.step_type()
    }

    pub fn is_ready(&self, completed: &BTreeSet<String>) -> bool {
        self.depends_on.iter().all(|dep| completed.contains(dep))
    }

    pub fn risk_level(&self) -> RiskLevel {
        self.risk.as_ref().map(|r| r.level).unwrap_or_default()
    }

    pub fn requires_confirmation(&self) -> bool {
        self.risk
            .as_ref()
            .is_some_and(|r| r.requires_confirmation)
    }

    pub fn requires_backup(&self) -> bool {
        self.risk.as_ref().is_some_and(|r| r.requires_backup) || !self.backup_paths.is_empty()
    }

    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(WardenError::invalid_step(&self.title, "step id is empty"));
        }
        self.action.validate(&self.id)?;
        let step_type = self.step_type();
        for alternative in &self.alternatives {
            if alternative.step_type() != step_type {
                return Err(WardenError::invalid_step(
                    &self.id,
                    format!(
                        "alternative of type {} does not match step type {}",
                        alternative.step_type(),
                        step_type
                    ),
                ));
            }
            alternative.validate(&self.id)?;
        }
        if self.depends_on.contains(&self.id) {
            return Err(WardenError::invalid_step(&self.id, "step depends on itself"));
        }
        Ok(())
    }
}

// =============================================================================
// Plans
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPlan {
    pub id: String,
    pub title: String,
    pub original_request: String,
    pub created_at: DateTime<Utc>,
    pub steps: Vec<TaskStep>,
    /// Seconds
    pub total_estimated_duration: u64,
    pub requires_reboot: bool,
    pub highest_risk: RiskLevel,
    pub approved: bool,
    pub approved_at: Option<DateTime<Utc>>,
    pub completed_steps: BTreeSet<String>,
    pub failed_steps: BTreeSet<String>,
}

impl TaskPlan {
    pub fn new(request: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string()[..12].to_string(),
            title: plan_title(request),
            original_request: request.to_string(),
            created_at: Utc::now(),
            steps: Vec::new(),
            total_estimated_duration: 0,
            requires_reboot: false,
            highest_risk: RiskLevel::Safe,
            approved: false,
            approved_at: None,
            completed_steps: BTreeSet::new(),
            failed_steps: BTreeSet::new(),
        }
    }

    /// Build, validate and risk-score a plan from steps
    pub fn with_steps(request: &str, steps: Vec<TaskStep>) -> Result<Self> {
        let mut plan = Self::new(request);
        plan.steps = steps;
        plan.validate()?;
        plan.assess_risks();
        Ok(plan)
    }

    pub fn approve(&mut self) {
        self.approved = true;
        self.approved_at = Some(Utc::now());
    }

    /// Structural checks: unique ids, known dependencies and branches, no cycles
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(WardenError::InvalidPlan("plan has no steps".to_string()));
        }

        let mut ids: HashSet<&str> = HashSet::new();
        for step in &self.steps {
            step.validate()?;
            if !ids.insert(step.id.as_str()) {
                return Err(WardenError::InvalidPlan(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
        }

        for step in &self.steps {
            if let Some(dep) = step.depends_on.iter().find(|d| !ids.contains(d.as_str())) {
                return Err(WardenError::invalid_step(
                    &step.id,
                    format!("depends on unknown step '{}'", dep),
                ));
            }
            if let StepAction::Conditional {
                when_true,
                when_false,
                ..
            } = &step.action
            {
                if let Some(target) = when_true
                    .iter()
                    .chain(when_false)
                    .find(|t| !ids.contains(t.as_str()))
                {
                    return Err(WardenError::invalid_step(
                        &step.id,
                        format!("branches to unknown step '{}'", target),
                    ));
                }
            }
        }

        self.check_acyclic()
    }

    fn check_acyclic(&self) -> Result<()> {
        let mut remaining: HashMap<&str, usize> = self
            .steps
            .iter()
            .map(|s| (s.id.as_str(), s.depends_on.len()))
            .collect();
        let mut resolved: Vec<&str> = remaining
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut seen = 0;

        while let Some(id) = resolved.pop() {
            seen += 1;
            for step in self.steps.iter().filter(|s| s.depends_on.contains(id)) {
                if let Some(n) = remaining.get_mut(step.id.as_str()) {
                    *n -= 1;
                    if *n == 0 {
                        resolved.push(step.id.as_str());
                    }
                }
            }
        }

        if seen == self.steps.len() {
            Ok(())
        } else {
            Err(WardenError::InvalidPlan(
                "step dependencies contain a cycle".to_string(),
            ))
        }
    }

    /// Score every shell step and recompute plan-level aggregates
    pub fn assess_risks(&mut self) {
        let mut total = 0;
        let mut highest = RiskLevel::Safe;
        let mut reboot = false;

        for step in &mut self.steps {
            if let Some(command) = step.action.shell_command() {
                let risk = assess_command_risk(command);
                for path in critical_paths_in(command) {
                    let path = PathBuf::from(path);
                    if !step.backup_paths.contains(&path) {
                        step.backup_paths.push(path);
                    }
                }
                step.risk = Some(risk);
            } else if let StepAction::ToolCall { tool, .. } = &step.action {
                step.risk = Some(assess_tool_risk(tool));
            }
            if let Some(risk) = &step.risk {
                total += risk.estimated_duration_seconds;
                highest = highest.max(risk.level);
                reboot |= risk.requires_reboot;
            }
        }

        self.total_estimated_duration = total;
        self.highest_risk = highest;
        self.requires_reboot = reboot;
    }

    pub fn step(&self, id: &str) -> Option<&TaskStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: &str) -> Option<&mut TaskStep> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == id)
    }

    pub fn mark_completed(&mut self, id: &str) {
        self.failed_steps.remove(id);
        self.completed_steps.insert(id.to_string());
    }

    pub fn mark_failed(&mut self, id: &str) {
        self.completed_steps.remove(id);
        self.failed_steps.insert(id.to_string());
    }

    /// Propagate failures and skips down the dependency graph until stable.
    ///
    /// A waiting step whose dependency failed or was blocked becomes BLOCKED;
    /// one whose dependency was skipped becomes SKIPPED.
    pub fn propagate_blocked(&mut self) -> usize {
        let mut changed_total = 0;
        loop {
            let statuses: HashMap<String, StepStatus> = self
                .steps
                .iter()
                .map(|s| (s.id.clone(), s.status))
                .collect();
            let mut changed = 0;

            for step in self.steps.iter_mut().filter(|s| s.status.is_waiting()) {
                let dep_status = |dep: &String| statuses.get(dep).copied();
                let blocked = step.depends_on.iter().any(|d| {
                    self.failed_steps.contains(d)
                        || matches!(dep_status(d), Some(StepStatus::Failed | StepStatus::Blocked))
                });
                if blocked {
                    debug!("Step {} blocked by a failed dependency", step.id);
                    step.status = StepStatus::Blocked;
                    step.error = Some("Blocked by failed dependency".to_string());
                    changed += 1;
                    continue;
                }
                if step
                    .depends_on
                    .iter()
                    .any(|d| dep_status(d) == Some(StepStatus::Skipped))
                {
                    debug!("Step {} skipped with its dependency", step.id);
                    step.status = StepStatus::Skipped;
                    changed += 1;
                }
            }

            if changed == 0 {
                return changed_total;
            }
            changed_total += changed;
        }
    }

    /// Index of the next runnable step, in plan order.
    ///
    /// Never returns a step with a dependency in `failed_steps`; such steps
    /// are marked BLOCKED first.
    pub fn next_ready_step(&mut self) -> Option<usize> {
        self.propagate_blocked();
        let completed = &self.completed_steps;
        let index = self
            .steps
            .iter()
            .position(|s| s.status.is_waiting() && s.is_ready(completed))?;
        self.steps[index].status = StepStatus::Ready;
        Some(index)
    }

    /// Every step is COMPLETED, FAILED, SKIPPED or BLOCKED
    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(|s| s.status.is_terminal())
    }

    pub fn has_failed(&self) -> bool {
        self.steps.iter().any(|s| s.status == StepStatus::Failed)
    }

    /// (finished, total) where finished counts COMPLETED and SKIPPED
    pub fn progress(&self) -> (usize, usize) {
        let done = self
            .steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Completed | StepStatus::Skipped))
            .count();
        (done, self.steps.len())
    }

    pub fn count_status(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }
}

/// First six words of the request, first letter capitalised
pub fn plan_title(request: &str) -> String {
    let words: Vec<&str> = request.split_whitespace().collect();
    let mut title = words
        .iter()
        .take(TITLE_WORDS)
        .copied()
        .collect::<Vec<_>>()
        .join(" ");
    if words.len() > TITLE_WORDS {
        title.push_str("...");
    }
    let mut chars = title.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => title,
    }
}
