//! Plan synthesis.
//!
//! Resolution order: external planner, template table, intent parsing, and
//! finally a single clarification prompt. Every path ends in a validated,
//! risk-scored `TaskPlan`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::PlannerConfig;
use crate::context::{PackageManager, SystemContext};
use crate::error::{PlannerError, Result, WardenError};
use crate::intent::{parse_intent, plan_intent, IntentOutcome};
use crate::plan::{Probe, StepAction, TaskPlan, TaskStep};
use crate::risk::RiskLevel;
use crate::templates::match_template;

const CLARIFY_STEP_ID: &str = "clarify";

// =============================================================================
// External planner seam
// =============================================================================

/// Host-supplied planner, typically backed by a language model
pub trait ExternalPlanner: Send + Sync {
    fn plan(
        &self,
        request: &str,
        context: &SystemContext,
    ) -> std::result::Result<PlannerProposal, PlannerError>;
}

fn default_confidence() -> f32 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerProposal {
    #[serde(default)]
    pub steps: Vec<StepDescriptor>,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
}

impl PlannerProposal {
    pub fn new(steps: Vec<StepDescriptor>) -> Self {
        Self {
            steps,
            confidence: default_confidence(),
        }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }
}

/// Loose step shape accepted from an external planner
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepDescriptor {
    pub id: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    /// command, tool_call, verify, diagnostic or prompt
    #[serde(rename = "type")]
    pub step_type: Option<String>,
    pub action: Option<DescriptorAction>,
    pub depends_on: Vec<String>,
    pub rollback: Option<String>,
    pub explanation: Option<String>,
    pub expected: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DescriptorAction {
    Tool {
        tool: String,
        #[serde(default)]
        args: Map<String, Value>,
    },
    Command {
        command: String,
    },
    Prompt {
        prompt: String,
    },
}

impl DescriptorAction {
    fn probe(&self, step: &str) -> Result<Probe> {
        match self {
            DescriptorAction::Tool { tool, args } => Ok(Probe::tool(tool.clone(), args.clone())),
            DescriptorAction::Command { command } => Ok(Probe::command(command.clone())),
            DescriptorAction::Prompt { .. } => Err(WardenError::invalid_step(
                step,
                "a prompt cannot be used as a check",
            )),
        }
    }
}

impl StepDescriptor {
    pub fn command(id: &str, title: &str, command: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            title: Some(title.to_string()),
            action: Some(DescriptorAction::Command {
                command: command.to_string(),
            }),
            ..Default::default()
        }
    }

    /// Convert into a typed step. `index` supplies default ids and titles.
    pub fn into_step(self, index: usize) -> Result<TaskStep> {
        let id = self.id.unwrap_or_else(|| format!("llm_step_{}", index));
        let title = self.title.unwrap_or_else(|| format!("Step {}", index + 1));
        let kind = self
            .step_type
            .as_deref()
            .map(str::to_lowercase)
            .unwrap_or_default();

        let action = match (kind.as_str(), self.action) {
            ("prompt" | "user_prompt", action) => {
                let prompt = match action {
                    Some(DescriptorAction::Prompt { prompt }) => prompt,
                    _ => self
                        .description
                        .clone()
                        .unwrap_or_else(|| title.clone()),
                };
                StepAction::prompt(prompt)
            }
            (_, None) => return Err(WardenError::invalid_step(&id, "step has no action")),
            ("verify" | "verification", Some(action)) => StepAction::Verification {
                check: action.probe(&id)?,
                expected: self.expected,
            },
            ("diagnostic", Some(action)) => StepAction::Diagnostic {
                probe: action.probe(&id)?,
            },
            (_, Some(DescriptorAction::Command { command })) => StepAction::command(command),
            (_, Some(DescriptorAction::Tool { tool, args })) => StepAction::tool_call(tool, args),
            (_, Some(DescriptorAction::Prompt { prompt })) => StepAction::prompt(prompt),
        };

        let mut step = TaskStep::new(id, title, action).depends_on(self.depends_on);
        if let Some(description) = self.description {
            step = step.with_description(description);
        }
        if let Some(explanation) = self.explanation {
            step = step.with_explanation(explanation);
        }
        if let Some(rollback) = self.rollback {
            step = step.with_rollback(rollback);
        }
        Ok(step)
    }
}

// =============================================================================
// Summaries
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSummary {
    pub number: usize,
    pub title: String,
    pub explanation: String,
    pub risk: RiskLevel,
    pub reversible: bool,
}

/// Display-oriented view of a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub title: String,
    pub step_count: usize,
    pub estimated_duration_minutes: f64,
    pub requires_reboot: bool,
    pub highest_risk: RiskLevel,
    pub steps: Vec<StepSummary>,
}

pub fn plan_summary(plan: &TaskPlan) -> PlanSummary {
    let minutes = plan.total_estimated_duration as f64 / 60.0;
    PlanSummary {
        title: plan.title.clone(),
        step_count: plan.steps.len(),
        estimated_duration_minutes: (minutes * 10.0).round() / 10.0,
        requires_reboot: plan.requires_reboot,
        highest_risk: plan.highest_risk,
        steps: plan
            .steps
            .iter()
            .enumerate()
            .map(|(i, step)| StepSummary {
                number: i + 1,
                title: step.title.clone(),
                explanation: if step.explanation.is_empty() {
                    step.description.clone()
                } else {
                    step.explanation.clone()
                },
                risk: step.risk_level(),
                reversible: step.risk.as_ref().map_or(true, |r| r.reversible),
            })
            .collect(),
    }
}

// =============================================================================
// Planner
// =============================================================================

/// Where a plan's steps came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanSource {
    External,
    Template(&'static str),
    Intent,
    Clarification,
}

pub struct TaskPlanner {
    external: Option<Arc<dyn ExternalPlanner>>,
    min_external_confidence: f32,
    /// Root probed for package manager binaries; None disables probing
    probe_root: Option<PathBuf>,
    step_counter: usize,
    last_source: Option<PlanSource>,
}

impl std::fmt::Debug for TaskPlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPlanner")
            .field("external", &self.external.is_some())
            .field("min_external_confidence", &self.min_external_confidence)
            .field("probe_root", &self.probe_root)
            .finish()
    }
}

impl Default for TaskPlanner {
    fn default() -> Self {
        Self::new(&PlannerConfig::default())
    }
}

impl TaskPlanner {
    pub fn new(config: &PlannerConfig) -> Self {
        Self {
            external: None,
            min_external_confidence: config.min_external_confidence,
            probe_root: Some(PathBuf::from("/")),
            step_counter: 0,
            last_source: None,
        }
    }

    pub fn with_external_planner(mut self, planner: Arc<dyn ExternalPlanner>) -> Self {
        self.external = Some(planner);
        self
    }

    pub fn with_probe_root(mut self, root: Option<PathBuf>) -> Self {
        self.probe_root = root;
        self
    }

    pub fn has_external_planner(&self) -> bool {
        self.external.is_some()
    }

    /// Source of the most recent plan
    pub fn last_source(&self) -> Option<PlanSource> {
        self.last_source
    }

    /// Build a plan for a request. Never fails; the last resort is a question.
    pub fn create_plan(&mut self, request: &str, context: &SystemContext) -> TaskPlan {
        let (plan, source) = self.build(request, context);
        info!(
            "Created plan '{}' with {} steps ({:?}, highest risk {})",
            plan.title,
            plan.steps.len(),
            source,
            plan.highest_risk
        );
        self.last_source = Some(source);
        plan
    }

    fn build(&self, request: &str, context: &SystemContext) -> (TaskPlan, PlanSource) {
        if let Some(plan) = self.try_external(request, context) {
            return (plan, PlanSource::External);
        }

        let package_manager = PackageManager::detect(context, self.probe_root.as_deref());
        if package_manager.is_none() {
            debug!("No package manager detected");
        }

        if let Some(matched) = match_template(request, context, package_manager) {
            match TaskPlan::with_steps(request, matched.steps) {
                Ok(plan) => return (plan, PlanSource::Template(matched.template)),
                Err(e) => warn!("Template {} produced an invalid plan: {}", matched.template, e),
            }
        }

        let question = match parse_intent(request) {
            Some(intent) => match plan_intent(&intent, context, package_manager) {
                IntentOutcome::Steps(steps) => match TaskPlan::with_steps(request, steps) {
                    Ok(plan) => return (plan, PlanSource::Intent),
                    Err(e) => {
                        warn!("Intent produced an invalid plan: {}", e);
                        generic_question(request)
                    }
                },
                IntentOutcome::Clarify(question) => question,
            },
            None => generic_question(request),
        };

        (clarification_plan(request, question), PlanSource::Clarification)
    }

    fn try_external(&self, request: &str, context: &SystemContext) -> Option<TaskPlan> {
        let planner = self.external.as_ref()?;
        let proposal = match planner.plan(request, context) {
            Ok(proposal) => proposal,
            Err(e) => {
                warn!("External planner failed, planning locally: {}", e);
                return None;
            }
        };

        if proposal.steps.is_empty() {
            debug!("External planner returned no steps");
            return None;
        }
        if proposal.confidence < self.min_external_confidence {
            debug!(
                "External planner confidence {:.2} below {:.2}, deferring",
                proposal.confidence, self.min_external_confidence
            );
            return None;
        }

        let steps = proposal
            .steps
            .into_iter()
            .enumerate()
            .map(|(i, d)| d.into_step(i))
            .collect::<Result<Vec<_>>>();
        match steps.and_then(|steps| TaskPlan::with_steps(request, steps)) {
            Ok(plan) => Some(plan),
            Err(e) => {
                warn!("Rejected external plan: {}", e);
                None
            }
        }
    }

    /// Append a step and re-run risk aggregation. Returns the new step's id.
    pub fn add_step(
        &mut self,
        plan: &mut TaskPlan,
        title: &str,
        action: StepAction,
        depends_on: &[String],
        explanation: &str,
    ) -> Result<String> {
        let id = loop {
            self.step_counter += 1;
            let candidate = format!("step_{}", self.step_counter);
            if plan.step(&candidate).is_none() {
                break candidate;
            }
        };

        let description = if explanation.is_empty() { title } else { explanation };
        let step = TaskStep::new(id.clone(), title, action)
            .with_description(description)
            .with_explanation(explanation)
            .depends_on(depends_on.iter().cloned());

        plan.steps.push(step);
        if let Err(e) = plan.validate() {
            plan.steps.pop();
            return Err(e);
        }
        plan.assess_risks();
        debug!("Added step {} to plan {}", id, plan.id);
        Ok(id)
    }
}

fn generic_question(request: &str) -> String {
    format!(
        "I'm not sure which concrete steps are needed for: {}. Which service, container or package should change, and how?",
        request.trim()
    )
}

fn clarification_plan(request: &str, question: String) -> TaskPlan {
    let mut plan = TaskPlan::new(request);
    plan.steps.push(
        TaskStep::new(
            CLARIFY_STEP_ID,
            "Clarify the request",
            StepAction::prompt(question),
        )
        .with_explanation("I need a bit more detail before changing anything"),
    );
    plan.assess_risks();
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::StepType;

    struct Fixed(std::result::Result<PlannerProposal, PlannerError>);

    impl ExternalPlanner for Fixed {
        fn plan(
            &self,
            _request: &str,
            _context: &SystemContext,
        ) -> std::result::Result<PlannerProposal, PlannerError> {
            self.0.clone()
        }
    }

    fn local() -> TaskPlanner {
        TaskPlanner::default().with_probe_root(None)
    }

    fn with_external(proposal: std::result::Result<PlannerProposal, PlannerError>) -> TaskPlanner {
        local().with_external_planner(Arc::new(Fixed(proposal)))
    }

    fn ctx() -> SystemContext {
        SystemContext {
            service_names: vec!["nginx.service".to_string()],
            package_manager: Some("apt".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_external_plan_used() {
        let proposal = PlannerProposal::new(vec![
            StepDescriptor::command("a", "Look", "ls /etc"),
            StepDescriptor {
                step_type: Some("verify".to_string()),
                action: Some(DescriptorAction::Command {
                    command: "test -d /etc".to_string(),
                }),
                expected: Some("".to_string()),
                depends_on: vec!["a".to_string()],
                ..Default::default()
            },
        ]);
        let mut planner = with_external(Ok(proposal));
        let plan = planner.create_plan("check etc", &ctx());

        assert_eq!(planner.last_source(), Some(PlanSource::External));
        assert_eq!(plan.steps[1].id, "llm_step_1");
        assert_eq!(plan.steps[1].title, "Step 2");
        assert_eq!(plan.steps[1].step_type(), StepType::Verification);
    }

    #[test]
    fn test_low_confidence_defers() {
        let proposal =
            PlannerProposal::new(vec![StepDescriptor::command("a", "x", "ls")]).with_confidence(0.1);
        let mut planner = with_external(Ok(proposal));
        planner.create_plan("restart the nginx service", &ctx());
        assert_eq!(planner.last_source(), Some(PlanSource::Template("restart_service")));
    }

    #[test]
    fn test_planner_error_defers() {
        let mut planner = with_external(Err(PlannerError::Unavailable("offline".to_string())));
        let plan = planner.create_plan("restart the nginx service", &ctx());
        assert_eq!(plan.steps.len(), 3);
    }

    #[test]
    fn test_invalid_descriptors_defer() {
        let proposal = PlannerProposal::new(vec![StepDescriptor {
            id: Some("a".to_string()),
            depends_on: vec!["ghost".to_string()],
            action: Some(DescriptorAction::Command {
                command: "ls".to_string(),
            }),
            ..Default::default()
        }]);
        let mut planner = with_external(Ok(proposal));
        planner.create_plan("restart the nginx service", &ctx());
        assert_ne!(planner.last_source(), Some(PlanSource::External));
    }

    #[test]
    fn test_descriptor_json_shapes() {
        let steps: Vec<StepDescriptor> = serde_json::from_str(
            r#"[
                {"id": "info", "type": "diagnostic", "action": {"tool": "linux_system_info", "args": {}}},
                {"type": "prompt", "description": "Which disk?"},
                {"title": "Free space", "action": {"command": "df -h"}, "rollback": "true"}
            ]"#,
        )
        .unwrap();
        let steps: Vec<TaskStep> = steps
            .into_iter()
            .enumerate()
            .map(|(i, d)| d.into_step(i).unwrap())
            .collect();

        assert_eq!(steps[0].step_type(), StepType::Diagnostic);
        assert_eq!(steps[1].action, StepAction::prompt("Which disk?"));
        assert_eq!(steps[2].id, "llm_step_2");
        assert_eq!(steps[2].rollback_command.as_deref(), Some("true"));
    }

    #[test]
    fn test_descriptor_without_action_rejected() {
        let d = StepDescriptor {
            id: Some("x".to_string()),
            ..Default::default()
        };
        assert!(d.into_step(0).is_err());
    }

    #[test]
    fn test_unknown_request_asks() {
        let mut planner = local();
        let plan = planner.create_plan("make everything better", &ctx());
        assert_eq!(planner.last_source(), Some(PlanSource::Clarification));
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].step_type(), StepType::UserPrompt);
        assert_eq!(plan.highest_risk, RiskLevel::Safe);
    }

    #[test]
    fn test_add_step_reaggregates() {
        let mut planner = local();
        let mut plan = planner.create_plan("restart nginx", &ctx());
        let before = plan.total_estimated_duration;
        let first = plan.steps[0].id.clone();

        let id = planner
            .add_step(
                &mut plan,
                "Reboot",
                StepAction::command("sudo reboot"),
                &[first],
                "",
            )
            .unwrap();
        assert_eq!(id, "step_1");
        assert!(plan.requires_reboot);
        assert_eq!(plan.total_estimated_duration, before + 30);
        assert_eq!(plan.step(&id).unwrap().description, "Reboot");
    }

    #[test]
    fn test_add_step_rejects_unknown_dependency() {
        let mut planner = local();
        let mut plan = planner.create_plan("restart nginx", &ctx());
        let len = plan.steps.len();
        let err = planner.add_step(
            &mut plan,
            "x",
            StepAction::command("ls"),
            &["ghost".to_string()],
            "",
        );
        assert!(err.is_err());
        assert_eq!(plan.steps.len(), len);
    }

    #[test]
    fn test_plan_summary() {
        let mut planner = local();
        let plan = planner.create_plan("install htop", &ctx());
        let summary = plan_summary(&plan);

        assert_eq!(summary.step_count, 2);
        assert_eq!(summary.steps[0].number, 1);
        assert_eq!(summary.highest_risk, RiskLevel::Medium);
        // Only the install command is scored
        assert_eq!(summary.estimated_duration_minutes, 2.0);
        assert!(summary.steps[1].reversible);
    }
}
