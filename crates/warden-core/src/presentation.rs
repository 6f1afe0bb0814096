//! Short plan and execution text for the conversation surface.

use crate::complexity::ComplexityLevel;
use crate::config::{ConversationConfig, Verbosity};
use crate::executor::{ExecutionContext, ExecutionState};
use crate::plan::{TaskPlan, TaskStep};
use crate::risk::RiskLevel;
use crate::safety::RollbackAction;

const COMPLEX_INTROS: [&str; 3] = [
    "This will take a few steps. Let me plan it out...",
    "Okay, this needs some planning. Here's what I'm thinking...",
    "Let me break this down into steps for you...",
];

#[derive(Debug, Clone)]
pub struct Presenter {
    prefs: ConversationConfig,
    explain_steps: bool,
}

impl Default for Presenter {
    fn default() -> Self {
        Self::new(ConversationConfig::default(), true)
    }
}

impl Presenter {
    pub fn new(prefs: ConversationConfig, explain_steps: bool) -> Self {
        Self {
            prefs,
            explain_steps,
        }
    }

    pub fn verbosity(&self) -> Verbosity {
        self.prefs.verbosity
    }

    pub fn set_verbosity(&mut self, verbosity: Verbosity) {
        self.prefs.verbosity = verbosity;
    }

    /// Intro line before a plan. Empty for simple requests.
    pub fn complexity_intro(&self, level: ComplexityLevel, request: &str) -> String {
        match level {
            ComplexityLevel::Simple => String::new(),
            ComplexityLevel::Diagnostic => "Let me check what's going on first...".to_string(),
            ComplexityLevel::Risky => "This involves some system changes. Let me show you exactly what I'll do before we proceed.".to_string(),
            ComplexityLevel::Complex => {
                // Same request, same phrase
                let pick = request.bytes().map(usize::from).sum::<usize>() % COMPLEX_INTROS.len();
                COMPLEX_INTROS[pick].to_string()
            }
        }
    }

    pub fn plan(&self, plan: &TaskPlan) -> String {
        let mut lines = Vec::new();
        let risky = plan.highest_risk >= RiskLevel::High;

        if risky {
            lines.push(format!("Here's what I'll do for \"{}\":", plan.original_request));
        } else {
            lines.push("Alright, here's the plan:".to_string());
        }
        lines.push(String::new());

        for (i, step) in plan.steps.iter().enumerate() {
            lines.push(format!("{}. {}", i + 1, step.title));
            if self.prefs.verbosity == Verbosity::Minimal {
                continue;
            }

            if self.explain_steps {
                let detail = if step.explanation.is_empty() {
                    &step.description
                } else {
                    &step.explanation
                };
                if !detail.is_empty() && detail != &step.title {
                    lines.push(format!("   {}", detail));
                }
            }

            if self.prefs.show_commands {
                if let Some(command) = step.action.display_command() {
                    lines.push(format!("   → `{}`", command));
                }
            }

            if let Some(risk) = step.risk.as_ref().filter(|r| r.level >= RiskLevel::High) {
                lines.push(format!("   ⚠️  {}", risk.reasons.join(", ")));
            }
        }
        lines.push(String::new());

        lines.push(format!(
            "This should take {}.",
            duration_phrase(plan.total_estimated_duration)
        ));
        if plan.requires_reboot {
            lines.push("Note: You'll need to reboot after this.".to_string());
        }
        if risky {
            lines.push(String::new());
            lines.push("⚠️  This includes some system changes. I'll create backups first.".to_string());
        }
        lines.push(String::new());
        lines.push("Want me to go ahead?".to_string());

        lines.join("\n")
    }

    pub fn execution(&self, ctx: &ExecutionContext) -> String {
        let mut lines = Vec::new();

        match ctx.state {
            ExecutionState::Completed => {
                if self.prefs.verbosity == Verbosity::Minimal {
                    return "Done.".to_string();
                }
                lines.push("All done! ✓".to_string());

                let (completed, total) = ctx.plan.progress();
                if completed == total {
                    lines.push(format!("Completed all {} steps successfully.", total));
                } else {
                    lines.push(format!("Completed {} of {} steps.", completed, total));
                }
                if let Some(failed) = ctx.first_failure() {
                    lines.push(format!(
                        "{} failed: {}",
                        step_label(ctx, &failed.step_id),
                        failed.error.as_deref().unwrap_or("unknown error")
                    ));
                }

                if let (Some(start), Some(end)) = (ctx.start_time, ctx.end_time) {
                    let secs = (end - start).num_milliseconds() as f64 / 1000.0;
                    if secs < 60.0 {
                        lines.push(format!("Took {:.1} seconds.", secs));
                    } else {
                        lines.push(format!("Took {:.1} minutes.", secs / 60.0));
                    }
                }
            }
            ExecutionState::Failed => {
                lines.push("Ran into a problem.".to_string());
                match ctx.first_failure() {
                    Some(failed) => {
                        lines.push(format!("Failed at: {}", step_label(ctx, &failed.step_id)));
                        if let Some(error) = &failed.error {
                            lines.push(format!("Error: {}", error));
                        }
                    }
                    None => {
                        if let Some(reason) = &ctx.failure_reason {
                            lines.push(format!("Reason: {}", reason));
                        }
                    }
                }
                lines.push(String::new());
                lines.push("I've kept backups of anything that was changed.".to_string());
            }
            ExecutionState::RolledBack => {
                lines.push("Something went wrong, so I've undone the changes.".to_string());
                lines.push("Your system is back to how it was before.".to_string());
            }
            ExecutionState::Paused | ExecutionState::WaitingApproval => {
                if let Some(step) = ctx.current() {
                    lines.push(format!("Paused at: {}", step.title));
                }
            }
            ExecutionState::Idle | ExecutionState::Running => {}
        }

        self.append_warnings(ctx, &mut lines);
        lines.join("\n")
    }

    fn append_warnings(&self, ctx: &ExecutionContext, lines: &mut Vec<String>) {
        let warnings: Vec<&String> = ctx
            .step_results
            .iter()
            .flat_map(|r| r.warnings.iter())
            .collect();
        if warnings.is_empty() || self.prefs.verbosity == Verbosity::Minimal {
            return;
        }
        lines.push(String::new());
        lines.push("Heads up:".to_string());
        for warning in warnings {
            lines.push(format!("• {}", warning));
        }
    }

    /// Confirmation text for a single risky step
    pub fn approval_request(&self, step: &TaskStep) -> String {
        let mut lines = Vec::new();

        if step.risk_level() == RiskLevel::Critical {
            lines.push("⚠️  This is a significant change:".to_string());
        } else {
            lines.push("Just to check before I continue:".to_string());
        }
        lines.push(String::new());
        lines.push(step.title.clone());

        if let Some(risk) = &step.risk {
            for reason in risk.reasons.iter().take(3) {
                lines.push(format!("• {}", reason));
            }
            if !risk.reversible {
                lines.push(String::new());
                lines.push("⚠️  This can't be undone automatically.".to_string());
            }
            if risk.data_loss_possible {
                lines.push("⚠️  There's a chance of data loss.".to_string());
            }
        }

        if let Some(rollback) = &step.rollback_command {
            lines.push(String::new());
            lines.push(format!("If needed, I can undo this with: `{}`", rollback));
        }

        lines.push(String::new());
        lines.push("Okay to proceed?".to_string());
        lines.join("\n")
    }

    /// Pending rollback actions, most recent first
    pub fn rollback_info(&self, actions: &[RollbackAction]) -> String {
        if actions.is_empty() {
            return "No recent actions to undo.".to_string();
        }

        let mut lines = vec!["Recent actions I can undo:".to_string(), String::new()];
        for (i, action) in actions.iter().take(5).enumerate() {
            lines.push(format!("{}. {}", i + 1, action.description));
            lines.push(format!(
                "   (from {})",
                action.timestamp.format("%Y-%m-%d %H:%M:%S")
            ));
        }
        lines.push(String::new());
        lines.push("Say 'undo' or 'rollback' to undo the most recent action.".to_string());
        lines.join("\n")
    }
}

fn step_label(ctx: &ExecutionContext, step_id: &str) -> String {
    ctx.plan
        .step(step_id)
        .map(|s| s.title.clone())
        .unwrap_or_else(|| step_id.to_string())
}

fn duration_phrase(seconds: u64) -> String {
    if seconds < 60 {
        format!("about {} seconds", seconds)
    } else {
        let minutes = seconds / 60;
        format!(
            "about {} minute{}",
            minutes,
            if minutes >= 2 { "s" } else { "" }
        )
    }
}
