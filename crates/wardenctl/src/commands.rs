//! Command handlers for wardenctl

use std::fs;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use owo_colors::OwoColorize;
use tracing::info;
use warden_core::presentation::Presenter;
use warden_core::{
    assess_command_risk, CommandRunner, ComplexityAssessor, ExecutionState, ReasoningEngine,
    RiskLevel, SafetyManager, ShellRunner, SystemContext, TaskPlanner, WardenConfig,
};

use crate::probe::probe_host;
use crate::tools::HostTools;

/// Probes read full `docker ps` and unit listings
const PROBE_OUTPUT_BYTES: usize = 1_000_000;

const HR: &str = "----------------------------------------------------------------------";

// ============================================================================
// Setup
// ============================================================================

/// An explicit path must load; the default location falls back to defaults
pub fn load_config(path: Option<&Path>) -> Result<WardenConfig> {
    match path {
        Some(path) => WardenConfig::load_from_path(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(WardenConfig::load()),
    }
}

fn shell_runner(config: &WardenConfig) -> Arc<dyn CommandRunner> {
    Arc::new(ShellRunner::new(config.execution.max_output_bytes))
}

fn open_safety(config: &WardenConfig) -> Result<SafetyManager> {
    let dir = config.safety.backup_dir();
    let safety = SafetyManager::open(&dir, shell_runner(config))
        .with_context(|| format!("Failed to open backup dir {}", dir.display()))?;
    Ok(safety.with_rollback_timeout(Duration::from_secs(config.safety.rollback_timeout_secs)))
}

/// Context from a JSON file, or a live probe of this host
pub fn system_context(context_file: Option<&Path>) -> Result<SystemContext> {
    match context_file {
        Some(path) => {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Invalid system context in {}", path.display()))
        }
        None => Ok(probe_host(
            &ShellRunner::new(PROBE_OUTPUT_BYTES),
            Path::new("/"),
        )),
    }
}

fn risk_label(level: RiskLevel) -> String {
    let label = format!("[{}]", level.as_str().to_uppercase());
    match level {
        RiskLevel::Safe | RiskLevel::Low => label.bright_green().to_string(),
        RiskLevel::Medium => label.yellow().to_string(),
        RiskLevel::High | RiskLevel::Critical => label.bright_red().to_string(),
    }
}

fn require(text: &str, what: &str) -> Result<()> {
    if text.trim().is_empty() {
        bail!("Missing {}", what);
    }
    Ok(())
}

// ============================================================================
// Commands
// ============================================================================

pub fn assess(request: &str) -> Result<()> {
    require(request, "request")?;
    let result = ComplexityAssessor::new().assess(request);

    println!("{}  {}", "Complexity:".bold(), result.level.cyan());
    println!("{}  {:.2}", "Confidence:".bold(), result.confidence);
    println!("{}      {}", "Reason:".bold(), result.reason);
    println!("{}    {}", "Approach:".bold(), result.suggested_approach);
    if !result.keywords_matched.is_empty() {
        println!("{}     {}", "Matched:".bold(), result.keywords_matched.join(", "));
    }
    Ok(())
}

pub fn risk(command: &str) -> Result<()> {
    require(command, "command")?;
    let risk = assess_command_risk(command);

    println!("{} {}", risk_label(risk.level), risk.level.description());
    for reason in &risk.reasons {
        println!("  * {}", reason);
    }
    let mut flags = Vec::new();
    if risk.requires_confirmation {
        flags.push("needs confirmation");
    }
    if risk.requires_backup {
        flags.push("backup first");
    }
    if risk.requires_reboot {
        flags.push("reboot");
    }
    if risk.data_loss_possible {
        flags.push("data loss possible");
    }
    if !risk.reversible {
        flags.push("irreversible");
    }
    if !flags.is_empty() {
        println!("{}", flags.join(", ").dimmed());
    }
    if !risk.affected_components.is_empty() {
        println!("Affects: {}", risk.affected_components.join(", "));
    }
    Ok(())
}

pub fn plan(
    config: &WardenConfig,
    request: &str,
    context_file: Option<&Path>,
    json: bool,
) -> Result<()> {
    require(request, "request")?;
    let context = system_context(context_file)?;
    let mut planner = TaskPlanner::new(&config.planner);
    let plan = planner.create_plan(request, &context);

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    let presenter = Presenter::new(config.conversation.clone(), config.reasoning.explain_steps);
    println!("{}", presenter.plan(&plan));
    println!();
    println!(
        "{} {} step(s), highest risk {}",
        "Plan".bold(),
        plan.steps.len(),
        risk_label(plan.highest_risk)
    );
    Ok(())
}

pub fn run(
    config: &WardenConfig,
    request: &str,
    context_file: Option<&Path>,
    assume_yes: bool,
) -> Result<()> {
    require(request, "request")?;
    let context = system_context(context_file)?;
    let runner = shell_runner(config);
    let tools = HostTools::new(
        runner.clone(),
        Duration::from_secs(config.execution.max_step_timeout_secs),
    );
    let mut engine = ReasoningEngine::open(config, runner)
        .context("Failed to open backup dir")?
        .with_tool_executor(Arc::new(tools));

    let mut result = engine.process(request, &context);
    if result.response.is_empty() {
        println!("Simple enough to run directly; nothing to plan.");
        return Ok(());
    }

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        println!("{}", "[warden]".cyan());
        println!("{}", result.response);
        println!("{}", HR.dimmed());

        if !result.needs_approval && !result.needs_input {
            break;
        }

        let reply = if result.needs_approval && assume_yes {
            println!("{} yes", ">".bold());
            "yes".to_string()
        } else {
            print!("{} ", ">".bold());
            io::stdout().flush()?;
            match lines.next() {
                Some(line) => line?.trim().to_string(),
                // EOF declines whatever is waiting
                None => "no".to_string(),
            }
        };
        result = engine.process(&reply, &context);
    }

    if let Some(ctx) = &result.execution_context {
        info!(
            "Execution {} after {:.1}s",
            ctx.state,
            ctx.duration_seconds().unwrap_or_default()
        );
        if ctx.state == ExecutionState::Failed || ctx.plan.has_failed() {
            bail!("Task did not complete: {}", request);
        }
    }
    Ok(())
}

pub fn rollback_list(config: &WardenConfig) -> Result<()> {
    let safety = open_safety(config)?;
    let stack = safety.get_rollback_stack();
    if stack.is_empty() {
        println!("No recent actions to undo.");
        return Ok(());
    }

    for action in &stack {
        println!(
            "{}  {}  {}",
            action.id.get(..8).unwrap_or(action.id.as_str()).cyan(),
            action.timestamp.format("%Y-%m-%d %H:%M:%S").dimmed(),
            action.description
        );
        if let Some(command) = &action.rollback_command {
            println!("          undo: {}", command);
        }
        if let Some(backup) = &action.backup_path {
            println!("          backup: {}", backup.display());
        }
    }
    Ok(())
}

pub fn rollback_undo(config: &WardenConfig, id: Option<String>, all: bool) -> Result<()> {
    let mut safety = open_safety(config)?;

    let outcomes: Vec<(bool, String)> = if all {
        safety
            .rollback_all()
            .into_iter()
            .map(|o| (o.success, format!("{}: {}", o.description, o.message)))
            .collect()
    } else {
        let full_id = match id {
            Some(prefix) => Some(resolve_action_id(&safety, &prefix)?),
            None => None,
        };
        let outcome = match full_id {
            Some(full) => safety.rollback_action(&full),
            None => safety.rollback_last(),
        };
        vec![outcome]
    };

    if outcomes.is_empty() {
        println!("Nothing to undo.");
        return Ok(());
    }

    let mut failed = 0;
    for (success, message) in &outcomes {
        if *success {
            println!("{} {}", "[OK]".bright_green(), message);
        } else {
            failed += 1;
            println!("{} {}", "[FAILED]".bright_red(), message);
        }
    }
    if failed > 0 {
        bail!("{} rollback(s) failed", failed);
    }
    Ok(())
}

/// Accept the short ids `rollback list` prints
fn resolve_action_id(safety: &SafetyManager, prefix: &str) -> Result<String> {
    let matches: Vec<&str> = safety
        .all_actions()
        .iter()
        .filter(|a| !a.completed && a.id.starts_with(prefix))
        .map(|a| a.id.as_str())
        .collect();
    match matches.as_slice() {
        [only] => Ok(only.to_string()),
        [] => bail!("No pending action matches '{}'", prefix),
        _ => bail!("'{}' matches {} actions; use more characters", prefix, matches.len()),
    }
}

pub fn rollback_gc(config: &WardenConfig, days: Option<u32>) -> Result<()> {
    let mut safety = open_safety(config)?;
    let days = days.unwrap_or(config.safety.rollback_retention_days);
    let removed = safety.clear_completed_rollbacks(days);
    println!("Removed {} completed action(s) older than {} day(s).", removed, days);
    Ok(())
}

pub fn snapshot(config: &WardenConfig, name: &str) -> Result<()> {
    let safety = open_safety(config)?;
    let snapshot = safety
        .create_system_snapshot(name)
        .context("Failed to write snapshot")?;

    println!(
        "{} Snapshot '{}' with {} running service(s)",
        "[OK]".bright_green(),
        snapshot.name,
        snapshot.services.len()
    );
    if let Some(path) = &snapshot.path {
        println!("  {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_explicit_config_must_parse() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        fs::write(&path, "[execution]\npause_for_step_approval = true\n").unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert!(config.execution.pause_for_step_approval);

        fs::write(&path, "[execution\n").unwrap();
        assert!(load_config(Some(&path)).is_err());
    }

    #[test]
    fn test_context_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("context.json");
        fs::write(
            &path,
            r#"{"container_names": ["nextcloud-app"], "package_manager": "apt"}"#,
        )
        .unwrap();

        let context = system_context(Some(&path)).unwrap();
        assert_eq!(context.container_names, vec!["nextcloud-app"]);
        assert_eq!(context.package_manager.as_deref(), Some("apt"));
        assert!(context.services.is_empty());

        fs::write(&path, "not json").unwrap();
        assert!(system_context(Some(&path)).is_err());
    }

    #[test]
    fn test_resolve_action_id_by_prefix() {
        let dir = TempDir::new().unwrap();
        let mut safety =
            SafetyManager::open(dir.path(), Arc::new(ShellRunner::default())).unwrap();
        let action = safety
            .record_action("stop nginx", Some("true".to_string()), None, None)
            .unwrap();

        let prefix = &action.id[..8];
        assert_eq!(resolve_action_id(&safety, prefix).unwrap(), action.id);
        assert!(resolve_action_id(&safety, "zzzz-no-match").is_err());
    }
}
