//! Rollback stack persistence and restore paths

mod common;

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use common::ScriptedRunner;
use serde_json::json;
use tempfile::TempDir;
use warden_core::{
    CommandOutput, CommandRunner, ExecutionEngine, ExecutionState, RecoveryPhase, SafetyManager,
    StepAction, TaskPlan, TaskStep, WardenConfig,
};

#[test]
fn recorded_actions_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let runner = Arc::new(ScriptedRunner::new());

    let mut recorded = Vec::new();
    {
        let mut safety = SafetyManager::open(dir.path(), runner.clone()).unwrap();
        for i in 0..5 {
            let mut state = BTreeMap::new();
            state.insert("step_id".to_string(), json!(format!("step_{}", i)));
            state.insert("attempt".to_string(), json!(i));
            let action = safety
                .record_action(
                    &format!("Action {}", i),
                    (i % 2 == 0).then(|| format!("undo {}", i)),
                    (i == 3).then(|| PathBuf::from("/tmp/backup.conf")),
                    Some(state),
                )
                .unwrap();
            recorded.push(action);
        }
    }

    let reopened = SafetyManager::open(dir.path(), runner).unwrap();
    assert_eq!(reopened.all_actions(), recorded.as_slice());

    let stack = reopened.get_rollback_stack();
    assert_eq!(stack.len(), 5);
    assert_eq!(stack[0].description, "Action 4");
    assert_eq!(stack[4].description, "Action 0");
}

#[test]
fn completed_rollbacks_persist() {
    let dir = TempDir::new().unwrap();
    let runner = Arc::new(ScriptedRunner::new());
    {
        let mut safety = SafetyManager::open(dir.path(), runner.clone()).unwrap();
        safety
            .record_action("first", Some("undo first".to_string()), None, None)
            .unwrap();
        safety
            .record_action("second", Some("undo second".to_string()), None, None)
            .unwrap();
        let (ok, _) = safety.rollback_last();
        assert!(ok);
    }

    let reopened = SafetyManager::open(dir.path(), runner.clone()).unwrap();
    let pending = reopened.get_rollback_stack();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].description, "first");
    assert_eq!(runner.seen(), vec!["undo second"]);
}

/// Overwrites a file and then fails, like a half-applied edit
struct ClobberingRunner {
    target: PathBuf,
}

impl CommandRunner for ClobberingRunner {
    fn run(&self, command: &str, _timeout: Duration) -> CommandOutput {
        if command.starts_with("rm ") {
            fs::write(&self.target, "garbage\n").unwrap();
            return CommandOutput::new(command, 1, "", "rm: device busy");
        }
        CommandOutput::new(command, 0, "", "")
    }
}

#[test]
fn failed_high_risk_step_restores_backup() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("app.conf");
    fs::write(&target, "listen 8080\n").unwrap();

    let runner = Arc::new(ClobberingRunner {
        target: target.clone(),
    });
    let safety = SafetyManager::open(dir.path().join("backups"), runner).unwrap();
    let mut engine = ExecutionEngine::new(safety, &WardenConfig::default());

    let mut step = TaskStep::new(
        "delete",
        "Delete app.conf",
        StepAction::command(format!("rm {}", target.display())),
    );
    step.backup_paths.push(target.clone());
    let mut plan = TaskPlan::with_steps("delete the app config", vec![step]).unwrap();
    plan.approve();

    let mut ctx = engine.start_execution(plan).unwrap();
    assert!(!engine.execute_all(&mut ctx));

    let result = ctx.result("delete").unwrap();
    assert_eq!(result.recovery, Some(RecoveryPhase::RolledBack));
    assert_eq!(ctx.state, ExecutionState::Failed);
    assert_eq!(fs::read_to_string(&target).unwrap(), "listen 8080\n");
    assert!(engine.safety().get_rollback_stack().is_empty());
}

#[test]
fn backups_skipped_when_disabled() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("app.conf");
    fs::write(&target, "listen 8080\n").unwrap();

    let mut config = WardenConfig::default();
    config.safety.auto_backup_configs = false;
    let safety =
        SafetyManager::open(dir.path().join("backups"), Arc::new(ScriptedRunner::new())).unwrap();
    let mut engine = ExecutionEngine::new(safety, &config);

    let mut step = TaskStep::new("edit", "Edit", StepAction::command("touch app.conf"));
    step.backup_paths.push(target);
    let mut plan = TaskPlan::with_steps("edit config", vec![step]).unwrap();
    plan.approve();

    let mut ctx = engine.start_execution(plan).unwrap();
    assert!(engine.execute_all(&mut ctx));
    assert!(engine.safety().all_actions().is_empty());
}
