//! End-to-end planning and execution scenarios

mod common;

use std::sync::Arc;

use common::{homelab, ScriptedRunner};
use tempfile::TempDir;
use warden_core::{
    assess_command_risk, ComplexityAssessor, ComplexityLevel, ExecutionEngine, ExecutionState,
    RiskLevel, SafetyManager, StepAction, StepStatus, TaskPlan, TaskPlanner, TaskStep,
    WardenConfig,
};

fn planner() -> TaskPlanner {
    TaskPlanner::default().with_probe_root(None)
}

#[test]
fn high_risk_commands_always_need_confirmation() {
    let commands = [
        "rm notes.txt",
        "rmdir /srv/empty",
        "dd if=/dev/zero of=/dev/sdb bs=1M",
        "mkfs.ext4 /dev/sdb1",
        "fdisk /dev/sda",
        "parted /dev/sda print",
        "mount /dev/sdb1 /mnt",
        "umount /mnt",
        "iptables -F",
        "ufw disable",
        "shutdown -h now",
        "reboot",
        "poweroff",
        "init 0",
        "passwd alice",
        "sudo chpasswd",
    ];
    for command in commands {
        let risk = assess_command_risk(command);
        assert!(risk.level >= RiskLevel::High, "{}: {:?}", command, risk.level);
        assert!(risk.requires_confirmation, "{}", command);
    }
}

#[test]
fn scenario_a_bulk_container_removal() {
    let plan = planner().create_plan("remove all nextcloud containers", &homelab());

    let commands: Vec<String> = plan
        .steps
        .iter()
        .filter_map(|s| s.action.shell_command().map(str::to_string))
        .collect();
    assert_eq!(
        commands,
        vec![
            "docker stop nextcloud-app",
            "docker rm nextcloud-app",
            "docker stop nextcloud-redis",
            "docker rm nextcloud-redis",
        ]
    );
    assert!(plan.steps.iter().all(|s| !s.id.contains("nginx-proxy")));

    for remove in plan.steps.iter().filter(|s| s.id.starts_with("remove_")) {
        assert_eq!(remove.risk_level(), RiskLevel::High, "{}", remove.id);
        let name = remove.id.trim_start_matches("remove_");
        assert!(remove.depends_on.contains(&format!("stop_{}", name)));
    }
    assert_eq!(plan.highest_risk, RiskLevel::High);
}

#[test]
fn scenario_b_recursive_root_delete() {
    let risk = assess_command_risk("rm -rf /");
    assert_eq!(risk.level, RiskLevel::Critical);
    assert!(risk.requires_confirmation);
    assert!(risk.data_loss_possible);
    assert!(!risk.reversible);
}

#[test]
fn scenario_c_failed_root_blocks_dependents() {
    let dir = TempDir::new().unwrap();
    let runner = Arc::new(ScriptedRunner::new().on("false", 1, ""));
    let safety = SafetyManager::open(dir.path(), runner.clone()).unwrap();
    let mut engine = ExecutionEngine::new(safety, &WardenConfig::default());

    let mut plan = TaskPlan::with_steps(
        "three steps",
        vec![
            TaskStep::new("a", "A", StepAction::command("false")),
            TaskStep::new("b", "B", StepAction::command("echo b")).depends_on(["a"]),
            TaskStep::new("c", "C", StepAction::command("echo c")).depends_on(["a"]),
        ],
    )
    .unwrap();
    plan.approve();

    let mut ctx = engine.start_execution(plan).unwrap();
    assert!(!engine.execute_all(&mut ctx));

    assert_eq!(ctx.plan.steps[0].status, StepStatus::Failed);
    assert_eq!(ctx.plan.steps[1].status, StepStatus::Blocked);
    assert_eq!(ctx.plan.steps[2].status, StepStatus::Blocked);
    assert!(ctx.plan.is_complete());
    assert_eq!(ctx.plan.count_status(StepStatus::Completed), 0);
    assert_eq!(ctx.state, ExecutionState::Completed);
    assert_eq!(runner.seen(), vec!["false"]);
}

#[test]
fn next_ready_step_never_returns_blocked_work() {
    let mut plan = TaskPlan::with_steps(
        "chain",
        vec![
            TaskStep::new("a", "A", StepAction::command("echo a")),
            TaskStep::new("b", "B", StepAction::command("echo b")).depends_on(["a"]),
            TaskStep::new("c", "C", StepAction::command("echo c")).depends_on(["b"]),
            TaskStep::new("d", "D", StepAction::command("echo d")),
        ],
    )
    .unwrap();

    plan.steps[0].status = StepStatus::Failed;
    plan.mark_failed("a");

    let next = plan.next_ready_step().unwrap();
    assert_eq!(plan.steps[next].id, "d");
    assert_eq!(plan.steps[1].status, StepStatus::Blocked);
    assert_eq!(plan.steps[2].status, StepStatus::Blocked);
    assert!(!plan.is_complete());

    plan.steps[next].status = StepStatus::Completed;
    plan.mark_completed("d");
    assert!(plan.next_ready_step().is_none());
    assert!(plan.is_complete());
}

#[test]
fn scenario_d_complexity() {
    let assessor = ComplexityAssessor::new();
    assert_eq!(assessor.assess("install htop").level, ComplexityLevel::Simple);

    let level = assessor
        .assess("set up a secure nginx reverse proxy with TLS and firewall rules")
        .level;
    assert!(
        matches!(level, ComplexityLevel::Complex | ComplexityLevel::Risky),
        "{:?}",
        level
    );
}

#[test]
fn planning_is_deterministic() {
    let requests = [
        "remove all nextcloud containers",
        "restart the nginx service",
        "install htop",
        "stop sshd",
        "make my computer faster",
    ];
    for request in requests {
        let first = planner().create_plan(request, &homelab());
        let second = planner().create_plan(request, &homelab());

        let shape = |plan: &TaskPlan| {
            plan.steps
                .iter()
                .map(|s| {
                    (
                        s.id.clone(),
                        s.title.clone(),
                        s.action.clone(),
                        s.depends_on.clone(),
                    )
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(shape(&first), shape(&second), "{}", request);
    }
}

#[test]
fn planned_removal_runs_in_order() {
    let dir = TempDir::new().unwrap();
    let runner = Arc::new(ScriptedRunner::new());
    let safety = SafetyManager::open(dir.path(), runner.clone()).unwrap();
    let mut engine = ExecutionEngine::new(safety, &WardenConfig::default());

    let mut plan = planner().create_plan("remove all nextcloud containers", &homelab());
    plan.approve();
    let mut ctx = engine.start_execution(plan).unwrap();

    assert!(engine.execute_all(&mut ctx));
    assert_eq!(
        runner.seen(),
        vec![
            "docker stop nextcloud-app",
            "docker rm nextcloud-app",
            "docker stop nextcloud-redis",
            "docker rm nextcloud-redis",
        ]
    );
    // Stops carry a restart; removals are irreversible
    assert_eq!(engine.safety().get_rollback_stack().len(), 2);
}
