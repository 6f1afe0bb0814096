//! Command risk scoring.
//!
//! Deterministic, table-driven classification of shell commands. No I/O.

use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Risk Level
// =============================================================================

/// Ordinal risk classification. Ordering is by variant position.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Read-only, no system changes
    #[default]
    Safe,
    /// Minor changes, easily reversible
    Low,
    /// Significant changes, reversible with effort
    Medium,
    /// Major changes, may need manual intervention
    High,
    /// Potentially destructive, data loss possible
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Safe => "safe",
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }

    pub fn requires_confirmation(&self) -> bool {
        *self >= RiskLevel::High
    }

    /// Human-readable risk description
    pub fn description(&self) -> &'static str {
        match self {
            RiskLevel::Safe => "Read-only, nothing on the system changes.",
            RiskLevel::Low => "Minor change, easily reversible.",
            RiskLevel::Medium => "Modifies the system. Reversible with some effort.",
            RiskLevel::High => "Affects critical components. Review carefully.",
            RiskLevel::Critical => "May destroy data. Cannot be fully undone.",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Risk details for one command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub reasons: Vec<String>,
    pub requires_confirmation: bool,
    pub requires_backup: bool,
    pub requires_reboot: bool,
    pub estimated_duration_seconds: u64,
    pub affected_components: Vec<String>,
    pub data_loss_possible: bool,
    pub reversible: bool,
}

impl RiskAssessment {
    fn safe(reason: &str, duration: u64) -> Self {
        Self {
            level: RiskLevel::Safe,
            reasons: vec![reason.to_string()],
            requires_confirmation: false,
            requires_backup: false,
            requires_reboot: false,
            estimated_duration_seconds: duration,
            affected_components: Vec::new(),
            data_loss_possible: false,
            reversible: true,
        }
    }
}

// =============================================================================
// Command Tables
// =============================================================================

/// Read-only commands
const SAFE_COMMANDS: &[&str] = &[
    "ls", "cat", "head", "tail", "grep", "find", "which", "whereis", "whoami", "hostname",
    "uname", "uptime", "date", "cal", "df", "du", "free", "top", "htop", "ps", "pgrep", "ip",
    "ifconfig", "netstat", "ss", "ping", "traceroute", "nslookup", "man", "info", "help", "type",
    "file", "stat", "echo", "printf", "pwd", "env", "printenv", "command", "journalctl", "lsblk",
    "id",
];

/// System-modifying commands that are normally reversible
const MEDIUM_RISK_COMMANDS: &[&str] = &[
    "apt", "apt-get", "dnf", "yum", "pacman", "zypper", "pip", "npm", "cargo", "systemctl",
    "service", "chmod", "chown", "cp", "mv", "mkdir", "touch", "useradd", "usermod", "groupadd",
    "docker", "podman",
];

/// Commands with major or destructive effects
const HIGH_RISK_COMMANDS: &[&str] = &[
    "rm", "rmdir", "dd", "mkfs", "fdisk", "parted", "mount", "umount", "iptables", "ufw",
    "shutdown", "reboot", "poweroff", "init", "passwd", "chpasswd",
];

const PACKAGE_MANAGERS: &[&str] = &["apt", "apt-get", "dnf", "yum", "pacman", "zypper"];

const PACKAGE_REMOVAL_VERBS: &[&str] = &["remove", "purge", "autoremove", "erase", "uninstall"];

const CONTAINER_RUNTIMES: &[&str] = &["docker", "podman"];

const CONTAINER_DESTRUCTIVE_VERBS: &[&str] = &["rm", "rmi", "prune", "kill"];

/// Files that are always backed up before modification
pub const CRITICAL_CONFIG_PATHS: &[&str] = &[
    "/etc/fstab",
    "/etc/passwd",
    "/etc/shadow",
    "/etc/group",
    "/etc/sudoers",
    "/etc/ssh/sshd_config",
    "/etc/nginx/nginx.conf",
    "/etc/apache2/apache2.conf",
    "/etc/systemd/system/",
    "/boot/grub/grub.cfg",
];

const SAFE_DURATION: u64 = 5;
const DEFAULT_DURATION: u64 = 30;
const PACKAGE_DURATION: u64 = 120;
const DISK_DURATION: u64 = 300;

// =============================================================================
// Scoring
// =============================================================================

/// Whether a base command is in the high-risk table
pub fn is_high_risk_command(base: &str) -> bool {
    HIGH_RISK_COMMANDS.contains(&base)
}

/// Critical config paths mentioned anywhere in the command
pub fn critical_paths_in(command: &str) -> Vec<&'static str> {
    CRITICAL_CONFIG_PATHS
        .iter()
        .copied()
        .filter(|path| command.contains(path))
        .collect()
}

/// Tokens after stripping a leading `sudo` (and its flags); base token has path prefix removed
fn command_tokens(command: &str) -> Vec<&str> {
    let mut tokens: Vec<&str> = command.split_whitespace().collect();
    if tokens.first().map(|t| basename(t)) == Some("sudo") {
        tokens.remove(0);
        while tokens.first().is_some_and(|t| t.starts_with('-')) {
            tokens.remove(0);
        }
    }
    tokens
}

fn basename(token: &str) -> &str {
    token.rsplit('/').next().unwrap_or(token)
}

fn is_recursive_flag(token: &str) -> bool {
    if token == "--recursive" {
        return true;
    }
    token.starts_with('-')
        && !token.starts_with("--")
        && token[1..].chars().any(|c| c == 'r' || c == 'R')
}

fn is_pacman_removal(tokens: &[&str]) -> bool {
    tokens
        .iter()
        .skip(1)
        .any(|t| t.starts_with("-R") || *t == "--remove")
}

/// Tool calls that do not wrap a shell command
pub fn assess_tool_risk(tool: &str) -> RiskAssessment {
    RiskAssessment {
        level: RiskLevel::Low,
        reasons: vec![format!("Host tool call: {}", tool)],
        ..RiskAssessment::safe("", SAFE_DURATION)
    }
}

/// Assess the risk of a shell command
pub fn assess_command_risk(command: &str) -> RiskAssessment {
    let tokens = command_tokens(command.trim());
    let Some(first) = tokens.first() else {
        return RiskAssessment::safe("Empty command", 0);
    };
    let base = basename(first);
    let args = &tokens[1..];

    if SAFE_COMMANDS.contains(&base) {
        let mut assessment = RiskAssessment::safe("Read-only operation", SAFE_DURATION);
        apply_critical_paths(command, &mut assessment);
        return assessment;
    }

    let mut level = RiskLevel::Low;
    let mut reasons = Vec::new();
    let mut affected = Vec::new();
    let mut requires_backup = false;
    let mut requires_reboot = false;
    let mut data_loss = false;
    let mut reversible = true;
    let mut duration = DEFAULT_DURATION;

    if MEDIUM_RISK_COMMANDS.contains(&base) {
        level = RiskLevel::Medium;
        reasons.push(format!("System modification command: {}", base));

        if PACKAGE_MANAGERS.contains(&base) {
            affected.push("packages".to_string());
            duration = PACKAGE_DURATION;
            let removal = args.iter().any(|a| PACKAGE_REMOVAL_VERBS.contains(a))
                || (base == "pacman" && is_pacman_removal(&tokens));
            if removal {
                reasons.push("Package removal".to_string());
                requires_backup = true;
                level = RiskLevel::High;
            }
        }

        if CONTAINER_RUNTIMES.contains(&base) {
            affected.push("containers".to_string());
            let verb = args.iter().find(|a| !a.starts_with('-')).copied();
            let destructive = verb.is_some_and(|v| CONTAINER_DESTRUCTIVE_VERBS.contains(&v))
                || (verb == Some("container") || verb == Some("image") || verb == Some("system"))
                    && args
                        .iter()
                        .skip(1)
                        .any(|a| CONTAINER_DESTRUCTIVE_VERBS.contains(a));
            if destructive {
                reasons.push("Container or image removal".to_string());
                level = RiskLevel::High;
                data_loss = true;
                reversible = false;
            }
        }

        if base == "systemctl" || base == "service" {
            affected.push("services".to_string());
            if args.iter().any(|a| matches!(*a, "stop" | "disable" | "mask")) {
                reasons.push("Service will be stopped or disabled".to_string());
            }
        }

        if base == "chmod" || base == "chown" {
            affected.push("permissions".to_string());
            if args.iter().any(|a| *a == "-R" || *a == "--recursive") {
                reasons.push("Recursive permission change".to_string());
                level = RiskLevel::High;
            }
        }
    }

    if HIGH_RISK_COMMANDS.contains(&base) {
        level = RiskLevel::High;
        requires_backup = true;

        match base {
            "rm" => {
                reasons.push("File/directory deletion".to_string());
                data_loss = true;
                reversible = false;
                affected.push("filesystem".to_string());
                if args.iter().any(|a| is_recursive_flag(a)) {
                    level = RiskLevel::Critical;
                    reasons.push("Recursive deletion".to_string());
                }
            }
            "dd" => {
                level = RiskLevel::Critical;
                reasons.push("Low-level disk operation".to_string());
                data_loss = true;
                reversible = false;
                affected.push("disk".to_string());
                duration = DISK_DURATION;
            }
            "shutdown" | "reboot" | "poweroff" => {
                requires_reboot = true;
                reasons.push("System restart required".to_string());
                affected.push("system".to_string());
            }
            "fdisk" | "parted" => {
                level = RiskLevel::Critical;
                reasons.push("Disk partitioning/formatting".to_string());
                data_loss = true;
                reversible = false;
                affected.push("disk".to_string());
            }
            _ => {}
        }
    }

    // mkfs.ext4, mkfs.xfs, ... share the mkfs rules
    if base == "mkfs" || base.starts_with("mkfs.") {
        level = RiskLevel::Critical;
        requires_backup = true;
        reasons.push("Disk partitioning/formatting".to_string());
        data_loss = true;
        reversible = false;
        affected.push("disk".to_string());
    }

    let mut assessment = RiskAssessment {
        level,
        reasons,
        requires_confirmation: false,
        requires_backup,
        requires_reboot,
        estimated_duration_seconds: duration,
        affected_components: affected,
        data_loss_possible: data_loss,
        reversible,
    };
    apply_critical_paths(command, &mut assessment);

    if assessment.reasons.is_empty() {
        assessment.reasons.push("Standard operation".to_string());
    }
    assessment.requires_confirmation = assessment.level.requires_confirmation();
    assessment
}

fn apply_critical_paths(command: &str, assessment: &mut RiskAssessment) {
    let paths = critical_paths_in(command);
    if paths.is_empty() {
        return;
    }
    // Reading a critical file is still read-only
    if assessment.level == RiskLevel::Safe {
        return;
    }
    for path in paths {
        if assessment.level < RiskLevel::High {
            assessment.level = RiskLevel::High;
        }
        assessment.requires_backup = true;
        assessment
            .reasons
            .push(format!("Affects critical config: {}", path));
        if !assessment.affected_components.iter().any(|c| c == "system-config") {
            assessment.affected_components.push("system-config".to_string());
        }
    }
}
