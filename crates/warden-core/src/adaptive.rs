//! Adaptive failure recovery.
//!
//! A failed step's error text is classified into an `ErrorCategory`, which
//! may come with a fix command (install the missing package, retry with
//! `sudo`, wait and retry). The executor runs such fixes as injected steps,
//! within the per-execution limits tracked by `RecoveryBudget` and only when
//! the fix does not drift outside what the user asked for.
//!
//! `ExecutionLearner` keeps a small history of which step shapes succeed or
//! fail on this host, in `<backup_dir>/execution_memory.json` next to the
//! rollback stack.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, info, warn};

use crate::config::ExecutionConfig;
use crate::context::PackageManager;
use crate::error::Result;
use crate::plan::{StepAction, TaskStep};
use crate::risk::assess_command_risk;
use crate::shell::shell_quote;

/// Execution memory file name inside the backup directory
pub const EXECUTION_MEMORY_FILE: &str = "execution_memory.json";

const MAX_ERROR_CHARS: usize = 500;
const MAX_RECORDED_ERROR_CHARS: usize = 200;
const MAX_SIGNATURE_CHARS: usize = 100;
const RECORDS_PER_PATTERN: usize = 10;
const REPEATED_FAILURES: usize = 3;

// =============================================================================
// Classification
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Network hiccups and timeouts; worth a delayed retry
    Transient,
    MissingDependency,
    PermissionDenied,
    NotFound,
    AlreadyExists,
    Conflict,
    /// Locks and busy devices
    ResourceBusy,
    InvalidInput,
    /// Disk full, out of memory, crashes
    SystemError,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::MissingDependency => "missing_dependency",
            Self::PermissionDenied => "permission_denied",
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::Conflict => "conflict",
            Self::ResourceBusy => "resource_busy",
            Self::InvalidInput => "invalid_input",
            Self::SystemError => "system_error",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDiagnosis {
    pub category: ErrorCategory,
    /// Error text, truncated
    pub original_error: String,
    pub explanation: String,
    pub is_retryable: bool,
    pub suggested_fix: String,
    #[serde(default)]
    pub fix_command: Option<String>,
    /// The fix re-runs the step itself (`sudo cmd`, `sleep 5 && cmd`)
    /// rather than preparing for a retry
    #[serde(default)]
    pub fix_replaces_step: bool,
    pub requires_user: bool,
    pub confidence: f64,
}

/// Patterns per category, matched case-insensitively
const ERROR_PATTERNS: &[(ErrorCategory, &[&str])] = &[
    (
        ErrorCategory::MissingDependency,
        &[
            r"command not found",
            r"No such file or directory.*bin/",
            r"package .* is not installed",
            r"Unable to locate package",
            r"has no installation candidate",
            r"error: target not found:",
            r"No match for argument:",
            r"ModuleNotFoundError",
            r"ImportError",
            r"error while loading shared libraries",
        ],
    ),
    (
        ErrorCategory::PermissionDenied,
        &[
            r"Permission denied",
            r"Access denied",
            r"Operation not permitted",
            r"must be root",
            r"requires root",
            r"need to be root",
            r"EACCES",
            r"sudo:.*password",
        ],
    ),
    (
        ErrorCategory::NotFound,
        &[
            r"No such file or directory",
            r"File not found",
            r"does not exist",
            r"cannot stat",
            r"cannot access",
            r"not found$",
            r"unit .* not found",
        ],
    ),
    (
        ErrorCategory::AlreadyExists,
        &[
            r"already exists",
            r"File exists",
            r"EEXIST",
            r"is already installed",
            r"already running",
            r"already enabled",
        ],
    ),
    (
        ErrorCategory::Conflict,
        &[
            r"version conflict",
            r"dependency conflict",
            r"breaks:",
            r"conflicts with",
            r"held packages",
            r"unmet dependencies",
        ],
    ),
    (
        ErrorCategory::ResourceBusy,
        &[
            r"Device or resource busy",
            r"Resource temporarily unavailable",
            r"already in use",
            r"lock file",
            r"Could not get lock",
            r"database is locked",
            r"EBUSY",
        ],
    ),
    (
        ErrorCategory::Transient,
        &[
            r"Connection timed out",
            r"Network is unreachable",
            r"Temporary failure",
            r"try again",
            r"ETIMEDOUT",
            r"ECONNREFUSED",
            r"Failed to connect",
            r"Could not resolve host",
        ],
    ),
    (
        ErrorCategory::InvalidInput,
        &[
            r"invalid option",
            r"unrecognized option",
            r"invalid argument",
            r"syntax error",
            r"Usage:",
        ],
    ),
    (
        ErrorCategory::SystemError,
        &[
            r"segmentation fault",
            r"core dumped",
            r"Out of memory",
            r"No space left on device",
            r"Read-only file system",
            r"I/O error",
        ],
    ),
];

/// Where a package name can be read from an error
const PACKAGE_PATTERNS: &[&str] = &[
    r#"package ['"]?(\w[\w\-.]+)['"]? is not installed"#,
    r"Unable to locate package (\w[\w\-.]+)",
    r"No package (\w[\w\-.]+) available",
    r"command not found: (\w[\w\-.]*)",
    r"(\w[\w\-.]*): command not found",
    r#"ModuleNotFoundError: No module named ['"](\w+)['"]"#,
];

/// (category, compiled pattern, pattern length)
static ERROR_TABLE: LazyLock<Vec<(ErrorCategory, Regex, usize)>> = LazyLock::new(|| {
    ERROR_PATTERNS
        .iter()
        .flat_map(|(category, patterns)| patterns.iter().map(move |p| (*category, *p)))
        .filter_map(|(category, pattern)| match Regex::new(&format!("(?i){}", pattern)) {
            Ok(re) => Some((category, re, pattern.len())),
            Err(e) => {
                warn!("Skipping invalid error pattern {}: {}", pattern, e);
                None
            }
        })
        .collect()
});

static PACKAGE_TABLE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    PACKAGE_PATTERNS
        .iter()
        .filter_map(|p| Regex::new(&format!("(?i){}", p)).ok())
        .collect()
});

/// Classify a failed step's error text.
///
/// `command` is the shell command that failed, if any; retry-style fixes are
/// built around it. Install fixes need a known package manager.
pub fn classify_error(
    error: &str,
    command: Option<&str>,
    package_manager: Option<PackageManager>,
) -> ErrorDiagnosis {
    let error = error.trim();
    if error.is_empty() {
        return ErrorDiagnosis {
            category: ErrorCategory::Unknown,
            original_error: String::new(),
            explanation: "No error output to analyze".to_string(),
            is_retryable: false,
            suggested_fix: "Examine the step manually".to_string(),
            fix_command: None,
            fix_replaces_step: false,
            requires_user: true,
            confidence: 0.0,
        };
    }

    // Longer patterns are more specific and win
    let mut best: Option<(ErrorCategory, usize)> = None;
    for (category, re, len) in ERROR_TABLE.iter() {
        if re.is_match(error) && best.map_or(true, |(_, best_len)| *len > best_len) {
            best = Some((*category, *len));
        }
    }
    let (category, confidence) = match best {
        Some((category, len)) => (category, (0.7 + len as f64 / 100.0).min(0.95)),
        None => (ErrorCategory::Unknown, 0.0),
    };
    debug!("Classified error as {} ({:.2})", category, confidence);

    let command = command.map(str::trim).filter(|c| !c.is_empty());
    let mut diagnosis = ErrorDiagnosis {
        category,
        original_error: error.chars().take(MAX_ERROR_CHARS).collect(),
        explanation: String::new(),
        is_retryable: false,
        suggested_fix: String::new(),
        fix_command: None,
        fix_replaces_step: false,
        requires_user: false,
        confidence,
    };

    match category {
        ErrorCategory::MissingDependency => {
            let package = extract_package_name(error);
            diagnosis.is_retryable = true;
            match &package {
                Some(name) => {
                    diagnosis.explanation =
                        format!("A required package or command is not installed: {}", name);
                    diagnosis.suggested_fix = format!("Install missing package: {}", name);
                    diagnosis.fix_command = package_manager
                        .map(|pm| format!("{} {}", pm.install_command(), shell_quote(name)));
                }
                None => {
                    diagnosis.explanation =
                        "A required package or command is not installed".to_string();
                    diagnosis.suggested_fix = "Install the missing dependency".to_string();
                }
            }
        }
        ErrorCategory::PermissionDenied => {
            diagnosis.explanation = "The operation requires elevated permissions".to_string();
            diagnosis.suggested_fix = "Run with sudo or fix permissions".to_string();
            diagnosis.is_retryable = true;
            diagnosis.fix_replaces_step = true;
            diagnosis.fix_command = command
                .filter(|c| !c.starts_with("sudo "))
                .map(|c| format!("sudo {}", c));
        }
        ErrorCategory::NotFound => {
            diagnosis.explanation = "A required file or resource doesn't exist".to_string();
            diagnosis.suggested_fix = "Check the path or create the resource first".to_string();
            diagnosis.requires_user = true;
        }
        ErrorCategory::AlreadyExists => {
            diagnosis.explanation =
                "The resource already exists (this may not be a problem)".to_string();
            diagnosis.suggested_fix = "Check whether the existing resource is acceptable".to_string();
        }
        ErrorCategory::ResourceBusy => {
            diagnosis.explanation = "A resource is locked or in use by another process".to_string();
            diagnosis.suggested_fix = "Wait and retry, or stop the conflicting process".to_string();
            diagnosis.is_retryable = true;
            diagnosis.fix_replaces_step = true;
            diagnosis.fix_command = command.map(|c| format!("sleep 5 && {}", c));
        }
        ErrorCategory::Transient => {
            diagnosis.explanation = "A temporary issue occurred (network, timing)".to_string();
            diagnosis.suggested_fix = "Wait and retry".to_string();
            diagnosis.is_retryable = true;
            diagnosis.fix_replaces_step = true;
            diagnosis.fix_command = command.map(|c| format!("sleep 10 && {}", c));
        }
        ErrorCategory::Conflict => {
            diagnosis.explanation = "There's a version or dependency conflict".to_string();
            diagnosis.suggested_fix =
                "Resolve the conflict manually or try a different version".to_string();
            diagnosis.requires_user = true;
        }
        ErrorCategory::InvalidInput => {
            diagnosis.explanation = "The command has incorrect syntax or arguments".to_string();
            diagnosis.suggested_fix = "Check the command syntax and arguments".to_string();
            diagnosis.requires_user = true;
        }
        ErrorCategory::SystemError => {
            diagnosis.explanation = "A system-level error occurred".to_string();
            diagnosis.suggested_fix = "Check system resources (disk space, memory)".to_string();
            diagnosis.requires_user = true;
        }
        ErrorCategory::Unknown => {
            diagnosis.explanation = "Unable to determine the cause of the error".to_string();
            diagnosis.suggested_fix = "Examine the error output manually".to_string();
            diagnosis.requires_user = true;
        }
    }
    diagnosis
}

fn extract_package_name(error: &str) -> Option<String> {
    PACKAGE_TABLE
        .iter()
        .find_map(|re| re.captures(error))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Command step that runs a diagnosis' fix ahead of retrying `failed`
pub fn fix_step(failed: &TaskStep, diagnosis: &ErrorDiagnosis) -> Option<TaskStep> {
    let command = diagnosis.fix_command.as_deref()?;
    let mut step = TaskStep::new(
        format!("{}_fix_{}", failed.id, diagnosis.category),
        format!("Fix: {}", diagnosis.suggested_fix),
        StepAction::command(command),
    )
    .with_description(format!("Attempting to fix: {}", diagnosis.explanation))
    .with_explanation(format!("This should fix the error: {}", diagnosis.explanation));
    step.depends_on = failed.depends_on.clone();
    step.risk = Some(assess_command_risk(command));
    Some(step)
}

// =============================================================================
// Scope drift
// =============================================================================

struct DriftRule {
    pattern: &'static str,
    reason: &'static str,
    /// Matches whose first capture starts with this are allowed
    exempt_prefix: Option<&'static str>,
}

const fn rule(pattern: &'static str, reason: &'static str) -> DriftRule {
    DriftRule {
        pattern,
        reason,
        exempt_prefix: None,
    }
}

const DRIFT_RULES: &[DriftRule] = &[
    DriftRule {
        pattern: r"rm\s+-rf\s+/(\S*)",
        reason: "Recursive deletion outside /tmp",
        exempt_prefix: Some("tmp"),
    },
    rule(r"chmod\s+-R\s+777", "Recursive world-writable permissions"),
    rule(r"curl.*\|\s*bash", "Piping a downloaded script into a shell"),
    rule(r"wget.*\|\s*sh", "Piping a downloaded script into a shell"),
    rule(r"dd\s+if=.*/dev/", "Raw disk write"),
    rule(r"mkfs\.", "Filesystem creation"),
    rule(r"fdisk|parted|gdisk", "Partition manipulation"),
    rule(r"systemctl\s+(disable|mask)\s+.*firewall", "Disabling the firewall"),
    rule(r"iptables\s+-F", "Flushing firewall rules"),
    rule(r"passwd|chpasswd|usermod", "User credential modification"),
    rule(r"visudo|sudoers", "sudo configuration change"),
    rule(r"ssh-keygen.*-y.*>", "SSH key extraction"),
];

static DRIFT_TABLE: LazyLock<Vec<(Regex, &'static DriftRule)>> = LazyLock::new(|| {
    DRIFT_RULES
        .iter()
        .filter_map(|rule| match Regex::new(&format!("(?i){}", rule.pattern)) {
            Ok(re) => Some((re, rule)),
            Err(e) => {
                warn!("Skipping invalid drift pattern {}: {}", rule.pattern, e);
                None
            }
        })
        .collect()
});

fn rule_matches(re: &Regex, rule: &DriftRule, text: &str) -> bool {
    match rule.exempt_prefix {
        None => re.is_match(text),
        Some(prefix) => re.captures_iter(text).any(|caps| {
            !caps
                .get(1)
                .is_some_and(|target| target.as_str().starts_with(prefix))
        }),
    }
}

/// Reason a proposed command goes beyond the original request, if it does.
///
/// A dangerous pattern in `action` drifts unless `request` already asked
/// for the same kind of operation.
pub fn scope_drift(request: &str, action: &str) -> Option<&'static str> {
    DRIFT_TABLE
        .iter()
        .find(|(re, rule)| rule_matches(re, rule, action) && !rule_matches(re, rule, request))
        .map(|(_, rule)| rule.reason)
}

// =============================================================================
// Recovery budget
// =============================================================================

/// Per-execution recovery limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryLimits {
    pub max_privilege_escalations: usize,
    pub max_injected_steps: usize,
    pub recovery_checkpoint_after: usize,
}

impl From<&ExecutionConfig> for RecoveryLimits {
    fn from(config: &ExecutionConfig) -> Self {
        Self {
            max_privilege_escalations: config.max_privilege_escalations,
            max_injected_steps: config.max_injected_steps,
            recovery_checkpoint_after: config.recovery_checkpoint_after,
        }
    }
}

/// Counters for injected fixes in one execution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryBudget {
    pub privilege_escalations: usize,
    pub injected_steps: usize,
    pub recoveries: usize,
}

impl RecoveryBudget {
    /// Count one injected fix. `Err` names the limit that stops it; the fix
    /// must not run and control goes back to the user.
    pub fn admit(&mut self, fix: &str, limits: &RecoveryLimits) -> std::result::Result<(), String> {
        if fix.split_whitespace().any(|t| t == "sudo") {
            self.privilege_escalations += 1;
            if self.privilege_escalations >= limits.max_privilege_escalations {
                return Err(format!(
                    "Maximum privilege escalations reached ({})",
                    limits.max_privilege_escalations
                ));
            }
        }

        self.injected_steps += 1;
        if self.injected_steps >= limits.max_injected_steps {
            return Err(format!(
                "Maximum injected steps reached ({})",
                limits.max_injected_steps
            ));
        }

        self.recoveries += 1;
        if self.recoveries >= limits.recovery_checkpoint_after {
            return Err(format!(
                "Pausing for review after {} automatic recoveries",
                self.recoveries
            ));
        }
        Ok(())
    }

    pub fn status(&self, limits: &RecoveryLimits) -> String {
        format!(
            "escalations {}/{}, injected steps {}/{}, recoveries {}/{}",
            self.privilege_escalations,
            limits.max_privilege_escalations,
            self.injected_steps,
            limits.max_injected_steps,
            self.recoveries,
            limits.recovery_checkpoint_after
        )
    }
}

// =============================================================================
// Execution memory
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessRecord {
    pub timestamp: DateTime<Utc>,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub timestamp: DateTime<Utc>,
    pub category: ErrorCategory,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMemory {
    #[serde(default)]
    pub successes: BTreeMap<String, Vec<SuccessRecord>>,
    #[serde(default)]
    pub failures: BTreeMap<String, Vec<FailureRecord>>,
}

static PATH_RE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"/\S+").ok());
static NUMBER_RE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\d+").ok());

/// Step shape used as the memory key: paths and numbers are placeholders,
/// so `ls /srv/a` and `ls /srv/b` share history
pub fn step_signature(action: &StepAction) -> String {
    if let Some(command) = action.shell_command() {
        let mut normalized = command.trim().to_string();
        if let Some(re) = PATH_RE.as_ref() {
            normalized = re.replace_all(&normalized, "/PATH").into_owned();
        }
        if let Some(re) = NUMBER_RE.as_ref() {
            normalized = re.replace_all(&normalized, "N").into_owned();
        }
        let normalized: String = normalized.chars().take(MAX_SIGNATURE_CHARS).collect();
        return format!("cmd:{}", normalized);
    }
    match action {
        StepAction::ToolCall { tool, .. } => format!("tool:{}", tool),
        other => format!("type:{}", other.step_type()),
    }
}

/// Success and failure history per step shape, persisted as JSON
#[derive(Debug)]
pub struct ExecutionLearner {
    path: PathBuf,
    memory: ExecutionMemory,
    max_patterns: usize,
}

impl ExecutionLearner {
    /// Load `<dir>/execution_memory.json`; a missing or corrupt file starts empty
    pub fn open(dir: &Path, max_patterns: usize) -> Self {
        let path = dir.join(EXECUTION_MEMORY_FILE);
        let memory = load_memory(&path);
        Self {
            path,
            memory,
            max_patterns,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn memory(&self) -> &ExecutionMemory {
        &self.memory
    }

    /// Distinct step shapes with any history
    pub fn pattern_count(&self) -> usize {
        let mut keys: Vec<&String> = self
            .memory
            .successes
            .keys()
            .chain(self.memory.failures.keys())
            .collect();
        keys.sort();
        keys.dedup();
        keys.len()
    }

    pub fn record_success(&mut self, action: &StepAction, duration_seconds: f64) {
        let key = step_signature(action);
        let records = self.memory.successes.entry(key.clone()).or_default();
        records.push(SuccessRecord {
            timestamp: Utc::now(),
            duration_seconds,
        });
        trim_front(records, RECORDS_PER_PATTERN);
        self.prune(&key);
    }

    pub fn record_failure(&mut self, action: &StepAction, category: ErrorCategory, error: &str) {
        let key = step_signature(action);
        let records = self.memory.failures.entry(key.clone()).or_default();
        records.push(FailureRecord {
            timestamp: Utc::now(),
            category,
            error: error.chars().take(MAX_RECORDED_ERROR_CHARS).collect(),
        });
        trim_front(records, RECORDS_PER_PATTERN);
        self.prune(&key);
    }

    /// Historical success rate; 0.5 with no history
    pub fn success_rate(&self, action: &StepAction) -> f64 {
        let key = step_signature(action);
        let successes = self.memory.successes.get(&key).map_or(0, Vec::len);
        let failures = self.memory.failures.get(&key).map_or(0, Vec::len);
        match successes + failures {
            0 => 0.5,
            total => successes as f64 / total as f64,
        }
    }

    /// Category of a failure streak: the last three runs of this step shape
    /// failed the same way, with no success since
    pub fn repeated_failure(&self, action: &StepAction) -> Option<ErrorCategory> {
        let key = step_signature(action);
        let failures = self.memory.failures.get(&key)?;
        if failures.len() < REPEATED_FAILURES {
            return None;
        }
        let recent = &failures[failures.len() - REPEATED_FAILURES..];
        let category = recent[0].category;
        if recent.iter().any(|f| f.category != category) {
            return None;
        }
        let last_success = self
            .memory
            .successes
            .get(&key)
            .and_then(|s| s.last())
            .map(|s| s.timestamp);
        match last_success {
            Some(success) if success >= recent[0].timestamp => None,
            _ => Some(category),
        }
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(&self.memory)?)?;
        Ok(())
    }

    /// Keep `current` and the most recently touched step shapes within the limit
    fn prune(&mut self, current: &str) {
        let total = self.pattern_count();
        if total <= self.max_patterns {
            return;
        }

        let mut latest: BTreeMap<&String, DateTime<Utc>> = BTreeMap::new();
        for (key, records) in &self.memory.successes {
            if let Some(last) = records.last() {
                let entry = latest.entry(key).or_insert(last.timestamp);
                *entry = (*entry).max(last.timestamp);
            }
        }
        for (key, records) in &self.memory.failures {
            if let Some(last) = records.last() {
                let entry = latest.entry(key).or_insert(last.timestamp);
                *entry = (*entry).max(last.timestamp);
            }
        }
        let mut ranked: Vec<(DateTime<Utc>, String)> = latest
            .into_iter()
            .filter(|(key, _)| key.as_str() != current)
            .map(|(key, ts)| (ts, key.clone()))
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0));
        let keep: BTreeSet<String> = std::iter::once(current.to_string())
            .chain(
                ranked
                    .into_iter()
                    .take(self.max_patterns.saturating_sub(1))
                    .map(|(_, key)| key),
            )
            .collect();

        self.memory.successes.retain(|k, _| keep.contains(k));
        self.memory.failures.retain(|k, _| keep.contains(k));
        info!("Pruned execution memory from {} to {} patterns", total, keep.len());
    }
}

fn trim_front<T>(records: &mut Vec<T>, keep: usize) {
    if records.len() > keep {
        records.drain(..records.len() - keep);
    }
}

fn load_memory(path: &Path) -> ExecutionMemory {
    if !path.exists() {
        return ExecutionMemory::default();
    }
    let loaded = fs::read_to_string(path)
        .map_err(|e| e.to_string())
        .and_then(|content| {
            serde_json::from_str::<ExecutionMemory>(&content).map_err(|e| e.to_string())
        });
    match loaded {
        Ok(memory) => memory,
        Err(e) => {
            warn!("Failed to load execution memory {}: {}", path.display(), e);
            ExecutionMemory::default()
        }
    }
}
