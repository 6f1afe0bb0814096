//! Backups, the persisted rollback stack, and system snapshots.
//!
//! One `SafetyManager` owns one backup directory. The rollback stack lives in
//! `<backup_dir>/rollback_stack.json` (oldest first) and is rewritten whole on
//! every mutation. Safety failures never propagate as errors from the
//! backup/restore/rollback paths; they come back as `Option`/`bool` plus a log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::error::Result;
use crate::risk::{self, RiskAssessment};
use crate::shell::CommandRunner;

/// Rollback stack file name inside the backup directory
pub const ROLLBACK_STACK_FILE: &str = "rollback_stack.json";

/// Key in `original_state` naming the file a backup was taken from
pub const ORIGINAL_PATH_KEY: &str = "original_path";

/// Key in `original_state` listing every file backed up for one step
pub const ORIGINAL_PATHS_KEY: &str = "original_paths";

const DEFAULT_ROLLBACK_TIMEOUT: Duration = Duration::from_secs(60);
const SERVICE_SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(10);
const DISK_SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(5);

/// One reversible action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackAction {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    #[serde(default)]
    pub rollback_command: Option<String>,
    #[serde(default)]
    pub backup_path: Option<PathBuf>,
    #[serde(default)]
    pub original_state: BTreeMap<String, Value>,
    #[serde(default)]
    pub completed: bool,
}

impl RollbackAction {
    /// Files this action can restore from backup
    pub fn original_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = Vec::new();
        if let Some(Value::String(p)) = self.original_state.get(ORIGINAL_PATH_KEY) {
            paths.push(PathBuf::from(p));
        }
        if let Some(Value::Array(items)) = self.original_state.get(ORIGINAL_PATHS_KEY) {
            for item in items {
                if let Value::String(p) = item {
                    let p = PathBuf::from(p);
                    if !paths.contains(&p) {
                        paths.push(p);
                    }
                }
            }
        }
        paths
    }
}

/// Result of rolling back one action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackOutcome {
    pub action_id: String,
    pub description: String,
    pub success: bool,
    pub message: String,
}

/// Point-in-time record of running services and disk usage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub services: BTreeMap<String, String>,
    pub disk_usage: BTreeMap<String, String>,
    #[serde(skip)]
    pub path: Option<PathBuf>,
}

pub struct SafetyManager {
    backup_dir: PathBuf,
    runner: Arc<dyn CommandRunner>,
    rollback_timeout: Duration,
    stack: Vec<RollbackAction>,
    /// Backups taken by this instance, per original path, oldest first
    backups: HashMap<PathBuf, Vec<PathBuf>>,
}

impl std::fmt::Debug for SafetyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafetyManager")
            .field("backup_dir", &self.backup_dir)
            .field("stack_len", &self.stack.len())
            .finish()
    }
}

impl SafetyManager {
    /// Open (or create) a backup directory and load its rollback stack
    pub fn open(backup_dir: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        let backup_dir = backup_dir.into();
        fs::create_dir_all(&backup_dir)?;
        let stack = load_stack(&backup_dir.join(ROLLBACK_STACK_FILE));
        debug!(
            "Opened backup dir {} ({} rollback entries)",
            backup_dir.display(),
            stack.len()
        );
        Ok(Self {
            backup_dir,
            runner,
            rollback_timeout: DEFAULT_ROLLBACK_TIMEOUT,
            stack,
            backups: HashMap::new(),
        })
    }

    pub fn with_rollback_timeout(mut self, timeout: Duration) -> Self {
        self.rollback_timeout = timeout;
        self
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn stack_path(&self) -> PathBuf {
        self.backup_dir.join(ROLLBACK_STACK_FILE)
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    pub fn assess_command_risk(&self, command: &str) -> RiskAssessment {
        risk::assess_command_risk(command)
    }

    // =========================================================================
    // Backups
    // =========================================================================

    /// Copy a file or directory tree into the backup directory.
    ///
    /// File backups get a `.sha256` sidecar. Returns `None` on any failure.
    pub fn backup_file(&mut self, path: &Path) -> Option<PathBuf> {
        if !path.exists() {
            warn!("Cannot back up {}: path does not exist", path.display());
            return None;
        }

        let backup = self.next_backup_path(path);
        let result = if path.is_dir() {
            copy_tree(path, &backup)
        } else {
            fs::copy(path, &backup).and_then(|_| write_sidecar(&backup))
        }
        .and_then(|_| fs::write(origin_path(&backup), path.to_string_lossy().as_bytes()));

        match result {
            Ok(()) => {
                info!("Backed up {} to {}", path.display(), backup.display());
                self.backups
                    .entry(path.to_path_buf())
                    .or_default()
                    .push(backup.clone());
                Some(backup)
            }
            Err(e) => {
                warn!("Failed to back up {}: {}", path.display(), e);
                if backup.is_dir() {
                    let _ = fs::remove_dir_all(&backup);
                } else {
                    let _ = fs::remove_file(&backup);
                    let _ = fs::remove_file(sidecar_path(&backup));
                }
                let _ = fs::remove_file(origin_path(&backup));
                None
            }
        }
    }

    fn next_backup_path(&self, path: &Path) -> PathBuf {
        let stem = flatten_path(path);
        let ts = Utc::now().format("%Y%m%d_%H%M%S_%6f").to_string();
        let mut candidate = self.backup_dir.join(format!("{}.{}.bak", stem, ts));
        let mut n = 1;
        while candidate.exists() {
            candidate = self.backup_dir.join(format!("{}.{}-{}.bak", stem, ts, n));
            n += 1;
        }
        candidate
    }

    /// Recompute a file backup's hash and compare it with its sidecar.
    ///
    /// Directory backups carry no sidecar and verify by existence.
    pub fn verify_backup(&self, backup: &Path) -> bool {
        if backup.is_dir() {
            return true;
        }
        let expected = match fs::read_to_string(sidecar_path(backup)) {
            Ok(s) => s.trim().to_string(),
            Err(e) => {
                warn!("No checksum for {}: {}", backup.display(), e);
                return false;
            }
        };
        match hash_file(backup) {
            Ok(actual) => actual == expected,
            Err(e) => {
                warn!("Cannot hash {}: {}", backup.display(), e);
                false
            }
        }
    }

    /// Most recent backup known for a path
    pub fn latest_backup(&self, path: &Path) -> Option<PathBuf> {
        if let Some(latest) = self.backups.get(path).and_then(|b| b.last()) {
            return Some(latest.clone());
        }

        let path_str = path.to_string_lossy();
        let from_stack = self.stack.iter().rev().find_map(|action| {
            let backup = action.backup_path.as_ref()?;
            let matches = action
                .original_state
                .get(ORIGINAL_PATH_KEY)
                .and_then(Value::as_str)
                == Some(path_str.as_ref());
            (matches && backup.exists()).then(|| backup.clone())
        });
        if from_stack.is_some() {
            return from_stack;
        }

        self.scan_backups(path)
    }

    /// Backups left by earlier runs, found by name.
    ///
    /// Flattened names collide (`/etc/a_b` and `/etc/a/b`), so a candidate
    /// only counts when its `.origin` marker names `path`.
    fn scan_backups(&self, path: &Path) -> Option<PathBuf> {
        let prefix = format!("{}.", flatten_path(path));
        let wanted = path.to_string_lossy();
        let entries = fs::read_dir(&self.backup_dir).ok()?;
        let mut found: Vec<((String, u32), PathBuf)> = entries
            .filter_map(|e| e.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                let stamp = name.strip_prefix(&prefix)?.strip_suffix(".bak")?;
                let key = parse_stamp(stamp)?;
                let origin = fs::read_to_string(origin_path(&entry.path())).ok()?;
                (origin == wanted).then(|| (key, entry.path()))
            })
            .collect();
        found.sort();
        found.pop().map(|(_, p)| p)
    }

    /// Restore a path from its most recent backup
    pub fn restore_file(&self, path: &Path) -> bool {
        let Some(backup) = self.latest_backup(path) else {
            warn!("No backup found for {}", path.display());
            return false;
        };

        if backup.is_file() && sidecar_path(&backup).exists() && !self.verify_backup(&backup) {
            error!(
                "Backup {} failed checksum verification, not restoring",
                backup.display()
            );
            return false;
        }

        let result = if backup.is_dir() {
            restore_tree(&backup, path)
        } else {
            path.parent()
                .map(fs::create_dir_all)
                .unwrap_or(Ok(()))
                .and_then(|_| fs::copy(&backup, path).map(|_| ()))
        };

        match result {
            Ok(()) => {
                info!("Restored {} from {}", path.display(), backup.display());
                true
            }
            Err(e) => {
                error!("Failed to restore {}: {}", path.display(), e);
                false
            }
        }
    }

    // =========================================================================
    // Rollback stack
    // =========================================================================

    /// Append an action and persist the stack immediately
    pub fn record_action(
        &mut self,
        description: &str,
        rollback_command: Option<String>,
        backup_path: Option<PathBuf>,
        original_state: Option<BTreeMap<String, Value>>,
    ) -> Result<RollbackAction> {
        let action = RollbackAction {
            id: uuid::Uuid::new_v4().simple().to_string()[..12].to_string(),
            timestamp: Utc::now(),
            description: description.to_string(),
            rollback_command,
            backup_path,
            original_state: original_state.unwrap_or_default(),
            completed: false,
        };

        self.stack.push(action.clone());
        if let Err(e) = self.save() {
            self.stack.pop();
            return Err(e);
        }

        info!("Recorded action for rollback: {}", description);
        Ok(action)
    }

    /// Roll back the most recent pending action
    pub fn rollback_last(&mut self) -> (bool, String) {
        match self.stack.iter().rposition(|a| !a.completed) {
            Some(index) => self.rollback_at(index),
            None => (false, "No actions to roll back".to_string()),
        }
    }

    /// Roll back one action by id, if it is still pending
    pub fn rollback_action(&mut self, id: &str) -> (bool, String) {
        match self.stack.iter().position(|a| a.id == id) {
            Some(index) if self.stack[index].completed => (
                false,
                format!("Action already rolled back: {}", self.stack[index].description),
            ),
            Some(index) => self.rollback_at(index),
            None => (false, format!("Unknown rollback action: {}", id)),
        }
    }

    /// Attempt every pending action once, most recent first
    pub fn rollback_all(&mut self) -> Vec<RollbackOutcome> {
        let pending: Vec<usize> = (0..self.stack.len())
            .rev()
            .filter(|&i| !self.stack[i].completed)
            .collect();

        pending
            .into_iter()
            .map(|index| {
                let (success, message) = self.rollback_at(index);
                RollbackOutcome {
                    action_id: self.stack[index].id.clone(),
                    description: self.stack[index].description.clone(),
                    success,
                    message,
                }
            })
            .collect()
    }

    fn rollback_at(&mut self, index: usize) -> (bool, String) {
        let action = self.stack[index].clone();
        let mut success = false;
        let mut message = String::new();

        if let Some(command) = &action.rollback_command {
            let output = self.runner.run(command, self.rollback_timeout);
            if output.success() {
                success = true;
                message = format!("Rolled back: {}", action.description);
            } else {
                message = format!("Rollback command failed: {}", output.error_message());
            }
        }

        if !success && action.backup_path.is_some() {
            let paths = action.original_paths();
            if !paths.is_empty() {
                let failed: Vec<String> = paths
                    .iter()
                    .filter(|p| !self.restore_file(p))
                    .map(|p| p.display().to_string())
                    .collect();
                if failed.is_empty() {
                    success = true;
                    message = format!("Restored from backup: {}", action.description);
                } else {
                    message = format!("Failed to restore from backup: {}", failed.join(", "));
                }
            }
        }

        if !success && message.is_empty() {
            message = format!("Nothing to roll back for: {}", action.description);
        }

        if success {
            self.stack[index].completed = true;
            if let Err(e) = self.save() {
                warn!("Rolled back but could not persist rollback stack: {}", e);
            }
            info!("{}", message);
        } else {
            warn!("{}", message);
        }

        (success, message)
    }

    /// Pending actions, most recent first
    pub fn get_rollback_stack(&self) -> Vec<RollbackAction> {
        self.stack
            .iter()
            .rev()
            .filter(|a| !a.completed)
            .cloned()
            .collect()
    }

    /// Every persisted action, oldest first
    pub fn all_actions(&self) -> &[RollbackAction] {
        &self.stack
    }

    pub fn find_action(&self, id: &str) -> Option<&RollbackAction> {
        self.stack.iter().find(|a| a.id == id)
    }

    /// Remove completed entries older than the threshold
    pub fn clear_completed_rollbacks(&mut self, older_than_days: u32) -> usize {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(older_than_days));
        let before = self.stack.len();
        self.stack
            .retain(|a| !a.completed || a.timestamp > cutoff);
        let removed = before - self.stack.len();

        if removed > 0 {
            if let Err(e) = self.save() {
                warn!("Failed to persist pruned rollback stack: {}", e);
            }
            info!("Cleared {} old rollback entries", removed);
        }
        removed
    }

    fn save(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(&self.stack)?;
        fs::write(self.stack_path(), content)?;
        Ok(())
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Capture running services and disk usage, and write them to the backup dir
    pub fn create_system_snapshot(&self, name: &str) -> Result<SystemSnapshot> {
        let timestamp = Utc::now();
        let mut snapshot = SystemSnapshot {
            name: name.to_string(),
            timestamp,
            services: BTreeMap::new(),
            disk_usage: BTreeMap::new(),
            path: None,
        };

        let services = self.runner.run(
            "systemctl list-units --type=service --state=running --no-pager --plain",
            SERVICE_SNAPSHOT_TIMEOUT,
        );
        if services.success() {
            for line in services.stdout.lines() {
                if let Some(unit) = line.split_whitespace().next() {
                    if unit.ends_with(".service") {
                        snapshot
                            .services
                            .insert(unit.to_string(), "running".to_string());
                    }
                }
            }
        } else {
            debug!("Failed to capture services: {}", services.error_message());
        }

        let disk = self.runner.run("df -h / /home", DISK_SNAPSHOT_TIMEOUT);
        if disk.success() {
            snapshot
                .disk_usage
                .insert("raw".to_string(), disk.stdout.clone());
        } else {
            debug!("Failed to capture disk usage: {}", disk.error_message());
        }

        let safe_name: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let path = self.backup_dir.join(format!(
            "snapshot_{}_{}.json",
            safe_name,
            timestamp.format("%Y%m%d_%H%M%S")
        ));
        fs::write(&path, serde_json::to_string_pretty(&snapshot)?)?;
        info!("Wrote system snapshot {}", path.display());

        snapshot.path = Some(path);
        Ok(snapshot)
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn load_stack(path: &Path) -> Vec<RollbackAction> {
    if !path.exists() {
        return Vec::new();
    }
    let loaded = fs::read_to_string(path)
        .map_err(|e| e.to_string())
        .and_then(|content| {
            serde_json::from_str::<Vec<RollbackAction>>(&content).map_err(|e| e.to_string())
        });
    match loaded {
        Ok(stack) => stack,
        Err(e) => {
            warn!("Failed to load rollback stack {}: {}", path.display(), e);
            Vec::new()
        }
    }
}

/// `/etc/nginx/nginx.conf` -> `etc_nginx_nginx.conf`
fn flatten_path(path: &Path) -> String {
    path.to_string_lossy()
        .replace('/', "_")
        .trim_start_matches('_')
        .to_string()
}

/// `20240101_120000_000001` or `20240101_120000_000001-2`
fn parse_stamp(stamp: &str) -> Option<(String, u32)> {
    let (ts, n) = match stamp.split_once('-') {
        Some((ts, n)) => (ts, n.parse().ok()?),
        None => (stamp, 0),
    };
    let valid = !ts.is_empty() && ts.chars().all(|c| c.is_ascii_digit() || c == '_');
    valid.then(|| (ts.to_string(), n))
}

fn sidecar_path(backup: &Path) -> PathBuf {
    with_suffix(backup, ".sha256")
}

/// Marker holding the path a backup was taken from
fn origin_path(backup: &Path) -> PathBuf {
    with_suffix(backup, ".origin")
}

fn with_suffix(backup: &Path, suffix: &str) -> PathBuf {
    let mut name = backup.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn hash_file(path: &Path) -> io::Result<String> {
    let data = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&data);
    Ok(hex::encode(hasher.finalize()))
}

fn write_sidecar(backup: &Path) -> io::Result<()> {
    let hash = hash_file(backup)?;
    fs::write(sidecar_path(backup), hash)
}

fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let target = dst.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
        } else {
            debug!("Skipping special file {}", entry.path().display());
        }
    }
    Ok(())
}

fn restore_tree(backup: &Path, target: &Path) -> io::Result<()> {
    if target.exists() {
        fs::remove_dir_all(target)?;
    }
    copy_tree(backup, target)
}
