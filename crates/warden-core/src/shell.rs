//! Shell command execution.
//!
//! Every command the pipeline runs goes through a `CommandRunner`. The
//! default `ShellRunner` executes via `sh -c` with a wall-clock timeout and
//! truncated output capture. Tests substitute scripted runners.
//!
//! Each command runs in its own process group. On timeout the whole group is
//! killed, and output readers are abandoned after a short grace period so a
//! detached grandchild holding the pipes cannot stall the caller.

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default cap on captured stdout/stderr
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 10_000;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How long to wait for pipe readers once the command itself is gone
const READER_GRACE: Duration = Duration::from_millis(250);

/// Outcome of one command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    /// Exit code 0
    Success,
    /// Ran but returned non-zero
    NonZeroExit,
    /// Killed after the deadline
    Timeout,
    /// Could not be spawned
    OsError,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::NonZeroExit => "non-zero exit",
            Self::Timeout => "timeout",
            Self::OsError => "OS error",
        }
    }
}

/// Captured result of a command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutput {
    pub command: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub status: ExecutionStatus,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    /// Error text suitable for a failed step
    pub fn error_message(&self) -> String {
        match self.status {
            ExecutionStatus::Success => String::new(),
            ExecutionStatus::Timeout => format!("Command timed out after {}ms", self.duration_ms),
            ExecutionStatus::OsError => self.stderr.clone(),
            ExecutionStatus::NonZeroExit => {
                let stderr = self.stderr.trim();
                if stderr.is_empty() {
                    format!("Command exited with code {}", self.exit_code.unwrap_or(-1))
                } else {
                    stderr.to_string()
                }
            }
        }
    }

    /// Build an output by hand (scripted runners, host adapters)
    pub fn new(command: &str, exit_code: i32, stdout: &str, stderr: &str) -> Self {
        Self {
            command: command.to_string(),
            exit_code: Some(exit_code),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            status: if exit_code == 0 {
                ExecutionStatus::Success
            } else {
                ExecutionStatus::NonZeroExit
            },
            duration_ms: 0,
        }
    }
}

/// Runs shell commands on behalf of the executor and safety manager
pub trait CommandRunner: Send + Sync {
    fn run(&self, command: &str, timeout: Duration) -> CommandOutput;
}

/// `sh -c` runner with timeout and output truncation
#[derive(Debug, Clone)]
pub struct ShellRunner {
    max_output_bytes: usize,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_OUTPUT_BYTES)
    }
}

impl ShellRunner {
    pub fn new(max_output_bytes: usize) -> Self {
        Self { max_output_bytes }
    }
}

impl CommandRunner for ShellRunner {
    fn run(&self, command: &str, timeout: Duration) -> CommandOutput {
        debug!("Executing: {}", command);
        let start = Instant::now();

        let spawned = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                return CommandOutput {
                    command: command.to_string(),
                    exit_code: None,
                    stdout: String::new(),
                    stderr: format!("OS error: {}", e),
                    status: ExecutionStatus::OsError,
                    duration_ms: start.elapsed().as_millis() as u64,
                };
            }
        };

        // Drain pipes on their own threads so a chatty child cannot block on a full pipe
        let stdout_reader = child.stdout.take().map(spawn_reader);
        let stderr_reader = child.stderr.take().map(spawn_reader);

        let deadline = start + timeout;
        let mut timed_out = false;
        let exit_status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) if Instant::now() >= deadline => {
                    warn!("Command timed out after {:?}: {}", timeout, command);
                    kill_group(&mut child);
                    timed_out = true;
                    break child.wait().ok();
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    warn!("Failed to wait on command: {}", e);
                    kill_group(&mut child);
                    break None;
                }
            }
        };

        // Background jobs may keep the pipes open past the shell's exit
        let reader_deadline = Instant::now() + READER_GRACE;
        let stdout = stdout_reader.map(|r| r.collect(reader_deadline)).unwrap_or_default();
        let stderr = stderr_reader.map(|r| r.collect(reader_deadline)).unwrap_or_default();
        let (stdout, _) = truncate_output(&stdout, self.max_output_bytes);
        let (stderr, _) = truncate_output(&stderr, self.max_output_bytes);
        let exit_code = exit_status.and_then(|s| s.code());

        let status = if timed_out {
            ExecutionStatus::Timeout
        } else if exit_status.is_some_and(|s| s.success()) {
            ExecutionStatus::Success
        } else if exit_status.is_some() {
            ExecutionStatus::NonZeroExit
        } else {
            ExecutionStatus::OsError
        };

        CommandOutput {
            command: command.to_string(),
            exit_code,
            stdout,
            stderr,
            status,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }
}

/// SIGKILL the command's process group, falling back to the shell alone
fn kill_group(child: &mut Child) {
    let pgid = Pid::from_raw(child.id() as i32);
    if let Err(e) = killpg(pgid, Signal::SIGKILL) {
        debug!("killpg({}) failed: {}", pgid, e);
        let _ = child.kill();
    }
}

/// Pipe drained on its own thread; output read so far survives abandonment
struct PipeReader {
    buf: Arc<Mutex<Vec<u8>>>,
    done: Receiver<()>,
}

impl PipeReader {
    fn collect(self, deadline: Instant) -> Vec<u8> {
        let wait = deadline.saturating_duration_since(Instant::now());
        if self.done.recv_timeout(wait).is_err() {
            debug!("Pipe still open after the command exited; keeping partial output");
        }
        self.buf
            .lock()
            .map(|mut buf| std::mem::take(&mut *buf))
            .unwrap_or_default()
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> PipeReader {
    let buf = Arc::new(Mutex::new(Vec::new()));
    let (tx, done) = mpsc::channel();
    let sink = Arc::clone(&buf);
    thread::spawn(move || {
        let mut chunk = [0u8; 8192];
        loop {
            match pipe.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => match sink.lock() {
                    Ok(mut out) => out.extend_from_slice(&chunk[..n]),
                    Err(_) => break,
                },
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        let _ = tx.send(());
    });
    PipeReader { buf, done }
}

/// Truncate output to a byte budget, lossy-decoding as UTF-8
pub fn truncate_output(bytes: &[u8], max_bytes: usize) -> (String, bool) {
    let truncated = bytes.len() > max_bytes;
    let slice = if truncated { &bytes[..max_bytes] } else { bytes };

    let mut output = String::from_utf8_lossy(slice).to_string();
    if truncated {
        output.push_str("\n... (truncated)");
    }
    (output, truncated)
}

/// Quote a value for safe interpolation into a `sh -c` command
pub fn shell_quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '@' | '+' | '='));
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}
