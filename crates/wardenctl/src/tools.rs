//! Local tool executor
//!
//! Serves the tool calls a plan can contain by running them on this host.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::debug;
use warden_core::shell::shell_quote;
use warden_core::{CommandRunner, ToolError, ToolExecutor, RUN_COMMAND_TOOL};

pub const SERVICE_STATUS_TOOL: &str = "linux_service_status";
pub const SYSTEM_INFO_TOOL: &str = "linux_system_info";

pub struct HostTools {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl HostTools {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    fn run_command(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let command = string_arg(args, "command")?;
        let timeout = args
            .get("timeout_secs")
            .and_then(Value::as_u64)
            .map(Duration::from_secs)
            .map_or(self.timeout, |t| t.min(self.timeout));

        let out = self.runner.run(command, timeout);
        if out.success() {
            Ok(Value::String(out.stdout))
        } else {
            let mut err = ToolError::new(
                format!("EXIT_{}", out.exit_code.unwrap_or(-1)),
                out.error_message(),
            );
            err.data = Some(json!({"status": out.status.as_str(), "stdout": out.stdout}));
            Err(err)
        }
    }

    fn service_status(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let service = string_arg(args, "service")?;
        let out = self.runner.run(
            &format!("systemctl is-active {}", shell_quote(service)),
            self.timeout,
        );
        // is-active exits non-zero for inactive units; only a missing binary is an error
        if out.exit_code.is_none() {
            return Err(ToolError::new("UNAVAILABLE", out.error_message()));
        }
        let state = out.stdout.trim().to_string();
        Ok(json!({
            "service": service,
            "active": state == "active",
            "state": state,
        }))
    }

    fn system_info(&self) -> Result<Value, ToolError> {
        let field = |command: &str| {
            let out = self.runner.run(command, self.timeout);
            out.success().then(|| out.stdout.trim().to_string())
        };
        Ok(json!({
            "hostname": field("hostname"),
            "kernel": field("uname -r"),
            "uptime": field("uptime -p"),
            "memory": field("free -h"),
            "disk": field("df -h /"),
        }))
    }
}

impl ToolExecutor for HostTools {
    fn execute(&self, name: &str, args: &Map<String, Value>) -> Result<Value, ToolError> {
        debug!("Tool call {} {:?}", name, args);
        match name {
            RUN_COMMAND_TOOL => self.run_command(args),
            SERVICE_STATUS_TOOL => self.service_status(args),
            SYSTEM_INFO_TOOL => self.system_info(),
            other => Err(ToolError::new(
                "UNKNOWN_TOOL",
                format!("No tool named '{}'", other),
            )),
        }
    }
}

fn string_arg<'a>(args: &'a Map<String, Value>, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ToolError::new("INVALID_ARGS", format!("Missing '{}' argument", key)))
}
