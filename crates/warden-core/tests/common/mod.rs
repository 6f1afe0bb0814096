//! Shared fakes for integration tests

#![allow(dead_code)]

use std::sync::Mutex;
use std::time::Duration;

use serde_json::{Map, Value};
use warden_core::{CommandOutput, CommandRunner, SystemContext, ToolError, ToolExecutor};

/// Answers commands by prefix; anything unscripted exits 0 with no output
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Vec<(String, i32, String)>,
    seen: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, prefix: &str, exit_code: i32, stdout: &str) -> Self {
        self.rules
            .push((prefix.to_string(), exit_code, stdout.to_string()));
        self
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, command: &str, _timeout: Duration) -> CommandOutput {
        self.seen.lock().unwrap().push(command.to_string());
        let (code, stdout) = self
            .rules
            .iter()
            .find(|(prefix, _, _)| command.starts_with(prefix.as_str()))
            .map(|(_, code, out)| (*code, out.clone()))
            .unwrap_or((0, String::new()));
        let stderr = if code == 0 { "" } else { "command failed" };
        CommandOutput::new(command, code, &stdout, stderr)
    }
}

/// Records tool calls and returns canned JSON
#[derive(Default)]
pub struct RecordingTools {
    pub calls: Mutex<Vec<(String, Map<String, Value>)>>,
}

impl ToolExecutor for RecordingTools {
    fn execute(&self, name: &str, args: &Map<String, Value>) -> Result<Value, ToolError> {
        self.calls
            .lock()
            .unwrap()
            .push((name.to_string(), args.clone()));
        match name {
            "linux_service_status" => Ok(serde_json::json!({"active": true})),
            "denied" => Err(ToolError::new("EPERM", "not allowed")),
            _ => Ok(Value::Null),
        }
    }
}

/// Three containers, three services, apt
pub fn homelab() -> SystemContext {
    SystemContext {
        hostname: Some("homelab".to_string()),
        container_names: vec![
            "nextcloud-app".to_string(),
            "nextcloud-redis".to_string(),
            "nginx-proxy".to_string(),
        ],
        service_names: vec![
            "nginx.service".to_string(),
            "sshd.service".to_string(),
            "firewalld.service".to_string(),
        ],
        package_manager: Some("apt".to_string()),
        installed_packages: vec!["vlc".to_string()],
        ..Default::default()
    }
}
