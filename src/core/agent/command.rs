use async_trait::async_trait;
use std::process::Stdio;
use tracing::debug;

use super::capability::{Action, CapabilityError, Outcome, Validate};
use crate::core::tasks::Parameters;
use crate::platform::{NativePlatform, Platform};

const DIAGNOSTIC_LINES: usize = 40;

/// Runs a shell command with the subject as its working directory.
/// The exit status is the structured result.
#[derive(Debug, Clone)]
pub struct CommandAction {
    command: String,
}

impl CommandAction {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandValidate {
    command: String,
}

impl CommandValidate {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl Action for CommandAction {
    async fn run(&self, subject: &str, params: &Parameters) -> Result<Outcome, CapabilityError> {
        let env: Vec<(String, String)> = params
            .as_env_pairs()
            .into_iter()
            .map(|(k, v)| (param_env_name(&k), v))
            .collect();
        run_shell(&self.command, subject, &env).await
    }
}

#[async_trait]
impl Validate for CommandValidate {
    async fn run(&self, subject: &str) -> Result<Outcome, CapabilityError> {
        run_shell(&self.command, subject, &[]).await
    }
}

/// `channel` → `AUTOPILOT_PARAM_CHANNEL`; anything outside `[A-Za-z0-9]` becomes `_`.
fn param_env_name(key: &str) -> String {
    let mut name = String::from("AUTOPILOT_PARAM_");
    name.extend(key.chars().map(|c| {
        if c.is_ascii_alphanumeric() {
            c.to_ascii_uppercase()
        } else {
            '_'
        }
    }));
    name
}

async fn run_shell(
    command: &str,
    subject: &str,
    env: &[(String, String)],
) -> Result<Outcome, CapabilityError> {
    let mut cmd = NativePlatform::shell_inline(command);
    cmd.current_dir(subject)
        .env("AUTOPILOT_SUBJECT", subject)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (k, v) in env {
        cmd.env(k, v);
    }

    debug!("Running '{}' in {}", command, subject);
    let output = cmd
        .output()
        .await
        .map_err(|e| CapabilityError::Spawn(format!("'{}' in {}: {}", command, subject, e)))?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    let diagnostics = tail_lines(&combined, DIAGNOSTIC_LINES);

    if output.status.success() {
        Ok(Outcome::success(diagnostics))
    } else {
        let code = output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        Ok(Outcome::failure(format!("{}\nexit status: {}", diagnostics, code)))
    }
}

fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}
