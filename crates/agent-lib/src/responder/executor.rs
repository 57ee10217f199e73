//! Remediation action executors

use super::ActionSpec;
use crate::models::TargetRef;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use tracing::info;

/// Longest command output kept in an outcome message
const MAX_MESSAGE_LEN: usize = 512;

/// Runs an approved action against a target
///
/// The responder bounds every call with the action's timeout and drops the
/// future when it expires.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Returns a short human-readable result on success
    async fn execute(&self, target: &TargetRef, action: &ActionSpec) -> Result<String>;
}

/// Executes the action's configured command line
#[derive(Debug, Default, Clone)]
pub struct CommandExecutor;

impl CommandExecutor {
    pub fn new() -> Self {
        Self
    }

    fn render(argv: &[String], target: &TargetRef) -> Vec<String> {
        argv.iter()
            .map(|arg| {
                arg.replace("{target_id}", &target.id)
                    .replace("{target_name}", &target.name)
            })
            .collect()
    }
}

#[async_trait]
impl ActionExecutor for CommandExecutor {
    async fn execute(&self, target: &TargetRef, action: &ActionSpec) -> Result<String> {
        let Some(argv) = action.command.as_deref() else {
            bail!("No command configured for action {}", action.name);
        };
        let argv = Self::render(argv, target);
        let Some((program, args)) = argv.split_first() else {
            bail!("Empty command for action {}", action.name);
        };

        let output = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to spawn {}", program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} exited with {}: {}",
                program,
                output.status,
                truncate(stderr.trim())
            );
        }
        Ok(truncate(String::from_utf8_lossy(&output.stdout).trim()))
    }
}

/// Logs the action instead of running anything
#[derive(Debug, Default, Clone)]
pub struct LogExecutor;

#[async_trait]
impl ActionExecutor for LogExecutor {
    async fn execute(&self, target: &TargetRef, action: &ActionSpec) -> Result<String> {
        info!(
            target_id = %target.id,
            target_name = %target.name,
            action = %action.name,
            "Remediation action requested"
        );
        Ok(format!("{} logged for {}", action.name, target.name))
    }
}

fn truncate(s: &str) -> String {
    match s.char_indices().nth(MAX_MESSAGE_LEN) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spec(command: Option<Vec<&str>>) -> ActionSpec {
        let spec = ActionSpec::new("restart", Duration::from_secs(60), Duration::from_secs(5));
        match command {
            Some(argv) => spec.with_command(argv.into_iter().map(str::to_string).collect()),
            None => spec,
        }
    }

    #[test]
    fn test_render_placeholders() {
        let argv = vec!["docker".to_string(), "restart".to_string(), "{target_id}".to_string()];
        let rendered = CommandExecutor::render(&argv, &TargetRef::new("c-1", "db-1"));
        assert_eq!(rendered, vec!["docker", "restart", "c-1"]);
    }

    #[tokio::test]
    async fn test_missing_command_fails() {
        let result = CommandExecutor::new()
            .execute(&TargetRef::new("c-1", "db-1"), &spec(None))
            .await;
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_output_and_exit_status() {
        let target = TargetRef::new("c-1", "db-1");
        let ok = CommandExecutor::new()
            .execute(&target, &spec(Some(vec!["echo", "restarted {target_name}"])))
            .await
            .unwrap();
        assert_eq!(ok, "restarted db-1");

        let failed = CommandExecutor::new()
            .execute(&target, &spec(Some(vec!["false"])))
            .await;
        assert!(failed.is_err());
    }

    #[test]
    fn test_truncate_long_output() {
        let long = "x".repeat(MAX_MESSAGE_LEN + 10);
        assert_eq!(truncate(&long).len(), MAX_MESSAGE_LEN + 3);
        assert_eq!(truncate("short"), "short");
    }
}
