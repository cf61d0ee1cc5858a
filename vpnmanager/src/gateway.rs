//! Execution of `nft` and `ip` commands.
//!
//! [`CommandRunner`] is the process boundary; [`Gateway`] moves the blocking
//! call off the async runtime and logs what it runs.

use std::io::{self, Write};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use vpnmanager_core::{CommandError, SystemCommand};

/// Runs one external command to completion.
///
/// Returns combined stdout+stderr on success. A non-zero exit is an error
/// carrying the command and its output.
pub trait CommandRunner: Send + Sync + 'static {
    fn run(&self, cmd: &SystemCommand) -> Result<String, CommandError>;
}

/// Runs commands as child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, cmd: &SystemCommand) -> Result<String, CommandError> {
        let mut command = Command::new(cmd.program);
        command
            .args(&cmd.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if cmd.stdin.is_some() {
            command.stdin(Stdio::piped());
        }

        let mut child = command.spawn().map_err(|e| CommandError::spawn(cmd, e))?;
        // Fed from a separate thread so output is drained even if the child
        // exits before reading all of its input.
        let writer = match (cmd.stdin.clone(), child.stdin.take()) {
            (Some(script), Some(mut stdin)) => {
                Some(thread::spawn(move || stdin.write_all(script.as_bytes())))
            }
            _ => None,
        };

        let out = child
            .wait_with_output()
            .map_err(|e| CommandError::spawn(cmd, e))?;
        let written = writer.map(|handle| {
            handle
                .join()
                .unwrap_or_else(|_| Err(io::Error::other("stdin writer panicked")))
        });

        let stdout = String::from_utf8_lossy(&out.stdout);
        let stderr = String::from_utf8_lossy(&out.stderr);
        let combined = format!("{stdout}{stderr}");

        if !out.status.success() {
            return Err(CommandError::failed(cmd, out.status, combined.trim_end()));
        }
        if let Some(Err(e)) = written {
            return Err(CommandError::spawn(cmd, e));
        }
        Ok(combined)
    }
}

/// Async front of a [`CommandRunner`].
#[derive(Clone)]
pub struct Gateway {
    runner: Arc<dyn CommandRunner>,
}

impl Gateway {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    pub fn process() -> Self {
        Self::new(Arc::new(ProcessRunner))
    }

    pub async fn apply(&self, cmd: SystemCommand) -> anyhow::Result<String> {
        tracing::debug!(command = %cmd, script = cmd.stdin.as_deref(), "running command");
        let runner = Arc::clone(&self.runner);
        let out = tokio::task::spawn_blocking(move || runner.run(&cmd)).await??;
        Ok(out)
    }

    /// Runs `cmd`, logging a failure instead of returning it.
    pub async fn apply_best_effort(&self, cmd: SystemCommand, step: &str) -> bool {
        match self.apply(cmd).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(step, error = %e, "command failed, continuing");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_runner_success_and_failure() {
        let runner = ProcessRunner;

        let ok = SystemCommand::new("sh", ["-c", "echo out; echo err >&2"]);
        let out = runner.run(&ok).unwrap();
        assert!(out.contains("out"));
        assert!(out.contains("err"));

        let fail = SystemCommand::new("sh", ["-c", "echo boom >&2; exit 3"]);
        let err = runner.run(&fail).unwrap_err().to_string();
        assert!(err.contains("sh -c"));
        assert!(err.contains("boom"));
    }

    #[test]
    fn test_process_runner_feeds_stdin() {
        let cmd = SystemCommand::new("cat", Vec::<String>::new()).with_stdin("table ip t {}\n");
        let out = ProcessRunner.run(&cmd).unwrap();
        assert_eq!(out, "table ip t {}\n");
    }

    #[test]
    fn test_early_exit_keeps_output() {
        let script = "add element ip t s { 10.0.0.1 }\n".repeat(64 * 1024);
        let cmd = SystemCommand::new("sh", ["-c", "echo 'Error: syntax error' >&2; exit 1"])
            .with_stdin(script);
        match ProcessRunner.run(&cmd).unwrap_err() {
            CommandError::Failed { output, .. } => assert!(output.contains("syntax error")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_process_runner_spawn_error() {
        let cmd = SystemCommand::new("definitely-not-a-real-binary-xyz", ["x"]);
        let err = ProcessRunner.run(&cmd).unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_gateway_best_effort_swallows_failure() {
        let gw = Gateway::process();
        let ok = gw
            .apply_best_effort(SystemCommand::new("sh", ["-c", "exit 1"]), "test")
            .await;
        assert!(!ok);
    }
}
