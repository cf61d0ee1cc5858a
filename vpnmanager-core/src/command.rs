//! External command descriptions.
//!
//! Everything the manager does to the host goes through `nft` or `ip`. This
//! module only describes those invocations; running them is the daemon's job.

use std::fmt;

/// One invocation of an external program, optionally fed a script on stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemCommand {
    /// Program name, resolved through `PATH`
    pub program: &'static str,
    /// Arguments, passed verbatim (no shell involved)
    pub args: Vec<String>,
    /// Script written to the child's stdin
    pub stdin: Option<String>,
}

impl SystemCommand {
    pub fn new<I, S>(program: &'static str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program,
            args: args.into_iter().map(Into::into).collect(),
            stdin: None,
        }
    }

    pub fn with_stdin(mut self, script: impl Into<String>) -> Self {
        self.stdin = Some(script.into());
        self
    }
}

impl fmt::Display for SystemCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Failure to run a [`SystemCommand`].
///
/// Both variants carry the rendered command line so operators can reproduce
/// the failure by hand.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' failed ({status}): {output}{}", render_input(.input))]
    Failed {
        command: String,
        status: String,
        input: Option<String>,
        output: String,
    },
}

fn render_input(input: &Option<String>) -> String {
    match input {
        Some(script) => format!("\ninput:\n{script}"),
        None => String::new(),
    }
}

impl CommandError {
    pub fn failed(
        cmd: &SystemCommand,
        status: impl fmt::Display,
        output: impl Into<String>,
    ) -> Self {
        Self::Failed {
            command: cmd.to_string(),
            status: status.to_string(),
            input: cmd.stdin.clone(),
            output: output.into(),
        }
    }

    pub fn spawn(cmd: &SystemCommand, source: std::io::Error) -> Self {
        Self::Spawn {
            command: cmd.to_string(),
            source,
        }
    }
}
