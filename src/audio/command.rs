//! Bounded invocation of external media tools (ffprobe/ffmpeg).
//!
//! Every invocation has an argument list, a timeout, and captures both output
//! streams so failures can be reported with the tool's own diagnostics.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Default timeout applied when the caller does not set one.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Errors that can occur while running an external command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to collect output of `{command}`: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("invalid tool command line: {0:?}")]
    InvalidCommandLine(String),
}

/// A configured tool, e.g. `ffmpeg` or `nice -n 10 /opt/ffmpeg/bin/ffmpeg`.
///
/// The command line is split with shell-word rules; the first word is the
/// program and the rest are prepended to every invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    program: String,
    base_args: Vec<String>,
}

impl ToolCommand {
    pub fn parse(command_line: &str) -> Result<Self, CommandError> {
        let mut words = shlex::split(command_line)
            .ok_or_else(|| CommandError::InvalidCommandLine(command_line.to_string()))?;
        if words.is_empty() {
            return Err(CommandError::InvalidCommandLine(command_line.to_string()));
        }
        let program = words.remove(0);
        Ok(Self {
            program,
            base_args: words,
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Start building an invocation of this tool.
    pub fn invocation(&self, timeout: Duration) -> ExternalCommand {
        ExternalCommand::new(&self.program)
            .args(self.base_args.iter().cloned())
            .timeout(timeout)
    }
}

/// Captured result of a finished process.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Both output streams, stdout first, for error reporting.
    pub fn combined_output(&self) -> String {
        let stdout = String::from_utf8_lossy(&self.stdout);
        let stderr = String::from_utf8_lossy(&self.stderr);
        let mut combined = String::with_capacity(stdout.len() + stderr.len() + 1);
        combined.push_str(stdout.trim());
        if !combined.is_empty() && !stderr.trim().is_empty() {
            combined.push('\n');
        }
        combined.push_str(stderr.trim());
        combined
    }
}

/// A single external process invocation.
#[derive(Debug, Clone)]
pub struct ExternalCommand {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ExternalCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    /// The assembled command line, quoted so it can be pasted into a shell.
    pub fn command_line(&self) -> String {
        let words = std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str));
        shlex::try_join(words).unwrap_or_else(|_| {
            std::iter::once(self.program.clone())
                .chain(self.args.iter().cloned())
                .collect::<Vec<_>>()
                .join(" ")
        })
    }

    /// Run the process to completion, bounded by the configured timeout.
    ///
    /// A process that outlives the timeout is killed when its handle is
    /// dropped.
    pub async fn run(&self) -> Result<CommandOutput, CommandError> {
        let command_line = self.command_line();
        debug!("Running: {}", command_line);

        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CommandError::Spawn {
                command: command_line.clone(),
                source,
            })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| CommandError::Io {
                command: command_line.clone(),
                source,
            })?,
            Err(_) => {
                return Err(CommandError::Timeout {
                    command: command_line,
                    timeout: self.timeout,
                })
            }
        };

        Ok(CommandOutput {
            status: output.status,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}
