//! External command execution with timeouts and failure classification.

use crate::error::{ExecError, ExecResult};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Bound for launches, deletes, snapshots and other long runtime calls.
pub const LONG_TIMEOUT: Duration = Duration::from_secs(300);

/// Bound for quick introspection reads.
pub const QUICK_TIMEOUT: Duration = Duration::from_secs(60);

/// Bound for graceful and forced shutdowns.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(120);

/// Exit code reported when the process was terminated by a signal.
pub const SIGNAL_EXIT_CODE: i32 = -1;

/// Successful output of a classified command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutput {
    /// Trimmed, non-empty stdout.
    Text(String),
    /// The command succeeded and printed nothing.
    NoOutput,
}

impl CommandOutput {
    pub fn text(&self) -> &str {
        match self {
            Self::Text(s) => s,
            Self::NoOutput => "",
        }
    }
}

/// Unclassified result of a finished process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RawOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Executes external commands.
///
/// `capture` is the only required method; `run` layers quoting-aware
/// splitting, exit-code classification and logging on top of it.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `argv` to completion within `timeout`, returning both streams and
    /// the exit code without judging success.
    async fn capture(&self, argv: &[String], timeout: Duration) -> ExecResult<RawOutput>;

    /// Run a shell-quoted command line and classify the outcome.
    async fn run(&self, command_line: &str, timeout: Duration) -> ExecResult<CommandOutput> {
        let argv = split_command(command_line)?;
        match self.capture(&argv, timeout).await {
            Ok(raw) => classify(command_line, raw),
            Err(e) => {
                error!(command = %command_line, error = %e, "runtime command did not complete");
                Err(e)
            }
        }
    }
}

/// Split a command line with shell quoting rules.
pub fn split_command(command_line: &str) -> ExecResult<Vec<String>> {
    let argv = shlex::split(command_line).ok_or_else(|| ExecError::InvalidCommand {
        command: command_line.to_string(),
        reason: "unbalanced quotes or trailing escape".to_string(),
    })?;
    if argv.is_empty() {
        return Err(ExecError::InvalidCommand {
            command: command_line.to_string(),
            reason: "empty command".to_string(),
        });
    }
    Ok(argv)
}

/// Render an argument vector back into a copy-pasteable command line.
pub fn display_command(argv: &[String]) -> String {
    shlex::try_join(argv.iter().map(String::as_str)).unwrap_or_else(|_| argv.join(" "))
}

/// Turn a finished process into a success value or a self-describing error.
pub fn classify(command_line: &str, raw: RawOutput) -> ExecResult<CommandOutput> {
    let stdout = raw.stdout.trim().to_string();
    let stderr = raw.stderr.trim().to_string();

    if !raw.success() {
        error!(
            command = %command_line,
            code = raw.code,
            stderr = %stderr,
            stdout = %stdout,
            "runtime command failed"
        );
        return Err(ExecError::CommandFailed {
            command: command_line.to_string(),
            code: raw.code,
            stdout,
            stderr,
        });
    }

    info!(command = %command_line, code = raw.code, stdout = %stdout, stderr = %stderr, "runtime command succeeded");
    if stdout.is_empty() {
        Ok(CommandOutput::NoOutput)
    } else {
        Ok(CommandOutput::Text(stdout))
    }
}

// ─── Process-backed runner ────────────────────────────────────────────────────

/// Runs commands as real child processes.
///
/// stdin is closed and both output streams are piped separately. A process
/// that outlives its timeout is killed when its handle is dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn capture(&self, argv: &[String], timeout: Duration) -> ExecResult<RawOutput> {
        let command = display_command(argv);
        let (program, args) = argv.split_first().ok_or_else(|| ExecError::InvalidCommand {
            command: command.clone(),
            reason: "empty command".to_string(),
        })?;

        debug!(command = %command, timeout_secs = timeout.as_secs(), "spawning runtime command");
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecError::Spawn { command: command.clone(), source })?;

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(RawOutput {
                code: output.status.code().unwrap_or(SIGNAL_EXIT_CODE),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
            Ok(Err(source)) => Err(ExecError::Spawn { command, source }),
            Err(_) => {
                warn!(command = %command, timeout_secs = timeout.as_secs(), "runtime command timed out, killing");
                Err(ExecError::Timeout { command, secs: timeout.as_secs() })
            }
        }
    }
}
