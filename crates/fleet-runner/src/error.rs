//! Runner error types

use thiserror::Error;

/// Marker embedded in failure messages when the runtime wrote nothing to stderr.
pub const EMPTY_STDERR: &str = "Unknown error (empty stderr)";

/// Outcome of an external command that did not succeed.
///
/// Every variant carries the literal command so the message alone is enough
/// for an operator to diagnose the failure.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("invalid command line '{command}': {reason}")]
    InvalidCommand { command: String, reason: String },

    #[error("failed to launch '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "command timed out after {secs} seconds - container may be unresponsive, try a manual stop or a longer timeout. Command: {command}"
    )]
    Timeout { command: String, secs: u64 },

    #[error("{}. Command: {command}. Exit code: {code}. STDOUT: {stdout}", or_marker(.stderr))]
    CommandFailed {
        command: String,
        code: i32,
        stdout: String,
        stderr: String,
    },
}

impl ExecError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// The command line this error was raised for.
    pub fn command(&self) -> &str {
        match self {
            Self::InvalidCommand { command, .. }
            | Self::Spawn { command, .. }
            | Self::Timeout { command, .. }
            | Self::CommandFailed { command, .. } => command,
        }
    }
}

fn or_marker(stderr: &str) -> &str {
    if stderr.is_empty() { EMPTY_STDERR } else { stderr }
}

pub type ExecResult<T> = Result<T, ExecError>;
