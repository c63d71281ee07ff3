//! Error types for fleet-host

use thiserror::Error;

use crate::types::CommandOutput;

/// Errors that can occur while talking to the host
#[derive(Error, Debug)]
pub enum HostError {
    /// A command ran and exited non-zero
    #[error("command `{command}` failed with exit code {}", .output.exit_code)]
    CommandFailed {
        command: String,
        output: CommandOutput,
    },

    /// A command did not finish in time
    #[error("command `{command}` timed out after {timeout_secs}s")]
    Timeout { command: String, timeout_secs: u64 },

    /// The executable could not be started
    #[error("failed to spawn `{command}`: {reason}")]
    Spawn { command: String, reason: String },

    /// Requested object does not exist on the host
    #[error("not found: {0}")]
    NotFound(String),

    /// The host cannot perform this operation
    #[error("unsupported on this host: {0}")]
    Unsupported(String),

    /// Tool output could not be parsed
    #[error("unexpected output: {0}")]
    Parse(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure injected by a test fake
    #[error("{op} failed: {message}")]
    Injected { op: String, message: String },
}

impl HostError {
    /// Captured command output, for inclusion in a report's `log` field.
    pub fn log(&self) -> String {
        match self {
            HostError::CommandFailed { output, .. } => output.combined(),
            HostError::Injected { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

impl From<serde_json::Error> for HostError {
    fn from(err: serde_json::Error) -> Self {
        HostError::Parse(err.to_string())
    }
}
