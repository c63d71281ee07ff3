//! Agent error taxonomy.
//!
//! Classes map to how far an error may propagate:
//! - transport: aborts the current fetch or flush, retried on the next tick
//! - parse / validation: aborts the run or a single bundle
//! - execution: confined to one item
//! - fatal: stops the agent loop

use fleet_host::HostError;
use fleet_state::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Network failure or retryable server response
    #[error("transport error: {0}")]
    Transport(String),

    /// Control plane refused a request permanently (4xx)
    #[error("rejected by control plane (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },

    /// The configuration document itself is unusable
    #[error("config parse error: {0}")]
    Parse(String),

    /// A bundle payload is malformed
    #[error("invalid {bundle} bundle: {reason}")]
    Validation { bundle: String, reason: String },

    /// An item could not be converged
    #[error("{message}")]
    Execution { message: String, log: String },

    /// Requires operator intervention (credentials lost, state corrupt)
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    #[error("host error: {0}")]
    Host(#[from] HostError),

    /// Agent configuration is invalid
    #[error("configuration error: {0}")]
    Config(String),

    #[error("cancelled")]
    Cancelled,
}

impl AgentError {
    /// Whether the agent loop must stop.
    pub fn is_fatal(&self) -> bool {
        match self {
            AgentError::Fatal(_) => true,
            AgentError::Store(e) => e.is_corruption(),
            _ => false,
        }
    }

    /// Whether a local retry with backoff may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AgentError::Transport(_))
    }

    pub fn execution(message: impl Into<String>) -> Self {
        AgentError::Execution {
            message: message.into(),
            log: String::new(),
        }
    }

    /// Captured output for a report's `log` field.
    pub fn log(&self) -> String {
        match self {
            AgentError::Host(e) => e.log(),
            AgentError::Execution { log, .. } => log.clone(),
            _ => String::new(),
        }
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        AgentError::Parse(err.to_string())
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        AgentError::Transport(err.to_string())
    }
}

/// Result type for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;
