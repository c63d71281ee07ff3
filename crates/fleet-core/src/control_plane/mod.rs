//! Client side of the control-plane API.
//!
//! - `ControlPlane`: fetch config, deliver report batches, download files
//! - `HttpControlPlane`: mTLS HTTP implementation
//! - `fakes::MemoryControlPlane`: in-memory implementation for tests

pub mod fakes;
pub mod http;

use async_trait::async_trait;
use serde_json::Value;

use fleet_state::{CommitId, Report};

use crate::domain::error::Result;

pub use http::HttpControlPlane;

/// Result of a conditional config fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// A document different from the one we already have
    Modified(Value),
    /// The cached document is still current
    NotModified,
}

/// Error classes every implementation must map to:
/// - network failure, 408, 429, 5xx: `AgentError::Transport` (retryable)
/// - 401, 403: `AgentError::Fatal`
/// - any other 4xx: `AgentError::Rejected`
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Fetch the device's committed configuration. `known` is the commit
    /// the agent already holds, if any.
    async fn fetch_config(&self, known: Option<&CommitId>) -> Result<FetchOutcome>;

    /// Deliver one batch. Success acknowledges the whole batch.
    async fn deliver_reports(&self, batch: &[Report]) -> Result<()>;

    /// Download file content referenced by a bundle.
    async fn download(&self, url: &str) -> Result<Vec<u8>>;
}

/// Render a batch as newline-delimited JSON.
pub fn encode_ndjson(batch: &[Report]) -> Result<String> {
    let mut body = String::new();
    for report in batch {
        body.push_str(&serde_json::to_string(report)?);
        body.push('\n');
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_state::Severity;

    #[test]
    fn ndjson_one_object_per_line() {
        let report = Report {
            bundle: "custom".into(),
            bundle_commit_id: String::new(),
            commit_id: String::new(),
            severity: Severity::Crit,
            text: "disk full".into(),
            log: String::new(),
            labels: vec![],
            timestamp: 1,
        };
        let body = encode_ndjson(&[report.clone(), report]).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: Report = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.severity, Severity::Crit);
        assert!(body.ends_with('\n'));
    }
}
