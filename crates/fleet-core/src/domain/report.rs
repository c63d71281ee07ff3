//! Report construction helpers.

use fleet_state::{Report, Severity};

/// Default upper bound on a report's `log` field.
pub const DEFAULT_LOG_MAX_BYTES: usize = 16 * 1024;

/// Truncate `log` to at most `max_bytes` on a UTF-8 boundary, appending a
/// marker with the number of bytes dropped.
pub fn truncate_log(log: &str, max_bytes: usize) -> String {
    if log.len() <= max_bytes {
        return log.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !log.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…[truncated {} bytes]", &log[..end], log.len() - end)
}

/// Stamps reports with the commit they belong to.
#[derive(Debug, Clone)]
pub struct ReportFactory {
    commit_id: String,
    log_max_bytes: usize,
}

impl ReportFactory {
    pub fn new(commit_id: impl Into<String>, log_max_bytes: usize) -> Self {
        Self {
            commit_id: commit_id.into(),
            log_max_bytes,
        }
    }

    pub fn report(
        &self,
        bundle: &str,
        bundle_commit_id: &str,
        severity: Severity,
        text: impl Into<String>,
        log: &str,
        labels: &[&str],
    ) -> Report {
        Report {
            bundle: bundle.to_string(),
            bundle_commit_id: bundle_commit_id.to_string(),
            commit_id: self.commit_id.clone(),
            severity,
            text: text.into(),
            log: truncate_log(log, self.log_max_bytes),
            labels: labels.iter().map(|l| l.to_string()).collect(),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    /// Report not tied to a bundle (fetch failures, truncation notices).
    pub fn agent_report(&self, severity: Severity, text: impl Into<String>, log: &str) -> Report {
        self.report("agent", "", severity, text, log, &["agent"])
    }
}

/// A manual report injected by an operator.
pub fn manual_report(
    bundle: &str,
    severity: Severity,
    text: &str,
    labels: Vec<String>,
    commit_id: Option<&str>,
) -> Report {
    Report {
        bundle: bundle.to_string(),
        bundle_commit_id: String::new(),
        commit_id: commit_id.unwrap_or_default().to_string(),
        severity,
        text: text.to_string(),
        log: String::new(),
        labels,
        timestamp: chrono::Utc::now().timestamp(),
    }
}
