//! Agent configuration.
//!
//! Resolution order: built-in defaults, then the JSON config file, then
//! `FLEET_*` environment variables, then command-line flags (applied by the
//! binaries).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::error::{AgentError, Result};
use crate::domain::report::DEFAULT_LOG_MAX_BYTES;
use crate::retry::RetryPolicy;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/fleet/agent.json";
pub const DEFAULT_STATE_DIR: &str = "/var/lib/fleet";

/// mTLS material, all PEM files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub client_cert: Option<PathBuf>,
    #[serde(default)]
    pub client_key: Option<PathBuf>,
    /// Extra trust anchor for the control plane
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub api_url: String,
    pub device_id: String,
    pub state_dir: PathBuf,
    pub tls: TlsConfig,
    pub run_interval_secs: u64,
    /// Runs are cut off this long before the next one is due
    pub run_timeout_margin_secs: u64,
    pub report_batch_size: usize,
    pub max_pending_reports: usize,
    pub report_flush_interval_secs: u64,
    pub http_timeout_secs: u64,
    pub retry: RetryPolicy,
    pub download_concurrency: usize,
    pub package_cache_ttl_secs: u64,
    pub package_lock_timeout_secs: u64,
    pub report_log_max_bytes: usize,
    /// Where compose files are written; `<state_dir>/compose` when unset
    pub compose_dir: Option<PathBuf>,
    /// Operator labels exposed to preconditions as `label.<name>`
    pub labels: std::collections::BTreeMap<String, String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            device_id: String::new(),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            tls: TlsConfig::default(),
            run_interval_secs: 900,
            run_timeout_margin_secs: 30,
            report_batch_size: 100,
            max_pending_reports: 10_000,
            report_flush_interval_secs: 60,
            http_timeout_secs: 30,
            retry: RetryPolicy::default(),
            download_concurrency: 4,
            package_cache_ttl_secs: 300,
            package_lock_timeout_secs: 120,
            report_log_max_bytes: DEFAULT_LOG_MAX_BYTES,
            compose_dir: None,
            labels: Default::default(),
        }
    }
}

impl AgentConfig {
    /// Read a JSON config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                AgentError::Config(format!("{}: {e}", path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(AgentError::Config(format!("{}: {e}", path.display()))),
        }
    }

    /// Overlay `FLEET_*` variables from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    /// Overlay variables from an arbitrary source.
    pub fn apply_vars(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = get("FLEET_API_URL") {
            self.api_url = v;
        }
        if let Some(v) = get("FLEET_DEVICE_ID") {
            self.device_id = v;
        }
        if let Some(v) = get("FLEET_STATE_DIR") {
            self.state_dir = PathBuf::from(v);
        }
        if let Some(v) = get("FLEET_CLIENT_CERT") {
            self.tls.client_cert = Some(PathBuf::from(v));
        }
        if let Some(v) = get("FLEET_CLIENT_KEY") {
            self.tls.client_key = Some(PathBuf::from(v));
        }
        if let Some(v) = get("FLEET_CA_CERT") {
            self.tls.ca_cert = Some(PathBuf::from(v));
        }
        if let Some(v) = get("FLEET_RUN_INTERVAL_SECS") {
            self.run_interval_secs = v.parse().map_err(|_| {
                AgentError::Config(format!("FLEET_RUN_INTERVAL_SECS is not a number: {v}"))
            })?;
        }
        Ok(())
    }

    /// Settings needed for any run, local or remote.
    pub fn validate_local(&self) -> Result<()> {
        if self.run_interval_secs == 0 {
            return Err(AgentError::Config("run_interval_secs must be > 0".into()));
        }
        if self.run_timeout_margin_secs >= self.run_interval_secs {
            return Err(AgentError::Config(
                "run_timeout_margin_secs must be smaller than run_interval_secs".into(),
            ));
        }
        if self.report_batch_size == 0 {
            return Err(AgentError::Config("report_batch_size must be > 0".into()));
        }
        if self.max_pending_reports < self.report_batch_size {
            return Err(AgentError::Config(
                "max_pending_reports must be at least report_batch_size".into(),
            ));
        }
        if self.download_concurrency == 0 {
            return Err(AgentError::Config("download_concurrency must be > 0".into()));
        }
        Ok(())
    }

    /// Full validation for talking to the control plane.
    pub fn validate(&self) -> Result<()> {
        self.validate_local()?;
        if self.api_url.trim().is_empty() {
            return Err(AgentError::Config("api_url is required".into()));
        }
        if !(self.api_url.starts_with("https://") || self.api_url.starts_with("http://")) {
            return Err(AgentError::Config(format!(
                "api_url must be an http(s) URL: {}",
                self.api_url
            )));
        }
        if self.device_id.trim().is_empty() {
            return Err(AgentError::Config("device_id is required".into()));
        }
        Ok(())
    }

    pub fn run_interval(&self) -> Duration {
        Duration::from_secs(self.run_interval_secs)
    }

    /// Time box of one run: interval minus safety margin.
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(
            self.run_interval_secs
                .saturating_sub(self.run_timeout_margin_secs)
                .max(1),
        )
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.report_flush_interval_secs.max(1))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn compose_dir(&self) -> PathBuf {
        self.compose_dir
            .clone()
            .unwrap_or_else(|| self.state_dir.join("compose"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn valid() -> AgentConfig {
        AgentConfig {
            api_url: "https://fleet.example.com/api/v1".into(),
            device_id: "dev-42".into(),
            ..AgentConfig::default()
        }
    }

    #[test]
    fn defaults() {
        let c = AgentConfig::default();
        assert_eq!(c.run_interval_secs, 900);
        assert_eq!(c.report_batch_size, 100);
        assert_eq!(c.max_pending_reports, 10_000);
        assert_eq!(c.run_timeout(), Duration::from_secs(870));
        assert_eq!(c.compose_dir(), PathBuf::from("/var/lib/fleet/compose"));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.json");
        std::fs::write(
            &path,
            r#"{"api_url": "https://cp", "device_id": "d1", "run_interval_secs": 60, "retry": {"max_attempts": 5}}"#,
        )
        .unwrap();
        let c = AgentConfig::load(&path).unwrap();
        assert_eq!(c.run_interval_secs, 60);
        assert_eq!(c.retry.max_attempts, 5);
        assert_eq!(c.retry.backoff_base_ms, 500);
        assert_eq!(c.download_concurrency, 4);
    }

    #[test]
    fn missing_file_is_default_and_bad_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            AgentConfig::load(&dir.path().join("absent.json")).unwrap(),
            AgentConfig::default()
        );
        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{not json").unwrap();
        assert!(matches!(
            AgentConfig::load(&bad),
            Err(AgentError::Config(_))
        ));
    }

    #[test]
    fn env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("FLEET_API_URL", "https://other"),
            ("FLEET_DEVICE_ID", "dev-7"),
            ("FLEET_RUN_INTERVAL_SECS", "120"),
            ("FLEET_CLIENT_CERT", "/etc/fleet/device.crt"),
        ]
        .into_iter()
        .collect();
        let mut c = valid();
        c.apply_vars(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(c.api_url, "https://other");
        assert_eq!(c.device_id, "dev-7");
        assert_eq!(c.run_interval_secs, 120);
        assert_eq!(
            c.tls.client_cert.as_deref(),
            Some(Path::new("/etc/fleet/device.crt"))
        );

        let mut c = valid();
        let err = c
            .apply_vars(|k| (k == "FLEET_RUN_INTERVAL_SECS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }

    #[test]
    fn validation() {
        assert!(valid().validate().is_ok());
        assert!(AgentConfig::default().validate().is_err());
        assert!(AgentConfig::default().validate_local().is_ok());

        let mut c = valid();
        c.run_timeout_margin_secs = c.run_interval_secs;
        assert!(c.validate().is_err());

        let mut c = valid();
        c.report_batch_size = 0;
        assert!(c.validate().is_err());

        let mut c = valid();
        c.api_url = "ftp://nope".into();
        assert!(c.validate().is_err());
    }
}
