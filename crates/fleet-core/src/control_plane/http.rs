//! mTLS HTTP client for the control plane.

use std::path::Path;

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, IF_NONE_MATCH};
use reqwest::StatusCode;
use tracing::debug;

use fleet_state::{CommitId, Report};

use crate::config::AgentConfig;
use crate::control_plane::{encode_ndjson, ControlPlane, FetchOutcome};
use crate::domain::error::{AgentError, Result};

const USER_AGENT: &str = concat!("fleet-agent/", env!("CARGO_PKG_VERSION"));

/// Map a non-success status to the agent's error classes.
pub fn classify_status(status: StatusCode, body: String) -> AgentError {
    match status.as_u16() {
        401 | 403 => AgentError::Fatal(format!(
            "control plane refused device credentials (HTTP {})",
            status.as_u16()
        )),
        408 | 429 => AgentError::Transport(format!("HTTP {}", status.as_u16())),
        400..=499 => AgentError::Rejected {
            status: status.as_u16(),
            body,
        },
        _ => AgentError::Transport(format!("HTTP {}: {}", status.as_u16(), body)),
    }
}

fn read_pem(path: &Path, what: &str) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| AgentError::Fatal(format!("cannot read {what} {}: {e}", path.display())))
}

/// HTTP implementation of [`ControlPlane`].
///
/// Endpoints:
/// - `GET  {api_url}/devices/{device_id}/config`
/// - `POST {api_url}/devices/{device_id}/reports` (NDJSON body)
#[derive(Debug, Clone)]
pub struct HttpControlPlane {
    client: reqwest::Client,
    base_url: String,
    device_id: String,
}

impl HttpControlPlane {
    /// Build a client from agent configuration.
    ///
    /// Identity files that are configured but unreadable are fatal: without
    /// them the device cannot authenticate at all.
    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .user_agent(USER_AGENT)
            .timeout(config.http_timeout());

        match (&config.tls.client_cert, &config.tls.client_key) {
            (Some(cert), Some(key)) => {
                let mut pem = read_pem(cert, "client certificate")?;
                pem.push(b'\n');
                pem.extend(read_pem(key, "client key")?);
                let identity = reqwest::Identity::from_pem(&pem)
                    .map_err(|e| AgentError::Fatal(format!("invalid client identity: {e}")))?;
                builder = builder.identity(identity);
            }
            (None, None) => {}
            _ => {
                return Err(AgentError::Fatal(
                    "client_cert and client_key must be configured together".into(),
                ))
            }
        }

        if let Some(ca) = &config.tls.ca_cert {
            let cert = reqwest::Certificate::from_pem(&read_pem(ca, "CA certificate")?)
                .map_err(|e| AgentError::Fatal(format!("invalid CA certificate: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }

        let client = builder
            .build()
            .map_err(|e| AgentError::Config(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            device_id: config.device_id.clone(),
        })
    }

    pub fn config_url(&self) -> String {
        format!("{}/devices/{}/config", self.base_url, self.device_id)
    }

    pub fn reports_url(&self) -> String {
        format!("{}/devices/{}/reports", self.base_url, self.device_id)
    }

    /// Absolute URLs are used as-is; paths are resolved against the API.
    pub fn resolve(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}/{}", self.base_url, url.trim_start_matches('/'))
        }
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn fetch_config(&self, known: Option<&CommitId>) -> Result<FetchOutcome> {
        let mut request = self.client.get(self.config_url());
        if let Some(commit) = known {
            request = request.header(IF_NONE_MATCH, format!("\"{}\"", commit.as_str()));
        }
        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            debug!("config not modified");
            return Ok(FetchOutcome::NotModified);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }
        // A body that fails to arrive is transport; one that arrives but is
        // not JSON is a parse error.
        let bytes = response.bytes().await?;
        let document = serde_json::from_slice(&bytes)?;
        Ok(FetchOutcome::Modified(document))
    }

    async fn deliver_reports(&self, batch: &[Report]) -> Result<()> {
        let body = encode_ndjson(batch)?;
        let response = self
            .client
            .post(self.reports_url())
            .header(CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            debug!(count = batch.len(), "report batch acknowledged");
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, body))
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.client.get(self.resolve(url)).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }
        Ok(response.bytes().await?.to_vec())
    }
}
