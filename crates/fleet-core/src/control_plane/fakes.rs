//! In-memory control plane for tests
//!
//! Serves a settable document, records delivered batches, honours
//! conditional fetches and can be told to fail the next N calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use fleet_state::{CommitId, Report};

use crate::control_plane::{ControlPlane, FetchOutcome};
use crate::domain::error::{AgentError, Result};

/// What the next failing delivery returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFailure {
    /// Network error, retryable
    Transport,
    /// Permanent 4xx
    Rejected(u16),
    /// 401/403
    Unauthorized,
}

#[derive(Debug, Default)]
pub struct MemoryControlPlane {
    document: Mutex<Option<Value>>,
    delivered: Mutex<Vec<Vec<Report>>>,
    downloads: Mutex<HashMap<String, Vec<u8>>>,
    failing_fetches: AtomicUsize,
    failing_deliveries: Mutex<(usize, Option<DeliveryFailure>)>,
    fetches: AtomicUsize,
    not_modified: AtomicUsize,
    delivery_attempts: AtomicUsize,
    download_calls: AtomicUsize,
    download_delay: Mutex<Option<Duration>>,
    downloads_in_flight: AtomicUsize,
    peak_downloads: AtomicUsize,
}

impl MemoryControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(document: Value) -> Self {
        let cp = Self::default();
        cp.set_document(document);
        cp
    }

    pub fn set_document(&self, document: Value) {
        *self.document.lock().unwrap() = Some(document);
    }

    pub fn add_download(&self, url: &str, content: &[u8]) {
        self.downloads
            .lock()
            .unwrap()
            .insert(url.to_string(), content.to_vec());
    }

    /// Make every download sleep before answering.
    pub fn set_download_delay(&self, delay: Duration) {
        *self.download_delay.lock().unwrap() = Some(delay);
    }

    /// Fail the next `n` fetches with a transport error.
    pub fn fail_next_fetches(&self, n: usize) {
        self.failing_fetches.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` delivery attempts with `failure`.
    pub fn fail_next_deliveries(&self, n: usize, failure: DeliveryFailure) {
        *self.failing_deliveries.lock().unwrap() = (n, Some(failure));
    }

    /// Every report acknowledged so far, in delivery order.
    pub fn delivered(&self) -> Vec<Report> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .cloned()
            .collect()
    }

    pub fn batches(&self) -> Vec<Vec<Report>> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn not_modified_count(&self) -> usize {
        self.not_modified.load(Ordering::SeqCst)
    }

    pub fn delivery_attempts(&self) -> usize {
        self.delivery_attempts.load(Ordering::SeqCst)
    }

    pub fn download_count(&self) -> usize {
        self.download_calls.load(Ordering::SeqCst)
    }

    /// Most downloads ever in flight at once.
    pub fn peak_concurrent_downloads(&self) -> usize {
        self.peak_downloads.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ControlPlane for MemoryControlPlane {
    async fn fetch_config(&self, known: Option<&CommitId>) -> Result<FetchOutcome> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.failing_fetches) {
            return Err(AgentError::Transport("connection refused".into()));
        }
        let document = self
            .document
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| AgentError::Transport("HTTP 404: no configuration".into()))?;
        let current = document.get("commit_id").and_then(|c| c.as_str());
        if let (Some(known), Some(current)) = (known, current) {
            if known.as_str() == current {
                self.not_modified.fetch_add(1, Ordering::SeqCst);
                return Ok(FetchOutcome::NotModified);
            }
        }
        Ok(FetchOutcome::Modified(document))
    }

    async fn deliver_reports(&self, batch: &[Report]) -> Result<()> {
        self.delivery_attempts.fetch_add(1, Ordering::SeqCst);
        {
            let mut failing = self.failing_deliveries.lock().unwrap();
            if failing.0 > 0 {
                failing.0 -= 1;
                return Err(match failing.1.unwrap_or(DeliveryFailure::Transport) {
                    DeliveryFailure::Transport => AgentError::Transport("connection reset".into()),
                    DeliveryFailure::Rejected(status) => AgentError::Rejected {
                        status,
                        body: "rejected".into(),
                    },
                    DeliveryFailure::Unauthorized => {
                        AgentError::Fatal("control plane refused device credentials".into())
                    }
                });
            }
        }
        self.delivered.lock().unwrap().push(batch.to_vec());
        Ok(())
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.downloads_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_downloads.fetch_max(in_flight, Ordering::SeqCst);
        let delay = *self.download_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.downloads_in_flight.fetch_sub(1, Ordering::SeqCst);
        self.downloads
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| AgentError::Rejected {
                status: 404,
                body: format!("no such file: {url}"),
            })
    }
}
