//! Report pipeline: pending ledger, batching and at-least-once delivery.
//!
//! Reports live in `RunState::pending_reports` from the moment they are
//! enqueued until the control plane acknowledges the batch that carried
//! them, so a restart re-sends whatever was not acknowledged. Each entry
//! carries a sequence number; acknowledgement removes exactly the
//! delivered sequence numbers.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use fleet_state::{QueuedReport, Report};

use crate::config::AgentConfig;
use crate::control_plane::ControlPlane;
use crate::domain::error::{AgentError, Result};
use crate::metrics::METRICS;
use crate::obs;
use crate::retry::{with_backoff, RetryPolicy};
use crate::state::StateKeeper;

/// What one flush achieved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushSummary {
    /// Reports acknowledged by the control plane
    pub delivered: usize,
    /// Reports dropped after a permanent rejection
    pub dropped: usize,
    /// Reports still pending
    pub remaining: usize,
    /// Why delivery stopped early; the remaining reports stay queued
    pub error: Option<String>,
}

impl FlushSummary {
    pub fn is_complete(&self) -> bool {
        self.error.is_none() && self.dropped == 0
    }
}

pub struct ReportPipeline {
    keeper: Arc<StateKeeper>,
    control: Arc<dyn ControlPlane>,
    batch_size: usize,
    max_pending: usize,
    retry: RetryPolicy,
    flush_lock: Mutex<()>,
}

impl ReportPipeline {
    pub fn new(keeper: Arc<StateKeeper>, control: Arc<dyn ControlPlane>) -> Self {
        Self {
            keeper,
            control,
            batch_size: 100,
            max_pending: 10_000,
            retry: RetryPolicy::default(),
            flush_lock: Mutex::new(()),
        }
    }

    pub fn from_config(
        config: &AgentConfig,
        keeper: Arc<StateKeeper>,
        control: Arc<dyn ControlPlane>,
    ) -> Self {
        Self::new(keeper, control)
            .with_batch_size(config.report_batch_size)
            .with_max_pending(config.max_pending_reports)
            .with_retry(config.retry.clone())
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Append reports to the ledger in order. Not persisted until the next
    /// state save. Returns how many old reports were dropped to make room.
    pub async fn enqueue(&self, reports: impl IntoIterator<Item = Report>) -> usize {
        let max_pending = self.max_pending;
        let dropped = self
            .keeper
            .mutate(|state| {
                let mut dropped = 0;
                for report in reports {
                    if state.pending_reports.len() >= max_pending {
                        state.pending_reports.remove(0);
                        dropped += 1;
                    }
                    let seq = state.next_report_seq;
                    state.next_report_seq += 1;
                    state.pending_reports.push(QueuedReport { seq, report });
                }
                dropped
            })
            .await;
        if dropped > 0 {
            warn!(
                dropped = dropped,
                max_pending = max_pending,
                "report ledger full; oldest reports dropped"
            );
            METRICS.add_reports_dropped(dropped as u64);
        }
        dropped
    }

    pub async fn pending(&self) -> usize {
        self.keeper.read(|s| s.pending_reports.len()).await
    }

    /// Deliver pending reports oldest first, one batch at a time.
    ///
    /// Transport failures stop the flush and leave the rest queued. A
    /// permanently rejected batch is dropped. Only fatal errors (lost
    /// credentials, corrupt storage) are returned as `Err`.
    pub async fn flush(&self, cancel: &CancellationToken) -> Result<FlushSummary> {
        let _serial = self.flush_lock.lock().await;
        let mut summary = FlushSummary::default();

        loop {
            let batch: Vec<QueuedReport> = self
                .keeper
                .read(|s| {
                    s.pending_reports
                        .iter()
                        .take(self.batch_size)
                        .cloned()
                        .collect()
                })
                .await;
            if batch.is_empty() {
                break;
            }
            let seqs: HashSet<u64> = batch.iter().map(|q| q.seq).collect();
            let reports: Vec<Report> = batch.into_iter().map(|q| q.report).collect();

            let delivery = with_backoff(&self.retry, cancel, "report delivery", || {
                self.control.deliver_reports(&reports)
            })
            .await;

            match delivery {
                Ok(()) => {
                    summary.delivered += reports.len();
                    METRICS.add_reports_delivered(reports.len() as u64);
                    self.acknowledge(&seqs).await?;
                }
                Err(AgentError::Rejected { status, body }) => {
                    error!(
                        status = status,
                        body = %body,
                        reports = reports.len(),
                        "report batch rejected; dropping it"
                    );
                    summary.dropped += reports.len();
                    METRICS.add_reports_dropped(reports.len() as u64);
                    self.acknowledge(&seqs).await?;
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    let pending = self.pending().await;
                    obs::emit_delivery_error(&err, pending);
                    summary.error = Some(err.to_string());
                    break;
                }
            }
        }

        summary.remaining = self.pending().await;
        obs::emit_reports_flushed(summary.delivered, summary.dropped, summary.remaining);
        Ok(summary)
    }

    /// Remove `seqs` from the ledger and persist. A failed save is logged
    /// only: the worst case is a re-delivery after a crash.
    async fn acknowledge(&self, seqs: &HashSet<u64>) -> Result<()> {
        let saved = self
            .keeper
            .update(|state| state.pending_reports.retain(|q| !seqs.contains(&q.seq)))
            .await;
        match saved {
            Ok(()) => Ok(()),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                warn!(error = %err, "could not persist report acknowledgement");
                Ok(())
            }
        }
    }

    /// Flush every `period` until `cancel` fires.
    pub fn spawn_flusher(self: Arc<Self>, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; the run flushes on its own.
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if self.pending().await == 0 {
                    continue;
                }
                if let Err(err) = self.flush(&cancel).await {
                    error!(error = %err, "background report flush stopped");
                    break;
                }
            }
        })
    }
}
