//! Process-wide counters for the agent.
//!
//! Counters are bumped at the call site and emitted together by
//! [`Metrics::flush`] at the end of every run.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lock-free counters.
pub struct Metrics {
    runs_started: AtomicU64,
    runs_failed: AtomicU64,
    items_applied: AtomicU64,
    items_failed: AtomicU64,
    reports_delivered: AtomicU64,
    reports_dropped: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub runs_started: u64,
    pub runs_failed: u64,
    pub items_applied: u64,
    pub items_failed: u64,
    pub reports_delivered: u64,
    pub reports_dropped: u64,
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            runs_started: AtomicU64::new(0),
            runs_failed: AtomicU64::new(0),
            items_applied: AtomicU64::new(0),
            items_failed: AtomicU64::new(0),
            reports_delivered: AtomicU64::new(0),
            reports_dropped: AtomicU64::new(0),
        }
    }

    pub fn inc_runs_started(&self) {
        self.runs_started.fetch_add(1, Ordering::Relaxed);
    }

    /// A run that ended in partial failure, truncation or a fetch error.
    pub fn inc_runs_failed(&self) {
        self.runs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_items_applied(&self) {
        self.items_applied.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "items_applied", "counter incremented");
    }

    pub fn inc_items_failed(&self) {
        self.items_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "items_failed", "counter incremented");
    }

    pub fn add_reports_delivered(&self, n: u64) {
        self.reports_delivered.fetch_add(n, Ordering::Relaxed);
    }

    /// Reports discarded for good (rejected by the control plane or
    /// evicted from a full queue).
    pub fn add_reports_dropped(&self, n: u64) {
        self.reports_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            runs_started: self.runs_started.load(Ordering::Relaxed),
            runs_failed: self.runs_failed.load(Ordering::Relaxed),
            items_applied: self.items_applied.load(Ordering::Relaxed),
            items_failed: self.items_failed.load(Ordering::Relaxed),
            reports_delivered: self.reports_delivered.load(Ordering::Relaxed),
            reports_dropped: self.reports_dropped.load(Ordering::Relaxed),
        }
    }

    /// Emit all current values as one `info!` event.
    pub fn flush(&self) {
        let s = self.snapshot();
        tracing::info!(
            metric = "flush",
            runs_started = s.runs_started,
            runs_failed = s.runs_failed,
            items_applied = s.items_applied,
            items_failed = s.items_failed,
            reports_delivered = s.reports_delivered,
            reports_dropped = s.reports_dropped,
        );
    }

    /// Zero every counter (tests).
    pub fn reset(&self) {
        self.runs_started.store(0, Ordering::Relaxed);
        self.runs_failed.store(0, Ordering::Relaxed);
        self.items_applied.store(0, Ordering::Relaxed);
        self.items_failed.store(0, Ordering::Relaxed);
        self.reports_delivered.store(0, Ordering::Relaxed);
        self.reports_dropped.store(0, Ordering::Relaxed);
    }
}
