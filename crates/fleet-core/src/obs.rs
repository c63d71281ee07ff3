//! Structured lifecycle events for runs, items and report delivery.
//!
//! Every event carries an `event` field so log pipelines can filter on it
//! (`event=run.finished`, `event=item.applied`...).

use tracing::{debug, info, warn};

/// Span covering one reconciliation run.
///
/// Attach it to the run future with `tracing::Instrument` so every event
/// inside the run carries `run_id` and `commit_id`.
pub fn run_span(run_id: &str, trigger: &str) -> tracing::Span {
    tracing::info_span!("fleet.run", run_id = %run_id, trigger = %trigger)
}

pub fn emit_run_started(run_id: &str, commit_id: &str, bundles: usize) {
    info!(event = "run.started", run_id = %run_id, commit_id = %commit_id, bundles = bundles);
}

pub fn emit_run_finished(
    run_id: &str,
    outcome: &str,
    duration_ms: u64,
    applied: usize,
    failed: usize,
) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        outcome = %outcome,
        duration_ms = duration_ms,
        applied = applied,
        failed = failed,
    );
}

/// Per-item outcome. Unchanged items only log at DEBUG.
pub fn emit_item_outcome(bundle: &str, key: &str, outcome: &str) {
    match outcome {
        "unchanged" | "adopted" => {
            debug!(event = "item.outcome", bundle = %bundle, key = %key, outcome = %outcome)
        }
        "failed" | "skipped" => {
            warn!(event = "item.outcome", bundle = %bundle, key = %key, outcome = %outcome)
        }
        _ => info!(event = "item.outcome", bundle = %bundle, key = %key, outcome = %outcome),
    }
}

pub fn emit_bundle_skipped(bundle: &str, reason: &str) {
    debug!(event = "bundle.skipped", bundle = %bundle, reason = %reason);
}

pub fn emit_reports_flushed(delivered: usize, dropped: usize, remaining: usize) {
    info!(
        event = "reports.flushed",
        delivered = delivered,
        dropped = dropped,
        remaining = remaining,
    );
}

pub fn emit_delivery_error(error: &dyn std::fmt::Display, pending: usize) {
    warn!(event = "reports.delivery_failed", error = %error, pending = pending);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emitters_do_not_panic_without_subscriber() {
        let span = run_span("run-1", "tick");
        let _guard = span.enter();
        emit_run_started("run-1", "c-1", 3);
        emit_item_outcome("software", "nginx", "applied");
        emit_item_outcome("software", "curl", "unchanged");
        emit_bundle_skipped("firewall", "condition false");
        emit_reports_flushed(3, 0, 0);
        emit_delivery_error(&"connection refused", 3);
        emit_run_finished("run-1", "success", 12, 1, 0);
    }
}
