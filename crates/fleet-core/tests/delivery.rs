//! Report delivery and persistence across agent restarts.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use fleet_core::control_plane::fakes::{DeliveryFailure, MemoryControlPlane};
use fleet_core::{
    manual_report, Agent, AgentConfig, Engine, PackageCache, PackageLock, RetryPolicy, RunOutcome,
    Trigger,
};
use fleet_host::fakes::MemoryHost;
use fleet_state::fakes::MemoryStateStore;
use fleet_state::Severity;

async fn agent(
    host: Arc<MemoryHost>,
    control: Arc<MemoryControlPlane>,
    store: Arc<MemoryStateStore>,
) -> Agent {
    let config = AgentConfig {
        retry: RetryPolicy::none(),
        ..AgentConfig::default()
    };
    let engine = Engine::from_config(&config, host.clone(), control.clone())
        .with_package_lock(PackageLock::new())
        .with_package_cache(PackageCache::new(Duration::ZERO));
    Agent::new(config, host, control, store)
        .await
        .unwrap()
        .with_engine(engine)
}

fn texts(control: &MemoryControlPlane) -> Vec<String> {
    control.delivered().into_iter().map(|r| r.text).collect()
}

#[tokio::test]
async fn manual_report_is_delivered_without_a_run() {
    let host = Arc::new(MemoryHost::new());
    let control = Arc::new(MemoryControlPlane::new());
    let agent = agent(host.clone(), control.clone(), Arc::new(MemoryStateStore::new())).await;

    let report = manual_report("custom", Severity::Crit, "disk full", Vec::new(), None);
    let summary = agent
        .inject_report(report, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.delivered, 1);
    assert_eq!(control.fetch_count(), 0);
    assert_eq!(host.mutation_count(), 0);
    let delivered = control.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].bundle, "custom");
    assert_eq!(delivered[0].severity, Severity::Crit);
    assert_eq!(delivered[0].text, "disk full");
}

#[tokio::test]
async fn manual_report_is_delivered_when_state_cannot_be_saved() {
    let host = Arc::new(MemoryHost::new());
    let control = Arc::new(MemoryControlPlane::new());
    let store = Arc::new(MemoryStateStore::new());
    let agent = agent(host, control.clone(), store.clone()).await;
    store.fail_next_saves(1);

    let report = manual_report("custom", Severity::Warn, "fan degraded", Vec::new(), None);
    let summary = agent
        .inject_report(report, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.delivered, 1);
    assert_eq!(texts(&control), vec!["fan degraded"]);
}

#[tokio::test]
async fn undelivered_reports_are_retried_once_each() {
    let host = Arc::new(MemoryHost::new());
    let control = Arc::new(MemoryControlPlane::with_document(json!({
        "commit_id": "c1",
        "settings": {"items": [
            {"key": "hostname", "value": "edge-1"},
            {"key": "timezone", "value": "UTC"}
        ]}
    })));
    let store = Arc::new(MemoryStateStore::new());
    let agent = agent(host, control.clone(), store.clone()).await;
    control.fail_next_deliveries(2, DeliveryFailure::Transport);
    let cancel = CancellationToken::new();

    let run = agent.run_once(Trigger::Tick, &cancel).await.unwrap();
    assert_eq!(run.outcome, RunOutcome::Success);
    assert_eq!(run.flush.delivered, 0);
    assert!(run.flush.error.is_some());
    assert!(!run.succeeded());
    assert_eq!(store.snapshot().pending_reports.len(), 2);

    // Second attempt also fails transiently.
    let retry = agent.pipeline().flush(&cancel).await.unwrap();
    assert_eq!(retry.remaining, 2);

    let last = agent.pipeline().flush(&cancel).await.unwrap();
    assert_eq!(last.delivered, 2);
    assert_eq!(
        texts(&control),
        vec![
            "applied hostname: hostname = edge-1",
            "applied timezone: timezone = UTC"
        ]
    );
    assert!(store.snapshot().pending_reports.is_empty());
}

#[tokio::test]
async fn pending_reports_survive_restart() {
    let host = Arc::new(MemoryHost::new());
    let store = Arc::new(MemoryStateStore::new());
    let cancel = CancellationToken::new();

    let offline = Arc::new(MemoryControlPlane::new());
    offline.fail_next_deliveries(usize::MAX, DeliveryFailure::Transport);
    let first = agent(host.clone(), offline.clone(), store.clone()).await;
    first
        .inject_report(
            manual_report("custom", Severity::Warn, "first", Vec::new(), None),
            &cancel,
        )
        .await
        .unwrap();
    first
        .inject_report(
            manual_report("custom", Severity::Warn, "second", Vec::new(), None),
            &cancel,
        )
        .await
        .unwrap();
    drop(first);
    assert!(offline.delivered().is_empty());

    let online = Arc::new(MemoryControlPlane::new());
    let restarted = agent(host, online.clone(), store.clone()).await;
    assert_eq!(restarted.pipeline().pending().await, 2);
    let summary = restarted.pipeline().flush(&cancel).await.unwrap();
    assert_eq!(summary.delivered, 2);
    assert_eq!(texts(&online), vec!["first", "second"]);
}

#[tokio::test]
async fn lost_state_save_is_recovered_by_adoption() {
    let host = Arc::new(MemoryHost::new());
    let control = Arc::new(MemoryControlPlane::with_document(json!({
        "commit_id": "c1",
        "settings": {"items": [{"key": "hostname", "value": "edge-1"}]}
    })));
    let store = Arc::new(MemoryStateStore::new());
    store.fail_next_saves(100);
    let cancel = CancellationToken::new();

    let first = agent(host.clone(), control.clone(), store.clone()).await;
    let run = first.run_once(Trigger::Tick, &cancel).await.unwrap();
    assert_eq!(run.counts.applied, 1);
    assert_eq!(host.mutation_count(), 1);
    assert!(store.snapshot().fingerprints.is_empty());
    drop(first);

    let restarted = agent(host.clone(), control, store).await;
    let run = restarted.run_once(Trigger::Tick, &cancel).await.unwrap();
    assert_eq!(run.counts.applied, 0);
    assert_eq!(run.counts.adopted, 1);
    assert_eq!(host.mutation_count(), 1);
}

#[tokio::test]
async fn corrupt_state_refuses_to_start() {
    let store = Arc::new(MemoryStateStore::new());
    store.mark_corrupt();
    let result = Agent::new(
        AgentConfig::default(),
        Arc::new(MemoryHost::new()),
        Arc::new(MemoryControlPlane::new()),
        store,
    )
    .await;
    let err = result.err().unwrap();
    assert!(err.is_fatal());
}
