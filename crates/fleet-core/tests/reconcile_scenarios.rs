//! End-to-end reconciliation scenarios against the in-memory host.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use fleet_core::control_plane::fakes::MemoryControlPlane;
use fleet_core::domain::digest::sha256_hex;
use fleet_core::{
    BundleKind, BundleStatus, CommittedConfig, Engine, ExecSettings, PackageCache, PackageLock,
    RetryPolicy, RunOutcome, RunResult,
};
use fleet_host::fakes::MemoryHost;
use fleet_state::{ItemKey, RunState, Severity};

struct Fixture {
    host: Arc<MemoryHost>,
    control: Arc<MemoryControlPlane>,
    engine: Engine,
    lock: PackageLock,
}

fn fixture() -> Fixture {
    let host = Arc::new(MemoryHost::new());
    let control = Arc::new(MemoryControlPlane::new());
    let lock = PackageLock::new();
    let engine = Engine::new(host.clone(), control.clone())
        .with_package_lock(lock.clone())
        .with_package_cache(PackageCache::new(Duration::ZERO))
        .with_settings(ExecSettings {
            package_lock_timeout: Duration::from_secs(2),
            retry: RetryPolicy::none(),
            ..ExecSettings::default()
        });
    Fixture {
        host,
        control,
        engine,
        lock,
    }
}

fn config(value: Value) -> CommittedConfig {
    CommittedConfig::from_value(value).unwrap()
}

async fn run(f: &Fixture, cfg: &CommittedConfig, previous: &RunState) -> RunResult {
    f.engine
        .execute_run(cfg, previous, None, &CancellationToken::new())
        .await
}

fn app_conf(commit: &str, content: &str) -> CommittedConfig {
    config(json!({
        "commit_id": commit,
        "file_distribution": {"items": [{"path": "/etc/app.conf", "content": content}]}
    }))
}

fn labelled<'a>(result: &'a RunResult, label: &str) -> Vec<&'a fleet_state::Report> {
    result
        .reports
        .iter()
        .filter(|r| r.labels.iter().any(|l| l == label))
        .collect()
}

#[tokio::test]
async fn file_applied_once_then_unchanged() {
    let f = fixture();
    let d1 = sha256_hex(b"listen 8080\n");
    let cfg = app_conf("c1", "listen 8080\n");

    let first = run(&f, &cfg, &RunState::new()).await;
    assert_eq!(first.outcome, RunOutcome::Success);
    assert_eq!(labelled(&first, "applied").len(), 1);
    assert_eq!(first.reports[0].severity, Severity::Info);
    assert_eq!(first.reports[0].bundle, "file_distribution");
    let key = ItemKey::new("file_distribution", "/etc/app.conf");
    let fp = first.state.fingerprint(&key).unwrap();
    assert!(fp.as_str().starts_with(&d1));

    let second = run(&f, &cfg, &first.state).await;
    assert!(second.reports.is_empty());
    assert_eq!(second.counts.unchanged, 1);
    assert_eq!(second.state.fingerprints, first.state.fingerprints);
    assert_eq!(f.host.mutation_count(), 1);
}

#[tokio::test]
async fn changed_digest_is_applied_and_recorded() {
    let f = fixture();
    let first = run(&f, &app_conf("c1", "v1"), &RunState::new()).await;
    let second = run(&f, &app_conf("c2", "v2"), &first.state).await;

    assert_eq!(labelled(&second, "applied").len(), 1);
    let key = ItemKey::new("file_distribution", "/etc/app.conf");
    let fp = second.state.fingerprint(&key).unwrap();
    assert!(fp.as_str().starts_with(&sha256_hex(b"v2")));
    assert_eq!(f.host.file_content("/etc/app.conf").unwrap(), b"v2");
    assert_eq!(second.state.last_applied_commit_id.unwrap().as_str(), "c2");
}

#[tokio::test]
async fn failing_package_does_not_stop_independent_files() {
    let f = fixture();
    f.host
        .fail_op("install_package", "could not get lock /var/lib/dpkg/lock-frontend");
    let cfg = config(json!({
        "commit_id": "c3",
        "software": {"items": [{"name": "nginx"}]},
        "file_distribution": {"items": [{"path": "/etc/app.conf", "content": "x"}]}
    }));

    let result = run(&f, &cfg, &RunState::new()).await;
    assert_eq!(result.outcome, RunOutcome::PartialFailure);

    let errors: Vec<_> = result
        .reports
        .iter()
        .filter(|r| r.severity == Severity::Err)
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].bundle, "software");
    assert!(errors[0].log.contains("dpkg"));

    let applied = labelled(&result, "applied");
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].bundle, "file_distribution");

    assert!(result
        .state
        .fingerprint(&ItemKey::new("file_distribution", "/etc/app.conf"))
        .is_some());
    assert!(result
        .state
        .fingerprint(&ItemKey::new("software", "nginx"))
        .is_none());
    // Partial failure still advances the commit.
    assert_eq!(result.state.last_applied_commit_id.unwrap().as_str(), "c3");
}

fn errors(result: &RunResult) -> Vec<&fleet_state::Report> {
    result
        .reports
        .iter()
        .filter(|r| r.severity == Severity::Err)
        .collect()
}

fn served(f: &Fixture, path: &str, content: &[u8]) -> Value {
    let url = format!("https://cdn.example{path}");
    f.control.add_download(&url, content);
    json!({"path": path, "url": url, "digest": sha256_hex(content)})
}

#[tokio::test]
async fn unreadable_file_fails_only_its_own_item() {
    let f = fixture();
    f.host
        .fail_target("read_file", "/etc/b.conf", "permission denied");
    let cfg = config(json!({
        "commit_id": "c4",
        "file_distribution": {"items": [
            {"path": "/etc/a.conf", "content": "a"},
            served(&f, "/etc/b.conf", b"b"),
        ]}
    }));

    let result = run(&f, &cfg, &RunState::new()).await;
    assert_eq!(result.outcome, RunOutcome::PartialFailure);
    assert_eq!(f.host.file_content("/etc/a.conf").unwrap(), b"a");
    assert_eq!(result.counts.applied, 1);
    assert_eq!(result.counts.failed, 1);

    let errors = errors(&result);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].text.starts_with("failed /etc/b.conf"));
}

#[tokio::test]
async fn failed_download_fails_only_its_own_item() {
    let f = fixture();
    let good = served(&f, "/opt/good.bin", b"good");
    let cfg = config(json!({
        "commit_id": "c5",
        "file_distribution": {"items": [
            {"path": "/opt/missing.bin", "url": "https://cdn.example/opt/missing.bin",
             "digest": sha256_hex(b"missing")},
            good,
        ]}
    }));

    let result = run(&f, &cfg, &RunState::new()).await;
    assert_eq!(result.outcome, RunOutcome::PartialFailure);
    assert_eq!(f.host.file_content("/opt/good.bin").unwrap(), b"good");
    assert!(f.host.file_content("/opt/missing.bin").is_none());

    let errors = errors(&result);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].text.contains("/opt/missing.bin"));
    assert!(errors[0].log.contains("404"));
}

#[tokio::test]
async fn digest_mismatch_is_an_item_failure() {
    let f = fixture();
    f.control
        .add_download("https://cdn.example/opt/app.bin", b"tampered");
    let cfg = config(json!({
        "commit_id": "c6",
        "file_distribution": {"items": [
            {"path": "/opt/app.bin", "url": "https://cdn.example/opt/app.bin",
             "digest": sha256_hex(b"release")},
            {"path": "/etc/app.conf", "content": "x"},
        ]}
    }));

    let result = run(&f, &cfg, &RunState::new()).await;
    assert_eq!(result.outcome, RunOutcome::PartialFailure);
    assert!(f.host.file_content("/opt/app.bin").is_none());
    assert!(f.host.file_content("/etc/app.conf").is_some());
    let errors = errors(&result);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].log.contains(&sha256_hex(b"release")));
    assert!(result
        .state
        .fingerprint(&ItemKey::new("file_distribution", "/opt/app.bin"))
        .is_none());
}

#[tokio::test]
async fn post_command_output_is_reported() {
    let f = fixture();
    f.host
        .set_command_output("nginx", "configuration file test is successful");
    let cfg = config(json!({
        "commit_id": "c7",
        "file_distribution": {"items": [
            {"path": "/etc/nginx/nginx.conf", "content": "worker_processes 2;",
             "post_command": ["nginx", "-s", "reload"]}
        ]}
    }));

    let result = run(&f, &cfg, &RunState::new()).await;
    assert_eq!(result.outcome, RunOutcome::Success);
    assert_eq!(f.host.commands(), vec![vec!["nginx", "-s", "reload"]]);
    let applied = labelled(&result, "applied");
    assert_eq!(applied.len(), 1);
    assert!(applied[0].log.contains("test is successful"));

    let again = run(&f, &cfg, &result.state).await;
    assert_eq!(again.counts.unchanged, 1);
    assert_eq!(f.host.commands().len(), 1);
}

#[tokio::test]
async fn failed_post_command_is_retried_next_run() {
    let f = fixture();
    f.host.fail_target("run_command", "nginx", "reload failed");
    let cfg = config(json!({
        "commit_id": "c8",
        "file_distribution": {"items": [
            {"path": "/etc/nginx/nginx.conf", "content": "worker_processes 2;",
             "post_command": ["nginx", "-s", "reload"]}
        ]}
    }));

    let first = run(&f, &cfg, &RunState::new()).await;
    assert_eq!(first.outcome, RunOutcome::PartialFailure);
    assert_eq!(first.counts.failed, 1);

    f.host.clear_failures();
    let second = run(&f, &cfg, &first.state).await;
    assert_eq!(second.outcome, RunOutcome::Success);
    assert_eq!(second.counts.applied, 1);
    assert_eq!(second.counts.adopted, 0);
    assert_eq!(f.host.commands().len(), 2);
    assert!(second
        .state
        .fingerprint(&ItemKey::new("file_distribution", "/etc/nginx/nginx.conf"))
        .is_some());
}

#[tokio::test(start_paused = true)]
async fn held_package_lock_aborts_only_the_software_bundle() {
    let f = fixture();
    let _held = f.lock.acquire(Duration::from_secs(1)).await.unwrap();
    let cfg = config(json!({
        "commit_id": "c4",
        "software": {"items": [{"name": "nginx"}, {"name": "curl"}]},
        "settings": {"items": [{"key": "timezone", "value": "UTC"}]}
    }));

    let result = run(&f, &cfg, &RunState::new()).await;
    assert_eq!(result.outcome, RunOutcome::PartialFailure);
    let setup = labelled(&result, "setup_failed");
    assert_eq!(setup.len(), 1);
    assert_eq!(setup[0].severity, Severity::Err);
    assert!(labelled(&result, "failed").is_empty());
    assert_eq!(labelled(&result, "applied").len(), 1);
    assert_eq!(f.host.package_version("nginx", None), None);
}

#[tokio::test]
async fn failed_item_skips_only_items_that_require_it() {
    let f = fixture();
    f.host.fail_target("write_file", "/etc/nginx/nginx.conf", "disk full");
    let cfg = config(json!({
        "commit_id": "c5",
        "file_distribution": {"items": [
            {"path": "/etc/nginx/nginx.conf", "content": "worker_processes 2;"},
            {"path": "/etc/nginx/conf.d/site.conf", "content": "server {}", "requires": ["/etc/nginx/nginx.conf"]},
            {"path": "/etc/motd", "content": "managed"}
        ]}
    }));

    let result = run(&f, &cfg, &RunState::new()).await;
    assert_eq!(labelled(&result, "failed").len(), 1);
    let skipped = labelled(&result, "skipped");
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].severity, Severity::Warn);
    assert!(skipped[0].text.contains("site.conf"));
    assert_eq!(f.host.file_content("/etc/motd").unwrap(), b"managed");
    assert_eq!(result.counts.applied, 1);
    assert_eq!(result.counts.skipped, 1);
}

#[tokio::test]
async fn firewall_failures_are_critical() {
    let f = fixture();
    f.host.fail_op("apply_firewall", "iptables-restore: line 3 failed");
    let cfg = config(json!({
        "commit_id": "c6",
        "firewall": {"default_policy": "drop", "rules": [{"port": 22}]}
    }));
    let result = run(&f, &cfg, &RunState::new()).await;
    assert_eq!(result.reports.len(), 1);
    assert_eq!(result.reports[0].severity, Severity::Crit);
}

#[tokio::test]
async fn invalid_bundle_reports_once_and_siblings_proceed() {
    let f = fixture();
    let cfg = config(json!({
        "commit_id": "c7",
        "software": {"items": [{"version": "1.0"}]},
        "settings": {"items": [{"key": "hostname", "value": "edge-7"}]},
        "inventory": {"collect": true}
    }));
    let result = run(&f, &cfg, &RunState::new()).await;
    assert_eq!(result.outcome, RunOutcome::PartialFailure);
    let invalid = labelled(&result, "invalid");
    assert_eq!(invalid.len(), 1);
    assert_eq!(invalid[0].bundle, "software");
    assert_eq!(invalid[0].severity, Severity::Err);
    assert_eq!(labelled(&result, "applied").len(), 1);
    assert_eq!(cfg.ignored, vec!["inventory"]);
}

#[tokio::test]
async fn blocking_failure_skips_dependents_with_warning() {
    let f = fixture();
    f.host.fail_op("install_package", "repository unreachable");
    let cfg = config(json!({
        "commit_id": "c8",
        "software": {"blocking": true, "items": [{"name": "nginx"}]},
        "process_watch": {"depends_on": ["software"], "items": [{"name": "nginx", "state": "running"}]},
        "compose_projects": {"depends_on": ["process_watch"], "items": []},
        "settings": {"items": [{"key": "hostname", "value": "edge-8"}]}
    }));

    let result = run(&f, &cfg, &RunState::new()).await;
    let status = |kind| {
        result
            .bundles
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, s)| s.clone())
            .unwrap()
    };
    assert_eq!(status(BundleKind::Software), BundleStatus::Failed { blocking: true });
    assert_eq!(
        status(BundleKind::ProcessWatch),
        BundleStatus::Blocked(BundleKind::Software)
    );
    assert_eq!(
        status(BundleKind::ComposeProjects),
        BundleStatus::Blocked(BundleKind::ProcessWatch)
    );
    assert_eq!(status(BundleKind::Settings), BundleStatus::Succeeded);

    let blocked = labelled(&result, "blocked");
    assert_eq!(blocked.len(), 2);
    assert!(blocked.iter().all(|r| r.severity == Severity::Warn));
    assert!(!f.host.mutations().iter().any(|m| m.starts_with("set_service_state")));
}

#[tokio::test]
async fn non_blocking_failure_lets_dependents_run() {
    let f = fixture();
    f.host.fail_op("install_package", "repository unreachable");
    f.host.seed_service("nginx", false, false);
    let cfg = config(json!({
        "commit_id": "c9",
        "software": {"items": [{"name": "nginx"}]},
        "process_watch": {"depends_on": ["software"], "items": [{"name": "nginx", "state": "running"}]}
    }));
    let result = run(&f, &cfg, &RunState::new()).await;
    let order: Vec<BundleKind> = result.bundles.iter().map(|(k, _)| *k).collect();
    assert_eq!(order, vec![BundleKind::Software, BundleKind::ProcessWatch]);
    assert_eq!(result.bundles[1].1, BundleStatus::Succeeded);
}

#[tokio::test]
async fn dependency_cycle_invalidates_its_members() {
    let f = fixture();
    let cfg = config(json!({
        "commit_id": "c10",
        "users": {"depends_on": ["settings"], "items": []},
        "settings": {"depends_on": ["users"], "items": []},
        "firewall": {"rules": []}
    }));
    let result = run(&f, &cfg, &RunState::new()).await;
    let invalid = labelled(&result, "invalid");
    assert_eq!(invalid.len(), 2);
    assert!(invalid.iter().all(|r| r.text.contains("cycle")));
    assert_eq!(result.bundles[0].0, BundleKind::Firewall);
}

#[tokio::test]
async fn external_drift_is_repaired_despite_matching_fingerprint() {
    let f = fixture();
    let cfg = config(json!({
        "commit_id": "c11",
        "process_watch": {"items": [{"name": "sshd", "state": "running"}]}
    }));
    f.host.seed_service("sshd", false, true);
    let first = run(&f, &cfg, &RunState::new()).await;
    assert_eq!(first.counts.applied, 1);

    f.host.stop_service_externally("sshd");
    let second = run(&f, &cfg, &first.state).await;
    assert_eq!(second.counts.applied, 1);
    assert_eq!(labelled(&second, "applied").len(), 1);
}

#[tokio::test]
async fn pre_converged_host_is_adopted_silently() {
    let f = fixture();
    f.host.seed_setting("hostname", "edge-12");
    let cfg = config(json!({
        "commit_id": "c12",
        "settings": {"items": [{"key": "hostname", "value": "edge-12"}]}
    }));
    let result = run(&f, &cfg, &RunState::new()).await;
    assert!(result.reports.is_empty());
    assert_eq!(result.counts.adopted, 1);
    assert_eq!(f.host.mutation_count(), 0);
    assert!(result
        .state
        .fingerprint(&ItemKey::new("settings", "hostname"))
        .is_some());
}

#[tokio::test(start_paused = true)]
async fn deadline_truncates_run_and_keeps_completed_items() {
    let f = fixture();
    f.host.set_op_delay(Duration::from_secs(3));
    let cfg = config(json!({
        "commit_id": "c13",
        "settings": {"items": [
            {"key": "hostname", "value": "edge-13"},
            {"key": "timezone", "value": "UTC"},
            {"key": "sysctl.vm.swappiness", "value": "10"}
        ]},
        "users": {"items": [{"name": "deploy"}]}
    }));
    let deadline = Instant::now() + Duration::from_secs(5);
    let result = f
        .engine
        .execute_run(&cfg, &RunState::new(), Some(deadline), &CancellationToken::new())
        .await;

    assert_eq!(result.outcome, RunOutcome::Truncated);
    let crit: Vec<_> = result
        .reports
        .iter()
        .filter(|r| r.severity == Severity::Crit)
        .collect();
    assert_eq!(crit.len(), 1);
    assert!(crit[0].labels.contains(&"truncated".to_string()));

    assert!(result
        .state
        .fingerprint(&ItemKey::new("settings", "hostname"))
        .is_some());
    assert!(result
        .state
        .fingerprint(&ItemKey::new("settings", "timezone"))
        .is_none());
    assert_eq!(f.host.mutation_count(), 1);
    assert!(result.state.last_applied_commit_id.is_none());
}

#[tokio::test(start_paused = true)]
async fn cancellation_mid_item_commits_nothing_for_that_item() {
    let f = fixture();
    f.host.set_op_delay(Duration::from_secs(10));
    let cfg = config(json!({
        "commit_id": "c14",
        "settings": {"items": [{"key": "hostname", "value": "edge-14"}]}
    }));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let result = f.engine.execute_run(&cfg, &RunState::new(), None, &cancel).await;
    assert_eq!(result.outcome, RunOutcome::Cancelled);
    assert!(result.state.fingerprints.is_empty());
    assert_eq!(f.host.mutation_count(), 0);
    assert!(result.reports.is_empty());
}

#[tokio::test]
async fn bundle_commit_id_is_stamped_on_reports() {
    let f = fixture();
    let cfg = config(json!({
        "commit_id": "doc-1",
        "settings": {"bundle_commit_id": "settings-9", "items": [{"key": "timezone", "value": "UTC"}]},
        "users": {"items": [{"name": "deploy"}]}
    }));
    let result = run(&f, &cfg, &RunState::new()).await;
    for report in &result.reports {
        assert_eq!(report.commit_id, "doc-1");
        match report.bundle.as_str() {
            "settings" => assert_eq!(report.bundle_commit_id, "settings-9"),
            _ => assert_eq!(report.bundle_commit_id, "doc-1"),
        }
    }
    assert_eq!(result.reports.len(), 2);
}
