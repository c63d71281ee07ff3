//! Reconciliation engine.
//!
//! `Engine::execute_run` takes a committed configuration and the previous
//! run state and returns the new run state, the reports of this run and an
//! overall outcome. Bundles run sequentially in dependency order; items run
//! sequentially within a bundle. Every item is observed before it is
//! touched, so the fingerprint map only ever skips work, it never decides
//! correctness.

pub mod order;
pub mod plan;

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use fleet_host::{HostFacts, HostProvider};
use fleet_state::{Fingerprint, ItemKey, Report, RunState, Severity};

use crate::config::AgentConfig;
use crate::control_plane::ControlPlane;
use crate::domain::bundle::{BundleKind, BundleMeta};
use crate::domain::committed::CommittedConfig;
use crate::domain::condition::Condition;
use crate::domain::error::AgentError;
use crate::domain::report::{ReportFactory, DEFAULT_LOG_MAX_BYTES};
use crate::executors::{
    dispatch_bundle, parse_meta, Applied, Bundle, BundleExecutor, ExecContext, ExecSettings,
    Observation, PackageCache, PackageLock, PlannedItem,
};
use crate::metrics::METRICS;
use crate::obs;

pub use order::{execution_order, Ordering};
pub use plan::{BundleDisposition, BundlePlan, ItemPlan, PlanAction, RunPlan};

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Overall result of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every executed item converged
    Success,
    /// At least one item, bundle or dependency failed
    PartialFailure,
    /// The run's time budget ran out
    Truncated,
    /// Shutdown interrupted the run
    Cancelled,
    /// The configuration could not be fetched; nothing was touched
    FetchFailed,
    /// The fetched document was unusable; nothing was touched
    ParseFailed,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::PartialFailure => "partial_failure",
            RunOutcome::Truncated => "truncated",
            RunOutcome::Cancelled => "cancelled",
            RunOutcome::FetchFailed => "fetch_failed",
            RunOutcome::ParseFailed => "parse_failed",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Success)
    }

    /// Whether the run's commit becomes `last_applied_commit_id`.
    pub fn advances_commit(&self) -> bool {
        matches!(self, RunOutcome::Success | RunOutcome::PartialFailure)
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to one bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleStatus {
    Succeeded,
    Failed { blocking: bool },
    /// Disabled or precondition false
    Skipped(String),
    /// A dependency failed in a blocking way
    Blocked(BundleKind),
    Invalid { reason: String, blocking: bool },
}

impl BundleStatus {
    /// Whether dependents of this bundle must be skipped.
    pub fn blocks_dependents(&self) -> bool {
        match self {
            BundleStatus::Failed { blocking } | BundleStatus::Invalid { blocking, .. } => *blocking,
            BundleStatus::Blocked(_) => true,
            BundleStatus::Succeeded | BundleStatus::Skipped(_) => false,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            BundleStatus::Failed { .. } | BundleStatus::Blocked(_) | BundleStatus::Invalid { .. }
        )
    }
}

/// Per-run item tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ItemCounts {
    pub unchanged: usize,
    pub adopted: usize,
    pub applied: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Everything `execute_run` produces.
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Previous state with this run's fingerprints, commit and timestamp
    pub state: RunState,
    /// Reports in creation order
    pub reports: Vec<Report>,
    pub outcome: RunOutcome,
    pub counts: ItemCounts,
    /// Bundles in execution order with their status
    pub bundles: Vec<(BundleKind, BundleStatus)>,
}

enum ItemOutcome {
    Unchanged,
    Adopted,
    Applied(Applied),
    Failed(AgentError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Deadline,
    Cancelled,
}

// ---------------------------------------------------------------------------
// Preparation shared by runs and plans
// ---------------------------------------------------------------------------

/// A bundle as found in the document, parsed or not.
pub(crate) struct Entry {
    pub meta: BundleMeta,
    pub bundle_commit_id: String,
    pub parsed: std::result::Result<(Bundle, Option<Condition>), String>,
}

pub(crate) struct Prepared {
    pub entries: BTreeMap<BundleKind, Entry>,
    pub ordering: Ordering,
}

pub(crate) fn prepare(config: &CommittedConfig) -> Prepared {
    let document = config.commit_id.as_str();
    let mut entries = BTreeMap::new();
    for (kind, payload) in &config.bundles {
        let meta = parse_meta(payload).unwrap_or_default();
        let parsed = Bundle::parse(*kind, payload, document).and_then(|bundle| {
            let condition = bundle
                .meta
                .condition
                .as_deref()
                .map(Condition::parse)
                .transpose()
                .map_err(|e| format!("condition: {e}"))?;
            Ok((bundle, condition))
        });
        let bundle_commit_id = meta
            .bundle_commit_id
            .clone()
            .unwrap_or_else(|| document.to_string());
        entries.insert(
            *kind,
            Entry {
                meta,
                bundle_commit_id,
                parsed,
            },
        );
    }
    let deps: BTreeMap<BundleKind, Vec<BundleKind>> = entries
        .iter()
        .map(|(kind, entry)| (*kind, entry.meta.dependencies()))
        .collect();
    let ordering = execution_order(&deps, |kind| config.order_hint(kind));
    Prepared { entries, ordering }
}

/// Whether a bundle runs, and if not, why.
pub(crate) enum Gate<'a> {
    Invalid(String),
    Skip(String),
    Blocked(BundleKind),
    Run(&'a Bundle),
}

pub(crate) fn gate<'a>(
    entry: &'a Entry,
    cyclic: bool,
    facts: &HostFacts,
    statuses: &BTreeMap<BundleKind, BundleStatus>,
) -> Gate<'a> {
    if cyclic {
        return Gate::Invalid("dependency cycle".to_string());
    }
    let (bundle, condition) = match &entry.parsed {
        Ok((bundle, condition)) => (bundle, condition),
        Err(reason) => return Gate::Invalid(reason.clone()),
    };
    if !bundle.meta.enabled {
        return Gate::Skip("disabled".to_string());
    }
    if let Some(condition) = condition {
        if !condition.evaluate(facts) {
            return Gate::Skip(format!(
                "condition `{}` is false",
                bundle.meta.condition.as_deref().unwrap_or_default()
            ));
        }
    }
    for dep in entry.meta.dependencies() {
        if statuses.get(&dep).is_some_and(BundleStatus::blocks_dependents) {
            return Gate::Blocked(dep);
        }
    }
    Gate::Run(bundle)
}

/// `requires` must name an earlier item of the same bundle.
pub(crate) fn check_requires<I>(planned: &[PlannedItem<I>]) -> std::result::Result<(), String> {
    let mut earlier: HashSet<&str> = HashSet::new();
    for item in planned {
        for required in &item.requires {
            if !earlier.contains(required.as_str()) {
                return Err(format!(
                    "{} requires {required:?}, which is not an earlier item",
                    item.key
                ));
            }
        }
        earlier.insert(&item.key);
    }
    Ok(())
}

fn interruption(deadline: Option<Instant>, cancel: &CancellationToken) -> Option<Interrupt> {
    if cancel.is_cancelled() {
        Some(Interrupt::Cancelled)
    } else if deadline.is_some_and(|d| Instant::now() >= d) {
        Some(Interrupt::Deadline)
    } else {
        None
    }
}

/// Run `fut` unless the run is cancelled or its deadline passes first.
/// Dropping the future on interruption kills any child process it owns.
async fn guarded<T>(
    fut: impl Future<Output = T>,
    deadline: Option<Instant>,
    cancel: &CancellationToken,
) -> std::result::Result<T, Interrupt> {
    let expiry = async {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Interrupt::Cancelled),
        _ = expiry => Err(Interrupt::Deadline),
        value = fut => Ok(value),
    }
}

async fn converge_item<E: BundleExecutor>(
    exec: &E,
    wire: &str,
    item: &PlannedItem<E::Item>,
    previous: Option<&Fingerprint>,
    session: &mut E::Session,
    ctx: &ExecContext<'_>,
) -> ItemOutcome {
    match exec.observe(item, previous, ctx).await {
        Err(err) => ItemOutcome::Failed(err),
        Ok(Observation::InSync) if previous == Some(&item.fingerprint) => ItemOutcome::Unchanged,
        Ok(Observation::InSync) => ItemOutcome::Adopted,
        Ok(Observation::Drifted(reason)) => {
            debug!(bundle = %wire, key = %item.key, reason = %reason, "drift detected");
            match exec.apply(item, session, ctx).await {
                Ok(applied) => ItemOutcome::Applied(applied),
                Err(err) => ItemOutcome::Failed(err),
            }
        }
    }
}

/// Mutable accumulator threaded through one run.
struct RunLedger {
    state: RunState,
    reports: Vec<Report>,
    counts: ItemCounts,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Owns the capability handles and the package cache for every run.
pub struct Engine {
    host: Arc<dyn HostProvider>,
    control: Arc<dyn ControlPlane>,
    packages: PackageCache,
    package_lock: PackageLock,
    settings: ExecSettings,
    log_max_bytes: usize,
    extra_facts: HostFacts,
}

impl Engine {
    pub fn new(host: Arc<dyn HostProvider>, control: Arc<dyn ControlPlane>) -> Self {
        Self {
            host,
            control,
            packages: PackageCache::default(),
            package_lock: PackageLock::global(),
            settings: ExecSettings::default(),
            log_max_bytes: DEFAULT_LOG_MAX_BYTES,
            extra_facts: HostFacts::new(),
        }
    }

    /// Engine tuned from agent configuration; operator labels become
    /// `label.<name>` facts.
    pub fn from_config(
        config: &AgentConfig,
        host: Arc<dyn HostProvider>,
        control: Arc<dyn ControlPlane>,
    ) -> Self {
        let settings = ExecSettings {
            download_concurrency: config.download_concurrency.max(1),
            package_lock_timeout: std::time::Duration::from_secs(config.package_lock_timeout_secs),
            compose_dir: config.compose_dir(),
            retry: config.retry.clone(),
        };
        let facts = config
            .labels
            .iter()
            .map(|(name, value)| (format!("label.{name}"), value.clone()))
            .collect();
        Self::new(host, control)
            .with_settings(settings)
            .with_package_cache(PackageCache::new(std::time::Duration::from_secs(
                config.package_cache_ttl_secs,
            )))
            .with_log_max_bytes(config.report_log_max_bytes)
            .with_facts(facts)
    }

    pub fn with_settings(mut self, settings: ExecSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_package_cache(mut self, cache: PackageCache) -> Self {
        self.packages = cache;
        self
    }

    pub fn with_package_lock(mut self, lock: PackageLock) -> Self {
        self.package_lock = lock;
        self
    }

    pub fn with_log_max_bytes(mut self, max: usize) -> Self {
        self.log_max_bytes = max;
        self
    }

    /// Facts merged over what the host reports.
    pub fn with_facts(mut self, facts: HostFacts) -> Self {
        self.extra_facts = facts;
        self
    }

    pub fn host(&self) -> &Arc<dyn HostProvider> {
        &self.host
    }

    pub fn control(&self) -> &Arc<dyn ControlPlane> {
        &self.control
    }

    pub fn log_max_bytes(&self) -> usize {
        self.log_max_bytes
    }

    pub(crate) fn context<'a>(&'a self, cancel: &'a CancellationToken) -> ExecContext<'a> {
        ExecContext {
            host: self.host.as_ref(),
            control: self.control.as_ref(),
            packages: &self.packages,
            package_lock: &self.package_lock,
            settings: &self.settings,
            cancel,
        }
    }

    pub(crate) async fn facts(&self) -> HostFacts {
        let mut facts = match self.host.facts().await {
            Ok(facts) => facts,
            Err(err) => {
                warn!(error = %err, "host facts unavailable; preconditions see no facts");
                HostFacts::new()
            }
        };
        facts.extend(self.extra_facts.clone());
        facts
    }

    /// Reconcile the host against `config`.
    ///
    /// `deadline` time-boxes the run; `cancel` stops it at the next item
    /// boundary (in-flight host calls are dropped). Items completed before
    /// an interruption keep their fingerprints; the interrupted item does
    /// not get one.
    pub async fn execute_run(
        &self,
        config: &CommittedConfig,
        previous: &RunState,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> RunResult {
        let facts = self.facts().await;
        let prepared = prepare(config);
        let factory = ReportFactory::new(config.commit_id.as_str(), self.log_max_bytes);
        let ctx = self.context(cancel);

        let mut ledger = RunLedger {
            state: previous.clone(),
            reports: Vec::new(),
            counts: ItemCounts::default(),
        };
        let mut statuses: BTreeMap<BundleKind, BundleStatus> = BTreeMap::new();
        let mut bundles = Vec::new();
        let mut interrupted = None;

        for kind in &prepared.ordering.order {
            if interrupted.is_none() {
                interrupted = interruption(deadline, cancel);
            }
            if interrupted.is_some() {
                break;
            }
            let Some(entry) = prepared.entries.get(kind) else {
                continue;
            };
            let wire = kind.wire_name();
            let cyclic = prepared.ordering.cyclic.contains(kind);

            let status = match gate(entry, cyclic, &facts, &statuses) {
                Gate::Invalid(reason) => {
                    ledger.reports.push(factory.report(
                        wire,
                        &entry.bundle_commit_id,
                        Severity::Err,
                        format!("invalid {wire} bundle: {reason}"),
                        "",
                        &["invalid"],
                    ));
                    BundleStatus::Invalid {
                        reason,
                        blocking: cyclic || entry.meta.blocking,
                    }
                }
                Gate::Skip(reason) => {
                    obs::emit_bundle_skipped(wire, &reason);
                    BundleStatus::Skipped(reason)
                }
                Gate::Blocked(dep) => {
                    ledger.reports.push(factory.report(
                        wire,
                        &entry.bundle_commit_id,
                        Severity::Warn,
                        format!("{wire} skipped: dependency {dep} did not succeed"),
                        "",
                        &["blocked"],
                    ));
                    BundleStatus::Blocked(dep)
                }
                Gate::Run(bundle) => {
                    let (status, stop) = dispatch_bundle!(&bundle.spec, exec => {
                        self.run_bundle(exec, bundle, &ctx, &factory, &mut ledger, deadline)
                            .await
                    });
                    interrupted = stop;
                    status
                }
            };
            statuses.insert(*kind, status.clone());
            bundles.push((*kind, status));
        }

        let outcome = match interrupted {
            Some(Interrupt::Deadline) => {
                let remaining = prepared.ordering.order.len() - bundles.len();
                ledger.reports.push(factory.report(
                    "agent",
                    "",
                    Severity::Crit,
                    format!(
                        "run truncated: time budget exhausted with {remaining} bundle(s) not started"
                    ),
                    "",
                    &["agent", "truncated"],
                ));
                RunOutcome::Truncated
            }
            Some(Interrupt::Cancelled) => RunOutcome::Cancelled,
            None if bundles.iter().any(|(_, s)| s.is_failure()) => RunOutcome::PartialFailure,
            None => RunOutcome::Success,
        };

        ledger.state.last_run_at = Some(chrono::Utc::now());
        if outcome.advances_commit() {
            ledger.state.last_applied_commit_id = Some(config.commit_id.clone());
        }

        RunResult {
            state: ledger.state,
            reports: ledger.reports,
            outcome,
            counts: ledger.counts,
            bundles,
        }
    }

    async fn run_bundle<E: BundleExecutor>(
        &self,
        exec: &E,
        bundle: &Bundle,
        ctx: &ExecContext<'_>,
        factory: &ReportFactory,
        ledger: &mut RunLedger,
        deadline: Option<Instant>,
    ) -> (BundleStatus, Option<Interrupt>) {
        let wire = bundle.kind.wire_name();
        let commit = bundle.bundle_commit_id.as_str();
        let blocking = bundle.meta.blocking;
        let failure = if exec.critical() {
            Severity::Crit
        } else {
            Severity::Err
        };

        let planned = match exec.plan() {
            Ok(planned) => planned,
            Err(err) => {
                let reason = err.to_string();
                ledger.reports.push(factory.report(
                    wire,
                    commit,
                    Severity::Err,
                    format!("invalid {wire} bundle: {reason}"),
                    "",
                    &["invalid"],
                ));
                return (BundleStatus::Invalid { reason, blocking }, None);
            }
        };
        if let Err(reason) = check_requires(&planned) {
            ledger.reports.push(factory.report(
                wire,
                commit,
                Severity::Err,
                format!("invalid {wire} bundle: {reason}"),
                "",
                &["invalid"],
            ));
            return (BundleStatus::Invalid { reason, blocking }, None);
        }

        let mut session = match guarded(exec.open(&planned, ctx), deadline, ctx.cancel).await {
            Err(stop) => return (BundleStatus::Failed { blocking }, Some(stop)),
            Ok(Err(err)) => {
                ledger.reports.push(factory.report(
                    wire,
                    commit,
                    failure,
                    format!("{wire} aborted: {err}"),
                    &err.log(),
                    &["setup_failed"],
                ));
                return (BundleStatus::Failed { blocking }, None);
            }
            Ok(Ok(session)) => session,
        };

        let mut not_converged: HashSet<&str> = HashSet::new();
        for item in &planned {
            if let Some(required) = item
                .requires
                .iter()
                .find(|r| not_converged.contains(r.as_str()))
            {
                not_converged.insert(&item.key);
                ledger.counts.skipped += 1;
                obs::emit_item_outcome(wire, &item.key, "skipped");
                ledger.reports.push(factory.report(
                    wire,
                    commit,
                    Severity::Warn,
                    format!("skipped {}: requires {required}, which did not converge", item.key),
                    "",
                    &["skipped"],
                ));
                continue;
            }

            let key = ItemKey::new(wire, &item.key);
            let previous = ledger.state.fingerprint(&key).cloned();
            let step = converge_item(exec, wire, item, previous.as_ref(), &mut session, ctx);
            let outcome = match guarded(step, deadline, ctx.cancel).await {
                Ok(outcome) => outcome,
                Err(stop) => {
                    debug!(bundle = %wire, key = %item.key, "item interrupted");
                    return (BundleStatus::Failed { blocking }, Some(stop));
                }
            };

            match outcome {
                ItemOutcome::Unchanged => {
                    ledger.counts.unchanged += 1;
                    obs::emit_item_outcome(wire, &item.key, "unchanged");
                }
                ItemOutcome::Adopted => {
                    ledger.state.record(key, item.fingerprint.clone());
                    ledger.counts.adopted += 1;
                    obs::emit_item_outcome(wire, &item.key, "adopted");
                }
                ItemOutcome::Applied(applied) => {
                    ledger.state.record(key, item.fingerprint.clone());
                    ledger.counts.applied += 1;
                    METRICS.inc_items_applied();
                    obs::emit_item_outcome(wire, &item.key, "applied");
                    ledger.reports.push(factory.report(
                        wire,
                        commit,
                        Severity::Info,
                        format!("applied {}: {}", item.key, applied.summary),
                        &applied.log,
                        &["applied"],
                    ));
                }
                ItemOutcome::Failed(err) => {
                    not_converged.insert(&item.key);
                    ledger.counts.failed += 1;
                    METRICS.inc_items_failed();
                    obs::emit_item_outcome(wire, &item.key, "failed");
                    ledger.reports.push(factory.report(
                        wire,
                        commit,
                        failure,
                        format!("failed {}: {err}", item.key),
                        &err.log(),
                        &["failed"],
                    ));
                }
            }
        }
        drop(session);

        // Items removed from the bundle no longer need a fingerprint.
        let planned_keys: HashSet<ItemKey> = planned
            .iter()
            .map(|item| ItemKey::new(wire, &item.key))
            .collect();
        let stale: Vec<ItemKey> = ledger
            .state
            .fingerprints_for_bundle(wire)
            .map(|(key, _)| key.clone())
            .filter(|key| !planned_keys.contains(key))
            .collect();
        for key in stale {
            ledger.state.forget(&key);
        }

        if not_converged.is_empty() {
            (BundleStatus::Succeeded, None)
        } else {
            (BundleStatus::Failed { blocking }, None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::fakes::MemoryControlPlane;
    use fleet_host::fakes::MemoryHost;
    use serde_json::json;

    fn engine() -> (Arc<MemoryHost>, Engine) {
        let host = Arc::new(MemoryHost::new());
        let engine = Engine::new(host.clone(), Arc::new(MemoryControlPlane::new()))
            .with_package_lock(PackageLock::new())
            .with_package_cache(PackageCache::new(std::time::Duration::ZERO));
        (host, engine)
    }

    fn config(value: serde_json::Value) -> CommittedConfig {
        CommittedConfig::from_value(value).unwrap()
    }

    #[test]
    fn requires_must_point_backwards() {
        let a = PlannedItem::new("a", Fingerprint::from_raw("1"), ());
        let b = PlannedItem::new("b", Fingerprint::from_raw("1"), ()).requiring(vec!["a".into()]);
        assert!(check_requires(&[a.clone(), b.clone()]).is_ok());
        assert!(check_requires(&[b, a]).is_err());
    }

    #[test]
    fn blocking_semantics() {
        assert!(BundleStatus::Failed { blocking: true }.blocks_dependents());
        assert!(!BundleStatus::Failed { blocking: false }.blocks_dependents());
        assert!(BundleStatus::Blocked(BundleKind::Software).blocks_dependents());
        assert!(!BundleStatus::Skipped("disabled".into()).blocks_dependents());
        assert!(!BundleStatus::Skipped("disabled".into()).is_failure());
    }

    #[tokio::test]
    async fn disabled_and_false_conditions_skip_silently() {
        let (host, engine) = engine();
        let cfg = config(json!({
            "commit_id": "c1",
            "settings": {"enabled": false, "items": [{"key": "hostname", "value": "x"}]},
            "users": {"condition": "os == \"windows\"", "items": [{"name": "deploy"}]}
        }));
        let result = engine
            .execute_run(&cfg, &RunState::new(), None, &CancellationToken::new())
            .await;
        assert_eq!(result.outcome, RunOutcome::Success);
        assert!(result.reports.is_empty());
        assert_eq!(host.mutation_count(), 0);
        assert_eq!(result.state.last_applied_commit_id.unwrap().as_str(), "c1");
    }

    #[tokio::test]
    async fn bad_condition_is_invalid() {
        let (_, engine) = engine();
        let cfg = config(json!({
            "commit_id": "c1",
            "users": {"condition": "os ==", "items": []}
        }));
        let result = engine
            .execute_run(&cfg, &RunState::new(), None, &CancellationToken::new())
            .await;
        assert_eq!(result.outcome, RunOutcome::PartialFailure);
        assert_eq!(result.reports.len(), 1);
        assert_eq!(result.reports[0].severity, Severity::Err);
        assert!(result.reports[0].text.contains("condition"));
    }

    #[tokio::test]
    async fn removed_items_lose_their_fingerprint() {
        let (_, engine) = engine();
        let cancel = CancellationToken::new();
        let two = config(json!({
            "commit_id": "c1",
            "settings": {"items": [
                {"key": "hostname", "value": "a"},
                {"key": "timezone", "value": "UTC"}
            ]}
        }));
        let first = engine.execute_run(&two, &RunState::new(), None, &cancel).await;
        assert_eq!(first.state.fingerprints.len(), 2);

        let one = config(json!({
            "commit_id": "c2",
            "settings": {"items": [{"key": "hostname", "value": "a"}]}
        }));
        let second = engine.execute_run(&one, &first.state, None, &cancel).await;
        assert_eq!(second.state.fingerprints.len(), 1);
        assert!(second
            .state
            .fingerprint(&ItemKey::new("settings", "hostname"))
            .is_some());
    }

    #[tokio::test]
    async fn cancelled_before_start_touches_nothing() {
        let (host, engine) = engine();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let cfg = config(json!({
            "commit_id": "c1",
            "settings": {"items": [{"key": "hostname", "value": "a"}]}
        }));
        let previous = RunState::new();
        let result = engine.execute_run(&cfg, &previous, None, &cancel).await;
        assert_eq!(result.outcome, RunOutcome::Cancelled);
        assert_eq!(host.mutation_count(), 0);
        assert!(result.state.last_applied_commit_id.is_none());
        assert!(result.reports.is_empty());
    }

    #[tokio::test]
    async fn labels_become_facts() {
        let host = Arc::new(MemoryHost::new());
        let agent_config = AgentConfig {
            labels: BTreeMap::from([("site".to_string(), "berlin".to_string())]),
            ..AgentConfig::default()
        };
        let engine = Engine::from_config(&agent_config, host.clone(), Arc::new(MemoryControlPlane::new()));
        let facts = engine.facts().await;
        assert_eq!(facts.get("label.site").map(String::as_str), Some("berlin"));
        assert_eq!(facts.get("os").map(String::as_str), Some("linux"));
    }
}
