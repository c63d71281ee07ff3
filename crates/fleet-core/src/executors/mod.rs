//! Bundle executors.
//!
//! One executor per [`BundleKind`]. Each turns its typed payload into an
//! ordered list of items with idempotence keys and desired-state
//! fingerprints, observes the host for drift, and converges drifted items
//! through the [`HostProvider`] capability interface. Executors never touch
//! run state; the engine decides what gets recorded.

pub mod compose;
pub mod containers;
pub mod files;
pub mod firewall;
pub mod remote_console;
pub mod services;
pub mod settings;
pub mod software;
pub mod users;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use fleet_host::HostProvider;
use fleet_state::Fingerprint;

use crate::control_plane::ControlPlane;
use crate::domain::bundle::{BundleKind, BundleMeta};
use crate::domain::error::Result;
use crate::retry::RetryPolicy;

pub use compose::ComposeBundle;
pub use containers::ContainerBundle;
pub use files::FileBundle;
pub use firewall::FirewallBundle;
pub use remote_console::RemoteConsoleBundle;
pub use services::ServiceBundle;
pub use settings::SettingsBundle;
pub use software::{PackageCache, PackageLock, SoftwareBundle};
pub use users::UserBundle;

/// What the host looks like relative to an item's desired state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    InSync,
    Drifted(String),
}

/// Successful convergence of one item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Applied {
    pub summary: String,
    pub log: String,
}

impl Applied {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            log: String::new(),
        }
    }

    pub fn with_log(mut self, log: impl Into<String>) -> Self {
        self.log = log.into();
        self
    }
}

/// One unit of work with its identity and desired-state fingerprint.
#[derive(Debug, Clone)]
pub struct PlannedItem<I> {
    /// Idempotence key, unique within the bundle
    pub key: String,
    pub fingerprint: Fingerprint,
    /// Keys of earlier items in the same bundle this one depends on
    pub requires: Vec<String>,
    pub item: I,
}

impl<I> PlannedItem<I> {
    pub fn new(key: impl Into<String>, fingerprint: Fingerprint, item: I) -> Self {
        Self {
            key: key.into(),
            fingerprint,
            requires: Vec::new(),
            item,
        }
    }

    pub fn requiring(mut self, requires: Vec<String>) -> Self {
        self.requires = requires;
        self
    }
}

/// Engine-wide knobs executors need.
#[derive(Debug, Clone)]
pub struct ExecSettings {
    pub download_concurrency: usize,
    pub package_lock_timeout: Duration,
    pub compose_dir: PathBuf,
    pub retry: RetryPolicy,
}

impl Default for ExecSettings {
    fn default() -> Self {
        Self {
            download_concurrency: 4,
            package_lock_timeout: Duration::from_secs(120),
            compose_dir: PathBuf::from("/var/lib/fleet/compose"),
            retry: RetryPolicy::default(),
        }
    }
}

/// Per-run handles passed to every executor call.
pub struct ExecContext<'a> {
    pub host: &'a dyn HostProvider,
    pub control: &'a dyn ControlPlane,
    pub packages: &'a PackageCache,
    pub package_lock: &'a PackageLock,
    pub settings: &'a ExecSettings,
    pub cancel: &'a CancellationToken,
}

/// Behaviour shared by every bundle executor.
#[async_trait]
pub trait BundleExecutor: Send + Sync {
    type Item: Send + Sync;
    /// Bundle-scoped resources held while items are applied
    type Session: Send;

    /// Checks beyond what deserialization enforces.
    fn validate(&self) -> std::result::Result<(), String>;

    /// Items in execution order.
    fn plan(&self) -> Result<Vec<PlannedItem<Self::Item>>>;

    /// Failures of critical bundles are reported as CRIT.
    fn critical(&self) -> bool {
        false
    }

    /// Acquire bundle-level resources. An error aborts the whole bundle.
    async fn open(
        &self,
        items: &[PlannedItem<Self::Item>],
        ctx: &ExecContext<'_>,
    ) -> Result<Self::Session>;

    /// Re-read actual host state for one item.
    async fn observe(
        &self,
        item: &PlannedItem<Self::Item>,
        previous: Option<&Fingerprint>,
        ctx: &ExecContext<'_>,
    ) -> Result<Observation>;

    /// Converge one drifted item.
    async fn apply(
        &self,
        item: &PlannedItem<Self::Item>,
        session: &mut Self::Session,
        ctx: &ExecContext<'_>,
    ) -> Result<Applied>;
}

/// A parsed bundle payload, one variant per [`BundleKind`].
#[derive(Debug, Clone)]
pub enum BundleSpec {
    FileDistribution(FileBundle),
    Software(SoftwareBundle),
    ProcessWatch(ServiceBundle),
    DockerContainers(ContainerBundle),
    ComposeProjects(ComposeBundle),
    Users(UserBundle),
    Firewall(FirewallBundle),
    Settings(SettingsBundle),
    RemoteConsole(RemoteConsoleBundle),
}

fn typed<T: DeserializeOwned>(payload: &Value) -> std::result::Result<T, String> {
    serde_json::from_value(payload.clone()).map_err(|e| e.to_string())
}

impl BundleSpec {
    pub fn parse(kind: BundleKind, payload: &Value) -> std::result::Result<Self, String> {
        Ok(match kind {
            BundleKind::FileDistribution => BundleSpec::FileDistribution(typed(payload)?),
            BundleKind::Software => BundleSpec::Software(typed(payload)?),
            BundleKind::ProcessWatch => BundleSpec::ProcessWatch(typed(payload)?),
            BundleKind::DockerContainers => BundleSpec::DockerContainers(typed(payload)?),
            BundleKind::ComposeProjects => BundleSpec::ComposeProjects(typed(payload)?),
            BundleKind::Users => BundleSpec::Users(typed(payload)?),
            BundleKind::Firewall => BundleSpec::Firewall(typed(payload)?),
            BundleKind::Settings => BundleSpec::Settings(typed(payload)?),
            BundleKind::RemoteConsole => BundleSpec::RemoteConsole(typed(payload)?),
        })
    }

    pub fn kind(&self) -> BundleKind {
        match self {
            BundleSpec::FileDistribution(_) => BundleKind::FileDistribution,
            BundleSpec::Software(_) => BundleKind::Software,
            BundleSpec::ProcessWatch(_) => BundleKind::ProcessWatch,
            BundleSpec::DockerContainers(_) => BundleKind::DockerContainers,
            BundleSpec::ComposeProjects(_) => BundleKind::ComposeProjects,
            BundleSpec::Users(_) => BundleKind::Users,
            BundleSpec::Firewall(_) => BundleKind::Firewall,
            BundleSpec::Settings(_) => BundleKind::Settings,
            BundleSpec::RemoteConsole(_) => BundleKind::RemoteConsole,
        }
    }
}

/// Expand `$body` once per variant with `$exec` bound to the executor.
macro_rules! dispatch_bundle {
    ($spec:expr, $exec:ident => $body:expr) => {
        match $spec {
            $crate::executors::BundleSpec::FileDistribution($exec) => $body,
            $crate::executors::BundleSpec::Software($exec) => $body,
            $crate::executors::BundleSpec::ProcessWatch($exec) => $body,
            $crate::executors::BundleSpec::DockerContainers($exec) => $body,
            $crate::executors::BundleSpec::ComposeProjects($exec) => $body,
            $crate::executors::BundleSpec::Users($exec) => $body,
            $crate::executors::BundleSpec::Firewall($exec) => $body,
            $crate::executors::BundleSpec::Settings($exec) => $body,
            $crate::executors::BundleSpec::RemoteConsole($exec) => $body,
        }
    };
}
pub(crate) use dispatch_bundle;

/// A bundle as the engine sees it: common metadata plus typed payload.
#[derive(Debug, Clone)]
pub struct Bundle {
    pub kind: BundleKind,
    pub meta: BundleMeta,
    pub bundle_commit_id: String,
    pub spec: BundleSpec,
}

/// Parse the common metadata, falling back to defaults when the payload is
/// too broken to read it.
pub fn parse_meta(payload: &Value) -> std::result::Result<BundleMeta, String> {
    if !payload.is_object() {
        return Err("bundle payload must be a JSON object".to_string());
    }
    typed(payload)
}

impl Bundle {
    /// Parse a raw bundle payload. Errors are validation errors for this
    /// bundle only.
    pub fn parse(
        kind: BundleKind,
        payload: &Value,
        document_commit: &str,
    ) -> std::result::Result<Self, String> {
        let meta = parse_meta(payload)?;
        let spec = BundleSpec::parse(kind, payload)?;
        dispatch_bundle!(&spec, exec => exec.validate())?;
        let bundle_commit_id = meta
            .bundle_commit_id
            .clone()
            .unwrap_or_else(|| document_commit.to_string());
        Ok(Self {
            kind,
            meta,
            bundle_commit_id,
            spec,
        })
    }
}

/// Parse a `0644`-style octal mode.
pub(crate) fn parse_mode(mode: &str) -> std::result::Result<u32, String> {
    let digits = mode.trim_start_matches("0o");
    if digits.is_empty() || digits.len() > 4 {
        return Err(format!("invalid mode {mode:?}"));
    }
    u32::from_str_radix(digits, 8).map_err(|_| format!("invalid mode {mode:?}"))
}

/// Reject duplicate item keys within one bundle.
pub(crate) fn unique_keys<'a>(
    keys: impl IntoIterator<Item = &'a str>,
) -> std::result::Result<(), String> {
    let mut seen = std::collections::HashSet::new();
    for key in keys {
        if key.is_empty() {
            return Err("item key must not be empty".to_string());
        }
        if !seen.insert(key) {
            return Err(format!("duplicate item {key:?}"));
        }
    }
    Ok(())
}
