//! Package management.
//!
//! Installed packages are read through a TTL cache owned by the engine and
//! invalidated after every install or removal. The whole bundle runs under
//! the process-wide package lock, since package managers cannot run
//! concurrently.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::debug;

use fleet_host::{HostProvider, InstalledPackage};
use fleet_state::Fingerprint;

use crate::domain::error::{AgentError, Result};
use crate::executors::{
    unique_keys, Applied, BundleExecutor, ExecContext, Observation, PlannedItem,
};

/// Version meaning "whatever the repository offers".
pub const LATEST: &str = "latest";

fn default_version() -> String {
    LATEST.to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageState {
    #[default]
    Installed,
    Absent,
}

impl PackageState {
    fn as_str(&self) -> &'static str {
        match self {
            PackageState::Installed => "installed",
            PackageState::Absent => "absent",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageItem {
    pub name: String,
    #[serde(default)]
    pub arch: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub state: PackageState,
}

impl PackageItem {
    pub fn key(&self) -> String {
        match &self.arch {
            Some(arch) => format!("{}.{}", self.name, arch),
            None => self.name.clone(),
        }
    }

    fn pinned(&self) -> Option<&str> {
        (self.version != LATEST).then_some(self.version.as_str())
    }

    fn matches(&self, pkg: &InstalledPackage) -> bool {
        pkg.name == self.name
            && match (&self.arch, &pkg.arch) {
                (Some(want), Some(have)) => want == have,
                (Some(_), None) => false,
                (None, _) => true,
            }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftwareBundle {
    #[serde(default)]
    pub items: Vec<PackageItem>,
}

// ---------------------------------------------------------------------------
// Cache and lock
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Snapshot {
    taken: Instant,
    packages: Arc<Vec<InstalledPackage>>,
}

/// TTL-bounded snapshot of the host's installed packages.
///
/// Cheap to clone; clones share the snapshot.
#[derive(Debug, Clone)]
pub struct PackageCache {
    ttl: Duration,
    inner: Arc<Mutex<Option<Snapshot>>>,
}

impl PackageCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Arc::new(Mutex::new(None)),
        }
    }

    /// Installed packages, refreshed from the host when the snapshot is
    /// missing or older than the TTL.
    pub async fn get(&self, host: &dyn HostProvider) -> Result<Arc<Vec<InstalledPackage>>> {
        let mut slot = self.inner.lock().await;
        if let Some(snapshot) = slot.as_ref() {
            if snapshot.taken.elapsed() < self.ttl {
                return Ok(Arc::clone(&snapshot.packages));
            }
        }
        debug!("refreshing installed package list");
        let packages = Arc::new(host.installed_packages().await?);
        *slot = Some(Snapshot {
            taken: Instant::now(),
            packages: Arc::clone(&packages),
        });
        Ok(packages)
    }

    /// Forget the snapshot; called after every package mutation.
    pub async fn invalidate(&self) {
        *self.inner.lock().await = None;
    }
}

impl Default for PackageCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

/// Mutual exclusion for package-manager invocations.
#[derive(Debug, Clone, Default)]
pub struct PackageLock(Arc<Mutex<()>>);

static GLOBAL_PACKAGE_LOCK: OnceLock<PackageLock> = OnceLock::new();

impl PackageLock {
    /// A private lock, for tests and embedded engines.
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock shared by every engine in this process.
    pub fn global() -> Self {
        GLOBAL_PACKAGE_LOCK.get_or_init(PackageLock::new).clone()
    }

    /// Acquire the lock or give up after `timeout`.
    pub async fn acquire(&self, timeout: Duration) -> Result<OwnedMutexGuard<()>> {
        tokio::time::timeout(timeout, Arc::clone(&self.0).lock_owned())
            .await
            .map_err(|_| {
                AgentError::execution(format!(
                    "package manager lock not acquired within {}s",
                    timeout.as_secs()
                ))
            })
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

#[async_trait]
impl BundleExecutor for SoftwareBundle {
    type Item = PackageItem;
    type Session = OwnedMutexGuard<()>;

    fn validate(&self) -> std::result::Result<(), String> {
        let keys: Vec<String> = self.items.iter().map(PackageItem::key).collect();
        unique_keys(keys.iter().map(String::as_str))?;
        for item in &self.items {
            if item.name.trim().is_empty() || item.name.contains(char::is_whitespace) {
                return Err(format!("invalid package name {:?}", item.name));
            }
            if item.version.trim().is_empty() {
                return Err(format!("{}: empty version", item.name));
            }
        }
        Ok(())
    }

    fn plan(&self) -> Result<Vec<PlannedItem<PackageItem>>> {
        Ok(self
            .items
            .iter()
            .map(|item| {
                let fingerprint =
                    Fingerprint::from_raw(format!("{}:{}", item.state.as_str(), item.version));
                PlannedItem::new(item.key(), fingerprint, item.clone())
            })
            .collect())
    }

    async fn open(
        &self,
        _items: &[PlannedItem<PackageItem>],
        ctx: &ExecContext<'_>,
    ) -> Result<OwnedMutexGuard<()>> {
        ctx.package_lock
            .acquire(ctx.settings.package_lock_timeout)
            .await
    }

    async fn observe(
        &self,
        planned: &PlannedItem<PackageItem>,
        _previous: Option<&Fingerprint>,
        ctx: &ExecContext<'_>,
    ) -> Result<Observation> {
        let item = &planned.item;
        let installed = ctx.packages.get(ctx.host).await?;
        let current = installed.iter().find(|pkg| item.matches(pkg));
        Ok(match (item.state, current) {
            (PackageState::Absent, None) => Observation::InSync,
            (PackageState::Absent, Some(pkg)) => {
                Observation::Drifted(format!("{} {} is installed", pkg.name, pkg.version))
            }
            (PackageState::Installed, None) => Observation::Drifted("not installed".into()),
            (PackageState::Installed, Some(pkg)) => match item.pinned() {
                Some(version) if version != pkg.version => Observation::Drifted(format!(
                    "installed {} differs from {}",
                    pkg.version, version
                )),
                _ => Observation::InSync,
            },
        })
    }

    async fn apply(
        &self,
        planned: &PlannedItem<PackageItem>,
        _lock: &mut OwnedMutexGuard<()>,
        ctx: &ExecContext<'_>,
    ) -> Result<Applied> {
        let item = &planned.item;
        let result = match item.state {
            PackageState::Installed => {
                ctx.host
                    .install_package(&item.name, item.arch.as_deref(), item.pinned())
                    .await
            }
            PackageState::Absent => {
                ctx.host
                    .remove_package(&item.name, item.arch.as_deref())
                    .await
            }
        };
        // a failed transaction may still have changed the package set
        ctx.packages.invalidate().await;
        result?;

        Ok(Applied::new(match item.state {
            PackageState::Installed => format!("installed {} {}", item.key(), item.version),
            PackageState::Absent => format!("removed {}", item.key()),
        }))
    }
}
