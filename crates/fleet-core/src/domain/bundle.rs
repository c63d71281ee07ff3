//! Bundle kinds and the metadata common to every bundle.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Closed set of configuration domains the agent knows how to converge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleKind {
    FileDistribution,
    Software,
    ProcessWatch,
    DockerContainers,
    ComposeProjects,
    Users,
    Firewall,
    Settings,
    RemoteConsole,
}

impl BundleKind {
    pub const ALL: [BundleKind; 9] = [
        BundleKind::FileDistribution,
        BundleKind::Software,
        BundleKind::ProcessWatch,
        BundleKind::DockerContainers,
        BundleKind::ComposeProjects,
        BundleKind::Users,
        BundleKind::Firewall,
        BundleKind::Settings,
        BundleKind::RemoteConsole,
    ];

    /// Name used as the bundle's key in the configuration document.
    pub fn wire_name(&self) -> &'static str {
        match self {
            BundleKind::FileDistribution => "file_distribution",
            BundleKind::Software => "software",
            BundleKind::ProcessWatch => "process_watch",
            BundleKind::DockerContainers => "docker_containers",
            BundleKind::ComposeProjects => "compose_projects",
            BundleKind::Users => "users",
            BundleKind::Firewall => "firewall",
            BundleKind::Settings => "settings",
            BundleKind::RemoteConsole => "remote_console",
        }
    }

    pub fn from_wire(name: &str) -> Option<BundleKind> {
        Self::ALL.into_iter().find(|k| k.wire_name() == name)
    }
}

impl fmt::Display for BundleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

impl FromStr for BundleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_wire(s).ok_or_else(|| format!("unknown bundle type: {s}"))
    }
}

fn default_true() -> bool {
    true
}

/// Fields every bundle payload may carry next to its own schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleMeta {
    /// Commit of this bundle's payload; defaults to the document commit
    #[serde(default)]
    pub bundle_commit_id: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Precondition evaluated against host facts
    #[serde(default)]
    pub condition: Option<String>,
    /// Bundle types that must run first
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// When set, a failure of this bundle skips its dependents
    #[serde(default)]
    pub blocking: bool,
}

impl Default for BundleMeta {
    fn default() -> Self {
        Self {
            bundle_commit_id: None,
            enabled: true,
            condition: None,
            depends_on: Vec::new(),
            blocking: false,
        }
    }
}

impl BundleMeta {
    /// Dependencies naming known bundle kinds. Unknown names are dropped.
    pub fn dependencies(&self) -> Vec<BundleKind> {
        let mut deps: Vec<BundleKind> = self
            .depends_on
            .iter()
            .filter_map(|name| BundleKind::from_wire(name))
            .collect();
        deps.sort();
        deps.dedup();
        deps
    }
}
