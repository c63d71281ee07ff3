//! Persisted records: run state, fingerprints and the report ledger.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Current on-disk schema version of [`RunState`].
pub const STATE_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Opaque identifier of one version of a device's full configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitId(String);

impl CommitId {
    pub fn new(id: impl Into<String>) -> Self {
        CommitId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 chars) for log lines.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(12)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Idempotence key of one item: `<bundle>:<item key>`.
///
/// Keys are namespaced by bundle so two bundles may use the same item name
/// (e.g. a package and a service both called `nginx`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemKey(String);

impl ItemKey {
    pub fn new(bundle: &str, key: &str) -> Self {
        ItemKey(format!("{bundle}:{key}"))
    }

    /// The bundle part of the key.
    pub fn bundle(&self) -> &str {
        self.0.split_once(':').map(|(b, _)| b).unwrap_or("")
    }

    /// The item part of the key.
    pub fn item(&self) -> &str {
        self.0.split_once(':').map(|(_, k)| k).unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Deterministic identifier of an item's desired state.
///
/// Either a readable composite (`"<digest>:0644:root:root"`, `"installed:1.2.3"`)
/// or a SHA-256 hex digest of a canonical rendering, depending on the bundle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Use a literal value as the fingerprint.
    pub fn from_raw(value: impl Into<String>) -> Self {
        Fingerprint(value.into())
    }

    /// SHA-256 hex digest of `data`.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Fingerprint(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Report severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warn,
    Err,
    Crit,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Err => "ERR",
            Severity::Crit => "CRIT",
        }
    }

    /// Whether a report of this severity represents a failure.
    pub fn is_failure(&self) -> bool {
        matches!(self, Severity::Err | Severity::Crit)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Severity {
    /// Parse a severity name, accepting the long spellings too.
    pub fn parse(s: &str) -> Option<Severity> {
        match s.to_ascii_uppercase().as_str() {
            "INFO" => Some(Severity::Info),
            "WARN" | "WARNING" => Some(Severity::Warn),
            "ERR" | "ERROR" => Some(Severity::Err),
            "CRIT" | "CRITICAL" => Some(Severity::Crit),
            _ => None,
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        Self::parse(s).ok_or_else(|| format!("unknown severity: {s}"))
    }
}

/// One audit record of a reconciliation action. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    /// Source bundle type (wire name), or a free tag for manual reports
    pub bundle: String,
    /// Commit of the bundle payload that produced this report
    pub bundle_commit_id: String,
    /// Commit of the whole configuration document
    pub commit_id: String,
    pub severity: Severity,
    /// Human summary
    pub text: String,
    /// Captured command output, size-bounded
    #[serde(default)]
    pub log: String,
    #[serde(default)]
    pub labels: Vec<String>,
    /// Unix seconds
    pub timestamp: i64,
}

/// A report as held in the pending ledger.
///
/// `seq` is assigned once at enqueue time and is strictly increasing, so the
/// ledger order is the creation order and acknowledgements are exact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedReport {
    pub seq: u64,
    pub report: Report,
}

// ---------------------------------------------------------------------------
// RunState
// ---------------------------------------------------------------------------

fn state_version() -> u32 {
    STATE_VERSION
}

/// Per-device state persisted across process restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    #[serde(default = "state_version")]
    pub version: u32,
    /// Commit of the last configuration fully executed
    #[serde(default)]
    pub last_applied_commit_id: Option<CommitId>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    /// Idempotence key → fingerprint of the last successfully applied desired state
    #[serde(default)]
    pub fingerprints: BTreeMap<ItemKey, Fingerprint>,
    /// Reports not yet acknowledged by the control plane, in creation order
    #[serde(default)]
    pub pending_reports: Vec<QueuedReport>,
    /// Next ledger sequence number
    #[serde(default)]
    pub next_report_seq: u64,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            last_applied_commit_id: None,
            last_run_at: None,
            fingerprints: BTreeMap::new(),
            pending_reports: Vec::new(),
            next_report_seq: 0,
        }
    }
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fingerprint recorded for `key`, if any.
    pub fn fingerprint(&self, key: &ItemKey) -> Option<&Fingerprint> {
        self.fingerprints.get(key)
    }

    /// Record the fingerprint of a successfully applied item.
    pub fn record(&mut self, key: ItemKey, fingerprint: Fingerprint) {
        self.fingerprints.insert(key, fingerprint);
    }

    /// Drop the fingerprint for `key` (the item no longer exists in config).
    pub fn forget(&mut self, key: &ItemKey) -> Option<Fingerprint> {
        self.fingerprints.remove(key)
    }

    /// All fingerprints belonging to one bundle.
    pub fn fingerprints_for_bundle<'a>(
        &'a self,
        bundle: &'a str,
    ) -> impl Iterator<Item = (&'a ItemKey, &'a Fingerprint)> + 'a {
        self.fingerprints
            .iter()
            .filter(move |(key, _)| key.bundle() == bundle)
    }

    /// Sequence numbers of the pending ledger, in order.
    pub fn pending_seqs(&self) -> Vec<u64> {
        self.pending_reports.iter().map(|q| q.seq).collect()
    }
}
