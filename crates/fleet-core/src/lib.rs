//! Fleet-Core: configuration reconciliation for the fleet agent
//!
//! ## Layer 2 - Reconciliation
//!
//! A run fetches the device's committed configuration, orders its bundles,
//! converges every item against the host through [`fleet_host::HostProvider`],
//! records fingerprints in [`fleet_state::RunState`], and delivers the
//! resulting reports to the control plane.
//!
//! ## Key Components
//!
//! - `domain`: `CommittedConfig`, `BundleKind`, preconditions, errors
//! - `executors`: one `BundleExecutor` per bundle kind
//! - `engine`: ordering, gating, per-item convergence, dry-run planning
//! - `pipeline`: pending report ledger and at-least-once delivery
//! - `scheduler` / `agent`: the run loop and its triggers
//! - `control_plane`: HTTP client and in-memory fake

pub mod agent;
pub mod config;
pub mod control_plane;
pub mod domain;
pub mod engine;
pub mod executors;
pub mod metrics;
pub mod obs;
pub mod pipeline;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod telemetry;

pub use agent::{Agent, RunReport};
pub use config::{AgentConfig, TlsConfig, DEFAULT_CONFIG_PATH, DEFAULT_STATE_DIR};
pub use control_plane::{ControlPlane, FetchOutcome, HttpControlPlane};
pub use domain::{
    manual_report, AgentError, BundleKind, BundleMeta, CommittedConfig, Condition, ReportFactory,
    Result,
};
pub use engine::{
    BundleDisposition, BundlePlan, BundleStatus, Engine, ItemCounts, ItemPlan, PlanAction,
    RunOutcome, RunPlan, RunResult,
};
pub use executors::{ExecSettings, PackageCache, PackageLock};
pub use metrics::{MetricsSnapshot, METRICS};
pub use pipeline::{FlushSummary, ReportPipeline};
pub use retry::RetryPolicy;
pub use scheduler::{Decision, Phase, Scheduler, Trigger, TriggerHandle};
pub use state::StateKeeper;
