//! Domain model for the reconciliation engine.
//!
//! - `CommittedConfig`: the fetched configuration document
//! - `BundleKind` / `BundleMeta`: the closed set of bundle types and their common fields
//! - `Condition`: bundle preconditions over host facts
//! - `AgentError`: error taxonomy

pub mod bundle;
pub mod committed;
pub mod condition;
pub mod digest;
pub mod error;
pub mod report;

pub use bundle::{BundleKind, BundleMeta};
pub use committed::CommittedConfig;
pub use condition::Condition;
pub use error::{AgentError, Result};
pub use report::{manual_report, truncate_log, ReportFactory};
