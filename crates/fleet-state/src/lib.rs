//! Fleet-State: durable run state for the fleet agent
//!
//! This crate owns everything the agent remembers between runs. It is the
//! only cross-run memory of the reconciliation engine.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: crash consistency. Every write replaces the whole document
//! atomically and is fsynced before returning.
//!
//! ## Key Components
//!
//! - `RunState`: last applied commit, per-item fingerprints, pending report ledger
//! - `Report` / `Severity`: the audit record delivered to the control plane
//! - `StateStore`: backend-agnostic persistence trait
//! - `FileStateStore`: JSON document under the agent's state directory
//! - `fakes`: in-memory store with failure injection for tests

mod error;
pub mod fakes;
mod file_store;
mod schema;
pub mod storage_traits;

pub use error::StoreError;
pub use file_store::{FileStateStore, STATE_FILE_NAME};
pub use schema::{
    CommitId, Fingerprint, ItemKey, QueuedReport, Report, RunState, Severity, STATE_VERSION,
};
pub use storage_traits::{StateStore, StoreResult};
