//! Host capability providers for the fleet agent
//!
//! Provides the narrow, idempotent operations the reconciliation engine
//! uses to mutate a managed host:
//! - Files with ownership and mode
//! - Packages through the native package manager
//! - System services
//! - Containers and compose projects
//! - Local user accounts, firewall chain, system settings
//!
//! `SystemHost` shells out to the usual OS tools. `fakes::MemoryHost`
//! simulates a host in memory for tests.

pub mod command;
pub mod error;
pub mod fakes;
pub mod provider;
pub mod system;
pub mod types;

pub use command::run_command;
pub use error::HostError;
pub use provider::HostProvider;
pub use system::{PackageManager, SystemHost, SystemHostConfig};
pub use types::{
    CommandOutput, ComposeStatus, ContainerSpec, ContainerStatus, FilePerms, FileState,
    HostFacts, InstalledPackage, ServiceAction, ServiceStatus, UserAccount,
};

/// Result type for host operations
pub type Result<T> = std::result::Result<T, HostError>;

/// Container label carrying the agent's fingerprint of the desired spec.
pub const FINGERPRINT_LABEL: &str = "io.fleet.fingerprint";
