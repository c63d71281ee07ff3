//! The capability interface consumed by bundle executors.

use async_trait::async_trait;

use crate::types::{
    CommandOutput, ComposeStatus, ContainerSpec, ContainerStatus, FilePerms, FileState, HostFacts,
    InstalledPackage, ServiceAction, ServiceStatus, UserAccount,
};
use crate::Result;

/// Narrow, idempotent operations on a managed host.
///
/// Reads return the host's actual state; executors diff against it before
/// mutating. Mutations either succeed or fail with a [`crate::HostError`]
/// whose [`log`](crate::HostError::log) carries the captured tool output.
#[async_trait]
pub trait HostProvider: Send + Sync {
    /// Facts used by bundle preconditions.
    async fn facts(&self) -> Result<HostFacts>;

    /// Run a privileged command (post-write hooks).
    async fn run_command(&self, argv: &[String], env: &[(String, String)]) -> Result<CommandOutput>;

    // -- files --

    async fn read_file(&self, path: &str) -> Result<Option<FileState>>;

    /// Atomically replace `path` with `content` and apply `perms`.
    async fn write_file(&self, path: &str, content: &[u8], perms: &FilePerms) -> Result<()>;

    // -- packages --

    async fn installed_packages(&self) -> Result<Vec<InstalledPackage>>;

    /// Install or upgrade. `version = None` means whatever the repository offers.
    async fn install_package(
        &self,
        name: &str,
        arch: Option<&str>,
        version: Option<&str>,
    ) -> Result<()>;

    async fn remove_package(&self, name: &str, arch: Option<&str>) -> Result<()>;

    // -- services --

    async fn service_status(&self, name: &str) -> Result<ServiceStatus>;

    async fn set_service_state(&self, name: &str, action: ServiceAction) -> Result<()>;

    // -- containers --

    async fn container_status(&self, name: &str) -> Result<Option<ContainerStatus>>;

    /// Create and start a container. Fails if one with the same name exists.
    async fn run_container(&self, spec: &ContainerSpec) -> Result<()>;

    async fn start_container(&self, name: &str) -> Result<()>;

    /// Stop and delete; absent containers are not an error.
    async fn remove_container(&self, name: &str) -> Result<()>;

    // -- compose --

    async fn compose_status(&self, project: &str) -> Result<Option<ComposeStatus>>;

    async fn compose_up(&self, project: &str, compose_file: &str, force_recreate: bool)
        -> Result<()>;

    async fn compose_down(&self, project: &str, compose_file: &str) -> Result<()>;

    // -- users --

    async fn user(&self, name: &str) -> Result<Option<UserAccount>>;

    /// Create the account or bring an existing one in line with `account`.
    async fn ensure_user(&self, account: &UserAccount) -> Result<()>;

    async fn remove_user(&self, name: &str) -> Result<()>;

    // -- firewall --

    /// Rule lines of the agent-managed chain, in order.
    async fn firewall_ruleset(&self) -> Result<Vec<String>>;

    /// Replace the agent-managed chain with `rules`.
    async fn apply_firewall(&self, rules: &[String]) -> Result<()>;

    // -- settings --

    async fn get_setting(&self, key: &str) -> Result<Option<String>>;

    async fn set_setting(&self, key: &str, value: &str) -> Result<()>;
}
