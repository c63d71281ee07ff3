//! In-memory host for tests
//!
//! `MemoryHost` simulates every capability of a managed host, records each
//! mutation it performs and lets tests inject failures per operation or per
//! target.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::HostError;
use crate::provider::HostProvider;
use crate::types::{
    CommandOutput, ComposeStatus, ContainerSpec, ContainerStatus, FilePerms, FileState, HostFacts,
    InstalledPackage, ServiceAction, ServiceStatus, UserAccount,
};
use crate::Result;

/// Version reported for packages installed without a pinned version.
pub const DEFAULT_PACKAGE_VERSION: &str = "1.0.0";

#[derive(Debug, Clone)]
struct SimFile {
    content: Vec<u8>,
    perms: FilePerms,
}

#[derive(Debug, Clone)]
struct SimContainer {
    spec: ContainerSpec,
    running: bool,
}

#[derive(Debug, Clone)]
struct SimCompose {
    compose_file: String,
    services: usize,
    up: bool,
}

#[derive(Debug, Default)]
struct Sim {
    facts: HostFacts,
    files: BTreeMap<String, SimFile>,
    packages: BTreeMap<String, InstalledPackage>,
    services: BTreeMap<String, ServiceStatus>,
    containers: BTreeMap<String, SimContainer>,
    compose: BTreeMap<String, SimCompose>,
    users: BTreeMap<String, UserAccount>,
    firewall: Vec<String>,
    settings: BTreeMap<String, String>,
    commands: Vec<Vec<String>>,
    command_stdout: HashMap<String, String>,
    mutations: Vec<String>,
    failures: HashMap<(String, Option<String>), String>,
}

/// Simulated host.
#[derive(Debug, Default)]
pub struct MemoryHost {
    sim: Mutex<Sim>,
    delay: Mutex<Option<Duration>>,
}

fn package_key(name: &str, arch: Option<&str>) -> String {
    match arch {
        Some(arch) => format!("{name}.{arch}"),
        None => name.to_string(),
    }
}

fn digest(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

impl MemoryHost {
    pub fn new() -> Self {
        let host = Self::default();
        {
            let mut sim = host.sim.lock().unwrap();
            sim.facts.insert("os".to_string(), "linux".to_string());
            sim.facts.insert("arch".to_string(), "x86_64".to_string());
            sim.facts.insert("hostname".to_string(), "device-01".to_string());
        }
        host
    }

    // -- seeding --

    pub fn set_fact(&self, key: &str, value: &str) {
        self.sim
            .lock()
            .unwrap()
            .facts
            .insert(key.to_string(), value.to_string());
    }

    /// Place a file without counting it as a mutation.
    pub fn seed_file(&self, path: &str, content: &[u8], perms: FilePerms) {
        self.sim.lock().unwrap().files.insert(
            path.to_string(),
            SimFile {
                content: content.to_vec(),
                perms,
            },
        );
    }

    pub fn seed_package(&self, name: &str, arch: Option<&str>, version: &str) {
        self.sim.lock().unwrap().packages.insert(
            package_key(name, arch),
            InstalledPackage {
                name: name.to_string(),
                arch: arch.map(str::to_string),
                version: version.to_string(),
            },
        );
    }

    /// Register a service unit so it can be managed.
    pub fn seed_service(&self, name: &str, running: bool, enabled: bool) {
        self.sim.lock().unwrap().services.insert(
            name.to_string(),
            ServiceStatus {
                exists: true,
                running,
                enabled,
            },
        );
    }

    pub fn seed_user(&self, account: UserAccount) {
        self.sim
            .lock()
            .unwrap()
            .users
            .insert(account.name.clone(), account);
    }

    pub fn seed_setting(&self, key: &str, value: &str) {
        self.sim
            .lock()
            .unwrap()
            .settings
            .insert(key.to_string(), value.to_string());
    }

    /// Successful runs of `program` print `stdout`.
    pub fn set_command_output(&self, program: &str, stdout: &str) {
        self.sim
            .lock()
            .unwrap()
            .command_stdout
            .insert(program.to_string(), stdout.to_string());
    }

    // -- failure injection --

    /// Every call of `op` fails with `message` until cleared.
    pub fn fail_op(&self, op: &str, message: &str) {
        self.sim
            .lock()
            .unwrap()
            .failures
            .insert((op.to_string(), None), message.to_string());
    }

    /// Calls of `op` on `target` (path, package, service...) fail.
    pub fn fail_target(&self, op: &str, target: &str, message: &str) {
        self.sim.lock().unwrap().failures.insert(
            (op.to_string(), Some(target.to_string())),
            message.to_string(),
        );
    }

    pub fn clear_failures(&self) {
        self.sim.lock().unwrap().failures.clear();
    }

    /// Make every mutating call sleep first.
    pub fn set_op_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    // -- inspection --

    /// Mutations performed so far, as `"<op> <target>"`.
    pub fn mutations(&self) -> Vec<String> {
        self.sim.lock().unwrap().mutations.clone()
    }

    pub fn mutation_count(&self) -> usize {
        self.sim.lock().unwrap().mutations.len()
    }

    pub fn commands(&self) -> Vec<Vec<String>> {
        self.sim.lock().unwrap().commands.clone()
    }

    pub fn file_content(&self, path: &str) -> Option<Vec<u8>> {
        self.sim
            .lock()
            .unwrap()
            .files
            .get(path)
            .map(|f| f.content.clone())
    }

    pub fn package_version(&self, name: &str, arch: Option<&str>) -> Option<String> {
        self.sim
            .lock()
            .unwrap()
            .packages
            .get(&package_key(name, arch))
            .map(|p| p.version.clone())
    }

    pub fn firewall_rules(&self) -> Vec<String> {
        self.sim.lock().unwrap().firewall.clone()
    }

    /// Simulate an operator stopping a container behind the agent's back.
    pub fn stop_container_externally(&self, name: &str) {
        if let Some(c) = self.sim.lock().unwrap().containers.get_mut(name) {
            c.running = false;
        }
    }

    /// Simulate an operator stopping a service behind the agent's back.
    pub fn stop_service_externally(&self, name: &str) {
        if let Some(s) = self.sim.lock().unwrap().services.get_mut(name) {
            s.running = false;
        }
    }

    // -- internals --

    fn check(&self, op: &str, target: &str) -> Result<()> {
        let sim = self.sim.lock().unwrap();
        let failure = sim
            .failures
            .get(&(op.to_string(), Some(target.to_string())))
            .or_else(|| sim.failures.get(&(op.to_string(), None)));
        match failure {
            Some(message) => Err(HostError::Injected {
                op: op.to_string(),
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Shared prologue of every mutation: delay, injected failure, log.
    async fn mutate(&self, op: &str, target: &str) -> Result<()> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check(op, target)?;
        self.sim
            .lock()
            .unwrap()
            .mutations
            .push(format!("{op} {target}"));
        Ok(())
    }
}

#[async_trait]
impl HostProvider for MemoryHost {
    async fn facts(&self) -> Result<HostFacts> {
        self.check("facts", "")?;
        Ok(self.sim.lock().unwrap().facts.clone())
    }

    async fn run_command(&self, argv: &[String], _env: &[(String, String)]) -> Result<CommandOutput> {
        let program = argv.first().cloned().unwrap_or_default();
        self.sim.lock().unwrap().commands.push(argv.to_vec());
        if let Err(err) = self.check("run_command", &program) {
            return Err(HostError::CommandFailed {
                command: argv.join(" "),
                output: CommandOutput {
                    exit_code: 1,
                    stdout: String::new(),
                    stderr: err.log(),
                    duration_ms: 0,
                },
            });
        }
        let stdout = self
            .sim
            .lock()
            .unwrap()
            .command_stdout
            .get(&program)
            .cloned()
            .unwrap_or_default();
        Ok(CommandOutput {
            stdout,
            ..CommandOutput::default()
        })
    }

    async fn read_file(&self, path: &str) -> Result<Option<FileState>> {
        self.check("read_file", path)?;
        Ok(self.sim.lock().unwrap().files.get(path).map(|f| FileState {
            digest: digest(&f.content),
            mode: f.perms.mode,
            owner: f.perms.owner.clone(),
            group: f.perms.group.clone(),
        }))
    }

    async fn write_file(&self, path: &str, content: &[u8], perms: &FilePerms) -> Result<()> {
        self.mutate("write_file", path).await?;
        self.sim.lock().unwrap().files.insert(
            path.to_string(),
            SimFile {
                content: content.to_vec(),
                perms: perms.clone(),
            },
        );
        Ok(())
    }

    async fn installed_packages(&self) -> Result<Vec<InstalledPackage>> {
        self.check("installed_packages", "")?;
        Ok(self.sim.lock().unwrap().packages.values().cloned().collect())
    }

    async fn install_package(
        &self,
        name: &str,
        arch: Option<&str>,
        version: Option<&str>,
    ) -> Result<()> {
        let key = package_key(name, arch);
        self.mutate("install_package", &key).await?;
        self.sim.lock().unwrap().packages.insert(
            key,
            InstalledPackage {
                name: name.to_string(),
                arch: arch.map(str::to_string),
                version: version.unwrap_or(DEFAULT_PACKAGE_VERSION).to_string(),
            },
        );
        Ok(())
    }

    async fn remove_package(&self, name: &str, arch: Option<&str>) -> Result<()> {
        let key = package_key(name, arch);
        self.mutate("remove_package", &key).await?;
        self.sim.lock().unwrap().packages.remove(&key);
        Ok(())
    }

    async fn service_status(&self, name: &str) -> Result<ServiceStatus> {
        self.check("service_status", name)?;
        Ok(self
            .sim
            .lock()
            .unwrap()
            .services
            .get(name)
            .copied()
            .unwrap_or_default())
    }

    async fn set_service_state(&self, name: &str, action: ServiceAction) -> Result<()> {
        if !self.sim.lock().unwrap().services.contains_key(name) {
            return Err(HostError::NotFound(format!("unit {name}")));
        }
        self.mutate("set_service_state", name).await?;
        if let Some(status) = self.sim.lock().unwrap().services.get_mut(name) {
            match action {
                ServiceAction::Start | ServiceAction::Restart => status.running = true,
                ServiceAction::Stop => status.running = false,
                ServiceAction::Enable => status.enabled = true,
                ServiceAction::Disable => status.enabled = false,
            }
        }
        Ok(())
    }

    async fn container_status(&self, name: &str) -> Result<Option<ContainerStatus>> {
        self.check("container_status", name)?;
        Ok(self
            .sim
            .lock()
            .unwrap()
            .containers
            .get(name)
            .map(|c| ContainerStatus {
                name: name.to_string(),
                image: c.spec.image.clone(),
                running: c.running,
                labels: c.spec.labels.clone(),
            }))
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<()> {
        self.mutate("run_container", &spec.name).await?;
        let mut sim = self.sim.lock().unwrap();
        if sim.containers.contains_key(&spec.name) {
            return Err(HostError::Injected {
                op: "run_container".to_string(),
                message: format!("container name {} already in use", spec.name),
            });
        }
        sim.containers.insert(
            spec.name.clone(),
            SimContainer {
                spec: spec.clone(),
                running: true,
            },
        );
        Ok(())
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        self.mutate("start_container", name).await?;
        match self.sim.lock().unwrap().containers.get_mut(name) {
            Some(c) => {
                c.running = true;
                Ok(())
            }
            None => Err(HostError::NotFound(format!("container {name}"))),
        }
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        self.mutate("remove_container", name).await?;
        self.sim.lock().unwrap().containers.remove(name);
        Ok(())
    }

    async fn compose_status(&self, project: &str) -> Result<Option<ComposeStatus>> {
        self.check("compose_status", project)?;
        Ok(self
            .sim
            .lock()
            .unwrap()
            .compose
            .get(project)
            .map(|p| ComposeStatus {
                project: project.to_string(),
                running_services: if p.up { p.services } else { 0 },
                total_services: p.services,
            }))
    }

    async fn compose_up(
        &self,
        project: &str,
        compose_file: &str,
        _force_recreate: bool,
    ) -> Result<()> {
        self.mutate("compose_up", project).await?;
        let mut sim = self.sim.lock().unwrap();
        let content = sim
            .files
            .get(compose_file)
            .map(|f| f.content.clone())
            .ok_or_else(|| HostError::NotFound(format!("compose file {compose_file}")))?;
        let text = String::from_utf8_lossy(&content);
        // one service per `image:` line is close enough for a simulation
        let services = text
            .lines()
            .filter(|l| l.trim_start().starts_with("image:"))
            .count()
            .max(1);
        sim.compose.insert(
            project.to_string(),
            SimCompose {
                compose_file: compose_file.to_string(),
                services,
                up: true,
            },
        );
        Ok(())
    }

    async fn compose_down(&self, project: &str, _compose_file: &str) -> Result<()> {
        self.mutate("compose_down", project).await?;
        self.sim.lock().unwrap().compose.remove(project);
        Ok(())
    }

    async fn user(&self, name: &str) -> Result<Option<UserAccount>> {
        self.check("user", name)?;
        Ok(self.sim.lock().unwrap().users.get(name).cloned())
    }

    async fn ensure_user(&self, account: &UserAccount) -> Result<()> {
        self.mutate("ensure_user", &account.name).await?;
        self.sim
            .lock()
            .unwrap()
            .users
            .insert(account.name.clone(), account.clone());
        Ok(())
    }

    async fn remove_user(&self, name: &str) -> Result<()> {
        self.mutate("remove_user", name).await?;
        self.sim.lock().unwrap().users.remove(name);
        Ok(())
    }

    async fn firewall_ruleset(&self) -> Result<Vec<String>> {
        self.check("firewall_ruleset", "")?;
        Ok(self.sim.lock().unwrap().firewall.clone())
    }

    async fn apply_firewall(&self, rules: &[String]) -> Result<()> {
        self.mutate("apply_firewall", "ruleset").await?;
        self.sim.lock().unwrap().firewall = rules.to_vec();
        Ok(())
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.check("get_setting", key)?;
        Ok(self.sim.lock().unwrap().settings.get(key).cloned())
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.mutate("set_setting", key).await?;
        self.sim
            .lock()
            .unwrap()
            .settings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

impl MemoryHost {
    /// Compose file a project was last brought up from.
    pub fn compose_file(&self, project: &str) -> Option<String> {
        self.sim
            .lock()
            .unwrap()
            .compose
            .get(project)
            .map(|p| p.compose_file.clone())
    }
}
