//! `SystemHost`: a thin adapter over the usual Linux tools.
//!
//! Every operation is one or a few shell commands; the tool is the source of
//! truth and nothing is cached here.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::command::{self, argv};
use crate::error::HostError;
use crate::provider::HostProvider;
use crate::types::{
    CommandOutput, ComposeStatus, ContainerSpec, ContainerStatus, FilePerms, FileState, HostFacts,
    InstalledPackage, ServiceAction, ServiceStatus, UserAccount,
};
use crate::Result;

/// Native package manager family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Apt,
    Dnf,
}

impl PackageManager {
    /// Pick the package manager present on this host.
    pub fn detect() -> Option<Self> {
        if Path::new("/usr/bin/apt-get").exists() {
            Some(PackageManager::Apt)
        } else if Path::new("/usr/bin/dnf").exists() {
            Some(PackageManager::Dnf)
        } else {
            None
        }
    }

    fn list_argv(&self) -> Vec<String> {
        match self {
            PackageManager::Apt => argv(&[
                "dpkg-query",
                "-W",
                "-f=${Package}\t${Architecture}\t${Version}\t${db:Status-Status}\n",
            ]),
            PackageManager::Dnf => argv(&[
                "rpm",
                "-qa",
                "--queryformat",
                "%{NAME}\t%{ARCH}\t%{VERSION}-%{RELEASE}\tinstalled\n",
            ]),
        }
    }

    fn install_argv(&self, name: &str, arch: Option<&str>, version: Option<&str>) -> Vec<String> {
        match self {
            PackageManager::Apt => {
                let mut target = name.to_string();
                if let Some(arch) = arch {
                    target = format!("{target}:{arch}");
                }
                if let Some(version) = version {
                    target = format!("{target}={version}");
                }
                argv(&["apt-get", "install", "-y", "--allow-downgrades", &target])
            }
            PackageManager::Dnf => {
                let mut target = name.to_string();
                if let Some(version) = version {
                    target = format!("{target}-{version}");
                }
                if let Some(arch) = arch {
                    target = format!("{target}.{arch}");
                }
                argv(&["dnf", "install", "-y", &target])
            }
        }
    }

    fn remove_argv(&self, name: &str, arch: Option<&str>) -> Vec<String> {
        match (self, arch) {
            (PackageManager::Apt, Some(arch)) => {
                argv(&["apt-get", "remove", "-y", &format!("{name}:{arch}")])
            }
            (PackageManager::Apt, None) => argv(&["apt-get", "remove", "-y", name]),
            (PackageManager::Dnf, Some(arch)) => {
                argv(&["dnf", "remove", "-y", &format!("{name}.{arch}")])
            }
            (PackageManager::Dnf, None) => argv(&["dnf", "remove", "-y", name]),
        }
    }
}

/// Tunables for [`SystemHost`].
#[derive(Debug, Clone)]
pub struct SystemHostConfig {
    /// Upper bound for any single tool invocation
    pub command_timeout: Duration,
    /// `None` autodetects on first use
    pub package_manager: Option<PackageManager>,
    /// Compose front-end, e.g. `["docker", "compose"]`
    pub compose_command: Vec<String>,
    /// iptables chain owned by the agent
    pub firewall_chain: String,
    /// Operator labels exposed as `label.<name>` facts
    pub labels: BTreeMap<String, String>,
}

impl Default for SystemHostConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(300),
            package_manager: None,
            compose_command: argv(&["docker", "compose"]),
            firewall_chain: "FLEET-INPUT".to_string(),
            labels: BTreeMap::new(),
        }
    }
}

/// Host provider backed by real system tools.
#[derive(Debug, Clone, Default)]
pub struct SystemHost {
    config: SystemHostConfig,
}

const NONINTERACTIVE: [(&str, &str); 1] = [("DEBIAN_FRONTEND", "noninteractive")];

impl SystemHost {
    pub fn new(config: SystemHostConfig) -> Self {
        Self { config }
    }

    async fn exec(&self, argv: Vec<String>) -> Result<CommandOutput> {
        command::run_command(&argv, &[], self.config.command_timeout).await
    }

    async fn probe(&self, argv: Vec<String>) -> Result<CommandOutput> {
        command::capture(&argv, &[], self.config.command_timeout).await
    }

    fn package_manager(&self) -> Result<PackageManager> {
        self.config
            .package_manager
            .or_else(PackageManager::detect)
            .ok_or_else(|| HostError::Unsupported("no supported package manager".to_string()))
    }

    fn compose_argv(&self, project: &str, compose_file: Option<&str>, rest: &[&str]) -> Vec<String> {
        let mut out = self.config.compose_command.clone();
        out.extend(argv(&["-p", project]));
        if let Some(file) = compose_file {
            out.extend(argv(&["-f", file]));
        }
        out.extend(argv(rest));
        out
    }
}

/// Parse one `getent passwd` line.
fn parse_passwd(line: &str) -> Option<UserAccount> {
    let fields: Vec<&str> = line.trim().split(':').collect();
    if fields.len() < 7 {
        return None;
    }
    Some(UserAccount {
        name: fields[0].to_string(),
        uid: fields[2].parse().ok(),
        groups: Vec::new(),
        shell: Some(fields[6].to_string()),
        home: Some(fields[5].to_string()),
    })
}

/// Parse `dpkg-query`/`rpm` tab-separated listings.
fn parse_package_listing(stdout: &str) -> Vec<InstalledPackage> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut cols = line.split('\t');
            let name = cols.next()?.trim();
            let arch = cols.next()?.trim();
            let version = cols.next()?.trim();
            let status = cols.next().unwrap_or("installed").trim();
            if name.is_empty() || status != "installed" {
                return None;
            }
            Some(InstalledPackage {
                name: name.to_string(),
                arch: (!arch.is_empty() && arch != "(none)").then(|| arch.to_string()),
                version: version.to_string(),
            })
        })
        .collect()
}

/// `docker compose ps --format json` prints either an array or one object
/// per line depending on the compose version.
fn parse_compose_ps(project: &str, stdout: &str) -> Result<Option<ComposeStatus>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let entries: Vec<serde_json::Value> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed)?
    } else {
        trimmed
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(serde_json::from_str)
            .collect::<std::result::Result<_, _>>()?
    };
    if entries.is_empty() {
        return Ok(None);
    }
    let running = entries
        .iter()
        .filter(|e| e.get("State").and_then(|s| s.as_str()) == Some("running"))
        .count();
    Ok(Some(ComposeStatus {
        project: project.to_string(),
        running_services: running,
        total_services: entries.len(),
    }))
}

fn parse_container_inspect(name: &str, stdout: &str) -> Result<ContainerStatus> {
    let value: serde_json::Value = serde_json::from_str(stdout.trim())?;
    let image = value
        .pointer("/Config/Image")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let running = value
        .pointer("/State/Running")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let labels = value
        .pointer("/Config/Labels")
        .and_then(|v| v.as_object())
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default();
    Ok(ContainerStatus {
        name: name.to_string(),
        image,
        running,
        labels,
    })
}

fn write_atomic(path: &Path, content: &[u8], mode: u32) -> std::io::Result<()> {
    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[async_trait]
impl HostProvider for SystemHost {
    async fn facts(&self) -> Result<HostFacts> {
        let mut facts = HostFacts::new();
        facts.insert("os".to_string(), std::env::consts::OS.to_string());
        facts.insert("arch".to_string(), std::env::consts::ARCH.to_string());

        if let Ok(out) = self.probe(argv(&["hostname"])).await {
            facts.insert("hostname".to_string(), out.stdout.trim().to_string());
        }
        if let Ok(out) = self.probe(argv(&["uname", "-r"])).await {
            facts.insert("kernel".to_string(), out.stdout.trim().to_string());
        }
        if let Ok(release) = tokio::fs::read_to_string("/etc/os-release").await {
            for line in release.lines() {
                if let Some(id) = line.strip_prefix("ID=") {
                    facts.insert("distro".to_string(), id.trim_matches('"').to_string());
                }
            }
        }
        for (name, value) in &self.config.labels {
            facts.insert(format!("label.{name}"), value.clone());
        }
        Ok(facts)
    }

    async fn run_command(&self, argv: &[String], env: &[(String, String)]) -> Result<CommandOutput> {
        command::run_command(argv, env, self.config.command_timeout).await
    }

    async fn read_file(&self, path: &str) -> Result<Option<FileState>> {
        let content = match tokio::fs::read(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let meta = tokio::fs::metadata(path).await?;
        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            meta.permissions().mode() & 0o7777
        };
        #[cfg(not(unix))]
        let mode = if meta.permissions().readonly() { 0o444 } else { 0o644 };

        let owner = self.exec(argv(&["stat", "-c", "%U:%G", path])).await?;
        let (owner, group) = owner
            .stdout
            .trim()
            .split_once(':')
            .map(|(o, g)| (o.to_string(), g.to_string()))
            .ok_or_else(|| HostError::Parse(format!("stat output for {path}")))?;

        let mut hasher = Sha256::new();
        hasher.update(&content);
        Ok(Some(FileState {
            digest: hex::encode(hasher.finalize()),
            mode,
            owner,
            group,
        }))
    }

    async fn write_file(&self, path: &str, content: &[u8], perms: &FilePerms) -> Result<()> {
        let target = PathBuf::from(path);
        let data = content.to_vec();
        let mode = perms.mode;
        tokio::task::spawn_blocking(move || write_atomic(&target, &data, mode))
            .await
            .map_err(|e| HostError::Io(std::io::Error::other(e.to_string())))??;
        self.exec(argv(&[
            "chown",
            &format!("{}:{}", perms.owner, perms.group),
            path,
        ]))
        .await?;
        debug!(path = %path, mode = format!("{:o}", perms.mode), "file written");
        Ok(())
    }

    async fn installed_packages(&self) -> Result<Vec<InstalledPackage>> {
        let pm = self.package_manager()?;
        let out = self.exec(pm.list_argv()).await?;
        Ok(parse_package_listing(&out.stdout))
    }

    async fn install_package(
        &self,
        name: &str,
        arch: Option<&str>,
        version: Option<&str>,
    ) -> Result<()> {
        let pm = self.package_manager()?;
        let env: Vec<(String, String)> = NONINTERACTIVE
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        command::run_command(
            &pm.install_argv(name, arch, version),
            &env,
            self.config.command_timeout,
        )
        .await?;
        info!(package = %name, "package installed");
        Ok(())
    }

    async fn remove_package(&self, name: &str, arch: Option<&str>) -> Result<()> {
        let pm = self.package_manager()?;
        self.exec(pm.remove_argv(name, arch)).await?;
        info!(package = %name, "package removed");
        Ok(())
    }

    async fn service_status(&self, name: &str) -> Result<ServiceStatus> {
        let load = self
            .probe(argv(&["systemctl", "show", "-p", "LoadState", "--value", name]))
            .await?;
        if load.stdout.trim() != "loaded" {
            return Ok(ServiceStatus::default());
        }
        let active = self.probe(argv(&["systemctl", "is-active", name])).await?;
        let enabled = self.probe(argv(&["systemctl", "is-enabled", name])).await?;
        Ok(ServiceStatus {
            exists: true,
            running: active.stdout.trim() == "active",
            enabled: enabled.stdout.trim() == "enabled",
        })
    }

    async fn set_service_state(&self, name: &str, action: ServiceAction) -> Result<()> {
        self.exec(argv(&["systemctl", action.verb(), name])).await?;
        Ok(())
    }

    async fn container_status(&self, name: &str) -> Result<Option<ContainerStatus>> {
        let out = self
            .probe(argv(&["docker", "inspect", "--format", "{{json .}}", name]))
            .await?;
        if !out.success() {
            return Ok(None);
        }
        parse_container_inspect(name, &out.stdout).map(Some)
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<()> {
        let mut cmd = argv(&["docker", "run", "-d", "--name", &spec.name]);
        if let Some(restart) = &spec.restart {
            cmd.extend(argv(&["--restart", restart]));
        }
        for port in &spec.ports {
            cmd.extend(argv(&["-p", port]));
        }
        for (key, value) in &spec.env {
            cmd.extend(argv(&["-e", &format!("{key}={value}")]));
        }
        for volume in &spec.volumes {
            cmd.extend(argv(&["-v", volume]));
        }
        for (key, value) in &spec.labels {
            cmd.extend(argv(&["--label", &format!("{key}={value}")]));
        }
        cmd.push(spec.image.clone());
        cmd.extend(spec.command.iter().cloned());
        self.exec(cmd).await?;
        Ok(())
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        self.exec(argv(&["docker", "start", name])).await?;
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        let out = self.probe(argv(&["docker", "rm", "-f", name])).await?;
        if !out.success() && !out.stderr.contains("No such container") {
            return Err(HostError::CommandFailed {
                command: format!("docker rm -f {name}"),
                output: out,
            });
        }
        Ok(())
    }

    async fn compose_status(&self, project: &str) -> Result<Option<ComposeStatus>> {
        let out = self
            .probe(self.compose_argv(project, None, &["ps", "-a", "--format", "json"]))
            .await?;
        if !out.success() {
            return Ok(None);
        }
        parse_compose_ps(project, &out.stdout)
    }

    async fn compose_up(
        &self,
        project: &str,
        compose_file: &str,
        force_recreate: bool,
    ) -> Result<()> {
        let mut rest = vec!["up", "-d", "--remove-orphans"];
        if force_recreate {
            rest.push("--force-recreate");
        }
        self.exec(self.compose_argv(project, Some(compose_file), &rest))
            .await?;
        Ok(())
    }

    async fn compose_down(&self, project: &str, compose_file: &str) -> Result<()> {
        self.exec(self.compose_argv(project, Some(compose_file), &["down"]))
            .await?;
        Ok(())
    }

    async fn user(&self, name: &str) -> Result<Option<UserAccount>> {
        let out = self.probe(argv(&["getent", "passwd", name])).await?;
        if !out.success() {
            return Ok(None);
        }
        let mut account = parse_passwd(&out.stdout)
            .ok_or_else(|| HostError::Parse(format!("passwd entry for {name}")))?;
        let groups = self.exec(argv(&["id", "-nG", name])).await?;
        account.groups = groups
            .stdout
            .split_whitespace()
            .filter(|g| *g != name)
            .map(str::to_string)
            .collect();
        Ok(Some(account))
    }

    async fn ensure_user(&self, account: &UserAccount) -> Result<()> {
        let exists = self.user(&account.name).await?.is_some();
        let mut cmd = if exists {
            argv(&["usermod"])
        } else {
            argv(&["useradd", "-m"])
        };
        if let Some(uid) = account.uid {
            cmd.extend(argv(&["-u", &uid.to_string()]));
        }
        if let Some(shell) = &account.shell {
            cmd.extend(argv(&["-s", shell]));
        }
        if let Some(home) = &account.home {
            cmd.extend(argv(&["-d", home]));
        }
        if !account.groups.is_empty() {
            cmd.extend(argv(&["-G", &account.groups.join(",")]));
        }
        cmd.push(account.name.clone());
        self.exec(cmd).await?;
        Ok(())
    }

    async fn remove_user(&self, name: &str) -> Result<()> {
        self.exec(argv(&["userdel", "-r", name])).await?;
        Ok(())
    }

    async fn firewall_ruleset(&self) -> Result<Vec<String>> {
        let chain = &self.config.firewall_chain;
        let out = self.probe(argv(&["iptables", "-S", chain])).await?;
        if !out.success() {
            return Ok(Vec::new());
        }
        let prefix = format!("-A {chain} ");
        Ok(out
            .stdout
            .lines()
            .filter_map(|line| line.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    async fn apply_firewall(&self, rules: &[String]) -> Result<()> {
        let chain = self.config.firewall_chain.clone();
        // -N fails when the chain already exists
        self.probe(argv(&["iptables", "-N", &chain])).await?;
        self.exec(argv(&["iptables", "-F", &chain])).await?;
        for rule in rules {
            let mut cmd = argv(&["iptables", "-A", &chain]);
            cmd.extend(rule.split_whitespace().map(str::to_string));
            self.exec(cmd).await?;
        }
        let jump = self
            .probe(argv(&["iptables", "-C", "INPUT", "-j", &chain]))
            .await?;
        if !jump.success() {
            self.exec(argv(&["iptables", "-I", "INPUT", "-j", &chain]))
                .await?;
        }
        info!(chain = %chain, rules = rules.len(), "firewall chain replaced");
        Ok(())
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let out = match key {
            "hostname" => self.probe(argv(&["hostnamectl", "hostname"])).await?,
            "timezone" => {
                self.probe(argv(&["timedatectl", "show", "-p", "Timezone", "--value"]))
                    .await?
            }
            _ => match key.strip_prefix("sysctl.") {
                Some(param) => self.probe(argv(&["sysctl", "-n", param])).await?,
                None => return Err(HostError::Unsupported(format!("setting {key}"))),
            },
        };
        Ok(out.success().then(|| out.stdout.trim().to_string()))
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let cmd = match key {
            "hostname" => argv(&["hostnamectl", "set-hostname", value]),
            "timezone" => argv(&["timedatectl", "set-timezone", value]),
            _ => match key.strip_prefix("sysctl.") {
                Some(param) => argv(&["sysctl", "-w", &format!("{param}={value}")]),
                None => return Err(HostError::Unsupported(format!("setting {key}"))),
            },
        };
        self.exec(cmd).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apt_install_argv_pins_arch_and_version() {
        let cmd = PackageManager::Apt.install_argv("nginx", Some("amd64"), Some("1.24.0"));
        assert_eq!(cmd.last().unwrap(), "nginx:amd64=1.24.0");
        let cmd = PackageManager::Dnf.install_argv("nginx", Some("x86_64"), Some("1.24.0"));
        assert_eq!(cmd.last().unwrap(), "nginx-1.24.0.x86_64");
    }

    #[test]
    fn package_listing_skips_half_installed() {
        let listing = "nginx\tamd64\t1.24.0\tinstalled\ncurl\tamd64\t8.0\tconfig-files\n";
        let pkgs = parse_package_listing(listing);
        assert_eq!(pkgs.len(), 1);
        assert_eq!(pkgs[0].name, "nginx");
        assert_eq!(pkgs[0].arch.as_deref(), Some("amd64"));
    }

    #[test]
    fn rpm_listing_without_arch() {
        let pkgs = parse_package_listing("gpg-pubkey\t(none)\t1-2\tinstalled\n");
        assert_eq!(pkgs[0].arch, None);
    }

    #[test]
    fn passwd_line_parsing() {
        let account = parse_passwd("deploy:x:1001:1001::/home/deploy:/bin/bash\n").unwrap();
        assert_eq!(account.uid, Some(1001));
        assert_eq!(account.home.as_deref(), Some("/home/deploy"));
        assert_eq!(account.shell.as_deref(), Some("/bin/bash"));
        assert!(parse_passwd("garbage").is_none());
    }

    #[test]
    fn compose_ps_both_formats() {
        let array = r#"[{"Service":"web","State":"running"},{"Service":"db","State":"exited"}]"#;
        let status = parse_compose_ps("shop", array).unwrap().unwrap();
        assert_eq!(status.total_services, 2);
        assert_eq!(status.running_services, 1);

        let lines = "{\"Service\":\"web\",\"State\":\"running\"}\n{\"Service\":\"db\",\"State\":\"running\"}\n";
        let status = parse_compose_ps("shop", lines).unwrap().unwrap();
        assert!(status.is_up());

        assert!(parse_compose_ps("shop", "  ").unwrap().is_none());
    }

    #[test]
    fn container_inspect_parsing() {
        let json = r#"{"Config":{"Image":"nginx:1.25","Labels":{"io.fleet.fingerprint":"abc"}},"State":{"Running":true}}"#;
        let status = parse_container_inspect("web", json).unwrap();
        assert_eq!(status.image, "nginx:1.25");
        assert!(status.running);
        assert_eq!(status.labels.get("io.fleet.fingerprint").unwrap(), "abc");
    }

    #[test]
    fn atomic_write_sets_content_and_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("app.conf");
        write_atomic(&path, b"key=value\n", 0o600).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"key=value\n");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o7777;
            assert_eq!(mode, 0o600);
        }
    }
}
