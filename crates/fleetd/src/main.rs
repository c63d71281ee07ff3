//! fleetd: the fleet agent daemon.
//!
//! Loads the agent configuration, then reconciles the host every
//! `run_interval_secs` until SIGTERM. SIGHUP requests an immediate run and
//! SIGUSR1 announces a new configuration. A fatal error (lost credentials,
//! corrupt state) exits non-zero so the service manager surfaces it.

mod signals;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use fleet_core::telemetry::{init_tracing, level_for_verbosity};
use fleet_core::{Agent, AgentConfig, HttpControlPlane, TriggerHandle, DEFAULT_CONFIG_PATH};
use fleet_host::{SystemHost, SystemHostConfig};
use fleet_state::FileStateStore;

#[derive(Parser, Debug)]
#[command(name = "fleetd")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Fleet agent daemon", long_about = None)]
struct Args {
    /// Agent configuration file (JSON)
    #[arg(long, env = "FLEET_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// More output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit JSON-formatted log lines
    #[arg(long, env = "FLEET_JSON_LOGS")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs, level_for_verbosity(args.verbose));

    let config = load_config(&args)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        device_id = %config.device_id,
        api_url = %config.api_url,
        "fleetd starting"
    );

    let host = Arc::new(SystemHost::new(SystemHostConfig {
        labels: config.labels.clone(),
        ..SystemHostConfig::default()
    }));
    let control = Arc::new(
        HttpControlPlane::from_config(&config).context("failed to build control-plane client")?,
    );
    let store = Arc::new(FileStateStore::new(&config.state_dir).with_context(|| {
        format!("failed to open state directory {}", config.state_dir.display())
    })?);
    let agent = Agent::new(config, host, control, store)
        .await
        .context("failed to start agent")?;

    let (triggers, rx) = TriggerHandle::channel(8);
    let shutdown = CancellationToken::new();
    let listener = signals::spawn(triggers, shutdown.clone())?;

    let result = agent.run_loop(rx, shutdown.clone()).await;
    shutdown.cancel();
    listener.abort();

    match result {
        Ok(()) => {
            info!("fleetd stopped");
            Ok(())
        }
        Err(err) => {
            error!(error = %err, "fleetd stopping on a fatal error");
            Err(err).context("agent loop failed")
        }
    }
}

fn load_config(args: &Args) -> Result<AgentConfig> {
    let mut config = AgentConfig::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    config.apply_env().context("invalid FLEET_* environment")?;
    config.validate().context("invalid agent configuration")?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_the_system_config_path() {
        let args = Args::try_parse_from(["fleetd"]).unwrap();
        assert_eq!(args.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert_eq!(args.verbose, 0);
    }

    #[test]
    fn incomplete_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.json");
        std::fs::write(&path, r#"{"api_url": "https://cp.example"}"#).unwrap();

        let args = Args::try_parse_from(["fleetd", "--config", path.to_str().unwrap()]).unwrap();
        let err = load_config(&args).unwrap_err();
        assert!(format!("{err:#}").contains("device_id"));
    }
}
