//! Fleet Agent CLI
//!
//! The `fleet` command drives the reconciliation agent in the foreground.
//!
//! ## Commands
//!
//! - `config`: run once (or print the plan with `--dry-run`)
//! - `report`: queue and deliver a manual report
//! - `state`: inspect or reset the persisted run state
//! - `agent`: run the periodic loop until interrupted

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fleet_core::telemetry::{init_tracing, level_for_verbosity};
use fleet_core::{
    manual_report, Agent, AgentConfig, CommittedConfig, ControlPlane, HttpControlPlane, RunReport,
    Trigger, TriggerHandle, DEFAULT_CONFIG_PATH,
};
use fleet_host::{HostProvider, SystemHost, SystemHostConfig};
use fleet_state::{FileStateStore, Severity, StateStore};

#[derive(Parser)]
#[command(name = "fleet")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Fleet device agent: declarative configuration reconciliation", long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct GlobalArgs {
    /// Agent configuration file (JSON)
    #[arg(long, global = true, env = "FLEET_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Directory holding the run state
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Control-plane base URL
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Device identity at the control plane
    #[arg(long, global = true)]
    device_id: Option<String>,

    /// More output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch the committed configuration and reconcile the host once
    Config {
        /// Print what would change without touching the host
        #[arg(long)]
        dry_run: bool,

        /// Use a local JSON document instead of fetching
        #[arg(long)]
        from_file: Option<PathBuf>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Queue a manual report and try to deliver it now
    Report {
        /// INFO, WARN, ERR or CRIT
        #[arg(long, value_parser = parse_severity)]
        severity: Severity,

        /// Report text
        #[arg(long)]
        text: String,

        /// Bundle tag the report is filed under
        #[arg(long, default_value = "custom")]
        bundle: String,

        /// Extra label (repeatable)
        #[arg(long = "label")]
        labels: Vec<String>,
    },

    /// Inspect or reset the persisted run state
    State {
        #[command(subcommand)]
        action: StateAction,
    },

    /// Run the agent loop in the foreground until interrupted
    Agent,
}

#[derive(Subcommand)]
enum StateAction {
    /// Print the persisted run state
    Show {
        /// Print the raw state document
        #[arg(long)]
        json: bool,
    },
    /// Forget every fingerprint and pending report
    Reset,
}

fn parse_severity(s: &str) -> std::result::Result<Severity, String> {
    s.parse()
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.global.json_logs, level_for_verbosity(cli.global.verbose));

    match dispatch(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Returns whether the command fully succeeded.
async fn dispatch(cli: Cli) -> Result<bool> {
    let offline = matches!(
        &cli.command,
        Commands::Config { from_file: Some(_), .. } | Commands::State { .. }
    );
    let config = resolve_config(&cli.global, offline)?;

    match cli.command {
        Commands::State { action } => match action {
            StateAction::Show { json } => cmd_state_show(&*open_store(&config)?, json).await,
            StateAction::Reset => cmd_state_reset(&*open_store(&config)?).await,
        },
        Commands::Config {
            dry_run,
            from_file,
            json,
        } => {
            let agent = build_agent(config).await?;
            match from_file {
                Some(path) => {
                    let document = read_document(&path)?;
                    cmd_config_local(&agent, &document, dry_run, json).await
                }
                None => cmd_config(&agent, dry_run, json).await,
            }
        }
        Commands::Report {
            severity,
            text,
            bundle,
            labels,
        } => {
            let agent = build_agent(config).await?;
            cmd_report(&agent, severity, &text, &bundle, labels).await
        }
        Commands::Agent => {
            let agent = Arc::new(build_agent(config).await?);
            cmd_agent(agent).await
        }
    }
}

/// Defaults, then the config file, then `FLEET_*` variables, then flags.
fn resolve_config(args: &GlobalArgs, offline: bool) -> Result<AgentConfig> {
    let mut config = AgentConfig::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    config.apply_env().context("invalid FLEET_* environment")?;
    apply_flags(&mut config, args);
    if offline {
        config.validate_local()?;
    } else {
        config.validate()?;
    }
    Ok(config)
}

fn apply_flags(config: &mut AgentConfig, args: &GlobalArgs) {
    if let Some(dir) = &args.state_dir {
        config.state_dir = dir.clone();
    }
    if let Some(url) = &args.api_url {
        config.api_url = url.clone();
    }
    if let Some(id) = &args.device_id {
        config.device_id = id.clone();
    }
}

fn open_store(config: &AgentConfig) -> Result<Arc<dyn StateStore>> {
    let store = FileStateStore::new(&config.state_dir)
        .with_context(|| format!("failed to open state directory {}", config.state_dir.display()))?;
    Ok(Arc::new(store))
}

async fn build_agent(config: AgentConfig) -> Result<Agent> {
    let host: Arc<dyn HostProvider> = Arc::new(SystemHost::new(SystemHostConfig {
        labels: config.labels.clone(),
        ..SystemHostConfig::default()
    }));
    let control: Arc<dyn ControlPlane> = Arc::new(
        HttpControlPlane::from_config(&config).context("failed to build control-plane client")?,
    );
    let store = open_store(&config)?;
    Agent::new(config, host, control, store)
        .await
        .context("failed to start agent")
}

fn read_document(path: &Path) -> Result<CommittedConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    CommittedConfig::parse(&text).with_context(|| format!("{} is not a valid configuration", path.display()))
}

async fn cmd_config(agent: &Agent, dry_run: bool, json: bool) -> Result<bool> {
    let cancel = interrupt_token();
    if dry_run {
        let plan = agent.plan(&cancel).await?;
        print_plan(&plan, json)?;
        return Ok(!plan.has_errors());
    }
    let report = agent.run_once(Trigger::RunNow, &cancel).await?;
    print_run(&report, json)?;
    Ok(report.succeeded())
}

/// Local documents may run without a control plane; undelivered reports
/// then stay queued and do not fail the command.
async fn cmd_config_local(
    agent: &Agent,
    document: &CommittedConfig,
    dry_run: bool,
    json: bool,
) -> Result<bool> {
    if dry_run {
        let plan = agent.plan_with_config(document).await;
        print_plan(&plan, json)?;
        return Ok(!plan.has_errors());
    }
    let cancel = interrupt_token();
    let report = agent
        .run_with_config(document, Trigger::RunNow, &cancel)
        .await?;
    print_run(&report, json)?;
    let connected = !agent.config().api_url.trim().is_empty();
    Ok(if connected {
        report.succeeded()
    } else {
        report.outcome.is_success()
    })
}

async fn cmd_report(
    agent: &Agent,
    severity: Severity,
    text: &str,
    bundle: &str,
    labels: Vec<String>,
) -> Result<bool> {
    if text.trim().is_empty() {
        bail!("report text must not be empty");
    }
    let report = manual_report(bundle, severity, text, labels, None);
    let summary = agent.inject_report(report, &interrupt_token()).await?;
    if summary.delivered > 0 {
        println!("report delivered");
    } else {
        println!(
            "report queued ({} pending): {}",
            summary.remaining,
            summary.error.as_deref().unwrap_or("not delivered")
        );
    }
    Ok(summary.remaining == 0 && summary.error.is_none())
}

async fn cmd_state_show(store: &dyn StateStore, json: bool) -> Result<bool> {
    let state = store.load().await.context("failed to read run state")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(true);
    }
    println!("State:         {}", store.location());
    println!(
        "Last applied:  {}",
        state
            .last_applied_commit_id
            .as_ref()
            .map(|c| c.as_str())
            .unwrap_or("-")
    );
    println!(
        "Last run:      {}",
        state
            .last_run_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string())
    );
    println!("Fingerprints:  {}", state.fingerprints.len());
    for (key, fingerprint) in &state.fingerprints {
        println!("  {:<48} {}", key.as_str(), short(fingerprint.as_str()));
    }
    println!("Pending:       {}", state.pending_reports.len());
    Ok(true)
}

/// Works on a corrupt state file too, which is how an operator recovers.
async fn cmd_state_reset(store: &dyn StateStore) -> Result<bool> {
    store.reset().await.context("failed to reset run state")?;
    println!("run state at {} reset", store.location());
    Ok(true)
}

async fn cmd_agent(agent: Arc<Agent>) -> Result<bool> {
    let (handle, triggers) = TriggerHandle::channel(8);
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received; stopping");
                shutdown.cancel();
            }
        }
    });
    // Keep the sender alive for the lifetime of the loop.
    let _handle = handle;
    agent
        .run_loop(triggers, shutdown)
        .await
        .context("agent loop stopped on a fatal error")?;
    Ok(true)
}

/// Cancelled on ctrl-c so an interrupted run leaves consistent state.
fn interrupt_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; cancelling run");
                cancel.cancel();
            }
        }
    });
    cancel
}

fn print_plan(plan: &fleet_core::RunPlan, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(plan)?);
    } else {
        println!("{plan}");
    }
    Ok(())
}

fn print_run(report: &RunReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!(
        "Run {} ({}): {}",
        short(&report.run_id),
        report.trigger,
        report.outcome
    );
    if let Some(commit) = &report.commit_id {
        println!("Commit:    {commit}");
    }
    let c = &report.counts;
    println!(
        "Items:     {} applied, {} adopted, {} unchanged, {} failed, {} skipped",
        c.applied, c.adopted, c.unchanged, c.failed, c.skipped
    );
    println!(
        "Reports:   {} produced, {} delivered, {} pending",
        report.reports, report.flush.delivered, report.flush.remaining
    );
    if let Some(err) = &report.flush.error {
        println!("Delivery:  {err}");
    }
    Ok(())
}

fn short(s: &str) -> &str {
    s.get(..12).unwrap_or(s)
}
