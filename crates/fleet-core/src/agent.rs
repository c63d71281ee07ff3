//! The agent: one run is fetch, reconcile, commit, deliver. The loop
//! around it is driven by the [`Scheduler`].

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use fleet_host::HostProvider;
use fleet_state::{Report, Severity, StateStore};

use crate::config::AgentConfig;
use crate::control_plane::{ControlPlane, FetchOutcome};
use crate::domain::committed::CommittedConfig;
use crate::domain::error::{AgentError, Result};
use crate::domain::report::ReportFactory;
use crate::engine::{Engine, ItemCounts, RunOutcome, RunPlan};
use crate::metrics::METRICS;
use crate::obs;
use crate::pipeline::{FlushSummary, ReportPipeline};
use crate::retry::with_backoff;
use crate::scheduler::{Decision, Scheduler, Trigger};
use crate::state::StateKeeper;

/// Summary of one run as seen by the caller.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub trigger: Trigger,
    /// Commit reconciled, if a document was obtained
    pub commit_id: Option<String>,
    pub outcome: RunOutcome,
    pub counts: ItemCounts,
    /// Reports produced by this run
    pub reports: usize,
    pub flush: FlushSummary,
    pub duration_ms: u64,
}

impl RunReport {
    /// Every item converged and every report was delivered.
    pub fn succeeded(&self) -> bool {
        self.outcome.is_success() && self.flush.is_complete()
    }
}

/// A failed save is only fatal when storage is corrupt; otherwise the next
/// save carries the change.
fn tolerate_save_failure(result: Result<()>) -> Result<()> {
    match result {
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => {
            warn!(error = %err, "run state not persisted; next run re-applies from the last saved state");
            Ok(())
        }
        Ok(()) => Ok(()),
    }
}

pub struct Agent {
    config: AgentConfig,
    engine: Engine,
    control: Arc<dyn ControlPlane>,
    keeper: Arc<StateKeeper>,
    pipeline: Arc<ReportPipeline>,
    cached: Mutex<Option<CommittedConfig>>,
}

impl Agent {
    /// Load persisted state and wire the engine and pipeline from `config`.
    pub async fn new(
        config: AgentConfig,
        host: Arc<dyn HostProvider>,
        control: Arc<dyn ControlPlane>,
        store: Arc<dyn StateStore>,
    ) -> Result<Self> {
        let keeper = Arc::new(StateKeeper::open(store).await?);
        let pipeline = Arc::new(ReportPipeline::from_config(
            &config,
            keeper.clone(),
            control.clone(),
        ));
        let engine = Engine::from_config(&config, host, control.clone());
        Ok(Self {
            config,
            engine,
            control,
            keeper,
            pipeline,
            cached: Mutex::new(None),
        })
    }

    pub fn with_engine(mut self, engine: Engine) -> Self {
        self.engine = engine;
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn state(&self) -> &Arc<StateKeeper> {
        &self.keeper
    }

    pub fn pipeline(&self) -> &Arc<ReportPipeline> {
        &self.pipeline
    }

    /// Fetch the committed configuration. A `304` reuses the cached
    /// document; nothing is cached across restarts.
    pub async fn fetch(&self, cancel: &CancellationToken) -> Result<CommittedConfig> {
        let mut cached = self.cached.lock().await;
        let known = cached.as_ref().map(|c| c.commit_id.clone());
        let outcome = with_backoff(&self.config.retry, cancel, "config fetch", || {
            self.control.fetch_config(known.as_ref())
        })
        .await?;
        match outcome {
            FetchOutcome::Modified(document) => {
                let config = CommittedConfig::from_value(document)?;
                debug!(
                    commit_id = %config.commit_id,
                    bundles = config.bundles.len(),
                    ignored = config.ignored.len(),
                    "configuration fetched"
                );
                *cached = Some(config.clone());
                Ok(config)
            }
            FetchOutcome::NotModified => cached.as_ref().cloned().ok_or_else(|| {
                AgentError::Parse("control plane answered not-modified without a cached document".into())
            }),
        }
    }

    /// Dry run against the fetched configuration.
    pub async fn plan(&self, cancel: &CancellationToken) -> Result<RunPlan> {
        let config = self.fetch(cancel).await?;
        Ok(self.plan_with_config(&config).await)
    }

    pub async fn plan_with_config(&self, config: &CommittedConfig) -> RunPlan {
        let state = self.keeper.snapshot().await;
        self.engine.plan_run(config, &state).await
    }

    /// One full run. `Err` only for fatal conditions; everything else is
    /// an outcome in the returned report.
    pub async fn run_once(&self, trigger: Trigger, cancel: &CancellationToken) -> Result<RunReport> {
        let run_id = Uuid::new_v4().to_string();
        let span = obs::run_span(&run_id, trigger.as_str());
        async {
            let started = Instant::now();
            match self.fetch(cancel).await {
                Ok(config) => self.reconcile(&run_id, trigger, &config, started, cancel).await,
                Err(err) => self.abort(&run_id, trigger, err, started, cancel).await,
            }
        }
        .instrument(span)
        .await
    }

    /// One run against a document obtained elsewhere (a local file).
    pub async fn run_with_config(
        &self,
        config: &CommittedConfig,
        trigger: Trigger,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        let run_id = Uuid::new_v4().to_string();
        let span = obs::run_span(&run_id, trigger.as_str());
        self.reconcile(&run_id, trigger, config, Instant::now(), cancel)
            .instrument(span)
            .await
    }

    async fn reconcile(
        &self,
        run_id: &str,
        trigger: Trigger,
        config: &CommittedConfig,
        started: Instant,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        METRICS.inc_runs_started();
        obs::emit_run_started(run_id, config.commit_id.as_str(), config.bundles.len());

        let deadline = tokio::time::Instant::now() + self.config.run_timeout();
        let previous = self.keeper.snapshot().await;
        let result = self
            .engine
            .execute_run(config, &previous, Some(deadline), cancel)
            .await;

        let produced = result.reports.len();
        self.pipeline.enqueue(result.reports).await;
        tolerate_save_failure(self.keeper.commit_run(&result.state).await)?;
        let flush = self.pipeline.flush(cancel).await?;

        let report = RunReport {
            run_id: run_id.to_string(),
            trigger,
            commit_id: Some(config.commit_id.to_string()),
            outcome: result.outcome,
            counts: result.counts,
            reports: produced,
            flush,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        finish(&report);
        Ok(report)
    }

    /// The run ends before any mutation: record why, deliver what we can.
    async fn abort(
        &self,
        run_id: &str,
        trigger: Trigger,
        err: AgentError,
        started: Instant,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        if err.is_fatal() {
            return Err(err);
        }
        METRICS.inc_runs_started();

        let factory = ReportFactory::new(String::new(), self.engine.log_max_bytes());
        let (outcome, notice) = match &err {
            AgentError::Cancelled => (RunOutcome::Cancelled, None),
            AgentError::Parse(_) => (
                RunOutcome::ParseFailed,
                Some(factory.agent_report(Severity::Err, format!("config rejected: {err}"), "")),
            ),
            _ => (
                RunOutcome::FetchFailed,
                Some(factory.agent_report(
                    Severity::Warn,
                    format!("config fetch failed: {err}"),
                    "",
                )),
            ),
        };
        warn!(error = %err, outcome = %outcome, "run aborted before reconciliation");

        let produced = usize::from(notice.is_some());
        if let Some(notice) = notice {
            self.pipeline.enqueue([notice]).await;
            tolerate_save_failure(self.keeper.persist().await)?;
        }
        let flush = self.pipeline.flush(cancel).await?;

        let report = RunReport {
            run_id: run_id.to_string(),
            trigger,
            commit_id: None,
            outcome,
            counts: ItemCounts::default(),
            reports: produced,
            flush,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        finish(&report);
        Ok(report)
    }

    /// Queue one operator report, persist it, and try to deliver it now.
    /// An undelivered report stays queued for the next flush.
    pub async fn inject_report(&self, report: Report, cancel: &CancellationToken) -> Result<FlushSummary> {
        info!(bundle = %report.bundle, severity = %report.severity, "manual report queued");
        self.pipeline.enqueue([report]).await;
        tolerate_save_failure(self.keeper.persist().await)?;
        self.pipeline.flush(cancel).await
    }

    /// Run until `shutdown` fires or a fatal error occurs.
    ///
    /// The first tick fires immediately. Triggers arriving during a run
    /// are coalesced; a config push during a run schedules one follow-up.
    pub async fn run_loop(
        &self,
        mut triggers: mpsc::Receiver<Trigger>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(self.config.run_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let flusher_stop = shutdown.child_token();
        let flusher = self
            .pipeline
            .clone()
            .spawn_flusher(self.config.flush_interval(), flusher_stop.clone());

        info!(
            interval_secs = self.config.run_interval_secs,
            state = %self.keeper.location(),
            "agent loop started"
        );
        let result = self.drive(&mut ticker, &mut triggers, &shutdown).await;

        flusher_stop.cancel();
        if let Err(err) = flusher.await {
            warn!(error = %err, "report flusher task failed");
        }
        info!("agent loop stopped");
        result
    }

    async fn drive(
        &self,
        ticker: &mut Interval,
        triggers: &mut mpsc::Receiver<Trigger>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let mut scheduler = Scheduler::new();
        loop {
            let trigger = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                Some(trigger) = triggers.recv() => trigger,
                _ = ticker.tick() => Trigger::Tick,
            };
            if scheduler.on_trigger(trigger) != Decision::Start {
                continue;
            }

            let mut current = trigger;
            loop {
                if current.resets_timer() {
                    ticker.reset();
                }
                let run = self.run_once(current, shutdown);
                tokio::pin!(run);
                let finished = loop {
                    tokio::select! {
                        result = &mut run => break result,
                        Some(extra) = triggers.recv() => {
                            let decision = scheduler.on_trigger(extra);
                            debug!(trigger = %extra, decision = ?decision, "trigger during run");
                        }
                        _ = ticker.tick() => {
                            scheduler.on_trigger(Trigger::Tick);
                        }
                    }
                };

                match finished {
                    Ok(report) => debug!(
                        run_id = %report.run_id,
                        outcome = %report.outcome,
                        "run complete"
                    ),
                    Err(err) if err.is_fatal() => {
                        error!(error = %err, "fatal error; agent loop stopping");
                        return Err(err);
                    }
                    Err(err) => warn!(error = %err, "run failed"),
                }
                if shutdown.is_cancelled() {
                    return Ok(());
                }
                match scheduler.on_run_finished() {
                    Some(next) => current = next,
                    None => break,
                }
            }
        }
    }
}

fn finish(report: &RunReport) {
    if !report.outcome.is_success() {
        METRICS.inc_runs_failed();
    }
    obs::emit_run_finished(
        &report.run_id,
        report.outcome.as_str(),
        report.duration_ms,
        report.counts.applied,
        report.counts.failed,
    );
    METRICS.flush();
}
