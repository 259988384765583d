//! The ingestion pipeline: due sources → crawl → normalize.
//!
//! [`Pipeline::run_due`] runs one scheduler tick to completion (`gleaner run
//! --once`); [`Pipeline::run_forever`] keeps dispatching until cancelled.
//! Crawls run concurrently, bounded by `scheduler.max_concurrent_crawls`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use gleaner_crawler::{CancelToken, CrawlReport, Crawler, CrawlerConfig};
use gleaner_shared::{
    AppConfig, ArtifactState, CrawlRunStatus, GleanerError, Result, Source, SourceId,
};
use gleaner_storage::{ContentStore, Storage};

use crate::normalizer::{NormalizeSummary, Normalizer};
use crate::scheduler::{
    Clock, RunDisposition, RunOutcome, ScheduleState, Scheduler, SchedulerConfig, seed_state,
};

/// Runtime pipeline settings, derived from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub scheduler: SchedulerConfig,
    /// Normalize the artifacts a crawl touched as soon as it finishes.
    pub normalize_after_crawl: bool,
    /// Artifacts left in `fetched` swept per tick.
    pub pending_batch: u32,
}

impl From<&AppConfig> for PipelineConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            scheduler: SchedulerConfig::from(config),
            normalize_after_crawl: true,
            pending_batch: 500,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

/// Outcome of one crawl run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub source_id: SourceId,
    pub source_name: String,
    pub run_id: String,
    pub status: CrawlRunStatus,
    pub report: CrawlReport,
    pub normalized: NormalizeSummary,
    /// The source was soft-deactivated after this run.
    pub deactivated: bool,
}

/// Outcome of one scheduler tick.
#[derive(Debug, Default)]
pub struct TickSummary {
    pub runs: Vec<RunSummary>,
    /// Runs aborted by infrastructure failures.
    pub errors: Vec<(SourceId, String)>,
    /// In-flight crawls expired this tick.
    pub timed_out: Vec<SourceId>,
    pub deactivated: Vec<SourceId>,
    /// `fetched` artifacts normalized by the sweep.
    pub swept: NormalizeSummary,
    pub elapsed: Duration,
}

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    fn crawl_started(&self, source: &Source);
    fn crawl_finished(&self, run: &RunSummary);
    /// Called when a tick completes.
    fn done(&self, tick: &TickSummary);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn crawl_started(&self, _source: &Source) {}
    fn crawl_finished(&self, _run: &RunSummary) {}
    fn done(&self, _tick: &TickSummary) {}
}

type RunResult = (SourceId, Result<RunSummary>);

/// Scheduler, crawler and normalizer wired to one data directory.
#[derive(Clone)]
pub struct Pipeline {
    config: PipelineConfig,
    storage: Arc<Storage>,
    store: Arc<ContentStore>,
    crawler: Arc<Crawler>,
    normalizer: Normalizer,
    scheduler: Scheduler,
    state: Arc<Mutex<ScheduleState>>,
    crawl_slots: Arc<Semaphore>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        storage: Arc<Storage>,
        store: Arc<ContentStore>,
        crawler: Arc<Crawler>,
        normalizer: Normalizer,
    ) -> Self {
        let slots = config.scheduler.max_concurrent_crawls.max(1) as usize;
        Self {
            scheduler: Scheduler::new(config.scheduler.clone()),
            config,
            storage,
            store,
            crawler,
            normalizer,
            state: Arc::new(Mutex::new(ScheduleState::new())),
            crawl_slots: Arc::new(Semaphore::new(slots)),
        }
    }

    /// Build every component from the application config.
    pub fn from_config(
        config: &AppConfig,
        storage: Arc<Storage>,
        store: Arc<ContentStore>,
    ) -> Result<Self> {
        let crawler = Arc::new(Crawler::new(CrawlerConfig::from(config))?);
        let normalizer = Normalizer::from_config(config, storage.clone(), store.clone());
        Ok(Self::new(
            PipelineConfig::from(config),
            storage,
            store,
            crawler,
            normalizer,
        ))
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    /// Rebuild scheduler state from recorded crawl runs.
    pub async fn seed(&self) -> Result<()> {
        let sources = self.storage.list_sources().await?;
        let seeded = seed_state(
            &self.storage,
            &sources,
            self.config.scheduler.max_consecutive_failures,
        )
        .await?;
        *self.state.lock().await = seeded;
        debug!(sources = sources.len(), "scheduler state seeded");
        Ok(())
    }

    /// A copy of the current scheduler state.
    pub async fn schedule_snapshot(&self) -> ScheduleState {
        self.state.lock().await.clone()
    }

    /// Run every source due at `now` and wait for all of them.
    #[instrument(skip_all, fields(now = %now))]
    pub async fn run_due(
        &self,
        now: DateTime<Utc>,
        cancel: &CancelToken,
        progress: Arc<dyn ProgressReporter>,
    ) -> Result<TickSummary> {
        let start = Instant::now();
        let mut tick = TickSummary::default();
        let mut tasks = JoinSet::new();

        progress.phase("Scheduling");
        self.dispatch(now, cancel, &progress, &mut tasks, &mut tick)
            .await?;

        progress.phase("Crawling");
        while let Some(joined) = tasks.join_next().await {
            self.collect(joined, &mut tick);
        }

        if !cancel.is_cancelled() {
            progress.phase("Normalizing pending artifacts");
            tick.swept = self
                .normalizer
                .normalize_pending(self.config.pending_batch)
                .await?;
        }

        tick.elapsed = start.elapsed();
        info!(
            runs = tick.runs.len(),
            errors = tick.errors.len(),
            deactivated = tick.deactivated.len(),
            "tick complete"
        );
        progress.done(&tick);
        Ok(tick)
    }

    /// Dispatch due sources every tick until `cancel` fires, then wait for
    /// in-flight crawls to wind down.
    pub async fn run_forever(
        &self,
        clock: Arc<dyn Clock>,
        cancel: &CancelToken,
        progress: Arc<dyn ProgressReporter>,
    ) -> Result<()> {
        self.seed().await?;
        let swept = self
            .normalizer
            .normalize_pending(self.config.pending_batch)
            .await?;
        if !swept.normalized.is_empty() || !swept.failed.is_empty() {
            info!(
                normalized = swept.normalized.len(),
                failed = swept.failed.len(),
                "normalized artifacts left from earlier runs"
            );
        }

        let mut tasks: JoinSet<RunResult> = JoinSet::new();
        info!(tick_secs = self.config.scheduler.tick.as_secs(), "pipeline running");

        loop {
            let mut tick = TickSummary::default();
            if let Err(e) = self
                .dispatch(clock.now(), cancel, &progress, &mut tasks, &mut tick)
                .await
            {
                error!(error = %e, "scheduling failed");
            }

            let sleep = tokio::time::sleep(self.config.scheduler.tick);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = &mut sleep => break,
                    Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                        self.collect(joined, &mut tick);
                    }
                }
            }
            if !tick.runs.is_empty() || !tick.errors.is_empty() {
                progress.done(&tick);
            }
            if cancel.is_cancelled() {
                break;
            }
        }

        info!(in_flight = tasks.len(), "shutting down, waiting for crawls");
        let mut tick = TickSummary::default();
        while let Some(joined) = tasks.join_next().await {
            self.collect(joined, &mut tick);
        }
        Ok(())
    }

    /// Crawl one source now, regardless of its schedule.
    pub async fn run_source(
        &self,
        source: &Source,
        cancel: &CancelToken,
        progress: &dyn ProgressReporter,
    ) -> Result<RunSummary> {
        if !source.is_active {
            return Err(GleanerError::validation(format!(
                "source '{}' is inactive",
                source.name
            )));
        }
        let now = Utc::now();
        {
            let mut state = self.state.lock().await;
            self.scheduler.begin_run(&mut state, &source.id, now)?;
        }
        let _slot = self
            .crawl_slots
            .acquire()
            .await
            .map_err(|_| GleanerError::Cancelled)?;
        self.execute(source, now, cancel, progress).await
    }

    // ---- Internals ----

    async fn dispatch(
        &self,
        now: DateTime<Utc>,
        cancel: &CancelToken,
        progress: &Arc<dyn ProgressReporter>,
        tasks: &mut JoinSet<RunResult>,
        tick: &mut TickSummary,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let sources = self.storage.list_active_sources().await?;

        let (due, expired) = {
            let mut state = self.state.lock().await;
            let expired = self.scheduler.expire_stale(&mut state, now);
            let mut due = Vec::new();
            for source in self.scheduler.due_sources(&sources, &mut state, now) {
                match self.scheduler.begin_run(&mut state, &source.id, now) {
                    Ok(()) => due.push(source),
                    Err(e) => debug!(source = %source.name, reason = %e, "skipping source"),
                }
            }
            (due, expired)
        };

        for (id, disposition) in expired {
            tick.timed_out.push(id);
            if let RunDisposition::Deactivate {
                consecutive_failures,
            } = disposition
            {
                self.deactivate(&id, consecutive_failures).await?;
                tick.deactivated.push(id);
            }
        }

        if !due.is_empty() {
            info!(count = due.len(), "sources due");
        }
        for source in due {
            let this = self.clone();
            let cancel = cancel.clone();
            let progress = progress.clone();
            tasks.spawn(async move {
                let id = source.id;
                let result = match this.crawl_slots.clone().acquire_owned().await {
                    Ok(_slot) => this.execute(&source, now, &cancel, progress.as_ref()).await,
                    Err(_) => Err(GleanerError::Cancelled),
                };
                (id, result)
            });
        }
        Ok(())
    }

    fn collect(
        &self,
        joined: std::result::Result<RunResult, tokio::task::JoinError>,
        tick: &mut TickSummary,
    ) {
        match joined {
            Ok((_, Ok(run))) => {
                if run.deactivated {
                    tick.deactivated.push(run.source_id);
                }
                tick.runs.push(run);
            }
            Ok((id, Err(e))) => {
                error!(source_id = %id, error = %e, "crawl run aborted");
                tick.errors.push((id, e.to_string()));
            }
            Err(e) => error!(error = %e, "crawl task panicked"),
        }
    }

    /// Run one crawl with a timeout, record it, update the scheduler and
    /// normalize what was fetched. The source must already be marked in
    /// flight.
    #[instrument(skip_all, fields(source_id = %source.id, source = %source.name))]
    async fn execute(
        &self,
        source: &Source,
        started_at: DateTime<Utc>,
        cancel: &CancelToken,
        progress: &dyn ProgressReporter,
    ) -> Result<RunSummary> {
        progress.crawl_started(source);

        let run_id = match self.storage.insert_crawl_run(&source.id, started_at).await {
            Ok(id) => id,
            Err(e) => {
                self.complete(&source.id, RunOutcome::Failure).await;
                return Err(e);
            }
        };

        let run_cancel = cancel.child();
        let (result, timed_out) = {
            let crawl = self
                .crawler
                .crawl(source, &self.storage, &self.store, &run_cancel);
            tokio::pin!(crawl);
            tokio::select! {
                result = &mut crawl => (result, false),
                _ = tokio::time::sleep(self.config.scheduler.crawl_timeout) => {
                    warn!(
                        timeout_secs = self.config.scheduler.crawl_timeout.as_secs(),
                        "crawl timed out, cancelling"
                    );
                    run_cancel.cancel();
                    (crawl.await, true)
                }
            }
        };

        let status = match &result {
            Ok(_) if timed_out => CrawlRunStatus::TimedOut,
            Ok(report) => report.status(),
            Err(_) => CrawlRunStatus::Failed,
        };
        let stats = match &result {
            Ok(report) => report.stats(),
            Err(e) => serde_json::json!({ "error": e.to_string() }),
        };

        let finished = self.storage.finish_crawl_run(&run_id, status, &stats).await;
        let disposition = self.complete(&source.id, RunOutcome::from(status)).await;
        finished?;

        let deactivated = match disposition {
            RunDisposition::Deactivate {
                consecutive_failures,
            } => {
                self.deactivate(&source.id, consecutive_failures).await?;
                true
            }
            RunDisposition::Continue => false,
        };

        let report = result?;
        let normalized = if self.config.normalize_after_crawl && !report.cancelled {
            let fetched = report
                .artifacts
                .iter()
                .filter(|a| a.state == ArtifactState::Fetched)
                .map(|a| a.id);
            self.normalizer.normalize_all(fetched).await?
        } else {
            NormalizeSummary::default()
        };

        let summary = RunSummary {
            source_id: source.id,
            source_name: source.name.clone(),
            run_id,
            status,
            report,
            normalized,
            deactivated,
        };
        info!(
            status = %summary.status,
            fetched = summary.report.fetched,
            new = summary.report.new_artifacts,
            normalized = summary.normalized.normalized.len(),
            extraction_failures = summary.normalized.failed.len(),
            "crawl run finished"
        );
        progress.crawl_finished(&summary);
        Ok(summary)
    }

    async fn complete(&self, id: &SourceId, outcome: RunOutcome) -> RunDisposition {
        let mut state = self.state.lock().await;
        self.scheduler.complete_run(&mut state, id, outcome)
    }

    async fn deactivate(&self, id: &SourceId, consecutive_failures: u32) -> Result<()> {
        let reason = format!("deactivated after {consecutive_failures} consecutive failed crawls");
        self.storage.set_source_active(id, false, Some(&reason)).await?;
        self.state.lock().await.remove(id);
        warn!(source_id = %id, %reason, "source deactivated");
        Ok(())
    }
}
