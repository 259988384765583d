//! Crawl scheduling.
//!
//! [`Scheduler`] is pure: every decision is a function of the source list, an
//! explicit [`ScheduleState`] and the current time supplied by a [`Clock`].
//! The pipeline owns the state and persists nothing beyond crawl runs;
//! [`seed_state`] rebuilds it from those on startup.

use std::collections::BTreeMap;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use gleaner_shared::{AppConfig, CrawlRunStatus, GleanerError, Result, Source, SourceId};
use gleaner_storage::Storage;

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Source of "now" for the run loop.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: StdMutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            now: StdMutex::new(at),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = at;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Scheduling state of one source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSchedule {
    /// Start of the most recent run.
    pub last_started: Option<DateTime<Utc>>,
    /// Set while a crawl is running.
    pub in_flight_since: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    /// When a crawl timed out. The next run waits for the first tick after it.
    pub timed_out_at: Option<DateTime<Utc>>,
}

/// Scheduling state of every source, keyed by id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleState {
    sources: BTreeMap<SourceId, SourceSchedule>,
}

impl ScheduleState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &SourceId) -> Option<&SourceSchedule> {
        self.sources.get(id)
    }

    fn entry(&mut self, id: &SourceId) -> &mut SourceSchedule {
        self.sources.entry(*id).or_default()
    }

    pub fn is_in_flight(&self, id: &SourceId) -> bool {
        self.get(id).is_some_and(|s| s.in_flight_since.is_some())
    }

    pub fn in_flight_count(&self) -> usize {
        self.sources
            .values()
            .filter(|s| s.in_flight_since.is_some())
            .count()
    }

    /// Forget a source (e.g. after deactivation).
    pub fn remove(&mut self, id: &SourceId) {
        self.sources.remove(id);
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Runtime scheduler settings, derived from `[scheduler]`.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the run loop wakes up.
    pub tick: Duration,
    /// In-flight crawls older than this are considered lost.
    pub crawl_timeout: Duration,
    pub max_consecutive_failures: u32,
    pub max_concurrent_crawls: u32,
}

impl From<&AppConfig> for SchedulerConfig {
    fn from(config: &AppConfig) -> Self {
        let s = &config.scheduler;
        Self {
            tick: Duration::from_secs(s.tick_secs),
            crawl_timeout: Duration::from_secs(s.crawl_timeout_secs),
            max_consecutive_failures: s.max_consecutive_failures,
            max_concurrent_crawls: s.max_concurrent_crawls,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

/// How a crawl run ended, from the scheduler's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    Failure,
    /// Stopped by the operator. Leaves the failure streak as it was.
    Interrupted,
}

impl From<CrawlRunStatus> for RunOutcome {
    fn from(status: CrawlRunStatus) -> Self {
        match status {
            CrawlRunStatus::Completed | CrawlRunStatus::CompletedWithErrors => Self::Success,
            CrawlRunStatus::Cancelled => Self::Interrupted,
            CrawlRunStatus::Running | CrawlRunStatus::Failed | CrawlRunStatus::TimedOut => {
                Self::Failure
            }
        }
    }
}

/// What the pipeline should do with a source after a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunDisposition {
    Continue,
    /// Too many consecutive failures.
    Deactivate { consecutive_failures: u32 },
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Active sources due at or before `now`, sorted by id.
    ///
    /// In-flight crawls older than the crawl timeout are expired first (see
    /// [`Scheduler::expire_stale`]); their dispositions are dropped here, so
    /// callers that act on deactivation call `expire_stale` themselves first.
    pub fn due_sources(
        &self,
        sources: &[Source],
        state: &mut ScheduleState,
        now: DateTime<Utc>,
    ) -> Vec<Source> {
        self.expire_stale(state, now);

        let mut due: Vec<Source> = sources
            .iter()
            .filter(|source| source.is_active)
            .filter(|source| {
                if state.is_in_flight(&source.id) {
                    let conflict = GleanerError::ScheduleConflict {
                        source_id: source.id.to_string(),
                    };
                    debug!(source = %source.name, reason = %conflict, "skipping source");
                    return false;
                }
                self.is_due(source, state.get(&source.id), now)
            })
            .cloned()
            .collect();
        due.sort_by(|a, b| a.id.cmp(&b.id));
        due
    }

    /// When `source` next becomes due. `None` for a schedule with no future
    /// ticks or an unparseable expression.
    pub fn next_due(&self, source: &Source, schedule: Option<&SourceSchedule>) -> Option<DateTime<Utc>> {
        let cron = match source.cron() {
            Ok(cron) => cron,
            Err(e) => {
                warn!(source = %source.name, error = %e, "invalid schedule");
                return None;
            }
        };
        let Some(schedule) = schedule else {
            return Some(DateTime::<Utc>::MIN_UTC);
        };
        match schedule.last_started.max(schedule.timed_out_at) {
            Some(anchor) => cron.next_after(&anchor),
            None => Some(DateTime::<Utc>::MIN_UTC),
        }
    }

    fn is_due(&self, source: &Source, schedule: Option<&SourceSchedule>, now: DateTime<Utc>) -> bool {
        self.next_due(source, schedule).is_some_and(|at| at <= now)
    }

    /// Mark `id` in flight.
    pub fn begin_run(&self, state: &mut ScheduleState, id: &SourceId, now: DateTime<Utc>) -> Result<()> {
        let entry = state.entry(id);
        if entry.in_flight_since.is_some() {
            return Err(GleanerError::ScheduleConflict {
                source_id: id.to_string(),
            });
        }
        entry.in_flight_since = Some(now);
        entry.last_started = Some(now);
        entry.timed_out_at = None;
        Ok(())
    }

    /// Clear the in-flight mark and update the failure streak.
    pub fn complete_run(
        &self,
        state: &mut ScheduleState,
        id: &SourceId,
        outcome: RunOutcome,
    ) -> RunDisposition {
        let entry = state.entry(id);
        entry.in_flight_since = None;
        self.record_outcome(entry, outcome)
    }

    fn record_outcome(&self, entry: &mut SourceSchedule, outcome: RunOutcome) -> RunDisposition {
        match outcome {
            RunOutcome::Success => {
                entry.consecutive_failures = 0;
                RunDisposition::Continue
            }
            RunOutcome::Failure => {
                entry.consecutive_failures += 1;
                if entry.consecutive_failures >= self.config.max_consecutive_failures.max(1) {
                    RunDisposition::Deactivate {
                        consecutive_failures: entry.consecutive_failures,
                    }
                } else {
                    RunDisposition::Continue
                }
            }
            RunOutcome::Interrupted => RunDisposition::Continue,
        }
    }

    /// Expire in-flight crawls older than the crawl timeout. Each counts as a
    /// failure, and the source waits for its next schedule tick after `now`.
    pub fn expire_stale(
        &self,
        state: &mut ScheduleState,
        now: DateTime<Utc>,
    ) -> Vec<(SourceId, RunDisposition)> {
        let timeout = chrono::Duration::from_std(self.config.crawl_timeout)
            .unwrap_or(chrono::Duration::MAX);
        let mut expired = Vec::new();
        for (id, entry) in state.sources.iter_mut() {
            let Some(since) = entry.in_flight_since else {
                continue;
            };
            if now - since < timeout {
                continue;
            }
            warn!(source_id = %id, since = %since, "crawl timed out");
            entry.in_flight_since = None;
            entry.timed_out_at = Some(now);
            let disposition = self.record_outcome(entry, RunOutcome::Failure);
            expired.push((*id, disposition));
        }
        expired
    }
}

/// Rebuild scheduler state from recorded crawl runs: the start of the latest
/// finished run and the current failure streak of each source.
pub async fn seed_state(storage: &Storage, sources: &[Source], max_failures: u32) -> Result<ScheduleState> {
    let mut state = ScheduleState::new();
    for source in sources {
        let Some(last) = storage.last_finished_run(&source.id).await? else {
            continue;
        };
        let recent = storage
            .list_crawl_runs(&source.id, max_failures.max(1))
            .await?;
        let streak = recent
            .iter()
            .filter(|run| run.finished_at.is_some())
            .map(|run| RunOutcome::from(run.status))
            .filter(|outcome| *outcome != RunOutcome::Interrupted)
            .take_while(|outcome| *outcome == RunOutcome::Failure)
            .count() as u32;

        let entry = state.entry(&source.id);
        entry.last_started = Some(last.started_at);
        entry.consecutive_failures = streak;
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use gleaner_shared::SourceType;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, h, m, 0).unwrap()
    }

    fn feed(name: &str, schedule: &str) -> Source {
        Source::new(name, "https://example.org/feed", SourceType::Feed, schedule).unwrap()
    }

    fn scheduler() -> Scheduler {
        Scheduler::new(SchedulerConfig {
            tick: Duration::from_secs(60),
            crawl_timeout: Duration::from_secs(30 * 60),
            max_consecutive_failures: 3,
            max_concurrent_crawls: 4,
        })
    }

    #[test]
    fn never_run_is_due_immediately() {
        let s = scheduler();
        let src = feed("f", "0 */4 * * *");
        let mut state = ScheduleState::new();
        let due = s.due_sources(std::slice::from_ref(&src), &mut state, at(1, 7));
        assert_eq!(due.len(), 1);
    }

    #[test]
    fn next_tick_after_start() {
        let s = scheduler();
        let src = feed("f", "0 */4 * * *");
        let mut state = ScheduleState::new();

        s.begin_run(&mut state, &src.id, at(4, 0)).unwrap();
        assert_eq!(
            s.complete_run(&mut state, &src.id, RunOutcome::Success),
            RunDisposition::Continue
        );

        assert_eq!(s.next_due(&src, state.get(&src.id)), Some(at(8, 0)));
        assert!(s.due_sources(std::slice::from_ref(&src), &mut state, at(7, 59)).is_empty());
        assert_eq!(s.due_sources(std::slice::from_ref(&src), &mut state, at(8, 0)).len(), 1);
    }

    #[test]
    fn in_flight_is_skipped_and_conflicts() {
        let s = scheduler();
        let src = feed("f", "* * * * *");
        let mut state = ScheduleState::new();
        s.begin_run(&mut state, &src.id, at(1, 0)).unwrap();

        assert!(s.due_sources(std::slice::from_ref(&src), &mut state, at(1, 5)).is_empty());
        let err = s.begin_run(&mut state, &src.id, at(1, 5)).unwrap_err();
        assert!(matches!(err, GleanerError::ScheduleConflict { .. }));
    }

    #[test]
    fn inactive_sources_are_never_due() {
        let s = scheduler();
        let mut src = feed("f", "* * * * *");
        src.is_active = false;
        assert!(s
            .due_sources(&[src], &mut ScheduleState::new(), at(1, 0))
            .is_empty());
    }

    #[test]
    fn stable_order_by_id() {
        let s = scheduler();
        let a = feed("a", "* * * * *");
        let b = feed("b", "* * * * *");
        let c = feed("c", "* * * * *");
        let due = s.due_sources(
            &[c.clone(), a.clone(), b.clone()],
            &mut ScheduleState::new(),
            at(1, 0),
        );
        let ids: Vec<SourceId> = due.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![a.id, b.id, c.id]);
    }

    #[test]
    fn timed_out_run_waits_for_next_tick() {
        let s = scheduler();
        let src = feed("f", "0 */4 * * *");
        let mut state = ScheduleState::new();
        s.begin_run(&mut state, &src.id, at(0, 0)).unwrap();

        // 00:20 is inside the timeout window.
        assert!(s.expire_stale(&mut state, at(0, 20)).is_empty());

        // At 04:00 the run is stale; the 04:00 tick itself is not reused.
        let expired = s.expire_stale(&mut state, at(4, 0));
        assert_eq!(expired, vec![(src.id, RunDisposition::Continue)]);
        assert!(!state.is_in_flight(&src.id));
        assert_eq!(state.get(&src.id).unwrap().consecutive_failures, 1);
        assert!(s.due_sources(std::slice::from_ref(&src), &mut state, at(4, 0)).is_empty());
        assert_eq!(s.due_sources(std::slice::from_ref(&src), &mut state, at(8, 0)).len(), 1);
    }

    #[test]
    fn repeated_failures_deactivate() {
        let s = scheduler();
        let id = SourceId::new();
        let mut state = ScheduleState::new();
        for i in 1..=3 {
            s.begin_run(&mut state, &id, at(i, 0)).unwrap();
            let disposition = s.complete_run(&mut state, &id, RunOutcome::Failure);
            if i < 3 {
                assert_eq!(disposition, RunDisposition::Continue);
            } else {
                assert_eq!(
                    disposition,
                    RunDisposition::Deactivate {
                        consecutive_failures: 3
                    }
                );
            }
        }

        // Success resets the streak.
        let other = SourceId::new();
        s.begin_run(&mut state, &other, at(1, 0)).unwrap();
        s.complete_run(&mut state, &other, RunOutcome::Failure);
        s.begin_run(&mut state, &other, at(2, 0)).unwrap();
        s.complete_run(&mut state, &other, RunOutcome::Success);
        assert_eq!(state.get(&other).unwrap().consecutive_failures, 0);
    }

    #[test]
    fn interrupted_runs_leave_the_streak_alone() {
        let s = scheduler();
        let id = SourceId::new();
        let mut state = ScheduleState::new();

        s.begin_run(&mut state, &id, at(1, 0)).unwrap();
        s.complete_run(&mut state, &id, RunOutcome::Failure);
        for hour in 2..=6 {
            s.begin_run(&mut state, &id, at(hour, 0)).unwrap();
            let disposition =
                s.complete_run(&mut state, &id, RunOutcome::from(CrawlRunStatus::Cancelled));
            assert_eq!(disposition, RunDisposition::Continue);
        }
        let entry = state.get(&id).unwrap();
        assert_eq!(entry.consecutive_failures, 1);
        assert!(!state.is_in_flight(&id));
        assert_eq!(RunOutcome::from(CrawlRunStatus::TimedOut), RunOutcome::Failure);
    }

    #[test]
    fn state_serializes() {
        let s = scheduler();
        let id = SourceId::new();
        let mut state = ScheduleState::new();
        s.begin_run(&mut state, &id, at(1, 0)).unwrap();
        let json = serde_json::to_string(&state).unwrap();
        let back: ScheduleState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn manual_clock_moves_only_when_told() {
        let clock = ManualClock::new(at(1, 0));
        assert_eq!(clock.now(), at(1, 0));
        clock.advance(chrono::Duration::minutes(30));
        assert_eq!(clock.now(), at(1, 30));
        clock.set(at(5, 0));
        assert_eq!(clock.now(), at(5, 0));
    }

    #[tokio::test]
    async fn seeds_from_crawl_runs() {
        let path = std::env::temp_dir().join(format!("gleaner_test_{}.db", uuid::Uuid::now_v7()));
        let storage = Storage::open(&path).await.unwrap();
        let src = feed("seeded", "0 */4 * * *");
        storage.insert_source(&src).await.unwrap();

        let ok = storage.insert_crawl_run(&src.id, at(0, 0)).await.unwrap();
        storage
            .finish_crawl_run(&ok, CrawlRunStatus::Completed, &serde_json::json!({}))
            .await
            .unwrap();
        let bad = storage.insert_crawl_run(&src.id, at(4, 0)).await.unwrap();
        storage
            .finish_crawl_run(&bad, CrawlRunStatus::Failed, &serde_json::json!({}))
            .await
            .unwrap();

        let state = seed_state(&storage, std::slice::from_ref(&src), 5).await.unwrap();
        let entry = state.get(&src.id).unwrap();
        assert_eq!(entry.last_started, Some(at(4, 0)));
        assert_eq!(entry.consecutive_failures, 1);
        assert!(entry.in_flight_since.is_none());

        let s = scheduler();
        assert_eq!(s.next_due(&src, Some(entry)), Some(at(8, 0)));

        let _ = std::fs::remove_file(&path);
    }
}
