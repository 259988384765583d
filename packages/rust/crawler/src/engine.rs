//! Breadth-first crawl of one source.
//!
//! A run discovers depth-0 seeds, then keeps up to `politeness.concurrency`
//! fetches in flight, writing every response through the content store and
//! recording it against the artifact table. HTML responses feed new links back
//! into the frontier through the [`FollowPolicy`].

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use scraper::{Html, Selector};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};
use url::Url;

use gleaner_shared::{
    AppConfig, Artifact, CrawlRunStatus, FetchDisposition, GleanerError, Result, Source, SourceId,
};
use gleaner_storage::{ContentStore, Storage};

use crate::cancel::CancelToken;
use crate::fetch::{FetchResponse, FetchedDoc, Fetcher, MAX_REDIRECTS};
use crate::policy::{FollowPolicy, ScopePolicy, is_ssrf_target};
use crate::politeness::DomainLimiter;
use crate::robots::RobotsCache;

static LINK_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("valid link selector"));

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Runtime crawler settings, derived from `[crawler]`, `[evasion]` and
/// `[defaults]`.
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    /// Robots.txt product token; also the `User-Agent` prefix when not rotating.
    pub product_token: String,
    pub per_domain_concurrency: u32,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub request_timeout: Duration,
    pub max_body_bytes: u64,
    pub allow_private_hosts: bool,
    pub rotate_user_agents: bool,
    pub user_agents: Vec<String>,
    pub jitter_ms: u64,
    pub default_excludes: Vec<String>,
}

impl From<&AppConfig> for CrawlerConfig {
    fn from(config: &AppConfig) -> Self {
        let crawler = &config.crawler;
        Self {
            product_token: crawler.user_agent.clone(),
            per_domain_concurrency: crawler.per_domain_concurrency,
            max_attempts: crawler.max_attempts,
            backoff_base: Duration::from_millis(crawler.backoff_base_ms),
            backoff_max: Duration::from_millis(crawler.backoff_max_ms),
            request_timeout: Duration::from_secs(crawler.request_timeout_secs),
            max_body_bytes: crawler.max_body_bytes,
            allow_private_hosts: crawler.allow_private_hosts,
            rotate_user_agents: config.evasion.rotate_user_agents,
            user_agents: config.evasion.user_agents.clone(),
            jitter_ms: config.evasion.jitter_ms,
            default_excludes: config.defaults.exclude_patterns.clone(),
        }
    }
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

// ---------------------------------------------------------------------------
// CrawlReport
// ---------------------------------------------------------------------------

/// A URL that could not be fetched during a run.
#[derive(Debug, Clone)]
pub struct FailedFetch {
    pub url: String,
    pub reason: String,
    /// `false` when the URL gave up after exhausting its retries.
    pub permanent: bool,
}

/// Summary of one crawl run.
#[derive(Debug, Clone)]
pub struct CrawlReport {
    pub source_id: SourceId,
    /// Artifacts touched by the run, in completion order.
    pub artifacts: Vec<Artifact>,
    /// Successful responses.
    pub fetched: usize,
    pub new_artifacts: usize,
    /// Known content seen at a new URI.
    pub aliased: usize,
    /// Known content seen at a known URI.
    pub unchanged: usize,
    pub failed: Vec<FailedFetch>,
    /// Links rejected by the follow policy.
    pub excluded: usize,
    pub robots_blocked: usize,
    pub cancelled: bool,
    pub duration: Duration,
}

impl CrawlReport {
    fn new(source_id: SourceId) -> Self {
        Self {
            source_id,
            artifacts: Vec::new(),
            fetched: 0,
            new_artifacts: 0,
            aliased: 0,
            unchanged: 0,
            failed: Vec::new(),
            excluded: 0,
            robots_blocked: 0,
            cancelled: false,
            duration: Duration::ZERO,
        }
    }

    /// Nothing was fetched and at least one URL failed.
    pub fn is_failure(&self) -> bool {
        self.fetched == 0 && !self.failed.is_empty()
    }

    pub fn status(&self) -> CrawlRunStatus {
        if self.cancelled {
            CrawlRunStatus::Cancelled
        } else if self.is_failure() {
            CrawlRunStatus::Failed
        } else if !self.failed.is_empty() {
            CrawlRunStatus::CompletedWithErrors
        } else {
            CrawlRunStatus::Completed
        }
    }

    /// Counters for the crawl run record.
    pub fn stats(&self) -> serde_json::Value {
        serde_json::json!({
            "fetched": self.fetched,
            "new_artifacts": self.new_artifacts,
            "aliased": self.aliased,
            "unchanged": self.unchanged,
            "failed": self.failed.len(),
            "excluded": self.excluded,
            "robots_blocked": self.robots_blocked,
            "cancelled": self.cancelled,
            "duration_ms": self.duration.as_millis() as u64,
        })
    }

    fn record_failure(&mut self, url: &Url, error: &GleanerError) {
        warn!(%url, error = %error, "fetch failed");
        self.failed.push(FailedFetch {
            url: url.to_string(),
            reason: error.to_string(),
            permanent: !error.is_retryable(),
        });
    }
}

// ---------------------------------------------------------------------------
// Crawler
// ---------------------------------------------------------------------------

enum TaskOutcome {
    Fetched(FetchedDoc),
    RobotsBlocked,
    /// A redirect pointed somewhere the run may not go.
    Excluded(Url),
    Failed(GleanerError),
}

/// Checks a redirect target against the rules its origin URL was admitted
/// under. Depth-0 URLs only get the private-host check, as seeds do; deeper
/// URLs must also pass the follow policy.
#[derive(Clone)]
struct RedirectGuard {
    policy: Arc<dyn FollowPolicy>,
    source: Arc<Source>,
    allow_private_hosts: bool,
}

impl RedirectGuard {
    fn permits(&self, url: &Url, depth: u32) -> bool {
        if !self.allow_private_hosts && is_ssrf_target(url) {
            return false;
        }
        depth == 0 || self.policy.should_follow(url, depth, &self.source)
    }
}

/// Crawl engine. Cheap to share; one instance serves every source.
pub struct Crawler {
    fetcher: Arc<Fetcher>,
    policy: Arc<dyn FollowPolicy>,
    allow_private_hosts: bool,
}

impl Crawler {
    /// A crawler with its own [`DomainLimiter`].
    pub fn new(config: CrawlerConfig) -> Result<Self> {
        let limiter = Arc::new(DomainLimiter::new(config.per_domain_concurrency));
        Self::with_limiter(config, limiter)
    }

    /// A crawler sharing an existing per-domain limiter.
    pub fn with_limiter(config: CrawlerConfig, limiter: Arc<DomainLimiter>) -> Result<Self> {
        let fetcher = Fetcher::new(&config, limiter)?;
        Ok(Self {
            fetcher: Arc::new(fetcher),
            policy: Arc::new(ScopePolicy::new(
                config.default_excludes.clone(),
                config.allow_private_hosts,
            )),
            allow_private_hosts: config.allow_private_hosts,
        })
    }

    /// Replace the link-following policy.
    pub fn with_policy(mut self, policy: Arc<dyn FollowPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn limiter(&self) -> &Arc<DomainLimiter> {
        self.fetcher.limiter()
    }

    /// Crawl `source` once.
    ///
    /// Per-URL failures are collected in the report. Content store and
    /// storage failures abort the run and are returned.
    #[instrument(skip_all, fields(source_id = %source.id, source = %source.name))]
    pub async fn crawl(
        &self,
        source: &Source,
        storage: &Storage,
        store: &ContentStore,
        cancel: &CancelToken,
    ) -> Result<CrawlReport> {
        let start = std::time::Instant::now();
        let mut report = CrawlReport::new(source.id);
        let robots = Arc::new(RobotsCache::new());
        let guard = RedirectGuard {
            policy: self.policy.clone(),
            source: Arc::new(source.clone()),
            allow_private_hosts: self.allow_private_hosts,
        };
        let spacing = Duration::from_millis(source.politeness.delay_ms);
        let concurrency = source.politeness.concurrency.max(1) as usize;

        info!(
            url = %source.url,
            max_depth = source.politeness.max_depth,
            concurrency,
            delay_ms = source.politeness.delay_ms,
            "starting crawl"
        );

        let seeds = self
            .seeds(source, &robots, &guard, spacing, cancel, &mut report)
            .await;

        let mut visited = HashSet::new();
        let mut frontier = VecDeque::new();
        for seed in seeds {
            if !self.allow_private_hosts && is_ssrf_target(&seed) {
                warn!(url = %seed, "SSRF protection: seed blocked");
                report.excluded += 1;
                continue;
            }
            if visited.insert(normalize_url(&seed)) {
                frontier.push_back((seed, 0u32));
            }
        }

        let mut tasks: JoinSet<(Url, u32, TaskOutcome)> = JoinSet::new();
        loop {
            while tasks.len() < concurrency && !cancel.is_cancelled() {
                let Some((url, depth)) = frontier.pop_front() else {
                    break;
                };
                let fetcher = self.fetcher.clone();
                let robots = robots.clone();
                let guard = guard.clone();
                let cancel = cancel.clone();
                tasks.spawn(async move {
                    let outcome =
                        fetch_allowed(&fetcher, &robots, &guard, &url, depth, spacing, &cancel)
                            .await;
                    (url, depth, outcome)
                });
            }
            if tasks.is_empty() {
                break;
            }

            let joined = tokio::select! {
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    break;
                }
                joined = tasks.join_next() => joined,
            };
            let Some(joined) = joined else {
                break;
            };

            let (url, depth, outcome) = match joined {
                Ok(done) => done,
                Err(e) if e.is_cancelled() => continue,
                Err(e) => {
                    warn!(error = %e, "fetch task panicked");
                    report.failed.push(FailedFetch {
                        url: String::new(),
                        reason: e.to_string(),
                        permanent: true,
                    });
                    continue;
                }
            };

            match outcome {
                TaskOutcome::Fetched(doc) => {
                    let links = self
                        .store_fetched(source, storage, store, &doc, depth, &mut report)
                        .await?;
                    visited.insert(normalize_url(&doc.url));
                    for link in links {
                        if visited.contains(&normalize_url(&link)) {
                            continue;
                        }
                        if self.policy.should_follow(&link, depth + 1, source) {
                            visited.insert(normalize_url(&link));
                            frontier.push_back((link, depth + 1));
                        } else {
                            debug!(url = %link, "link not followed");
                            report.excluded += 1;
                        }
                    }
                }
                TaskOutcome::RobotsBlocked => {
                    debug!(%url, "disallowed by robots.txt");
                    report.robots_blocked += 1;
                }
                TaskOutcome::Excluded(target) => {
                    debug!(%url, %target, "redirect target not followed");
                    report.excluded += 1;
                }
                TaskOutcome::Failed(GleanerError::Cancelled) => {}
                TaskOutcome::Failed(e) if e.is_fatal() => return Err(e),
                TaskOutcome::Failed(e) => report.record_failure(&url, &e),
            }
        }

        report.cancelled = cancel.is_cancelled();
        report.duration = start.elapsed();

        info!(
            fetched = report.fetched,
            new_artifacts = report.new_artifacts,
            aliased = report.aliased,
            unchanged = report.unchanged,
            failed = report.failed.len(),
            excluded = report.excluded,
            robots_blocked = report.robots_blocked,
            cancelled = report.cancelled,
            duration_ms = report.duration.as_millis() as u64,
            "crawl finished"
        );
        Ok(report)
    }

    /// Depth-0 URLs. Feed and API sources fetch their root document first; it
    /// is not stored as an artifact.
    async fn seeds(
        &self,
        source: &Source,
        robots: &Arc<RobotsCache>,
        guard: &RedirectGuard,
        spacing: Duration,
        cancel: &CancelToken,
        report: &mut CrawlReport,
    ) -> Vec<Url> {
        if !gleaner_discovery::needs_root_document(source.source_type) {
            return vec![source.url.clone()];
        }

        let root = fetch_allowed(&self.fetcher, robots, guard, &source.url, 0, spacing, cancel).await;
        let doc = match root {
            TaskOutcome::Fetched(doc) => doc,
            TaskOutcome::RobotsBlocked => {
                warn!(url = %source.url, "source root disallowed by robots.txt");
                report.robots_blocked += 1;
                return Vec::new();
            }
            TaskOutcome::Excluded(target) => {
                warn!(url = %source.url, %target, "source root redirects to a blocked host");
                report.excluded += 1;
                return Vec::new();
            }
            TaskOutcome::Failed(GleanerError::Cancelled) => return Vec::new(),
            TaskOutcome::Failed(e) => {
                report.record_failure(&source.url, &e);
                return Vec::new();
            }
        };

        match gleaner_discovery::discover_seeds(source.source_type, &doc.url, &doc.body) {
            Ok(seeds) => seeds,
            Err(e) => {
                report.record_failure(&source.url, &e);
                Vec::new()
            }
        }
    }

    /// Persist one response and return the links worth considering.
    async fn store_fetched(
        &self,
        source: &Source,
        storage: &Storage,
        store: &ContentStore,
        doc: &FetchedDoc,
        depth: u32,
        report: &mut CrawlReport,
    ) -> Result<Vec<Url>> {
        let (hash, _) = store.put(&doc.body).await?;
        let (artifact, disposition) = storage
            .record_fetch(
                Some(&source.id),
                doc.url.as_str(),
                &hash,
                &doc.mime_type,
                doc.body.len() as u64,
            )
            .await?;

        debug!(
            url = %doc.url,
            requested = %doc.requested,
            artifact_id = %artifact.id,
            depth,
            disposition = ?disposition,
            "fetched"
        );
        report.fetched += 1;
        match disposition {
            FetchDisposition::New => report.new_artifacts += 1,
            FetchDisposition::Alias => report.aliased += 1,
            FetchDisposition::Seen => report.unchanged += 1,
        }
        report.artifacts.push(artifact);

        if depth >= source.politeness.max_depth || !doc.is_html() {
            return Ok(Vec::new());
        }
        let html = String::from_utf8_lossy(&doc.body);
        Ok(extract_links(&Html::parse_document(&html), &doc.url))
    }
}

/// Check robots.txt for `url`, then fetch it. Redirects are followed by hand
/// so every hop is screened by the guard and robots.txt before it is requested.
async fn fetch_allowed(
    fetcher: &Arc<Fetcher>,
    robots: &RobotsCache,
    guard: &RedirectGuard,
    url: &Url,
    depth: u32,
    spacing: Duration,
    cancel: &CancelToken,
) -> TaskOutcome {
    let mut current = url.clone();
    for hop in 0..=MAX_REDIRECTS {
        if hop > 0 && !guard.permits(&current, depth) {
            return TaskOutcome::Excluded(current);
        }
        let rules = robots
            .rules_for(&current, |robots_url| fetcher.fetch_robots(robots_url, spacing))
            .await;
        if !rules.allows(&current) {
            return TaskOutcome::RobotsBlocked;
        }
        match fetcher.fetch(&current, spacing, cancel).await {
            Ok(FetchResponse::Document(mut doc)) => {
                doc.requested = url.clone();
                return TaskOutcome::Fetched(doc);
            }
            Ok(FetchResponse::Redirect(next)) => {
                debug!(from = %current, to = %next, "following redirect");
                current = next;
            }
            Err(e) => return TaskOutcome::Failed(e),
        }
    }
    TaskOutcome::Failed(GleanerError::permanent(
        url.as_str(),
        format!("more than {MAX_REDIRECTS} redirects"),
    ))
}

/// Extract all links from a document, resolved against the base URL.
fn extract_links(doc: &Html, base_url: &Url) -> Vec<Url> {
    doc.select(&LINK_SELECTOR)
        .filter_map(|el| el.value().attr("href"))
        .filter(|href| {
            !(href.starts_with('#') || href.starts_with("javascript:") || href.starts_with("mailto:"))
        })
        .filter_map(|href| base_url.join(href).ok())
        .map(|mut resolved| {
            resolved.set_fragment(None);
            resolved
        })
        .collect()
}

/// Normalize a URL for deduplication (strip fragment, trailing slash).
fn normalize_url(url: &Url) -> String {
    let mut normalized = url.clone();
    normalized.set_fragment(None);
    let mut s = normalized.to_string();
    if s.ends_with('/') && s.matches('/').count() > 3 {
        s.pop();
    }
    s
}
