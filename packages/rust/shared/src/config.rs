//! Application configuration for Gleaner.
//!
//! User config lives at `~/.gleaner/gleaner.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{GleanerError, Result};
use crate::schedule::CronSchedule;
use crate::types::{FollowOverride, PolitenessPolicy, Source, SourceType};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "gleaner.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".gleaner";

// ---------------------------------------------------------------------------
// Config structs (matching gleaner.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub crawler: CrawlerSettings,

    #[serde(default)]
    pub evasion: EvasionConfig,

    #[serde(default)]
    pub scheduler: SchedulerSettings,

    #[serde(default)]
    pub normalizer: NormalizerSettings,

    /// Politeness defaults applied to sources that don't set their own.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Sources declared in the config file (applied by `source sync`).
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding `gleaner.db` and the `blobs/` tree. `~` is expanded.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl StorageConfig {
    /// Resolve `data_dir`, expanding a leading `~`.
    pub fn data_path(&self) -> Result<PathBuf> {
        expand_home(&self.data_dir)
    }
}

fn default_data_dir() -> String {
    "~/.gleaner/data".into()
}

/// `[crawler]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerSettings {
    /// Product token sent when not rotating and used for robots.txt matching.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Process-wide cap on in-flight fetches per host.
    #[serde(default = "default_per_domain_concurrency")]
    pub per_domain_concurrency: u32,

    /// Attempts per URL, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Bodies larger than this are permanent failures.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: u64,

    /// Follow links to loopback/private addresses. Only for local testing.
    #[serde(default)]
    pub allow_private_hosts: bool,
}

impl Default for CrawlerSettings {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            per_domain_concurrency: default_per_domain_concurrency(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            max_body_bytes: default_max_body_bytes(),
            allow_private_hosts: false,
        }
    }
}

fn default_user_agent() -> String {
    "Gleaner".into()
}
fn default_per_domain_concurrency() -> u32 {
    2
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_max_body_bytes() -> u64 {
    20 * 1024 * 1024
}

/// `[evasion]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvasionConfig {
    /// Rotate through `user_agents` instead of sending the product token.
    #[serde(default)]
    pub rotate_user_agents: bool,

    #[serde(default = "default_user_agents")]
    pub user_agents: Vec<String>,

    /// Upper bound of random extra delay added to each host's spacing.
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

impl Default for EvasionConfig {
    fn default() -> Self {
        Self {
            rotate_user_agents: false,
            user_agents: default_user_agents(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

fn default_user_agents() -> Vec<String> {
    vec![
        "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0".into(),
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_5) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.5 Safari/605.1.15".into(),
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36".into(),
    ]
}
fn default_jitter_ms() -> u64 {
    250
}

/// `[scheduler]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Seconds between scheduler ticks in `gleaner run`.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,

    /// In-flight crawls older than this are timed out.
    #[serde(default = "default_crawl_timeout_secs")]
    pub crawl_timeout_secs: u64,

    /// Consecutive failed runs before a source is soft-deactivated.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    /// Crawl runs executing at once across all sources.
    #[serde(default = "default_max_concurrent_crawls")]
    pub max_concurrent_crawls: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            crawl_timeout_secs: default_crawl_timeout_secs(),
            max_consecutive_failures: default_max_consecutive_failures(),
            max_concurrent_crawls: default_max_concurrent_crawls(),
        }
    }
}

fn default_tick_secs() -> u64 {
    60
}
fn default_crawl_timeout_secs() -> u64 {
    1800
}
fn default_max_consecutive_failures() -> u32 {
    5
}
fn default_max_concurrent_crawls() -> u32 {
    4
}

/// `[normalizer]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizerSettings {
    /// Blocking-pool slots for extraction and scoring.
    #[serde(default = "default_workers")]
    pub workers: u32,
}

impl Default for NormalizerSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

fn default_workers() -> u32 {
    2
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,

    #[serde(default = "default_concurrency")]
    pub concurrency: u32,

    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    /// Glob patterns excluded for every source without an override.
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            delay_ms: default_delay_ms(),
            concurrency: default_concurrency(),
            max_depth: default_max_depth(),
            exclude_patterns: Vec::new(),
        }
    }
}

impl DefaultsConfig {
    pub fn politeness(&self) -> PolitenessPolicy {
        PolitenessPolicy {
            delay_ms: self.delay_ms,
            concurrency: self.concurrency,
            max_depth: self.max_depth,
        }
    }
}

fn default_delay_ms() -> u64 {
    1000
}
fn default_concurrency() -> u32 {
    2
}
fn default_max_depth() -> u32 {
    1
}

/// `[[sources]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceEntry {
    pub name: String,
    pub url: String,
    pub source_type: SourceType,
    pub schedule: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follow: Option<FollowOverride>,
}

fn default_true() -> bool {
    true
}

impl SourceEntry {
    /// Build a [`Source`], filling politeness gaps from `defaults`.
    /// Invalid schedules and URLs are rejected here, at registration.
    pub fn to_source(&self, defaults: &DefaultsConfig) -> Result<Source> {
        let mut source = Source::new(&self.name, &self.url, self.source_type, &self.schedule)?;
        source.is_active = self.is_active;
        source.politeness = PolitenessPolicy {
            delay_ms: self.delay_ms.unwrap_or(defaults.delay_ms),
            concurrency: self.concurrency.unwrap_or(defaults.concurrency).max(1),
            max_depth: self.max_depth.unwrap_or(defaults.max_depth),
        };
        source.follow = self.follow.clone();
        Ok(source)
    }
}

impl AppConfig {
    /// Check every declared source schedule and the numeric knobs.
    pub fn validate(&self) -> Result<()> {
        for entry in &self.sources {
            CronSchedule::parse(&entry.schedule).map_err(|e| {
                GleanerError::config(format!("source '{}': {e}", entry.name))
            })?;
        }
        if self.crawler.max_attempts == 0 {
            return Err(GleanerError::config("crawler.max_attempts must be at least 1"));
        }
        if self.crawler.per_domain_concurrency == 0 {
            return Err(GleanerError::config(
                "crawler.per_domain_concurrency must be at least 1",
            ));
        }
        if self.scheduler.max_concurrent_crawls == 0 || self.normalizer.workers == 0 {
            return Err(GleanerError::config(
                "scheduler.max_concurrent_crawls and normalizer.workers must be at least 1",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.gleaner/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| GleanerError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.gleaner/gleaner.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| GleanerError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content)
        .map_err(|e| GleanerError::config(format!("failed to parse {}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| GleanerError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| GleanerError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| GleanerError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| GleanerError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None if path == "~" => {
            dirs::home_dir().ok_or_else(|| GleanerError::config("could not determine home directory"))
        }
        None => Ok(PathBuf::from(path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("data_dir"));
        assert!(toml_str.contains("per_domain_concurrency"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.crawler.max_attempts, 3);
        assert_eq!(parsed.scheduler.max_consecutive_failures, 5);
        assert_eq!(parsed.crawler.user_agent, "Gleaner");
    }

    #[test]
    fn config_with_sources() {
        let toml_str = r#"
[defaults]
delay_ms = 2000

[[sources]]
name = "example-feed"
url = "https://example.org/feed"
source_type = "feed"
schedule = "0 */4 * * *"
max_depth = 0

[sources.follow]
allow_domains = ["example.org", "cdn.example.org"]
exclude_patterns = ["/tag/**"]
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        config.validate().expect("valid");
        assert_eq!(config.sources.len(), 1);

        let source = config.sources[0]
            .to_source(&config.defaults)
            .expect("to_source");
        assert_eq!(source.source_type, SourceType::Feed);
        assert_eq!(source.politeness.delay_ms, 2000);
        assert_eq!(source.politeness.max_depth, 0);
        assert_eq!(source.follow.unwrap().allow_domains.len(), 2);
    }

    #[test]
    fn invalid_source_schedule_rejected() {
        let toml_str = r#"
[[sources]]
name = "broken"
url = "https://example.org/"
source_type = "site"
schedule = "whenever"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn expand_home_leaves_absolute_paths() {
        assert_eq!(
            expand_home("/var/lib/gleaner").unwrap(),
            PathBuf::from("/var/lib/gleaner")
        );
    }
}
