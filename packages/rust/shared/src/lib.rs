//! Shared types, error model, and configuration for Gleaner.
//!
//! This crate is the foundation depended on by all other Gleaner crates.
//! It provides:
//! - [`GleanerError`], the unified error type
//! - Domain types ([`Source`], [`Artifact`], [`NormalizedDocument`], [`Rubric`], [`Evaluation`])
//! - Cron schedules ([`CronSchedule`])
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod schedule;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CrawlerSettings, DefaultsConfig, EvasionConfig, NormalizerSettings,
    SchedulerSettings, SourceEntry, StorageConfig, config_dir, config_file_path, init_config,
    load_config, load_config_from,
};
pub use error::{GleanerError, Result};
pub use schedule::CronSchedule;
pub use types::{
    Artifact, ArtifactId, ArtifactState, ContentHash, CrawlRunStatus, DocumentMetadata, Evaluation,
    FetchDisposition, FollowOverride, NormalizedDocument, PolitenessPolicy, Rubric, SCORE_MAX,
    SCORE_MIN, Source, SourceId, SourceType, UriAlias,
};
