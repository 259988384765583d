//! Respectful crawling for Gleaner sources.
//!
//! This crate provides:
//! - [`Crawler`]: breadth-first, depth-bounded crawl of one source
//! - [`Fetcher`]: HTTP client with per-domain politeness, user-agent rotation
//!   and bounded retries
//! - [`FollowPolicy`]: the should-follow predicate applied to discovered links
//! - [`RobotsCache`]: per-run robots.txt rules keyed by origin
//! - [`CancelToken`]: cooperative cancellation shared with the pipeline

pub mod cancel;
pub mod engine;
pub mod evasion;
pub mod fetch;
pub mod policy;
pub mod politeness;
pub mod retry;
pub mod robots;

pub use cancel::CancelToken;
pub use engine::{CrawlReport, Crawler, CrawlerConfig, FailedFetch};
pub use evasion::UserAgentPool;
pub use fetch::{FetchedDoc, Fetcher};
pub use policy::{FollowPolicy, ScopePolicy, is_ssrf_target};
pub use politeness::{DomainLimiter, DomainPermit};
pub use retry::{RetryPolicy, RetryState};
pub use robots::{RobotsCache, RobotsRules};
