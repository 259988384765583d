//! Anti-bot evasion: user-agent rotation, delay jitter, `Retry-After` parsing.
//!
//! None of this bypasses robots.txt. Robots rules are always evaluated for the
//! product token, whatever header a request carries.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

/// Chooses the `User-Agent` header for each request.
#[derive(Debug)]
pub struct UserAgentPool {
    product: String,
    agents: Vec<String>,
    rotate: bool,
    next: AtomicUsize,
}

impl UserAgentPool {
    /// `product` is sent when rotation is off or the pool is empty.
    pub fn new(product: impl Into<String>, agents: Vec<String>, rotate: bool) -> Self {
        Self {
            product: product.into(),
            agents,
            rotate,
            next: AtomicUsize::new(0),
        }
    }

    /// The crawler's own identity, whatever rotation is configured.
    pub fn product(&self) -> &str {
        &self.product
    }

    /// Round-robin over the pool.
    pub fn pick(&self) -> &str {
        if !self.rotate || self.agents.is_empty() {
            return &self.product;
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.agents.len();
        &self.agents[i]
    }
}

/// Uniform random extra delay in `[0, max_ms]`.
pub fn jitter(max_ms: u64) -> Duration {
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=max_ms))
}

/// Parse a `Retry-After` value: delta-seconds or an HTTP-date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}
