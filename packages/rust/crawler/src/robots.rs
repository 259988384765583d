//! robots.txt rules, cached per origin for the lifetime of one crawl run.
//!
//! Fetch outcomes map to rules as follows: 2xx is parsed, 4xx means no
//! restrictions, 5xx or an unreachable host means everything is disallowed
//! for that origin until the run ends.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use robotxt::Robots;
use tokio::sync::OnceCell;
use url::Url;

/// Effective rules for one origin.
pub enum RobotsRules {
    AllowAll,
    DisallowAll,
    Parsed(Robots),
}

impl RobotsRules {
    /// Interpret a robots.txt response. `status` is `None` when the fetch failed.
    pub fn from_response(status: Option<u16>, body: &[u8], product_token: &str) -> Self {
        match status {
            Some(200..=299) => Self::Parsed(Robots::from_bytes(body, product_token)),
            Some(400..=499) => Self::AllowAll,
            _ => Self::DisallowAll,
        }
    }

    pub fn allows(&self, url: &Url) -> bool {
        match self {
            Self::AllowAll => true,
            Self::DisallowAll => false,
            Self::Parsed(robots) => robots.is_absolute_allowed(url),
        }
    }
}

impl std::fmt::Debug for RobotsRules {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AllowAll => f.write_str("AllowAll"),
            Self::DisallowAll => f.write_str("DisallowAll"),
            Self::Parsed(_) => f.write_str("Parsed"),
        }
    }
}

/// Per-run cache keyed by origin. Concurrent lookups of the same origin share
/// one fetch.
#[derive(Debug, Default)]
pub struct RobotsCache {
    entries: StdMutex<HashMap<String, Arc<OnceCell<Arc<RobotsRules>>>>>,
}

impl RobotsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rules for `url`'s origin, running `load` on first use.
    pub async fn rules_for<F, Fut>(&self, url: &Url, load: F) -> Arc<RobotsRules>
    where
        F: FnOnce(Url) -> Fut,
        Fut: std::future::Future<Output = RobotsRules>,
    {
        let origin = url.origin().ascii_serialization();
        let cell = {
            let mut entries = self
                .entries
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            entries.entry(origin).or_default().clone()
        };

        cell.get_or_init(|| async {
            match robots_url(url) {
                Some(robots_url) => Arc::new(load(robots_url).await),
                None => Arc::new(RobotsRules::DisallowAll),
            }
        })
        .await
        .clone()
    }
}

/// `<origin>/robots.txt`.
pub fn robots_url(url: &Url) -> Option<Url> {
    url.host_str()?;
    let mut robots = url.clone();
    robots.set_path("/robots.txt");
    robots.set_query(None);
    robots.set_fragment(None);
    Some(robots)
}
