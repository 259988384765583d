//! Seed discovery: turn a source's root document into depth-0 crawl seeds.
//!
//! - `site` sources seed their root URL; nothing is parsed.
//! - `feed` sources parse RSS 2.0, RSS 1.0 or Atom and seed every item link.
//! - `api` sources parse a JSON listing and seed every `url`/`link`/`href` value.
//!
//! Fetching the root document is the crawler's job (it goes through the same
//! politeness and robots checks as every other request); this crate is pure.

mod api;
mod feed;

use std::collections::HashSet;

use gleaner_shared::{Result, SourceType};
use tracing::{debug, instrument};
use url::Url;

pub use feed::{FeedKind, FeedLinks};

/// Whether discovering seeds for `source_type` needs the root document.
pub fn needs_root_document(source_type: SourceType) -> bool {
    !matches!(source_type, SourceType::Site)
}

/// Discover seeds for a source.
///
/// `body` is the fetched root document; it is ignored for `site` sources.
/// Relative links resolve against `root`. Non-HTTP(S) links are dropped and
/// duplicates collapse, first occurrence wins.
#[instrument(skip_all, fields(root = %root, source_type = %source_type))]
pub fn discover_seeds(source_type: SourceType, root: &Url, body: &[u8]) -> Result<Vec<Url>> {
    let raw = match source_type {
        SourceType::Site => return Ok(vec![root.clone()]),
        SourceType::Feed => feed::parse_feed(&String::from_utf8_lossy(body))?.links,
        SourceType::Api => api::parse_listing(&String::from_utf8_lossy(body))?,
    };

    let found = raw.len();
    let seeds = resolve_links(root, raw);
    debug!(found, seeds = seeds.len(), "seeds discovered");
    Ok(seeds)
}

/// Resolve, filter and deduplicate raw link strings.
fn resolve_links(base: &Url, raw: Vec<String>) -> Vec<Url> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for link in raw {
        let Ok(mut url) = base.join(&link) else {
            debug!(%link, "skipping unparseable link");
            continue;
        };
        if url.scheme() != "http" && url.scheme() != "https" {
            continue;
        }
        url.set_fragment(None);
        if seen.insert(url.as_str().to_string()) {
            out.push(url);
        }
    }
    out
}
