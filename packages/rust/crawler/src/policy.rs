//! Link-following policy.
//!
//! A [`FollowPolicy`] is a pure predicate over (URL, depth, source). The
//! default one combines a domain allow-list, a depth limit and glob-style path
//! exclusions, plus the SSRF guard that keeps the crawler off private hosts.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex as StdMutex;

use gleaner_shared::Source;
use regex::Regex;
use url::Url;

/// Decides whether a discovered link is enqueued.
pub trait FollowPolicy: Send + Sync {
    fn should_follow(&self, url: &Url, depth: u32, source: &Source) -> bool;
}

/// Root host (or override allow-list), depth limit, exclusion globs.
#[derive(Debug, Default)]
pub struct ScopePolicy {
    default_excludes: Vec<String>,
    allow_private_hosts: bool,
    compiled: StdMutex<HashMap<String, Option<Regex>>>,
}

impl ScopePolicy {
    /// `default_excludes` apply to every source; per-source overrides add to them.
    pub fn new(default_excludes: Vec<String>, allow_private_hosts: bool) -> Self {
        Self {
            default_excludes,
            allow_private_hosts,
            compiled: StdMutex::new(HashMap::new()),
        }
    }

    fn domain_allowed(&self, host: &str, source: &Source) -> bool {
        match &source.follow {
            Some(over) if !over.allow_domains.is_empty() => over
                .allow_domains
                .iter()
                .any(|domain| host_matches(host, domain)),
            _ => host.eq_ignore_ascii_case(source.root_host()),
        }
    }

    fn path_excluded(&self, path: &str, source: &Source) -> bool {
        let overrides = source
            .follow
            .as_ref()
            .map(|o| o.exclude_patterns.as_slice())
            .unwrap_or_default();

        let mut compiled = self
            .compiled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.default_excludes
            .iter()
            .chain(overrides.iter())
            .any(|pattern| {
                compiled
                    .entry(pattern.clone())
                    .or_insert_with(|| glob_to_regex(pattern))
                    .as_ref()
                    .is_some_and(|re| re.is_match(path))
            })
    }
}

impl FollowPolicy for ScopePolicy {
    fn should_follow(&self, url: &Url, depth: u32, source: &Source) -> bool {
        if depth > source.politeness.max_depth {
            return false;
        }
        if url.scheme() != "http" && url.scheme() != "https" {
            return false;
        }
        if !self.allow_private_hosts && is_ssrf_target(url) {
            return false;
        }
        let Some(host) = url.host_str() else {
            return false;
        };
        if !self.domain_allowed(host, source) {
            return false;
        }
        !self.path_excluded(url.path(), source)
    }
}

/// `host` equals `domain` or is a subdomain of it.
fn host_matches(host: &str, domain: &str) -> bool {
    let host = host.to_ascii_lowercase();
    let domain = domain.trim_start_matches("*.").to_ascii_lowercase();
    host == domain || host.ends_with(&format!(".{domain}"))
}

/// Convert a glob-like pattern to a regex (`**` crosses `/`, `*` does not).
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let escaped = regex::escape(pattern)
        .replace(r"\*\*", ".*")
        .replace(r"\*", "[^/]*")
        .replace(r"\?", ".");
    match Regex::new(&format!("^{escaped}$")) {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::warn!(%pattern, error = %e, "ignoring invalid exclude pattern");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Check if a URL targets a potentially dangerous resource.
pub fn is_ssrf_target(url: &Url) -> bool {
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    match url.host() {
        Some(url::Host::Ipv4(v4)) => is_private_ip(&IpAddr::V4(v4)),
        Some(url::Host::Ipv6(v6)) => is_private_ip(&IpAddr::V6(v6)),
        Some(url::Host::Domain(host)) => {
            let host = host.to_ascii_lowercase();
            host == "localhost"
                || host.ends_with(".localhost")
                || host.ends_with(".local")
                || host.ends_with(".internal")
        }
        None => true,
    }
}

/// Check if an IP is in a private/reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
                // 192.0.0.0/24
                || (v4.octets()[0] == 192 && v4.octets()[1] == 0 && v4.octets()[2] == 0)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local, fe80::/10 link local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                || v6.to_ipv4_mapped().is_some_and(|v4| is_private_ip(&IpAddr::V4(v4)))
        }
    }
}
