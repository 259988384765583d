//! HTTP fetching with politeness, evasion and bounded retries.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::header::{CONTENT_TYPE, LOCATION, RETRY_AFTER, USER_AGENT};
use reqwest::{Client, Response, StatusCode};
use tracing::{debug, warn};
use url::Url;

use gleaner_shared::{GleanerError, Result};

use crate::cancel::CancelToken;
use crate::engine::CrawlerConfig;
use crate::evasion::{UserAgentPool, jitter, parse_retry_after};
use crate::policy::is_ssrf_target;
use crate::politeness::DomainLimiter;
use crate::retry::RetryPolicy;
use crate::robots::RobotsRules;

/// Redirect hops followed for one URL before giving up.
pub const MAX_REDIRECTS: usize = 5;

/// A successful response.
#[derive(Debug, Clone)]
pub struct FetchedDoc {
    /// URL the crawl asked for, before any redirect.
    pub requested: Url,
    /// URL that served the body.
    pub url: Url,
    pub status: u16,
    pub mime_type: String,
    pub body: Vec<u8>,
}

impl FetchedDoc {
    pub fn is_html(&self) -> bool {
        matches!(
            self.mime_type.as_str(),
            "text/html" | "application/xhtml+xml"
        )
    }
}

/// Result of a single request. Redirects are not followed by the client so
/// the caller can vet every hop.
#[derive(Debug, Clone)]
pub enum FetchResponse {
    Document(FetchedDoc),
    /// A 3xx answer, with `Location` resolved against the requested URL.
    Redirect(Url),
}

/// One failed attempt, with the server's `Retry-After` hint if any.
struct AttemptError {
    error: GleanerError,
    retry_after: Option<Duration>,
}

impl From<GleanerError> for AttemptError {
    fn from(error: GleanerError) -> Self {
        Self {
            error,
            retry_after: None,
        }
    }
}

/// Shared HTTP client. One instance serves every crawl in the process.
#[derive(Debug)]
pub struct Fetcher {
    client: Client,
    limiter: Arc<DomainLimiter>,
    agents: UserAgentPool,
    product_token: String,
    retry: RetryPolicy,
    jitter_ms: u64,
    max_body_bytes: u64,
    allow_private_hosts: bool,
}

impl Fetcher {
    pub fn new(config: &CrawlerConfig, limiter: Arc<DomainLimiter>) -> Result<Self> {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| GleanerError::Network(format!("failed to build HTTP client: {e}")))?;

        let product = format!("{}/{}", config.product_token, env!("CARGO_PKG_VERSION"));
        Ok(Self {
            client,
            limiter,
            agents: UserAgentPool::new(
                product,
                config.user_agents.clone(),
                config.rotate_user_agents,
            ),
            product_token: config.product_token.clone(),
            retry: RetryPolicy {
                max_attempts: config.max_attempts.max(1),
                base: config.backoff_base,
                max: config.backoff_max,
            },
            jitter_ms: config.jitter_ms,
            max_body_bytes: config.max_body_bytes,
            allow_private_hosts: config.allow_private_hosts,
        })
    }

    pub fn limiter(&self) -> &Arc<DomainLimiter> {
        &self.limiter
    }

    /// Fetch `url`, retrying transient failures with backoff.
    ///
    /// A 3xx answer is returned as [`FetchResponse::Redirect`] without being
    /// followed. `spacing` is the minimum gap between requests to the URL's host.
    /// Cancellation is observed while waiting for a slot, during the request
    /// and during backoff sleeps.
    pub async fn fetch(
        &self,
        url: &Url,
        spacing: Duration,
        cancel: &CancelToken,
    ) -> Result<FetchResponse> {
        let mut state = self.retry.start();
        loop {
            if cancel.is_cancelled() {
                return Err(GleanerError::Cancelled);
            }

            let attempt = tokio::select! {
                _ = cancel.cancelled() => return Err(GleanerError::Cancelled),
                res = self.fetch_once(url, spacing) => res,
            };

            let failure = match attempt {
                Ok(response) => return Ok(response),
                Err(failure) => failure,
            };
            if !failure.error.is_retryable() {
                return Err(failure.error);
            }

            let Some(delay) = state.next_delay(failure.retry_after) else {
                return Err(failure.error);
            };
            warn!(
                %url,
                attempt = state.attempt(),
                delay_ms = delay.as_millis() as u64,
                error = %failure.error,
                "transient fetch failure, backing off"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(GleanerError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn fetch_once(
        &self,
        url: &Url,
        spacing: Duration,
    ) -> std::result::Result<FetchResponse, AttemptError> {
        let host = url
            .host_str()
            .ok_or_else(|| GleanerError::permanent(url.as_str(), "URL has no host"))?;
        let _permit = self.limiter.acquire(host, spacing + jitter(self.jitter_ms)).await?;

        debug!(%url, "fetching");
        let response = self
            .client
            .get(url.as_str())
            .header(USER_AGENT, self.agents.pick())
            .send()
            .await
            .map_err(|e| classify(url, e))?;

        let status = response.status();
        if status.is_redirection() {
            return Ok(FetchResponse::Redirect(redirect_target(url, &response)?));
        }
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| parse_retry_after(v, Utc::now()));
            let reason = format!("HTTP {status}");
            let error = if is_transient_status(status) {
                GleanerError::transient(url.as_str(), reason)
            } else {
                GleanerError::permanent(url.as_str(), reason)
            };
            return Err(AttemptError { error, retry_after });
        }

        let declared = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(mime_essence);
        let body = self.read_capped(url, response).await?;
        let mime_type = declared
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| sniff_mime(&body).to_string());

        Ok(FetchResponse::Document(FetchedDoc {
            requested: url.clone(),
            url: url.clone(),
            status: status.as_u16(),
            mime_type,
            body,
        }))
    }

    async fn read_capped(&self, url: &Url, mut response: Response) -> Result<Vec<u8>> {
        let too_large = || {
            GleanerError::permanent(
                url.as_str(),
                format!("body exceeds {} bytes", self.max_body_bytes),
            )
        };
        if response
            .content_length()
            .is_some_and(|len| len > self.max_body_bytes)
        {
            return Err(too_large());
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| classify(url, e))? {
            if (body.len() + chunk.len()) as u64 > self.max_body_bytes {
                return Err(too_large());
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    /// Fetch and interpret `robots.txt`. Always identifies with the product
    /// token and makes a single attempt per hop. Redirects are followed up to
    /// [`MAX_REDIRECTS`] hops; a hop to a private host disallows the origin.
    pub async fn fetch_robots(&self, robots_url: Url, spacing: Duration) -> RobotsRules {
        let mut current = robots_url;
        for _ in 0..=MAX_REDIRECTS {
            let Some(host) = current.host_str().map(str::to_owned) else {
                return RobotsRules::DisallowAll;
            };
            let _permit = match self.limiter.acquire(&host, spacing).await {
                Ok(permit) => permit,
                Err(_) => return RobotsRules::DisallowAll,
            };

            let response = self
                .client
                .get(current.as_str())
                .header(USER_AGENT, self.agents.product())
                .send()
                .await;
            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    debug!(url = %current, error = %e, "robots.txt unreachable");
                    return RobotsRules::DisallowAll;
                }
            };

            let status = response.status();
            if status.is_redirection() {
                match redirect_target(&current, &response) {
                    Ok(next) if self.allow_private_hosts || !is_ssrf_target(&next) => {
                        current = next;
                        continue;
                    }
                    _ => return RobotsRules::DisallowAll,
                }
            }
            if !status.is_success() {
                return RobotsRules::from_response(Some(status.as_u16()), b"", &self.product_token);
            }
            return match self.read_capped(&current, response).await {
                Ok(body) => {
                    RobotsRules::from_response(Some(status.as_u16()), &body, &self.product_token)
                }
                Err(e) => {
                    debug!(url = %current, error = %e, "robots.txt body unreadable");
                    RobotsRules::DisallowAll
                }
            };
        }
        debug!(url = %current, "robots.txt redirect limit reached");
        RobotsRules::DisallowAll
    }
}

/// Resolve a 3xx `Location` against the URL that produced it.
fn redirect_target(url: &Url, response: &Response) -> Result<Url> {
    let location = response
        .headers()
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            GleanerError::permanent(
                url.as_str(),
                format!("HTTP {} without a Location header", response.status()),
            )
        })?;
    let mut target = url
        .join(location)
        .map_err(|e| GleanerError::permanent(url.as_str(), format!("bad redirect target: {e}")))?;
    target.set_fragment(None);
    Ok(target)
}

fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

fn classify(url: &Url, e: reqwest::Error) -> GleanerError {
    if e.is_builder() || e.is_redirect() {
        GleanerError::permanent(url.as_str(), e.to_string())
    } else {
        GleanerError::transient(url.as_str(), e.to_string())
    }
}

/// `text/html; charset=utf-8` → `text/html`.
fn mime_essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

fn sniff_mime(body: &[u8]) -> &'static str {
    let head = &body[..body.len().min(512)];
    let text = String::from_utf8_lossy(head).trim_start().to_ascii_lowercase();
    if head.starts_with(b"%PDF") {
        "application/pdf"
    } else if text.starts_with("<!doctype html") || text.starts_with("<html") {
        "text/html"
    } else if text.starts_with("<?xml") || text.starts_with("<rss") || text.starts_with("<feed") {
        "application/xml"
    } else {
        "application/octet-stream"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher(max_attempts: u32) -> Fetcher {
        let config = CrawlerConfig {
            max_attempts,
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(200),
            jitter_ms: 0,
            max_body_bytes: 1024,
            ..CrawlerConfig::default()
        };
        Fetcher::new(&config, Arc::new(DomainLimiter::new(2))).unwrap()
    }

    fn url(server: &MockServer, p: &str) -> Url {
        Url::parse(&format!("{}{p}", server.uri())).unwrap()
    }

    #[test]
    fn mime_helpers() {
        assert_eq!(mime_essence("Text/HTML; charset=UTF-8"), "text/html");
        assert_eq!(sniff_mime(b"%PDF-1.7 ..."), "application/pdf");
        assert_eq!(sniff_mime(b"  <!DOCTYPE html><html>"), "text/html");
        assert_eq!(sniff_mime(b"\x00\x01"), "application/octet-stream");
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw("ok", "text/plain; charset=utf-8"),
            )
            .mount(&server)
            .await;

        let response = fetcher(3)
            .fetch(&url(&server, "/flaky"), Duration::ZERO, &CancelToken::new())
            .await
            .unwrap();
        let FetchResponse::Document(doc) = response else {
            panic!("expected a document, got {response:?}");
        };
        assert_eq!(doc.body, b"ok");
        assert_eq!(doc.mime_type, "text/plain");
    }

    #[tokio::test]
    async fn redirects_are_returned_not_followed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/old"))
            .respond_with(ResponseTemplate::new(301).insert_header("location", "/new#top"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/new"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let response = fetcher(3)
            .fetch(&url(&server, "/old"), Duration::ZERO, &CancelToken::new())
            .await
            .unwrap();
        match response {
            FetchResponse::Redirect(target) => assert_eq!(target, url(&server, "/new")),
            other => panic!("expected a redirect, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn redirect_without_location_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/moved"))
            .respond_with(ResponseTemplate::new(302))
            .expect(1)
            .mount(&server)
            .await;

        let err = fetcher(3)
            .fetch(&url(&server, "/moved"), Duration::ZERO, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GleanerError::PermanentFetch { .. }));
    }

    #[tokio::test]
    async fn robots_redirect_is_followed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .respond_with(ResponseTemplate::new(301).insert_header("location", "/meta/robots.txt"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/meta/robots.txt"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /private/\n"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let config = CrawlerConfig {
            allow_private_hosts: true,
            jitter_ms: 0,
            ..CrawlerConfig::default()
        };
        let fetcher = Fetcher::new(&config, Arc::new(DomainLimiter::new(2))).unwrap();
        let rules = fetcher
            .fetch_robots(url(&server, "/robots.txt"), Duration::ZERO)
            .await;
        assert!(rules.allows(&url(&server, "/public")));
        assert!(!rules.allows(&url(&server, "/private/page")));
    }

    #[tokio::test]
    async fn robots_redirect_to_private_host_disallows() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .respond_with(
                ResponseTemplate::new(301).insert_header("location", "http://127.0.0.1:9/robots.txt"),
            )
            .mount(&server)
            .await;

        let rules = fetcher(1)
            .fetch_robots(url(&server, "/robots.txt"), Duration::ZERO)
            .await;
        assert!(!rules.allows(&url(&server, "/anything")));
    }

    #[tokio::test]
    async fn permanent_status_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let err = fetcher(3)
            .fetch(&url(&server, "/gone"), Duration::ZERO, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GleanerError::PermanentFetch { .. }));
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/down"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;

        let err = fetcher(2)
            .fetch(&url(&server, "/down"), Duration::ZERO, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GleanerError::TransientFetch { .. }));
    }

    #[tokio::test]
    async fn oversized_body_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/big"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'x'; 4096]))
            .mount(&server)
            .await;

        let err = fetcher(3)
            .fetch(&url(&server, "/big"), Duration::ZERO, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GleanerError::PermanentFetch { .. }));
    }

    #[tokio::test]
    async fn cancelled_before_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let cancel = CancelToken::new();
        cancel.cancel();
        let err = fetcher(3)
            .fetch(&url(&server, "/x"), Duration::ZERO, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, GleanerError::Cancelled));
    }

    #[tokio::test]
    async fn robots_uses_product_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .and(header(
                "user-agent",
                format!("Gleaner/{}", env!("CARGO_PKG_VERSION")).as_str(),
            ))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /private/\n"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let rules = fetcher(1)
            .fetch_robots(url(&server, "/robots.txt"), Duration::ZERO)
            .await;
        assert!(rules.allows(&url(&server, "/public")));
        assert!(!rules.allows(&url(&server, "/private/page")));
    }
}
