//! Core domain types: sources, artifacts, normalized documents, rubrics, evaluations.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;
use uuid::Uuid;

use crate::error::{GleanerError, Result};
use crate::schedule::CronSchedule;

/// Lower bound of an evaluation score.
pub const SCORE_MIN: f64 = 0.0;

/// Upper bound of an evaluation score.
pub const SCORE_MAX: f64 = 1.0;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a new time-sortable identifier.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(
    /// UUID v7 identifier of a [`Source`].
    SourceId
);

uuid_id!(
    /// UUID v7 identifier of an [`Artifact`].
    ArtifactId
);

// ---------------------------------------------------------------------------
// ContentHash
// ---------------------------------------------------------------------------

/// Lowercase hex SHA-256 digest identifying a blob by its bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Hash `bytes` with SHA-256.
    pub fn compute(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Parse a stored hash, rejecting anything that is not 64 lowercase hex chars.
    pub fn parse(s: &str) -> Result<Self> {
        let valid = s.len() == 64
            && s
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !valid {
            return Err(GleanerError::validation(format!(
                "malformed content hash: {s}"
            )));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

/// How a source's root URL is turned into seed URLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// RSS 2.0 or Atom feed; every item link is a seed.
    Feed,
    /// Plain website; the root URL is the only seed.
    Site,
    /// JSON listing endpoint; every `url`/`link`/`href` value is a seed.
    Api,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Feed => "feed",
            Self::Site => "site",
            Self::Api => "api",
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SourceType {
    type Err = GleanerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "feed" => Ok(Self::Feed),
            "site" => Ok(Self::Site),
            "api" => Ok(Self::Api),
            other => Err(GleanerError::validation(format!(
                "unknown source type '{other}': expected feed, site or api"
            ))),
        }
    }
}

/// Per-source politeness budget. These are ceilings, never targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolitenessPolicy {
    /// Minimum ms between two requests to the same host.
    pub delay_ms: u64,
    /// Maximum in-flight fetches for one crawl run of this source.
    pub concurrency: u32,
    /// Maximum link depth; seeds are depth 0.
    pub max_depth: u32,
}

impl Default for PolitenessPolicy {
    fn default() -> Self {
        Self {
            delay_ms: 1000,
            concurrency: 2,
            max_depth: 1,
        }
    }
}

/// Per-source replacement for the default link-following rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowOverride {
    /// Hosts whose links may be followed (subdomains included). Replaces the root host.
    #[serde(default)]
    pub allow_domains: Vec<String>,
    /// Glob patterns (`*`, `**`, `?`) on the URL path; a match is never followed.
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

/// A configured origin of documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    /// Unique human-readable name.
    pub name: String,
    /// Root URL (site root, feed URL, or API listing endpoint).
    pub url: Url,
    pub source_type: SourceType,
    /// Cron expression, validated at registration.
    pub schedule: String,
    pub is_active: bool,
    #[serde(default)]
    pub politeness: PolitenessPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follow: Option<FollowOverride>,
    /// Why the source was deactivated, if it was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deactivated_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Source {
    /// Build a new active source, validating its URL and schedule.
    pub fn new(
        name: impl Into<String>,
        url: &str,
        source_type: SourceType,
        schedule: &str,
    ) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| GleanerError::validation(format!("invalid source URL '{url}': {e}")))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(GleanerError::validation(format!(
                "source URL must be http or https: {url}"
            )));
        }
        let schedule = CronSchedule::parse(schedule)?;

        Ok(Self {
            id: SourceId::new(),
            name: name.into(),
            url,
            source_type,
            schedule: schedule.expr().to_string(),
            is_active: true,
            politeness: PolitenessPolicy::default(),
            follow: None,
            deactivated_reason: None,
            created_at: Utc::now(),
        })
    }

    /// Parse the stored schedule expression.
    pub fn cron(&self) -> Result<CronSchedule> {
        CronSchedule::parse(&self.schedule)
    }

    /// Host of the root URL, used as the default follow allow-list.
    pub fn root_host(&self) -> &str {
        self.url.host_str().unwrap_or("")
    }
}

// ---------------------------------------------------------------------------
// Artifact
// ---------------------------------------------------------------------------

/// Processing state of an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactState {
    Fetched,
    Normalized,
    Failed,
}

impl ArtifactState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fetched => "fetched",
            Self::Normalized => "normalized",
            Self::Failed => "failed",
        }
    }

    /// Whether `self -> next` is allowed.
    ///
    /// Without re-normalization only `fetched -> normalized | failed` is legal.
    /// With explicit re-normalization a `normalized` artifact may gain a new
    /// version and a `failed` one may be retried.
    pub fn can_transition_to(self, next: ArtifactState, renormalize: bool) -> bool {
        match (self, next) {
            (Self::Fetched, Self::Normalized | Self::Failed) => true,
            (Self::Normalized, Self::Normalized) => renormalize,
            (Self::Failed, Self::Normalized | Self::Failed) => renormalize,
            _ => false,
        }
    }
}

impl std::fmt::Display for ArtifactState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ArtifactState {
    type Err = GleanerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fetched" => Ok(Self::Fetched),
            "normalized" => Ok(Self::Normalized),
            "failed" => Ok(Self::Failed),
            other => Err(GleanerError::validation(format!(
                "unknown artifact state '{other}'"
            ))),
        }
    }
}

/// An immutable fetched document, identified by the hash of its bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ArtifactId,
    /// Source that first fetched it. Weak: the source may since be deactivated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<SourceId>,
    /// Canonical (first seen) URI.
    pub uri: String,
    pub content_hash: ContentHash,
    pub mime_type: String,
    pub content_len: u64,
    pub state: ArtifactState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

/// A URI at which an artifact's bytes were observed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UriAlias {
    pub artifact_id: ArtifactId,
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<SourceId>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// How a fetch was reconciled against existing artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchDisposition {
    /// New content: a new artifact was created.
    New,
    /// Known content at a URI not seen before: an alias was recorded.
    Alias,
    /// Known content at a known URI.
    Seen,
}

// ---------------------------------------------------------------------------
// Normalized documents
// ---------------------------------------------------------------------------

/// Best-effort metadata extracted from an artifact. Absent fields were not found.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Authors in document order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_on: Option<NaiveDate>,
}

/// Extracted text plus metadata for one version of an artifact's normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedDocument {
    pub id: String,
    pub artifact_id: ArtifactId,
    /// 1 for the first normalization, incremented by each re-normalization.
    pub version: u32,
    pub text: String,
    /// SHA-256 of `text`, used to detect unchanged documents.
    pub text_hash: ContentHash,
    pub word_count: usize,
    /// Name of the extraction strategy that produced this version.
    pub extractor: String,
    pub metadata: DocumentMetadata,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Rubrics & evaluations
// ---------------------------------------------------------------------------

/// An immutable, versioned evaluation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rubric {
    pub id: String,
    pub name: String,
    /// Monotonically increasing per `name`, starting at 1.
    pub version: u32,
    /// Opaque to the pipeline; interpreted by the scoring policy.
    pub criteria: serde_json::Value,
    pub published_at: DateTime<Utc>,
}

/// The labeled, scored outcome of applying a rubric to a normalized document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: String,
    pub artifact_id: ArtifactId,
    pub normalized_id: String,
    /// Text hash of the document that was scored.
    pub document_hash: ContentHash,
    pub rubric_id: String,
    pub rubric_name: String,
    pub rubric_version: u32,
    pub label: String,
    /// Within [`SCORE_MIN`, `SCORE_MAX`].
    pub score: f64,
    /// Whether this is the current record for (artifact, rubric version).
    pub is_current: bool,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Crawl runs
// ---------------------------------------------------------------------------

/// Final (or running) status of a crawl run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlRunStatus {
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
    Cancelled,
    TimedOut,
}

impl CrawlRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::CompletedWithErrors => "completed_with_errors",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        }
    }
}

impl std::fmt::Display for CrawlRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CrawlRunStatus {
    type Err = GleanerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "completed_with_errors" => Ok(Self::CompletedWithErrors),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "timed_out" => Ok(Self::TimedOut),
            other => Err(GleanerError::validation(format!(
                "unknown crawl run status '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_id_roundtrip() {
        let id = SourceId::new();
        let parsed: SourceId = id.to_string().parse().expect("parse SourceId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn content_hash_known_vector() {
        let hash = ContentHash::compute(b"hello world");
        assert_eq!(
            hash.as_str(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(ContentHash::parse(hash.as_str()).unwrap(), hash);
    }

    #[test]
    fn content_hash_rejects_garbage() {
        assert!(ContentHash::parse("abc").is_err());
        assert!(ContentHash::parse(&"Z".repeat(64)).is_err());
        assert!(ContentHash::parse(&"../".repeat(21)).is_err());
    }

    #[test]
    fn source_new_validates_schedule_and_url() {
        let source = Source::new(
            "example",
            "https://example.org/feed",
            SourceType::Feed,
            "0 */4 * * *",
        )
        .expect("valid source");
        assert!(source.is_active);
        assert_eq!(source.root_host(), "example.org");

        assert!(Source::new("bad", "https://example.org", SourceType::Site, "nope").is_err());
        assert!(Source::new("bad", "ftp://example.org", SourceType::Site, "@daily").is_err());
    }

    #[test]
    fn artifact_state_machine() {
        use ArtifactState::*;

        assert!(Fetched.can_transition_to(Normalized, false));
        assert!(Fetched.can_transition_to(Failed, false));
        assert!(!Normalized.can_transition_to(Fetched, true));
        assert!(!Failed.can_transition_to(Fetched, true));
        assert!(!Failed.can_transition_to(Normalized, false));
        assert!(Failed.can_transition_to(Normalized, true));
        assert!(!Normalized.can_transition_to(Normalized, false));
        assert!(Normalized.can_transition_to(Normalized, true));
        assert!(!Normalized.can_transition_to(Failed, false));
    }

    #[test]
    fn source_serialization() {
        let source =
            Source::new("docs", "https://docs.example.com/", SourceType::Site, "@daily").unwrap();
        let json = serde_json::to_string(&source).expect("serialize");
        assert!(json.contains(r#""source_type":"site""#));
        let parsed: Source = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.id, source.id);
        assert_eq!(parsed.politeness, PolitenessPolicy::default());
    }
}
