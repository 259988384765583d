//! Normalization of stored artifacts into versioned documents.
//!
//! The extraction strategies live in `gleaner-normalize`; this module owns the
//! artifact state machine around them: locking, loading bytes, running the
//! strategy on the blocking pool, and recording either a new version or the
//! failure reason.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};
use url::Url;

use gleaner_normalize::Strategy;
use gleaner_shared::{
    AppConfig, ArtifactId, ArtifactState, ContentHash, DocumentMetadata, GleanerError,
    NormalizedDocument, Result,
};
use gleaner_storage::{ContentStore, NewNormalized, Storage};

use crate::workers::BlockingPool;

/// Options of one processing request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingOptions {
    /// Re-normalize a `normalized` artifact or retry a `failed` one.
    #[serde(default)]
    pub force: bool,
}

/// Inbound processing request, as accepted by `gleaner process`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingRequest {
    pub artifact_id: ArtifactId,
    #[serde(default)]
    pub processing_options: ProcessingOptions,
}

/// Outcome of a processing request.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProcessingResponse {
    Completed {
        normalized_ref: String,
        version: u32,
        metadata: DocumentMetadata,
    },
    NotFound {
        reason: String,
    },
    Failed {
        reason: String,
    },
}

impl ProcessingResponse {
    /// HTTP-style status for the presentation layer.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Completed { .. } => 200,
            Self::NotFound { .. } => 404,
            Self::Failed { .. } => 500,
        }
    }
}

/// Result of a sweep over `fetched` artifacts.
#[derive(Debug, Clone, Default)]
pub struct NormalizeSummary {
    pub normalized: Vec<ArtifactId>,
    /// Artifacts that moved to `failed`, with the recorded reason.
    pub failed: Vec<(ArtifactId, String)>,
}

/// Drives artifacts through `fetched -> normalized | failed`.
#[derive(Clone)]
pub struct Normalizer {
    storage: Arc<Storage>,
    store: Arc<ContentStore>,
    pool: BlockingPool,
}

impl Normalizer {
    pub fn new(storage: Arc<Storage>, store: Arc<ContentStore>, pool: BlockingPool) -> Self {
        Self {
            storage,
            store,
            pool,
        }
    }

    /// A normalizer with a pool sized from `[normalizer]`.
    pub fn from_config(config: &AppConfig, storage: Arc<Storage>, store: Arc<ContentStore>) -> Self {
        Self::new(storage, store, BlockingPool::new(config.normalizer.workers))
    }

    pub fn pool(&self) -> &BlockingPool {
        &self.pool
    }

    /// Normalize one artifact.
    ///
    /// A `normalized` artifact returns its latest version unless `force` is
    /// set, in which case a new version is appended. A `failed` artifact is
    /// only retried with `force`. Extraction failures move a `fetched` (or
    /// forced `failed`) artifact to `failed`; a forced re-normalization of a
    /// `normalized` artifact that fails leaves it untouched.
    #[instrument(skip_all, fields(artifact_id = %artifact_id, force = options.force))]
    pub async fn normalize(
        &self,
        artifact_id: &ArtifactId,
        options: ProcessingOptions,
    ) -> Result<NormalizedDocument> {
        let _guard = self.storage.lock_artifact(artifact_id).await;

        let artifact = self
            .storage
            .get_artifact(artifact_id)
            .await?
            .ok_or_else(|| GleanerError::not_found("artifact", artifact_id.to_string()))?;

        match (artifact.state, options.force) {
            (ArtifactState::Normalized, false) => {
                debug!("already normalized, returning latest version");
                return self
                    .storage
                    .latest_normalized(artifact_id)
                    .await?
                    .ok_or_else(|| {
                        GleanerError::Storage(format!(
                            "artifact {artifact_id} is normalized but has no versions"
                        ))
                    });
            }
            (ArtifactState::Failed, false) => {
                let reason = artifact.failure_reason.unwrap_or_default();
                return Err(GleanerError::extraction(reason));
            }
            _ => {}
        }

        let bytes = match self.store.get(&artifact.content_hash).await {
            Ok(bytes) => bytes,
            Err(GleanerError::NotFound { .. }) => {
                return Err(GleanerError::ContentStore(format!(
                    "artifact {artifact_id} references missing blob {}",
                    artifact.content_hash
                )));
            }
            Err(e) => return Err(e),
        };
        let strategy = Strategy::for_mime(&artifact.mime_type);
        let base_url = Url::parse(&artifact.uri).ok();

        let extracted = self
            .pool
            .run(
                move || {
                    let extraction = strategy.extract(&bytes, base_url.as_ref())?;
                    let text_hash = ContentHash::compute(extraction.text.as_bytes());
                    Ok((extraction, text_hash))
                },
                |msg| GleanerError::extraction(format!("extractor panicked: {msg}")),
            )
            .await;

        match extracted {
            Ok((extraction, text_hash)) => {
                let doc = self
                    .storage
                    .record_normalization(
                        artifact_id,
                        artifact.state,
                        NewNormalized {
                            text: extraction.text,
                            text_hash,
                            word_count: extraction.word_count,
                            extractor: extraction.extractor.to_string(),
                            metadata: extraction.metadata,
                        },
                        options.force,
                    )
                    .await?;
                info!(
                    version = doc.version,
                    extractor = %doc.extractor,
                    words = doc.word_count,
                    "artifact normalized"
                );
                Ok(doc)
            }
            Err(GleanerError::Extraction { reason }) => {
                if artifact.state == ArtifactState::Normalized {
                    warn!(%reason, "re-normalization failed, keeping earlier versions");
                } else {
                    self.storage
                        .transition_artifact(
                            artifact_id,
                            artifact.state,
                            ArtifactState::Failed,
                            Some(&reason),
                            options.force,
                        )
                        .await?;
                    warn!(mime = %artifact.mime_type, %reason, "artifact failed extraction");
                }
                Err(GleanerError::Extraction { reason })
            }
            Err(e) => Err(e),
        }
    }

    /// Handle a processing request, mapping errors onto the response shape.
    pub async fn process(&self, request: ProcessingRequest) -> ProcessingResponse {
        match self
            .normalize(&request.artifact_id, request.processing_options)
            .await
        {
            Ok(doc) => ProcessingResponse::Completed {
                normalized_ref: doc.id,
                version: doc.version,
                metadata: doc.metadata,
            },
            Err(e @ GleanerError::NotFound { .. }) => ProcessingResponse::NotFound {
                reason: e.to_string(),
            },
            Err(GleanerError::Extraction { reason }) => ProcessingResponse::Failed { reason },
            Err(e) => ProcessingResponse::Failed {
                reason: e.to_string(),
            },
        }
    }

    /// Normalize up to `limit` artifacts still in `fetched`, oldest first.
    ///
    /// Extraction failures are collected; storage and content store failures
    /// abort the sweep.
    #[instrument(skip(self))]
    pub async fn normalize_pending(&self, limit: u32) -> Result<NormalizeSummary> {
        let pending = self
            .storage
            .list_artifacts(Some(ArtifactState::Fetched), limit)
            .await?;
        self.normalize_all(pending.into_iter().map(|a| a.id)).await
    }

    /// Normalize the given artifacts concurrently, bounded by the pool.
    pub async fn normalize_all(
        &self,
        ids: impl IntoIterator<Item = ArtifactId>,
    ) -> Result<NormalizeSummary> {
        let mut tasks = JoinSet::new();
        for id in ids {
            let this = self.clone();
            tasks.spawn(async move {
                let result = this.normalize(&id, ProcessingOptions::default()).await;
                (id, result)
            });
        }

        let mut summary = NormalizeSummary::default();
        while let Some(joined) = tasks.join_next().await {
            let (id, result) = joined.map_err(|e| GleanerError::Storage(e.to_string()))?;
            match result {
                Ok(_) => summary.normalized.push(id),
                Err(GleanerError::Extraction { reason }) => summary.failed.push((id, reason)),
                Err(e) if e.is_fatal() => {
                    tasks.abort_all();
                    return Err(e);
                }
                Err(e) => warn!(artifact_id = %id, error = %e, "skipping artifact"),
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gleaner_shared::Artifact;
    use gleaner_storage::open_data_dir;
    use uuid::Uuid;

    async fn setup() -> Normalizer {
        let dir = std::env::temp_dir().join(format!("gleaner_test_{}", Uuid::now_v7()));
        let (storage, store) = open_data_dir(&dir).await.unwrap();
        Normalizer::new(Arc::new(storage), Arc::new(store), BlockingPool::new(2))
    }

    async fn ingest(n: &Normalizer, uri: &str, mime: &str, body: &[u8]) -> Artifact {
        let (hash, _) = n.store.put(body).await.unwrap();
        let (artifact, _) = n
            .storage
            .record_fetch(None, uri, &hash, mime, body.len() as u64)
            .await
            .unwrap();
        artifact
    }

    const PAGE: &[u8] =
        b"<html><head><title>Field Notes</title></head><body><main><p>See <a href=\"/more\">more</a>.</p></main></body></html>";

    #[tokio::test]
    async fn normalizes_html_and_resolves_links() {
        let n = setup().await;
        let a = ingest(&n, "https://example.org/notes/", "text/html", PAGE).await;

        let doc = n.normalize(&a.id, ProcessingOptions::default()).await.unwrap();
        assert_eq!(doc.version, 1);
        assert_eq!(doc.extractor, "html");
        assert_eq!(doc.metadata.title.as_deref(), Some("Field Notes"));
        assert!(doc.text.contains("https://example.org/more"));
        assert_eq!(doc.text_hash, ContentHash::compute(doc.text.as_bytes()));

        let stored = n.storage.get_artifact(&a.id).await.unwrap().unwrap();
        assert_eq!(stored.state, ArtifactState::Normalized);
    }

    #[tokio::test]
    async fn normalized_without_force_returns_latest() {
        let n = setup().await;
        let a = ingest(&n, "https://example.org/a", "text/plain", b"# Title\n\nbody").await;

        let first = n.normalize(&a.id, ProcessingOptions::default()).await.unwrap();
        let again = n.normalize(&a.id, ProcessingOptions::default()).await.unwrap();
        assert_eq!(first.id, again.id);

        let forced = n
            .normalize(&a.id, ProcessingOptions { force: true })
            .await
            .unwrap();
        assert_eq!(forced.version, 2);
        let versions = n.storage.list_normalized_versions(&a.id).await.unwrap();
        assert_eq!(versions.len(), 2);
    }

    #[tokio::test]
    async fn unsupported_mime_fails_artifact_others_proceed() {
        let n = setup().await;
        let bad = ingest(&n, "https://example.org/blob", "application/unknown-x", b"\x00\x01").await;
        let good = ingest(&n, "https://example.org/ok", "text/plain", b"plain words").await;

        let summary = n.normalize_pending(10).await.unwrap();
        assert_eq!(summary.normalized, vec![good.id]);
        assert_eq!(
            summary.failed,
            vec![(bad.id, gleaner_normalize::UNSUPPORTED_MIME.to_string())]
        );

        let stored = n.storage.get_artifact(&bad.id).await.unwrap().unwrap();
        assert_eq!(stored.state, ArtifactState::Failed);
        assert_eq!(stored.failure_reason.as_deref(), Some("unsupported MIME type"));
    }

    #[tokio::test]
    async fn failed_is_terminal_without_force() {
        let n = setup().await;
        let a = ingest(&n, "https://example.org/e", "text/plain", b"   \n").await;

        assert!(n.normalize(&a.id, ProcessingOptions::default()).await.is_err());
        let err = n.normalize(&a.id, ProcessingOptions::default()).await.unwrap_err();
        assert!(matches!(err, GleanerError::Extraction { .. }));

        // Forced retry of an artifact whose content is still empty stays failed.
        let err = n
            .normalize(&a.id, ProcessingOptions { force: true })
            .await
            .unwrap_err();
        assert!(matches!(err, GleanerError::Extraction { .. }));
        let stored = n.storage.get_artifact(&a.id).await.unwrap().unwrap();
        assert_eq!(stored.state, ArtifactState::Failed);
        assert!(n.storage.latest_normalized(&a.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn process_maps_outcomes() {
        let n = setup().await;
        let a = ingest(&n, "https://example.org/p", "text/markdown", b"# Hello\n\nworld").await;

        let ok = n
            .process(ProcessingRequest {
                artifact_id: a.id,
                processing_options: ProcessingOptions::default(),
            })
            .await;
        assert_eq!(ok.status_code(), 200);
        match &ok {
            ProcessingResponse::Completed {
                version, metadata, ..
            } => {
                assert_eq!(*version, 1);
                assert_eq!(metadata.title.as_deref(), Some("Hello"));
            }
            other => panic!("unexpected response: {other:?}"),
        }
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["status"], "completed");

        let missing = n
            .process(ProcessingRequest {
                artifact_id: ArtifactId::new(),
                processing_options: ProcessingOptions::default(),
            })
            .await;
        assert_eq!(missing.status_code(), 404);

        let bad = ingest(&n, "https://example.org/x", "application/unknown-x", b"zz").await;
        let failed = n
            .process(ProcessingRequest {
                artifact_id: bad.id,
                processing_options: ProcessingOptions::default(),
            })
            .await;
        assert_eq!(failed.status_code(), 500);
        match failed {
            ProcessingResponse::Failed { reason } => assert_eq!(reason, "unsupported MIME type"),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_blob_is_a_store_failure() {
        let n = setup().await;
        let hash = ContentHash::compute(b"never written");
        let (artifact, _) = n
            .storage
            .record_fetch(None, "https://example.org/lost", &hash, "text/plain", 13)
            .await
            .unwrap();

        let err = n
            .normalize(&artifact.id, ProcessingOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GleanerError::ContentStore(_)));

        let response = n
            .process(ProcessingRequest {
                artifact_id: artifact.id,
                processing_options: ProcessingOptions::default(),
            })
            .await;
        assert_eq!(response.status_code(), 500);
        match response {
            ProcessingResponse::Failed { reason } => assert!(reason.contains("missing blob")),
            other => panic!("unexpected response: {other:?}"),
        }

        // The artifact is left for a later retry.
        let stored = n.storage.get_artifact(&artifact.id).await.unwrap().unwrap();
        assert_eq!(stored.state, ArtifactState::Fetched);
    }

    #[test]
    fn request_parses_with_default_options() {
        let id = ArtifactId::new();
        let req: ProcessingRequest =
            serde_json::from_str(&format!(r#"{{"artifact_id":"{id}"}}"#)).unwrap();
        assert_eq!(req.artifact_id, id);
        assert!(!req.processing_options.force);
    }
}
