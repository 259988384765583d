//! libSQL record store and content-addressed blob store (offline mode).
//!
//! The [`Storage`] struct wraps a libSQL database holding sources, artifacts
//! and their URI aliases, normalized document versions, rubrics, evaluations
//! and crawl-run history. Blob bytes live in the [`ContentStore`].
//!
//! **Access rules:**
//! - Pipeline and CLI: read-write via [`Storage::open`]. Writes are serialized
//!   by an internal write lock; artifact state changes are additionally
//!   serialized per artifact with [`Storage::lock_artifact`].
//! - Presentation layers: read-only via [`Storage::open_readonly`], consuming
//!   [`Storage::query_evaluations`].

pub mod blob;
mod migrations;

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, NaiveDate, Utc};
use gleaner_shared::{
    Artifact, ArtifactId, ArtifactState, ContentHash, CrawlRunStatus, DocumentMetadata,
    Evaluation, FetchDisposition, FollowOverride, GleanerError, NormalizedDocument,
    PolitenessPolicy, Result, Rubric, Source, SourceId, SourceType, UriAlias,
};
use libsql::{Connection, Database, params};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

pub use blob::ContentStore;

/// Database file name inside the data directory.
pub const DB_FILE_NAME: &str = "gleaner.db";

/// Blob directory name inside the data directory.
pub const BLOB_DIR_NAME: &str = "blobs";

/// Open the record store and content store under a data directory.
pub async fn open_data_dir(data_dir: &Path) -> Result<(Storage, ContentStore)> {
    let storage = Storage::open(&data_dir.join(DB_FILE_NAME)).await?;
    let store = ContentStore::open(data_dir.join(BLOB_DIR_NAME)).await?;
    Ok((storage, store))
}

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
    write_lock: Mutex<()>,
    artifact_locks: StdMutex<HashMap<ArtifactId, Arc<Mutex<()>>>>,
}

/// Fields of a new normalized document version.
#[derive(Debug, Clone)]
pub struct NewNormalized {
    pub text: String,
    pub text_hash: ContentHash,
    pub word_count: usize,
    pub extractor: String,
    pub metadata: DocumentMetadata,
}

/// Filter for [`Storage::query_evaluations`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct EvaluationFilter {
    pub artifact_id: Option<ArtifactId>,
    pub label: Option<String>,
    pub rubric_name: Option<String>,
    pub rubric_version: Option<u32>,
    /// Also return superseded (non-current) records.
    pub include_superseded: bool,
}

/// One crawl run of one source.
#[derive(Debug, Clone)]
pub struct CrawlRun {
    pub id: String,
    pub source_id: SourceId,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: CrawlRunStatus,
    pub stats: Option<serde_json::Value>,
}

const SOURCE_COLUMNS: &str = "id, name, url, source_type, schedule, is_active, politeness_json, follow_json, deactivated_reason, created_at";
const ARTIFACT_COLUMNS: &str = "id, source_id, uri, content_hash, mime_type, content_len, state, failure_reason, fetched_at";
const NORMALIZED_COLUMNS: &str = "id, artifact_id, version, text, text_hash, word_count, extractor, title, authors_json, organization, published_on, created_at";
const RUBRIC_COLUMNS: &str = "id, name, version, criteria_json, published_at";
const EVALUATION_COLUMNS: &str = "id, artifact_id, normalized_id, document_hash, rubric_id, rubric_name, rubric_version, label, score, is_current, created_at";
const CRAWL_RUN_COLUMNS: &str = "id, source_id, started_at, finished_at, status, stats_json";

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| GleanerError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path).build().await.map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        let storage = Self::from_parts(db, conn, false);
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode (for presentation layers).
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path).build().await.map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;
        Ok(Self::from_parts(db, conn, true))
    }

    fn from_parts(db: Database, conn: Connection, readonly: bool) -> Self {
        Self {
            db,
            conn,
            readonly,
            write_lock: Mutex::new(()),
            artifact_locks: StdMutex::new(HashMap::new()),
        }
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    GleanerError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(GleanerError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    /// Serialize state changes to one artifact. Hold the guard across
    /// read-decide-write sequences.
    pub async fn lock_artifact(&self, id: &ArtifactId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .artifact_locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks
                .entry(*id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    // -----------------------------------------------------------------------
    // Source operations
    // -----------------------------------------------------------------------

    /// Register a new source. Names are unique.
    pub async fn insert_source(&self, source: &Source) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;

        if self.get_source_by_name(&source.name).await?.is_some() {
            return Err(GleanerError::validation(format!(
                "a source named '{}' already exists",
                source.name
            )));
        }

        let now = Utc::now().to_rfc3339();
        let politeness = to_json(&source.politeness)?;
        let follow = source.follow.as_ref().map(to_json).transpose()?;
        self.conn
            .execute(
                "INSERT INTO sources (id, name, url, source_type, schedule, is_active,
                                      politeness_json, follow_json, deactivated_reason, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    source.id.to_string(),
                    source.name.as_str(),
                    source.url.as_str(),
                    source.source_type.as_str(),
                    source.schedule.as_str(),
                    source.is_active as i64,
                    politeness,
                    follow,
                    source.deactivated_reason.as_deref(),
                    source.created_at.to_rfc3339(),
                    now.as_str(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Insert `source`, or update the configuration of the existing source with
    /// the same name. The active flag of an existing source is left alone.
    /// Returns the stored source and whether it was newly created.
    pub async fn sync_source(&self, source: &Source) -> Result<(Source, bool)> {
        let existing = self.get_source_by_name(&source.name).await?;
        let Some(existing) = existing else {
            self.insert_source(source).await?;
            return Ok((source.clone(), true));
        };

        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        let now = Utc::now().to_rfc3339();
        let politeness = to_json(&source.politeness)?;
        let follow = source.follow.as_ref().map(to_json).transpose()?;
        self.conn
            .execute(
                "UPDATE sources SET url = ?1, source_type = ?2, schedule = ?3,
                        politeness_json = ?4, follow_json = ?5, updated_at = ?6
                 WHERE id = ?7",
                params![
                    source.url.as_str(),
                    source.source_type.as_str(),
                    source.schedule.as_str(),
                    politeness,
                    follow,
                    now.as_str(),
                    existing.id.to_string(),
                ],
            )
            .await
            .map_err(db_err)?;

        let updated = Source {
            id: existing.id,
            is_active: existing.is_active,
            deactivated_reason: existing.deactivated_reason,
            created_at: existing.created_at,
            ..source.clone()
        };
        Ok((updated, false))
    }

    pub async fn get_source(&self, id: &SourceId) -> Result<Option<Source>> {
        let sql = format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE id = ?1");
        let mut rows = self
            .conn
            .query(&sql, params![id.to_string()])
            .await
            .map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_source(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn get_source_by_name(&self, name: &str) -> Result<Option<Source>> {
        let sql = format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE name = ?1");
        let mut rows = self.conn.query(&sql, params![name]).await.map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_source(&row)?)),
            None => Ok(None),
        }
    }

    /// Look a source up by name, falling back to parsing `key` as an id.
    pub async fn find_source(&self, key: &str) -> Result<Option<Source>> {
        if let Some(source) = self.get_source_by_name(key).await? {
            return Ok(Some(source));
        }
        match SourceId::from_str(key) {
            Ok(id) => self.get_source(&id).await,
            Err(_) => Ok(None),
        }
    }

    /// All sources ordered by id.
    pub async fn list_sources(&self) -> Result<Vec<Source>> {
        self.query_sources(&format!("SELECT {SOURCE_COLUMNS} FROM sources ORDER BY id"))
            .await
    }

    pub async fn list_active_sources(&self) -> Result<Vec<Source>> {
        self.query_sources(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources WHERE is_active = 1 ORDER BY id"
        ))
        .await
    }

    async fn query_sources(&self, sql: &str) -> Result<Vec<Source>> {
        let mut rows = self.conn.query(sql, params![]).await.map_err(db_err)?;
        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_source(&row)?);
        }
        Ok(results)
    }

    /// Soft-(de)activate a source. Returns `false` if no such source exists.
    pub async fn set_source_active(
        &self,
        id: &SourceId,
        active: bool,
        reason: Option<&str>,
    ) -> Result<bool> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        let now = Utc::now().to_rfc3339();
        let reason = if active { None } else { reason };
        let changed = self
            .conn
            .execute(
                "UPDATE sources SET is_active = ?1, deactivated_reason = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![active as i64, reason, now.as_str(), id.to_string()],
            )
            .await
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    // -----------------------------------------------------------------------
    // Artifact operations
    // -----------------------------------------------------------------------

    /// Reconcile a fetch with existing artifacts by content hash.
    ///
    /// New hash: a new artifact in `fetched` state plus its canonical URI row.
    /// Known hash at a new URI: an alias row. Known hash at a known URI: the
    /// alias's `last_seen_at` is refreshed.
    pub async fn record_fetch(
        &self,
        source_id: Option<&SourceId>,
        uri: &str,
        content_hash: &ContentHash,
        mime_type: &str,
        content_len: u64,
    ) -> Result<(Artifact, FetchDisposition)> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        let now = Utc::now().to_rfc3339();
        let source_id = source_id.map(|s| s.to_string());

        let inserted = self
            .conn
            .execute(
                "INSERT INTO artifacts (id, source_id, uri, content_hash, mime_type, content_len,
                                        state, fetched_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'fetched', ?7, ?8)
                 ON CONFLICT(content_hash) DO NOTHING",
                params![
                    ArtifactId::new().to_string(),
                    source_id.clone(),
                    uri,
                    content_hash.as_str(),
                    mime_type,
                    content_len as i64,
                    now.as_str(),
                    now.as_str(),
                ],
            )
            .await
            .map_err(db_err)?
            > 0;

        let artifact = self
            .get_artifact_by_hash(content_hash)
            .await?
            .ok_or_else(|| {
                GleanerError::Storage(format!("artifact for {content_hash} vanished after insert"))
            })?;

        let known_uri = {
            let mut rows = self
                .conn
                .query(
                    "SELECT 1 FROM artifact_uris WHERE artifact_id = ?1 AND uri = ?2",
                    params![artifact.id.to_string(), uri],
                )
                .await
                .map_err(db_err)?;
            rows.next().await.map_err(db_err)?.is_some()
        };

        self.conn
            .execute(
                "INSERT INTO artifact_uris (artifact_id, uri, source_id, first_seen_at, last_seen_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(artifact_id, uri) DO UPDATE SET last_seen_at = excluded.last_seen_at",
                params![
                    artifact.id.to_string(),
                    uri,
                    source_id,
                    now.as_str(),
                    now.as_str(),
                ],
            )
            .await
            .map_err(db_err)?;

        let disposition = if inserted {
            FetchDisposition::New
        } else if known_uri {
            FetchDisposition::Seen
        } else {
            FetchDisposition::Alias
        };
        Ok((artifact, disposition))
    }

    pub async fn get_artifact(&self, id: &ArtifactId) -> Result<Option<Artifact>> {
        let sql = format!("SELECT {ARTIFACT_COLUMNS} FROM artifacts WHERE id = ?1");
        let mut rows = self
            .conn
            .query(&sql, params![id.to_string()])
            .await
            .map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_artifact(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn get_artifact_by_hash(&self, hash: &ContentHash) -> Result<Option<Artifact>> {
        let sql = format!("SELECT {ARTIFACT_COLUMNS} FROM artifacts WHERE content_hash = ?1");
        let mut rows = self
            .conn
            .query(&sql, params![hash.as_str()])
            .await
            .map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_artifact(&row)?)),
            None => Ok(None),
        }
    }

    /// Artifacts, oldest first, optionally restricted to one state.
    pub async fn list_artifacts(
        &self,
        state: Option<ArtifactState>,
        limit: u32,
    ) -> Result<Vec<Artifact>> {
        let mut rows = match state {
            Some(state) => {
                let sql = format!(
                    "SELECT {ARTIFACT_COLUMNS} FROM artifacts WHERE state = ?1
                     ORDER BY fetched_at, id LIMIT ?2"
                );
                self.conn.query(&sql, params![state.as_str(), limit]).await
            }
            None => {
                let sql = format!(
                    "SELECT {ARTIFACT_COLUMNS} FROM artifacts ORDER BY fetched_at, id LIMIT ?1"
                );
                self.conn.query(&sql, params![limit]).await
            }
        }
        .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_artifact(&row)?);
        }
        Ok(results)
    }

    /// Number of artifacts in each state.
    pub async fn artifact_counts(&self) -> Result<Vec<(ArtifactState, u64)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT state, COUNT(*) FROM artifacts GROUP BY state ORDER BY state",
                params![],
            )
            .await
            .map_err(db_err)?;
        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let state: String = row.get(0).map_err(db_err)?;
            let count: i64 = row.get(1).map_err(db_err)?;
            results.push((ArtifactState::from_str(&state)?, count as u64));
        }
        Ok(results)
    }

    /// Every URI the artifact's bytes were observed at, canonical first.
    pub async fn list_uris(&self, artifact_id: &ArtifactId) -> Result<Vec<UriAlias>> {
        let mut rows = self
            .conn
            .query(
                "SELECT artifact_id, uri, source_id, first_seen_at, last_seen_at
                 FROM artifact_uris WHERE artifact_id = ?1 ORDER BY first_seen_at, uri",
                params![artifact_id.to_string()],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(UriAlias {
                artifact_id: parse_id(&row.get::<String>(0).map_err(db_err)?)?,
                uri: row.get(1).map_err(db_err)?,
                source_id: row
                    .get::<String>(2)
                    .ok()
                    .map(|s| parse_id(&s))
                    .transpose()?,
                first_seen_at: parse_ts(&row.get::<String>(3).map_err(db_err)?)?,
                last_seen_at: parse_ts(&row.get::<String>(4).map_err(db_err)?)?,
            });
        }
        Ok(results)
    }

    /// Conditionally move an artifact from `from` to `to`.
    ///
    /// Returns `false` when the artifact was no longer in `from` (another
    /// writer got there first). Illegal transitions are rejected outright.
    pub async fn transition_artifact(
        &self,
        id: &ArtifactId,
        from: ArtifactState,
        to: ArtifactState,
        failure_reason: Option<&str>,
        renormalize: bool,
    ) -> Result<bool> {
        self.check_writable()?;
        if !from.can_transition_to(to, renormalize) {
            return Err(GleanerError::validation(format!(
                "illegal artifact transition {from} -> {to}"
            )));
        }

        let _guard = self.write_lock.lock().await;
        let now = Utc::now().to_rfc3339();
        let reason = if to == ArtifactState::Failed {
            failure_reason
        } else {
            None
        };
        let changed = self
            .conn
            .execute(
                "UPDATE artifacts SET state = ?1, failure_reason = ?2, updated_at = ?3
                 WHERE id = ?4 AND state = ?5",
                params![
                    to.as_str(),
                    reason,
                    now.as_str(),
                    id.to_string(),
                    from.as_str()
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    // -----------------------------------------------------------------------
    // Normalized document operations
    // -----------------------------------------------------------------------

    /// Append the next normalized version and move the artifact from `from`
    /// to `normalized`, atomically.
    pub async fn record_normalization(
        &self,
        artifact_id: &ArtifactId,
        from: ArtifactState,
        doc: NewNormalized,
        renormalize: bool,
    ) -> Result<NormalizedDocument> {
        self.check_writable()?;
        if !from.can_transition_to(ArtifactState::Normalized, renormalize) {
            return Err(GleanerError::validation(format!(
                "illegal artifact transition {from} -> normalized"
            )));
        }

        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let tx = self.conn.transaction().await.map_err(db_err)?;

        let changed = tx
            .execute(
                "UPDATE artifacts SET state = 'normalized', failure_reason = NULL, updated_at = ?1
                 WHERE id = ?2 AND state = ?3",
                params![now.to_rfc3339(), artifact_id.to_string(), from.as_str()],
            )
            .await
            .map_err(db_err)?;
        if changed == 0 {
            tx.rollback().await.map_err(db_err)?;
            return Err(GleanerError::validation(format!(
                "artifact {artifact_id} is no longer {from}"
            )));
        }

        let version = {
            let mut rows = tx
                .query(
                    "SELECT COALESCE(MAX(version), 0) + 1 FROM normalized_documents WHERE artifact_id = ?1",
                    params![artifact_id.to_string()],
                )
                .await
                .map_err(db_err)?;
            match rows.next().await.map_err(db_err)? {
                Some(row) => row.get::<u32>(0).map_err(db_err)?,
                None => 1,
            }
        };

        let id = Uuid::now_v7().to_string();
        let authors = to_json(&doc.metadata.authors)?;
        tx.execute(
            "INSERT INTO normalized_documents (id, artifact_id, version, text, text_hash, word_count,
                                               extractor, title, authors_json, organization,
                                               published_on, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                id.as_str(),
                artifact_id.to_string(),
                version,
                doc.text.as_str(),
                doc.text_hash.as_str(),
                doc.word_count as i64,
                doc.extractor.as_str(),
                doc.metadata.title.as_deref(),
                authors,
                doc.metadata.organization.as_deref(),
                doc.metadata.published_on.map(|d| d.to_string()),
                now.to_rfc3339(),
            ],
        )
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        Ok(NormalizedDocument {
            id,
            artifact_id: *artifact_id,
            version,
            text: doc.text,
            text_hash: doc.text_hash,
            word_count: doc.word_count,
            extractor: doc.extractor,
            metadata: doc.metadata,
            created_at: now,
        })
    }

    /// Highest version of an artifact's normalized document.
    pub async fn latest_normalized(
        &self,
        artifact_id: &ArtifactId,
    ) -> Result<Option<NormalizedDocument>> {
        let sql = format!(
            "SELECT {NORMALIZED_COLUMNS} FROM normalized_documents
             WHERE artifact_id = ?1 ORDER BY version DESC LIMIT 1"
        );
        let mut rows = self
            .conn
            .query(&sql, params![artifact_id.to_string()])
            .await
            .map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_normalized(&row)?)),
            None => Ok(None),
        }
    }

    /// All versions of an artifact's normalized document, oldest first.
    pub async fn list_normalized_versions(
        &self,
        artifact_id: &ArtifactId,
    ) -> Result<Vec<NormalizedDocument>> {
        let sql = format!(
            "SELECT {NORMALIZED_COLUMNS} FROM normalized_documents
             WHERE artifact_id = ?1 ORDER BY version"
        );
        let mut rows = self
            .conn
            .query(&sql, params![artifact_id.to_string()])
            .await
            .map_err(db_err)?;
        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_normalized(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Rubric operations
    // -----------------------------------------------------------------------

    /// Publish `criteria` as the next version of rubric `name`.
    pub async fn publish_rubric(&self, name: &str, criteria: &serde_json::Value) -> Result<Rubric> {
        self.check_writable()?;
        if name.trim().is_empty() {
            return Err(GleanerError::validation("rubric name must not be empty"));
        }

        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let tx = self.conn.transaction().await.map_err(db_err)?;

        let version = {
            let mut rows = tx
                .query(
                    "SELECT COALESCE(MAX(version), 0) + 1 FROM rubrics WHERE name = ?1",
                    params![name],
                )
                .await
                .map_err(db_err)?;
            match rows.next().await.map_err(db_err)? {
                Some(row) => row.get::<u32>(0).map_err(db_err)?,
                None => 1,
            }
        };

        let id = Uuid::now_v7().to_string();
        tx.execute(
            "INSERT INTO rubrics (id, name, version, criteria_json, published_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id.as_str(),
                name,
                version,
                to_json(criteria)?,
                now.to_rfc3339()
            ],
        )
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        tracing::info!(rubric = name, version, "published rubric");
        Ok(Rubric {
            id,
            name: name.to_string(),
            version,
            criteria: criteria.clone(),
            published_at: now,
        })
    }

    pub async fn get_rubric(&self, name: &str, version: u32) -> Result<Option<Rubric>> {
        let sql = format!("SELECT {RUBRIC_COLUMNS} FROM rubrics WHERE name = ?1 AND version = ?2");
        let mut rows = self
            .conn
            .query(&sql, params![name, version])
            .await
            .map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_rubric(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn latest_rubric(&self, name: &str) -> Result<Option<Rubric>> {
        let sql = format!(
            "SELECT {RUBRIC_COLUMNS} FROM rubrics WHERE name = ?1 ORDER BY version DESC LIMIT 1"
        );
        let mut rows = self.conn.query(&sql, params![name]).await.map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_rubric(&row)?)),
            None => Ok(None),
        }
    }

    /// Every published rubric version, by name then version.
    pub async fn list_rubrics(&self) -> Result<Vec<Rubric>> {
        let sql = format!("SELECT {RUBRIC_COLUMNS} FROM rubrics ORDER BY name, version");
        let mut rows = self.conn.query(&sql, params![]).await.map_err(db_err)?;
        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_rubric(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Evaluation operations
    // -----------------------------------------------------------------------

    /// The current evaluation of an artifact under one rubric version.
    pub async fn current_evaluation(
        &self,
        artifact_id: &ArtifactId,
        rubric_id: &str,
    ) -> Result<Option<Evaluation>> {
        let sql = format!(
            "SELECT {EVALUATION_COLUMNS} FROM evaluations
             WHERE artifact_id = ?1 AND rubric_id = ?2 AND is_current = 1"
        );
        let mut rows = self
            .conn
            .query(&sql, params![artifact_id.to_string(), rubric_id])
            .await
            .map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_evaluation(&row)?)),
            None => Ok(None),
        }
    }

    /// Append `evaluation` as the current record, superseding the previous one.
    pub async fn append_evaluation(&self, evaluation: &Evaluation) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        let tx = self.conn.transaction().await.map_err(db_err)?;

        tx.execute(
            "UPDATE evaluations SET is_current = 0
             WHERE artifact_id = ?1 AND rubric_id = ?2 AND is_current = 1",
            params![
                evaluation.artifact_id.to_string(),
                evaluation.rubric_id.as_str()
            ],
        )
        .await
        .map_err(db_err)?;

        tx.execute(
            "INSERT INTO evaluations (id, artifact_id, normalized_id, document_hash, rubric_id,
                                      rubric_name, rubric_version, label, score, is_current, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 1, ?10)",
            params![
                evaluation.id.as_str(),
                evaluation.artifact_id.to_string(),
                evaluation.normalized_id.as_str(),
                evaluation.document_hash.as_str(),
                evaluation.rubric_id.as_str(),
                evaluation.rubric_name.as_str(),
                evaluation.rubric_version,
                evaluation.label.as_str(),
                evaluation.score,
                evaluation.created_at.to_rfc3339(),
            ],
        )
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    /// Query evaluations, newest first, with offset pagination.
    pub async fn query_evaluations(
        &self,
        filter: &EvaluationFilter,
        skip: u32,
        limit: u32,
    ) -> Result<Vec<Evaluation>> {
        let mut sql = format!("SELECT {EVALUATION_COLUMNS} FROM evaluations WHERE 1 = 1");
        let mut args: Vec<libsql::Value> = Vec::new();

        if !filter.include_superseded {
            sql.push_str(" AND is_current = 1");
        }
        if let Some(id) = &filter.artifact_id {
            args.push(id.to_string().into());
            sql.push_str(&format!(" AND artifact_id = ?{}", args.len()));
        }
        if let Some(label) = &filter.label {
            args.push(label.clone().into());
            sql.push_str(&format!(" AND label = ?{}", args.len()));
        }
        if let Some(name) = &filter.rubric_name {
            args.push(name.clone().into());
            sql.push_str(&format!(" AND rubric_name = ?{}", args.len()));
        }
        if let Some(version) = filter.rubric_version {
            args.push(i64::from(version).into());
            sql.push_str(&format!(" AND rubric_version = ?{}", args.len()));
        }
        args.push(i64::from(limit).into());
        args.push(i64::from(skip).into());
        sql.push_str(&format!(
            " ORDER BY created_at DESC, id DESC LIMIT ?{} OFFSET ?{}",
            args.len() - 1,
            args.len()
        ));

        let mut rows = self
            .conn
            .query(&sql, libsql::params::Params::Positional(args))
            .await
            .map_err(db_err)?;
        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_evaluation(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Crawl run operations
    // -----------------------------------------------------------------------

    /// Record the start of a crawl run. Returns the generated run ID.
    pub async fn insert_crawl_run(
        &self,
        source_id: &SourceId,
        started_at: DateTime<Utc>,
    ) -> Result<String> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        let id = Uuid::now_v7().to_string();
        self.conn
            .execute(
                "INSERT INTO crawl_runs (id, source_id, started_at, status) VALUES (?1, ?2, ?3, 'running')",
                params![id.as_str(), source_id.to_string(), started_at.to_rfc3339()],
            )
            .await
            .map_err(db_err)?;
        Ok(id)
    }

    /// Close a crawl run with its final status and stats.
    pub async fn finish_crawl_run(
        &self,
        run_id: &str,
        status: CrawlRunStatus,
        stats: &serde_json::Value,
    ) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE crawl_runs SET finished_at = ?1, status = ?2, stats_json = ?3 WHERE id = ?4",
                params![now.as_str(), status.as_str(), to_json(stats)?, run_id],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Most recent finished run of a source.
    pub async fn last_finished_run(&self, source_id: &SourceId) -> Result<Option<CrawlRun>> {
        let sql = format!(
            "SELECT {CRAWL_RUN_COLUMNS} FROM crawl_runs
             WHERE source_id = ?1 AND finished_at IS NOT NULL
             ORDER BY started_at DESC LIMIT 1"
        );
        let mut rows = self
            .conn
            .query(&sql, params![source_id.to_string()])
            .await
            .map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_crawl_run(&row)?)),
            None => Ok(None),
        }
    }

    /// Recent runs of a source, newest first.
    pub async fn list_crawl_runs(&self, source_id: &SourceId, limit: u32) -> Result<Vec<CrawlRun>> {
        let sql = format!(
            "SELECT {CRAWL_RUN_COLUMNS} FROM crawl_runs
             WHERE source_id = ?1 ORDER BY started_at DESC LIMIT ?2"
        );
        let mut rows = self
            .conn
            .query(&sql, params![source_id.to_string(), limit])
            .await
            .map_err(db_err)?;
        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_crawl_run(&row)?);
        }
        Ok(results)
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn db_err(e: libsql::Error) -> GleanerError {
    GleanerError::Storage(e.to_string())
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| GleanerError::Storage(format!("encode: {e}")))
}

fn from_json<T: serde::de::DeserializeOwned>(s: &str) -> Result<T> {
    serde_json::from_str(s).map_err(|e| GleanerError::Storage(format!("decode: {e}")))
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| GleanerError::Storage(format!("invalid date: {e}")))
}

fn parse_id<T: FromStr>(s: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    s.parse()
        .map_err(|e| GleanerError::Storage(format!("invalid id '{s}': {e}")))
}

fn row_to_source(row: &libsql::Row) -> Result<Source> {
    let url: String = row.get(2).map_err(db_err)?;
    let source_type: String = row.get(3).map_err(db_err)?;
    let politeness: PolitenessPolicy = from_json(&row.get::<String>(6).map_err(db_err)?)?;
    let follow: Option<FollowOverride> = row
        .get::<String>(7)
        .ok()
        .map(|s| from_json(&s))
        .transpose()?;

    Ok(Source {
        id: parse_id(&row.get::<String>(0).map_err(db_err)?)?,
        name: row.get(1).map_err(db_err)?,
        url: url::Url::parse(&url)
            .map_err(|e| GleanerError::Storage(format!("invalid source url '{url}': {e}")))?,
        source_type: SourceType::from_str(&source_type)?,
        schedule: row.get(4).map_err(db_err)?,
        is_active: row.get::<i64>(5).map_err(db_err)? != 0,
        politeness,
        follow,
        deactivated_reason: row.get::<String>(8).ok(),
        created_at: parse_ts(&row.get::<String>(9).map_err(db_err)?)?,
    })
}

fn row_to_artifact(row: &libsql::Row) -> Result<Artifact> {
    let state: String = row.get(6).map_err(db_err)?;
    Ok(Artifact {
        id: parse_id(&row.get::<String>(0).map_err(db_err)?)?,
        source_id: row
            .get::<String>(1)
            .ok()
            .map(|s| parse_id(&s))
            .transpose()?,
        uri: row.get(2).map_err(db_err)?,
        content_hash: ContentHash::parse(&row.get::<String>(3).map_err(db_err)?)?,
        mime_type: row.get(4).map_err(db_err)?,
        content_len: row.get::<i64>(5).map_err(db_err)? as u64,
        state: ArtifactState::from_str(&state)?,
        failure_reason: row.get::<String>(7).ok(),
        fetched_at: parse_ts(&row.get::<String>(8).map_err(db_err)?)?,
    })
}

fn row_to_normalized(row: &libsql::Row) -> Result<NormalizedDocument> {
    let published_on = row
        .get::<String>(10)
        .ok()
        .map(|s| {
            NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                .map_err(|e| GleanerError::Storage(format!("invalid published_on '{s}': {e}")))
        })
        .transpose()?;

    Ok(NormalizedDocument {
        id: row.get(0).map_err(db_err)?,
        artifact_id: parse_id(&row.get::<String>(1).map_err(db_err)?)?,
        version: row.get::<u32>(2).map_err(db_err)?,
        text: row.get(3).map_err(db_err)?,
        text_hash: ContentHash::parse(&row.get::<String>(4).map_err(db_err)?)?,
        word_count: row.get::<i64>(5).map_err(db_err)? as usize,
        extractor: row.get(6).map_err(db_err)?,
        metadata: DocumentMetadata {
            title: row.get::<String>(7).ok(),
            authors: from_json(&row.get::<String>(8).map_err(db_err)?)?,
            organization: row.get::<String>(9).ok(),
            published_on,
        },
        created_at: parse_ts(&row.get::<String>(11).map_err(db_err)?)?,
    })
}

fn row_to_rubric(row: &libsql::Row) -> Result<Rubric> {
    Ok(Rubric {
        id: row.get(0).map_err(db_err)?,
        name: row.get(1).map_err(db_err)?,
        version: row.get::<u32>(2).map_err(db_err)?,
        criteria: from_json(&row.get::<String>(3).map_err(db_err)?)?,
        published_at: parse_ts(&row.get::<String>(4).map_err(db_err)?)?,
    })
}

fn row_to_evaluation(row: &libsql::Row) -> Result<Evaluation> {
    Ok(Evaluation {
        id: row.get(0).map_err(db_err)?,
        artifact_id: parse_id(&row.get::<String>(1).map_err(db_err)?)?,
        normalized_id: row.get(2).map_err(db_err)?,
        document_hash: ContentHash::parse(&row.get::<String>(3).map_err(db_err)?)?,
        rubric_id: row.get(4).map_err(db_err)?,
        rubric_name: row.get(5).map_err(db_err)?,
        rubric_version: row.get::<u32>(6).map_err(db_err)?,
        label: row.get(7).map_err(db_err)?,
        score: row.get::<f64>(8).map_err(db_err)?,
        is_current: row.get::<i64>(9).map_err(db_err)? != 0,
        created_at: parse_ts(&row.get::<String>(10).map_err(db_err)?)?,
    })
}

fn row_to_crawl_run(row: &libsql::Row) -> Result<CrawlRun> {
    let status: String = row.get(4).map_err(db_err)?;
    Ok(CrawlRun {
        id: row.get(0).map_err(db_err)?,
        source_id: parse_id(&row.get::<String>(1).map_err(db_err)?)?,
        started_at: parse_ts(&row.get::<String>(2).map_err(db_err)?)?,
        finished_at: row
            .get::<String>(3)
            .ok()
            .map(|s| parse_ts(&s))
            .transpose()?,
        status: CrawlRunStatus::from_str(&status)?,
        stats: row
            .get::<String>(5)
            .ok()
            .map(|s| from_json(&s))
            .transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("gleaner_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn test_source(name: &str) -> Source {
        Source::new(name, "https://example.org/feed", SourceType::Feed, "0 */4 * * *")
            .expect("valid source")
    }

    fn normalized(text: &str) -> NewNormalized {
        NewNormalized {
            text: text.into(),
            text_hash: ContentHash::compute(text.as_bytes()),
            word_count: text.split_whitespace().count(),
            extractor: "plain_text".into(),
            metadata: DocumentMetadata {
                title: Some("Title".into()),
                authors: vec!["Ada Lovelace".into(), "Charles Babbage".into()],
                organization: None,
                published_on: NaiveDate::from_ymd_opt(2024, 3, 1),
            },
        }
    }

    async fn fetched_artifact(storage: &Storage, bytes: &[u8]) -> Artifact {
        let hash = ContentHash::compute(bytes);
        let (artifact, _) = storage
            .record_fetch(None, "https://example.org/a", &hash, "text/plain", bytes.len() as u64)
            .await
            .expect("record fetch");
        artifact
    }

    fn evaluation_for(artifact: &Artifact, doc: &NormalizedDocument, rubric: &Rubric, label: &str) -> Evaluation {
        Evaluation {
            id: Uuid::now_v7().to_string(),
            artifact_id: artifact.id,
            normalized_id: doc.id.clone(),
            document_hash: doc.text_hash.clone(),
            rubric_id: rubric.id.clone(),
            rubric_name: rubric.name.clone(),
            rubric_version: rubric.version,
            label: label.into(),
            score: 0.5,
            is_current: true,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        assert_eq!(storage.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("gleaner_test_{}.db", Uuid::now_v7()));
        let s1 = Storage::open(&tmp).await.expect("first open");
        drop(s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn source_crud() {
        let storage = test_storage().await;
        let source = test_source("example");
        storage.insert_source(&source).await.expect("insert source");

        let found = storage.get_source(&source.id).await.unwrap().unwrap();
        assert_eq!(found.name, "example");
        assert_eq!(found.source_type, SourceType::Feed);
        assert_eq!(found.schedule, "0 */4 * * *");
        assert!(found.is_active);

        // Names are unique
        let dup = test_source("example");
        assert!(storage.insert_source(&dup).await.is_err());

        assert!(
            storage
                .set_source_active(&source.id, false, Some("5 consecutive failures"))
                .await
                .unwrap()
        );
        let found = storage.find_source("example").await.unwrap().unwrap();
        assert!(!found.is_active);
        assert_eq!(
            found.deactivated_reason.as_deref(),
            Some("5 consecutive failures")
        );
        assert!(storage.list_active_sources().await.unwrap().is_empty());
        assert_eq!(storage.list_sources().await.unwrap().len(), 1);

        storage
            .set_source_active(&source.id, true, None)
            .await
            .unwrap();
        let found = storage.find_source(&source.id.to_string()).await.unwrap().unwrap();
        assert!(found.is_active);
        assert!(found.deactivated_reason.is_none());
    }

    #[tokio::test]
    async fn sync_source_keeps_identity() {
        let storage = test_storage().await;
        let original = test_source("docs");
        let (_, created) = storage.sync_source(&original).await.unwrap();
        assert!(created);

        let mut changed = test_source("docs");
        changed.schedule = "@daily".into();
        changed.politeness.max_depth = 3;
        let (synced, created) = storage.sync_source(&changed).await.unwrap();
        assert!(!created);
        assert_eq!(synced.id, original.id);

        let stored = storage.get_source(&original.id).await.unwrap().unwrap();
        assert_eq!(stored.schedule, "@daily");
        assert_eq!(stored.politeness.max_depth, 3);
    }

    #[tokio::test]
    async fn record_fetch_dedups_by_hash() {
        let storage = test_storage().await;
        let source = test_source("s");
        storage.insert_source(&source).await.unwrap();
        let hash = ContentHash::compute(b"<html>same</html>");

        let (a1, d1) = storage
            .record_fetch(Some(&source.id), "https://example.org/u1", &hash, "text/html", 17)
            .await
            .unwrap();
        assert_eq!(d1, FetchDisposition::New);
        assert_eq!(a1.state, ArtifactState::Fetched);

        // Same URI, same bytes: nothing new.
        let (a2, d2) = storage
            .record_fetch(Some(&source.id), "https://example.org/u1", &hash, "text/html", 17)
            .await
            .unwrap();
        assert_eq!(d2, FetchDisposition::Seen);
        assert_eq!(a2.id, a1.id);
        assert_eq!(storage.list_uris(&a1.id).await.unwrap().len(), 1);

        // Different URI, same bytes: alias only.
        let (a3, d3) = storage
            .record_fetch(Some(&source.id), "https://example.org/u2", &hash, "text/html", 17)
            .await
            .unwrap();
        assert_eq!(d3, FetchDisposition::Alias);
        assert_eq!(a3.id, a1.id);
        assert_eq!(a3.uri, "https://example.org/u1");

        let uris = storage.list_uris(&a1.id).await.unwrap();
        assert_eq!(uris.len(), 2);
        assert_eq!(storage.list_artifacts(None, 100).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn conditional_transitions() {
        let storage = test_storage().await;
        let artifact = fetched_artifact(&storage, b"text").await;

        let moved = storage
            .transition_artifact(
                &artifact.id,
                ArtifactState::Fetched,
                ArtifactState::Failed,
                Some("unsupported MIME type"),
                false,
            )
            .await
            .unwrap();
        assert!(moved);

        // Stale `from` state: no row changes.
        let moved = storage
            .transition_artifact(
                &artifact.id,
                ArtifactState::Fetched,
                ArtifactState::Normalized,
                None,
                false,
            )
            .await
            .unwrap();
        assert!(!moved);

        // failed is terminal without re-normalization
        let err = storage
            .transition_artifact(
                &artifact.id,
                ArtifactState::Failed,
                ArtifactState::Normalized,
                None,
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GleanerError::Validation { .. }));

        let stored = storage.get_artifact(&artifact.id).await.unwrap().unwrap();
        assert_eq!(stored.state, ArtifactState::Failed);
        assert_eq!(stored.failure_reason.as_deref(), Some("unsupported MIME type"));
        assert_eq!(
            storage
                .list_artifacts(Some(ArtifactState::Failed), 10)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn normalization_versions_append() {
        let storage = test_storage().await;
        let artifact = fetched_artifact(&storage, b"hello world").await;

        let v1 = storage
            .record_normalization(&artifact.id, ArtifactState::Fetched, normalized("hello world"), false)
            .await
            .unwrap();
        assert_eq!(v1.version, 1);

        // Second plain normalization is rejected: the artifact is no longer fetched.
        assert!(
            storage
                .record_normalization(&artifact.id, ArtifactState::Fetched, normalized("x"), false)
                .await
                .is_err()
        );

        let v2 = storage
            .record_normalization(
                &artifact.id,
                ArtifactState::Normalized,
                normalized("hello again"),
                true,
            )
            .await
            .unwrap();
        assert_eq!(v2.version, 2);

        let latest = storage.latest_normalized(&artifact.id).await.unwrap().unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(latest.metadata.authors, vec!["Ada Lovelace", "Charles Babbage"]);
        assert_eq!(latest.metadata.published_on, NaiveDate::from_ymd_opt(2024, 3, 1));

        let versions = storage.list_normalized_versions(&artifact.id).await.unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].text, "hello world");
    }

    #[tokio::test]
    async fn rubric_versions_increase() {
        let storage = test_storage().await;
        let criteria = serde_json::json!({"keywords": {"rust": 1.0}});

        let r1 = storage.publish_rubric("relevance", &criteria).await.unwrap();
        let r2 = storage.publish_rubric("relevance", &criteria).await.unwrap();
        let other = storage.publish_rubric("quality", &criteria).await.unwrap();
        assert_eq!(r1.version, 1);
        assert_eq!(r2.version, 2);
        assert_eq!(other.version, 1);

        assert_eq!(storage.latest_rubric("relevance").await.unwrap().unwrap().id, r2.id);
        assert_eq!(storage.get_rubric("relevance", 1).await.unwrap().unwrap().id, r1.id);
        assert!(storage.get_rubric("relevance", 9).await.unwrap().is_none());
        assert_eq!(storage.list_rubrics().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn evaluations_keep_one_current() {
        let storage = test_storage().await;
        let artifact = fetched_artifact(&storage, b"some text").await;
        let doc = storage
            .record_normalization(&artifact.id, ArtifactState::Fetched, normalized("some text"), false)
            .await
            .unwrap();
        let rubric = storage
            .publish_rubric("relevance", &serde_json::json!({}))
            .await
            .unwrap();

        let first = evaluation_for(&artifact, &doc, &rubric, "low");
        storage.append_evaluation(&first).await.unwrap();
        let second = evaluation_for(&artifact, &doc, &rubric, "high");
        storage.append_evaluation(&second).await.unwrap();

        let current = storage
            .current_evaluation(&artifact.id, &rubric.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.id, second.id);

        let all = storage
            .query_evaluations(
                &EvaluationFilter {
                    artifact_id: Some(artifact.id),
                    include_superseded: true,
                    ..Default::default()
                },
                0,
                10,
            )
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all.iter().filter(|e| e.is_current).count(), 1);

        let high = storage
            .query_evaluations(
                &EvaluationFilter {
                    label: Some("high".into()),
                    rubric_version: Some(1),
                    ..Default::default()
                },
                0,
                10,
            )
            .await
            .unwrap();
        assert_eq!(high.len(), 1);

        let page = storage
            .query_evaluations(
                &EvaluationFilter {
                    include_superseded: true,
                    ..Default::default()
                },
                1,
                10,
            )
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
    }

    #[tokio::test]
    async fn crawl_run_lifecycle() {
        let storage = test_storage().await;
        let source = test_source("runs");
        storage.insert_source(&source).await.unwrap();

        let run_id = storage
            .insert_crawl_run(&source.id, Utc::now())
            .await
            .expect("insert crawl run");
        assert!(storage.last_finished_run(&source.id).await.unwrap().is_none());

        storage
            .finish_crawl_run(&run_id, CrawlRunStatus::CompletedWithErrors, &serde_json::json!({"failed": 1}))
            .await
            .expect("finish crawl run");

        let run = storage.last_finished_run(&source.id).await.unwrap().unwrap();
        assert_eq!(run.id, run_id);
        assert_eq!(run.status, CrawlRunStatus::CompletedWithErrors);
        assert!(run.finished_at.is_some());
        assert_eq!(storage.list_crawl_runs(&source.id, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn artifact_lock_serializes() {
        let storage = Arc::new(test_storage().await);
        let id = ArtifactId::new();

        let guard = storage.lock_artifact(&id).await;
        let s2 = storage.clone();
        let id2 = id.clone();
        let waiter = tokio::spawn(async move {
            let _g = s2.lock_artifact(&id2).await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("gleaner_test_{}.db", Uuid::now_v7()));
        let rw = Storage::open(&tmp).await.unwrap();
        rw.insert_source(&test_source("one")).await.unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        assert_eq!(ro.list_sources().await.unwrap().len(), 1);
        let result = ro.insert_source(&test_source("two")).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }
}
