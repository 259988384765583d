//! SQL migration definitions for the Gleaner database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: sources, artifacts, artifact_uris, normalized_documents, rubrics, evaluations",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Configured origins; soft-deactivated, never deleted
CREATE TABLE IF NOT EXISTS sources (
    id                 TEXT PRIMARY KEY,
    name               TEXT NOT NULL UNIQUE,
    url                TEXT NOT NULL,
    source_type        TEXT NOT NULL CHECK (source_type IN ('feed', 'site', 'api')),
    schedule           TEXT NOT NULL,
    is_active          INTEGER NOT NULL DEFAULT 1,
    politeness_json    TEXT NOT NULL,
    follow_json        TEXT,
    deactivated_reason TEXT,
    created_at         TEXT NOT NULL,
    updated_at         TEXT NOT NULL
);

-- One row per distinct byte content
CREATE TABLE IF NOT EXISTS artifacts (
    id             TEXT PRIMARY KEY,
    source_id      TEXT,
    uri            TEXT NOT NULL,
    content_hash   TEXT NOT NULL UNIQUE,
    mime_type      TEXT NOT NULL,
    content_len    INTEGER NOT NULL,
    state          TEXT NOT NULL DEFAULT 'fetched'
                   CHECK (state IN ('fetched', 'normalized', 'failed')),
    failure_reason TEXT,
    fetched_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_artifacts_state ON artifacts(state);
CREATE INDEX IF NOT EXISTS idx_artifacts_source_id ON artifacts(source_id);

-- Every URI an artifact's bytes were observed at (canonical URI included)
CREATE TABLE IF NOT EXISTS artifact_uris (
    artifact_id   TEXT NOT NULL REFERENCES artifacts(id),
    uri           TEXT NOT NULL,
    source_id     TEXT,
    first_seen_at TEXT NOT NULL,
    last_seen_at  TEXT NOT NULL,
    PRIMARY KEY (artifact_id, uri)
);

CREATE INDEX IF NOT EXISTS idx_artifact_uris_uri ON artifact_uris(uri);

-- Versioned extraction output
CREATE TABLE IF NOT EXISTS normalized_documents (
    id           TEXT PRIMARY KEY,
    artifact_id  TEXT NOT NULL REFERENCES artifacts(id),
    version      INTEGER NOT NULL,
    text         TEXT NOT NULL,
    text_hash    TEXT NOT NULL,
    word_count   INTEGER NOT NULL,
    extractor    TEXT NOT NULL,
    title        TEXT,
    authors_json TEXT NOT NULL DEFAULT '[]',
    organization TEXT,
    published_on TEXT,
    created_at   TEXT NOT NULL,
    UNIQUE (artifact_id, version)
);

-- Immutable, versioned evaluation policies
CREATE TABLE IF NOT EXISTS rubrics (
    id            TEXT PRIMARY KEY,
    name          TEXT NOT NULL,
    version       INTEGER NOT NULL,
    criteria_json TEXT NOT NULL,
    published_at  TEXT NOT NULL,
    UNIQUE (name, version)
);

-- Append-only evaluation records
CREATE TABLE IF NOT EXISTS evaluations (
    id             TEXT PRIMARY KEY,
    artifact_id    TEXT NOT NULL REFERENCES artifacts(id),
    normalized_id  TEXT NOT NULL REFERENCES normalized_documents(id),
    document_hash  TEXT NOT NULL,
    rubric_id      TEXT NOT NULL REFERENCES rubrics(id),
    rubric_name    TEXT NOT NULL,
    rubric_version INTEGER NOT NULL,
    label          TEXT NOT NULL,
    score          REAL NOT NULL CHECK (score >= 0.0 AND score <= 1.0),
    is_current     INTEGER NOT NULL DEFAULT 1,
    created_at     TEXT NOT NULL
);

-- At most one current evaluation per (artifact, rubric version)
CREATE UNIQUE INDEX IF NOT EXISTS idx_evaluations_current
    ON evaluations(artifact_id, rubric_id) WHERE is_current = 1;
CREATE INDEX IF NOT EXISTS idx_evaluations_label ON evaluations(label);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Crawl run history",
            sql: r#"
CREATE TABLE IF NOT EXISTS crawl_runs (
    id          TEXT PRIMARY KEY,
    source_id   TEXT NOT NULL REFERENCES sources(id),
    started_at  TEXT NOT NULL,
    finished_at TEXT,
    status      TEXT NOT NULL DEFAULT 'running',
    stats_json  TEXT
);

CREATE INDEX IF NOT EXISTS idx_crawl_runs_source ON crawl_runs(source_id, started_at);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
