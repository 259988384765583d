//! Rubric-based evaluation of normalized documents.
//!
//! Scoring is delegated to an injected [`ScoringPolicy`]. The evaluator owns
//! rubric resolution, range checking, reuse of unchanged results and
//! persistence with provenance.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use gleaner_shared::{
    ArtifactId, Evaluation, GleanerError, NormalizedDocument, Result, Rubric, SCORE_MAX, SCORE_MIN,
};
use gleaner_storage::Storage;

use crate::workers::BlockingPool;

/// Label and score produced by a policy.
#[derive(Debug, Clone, PartialEq)]
pub struct Score {
    pub label: String,
    pub score: f64,
}

/// Scoring function applied to a document under a rubric's criteria.
///
/// Runs on the blocking pool; implementations may be CPU-heavy.
pub trait ScoringPolicy: Send + Sync {
    fn name(&self) -> &str;

    /// Check criteria before they are published as a rubric.
    fn validate(&self, _criteria: &serde_json::Value) -> Result<()> {
        Ok(())
    }

    fn score(&self, document: &NormalizedDocument, rubric: &Rubric) -> Result<Score>;
}

// ---- KeywordPolicy ----

#[derive(Debug, Deserialize)]
struct KeywordCriteria {
    keywords: BTreeMap<String, f64>,
    #[serde(default)]
    labels: Vec<LabelThreshold>,
    #[serde(default = "default_label")]
    default_label: String,
}

#[derive(Debug, Deserialize)]
struct LabelThreshold {
    label: String,
    min_score: f64,
}

fn default_label() -> String {
    "unlabeled".to_string()
}

impl KeywordCriteria {
    fn parse(criteria: &serde_json::Value) -> Result<Self> {
        let parsed: Self = serde_json::from_value(criteria.clone())
            .map_err(|e| GleanerError::validation(format!("invalid keyword criteria: {e}")))?;
        if parsed.keywords.is_empty() {
            return Err(GleanerError::validation("keyword criteria need at least one keyword"));
        }
        if let Some((term, _)) = parsed
            .keywords
            .iter()
            .find(|(_, w)| !w.is_finite() || **w < 0.0)
        {
            return Err(GleanerError::validation(format!(
                "keyword '{term}' has a negative or non-finite weight"
            )));
        }
        if parsed.keywords.values().sum::<f64>() <= 0.0 {
            return Err(GleanerError::validation("keyword weights sum to zero"));
        }
        Ok(parsed)
    }
}

/// Weighted keyword matching.
///
/// Criteria: `{"keywords": {term: weight}, "labels": [{"label", "min_score"}],
/// "default_label"}`. The score is the share of total weight whose terms occur
/// in the text (case-insensitive). The label is the one with the highest
/// `min_score` not above the score.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordPolicy;

impl ScoringPolicy for KeywordPolicy {
    fn name(&self) -> &str {
        "keyword"
    }

    fn validate(&self, criteria: &serde_json::Value) -> Result<()> {
        KeywordCriteria::parse(criteria).map(|_| ())
    }

    fn score(&self, document: &NormalizedDocument, rubric: &Rubric) -> Result<Score> {
        let criteria = KeywordCriteria::parse(&rubric.criteria)
            .map_err(|e| GleanerError::Evaluation(e.to_string()))?;
        let text = document.text.to_lowercase();

        let total: f64 = criteria.keywords.values().sum();
        let matched: f64 = criteria
            .keywords
            .iter()
            .filter(|(term, _)| text.contains(&term.to_lowercase()))
            .map(|(_, w)| w)
            .sum();
        let score = (matched / total).clamp(SCORE_MIN, SCORE_MAX);

        let label = criteria
            .labels
            .iter()
            .filter(|t| t.min_score <= score)
            .max_by(|a, b| a.min_score.total_cmp(&b.min_score))
            .map(|t| t.label.clone())
            .unwrap_or(criteria.default_label);

        Ok(Score { label, score })
    }
}

// ---- Evaluator ----

#[derive(Debug, Clone, Copy, Default)]
pub struct EvaluateOptions {
    /// Score again even when the current evaluation used identical text.
    pub force: bool,
}

#[derive(Debug, Clone)]
pub struct EvaluationOutcome {
    pub evaluation: Evaluation,
    /// The existing current evaluation was returned unchanged.
    pub reused: bool,
}

#[derive(Clone)]
pub struct Evaluator {
    storage: Arc<Storage>,
    policy: Arc<dyn ScoringPolicy>,
    pool: BlockingPool,
}

impl Evaluator {
    pub fn new(storage: Arc<Storage>, policy: Arc<dyn ScoringPolicy>, pool: BlockingPool) -> Self {
        Self {
            storage,
            policy,
            pool,
        }
    }

    /// Publish `criteria` as the next version of rubric `name`, after the
    /// policy accepts them.
    pub async fn publish_rubric(&self, name: &str, criteria: &serde_json::Value) -> Result<Rubric> {
        self.policy.validate(criteria)?;
        let rubric = self.storage.publish_rubric(name, criteria).await?;
        info!(rubric = %rubric.name, version = rubric.version, "rubric published");
        Ok(rubric)
    }

    /// Evaluate `document` under `rubric`.
    ///
    /// `document` must be the artifact's latest normalized version; an older
    /// one is rejected so the current evaluation always matches current text.
    #[instrument(skip_all, fields(
        artifact_id = %document.artifact_id,
        rubric = %rubric.name,
        rubric_version = rubric.version,
    ))]
    pub async fn evaluate(
        &self,
        document: &NormalizedDocument,
        rubric: &Rubric,
        options: EvaluateOptions,
    ) -> Result<EvaluationOutcome> {
        let _guard = self.storage.lock_artifact(&document.artifact_id).await;

        let latest = self
            .storage
            .latest_normalized(&document.artifact_id)
            .await?
            .ok_or_else(|| {
                GleanerError::not_found("normalized document", document.artifact_id.to_string())
            })?;
        if latest.id != document.id {
            return Err(GleanerError::validation(format!(
                "normalized version {} of artifact {} is stale, latest is version {}",
                document.version, document.artifact_id, latest.version
            )));
        }

        if !options.force {
            if let Some(current) = self
                .storage
                .current_evaluation(&document.artifact_id, &rubric.id)
                .await?
            {
                if current.document_hash == document.text_hash {
                    debug!(evaluation_id = %current.id, "document unchanged, reusing evaluation");
                    return Ok(EvaluationOutcome {
                        evaluation: current,
                        reused: true,
                    });
                }
            }
        }

        let policy = self.policy.clone();
        let doc = document.clone();
        let rub = rubric.clone();
        let score = self
            .pool
            .run(
                move || policy.score(&doc, &rub),
                |msg| GleanerError::Evaluation(format!("scoring policy panicked: {msg}")),
            )
            .await?;

        if !score.score.is_finite() || !(SCORE_MIN..=SCORE_MAX).contains(&score.score) {
            return Err(GleanerError::Evaluation(format!(
                "policy '{}' returned score {} outside [{SCORE_MIN}, {SCORE_MAX}]",
                self.policy.name(),
                score.score
            )));
        }

        let evaluation = Evaluation {
            id: Uuid::now_v7().to_string(),
            artifact_id: document.artifact_id,
            normalized_id: document.id.clone(),
            document_hash: document.text_hash.clone(),
            rubric_id: rubric.id.clone(),
            rubric_name: rubric.name.clone(),
            rubric_version: rubric.version,
            label: score.label,
            score: score.score,
            is_current: true,
            created_at: Utc::now(),
        };
        self.storage.append_evaluation(&evaluation).await?;

        info!(label = %evaluation.label, score = evaluation.score, "evaluation recorded");
        Ok(EvaluationOutcome {
            evaluation,
            reused: false,
        })
    }

    /// Evaluate the latest normalized version of an artifact. `version` pins
    /// a rubric version; otherwise the latest is used.
    pub async fn evaluate_artifact(
        &self,
        artifact_id: &ArtifactId,
        rubric_name: &str,
        version: Option<u32>,
        options: EvaluateOptions,
    ) -> Result<EvaluationOutcome> {
        let rubric = match version {
            Some(v) => self.storage.get_rubric(rubric_name, v).await?,
            None => self.storage.latest_rubric(rubric_name).await?,
        }
        .ok_or_else(|| {
            let id = match version {
                Some(v) => format!("{rubric_name} v{v}"),
                None => rubric_name.to_string(),
            };
            GleanerError::not_found("rubric", id)
        })?;

        if self.storage.get_artifact(artifact_id).await?.is_none() {
            return Err(GleanerError::not_found("artifact", artifact_id.to_string()));
        }
        let document = self
            .storage
            .latest_normalized(artifact_id)
            .await?
            .ok_or_else(|| GleanerError::not_found("normalized document", artifact_id.to_string()))?;

        self.evaluate(&document, &rubric, options).await
    }
}
