//! Three-stage discovery pipeline: SEARCH → ENRICH → SCORE.
//!
//! The orchestrator owns the happy path and the progress record; the search
//! and scoring stages are external collaborators behind traits, and the
//! enrichment stage is the batch collector. Transitions are strictly
//! forward, with optional early termination after any stage.

mod progress;
mod types;

pub use progress::ProgressTracker;
pub use types::{
    normalize_completed_stages, sanitize_debug, stage_document_id, PipelineRun, RunStatus, Stage,
    StageDocument, StageStatus,
};

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::collect::{BatchCollector, BatchProcessingConfig, RawRecord};
use crate::error::PipelineError;

/// Query parameters handed to the search stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub limit: usize,
    /// Cap applied to search output before enrichment, if set.
    pub max_profiles: Option<usize>,
}

/// Candidate discovery: returns profile records carrying at least a
/// `url` or `profile_url` field.
#[async_trait]
pub trait SearchStage: Send + Sync {
    async fn run(&self, request: &SearchRequest) -> anyhow::Result<Vec<RawRecord>>;
}

/// LLM-based fit scoring over enriched profiles.
#[async_trait]
pub trait ScoreStage: Send + Sync {
    async fn run(
        &self,
        request: &SearchRequest,
        records: Vec<RawRecord>,
    ) -> anyhow::Result<Vec<RawRecord>>;
}

/// Per-run options for the orchestrator.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Caller-supplied id; generated when absent.
    pub pipeline_id: Option<String>,
    pub owner_id: String,
    /// Stop (successfully) after this stage instead of running all three.
    pub stop_after: Option<Stage>,
    pub batch: BatchProcessingConfig,
}

impl PipelineOptions {
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            pipeline_id: None,
            owner_id: owner_id.into(),
            stop_after: None,
            batch: BatchProcessingConfig::default(),
        }
    }
}

/// Result of a pipeline run: the final run record plus the last stage's
/// output records.
#[derive(Debug)]
pub struct PipelineOutcome {
    pub run: PipelineRun,
    pub records: Vec<RawRecord>,
}

/// Drives the three stages and the durable progress record.
pub struct PipelineOrchestrator {
    search: Arc<dyn SearchStage>,
    score: Arc<dyn ScoreStage>,
    collector: BatchCollector,
    tracker: ProgressTracker,
}

impl PipelineOrchestrator {
    pub fn new(
        search: Arc<dyn SearchStage>,
        score: Arc<dyn ScoreStage>,
        collector: BatchCollector,
        tracker: ProgressTracker,
    ) -> Self {
        Self {
            search,
            score,
            collector,
            tracker,
        }
    }

    /// Run the pipeline end to end (or up to `stop_after`).
    ///
    /// Each stage's output document and the updated run record are persisted
    /// before the next stage starts. A stage-fatal error marks the run
    /// errored, freezes progress, and leaves prior stage documents readable.
    pub async fn run(
        &self,
        request: SearchRequest,
        options: PipelineOptions,
    ) -> Result<PipelineOutcome, PipelineError> {
        let run = self
            .tracker
            .start_run(options.pipeline_id.clone(), &options.owner_id)
            .await?;
        let pipeline_id = run.pipeline_id.clone();

        // SEARCH
        self.tracker.begin_stage(&pipeline_id, Stage::Search).await?;
        let mut candidates = match self.search.run(&request).await {
            Ok(records) => records,
            Err(e) => return self.stage_failed(&pipeline_id, Stage::Search, e).await,
        };
        if let Some(cap) = request.max_profiles {
            candidates.truncate(cap.max(1));
        }
        self.tracker
            .record_stage(StageDocument::completed(
                &pipeline_id,
                Stage::Search,
                candidates.clone(),
                json!({"count": candidates.len(), "query": request.query}),
            ))
            .await?;
        self.tracker
            .stage_completed(&pipeline_id, Stage::Search)
            .await?;
        if options.stop_after == Some(Stage::Search) {
            let run = self.tracker.complete_run(&pipeline_id).await?;
            return Ok(PipelineOutcome {
                run,
                records: candidates,
            });
        }

        // ENRICH
        self.tracker.begin_stage(&pipeline_id, Stage::Enrich).await?;
        let urls = extract_profile_urls(&candidates);
        let result = match self.collector.process(&urls, &options.batch).await {
            Ok(result) => result,
            Err(e) => {
                return self
                    .stage_failed(&pipeline_id, Stage::Enrich, e.into())
                    .await
            }
        };
        let survivors: Vec<RawRecord> = result
            .records
            .iter()
            .filter(|record| is_enrichment_success(record))
            .cloned()
            .collect();
        tracing::debug!(
            pipeline = %pipeline_id,
            survivors = survivors.len(),
            dropped = result.records.len() - survivors.len(),
            "Enrichment output classified"
        );
        self.tracker
            .record_stage(StageDocument::completed(
                &pipeline_id,
                Stage::Enrich,
                result.records.clone(),
                json!({
                    "total_batches": result.total_batches,
                    "successful_batches": result.successful_batches,
                    "failed_batches": result.failed_batches,
                    "survivors": survivors.len(),
                }),
            ))
            .await?;
        self.tracker
            .stage_completed(&pipeline_id, Stage::Enrich)
            .await?;
        if options.stop_after == Some(Stage::Enrich) {
            let run = self.tracker.complete_run(&pipeline_id).await?;
            return Ok(PipelineOutcome {
                run,
                records: result.records,
            });
        }

        // SCORE. When every enrichment failed, fall back to scoring the
        // unfiltered output rather than scoring nothing.
        let score_inputs = if survivors.is_empty() {
            result.records
        } else {
            survivors
        };
        self.tracker.begin_stage(&pipeline_id, Stage::Score).await?;
        let scored = match self.score.run(&request, score_inputs).await {
            Ok(records) => records,
            Err(e) => return self.stage_failed(&pipeline_id, Stage::Score, e).await,
        };
        self.tracker
            .record_stage(StageDocument::completed(
                &pipeline_id,
                Stage::Score,
                scored.clone(),
                json!({"count": scored.len()}),
            ))
            .await?;
        self.tracker
            .stage_completed(&pipeline_id, Stage::Score)
            .await?;
        let run = self.tracker.complete_run(&pipeline_id).await?;
        Ok(PipelineOutcome {
            run,
            records: scored,
        })
    }

    async fn stage_failed(
        &self,
        pipeline_id: &str,
        stage: Stage,
        error: anyhow::Error,
    ) -> Result<PipelineOutcome, PipelineError> {
        tracing::error!(pipeline = %pipeline_id, stage = %stage, error = %error, "Stage failed");
        let message = error.to_string();
        self.tracker
            .record_stage_failure(pipeline_id, stage, &message)
            .await?;
        Err(PipelineError::Stage { stage, message })
    }
}

/// Pull submittable profile URLs out of search records.
fn extract_profile_urls(records: &[RawRecord]) -> Vec<String> {
    records
        .iter()
        .filter_map(|record| {
            record
                .get("profile_url")
                .or_else(|| record.get("url"))
                .and_then(Value::as_str)
        })
        .map(str::to_string)
        .collect()
}

/// A collected record counts as a successful enrichment unless the service
/// attached a non-empty warning or error marker to it.
pub fn is_enrichment_success(record: &RawRecord) -> bool {
    for key in ["warning", "warning_code", "error", "error_code"] {
        if let Some(value) = record.get(key).and_then(Value::as_str) {
            if !value.trim().is_empty() {
                return false;
            }
        }
    }
    true
}
