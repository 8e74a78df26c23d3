//! Write-through progress tracking for pipeline runs.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::store::ProgressStore;

use super::types::{
    normalize_completed_stages, sanitize_debug, PipelineRun, RunStatus, Stage, StageDocument,
};

/// Maintains the durable run record across stage transitions.
///
/// Every mutation is persisted before it returns (write-through), so an
/// external observer polling the store never misses a stage boundary.
/// Listeners on the notify channel additionally receive each updated run.
#[derive(Clone)]
pub struct ProgressTracker {
    store: Arc<dyn ProgressStore>,
    notify_tx: mpsc::Sender<PipelineRun>,
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn ProgressStore>) -> (Self, mpsc::Receiver<PipelineRun>) {
        let (notify_tx, notify_rx) = mpsc::channel(256);
        (Self { store, notify_tx }, notify_rx)
    }

    /// Create and persist a new running run. A missing `pipeline_id` gets a
    /// generated one.
    pub async fn start_run(
        &self,
        pipeline_id: Option<String>,
        owner_id: &str,
    ) -> Result<PipelineRun, PipelineError> {
        let pipeline_id = pipeline_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let run = PipelineRun::new(pipeline_id, owner_id.to_string());
        self.persist(&run).await?;
        tracing::info!(pipeline = %run.pipeline_id, owner = %run.owner_id, "Pipeline run started");
        Ok(run)
    }

    /// Mark a stage as the currently executing one.
    pub async fn begin_stage(
        &self,
        pipeline_id: &str,
        stage: Stage,
    ) -> Result<PipelineRun, PipelineError> {
        let mut run = self.load_running(pipeline_id).await?;
        run.current_stage = Some(stage);
        run.updated_at = Utc::now();
        self.persist(&run).await?;
        tracing::debug!(pipeline = %pipeline_id, stage = %stage, "Stage started");
        Ok(run)
    }

    /// Record a finished stage: append it to the completed set, advance
    /// `current_stage`, and bump progress to the stage's weight.
    pub async fn stage_completed(
        &self,
        pipeline_id: &str,
        stage: Stage,
    ) -> Result<PipelineRun, PipelineError> {
        let mut run = self.load_running(pipeline_id).await?;
        run.completed_stages = normalize_completed_stages(&run.completed_stages, Some(stage));
        run.current_stage = stage.next();
        run.overall_progress = run.overall_progress.max(stage.weight());
        run.updated_at = Utc::now();
        self.persist(&run).await?;
        tracing::info!(
            pipeline = %pipeline_id,
            stage = %stage,
            progress = run.overall_progress,
            "Stage completed"
        );
        Ok(run)
    }

    /// Terminal success. Progress jumps to 100 even when later stages were
    /// skipped via early-stop, so observers need not distinguish the two.
    pub async fn complete_run(&self, pipeline_id: &str) -> Result<PipelineRun, PipelineError> {
        let mut run = self.load_running(pipeline_id).await?;
        run.status = RunStatus::Completed;
        run.current_stage = None;
        run.overall_progress = 100;
        run.updated_at = Utc::now();
        self.persist(&run).await?;
        tracing::info!(pipeline = %pipeline_id, "Pipeline run completed");
        Ok(run)
    }

    /// Terminal failure: record the message and freeze progress at its last
    /// value. `current_stage` is left pointing at the stage that failed.
    pub async fn fail_run(
        &self,
        pipeline_id: &str,
        message: &str,
    ) -> Result<PipelineRun, PipelineError> {
        let mut run = self.load_running(pipeline_id).await?;
        run.status = RunStatus::Error;
        run.error_message = Some(message.to_string());
        run.updated_at = Utc::now();
        self.persist(&run).await?;
        tracing::warn!(pipeline = %pipeline_id, error = message, "Pipeline run failed");
        Ok(run)
    }

    /// Persist a stage's output document, sanitizing its debug bag first.
    pub async fn record_stage(&self, mut document: StageDocument) -> Result<(), PipelineError> {
        document.debug = sanitize_debug(&document.debug);
        document.updated_at = Utc::now();
        self.store
            .put_stage(&document)
            .await
            .map_err(PipelineError::Store)?;
        tracing::info!(
            pipeline = %document.pipeline_id,
            stage = %document.stage,
            records = document.records.len(),
            status = ?document.status,
            "Stage document saved"
        );
        Ok(())
    }

    /// Persist an error stage document and flip the run to `Error` in one
    /// operation. The document write is best-effort; the status flip is not.
    pub async fn record_stage_failure(
        &self,
        pipeline_id: &str,
        stage: Stage,
        message: &str,
    ) -> Result<PipelineRun, PipelineError> {
        if let Err(e) = self
            .record_stage(StageDocument::error(pipeline_id, stage, message))
            .await
        {
            tracing::warn!(
                pipeline = %pipeline_id,
                stage = %stage,
                error = %e,
                "Failed to persist stage failure document"
            );
        }
        self.fail_run(pipeline_id, message).await
    }

    /// Fetch the current run record.
    pub async fn get(&self, pipeline_id: &str) -> Result<Option<PipelineRun>, PipelineError> {
        self.store
            .get_run(pipeline_id)
            .await
            .map_err(PipelineError::Store)
    }

    async fn load_running(&self, pipeline_id: &str) -> Result<PipelineRun, PipelineError> {
        let run = self
            .store
            .get_run(pipeline_id)
            .await
            .map_err(PipelineError::Store)?
            .ok_or_else(|| PipelineError::RunNotFound(pipeline_id.to_string()))?;
        if run.is_terminal() {
            return Err(PipelineError::RunFinished(pipeline_id.to_string()));
        }
        Ok(run)
    }

    async fn persist(&self, run: &PipelineRun) -> Result<(), PipelineError> {
        self.store.put_run(run).await.map_err(PipelineError::Store)?;
        let _ = self.notify_tx.try_send(run.clone());
        Ok(())
    }
}
