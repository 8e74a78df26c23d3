//! Durable progress store seam.
//!
//! The orchestrator only needs per-document atomic writes: a run document
//! keyed by pipeline id and a stage document per (pipeline id, stage).
//! Any KV/document store can sit behind [`ProgressStore`]; the in-memory
//! implementation serves tests and embedded use.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::pipeline::{stage_document_id, PipelineRun, Stage, StageDocument};

/// Durable key-value document store for pipeline progress.
///
/// Writes replace the whole document under a single key, so observers never
/// see partial-field updates.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn get_run(&self, pipeline_id: &str) -> Result<Option<PipelineRun>>;
    async fn put_run(&self, run: &PipelineRun) -> Result<()>;
    async fn get_stage(&self, pipeline_id: &str, stage: Stage) -> Result<Option<StageDocument>>;
    async fn put_stage(&self, document: &StageDocument) -> Result<()>;
}

/// In-memory store with whole-document replacement under a write lock.
#[derive(Default)]
pub struct MemoryStore {
    runs: RwLock<HashMap<String, PipelineRun>>,
    stages: RwLock<HashMap<String, StageDocument>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProgressStore for MemoryStore {
    async fn get_run(&self, pipeline_id: &str) -> Result<Option<PipelineRun>> {
        Ok(self.runs.read().await.get(pipeline_id).cloned())
    }

    async fn put_run(&self, run: &PipelineRun) -> Result<()> {
        self.runs
            .write()
            .await
            .insert(run.pipeline_id.clone(), run.clone());
        Ok(())
    }

    async fn get_stage(&self, pipeline_id: &str, stage: Stage) -> Result<Option<StageDocument>> {
        let key = stage_document_id(pipeline_id, stage);
        Ok(self.stages.read().await.get(&key).cloned())
    }

    async fn put_stage(&self, document: &StageDocument) -> Result<()> {
        let key = stage_document_id(&document.pipeline_id, document.stage);
        self.stages.write().await.insert(key, document.clone());
        Ok(())
    }
}
