//! Core engine for prospect: creator discovery pipelines over a batched
//! collection service.
//!
//! The crate covers:
//! - batched profile collection against a slow external dataset API
//!   (planning, submission, polling, streaming dispatch) in [`collect`]
//! - the three-stage SEARCH → ENRICH → SCORE pipeline and its durable
//!   progress records in [`pipeline`]
//! - the progress persistence seam in [`store`]
//! - collector configuration in [`config`]

pub mod collect;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod store;

pub use collect::{
    BatchCollector, BatchCompletion, BatchProcessingConfig, BatchProcessingResult, CollectorClient,
    HttpCollectorClient, StreamingSummary,
};
pub use config::CollectorConfig;
pub use error::{CollectError, PipelineError};
pub use pipeline::{
    PipelineOptions, PipelineOrchestrator, PipelineOutcome, PipelineRun, ProgressTracker,
    RunStatus, ScoreStage, SearchRequest, SearchStage, Stage, StageDocument, StageStatus,
};
pub use store::{MemoryStore, ProgressStore};
