//! Error types for the collection and pipeline layers.

use thiserror::Error;

use crate::pipeline::Stage;

/// Errors from the batch collection sub-stage.
///
/// Per-batch problems (a submission rejected, a snapshot the service marks
/// failed, a download that cannot be parsed) are isolated and surfaced
/// through counters and logs; only the variants here abort a run.
#[derive(Debug, Error)]
pub enum CollectError {
    /// No input URL survived canonicalization and platform detection.
    #[error("no work items with a recognized platform")]
    NoWorkItems,

    /// The planner was handed an empty work-item list.
    #[error("no batches to submit")]
    NoBatches,

    /// Every submission was rejected, so there is nothing to poll.
    #[error("all {0} batch submissions failed")]
    AllSubmissionsFailed(usize),

    /// The collection service returned a payload no shape matcher accepts.
    #[error("unexpected collection service response: {0}")]
    UnexpectedResponse(String),
}

/// Errors from the three-stage pipeline orchestrator.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Collect(#[from] CollectError),

    /// A stage collaborator reported an unrecoverable error. The run is
    /// marked errored and progress is frozen before this is returned.
    #[error("{stage} stage failed: {message}")]
    Stage { stage: Stage, message: String },

    #[error("progress store error: {0}")]
    Store(anyhow::Error),

    #[error("pipeline {0} not found")]
    RunNotFound(String),

    /// The run already reached a terminal status and is immutable.
    #[error("pipeline {0} is no longer running")]
    RunFinished(String),
}
