//! Batched profile collection against a slow, rate-limited external service.
//!
//! # Flow
//!
//! ```text
//! urls
//!   │  prepare_work_items()     canonicalize + platform tag + dedupe,
//!   ▼                           capped at max_urls
//! plan_batches()                platform-homogeneous, ≤ batch_size each
//!   │
//!   ▼
//! submit_batches()              chunks of max_concurrent_batches,
//!   │                           1s pause between chunks
//!   ▼
//! poll_and_dispatch()           one sweep per polling_interval;
//!   │                           ready → download spawned immediately
//!   ▼
//! BatchCompletion messages      arrival order is NOT batch order
//! ```
//!
//! Batch failures are isolated throughout: a rejected submission, a
//! snapshot the service marks failed, or an unparseable download only ever
//! costs that one batch.

mod client;
mod planner;
mod poll;
mod submit;
mod types;

pub use client::{normalize_records, CollectorClient, HttpCollectorClient};
pub use planner::plan_batches;
pub use submit::SubmissionFailure;
pub use types::{
    canonicalize_url, parse_work_item, prepare_work_items, Batch, BatchCompletion,
    BatchProcessingConfig, BatchProcessingResult, Platform, PollStatus, RawRecord, Snapshot,
    SnapshotProgress, SnapshotState, StreamingSummary, WorkItem,
};

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::CollectError;

use poll::PollStats;

/// Buffer for the blocking variant's internal completion channel.
const COMPLETION_BUFFER: usize = 32;

/// Runs batched collection end to end: plan, submit, poll, dispatch.
///
/// Holds an explicitly constructed [`CollectorClient`]; create one per
/// process and reuse it by reference.
pub struct BatchCollector {
    client: Arc<dyn CollectorClient>,
    cancel: CancellationToken,
}

struct RunOutcome {
    total_batches: usize,
    submission_failures: usize,
    stats: PollStats,
    elapsed: std::time::Duration,
}

impl RunOutcome {
    /// Snapshot-scoped failures: download errors, service-reported
    /// failures, and deadline timeouts.
    fn failed_snapshots(&self) -> usize {
        self.stats.processed_with_error + self.stats.failed + self.stats.timed_out
    }
}

impl BatchCollector {
    pub fn new(client: Arc<dyn CollectorClient>) -> Self {
        Self {
            client,
            cancel: CancellationToken::new(),
        }
    }

    /// Request cooperative shutdown of any in-progress polling phase.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Streaming variant: deliver each batch over `completions` the moment
    /// it is ready and return aggregate counters.
    ///
    /// The sender (and every clone handed to download tasks) is dropped
    /// before this returns, so the receiver's channel closes once the last
    /// batch has been delivered.
    pub async fn process_streaming(
        &self,
        urls: &[String],
        config: &BatchProcessingConfig,
        completions: mpsc::Sender<BatchCompletion>,
    ) -> Result<StreamingSummary, CollectError> {
        let outcome = self.run(urls, config, completions).await?;
        Ok(StreamingSummary {
            total_batches: outcome.total_batches,
            completed_batches: outcome.stats.processed,
            failed_batches: outcome.submission_failures + outcome.failed_snapshots(),
            total_records: outcome.stats.records_delivered,
        })
    }

    /// Blocking variant: collect every batch's records into one result.
    ///
    /// `successful_batches + failed_batches` accounts for every planned
    /// batch, whether its submission was rejected or its snapshot resolved.
    pub async fn process(
        &self,
        urls: &[String],
        config: &BatchProcessingConfig,
    ) -> Result<BatchProcessingResult, CollectError> {
        let (tx, mut rx) = mpsc::channel::<BatchCompletion>(COMPLETION_BUFFER);
        // Drained concurrently with the run so the bounded channel never
        // stalls the dispatcher's download tasks.
        let drain = async {
            let mut records = Vec::new();
            while let Some(completion) = rx.recv().await {
                records.extend(completion.records);
            }
            records
        };

        let (run, records) = tokio::join!(self.run(urls, config, tx), drain);
        let outcome = run?;

        Ok(BatchProcessingResult {
            records,
            total_batches: outcome.total_batches,
            successful_batches: outcome.stats.processed,
            failed_batches: outcome.submission_failures + outcome.failed_snapshots(),
            total_time: outcome.elapsed,
            snapshots: outcome.stats.snapshots,
        })
    }

    async fn run(
        &self,
        urls: &[String],
        config: &BatchProcessingConfig,
        completions: mpsc::Sender<BatchCompletion>,
    ) -> Result<RunOutcome, CollectError> {
        let started = Instant::now();

        let items = prepare_work_items(urls, config.max_urls);
        if items.is_empty() {
            return Err(CollectError::NoWorkItems);
        }
        let batches = plan_batches(items, config.batch_size)?;
        tracing::info!(
            batches = batches.len(),
            batch_size = config.batch_size,
            "Planned collection batches"
        );

        let (snapshots, failures) =
            submit::submit_batches(self.client.clone(), &batches, config.max_concurrent_batches)
                .await;
        if snapshots.is_empty() {
            return Err(CollectError::AllSubmissionsFailed(batches.len()));
        }

        let stats = poll::poll_and_dispatch(
            self.client.clone(),
            snapshots,
            config,
            completions,
            &self.cancel,
        )
        .await;
        tracing::info!(
            batches = batches.len(),
            processed = stats.processed,
            failed = stats.failed,
            timed_out = stats.timed_out,
            records = stats.records_delivered,
            "Collection run finished"
        );

        Ok(RunOutcome {
            total_batches: batches.len(),
            submission_failures: failures.len(),
            stats,
            elapsed: started.elapsed(),
        })
    }
}
