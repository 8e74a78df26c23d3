//! Concurrency-bounded batch submission.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use super::client::CollectorClient;
use super::types::{Batch, Snapshot, SnapshotState};

/// Pause between submission chunks so the service's rate limiter is not
/// burst past the concurrency ceiling.
const INTER_CHUNK_DELAY: Duration = Duration::from_secs(1);

/// A submission the service rejected, tagged with its batch index.
#[derive(Debug)]
pub struct SubmissionFailure {
    pub batch_index: usize,
    pub message: String,
}

/// Submit batches in sequential chunks of `max_concurrent`.
///
/// Submissions within a chunk run concurrently; a fixed delay separates
/// chunks. Each failure is recorded independently and never aborts sibling
/// submissions, so the run proceeds with whatever snapshots were obtained.
/// Failed submissions are not retried.
pub async fn submit_batches(
    client: Arc<dyn CollectorClient>,
    batches: &[Batch],
    max_concurrent: usize,
) -> (Vec<Snapshot>, Vec<SubmissionFailure>) {
    let mut snapshots = Vec::with_capacity(batches.len());
    let mut failures = Vec::new();
    let chunk_size = max_concurrent.max(1);
    let chunk_count = batches.len().div_ceil(chunk_size);

    for (chunk_idx, chunk) in batches.chunks(chunk_size).enumerate() {
        let submissions = chunk.iter().map(|batch| {
            let client = client.clone();
            async move {
                let urls: Vec<String> = batch.items.iter().map(|i| i.url.clone()).collect();
                (batch, client.trigger(batch.platform, &urls).await)
            }
        });

        for (batch, result) in join_all(submissions).await {
            match result {
                Ok(id) => {
                    tracing::debug!(
                        batch = batch.batch_index,
                        platform = %batch.platform,
                        snapshot = %id,
                        urls = batch.items.len(),
                        "Batch submitted"
                    );
                    snapshots.push(Snapshot {
                        id,
                        platform: batch.platform,
                        batch_index: batch.batch_index,
                        state: SnapshotState::Submitted,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        batch = batch.batch_index,
                        platform = %batch.platform,
                        error = %e,
                        "Batch submission failed"
                    );
                    failures.push(SubmissionFailure {
                        batch_index: batch.batch_index,
                        message: e.to_string(),
                    });
                }
            }
        }

        if chunk_idx + 1 < chunk_count {
            tokio::time::sleep(INTER_CHUNK_DELAY).await;
        }
    }

    (snapshots, failures)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::Result;
    use async_trait::async_trait;

    use super::super::types::{Platform, RawRecord, SnapshotProgress, WorkItem};
    use super::*;

    struct CountingClient {
        active: AtomicUsize,
        max_active: AtomicUsize,
        calls: AtomicUsize,
        fail_batches: Vec<usize>,
    }

    impl CountingClient {
        fn new(fail_batches: Vec<usize>) -> Self {
            Self {
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
                fail_batches,
            }
        }
    }

    #[async_trait]
    impl CollectorClient for CountingClient {
        async fn trigger(&self, _platform: Platform, urls: &[String]) -> Result<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            // Batch index is encoded in the first URL by the fixture below.
            let batch_index: usize = urls[0].rsplit('/').next().unwrap().parse().unwrap();
            if self.fail_batches.contains(&batch_index) {
                anyhow::bail!("simulated rejection");
            }
            Ok(format!("snap-{call}"))
        }

        async fn progress(&self, _snapshot_id: &str) -> Result<SnapshotProgress> {
            unimplemented!("not used by submission tests")
        }

        async fn download(&self, _snapshot_id: &str) -> Result<Vec<RawRecord>> {
            unimplemented!("not used by submission tests")
        }
    }

    fn fixture_batches(count: usize) -> Vec<Batch> {
        (0..count)
            .map(|batch_index| Batch {
                batch_index,
                platform: Platform::Instagram,
                items: vec![WorkItem {
                    url: format!("https://instagram.com/{batch_index}"),
                    platform: Platform::Instagram,
                }],
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_ceiling_is_respected() {
        let client = Arc::new(CountingClient::new(Vec::new()));
        let batches = fixture_batches(6);

        let (snapshots, failures) = submit_batches(client.clone(), &batches, 2).await;
        assert_eq!(snapshots.len(), 6);
        assert!(failures.is_empty());
        assert!(client.max_active.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_chunks_observe_the_inter_chunk_delay() {
        let client = Arc::new(CountingClient::new(Vec::new()));
        let batches = fixture_batches(5);

        let started = tokio::time::Instant::now();
        let (snapshots, _) = submit_batches(client.clone(), &batches, 1).await;
        assert_eq!(snapshots.len(), 5);
        assert_eq!(client.max_active.load(Ordering::SeqCst), 1);
        // Four inter-chunk delays between five single-batch chunks.
        assert!(started.elapsed() >= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_submissions_are_isolated() {
        let client = Arc::new(CountingClient::new(vec![1, 3]));
        let batches = fixture_batches(5);

        let (snapshots, failures) = submit_batches(client, &batches, 2).await;
        assert_eq!(snapshots.len(), 3);
        assert_eq!(failures.len(), 2);
        let failed: Vec<usize> = failures.iter().map(|f| f.batch_index).collect();
        assert_eq!(failed, vec![1, 3]);
        // Surviving snapshots keep their original batch indices.
        let indices: Vec<usize> = snapshots.iter().map(|s| s.batch_index).collect();
        assert_eq!(indices, vec![0, 2, 4]);
    }
}
