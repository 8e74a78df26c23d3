//! The combined snapshot poller and streaming dispatcher.
//!
//! One loop owns both concerns: it sweeps the status of every unresolved
//! snapshot in parallel and, the moment a snapshot turns ready, spawns its
//! download-and-deliver task without waiting for the rest of the sweep or
//! for sibling snapshots. A slow batch therefore never stalls delivery of a
//! fast one.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::client::CollectorClient;
use super::types::{
    BatchCompletion, BatchProcessingConfig, PollStatus, Snapshot, SnapshotState,
};

/// How long in-flight downloads may keep running after the global deadline.
const DRAIN_GRACE: Duration = Duration::from_secs(30);

/// Final tally of one polling phase. Every snapshot lands in exactly one of
/// the four outcome counters, so their sum equals `snapshots.len()`.
#[derive(Debug)]
pub(crate) struct PollStats {
    /// All snapshots with their final observed state.
    pub snapshots: Vec<Snapshot>,
    /// Downloaded and delivered.
    pub processed: usize,
    /// Ready, but the download or parse failed.
    pub processed_with_error: usize,
    /// The service reported the snapshot failed.
    pub failed: usize,
    /// Still unresolved when the global deadline elapsed.
    pub timed_out: usize,
    pub records_delivered: usize,
}

#[derive(Debug, Default)]
struct DeliveryCounters {
    processed: usize,
    processed_with_error: usize,
    records_delivered: usize,
}

/// Poll all snapshots until each resolves or the deadline elapses,
/// dispatching each ready snapshot's download as soon as it is observed.
///
/// Completions are handed off over `completions`; the caller decides how to
/// consume them and must not assume any arrival order. A transport error on
/// a single status probe is logged and retried on the next sweep, distinct
/// from the service itself reporting `failed`.
pub(crate) async fn poll_and_dispatch(
    client: Arc<dyn CollectorClient>,
    mut snapshots: Vec<Snapshot>,
    config: &BatchProcessingConfig,
    completions: mpsc::Sender<BatchCompletion>,
    cancel: &CancellationToken,
) -> PollStats {
    let total = snapshots.len();
    let started = Instant::now();
    let mut resolved: HashSet<String> = HashSet::with_capacity(total);
    let mut failed = 0usize;
    let mut timed_out = 0usize;
    let counters = Arc::new(Mutex::new(DeliveryCounters::default()));
    let mut downloads: JoinSet<()> = JoinSet::new();

    while resolved.len() < total {
        if started.elapsed() >= config.max_wait_time || cancel.is_cancelled() {
            for snap in snapshots.iter_mut().filter(|s| !resolved.contains(&s.id)) {
                snap.state = SnapshotState::Failed;
                timed_out += 1;
                tracing::warn!(
                    snapshot = %snap.id,
                    batch = snap.batch_index,
                    "Snapshot unresolved at deadline"
                );
            }
            break;
        }

        // One concurrent probe per unresolved snapshot. Results are handled
        // as they arrive so a ready snapshot is dispatched before slower
        // probes in the same sweep come back.
        let mut probes: FuturesUnordered<_> = snapshots
            .iter()
            .enumerate()
            .filter(|(_, s)| !resolved.contains(&s.id))
            .map(|(idx, snap)| {
                let client = client.clone();
                let id = snap.id.clone();
                async move { (idx, client.progress(&id).await) }
            })
            .collect();

        while let Some((idx, result)) = probes.next().await {
            match result {
                Ok(progress) => match progress.status {
                    PollStatus::Ready => {
                        let snap = &mut snapshots[idx];
                        if !resolved.insert(snap.id.clone()) {
                            continue;
                        }
                        snap.state = SnapshotState::Ready;
                        tracing::debug!(
                            snapshot = %snap.id,
                            batch = snap.batch_index,
                            "Snapshot ready, dispatching download"
                        );
                        spawn_download(
                            &mut downloads,
                            client.clone(),
                            snap.clone(),
                            completions.clone(),
                            counters.clone(),
                        );
                    }
                    PollStatus::Failed => {
                        let snap = &mut snapshots[idx];
                        if !resolved.insert(snap.id.clone()) {
                            continue;
                        }
                        snap.state = SnapshotState::Failed;
                        failed += 1;
                        tracing::warn!(
                            snapshot = %snap.id,
                            batch = snap.batch_index,
                            message = progress.message.as_deref().unwrap_or(""),
                            "Collection service reported snapshot failed"
                        );
                    }
                    PollStatus::Running | PollStatus::Unknown => {
                        snapshots[idx].state = SnapshotState::Running;
                    }
                },
                Err(e) => {
                    // Presumed transient network noise; the snapshot stays
                    // unresolved and is probed again next sweep.
                    tracing::debug!(
                        snapshot = %snapshots[idx].id,
                        error = %e,
                        "Status probe failed, retrying next sweep"
                    );
                }
            }
        }
        drop(probes);

        if resolved.len() < total {
            tokio::select! {
                _ = tokio::time::sleep(config.polling_interval) => {}
                _ = cancel.cancelled() => {}
            }
        }
    }

    drain_downloads(&mut downloads, timed_out > 0).await;

    let counters = counters.lock().await;
    PollStats {
        snapshots,
        processed: counters.processed,
        processed_with_error: counters.processed_with_error,
        failed,
        timed_out,
        records_delivered: counters.records_delivered,
    }
}

fn spawn_download(
    downloads: &mut JoinSet<()>,
    client: Arc<dyn CollectorClient>,
    snapshot: Snapshot,
    completions: mpsc::Sender<BatchCompletion>,
    counters: Arc<Mutex<DeliveryCounters>>,
) {
    downloads.spawn(async move {
        match client.download(&snapshot.id).await {
            Ok(records) => {
                let count = records.len();
                {
                    let mut counters = counters.lock().await;
                    counters.processed += 1;
                    counters.records_delivered += count;
                }
                tracing::info!(
                    snapshot = %snapshot.id,
                    batch = snapshot.batch_index,
                    records = count,
                    "Batch downloaded"
                );
                let completion = BatchCompletion {
                    batch_index: snapshot.batch_index,
                    platform: snapshot.platform,
                    snapshot_id: snapshot.id,
                    records,
                };
                if completions.send(completion).await.is_err() {
                    tracing::warn!("Completion receiver dropped before batch delivery");
                }
            }
            Err(e) => {
                counters.lock().await.processed_with_error += 1;
                tracing::error!(
                    snapshot = %snapshot.id,
                    batch = snapshot.batch_index,
                    error = %e,
                    "Batch download failed"
                );
            }
        }
    });
}

/// Wait for in-flight downloads. After a deadline exit the drain itself is
/// bounded by a grace period so partially-downloaded results are not
/// discarded, then whatever remains is aborted.
async fn drain_downloads(downloads: &mut JoinSet<()>, bounded: bool) {
    let drain = async {
        while let Some(result) = downloads.join_next().await {
            if let Err(e) = result {
                if e.is_panic() {
                    tracing::error!(error = %e, "Download task panicked");
                }
            }
        }
    };
    if bounded {
        if tokio::time::timeout(DRAIN_GRACE, drain).await.is_err() {
            tracing::warn!("Drain grace period elapsed, aborting remaining downloads");
            downloads.abort_all();
        }
    } else {
        drain.await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::json;

    use super::super::types::{Platform, RawRecord, SnapshotProgress};
    use super::*;

    /// Scripted service: each snapshot follows a fixed status sequence,
    /// one entry consumed per probe, with the last entry repeating.
    struct ScriptedClient {
        scripts: Mutex<HashMap<String, Vec<PollStatus>>>,
        records: HashMap<String, Vec<RawRecord>>,
        probe_counts: Mutex<HashMap<String, usize>>,
        download_counts: AtomicUsize,
    }

    impl ScriptedClient {
        fn new(
            scripts: Vec<(&str, Vec<PollStatus>)>,
            records: Vec<(&str, Vec<RawRecord>)>,
        ) -> Self {
            Self {
                scripts: Mutex::new(
                    scripts
                        .into_iter()
                        .map(|(id, s)| (id.to_string(), s))
                        .collect(),
                ),
                records: records
                    .into_iter()
                    .map(|(id, r)| (id.to_string(), r))
                    .collect(),
                probe_counts: Mutex::new(HashMap::new()),
                download_counts: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CollectorClient for ScriptedClient {
        async fn trigger(&self, _platform: Platform, _urls: &[String]) -> Result<String> {
            unimplemented!("not used by polling tests")
        }

        async fn progress(&self, snapshot_id: &str) -> Result<SnapshotProgress> {
            *self
                .probe_counts
                .lock()
                .await
                .entry(snapshot_id.to_string())
                .or_insert(0) += 1;
            let mut scripts = self.scripts.lock().await;
            let script = scripts
                .get_mut(snapshot_id)
                .ok_or_else(|| anyhow::anyhow!("unknown snapshot {snapshot_id}"))?;
            let status = if script.len() > 1 {
                script.remove(0)
            } else {
                script[0]
            };
            Ok(SnapshotProgress {
                status,
                completed: 0,
                total: 0,
                message: None,
            })
        }

        async fn download(&self, snapshot_id: &str) -> Result<Vec<RawRecord>> {
            self.download_counts.fetch_add(1, Ordering::SeqCst);
            self.records
                .get(snapshot_id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no records for {snapshot_id}"))
        }
    }

    fn snapshot(id: &str, batch_index: usize) -> Snapshot {
        Snapshot {
            id: id.to_string(),
            platform: Platform::Instagram,
            batch_index,
            state: SnapshotState::Submitted,
        }
    }

    fn config() -> BatchProcessingConfig {
        BatchProcessingConfig {
            polling_interval: Duration::from_millis(100),
            max_wait_time: Duration::from_secs(60),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fast_batches_are_delivered_before_slow_ones_resolve() {
        use PollStatus::*;
        // Batch 2 is ready on the first sweep; batch 0 takes four sweeps.
        let client = Arc::new(ScriptedClient::new(
            vec![
                ("s0", vec![Running, Running, Running, Ready]),
                ("s1", vec![Running, Ready]),
                ("s2", vec![Ready]),
            ],
            vec![
                ("s0", vec![json!({"n": 0})]),
                ("s1", vec![json!({"n": 1})]),
                ("s2", vec![json!({"n": 2})]),
            ],
        ));
        let snapshots = vec![snapshot("s0", 0), snapshot("s1", 1), snapshot("s2", 2)];
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let cfg = config();

        let poll = tokio::spawn({
            let client = client.clone();
            let cancel = cancel.clone();
            async move { poll_and_dispatch(client, snapshots, &cfg, tx, &cancel).await }
        });

        let mut arrival_order = Vec::new();
        while let Some(completion) = rx.recv().await {
            arrival_order.push(completion.batch_index);
        }
        // The fastest batch arrives first, before the slowest has resolved.
        assert_eq!(arrival_order, vec![2, 1, 0]);

        let stats = poll.await.unwrap();
        assert_eq!(stats.processed, 3);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.timed_out, 0);
        assert_eq!(stats.records_delivered, 3);
        assert!(stats
            .snapshots
            .iter()
            .all(|s| s.state == SnapshotState::Ready));
    }

    #[tokio::test(start_paused = true)]
    async fn resolved_snapshots_are_not_probed_or_delivered_again() {
        use PollStatus::*;
        let client = Arc::new(ScriptedClient::new(
            vec![("s0", vec![Ready]), ("s1", vec![Running, Running, Ready])],
            vec![
                ("s0", vec![json!({"n": 0})]),
                ("s1", vec![json!({"n": 1})]),
            ],
        ));
        let snapshots = vec![snapshot("s0", 0), snapshot("s1", 1)];
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let cfg = config();

        let stats = poll_and_dispatch(client.clone(), snapshots, &cfg, tx, &cancel).await;
        assert_eq!(stats.processed, 2);

        let mut completions = 0;
        while rx.recv().await.is_some() {
            completions += 1;
        }
        assert_eq!(completions, 2);
        assert_eq!(client.download_counts.load(Ordering::SeqCst), 2);
        // s0 resolved on the first sweep and was never probed again.
        let probes = client.probe_counts.lock().await;
        assert_eq!(probes["s0"], 1);
        assert_eq!(probes["s1"], 3);
    }

    #[tokio::test(start_paused = true)]
    async fn one_failed_snapshot_does_not_abort_the_others() {
        use PollStatus::*;
        let client = Arc::new(ScriptedClient::new(
            vec![
                ("s0", vec![Ready]),
                ("s1", vec![Running, Failed]),
                ("s2", vec![Running, Ready]),
            ],
            vec![
                ("s0", vec![json!({"n": 0}), json!({"n": 1})]),
                ("s2", vec![json!({"n": 2})]),
            ],
        ));
        let snapshots = vec![snapshot("s0", 0), snapshot("s1", 1), snapshot("s2", 2)];
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let cfg = config();

        let stats = poll_and_dispatch(client, snapshots, &cfg, tx, &cancel).await;
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.timed_out, 0);
        assert_eq!(stats.records_delivered, 3);
        assert_eq!(
            stats.processed + stats.processed_with_error + stats.failed + stats.timed_out,
            3
        );

        let mut delivered: Vec<usize> = Vec::new();
        while let Some(completion) = rx.recv().await {
            delivered.push(completion.batch_index);
        }
        delivered.sort_unstable();
        assert_eq!(delivered, vec![0, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_wait_time_times_out_immediately() {
        use PollStatus::*;
        let client = Arc::new(ScriptedClient::new(
            vec![("s0", vec![Running]), ("s1", vec![Running])],
            vec![],
        ));
        let snapshots = vec![snapshot("s0", 0), snapshot("s1", 1)];
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let cfg = BatchProcessingConfig {
            max_wait_time: Duration::ZERO,
            ..config()
        };

        let stats = poll_and_dispatch(client.clone(), snapshots, &cfg, tx, &cancel).await;
        assert_eq!(stats.timed_out, 2);
        assert_eq!(stats.processed, 0);
        assert!(stats
            .snapshots
            .iter()
            .all(|s| s.state == SnapshotState::Failed));
        assert!(rx.recv().await.is_none());
        // Nothing was ever probed.
        assert!(client.probe_counts.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_probe_errors_are_retried_not_failed() {
        use PollStatus::*;
        // s1's script is missing entirely, so every probe errors; s0 is
        // delivered normally and s1 eventually times out.
        let client = Arc::new(ScriptedClient::new(
            vec![("s0", vec![Ready])],
            vec![("s0", vec![json!({"n": 0})])],
        ));
        let snapshots = vec![snapshot("s0", 0), snapshot("s1", 1)];
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let cfg = BatchProcessingConfig {
            polling_interval: Duration::from_millis(100),
            max_wait_time: Duration::from_millis(350),
            ..Default::default()
        };

        let stats = poll_and_dispatch(client.clone(), snapshots, &cfg, tx, &cancel).await;
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(rx.recv().await.unwrap().batch_index, 0);
        // The erroring snapshot was probed on every sweep until the deadline.
        assert!(client.probe_counts.lock().await["s1"] >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn download_errors_are_isolated_per_snapshot() {
        use PollStatus::*;
        // s1 has no records registered, so its download errors out.
        let client = Arc::new(ScriptedClient::new(
            vec![("s0", vec![Ready]), ("s1", vec![Ready])],
            vec![("s0", vec![json!({"n": 0})])],
        ));
        let snapshots = vec![snapshot("s0", 0), snapshot("s1", 1)];
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let cfg = config();

        let stats = poll_and_dispatch(client, snapshots, &cfg, tx, &cancel).await;
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.processed_with_error, 1);
        assert_eq!(rx.recv().await.unwrap().batch_index, 0);
        assert!(rx.recv().await.is_none());
    }
}
