//! Work items, batches, snapshots, and collection run results.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A raw profile record as returned by the collection service.
pub type RawRecord = serde_json::Value;

/// Social platform a work item belongs to.
///
/// Items whose platform cannot be derived from the URL host are dropped
/// before batching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Instagram,
    Tiktok,
}

impl Platform {
    /// Derive the platform from a URL host, if recognized.
    pub fn from_host(host: &str) -> Option<Self> {
        if host.contains("instagram.com") {
            Some(Platform::Instagram)
        } else if host.contains("tiktok.com") {
            Some(Platform::Tiktok)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Instagram => "instagram",
            Platform::Tiktok => "tiktok",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work: a canonical profile URL plus its derived platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub url: String,
    pub platform: Platform,
}

/// Parse a raw URL into a canonical work item, or `None` when the URL has
/// no host or belongs to an unrecognized platform.
///
/// Scheme defaults to https, the host is lowercased, trailing slashes are
/// stripped, and TikTok paths are normalized to the `/@handle` form.
pub fn parse_work_item(raw: &str) -> Option<WorkItem> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    let parsed = reqwest::Url::parse(&candidate).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let platform = Platform::from_host(&host)?;
    let mut path = parsed.path().trim_end_matches('/').to_string();
    if path.is_empty() {
        return None;
    }
    if platform == Platform::Tiktok && !path.starts_with("/@") {
        path = format!("/@{}", path.trim_start_matches('/'));
    }
    Some(WorkItem {
        url: format!("{}://{host}{path}", parsed.scheme()),
        platform,
    })
}

/// Return the canonical form of a social profile URL, if it parses.
pub fn canonicalize_url(raw: &str) -> Option<String> {
    parse_work_item(raw).map(|item| item.url)
}

/// Canonicalize, platform-tag, and de-duplicate raw URLs into work items,
/// keeping at most `max_items` of them.
///
/// Unrecognized or malformed URLs are dropped here; the planner never sees
/// them. De-duplication is case-insensitive and keeps the first occurrence.
/// The cap applies to the cleaned list, so duplicates and rejects do not
/// consume it; URLs beyond the cap are dropped with a warning.
pub fn prepare_work_items<I, S>(urls: I, max_items: usize) -> Vec<WorkItem>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let max_items = max_items.max(1);
    let mut seen = std::collections::HashSet::new();
    let mut items = Vec::new();
    for raw in urls {
        if items.len() >= max_items {
            tracing::warn!(limit = max_items, "Work item limit reached, dropping remaining URLs");
            break;
        }
        let Some(item) = parse_work_item(raw.as_ref()) else {
            tracing::debug!(url = raw.as_ref(), "Dropping URL with no recognized platform");
            continue;
        };
        if !seen.insert(item.url.to_lowercase()) {
            continue;
        }
        items.push(item);
    }
    items
}

/// An ordered, platform-homogeneous group of work items submitted to the
/// collection service in one call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    /// Zero-based index, unique within a run across all platforms.
    pub batch_index: usize,
    pub platform: Platform,
    pub items: Vec<WorkItem>,
}

/// Last observed state of an in-flight collection job.
///
/// Authoritative only from the service's perspective; the orchestrator
/// caches it once a terminal state (ready/failed) is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotState {
    Submitted,
    Running,
    Ready,
    Failed,
}

/// The service's opaque handle for one submitted batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub platform: Platform,
    pub batch_index: usize,
    pub state: SnapshotState,
}

/// Status reported by `GET /progress/{snapshot_id}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollStatus {
    Running,
    Ready,
    Failed,
    #[serde(other)]
    Unknown,
}

/// Progress payload for one snapshot.
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotProgress {
    pub status: PollStatus,
    #[serde(default)]
    pub completed: u64,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub message: Option<String>,
}

/// Immutable parameters for one batch collection run.
#[derive(Debug, Clone)]
pub struct BatchProcessingConfig {
    /// Maximum work items per batch. Clamped to at least 1.
    pub batch_size: usize,
    /// Submission and download concurrency ceiling.
    pub max_concurrent_batches: usize,
    /// Delay between poll sweeps.
    pub polling_interval: Duration,
    /// Global deadline for the whole polling phase.
    pub max_wait_time: Duration,
    /// Cap on the cleaned work-item list for the whole run, applied after
    /// canonicalization and de-duplication.
    pub max_urls: usize,
}

impl Default for BatchProcessingConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            max_concurrent_batches: 3,
            polling_interval: Duration::from_secs(5),
            max_wait_time: Duration::from_secs(600),
            max_urls: crate::config::DEFAULT_MAX_URLS,
        }
    }
}

/// Message delivered for each batch the moment its download finishes.
#[derive(Debug, Clone)]
pub struct BatchCompletion {
    pub batch_index: usize,
    pub platform: Platform,
    pub snapshot_id: String,
    pub records: Vec<RawRecord>,
}

/// Accumulated output of the blocking collection variant.
#[derive(Debug)]
pub struct BatchProcessingResult {
    pub records: Vec<RawRecord>,
    /// Every obtained snapshot with its final state.
    pub snapshots: Vec<Snapshot>,
    /// Batches the planner produced, including ones whose submission failed.
    pub total_batches: usize,
    pub successful_batches: usize,
    /// Rejected submissions plus snapshot-scoped failures (download errors,
    /// service-reported failures, timeouts). With `successful_batches` this
    /// accounts for every planned batch.
    pub failed_batches: usize,
    pub total_time: Duration,
}

/// Counters returned by the streaming collection variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamingSummary {
    pub total_batches: usize,
    pub completed_batches: usize,
    pub failed_batches: usize,
    pub total_records: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_normalizes_scheme_host_and_path() {
        assert_eq!(
            canonicalize_url("HTTPS://Instagram.com/somecreator/"),
            Some("https://instagram.com/somecreator".to_string())
        );
        assert_eq!(
            canonicalize_url("www.tiktok.com/somecreator"),
            Some("https://www.tiktok.com/@somecreator".to_string())
        );
        // Already-canonical TikTok handles are untouched.
        assert_eq!(
            canonicalize_url("https://www.tiktok.com/@somecreator"),
            Some("https://www.tiktok.com/@somecreator".to_string())
        );
    }

    #[test]
    fn canonicalize_rejects_unusable_urls() {
        assert_eq!(canonicalize_url(""), None);
        assert_eq!(canonicalize_url("   "), None);
        assert_eq!(canonicalize_url("https://example.com/profile"), None);
        // Host without a path is not a profile URL.
        assert_eq!(canonicalize_url("https://instagram.com/"), None);
    }

    #[test]
    fn prepare_drops_unknown_platforms_and_dedupes() {
        let urls = [
            "https://instagram.com/a",
            "https://INSTAGRAM.com/A/",
            "https://tiktok.com/@b",
            "https://example.com/not-social",
            "not a url at all",
        ];
        let items = prepare_work_items(urls, 50);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].platform, Platform::Instagram);
        assert_eq!(items[1].platform, Platform::Tiktok);
    }

    #[test]
    fn prepare_caps_the_cleaned_list_not_the_raw_one() {
        // Duplicates and rejects do not consume the cap.
        let urls = [
            "https://instagram.com/a",
            "https://INSTAGRAM.com/A",
            "https://example.com/not-social",
            "https://instagram.com/b",
            "https://instagram.com/c",
        ];
        let items = prepare_work_items(urls, 2);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].url, "https://instagram.com/a");
        assert_eq!(items[1].url, "https://instagram.com/b");
    }

    #[test]
    fn poll_status_deserializes_vendor_strings() {
        let progress: SnapshotProgress =
            serde_json::from_value(serde_json::json!({"status": "ready", "completed": 5, "total": 5}))
                .unwrap();
        assert_eq!(progress.status, PollStatus::Ready);

        let progress: SnapshotProgress =
            serde_json::from_value(serde_json::json!({"status": "collecting"})).unwrap();
        assert_eq!(progress.status, PollStatus::Unknown);
    }
}
