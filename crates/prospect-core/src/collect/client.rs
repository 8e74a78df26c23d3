//! Collection service client.
//!
//! The orchestration loop only depends on the [`CollectorClient`] trait:
//! submit a batch, poll a handle, download a result set. The reqwest-backed
//! [`HttpCollectorClient`] implements the vendor's dataset API; tests script
//! their own implementations.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::CollectorConfig;
use crate::error::CollectError;

use super::types::{Platform, RawRecord, SnapshotProgress};

/// External collection service, seen from the orchestrator.
#[async_trait]
pub trait CollectorClient: Send + Sync {
    /// Submit one batch of URLs; returns the service's opaque snapshot id.
    async fn trigger(&self, platform: Platform, urls: &[String]) -> Result<String>;

    /// Check the status of an in-flight snapshot.
    async fn progress(&self, snapshot_id: &str) -> Result<SnapshotProgress>;

    /// Download the result set for a resolved snapshot.
    async fn download(&self, snapshot_id: &str) -> Result<Vec<RawRecord>>;
}

#[derive(Serialize)]
struct TriggerEntry<'a> {
    url: &'a str,
}

#[derive(Deserialize)]
struct TriggerResponse {
    /// The service nests the id under either key depending on endpoint age.
    snapshot_id: Option<String>,
    snapshot: Option<String>,
}

/// HTTP implementation of the collection service contract.
pub struct HttpCollectorClient {
    client: reqwest::Client,
    config: CollectorConfig,
}

impl HttpCollectorClient {
    pub fn new(config: CollectorConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl CollectorClient for HttpCollectorClient {
    async fn trigger(&self, platform: Platform, urls: &[String]) -> Result<String> {
        let dataset_id = self
            .config
            .dataset_for(platform)
            .with_context(|| format!("no dataset configured for {platform}"))?;
        if urls.is_empty() {
            anyhow::bail!("no URLs to submit");
        }
        // Refuse rather than truncate: a silently shortened batch would be
        // reported successful while its tail was never collected.
        if urls.len() > self.config.max_urls {
            anyhow::bail!(
                "batch of {} URLs exceeds the {}-URL submission limit",
                urls.len(),
                self.config.max_urls
            );
        }
        let payload: Vec<TriggerEntry> = urls.iter().map(|url| TriggerEntry { url }).collect();

        let response = self
            .client
            .post(format!("{}/trigger", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .query(&[("dataset_id", dataset_id), ("include_errors", "true")])
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;

        let body: TriggerResponse = response.json().await?;
        body.snapshot_id
            .or(body.snapshot)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| anyhow::anyhow!("trigger response carried no snapshot id"))
    }

    async fn progress(&self, snapshot_id: &str) -> Result<SnapshotProgress> {
        let progress = self
            .client
            .get(format!("{}/progress/{snapshot_id}", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(progress)
    }

    async fn download(&self, snapshot_id: &str) -> Result<Vec<RawRecord>> {
        let body: serde_json::Value = self
            .client
            .get(format!("{}/snapshot/{snapshot_id}", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .query(&[("format", "json")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(normalize_records(body)?)
    }
}

/// Normalize the heterogeneous envelopes the service returns into a flat
/// record list.
///
/// Shape matchers are tried in order: bare array, `{"data": [...]}`,
/// `{"results": [...]}`, then a lone object wrapped as a one-element list
/// (observed for single-item batches).
pub fn normalize_records(value: serde_json::Value) -> Result<Vec<RawRecord>, CollectError> {
    const MATCHERS: [fn(&serde_json::Value) -> Option<Vec<RawRecord>>; 4] = [
        match_bare_array,
        match_data_envelope,
        match_results_envelope,
        match_single_object,
    ];
    for matcher in MATCHERS {
        if let Some(records) = matcher(&value) {
            return Ok(records);
        }
    }
    Err(CollectError::UnexpectedResponse(format!(
        "unhandled envelope shape: {}",
        truncate(&value.to_string(), 120)
    )))
}

fn match_bare_array(value: &serde_json::Value) -> Option<Vec<RawRecord>> {
    value.as_array().cloned()
}

fn match_data_envelope(value: &serde_json::Value) -> Option<Vec<RawRecord>> {
    value.get("data")?.as_array().cloned()
}

fn match_results_envelope(value: &serde_json::Value) -> Option<Vec<RawRecord>> {
    value.get("results")?.as_array().cloned()
}

fn match_single_object(value: &serde_json::Value) -> Option<Vec<RawRecord>> {
    value.is_object().then(|| vec![value.clone()])
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
