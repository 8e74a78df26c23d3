//! Collection service configuration.

use serde::{Deserialize, Serialize};

use crate::collect::Platform;

/// Default collection service endpoint.
pub const DEFAULT_BASE_URL: &str = "https://api.brightdata.com/datasets/v3";

/// Default cap on URLs sent in a single trigger call.
pub const DEFAULT_MAX_URLS: usize = 50;

/// Runtime configuration for the collection service client.
///
/// Constructed once per process and passed into the collector by reference;
/// there is no global client cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    pub api_key: String,
    pub base_url: String,
    /// Dataset handle for Instagram profile collection, if configured.
    pub instagram_dataset_id: Option<String>,
    /// Dataset handle for TikTok profile collection, if configured.
    pub tiktok_dataset_id: Option<String>,
    /// Maximum URLs per trigger call; the service rejects oversized payloads.
    pub max_urls: usize,
}

impl CollectorConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            instagram_dataset_id: None,
            tiktok_dataset_id: None,
            max_urls: DEFAULT_MAX_URLS,
        }
    }

    /// Load configuration from `COLLECTOR_*` environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        let api_key = std::env::var("COLLECTOR_API_KEY")
            .map_err(|_| anyhow::anyhow!("COLLECTOR_API_KEY is not set"))?;
        let mut config = Self::new(api_key);
        if let Ok(base_url) = std::env::var("COLLECTOR_BASE_URL") {
            config.base_url = base_url;
        }
        config.instagram_dataset_id = std::env::var("COLLECTOR_INSTAGRAM_DATASET_ID").ok();
        config.tiktok_dataset_id = std::env::var("COLLECTOR_TIKTOK_DATASET_ID").ok();
        if let Ok(max_urls) = std::env::var("COLLECTOR_MAX_URLS") {
            config.max_urls = max_urls.parse()?;
        }
        if config.instagram_dataset_id.is_none() && config.tiktok_dataset_id.is_none() {
            anyhow::bail!("no collector dataset id configured for any platform");
        }
        Ok(config)
    }

    /// Dataset handle for a platform, if one is configured.
    pub fn dataset_for(&self, platform: Platform) -> Option<&str> {
        match platform {
            Platform::Instagram => self.instagram_dataset_id.as_deref(),
            Platform::Tiktok => self.tiktok_dataset_id.as_deref(),
        }
    }
}
