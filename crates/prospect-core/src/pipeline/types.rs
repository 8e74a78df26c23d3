//! Pipeline stages, run records, and stage documents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::collect::RawRecord;

/// One of the three ordered pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Stage {
    Search,
    Enrich,
    Score,
}

impl Stage {
    /// Canonical stage order.
    pub const ORDER: [Stage; 3] = [Stage::Search, Stage::Enrich, Stage::Score];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Search => "SEARCH",
            Stage::Enrich => "ENRICH",
            Stage::Score => "SCORE",
        }
    }

    /// The stage that follows this one, if any.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Search => Some(Stage::Enrich),
            Stage::Enrich => Some(Stage::Score),
            Stage::Score => None,
        }
    }

    /// Overall-progress value reached when this stage completes. The final
    /// stage is pinned to 100 rather than 3 × 33.
    pub fn weight(self) -> u8 {
        match self {
            Stage::Search => 33,
            Stage::Enrich => 66,
            Stage::Score => 100,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal-or-not status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Error,
}

/// The durable, externally-observable record of one pipeline run.
///
/// `overall_progress` is monotonically non-decreasing within a run and
/// reaches exactly 100 if and only if the run completed; an errored run
/// freezes progress at its last value and carries an error message. Once
/// the status leaves `Running` the record is immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub pipeline_id: String,
    pub owner_id: String,
    pub status: RunStatus,
    pub current_stage: Option<Stage>,
    /// Ordered, append-only subset of [`Stage::ORDER`].
    pub completed_stages: Vec<Stage>,
    pub overall_progress: u8,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineRun {
    pub fn new(pipeline_id: String, owner_id: String) -> Self {
        let now = Utc::now();
        Self {
            pipeline_id,
            owner_id,
            status: RunStatus::Running,
            current_stage: None,
            completed_stages: Vec::new(),
            overall_progress: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != RunStatus::Running
    }
}

/// Status of a single stage's output document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Completed,
    Error,
}

/// Output document for one (pipeline, stage) pair. Written at most once per
/// stage under normal flow; overwrite-on-retry is the only exception.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDocument {
    pub pipeline_id: String,
    pub stage: Stage,
    pub status: StageStatus,
    pub records: Vec<RawRecord>,
    /// Debug bag; sanitized before persisting.
    pub debug: Value,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl StageDocument {
    pub fn completed(pipeline_id: &str, stage: Stage, records: Vec<RawRecord>, debug: Value) -> Self {
        Self {
            pipeline_id: pipeline_id.to_string(),
            stage,
            status: StageStatus::Completed,
            records,
            debug,
            error_message: None,
            updated_at: Utc::now(),
        }
    }

    pub fn error(pipeline_id: &str, stage: Stage, message: &str) -> Self {
        Self {
            pipeline_id: pipeline_id.to_string(),
            stage,
            status: StageStatus::Error,
            records: Vec::new(),
            debug: Value::Object(Default::default()),
            error_message: Some(message.to_string()),
            updated_at: Utc::now(),
        }
    }
}

/// Store key for a stage document.
pub fn stage_document_id(pipeline_id: &str, stage: Stage) -> String {
    format!("{pipeline_id}_{}", stage.as_str())
}

/// De-duplicate completed stages and order them canonically, optionally
/// appending a newly finished stage.
pub fn normalize_completed_stages(existing: &[Stage], adding: Option<Stage>) -> Vec<Stage> {
    let mut stages: Vec<Stage> = Vec::with_capacity(existing.len() + 1);
    for stage in existing.iter().copied().chain(adding) {
        if !stages.contains(&stage) {
            stages.push(stage);
        }
    }
    stages.sort_by_key(|stage| {
        Stage::ORDER
            .iter()
            .position(|s| s == stage)
            .unwrap_or(Stage::ORDER.len())
    });
    stages
}

const MAX_DEBUG_STRING_LENGTH: usize = 500;
const SENSITIVE_DEBUG_KEYS: [&str; 5] =
    ["api_key", "token", "authorization", "password", "secret"];

/// Scrub sensitive values and truncate oversized strings in a debug bag
/// before it is persisted where observers can read it.
pub fn sanitize_debug(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sanitized = serde_json::Map::with_capacity(map.len());
            for (key, inner) in map {
                if SENSITIVE_DEBUG_KEYS.contains(&key.to_lowercase().as_str()) {
                    sanitized.insert(key.clone(), Value::String("***redacted***".to_string()));
                } else {
                    sanitized.insert(key.clone(), sanitize_debug(inner));
                }
            }
            Value::Object(sanitized)
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize_debug).collect()),
        Value::String(text) if text.chars().count() > MAX_DEBUG_STRING_LENGTH => {
            let truncated: String = text.chars().take(MAX_DEBUG_STRING_LENGTH).collect();
            Value::String(format!("{truncated}...truncated"))
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stage_weights_are_fixed_and_final_stage_is_full() {
        assert_eq!(Stage::Search.weight(), 33);
        assert_eq!(Stage::Enrich.weight(), 66);
        assert_eq!(Stage::Score.weight(), 100);
    }

    #[test]
    fn stage_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Stage::Enrich).unwrap(), "\"ENRICH\"");
        assert_eq!(stage_document_id("p1", Stage::Score), "p1_SCORE");
    }

    #[test]
    fn completed_stages_normalize_to_canonical_order() {
        let stages = normalize_completed_stages(
            &[Stage::Enrich, Stage::Search, Stage::Enrich],
            Some(Stage::Search),
        );
        assert_eq!(stages, vec![Stage::Search, Stage::Enrich]);

        let stages = normalize_completed_stages(&[Stage::Search], Some(Stage::Enrich));
        assert_eq!(stages, vec![Stage::Search, Stage::Enrich]);
    }

    #[test]
    fn sanitize_redacts_and_truncates() {
        let debug = json!({
            "api_key": "sk-very-secret",
            "nested": {"Token": "abc", "count": 3},
            "long": "x".repeat(600),
            "list": [{"password": "hunter2"}],
        });
        let sanitized = sanitize_debug(&debug);
        assert_eq!(sanitized["api_key"], "***redacted***");
        assert_eq!(sanitized["nested"]["Token"], "***redacted***");
        assert_eq!(sanitized["nested"]["count"], 3);
        assert_eq!(sanitized["list"][0]["password"], "***redacted***");
        let long = sanitized["long"].as_str().unwrap();
        assert!(long.ends_with("...truncated"));
        assert_eq!(long.chars().count(), 500 + "...truncated".len());
    }
}
