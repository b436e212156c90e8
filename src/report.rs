use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::evidence::Modality;

/// Output of one analysis. `confidence`, when present, lies in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub analysis_type: String,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl AnalysisResult {
    pub fn new(analysis_type: &str, payload: Value, confidence: Option<f64>) -> Self {
        Self {
            analysis_type: analysis_type.to_string(),
            payload,
            confidence,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Backend,
    Timeout,
    Cancelled,
    Panic,
}

/// A requested analysis that reached a terminal state without a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisFailure {
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub processed_at: DateTime<Utc>,
    pub processing_duration_seconds: f64,
    pub file_hash: String,
    pub md5: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    pub cache_hits: u32,
    pub tool_version: String,
    pub config_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub evidence_id: String,
    pub modality: Modality,
    pub results: BTreeMap<String, AnalysisResult>,
    #[serde(default)]
    pub errors: BTreeMap<String, AnalysisFailure>,
    pub metadata: ReportMetadata,
}

impl Report {
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn timestamps_serialize_as_iso8601() {
        let processed_at = DateTime::parse_from_rfc3339("2026-10-18T09:30:00.123Z")
            .expect("timestamp")
            .with_timezone(&Utc);
        let report = Report {
            evidence_id: "E1".to_string(),
            modality: Modality::Text,
            results: BTreeMap::from([(
                "sentiment_analysis".to_string(),
                AnalysisResult::new("sentiment_analysis", json!({"label": "neutral"}), Some(0.8)),
            )]),
            errors: BTreeMap::new(),
            metadata: ReportMetadata {
                processed_at,
                processing_duration_seconds: 0.25,
                file_hash: "ab".repeat(32),
                md5: "cd".repeat(16),
                size_bytes: 12,
                duration: None,
                width: None,
                height: None,
                cache_hits: 0,
                tool_version: "0.1.0".to_string(),
                config_hash: "ef".repeat(32),
            },
        };
        let value = serde_json::to_value(&report).expect("json");
        assert_eq!(value["metadata"]["processed_at"], "2026-10-18T09:30:00.123Z");
        assert_eq!(value["modality"], "text");
        assert!(value["metadata"].get("duration").is_none());
    }
}
