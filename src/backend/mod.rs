//! # Analysis Backends
//!
//! Narrow interfaces to the engines that do the actual analysis work. The core
//! owns every policy decision (thresholds, ranking, range checks); backends only
//! return raw output.

pub mod command;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::executor::CancelToken;

pub use command::CommandBackend;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("backend failed: {0}")]
    Failed(String),
    #[error("malformed backend output: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelScore {
    pub label: String,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BoundingBox>,
    /// Frame time for detections produced from video.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_seconds: Option<f64>,
}

impl LabelScore {
    pub fn new(label: &str, score: f64) -> Self {
        Self {
            label: label.to_string(),
            score,
            bbox: None,
            timestamp_seconds: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawOutput {
    #[serde(default)]
    pub scores: Vec<LabelScore>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenConfidence {
    pub token: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OcrOutput {
    pub text: String,
    #[serde(default)]
    pub token_confidences: Vec<TokenConfidence>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    InProgress,
    Completed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        confidence: Option<f64>,
    },
    Failed {
        reason: String,
    },
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Completed { .. } => "COMPLETED",
            JobStatus::Failed { .. } => "FAILED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionParams {
    pub language_code: String,
    pub max_speakers: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vocabulary_name: Option<String>,
}

/// Model inference. Blocking; called from the executor's blocking pool.
///
/// `cancel` fires once the task has timed out or been aborted. Nothing reads
/// the result after that, so a backend that can stop early (a child process, a
/// remote request) should.
pub trait InferenceBackend: Send + Sync {
    fn infer(
        &self,
        model_id: &str,
        input: &[u8],
        params: &Value,
        cancel: &CancelToken,
    ) -> Result<RawOutput, BackendError>;
}

/// Text extraction from images or video frames. Blocking; `cancel` as for
/// [`InferenceBackend::infer`].
pub trait OcrBackend: Send + Sync {
    fn extract_text(
        &self,
        image: &[u8],
        language: &str,
        config: &Value,
        cancel: &CancelToken,
    ) -> Result<OcrOutput, BackendError>;
}

/// Remote batch transcription service.
#[async_trait]
pub trait TranscriptionBackend: Send + Sync {
    async fn start_job(
        &self,
        media_uri: &str,
        params: &TranscriptionParams,
    ) -> Result<JobId, BackendError>;
    async fn poll_status(&self, job: &JobId) -> Result<JobStatus, BackendError>;
    /// URI of the finished transcript.
    async fn fetch_transcript(&self, job: &JobId) -> Result<String, BackendError>;
    async fn delete_job(&self, job: &JobId) -> Result<(), BackendError>;
}

#[derive(Clone)]
pub struct Backends {
    pub inference: Arc<dyn InferenceBackend>,
    pub ocr: Arc<dyn OcrBackend>,
    pub transcription: Arc<dyn TranscriptionBackend>,
}

impl Backends {
    pub fn new(
        inference: Arc<dyn InferenceBackend>,
        ocr: Arc<dyn OcrBackend>,
        transcription: Arc<dyn TranscriptionBackend>,
    ) -> Self {
        Self {
            inference,
            ocr,
            transcription,
        }
    }

    /// Every call fails with [`BackendError::Unavailable`].
    pub fn unconfigured() -> Self {
        let none = Arc::new(Unconfigured);
        Self {
            inference: none.clone(),
            ocr: none.clone(),
            transcription: none,
        }
    }

    /// All three interfaces served by one external program.
    pub fn command(backend: CommandBackend) -> Self {
        let backend = Arc::new(backend);
        Self {
            inference: backend.clone(),
            ocr: backend.clone(),
            transcription: backend,
        }
    }
}

struct Unconfigured;

const UNCONFIGURED: &str = "no analysis backend configured";

impl InferenceBackend for Unconfigured {
    fn infer(&self, _: &str, _: &[u8], _: &Value, _: &CancelToken) -> Result<RawOutput, BackendError> {
        Err(BackendError::Unavailable(UNCONFIGURED.to_string()))
    }
}

impl OcrBackend for Unconfigured {
    fn extract_text(
        &self,
        _: &[u8],
        _: &str,
        _: &Value,
        _: &CancelToken,
    ) -> Result<OcrOutput, BackendError> {
        Err(BackendError::Unavailable(UNCONFIGURED.to_string()))
    }
}

#[async_trait]
impl TranscriptionBackend for Unconfigured {
    async fn start_job(&self, _: &str, _: &TranscriptionParams) -> Result<JobId, BackendError> {
        Err(BackendError::Unavailable(UNCONFIGURED.to_string()))
    }

    async fn poll_status(&self, _: &JobId) -> Result<JobStatus, BackendError> {
        Err(BackendError::Unavailable(UNCONFIGURED.to_string()))
    }

    async fn fetch_transcript(&self, _: &JobId) -> Result<String, BackendError> {
        Err(BackendError::Unavailable(UNCONFIGURED.to_string()))
    }

    async fn delete_job(&self, _: &JobId) -> Result<(), BackendError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_wire_format() {
        let done: JobStatus =
            serde_json::from_str(r#"{"status":"completed","confidence":0.93}"#).expect("parse");
        assert_eq!(done, JobStatus::Completed { confidence: Some(0.93) });
        let running: JobStatus = serde_json::from_str(r#"{"status":"in_progress"}"#).expect("parse");
        assert_eq!(running.as_str(), "IN_PROGRESS");
        let failed: JobStatus =
            serde_json::from_str(r#"{"status":"failed","reason":"bad media"}"#).expect("parse");
        assert!(matches!(failed, JobStatus::Failed { reason } if reason == "bad media"));
    }

    #[tokio::test]
    async fn unconfigured_backends_report_unavailable() {
        let backends = Backends::unconfigured();
        assert!(matches!(
            backends.inference.infer("m", b"", &Value::Null, &CancelToken::new()),
            Err(BackendError::Unavailable(_))
        ));
        let params = TranscriptionParams {
            language_code: "en-US".to_string(),
            max_speakers: 10,
            vocabulary_name: None,
        };
        assert!(backends.transcription.start_job("file:///x.wav", &params).await.is_err());
    }
}
