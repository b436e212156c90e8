//! Shared test infrastructure: scripted backends, evidence fixtures and an
//! engine wired to an in-memory custody log.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use evidentia::backend::{
    BackendError, Backends, InferenceBackend, JobId, JobStatus, LabelScore, OcrBackend,
    OcrOutput, RawOutput, TokenConfidence, TranscriptionBackend, TranscriptionParams,
};
use evidentia::config::{Config, LoadedConfig};
use evidentia::context::EngineContext;
use evidentia::custody::CustodyEvent;
use evidentia::custody::memory::{MemoryLog, MemorySink};
use evidentia::executor::CancelToken;

// ============================================================================
// Scripted backends
// ============================================================================

#[derive(Clone)]
pub enum Behavior {
    Scores(Vec<(String, f64)>),
    Fail(String),
    /// Block the calling thread, then answer with a single score.
    Sleep(Duration),
    Panic,
}

pub fn scores(list: &[(&str, f64)]) -> Behavior {
    Behavior::Scores(list.iter().map(|(l, s)| (l.to_string(), *s)).collect())
}

/// Inference keyed by model id. Unscripted models answer `[("match", 0.9)]`.
#[derive(Default)]
pub struct FakeInference {
    behaviors: Mutex<HashMap<String, Behavior>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl FakeInference {
    pub fn on(&self, model_id: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .expect("lock")
            .insert(model_id.to_string(), behavior);
    }

    pub fn calls(&self, model_id: &str) -> usize {
        self.calls
            .lock()
            .expect("lock")
            .get(model_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().expect("lock").values().sum()
    }
}

impl InferenceBackend for FakeInference {
    fn infer(
        &self,
        model_id: &str,
        _input: &[u8],
        _params: &Value,
        _cancel: &CancelToken,
    ) -> Result<RawOutput, BackendError> {
        *self
            .calls
            .lock()
            .expect("lock")
            .entry(model_id.to_string())
            .or_insert(0) += 1;
        let behavior = self
            .behaviors
            .lock()
            .expect("lock")
            .get(model_id)
            .cloned()
            .unwrap_or_else(|| scores(&[("match", 0.9)]));
        match behavior {
            Behavior::Scores(list) => Ok(RawOutput {
                scores: list.iter().map(|(l, s)| LabelScore::new(l, *s)).collect(),
                embedding: None,
            }),
            Behavior::Fail(reason) => Err(BackendError::Failed(reason)),
            Behavior::Sleep(duration) => {
                std::thread::sleep(duration);
                Ok(RawOutput {
                    scores: vec![LabelScore::new("late", 0.9)],
                    embedding: None,
                })
            }
            Behavior::Panic => panic!("model {model_id} crashed"),
        }
    }
}

pub struct FakeOcr {
    pub text: String,
    calls: AtomicUsize,
}

impl FakeOcr {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl OcrBackend for FakeOcr {
    fn extract_text(
        &self,
        _image: &[u8],
        _language: &str,
        _config: &Value,
        _cancel: &CancelToken,
    ) -> Result<OcrOutput, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(OcrOutput {
            text: self.text.clone(),
            token_confidences: self
                .text
                .split_whitespace()
                .map(|t| TokenConfidence {
                    token: t.to_string(),
                    confidence: 0.8,
                })
                .collect(),
        })
    }
}

/// Completes every job after `pending_polls` in-progress answers, or never
/// when `pending_polls` is `usize::MAX`.
pub struct FakeTranscription {
    pending_polls: usize,
    confidence: Option<f64>,
    started: AtomicUsize,
    polls: AtomicUsize,
    deleted: Mutex<Vec<JobId>>,
}

impl FakeTranscription {
    pub fn new(pending_polls: usize, confidence: Option<f64>) -> Self {
        Self {
            pending_polls,
            confidence,
            started: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
            deleted: Mutex::new(Vec::new()),
        }
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn deleted(&self) -> Vec<JobId> {
        self.deleted.lock().expect("lock").clone()
    }
}

#[async_trait]
impl TranscriptionBackend for FakeTranscription {
    async fn start_job(&self, _media_uri: &str, _params: &TranscriptionParams) -> Result<JobId, BackendError> {
        let n = self.started.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(JobId(format!("job-{n}")))
    }

    async fn poll_status(&self, _job: &JobId) -> Result<JobStatus, BackendError> {
        let n = self.polls.fetch_add(1, Ordering::SeqCst);
        if n < self.pending_polls {
            Ok(JobStatus::InProgress)
        } else {
            Ok(JobStatus::Completed {
                confidence: self.confidence,
            })
        }
    }

    async fn fetch_transcript(&self, job: &JobId) -> Result<String, BackendError> {
        Ok(format!("memory://transcripts/{job}.json"))
    }

    async fn delete_job(&self, job: &JobId) -> Result<(), BackendError> {
        self.deleted.lock().expect("lock").push(job.clone());
        Ok(())
    }
}

// ============================================================================
// Engine harness
// ============================================================================

pub struct Harness {
    pub engine: Arc<EngineContext>,
    pub log: MemoryLog,
    pub inference: Arc<FakeInference>,
    pub ocr: Arc<FakeOcr>,
    pub transcription: Arc<FakeTranscription>,
    pub dir: TempDir,
}

impl Harness {
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Custody events for one evidence item, after draining the writer.
    pub fn events(&self, evidence_id: &str) -> Vec<CustodyEvent> {
        self.engine.custody.flush();
        self.log.for_evidence(evidence_id)
    }

    pub fn operations(&self, evidence_id: &str) -> Vec<String> {
        self.engine.custody.flush();
        self.log.operations(evidence_id)
    }
}

pub fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.run_id = "test-run".to_string();
    cfg.num_workers = Some(4);
    cfg.per_task_timeout_seconds = 30;
    cfg.overall_timeout_seconds = 60;
    cfg.transcription.poll_initial_ms = 5;
    cfg.transcription.poll_max_ms = 20;
    cfg
}

pub fn harness() -> Harness {
    harness_with(|_| {}, FakeTranscription::new(2, Some(0.93)))
}

pub fn harness_with(tweak: impl FnOnce(&mut Config), transcription: FakeTranscription) -> Harness {
    let mut cfg = test_config();
    tweak(&mut cfg);
    cfg.check().expect("valid test config");

    let (sink, log) = MemorySink::new();
    let inference = Arc::new(FakeInference::default());
    let ocr = Arc::new(FakeOcr::new("CASE 2291 EXHIBIT B"));
    let transcription = Arc::new(transcription);
    let backends = Backends::new(inference.clone(), ocr.clone(), transcription.clone());
    let loaded = LoadedConfig {
        config: cfg,
        config_hash: "0".repeat(64),
    };

    Harness {
        engine: EngineContext::new(loaded, Box::new(sink), backends),
        log,
        inference,
        ocr,
        transcription,
        dir: tempfile::tempdir().expect("tempdir"),
    }
}

// ============================================================================
// Evidence fixtures
// ============================================================================

pub const WAV_SAMPLE_RATE: u32 = 16_000;

/// 16-bit mono PCM sine wave at 440 Hz.
pub fn sine_wav(seconds: f64) -> Vec<u8> {
    let samples = (WAV_SAMPLE_RATE as f64 * seconds).round() as u32;
    let data_len = samples * 2;
    let mut data = Vec::with_capacity(44 + data_len as usize);
    data.extend_from_slice(b"RIFF");
    data.extend_from_slice(&(36 + data_len).to_le_bytes());
    data.extend_from_slice(b"WAVE");
    data.extend_from_slice(b"fmt ");
    data.extend_from_slice(&16u32.to_le_bytes());
    data.extend_from_slice(&1u16.to_le_bytes());
    data.extend_from_slice(&1u16.to_le_bytes());
    data.extend_from_slice(&WAV_SAMPLE_RATE.to_le_bytes());
    data.extend_from_slice(&(WAV_SAMPLE_RATE * 2).to_le_bytes());
    data.extend_from_slice(&2u16.to_le_bytes());
    data.extend_from_slice(&16u16.to_le_bytes());
    data.extend_from_slice(b"data");
    data.extend_from_slice(&data_len.to_le_bytes());
    for i in 0..samples {
        let t = i as f64 / WAV_SAMPLE_RATE as f64;
        let sample = ((t * 440.0 * std::f64::consts::TAU).sin() * 0.5 * i16::MAX as f64) as i16;
        data.extend_from_slice(&sample.to_le_bytes());
    }
    data
}

/// PNG signature, IHDR and IEND only; enough for header probing.
pub fn png_header(width: u32, height: u32) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]);
    data.extend_from_slice(&[0x00, 0x00, 0x00, 0x0D]);
    data.extend_from_slice(b"IHDR");
    data.extend_from_slice(&width.to_be_bytes());
    data.extend_from_slice(&height.to_be_bytes());
    data.extend_from_slice(&[0x08, 0x02, 0x00, 0x00, 0x00]);
    data.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
    data.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
    data.extend_from_slice(b"IEND");
    data.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
    data
}

pub fn write_fixture(path: &Path, bytes: &[u8]) -> PathBuf {
    std::fs::write(path, bytes).expect("write fixture");
    path.to_path_buf()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
