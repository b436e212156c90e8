use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::custody::CustodyBackendKind;
use crate::validate::{Limits, MAX_RESIDENT_BYTES};

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TranscriptionConfig {
    pub poll_initial_ms: u64,
    pub poll_max_ms: u64,
    pub poll_max_attempts: u32,
    pub default_language_code: String,
    pub max_speakers: u32,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            poll_initial_ms: 500,
            poll_max_ms: 10_000,
            poll_max_attempts: 720,
            default_language_code: "en-US".to_string(),
            max_speakers: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CustodyConfig {
    pub backend: CustodyBackendKind,
    pub output_dir: PathBuf,
    pub actor: String,
}

impl Default for CustodyConfig {
    fn default() -> Self {
        Self {
            backend: CustodyBackendKind::Jsonl,
            output_dir: PathBuf::from("./custody"),
            actor: "evidentia".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub run_id: String,
    pub num_workers: Option<usize>,
    pub gpu_device: Option<String>,
    pub per_task_timeout_seconds: u64,
    pub overall_timeout_seconds: u64,
    pub cache_ttl_seconds: u64,
    pub cache_capacity: usize,
    pub default_confidence_threshold: f64,
    pub confidence_thresholds: BTreeMap<String, f64>,
    pub models: BTreeMap<String, String>,
    pub limits: Limits,
    pub transcription: TranscriptionConfig,
    pub custody: CustodyConfig,
    pub verify_on_complete: bool,
    pub hash_block_size: usize,
    pub backend_command: Option<PathBuf>,
    pub backend_args: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            run_id: String::new(),
            num_workers: None,
            gpu_device: None,
            per_task_timeout_seconds: 300,
            overall_timeout_seconds: 1800,
            cache_ttl_seconds: 3600,
            cache_capacity: 1000,
            default_confidence_threshold: 0.5,
            confidence_thresholds: default_thresholds(),
            models: default_models(),
            limits: Limits::default(),
            transcription: TranscriptionConfig::default(),
            custody: CustodyConfig::default(),
            verify_on_complete: true,
            hash_block_size: 8 * 1024 * 1024,
            backend_command: None,
            backend_args: Vec::new(),
        }
    }
}

fn default_thresholds() -> BTreeMap<String, f64> {
    [
        ("object_detection", 0.5),
        ("face_detection", 0.5),
        ("scene_recognition", 0.5),
        ("speaker_identification", 0.5),
        ("language_detection", 0.5),
        ("entity_extraction", 0.75),
        ("sentiment_analysis", 0.5),
        ("ocr", 0.5),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

fn default_models() -> BTreeMap<String, String> {
    [
        ("speaker_identification", "speaker_identification"),
        ("language_detection", "language_detection"),
        ("object_detection", "yolov5"),
        ("face_detection", "face_detect"),
        ("scene_recognition", "scene_classify"),
        ("entity_extraction", "entity-v1.2.0"),
        ("sentiment_analysis", "sentiment-v2.0.1"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

impl Config {
    pub fn worker_count(&self) -> usize {
        self.num_workers.unwrap_or_else(num_cpus::get).max(1)
    }

    pub fn per_task_timeout(&self) -> Duration {
        Duration::from_secs(self.per_task_timeout_seconds)
    }

    pub fn overall_timeout(&self) -> Duration {
        Duration::from_secs(self.overall_timeout_seconds)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }

    /// Threshold applied when splitting raw scores into the detected set.
    pub fn threshold_for(&self, analysis_type: &str) -> f64 {
        self.confidence_thresholds
            .get(analysis_type)
            .copied()
            .unwrap_or(self.default_confidence_threshold)
    }

    /// Model identifier handed to the inference backend; defaults to the analysis type.
    pub fn model_for(&self, analysis_type: &str) -> String {
        self.models
            .get(analysis_type)
            .cloned()
            .unwrap_or_else(|| analysis_type.to_string())
    }

    pub fn check(&self) -> Result<()> {
        if self.per_task_timeout_seconds == 0 {
            bail!("per_task_timeout_seconds must be greater than zero");
        }
        if self.overall_timeout_seconds == 0 {
            bail!("overall_timeout_seconds must be greater than zero");
        }
        if self.cache_capacity == 0 {
            bail!("cache_capacity must be greater than zero");
        }
        if self.hash_block_size == 0 {
            bail!("hash_block_size must be greater than zero");
        }
        if !(0.0..=1.0).contains(&self.default_confidence_threshold) {
            bail!(
                "default_confidence_threshold {} is outside [0, 1]",
                self.default_confidence_threshold
            );
        }
        for (analysis_type, threshold) in &self.confidence_thresholds {
            if !(0.0..=1.0).contains(threshold) {
                bail!("confidence threshold for {analysis_type} is outside [0, 1]: {threshold}");
            }
        }
        if self.transcription.poll_initial_ms == 0 {
            bail!("transcription.poll_initial_ms must be greater than zero");
        }
        // Accepted evidence is held in memory for the whole request.
        let max_bytes = self.limits.max_file_bytes;
        if max_bytes > MAX_RESIDENT_BYTES || usize::try_from(max_bytes).is_err() {
            bail!(
                "limits.max_file_bytes {max_bytes} exceeds the in-memory ceiling of {MAX_RESIDENT_BYTES} bytes"
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: Config,
    pub config_hash: String,
}

pub fn load_config(path: Option<&Path>) -> Result<LoadedConfig> {
    let bytes: Vec<u8> = if let Some(p) = path {
        std::fs::read(p)?
    } else {
        include_bytes!("../config/default.yml").to_vec()
    };

    let mut config: Config = serde_yaml::from_slice(&bytes)?;
    if config.run_id.trim().is_empty() {
        config.run_id = generate_run_id();
    }
    config.check()?;

    let config_hash = hash_bytes(&bytes);

    Ok(LoadedConfig { config, config_hash })
}

fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    hex::encode(digest)
}

fn generate_run_id() -> String {
    let now = chrono::Utc::now();
    format!("{}_{}", now.format("%Y%m%dT%H%M%SZ"), rand_suffix())
}

fn rand_suffix() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    format!("{:08x}", nanos)
}
