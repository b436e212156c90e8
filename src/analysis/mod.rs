//! # Analyses
//!
//! Per-modality catalogue of analysis types, the options each one runs with,
//! and the post-processing the engine applies to raw backend output.
//!
//! Request options are layered: top-level keys apply to every analysis, a key
//! named after an analysis type holds an object of overrides for that type,
//! and configuration supplies the rest (`model_id`, `confidence_threshold`,
//! transcription language and speaker count).

pub mod inference;
pub mod ocr;
pub mod transcription;

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::backend::Backends;
use crate::config::{Config, TranscriptionConfig};
use crate::evidence::{EvidenceItem, Modality};
use crate::executor::{ResourceClass, TaskContext, TaskOutcome};
use crate::validate::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisKind {
    Inference,
    Ocr,
    Transcription,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisSpec {
    pub name: &'static str,
    pub kind: AnalysisKind,
    pub class: ResourceClass,
}

const fn spec(name: &'static str, kind: AnalysisKind, class: ResourceClass) -> AnalysisSpec {
    AnalysisSpec { name, kind, class }
}

const AUDIO: &[AnalysisSpec] = &[
    spec("transcription", AnalysisKind::Transcription, ResourceClass::Network),
    spec("speaker_identification", AnalysisKind::Inference, ResourceClass::Gpu),
    spec("language_detection", AnalysisKind::Inference, ResourceClass::Gpu),
];

const IMAGE: &[AnalysisSpec] = &[
    spec("object_detection", AnalysisKind::Inference, ResourceClass::Gpu),
    spec("face_detection", AnalysisKind::Inference, ResourceClass::Gpu),
    spec("ocr", AnalysisKind::Ocr, ResourceClass::Cpu),
];

const VIDEO: &[AnalysisSpec] = &[
    spec("object_detection", AnalysisKind::Inference, ResourceClass::Gpu),
    spec("face_detection", AnalysisKind::Inference, ResourceClass::Gpu),
    spec("scene_recognition", AnalysisKind::Inference, ResourceClass::Gpu),
    spec("ocr", AnalysisKind::Ocr, ResourceClass::Cpu),
];

const TEXT: &[AnalysisSpec] = &[
    spec("entity_extraction", AnalysisKind::Inference, ResourceClass::Gpu),
    spec("sentiment_analysis", AnalysisKind::Inference, ResourceClass::Cpu),
    spec("language_detection", AnalysisKind::Inference, ResourceClass::Cpu),
];

pub fn catalogue(modality: Modality) -> &'static [AnalysisSpec] {
    match modality {
        Modality::Audio => AUDIO,
        Modality::Image => IMAGE,
        Modality::Video => VIDEO,
        Modality::Text => TEXT,
    }
}

pub fn lookup(modality: Modality, analysis_type: &str) -> Option<&'static AnalysisSpec> {
    catalogue(modality).iter().find(|s| s.name == analysis_type)
}

pub fn available_types(modality: Modality) -> Vec<&'static str> {
    catalogue(modality).iter().map(|s| s.name).collect()
}

/// Options one analysis actually runs with. Also part of its cache key, so a
/// config change (model, threshold) never serves a stale result.
pub fn effective_options(
    config: &Config,
    modality: Modality,
    spec: &AnalysisSpec,
    request: &Map<String, Value>,
) -> Result<Value, ValidationError> {
    let invalid = |reason: String| ValidationError::InvalidOption {
        analysis_type: spec.name.to_string(),
        reason,
    };

    let sections = available_types(modality);
    let mut options: Map<String, Value> = request
        .iter()
        .filter(|(k, _)| !sections.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    match request.get(spec.name) {
        None => {}
        Some(Value::Object(overrides)) => {
            for (k, v) in overrides {
                options.insert(k.clone(), v.clone());
            }
        }
        Some(_) => return Err(invalid("per-type options must be an object".to_string())),
    }

    match spec.kind {
        AnalysisKind::Inference => {
            default_string(&mut options, "model_id", config.model_for(spec.name));
            require_string(&options, "model_id").map_err(invalid)?;
            default_threshold(&mut options, config.threshold_for(spec.name)).map_err(invalid)?;
        }
        AnalysisKind::Ocr => {
            default_string(&mut options, "language", ocr::DEFAULT_LANGUAGE.to_string());
            require_string(&options, "language").map_err(invalid)?;
            default_threshold(&mut options, config.threshold_for(spec.name)).map_err(invalid)?;
        }
        AnalysisKind::Transcription => {
            default_string(
                &mut options,
                "language_code",
                config.transcription.default_language_code.clone(),
            );
            require_string(&options, "language_code").map_err(invalid)?;
            let speakers = options
                .entry("max_speakers")
                .or_insert_with(|| Value::from(config.transcription.max_speakers));
            match speakers.as_u64() {
                Some(n) if (1..=u64::from(u32::MAX)).contains(&n) => {}
                _ => return Err(invalid("max_speakers must be a positive integer".to_string())),
            }
            for key in ["vocabulary_name", "media_uri"] {
                if let Some(v) = options.get(key) {
                    if !v.is_string() {
                        return Err(invalid(format!("{key} must be a string")));
                    }
                }
            }
        }
    }

    Ok(Value::Object(options))
}

fn default_string(options: &mut Map<String, Value>, key: &str, value: String) {
    options.entry(key).or_insert(Value::String(value));
}

fn require_string(options: &Map<String, Value>, key: &str) -> Result<(), String> {
    match options.get(key).and_then(Value::as_str) {
        Some(s) if !s.trim().is_empty() => Ok(()),
        _ => Err(format!("{key} must be a non-empty string")),
    }
}

fn default_threshold(options: &mut Map<String, Value>, threshold: f64) -> Result<(), String> {
    let value = options
        .entry("confidence_threshold")
        .or_insert_with(|| Value::from(threshold));
    match value.as_f64() {
        Some(t) if (0.0..=1.0).contains(&t) => Ok(()),
        _ => Err("confidence_threshold must be a number in [0, 1]".to_string()),
    }
}

/// Everything one analysis task needs, owned so it can move onto the runtime.
#[derive(Clone)]
pub struct AnalysisJob {
    pub spec: AnalysisSpec,
    pub options: Value,
    pub item: Arc<EvidenceItem>,
    pub bytes: Arc<Vec<u8>>,
    pub backends: Backends,
    pub transcription: TranscriptionConfig,
}

impl AnalysisJob {
    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(Value::as_str)
    }

    pub fn threshold(&self) -> f64 {
        self.options
            .get("confidence_threshold")
            .and_then(Value::as_f64)
            .unwrap_or(0.5)
    }
}

/// Task body for one analysis.
pub async fn run(job: AnalysisJob, ctx: TaskContext) -> TaskOutcome {
    match job.spec.kind {
        AnalysisKind::Inference => inference::run(job, ctx).await,
        AnalysisKind::Ocr => ocr::run(job, ctx).await,
        AnalysisKind::Transcription => transcription::run(job, ctx).await,
    }
}
