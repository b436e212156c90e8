//! # Input Validation
//!
//! Checks run before any evidence byte is hashed or analysed. Every failure
//! here is final for the request: ceilings are hard limits, not warnings.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::evidence::{Modality, extension_of};
use crate::probe::MediaInfo;

const MAX_EVIDENCE_ID_LEN: usize = 256;

/// Upper bound accepted for `max_file_bytes`. Evidence stays resident in memory
/// until its request completes.
pub const MAX_RESIDENT_BYTES: u64 = 4 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_audio_duration_seconds: f64,
    pub max_video_duration_seconds: f64,
    pub max_image_dimension: u32,
    pub max_text_bytes: u64,
    pub max_file_bytes: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_audio_duration_seconds: 14_400.0,
            max_video_duration_seconds: 14_400.0,
            max_image_dimension: 4096,
            max_text_bytes: 1_000_000,
            max_file_bytes: 2 * 1024 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("evidence id is empty")]
    EmptyEvidenceId,
    #[error("evidence id is invalid: {0}")]
    InvalidEvidenceId(String),
    #[error("file has no extension: {0}")]
    MissingExtension(String),
    #[error("unsupported {modality} format .{extension}; supported: {supported}")]
    UnsupportedFormat {
        modality: Modality,
        extension: String,
        supported: String,
    },
    #[error("no analysis types requested")]
    NoAnalysisTypes,
    #[error("analysis type {analysis_type} is not available for {modality} evidence")]
    UnsupportedAnalysis {
        modality: Modality,
        analysis_type: String,
    },
    #[error("{modality} duration {actual:.3}s exceeds limit of {limit}s")]
    DurationExceeded {
        modality: Modality,
        actual: f64,
        limit: f64,
    },
    #[error("image dimension {actual}px exceeds limit of {limit}px")]
    DimensionExceeded { actual: u32, limit: u32 },
    #[error("evidence size {actual} bytes exceeds limit of {limit} bytes")]
    SizeExceeded { actual: u64, limit: u64 },
    #[error("text evidence is not valid UTF-8")]
    InvalidEncoding,
    #[error("invalid option for {analysis_type}: {reason}")]
    InvalidOption {
        analysis_type: String,
        reason: String,
    },
}

/// A request whose identifiers, format and analysis list passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRequest {
    pub evidence_id: String,
    pub path: PathBuf,
    pub modality: Modality,
    pub analysis_types: Vec<String>,
}

/// Identifier, extension and analysis-type checks. Needs no file access.
///
/// Requested types are trimmed and de-duplicated; first occurrence wins the
/// position.
pub fn validate_request(
    modality: Modality,
    evidence_id: &str,
    path: &Path,
    requested: &[String],
    available: &[&str],
) -> Result<ValidatedRequest, ValidationError> {
    check_evidence_id(evidence_id)?;

    let extension = extension_of(path)
        .ok_or_else(|| ValidationError::MissingExtension(path.display().to_string()))?;
    if !modality.supported_extensions().contains(&extension.as_str()) {
        return Err(ValidationError::UnsupportedFormat {
            modality,
            extension,
            supported: modality.supported_extensions().join(", "),
        });
    }

    let mut analysis_types: Vec<String> = Vec::new();
    for requested_type in requested {
        let analysis_type = requested_type.trim();
        if analysis_type.is_empty() {
            continue;
        }
        if !available.contains(&analysis_type) {
            return Err(ValidationError::UnsupportedAnalysis {
                modality,
                analysis_type: analysis_type.to_string(),
            });
        }
        if !analysis_types.iter().any(|t| t == analysis_type) {
            analysis_types.push(analysis_type.to_string());
        }
    }
    if analysis_types.is_empty() {
        return Err(ValidationError::NoAnalysisTypes);
    }

    Ok(ValidatedRequest {
        evidence_id: evidence_id.to_string(),
        path: path.to_path_buf(),
        modality,
        analysis_types,
    })
}

fn check_evidence_id(evidence_id: &str) -> Result<(), ValidationError> {
    if evidence_id.trim().is_empty() {
        return Err(ValidationError::EmptyEvidenceId);
    }
    if evidence_id.len() > MAX_EVIDENCE_ID_LEN {
        return Err(ValidationError::InvalidEvidenceId(format!(
            "longer than {MAX_EVIDENCE_ID_LEN} bytes"
        )));
    }
    if evidence_id.chars().any(char::is_control) {
        return Err(ValidationError::InvalidEvidenceId(
            "contains control characters".to_string(),
        ));
    }
    Ok(())
}

/// Size, duration and dimension ceilings against probed media metadata.
///
/// Unknown durations (formats the probe cannot read) are bounded by the
/// byte ceiling only.
pub fn check_limits(
    limits: &Limits,
    modality: Modality,
    media: &MediaInfo,
) -> Result<(), ValidationError> {
    if media.byte_size > limits.max_file_bytes {
        return Err(ValidationError::SizeExceeded {
            actual: media.byte_size,
            limit: limits.max_file_bytes,
        });
    }

    match modality {
        Modality::Audio | Modality::Video => {
            let limit = if modality == Modality::Audio {
                limits.max_audio_duration_seconds
            } else {
                limits.max_video_duration_seconds
            };
            if let Some(actual) = media.duration_seconds {
                if actual > limit {
                    return Err(ValidationError::DurationExceeded {
                        modality,
                        actual,
                        limit,
                    });
                }
            }
        }
        Modality::Image => {
            let largest = media.width.unwrap_or(0).max(media.height.unwrap_or(0));
            if largest > limits.max_image_dimension {
                return Err(ValidationError::DimensionExceeded {
                    actual: largest,
                    limit: limits.max_image_dimension,
                });
            }
        }
        Modality::Text => {
            if media.byte_size > limits.max_text_bytes {
                return Err(ValidationError::SizeExceeded {
                    actual: media.byte_size,
                    limit: limits.max_text_bytes,
                });
            }
            if media.valid_utf8 == Some(false) {
                return Err(ValidationError::InvalidEncoding);
            }
        }
    }

    Ok(())
}
