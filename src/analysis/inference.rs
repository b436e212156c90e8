use serde_json::{Value, json};

use crate::analysis::AnalysisJob;
use crate::backend::{BackendError, LabelScore, RawOutput};
use crate::executor::{TaskContext, TaskOutcome};
use crate::report::AnalysisResult;

pub async fn run(job: AnalysisJob, ctx: TaskContext) -> TaskOutcome {
    let model_id = job.option_str("model_id").unwrap_or(job.spec.name).to_string();
    let threshold = job.threshold();
    let backend = job.backends.inference.clone();
    let bytes = job.bytes.clone();
    let params = job.options.clone();
    let call_model = model_id.clone();

    let cancel = ctx.cancel_token().clone();
    let raw = ctx
        .run_blocking(move || backend.infer(&call_model, &bytes, &params, &cancel))
        .await??;
    Ok(summarize(job.spec.name, &model_id, raw, threshold)?)
}

/// Range-check, rank and split raw scores.
///
/// `scores` keeps every raw score (highest first); `detected` holds those at or
/// above `threshold`. The result confidence is the best raw score.
pub fn summarize(
    analysis_type: &str,
    model_id: &str,
    raw: RawOutput,
    threshold: f64,
) -> Result<AnalysisResult, BackendError> {
    let mut scores = raw.scores;
    for s in &scores {
        if !s.score.is_finite() || !(0.0..=1.0).contains(&s.score) {
            return Err(BackendError::Malformed(format!(
                "{model_id} returned score {} for {:?} outside [0, 1]",
                s.score, s.label
            )));
        }
    }
    scores.sort_by(|a, b| b.score.total_cmp(&a.score));

    let detected: Vec<&LabelScore> = scores.iter().filter(|s| s.score >= threshold).collect();
    let confidence = scores.first().map(|s| s.score);
    let top_label = detected.first().map(|s| Value::String(s.label.clone()));

    let mut payload = json!({
        "model_id": model_id,
        "threshold": threshold,
        "detected": detected,
        "scores": scores,
        "top_label": top_label,
    });
    if let Some(embedding) = raw.embedding {
        payload["embedding"] = json!(embedding);
    }

    Ok(AnalysisResult::new(analysis_type, payload, confidence))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(scores: &[(&str, f64)]) -> RawOutput {
        RawOutput {
            scores: scores.iter().map(|(l, s)| LabelScore::new(l, *s)).collect(),
            embedding: None,
        }
    }

    #[test]
    fn splits_detected_from_raw_scores() {
        let result = summarize(
            "object_detection",
            "yolov5",
            raw(&[("dog", 0.3), ("car", 0.91), ("person", 0.5)]),
            0.5,
        )
        .expect("summary");
        let detected: Vec<&str> = result.payload["detected"]
            .as_array()
            .expect("array")
            .iter()
            .filter_map(|d| d["label"].as_str())
            .collect();
        assert_eq!(detected, vec!["car", "person"]);
        assert_eq!(result.payload["scores"].as_array().map(Vec::len), Some(3));
        assert_eq!(result.payload["scores"][2]["label"], "dog");
        assert_eq!(result.payload["top_label"], "car");
        assert_eq!(result.confidence, Some(0.91));
    }

    #[test]
    fn empty_output_has_no_confidence() {
        let result = summarize("face_detection", "face_detect", raw(&[]), 0.5).expect("summary");
        assert_eq!(result.confidence, None);
        assert_eq!(result.payload["top_label"], Value::Null);
    }

    #[test]
    fn out_of_range_scores_are_malformed() {
        for bad in [1.5, -0.1, f64::NAN] {
            assert!(matches!(
                summarize("object_detection", "yolov5", raw(&[("car", bad)]), 0.5),
                Err(BackendError::Malformed(_))
            ));
        }
    }
}
