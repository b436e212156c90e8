use serde_json::json;

use crate::analysis::AnalysisJob;
use crate::backend::{BackendError, OcrOutput, TokenConfidence};
use crate::executor::{TaskContext, TaskOutcome};
use crate::report::AnalysisResult;

pub const DEFAULT_LANGUAGE: &str = "eng";

pub async fn run(job: AnalysisJob, ctx: TaskContext) -> TaskOutcome {
    let language = job.option_str("language").unwrap_or(DEFAULT_LANGUAGE).to_string();
    let config = job.options.get("config").cloned().unwrap_or_else(|| json!({}));
    let threshold = job.threshold();
    let backend = job.backends.ocr.clone();
    let bytes = job.bytes.clone();
    let call_language = language.clone();

    let cancel = ctx.cancel_token().clone();
    let output = ctx
        .run_blocking(move || backend.extract_text(&bytes, &call_language, &config, &cancel))
        .await??;
    Ok(summarize(job.spec.name, &language, output, threshold)?)
}

/// Mean token confidence becomes the result confidence; tokens under the
/// threshold are listed separately for review.
pub fn summarize(
    analysis_type: &str,
    language: &str,
    output: OcrOutput,
    threshold: f64,
) -> Result<AnalysisResult, BackendError> {
    for t in &output.token_confidences {
        if !t.confidence.is_finite() || !(0.0..=1.0).contains(&t.confidence) {
            return Err(BackendError::Malformed(format!(
                "token {:?} has confidence {} outside [0, 1]",
                t.token, t.confidence
            )));
        }
    }

    let confidence = if output.token_confidences.is_empty() {
        None
    } else {
        let sum: f64 = output.token_confidences.iter().map(|t| t.confidence).sum();
        Some((sum / output.token_confidences.len() as f64).clamp(0.0, 1.0))
    };
    let low: Vec<&TokenConfidence> = output
        .token_confidences
        .iter()
        .filter(|t| t.confidence < threshold)
        .collect();

    let word_count = output.text.split_whitespace().count();

    let payload = json!({
        "text": output.text,
        "language": language,
        "threshold": threshold,
        "token_confidences": output.token_confidences,
        "low_confidence_tokens": low,
        "word_count": word_count,
    });
    Ok(AnalysisResult::new(analysis_type, payload, confidence))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn text_of(result: &AnalysisResult) -> Option<&str> {
        result.payload.get("text").and_then(Value::as_str)
    }

    fn token(token: &str, confidence: f64) -> TokenConfidence {
        TokenConfidence {
            token: token.to_string(),
            confidence,
        }
    }

    #[test]
    fn mean_confidence_and_low_tokens() {
        let output = OcrOutput {
            text: "CASE 2291 sealed".to_string(),
            token_confidences: vec![token("CASE", 0.9), token("2291", 0.4), token("sealed", 0.8)],
        };
        let result = summarize("ocr", "eng", output, 0.5).expect("summary");
        let confidence = result.confidence.expect("confidence");
        assert!((confidence - 0.7).abs() < 1e-9);
        assert_eq!(text_of(&result), Some("CASE 2291 sealed"));
        assert_eq!(result.payload["low_confidence_tokens"][0]["token"], "2291");
        assert_eq!(result.payload["word_count"], 3);
    }

    #[test]
    fn no_tokens_means_no_confidence() {
        let result = summarize("ocr", "eng", OcrOutput::default(), 0.5).expect("summary");
        assert_eq!(result.confidence, None);
        assert_eq!(result.payload["text"], "");
    }

    #[test]
    fn percent_scale_confidences_are_rejected() {
        let output = OcrOutput {
            text: "x".to_string(),
            token_confidences: vec![token("x", 87.0)],
        };
        assert!(matches!(
            summarize("ocr", "eng", output, 0.5),
            Err(BackendError::Malformed(_))
        ));
    }
}
