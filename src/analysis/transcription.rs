//! Remote transcription: start a job, poll it with exponential backoff, fetch
//! the transcript location, and always delete the job afterwards.
//!
//! The task holds a worker slot only for each individual service call, never
//! while sleeping between polls.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, warn};

use crate::analysis::AnalysisJob;
use crate::backend::{BackendError, JobId, JobStatus, TranscriptionBackend, TranscriptionParams};
use crate::config::TranscriptionConfig;
use crate::executor::{TaskContext, TaskError, TaskOutcome};
use crate::report::AnalysisResult;

/// Deletes the remote job when dropped, unless [`JobCleanup::finish`] already did.
struct JobCleanup {
    backend: Arc<dyn TranscriptionBackend>,
    job: Option<JobId>,
}

impl JobCleanup {
    fn new(backend: Arc<dyn TranscriptionBackend>, job: JobId) -> Self {
        Self {
            backend,
            job: Some(job),
        }
    }

    async fn finish(mut self) {
        if let Some(job) = self.job.take() {
            delete(self.backend.as_ref(), &job).await;
        }
    }
}

impl Drop for JobCleanup {
    fn drop(&mut self) {
        let Some(job) = self.job.take() else {
            return;
        };
        // The task was aborted or timed out mid-poll; finish cleanup off-task.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let backend = self.backend.clone();
                handle.spawn(async move { delete(backend.as_ref(), &job).await });
            }
            Err(_) => warn!("transcription job {job} not deleted: no runtime available"),
        }
    }
}

async fn delete(backend: &dyn TranscriptionBackend, job: &JobId) {
    match backend.delete_job(job).await {
        Ok(()) => debug!("transcription job deleted job_id={job}"),
        Err(err) => warn!("transcription job delete failed job_id={job}: {err}"),
    }
}

pub async fn run(job: AnalysisJob, ctx: TaskContext) -> TaskOutcome {
    let params = TranscriptionParams {
        language_code: job
            .option_str("language_code")
            .unwrap_or(&job.transcription.default_language_code)
            .to_string(),
        max_speakers: job
            .options
            .get("max_speakers")
            .and_then(|v| v.as_u64())
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(job.transcription.max_speakers),
        vocabulary_name: job.option_str("vocabulary_name").map(str::to_string),
    };
    let media_uri = job
        .option_str("media_uri")
        .map(str::to_string)
        .unwrap_or_else(|| job.item.media_uri());
    let backend = job.backends.transcription.clone();

    let job_id = ctx.with_slot(backend.start_job(&media_uri, &params)).await??;
    debug!(
        "transcription started evidence_id={} job_id={job_id}",
        job.item.evidence_id
    );
    let cleanup = JobCleanup::new(backend.clone(), job_id.clone());
    let outcome = collect(&ctx, &job, backend.as_ref(), &job_id, &params, &media_uri).await;
    cleanup.finish().await;
    outcome
}

async fn collect(
    ctx: &TaskContext,
    job: &AnalysisJob,
    backend: &dyn TranscriptionBackend,
    job_id: &JobId,
    params: &TranscriptionParams,
    media_uri: &str,
) -> TaskOutcome {
    let confidence = poll_until_done(ctx, backend, job_id, &job.transcription).await?;
    if let Some(c) = confidence {
        if !c.is_finite() || !(0.0..=1.0).contains(&c) {
            return Err(BackendError::Malformed(format!(
                "transcription confidence {c} outside [0, 1]"
            ))
            .into());
        }
    }
    ctx.checkpoint()?;
    let transcript_uri = ctx.with_slot(backend.fetch_transcript(job_id)).await??;
    let payload = json!({
        "job_id": job_id.0,
        "job_status": JobStatus::Completed { confidence }.as_str(),
        "transcript_uri": transcript_uri,
        "media_uri": media_uri,
        "language_code": params.language_code,
        "max_speakers": params.max_speakers,
        "vocabulary_name": params.vocabulary_name,
    });
    Ok(AnalysisResult::new(job.spec.name, payload, confidence))
}

/// Poll until the job leaves `IN_PROGRESS`, returning the service's confidence.
async fn poll_until_done(
    ctx: &TaskContext,
    backend: &dyn TranscriptionBackend,
    job: &JobId,
    cfg: &TranscriptionConfig,
) -> Result<Option<f64>, TaskError> {
    let max_delay = Duration::from_millis(cfg.poll_max_ms.max(cfg.poll_initial_ms));
    let mut delay = Duration::from_millis(cfg.poll_initial_ms);

    for attempt in 1..=cfg.poll_max_attempts.max(1) {
        let status = ctx.with_slot(backend.poll_status(job)).await??;
        match status {
            JobStatus::Completed { confidence } => return Ok(confidence),
            JobStatus::Failed { reason } => {
                return Err(BackendError::Failed(format!("transcription job {job} failed: {reason}")).into());
            }
            JobStatus::InProgress => {
                debug!("transcription pending job_id={job} attempt={attempt} next_poll_ms={}", delay.as_millis());
                ctx.sleep(delay).await?;
                delay = (delay * 2).min(max_delay);
            }
        }
    }

    Err(BackendError::Failed(format!(
        "transcription job {job} still in progress after {} polls",
        cfg.poll_max_attempts
    ))
    .into())
}
