//! Process adapter: every backend operation is one invocation of an external
//! program, with evidence bytes on stdin and a JSON document on stdout.
//!
//! ```text
//! <program> [args..] infer --model <id> --params <json>          < bytes   -> RawOutput
//! <program> [args..] ocr --language <lang> --config <json>       < bytes   -> OcrOutput
//! <program> [args..] transcribe-start --media-uri <uri> --params <json>    -> {"job_id": ..}
//! <program> [args..] transcribe-status --job <id>                          -> JobStatus
//! <program> [args..] transcribe-fetch --job <id>                           -> {"transcript_uri": ..}
//! <program> [args..] transcribe-delete --job <id>
//! ```

use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::backend::{
    BackendError, InferenceBackend, JobId, JobStatus, OcrBackend, OcrOutput, RawOutput,
    TranscriptionBackend, TranscriptionParams,
};
use crate::executor::CancelToken;

const EXIT_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct CommandBackend {
    program: PathBuf,
    args: Vec<String>,
}

#[derive(Deserialize)]
struct StartReply {
    job_id: String,
}

#[derive(Deserialize)]
struct FetchReply {
    transcript_uri: String,
}

impl CommandBackend {
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Run one subcommand to completion, or kill it once `cancel` fires.
    fn run_blocking(
        &self,
        subcommand: &[&str],
        stdin: &[u8],
        cancel: &CancelToken,
    ) -> Result<Vec<u8>, BackendError> {
        let op = subcommand[0];
        debug!("backend command program={} op={op}", self.program.display());
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .args(subcommand)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        // Pipes are drained on their own threads so a chatty child cannot
        // deadlock against a full pipe while we poll for its exit.
        if let Some(mut pipe) = child.stdin.take() {
            let input = stdin.to_vec();
            thread::spawn(move || {
                let _ = pipe.write_all(&input);
            });
        }
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if cancel.is_cancelled() => {
                    let _ = child.kill();
                    let _ = child.wait();
                    warn!(
                        "backend command killed program={} op={op} pid={}",
                        self.program.display(),
                        child.id()
                    );
                    return Err(BackendError::Failed(format!("{op} interrupted")));
                }
                Ok(None) => thread::sleep(EXIT_POLL),
                Err(e) => {
                    let _ = child.kill();
                    return Err(BackendError::Failed(format!("{op}: {e}")));
                }
            }
        };

        let output = Output {
            status,
            stdout: collect(stdout),
            stderr: collect(stderr),
        };
        check_output(op, output)
    }

    async fn run_async(&self, subcommand: &[&str]) -> Result<Vec<u8>, BackendError> {
        debug!("backend command program={} op={}", self.program.display(), subcommand[0]);
        let output = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .args(subcommand)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;
        check_output(subcommand[0], output)
    }

    fn spawn_error(&self, err: std::io::Error) -> BackendError {
        if err.kind() == ErrorKind::NotFound {
            BackendError::Unavailable(format!("{} not found", self.program.display()))
        } else {
            BackendError::Failed(format!("cannot start {}: {err}", self.program.display()))
        }
    }
}

fn drain(mut pipe: impl Read + Send + 'static) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn collect(reader: Option<thread::JoinHandle<Vec<u8>>>) -> Vec<u8> {
    reader.and_then(|r| r.join().ok()).unwrap_or_default()
}

fn check_output(op: &str, output: Output) -> Result<Vec<u8>, BackendError> {
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(BackendError::Failed(format!(
            "{op} exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(output.stdout)
}

fn parse<T: DeserializeOwned>(op: &str, stdout: &[u8]) -> Result<T, BackendError> {
    serde_json::from_slice(stdout).map_err(|e| BackendError::Malformed(format!("{op}: {e}")))
}

fn to_json(value: &impl serde::Serialize) -> Result<String, BackendError> {
    serde_json::to_string(value).map_err(|e| BackendError::Failed(e.to_string()))
}

impl InferenceBackend for CommandBackend {
    fn infer(
        &self,
        model_id: &str,
        input: &[u8],
        params: &Value,
        cancel: &CancelToken,
    ) -> Result<RawOutput, BackendError> {
        let params = to_json(params)?;
        let stdout = self.run_blocking(
            &["infer", "--model", model_id, "--params", &params],
            input,
            cancel,
        )?;
        parse("infer", &stdout)
    }
}

impl OcrBackend for CommandBackend {
    fn extract_text(
        &self,
        image: &[u8],
        language: &str,
        config: &Value,
        cancel: &CancelToken,
    ) -> Result<OcrOutput, BackendError> {
        let config = to_json(config)?;
        let stdout = self.run_blocking(
            &["ocr", "--language", language, "--config", &config],
            image,
            cancel,
        )?;
        parse("ocr", &stdout)
    }
}

#[async_trait]
impl TranscriptionBackend for CommandBackend {
    async fn start_job(
        &self,
        media_uri: &str,
        params: &TranscriptionParams,
    ) -> Result<JobId, BackendError> {
        let params = to_json(params)?;
        let stdout = self
            .run_async(&["transcribe-start", "--media-uri", media_uri, "--params", &params])
            .await?;
        let reply: StartReply = parse("transcribe-start", &stdout)?;
        Ok(JobId(reply.job_id))
    }

    async fn poll_status(&self, job: &JobId) -> Result<JobStatus, BackendError> {
        let stdout = self.run_async(&["transcribe-status", "--job", &job.0]).await?;
        parse("transcribe-status", &stdout)
    }

    async fn fetch_transcript(&self, job: &JobId) -> Result<String, BackendError> {
        let stdout = self.run_async(&["transcribe-fetch", "--job", &job.0]).await?;
        let reply: FetchReply = parse("transcribe-fetch", &stdout)?;
        Ok(reply.transcript_uri)
    }

    async fn delete_job(&self, job: &JobId) -> Result<(), BackendError> {
        self.run_async(&["transcribe-delete", "--job", &job.0]).await?;
        Ok(())
    }
}
