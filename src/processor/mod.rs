//! # Evidence Processor
//!
//! Drives one evidence item through
//! `RECEIVED → VALIDATED → HASHED → DISPATCHED → AGGREGATING → COMPLETE`.
//! Each transition records exactly one custody event (`validate`, `hash`,
//! `dispatch`, `collect`, `complete`); each analysis records one more,
//! `analysis:<type>`, through the interceptor chain.

pub mod middleware;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::analysis::{self, AnalysisJob, AnalysisSpec};
use crate::cache::CacheKey;
use crate::context::EngineContext;
use crate::custody::CustodyScope;
use crate::evidence::{
    EvidenceError, EvidenceItem, IntegrityError, LoadedEvidence, Modality, RawFileSource,
    load_and_digest,
};
use crate::executor::{
    AbortReason, CancelToken, CompletionHook, TaskHandle, TaskId, TaskOutcome, TaskSpec,
};
use crate::probe::{MediaInfo, probe};
use crate::report::{AnalysisFailure, AnalysisResult, Report, ReportMetadata};
use crate::validate::{ValidationError, check_limits, validate_request};

use middleware::{CacheInterceptor, CustodyInterceptor, InterceptorChain, Source, TaskInfo};

/// One request against one evidence file.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRequest {
    pub evidence_id: String,
    pub path: PathBuf,
    pub analysis_types: Vec<String>,
    /// Options shared by every type, plus optional per-type objects keyed by
    /// analysis type name.
    pub options: Map<String, Value>,
    /// Digest supplied by the submitter; checked right after hashing.
    pub expected_sha256: Option<String>,
}

impl AnalysisRequest {
    pub fn new(evidence_id: &str, path: impl Into<PathBuf>, analysis_types: &[&str]) -> Self {
        Self {
            evidence_id: evidence_id.to_string(),
            path: path.into(),
            analysis_types: analysis_types.iter().map(|t| t.to_string()).collect(),
            options: Map::new(),
            expected_sha256: None,
        }
    }

    pub fn with_options(mut self, options: Map<String, Value>) -> Self {
        self.options = options;
        self
    }

    pub fn with_expected_sha256(mut self, digest: &str) -> Self {
        self.expected_sha256 = Some(digest.to_string());
        self
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
    #[error(
        "evidence {evidence_id} aborted ({reason}); unfinished: {}",
        .unfinished.join(", ")
    )]
    Aborted {
        evidence_id: String,
        reason: AbortReason,
        /// Types that had finished (successfully or not) before the abort.
        finished: Vec<String>,
        unfinished: Vec<String>,
    },
    #[error("evidence {0} cancelled before dispatch")]
    Cancelled(String),
}

struct Planned {
    spec: &'static AnalysisSpec,
    options: Value,
}

struct Validated {
    source: RawFileSource,
    media: MediaInfo,
    plan: Vec<Planned>,
}

struct Dispatched {
    handles: Vec<TaskHandle>,
    tasks: HashMap<TaskId, Arc<TaskInfo>>,
    cache_hits: Vec<AnalysisResult>,
}

/// The generic engine behind the audio, image, video and text processors.
pub struct EvidenceProcessor {
    modality: Modality,
    ctx: Arc<EngineContext>,
    custody: CustodyScope,
    chain: InterceptorChain,
}

impl EvidenceProcessor {
    pub fn new(ctx: Arc<EngineContext>, modality: Modality) -> Self {
        let actor = format!(
            "{}:{}",
            ctx.config.custody.actor,
            modality.processor_name()
        );
        let custody = ctx.custody.scoped(&actor);
        let chain = InterceptorChain::new()
            .with(Arc::new(CustodyInterceptor::new(custody.clone())))
            .with(Arc::new(CacheInterceptor::new(ctx.cache.clone())));
        Self {
            modality,
            ctx,
            custody,
            chain,
        }
    }

    pub fn modality(&self) -> Modality {
        self.modality
    }

    pub fn available_types(&self) -> Vec<&'static str> {
        analysis::available_types(self.modality)
    }

    pub async fn process(&self, request: AnalysisRequest) -> Result<Report, ProcessError> {
        let started = std::time::Instant::now();
        let deadline = tokio::time::Instant::now() + self.ctx.config.overall_timeout();
        let cancel = self.ctx.shutdown_token().child();
        let id = request.evidence_id.as_str();
        info!(
            "process evidence_id={id} modality={} path={} types={}",
            self.modality,
            request.path.display(),
            request.analysis_types.join(",")
        );

        // RECEIVED -> VALIDATED
        let validated = match self.validate(&request) {
            Ok(v) => {
                let types: Vec<&str> = v.plan.iter().map(|p| p.spec.name).collect();
                self.custody
                    .success(id, "validate", Some(format!("types={}", types.join(","))));
                v
            }
            Err(err) => {
                warn!("validation failed evidence_id={id}: {err}");
                self.custody.failure(id, "validate", &err.to_string(), None);
                return Err(err);
            }
        };
        let Validated {
            source,
            media,
            plan,
        } = validated;

        // VALIDATED -> HASHED
        let (item, bytes) = match self.hash(&request, source, media, &cancel).await {
            Ok((item, bytes)) => {
                self.custody.success(
                    id,
                    "hash",
                    Some(format!(
                        "sha256={} md5={} size_bytes={}",
                        item.sha256, item.md5, item.size_bytes
                    )),
                );
                (Arc::new(item), bytes)
            }
            Err(err) => {
                warn!("hashing failed evidence_id={id}: {err}");
                self.custody.failure(id, "hash", &err.to_string(), None);
                return Err(err);
            }
        };

        // HASHED -> DISPATCHED
        let planned: Vec<&str> = plan.iter().map(|p| p.spec.name).collect();
        self.custody
            .success(id, "dispatch", Some(format!("types={}", planned.join(","))));
        let dispatched = self.dispatch(&item, &bytes, plan, &cancel);

        // DISPATCHED -> AGGREGATING
        let submitted = dispatched.handles.len();
        let outcomes = match self
            .ctx
            .executor
            .await_all(dispatched.handles, deadline, &cancel)
            .await
        {
            Ok(outcomes) => outcomes,
            Err(aborted) => {
                let mut unfinished = Vec::with_capacity(aborted.unfinished.len());
                for (task_id, analysis_type) in &aborted.unfinished {
                    if let Some(task) = dispatched.tasks.get(task_id) {
                        if task.claim_report() {
                            self.custody.failure(
                                id,
                                &task.operation(),
                                "cancelled",
                                Some(aborted.reason.to_string()),
                            );
                        }
                    }
                    unfinished.push(analysis_type.clone());
                }
                let mut finished: Vec<String> = dispatched
                    .cache_hits
                    .iter()
                    .map(|r| r.analysis_type.clone())
                    .collect();
                finished.extend(
                    aborted
                        .completed
                        .keys()
                        .filter_map(|task_id| dispatched.tasks.get(task_id))
                        .map(|t| t.analysis_type.clone()),
                );
                warn!(
                    "evidence_id={id} aborted reason={} unfinished={}",
                    aborted.reason,
                    unfinished.join(",")
                );
                self.custody.failure(
                    id,
                    "collect",
                    &aborted.reason.to_string(),
                    Some(format!("unfinished={}", unfinished.join(","))),
                );
                return Err(ProcessError::Aborted {
                    evidence_id: id.to_string(),
                    reason: aborted.reason,
                    finished,
                    unfinished,
                });
            }
        };

        let cache_hits = dispatched.cache_hits.len() as u32;
        let mut results: BTreeMap<String, AnalysisResult> = dispatched
            .cache_hits
            .into_iter()
            .map(|r| (r.analysis_type.clone(), r))
            .collect();
        let mut errors = BTreeMap::new();
        for (task_id, outcome) in outcomes {
            let Some(task) = dispatched.tasks.get(&task_id) else {
                continue;
            };
            match outcome {
                Ok(result) => {
                    results.insert(task.analysis_type.clone(), result);
                }
                Err(err) => {
                    errors.insert(
                        task.analysis_type.clone(),
                        AnalysisFailure {
                            kind: err.kind(),
                            message: err.to_string(),
                        },
                    );
                }
            }
        }
        self.custody.success(
            id,
            "collect",
            Some(format!(
                "submitted={submitted} cache_hits={cache_hits} succeeded={} failed={}",
                results.len(),
                errors.len()
            )),
        );

        // AGGREGATING -> COMPLETE
        if self.ctx.config.verify_on_complete {
            if let Err(err) = self.verify(&item).await {
                warn!("re-verification failed evidence_id={id}: {err}");
                self.custody.failure(id, "complete", &err.to_string(), None);
                return Err(err.into());
            }
        }

        let report = Report {
            evidence_id: id.to_string(),
            modality: self.modality,
            metadata: ReportMetadata {
                processed_at: Utc::now(),
                processing_duration_seconds: started.elapsed().as_secs_f64(),
                file_hash: item.sha256.clone(),
                md5: item.md5.clone(),
                size_bytes: item.size_bytes,
                duration: item.media.duration_seconds,
                width: item.media.width,
                height: item.media.height,
                cache_hits,
                tool_version: env!("CARGO_PKG_VERSION").to_string(),
                config_hash: self.ctx.config_hash.clone(),
            },
            results,
            errors,
        };
        self.custody.success(
            id,
            "complete",
            Some(format!(
                "results={} errors={}",
                report.results.len(),
                report.errors.len()
            )),
        );
        info!(
            "complete evidence_id={id} results={} errors={} cache_hits={cache_hits} duration_s={:.3}",
            report.results.len(),
            report.errors.len(),
            report.metadata.processing_duration_seconds
        );
        Ok(report)
    }

    fn validate(&self, request: &AnalysisRequest) -> Result<Validated, ProcessError> {
        let available = self.available_types();
        let checked = validate_request(
            self.modality,
            &request.evidence_id,
            &request.path,
            &request.analysis_types,
            &available,
        )?;

        let unreadable = |source: EvidenceError| IntegrityError::Unreadable {
            path: request.path.display().to_string(),
            source,
        };
        let source = RawFileSource::open(&request.path).map_err(unreadable)?;
        let media = probe(self.modality, &source).map_err(unreadable)?;
        check_limits(&self.ctx.config.limits, self.modality, &media)?;

        let mut plan = Vec::with_capacity(checked.analysis_types.len());
        for analysis_type in &checked.analysis_types {
            let spec = analysis::lookup(self.modality, analysis_type).ok_or_else(|| {
                ValidationError::UnsupportedAnalysis {
                    modality: self.modality,
                    analysis_type: analysis_type.clone(),
                }
            })?;
            let options =
                analysis::effective_options(&self.ctx.config, self.modality, spec, &request.options)?;
            plan.push(Planned { spec, options });
        }

        Ok(Validated {
            source,
            media,
            plan,
        })
    }

    async fn hash(
        &self,
        request: &AnalysisRequest,
        source: RawFileSource,
        media: MediaInfo,
        cancel: &CancelToken,
    ) -> Result<(EvidenceItem, Arc<Vec<u8>>), ProcessError> {
        if cancel.is_cancelled() {
            return Err(ProcessError::Cancelled(request.evidence_id.clone()));
        }
        let unreadable = |source: EvidenceError| IntegrityError::Unreadable {
            path: request.path.display().to_string(),
            source,
        };
        let block_size = self.ctx.config.hash_block_size;
        let loaded: LoadedEvidence =
            tokio::task::spawn_blocking(move || load_and_digest(&source, block_size))
                .await
                .map_err(|err| unreadable(EvidenceError::Io(std::io::Error::other(err))))?
                .map_err(unreadable)?;

        let item = EvidenceItem::new(
            &request.evidence_id,
            &request.path,
            self.modality,
            loaded.digests,
            media,
        );
        if let Some(expected) = &request.expected_sha256 {
            item.expect_sha256(expected)?;
        }
        debug!(
            "hashed evidence_id={} sha256={} bytes={}",
            item.evidence_id, item.sha256, item.size_bytes
        );
        Ok((item, loaded.bytes))
    }

    fn dispatch(
        &self,
        item: &Arc<EvidenceItem>,
        bytes: &Arc<Vec<u8>>,
        plan: Vec<Planned>,
        cancel: &CancelToken,
    ) -> Dispatched {
        let mut dispatched = Dispatched {
            handles: Vec::with_capacity(plan.len()),
            tasks: HashMap::with_capacity(plan.len()),
            cache_hits: Vec::new(),
        };

        for Planned { spec, options } in plan {
            let cache_key = match CacheKey::derive(spec.name, &item.sha256, &options) {
                Ok(key) => Some(key),
                Err(err) => {
                    warn!("cache key unavailable type={}: {err}", spec.name);
                    None
                }
            };
            let task = Arc::new(TaskInfo::new(&item.evidence_id, spec.name, cache_key));

            if let Some((depth, hit)) = self.chain.before(&task) {
                let outcome: TaskOutcome = Ok(hit);
                self.chain.after(&task, &outcome, Source::Cache, depth);
                if let Ok(hit) = outcome {
                    dispatched.cache_hits.push(hit);
                }
                continue;
            }

            let job = AnalysisJob {
                spec: *spec,
                options,
                item: item.clone(),
                bytes: bytes.clone(),
                backends: self.ctx.backends.clone(),
                transcription: self.ctx.config.transcription.clone(),
            };
            let chain = self.chain.clone();
            let hook_task = task.clone();
            let hook: CompletionHook = Box::new(move |_: TaskId, outcome: &TaskOutcome| {
                chain.after(&hook_task, outcome, Source::Executed, chain.len());
            });
            let handle = self.ctx.executor.submit(
                TaskSpec {
                    evidence_id: item.evidence_id.clone(),
                    analysis_type: spec.name.to_string(),
                    class: spec.class,
                    timeout: self.ctx.config.per_task_timeout(),
                },
                cancel,
                move |ctx| analysis::run(job, ctx),
                Some(hook),
            );
            dispatched.tasks.insert(handle.id(), task);
            dispatched.handles.push(handle);
        }

        debug!(
            "dispatched evidence_id={} submitted={} cache_hits={}",
            item.evidence_id,
            dispatched.handles.len(),
            dispatched.cache_hits.len()
        );
        dispatched
    }

    async fn verify(&self, item: &Arc<EvidenceItem>) -> Result<(), IntegrityError> {
        let item = item.clone();
        let block_size = self.ctx.config.hash_block_size;
        let path = item.path.display().to_string();
        tokio::task::spawn_blocking(move || item.verify(block_size))
            .await
            .map_err(|err| IntegrityError::Unreadable {
                path,
                source: EvidenceError::Io(std::io::Error::other(err)),
            })?
    }
}
