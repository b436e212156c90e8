//! Interceptor chain wrapped around every analysis task.
//!
//! `before` hooks run in chain order and may answer the task outright (a cache
//! hit); `after` hooks run in reverse order for every interceptor whose
//! `before` ran. With the default chain this gives
//! custody → cache → execute → cache → custody.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};

use crate::cache::{CacheKey, ResultCache};
use crate::custody::CustodyScope;
use crate::executor::TaskOutcome;
use crate::report::AnalysisResult;

/// Where a task's outcome came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Executed,
    Cache,
}

/// Per-task state shared by the interceptors and the processor.
#[derive(Debug)]
pub struct TaskInfo {
    pub evidence_id: String,
    pub analysis_type: String,
    pub cache_key: Option<CacheKey>,
    reported: AtomicBool,
    cached: AtomicBool,
}

impl TaskInfo {
    pub fn new(evidence_id: &str, analysis_type: &str, cache_key: Option<CacheKey>) -> Self {
        Self {
            evidence_id: evidence_id.to_string(),
            analysis_type: analysis_type.to_string(),
            cache_key,
            reported: AtomicBool::new(false),
            cached: AtomicBool::new(false),
        }
    }

    pub fn operation(&self) -> String {
        format!("analysis:{}", self.analysis_type)
    }

    /// True for exactly one caller: whoever records the task's terminal event.
    pub fn claim_report(&self) -> bool {
        !self.reported.swap(true, Ordering::SeqCst)
    }

    pub fn mark_cached(&self) {
        self.cached.store(true, Ordering::SeqCst);
    }

    pub fn was_cached(&self) -> bool {
        self.cached.load(Ordering::SeqCst)
    }
}

pub trait TaskInterceptor: Send + Sync {
    /// Returning a result short-circuits the chain; the task is never executed.
    fn before(&self, _task: &TaskInfo) -> Option<AnalysisResult> {
        None
    }

    fn after(&self, _task: &TaskInfo, _outcome: &TaskOutcome, _source: Source) {}
}

#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn TaskInterceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, interceptor: Arc<dyn TaskInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Run `before` hooks. On a short-circuit returns the answering
    /// interceptor's position and its result.
    pub fn before(&self, task: &TaskInfo) -> Option<(usize, AnalysisResult)> {
        self.interceptors
            .iter()
            .enumerate()
            .find_map(|(i, icpt)| icpt.before(task).map(|r| (i, r)))
    }

    /// Run `after` hooks in reverse for the first `depth` interceptors.
    pub fn after(&self, task: &TaskInfo, outcome: &TaskOutcome, source: Source, depth: usize) {
        for icpt in self.interceptors[..depth.min(self.interceptors.len())].iter().rev() {
            icpt.after(task, outcome, source);
        }
    }
}

/// Records the single `analysis:<type>` custody event of each task.
pub struct CustodyInterceptor {
    custody: CustodyScope,
}

impl CustodyInterceptor {
    pub fn new(custody: CustodyScope) -> Self {
        Self { custody }
    }
}

impl TaskInterceptor for CustodyInterceptor {
    fn after(&self, task: &TaskInfo, outcome: &TaskOutcome, source: Source) {
        if !task.claim_report() {
            return;
        }
        match outcome {
            Ok(result) => {
                let mut detail = match source {
                    Source::Cache => "cache_hit".to_string(),
                    Source::Executed if task.was_cached() => "cache_update".to_string(),
                    Source::Executed => "executed".to_string(),
                };
                if let Some(confidence) = result.confidence {
                    detail.push_str(&format!(" confidence={confidence:.4}"));
                }
                self.custody
                    .success(&task.evidence_id, &task.operation(), Some(detail));
            }
            Err(err) => {
                let kind = serde_json::to_value(err.kind())
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string));
                self.custody
                    .failure(&task.evidence_id, &task.operation(), &err.to_string(), kind);
            }
        }
    }
}

/// Serves repeated analyses from the result cache and stores fresh results.
pub struct CacheInterceptor {
    cache: Arc<ResultCache>,
}

impl CacheInterceptor {
    pub fn new(cache: Arc<ResultCache>) -> Self {
        Self { cache }
    }
}

impl TaskInterceptor for CacheInterceptor {
    fn before(&self, task: &TaskInfo) -> Option<AnalysisResult> {
        let key = task.cache_key.as_ref()?;
        match self.cache.get(key) {
            Ok(Some(hit)) => {
                debug!(
                    "cache hit evidence_id={} type={} key={key}",
                    task.evidence_id, task.analysis_type
                );
                Some(hit)
            }
            Ok(None) => None,
            Err(err) => {
                warn!("cache lookup failed, recomputing type={}: {err}", task.analysis_type);
                None
            }
        }
    }

    fn after(&self, task: &TaskInfo, outcome: &TaskOutcome, source: Source) {
        let (Some(key), Ok(result), Source::Executed) = (&task.cache_key, outcome, source) else {
            return;
        };
        match self
            .cache
            .put(key.clone(), result.clone(), self.cache.default_ttl())
        {
            Ok(()) => task.mark_cached(),
            Err(err) => warn!("cache store failed type={}: {err}", task.analysis_type),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custody::CustodyRecorder;
    use crate::custody::memory::MemorySink;
    use crate::executor::TaskError;
    use serde_json::json;
    use std::time::Duration;

    fn setup() -> (InterceptorChain, Arc<CustodyRecorder>, crate::custody::memory::MemoryLog, Arc<ResultCache>) {
        let (sink, log) = MemorySink::new();
        let recorder = Arc::new(CustodyRecorder::new(Box::new(sink)));
        let cache = Arc::new(ResultCache::new(10, Duration::from_secs(60)));
        let chain = InterceptorChain::new()
            .with(Arc::new(CustodyInterceptor::new(recorder.scoped("ImageProcessor"))))
            .with(Arc::new(CacheInterceptor::new(cache.clone())));
        (chain, recorder, log, cache)
    }

    fn key() -> Option<CacheKey> {
        CacheKey::derive("ocr", "abc", &json!({"language": "eng"})).ok()
    }

    #[test]
    fn miss_then_hit() {
        let (chain, recorder, log, _cache) = setup();
        let first = TaskInfo::new("E1", "ocr", key());
        assert!(chain.before(&first).is_none());
        let outcome: TaskOutcome = Ok(AnalysisResult::new("ocr", json!({"text": "hi"}), Some(0.9)));
        chain.after(&first, &outcome, Source::Executed, chain.len());

        let second = TaskInfo::new("E1", "ocr", key());
        let (depth, hit) = chain.before(&second).expect("hit");
        assert_eq!(depth, 1);
        assert_eq!(hit.payload["text"], "hi");
        chain.after(&second, &Ok(hit), Source::Cache, depth);
        recorder.flush();

        let events = log.for_evidence("E1");
        assert_eq!(events.len(), 2);
        assert!(events[0].detail.as_deref().unwrap_or("").starts_with("cache_update"));
        assert!(events[1].detail.as_deref().unwrap_or("").starts_with("cache_hit"));
    }

    #[test]
    fn failures_are_recorded_once_and_not_cached() {
        let (chain, recorder, log, cache) = setup();
        let task = TaskInfo::new("E2", "ocr", key());
        let outcome: TaskOutcome = Err(TaskError::TimedOut(Duration::from_secs(5)));
        chain.after(&task, &outcome, Source::Executed, chain.len());
        chain.after(&task, &outcome, Source::Executed, chain.len());
        recorder.flush();

        let events = log.for_evidence("E2");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].operation, "analysis:ocr");
        assert_eq!(events[0].detail.as_deref(), Some("timeout"));
        assert!(cache.is_empty());
    }
}
