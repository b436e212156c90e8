//! # Resource-Bounded Executor
//!
//! Runs the analyses requested for one evidence item concurrently on the tokio
//! runtime, bounded by a worker pool and (when a device is configured) a GPU
//! fence of capacity one.
//!
//! - Every task gets its own timeout. A timed-out task frees its worker slot
//!   immediately; a GPU fence is only returned once the device call that owns
//!   it comes back, so the device is never oversubscribed.
//! - Task failures, panics and timeouts are captured as [`TaskError`] values and
//!   never reach sibling tasks.
//! - [`Executor::await_all`] applies the per-item ceiling. On expiry the item's
//!   [`CancelToken`] fires and every unfinished task is aborted.

pub mod cancel;
pub mod pool;

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::BackendError;
use crate::report::{AnalysisResult, FailureKind};

pub use cancel::CancelToken;
pub use pool::{ResourcePermit, ResourcePool};

pub type TaskId = u64;

pub type TaskOutcome = Result<AnalysisResult, TaskError>;

/// Runs in the task's own tokio task once it reaches a terminal state.
pub type CompletionHook = Box<dyn FnOnce(TaskId, &TaskOutcome) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceClass {
    /// Needs a worker slot for its compute.
    Cpu,
    /// Needs the GPU fence and a worker slot.
    Gpu,
    /// Mostly waits on a remote service; takes a slot only around each call.
    Network,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl TaskStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TaskStatus::Pending,
            1 => TaskStatus::Running,
            2 => TaskStatus::Succeeded,
            3 => TaskStatus::Failed,
            4 => TaskStatus::TimedOut,
            _ => TaskStatus::Cancelled,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }
}

#[derive(Debug, Clone, Error)]
pub enum TaskError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("timed out after {}s", .0.as_secs_f64())]
    TimedOut(Duration),
    #[error("cancelled")]
    Cancelled,
    #[error("panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    pub fn kind(&self) -> FailureKind {
        match self {
            TaskError::Backend(_) => FailureKind::Backend,
            TaskError::TimedOut(_) => FailureKind::Timeout,
            TaskError::Cancelled => FailureKind::Cancelled,
            TaskError::Panicked(_) => FailureKind::Panic,
        }
    }

    fn status(&self) -> TaskStatus {
        match self {
            TaskError::TimedOut(_) => TaskStatus::TimedOut,
            TaskError::Cancelled => TaskStatus::Cancelled,
            TaskError::Backend(_) | TaskError::Panicked(_) => TaskStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    Timeout,
    Cancelled,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::Timeout => f.write_str("timeout"),
            AbortReason::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Returned by [`Executor::await_all`] when the item could not finish.
#[derive(Debug, Error)]
#[error("aborted ({reason}) with {} unfinished task(s)", .unfinished.len())]
pub struct Aborted {
    pub reason: AbortReason,
    pub completed: BTreeMap<TaskId, TaskOutcome>,
    /// `(task id, analysis type)` of every task that was still running.
    pub unfinished: Vec<(TaskId, String)>,
}

#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub evidence_id: String,
    pub analysis_type: String,
    pub class: ResourceClass,
    pub timeout: Duration,
}

#[derive(Clone)]
struct StatusCell(Arc<AtomicU8>);

impl StatusCell {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(TaskStatus::Pending as u8)))
    }

    fn set(&self, status: TaskStatus) {
        self.0.store(status as u8, Ordering::SeqCst);
    }

    fn get(&self) -> TaskStatus {
        TaskStatus::from_u8(self.0.load(Ordering::SeqCst))
    }
}

pub struct TaskHandle {
    id: TaskId,
    analysis_type: String,
    status: StatusCell,
    join: JoinHandle<TaskOutcome>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn analysis_type(&self) -> &str {
        &self.analysis_type
    }

    pub fn status(&self) -> TaskStatus {
        self.status.get()
    }

    /// Wait for this task alone, with no deadline.
    pub async fn join(self) -> TaskOutcome {
        join_outcome(self.join).await
    }
}

struct Resources {
    workers: ResourcePool,
    gpu: Option<ResourcePool>,
}

/// Handed to each task body: its cancel token plus access to the shared pools.
#[derive(Clone)]
pub struct TaskContext {
    resources: Arc<Resources>,
    cancel: CancelToken,
    class: ResourceClass,
}

impl TaskContext {
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Fail fast if the task has been cancelled.
    pub fn checkpoint(&self) -> Result<(), TaskError> {
        if self.cancel.is_cancelled() {
            return Err(TaskError::Cancelled);
        }
        Ok(())
    }

    /// Run a blocking backend call under this task's resource class.
    ///
    /// The worker slot is held by the awaiting future, so a timeout that drops
    /// it frees the slot. The GPU fence moves into the blocking closure and is
    /// released only when the call itself returns. Calls that can be interrupted
    /// should watch [`TaskContext::cancel_token`], which fires as soon as the
    /// task times out or is aborted.
    pub async fn run_blocking<T, F>(&self, f: F) -> Result<T, TaskError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.checkpoint()?;
        let gpu = match (self.class, &self.resources.gpu) {
            (ResourceClass::Gpu, Some(pool)) => Some(pool.acquire(&self.cancel).await?),
            _ => None,
        };
        let slot = self.resources.workers.acquire(&self.cancel).await?;
        self.checkpoint()?;

        let call = tokio::task::spawn_blocking(move || {
            let _gpu = gpu;
            f()
        });
        let joined = call.await;
        drop(slot);
        joined.map_err(|err| {
            if err.is_panic() {
                TaskError::Panicked(panic_message(err.into_panic()))
            } else {
                TaskError::Cancelled
            }
        })
    }

    /// Await `fut` while holding a worker slot.
    pub async fn with_slot<Fut>(&self, fut: Fut) -> Result<Fut::Output, TaskError>
    where
        Fut: Future,
    {
        self.checkpoint()?;
        let _slot = self.resources.workers.acquire(&self.cancel).await?;
        self.checkpoint()?;
        Ok(fut.await)
    }

    /// Sleep without holding any slot; returns early on cancellation.
    pub async fn sleep(&self, duration: Duration) -> Result<(), TaskError> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.cancel.cancelled() => Err(TaskError::Cancelled),
        }
    }
}

/// Tears down a task body: aborts its future and fires its own cancel token so
/// a blocking call still running on its behalf can stop.
struct TaskGuard<T> {
    join: JoinHandle<T>,
    cancel: CancelToken,
}

impl<T> Drop for TaskGuard<T> {
    fn drop(&mut self) {
        self.join.abort();
        self.cancel.cancel();
    }
}

pub struct Executor {
    resources: Arc<Resources>,
    next_id: AtomicU64,
    gpu_fallback_warned: AtomicBool,
}

impl Executor {
    pub fn new(workers: usize, gpu_device: Option<&str>) -> Self {
        let workers = ResourcePool::new("workers", workers);
        let gpu = gpu_device.map(|_| ResourcePool::new("gpu", 1));
        info!(
            "executor workers={} gpu_device={}",
            workers.capacity(),
            gpu_device.unwrap_or("none")
        );
        Self {
            resources: Arc::new(Resources { workers, gpu }),
            next_id: AtomicU64::new(1),
            gpu_fallback_warned: AtomicBool::new(false),
        }
    }

    pub fn worker_capacity(&self) -> usize {
        self.resources.workers.capacity()
    }

    pub fn available_workers(&self) -> usize {
        self.resources.workers.available()
    }

    pub fn has_gpu(&self) -> bool {
        self.resources.gpu.is_some()
    }

    /// Start `body` as a task. Never blocks; must be called inside a tokio runtime.
    pub fn submit<F, Fut>(
        &self,
        spec: TaskSpec,
        cancel: &CancelToken,
        body: F,
        on_complete: Option<CompletionHook>,
    ) -> TaskHandle
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = TaskOutcome> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if spec.class == ResourceClass::Gpu
            && self.resources.gpu.is_none()
            && !self.gpu_fallback_warned.swap(true, Ordering::Relaxed)
        {
            warn!("no gpu_device configured; gpu analyses run on the cpu worker pool");
        }

        let task_cancel = cancel.child();
        let ctx = TaskContext {
            resources: self.resources.clone(),
            cancel: task_cancel.clone(),
            class: spec.class,
        };
        let status = StatusCell::new();
        let task_status = status.clone();
        let analysis_type = spec.analysis_type.clone();
        let timeout = spec.timeout;

        debug!(
            "submit task_id={id} evidence_id={} type={} class={:?} timeout_s={}",
            spec.evidence_id,
            spec.analysis_type,
            spec.class,
            timeout.as_secs_f64()
        );

        let join = tokio::spawn(async move {
            task_status.set(TaskStatus::Running);
            let mut inner = TaskGuard {
                join: tokio::spawn(body(ctx)),
                cancel: task_cancel,
            };
            let outcome = match tokio::time::timeout(timeout, &mut inner.join).await {
                Ok(joined) => flatten_join(joined),
                Err(_) => Err(TaskError::TimedOut(timeout)),
            };
            drop(inner);

            task_status.set(match &outcome {
                Ok(_) => TaskStatus::Succeeded,
                Err(err) => err.status(),
            });
            debug!(
                "task_id={id} evidence_id={} type={} status={:?}",
                spec.evidence_id,
                spec.analysis_type,
                task_status.get()
            );
            if let Some(hook) = on_complete {
                hook(id, &outcome);
            }
            outcome
        });

        TaskHandle {
            id,
            analysis_type,
            status,
            join,
        }
    }

    /// Collect every outcome, or abort whatever is unfinished at `deadline`
    /// or when `cancel` fires.
    ///
    /// Tasks that stopped because of the cancellation count as unfinished even
    /// when they returned on their own.
    pub async fn await_all(
        &self,
        handles: Vec<TaskHandle>,
        deadline: Instant,
        cancel: &CancelToken,
    ) -> Result<BTreeMap<TaskId, TaskOutcome>, Aborted> {
        let types: HashMap<TaskId, String> = handles
            .iter()
            .map(|h| (h.id, h.analysis_type.clone()))
            .collect();
        let mut completed = BTreeMap::new();
        let mut remaining = handles.into_iter();

        while let Some(mut handle) = remaining.next() {
            let reason = tokio::select! {
                joined = &mut handle.join => {
                    completed.insert(handle.id, flatten_join(joined));
                    continue;
                }
                _ = tokio::time::sleep_until(deadline) => AbortReason::Timeout,
                _ = cancel.cancelled() => AbortReason::Cancelled,
            };

            let rest: Vec<TaskHandle> = std::iter::once(handle).chain(remaining).collect();
            for handle in &rest {
                handle.join.abort();
            }
            cancel.cancel();
            // Wait for every aborted task to settle so no completion hook runs after we return.
            let mut unfinished = Vec::new();
            for handle in rest {
                match handle.join.await {
                    Ok(outcome) => {
                        completed.insert(handle.id, outcome);
                    }
                    Err(err) if err.is_panic() => {
                        completed.insert(
                            handle.id,
                            Err(TaskError::Panicked(panic_message(err.into_panic()))),
                        );
                    }
                    Err(_) => {
                        handle.status.set(TaskStatus::Cancelled);
                        unfinished.push((handle.id, handle.analysis_type));
                    }
                }
            }
            return Err(aborted(reason, completed, unfinished, &types));
        }

        if cancel.is_cancelled() {
            return Err(aborted(AbortReason::Cancelled, completed, Vec::new(), &types));
        }
        Ok(completed)
    }
}

fn aborted(
    reason: AbortReason,
    mut completed: BTreeMap<TaskId, TaskOutcome>,
    mut unfinished: Vec<(TaskId, String)>,
    types: &HashMap<TaskId, String>,
) -> Aborted {
    let cancelled: Vec<TaskId> = completed
        .iter()
        .filter(|(_, outcome)| matches!(outcome, Err(TaskError::Cancelled)))
        .map(|(id, _)| *id)
        .collect();
    for id in cancelled {
        completed.remove(&id);
        unfinished.push((id, types.get(&id).cloned().unwrap_or_default()));
    }
    unfinished.sort_by_key(|(id, _)| *id);
    warn!(
        "await_all aborted reason={reason} completed={} unfinished={}",
        completed.len(),
        unfinished.len()
    );
    Aborted {
        reason,
        completed,
        unfinished,
    }
}

async fn join_outcome(join: JoinHandle<TaskOutcome>) -> TaskOutcome {
    flatten_join(join.await)
}

fn flatten_join(joined: Result<TaskOutcome, tokio::task::JoinError>) -> TaskOutcome {
    match joined {
        Ok(outcome) => outcome,
        Err(err) if err.is_panic() => Err(TaskError::Panicked(panic_message(err.into_panic()))),
        Err(_) => Err(TaskError::Cancelled),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
