//! # Chain of Custody
//!
//! Append-only audit trail for every operation performed on an evidence item.
//!
//! Events are stamped with a per-evidence sequence number at issuance and handed
//! to a single writer thread, so the persisted order for one evidence id always
//! equals the order in which operations happened. Recording never fails the
//! caller: persistence problems are counted, logged on the `evidentia::infra`
//! target and published on a separate alert channel.

pub mod csv;
pub mod jsonl;
pub mod memory;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

const ALERT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CustodyStatus {
    Success,
    Error,
}

impl CustodyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CustodyStatus::Success => "success",
            CustodyStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustodyEvent {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub evidence_id: String,
    pub operation: String,
    pub actor: String,
    pub status: CustodyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CustodyBackendKind {
    Jsonl,
    Csv,
}

#[derive(Debug, Error)]
pub enum CustodyError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] ::csv::Error),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("other error: {0}")]
    Other(String),
}

/// Persistent store for custody events. Implementations only append.
pub trait CustodySink: Send + Sync {
    fn append(&self, event: &CustodyEvent) -> Result<(), CustodyError>;
    fn flush(&self) -> Result<(), CustodyError>;
}

/// Raised when the audit trail itself could not be persisted.
#[derive(Debug, Clone)]
pub struct InfraAlert {
    pub at: DateTime<Utc>,
    pub evidence_id: String,
    pub operation: String,
    pub error: String,
}

enum CustodyMessage {
    Event(CustodyEvent),
    Flush(Sender<()>),
}

pub struct CustodyRecorder {
    tx: Mutex<Option<Sender<CustodyMessage>>>,
    sequences: Mutex<HashMap<String, u64>>,
    failures: Arc<AtomicU64>,
    alert_rx: Receiver<InfraAlert>,
    alert_tx: Sender<InfraAlert>,
    writer: Mutex<Option<thread::JoinHandle<()>>>,
}

impl CustodyRecorder {
    pub fn new(sink: Box<dyn CustodySink>) -> Self {
        let (tx, rx) = unbounded::<CustodyMessage>();
        let (alert_tx, alert_rx) = bounded::<InfraAlert>(ALERT_CAPACITY);
        let failures = Arc::new(AtomicU64::new(0));
        let writer = spawn_custody_writer(sink, rx, failures.clone(), alert_tx.clone());
        Self {
            tx: Mutex::new(Some(tx)),
            sequences: Mutex::new(HashMap::new()),
            failures,
            alert_rx,
            alert_tx,
            writer: Mutex::new(Some(writer)),
        }
    }

    pub fn record(
        &self,
        evidence_id: &str,
        operation: &str,
        actor: &str,
        status: CustodyStatus,
        error: Option<String>,
        detail: Option<String>,
    ) {
        let mut sequences = self
            .sequences
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let next = sequences.entry(evidence_id.to_string()).or_insert(0);
        *next += 1;
        let event = CustodyEvent {
            sequence: *next,
            timestamp: Utc::now(),
            evidence_id: evidence_id.to_string(),
            operation: operation.to_string(),
            actor: actor.to_string(),
            status,
            error,
            detail,
        };
        debug!(
            "custody evidence_id={} seq={} op={} status={}",
            event.evidence_id,
            event.sequence,
            event.operation,
            event.status.as_str()
        );

        // Sent while the sequence lock is held so channel order matches sequence order.
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let lost = match tx.as_ref() {
            Some(tx) => match tx.send(CustodyMessage::Event(event)) {
                Ok(()) => None,
                Err(err) => match err.0 {
                    CustodyMessage::Event(event) => Some(event),
                    CustodyMessage::Flush(_) => None,
                },
            },
            None => Some(event),
        };
        if let Some(event) = lost {
            self.report_failure(&event, "custody recorder is shut down");
        }
    }

    /// Scope that stamps every event with a fixed actor.
    pub fn scoped(self: &Arc<Self>, actor: &str) -> CustodyScope {
        CustodyScope {
            recorder: Arc::clone(self),
            actor: actor.to_string(),
        }
    }

    /// Block until every event issued before this call has reached the sink.
    pub fn flush(&self) {
        let (ack_tx, ack_rx) = bounded::<()>(1);
        let sent = {
            let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
            tx.as_ref()
                .map(|tx| tx.send(CustodyMessage::Flush(ack_tx)).is_ok())
                .unwrap_or(false)
        };
        if sent {
            let _ = ack_rx.recv();
        }
    }

    /// Drain outstanding events and stop the writer thread.
    pub fn shutdown(&self) {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        drop(tx);
        let handle = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(target: "evidentia::infra", "custody writer thread panicked");
            }
        }
    }

    /// Number of events or flushes that failed to persist.
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Infrastructure alert channel for persistence failures.
    pub fn alerts(&self) -> Receiver<InfraAlert> {
        self.alert_rx.clone()
    }

    fn report_failure(&self, event: &CustodyEvent, reason: &str) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        error!(
            target: "evidentia::infra",
            "custody event lost evidence_id={} op={} seq={}: {reason}",
            event.evidence_id, event.operation, event.sequence
        );
        let _ = self.alert_tx.try_send(InfraAlert {
            at: Utc::now(),
            evidence_id: event.evidence_id.clone(),
            operation: event.operation.clone(),
            error: reason.to_string(),
        });
    }
}

impl Drop for CustodyRecorder {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Custody handle bound to one actor (a processor or the CLI).
#[derive(Clone)]
pub struct CustodyScope {
    recorder: Arc<CustodyRecorder>,
    actor: String,
}

impl CustodyScope {
    pub fn success(&self, evidence_id: &str, operation: &str, detail: Option<String>) {
        self.recorder.record(
            evidence_id,
            operation,
            &self.actor,
            CustodyStatus::Success,
            None,
            detail,
        );
    }

    pub fn failure(&self, evidence_id: &str, operation: &str, error: &str, detail: Option<String>) {
        self.recorder.record(
            evidence_id,
            operation,
            &self.actor,
            CustodyStatus::Error,
            Some(error.to_string()),
            detail,
        );
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }
}

fn spawn_custody_writer(
    sink: Box<dyn CustodySink>,
    rx: Receiver<CustodyMessage>,
    failures: Arc<AtomicU64>,
    alert_tx: Sender<InfraAlert>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let alert = |evidence_id: &str, operation: &str, err: &CustodyError| {
            failures.fetch_add(1, Ordering::Relaxed);
            error!(
                target: "evidentia::infra",
                "custody persistence error evidence_id={evidence_id} op={operation}: {err}"
            );
            let _ = alert_tx.try_send(InfraAlert {
                at: Utc::now(),
                evidence_id: evidence_id.to_string(),
                operation: operation.to_string(),
                error: err.to_string(),
            });
        };

        for message in rx {
            match message {
                CustodyMessage::Event(event) => {
                    if let Err(err) = sink.append(&event) {
                        alert(&event.evidence_id, &event.operation, &err);
                    }
                }
                CustodyMessage::Flush(ack) => {
                    if let Err(err) = sink.flush() {
                        alert("", "flush", &err);
                    }
                    let _ = ack.send(());
                }
            }
        }
        if let Err(err) = sink.flush() {
            alert("", "flush", &err);
        }
    })
}

pub fn build_sink(
    backend: CustodyBackendKind,
    run_id: &str,
    tool_version: &str,
    config_hash: &str,
    output_dir: &Path,
) -> Result<Box<dyn CustodySink>, CustodyError> {
    match backend {
        CustodyBackendKind::Jsonl => Ok(Box::new(jsonl::JsonlCustodySink::new(
            run_id,
            tool_version,
            config_hash,
            output_dir,
        )?)),
        CustodyBackendKind::Csv => Ok(Box::new(csv::CsvCustodySink::new(
            run_id,
            tool_version,
            config_hash,
            output_dir,
        )?)),
    }
}
