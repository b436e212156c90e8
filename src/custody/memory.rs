use std::sync::{Arc, Mutex, PoisonError};

use crate::custody::{CustodyError, CustodyEvent, CustodySink};

/// In-process sink. The paired [`MemoryLog`] reads back what was appended.
pub struct MemorySink {
    events: Arc<Mutex<Vec<CustodyEvent>>>,
}

#[derive(Clone)]
pub struct MemoryLog {
    events: Arc<Mutex<Vec<CustodyEvent>>>,
}

impl MemorySink {
    pub fn new() -> (Self, MemoryLog) {
        let events = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                events: events.clone(),
            },
            MemoryLog { events },
        )
    }
}

impl CustodySink for MemorySink {
    fn append(&self, event: &CustodyEvent) -> Result<(), CustodyError> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }

    fn flush(&self) -> Result<(), CustodyError> {
        Ok(())
    }
}

impl MemoryLog {
    pub fn events(&self) -> Vec<CustodyEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn for_evidence(&self, evidence_id: &str) -> Vec<CustodyEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.evidence_id == evidence_id)
            .collect()
    }

    pub fn operations(&self, evidence_id: &str) -> Vec<String> {
        self.for_evidence(evidence_id)
            .into_iter()
            .map(|e| e.operation)
            .collect()
    }
}
