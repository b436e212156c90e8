use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use serde::Serialize;

use crate::custody::{CustodyError, CustodyEvent, CustodySink};

pub const CUSTODY_CSV_FILE: &str = "custody.csv";

const HEADER: [&str; 11] = [
    "run_id",
    "sequence",
    "timestamp",
    "evidence_id",
    "operation",
    "actor",
    "status",
    "error",
    "detail",
    "tool_version",
    "config_hash",
];

pub struct CsvCustodySink {
    run_id: String,
    tool_version: String,
    config_hash: String,
    writer: Mutex<csv::Writer<File>>,
}

#[derive(Serialize)]
struct CustodyCsv<'a> {
    run_id: &'a str,
    sequence: u64,
    timestamp: String,
    evidence_id: &'a str,
    operation: &'a str,
    actor: &'a str,
    status: &'a str,
    error: Option<&'a str>,
    detail: Option<&'a str>,
    tool_version: &'a str,
    config_hash: &'a str,
}

impl CsvCustodySink {
    pub fn new(
        run_id: &str,
        tool_version: &str,
        config_hash: &str,
        output_dir: &Path,
    ) -> Result<Self, CustodyError> {
        std::fs::create_dir_all(output_dir)?;
        let path = output_dir.join(CUSTODY_CSV_FILE);
        let fresh = std::fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if fresh {
            writer.write_record(HEADER)?;
            writer.flush()?;
        }

        Ok(Self {
            run_id: run_id.to_string(),
            tool_version: tool_version.to_string(),
            config_hash: config_hash.to_string(),
            writer: Mutex::new(writer),
        })
    }
}

impl CustodySink for CsvCustodySink {
    fn append(&self, event: &CustodyEvent) -> Result<(), CustodyError> {
        let row = CustodyCsv {
            run_id: &self.run_id,
            sequence: event.sequence,
            timestamp: event.timestamp.to_rfc3339(),
            evidence_id: &event.evidence_id,
            operation: &event.operation,
            actor: &event.actor,
            status: event.status.as_str(),
            error: event.error.as_deref(),
            detail: event.detail.as_deref(),
            tool_version: &self.tool_version,
            config_hash: &self.config_hash,
        };
        let mut guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        guard.serialize(row)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), CustodyError> {
        let mut guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        guard.flush()?;
        Ok(())
    }
}
