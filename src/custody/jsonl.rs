use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use serde::Serialize;

use crate::custody::{CustodyError, CustodyEvent, CustodySink};

pub const CUSTODY_JSONL_FILE: &str = "custody.jsonl";

/// Appends one JSON object per line. Existing trails are extended, never truncated.
pub struct JsonlCustodySink {
    run_id: String,
    tool_version: String,
    config_hash: String,
    writer: Mutex<BufWriter<File>>,
}

#[derive(Serialize)]
struct CustodyRecord<'a> {
    #[serde(flatten)]
    event: &'a CustodyEvent,
    run_id: &'a str,
    tool_version: &'a str,
    config_hash: &'a str,
}

impl JsonlCustodySink {
    pub fn new(
        run_id: &str,
        tool_version: &str,
        config_hash: &str,
        output_dir: &Path,
    ) -> Result<Self, CustodyError> {
        std::fs::create_dir_all(output_dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(output_dir.join(CUSTODY_JSONL_FILE))?;
        Ok(Self {
            run_id: run_id.to_string(),
            tool_version: tool_version.to_string(),
            config_hash: config_hash.to_string(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl CustodySink for JsonlCustodySink {
    fn append(&self, event: &CustodyEvent) -> Result<(), CustodyError> {
        let record = CustodyRecord {
            event,
            run_id: &self.run_id,
            tool_version: &self.tool_version,
            config_hash: &self.config_hash,
        };
        let mut guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        serde_json::to_writer(&mut *guard, &record)?;
        guard.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&self) -> Result<(), CustodyError> {
        let mut guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        guard.flush()?;
        Ok(())
    }
}
