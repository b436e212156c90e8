use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use serde_json::{Map, Value};

use crate::config::Config;
use crate::custody::CustodyBackendKind;
use crate::evidence::Modality;
use crate::processor::AnalysisRequest;

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModalityArg {
    Audio,
    Image,
    Video,
    Text,
}

impl From<ModalityArg> for Modality {
    fn from(arg: ModalityArg) -> Self {
        match arg {
            ModalityArg::Audio => Modality::Audio,
            ModalityArg::Image => Modality::Image,
            ModalityArg::Video => Modality::Video,
            ModalityArg::Text => Modality::Text,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CustodyFormat {
    Jsonl,
    Csv,
}

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct CliOptions {
    /// Case-scoped evidence identifier
    #[arg(long)]
    pub evidence_id: String,

    /// Evidence file to analyse
    #[arg(short, long)]
    pub input: PathBuf,

    /// Analyses to run (comma-separated list)
    #[arg(long, value_delimiter = ',', required = true)]
    pub types: Vec<String>,

    /// JSON file with analysis options
    #[arg(long)]
    pub options: Option<PathBuf>,

    /// Optional path to config file (YAML)
    #[arg(long)]
    pub config_path: Option<PathBuf>,

    /// Evidence modality; inferred from the file extension when omitted
    #[arg(long, value_enum)]
    pub modality: Option<ModalityArg>,

    /// Directory for the chain-of-custody log (overrides config)
    #[arg(long)]
    pub custody_log: Option<PathBuf>,

    /// Chain-of-custody log format (overrides config)
    #[arg(long, value_enum)]
    pub custody_format: Option<CustodyFormat>,

    /// Number of worker slots (overrides config)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Accelerator device for GPU-class analyses (overrides config)
    #[arg(long)]
    pub gpu_device: Option<String>,

    /// Analysis backend executable (overrides config)
    #[arg(long)]
    pub backend_command: Option<PathBuf>,

    /// Expected evidence SHA-256 (hex); processing fails on mismatch
    #[arg(long)]
    pub evidence_sha256: Option<String>,
}

impl CliOptions {
    pub fn apply_overrides(&self, cfg: &mut Config) {
        if let Some(dir) = &self.custody_log {
            cfg.custody.output_dir = dir.clone();
        }
        if let Some(format) = self.custody_format {
            cfg.custody.backend = match format {
                CustodyFormat::Jsonl => CustodyBackendKind::Jsonl,
                CustodyFormat::Csv => CustodyBackendKind::Csv,
            };
        }
        if let Some(workers) = self.workers {
            cfg.num_workers = Some(workers);
        }
        if let Some(device) = &self.gpu_device {
            cfg.gpu_device = Some(device.clone());
        }
        if let Some(program) = &self.backend_command {
            cfg.backend_command = Some(program.clone());
        }
    }

    pub fn modality(&self) -> Result<Modality> {
        if let Some(arg) = self.modality {
            return Ok(arg.into());
        }
        Modality::from_path(&self.input).with_context(|| {
            format!(
                "cannot infer modality from {}; pass --modality",
                self.input.display()
            )
        })
    }

    pub fn request(&self) -> Result<AnalysisRequest> {
        let options = match &self.options {
            Some(path) => load_options(path)?,
            None => Map::new(),
        };
        Ok(AnalysisRequest {
            evidence_id: self.evidence_id.clone(),
            path: self.input.clone(),
            analysis_types: self.types.clone(),
            options,
            expected_sha256: self.evidence_sha256.clone(),
        })
    }
}

fn load_options(path: &std::path::Path) -> Result<Map<String, Value>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading options file {}", path.display()))?;
    let value: Value = serde_json::from_str(&text)
        .with_context(|| format!("parsing options file {}", path.display()))?;
    match value {
        Value::Object(map) => Ok(map),
        _ => bail!("options file {} must hold a JSON object", path.display()),
    }
}

pub fn parse() -> CliOptions {
    CliOptions::parse()
}
