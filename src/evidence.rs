use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::probe::MediaInfo;

#[derive(Debug, Error)]
pub enum EvidenceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("evidence changed while reading: expected {expected} bytes, read {actual}")]
    ShortRead { expected: u64, actual: u64 },
    #[error("evidence of {size} bytes cannot be held in memory")]
    TooLarge { size: u64 },
}

/// Failures that make the evidence unusable for the rest of the request.
#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("cannot read evidence {path}: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: EvidenceError,
    },
    #[error("digest mismatch for {evidence_id}: expected {expected}, computed {actual}")]
    Mismatch {
        evidence_id: String,
        expected: String,
        actual: String,
    },
}

pub trait EvidenceSource: Send + Sync {
    fn len(&self) -> u64;
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, EvidenceError>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct RawFileSource {
    file: File,
    len: u64,
    #[cfg(not(unix))]
    lock: std::sync::Mutex<()>,
}

impl RawFileSource {
    pub fn open(path: &Path) -> Result<Self, EvidenceError> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            len,
            #[cfg(not(unix))]
            lock: std::sync::Mutex::new(()),
        })
    }
}

impl EvidenceSource for RawFileSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, EvidenceError> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            Ok(self.file.read_at(buf, offset)?)
        }
        #[cfg(not(unix))]
        {
            use std::io::{Read, Seek, SeekFrom};
            let _guard = self
                .lock
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let mut f = &self.file;
            f.seek(SeekFrom::Start(offset))?;
            Ok(f.read(buf)?)
        }
    }
}

/// Fill `buf` from `offset`, stopping early only at end of evidence.
pub fn read_full(
    source: &dyn EvidenceSource,
    offset: u64,
    buf: &mut [u8],
) -> Result<usize, EvidenceError> {
    let mut read = 0usize;
    while read < buf.len() {
        let n = source.read_at(offset + read as u64, &mut buf[read..])?;
        if n == 0 {
            break;
        }
        read += n;
    }
    Ok(read)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Audio,
    Image,
    Video,
    Text,
}

impl Modality {
    pub const ALL: [Modality; 4] = [
        Modality::Audio,
        Modality::Image,
        Modality::Video,
        Modality::Text,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Audio => "audio",
            Modality::Image => "image",
            Modality::Video => "video",
            Modality::Text => "text",
        }
    }

    pub fn supported_extensions(&self) -> &'static [&'static str] {
        match self {
            Modality::Audio => &["wav", "mp3", "m4a", "flac"],
            Modality::Image => &["jpg", "jpeg", "png", "bmp", "tiff", "tif"],
            Modality::Video => &["mp4", "avi", "mov", "mkv", "wmv", "webm"],
            Modality::Text => &["txt", "text", "log", "csv", "json", "md"],
        }
    }

    /// Infer the modality from a path's extension (case-insensitive).
    pub fn from_path(path: &Path) -> Option<Modality> {
        let ext = extension_of(path)?;
        Modality::ALL
            .into_iter()
            .find(|m| m.supported_extensions().contains(&ext.as_str()))
    }

    /// Actor name written into custody events for this modality's processor.
    pub fn processor_name(&self) -> &'static str {
        match self {
            Modality::Audio => "AudioProcessor",
            Modality::Image => "ImageProcessor",
            Modality::Video => "VideoProcessor",
            Modality::Text => "TextProcessor",
        }
    }
}

impl std::fmt::Display for Modality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Modality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "audio" => Ok(Modality::Audio),
            "image" => Ok(Modality::Image),
            "video" => Ok(Modality::Video),
            "text" => Ok(Modality::Text),
            other => Err(format!("unknown modality: {other}")),
        }
    }
}

pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digests {
    pub sha256: String,
    pub md5: String,
}

/// Evidence bytes together with the digests computed over exactly those bytes.
pub struct LoadedEvidence {
    pub bytes: Arc<Vec<u8>>,
    pub digests: Digests,
}

/// Stream the whole source once, hashing and retaining the bytes.
pub fn load_and_digest(
    source: &dyn EvidenceSource,
    block_size: usize,
) -> Result<LoadedEvidence, EvidenceError> {
    let total = source.len();
    let capacity =
        usize::try_from(total).map_err(|_| EvidenceError::TooLarge { size: total })?;
    let mut bytes = Vec::new();
    bytes
        .try_reserve_exact(capacity)
        .map_err(|_| EvidenceError::TooLarge { size: total })?;
    let digests = stream_digests(source, block_size, |block| bytes.extend_from_slice(block))?;
    if bytes.len() as u64 != total {
        return Err(EvidenceError::ShortRead {
            expected: total,
            actual: bytes.len() as u64,
        });
    }
    Ok(LoadedEvidence {
        bytes: Arc::new(bytes),
        digests,
    })
}

pub fn compute_sha256(source: &dyn EvidenceSource, block_size: usize) -> Result<String, EvidenceError> {
    Ok(stream_digests(source, block_size, |_| {})?.sha256)
}

fn stream_digests(
    source: &dyn EvidenceSource,
    block_size: usize,
    mut sink: impl FnMut(&[u8]),
) -> Result<Digests, EvidenceError> {
    let mut sha = Sha256::new();
    let mut md5 = md5::Context::new();
    let mut buf = vec![0u8; block_size.max(1)];
    let mut offset = 0u64;
    loop {
        let n = read_full(source, offset, &mut buf)?;
        if n == 0 {
            break;
        }
        sha.update(&buf[..n]);
        md5.consume(&buf[..n]);
        sink(&buf[..n]);
        offset += n as u64;
        if n < buf.len() {
            break;
        }
    }
    Ok(Digests {
        sha256: hex::encode(sha.finalize()),
        md5: format!("{:x}", md5.compute()),
    })
}

/// A hashed evidence file. The digests are fixed at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub evidence_id: String,
    pub path: PathBuf,
    pub modality: Modality,
    pub sha256: String,
    pub md5: String,
    pub size_bytes: u64,
    pub media: MediaInfo,
}

impl EvidenceItem {
    pub fn new(
        evidence_id: &str,
        path: &Path,
        modality: Modality,
        digests: Digests,
        media: MediaInfo,
    ) -> Self {
        Self {
            evidence_id: evidence_id.to_string(),
            path: path.to_path_buf(),
            modality,
            sha256: digests.sha256,
            md5: digests.md5,
            size_bytes: media.byte_size,
            media,
        }
    }

    /// Compare the stored digest with an externally supplied one.
    pub fn expect_sha256(&self, expected: &str) -> Result<(), IntegrityError> {
        let expected = expected.trim().to_ascii_lowercase();
        if expected != self.sha256 {
            return Err(IntegrityError::Mismatch {
                evidence_id: self.evidence_id.clone(),
                expected,
                actual: self.sha256.clone(),
            });
        }
        Ok(())
    }

    /// Re-read the file and check it still matches the digest taken at intake.
    pub fn verify(&self, block_size: usize) -> Result<(), IntegrityError> {
        let unreadable = |source| IntegrityError::Unreadable {
            path: self.path.display().to_string(),
            source,
        };
        let source = RawFileSource::open(&self.path).map_err(unreadable)?;
        let actual = compute_sha256(&source, block_size).map_err(unreadable)?;
        if actual != self.sha256 {
            return Err(IntegrityError::Mismatch {
                evidence_id: self.evidence_id.clone(),
                expected: self.sha256.clone(),
                actual,
            });
        }
        Ok(())
    }

    /// URI handed to remote services that fetch the media themselves.
    pub fn media_uri(&self) -> String {
        let absolute = std::fs::canonicalize(&self.path).unwrap_or_else(|_| self.path.clone());
        format!("file://{}", absolute.display())
    }
}
