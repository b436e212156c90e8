//! # Media Probe
//!
//! Lightweight header parsing used to enforce duration and dimension ceilings
//! before any evidence is hashed or dispatched. Only container headers are
//! inspected; nothing is decoded.

use serde::{Deserialize, Serialize};

use crate::evidence::{EvidenceError, EvidenceSource, Modality, read_full};

const HEADER_BYTES: usize = 64 * 1024;
const MAX_RIFF_CHUNKS: usize = 64;
/// Text evidence larger than this is not read for the UTF-8 check; the size
/// ceiling rejects it first.
const MAX_TEXT_SCAN: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub byte_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_utf8: Option<bool>,
}

pub fn probe(modality: Modality, source: &dyn EvidenceSource) -> Result<MediaInfo, EvidenceError> {
    let mut info = MediaInfo {
        byte_size: source.len(),
        ..MediaInfo::default()
    };

    match modality {
        Modality::Audio => {
            info.duration_seconds = wav_duration(source)?;
        }
        Modality::Image => {
            let mut header = vec![0u8; HEADER_BYTES.min(source.len() as usize)];
            let n = read_full(source, 0, &mut header)?;
            header.truncate(n);
            if let Some((w, h)) = image_dimensions(&header) {
                info.width = Some(w);
                info.height = Some(h);
            }
        }
        Modality::Video => {}
        Modality::Text => {
            if source.len() <= MAX_TEXT_SCAN {
                let mut buf = vec![0u8; source.len() as usize];
                let n = read_full(source, 0, &mut buf)?;
                buf.truncate(n);
                info.valid_utf8 = Some(std::str::from_utf8(&buf).is_ok());
            }
        }
    }

    Ok(info)
}

/// Duration of a PCM RIFF/WAVE stream, from the `fmt ` byte rate and `data` size.
pub fn wav_duration(source: &dyn EvidenceSource) -> Result<Option<f64>, EvidenceError> {
    let mut header = [0u8; 12];
    if read_full(source, 0, &mut header)? < 12 {
        return Ok(None);
    }
    if &header[0..4] != b"RIFF" || &header[8..12] != b"WAVE" {
        return Ok(None);
    }

    let total = source.len();
    let mut offset = 12u64;
    let mut byte_rate: Option<u32> = None;
    let mut data_size: Option<u64> = None;

    for _ in 0..MAX_RIFF_CHUNKS {
        let mut chunk = [0u8; 8];
        if read_full(source, offset, &mut chunk)? < 8 {
            break;
        }
        let id = &chunk[0..4];
        let size = u32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]) as u64;
        let body = offset + 8;

        if id == b"fmt " {
            let mut fmt = [0u8; 16];
            if read_full(source, body, &mut fmt)? < 16 {
                return Ok(None);
            }
            byte_rate = Some(u32::from_le_bytes([fmt[8], fmt[9], fmt[10], fmt[11]]));
        } else if id == b"data" {
            // Streaming writers leave 0xFFFFFFFF; clamp to what is actually present.
            data_size = Some(size.min(total.saturating_sub(body)));
            break;
        }

        offset = body + size + (size & 1);
    }

    match (byte_rate, data_size) {
        (Some(rate), Some(size)) if rate > 0 => Ok(Some(size as f64 / rate as f64)),
        _ => Ok(None),
    }
}

/// Pixel dimensions for PNG, JPEG, BMP and TIFF headers.
pub fn image_dimensions(header: &[u8]) -> Option<(u32, u32)> {
    if header.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        return png_dimensions(header);
    }
    if header.starts_with(&[0xFF, 0xD8]) {
        return jpeg_dimensions(header);
    }
    if header.starts_with(b"BM") {
        return bmp_dimensions(header);
    }
    if header.starts_with(b"II*\0") || header.starts_with(b"MM\0*") {
        return tiff_dimensions(header);
    }
    None
}

fn png_dimensions(header: &[u8]) -> Option<(u32, u32)> {
    if header.len() < 24 || &header[12..16] != b"IHDR" {
        return None;
    }
    let w = u32::from_be_bytes(header[16..20].try_into().ok()?);
    let h = u32::from_be_bytes(header[20..24].try_into().ok()?);
    Some((w, h))
}

fn jpeg_dimensions(header: &[u8]) -> Option<(u32, u32)> {
    let mut pos = 2usize;
    while pos + 4 <= header.len() {
        if header[pos] != 0xFF {
            pos += 1;
            continue;
        }
        let marker = header[pos + 1];
        if marker == 0xFF {
            pos += 1;
            continue;
        }
        // Standalone markers carry no length.
        if marker == 0x01 || (0xD0..=0xD9).contains(&marker) {
            pos += 2;
            continue;
        }
        let len = u16::from_be_bytes([header[pos + 2], header[pos + 3]]) as usize;
        let is_sof = (0xC0..=0xCF).contains(&marker) && !matches!(marker, 0xC4 | 0xC8 | 0xCC);
        if is_sof {
            if pos + 9 > header.len() {
                return None;
            }
            let h = u16::from_be_bytes([header[pos + 5], header[pos + 6]]) as u32;
            let w = u16::from_be_bytes([header[pos + 7], header[pos + 8]]) as u32;
            return Some((w, h));
        }
        if len < 2 {
            return None;
        }
        pos += 2 + len;
    }
    None
}

fn bmp_dimensions(header: &[u8]) -> Option<(u32, u32)> {
    if header.len() < 26 {
        return None;
    }
    let w = i32::from_le_bytes(header[18..22].try_into().ok()?);
    let h = i32::from_le_bytes(header[22..26].try_into().ok()?);
    // Negative height marks a top-down bitmap.
    Some((w.unsigned_abs(), h.unsigned_abs()))
}

fn tiff_dimensions(header: &[u8]) -> Option<(u32, u32)> {
    let le = header.starts_with(b"II");
    let u16_at = |pos: usize| -> Option<u16> {
        let b: [u8; 2] = header.get(pos..pos + 2)?.try_into().ok()?;
        Some(if le { u16::from_le_bytes(b) } else { u16::from_be_bytes(b) })
    };
    let u32_at = |pos: usize| -> Option<u32> {
        let b: [u8; 4] = header.get(pos..pos + 4)?.try_into().ok()?;
        Some(if le { u32::from_le_bytes(b) } else { u32::from_be_bytes(b) })
    };

    let ifd = u32_at(4)? as usize;
    let count = u16_at(ifd)? as usize;
    let mut width = None;
    let mut height = None;
    for i in 0..count {
        let entry = ifd + 2 + i * 12;
        let tag = u16_at(entry)?;
        let kind = u16_at(entry + 2)?;
        let value = match kind {
            3 => u16_at(entry + 8)? as u32,
            4 => u32_at(entry + 8)?,
            _ => continue,
        };
        match tag {
            256 => width = Some(value),
            257 => height = Some(value),
            _ => {}
        }
        if let (Some(w), Some(h)) = (width, height) {
            return Some((w, h));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MemSource(Vec<u8>);

    impl EvidenceSource for MemSource {
        fn len(&self) -> u64 {
            self.0.len() as u64
        }

        fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, EvidenceError> {
            let start = (offset as usize).min(self.0.len());
            let n = buf.len().min(self.0.len() - start);
            buf[..n].copy_from_slice(&self.0[start..start + n]);
            Ok(n)
        }
    }

    fn wav_with_list_chunk(seconds: u32) -> Vec<u8> {
        let rate = 8000u32;
        let data_len = rate * 2 * seconds;
        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(4 + 26 + 24 + 8 + data_len).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"LIST");
        out.extend_from_slice(&17u32.to_le_bytes());
        out.extend_from_slice(&[0u8; 17]);
        out.push(0); // pad byte
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&rate.to_le_bytes());
        out.extend_from_slice(&(rate * 2).to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());
        out.resize(out.len() + data_len as usize, 0);
        out
    }

    #[test]
    fn wav_duration_skips_odd_sized_chunks() {
        let src = MemSource(wav_with_list_chunk(2));
        let duration = wav_duration(&src).expect("probe").expect("duration");
        assert!((duration - 2.0).abs() < 1e-9);
    }

    #[test]
    fn wav_duration_clamps_streaming_size() {
        let mut bytes = wav_with_list_chunk(1);
        let pos = bytes.windows(4).position(|w| w == b"data").expect("data chunk");
        bytes[pos + 4..pos + 8].copy_from_slice(&u32::MAX.to_le_bytes());
        let duration = wav_duration(&MemSource(bytes)).expect("probe").expect("duration");
        assert!((duration - 1.0).abs() < 1e-9);
    }

    #[test]
    fn non_riff_audio_has_no_duration() {
        let src = MemSource(b"ID3\x04\x00rest-of-mp3".to_vec());
        assert_eq!(wav_duration(&src).expect("probe"), None);
    }

    #[test]
    fn png_dimensions_from_ihdr() {
        let mut data = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        data.extend_from_slice(&13u32.to_be_bytes());
        data.extend_from_slice(b"IHDR");
        data.extend_from_slice(&640u32.to_be_bytes());
        data.extend_from_slice(&480u32.to_be_bytes());
        assert_eq!(image_dimensions(&data), Some((640, 480)));
    }

    #[test]
    fn jpeg_dimensions_from_sof0() {
        let mut data = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x04, 0x00, 0x00];
        data.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x0B, 0x08]);
        data.extend_from_slice(&300u16.to_be_bytes());
        data.extend_from_slice(&5000u16.to_be_bytes());
        data.extend_from_slice(&[0x01, 0x01, 0x11, 0x00]);
        assert_eq!(image_dimensions(&data), Some((5000, 300)));
    }

    #[test]
    fn bmp_top_down_height() {
        let mut data = vec![0u8; 26];
        data[0..2].copy_from_slice(b"BM");
        data[18..22].copy_from_slice(&100i32.to_le_bytes());
        data[22..26].copy_from_slice(&(-50i32).to_le_bytes());
        assert_eq!(image_dimensions(&data), Some((100, 50)));
    }

    #[test]
    fn tiff_little_endian_ifd() {
        let mut data = Vec::new();
        data.extend_from_slice(b"II*\0");
        data.extend_from_slice(&8u32.to_le_bytes());
        data.extend_from_slice(&2u16.to_le_bytes());
        for (tag, value) in [(256u16, 1200u32), (257u16, 800u32)] {
            data.extend_from_slice(&tag.to_le_bytes());
            data.extend_from_slice(&4u16.to_le_bytes());
            data.extend_from_slice(&1u32.to_le_bytes());
            data.extend_from_slice(&value.to_le_bytes());
        }
        assert_eq!(image_dimensions(&data), Some((1200, 800)));
    }

    #[test]
    fn text_probe_flags_invalid_utf8() {
        let info = probe(Modality::Text, &MemSource(vec![0x66, 0xFF, 0x6F])).expect("probe");
        assert_eq!(info.valid_utf8, Some(false));
        let info = probe(Modality::Text, &MemSource(b"hello".to_vec())).expect("probe");
        assert_eq!(info.valid_utf8, Some(true));
        assert_eq!(info.byte_size, 5);
    }
}
