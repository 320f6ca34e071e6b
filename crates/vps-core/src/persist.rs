//! Durable JSON files.
//!
//! Files are written to a temp file in the target directory and renamed over
//! the destination, so readers only ever see the old or the new contents.
//! Checked files carry a one-line header with a SHA-256 of the payload bytes.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

const FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("missing header line")]
    MissingHeader,
    #[error("unreadable header: {0}")]
    Header(serde_json::Error),
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u32),
    #[error("checksum mismatch (expected {expected}, found {actual})")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("unreadable payload: {0}")]
    Payload(serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    version: u32,
    sha256: String,
}

fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn encode_checked<T: Serialize>(value: &T) -> serde_json::Result<Vec<u8>> {
    let payload = serde_json::to_vec_pretty(value)?;
    let header = serde_json::to_vec(&Header {
        version: FORMAT_VERSION,
        sha256: digest(&payload),
    })?;

    let mut out = Vec::with_capacity(header.len() + payload.len() + 1);
    out.extend_from_slice(&header);
    out.push(b'\n');
    out.extend_from_slice(&payload);
    Ok(out)
}

pub fn decode_checked<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, DecodeError> {
    let split = bytes
        .iter()
        .position(|b| *b == b'\n')
        .ok_or(DecodeError::MissingHeader)?;
    let (header, payload) = (&bytes[..split], &bytes[split + 1..]);

    let header: Header = serde_json::from_slice(header).map_err(DecodeError::Header)?;
    if header.version != FORMAT_VERSION {
        return Err(DecodeError::UnsupportedVersion(header.version));
    }
    let actual = digest(payload);
    if actual != header.sha256 {
        return Err(DecodeError::ChecksumMismatch {
            expected: header.sha256,
            actual,
        });
    }
    serde_json::from_slice(payload).map_err(DecodeError::Payload)
}

/// Replace `path` with `bytes` atomically.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Move an unreadable file out of the way so it is kept for inspection.
pub fn quarantine(path: &Path) -> std::io::Result<PathBuf> {
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S");
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".corrupt-{stamp}"));
    let target = PathBuf::from(name);
    std::fs::rename(path, &target)?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_checked_payload_detects_tampering() {
        let mut value = HashMap::new();
        value.insert("vps-1".to_string(), 42u32);
        let mut bytes = encode_checked(&value).unwrap();

        let decoded: HashMap<String, u32> = decode_checked(&bytes).unwrap();
        assert_eq!(decoded, value);

        let last = bytes.len() - 3;
        bytes[last] = b'7';
        let err = decode_checked::<HashMap<String, u32>>(&bytes).unwrap_err();
        assert!(matches!(err, DecodeError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_headerless_file_rejected() {
        let err = decode_checked::<Vec<u32>>(b"[1,2,3]").unwrap_err();
        assert!(matches!(err, DecodeError::MissingHeader));
    }

    #[test]
    fn test_write_atomic_and_quarantine() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");

        let moved = quarantine(&path).unwrap();
        assert!(!path.exists());
        assert!(moved.to_string_lossy().contains(".corrupt-"));
        assert_eq!(std::fs::read(moved).unwrap(), b"second");
    }
}
