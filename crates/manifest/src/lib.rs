use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::ops::Range;
use swarm_protocol::{FileId, FileInfoResponse, ManifestPayload};
use thiserror::Error;

pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManifestError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("chunk {index} out of range ({chunk_count} chunks)")]
    ChunkOutOfRange { index: u32, chunk_count: u32 },
    #[error("chunk {index} has {actual} bytes, expected {expected}")]
    LengthMismatch {
        index: u32,
        expected: u64,
        actual: u64,
    },
    #[error("file incomplete: chunk {first_missing} is missing")]
    Incomplete { first_missing: u32 },
}

pub type Result<T> = std::result::Result<T, ManifestError>;

/// Immutable description of a file's chunk partitioning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileManifest {
    pub file_id: FileId,
    pub filename: String,
    pub total_size: u64,
    pub chunk_size: u64,
    /// Lowercase hex SHA-256 of each chunk, in index order.
    pub chunk_hashes: Vec<String>,
}

impl FileManifest {
    pub fn chunk_count(&self) -> u32 {
        self.chunk_hashes.len() as u32
    }

    pub fn indices(&self) -> Range<u32> {
        0..self.chunk_count()
    }

    /// Byte range of chunk `index` within the original file.
    pub fn chunk_range(&self, index: u32) -> Result<Range<u64>> {
        self.check_index(index)?;
        let start = self.chunk_size * u64::from(index);
        let end = u64::min(start.saturating_add(self.chunk_size), self.total_size);
        Ok(start..end)
    }

    pub fn chunk_len(&self, index: u32) -> Result<u64> {
        let range = self.chunk_range(index)?;
        Ok(range.end - range.start)
    }

    pub fn verify_chunk(&self, index: u32, bytes: &[u8]) -> Result<bool> {
        self.check_index(index)?;
        Ok(self.chunk_len(index)? == bytes.len() as u64
            && sha256_hex(bytes) == self.chunk_hashes[index as usize])
    }

    /// Checks a manifest that arrived from the network rather than from `split`.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(ManifestError::InvalidInput("chunk_size must be > 0".into()));
        }
        if self.total_size == 0 {
            return Err(ManifestError::InvalidInput("total_size must be > 0".into()));
        }
        let expected = chunk_count(self.total_size, self.chunk_size);
        if expected != self.chunk_hashes.len() as u64 {
            return Err(ManifestError::InvalidInput(format!(
                "expected {expected} chunk hashes, got {}",
                self.chunk_hashes.len()
            )));
        }
        if let Some(bad) = self.chunk_hashes.iter().position(|h| !is_sha256_hex(h)) {
            return Err(ManifestError::InvalidInput(format!(
                "chunk hash {bad} is not a sha256 hex digest"
            )));
        }
        Ok(())
    }

    pub fn to_payload(&self) -> ManifestPayload {
        ManifestPayload {
            filename: self.filename.clone(),
            size: self.total_size,
            chunk_size: self.chunk_size,
            chunk_hashes: self.chunk_hashes.clone(),
        }
    }

    pub fn from_file_info(info: &FileInfoResponse) -> Result<Self> {
        let manifest = Self {
            file_id: info.file_id.clone(),
            filename: info.filename.clone(),
            total_size: info.size,
            chunk_size: info.chunk_size,
            chunk_hashes: info.chunk_hashes.clone(),
        };
        manifest.validate()?;
        if manifest.chunk_count() != info.chunks {
            return Err(ManifestError::InvalidInput(format!(
                "tracker reports {} chunks but lists {} hashes",
                info.chunks,
                manifest.chunk_count()
            )));
        }
        Ok(manifest)
    }

    fn check_index(&self, index: u32) -> Result<()> {
        if index >= self.chunk_count() {
            return Err(ManifestError::ChunkOutOfRange {
                index,
                chunk_count: self.chunk_count(),
            });
        }
        Ok(())
    }
}

pub fn chunk_count(total_size: u64, chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    total_size.div_ceil(chunk_size)
}

/// Partitions `data` into `chunk_size` pieces and hashes each one.
///
/// The result depends only on the bytes and the chunk size, so two peers
/// splitting the same content agree on every boundary and digest.
pub fn split(
    file_id: impl Into<FileId>,
    filename: impl Into<String>,
    data: &[u8],
    chunk_size: u64,
) -> Result<FileManifest> {
    if chunk_size == 0 {
        return Err(ManifestError::InvalidInput("chunk_size must be > 0".into()));
    }
    if data.is_empty() {
        return Err(ManifestError::InvalidInput("cannot split an empty file".into()));
    }
    if chunk_count(data.len() as u64, chunk_size) > u64::from(u32::MAX) {
        return Err(ManifestError::InvalidInput(
            "file has too many chunks for this chunk size".into(),
        ));
    }
    let step = usize::try_from(chunk_size).unwrap_or(usize::MAX);
    let chunk_hashes = data.chunks(step).map(sha256_hex).collect();

    Ok(FileManifest {
        file_id: file_id.into(),
        filename: filename.into(),
        total_size: data.len() as u64,
        chunk_size,
        chunk_hashes,
    })
}

/// Yields the byte slices of `data` along the manifest's boundaries.
pub fn chunk_slices<'a>(
    manifest: &'a FileManifest,
    data: &'a [u8],
) -> impl Iterator<Item = (u32, &'a [u8])> + 'a {
    manifest.indices().filter_map(move |idx| {
        let range = manifest.chunk_range(idx).ok()?;
        data.get(range.start as usize..range.end as usize)
            .map(|slice| (idx, slice))
    })
}

/// Concatenates chunks in ascending index order.
pub fn reassemble<F, B>(manifest: &FileManifest, mut chunk: F) -> Result<Vec<u8>>
where
    F: FnMut(u32) -> Option<B>,
    B: AsRef<[u8]>,
{
    let mut out = Vec::with_capacity(manifest.total_size as usize);
    for idx in manifest.indices() {
        let Some(bytes) = chunk(idx) else {
            return Err(ManifestError::Incomplete { first_missing: idx });
        };
        let bytes = bytes.as_ref();
        let expected = manifest.chunk_len(idx)?;
        if bytes.len() as u64 != expected {
            return Err(ManifestError::LengthMismatch {
                index: idx,
                expected,
                actual: bytes.len() as u64,
            });
        }
        out.extend_from_slice(bytes);
    }
    Ok(out)
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(7)).collect()
    }

    #[test]
    fn two_and_a_half_mib_yields_three_chunks() {
        let data = patterned((5 * MIB / 2) as usize);
        let manifest = split("f1", "movie.mp4", &data, MIB).expect("split failed");

        assert_eq!(manifest.chunk_count(), 3);
        let sizes: Vec<u64> = manifest
            .indices()
            .map(|i| manifest.chunk_len(i).unwrap())
            .collect();
        assert_eq!(sizes, vec![1_048_576, 1_048_576, 524_288]);
    }

    #[test]
    fn exact_multiple_keeps_full_last_chunk() {
        let data = patterned(4 * 1024);
        let manifest = split("f1", "a.bin", &data, 1024).unwrap();
        assert_eq!(manifest.chunk_count(), 4);
        assert_eq!(manifest.chunk_len(3).unwrap(), 1024);
    }

    #[test]
    fn rejects_zero_chunk_size_and_empty_input() {
        assert!(matches!(
            split("f", "x", b"abc", 0),
            Err(ManifestError::InvalidInput(_))
        ));
        assert!(matches!(
            split("f", "x", b"", 16),
            Err(ManifestError::InvalidInput(_))
        ));
    }

    #[test]
    fn split_is_deterministic() {
        let data = patterned(10_000);
        let a = split("f", "x", &data, 999).unwrap();
        let b = split("f", "x", &data, 999).unwrap();
        assert_eq!(a.chunk_hashes, b.chunk_hashes);
    }

    #[test]
    fn reassemble_reports_first_missing_chunk() {
        let data = patterned(3000);
        let manifest = split("f", "x", &data, 1000).unwrap();
        let slices: Vec<&[u8]> = chunk_slices(&manifest, &data).map(|(_, s)| s).collect();

        let err = reassemble(&manifest, |i| (i != 1).then(|| slices[i as usize])).unwrap_err();
        assert_eq!(err, ManifestError::Incomplete { first_missing: 1 });
    }

    #[test]
    fn verify_chunk_rejects_tampered_bytes() {
        let data = patterned(2500);
        let manifest = split("f", "x", &data, 1000).unwrap();
        assert!(manifest.verify_chunk(2, &data[2000..]).unwrap());
        let mut bad = data[2000..].to_vec();
        bad[0] ^= 0xff;
        assert!(!manifest.verify_chunk(2, &bad).unwrap());
        assert!(manifest.verify_chunk(3, &bad).is_err());
    }

    #[test]
    fn wire_manifest_with_wrong_hash_count_is_rejected() {
        let info = FileInfoResponse {
            file_id: "f".into(),
            filename: "x".into(),
            size: 2500,
            chunks: 3,
            chunk_size: 1000,
            chunk_hashes: vec![sha256_hex(b"a"), sha256_hex(b"b")],
            peers: Default::default(),
        };
        assert!(FileManifest::from_file_info(&info).is_err());
    }

    #[test]
    fn huge_chunk_size_from_the_wire_does_not_overflow() {
        let half = 1u64 << 63;
        let manifest = FileManifest {
            file_id: "big".into(),
            filename: "big.bin".into(),
            total_size: half + 1,
            chunk_size: half,
            chunk_hashes: vec!["0".repeat(64); 2],
        };
        manifest.validate().unwrap();
        assert_eq!(manifest.chunk_range(1).unwrap(), half..half + 1);
        assert_eq!(manifest.chunk_len(1).unwrap(), 1);
        assert_eq!(manifest.chunk_len(0).unwrap(), half);
    }
}
