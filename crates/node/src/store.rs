use bytes::Bytes;
use sled::Db;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use swarm_manifest::{chunk_slices, reassemble, FileManifest, ManifestError};
use swarm_protocol::FileId;
use tracing::{debug, info};

use crate::error::{Result, SwarmError};

const USED_BYTES_KEY: &[u8] = b"__meta:used_bytes";
const CHUNK_PREFIX: &[u8] = b"c:";
const MANIFEST_PREFIX: &[u8] = b"m:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    /// Another writer already stored this verified chunk.
    AlreadyPresent,
}

/// Durable chunk storage keyed by `(file_id, index)`.
///
/// Only bytes matching the manifest hash are ever written, so every stored
/// record is verified and immutable.
pub struct ChunkStore {
    db: Db,
    manifests: RwLock<HashMap<FileId, Arc<FileManifest>>>,
}

impl ChunkStore {
    pub fn open(storage_path: &Path) -> Result<Self> {
        let db = sled::open(storage_path)?;
        info!(
            path = %storage_path.display(),
            used_bytes = read_used_bytes(&db)?,
            "Chunk store opened"
        );
        Ok(Self::with_db(db))
    }

    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self::with_db(db))
    }

    fn with_db(db: Db) -> Self {
        Self {
            db,
            manifests: RwLock::new(HashMap::new()),
        }
    }

    /// Records the manifest chunks of `manifest.file_id` are verified against.
    pub fn register_manifest(&self, manifest: &FileManifest) -> Result<()> {
        manifest.validate()?;
        if let Some(existing) = self.manifest(&manifest.file_id)? {
            if *existing != *manifest {
                return Err(SwarmError::InvalidInput(format!(
                    "conflicting manifest for {}",
                    manifest.file_id
                )));
            }
            return Ok(());
        }

        let raw = serde_json::to_vec(manifest).map_err(|e| SwarmError::Corrupt(e.to_string()))?;
        self.db.insert(manifest_key(&manifest.file_id), raw)?;
        self.manifests
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(manifest.file_id.clone(), Arc::new(manifest.clone()));
        Ok(())
    }

    pub fn manifest(&self, file_id: &str) -> Result<Option<Arc<FileManifest>>> {
        if let Some(m) = self
            .manifests
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(file_id)
        {
            return Ok(Some(Arc::clone(m)));
        }

        let Some(raw) = self.db.get(manifest_key(file_id))? else {
            return Ok(None);
        };
        let manifest: FileManifest =
            serde_json::from_slice(&raw).map_err(|e| SwarmError::Corrupt(e.to_string()))?;
        let manifest = Arc::new(manifest);
        self.manifests
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(file_id.to_string(), Arc::clone(&manifest));
        Ok(Some(manifest))
    }

    pub fn known_files(&self) -> Result<Vec<FileId>> {
        let mut ids = Vec::new();
        for entry in self.db.scan_prefix(MANIFEST_PREFIX) {
            let (key, _) = entry?;
            ids.push(String::from_utf8_lossy(&key[MANIFEST_PREFIX.len()..]).into_owned());
        }
        Ok(ids)
    }

    /// Verifies `bytes` against the manifest hash for `index` and stores them.
    ///
    /// A mismatch leaves the record for `index` untouched. Concurrent writers
    /// of the same key race on a compare-and-swap; losers get `AlreadyPresent`.
    pub fn put(&self, file_id: &str, index: u32, bytes: &[u8]) -> Result<PutOutcome> {
        let manifest = self
            .manifest(file_id)?
            .ok_or_else(|| SwarmError::UnknownFile(file_id.to_string()))?;
        let matches = manifest.verify_chunk(index, bytes).map_err(|e| match e {
            ManifestError::ChunkOutOfRange { .. } => SwarmError::InvalidInput(e.to_string()),
            other => SwarmError::Manifest(other),
        })?;
        if !matches {
            return Err(SwarmError::HashMismatch {
                file_id: file_id.to_string(),
                index,
            });
        }

        let key = chunk_key(file_id, index);
        match self
            .db
            .compare_and_swap(&key, None::<&[u8]>, Some(bytes))?
        {
            Ok(()) => {
                add_used_bytes(&self.db, bytes.len() as u64)?;
                debug!(%file_id, chunk = index, len = bytes.len(), "Chunk stored");
                Ok(PutOutcome::Stored)
            }
            Err(_) => Ok(PutOutcome::AlreadyPresent),
        }
    }

    pub fn get(&self, file_id: &str, index: u32) -> Result<Bytes> {
        match self.db.get(chunk_key(file_id, index))? {
            Some(v) => Ok(Bytes::from(v.to_vec())),
            None => Err(SwarmError::NotFound {
                file_id: file_id.to_string(),
                index,
            }),
        }
    }

    /// Indices currently stored for `file_id`, all of them verified.
    pub fn has(&self, file_id: &str) -> Result<BTreeSet<u32>> {
        let prefix = chunk_prefix(file_id);
        let mut held = BTreeSet::new();
        for entry in self.db.scan_prefix(&prefix) {
            let (key, _) = entry?;
            let tail = &key[prefix.len()..];
            let Ok(idx) = <[u8; 4]>::try_from(tail) else {
                continue;
            };
            held.insert(u32::from_be_bytes(idx));
        }
        Ok(held)
    }

    pub fn reassemble(&self, file_id: &str) -> Result<Vec<u8>> {
        let manifest = self
            .manifest(file_id)?
            .ok_or_else(|| SwarmError::UnknownFile(file_id.to_string()))?;

        let mut storage_err = None;
        let assembled = reassemble(&manifest, |idx| match self.db.get(chunk_key(file_id, idx)) {
            Ok(v) => v,
            Err(e) => {
                storage_err.get_or_insert(e);
                None
            }
        });
        if let Some(e) = storage_err {
            return Err(e.into());
        }
        assembled.map_err(|e| match e {
            ManifestError::Incomplete { first_missing } => SwarmError::Incomplete {
                file_id: file_id.to_string(),
                first_missing,
            },
            other => SwarmError::Manifest(other),
        })
    }

    /// Stores every chunk of a locally split file.
    pub fn import_file(&self, manifest: &FileManifest, data: &[u8]) -> Result<()> {
        self.register_manifest(manifest)?;
        for (idx, slice) in chunk_slices(manifest, data) {
            self.put(&manifest.file_id, idx, slice)?;
        }
        Ok(())
    }

    /// Writes the reassembled file into `dir` under its manifest filename.
    pub fn write_reassembled(&self, file_id: &str, dir: &Path) -> Result<PathBuf> {
        let data = self.reassemble(file_id)?;
        let manifest = self
            .manifest(file_id)?
            .ok_or_else(|| SwarmError::UnknownFile(file_id.to_string()))?;

        // Only the final component of a remote filename is trusted.
        let name = Path::new(&manifest.filename)
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| file_id.into());
        std::fs::create_dir_all(dir)?;
        let path = dir.join(name);
        std::fs::write(&path, data)?;
        Ok(path)
    }

    pub fn used_bytes(&self) -> Result<u64> {
        read_used_bytes(&self.db)
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn manifest_key(file_id: &str) -> Vec<u8> {
    [MANIFEST_PREFIX, file_id.as_bytes()].concat()
}

fn chunk_prefix(file_id: &str) -> Vec<u8> {
    [CHUNK_PREFIX, file_id.as_bytes(), &[0u8][..]].concat()
}

/// Big-endian index so a prefix scan walks chunks in ascending order.
fn chunk_key(file_id: &str, index: u32) -> Vec<u8> {
    let mut key = chunk_prefix(file_id);
    key.extend_from_slice(&index.to_be_bytes());
    key
}

fn read_used_bytes(db: &Db) -> Result<u64> {
    let Some(v) = db.get(USED_BYTES_KEY)? else {
        return Ok(0);
    };
    Ok(decode_u64(&v))
}

fn add_used_bytes(db: &Db, delta: u64) -> Result<()> {
    db.update_and_fetch(USED_BYTES_KEY, |old| {
        let current = old.map(decode_u64).unwrap_or(0);
        Some(current.saturating_add(delta).to_le_bytes().to_vec())
    })?;
    Ok(())
}

fn decode_u64(raw: &[u8]) -> u64 {
    <[u8; 8]>::try_from(raw).map(u64::from_le_bytes).unwrap_or(0)
}
