use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write as _};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::category::normalize_archive_path;
use crate::error::{RestoreError, Result};
use crate::platform::fs as pfs;

/// Upper bound for a `.chunked` marker body. Hostile archives must not be
/// able to force unbounded metadata reads.
pub const MAX_CHUNK_METADATA_BYTES: u64 = 1024 * 1024;

/// JSON body of a `<path>.chunked` marker entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkedFileMetadata {
    pub version: u32,
    pub size_bytes: u64,
    pub chunk_size_bytes: u64,
    pub chunk_count: u32,
    pub sha256: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mod_time_unix_nano: i64,
}

/// `<path>.chunked` → logical path of the file being reassembled.
pub fn marker_logical_name(archive_name: &str) -> Option<String> {
    let normalized = normalize_archive_path(archive_name);
    normalized
        .strip_suffix(".chunked")
        .filter(|s| !s.is_empty() && *s != "./")
        .map(normalize_archive_path)
}

/// `chunked_files/<logical>.NNN.chunk` → (logical path, chunk number).
pub fn chunk_piece_name(archive_name: &str) -> Option<(String, u32)> {
    let normalized = normalize_archive_path(archive_name);
    let rest = normalized.strip_prefix("./chunked_files/")?;
    let rest = rest.strip_suffix(".chunk")?;
    let (logical, digits) = rest.rsplit_once('.')?;
    if logical.is_empty() || digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let index: u32 = digits.parse().ok()?;
    Some((normalize_archive_path(logical), index))
}

/// Buffers chunk metadata and spooled chunk bodies until a logical file is
/// complete, then reassembles and verifies it. Chunk bodies go to a spool
/// directory rather than memory so multi-GB files cannot exhaust RAM.
pub struct ChunkAssembler {
    spool_dir: PathBuf,
    pending_meta: HashMap<String, ChunkedFileMetadata>,
    chunks: HashMap<String, BTreeMap<u32, PathBuf>>,
    seq: u64,
}

impl ChunkAssembler {
    pub fn new(spool_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&spool_dir)?;
        Ok(Self {
            spool_dir,
            pending_meta: HashMap::new(),
            chunks: HashMap::new(),
            seq: 0,
        })
    }

    pub fn note_metadata(&mut self, logical: String, meta: ChunkedFileMetadata) {
        self.pending_meta.insert(logical, meta);
    }

    pub fn parse_metadata(body: &[u8]) -> Result<ChunkedFileMetadata> {
        if body.len() as u64 > MAX_CHUNK_METADATA_BYTES {
            return Err(RestoreError::InvalidArchive(format!(
                "chunk metadata exceeds {MAX_CHUNK_METADATA_BYTES} bytes"
            )));
        }
        Ok(serde_json::from_slice(body)?)
    }

    /// Spool one chunk body to disk.
    pub fn note_chunk<R: Read>(&mut self, logical: String, index: u32, body: &mut R) -> Result<()> {
        self.seq += 1;
        let spool_path = self.spool_dir.join(format!("{:08}.chunk", self.seq));
        let mut out = std::fs::File::create(&spool_path)?;
        std::io::copy(body, &mut out)?;
        out.flush()?;
        self.chunks
            .entry(logical)
            .or_default()
            .insert(index, spool_path);
        Ok(())
    }

    /// A logical file is ready once its metadata has been seen and every
    /// chunk the metadata promises has arrived.
    pub fn ready(&self, logical: &str) -> bool {
        match (self.pending_meta.get(logical), self.chunks.get(logical)) {
            (Some(meta), Some(chunks)) => chunks.len() as u32 >= meta.chunk_count,
            (Some(meta), None) => meta.chunk_count == 0,
            _ => false,
        }
    }

    /// Concatenate spooled chunks in numeric order into `target`, verify
    /// length and SHA-256, then apply mode/ownership/timestamps. On any
    /// mismatch the partial target is removed and the error reported;
    /// the caller treats this as a per-file failure.
    pub fn assemble(&mut self, logical: &str, target: &Path) -> Result<u64> {
        let meta = self
            .pending_meta
            .remove(logical)
            .ok_or_else(|| RestoreError::InvalidArchive(format!("no metadata for {logical}")))?;
        let chunk_map = self.chunks.remove(logical).unwrap_or_default();

        let result = assemble_into(&meta, &chunk_map, target);
        for spool_path in chunk_map.values() {
            let _ = std::fs::remove_file(spool_path);
        }
        if result.is_err() {
            let _ = std::fs::remove_file(target);
        }
        result
    }

    /// Logical names that never completed; reported as warnings when the
    /// archive stream ends.
    pub fn leftovers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .pending_meta
            .keys()
            .chain(self.chunks.keys())
            .cloned()
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

fn assemble_into(
    meta: &ChunkedFileMetadata,
    chunk_map: &BTreeMap<u32, PathBuf>,
    target: &Path,
) -> Result<u64> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let _ = std::fs::remove_file(target);
    let mut out = std::fs::File::create(target)?;

    let mut hasher = Sha256::new();
    let mut written = 0u64;
    for spool_path in chunk_map.values() {
        let mut chunk = std::fs::File::open(spool_path)?;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = chunk.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            out.write_all(&buf[..n])?;
            written += n as u64;
        }
    }
    out.flush()?;
    drop(out);

    if written != meta.size_bytes {
        return Err(RestoreError::InvalidArchive(format!(
            "chunked file size mismatch: expected {} bytes, wrote {written}",
            meta.size_bytes
        )));
    }
    let digest = hex::encode(hasher.finalize());
    if !digest.eq_ignore_ascii_case(&meta.sha256) {
        return Err(RestoreError::InvalidArchive(format!(
            "chunked file checksum mismatch: expected {}, got {digest}",
            meta.sha256
        )));
    }

    let _ = pfs::apply_mode(target, meta.mode);
    if let Err(e) = pfs::apply_owner(target, meta.uid, meta.gid) {
        tracing::debug!("chunked: keeping current ownership on {}: {e}", target.display());
    }
    let _ = pfs::set_file_times(target, None, meta.mod_time_unix_nano);

    Ok(written)
}
