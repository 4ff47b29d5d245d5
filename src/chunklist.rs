//! Chunklist-based integrity verification for large downloaded images.
//!
//! The chunklist format pairs byte-range lengths with SHA-256 digests and is
//! consumed when validating installer images and support packages. Layout
//! follows Apple's chunklist.h: a fixed 36-byte header, then `chunk_count`
//! 36-byte entries (little-endian u32 length + 32-byte digest) at
//! `chunk_offset`.
//!
//! Verification runs on a worker thread; observers poll `status()` and the
//! current/total chunk counters, or block on `wait()`.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use sha2::{Digest, Sha256};

/// Magic marker at offset 0.
const CHUNKLIST_MAGIC: &[u8; 4] = b"CNKL";

/// Bytes per chunk-table entry: u32 length + 32-byte SHA-256 digest.
const CHUNK_ENTRY_LENGTH: usize = 4 + 32;

/// Verification state, observable while the worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunklistStatus {
    InProgress,
    Success,
    Failure,
}

impl ChunklistStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ChunklistStatus::Success,
            2 => ChunklistStatus::Failure,
            _ => ChunklistStatus::InProgress,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ChunklistStatus::InProgress => 0,
            ChunklistStatus::Success => 1,
            ChunklistStatus::Failure => 2,
        }
    }
}

/// Parsed chunklist header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunklistHeader {
    pub length: u32,        // Declared header length
    pub file_version: u8,   // Format version
    pub chunk_method: u8,   // Checksum method id
    pub sig_method: u8,     // Signature method id
    pub chunk_count: u64,   // Entries in the chunk table
    pub chunk_offset: u64,  // Byte offset of the chunk table
    pub sig_offset: u64,    // Byte offset of the signature
}

/// One chunk-table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkEntry {
    pub length: u32,        // Chunk byte length
    pub checksum: [u8; 32], // Expected SHA-256
}

/// Chunklist input: a file on disk or raw bytes already in memory.
pub enum ChunklistSource {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

impl ChunklistSource {
    fn read(&self) -> std::io::Result<Vec<u8>> {
        match self {
            ChunklistSource::Path(p) => std::fs::read(p),
            ChunklistSource::Bytes(b) => Ok(b.clone()),
        }
    }
}

impl From<&Path> for ChunklistSource {
    fn from(p: &Path) -> Self {
        ChunklistSource::Path(p.to_path_buf())
    }
}

impl From<Vec<u8>> for ChunklistSource {
    fn from(b: Vec<u8>) -> Self {
        ChunklistSource::Bytes(b)
    }
}

/// Parse the header and chunk table. Returns None when the magic marker does
/// not match or the data is too short to hold what the header declares.
fn parse_chunks(data: &[u8]) -> Option<(ChunklistHeader, Vec<ChunkEntry>)> {
    if data.len() < 36 || &data[0..4] != CHUNKLIST_MAGIC {
        return None;
    }

    let header = ChunklistHeader {
        length: u32::from_le_bytes(data[4..8].try_into().ok()?),
        file_version: data[8],
        chunk_method: data[9],
        sig_method: data[10],
        chunk_count: u64::from_le_bytes(data[12..20].try_into().ok()?),
        chunk_offset: u64::from_le_bytes(data[20..28].try_into().ok()?),
        sig_offset: u64::from_le_bytes(data[28..36].try_into().ok()?),
    };

    let table_start = usize::try_from(header.chunk_offset).ok()?;
    let table_len = usize::try_from(header.chunk_count).ok()?.checked_mul(CHUNK_ENTRY_LENGTH)?;
    let table_end = table_start.checked_add(table_len)?;
    if table_end > data.len() {
        return None;
    }

    let mut chunks = Vec::with_capacity(header.chunk_count as usize);
    let table = &data[table_start..table_end];
    for entry in table.chunks_exact(CHUNK_ENTRY_LENGTH) {
        let length = u32::from_le_bytes(entry[0..4].try_into().ok()?);
        let mut checksum = [0u8; 32];
        checksum.copy_from_slice(&entry[4..CHUNK_ENTRY_LENGTH]);
        chunks.push(ChunkEntry { length, checksum });
    }

    Some((header, chunks))
}

struct VerificationState {
    status: AtomicU8,
    current_chunk: AtomicUsize,
    error_msg: Mutex<String>,
}

/// Verifies a file against a chunklist on a background thread.
///
/// ```ignore
/// let verification = ChunklistVerification::new(&image, ChunklistSource::Path(list))?;
/// verification.validate();
/// while verification.status() == ChunklistStatus::InProgress {
///     log::info!("verifying {} of {}", verification.current_chunk(), verification.total_chunks());
/// }
/// ```
pub struct ChunklistVerification {
    file_path: PathBuf,
    chunks: Option<Vec<ChunkEntry>>,
    header: Option<ChunklistHeader>,
    state: Arc<VerificationState>,
}

impl ChunklistVerification {
    /// Parse the chunklist eagerly. An unparseable chunklist (bad magic,
    /// truncated table) is not an error here — `validate()` reports
    /// immediate Failure with zero chunks processed.
    pub fn new(file_path: &Path, source: ChunklistSource) -> std::io::Result<Self> {
        let data = source.read()?;
        let parsed = parse_chunks(&data);
        let (header, chunks) = match parsed {
            Some((h, c)) => (Some(h), Some(c)),
            None => (None, None),
        };

        Ok(ChunklistVerification {
            file_path: file_path.to_path_buf(),
            chunks,
            header,
            state: Arc::new(VerificationState {
                status: AtomicU8::new(ChunklistStatus::InProgress.as_u8()),
                current_chunk: AtomicUsize::new(0),
                error_msg: Mutex::new(String::new()),
            }),
        })
    }

    /// Parsed header, absent when the chunklist was rejected.
    pub fn header(&self) -> Option<&ChunklistHeader> {
        self.header.as_ref()
    }

    pub fn status(&self) -> ChunklistStatus {
        ChunklistStatus::from_u8(self.state.status.load(Ordering::Acquire))
    }

    /// 1-based index of the chunk currently being (or last) processed.
    pub fn current_chunk(&self) -> usize {
        self.state.current_chunk.load(Ordering::Acquire)
    }

    pub fn total_chunks(&self) -> usize {
        self.chunks.as_ref().map_or(0, |c| c.len())
    }

    pub fn error_message(&self) -> String {
        self.state.error_msg.lock().map(|m| m.clone()).unwrap_or_default()
    }

    fn fail(state: &VerificationState, msg: String) {
        log::info!("{}", msg);
        if let Ok(mut slot) = state.error_msg.lock() {
            *slot = msg;
        }
        state
            .status
            .store(ChunklistStatus::Failure.as_u8(), Ordering::Release);
    }

    fn run(file_path: PathBuf, chunks: Vec<ChunkEntry>, state: Arc<VerificationState>) {
        if !file_path.is_file() {
            Self::fail(&state, format!("{} is not a file", file_path.display()));
            return;
        }

        let mut file = match File::open(&file_path) {
            Ok(f) => f,
            Err(e) => {
                Self::fail(&state, format!("failed to open {}: {}", file_path.display(), e));
                return;
            }
        };

        let mut buf = Vec::new();
        for (index, chunk) in chunks.iter().enumerate() {
            state.current_chunk.store(index + 1, Ordering::Release);

            buf.clear();
            // A short final read (file shorter than the chunklist declares)
            // hashes whatever was read and mismatches on the digest compare.
            if let Err(e) = (&mut file)
                .take(u64::from(chunk.length))
                .read_to_end(&mut buf)
            {
                Self::fail(&state, format!("read failed at chunk {}: {}", index + 1, e));
                return;
            }

            let digest: [u8; 32] = Sha256::digest(&buf).into();
            if digest != chunk.checksum {
                Self::fail(
                    &state,
                    format!(
                        "chunk {} checksum mismatch: expected {}, computed {}",
                        index + 1,
                        hex::encode(chunk.checksum),
                        hex::encode(digest)
                    ),
                );
                return;
            }
        }

        state
            .status
            .store(ChunklistStatus::Success.as_u8(), Ordering::Release);
    }

    /// Start verification on a worker thread and return immediately.
    pub fn validate(&self) {
        let chunks = match &self.chunks {
            Some(c) => c.clone(),
            None => {
                Self::fail(&self.state, "chunklist magic marker invalid".to_string());
                return;
            }
        };

        let file_path = self.file_path.clone();
        let state = Arc::clone(&self.state);
        thread::spawn(move || Self::run(file_path, chunks, state));
    }

    /// Block until verification reaches a terminal status.
    pub fn wait(&self) -> ChunklistStatus {
        loop {
            let status = self.status();
            if status != ChunklistStatus::InProgress {
                return status;
            }
            thread::sleep(std::time::Duration::from_millis(10));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build chunklist bytes covering `data` split at `boundaries`.
    fn build_chunklist(data: &[u8], chunk_sizes: &[u32]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(CHUNKLIST_MAGIC);
        out.extend_from_slice(&(36u32).to_le_bytes()); // header length
        out.push(1); // file version
        out.push(1); // chunk method: sha256
        out.push(0); // sig method
        out.push(0); // pad to offset 12
        out.extend_from_slice(&(chunk_sizes.len() as u64).to_le_bytes());
        out.extend_from_slice(&(36u64).to_le_bytes()); // chunk table right after header
        let sig_offset = 36 + chunk_sizes.len() * CHUNK_ENTRY_LENGTH;
        out.extend_from_slice(&(sig_offset as u64).to_le_bytes());

        let mut offset = 0usize;
        for size in chunk_sizes {
            let end = (offset + *size as usize).min(data.len());
            let digest: [u8; 32] = Sha256::digest(&data[offset..end]).into();
            out.extend_from_slice(&size.to_le_bytes());
            out.extend_from_slice(&digest);
            offset = end;
        }
        out
    }

    #[test]
    fn test_parse_header_fields() {
        let list = build_chunklist(&[0u8; 64], &[32, 32]);
        let (header, chunks) = parse_chunks(&list).expect("should parse");
        assert_eq!(header.chunk_count, 2);
        assert_eq!(header.chunk_offset, 36);
        assert_eq!(header.chunk_method, 1);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].length, 32);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut list = build_chunklist(&[0u8; 64], &[64]);
        list[0] = b'X';
        assert!(parse_chunks(&list).is_none());
    }

    #[test]
    fn test_truncated_table_rejected() {
        let list = build_chunklist(&[0u8; 64], &[32, 32]);
        assert!(parse_chunks(&list[..50]).is_none());
    }

    #[test]
    fn test_bad_magic_fails_with_zero_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("image.bin");
        std::fs::write(&target, b"payload").unwrap();

        let verification =
            ChunklistVerification::new(&target, ChunklistSource::Bytes(b"NOPE".to_vec())).unwrap();
        verification.validate();
        assert_eq!(verification.wait(), ChunklistStatus::Failure);
        assert_eq!(verification.current_chunk(), 0);
        assert_eq!(verification.total_chunks(), 0);
    }

    #[test]
    fn test_verification_success() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("image.bin");
        let data: Vec<u8> = (0u8..=255).cycle().take(1000).collect();
        std::fs::write(&target, &data).unwrap();

        let list = build_chunklist(&data, &[400, 400, 200]);
        let verification =
            ChunklistVerification::new(&target, ChunklistSource::Bytes(list)).unwrap();
        assert_eq!(verification.total_chunks(), 3);
        verification.validate();
        assert_eq!(verification.wait(), ChunklistStatus::Success);
        assert_eq!(verification.current_chunk(), 3);
    }

    #[test]
    fn test_flipped_byte_fails_at_owning_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("image.bin");
        let mut data: Vec<u8> = (0u8..=255).cycle().take(1000).collect();
        let list = build_chunklist(&data, &[400, 400, 200]);
        // Flip a byte inside the second chunk
        data[500] ^= 0xFF;
        std::fs::write(&target, &data).unwrap();

        let verification =
            ChunklistVerification::new(&target, ChunklistSource::Bytes(list)).unwrap();
        verification.validate();
        assert_eq!(verification.wait(), ChunklistStatus::Failure);
        assert_eq!(verification.current_chunk(), 2);
        let msg = verification.error_message();
        assert!(msg.contains("chunk 2"));
        assert!(msg.contains("expected"));
        assert!(msg.contains("computed"));
    }

    #[test]
    fn test_short_file_fails_on_final_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("image.bin");
        let data: Vec<u8> = vec![7u8; 1000];
        let list = build_chunklist(&data, &[500, 500]);
        // Write less data than the chunklist declares
        std::fs::write(&target, &data[..600]).unwrap();

        let verification =
            ChunklistVerification::new(&target, ChunklistSource::Bytes(list)).unwrap();
        verification.validate();
        assert_eq!(verification.wait(), ChunklistStatus::Failure);
        assert_eq!(verification.current_chunk(), 2);
    }

    #[test]
    fn test_chunklist_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("image.bin");
        let data = vec![42u8; 128];
        std::fs::write(&target, &data).unwrap();

        let list_path = dir.path().join("image.chunklist");
        std::fs::write(&list_path, build_chunklist(&data, &[128])).unwrap();

        let verification =
            ChunklistVerification::new(&target, ChunklistSource::Path(list_path)).unwrap();
        verification.validate();
        assert_eq!(verification.wait(), ChunklistStatus::Success);
    }
}
