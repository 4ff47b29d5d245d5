//! Threaded file downloads with observable progress and cooperative stop.
//!
//! Single-shot by design: a failed download reports its error and the caller
//! decides whether to retry.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

/// Read granularity; also bounds stop-flag latency.
const DOWNLOAD_CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Inactive,
    Downloading,
    Error,
    Complete,
}

impl DownloadStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => DownloadStatus::Downloading,
            2 => DownloadStatus::Error,
            3 => DownloadStatus::Complete,
            _ => DownloadStatus::Inactive,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            DownloadStatus::Inactive => 0,
            DownloadStatus::Downloading => 1,
            DownloadStatus::Error => 2,
            DownloadStatus::Complete => 3,
        }
    }
}

struct DownloadState {
    status: AtomicU8,
    downloaded: AtomicU64,
    total: AtomicU64,
    stop: AtomicBool,
    error_msg: Mutex<String>,
    checksum: Mutex<Option<String>>,
    started_at: Mutex<Option<Instant>>,
}

/// A single download. Observers poll percent/speed while the transfer runs on
/// its worker thread.
pub struct DownloadObject {
    url: String,
    path: PathBuf,
    verify_checksum: bool,
    state: Arc<DownloadState>,
}

impl DownloadObject {
    pub fn new(url: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        DownloadObject {
            url: url.into(),
            path: path.into(),
            verify_checksum: false,
            state: Arc::new(DownloadState {
                status: AtomicU8::new(DownloadStatus::Inactive.as_u8()),
                downloaded: AtomicU64::new(0),
                total: AtomicU64::new(0),
                stop: AtomicBool::new(false),
                error_msg: Mutex::new(String::new()),
                checksum: Mutex::new(None),
                started_at: Mutex::new(None),
            }),
        }
    }

    /// Accumulate a SHA-256 of the transferred bytes, readable afterwards
    /// through `checksum_hex()`.
    pub fn with_checksum(mut self) -> Self {
        self.verify_checksum = true;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn status(&self) -> DownloadStatus {
        DownloadStatus::from_u8(self.state.status.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.status() == DownloadStatus::Downloading
    }

    pub fn download_complete(&self) -> bool {
        self.status() == DownloadStatus::Complete
    }

    pub fn error_message(&self) -> String {
        self.state
            .error_msg
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.state.downloaded.load(Ordering::Acquire)
    }

    pub fn total_bytes(&self) -> u64 {
        self.state.total.load(Ordering::Acquire)
    }

    /// Percent complete, or -1.0 when the server reported no length.
    pub fn percent(&self) -> f64 {
        let total = self.total_bytes();
        if total == 0 {
            return -1.0;
        }
        (self.downloaded_bytes() as f64 / total as f64) * 100.0
    }

    /// Average transfer speed in bytes per second.
    pub fn speed(&self) -> f64 {
        let elapsed = self
            .state
            .started_at
            .lock()
            .ok()
            .and_then(|s| s.map(|t| t.elapsed().as_secs_f64()))
            .unwrap_or(0.0);
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.downloaded_bytes() as f64 / elapsed
    }

    /// Hex SHA-256 of the finished download, when checksumming was enabled.
    pub fn checksum_hex(&self) -> Option<String> {
        self.state.checksum.lock().ok().and_then(|c| c.clone())
    }

    /// Request a cooperative stop, honored within one chunk's latency.
    pub fn stop(&self) {
        self.state.stop.store(true, Ordering::Release);
    }

    fn fail(state: &DownloadState, msg: String) {
        log::error!("{}", msg);
        if let Ok(mut slot) = state.error_msg.lock() {
            *slot = msg;
        }
        state
            .status
            .store(DownloadStatus::Error.as_u8(), Ordering::Release);
    }

    fn run(url: String, path: PathBuf, verify_checksum: bool, state: Arc<DownloadState>) {
        if let Ok(mut started) = state.started_at.lock() {
            *started = Some(Instant::now());
        }

        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                Self::fail(&state, format!("failed to create {}: {}", parent.display(), e));
                return;
            }
        }
        if path.exists() {
            if let Err(e) = std::fs::remove_file(&path) {
                Self::fail(&state, format!("failed to replace {}: {}", path.display(), e));
                return;
            }
        }

        let client = match reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(format!("rootpatch/{}", crate::VERSION))
            .build()
        {
            Ok(c) => c,
            Err(e) => {
                Self::fail(&state, format!("failed to build HTTP client: {}", e));
                return;
            }
        };

        let mut response = match client.get(&url).send() {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                Self::fail(&state, format!("{} returned {}", url, r.status()));
                return;
            }
            Err(e) => {
                Self::fail(&state, format!("request to {} failed: {}", url, e));
                return;
            }
        };

        if let Some(length) = response.content_length() {
            state.total.store(length, Ordering::Release);
        }

        let mut file = match File::create(&path) {
            Ok(f) => f,
            Err(e) => {
                Self::fail(&state, format!("failed to create {}: {}", path.display(), e));
                return;
            }
        };

        let mut hasher = verify_checksum.then(Sha256::new);
        let mut buf = vec![0u8; DOWNLOAD_CHUNK_SIZE];
        loop {
            if state.stop.load(Ordering::Acquire) {
                log::info!("download of {} stopped by caller", url);
                state
                    .status
                    .store(DownloadStatus::Inactive.as_u8(), Ordering::Release);
                return;
            }

            let read = match response.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    Self::fail(&state, format!("read from {} failed: {}", url, e));
                    return;
                }
            };

            if let Err(e) = file.write_all(&buf[..read]) {
                Self::fail(&state, format!("write to {} failed: {}", path.display(), e));
                return;
            }
            if let Some(h) = hasher.as_mut() {
                h.update(&buf[..read]);
            }
            state
                .downloaded
                .fetch_add(read as u64, Ordering::AcqRel);
        }

        if let Some(h) = hasher {
            if let Ok(mut checksum) = state.checksum.lock() {
                *checksum = Some(hex::encode(h.finalize()));
            }
        }
        state
            .status
            .store(DownloadStatus::Complete.as_u8(), Ordering::Release);
    }

    /// Start the transfer on a worker thread and return immediately.
    pub fn download(&self) {
        self.state
            .status
            .store(DownloadStatus::Downloading.as_u8(), Ordering::Release);
        let url = self.url.clone();
        let path = self.path.clone();
        let verify = self.verify_checksum;
        let state = Arc::clone(&self.state);
        thread::spawn(move || Self::run(url, path, verify, state));
    }

    /// Run the transfer on the calling thread. Returns true on completion.
    pub fn download_blocking(&self) -> bool {
        self.state
            .status
            .store(DownloadStatus::Downloading.as_u8(), Ordering::Release);
        Self::run(
            self.url.clone(),
            self.path.clone(),
            self.verify_checksum,
            Arc::clone(&self.state),
        );
        self.download_complete()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let download = DownloadObject::new("https://example.invalid/file.bin", "/tmp/file.bin");
        assert_eq!(download.status(), DownloadStatus::Inactive);
        assert!(!download.is_active());
        assert_eq!(download.downloaded_bytes(), 0);
        assert_eq!(download.percent(), -1.0);
        assert_eq!(download.speed(), 0.0);
    }

    #[test]
    fn test_unreachable_host_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let download = DownloadObject::new(
            "http://127.0.0.1:1/file.bin",
            dir.path().join("file.bin"),
        );
        assert!(!download.download_blocking());
        assert_eq!(download.status(), DownloadStatus::Error);
        assert!(!download.error_message().is_empty());
    }

    #[test]
    fn test_stop_flag_set() {
        let download = DownloadObject::new("https://example.invalid/file.bin", "/tmp/file.bin");
        download.stop();
        assert!(download.state.stop.load(Ordering::Acquire));
    }

    #[test]
    fn test_percent_with_known_total() {
        let download = DownloadObject::new("https://example.invalid/file.bin", "/tmp/file.bin");
        download.state.total.store(200, Ordering::Release);
        download.state.downloaded.store(50, Ordering::Release);
        assert!((download.percent() - 25.0).abs() < f64::EPSILON);
    }
}
