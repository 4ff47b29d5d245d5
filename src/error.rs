//! Unified error type hierarchy for rootpatch
//!
//! Provides structured error handling with PatchError, ResourceError and
//! ConfigError. Blocking validation conditions are NOT errors — they are
//! surfaced as boolean gates in the resolver's output so callers can render
//! why patching is blocked without unwinding.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Root volume patching errors.
///
/// Pre-flight variants (SourceMissing, BuildMismatch, MountFailed) are raised
/// before any volume mutation; the remaining variants can occur after the
/// volume has been modified, in which case the previous sealed snapshot is
/// the recovery path.
#[derive(Error, Debug)]
pub enum PatchError {
    #[error("Patch source not found on disk: {0}")]
    SourceMissing(PathBuf),

    #[error("SystemVersion build mismatch: found {found}, expected {expected} (OS update in progress)")]
    BuildMismatch { found: String, expected: String },

    #[error("Failed to mount root volume: {0}")]
    MountFailed(String),

    #[error("Command '{cmd}' failed: {reason}")]
    CommandFailed { cmd: String, reason: String },

    #[error("Kernel collection rebuild failed: {0}")]
    KernelCollection(String),

    #[error("APFS snapshot operation failed: {0}")]
    SnapshotFailed(String),

    #[error("Patching blocked by validation: {0}")]
    ValidationBlocked(String),

    #[error("Patcher support resources unavailable: {0}")]
    SupportResourcesMissing(String),

    #[error("Failed to read or write patchset state: {0}")]
    PatchsetState(String),

    #[error("IO error during patching: {0}")]
    IoError(#[from] io::Error),
}

/// Auxiliary resource (KDK / Metal support package) errors.
#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("Manifest fetch failed: {0}")]
    ManifestUnavailable(String),

    #[error("No matching resource for build {build} ({version})")]
    NoMatch { build: String, version: String },

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Resource installation failed: {0}")]
    InstallFailed(String),

    #[error("Command '{cmd}' failed: {reason}")]
    CommandFailed { cmd: String, reason: String },

    #[error("IO error during resource handling: {0}")]
    IoError(#[from] io::Error),
}

impl From<PatchError> for ResourceError {
    fn from(e: PatchError) -> Self {
        match e {
            PatchError::CommandFailed { cmd, reason } => ResourceError::CommandFailed { cmd, reason },
            other => ResourceError::InstallFailed(other.to_string()),
        }
    }
}

/// Settings file parsing and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Settings file not found: {0}")]
    FileNotFound(String),

    #[error("Invalid JSON in settings: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Settings validation failed: {0}")]
    ValidationFailed(String),

    #[error("IO error during settings operations: {0}")]
    IoError(#[from] io::Error),
}

/// Top-level result type for patch session operations.
pub type Result<T> = std::result::Result<T, PatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_error_display() {
        let err = PatchError::SourceMissing(PathBuf::from("/tmp/missing.kext"));
        assert_eq!(
            err.to_string(),
            "Patch source not found on disk: /tmp/missing.kext"
        );
    }

    #[test]
    fn test_build_mismatch_display() {
        let err = PatchError::BuildMismatch {
            found: "23A344".to_string(),
            expected: "23B74".to_string(),
        };
        assert!(err.to_string().contains("23A344"));
        assert!(err.to_string().contains("23B74"));
    }

    #[test]
    fn test_resource_error_from_patch_error() {
        let err = PatchError::CommandFailed {
            cmd: "/usr/bin/ditto".to_string(),
            reason: "exit status 1".to_string(),
        };
        let res: ResourceError = err.into();
        assert!(matches!(res, ResourceError::CommandFailed { .. }));
    }

    #[test]
    fn test_result_type_ok() {
        let result: Result<i32> = Ok(42);
        assert!(result.is_ok());
    }
}
