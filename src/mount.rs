//! Root volume mounting and APFS snapshot management.
//!
//! The booted system volume is a sealed, read-only snapshot of an underlying
//! APFS volume. Patching mounts that underlying volume read-write at a fixed
//! auxiliary location, and sealing a fresh snapshot afterwards makes the
//! edits the boot target:
//!
//! 1. Find the root device node: `diskutil info -plist /`
//! 2. Strip the snapshot suffix: /dev/disk3s1s1 -> /dev/disk3s1
//! 3. Mount read-write: `mount_apfs -R /dev/disk3s1 /System/Volumes/Update/mnt1`
//! 4. Perform edits, rebuild caches
//! 5. Seal: `bless --folder .../CoreServices --bootefi --create-snapshot`
//!
//! Unpatching never mounts read-write — it reverts to the last sealed
//! snapshot, a pure snapshot-pointer operation.

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};

use crate::config::ROOT_MOUNT_LOCATION;
use crate::error::PatchError;
use crate::models::{MacOsRelease, OsTarget};
use crate::system;

/// Snapshot device nodes carry a trailing `sN` past the volume node.
static SNAPSHOT_SUFFIX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(/dev/disk\d+s\d+)s\d+$").expect("invalid device node regex"));

/// Strip the snapshot suffix from a device node, if present.
pub fn volume_device_node(node: &str) -> String {
    match SNAPSHOT_SUFFIX_RE.captures(node) {
        Some(caps) => caps[1].to_string(),
        None => node.to_string(),
    }
}

/// Whether the booted root is an APFS snapshot (Big Sur and newer sealed
/// system volumes).
pub fn root_is_apfs_snapshot(target: &OsTarget) -> bool {
    target.at_least(MacOsRelease::BigSur)
}

/// Mounts the live root's underlying writable volume.
pub struct RootVolumeMount {
    target: OsTarget,
    mount_location: PathBuf,
}

impl RootVolumeMount {
    pub fn new(target: &OsTarget) -> Self {
        let mount_location = if root_is_apfs_snapshot(target) {
            PathBuf::from(ROOT_MOUNT_LOCATION)
        } else {
            // Pre-snapshot roots are remounted in place
            PathBuf::from("/")
        };
        RootVolumeMount {
            target: target.clone(),
            mount_location,
        }
    }

    /// Where the writable system volume lives once mounted.
    pub fn mount_location(&self) -> &Path {
        &self.mount_location
    }

    /// Device node of the underlying volume backing the booted snapshot.
    fn root_device_node(&self) -> Result<String, PatchError> {
        let output = system::run_and_verify(&["/usr/sbin/diskutil", "info", "-plist", "/"])?;
        let value = plist::Value::from_reader_xml(&output.stdout[..])
            .map_err(|e| PatchError::MountFailed(format!("diskutil plist parse failed: {}", e)))?;
        let node = value
            .as_dictionary()
            .and_then(|d| d.get("DeviceNode"))
            .and_then(|v| v.as_string())
            .ok_or_else(|| {
                PatchError::MountFailed("diskutil output missing DeviceNode".to_string())
            })?;
        Ok(volume_device_node(node))
    }

    fn already_mounted(&self) -> bool {
        self.mount_location
            .join("System/Library/CoreServices/SystemVersion.plist")
            .exists()
            && self.mount_location != Path::new("/")
    }

    /// Mount the root volume read-write. Failures surface immediately — no
    /// silent retries against a volume we cannot see.
    pub fn mount(&self) -> Result<(), PatchError> {
        if !root_is_apfs_snapshot(&self.target) {
            log::info!("- Remounting root volume read-write in place");
            system::run_elevated_and_verify(&["/sbin/mount", "-uw", "/"])
                .map_err(|e| PatchError::MountFailed(e.to_string()))?;
            return Ok(());
        }

        if self.already_mounted() {
            log::info!("- Root volume already mounted at {}", self.mount_location.display());
            return Ok(());
        }

        let device = self.root_device_node()?;
        log::info!(
            "- Mounting root volume {} at {}",
            device,
            self.mount_location.display()
        );
        let mount_point = self.mount_location.to_string_lossy();
        system::run_elevated_and_verify(&["/sbin/mount_apfs", "-R", &device, &mount_point])
            .map_err(|e| PatchError::MountFailed(e.to_string()))?;
        Ok(())
    }

    /// Best-effort unmount; "already unmounted" is not an error.
    pub fn unmount(&self) {
        if self.mount_location == Path::new("/") {
            return;
        }
        log::info!("- Unmounting root volume");
        let mount_point = self.mount_location.to_string_lossy();
        system::run_elevated_allow_failure(&["/usr/sbin/diskutil", "unmount", &mount_point]);
    }
}

/// Creates and reverts sealed boot snapshots.
pub struct ApfsSnapshot {
    target: OsTarget,
    mount_location: PathBuf,
}

impl ApfsSnapshot {
    pub fn new(target: &OsTarget, mount_location: &Path) -> Self {
        ApfsSnapshot {
            target: target.clone(),
            mount_location: mount_location.to_path_buf(),
        }
    }

    /// Seal a new snapshot from the mounted root's current state. Must be the
    /// last write before unmount.
    pub fn create_snapshot(&self) -> Result<(), PatchError> {
        if !root_is_apfs_snapshot(&self.target) {
            return Ok(());
        }
        log::info!("- Creating new APFS snapshot for next boot");
        let folder = self
            .mount_location
            .join("System/Library/CoreServices");
        let folder = folder.to_string_lossy();
        system::run_elevated_and_verify(&[
            "/usr/sbin/bless",
            "--folder",
            &folder,
            "--bootefi",
            "--create-snapshot",
        ])
        .map_err(|e| PatchError::SnapshotFailed(e.to_string()))?;
        Ok(())
    }

    /// Roll back to the immediately-prior sealed snapshot.
    pub fn revert_snapshot(&self) -> Result<(), PatchError> {
        if !root_is_apfs_snapshot(&self.target) {
            return Err(PatchError::SnapshotFailed(
                "booted root does not support snapshots".to_string(),
            ));
        }
        if self.target.xnu_major == MacOsRelease::BigSur.major() {
            // Big Sur discards the original snapshot within a couple of
            // boots, making late rollbacks unreliable
            log::warn!("- Snapshot rollback on Big Sur may fail if the original snapshot aged out");
        }
        log::info!("- Reverting to last sealed APFS snapshot");
        let mount_point = self.mount_location.to_string_lossy();
        system::run_elevated_and_verify(&[
            "/usr/sbin/bless",
            "--mount",
            &mount_point,
            "--bootefi",
            "--last-sealed-snapshot",
        ])
        .map_err(|e| PatchError::SnapshotFailed(e.to_string()))?;
        Ok(())
    }
}

/// Pre-flight sanity check: the mounted volume must carry the same build as
/// the booted OS. A mismatch means a staged OS update is mid-flight on disk,
/// and patching a volume about to be replaced is unsafe.
pub fn verify_mounted_build(mount_location: &Path, target: &OsTarget) -> Result<(), PatchError> {
    let version_plist = mount_location.join("System/Library/CoreServices/SystemVersion.plist");
    if !version_plist.exists() {
        return Err(PatchError::MountFailed(format!(
            "SystemVersion.plist not found at {}",
            version_plist.display()
        )));
    }

    let value = plist::Value::from_file(&version_plist).map_err(|e| {
        PatchError::MountFailed(format!("failed to parse SystemVersion.plist: {}", e))
    })?;
    let found_build = value
        .as_dictionary()
        .and_then(|d| d.get("ProductBuildVersion"))
        .and_then(|v| v.as_string())
        .unwrap_or_default()
        .to_string();

    if found_build != target.os_build {
        log::error!(
            "- SystemVersion.plist build mismatch: found {}, expected {}",
            found_build,
            target.os_build
        );
        log::error!("An OS update is in progress; patching cannot continue until it completes or is cancelled");
        return Err(PatchError::BuildMismatch {
            found: found_build,
            expected: target.os_build.clone(),
        });
    }
    Ok(())
}
