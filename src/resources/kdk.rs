//! Kernel Debug Kit resolution, installation and root-volume merge.
//!
//! Ventura removed on-disk kext binaries, so rebuilding a kernel collection
//! that references patched extensions needs the unstripped binaries from
//! Apple's KDK merged onto the mounted root first.

use serde::Deserialize;
use std::cmp::Ordering as CmpOrdering;
use std::path::{Path, PathBuf};

use super::{download::DownloadObject, ManifestCache};
use crate::config::{self, PatcherSettings};
use crate::error::ResourceError;
use crate::models::{compare_versions, MacOsRelease, OsTarget};
use crate::system;

/// One entry of the KdkSupportPkg manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct KdkManifestEntry {
    pub build: String,
    pub version: String,
    pub url: String,
    #[serde(rename = "fileSize", default)]
    pub file_size: u64,
}

/// Staging location for a KDK image before installation.
fn kdk_download_path() -> PathBuf {
    PathBuf::from("/private/tmp/rootpatch-KDK.dmg")
}

/// Loose match granularity: same major.minor line.
fn version_line(version: &str) -> String {
    let mut parts = version.split('.');
    match (parts.next(), parts.next()) {
        (Some(major), Some(minor)) => format!("{}.{}", major, minor),
        _ => version.to_string(),
    }
}

/// Locate an installed KDK usable for the given build/version. Exact build
/// matches win; otherwise any KDK from the same version line is accepted.
pub fn local_kdk_installed(root: &Path, build: &str, version: &str) -> Option<PathBuf> {
    if !root.is_dir() {
        return None;
    }
    let mut loose: Option<PathBuf> = None;
    let line = version_line(version);

    let entries = std::fs::read_dir(root).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.ends_with(".kdk") || !path.is_dir() {
            continue;
        }
        // A KDK stripped of its extensions is useless for kmutil
        if !path.join("System/Library/Extensions").is_dir() {
            continue;
        }
        if name.contains(build) {
            return Some(path);
        }
        if loose.is_none() && name.contains(&line) {
            loose = Some(path);
        }
    }
    loose
}

/// Resolves which KDK fits a host build, preferring installed kits over
/// downloads and exact build matches over same-line fallbacks.
pub struct KernelDebugKitObject {
    pub success: bool,
    pub error_msg: String,
    pub kdk_already_installed: bool,
    pub kdk_installed_path: Option<PathBuf>,
    pub kdk_url: String,
    pub kdk_url_build: String,
    pub kdk_url_version: String,
    pub kdk_url_expected_size: u64,
    pub kdk_url_is_exactly_match: bool,
}

impl KernelDebugKitObject {
    /// Resolve for the given host build. `passive` restricts the object to
    /// local detection only — no manifest fetch, no downloads.
    pub fn new(
        settings: &PatcherSettings,
        cache: &ManifestCache,
        target: &OsTarget,
        host_build: &str,
        host_version: &str,
        passive: bool,
    ) -> Self {
        let mut object = KernelDebugKitObject {
            success: false,
            error_msg: String::new(),
            kdk_already_installed: false,
            kdk_installed_path: None,
            kdk_url: String::new(),
            kdk_url_build: String::new(),
            kdk_url_version: String::new(),
            kdk_url_expected_size: 0,
            kdk_url_is_exactly_match: false,
        };

        if target.before(MacOsRelease::Ventura) {
            // Monterey and older keep kext binaries on disk
            object.success = true;
            return object;
        }

        if let Some(path) =
            local_kdk_installed(Path::new(config::KDK_INSTALL_ROOT), host_build, host_version)
        {
            log::info!("- Found installed KDK: {}", path.display());
            object.kdk_installed_path = Some(path);
            object.kdk_already_installed = true;
            object.success = true;
            return object;
        }

        if passive {
            object.error_msg = format!("no KDK installed for {} ({})", host_version, host_build);
            return object;
        }

        let manifest = match cache.get_or_fetch(settings.kdk_api_link()) {
            Ok(m) => m,
            Err(e) => {
                object.error_msg = format!(
                    "could not reach the KdkSupportPkg API and no KDK matching {} ({}) is installed: {}",
                    host_version, host_build, e
                );
                return object;
            }
        };
        let entries: Vec<KdkManifestEntry> = match serde_json::from_value(manifest) {
            Ok(e) => e,
            Err(e) => {
                object.error_msg = format!("malformed KDK manifest: {}", e);
                return object;
            }
        };

        if let Some(exact) = entries.iter().find(|e| e.build == host_build) {
            object.kdk_url = exact.url.clone();
            object.kdk_url_build = exact.build.clone();
            object.kdk_url_version = exact.version.clone();
            object.kdk_url_expected_size = exact.file_size;
            object.kdk_url_is_exactly_match = true;
        } else {
            // Closest older kit from the catalog
            let mut candidates: Vec<&KdkManifestEntry> = entries
                .iter()
                .filter(|e| compare_versions(&e.version, host_version) != CmpOrdering::Greater)
                .collect();
            candidates.sort_by(|a, b| compare_versions(&b.version, &a.version));
            match candidates.first() {
                Some(closest) => {
                    object.kdk_url = closest.url.clone();
                    object.kdk_url_build = closest.build.clone();
                    object.kdk_url_version = closest.version.clone();
                    object.kdk_url_expected_size = closest.file_size;
                    object.kdk_url_is_exactly_match = false;
                }
                None => {
                    object.error_msg =
                        format!("no KDK found for {} ({})", host_build, host_version);
                    return object;
                }
            }
        }

        log::info!(
            "- Recommended KDK: {} ({})",
            object.kdk_url_version,
            object.kdk_url_build
        );
        object.success = true;
        object
    }

    /// Download handle for the resolved KDK, or None when nothing needs
    /// fetching (already installed, or resolution failed).
    pub fn retrieve_download(&self) -> Option<DownloadObject> {
        if self.kdk_already_installed || self.kdk_url.is_empty() {
            return None;
        }
        Some(DownloadObject::new(self.kdk_url.clone(), kdk_download_path()).with_checksum())
    }
}

/// Install a downloaded KDK image: attach, run the embedded installer pkg,
/// detach.
pub fn install_kdk_dmg(dmg_path: &Path) -> Result<(), ResourceError> {
    let mountpoint = "/private/tmp/rootpatch-kdk-mount";
    log::info!("- Installing KDK from {}", dmg_path.display());

    let dmg_str = dmg_path.to_string_lossy();
    system::run_elevated_and_verify(&[
        "/usr/bin/hdiutil",
        "attach",
        "-noverify",
        &dmg_str,
        "-mountpoint",
        mountpoint,
        "-nobrowse",
    ])
    .map_err(ResourceError::from)?;

    let result = system::run_elevated_and_verify(&[
        "/usr/sbin/installer",
        "-pkg",
        "/private/tmp/rootpatch-kdk-mount/KernelDebugKit.pkg",
        "-target",
        "/",
    ]);

    system::run_elevated_allow_failure(&["/usr/bin/hdiutil", "detach", mountpoint]);
    result.map_err(ResourceError::from)?;
    Ok(())
}

/// Merges a KDK's extensions onto the mounted root volume.
pub struct KernelDebugKitMerge<'a> {
    settings: &'a PatcherSettings,
    cache: &'a ManifestCache,
    target: &'a OsTarget,
    mount_location: PathBuf,
    skip_root_kmutil_requirement: bool,
}

impl<'a> KernelDebugKitMerge<'a> {
    pub fn new(
        settings: &'a PatcherSettings,
        cache: &'a ManifestCache,
        target: &'a OsTarget,
        mount_location: &Path,
        skip_root_kmutil_requirement: bool,
    ) -> Self {
        KernelDebugKitMerge {
            settings,
            cache,
            target,
            mount_location: mount_location.to_path_buf(),
            skip_root_kmutil_requirement,
        }
    }

    fn libkern_binary(&self) -> PathBuf {
        self.mount_location
            .join("System/Library/Extensions/System.kext/PlugIns/Libkern.kext/Libkern")
    }

    fn hid_cs_path(&self) -> PathBuf {
        self.mount_location.join(
            "System/Library/Extensions/IOHIDFamily.kext/Contents/PlugIns/IOHIDEventDriver.kext/Contents/_CodeSignature",
        )
    }

    fn hid_cs_backup(&self) -> PathBuf {
        self.settings
            .payload_root
            .join("IOHIDEventDriver_CodeSignature.bak")
    }

    /// A matching KDK from a prior session is still merged on the mounted
    /// root; re-merging would be wasted IO.
    fn matching_kdk_already_merged(&self, kdk_path: &Path) -> bool {
        let booted_plist = Path::new(config::PATCHSET_PLIST_BOOTED);
        if !booted_plist.exists() || !self.libkern_binary().exists() {
            return false;
        }
        let Ok(plist::Value::Dictionary(dict)) = plist::Value::from_file(booted_plist) else {
            return false;
        };
        match dict.get("Kernel Debug Kit Used").and_then(|v| v.as_string()) {
            Some(used) => used == kdk_path.to_string_lossy(),
            None => false,
        }
    }

    /// IOHIDFamily's code signature must survive the merge or HID devices
    /// fail validation on boot.
    fn backup_hid_cs(&self) -> Result<(), ResourceError> {
        let cs_path = self.hid_cs_path();
        if !cs_path.exists() {
            return Ok(());
        }
        log::info!("- Backing up IOHIDEventDriver CodeSignature");
        let src = cs_path.to_string_lossy();
        let dst = self.hid_cs_backup();
        let dst_str = dst.to_string_lossy();
        system::run_elevated_and_verify(&["/usr/bin/ditto", &src, &dst_str])
            .map_err(ResourceError::from)?;
        Ok(())
    }

    fn restore_hid_cs(&self) -> Result<(), ResourceError> {
        let backup = self.hid_cs_backup();
        if !backup.exists() {
            return Ok(());
        }
        log::info!("- Restoring IOHIDEventDriver CodeSignature");
        let cs_path = self.hid_cs_path();
        let cs_str = cs_path.to_string_lossy();
        if !cs_path.exists() {
            system::run_elevated_and_verify(&["/bin/mkdir", "-p", &cs_str])
                .map_err(ResourceError::from)?;
        }
        let backup_str = backup.to_string_lossy();
        system::run_elevated_and_verify(&["/usr/bin/ditto", &backup_str, &cs_str])
            .map_err(ResourceError::from)?;
        system::run_elevated_allow_failure(&["/bin/rm", "-rf", &backup_str]);
        Ok(())
    }

    fn merge_extensions(&self, kdk_path: &Path) -> Result<(), ResourceError> {
        log::info!(
            "- Merging KDK with root volume: {}",
            kdk_path.file_name().unwrap_or_default().to_string_lossy()
        );
        // Only /System/Library/Extensions matters for root patching; the
        // development kernels are dead weight here
        let src = format!("{}/System/Library/Extensions/", kdk_path.display());
        let dst = self
            .mount_location
            .join("System/Library/Extensions")
            .to_string_lossy()
            .to_string();
        system::run_elevated_and_verify(&["/usr/bin/rsync", "-r", "-i", "-a", &src, &dst])
            .map_err(ResourceError::from)?;

        if !self.libkern_binary().exists() {
            return Err(ResourceError::InstallFailed(
                "KDK merge left no Libkern binary on the root volume".to_string(),
            ));
        }
        log::info!("- Successfully merged KDK with root volume");
        Ok(())
    }

    /// Resolve, fetch if needed, and merge the KDK. Returns the KDK used, or
    /// None when the session does not need one.
    pub fn merge(&self, save_hid_cs: bool) -> Result<Option<PathBuf>, ResourceError> {
        if self.skip_root_kmutil_requirement {
            return Ok(None);
        }
        if self.target.before(MacOsRelease::Ventura) {
            return Ok(None);
        }

        let mut kdk = KernelDebugKitObject::new(
            self.settings,
            self.cache,
            self.target,
            &self.target.os_build,
            &self.target.os_version,
            false,
        );
        if !kdk.success {
            return Err(ResourceError::NoMatch {
                build: self.target.os_build.clone(),
                version: self.target.os_version.clone(),
            });
        }

        if !kdk.kdk_already_installed {
            let download = kdk.retrieve_download().ok_or_else(|| {
                ResourceError::DownloadFailed(format!(
                    "could not retrieve KDK: {}",
                    kdk.error_msg
                ))
            })?;
            if !download.download_blocking() {
                return Err(ResourceError::DownloadFailed(download.error_message()));
            }
            install_kdk_dmg(download.path())?;

            // Re-resolve to pick up the freshly installed path
            kdk = KernelDebugKitObject::new(
                self.settings,
                self.cache,
                self.target,
                &self.target.os_build,
                &self.target.os_version,
                false,
            );
            if !kdk.kdk_already_installed {
                return Err(ResourceError::InstallFailed(format!(
                    "KDK was not installed, but should have been: {}",
                    kdk.error_msg
                )));
            }
        }

        let kdk_path = kdk.kdk_installed_path.ok_or_else(|| {
            ResourceError::InstallFailed("unable to find Kernel Debug Kit".to_string())
        })?;
        log::info!("- Using KDK at {}", kdk_path.display());

        if self.matching_kdk_already_merged(&kdk_path) {
            log::info!("- Matching KDK already merged, skipping");
            return Ok(Some(kdk_path));
        }

        if save_hid_cs {
            self.backup_hid_cs()?;
        }
        self.merge_extensions(&kdk_path)?;
        if save_hid_cs {
            self.restore_hid_cs()?;
        }

        Ok(Some(kdk_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_kdk_dir(root: &Path, name: &str) {
        std::fs::create_dir_all(
            root.join(name).join("System/Library/Extensions"),
        )
        .unwrap();
    }

    #[test]
    fn test_local_kdk_exact_match() {
        let dir = tempfile::tempdir().unwrap();
        make_kdk_dir(dir.path(), "KDK_14.1_23B74.kdk");
        make_kdk_dir(dir.path(), "KDK_14.0_23A344.kdk");

        let found = local_kdk_installed(dir.path(), "23B74", "14.1").unwrap();
        assert!(found.to_string_lossy().contains("23B74"));
    }

    #[test]
    fn test_local_kdk_loose_match() {
        let dir = tempfile::tempdir().unwrap();
        make_kdk_dir(dir.path(), "KDK_14.1_23B74.kdk");

        // Different build, same version line
        let found = local_kdk_installed(dir.path(), "23B81", "14.1.2");
        assert!(found.is_some());
    }

    #[test]
    fn test_local_kdk_rejects_stripped_kit() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("KDK_14.1_23B74.kdk")).unwrap();
        assert!(local_kdk_installed(dir.path(), "23B74", "14.1").is_none());
    }

    #[test]
    fn test_kdk_not_needed_before_ventura() {
        let settings = PatcherSettings::default();
        let cache = ManifestCache::new();
        let target = OsTarget::new(21, 0, "21G72", "12.5");
        let kdk = KernelDebugKitObject::new(&settings, &cache, &target, "21G72", "12.5", false);
        assert!(kdk.success);
        assert!(!kdk.kdk_already_installed);
        assert!(kdk.retrieve_download().is_none());
    }

    #[test]
    fn test_manifest_exact_match_preferred() {
        let settings = PatcherSettings::default();
        let cache = ManifestCache::new();
        cache.prefill(
            settings.kdk_api_link(),
            json!([
                {"build": "23B74", "version": "14.1", "url": "https://example.invalid/kdk-14.1.dmg", "fileSize": 1000},
                {"build": "23A344", "version": "14.0", "url": "https://example.invalid/kdk-14.0.dmg", "fileSize": 900},
            ]),
        );
        let target = OsTarget::new(23, 1, "23B74", "14.1");
        let kdk = KernelDebugKitObject::new(&settings, &cache, &target, "23B74", "14.1", false);
        assert!(kdk.success);
        assert!(kdk.kdk_url_is_exactly_match);
        assert_eq!(kdk.kdk_url_build, "23B74");
    }

    #[test]
    fn test_manifest_closest_older_fallback() {
        let settings = PatcherSettings::default();
        let cache = ManifestCache::new();
        cache.prefill(
            settings.kdk_api_link(),
            json!([
                {"build": "23A344", "version": "14.0", "url": "https://example.invalid/kdk-14.0.dmg", "fileSize": 900},
                {"build": "22G91", "version": "13.5", "url": "https://example.invalid/kdk-13.5.dmg", "fileSize": 800},
            ]),
        );
        let target = OsTarget::new(23, 1, "23B74", "14.1");
        let kdk = KernelDebugKitObject::new(&settings, &cache, &target, "23B74", "14.1", false);
        assert!(kdk.success);
        assert!(!kdk.kdk_url_is_exactly_match);
        assert_eq!(kdk.kdk_url_build, "23A344");
    }

    #[test]
    fn test_passive_mode_skips_manifest() {
        let settings = PatcherSettings::default();
        // Cache intentionally empty: a manifest fetch would fail loudly
        let cache = ManifestCache::new();
        let target = OsTarget::new(23, 1, "23B74", "14.1");
        let kdk = KernelDebugKitObject::new(&settings, &cache, &target, "23B74", "14.1", true);
        assert!(!kdk.success);
        assert!(!kdk.error_msg.is_empty());
    }
}
