//! Kernel collection and dyld shared cache rebuilds.
//!
//! After file-level patches land on the mounted root, the derived caches must
//! be regenerated or the new snapshot will not boot. Failure here is fatal to
//! the whole patch session — no snapshot is created over an unbuildable
//! kernel collection.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::PatchError;
use crate::models::{MacOsRelease, OsTarget};
use crate::system;

/// Kexts this patcher may install into the data volume's /Library/Extensions.
/// Anything else found there is not ours to clean.
const MANAGED_AUXILIARY_KEXTS: [&str; 4] = [
    "GeForceWeb.kext",
    "NVDAResmanWeb.kext",
    "AMDLegacySupport.kext",
    "IO80211ElCap.kext",
];

/// Ad-hoc or non-notarized kexts whose auxiliary-collection load requires the
/// user to approve them in the security preference pane.
const KEXTS_NEEDING_APPROVAL: [&str; 3] = [
    "GeForceWeb.kext",
    "NVDAResmanWeb.kext",
    "AMDLegacySupport.kext",
];

/// Rebuilds the boot/system kernel collections for the mounted root.
pub struct RebuildKernelCache {
    target: OsTarget,
    mount_location: PathBuf,
    /// Also rebuild the auxiliary collection (kexts in /Library/Extensions).
    auxiliary_cache: bool,
    /// Restrict to the auxiliary collection; used when the session lacks
    /// full kernel-collection authorization (no KDK on Ventura and newer).
    auxiliary_cache_only: bool,
}

impl RebuildKernelCache {
    pub fn new(
        target: &OsTarget,
        mount_location: &Path,
        auxiliary_cache: bool,
        auxiliary_cache_only: bool,
    ) -> Self {
        RebuildKernelCache {
            target: target.clone(),
            mount_location: mount_location.to_path_buf(),
            auxiliary_cache,
            auxiliary_cache_only,
        }
    }

    fn kmutil_arguments(&self) -> Vec<String> {
        let mut args: Vec<String> = vec!["/usr/bin/kmutil".to_string()];

        if self.target.at_least(MacOsRelease::Ventura) {
            args.push("create".to_string());
            // Ventura removed on-disk kext binaries; the merged KDK fills the
            // gap, but partial merges must not abort the build
            args.push("--allow-missing-kdk".to_string());
        } else {
            args.push("install".to_string());
        }

        args.push("--volume-root".to_string());
        args.push(self.mount_location.to_string_lossy().to_string());

        if self.auxiliary_cache_only {
            args.push("--boot-path".to_string());
            args.push(
                self.mount_location
                    .join("System/Library/KernelCollections/BootKernelExtensions.kc")
                    .to_string_lossy()
                    .to_string(),
            );
        } else {
            args.push("--update-all".to_string());
        }

        args.push("--variant-suffix".to_string());
        args.push("release".to_string());

        if self.auxiliary_cache || self.auxiliary_cache_only {
            // Skip kext consent prompts while SIP is down
            args.push("--no-authentication".to_string());
            args.push("--no-authorization".to_string());
        }

        args
    }

    pub fn rebuild(&self) -> Result<(), PatchError> {
        let scope = if self.auxiliary_cache_only {
            "auxiliary"
        } else if self.auxiliary_cache {
            "boot, system and auxiliary"
        } else {
            "boot and system"
        };
        log::info!("- Rebuilding {} kernel collections", scope);
        if self.auxiliary_cache {
            log::info!("  (a system preferences prompt may appear, ignore it for now)");
        }

        let args = self.kmutil_arguments();
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        system::run_elevated_and_verify(&arg_refs)
            .map_err(|e| PatchError::KernelCollection(e.to_string()))?;
        Ok(())
    }
}

/// Rebuild the dyld shared cache. Only required on Catalina and older.
pub fn rebuild_dyld_shared_cache(target: &OsTarget, mount_location: &Path) -> Result<(), PatchError> {
    if target.xnu_major > MacOsRelease::Catalina.major() {
        return Ok(());
    }
    log::info!("- Rebuilding dyld shared cache");
    let root = format!("{}/", mount_location.to_string_lossy());
    system::run_elevated_and_verify(&["/usr/bin/update_dyld_shared_cache", "-root", &root])?;
    Ok(())
}

/// Copy the kernel cache into the Preboot volume. Only required on Catalina.
pub fn update_preboot_kernel_cache(target: &OsTarget) -> Result<(), PatchError> {
    if target.xnu_major != MacOsRelease::Catalina.major() {
        return Ok(());
    }
    log::info!("- Rebuilding preboot kernel cache");
    system::run_elevated_and_verify(&["/usr/sbin/kcditto"])?;
    Ok(())
}

/// Auxiliary kernel collection support: destination re-routing for kexts that
/// cannot enter the boot collection, approval tracking, and cleanup of stale
/// managed kexts.
pub struct KernelCacheSupport {
    mount_location_data: PathBuf,
    skip_root_kmutil_requirement: bool,
}

impl KernelCacheSupport {
    pub fn new(mount_location_data: &Path, skip_root_kmutil_requirement: bool) -> Self {
        KernelCacheSupport {
            mount_location_data: mount_location_data.to_path_buf(),
            skip_root_kmutil_requirement,
        }
    }

    /// Whether loading this kext from the auxiliary collection will trigger a
    /// user-approval prompt in the security preference pane.
    pub fn kext_needs_authentication(&self, kext_name: &str) -> bool {
        KEXTS_NEEDING_APPROVAL.contains(&kext_name)
    }

    /// Re-route a system-volume kext install into the data volume's
    /// /Library/Extensions when the session cannot rebuild the full kernel
    /// collection. Returns the replacement destination, or None when the
    /// original destination stands.
    pub fn reroute_for_auxiliary(&self, file: &str, destination: &Path) -> Option<PathBuf> {
        if !self.skip_root_kmutil_requirement {
            return None;
        }
        if !file.ends_with(".kext") {
            return None;
        }
        if !destination.ends_with("System/Library/Extensions") {
            return None;
        }
        Some(self.mount_location_data.join("Library/Extensions"))
    }

    /// Remove managed kexts from /Library/Extensions that are not part of the
    /// current plan, so stale drivers never land in the auxiliary collection.
    pub fn clean_auxiliary_kc(&self, keep: &[String]) -> Result<Vec<String>, PatchError> {
        let extensions = self.mount_location_data.join("Library/Extensions");
        let mut removed = Vec::new();
        if !extensions.is_dir() {
            return Ok(removed);
        }

        for entry in fs::read_dir(&extensions)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !MANAGED_AUXILIARY_KEXTS.contains(&name.as_str()) {
                continue;
            }
            if keep.iter().any(|k| k == &name) {
                continue;
            }
            log::info!("- Removing stale auxiliary kext: {}", name);
            let path = entry.path().to_string_lossy().to_string();
            system::run_elevated_and_verify(&["/bin/rm", "-Rf", &path])?;
            removed.push(name);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kmutil_arguments_pre_ventura() {
        let rebuild = RebuildKernelCache::new(
            &OsTarget::new(21, 0, "21G72", "12.5"),
            Path::new("/System/Volumes/Update/mnt1"),
            false,
            false,
        );
        let args = rebuild.kmutil_arguments();
        assert_eq!(args[1], "install");
        assert!(!args.contains(&"--allow-missing-kdk".to_string()));
        assert!(args.contains(&"--update-all".to_string()));
        assert!(!args.contains(&"--no-authentication".to_string()));
    }

    #[test]
    fn test_kmutil_arguments_ventura_auxiliary() {
        let rebuild = RebuildKernelCache::new(
            &OsTarget::new(22, 0, "22G91", "13.5"),
            Path::new("/System/Volumes/Update/mnt1"),
            true,
            false,
        );
        let args = rebuild.kmutil_arguments();
        assert_eq!(args[1], "create");
        assert!(args.contains(&"--allow-missing-kdk".to_string()));
        assert!(args.contains(&"--no-authentication".to_string()));
        assert!(args.contains(&"--no-authorization".to_string()));
    }

    #[test]
    fn test_kmutil_arguments_auxiliary_only() {
        let rebuild = RebuildKernelCache::new(
            &OsTarget::new(22, 0, "22G91", "13.5"),
            Path::new("/System/Volumes/Update/mnt1"),
            false,
            true,
        );
        let args = rebuild.kmutil_arguments();
        assert!(!args.contains(&"--update-all".to_string()));
        assert!(args.iter().any(|a| a == "--boot-path"));
        assert!(args.contains(&"--no-authentication".to_string()));
    }

    #[test]
    fn test_reroute_only_when_unauthorized() {
        let authorized = KernelCacheSupport::new(Path::new(""), false);
        assert!(authorized
            .reroute_for_auxiliary(
                "GeForceWeb.kext",
                Path::new("/System/Volumes/Update/mnt1/System/Library/Extensions")
            )
            .is_none());

        let unauthorized = KernelCacheSupport::new(Path::new(""), true);
        let rerouted = unauthorized.reroute_for_auxiliary(
            "GeForceWeb.kext",
            Path::new("/System/Volumes/Update/mnt1/System/Library/Extensions"),
        );
        assert_eq!(rerouted, Some(PathBuf::from("Library/Extensions")));
    }

    #[test]
    fn test_reroute_ignores_non_kexts() {
        let support = KernelCacheSupport::new(Path::new(""), true);
        assert!(support
            .reroute_for_auxiliary(
                "SkyLight.framework",
                Path::new("/System/Volumes/Update/mnt1/System/Library/Extensions")
            )
            .is_none());
    }

    #[test]
    fn test_kext_approval_list() {
        let support = KernelCacheSupport::new(Path::new(""), false);
        assert!(support.kext_needs_authentication("GeForceWeb.kext"));
        assert!(!support.kext_needs_authentication("IO80211Family.kext"));
    }

    #[test]
    fn test_clean_auxiliary_kc_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let support = KernelCacheSupport::new(dir.path(), true);
        let removed = support.clean_auxiliary_kc(&[]).unwrap();
        assert!(removed.is_empty());
    }
}
