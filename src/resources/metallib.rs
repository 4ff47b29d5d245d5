//! Metal support package resolution and installation.
//!
//! Sequoia dropped the 3802-era Metal runtime; the downloadable support
//! package restores it. The executor resolves the dynamic
//! `MetalSupportPackage` patch source through this module during pre-flight.

use serde::Deserialize;
use std::cmp::Ordering as CmpOrdering;
use std::path::{Path, PathBuf};

use super::{download::DownloadObject, ManifestCache};
use crate::config::PatcherSettings;
use crate::error::ResourceError;
use crate::models::{compare_versions, OsTarget};
use crate::system;

/// Where installed Metal support packages land, one folder per
/// `<version>-<build>`.
pub const METALLIB_INSTALL_ROOT: &str = "/Library/Application Support/rootpatch/metallibs";

/// One entry of the MetallibSupportPkg manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct MetallibManifestEntry {
    pub build: String,
    pub version: String,
    pub url: String,
    #[serde(rename = "fileSize", default)]
    pub file_size: u64,
}

/// Staging location for the package download.
fn metallib_download_path() -> PathBuf {
    PathBuf::from("/private/tmp/rootpatch-MetallibSupportPkg.pkg")
}

/// Locate an installed Metal support package for the given build.
pub fn installed_metallib(build: &str, version: &str) -> Option<PathBuf> {
    installed_metallib_in(Path::new(METALLIB_INSTALL_ROOT), build, version)
}

fn installed_metallib_in(root: &Path, build: &str, _version: &str) -> Option<PathBuf> {
    if !root.is_dir() {
        return None;
    }
    for entry in std::fs::read_dir(root).ok()?.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.ends_with(&format!("-{}", build)) {
            return Some(path);
        }
    }
    None
}

/// Resolves which Metal support package fits a host build.
pub struct MetalLibraryObject {
    pub success: bool,
    pub error_msg: String,
    pub metallib_already_installed: bool,
    pub metallib_installed_path: Option<PathBuf>,
    pub metallib_url: String,
    pub metallib_url_build: String,
    pub metallib_url_version: String,
    pub metallib_url_expected_size: u64,
}

impl MetalLibraryObject {
    pub fn new(
        settings: &PatcherSettings,
        cache: &ManifestCache,
        host_build: &str,
        host_version: &str,
    ) -> Self {
        let mut object = MetalLibraryObject {
            success: false,
            error_msg: String::new(),
            metallib_already_installed: false,
            metallib_installed_path: None,
            metallib_url: String::new(),
            metallib_url_build: String::new(),
            metallib_url_version: String::new(),
            metallib_url_expected_size: 0,
        };

        if let Some(path) = installed_metallib(host_build, host_version) {
            log::info!("- Found installed Metal support package: {}", path.display());
            object.metallib_installed_path = Some(path);
            object.metallib_already_installed = true;
            object.success = true;
            return object;
        }

        let manifest = match cache.get_or_fetch(settings.metallib_api_link()) {
            Ok(m) => m,
            Err(e) => {
                object.error_msg = format!(
                    "could not reach the MetallibSupportPkg API and no package matching {} ({}) is installed: {}",
                    host_version, host_build, e
                );
                return object;
            }
        };
        let entries: Vec<MetallibManifestEntry> = match serde_json::from_value(manifest) {
            Ok(e) => e,
            Err(e) => {
                object.error_msg = format!("malformed Metallib manifest: {}", e);
                return object;
            }
        };

        let chosen = entries.iter().find(|e| e.build == host_build).or_else(|| {
            let mut candidates: Vec<&MetallibManifestEntry> = entries
                .iter()
                .filter(|e| compare_versions(&e.version, host_version) != CmpOrdering::Greater)
                .collect();
            candidates.sort_by(|a, b| compare_versions(&b.version, &a.version));
            candidates.first().copied()
        });

        match chosen {
            Some(entry) => {
                object.metallib_url = entry.url.clone();
                object.metallib_url_build = entry.build.clone();
                object.metallib_url_version = entry.version.clone();
                object.metallib_url_expected_size = entry.file_size;
                log::info!(
                    "- Recommended Metal support package: {} ({})",
                    entry.version,
                    entry.build
                );
                object.success = true;
            }
            None => {
                object.error_msg = format!(
                    "no Metal support package found for {} ({})",
                    host_build, host_version
                );
            }
        }
        object
    }

    /// Download handle for the resolved package, or None when nothing needs
    /// fetching.
    pub fn retrieve_download(&self) -> Option<DownloadObject> {
        if self.metallib_already_installed || self.metallib_url.is_empty() {
            return None;
        }
        Some(DownloadObject::new(self.metallib_url.clone(), metallib_download_path()))
    }

    /// Install the downloaded package.
    pub fn install_metallib(&self, pkg_path: &Path) -> Result<(), ResourceError> {
        if self.metallib_already_installed {
            return Ok(());
        }
        log::info!("- Installing Metal support package");
        let pkg_str = pkg_path.to_string_lossy();
        system::run_elevated_and_verify(&[
            "/usr/sbin/installer",
            "-pkg",
            &pkg_str,
            "-target",
            "/",
        ])
        .map_err(ResourceError::from)?;
        Ok(())
    }
}

/// Full resolution for the executor's dynamic patch source: reuse an
/// installed package or fetch-and-install one, returning its local path.
pub fn resolve_metal_support_package(
    settings: &PatcherSettings,
    cache: &ManifestCache,
    target: &OsTarget,
) -> Result<PathBuf, ResourceError> {
    let object = MetalLibraryObject::new(settings, cache, &target.os_build, &target.os_version);
    if !object.success {
        return Err(ResourceError::NoMatch {
            build: target.os_build.clone(),
            version: target.os_version.clone(),
        });
    }

    if let Some(path) = &object.metallib_installed_path {
        log::info!("- Using Metal support package at {}", path.display());
        return Ok(path.clone());
    }

    let download = object.retrieve_download().ok_or_else(|| {
        ResourceError::DownloadFailed("no Metal support package download available".to_string())
    })?;
    if !download.download_blocking() {
        return Err(ResourceError::DownloadFailed(download.error_message()));
    }
    object.install_metallib(download.path())?;

    installed_metallib(&target.os_build, &target.os_version).ok_or_else(|| {
        ResourceError::InstallFailed(
            "Metal support package installed but not found on disk".to_string(),
        )
    })
}
