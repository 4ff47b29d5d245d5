//! Patcher settings and fixed constants.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Fixed mount point for the writable root volume on snapshot-based systems.
pub const ROOT_MOUNT_LOCATION: &str = "/System/Volumes/Update/mnt1";

/// Persisted patch-state plist, relative to the system volume.
pub const PATCHSET_PLIST_RELATIVE: &str = "System/Library/CoreServices/rootpatch.plist";

/// Absolute path of the persisted patch-state plist on the booted volume.
pub const PATCHSET_PLIST_BOOTED: &str = "/System/Library/CoreServices/rootpatch.plist";

/// KdkSupportPkg manifest endpoints.
pub const KDK_API_LINK: &str = "https://dortania.github.io/KdkSupportPkg/manifest.json";
pub const KDK_API_LINK_PROXY: &str =
    "https://mirror.ghproxy.com/https://dortania.github.io/KdkSupportPkg/manifest.json";

/// MetallibSupportPkg manifest endpoints.
pub const METALLIB_API_LINK: &str = "https://dortania.github.io/MetallibSupportPkg/manifest.json";
pub const METALLIB_API_LINK_PROXY: &str =
    "https://mirror.ghproxy.com/https://dortania.github.io/MetallibSupportPkg/manifest.json";

/// Reachability probe used for the missing-network validation gate.
pub const NETWORK_PROBE_LINK: &str = "https://dortania.github.io/";

/// Where downloaded KDKs are installed by Apple's package.
pub const KDK_INSTALL_ROOT: &str = "/Library/Developer/KDKs";

/// Compatibility-shim kext that, when loaded at or above this version,
/// makes the AMFI validation gate unnecessary.
pub const AMFIPASS_BUNDLE_ID: &str = "com.dhinakg.AMFIPass";
pub const AMFIPASS_COMPATIBILITY_VERSION: &str = "1.4.0";

/// Developer-mode override marker, checked in the user's home directory.
pub const DEVELOPER_OVERRIDE_FILE: &str = ".rootpatch_developer";

/// User-tunable patcher settings, persisted as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatcherSettings {
    pub payload_root: PathBuf,      // Unpacked patch payload directory
    pub payload_dmg: Option<PathBuf>, // Sealed payload image, attached on demand
    pub use_github_proxy: bool,     // Route manifest fetches through the proxy
    pub force_usb11_patch: bool,    // Force the USB 1.1 patchset on
    pub developer_mode: bool,       // Skip host-OS window checks
    pub patcher_version: String,    // Version marker written to patched roots
}

impl Default for PatcherSettings {
    fn default() -> Self {
        PatcherSettings {
            payload_root: PathBuf::from("/Library/Application Support/rootpatch/payloads"),
            payload_dmg: None,
            use_github_proxy: false,
            force_usb11_patch: false,
            developer_mode: false,
            patcher_version: crate::VERSION.to_string(),
        }
    }
}

impl PatcherSettings {
    /// Manifest endpoint for KDK lookups, honoring the proxy toggle.
    pub fn kdk_api_link(&self) -> &'static str {
        if self.use_github_proxy {
            KDK_API_LINK_PROXY
        } else {
            KDK_API_LINK
        }
    }

    /// Manifest endpoint for Metal support package lookups.
    pub fn metallib_api_link(&self) -> &'static str {
        if self.use_github_proxy {
            METALLIB_API_LINK_PROXY
        } else {
            METALLIB_API_LINK
        }
    }
}

/// Get the global settings path: ~/Library/Application Support/rootpatch/settings.json
pub fn get_global_settings_path() -> Result<PathBuf, ConfigError> {
    let home = dirs::home_dir().ok_or_else(|| {
        ConfigError::ValidationFailed("Cannot determine home directory".to_string())
    })?;
    Ok(home
        .join("Library/Application Support/rootpatch")
        .join("settings.json"))
}

/// Load settings from a JSON file.
pub fn load_settings_from_file(path: &Path) -> Result<PatcherSettings, ConfigError> {
    validate_settings_path(path)?;

    let content = fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ConfigError::FileNotFound(format!("Settings file not found at: {}", path.display()))
        } else {
            ConfigError::IoError(e)
        }
    })?;

    let settings: PatcherSettings =
        serde_json::from_str(&content).map_err(ConfigError::InvalidJson)?;
    Ok(settings)
}

/// Save settings to a JSON file, creating parent directories as needed.
pub fn save_settings_to_file(settings: &PatcherSettings, path: &Path) -> Result<(), ConfigError> {
    validate_settings_path(path)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(ConfigError::IoError)?;
        }
    }

    let json_content = serde_json::to_string_pretty(settings).map_err(ConfigError::InvalidJson)?;
    fs::write(path, json_content).map_err(ConfigError::IoError)?;
    Ok(())
}

/// Validate settings path (.json extension required).
pub fn validate_settings_path(path: &Path) -> Result<(), ConfigError> {
    if path.as_os_str().is_empty() {
        return Err(ConfigError::ValidationFailed(
            "Settings path cannot be empty".to_string(),
        ));
    }
    match path.extension() {
        Some(ext) if ext == "json" => Ok(()),
        Some(ext) => Err(ConfigError::ValidationFailed(format!(
            "Settings file must have .json extension, got .{}",
            ext.to_string_lossy()
        ))),
        None => Err(ConfigError::ValidationFailed(
            "Settings file must have .json extension".to_string(),
        )),
    }
}
