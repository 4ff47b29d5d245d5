//! Host environment probes: SIP, AMFI, FileVault, secure boot, NVRAM,
//! loaded kexts, network reachability and persisted patch state.
//!
//! The resolver consumes these through the [`Environment`] trait so detection
//! is deterministic under test; [`LiveEnvironment`] is the production
//! implementation over macOS tooling.

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{self, PatcherSettings};
use crate::models::AmfiLevel;
use crate::resources;
use crate::system;

/// Read-only view of the booted system's security and state facts.
pub trait Environment {
    /// Raw csr-active-config bitmask (0 when SIP is fully enabled).
    fn csr_active_config(&self) -> u32;

    /// Current kernel boot arguments.
    fn boot_args(&self) -> String;

    /// NVRAM variable lookup, decoded to text.
    fn nvram(&self, key: &str) -> Option<String>;

    fn filevault_enabled(&self) -> bool;

    fn secure_boot_model_enabled(&self) -> bool;

    /// Version of a loaded kext, if present.
    fn loaded_kext_version(&self, bundle_id: &str) -> Option<String>;

    fn network_available(&self) -> bool;

    /// A Kernel Debug Kit usable for this build/version is already on disk.
    fn kdk_installed(&self, build: &str, version: &str) -> bool;

    /// A Metal support package for this build/version is already on disk.
    fn metallib_installed(&self, build: &str, version: &str) -> bool;

    /// Capability names recorded by a prior patch session on the booted root.
    fn applied_patches(&self) -> Vec<String>;

    /// Developer override unlocks patching outside the supported OS window.
    fn developer_override(&self) -> bool;
}

/// Whether the current AMFI boot configuration is at least as relaxed as the
/// given requirement.
pub fn amfi_configuration_satisfies(level: AmfiLevel, boot_args: &str) -> bool {
    let full_disable = boot_args.contains("amfi=-1")
        || boot_args.contains("amfi=0x80")
        || boot_args.contains("amfi_get_out_of_my_way=1")
        || boot_args.contains("amfi_get_out_of_my_way=0x1");

    match level {
        AmfiLevel::NoCheck => true,
        AmfiLevel::LibraryValidation => {
            full_disable || boot_args.contains("amfi_allow_any_signature=1")
        }
        AmfiLevel::FullDisable => full_disable,
    }
}

/// Decode nvram(8) percent-escaped output ("%77%08%00%00") into raw bytes.
pub fn decode_nvram_bytes(raw: &str) -> Vec<u8> {
    let mut out = Vec::new();
    let bytes = raw.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Some(value) = raw
                .get(i + 1..i + 3)
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            {
                out.push(value);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

/// Production environment over macOS tooling.
pub struct LiveEnvironment {
    settings: PatcherSettings,
}

static KEXT_VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\(([0-9][0-9.]*)\)").expect("invalid kext version regex"));

impl LiveEnvironment {
    pub fn new(settings: PatcherSettings) -> Self {
        LiveEnvironment { settings }
    }

    fn nvram_raw(&self, key: &str) -> Option<String> {
        let output = system::run_and_capture(&["/usr/sbin/nvram", key]).ok()?;
        if !output.status.success() {
            return None;
        }
        let text = String::from_utf8_lossy(&output.stdout);
        // nvram prints "<name>\t<value>"
        let value = text.splitn(2, '\t').nth(1)?.trim_end_matches('\n');
        Some(value.to_string())
    }
}

impl Environment for LiveEnvironment {
    fn csr_active_config(&self) -> u32 {
        let Some(raw) = self.nvram_raw("csr-active-config") else {
            return 0;
        };
        let bytes = decode_nvram_bytes(&raw);
        let mut value: u32 = 0;
        for (i, b) in bytes.iter().take(4).enumerate() {
            value |= u32::from(*b) << (8 * i);
        }
        value
    }

    fn boot_args(&self) -> String {
        self.nvram_raw("boot-args").unwrap_or_default()
    }

    fn nvram(&self, key: &str) -> Option<String> {
        self.nvram_raw(key)
    }

    fn filevault_enabled(&self) -> bool {
        // A prior patch session may have marked FileVault as compatible
        if let Some(settings_var) = self.nvram_raw("rootpatch-settings") {
            if settings_var.contains("-allow_fv") {
                return false;
            }
        }
        match system::run_and_capture(&["/usr/bin/fdesetup", "status"]) {
            Ok(output) => {
                !String::from_utf8_lossy(&output.stdout).contains("FileVault is Off")
            }
            Err(_) => false,
        }
    }

    fn secure_boot_model_enabled(&self) -> bool {
        match self.nvram_raw("94B73556-2197-4702-82A8-3E1337DAFBFB:HardwareModel") {
            Some(model) => !model.starts_with("x86legacy"),
            None => false,
        }
    }

    fn loaded_kext_version(&self, bundle_id: &str) -> Option<String> {
        let output = system::run_and_capture(&[
            "/usr/bin/kmutil",
            "showloaded",
            "--list-only",
            "--bundle-identifier",
            bundle_id,
        ])
        .ok()?;
        let text = String::from_utf8_lossy(&output.stdout);
        let line = text.lines().find(|l| l.contains(bundle_id))?;
        let caps = KEXT_VERSION_RE.captures(line)?;
        Some(caps.get(1)?.as_str().to_string())
    }

    fn network_available(&self) -> bool {
        let client = match reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
        {
            Ok(c) => c,
            Err(_) => return false,
        };
        client
            .head(config::NETWORK_PROBE_LINK)
            .send()
            .map(|r| r.status().is_success() || r.status().is_redirection())
            .unwrap_or(false)
    }

    fn kdk_installed(&self, build: &str, version: &str) -> bool {
        resources::kdk::local_kdk_installed(Path::new(config::KDK_INSTALL_ROOT), build, version)
            .is_some()
    }

    fn metallib_installed(&self, build: &str, version: &str) -> bool {
        resources::metallib::installed_metallib(build, version).is_some()
    }

    fn applied_patches(&self) -> Vec<String> {
        read_applied_patches(Path::new(config::PATCHSET_PLIST_BOOTED))
    }

    fn developer_override(&self) -> bool {
        if self.settings.developer_mode {
            return true;
        }
        dirs::home_dir()
            .map(|h| h.join(config::DEVELOPER_OVERRIDE_FILE).exists())
            .unwrap_or(false)
    }
}

/// Read capability names from a persisted patch-state plist. Missing or
/// unparseable state reads as "nothing applied".
pub fn read_applied_patches(plist_path: &Path) -> Vec<String> {
    if !plist_path.exists() {
        return Vec::new();
    }
    match plist::Value::from_file(plist_path) {
        Ok(plist::Value::Dictionary(dict)) => dict.keys().cloned().collect(),
        Ok(_) => Vec::new(),
        Err(e) => {
            log::warn!(
                "failed to parse patch-state plist at {}: {}",
                plist_path.display(),
                e
            );
            Vec::new()
        }
    }
}

/// Path of the persisted patch-state plist on a mounted system volume.
pub fn patchset_plist_path(mount_location: &Path) -> PathBuf {
    mount_location.join(config::PATCHSET_PLIST_RELATIVE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_nvram_bytes() {
        assert_eq!(decode_nvram_bytes("%77%08%00%00"), vec![0x77, 0x08, 0, 0]);
        assert_eq!(decode_nvram_bytes("plain"), b"plain".to_vec());
        assert_eq!(decode_nvram_bytes("a%20b"), b"a b".to_vec());
    }

    #[test]
    fn test_amfi_no_check_always_satisfied() {
        assert!(amfi_configuration_satisfies(AmfiLevel::NoCheck, ""));
        assert!(amfi_configuration_satisfies(AmfiLevel::NoCheck, "-v"));
    }

    #[test]
    fn test_amfi_full_disable_flags() {
        assert!(!amfi_configuration_satisfies(AmfiLevel::FullDisable, ""));
        assert!(amfi_configuration_satisfies(
            AmfiLevel::FullDisable,
            "-v amfi=0x80"
        ));
        assert!(amfi_configuration_satisfies(
            AmfiLevel::FullDisable,
            "amfi_get_out_of_my_way=1"
        ));
    }

    #[test]
    fn test_amfi_library_validation_accepts_partial() {
        assert!(amfi_configuration_satisfies(
            AmfiLevel::LibraryValidation,
            "amfi_allow_any_signature=1"
        ));
        assert!(amfi_configuration_satisfies(
            AmfiLevel::LibraryValidation,
            "amfi=0x80"
        ));
        assert!(!amfi_configuration_satisfies(
            AmfiLevel::LibraryValidation,
            "keepsyms=1"
        ));
    }

    #[test]
    fn test_read_applied_patches_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let patches = read_applied_patches(&dir.path().join("nope.plist"));
        assert!(patches.is_empty());
    }

    #[test]
    fn test_read_applied_patches_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rootpatch.plist");

        let mut dict = plist::Dictionary::new();
        dict.insert(
            "Networking: Modern Wireless".to_string(),
            plist::Value::String("2.4.0 (2026-01-01)".to_string()),
        );
        plist::Value::Dictionary(dict).to_file_xml(&path).unwrap();

        let patches = read_applied_patches(&path);
        assert_eq!(patches, vec!["Networking: Modern Wireless".to_string()]);
    }
}
