//! Auxiliary resource handling: remote manifests, downloads, the Kernel
//! Debug Kit and the Metal support package, plus the local patch payload.

pub mod download;
pub mod kdk;
pub mod metallib;

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::config::PatcherSettings;
use crate::error::{PatchError, ResourceError};
use crate::system;

/// Explicit cache of fetched manifest JSON, owned by whoever coordinates a
/// session. Nothing here is process-global: tests inject prefilled caches and
/// callers invalidate when they want fresh data.
#[derive(Default)]
pub struct ManifestCache {
    entries: Mutex<HashMap<String, serde_json::Value>>,
}

impl ManifestCache {
    pub fn new() -> Self {
        ManifestCache::default()
    }

    /// Seed the cache, mainly for tests and offline operation.
    pub fn prefill(&self, url: &str, manifest: serde_json::Value) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(url.to_string(), manifest);
        }
    }

    /// Fetch a manifest, hitting the network only on a cache miss.
    pub fn get_or_fetch(&self, url: &str) -> Result<serde_json::Value, ResourceError> {
        if let Ok(entries) = self.entries.lock() {
            if let Some(cached) = entries.get(url) {
                return Ok(cached.clone());
            }
        }

        log::info!("Fetching manifest from {}", url);
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(5))
            .user_agent(format!("rootpatch/{}", crate::VERSION))
            .build()
            .map_err(|e| ResourceError::ManifestUnavailable(e.to_string()))?;

        let response = client
            .get(url)
            .send()
            .map_err(|e| ResourceError::ManifestUnavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ResourceError::ManifestUnavailable(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }

        let manifest: serde_json::Value = response
            .json()
            .map_err(|e| ResourceError::ManifestUnavailable(e.to_string()))?;

        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(url.to_string(), manifest.clone());
        }
        Ok(manifest)
    }

    /// Drop all cached manifests.
    pub fn invalidate(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

/// Ensure the local patch payload is reachable, attaching the sealed payload
/// image when only that is present.
pub fn ensure_payload_available(settings: &PatcherSettings) -> Result<(), PatchError> {
    if settings.payload_root.exists() {
        log::info!("- Local patch payload available, continuing");
        return Ok(());
    }

    let Some(dmg) = &settings.payload_dmg else {
        return Err(PatchError::SupportResourcesMissing(format!(
            "payload root {} does not exist and no payload image is configured",
            settings.payload_root.display()
        )));
    };
    if !dmg.exists() {
        return Err(PatchError::SupportResourcesMissing(format!(
            "payload image {} does not exist",
            dmg.display()
        )));
    }

    log::info!("- Attaching patch payload image");
    let dmg_str = dmg.to_string_lossy();
    let mount_str = settings.payload_root.to_string_lossy();
    system::run_elevated_and_verify(&[
        "/usr/bin/hdiutil",
        "attach",
        "-noverify",
        &dmg_str,
        "-mountpoint",
        &mount_str,
        "-nobrowse",
    ])
    .map_err(|e| PatchError::SupportResourcesMissing(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_prefilled_cache_avoids_network() {
        let cache = ManifestCache::new();
        cache.prefill("https://example.invalid/manifest.json", json!([{"build": "23B74"}]));
        let manifest = cache
            .get_or_fetch("https://example.invalid/manifest.json")
            .unwrap();
        assert_eq!(manifest[0]["build"], "23B74");
    }

    #[test]
    fn test_invalidate_clears_entries() {
        let cache = ManifestCache::new();
        cache.prefill("https://example.invalid/manifest.json", json!({}));
        cache.invalidate();
        // A fetch after invalidation would hit the (unreachable) network
        let result = cache.get_or_fetch("https://example.invalid/manifest.json");
        assert!(result.is_err());
    }

    #[test]
    fn test_payload_available_when_root_exists() {
        let dir = tempfile::tempdir().unwrap();
        let settings = PatcherSettings {
            payload_root: dir.path().to_path_buf(),
            ..Default::default()
        };
        assert!(ensure_payload_available(&settings).is_ok());
    }

    #[test]
    fn test_payload_missing_without_image() {
        let settings = PatcherSettings {
            payload_root: std::path::PathBuf::from("/nonexistent/rootpatch-payloads"),
            payload_dmg: None,
            ..Default::default()
        };
        let result = ensure_payload_available(&settings);
        assert!(matches!(
            result,
            Err(PatchError::SupportResourcesMissing(_))
        ));
    }
}
