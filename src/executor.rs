//! Root volume patch execution.
//!
//! Interprets a resolved patch plan against the mounted root volume:
//! pre-flight source resolution and existence checks, removes, installs
//! (system volume before data volume), post-install commands, persisted
//! patch-state write-back, cache rebuilds and snapshot sealing.
//!
//! Execution fails loudly on any step. Pre-flight failures abort before any
//! mutation; once mutation begins there is no in-process rollback — the
//! previous sealed snapshot remains the bootable safety net.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::catalog::graphics::{
    INTEL_SANDY_BRIDGE_NAME, METAL_3802_COMMON_EXTENDED_NAME, SHADER_CACHE_SENSITIVE_NAMES,
};
use crate::catalog::misc::USB11_CONTROLLER_NAME;
use crate::config::PatcherSettings;
use crate::error::PatchError;
use crate::host;
use crate::kernelcache::{
    rebuild_dyld_shared_cache, update_preboot_kernel_cache, KernelCacheSupport,
    RebuildKernelCache,
};
use crate::models::{
    DynamicResource, HostProfile, InstallAction, MacOsRelease, OsTarget, PatchPlan, PatchSource,
    PatchType, VolumeTarget,
};
use crate::mount::{self, ApfsSnapshot, RootVolumeMount};
use crate::resolver::PatchsetResolution;
use crate::resources::{self, kdk::KernelDebugKitMerge, metallib, ManifestCache};
use crate::system;

/// Resolve an install action's source to the concrete on-disk path checked
/// during pre-flight. Dynamic sources must be resolved to Absolute first.
pub fn resolve_source_path(
    source: &PatchSource,
    directory: &str,
    file: &str,
    payload_root: &Path,
) -> Result<PathBuf, PatchError> {
    let relative = directory.trim_start_matches('/');
    match source {
        PatchSource::Bundle(prefix) => Ok(payload_root.join(prefix).join(relative).join(file)),
        PatchSource::Absolute(root) => Ok(root.join(relative).join(file)),
        PatchSource::Dynamic(_) => Err(PatchError::SourceMissing(PathBuf::from(format!(
            "unresolved dynamic source for {}/{}",
            directory, file
        )))),
    }
}

/// Check that every install source in the plan exists on disk. Runs over the
/// whole plan before any volume mutation; the first missing source aborts.
pub fn verify_plan_sources(plan: &PatchPlan, payload_root: &Path) -> Result<(), PatchError> {
    for entry in &plan.entries {
        for action in &entry.installs {
            let source =
                resolve_source_path(&action.source, &action.directory, &action.file, payload_root)?;
            if !source.exists() {
                return Err(PatchError::SourceMissing(source));
            }
        }
    }
    Ok(())
}

/// Install actions in execution order: system volume first, then data volume.
pub fn ordered_installs(installs: &[InstallAction]) -> Vec<&InstallAction> {
    let mut ordered: Vec<&InstallAction> = installs
        .iter()
        .filter(|a| a.kind.volume() == Some(VolumeTarget::System))
        .collect();
    ordered.extend(
        installs
            .iter()
            .filter(|a| a.kind.volume() == Some(VolumeTarget::Data)),
    );
    ordered
}

/// Drives one patch or unpatch session against the root volume.
///
/// Exactly one session may be active at a time; the mount point is a single
/// fixed filesystem location and concurrent invocations are the caller's
/// responsibility to prevent.
pub struct RootVolumePatcher {
    model: String,
    target: OsTarget,
    host: Arc<HostProfile>,
    settings: PatcherSettings,
    resolution: PatchsetResolution,
    cache: ManifestCache,

    mount: RootVolumeMount,
    mount_location: PathBuf,
    /// Data-volume paths resolve against the live root, not the mount.
    mount_location_data: String,

    skip_root_kmutil_requirement: bool,
    needs_kmutil_exemptions: bool,
    needs_user_approval: bool,
    kdk_path: Option<PathBuf>,
    metallib_path: Option<PathBuf>,
}

impl RootVolumePatcher {
    pub fn new(
        model: impl Into<String>,
        target: OsTarget,
        host: Arc<HostProfile>,
        settings: PatcherSettings,
        resolution: PatchsetResolution,
    ) -> Self {
        let mount = RootVolumeMount::new(&target);
        let mount_location = mount.mount_location().to_path_buf();
        let skip_root_kmutil_requirement = if target.at_least(MacOsRelease::Ventura) {
            !resolution.validation.kdk_required
        } else {
            false
        };

        RootVolumePatcher {
            model: model.into(),
            target,
            host,
            settings,
            resolution,
            cache: ManifestCache::new(),
            mount,
            mount_location,
            mount_location_data: String::new(),
            skip_root_kmutil_requirement,
            needs_kmutil_exemptions: false,
            needs_user_approval: false,
            kdk_path: None,
            metallib_path: None,
        }
    }

    /// Whether installs were re-routed into the auxiliary collection, so the
    /// caller can tell the user to approve the new drivers.
    pub fn needs_user_approval(&self) -> bool {
        self.needs_user_approval
    }

    fn destination_dir(&self, kind: PatchType, directory: &str) -> PathBuf {
        match kind.volume() {
            Some(VolumeTarget::System) => {
                PathBuf::from(format!("{}{}", self.mount_location.display(), directory))
            }
            _ => PathBuf::from(format!("{}{}", self.mount_location_data, directory)),
        }
    }

    fn kernel_cache_support(&self) -> KernelCacheSupport {
        let data_root = if self.mount_location_data.is_empty() {
            Path::new("/")
        } else {
            Path::new(&self.mount_location_data)
        };
        KernelCacheSupport::new(data_root, self.skip_root_kmutil_requirement)
    }

    // ------------------------------------------------------------------
    // Pre-flight
    // ------------------------------------------------------------------

    /// Resolve dynamic placeholders to concrete local paths, fetching the
    /// Metal support package on demand. Memoized per session.
    fn resolve_dynamic_source(&mut self, resource: DynamicResource) -> Result<PathBuf, PatchError> {
        match resource {
            DynamicResource::MetalSupportPackage => {
                if let Some(path) = &self.metallib_path {
                    return Ok(path.clone());
                }
                let path = metallib::resolve_metal_support_package(
                    &self.settings,
                    &self.cache,
                    &self.target,
                )
                .map_err(|e| {
                    log::error!("Unable to resolve Metal support package: {}", e);
                    PatchError::SupportResourcesMissing(e.to_string())
                })?;
                self.metallib_path = Some(path.clone());
                Ok(path)
            }
        }
    }

    fn resolve_plan_sources(&mut self, plan: &mut PatchPlan) -> Result<(), PatchError> {
        for entry_index in 0..plan.entries.len() {
            for action_index in 0..plan.entries[entry_index].installs.len() {
                let dynamic = match &plan.entries[entry_index].installs[action_index].source {
                    PatchSource::Dynamic(resource) => *resource,
                    _ => continue,
                };
                let resolved = self.resolve_dynamic_source(dynamic)?;
                plan.entries[entry_index].installs[action_index].source =
                    PatchSource::Absolute(resolved);
            }
        }
        Ok(())
    }

    /// Non-Metal hosts accumulate SkyLight plugins from prior sessions; start
    /// each session from an empty plugin directory.
    fn clean_skylight_plugins(&self) -> Result<(), PatchError> {
        let plugins = format!(
            "{}/Library/Application Support/SkyLightPlugins",
            self.mount_location_data
        );
        if Path::new(&plugins).exists() {
            log::info!("- Found SkyLightPlugins folder, removing old plugins");
            system::run_elevated_and_verify(&["/bin/rm", "-Rf", &plugins])?;
        } else {
            log::info!("- Creating SkyLightPlugins folder");
        }
        system::run_elevated_and_verify(&["/bin/mkdir", "-p", &plugins])?;
        Ok(())
    }

    /// Remove forced-OpenGL rendering preferences left by development use.
    fn delete_nonmetal_enforcement(&self) {
        for arg in ["useMetal", "useIOP"] {
            let read = system::run_and_capture(&[
                "/usr/bin/defaults",
                "read",
                "/Library/Preferences/com.apple.CoreDisplay",
                arg,
            ]);
            let Ok(output) = read else { continue };
            let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if ["0", "false", "1", "true"].contains(&value.as_str()) {
                log::info!("- Removing non-Metal enforcement preference: {}", arg);
                system::run_elevated_allow_failure(&[
                    "/usr/bin/defaults",
                    "delete",
                    "/Library/Preferences/com.apple.CoreDisplay",
                    arg,
                ]);
            }
        }
    }

    /// The payload's Sandy Bridge framebuffer kext pins supported board-ids;
    /// inject this host's so the kext matches at boot.
    fn sync_sandy_bridge_board_id(&self) -> Result<(), PatchError> {
        let info_plist = self
            .settings
            .payload_root
            .join(format!("10.13.6-{}", self.target.xnu_major))
            .join("System/Library/Extensions/AppleIntelSNBGraphicsFB.kext/Contents/Info.plist");
        if !info_plist.exists() {
            return Ok(());
        }

        log::info!(
            "- Syncing Sandy Bridge board-id to {}",
            self.host.board_id
        );
        let mut root = plist::Value::from_file(&info_plist)
            .map_err(|e| PatchError::PatchsetState(format!("SNB Info.plist parse: {}", e)))?;
        if let Some(personalities) = root
            .as_dictionary_mut()
            .and_then(|d| d.get_mut("IOKitPersonalities"))
            .and_then(|v| v.as_dictionary_mut())
        {
            for personality in personalities.values_mut() {
                if let Some(dict) = personality.as_dictionary_mut() {
                    if dict.get("board-id").is_some() {
                        dict.insert(
                            "board-id".to_string(),
                            plist::Value::String(self.host.board_id.clone()),
                        );
                    }
                }
            }
        }
        root.to_file_xml(&info_plist)
            .map_err(|e| PatchError::PatchsetState(format!("SNB Info.plist write: {}", e)))?;
        Ok(())
    }

    fn merge_kdk_with_root(&mut self, save_hid_cs: bool) -> Result<(), PatchError> {
        let merge = KernelDebugKitMerge::new(
            &self.settings,
            &self.cache,
            &self.target,
            &self.mount_location,
            self.skip_root_kmutil_requirement,
        );
        self.kdk_path = merge.merge(save_hid_cs).map_err(|e| {
            log::error!("KDK merge failed: {}", e);
            PatchError::SupportResourcesMissing(e.to_string())
        })?;
        Ok(())
    }

    /// All pre-flight work. Completes for the entire plan before any volume
    /// mutation begins.
    fn preflight(&mut self, plan: &mut PatchPlan) -> Result<(), PatchError> {
        log::info!("- Running pre-flight checks before patching");

        self.resolve_plan_sources(plan)?;
        verify_plan_sources(plan, &self.settings.payload_root)?;

        self.clean_skylight_plugins()?;
        self.delete_nonmetal_enforcement();

        let keep: Vec<String> = plan
            .entries
            .iter()
            .flat_map(|e| e.installs.iter().map(|a| a.file.clone()))
            .collect();
        self.kernel_cache_support().clean_auxiliary_kc(&keep)?;

        if plan.contains(INTEL_SANDY_BRIDGE_NAME) {
            self.sync_sandy_bridge_board_id()?;
        }

        self.merge_kdk_with_root(plan.contains(USB11_CONTROLLER_NAME))?;

        log::info!("- Pre-flight checks complete, continuing with patching");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    fn remove_file(&self, directory: &Path, file: &str) -> Result<(), PatchError> {
        let target = directory.join(file);
        if !target.exists() {
            return Ok(());
        }
        log::info!("- Removing: {}", target.display());
        let target_str = target.to_string_lossy();
        system::run_elevated_and_verify(&["/bin/rm", "-Rf", &target_str])?;
        Ok(())
    }

    fn install_new_file(
        &self,
        source: &Path,
        destination_dir: &Path,
        file: &str,
        kind: PatchType,
    ) -> Result<(), PatchError> {
        let dest_str = destination_dir.to_string_lossy().to_string();
        system::run_elevated_and_verify(&["/bin/mkdir", "-p", &dest_str])?;

        let destination = destination_dir.join(file);
        let source_str = source.to_string_lossy();
        let destination_str = destination.to_string_lossy();

        if kind.is_merge() {
            log::info!("- Merging: {} -> {}", file, destination_dir.display());
        } else {
            log::info!("- Installing: {} -> {}", file, destination_dir.display());
            if destination.exists() {
                system::run_elevated_and_verify(&["/bin/rm", "-Rf", &destination_str])?;
            }
        }
        // ditto unions directory trees without touching unrelated siblings
        system::run_elevated_and_verify(&["/usr/bin/ditto", &source_str, &destination_str])?;
        Ok(())
    }

    fn execute_entry(&mut self, plan: &mut PatchPlan, entry_index: usize) -> Result<(), PatchError> {
        let kc_support = self.kernel_cache_support();
        log::info!(
            "- Installing patchset: {}",
            plan.entries[entry_index].capability
        );

        for remove in plan.entries[entry_index].removes.clone() {
            let directory = self.destination_dir(remove.kind, &remove.directory);
            self.remove_file(&directory, &remove.file)?;
        }

        let install_order: Vec<usize> = {
            let installs = &plan.entries[entry_index].installs;
            let mut order: Vec<usize> = (0..installs.len())
                .filter(|&i| installs[i].kind.volume() == Some(VolumeTarget::System))
                .collect();
            order.extend(
                (0..installs.len())
                    .filter(|&i| installs[i].kind.volume() == Some(VolumeTarget::Data)),
            );
            order
        };

        for action_index in install_order {
            let action = plan.entries[entry_index].installs[action_index].clone();
            let mut destination = self.destination_dir(action.kind, &action.directory);

            // Installing a kext outside the system volume means it loads from
            // the auxiliary collection and may need user approval
            if action.kind.volume() == Some(VolumeTarget::Data)
                && action.directory == "/Library/Extensions"
            {
                self.needs_kmutil_exemptions = true;
                if kc_support.kext_needs_authentication(&action.file) {
                    self.needs_user_approval = true;
                }
            }

            if let Some(rerouted) = kc_support.reroute_for_auxiliary(&action.file, &destination) {
                log::info!(
                    "- Re-routing {} into the auxiliary collection",
                    action.file
                );
                self.needs_kmutil_exemptions = true;
                if kc_support.kext_needs_authentication(&action.file) {
                    self.needs_user_approval = true;
                }
                // Record the redirect in the plan so the persisted state and
                // any retry see the real destination
                let entry = &mut plan.entries[entry_index].installs[action_index];
                entry.kind = PatchType::OverwriteDataVolume;
                entry.directory = "/Library/Extensions".to_string();
                destination = rerouted;
            }

            let source = resolve_source_path(
                &action.source,
                &action.directory,
                &action.file,
                &self.settings.payload_root,
            )?;
            self.install_new_file(&source, &destination, &action.file, action.kind)?;
        }

        for command in plan.entries[entry_index].commands.clone() {
            let argv: Vec<&str> = command.command.split(' ').collect();
            if command.elevated {
                log::info!("- Running process as root: {}", command.command);
                system::run_elevated_and_verify(&argv)?;
            } else {
                log::info!("- Running process: {}", command.command);
                system::run_and_verify(&argv)?;
            }
        }
        Ok(())
    }

    /// Legacy discrete AMD GPUs misrender with cached shaders.
    fn disable_window_server_caching(&self) {
        log::info!("- Disabling window server shader caching");
        system::run_elevated_allow_failure(&[
            "/usr/bin/defaults",
            "write",
            "/Library/Preferences/com.apple.windowserver.plist",
            "CGShaderCachingMode",
            "-int",
            "0",
        ]);
    }

    /// The replaced 3802 compiler frameworks need an ad-hoc re-sign to load
    /// on library-validated hosts.
    fn patch_gpu_compiler_libraries(&self) -> Result<(), PatchError> {
        log::info!("- Re-signing GPU compiler libraries");
        for framework in ["GPUCompiler.framework", "MTLCompiler.framework"] {
            let path = self
                .mount_location
                .join("System/Library/PrivateFrameworks")
                .join(framework);
            if !path.exists() {
                continue;
            }
            let path_str = path.to_string_lossy();
            system::run_elevated_and_verify(&[
                "/usr/bin/codesign",
                "-f",
                "-s",
                "-",
                "--deep",
                &path_str,
            ])?;
        }
        Ok(())
    }

    /// Record every applied capability on the patched volume. This is the
    /// state the next resolution pass reads to detect prior installation.
    fn write_patchset(&self, plan: &PatchPlan) -> Result<(), PatchError> {
        log::info!("- Writing patchset information to root volume");
        let marker = format!("{} ({})", self.settings.patcher_version, self.target.os_build);

        let mut dict = plist::Dictionary::new();
        for name in plan.capability_names() {
            dict.insert(name, plist::Value::String(marker.clone()));
        }
        if let Some(kdk) = &self.kdk_path {
            dict.insert(
                "Kernel Debug Kit Used".to_string(),
                plist::Value::String(kdk.to_string_lossy().to_string()),
            );
        }
        if let Some(metallib) = &self.metallib_path {
            dict.insert(
                "Metal Support Package Used".to_string(),
                plist::Value::String(metallib.to_string_lossy().to_string()),
            );
        }

        let staged = tempfile::NamedTempFile::new()?;
        plist::Value::Dictionary(dict)
            .to_file_xml(staged.path())
            .map_err(|e| PatchError::PatchsetState(e.to_string()))?;

        let destination = host::patchset_plist_path(&self.mount_location);
        let destination_str = destination.to_string_lossy().to_string();
        if destination.exists() {
            system::run_elevated_and_verify(&["/bin/rm", &destination_str])?;
        }
        let staged_str = staged.path().to_string_lossy().to_string();
        system::run_elevated_and_verify(&["/bin/cp", &staged_str, &destination_str])?;
        Ok(())
    }

    fn execute_plan(&mut self, plan: &mut PatchPlan) -> Result<(), PatchError> {
        for entry_index in 0..plan.entries.len() {
            self.execute_entry(plan, entry_index)?;
        }

        if SHADER_CACHE_SENSITIVE_NAMES
            .iter()
            .any(|name| plan.contains(name))
        {
            self.disable_window_server_caching();
        }
        if plan.contains(METAL_3802_COMMON_EXTENDED_NAME) {
            self.patch_gpu_compiler_libraries()?;
        }

        self.write_patchset(plan)
    }

    // ------------------------------------------------------------------
    // Cache rebuild and snapshot
    // ------------------------------------------------------------------

    fn rebuild_root_volume(&mut self) -> Result<(), PatchError> {
        RebuildKernelCache::new(
            &self.target,
            &self.mount_location,
            self.needs_kmutil_exemptions,
            self.skip_root_kmutil_requirement,
        )
        .rebuild()?;

        update_preboot_kernel_cache(&self.target)?;
        rebuild_dyld_shared_cache(&self.target, &self.mount_location)?;

        ApfsSnapshot::new(&self.target, &self.mount_location).create_snapshot()?;
        self.mount.unmount();

        log::info!("- Patching complete");
        log::info!("Please reboot the machine for patches to take effect");
        if self.needs_kmutil_exemptions {
            log::info!(
                "Note: macOS will ask you to approve the new kernel extensions under System Settings -> Privacy & Security"
            );
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Entry points
    // ------------------------------------------------------------------

    /// Apply the resolved patchset to the root volume.
    pub fn start_patch(&mut self) -> Result<(), PatchError> {
        log::info!("- Starting patching process for {}", self.model);
        log::info!(
            "- Determined patchset for Darwin {}.{}",
            self.target.xnu_major,
            self.target.xnu_minor
        );

        if self.resolution.plan.is_empty() {
            log::info!("- This machine needs no root volume patches!");
            return Ok(());
        }

        if !self.resolution.can_patch {
            log::error!("- Cannot continue with patching");
            self.resolution.log_detailed_errors();
            return Err(PatchError::ValidationBlocked(
                "blocking validation gates are raised".to_string(),
            ));
        }

        resources::ensure_payload_available(&self.settings)?;
        self.mount.mount()?;

        if let Err(e) = mount::verify_mounted_build(&self.mount_location, &self.target) {
            self.mount.unmount();
            log::error!("- Sanity checks failed, cannot continue patching");
            return Err(e);
        }

        let mut plan = self.resolution.plan.clone();
        let result = self
            .preflight(&mut plan)
            .and_then(|()| self.execute_plan(&mut plan))
            .and_then(|()| self.rebuild_root_volume());

        if result.is_err() {
            // Volume is left mounted and unsealed; the previous snapshot is
            // untouched and still bootable
            log::error!("- Patching failed, no new snapshot was created");
        }
        result
    }

    /// Revert to the prior sealed snapshot and clean derived state. Never
    /// mounts read-write for file edits — this is a snapshot-pointer
    /// operation.
    pub fn start_unpatch(&mut self) -> Result<(), PatchError> {
        log::info!("- Starting unpatching process");

        if !self.resolution.can_unpatch {
            log::error!("- Cannot unpatch the root volume");
            self.resolution.log_detailed_errors();
            return Err(PatchError::ValidationBlocked(
                "SIP blocks snapshot reversion".to_string(),
            ));
        }

        self.mount.mount()?;
        ApfsSnapshot::new(&self.target, &self.mount_location).revert_snapshot()?;

        self.clean_skylight_plugins()?;
        self.delete_nonmetal_enforcement();
        self.kernel_cache_support().clean_auxiliary_kc(&[])?;
        self.mount.unmount();

        log::info!("- Unpatching complete");
        log::info!("Please reboot the machine for changes to take effect");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CapabilityPatches;

    #[test]
    fn test_resolve_source_path_bundle() {
        let source = PatchSource::Bundle("13.7.2-23".to_string());
        let path = resolve_source_path(
            &source,
            "/System/Library/Extensions",
            "AMDRadeonX4000.kext",
            Path::new("/payloads"),
        )
        .unwrap();
        assert_eq!(
            path,
            PathBuf::from("/payloads/13.7.2-23/System/Library/Extensions/AMDRadeonX4000.kext")
        );
    }

    #[test]
    fn test_resolve_source_path_absolute() {
        let source = PatchSource::Absolute(PathBuf::from("/Library/metallibs/15.1-24B83"));
        let path = resolve_source_path(
            &source,
            "/System/Library/Frameworks",
            "Metal.framework",
            Path::new("/payloads"),
        )
        .unwrap();
        assert_eq!(
            path,
            PathBuf::from("/Library/metallibs/15.1-24B83/System/Library/Frameworks/Metal.framework")
        );
    }

    #[test]
    fn test_resolve_source_path_dynamic_is_an_error() {
        let source = PatchSource::Dynamic(DynamicResource::MetalSupportPackage);
        let result = resolve_source_path(&source, "/dir", "file", Path::new("/payloads"));
        assert!(matches!(result, Err(PatchError::SourceMissing(_))));
    }

    #[test]
    fn test_verify_plan_sources_missing() {
        let dir = tempfile::tempdir().unwrap();
        let mut plan = PatchPlan::new();
        plan.merge(CapabilityPatches::new("Graphics: Test").overwrite_system(
            "/System/Library/Extensions",
            &[("Missing.kext", PatchSource::Bundle("1.0".to_string()))],
        ));
        let result = verify_plan_sources(&plan, dir.path());
        assert!(matches!(result, Err(PatchError::SourceMissing(_))));
    }

    #[test]
    fn test_verify_plan_sources_present() {
        let dir = tempfile::tempdir().unwrap();
        let kext = dir
            .path()
            .join("1.0/System/Library/Extensions/Present.kext");
        std::fs::create_dir_all(&kext).unwrap();

        let mut plan = PatchPlan::new();
        plan.merge(CapabilityPatches::new("Graphics: Test").overwrite_system(
            "/System/Library/Extensions",
            &[("Present.kext", PatchSource::Bundle("1.0".to_string()))],
        ));
        assert!(verify_plan_sources(&plan, dir.path()).is_ok());
    }

    #[test]
    fn test_ordered_installs_system_before_data() {
        let patches = CapabilityPatches::new("Graphics: Test")
            .overwrite_data(
                "/Library/Extensions",
                &[("DataFirst.kext", PatchSource::Bundle("1.0".to_string()))],
            )
            .overwrite_system(
                "/System/Library/Extensions",
                &[("SystemSecond.kext", PatchSource::Bundle("1.0".to_string()))],
            );
        let ordered = ordered_installs(&patches.installs);
        assert_eq!(ordered[0].file, "SystemSecond.kext");
        assert_eq!(ordered[1].file, "DataFirst.kext");
    }
}
