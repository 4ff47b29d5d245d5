//! Patchset resolution engine.
//!
//! Aggregates all present, non-native hardware capabilities into one unified
//! patch plan: conflict stripping between rendering generations, requirement
//! propagation (KDK, Metal support package, SIP bits, AMFI level), validation
//! gate computation and the final can-patch / can-unpatch decision.
//!
//! Blocking conditions are data, not control flow — the resolver never
//! returns an error for a host that merely cannot be patched; callers inspect
//! the gates.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::catalog::{self, graphics, HardwareCapability};
use crate::config::{self, PatcherSettings};
use crate::host::{amfi_configuration_satisfies, Environment};
use crate::models::{
    compare_versions, AmfiLevel, DeviceProperties, GraphicsSubclass, HostProfile, MacOsRelease,
    OsTarget, PatchPlan, SipBit,
};

/// WhateverGreen's bundle identifier, required for Nvidia web drivers.
const WHATEVERGREEN_BUNDLE_ID: &str = "as.vit9696.WhateverGreen";

/// Capability-name prefix marking network-dependent patchsets.
const NETWORKING_PREFIX: &str = "Networking:";

pub const SETTING_KDK_REQUIRED: &str = "Settings: Kernel Debug Kit required";
pub const SETTING_KDK_MISSING: &str = "Settings: Kernel Debug Kit missing";
pub const SETTING_METALLIB_REQUIRED: &str = "Settings: Metal Support Package required";
pub const SETTING_METALLIB_MISSING: &str = "Settings: Metal Support Package missing";

/// Named validation gates. Labels are stable: they key `device_properties`
/// and are rendered directly by the GUI/CLI layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationGate {
    UnsupportedHostOs,
    MissingNetworkConnection,
    FileVaultEnabled,
    SipEnabled,
    SecureBootModelEnabled,
    AmfiEnabled,
    WhateverGreenMissing,
    ForceOpenGlMissing,
    ForceCompatMissing,
    NvdaDrvMissing,
    PatchingNotPossible,
    UnpatchingNotPossible,
}

impl ValidationGate {
    pub fn label(self) -> &'static str {
        match self {
            ValidationGate::UnsupportedHostOs => "Validation: Unsupported host OS",
            ValidationGate::MissingNetworkConnection => "Validation: Missing network connection",
            ValidationGate::FileVaultEnabled => "Validation: FileVault enabled",
            ValidationGate::SipEnabled => "Validation: SIP enabled",
            ValidationGate::SecureBootModelEnabled => "Validation: SecureBootModel enabled",
            ValidationGate::AmfiEnabled => "Validation: AMFI enabled",
            ValidationGate::WhateverGreenMissing => "Validation: WhateverGreen.kext missing",
            ValidationGate::ForceOpenGlMissing => "Validation: Force OpenGL argument missing",
            ValidationGate::ForceCompatMissing => "Validation: Force compat argument missing",
            ValidationGate::NvdaDrvMissing => "Validation: nvda_drv boot argument missing",
            ValidationGate::PatchingNotPossible => "Validation: Patching Not Possible",
            ValidationGate::UnpatchingNotPossible => "Validation: Unpatching Not Possible",
        }
    }
}

/// Flat map of named boolean gates, computed once per resolution pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationState {
    pub kdk_required: bool,
    pub kdk_missing: bool,
    pub metallib_required: bool,
    pub metallib_missing: bool,

    pub unsupported_host_os: bool,
    pub missing_network: bool,
    pub filevault_enabled: bool,
    pub sip_enabled: bool,
    pub secure_boot_enabled: bool,
    pub amfi_enabled: bool,
    pub whatevergreen_missing: bool,
    pub force_opengl_missing: bool,
    pub force_compat_missing: bool,
    pub nvda_drv_missing: bool,

    pub patching_not_possible: bool,
    pub unpatching_not_possible: bool,

    /// Booted vs. expected csr mask, set when the SIP gate blocks.
    pub sip_detail: Option<String>,
}

impl ValidationState {
    /// Capability-blocking gates currently raised, in display order.
    pub fn blocking_gates(&self) -> Vec<ValidationGate> {
        let all = [
            (self.unsupported_host_os, ValidationGate::UnsupportedHostOs),
            (self.missing_network, ValidationGate::MissingNetworkConnection),
            (self.filevault_enabled, ValidationGate::FileVaultEnabled),
            (self.sip_enabled, ValidationGate::SipEnabled),
            (self.secure_boot_enabled, ValidationGate::SecureBootModelEnabled),
            (self.amfi_enabled, ValidationGate::AmfiEnabled),
            (self.whatevergreen_missing, ValidationGate::WhateverGreenMissing),
            (self.force_opengl_missing, ValidationGate::ForceOpenGlMissing),
            (self.force_compat_missing, ValidationGate::ForceCompatMissing),
            (self.nvda_drv_missing, ValidationGate::NvdaDrvMissing),
        ];
        all.into_iter()
            .filter_map(|(raised, gate)| raised.then_some(gate))
            .collect()
    }

    /// Append settings flags and gates to the ordered property map.
    fn append_to(&self, props: &mut DeviceProperties) {
        props.insert(SETTING_KDK_REQUIRED, self.kdk_required);
        props.insert(SETTING_KDK_MISSING, self.kdk_missing);
        props.insert(SETTING_METALLIB_REQUIRED, self.metallib_required);
        props.insert(SETTING_METALLIB_MISSING, self.metallib_missing);

        props.insert(
            ValidationGate::UnsupportedHostOs.label(),
            self.unsupported_host_os,
        );
        props.insert(
            ValidationGate::MissingNetworkConnection.label(),
            self.missing_network,
        );
        props.insert(ValidationGate::FileVaultEnabled.label(), self.filevault_enabled);
        props.insert(ValidationGate::SipEnabled.label(), self.sip_enabled);
        if let Some(detail) = &self.sip_detail {
            props.insert_after(ValidationGate::SipEnabled.label(), detail.clone(), true);
        }
        props.insert(
            ValidationGate::SecureBootModelEnabled.label(),
            self.secure_boot_enabled,
        );
        props.insert(ValidationGate::AmfiEnabled.label(), self.amfi_enabled);
        props.insert(
            ValidationGate::WhateverGreenMissing.label(),
            self.whatevergreen_missing,
        );
        props.insert(
            ValidationGate::ForceOpenGlMissing.label(),
            self.force_opengl_missing,
        );
        props.insert(
            ValidationGate::ForceCompatMissing.label(),
            self.force_compat_missing,
        );
        props.insert(ValidationGate::NvdaDrvMissing.label(), self.nvda_drv_missing);

        props.insert(
            ValidationGate::PatchingNotPossible.label(),
            self.patching_not_possible,
        );
        props.insert(
            ValidationGate::UnpatchingNotPossible.label(),
            self.unpatching_not_possible,
        );
    }
}

/// Output of one resolution pass.
#[derive(Debug, Clone)]
pub struct PatchsetResolution {
    pub device_properties: DeviceProperties,
    pub plan: PatchPlan,
    pub validation: ValidationState,
    pub can_patch: bool,
    pub can_unpatch: bool,
}

impl PatchsetResolution {
    /// Labels of the gates currently blocking, for display.
    pub fn detailed_errors(&self) -> Vec<String> {
        let mut errors: Vec<String> = self
            .validation
            .blocking_gates()
            .iter()
            .map(|g| g.label().to_string())
            .collect();
        if let Some(detail) = &self.validation.sip_detail {
            errors.push(detail.clone());
        }
        errors
    }

    pub fn log_detailed_errors(&self) {
        log::error!("- Breakdown:");
        for error in self.detailed_errors() {
            log::error!("  - {}", error.replace("Validation: ", ""));
        }
    }
}

/// Computes the applicable patchset for one (host, target OS) pair.
///
/// Stateless across calls: `resolve()` may be invoked repeatedly and yields
/// an identical result for identical environment answers.
pub struct PatchsetResolver {
    target: OsTarget,
    host: Arc<HostProfile>,
    env: Box<dyn Environment>,
    validation_mode: bool,
    catalog: Vec<Box<dyn HardwareCapability>>,
}

impl PatchsetResolver {
    pub fn new(
        target: OsTarget,
        host: Arc<HostProfile>,
        settings: &PatcherSettings,
        env: Box<dyn Environment>,
    ) -> Self {
        let catalog = catalog::build_catalog(&target, &host, settings);
        PatchsetResolver {
            target,
            host,
            env,
            validation_mode: false,
            catalog,
        }
    }

    /// Validation mode keeps every capability regardless of presence so the
    /// full set of referenced resource files can be pre-flight checked.
    pub fn new_validation(
        target: OsTarget,
        host: Arc<HostProfile>,
        settings: &PatcherSettings,
        env: Box<dyn Environment>,
    ) -> Self {
        let mut resolver = Self::new(target, host, settings, env);
        resolver.validation_mode = true;
        resolver
    }

    /// Construct over an explicit capability list instead of the built-in
    /// catalog. The list order carries the same tie-break meaning.
    pub fn with_catalog(
        target: OsTarget,
        host: Arc<HostProfile>,
        env: Box<dyn Environment>,
        catalog: Vec<Box<dyn HardwareCapability>>,
    ) -> Self {
        PatchsetResolver {
            target,
            host,
            env,
            validation_mode: false,
            catalog,
        }
    }

    /// Toggle validation mode on an existing resolver.
    pub fn validation_mode(mut self, enabled: bool) -> Self {
        self.validation_mode = enabled;
        self
    }

    fn check_unsupported_host_os(&self) -> bool {
        if self.env.developer_override() {
            return false;
        }
        self.target.xnu_major < MacOsRelease::BigSur.major()
            || self.target.xnu_major > MacOsRelease::Tahoe.major()
    }

    fn check_filevault_enabled(&self) -> bool {
        // Root patching only interacts with FileVault from Big Sur on
        if self.target.before(MacOsRelease::BigSur) {
            return false;
        }
        self.env.filevault_enabled()
    }

    /// AMFIPass at a sufficient version makes the binaries work regardless of
    /// the host's AMFI configuration.
    fn effective_amfi_level(&self, level: AmfiLevel) -> AmfiLevel {
        if let Some(version) = self.env.loaded_kext_version(config::AMFIPASS_BUNDLE_ID) {
            if compare_versions(&version, config::AMFIPASS_COMPATIBILITY_VERSION)
                != Ordering::Less
            {
                return AmfiLevel::NoCheck;
            }
        }
        level
    }

    fn check_force_opengl_missing(&self, boot_args: &str) -> bool {
        if boot_args.contains("ngfxgl=") {
            return false;
        }
        !self.host.gpus.iter().any(|g| g.disable_metal)
    }

    fn check_force_compat_missing(&self, boot_args: &str) -> bool {
        if boot_args.contains("ngfxcompat=") {
            return false;
        }
        !self.host.gpus.iter().any(|g| g.force_compatible)
    }

    fn check_nvda_drv_missing(&self, boot_args: &str) -> bool {
        if boot_args.contains("nvda_drv_vrl=") {
            return false;
        }
        self.env.nvram("nvda_drv").is_none()
    }

    /// Strip mutually-exclusive rendering stacks.
    ///
    /// Non-Metal GPUs are dropped whenever any Metal GPU is present. Metal
    /// 3802 GPUs are dropped when a Metal 31001 GPU is present on Sequoia or
    /// newer — unless the 31001 capability is AMD Legacy GCN, a deliberate
    /// carve-out for GCN's dual-generation tagging.
    fn strip_incompatible<'a>(&self, survivors: Vec<&'a dyn HardwareCapability>) -> Vec<&'a dyn HardwareCapability> {
        let mut non_metal_present = false;
        let mut metal_3802_present = false;
        let mut metal_31001_present = false;
        let mut metal_31001_name: Option<String> = None;

        for cap in &survivors {
            match cap.graphics_subclass() {
                GraphicsSubclass::Metal31001 => {
                    metal_31001_present = true;
                    metal_31001_name = Some(cap.name());
                }
                GraphicsSubclass::Metal3802 => metal_3802_present = true,
                GraphicsSubclass::NonMetal => non_metal_present = true,
                GraphicsSubclass::NotApplicable => {}
            }
        }

        let metal_present = metal_31001_present || metal_3802_present;
        let mut result = survivors;

        if metal_present && non_metal_present {
            log::error!("Cannot mix Metal and non-Metal GPUs, stripping non-Metal");
            result.retain(|cap| {
                let strip = cap.graphics_subclass() == GraphicsSubclass::NonMetal;
                if strip {
                    log::error!("  Stripping out {}", cap.name());
                }
                !strip
            });
        }

        if metal_3802_present
            && metal_31001_present
            && self.target.at_least(MacOsRelease::Sequoia)
            && metal_31001_name.as_deref() != Some(graphics::AMD_LEGACY_GCN_NAME)
        {
            log::error!("Cannot mix Metal 3802 and Metal 31001 GPUs on Sequoia or newer");
            result.retain(|cap| {
                let strip = cap.graphics_subclass() == GraphicsSubclass::Metal3802;
                if strip {
                    log::error!("  Stripping out {}", cap.name());
                }
                !strip
            });
        }

        result
    }

    /// Resolve the missing-network gate.
    ///
    /// Networking patches fix the very stack that may be keeping the host
    /// offline, so when unapplied networking patches are on the table the
    /// plan is narrowed to exactly those and the network requirement is
    /// waived ("apply network patches, remove others").
    fn handle_missing_network(
        &self,
        validation: &mut ValidationState,
        capability_props: &mut DeviceProperties,
    ) {
        // Pointless when another gate blocks regardless
        let other_gates_block = validation
            .blocking_gates()
            .iter()
            .any(|g| *g != ValidationGate::MissingNetworkConnection);
        if other_gates_block {
            return;
        }

        log::info!("Network connection missing, checking whether networking patches apply");
        let already_applied = self
            .env
            .applied_patches()
            .iter()
            .any(|name| name.starts_with(NETWORKING_PREFIX));
        if already_applied {
            log::info!("Networking patches already applied, waiving network requirement");
            validation.missing_network = false;
            validation.kdk_required = false;
            validation.kdk_missing = false;
            validation.metallib_required = false;
            validation.metallib_missing = false;
            return;
        }

        let networking_applicable = capability_props
            .keys()
            .any(|key| key.starts_with(NETWORKING_PREFIX));
        if !networking_applicable {
            log::info!("No networking patches applicable, clearing network gate");
            validation.missing_network = false;
            return;
        }

        log::info!("Networking patches applicable, removing other patches");
        capability_props.retain(|key, _| key.starts_with(NETWORKING_PREFIX));

        validation.missing_network = false;
        validation.kdk_required = false;
        validation.kdk_missing = false;
        validation.metallib_required = false;
        validation.metallib_missing = false;
    }

    /// Run the full resolution pass.
    pub fn resolve(&self) -> PatchsetResolution {
        // First pass: presence. Validation mode keeps everything so all
        // referenced resource files can be checked independent of this host.
        let mut survivors: Vec<&dyn HardwareCapability> = Vec::new();
        for cap in &self.catalog {
            if !self.validation_mode {
                if !cap.present() {
                    continue;
                }
                if cap.native_os() {
                    continue;
                }
            }
            survivors.push(cap.as_ref());
        }

        if !self.validation_mode {
            survivors = self.strip_incompatible(survivors);
        }

        // Second pass: requirement aggregation.
        let mut capability_props = DeviceProperties::new();
        let mut required_sip: Vec<SipBit> = Vec::new();
        let mut requires_kdk = false;
        let mut requires_metallib = false;
        let mut has_web_drivers = false;
        let mut highest_amfi = AmfiLevel::NoCheck;

        for cap in &survivors {
            capability_props.insert(cap.name(), true);

            if cap.name() == graphics::NVIDIA_WEB_DRIVERS_NAME {
                has_web_drivers = true;
            }
            for bit in cap.required_sip_relaxations() {
                if !required_sip.contains(&bit) {
                    required_sip.push(bit);
                }
            }
            requires_kdk |= cap.requires_kernel_debug_kit();
            requires_metallib |= cap.requires_metal_support_package();
            highest_amfi = highest_amfi.max(cap.required_amfi_level());
        }

        // Auxiliary-resource resolution against local caches.
        let mut kdk_missing = false;
        let mut metallib_missing = false;
        if !self.validation_mode {
            if requires_kdk {
                kdk_missing = !self
                    .env
                    .kdk_installed(&self.target.os_build, &self.target.os_version);
            }
            if requires_metallib {
                metallib_missing = !self
                    .env
                    .metallib_installed(&self.target.os_build, &self.target.os_version);
            }
        }
        let requires_network = kdk_missing || metallib_missing;

        // Gate map.
        let sip_mask = SipBit::union(&required_sip);
        let csr = self.env.csr_active_config();
        let boot_args = self.env.boot_args();
        let effective_amfi = self.effective_amfi_level(highest_amfi);

        let mut validation = ValidationState {
            kdk_required: requires_kdk,
            kdk_missing,
            metallib_required: requires_metallib,
            metallib_missing,
            unsupported_host_os: self.check_unsupported_host_os(),
            missing_network: requires_network && !self.env.network_available(),
            filevault_enabled: self.check_filevault_enabled(),
            sip_enabled: (csr & sip_mask) != sip_mask,
            secure_boot_enabled: self.env.secure_boot_model_enabled(),
            amfi_enabled: !amfi_configuration_satisfies(effective_amfi, &boot_args),
            whatevergreen_missing: has_web_drivers
                && self.env.loaded_kext_version(WHATEVERGREEN_BUNDLE_ID).is_none(),
            force_opengl_missing: has_web_drivers && self.check_force_opengl_missing(&boot_args),
            force_compat_missing: has_web_drivers && self.check_force_compat_missing(&boot_args),
            nvda_drv_missing: has_web_drivers && self.check_nvda_drv_missing(&boot_args),
            patching_not_possible: false,
            unpatching_not_possible: false,
            sip_detail: None,
        };

        // Unpatching only fights SIP: reverting a snapshot is a pure
        // filesystem operation.
        validation.unpatching_not_possible = validation.sip_enabled;

        if !self.validation_mode {
            if validation.sip_enabled {
                validation.sip_detail = Some(format!(
                    "Validation: Booted SIP: {:#x} vs expected: {:#x}",
                    csr, sip_mask
                ));
            }
            if validation.missing_network {
                self.handle_missing_network(&mut validation, &mut capability_props);
            }
        }

        validation.patching_not_possible = !validation.blocking_gates().is_empty();

        // Third pass: collect actions for capabilities that survived any
        // pruning, in catalog order.
        let mut plan = PatchPlan::new();
        for cap in &survivors {
            if capability_props.get(&cap.name()).is_none() {
                continue;
            }
            for patches in cap.patches() {
                plan.merge(patches);
            }
        }

        let can_patch = !validation.patching_not_possible;
        let can_unpatch = !validation.unpatching_not_possible;

        let mut device_properties = capability_props;
        validation.append_to(&mut device_properties);

        PatchsetResolution {
            device_properties,
            plan,
            validation,
            can_patch,
            can_unpatch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CapabilityPatches, HardwareVariant, PatchSource};

    struct FakeEnvironment {
        csr: u32,
        network: bool,
    }

    impl Environment for FakeEnvironment {
        fn csr_active_config(&self) -> u32 {
            self.csr
        }
        fn boot_args(&self) -> String {
            String::new()
        }
        fn nvram(&self, _key: &str) -> Option<String> {
            None
        }
        fn filevault_enabled(&self) -> bool {
            false
        }
        fn secure_boot_model_enabled(&self) -> bool {
            false
        }
        fn loaded_kext_version(&self, _bundle_id: &str) -> Option<String> {
            None
        }
        fn network_available(&self) -> bool {
            self.network
        }
        fn kdk_installed(&self, _build: &str, _version: &str) -> bool {
            true
        }
        fn metallib_installed(&self, _build: &str, _version: &str) -> bool {
            true
        }
        fn applied_patches(&self) -> Vec<String> {
            Vec::new()
        }
        fn developer_override(&self) -> bool {
            false
        }
    }

    struct StubCapability {
        name: String,
        subclass: GraphicsSubclass,
        amfi: AmfiLevel,
    }

    impl HardwareCapability for StubCapability {
        fn name(&self) -> String {
            self.name.clone()
        }
        fn hardware_variant(&self) -> HardwareVariant {
            HardwareVariant::Graphics
        }
        fn present(&self) -> bool {
            true
        }
        fn native_os(&self) -> bool {
            false
        }
        fn graphics_subclass(&self) -> GraphicsSubclass {
            self.subclass
        }
        fn required_amfi_level(&self) -> AmfiLevel {
            self.amfi
        }
        fn patches(&self) -> Vec<CapabilityPatches> {
            vec![CapabilityPatches::new(self.name.clone()).overwrite_system(
                "/System/Library/Extensions",
                &[("Stub.kext", PatchSource::Bundle("1.0".to_string()))],
            )]
        }
    }

    fn resolver_with(caps: Vec<Box<dyn HardwareCapability>>) -> PatchsetResolver {
        PatchsetResolver::with_catalog(
            OsTarget::new(24, 0, "24A335", "15.0"),
            Arc::new(HostProfile::default()),
            Box::new(FakeEnvironment {
                csr: 0xFFF,
                network: true,
            }),
            caps,
        )
    }

    #[test]
    fn test_non_metal_stripped_when_metal_present() {
        let resolution = resolver_with(vec![
            Box::new(StubCapability {
                name: "Graphics: Old".to_string(),
                subclass: GraphicsSubclass::NonMetal,
                amfi: AmfiLevel::NoCheck,
            }),
            Box::new(StubCapability {
                name: "Graphics: New".to_string(),
                subclass: GraphicsSubclass::Metal31001,
                amfi: AmfiLevel::NoCheck,
            }),
        ])
        .resolve();

        assert!(!resolution.plan.contains("Graphics: Old"));
        assert!(resolution.plan.contains("Graphics: New"));
    }

    #[test]
    fn test_amfi_aggregation_takes_maximum() {
        let resolution = resolver_with(vec![
            Box::new(StubCapability {
                name: "Graphics: A".to_string(),
                subclass: GraphicsSubclass::Metal31001,
                amfi: AmfiLevel::LibraryValidation,
            }),
            Box::new(StubCapability {
                name: "Graphics: B".to_string(),
                subclass: GraphicsSubclass::Metal31001,
                amfi: AmfiLevel::NoCheck,
            }),
        ])
        .resolve();

        // LibraryValidation unsatisfied with empty boot-args
        assert!(resolution.validation.amfi_enabled);
    }

    #[test]
    fn test_empty_catalog_resolves_clean() {
        let resolution = resolver_with(Vec::new()).resolve();
        assert!(resolution.plan.is_empty());
        assert!(resolution.can_patch);
        assert!(resolution.can_unpatch);
    }

    #[test]
    fn test_detailed_errors_includes_sip_gate() {
        let mut resolver = resolver_with(vec![Box::new(StubCapability {
            name: "Graphics: A".to_string(),
            subclass: GraphicsSubclass::Metal31001,
            amfi: AmfiLevel::NoCheck,
        })]);
        // SIP fully enabled but the stub requires no bits, so patching works
        resolver.env = Box::new(FakeEnvironment {
            csr: 0,
            network: true,
        });
        let resolution = resolver.resolve();
        assert!(resolution.can_patch);
        assert!(resolution.detailed_errors().is_empty());
    }
}
