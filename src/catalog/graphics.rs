//! Graphics capability variants.
//!
//! Three mutually-interacting rendering generations:
//! - non-Metal (Iron Lake, Sandy Bridge, Tesla, TeraScale, web-driver cards)
//! - Metal 3802 (Ivy Bridge, Haswell, Kepler)
//! - Metal 31001 (Broadwell, Skylake, GCN, Polaris, Vega)
//!
//! The resolver's conflict stripping consumes `graphics_subclass()`; the
//! executor keys post-actions on the names exported here.

use std::sync::Arc;

use super::{base_root_patch_sip, HardwareCapability};
use crate::models::{
    AmfiLevel, CapabilityPatches, DynamicResource, GpuArchitecture, GraphicsSubclass,
    HardwareVariant, HostProfile, MacOsRelease, OsTarget, PatchSource, SipBit,
};

pub const INTEL_IRON_LAKE_NAME: &str = "Graphics: Intel Iron Lake";
pub const INTEL_SANDY_BRIDGE_NAME: &str = "Graphics: Intel Sandy Bridge";
pub const INTEL_IVY_BRIDGE_NAME: &str = "Graphics: Intel Ivy Bridge";
pub const INTEL_HASWELL_NAME: &str = "Graphics: Intel Haswell";
pub const INTEL_BROADWELL_NAME: &str = "Graphics: Intel Broadwell";
pub const INTEL_SKYLAKE_NAME: &str = "Graphics: Intel Skylake";
pub const NVIDIA_TESLA_NAME: &str = "Graphics: Nvidia Tesla";
pub const NVIDIA_KEPLER_NAME: &str = "Graphics: Nvidia Kepler";
pub const NVIDIA_WEB_DRIVERS_NAME: &str = "Graphics: Nvidia Web Drivers";
pub const AMD_TERASCALE_1_NAME: &str = "Graphics: AMD TeraScale 1";
pub const AMD_TERASCALE_2_NAME: &str = "Graphics: AMD TeraScale 2";
pub const AMD_LEGACY_GCN_NAME: &str = "Graphics: AMD Legacy GCN";
pub const AMD_POLARIS_NAME: &str = "Graphics: AMD Polaris";
pub const AMD_VEGA_NAME: &str = "Graphics: AMD Vega";

/// Shared payload applied by every Metal 3802 generation GPU. Merged once
/// into the plan no matter how many 3802 capabilities contribute it.
pub const METAL_3802_COMMON_EXTENDED_NAME: &str = "Graphics: Metal 3802 Common Extended";

/// Capabilities whose application disables window-server shader caching.
pub const SHADER_CACHE_SENSITIVE_NAMES: [&str; 3] =
    [AMD_LEGACY_GCN_NAME, AMD_POLARIS_NAME, AMD_VEGA_NAME];

/// Frameworks every non-Metal GPU needs swapped back to OpenGL-era builds.
fn non_metal_common(name: &str, major: u32) -> CapabilityPatches {
    let src = PatchSource::Bundle(format!("10.13.6-{}", major));
    CapabilityPatches::new(name)
        .merge_system(
            "/System/Library/Frameworks",
            &[("OpenGL.framework", src.clone()), ("CoreDisplay.framework", src.clone())],
        )
        .merge_system(
            "/System/Library/PrivateFrameworks",
            &[("SkyLight.framework", src.clone()), ("GPUSupport.framework", src)],
        )
}

/// Compiler and Metal runtime payload shared by the 3802 generation. On
/// Sequoia and newer the Metal runtime comes from the downloadable Metal
/// support package instead of the static payload.
fn metal_3802_common_extended(target: &OsTarget) -> CapabilityPatches {
    let metal_src = if target.at_least(MacOsRelease::Sequoia) {
        PatchSource::Dynamic(DynamicResource::MetalSupportPackage)
    } else {
        PatchSource::Bundle(format!("12.5-{}", target.xnu_major))
    };
    let src = PatchSource::Bundle(format!("12.5-{}", target.xnu_major));
    CapabilityPatches::new(METAL_3802_COMMON_EXTENDED_NAME)
        .merge_system(
            "/System/Library/Frameworks",
            &[("Metal.framework", metal_src)],
        )
        .merge_system(
            "/System/Library/PrivateFrameworks",
            &[("GPUCompiler.framework", src.clone()), ("MTLCompiler.framework", src)],
        )
}

/// AMFI floor shared by the Metal 31001 generation: library validation must
/// go once Sonoma tightened dyld signature checks, nothing earlier.
fn metal_31001_amfi(target: &OsTarget) -> AmfiLevel {
    if target.at_least(MacOsRelease::Sonoma) {
        AmfiLevel::LibraryValidation
    } else {
        AmfiLevel::NoCheck
    }
}

pub struct IntelIronLake {
    target: OsTarget,
    host: Arc<HostProfile>,
}

impl IntelIronLake {
    pub fn new(target: &OsTarget, host: &Arc<HostProfile>) -> Self {
        IntelIronLake {
            target: target.clone(),
            host: Arc::clone(host),
        }
    }
}

impl HardwareCapability for IntelIronLake {
    fn name(&self) -> String {
        INTEL_IRON_LAKE_NAME.to_string()
    }

    fn hardware_variant(&self) -> HardwareVariant {
        HardwareVariant::Graphics
    }

    fn present(&self) -> bool {
        self.host.has_gpu(GpuArchitecture::IntelIronLake)
    }

    fn native_os(&self) -> bool {
        self.target.before(MacOsRelease::Mojave)
    }

    fn graphics_subclass(&self) -> GraphicsSubclass {
        GraphicsSubclass::NonMetal
    }

    fn requires_kernel_debug_kit(&self) -> bool {
        self.target.at_least(MacOsRelease::Ventura)
    }

    fn required_sip_relaxations(&self) -> Vec<SipBit> {
        base_root_patch_sip()
    }

    fn required_amfi_level(&self) -> AmfiLevel {
        AmfiLevel::FullDisable
    }

    fn patches(&self) -> Vec<CapabilityPatches> {
        if self.native_os() {
            return Vec::new();
        }
        let src = PatchSource::Bundle(format!("10.13.6-{}", self.target.xnu_major));
        vec![
            CapabilityPatches::new(INTEL_IRON_LAKE_NAME).overwrite_system(
                "/System/Library/Extensions",
                &[
                    ("AppleIntelHDGraphics.kext", src.clone()),
                    ("AppleIntelHDGraphicsFB.kext", src),
                ],
            ),
            non_metal_common(INTEL_IRON_LAKE_NAME, self.target.xnu_major),
        ]
    }
}

pub struct IntelSandyBridge {
    target: OsTarget,
    host: Arc<HostProfile>,
}

impl IntelSandyBridge {
    pub fn new(target: &OsTarget, host: &Arc<HostProfile>) -> Self {
        IntelSandyBridge {
            target: target.clone(),
            host: Arc::clone(host),
        }
    }
}

impl HardwareCapability for IntelSandyBridge {
    fn name(&self) -> String {
        INTEL_SANDY_BRIDGE_NAME.to_string()
    }

    fn hardware_variant(&self) -> HardwareVariant {
        HardwareVariant::Graphics
    }

    fn present(&self) -> bool {
        self.host.has_gpu(GpuArchitecture::IntelSandyBridge)
    }

    fn native_os(&self) -> bool {
        self.target.before(MacOsRelease::Mojave)
    }

    fn graphics_subclass(&self) -> GraphicsSubclass {
        GraphicsSubclass::NonMetal
    }

    fn requires_kernel_debug_kit(&self) -> bool {
        self.target.at_least(MacOsRelease::Ventura)
    }

    fn required_sip_relaxations(&self) -> Vec<SipBit> {
        base_root_patch_sip()
    }

    fn required_amfi_level(&self) -> AmfiLevel {
        AmfiLevel::FullDisable
    }

    fn patches(&self) -> Vec<CapabilityPatches> {
        if self.native_os() {
            return Vec::new();
        }
        let src = PatchSource::Bundle(format!("10.13.6-{}", self.target.xnu_major));
        vec![
            CapabilityPatches::new(INTEL_SANDY_BRIDGE_NAME).overwrite_system(
                "/System/Library/Extensions",
                &[
                    ("AppleIntelHD3000Graphics.kext", src.clone()),
                    ("AppleIntelSNBGraphicsFB.kext", src.clone()),
                    ("AppleIntelSNBVA.bundle", src),
                ],
            ),
            non_metal_common(INTEL_SANDY_BRIDGE_NAME, self.target.xnu_major),
        ]
    }
}

pub struct IntelIvyBridge {
    target: OsTarget,
    host: Arc<HostProfile>,
}

impl IntelIvyBridge {
    pub fn new(target: &OsTarget, host: &Arc<HostProfile>) -> Self {
        IntelIvyBridge {
            target: target.clone(),
            host: Arc::clone(host),
        }
    }
}

impl HardwareCapability for IntelIvyBridge {
    fn name(&self) -> String {
        INTEL_IVY_BRIDGE_NAME.to_string()
    }

    fn hardware_variant(&self) -> HardwareVariant {
        HardwareVariant::Graphics
    }

    fn present(&self) -> bool {
        self.host.has_gpu(GpuArchitecture::IntelIvyBridge)
    }

    fn native_os(&self) -> bool {
        self.target.before(MacOsRelease::Monterey)
    }

    fn graphics_subclass(&self) -> GraphicsSubclass {
        GraphicsSubclass::Metal3802
    }

    fn requires_kernel_debug_kit(&self) -> bool {
        self.target.at_least(MacOsRelease::Ventura)
    }

    fn requires_metal_support_package(&self) -> bool {
        self.target.at_least(MacOsRelease::Sequoia)
    }

    fn required_sip_relaxations(&self) -> Vec<SipBit> {
        base_root_patch_sip()
    }

    fn required_amfi_level(&self) -> AmfiLevel {
        AmfiLevel::LibraryValidation
    }

    fn patches(&self) -> Vec<CapabilityPatches> {
        if self.native_os() {
            return Vec::new();
        }
        let src = PatchSource::Bundle(format!("12.5-{}", self.target.xnu_major));
        vec![
            CapabilityPatches::new(INTEL_IVY_BRIDGE_NAME).overwrite_system(
                "/System/Library/Extensions",
                &[
                    ("AppleIntelHD4000Graphics.kext", src.clone()),
                    ("AppleIntelFramebufferCapri.kext", src.clone()),
                    ("AppleIntelHD4000GraphicsVADriver.bundle", src),
                ],
            ),
            metal_3802_common_extended(&self.target),
        ]
    }
}

pub struct IntelHaswell {
    target: OsTarget,
    host: Arc<HostProfile>,
}

impl IntelHaswell {
    pub fn new(target: &OsTarget, host: &Arc<HostProfile>) -> Self {
        IntelHaswell {
            target: target.clone(),
            host: Arc::clone(host),
        }
    }
}

impl HardwareCapability for IntelHaswell {
    fn name(&self) -> String {
        INTEL_HASWELL_NAME.to_string()
    }

    fn hardware_variant(&self) -> HardwareVariant {
        HardwareVariant::Graphics
    }

    fn present(&self) -> bool {
        self.host.has_gpu(GpuArchitecture::IntelHaswell)
    }

    fn native_os(&self) -> bool {
        self.target.before(MacOsRelease::Ventura)
    }

    fn graphics_subclass(&self) -> GraphicsSubclass {
        GraphicsSubclass::Metal3802
    }

    fn requires_kernel_debug_kit(&self) -> bool {
        self.target.at_least(MacOsRelease::Ventura)
    }

    fn requires_metal_support_package(&self) -> bool {
        self.target.at_least(MacOsRelease::Sequoia)
    }

    fn required_sip_relaxations(&self) -> Vec<SipBit> {
        base_root_patch_sip()
    }

    fn required_amfi_level(&self) -> AmfiLevel {
        AmfiLevel::LibraryValidation
    }

    fn patches(&self) -> Vec<CapabilityPatches> {
        if self.native_os() {
            return Vec::new();
        }
        let src = PatchSource::Bundle(format!("12.5-{}", self.target.xnu_major));
        vec![
            CapabilityPatches::new(INTEL_HASWELL_NAME).overwrite_system(
                "/System/Library/Extensions",
                &[
                    ("AppleIntelHD5000Graphics.kext", src.clone()),
                    ("AppleIntelFramebufferAzul.kext", src.clone()),
                    ("AppleIntelHD5000GraphicsVADriver.bundle", src),
                ],
            ),
            metal_3802_common_extended(&self.target),
        ]
    }
}

pub struct IntelBroadwell {
    target: OsTarget,
    host: Arc<HostProfile>,
}

impl IntelBroadwell {
    pub fn new(target: &OsTarget, host: &Arc<HostProfile>) -> Self {
        IntelBroadwell {
            target: target.clone(),
            host: Arc::clone(host),
        }
    }
}

impl HardwareCapability for IntelBroadwell {
    fn name(&self) -> String {
        INTEL_BROADWELL_NAME.to_string()
    }

    fn hardware_variant(&self) -> HardwareVariant {
        HardwareVariant::Graphics
    }

    fn present(&self) -> bool {
        self.host.has_gpu(GpuArchitecture::IntelBroadwell)
    }

    fn native_os(&self) -> bool {
        self.target.before(MacOsRelease::Ventura)
    }

    fn graphics_subclass(&self) -> GraphicsSubclass {
        GraphicsSubclass::Metal31001
    }

    fn requires_kernel_debug_kit(&self) -> bool {
        self.target.at_least(MacOsRelease::Ventura)
    }

    fn required_sip_relaxations(&self) -> Vec<SipBit> {
        base_root_patch_sip()
    }

    fn required_amfi_level(&self) -> AmfiLevel {
        metal_31001_amfi(&self.target)
    }

    fn patches(&self) -> Vec<CapabilityPatches> {
        if self.native_os() {
            return Vec::new();
        }
        let src = PatchSource::Bundle(format!("13.7.2-{}", self.target.xnu_major));
        vec![CapabilityPatches::new(INTEL_BROADWELL_NAME).overwrite_system(
            "/System/Library/Extensions",
            &[
                ("AppleIntelBDWGraphics.kext", src.clone()),
                ("AppleIntelBDWGraphicsFramebuffer.kext", src.clone()),
                ("AppleIntelBDWGraphicsMTLDriver.bundle", src),
            ],
        )]
    }
}

pub struct IntelSkylake {
    target: OsTarget,
    host: Arc<HostProfile>,
}

impl IntelSkylake {
    pub fn new(target: &OsTarget, host: &Arc<HostProfile>) -> Self {
        IntelSkylake {
            target: target.clone(),
            host: Arc::clone(host),
        }
    }
}

impl HardwareCapability for IntelSkylake {
    fn name(&self) -> String {
        INTEL_SKYLAKE_NAME.to_string()
    }

    fn hardware_variant(&self) -> HardwareVariant {
        HardwareVariant::Graphics
    }

    fn present(&self) -> bool {
        self.host.has_gpu(GpuArchitecture::IntelSkylake)
    }

    fn native_os(&self) -> bool {
        self.target.before(MacOsRelease::Sonoma)
    }

    fn graphics_subclass(&self) -> GraphicsSubclass {
        GraphicsSubclass::Metal31001
    }

    fn requires_kernel_debug_kit(&self) -> bool {
        self.target.at_least(MacOsRelease::Ventura)
    }

    fn required_sip_relaxations(&self) -> Vec<SipBit> {
        base_root_patch_sip()
    }

    fn required_amfi_level(&self) -> AmfiLevel {
        metal_31001_amfi(&self.target)
    }

    fn patches(&self) -> Vec<CapabilityPatches> {
        if self.native_os() {
            return Vec::new();
        }
        let src = PatchSource::Bundle(format!("13.7.2-{}", self.target.xnu_major));
        vec![CapabilityPatches::new(INTEL_SKYLAKE_NAME).overwrite_system(
            "/System/Library/Extensions",
            &[
                ("AppleIntelSKLGraphics.kext", src.clone()),
                ("AppleIntelSKLGraphicsFramebuffer.kext", src.clone()),
                ("AppleIntelSKLGraphicsMTLDriver.bundle", src),
            ],
        )]
    }
}

pub struct NvidiaTesla {
    target: OsTarget,
    host: Arc<HostProfile>,
}

impl NvidiaTesla {
    pub fn new(target: &OsTarget, host: &Arc<HostProfile>) -> Self {
        NvidiaTesla {
            target: target.clone(),
            host: Arc::clone(host),
        }
    }
}

impl HardwareCapability for NvidiaTesla {
    fn name(&self) -> String {
        NVIDIA_TESLA_NAME.to_string()
    }

    fn hardware_variant(&self) -> HardwareVariant {
        HardwareVariant::Graphics
    }

    fn present(&self) -> bool {
        self.host.has_gpu(GpuArchitecture::NvidiaTesla)
    }

    fn native_os(&self) -> bool {
        self.target.before(MacOsRelease::Mojave)
    }

    fn graphics_subclass(&self) -> GraphicsSubclass {
        GraphicsSubclass::NonMetal
    }

    fn requires_kernel_debug_kit(&self) -> bool {
        self.target.at_least(MacOsRelease::Ventura)
    }

    fn required_sip_relaxations(&self) -> Vec<SipBit> {
        base_root_patch_sip()
    }

    fn required_amfi_level(&self) -> AmfiLevel {
        AmfiLevel::FullDisable
    }

    fn patches(&self) -> Vec<CapabilityPatches> {
        if self.native_os() {
            return Vec::new();
        }
        let src = PatchSource::Bundle(format!("10.13.6-{}", self.target.xnu_major));
        vec![
            CapabilityPatches::new(NVIDIA_TESLA_NAME).overwrite_system(
                "/System/Library/Extensions",
                &[
                    ("NVDAResmanTesla.kext", src.clone()),
                    ("NVDANV50HalTesla.kext", src.clone()),
                    ("GeForceTesla.kext", src),
                ],
            ),
            non_metal_common(NVIDIA_TESLA_NAME, self.target.xnu_major),
        ]
    }
}

pub struct NvidiaKepler {
    target: OsTarget,
    host: Arc<HostProfile>,
}

impl NvidiaKepler {
    pub fn new(target: &OsTarget, host: &Arc<HostProfile>) -> Self {
        NvidiaKepler {
            target: target.clone(),
            host: Arc::clone(host),
        }
    }
}

impl HardwareCapability for NvidiaKepler {
    fn name(&self) -> String {
        NVIDIA_KEPLER_NAME.to_string()
    }

    fn hardware_variant(&self) -> HardwareVariant {
        HardwareVariant::Graphics
    }

    fn present(&self) -> bool {
        self.host.has_gpu(GpuArchitecture::NvidiaKepler)
    }

    fn native_os(&self) -> bool {
        self.target.before(MacOsRelease::Monterey)
    }

    fn graphics_subclass(&self) -> GraphicsSubclass {
        GraphicsSubclass::Metal3802
    }

    fn requires_kernel_debug_kit(&self) -> bool {
        self.target.at_least(MacOsRelease::Ventura)
    }

    fn requires_metal_support_package(&self) -> bool {
        self.target.at_least(MacOsRelease::Sequoia)
    }

    fn required_sip_relaxations(&self) -> Vec<SipBit> {
        base_root_patch_sip()
    }

    fn required_amfi_level(&self) -> AmfiLevel {
        AmfiLevel::LibraryValidation
    }

    fn patches(&self) -> Vec<CapabilityPatches> {
        if self.native_os() {
            return Vec::new();
        }
        let src = PatchSource::Bundle(format!("12.5-{}", self.target.xnu_major));
        vec![
            CapabilityPatches::new(NVIDIA_KEPLER_NAME).overwrite_system(
                "/System/Library/Extensions",
                &[
                    ("NVDAResman.kext", src.clone()),
                    ("NVDAGK100Hal.kext", src.clone()),
                    ("GeForce.kext", src.clone()),
                    ("NVDAStartup.kext", src),
                ],
            ),
            metal_3802_common_extended(&self.target),
        ]
    }
}

pub struct NvidiaWebDrivers {
    target: OsTarget,
    host: Arc<HostProfile>,
}

impl NvidiaWebDrivers {
    pub fn new(target: &OsTarget, host: &Arc<HostProfile>) -> Self {
        NvidiaWebDrivers {
            target: target.clone(),
            host: Arc::clone(host),
        }
    }
}

impl HardwareCapability for NvidiaWebDrivers {
    fn name(&self) -> String {
        NVIDIA_WEB_DRIVERS_NAME.to_string()
    }

    fn hardware_variant(&self) -> HardwareVariant {
        HardwareVariant::Graphics
    }

    fn present(&self) -> bool {
        self.host.has_gpu(GpuArchitecture::NvidiaWebDriverClass)
    }

    fn native_os(&self) -> bool {
        self.target.before(MacOsRelease::Mojave)
    }

    fn graphics_subclass(&self) -> GraphicsSubclass {
        GraphicsSubclass::NonMetal
    }

    fn requires_kernel_debug_kit(&self) -> bool {
        self.target.at_least(MacOsRelease::Ventura)
    }

    fn required_sip_relaxations(&self) -> Vec<SipBit> {
        let mut bits = base_root_patch_sip();
        bits.push(SipBit::AllowUnapprovedKexts);
        bits
    }

    fn required_amfi_level(&self) -> AmfiLevel {
        AmfiLevel::FullDisable
    }

    fn patches(&self) -> Vec<CapabilityPatches> {
        if self.native_os() {
            return Vec::new();
        }
        let src = PatchSource::Bundle(format!("10.13.6-{}", self.target.xnu_major));
        vec![
            CapabilityPatches::new(NVIDIA_WEB_DRIVERS_NAME)
                .overwrite_system(
                    "/System/Library/Extensions",
                    &[("NVDAStartupWeb.kext", src.clone())],
                )
                .overwrite_data(
                    "/Library/Extensions",
                    &[("GeForceWeb.kext", src.clone()), ("NVDAResmanWeb.kext", src.clone())],
                ),
            non_metal_common(NVIDIA_WEB_DRIVERS_NAME, self.target.xnu_major),
        ]
    }
}

pub struct AmdTeraScale1 {
    target: OsTarget,
    host: Arc<HostProfile>,
}

impl AmdTeraScale1 {
    pub fn new(target: &OsTarget, host: &Arc<HostProfile>) -> Self {
        AmdTeraScale1 {
            target: target.clone(),
            host: Arc::clone(host),
        }
    }
}

impl HardwareCapability for AmdTeraScale1 {
    fn name(&self) -> String {
        AMD_TERASCALE_1_NAME.to_string()
    }

    fn hardware_variant(&self) -> HardwareVariant {
        HardwareVariant::Graphics
    }

    fn present(&self) -> bool {
        self.host.has_gpu(GpuArchitecture::AmdTeraScale1)
    }

    fn native_os(&self) -> bool {
        self.target.before(MacOsRelease::Mojave)
    }

    fn graphics_subclass(&self) -> GraphicsSubclass {
        GraphicsSubclass::NonMetal
    }

    fn requires_kernel_debug_kit(&self) -> bool {
        self.target.at_least(MacOsRelease::Ventura)
    }

    fn required_sip_relaxations(&self) -> Vec<SipBit> {
        base_root_patch_sip()
    }

    fn required_amfi_level(&self) -> AmfiLevel {
        AmfiLevel::FullDisable
    }

    fn patches(&self) -> Vec<CapabilityPatches> {
        if self.native_os() {
            return Vec::new();
        }
        let src = PatchSource::Bundle(format!("10.13.6-{}", self.target.xnu_major));
        vec![
            CapabilityPatches::new(AMD_TERASCALE_1_NAME).overwrite_system(
                "/System/Library/Extensions",
                &[
                    ("AMD2400Controller.kext", src.clone()),
                    ("AMD2600Controller.kext", src.clone()),
                    ("AMDRadeonX2000.kext", src),
                ],
            ),
            non_metal_common(AMD_TERASCALE_1_NAME, self.target.xnu_major),
        ]
    }
}

pub struct AmdTeraScale2 {
    target: OsTarget,
    host: Arc<HostProfile>,
}

impl AmdTeraScale2 {
    pub fn new(target: &OsTarget, host: &Arc<HostProfile>) -> Self {
        AmdTeraScale2 {
            target: target.clone(),
            host: Arc::clone(host),
        }
    }
}

impl HardwareCapability for AmdTeraScale2 {
    fn name(&self) -> String {
        AMD_TERASCALE_2_NAME.to_string()
    }

    fn hardware_variant(&self) -> HardwareVariant {
        HardwareVariant::Graphics
    }

    fn present(&self) -> bool {
        self.host.has_gpu(GpuArchitecture::AmdTeraScale2)
    }

    fn native_os(&self) -> bool {
        self.target.before(MacOsRelease::Mojave)
    }

    fn graphics_subclass(&self) -> GraphicsSubclass {
        GraphicsSubclass::NonMetal
    }

    fn requires_kernel_debug_kit(&self) -> bool {
        self.target.at_least(MacOsRelease::Ventura)
    }

    fn required_sip_relaxations(&self) -> Vec<SipBit> {
        base_root_patch_sip()
    }

    fn required_amfi_level(&self) -> AmfiLevel {
        AmfiLevel::FullDisable
    }

    fn patches(&self) -> Vec<CapabilityPatches> {
        if self.native_os() {
            return Vec::new();
        }
        let src = PatchSource::Bundle(format!("10.13.6-{}", self.target.xnu_major));
        vec![
            CapabilityPatches::new(AMD_TERASCALE_2_NAME).overwrite_system(
                "/System/Library/Extensions",
                &[
                    ("AMD5000Controller.kext", src.clone()),
                    ("AMD6000Controller.kext", src.clone()),
                    ("AMDRadeonX3000.kext", src),
                ],
            ),
            non_metal_common(AMD_TERASCALE_2_NAME, self.target.xnu_major),
        ]
    }
}

/// AMD GCN 1-3 discrete GPUs.
///
/// On Sequoia and newer this capability reports itself as Metal 31001 even
/// though it ships 3802-era compiler payloads. The tag is a deliberate
/// compatibility carve-out: it exempts GCN from the 3802-vs-31001 conflict
/// strip so mixed GCN systems keep their full patchset.
pub struct AmdLegacyGcn {
    target: OsTarget,
    host: Arc<HostProfile>,
}

impl AmdLegacyGcn {
    pub fn new(target: &OsTarget, host: &Arc<HostProfile>) -> Self {
        AmdLegacyGcn {
            target: target.clone(),
            host: Arc::clone(host),
        }
    }
}

impl HardwareCapability for AmdLegacyGcn {
    fn name(&self) -> String {
        AMD_LEGACY_GCN_NAME.to_string()
    }

    fn hardware_variant(&self) -> HardwareVariant {
        HardwareVariant::Graphics
    }

    fn present(&self) -> bool {
        self.host.has_gpu(GpuArchitecture::AmdLegacyGcn)
    }

    fn native_os(&self) -> bool {
        self.target.before(MacOsRelease::Ventura)
    }

    fn graphics_subclass(&self) -> GraphicsSubclass {
        if self.target.at_least(MacOsRelease::Sequoia) {
            GraphicsSubclass::Metal31001
        } else {
            GraphicsSubclass::Metal3802
        }
    }

    fn requires_kernel_debug_kit(&self) -> bool {
        self.target.at_least(MacOsRelease::Ventura)
    }

    fn requires_metal_support_package(&self) -> bool {
        self.target.at_least(MacOsRelease::Sequoia)
    }

    fn required_sip_relaxations(&self) -> Vec<SipBit> {
        base_root_patch_sip()
    }

    fn required_amfi_level(&self) -> AmfiLevel {
        AmfiLevel::LibraryValidation
    }

    fn patches(&self) -> Vec<CapabilityPatches> {
        if self.native_os() {
            return Vec::new();
        }
        let src = PatchSource::Bundle(format!("12.5-{}", self.target.xnu_major));
        vec![
            CapabilityPatches::new(AMD_LEGACY_GCN_NAME).overwrite_system(
                "/System/Library/Extensions",
                &[
                    ("AMDRadeonX4000.kext", src.clone()),
                    ("AMD7000Controller.kext", src.clone()),
                    ("AMD8000Controller.kext", src.clone()),
                    ("AMD9000Controller.kext", src),
                ],
            ),
            metal_3802_common_extended(&self.target),
        ]
    }
}

pub struct AmdPolaris {
    target: OsTarget,
    host: Arc<HostProfile>,
}

impl AmdPolaris {
    pub fn new(target: &OsTarget, host: &Arc<HostProfile>) -> Self {
        AmdPolaris {
            target: target.clone(),
            host: Arc::clone(host),
        }
    }
}

impl HardwareCapability for AmdPolaris {
    fn name(&self) -> String {
        AMD_POLARIS_NAME.to_string()
    }

    fn hardware_variant(&self) -> HardwareVariant {
        HardwareVariant::Graphics
    }

    fn present(&self) -> bool {
        self.host.has_gpu(GpuArchitecture::AmdPolaris)
    }

    fn native_os(&self) -> bool {
        self.target.before(MacOsRelease::Sonoma)
    }

    fn graphics_subclass(&self) -> GraphicsSubclass {
        GraphicsSubclass::Metal31001
    }

    fn requires_kernel_debug_kit(&self) -> bool {
        self.target.at_least(MacOsRelease::Ventura)
    }

    fn required_sip_relaxations(&self) -> Vec<SipBit> {
        base_root_patch_sip()
    }

    fn required_amfi_level(&self) -> AmfiLevel {
        metal_31001_amfi(&self.target)
    }

    fn patches(&self) -> Vec<CapabilityPatches> {
        if self.native_os() {
            return Vec::new();
        }
        let src = PatchSource::Bundle(format!("13.7.2-{}", self.target.xnu_major));
        vec![CapabilityPatches::new(AMD_POLARIS_NAME).overwrite_system(
            "/System/Library/Extensions",
            &[
                ("AMDRadeonX4000.kext", src.clone()),
                ("AMD9500Controller.kext", src.clone()),
                ("AMDRadeonX4000HWServices.kext", src),
            ],
        )]
    }
}

pub struct AmdVega {
    target: OsTarget,
    host: Arc<HostProfile>,
}

impl AmdVega {
    pub fn new(target: &OsTarget, host: &Arc<HostProfile>) -> Self {
        AmdVega {
            target: target.clone(),
            host: Arc::clone(host),
        }
    }
}

impl HardwareCapability for AmdVega {
    fn name(&self) -> String {
        AMD_VEGA_NAME.to_string()
    }

    fn hardware_variant(&self) -> HardwareVariant {
        HardwareVariant::Graphics
    }

    fn present(&self) -> bool {
        self.host.has_gpu(GpuArchitecture::AmdVega)
    }

    fn native_os(&self) -> bool {
        self.target.before(MacOsRelease::Sonoma)
    }

    fn graphics_subclass(&self) -> GraphicsSubclass {
        GraphicsSubclass::Metal31001
    }

    fn requires_kernel_debug_kit(&self) -> bool {
        self.target.at_least(MacOsRelease::Ventura)
    }

    fn required_sip_relaxations(&self) -> Vec<SipBit> {
        base_root_patch_sip()
    }

    fn required_amfi_level(&self) -> AmfiLevel {
        metal_31001_amfi(&self.target)
    }

    fn patches(&self) -> Vec<CapabilityPatches> {
        if self.native_os() {
            return Vec::new();
        }
        let src = PatchSource::Bundle(format!("13.7.2-{}", self.target.xnu_major));
        vec![CapabilityPatches::new(AMD_VEGA_NAME).overwrite_system(
            "/System/Library/Extensions",
            &[
                ("AMDRadeonX5000.kext", src.clone()),
                ("AMD10000Controller.kext", src.clone()),
                ("AMDRadeonX5000HWServices.kext", src),
            ],
        )]
    }
}
