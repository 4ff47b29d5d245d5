//! Hardware capability catalog.
//!
//! A closed, ordered set of hardware probe variants. Each capability exposes
//! presence and native-OS tests, the auxiliary resources and integrity
//! relaxations its patches need, and the concrete patch actions it
//! contributes. Construction never performs I/O — all host facts arrive
//! pre-resolved in [`HostProfile`].
//!
//! A capability is actionable only when `present()` is true and `native_os()`
//! is false. This single rule serves both directions the patcher works in:
//! restoring dropped hardware support on a newer OS, and restoring features a
//! newer OS removed for everyone.
//!
//! Catalog order is stable and intentional — when two capabilities overwrite
//! the same destination file, the later one wins by executing last.

pub mod graphics;
pub mod misc;
pub mod networking;

use std::sync::Arc;

use crate::config::PatcherSettings;
use crate::models::{
    AmfiLevel, CapabilityPatches, GraphicsSubclass, HardwareVariant, HostProfile, OsTarget, SipBit,
};

/// One hardware/software compatibility rule.
///
/// `name()` doubles as the display string and the persisted-state key on the
/// patched root volume; "already applied" detection matches on it exactly.
pub trait HardwareCapability {
    /// Display name and persisted-state key, ex. "Networking: Modern Wireless".
    fn name(&self) -> String;

    /// Hardware class this capability belongs to.
    fn hardware_variant(&self) -> HardwareVariant;

    /// True when this hardware class is detected on the host.
    fn present(&self) -> bool;

    /// True when the target OS supports this hardware without patching.
    fn native_os(&self) -> bool;

    /// Rendering-stack generation, for GPU capabilities only.
    fn graphics_subclass(&self) -> GraphicsSubclass {
        GraphicsSubclass::NotApplicable
    }

    /// Kernel Debug Kit must be merged onto the root before cache rebuild.
    fn requires_kernel_debug_kit(&self) -> bool {
        false
    }

    /// Metal support package must be fetched before patching.
    fn requires_metal_support_package(&self) -> bool {
        false
    }

    /// SIP bits that must be relaxed for the patches to function post-boot.
    fn required_sip_relaxations(&self) -> Vec<SipBit> {
        Vec::new()
    }

    /// Maximum AMFI strictness compatible with this patch.
    fn required_amfi_level(&self) -> AmfiLevel {
        AmfiLevel::NoCheck
    }

    /// Patch actions this capability contributes, empty on a native OS.
    fn patches(&self) -> Vec<CapabilityPatches>;
}

/// SIP bits every root-volume file patch needs: unsigned kexts, writable
/// system volume, and booting an unsealed snapshot.
pub fn base_root_patch_sip() -> Vec<SipBit> {
    vec![
        SipBit::AllowUntrustedKexts,
        SipBit::AllowUnrestrictedFs,
        SipBit::AllowUnauthenticatedRoot,
    ]
}

/// Build the full capability catalog in its fixed order.
pub fn build_catalog(
    target: &OsTarget,
    host: &Arc<HostProfile>,
    settings: &PatcherSettings,
) -> Vec<Box<dyn HardwareCapability>> {
    vec![
        Box::new(graphics::IntelIronLake::new(target, host)),
        Box::new(graphics::IntelSandyBridge::new(target, host)),
        Box::new(graphics::IntelIvyBridge::new(target, host)),
        Box::new(graphics::IntelHaswell::new(target, host)),
        Box::new(graphics::IntelBroadwell::new(target, host)),
        Box::new(graphics::IntelSkylake::new(target, host)),
        Box::new(graphics::NvidiaTesla::new(target, host)),
        Box::new(graphics::NvidiaKepler::new(target, host)),
        Box::new(graphics::NvidiaWebDrivers::new(target, host)),
        Box::new(graphics::AmdTeraScale1::new(target, host)),
        Box::new(graphics::AmdTeraScale2::new(target, host)),
        Box::new(graphics::AmdLegacyGcn::new(target, host)),
        Box::new(graphics::AmdPolaris::new(target, host)),
        Box::new(graphics::AmdVega::new(target, host)),
        Box::new(networking::LegacyWireless::new(target, host)),
        Box::new(networking::ModernWireless::new(target, host)),
        Box::new(misc::DisplayBacklight::new(target, host)),
        Box::new(misc::GraphicsMultiplexer::new(target, host)),
        Box::new(misc::KeyboardBacklight::new(target, host)),
        Box::new(misc::LegacyAudio::new(target, host)),
        Box::new(misc::PcieFaceTimeCamera::new(target, host)),
        Box::new(misc::T1SecurityChip::new(target, host)),
        Box::new(misc::Usb11Controller::new(target, host, settings.force_usb11_patch)),
        Box::new(misc::CpuMissingAvx::new(target, host)),
    ]
}
