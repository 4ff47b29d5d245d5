//! Miscellaneous capability variants: backlights, audio, cameras, security
//! chip, USB era and CPU feature gaps.

use std::sync::Arc;

use super::{base_root_patch_sip, HardwareCapability};
use crate::models::{
    AmfiLevel, CapabilityPatches, HardwareVariant, HostProfile, MacOsRelease, OsTarget,
    PatchSource, SipBit,
};

pub const DISPLAY_BACKLIGHT_NAME: &str = "Misc: Display Backlight";
pub const GRAPHICS_MULTIPLEXER_NAME: &str = "Misc: Graphics Multiplexer";
pub const KEYBOARD_BACKLIGHT_NAME: &str = "Misc: Keyboard Backlight";
pub const LEGACY_AUDIO_NAME: &str = "Misc: Legacy Audio";
pub const PCIE_FACETIME_CAMERA_NAME: &str = "Misc: PCIe FaceTime Camera";
pub const T1_SECURITY_CHIP_NAME: &str = "Misc: T1 Security Chip";
pub const USB11_CONTROLLER_NAME: &str = "Misc: USB 1.1 Controller";
pub const CPU_MISSING_AVX_NAME: &str = "Misc: CPU Missing AVX";

pub struct DisplayBacklight {
    target: OsTarget,
    host: Arc<HostProfile>,
}

impl DisplayBacklight {
    pub fn new(target: &OsTarget, host: &Arc<HostProfile>) -> Self {
        DisplayBacklight {
            target: target.clone(),
            host: Arc::clone(host),
        }
    }
}

impl HardwareCapability for DisplayBacklight {
    fn name(&self) -> String {
        DISPLAY_BACKLIGHT_NAME.to_string()
    }

    fn hardware_variant(&self) -> HardwareVariant {
        HardwareVariant::Miscellaneous
    }

    fn present(&self) -> bool {
        self.host.legacy_display_backlight
    }

    fn native_os(&self) -> bool {
        self.target.before(MacOsRelease::BigSur)
    }

    fn required_sip_relaxations(&self) -> Vec<SipBit> {
        base_root_patch_sip()
    }

    fn patches(&self) -> Vec<CapabilityPatches> {
        if self.native_os() {
            return Vec::new();
        }
        let src = PatchSource::Bundle(format!("10.15.7-{}", self.target.xnu_major));
        vec![CapabilityPatches::new(DISPLAY_BACKLIGHT_NAME).overwrite_system(
            "/System/Library/Extensions",
            &[("AppleBacklight.kext", src.clone()), ("AppleBacklightExpert.kext", src)],
        )]
    }
}

pub struct GraphicsMultiplexer {
    target: OsTarget,
    host: Arc<HostProfile>,
}

impl GraphicsMultiplexer {
    pub fn new(target: &OsTarget, host: &Arc<HostProfile>) -> Self {
        GraphicsMultiplexer {
            target: target.clone(),
            host: Arc::clone(host),
        }
    }
}

impl HardwareCapability for GraphicsMultiplexer {
    fn name(&self) -> String {
        GRAPHICS_MULTIPLEXER_NAME.to_string()
    }

    fn hardware_variant(&self) -> HardwareVariant {
        HardwareVariant::Miscellaneous
    }

    fn present(&self) -> bool {
        self.host.has_graphics_multiplexer
    }

    fn native_os(&self) -> bool {
        self.target.before(MacOsRelease::Monterey)
    }

    fn required_sip_relaxations(&self) -> Vec<SipBit> {
        base_root_patch_sip()
    }

    fn patches(&self) -> Vec<CapabilityPatches> {
        if self.native_os() {
            return Vec::new();
        }
        let src = PatchSource::Bundle(format!("11.7.10-{}", self.target.xnu_major));
        vec![CapabilityPatches::new(GRAPHICS_MULTIPLEXER_NAME)
            .overwrite_system(
                "/System/Library/Extensions",
                &[("AppleMuxControl.kext", src.clone())],
            )
            .overwrite_system(
                "/System/Library/PrivateFrameworks/DisplayServices.framework/Versions/A/Resources",
                &[("AppleMuxControl.plugin", src)],
            )]
    }
}

pub struct KeyboardBacklight {
    target: OsTarget,
    host: Arc<HostProfile>,
}

impl KeyboardBacklight {
    pub fn new(target: &OsTarget, host: &Arc<HostProfile>) -> Self {
        KeyboardBacklight {
            target: target.clone(),
            host: Arc::clone(host),
        }
    }
}

impl HardwareCapability for KeyboardBacklight {
    fn name(&self) -> String {
        KEYBOARD_BACKLIGHT_NAME.to_string()
    }

    fn hardware_variant(&self) -> HardwareVariant {
        HardwareVariant::Miscellaneous
    }

    fn present(&self) -> bool {
        self.host.legacy_keyboard_backlight
    }

    fn native_os(&self) -> bool {
        self.target.before(MacOsRelease::Ventura)
    }

    fn required_sip_relaxations(&self) -> Vec<SipBit> {
        base_root_patch_sip()
    }

    fn patches(&self) -> Vec<CapabilityPatches> {
        if self.native_os() {
            return Vec::new();
        }
        let src = PatchSource::Bundle(format!("12.7.6-{}", self.target.xnu_major));
        vec![CapabilityPatches::new(KEYBOARD_BACKLIGHT_NAME).overwrite_system(
            "/usr/libexec",
            &[("backlightd", src)],
        )]
    }
}

pub struct LegacyAudio {
    target: OsTarget,
    host: Arc<HostProfile>,
}

impl LegacyAudio {
    pub fn new(target: &OsTarget, host: &Arc<HostProfile>) -> Self {
        LegacyAudio {
            target: target.clone(),
            host: Arc::clone(host),
        }
    }
}

impl HardwareCapability for LegacyAudio {
    fn name(&self) -> String {
        LEGACY_AUDIO_NAME.to_string()
    }

    fn hardware_variant(&self) -> HardwareVariant {
        HardwareVariant::Miscellaneous
    }

    fn present(&self) -> bool {
        self.host.legacy_audio_codec
    }

    fn native_os(&self) -> bool {
        self.target.before(MacOsRelease::Sonoma)
    }

    fn required_sip_relaxations(&self) -> Vec<SipBit> {
        base_root_patch_sip()
    }

    fn patches(&self) -> Vec<CapabilityPatches> {
        if self.native_os() {
            return Vec::new();
        }
        let src = PatchSource::Bundle(format!("12.7.6-{}", self.target.xnu_major));
        vec![CapabilityPatches::new(LEGACY_AUDIO_NAME).overwrite_system(
            "/System/Library/Extensions",
            &[("AppleHDA.kext", src.clone()), ("IOAudioFamily.kext", src)],
        )]
    }
}

pub struct PcieFaceTimeCamera {
    target: OsTarget,
    host: Arc<HostProfile>,
}

impl PcieFaceTimeCamera {
    pub fn new(target: &OsTarget, host: &Arc<HostProfile>) -> Self {
        PcieFaceTimeCamera {
            target: target.clone(),
            host: Arc::clone(host),
        }
    }
}

impl HardwareCapability for PcieFaceTimeCamera {
    fn name(&self) -> String {
        PCIE_FACETIME_CAMERA_NAME.to_string()
    }

    fn hardware_variant(&self) -> HardwareVariant {
        HardwareVariant::Miscellaneous
    }

    fn present(&self) -> bool {
        self.host.has_pcie_facetime_camera
    }

    fn native_os(&self) -> bool {
        self.target.before(MacOsRelease::Monterey)
    }

    fn required_sip_relaxations(&self) -> Vec<SipBit> {
        base_root_patch_sip()
    }

    fn patches(&self) -> Vec<CapabilityPatches> {
        if self.native_os() {
            return Vec::new();
        }
        let src = PatchSource::Bundle(format!("11.7.10-{}", self.target.xnu_major));
        vec![CapabilityPatches::new(PCIE_FACETIME_CAMERA_NAME)
            .overwrite_system(
                "/System/Library/Extensions",
                &[("AppleCameraInterface.kext", src.clone())],
            )
            .execute("/usr/bin/killall AppleCameraAssistant", true)]
    }
}

pub struct T1SecurityChip {
    target: OsTarget,
    host: Arc<HostProfile>,
}

impl T1SecurityChip {
    pub fn new(target: &OsTarget, host: &Arc<HostProfile>) -> Self {
        T1SecurityChip {
            target: target.clone(),
            host: Arc::clone(host),
        }
    }
}

impl HardwareCapability for T1SecurityChip {
    fn name(&self) -> String {
        T1_SECURITY_CHIP_NAME.to_string()
    }

    fn hardware_variant(&self) -> HardwareVariant {
        HardwareVariant::Miscellaneous
    }

    fn present(&self) -> bool {
        self.host.has_t1_security_chip
    }

    fn native_os(&self) -> bool {
        self.target.before(MacOsRelease::Sonoma)
    }

    fn required_sip_relaxations(&self) -> Vec<SipBit> {
        base_root_patch_sip()
    }

    fn required_amfi_level(&self) -> AmfiLevel {
        // Biometric daemons are library-validated
        AmfiLevel::LibraryValidation
    }

    fn patches(&self) -> Vec<CapabilityPatches> {
        if self.native_os() {
            return Vec::new();
        }
        let src = PatchSource::Bundle(format!("12.7.6-{}", self.target.xnu_major));
        vec![CapabilityPatches::new(T1_SECURITY_CHIP_NAME)
            .overwrite_system(
                "/usr/libexec",
                &[("biometrickitd", src.clone()), ("SecureTokenHelper", src.clone())],
            )
            .merge_system(
                "/System/Library/PrivateFrameworks",
                &[("BiometricKit.framework", src)],
            )]
    }
}

/// UHCI/OHCI era controllers, dropped with macOS Ventura. Presence can be
/// forced through settings for hosts whose controllers hide behind hubs.
pub struct Usb11Controller {
    target: OsTarget,
    host: Arc<HostProfile>,
    forced: bool,
}

impl Usb11Controller {
    pub fn new(target: &OsTarget, host: &Arc<HostProfile>, forced: bool) -> Self {
        Usb11Controller {
            target: target.clone(),
            host: Arc::clone(host),
            forced,
        }
    }
}

impl HardwareCapability for Usb11Controller {
    fn name(&self) -> String {
        USB11_CONTROLLER_NAME.to_string()
    }

    fn hardware_variant(&self) -> HardwareVariant {
        HardwareVariant::Miscellaneous
    }

    fn present(&self) -> bool {
        self.host.has_usb11_controllers || self.forced
    }

    fn native_os(&self) -> bool {
        self.target.before(MacOsRelease::Ventura)
    }

    fn requires_kernel_debug_kit(&self) -> bool {
        true
    }

    fn required_sip_relaxations(&self) -> Vec<SipBit> {
        base_root_patch_sip()
    }

    fn patches(&self) -> Vec<CapabilityPatches> {
        if self.native_os() {
            return Vec::new();
        }
        let src = PatchSource::Bundle(format!("12.7.6-{}", self.target.xnu_major));
        vec![CapabilityPatches::new(USB11_CONTROLLER_NAME).overwrite_system(
            "/System/Library/Extensions",
            &[
                ("AppleUSBUHCI.kext", src.clone()),
                ("AppleUSBOHCI.kext", src.clone()),
                ("AppleUSBUHCIPCI.kext", src.clone()),
                ("AppleUSBOHCIPCI.kext", src),
            ],
        )]
    }
}

pub struct CpuMissingAvx {
    target: OsTarget,
    host: Arc<HostProfile>,
}

impl CpuMissingAvx {
    pub fn new(target: &OsTarget, host: &Arc<HostProfile>) -> Self {
        CpuMissingAvx {
            target: target.clone(),
            host: Arc::clone(host),
        }
    }
}

impl HardwareCapability for CpuMissingAvx {
    fn name(&self) -> String {
        CPU_MISSING_AVX_NAME.to_string()
    }

    fn hardware_variant(&self) -> HardwareVariant {
        HardwareVariant::Miscellaneous
    }

    fn present(&self) -> bool {
        self.host.cpu_missing_avx2
    }

    fn native_os(&self) -> bool {
        self.target.before(MacOsRelease::Sonoma)
    }

    fn required_sip_relaxations(&self) -> Vec<SipBit> {
        base_root_patch_sip()
    }

    fn patches(&self) -> Vec<CapabilityPatches> {
        if self.native_os() {
            return Vec::new();
        }
        let src = PatchSource::Bundle(format!("12.7.6-{}", self.target.xnu_major));
        vec![CapabilityPatches::new(CPU_MISSING_AVX_NAME)
            .merge_system(
                "/System/Library/PrivateFrameworks",
                &[("AppleFSCompression.framework", src.clone())],
            )
            .overwrite_system("/usr/libexec", &[("trustd", src)])]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usb11_force_flag() {
        let target = OsTarget::new(22, 0, "22G91", "13.5");
        let host = Arc::new(HostProfile::default());
        let cap = Usb11Controller::new(&target, &host, false);
        assert!(!cap.present());
        let forced = Usb11Controller::new(&target, &host, true);
        assert!(forced.present());
        assert!(forced.requires_kernel_debug_kit());
    }

    #[test]
    fn test_t1_amfi_level() {
        let target = OsTarget::new(23, 0, "23A344", "14.0");
        let host = Arc::new(HostProfile {
            has_t1_security_chip: true,
            ..HostProfile::default()
        });
        let cap = T1SecurityChip::new(&target, &host);
        assert!(cap.present());
        assert_eq!(cap.required_amfi_level(), AmfiLevel::LibraryValidation);
    }

    #[test]
    fn test_camera_contributes_command_action() {
        let target = OsTarget::new(21, 0, "21G72", "12.5");
        let host = Arc::new(HostProfile {
            has_pcie_facetime_camera: true,
            ..HostProfile::default()
        });
        let cap = PcieFaceTimeCamera::new(&target, &host);
        let patches = cap.patches();
        assert_eq!(patches[0].commands.len(), 1);
        assert!(patches[0].commands[0].elevated);
    }

    #[test]
    fn test_native_os_windows() {
        let host = Arc::new(HostProfile {
            legacy_audio_codec: true,
            ..HostProfile::default()
        });
        let ventura = LegacyAudio::new(&OsTarget::new(22, 0, "22G91", "13.5"), &host);
        assert!(ventura.native_os());
        let sonoma = LegacyAudio::new(&OsTarget::new(23, 0, "23A344", "14.0"), &host);
        assert!(!sonoma.native_os());
    }
}
