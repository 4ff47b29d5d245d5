//! Wireless capability variants.
//!
//! These are the "network-dependent" capabilities the resolver's
//! missing-network handling keys on: a host whose wireless stack needs
//! patching may be offline precisely because of it.

use std::sync::Arc;

use super::{base_root_patch_sip, HardwareCapability};
use crate::models::{
    AmfiLevel, CapabilityPatches, HardwareVariant, HostProfile, MacOsRelease, OsTarget,
    PatchSource, SipBit, WirelessChipset,
};

pub const LEGACY_WIRELESS_NAME: &str = "Networking: Legacy Wireless";
pub const MODERN_WIRELESS_NAME: &str = "Networking: Modern Wireless";

fn chipset(host: &HostProfile) -> Option<WirelessChipset> {
    host.wireless.as_ref().map(|w| w.chipset)
}

/// Atheros and early Broadcom cards, dropped with macOS Monterey.
pub struct LegacyWireless {
    target: OsTarget,
    host: Arc<HostProfile>,
}

impl LegacyWireless {
    pub fn new(target: &OsTarget, host: &Arc<HostProfile>) -> Self {
        LegacyWireless {
            target: target.clone(),
            host: Arc::clone(host),
        }
    }
}

impl HardwareCapability for LegacyWireless {
    fn name(&self) -> String {
        LEGACY_WIRELESS_NAME.to_string()
    }

    fn hardware_variant(&self) -> HardwareVariant {
        HardwareVariant::Networking
    }

    fn present(&self) -> bool {
        chipset(&self.host).map_or(false, |c| c.is_legacy())
    }

    fn native_os(&self) -> bool {
        self.target.before(MacOsRelease::Monterey)
    }

    fn requires_kernel_debug_kit(&self) -> bool {
        self.target.at_least(MacOsRelease::Ventura)
    }

    fn required_sip_relaxations(&self) -> Vec<SipBit> {
        base_root_patch_sip()
    }

    fn required_amfi_level(&self) -> AmfiLevel {
        AmfiLevel::NoCheck
    }

    fn patches(&self) -> Vec<CapabilityPatches> {
        if self.native_os() {
            return Vec::new();
        }
        let src = PatchSource::Bundle(format!("11.7.10-{}", self.target.xnu_major));
        vec![CapabilityPatches::new(LEGACY_WIRELESS_NAME)
            .overwrite_system(
                "/System/Library/Extensions",
                &[
                    ("IO80211Family.kext", src.clone()),
                    ("corecaptureElCap.kext", src.clone()),
                ],
            )
            .overwrite_system("/usr/libexec", &[("airportd", src.clone())])
            .merge_system(
                "/System/Library/Frameworks",
                &[("CoreWLAN.framework", src)],
            )]
    }
}

/// BCM4360-class and Intel cards, dropped with macOS Sonoma.
pub struct ModernWireless {
    target: OsTarget,
    host: Arc<HostProfile>,
}

impl ModernWireless {
    pub fn new(target: &OsTarget, host: &Arc<HostProfile>) -> Self {
        ModernWireless {
            target: target.clone(),
            host: Arc::clone(host),
        }
    }

    fn broadcom_detected(&self) -> bool {
        matches!(
            chipset(&self.host),
            Some(WirelessChipset::BroadcomBcm94360)
                | Some(WirelessChipset::BroadcomNic)
                | Some(WirelessChipset::BroadcomNicThirdParty)
        )
    }

    fn intel_detected(&self) -> bool {
        matches!(chipset(&self.host), Some(WirelessChipset::IntelWireless))
    }
}

impl HardwareCapability for ModernWireless {
    fn name(&self) -> String {
        MODERN_WIRELESS_NAME.to_string()
    }

    fn hardware_variant(&self) -> HardwareVariant {
        HardwareVariant::Networking
    }

    fn present(&self) -> bool {
        // Intel cards only gained patchset coverage with Sequoia
        if self.target.before(MacOsRelease::Sequoia) {
            self.broadcom_detected()
        } else {
            self.broadcom_detected() || self.intel_detected()
        }
    }

    fn native_os(&self) -> bool {
        self.target.before(MacOsRelease::Sonoma)
    }

    fn required_sip_relaxations(&self) -> Vec<SipBit> {
        base_root_patch_sip()
    }

    fn required_amfi_level(&self) -> AmfiLevel {
        AmfiLevel::NoCheck
    }

    fn patches(&self) -> Vec<CapabilityPatches> {
        if self.native_os() {
            return Vec::new();
        }
        let src = PatchSource::Bundle(format!("13.7.2-{}", self.target.xnu_major));
        let mut entries = vec![CapabilityPatches::new(MODERN_WIRELESS_NAME)
            .overwrite_system("/usr/libexec", &[("wifip2pd", src.clone())])
            .merge_system(
                "/System/Library/PrivateFrameworks",
                &[
                    ("IO80211.framework", src.clone()),
                    ("WiFiPeerToPeer.framework", src.clone()),
                ],
            )];

        // Supplemental user-space stack, retired again after Sonoma
        if self.target.xnu_major <= MacOsRelease::Sonoma.major() {
            entries.push(
                CapabilityPatches::new(format!("{} Extended", MODERN_WIRELESS_NAME))
                    .overwrite_system("/usr/libexec", &[("airportd", src.clone())])
                    .merge_system(
                        "/System/Library/Frameworks",
                        &[("CoreWLAN.framework", src.clone())],
                    )
                    .merge_system(
                        "/System/Library/PrivateFrameworks",
                        &[("CoreWiFi.framework", src)],
                    ),
            );
        }
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WirelessCard;

    fn host_with(chipset: WirelessChipset) -> Arc<HostProfile> {
        Arc::new(HostProfile {
            wireless: Some(WirelessCard {
                chipset,
                device_id: 0x43A0,
            }),
            ..HostProfile::default()
        })
    }

    #[test]
    fn test_legacy_wireless_presence() {
        let target = OsTarget::new(21, 0, "21G72", "12.5");
        let cap = LegacyWireless::new(&target, &host_with(WirelessChipset::AtherosLegacy));
        assert!(cap.present());
        assert!(!cap.native_os());

        let modern_host = host_with(WirelessChipset::BroadcomBcm94360);
        let cap = LegacyWireless::new(&target, &modern_host);
        assert!(!cap.present());
    }

    #[test]
    fn test_modern_wireless_intel_needs_sequoia() {
        let host = host_with(WirelessChipset::IntelWireless);
        let sonoma = ModernWireless::new(&OsTarget::new(23, 0, "23A344", "14.0"), &host);
        assert!(!sonoma.present());

        let sequoia = ModernWireless::new(&OsTarget::new(24, 0, "24A335", "15.0"), &host);
        assert!(sequoia.present());
    }

    #[test]
    fn test_modern_wireless_native_before_sonoma() {
        let host = host_with(WirelessChipset::BroadcomBcm94360);
        let ventura = ModernWireless::new(&OsTarget::new(22, 0, "22G91", "13.5"), &host);
        assert!(ventura.native_os());
        assert!(ventura.patches().is_empty());
    }

    #[test]
    fn test_modern_wireless_extended_bundle_window() {
        let host = host_with(WirelessChipset::BroadcomBcm94360);
        let sonoma = ModernWireless::new(&OsTarget::new(23, 0, "23A344", "14.0"), &host);
        assert_eq!(sonoma.patches().len(), 2);

        let sequoia = ModernWireless::new(&OsTarget::new(24, 0, "24A335", "15.0"), &host);
        assert_eq!(sequoia.patches().len(), 1);
    }

    #[test]
    fn test_networking_prefix_in_names() {
        assert!(LEGACY_WIRELESS_NAME.starts_with("Networking:"));
        assert!(MODERN_WIRELESS_NAME.starts_with("Networking:"));
    }
}
