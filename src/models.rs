//! Core data types for rootpatch.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;

/// Darwin kernel majors for the macOS releases this patcher spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u32)]
pub enum MacOsRelease {
    HighSierra = 17,
    Mojave = 18,
    Catalina = 19,
    BigSur = 20,
    Monterey = 21,
    Ventura = 22,
    Sonoma = 23,
    Sequoia = 24,
    Tahoe = 25,
}

impl MacOsRelease {
    /// Darwin major version.
    pub fn major(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for MacOsRelease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MacOsRelease::HighSierra => "High Sierra",
            MacOsRelease::Mojave => "Mojave",
            MacOsRelease::Catalina => "Catalina",
            MacOsRelease::BigSur => "Big Sur",
            MacOsRelease::Monterey => "Monterey",
            MacOsRelease::Ventura => "Ventura",
            MacOsRelease::Sonoma => "Sonoma",
            MacOsRelease::Sequoia => "Sequoia",
            MacOsRelease::Tahoe => "Tahoe",
        };
        write!(f, "{}", name)
    }
}

/// Target OS for a detection/patch pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsTarget {
    pub xnu_major: u32,     // Darwin major
    pub xnu_minor: u32,     // Darwin minor
    pub os_build: String,   // ex. 23B74
    pub os_version: String, // ex. 14.1.1
}

impl OsTarget {
    pub fn new(xnu_major: u32, xnu_minor: u32, os_build: &str, os_version: &str) -> Self {
        OsTarget {
            xnu_major,
            xnu_minor,
            os_build: os_build.to_string(),
            os_version: os_version.to_string(),
        }
    }

    /// Darwin major at or beyond the given release.
    pub fn at_least(&self, release: MacOsRelease) -> bool {
        self.xnu_major >= release.major()
    }

    /// Darwin major strictly before the given release.
    pub fn before(&self, release: MacOsRelease) -> bool {
        self.xnu_major < release.major()
    }
}

/// System Integrity Protection csr-active-config bits.
///
/// Values mirror Apple's csr.h. Capabilities declare which bits must be
/// relaxed for their patches to function; the resolver unions them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SipBit {
    AllowUntrustedKexts,
    AllowUnrestrictedFs,
    AllowTaskForPid,
    AllowKernelDebugger,
    AllowAppleInternal,
    AllowUnrestrictedDtrace,
    AllowUnrestrictedNvram,
    AllowDeviceConfiguration,
    AllowAnyRecoveryOs,
    AllowUnapprovedKexts,
    AllowExecutablePolicyOverride,
    AllowUnauthenticatedRoot,
}

impl SipBit {
    /// Raw csr-active-config value.
    pub fn value(self) -> u32 {
        match self {
            SipBit::AllowUntrustedKexts => 0x1,
            SipBit::AllowUnrestrictedFs => 0x2,
            SipBit::AllowTaskForPid => 0x4,
            SipBit::AllowKernelDebugger => 0x8,
            SipBit::AllowAppleInternal => 0x10,
            SipBit::AllowUnrestrictedDtrace => 0x20,
            SipBit::AllowUnrestrictedNvram => 0x40,
            SipBit::AllowDeviceConfiguration => 0x80,
            SipBit::AllowAnyRecoveryOs => 0x100,
            SipBit::AllowUnapprovedKexts => 0x200,
            SipBit::AllowExecutablePolicyOverride => 0x400,
            SipBit::AllowUnauthenticatedRoot => 0x800,
        }
    }

    /// Union of a set of bits into one csr mask.
    pub fn union(bits: &[SipBit]) -> u32 {
        bits.iter().fold(0, |acc, b| acc | b.value())
    }
}

/// AMFI strictness a patch can tolerate, ordered from least to most relaxed.
///
/// The resolver takes the maximum across all active capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AmfiLevel {
    NoCheck,
    LibraryValidation,
    FullDisable,
}

/// Broad hardware class a capability belongs to.
///
/// The Display form is the prefix of every capability name ("Networking: …"),
/// which the resolver's network-missing pruning keys on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HardwareVariant {
    Graphics,
    Networking,
    Miscellaneous,
}

impl fmt::Display for HardwareVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HardwareVariant::Graphics => "Graphics",
            HardwareVariant::Networking => "Networking",
            HardwareVariant::Miscellaneous => "Misc",
        };
        write!(f, "{}", name)
    }
}

/// Rendering-stack generation for GPU capabilities. Feeds conflict stripping:
/// non-Metal GPUs cannot coexist with Metal GPUs, and the two Metal
/// generations are mutually exclusive on Sequoia and newer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GraphicsSubclass {
    Metal31001,
    Metal3802,
    NonMetal,
    NotApplicable,
}

/// GPU vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GpuVendor {
    Intel,
    Nvidia,
    Amd,
}

/// GPU architecture families the catalog recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GpuArchitecture {
    IntelIronLake,
    IntelSandyBridge,
    IntelIvyBridge,
    IntelHaswell,
    IntelBroadwell,
    IntelSkylake,
    NvidiaTesla,
    NvidiaKepler,
    NvidiaWebDriverClass, // Maxwell/Pascal, needs Nvidia's web drivers
    AmdTeraScale1,
    AmdTeraScale2,
    AmdLegacyGcn,
    AmdPolaris,
    AmdVega,
}

/// Detected GPU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuDevice {
    pub vendor: GpuVendor,             // Vendor
    pub architecture: GpuArchitecture, // Family
    pub device_id: u16,                // PCI device id
    pub disable_metal: bool,           // Force OpenGL rendering
    pub force_compatible: bool,        // Force compat override
}

/// Wireless chipset generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WirelessChipset {
    AtherosLegacy,
    BroadcomBcm94328,
    BroadcomBcm94322,
    BroadcomBcm94360,
    BroadcomNic,
    BroadcomNicThirdParty,
    IntelWireless,
}

impl WirelessChipset {
    /// Chipsets handled by the legacy wireless patchset.
    pub fn is_legacy(self) -> bool {
        matches!(
            self,
            WirelessChipset::AtherosLegacy
                | WirelessChipset::BroadcomBcm94328
                | WirelessChipset::BroadcomBcm94322
        )
    }

    /// Chipsets handled by the modern wireless patchset.
    pub fn is_modern(self) -> bool {
        matches!(
            self,
            WirelessChipset::BroadcomBcm94360
                | WirelessChipset::BroadcomNic
                | WirelessChipset::BroadcomNicThirdParty
                | WirelessChipset::IntelWireless
        )
    }
}

/// Detected wireless card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WirelessCard {
    pub chipset: WirelessChipset, // Chipset
    pub device_id: u16,           // PCI device id
}

/// Host hardware facts, collected by an external probe layer and treated as
/// read-only resolved data by the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostProfile {
    pub model_identifier: String,       // ex. MacBookPro11,3
    pub board_id: String,               // ex. Mac-2BD1B31983FE1663
    pub is_genuine_mac: bool,           // Real Mac vs. generic PC
    pub gpus: Vec<GpuDevice>,           // All detected GPUs
    pub wireless: Option<WirelessCard>, // Wireless card, if any
    pub legacy_audio_codec: bool,       // Pre-AppleALC realtek era
    pub has_t1_security_chip: bool,     // T1 coprocessor
    pub has_usb11_controllers: bool,    // UHCI/OHCI era controllers
    pub legacy_display_backlight: bool, // Pre-Metal backlight control
    pub has_graphics_multiplexer: bool, // Dual-GPU gmux
    pub legacy_keyboard_backlight: bool,
    pub has_pcie_facetime_camera: bool,
    pub cpu_missing_avx2: bool, // Ivy Bridge and older
}

impl Default for HostProfile {
    fn default() -> Self {
        HostProfile {
            model_identifier: "Unknown".to_string(),
            board_id: "Mac-00000000000000".to_string(),
            is_genuine_mac: true,
            gpus: Vec::new(),
            wireless: None,
            legacy_audio_codec: false,
            has_t1_security_chip: false,
            has_usb11_controllers: false,
            legacy_display_backlight: false,
            has_graphics_multiplexer: false,
            legacy_keyboard_backlight: false,
            has_pcie_facetime_camera: false,
            cpu_missing_avx2: false,
        }
    }
}

impl HostProfile {
    /// Whether any detected GPU belongs to the given family.
    pub fn has_gpu(&self, architecture: GpuArchitecture) -> bool {
        self.gpus.iter().any(|g| g.architecture == architecture)
    }
}

/// Patch action kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PatchType {
    OverwriteSystemVolume,
    OverwriteDataVolume,
    MergeSystemVolume,
    MergeDataVolume,
    RemoveSystemVolume,
    RemoveDataVolume,
    Execute,
}

impl PatchType {
    /// Volume this action targets (Execute has none).
    pub fn volume(self) -> Option<VolumeTarget> {
        match self {
            PatchType::OverwriteSystemVolume
            | PatchType::MergeSystemVolume
            | PatchType::RemoveSystemVolume => Some(VolumeTarget::System),
            PatchType::OverwriteDataVolume
            | PatchType::MergeDataVolume
            | PatchType::RemoveDataVolume => Some(VolumeTarget::Data),
            PatchType::Execute => None,
        }
    }

    pub fn is_merge(self) -> bool {
        matches!(self, PatchType::MergeSystemVolume | PatchType::MergeDataVolume)
    }
}

/// Which mounted volume a path is resolved against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeTarget {
    System,
    Data,
}

/// Lazily-resolved source bundles, fetched on demand during pre-flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DynamicResource {
    MetalSupportPackage,
}

/// Where an installed file comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchSource {
    /// Versioned prefix inside the local patcher support payload,
    /// ex. "13.7.2-23". The destination directory is appended to it.
    Bundle(String),
    /// Absolute path on the host, used as-is.
    Absolute(PathBuf),
    /// Placeholder resolved to a concrete path during pre-flight.
    Dynamic(DynamicResource),
}

/// A single overwrite or merge of one file/bundle into a destination
/// directory on the mounted volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallAction {
    pub kind: PatchType,   // Overwrite*/Merge* only
    pub directory: String, // Destination dir, volume-relative
    pub file: String,      // File or bundle name
    pub source: PatchSource,
}

/// Deletion of one named path from a destination directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveAction {
    pub kind: PatchType,   // Remove* only
    pub directory: String, // Destination dir, volume-relative
    pub file: String,      // File or bundle name
}

/// A fixed command line run after installs complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandAction {
    pub command: String, // Full command line
    pub elevated: bool,  // Run as root
}

/// All actions contributed by one capability, executed in order:
/// removes, then installs (system volume before data volume), then commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityPatches {
    pub capability: String, // Capability name (persisted-state key)
    pub removes: Vec<RemoveAction>,
    pub installs: Vec<InstallAction>,
    pub commands: Vec<CommandAction>,
}

impl CapabilityPatches {
    pub fn new(capability: impl Into<String>) -> Self {
        CapabilityPatches {
            capability: capability.into(),
            removes: Vec::new(),
            installs: Vec::new(),
            commands: Vec::new(),
        }
    }

    /// Add overwrite-on-system-volume entries sharing one destination dir.
    pub fn overwrite_system(mut self, directory: &str, files: &[(&str, PatchSource)]) -> Self {
        for (file, source) in files {
            self.installs.push(InstallAction {
                kind: PatchType::OverwriteSystemVolume,
                directory: directory.to_string(),
                file: file.to_string(),
                source: source.clone(),
            });
        }
        self
    }

    /// Add merge-on-system-volume entries sharing one destination dir.
    pub fn merge_system(mut self, directory: &str, files: &[(&str, PatchSource)]) -> Self {
        for (file, source) in files {
            self.installs.push(InstallAction {
                kind: PatchType::MergeSystemVolume,
                directory: directory.to_string(),
                file: file.to_string(),
                source: source.clone(),
            });
        }
        self
    }

    /// Add overwrite-on-data-volume entries sharing one destination dir.
    pub fn overwrite_data(mut self, directory: &str, files: &[(&str, PatchSource)]) -> Self {
        for (file, source) in files {
            self.installs.push(InstallAction {
                kind: PatchType::OverwriteDataVolume,
                directory: directory.to_string(),
                file: file.to_string(),
                source: source.clone(),
            });
        }
        self
    }

    /// Add remove-from-system-volume entries sharing one destination dir.
    pub fn remove_system(mut self, directory: &str, files: &[&str]) -> Self {
        for file in files {
            self.removes.push(RemoveAction {
                kind: PatchType::RemoveSystemVolume,
                directory: directory.to_string(),
                file: file.to_string(),
            });
        }
        self
    }

    /// Add remove-from-data-volume entries sharing one destination dir.
    pub fn remove_data(mut self, directory: &str, files: &[&str]) -> Self {
        for file in files {
            self.removes.push(RemoveAction {
                kind: PatchType::RemoveDataVolume,
                directory: directory.to_string(),
                file: file.to_string(),
            });
        }
        self
    }

    /// Add a post-install command.
    pub fn execute(mut self, command: &str, elevated: bool) -> Self {
        self.commands.push(CommandAction {
            command: command.to_string(),
            elevated,
        });
        self
    }
}

/// Resolved patch plan: per-capability action sets in catalog order.
///
/// Iteration order is load-bearing — when two capabilities overwrite the same
/// destination path the later entry wins by executing last.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchPlan {
    pub entries: Vec<CapabilityPatches>,
}

impl PatchPlan {
    pub fn new() -> Self {
        PatchPlan::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, capability: &str) -> bool {
        self.entries.iter().any(|e| e.capability == capability)
    }

    /// Insert a capability's actions. An entry with the same name is replaced
    /// in place, keeping its original position.
    pub fn merge(&mut self, patches: CapabilityPatches) {
        match self
            .entries
            .iter_mut()
            .find(|e| e.capability == patches.capability)
        {
            Some(existing) => *existing = patches,
            None => self.entries.push(patches),
        }
    }

    /// Names of all capabilities in the plan, in plan order.
    pub fn capability_names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.capability.clone()).collect()
    }
}

/// Ordered string-keyed boolean map, the resolver's display/persistence
/// surface. Insertion order is preserved; inserting an existing key updates
/// the value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProperties {
    entries: Vec<(String, bool)>,
}

impl DeviceProperties {
    pub fn new() -> Self {
        DeviceProperties::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: bool) {
        let key = key.into();
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    /// Insert `key` immediately after `after`, or append if absent.
    pub fn insert_after(&mut self, after: &str, key: impl Into<String>, value: bool) {
        let key = key.into();
        match self.entries.iter().position(|(k, _)| k == after) {
            Some(idx) => self.entries.insert(idx + 1, (key, value)),
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<bool> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| *v)
    }

    pub fn remove(&mut self, key: &str) {
        self.entries.retain(|(k, _)| k != key);
    }

    pub fn retain(&mut self, mut f: impl FnMut(&str, bool) -> bool) {
        self.entries.retain(|(k, v)| f(k, *v));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Compare dotted numeric version strings, ex. "1.4.0" vs "1.10".
///
/// Missing components compare as zero; non-numeric components as zero.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |s: &str| -> Vec<u64> {
        s.trim()
            .split('.')
            .map(|c| c.trim().parse::<u64>().unwrap_or(0))
            .collect()
    };
    let (va, vb) = (parse(a), parse(b));
    let len = va.len().max(vb.len());
    for i in 0..len {
        let ca = va.get(i).copied().unwrap_or(0);
        let cb = vb.get(i).copied().unwrap_or(0);
        match ca.cmp(&cb) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}
