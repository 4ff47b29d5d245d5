//! Resolver property tests over synthetic capabilities and a fake
//! environment: idempotence, conflict stripping, native-OS suppression,
//! requirement propagation and gate independence.

use std::collections::HashMap;
use std::sync::Arc;

use rootpatch::catalog::graphics::AMD_LEGACY_GCN_NAME;
use rootpatch::catalog::HardwareCapability;
use rootpatch::models::{
    AmfiLevel, CapabilityPatches, GraphicsSubclass, HardwareVariant, HostProfile, OsTarget,
    PatchSource, PatchType, SipBit,
};
use rootpatch::resolver::{PatchsetResolver, ValidationGate};
use rootpatch::Environment;

#[derive(Clone)]
struct FakeEnvironment {
    csr: u32,
    boot_args: String,
    nvram: HashMap<String, String>,
    filevault: bool,
    secure_boot: bool,
    loaded_kexts: HashMap<String, String>,
    network: bool,
    kdk_installed: bool,
    metallib_installed: bool,
    applied: Vec<String>,
}

impl Default for FakeEnvironment {
    fn default() -> Self {
        // A host fully prepared for patching
        FakeEnvironment {
            csr: 0xFFF,
            boot_args: "amfi=0x80".to_string(),
            nvram: HashMap::new(),
            filevault: false,
            secure_boot: false,
            loaded_kexts: HashMap::new(),
            network: true,
            kdk_installed: true,
            metallib_installed: true,
            applied: Vec::new(),
        }
    }
}

impl Environment for FakeEnvironment {
    fn csr_active_config(&self) -> u32 {
        self.csr
    }
    fn boot_args(&self) -> String {
        self.boot_args.clone()
    }
    fn nvram(&self, key: &str) -> Option<String> {
        self.nvram.get(key).cloned()
    }
    fn filevault_enabled(&self) -> bool {
        self.filevault
    }
    fn secure_boot_model_enabled(&self) -> bool {
        self.secure_boot
    }
    fn loaded_kext_version(&self, bundle_id: &str) -> Option<String> {
        self.loaded_kexts.get(bundle_id).cloned()
    }
    fn network_available(&self) -> bool {
        self.network
    }
    fn kdk_installed(&self, _build: &str, _version: &str) -> bool {
        self.kdk_installed
    }
    fn metallib_installed(&self, _build: &str, _version: &str) -> bool {
        self.metallib_installed
    }
    fn applied_patches(&self) -> Vec<String> {
        self.applied.clone()
    }
    fn developer_override(&self) -> bool {
        false
    }
}

/// Fully-configurable synthetic capability.
struct TestCapability {
    name: String,
    variant: HardwareVariant,
    present: bool,
    native: bool,
    subclass: GraphicsSubclass,
    kdk: bool,
    metallib: bool,
    sip: Vec<SipBit>,
    amfi: AmfiLevel,
}

impl TestCapability {
    fn gpu(name: &str, subclass: GraphicsSubclass) -> Self {
        TestCapability {
            name: name.to_string(),
            variant: HardwareVariant::Graphics,
            present: true,
            native: false,
            subclass,
            kdk: false,
            metallib: false,
            sip: Vec::new(),
            amfi: AmfiLevel::NoCheck,
        }
    }

    fn networking(name: &str) -> Self {
        TestCapability {
            name: name.to_string(),
            variant: HardwareVariant::Networking,
            present: true,
            native: false,
            subclass: GraphicsSubclass::NotApplicable,
            kdk: false,
            metallib: false,
            sip: Vec::new(),
            amfi: AmfiLevel::NoCheck,
        }
    }
}

impl HardwareCapability for TestCapability {
    fn name(&self) -> String {
        self.name.clone()
    }
    fn hardware_variant(&self) -> HardwareVariant {
        self.variant
    }
    fn present(&self) -> bool {
        self.present
    }
    fn native_os(&self) -> bool {
        self.native
    }
    fn graphics_subclass(&self) -> GraphicsSubclass {
        self.subclass
    }
    fn requires_kernel_debug_kit(&self) -> bool {
        self.kdk
    }
    fn requires_metal_support_package(&self) -> bool {
        self.metallib
    }
    fn required_sip_relaxations(&self) -> Vec<SipBit> {
        self.sip.clone()
    }
    fn required_amfi_level(&self) -> AmfiLevel {
        self.amfi
    }
    fn patches(&self) -> Vec<CapabilityPatches> {
        if self.native {
            return Vec::new();
        }
        vec![CapabilityPatches::new(self.name.clone()).overwrite_system(
            "/System/Library/Extensions",
            &[("Test.kext", PatchSource::Bundle("1.0".to_string()))],
        )]
    }
}

fn sequoia() -> OsTarget {
    OsTarget::new(24, 0, "24A335", "15.0")
}

fn resolver(
    env: FakeEnvironment,
    caps: Vec<Box<dyn HardwareCapability>>,
) -> PatchsetResolver {
    PatchsetResolver::with_catalog(
        sequoia(),
        Arc::new(HostProfile::default()),
        Box::new(env),
        caps,
    )
}

#[test]
fn resolving_twice_yields_identical_results() {
    let r = resolver(
        FakeEnvironment::default(),
        vec![
            Box::new(TestCapability::gpu("Graphics: A", GraphicsSubclass::Metal31001)),
            Box::new(TestCapability::networking("Networking: B")),
        ],
    );
    let first = r.resolve();
    let second = r.resolve();
    assert_eq!(first.device_properties, second.device_properties);
    assert_eq!(first.plan, second.plan);
    assert_eq!(first.can_patch, second.can_patch);
    assert_eq!(first.can_unpatch, second.can_unpatch);
}

#[test]
fn non_metal_stripped_when_metal_gpu_present() {
    let resolution = resolver(
        FakeEnvironment::default(),
        vec![
            Box::new(TestCapability::gpu("Graphics: Non Metal", GraphicsSubclass::NonMetal)),
            Box::new(TestCapability::gpu("Graphics: Metal A", GraphicsSubclass::Metal31001)),
        ],
    )
    .resolve();

    assert!(!resolution.plan.contains("Graphics: Non Metal"));
    assert!(resolution.plan.contains("Graphics: Metal A"));
    assert!(resolution.device_properties.get("Graphics: Non Metal").is_none());
}

#[test]
fn metal_3802_stripped_against_31001_on_sequoia() {
    let resolution = resolver(
        FakeEnvironment::default(),
        vec![
            Box::new(TestCapability::gpu("Graphics: Gen B", GraphicsSubclass::Metal3802)),
            Box::new(TestCapability::gpu("Graphics: Gen A", GraphicsSubclass::Metal31001)),
        ],
    )
    .resolve();

    assert!(!resolution.plan.contains("Graphics: Gen B"));
    assert!(resolution.plan.contains("Graphics: Gen A"));
}

#[test]
fn legacy_gcn_exception_keeps_3802() {
    let resolution = resolver(
        FakeEnvironment::default(),
        vec![
            Box::new(TestCapability::gpu("Graphics: Gen B", GraphicsSubclass::Metal3802)),
            Box::new(TestCapability::gpu(AMD_LEGACY_GCN_NAME, GraphicsSubclass::Metal31001)),
        ],
    )
    .resolve();

    // The carve-out: 3802 survives when the 31001 capability is Legacy GCN
    assert!(resolution.plan.contains("Graphics: Gen B"));
    assert!(resolution.plan.contains(AMD_LEGACY_GCN_NAME));
}

#[test]
fn metal_3802_survives_31001_before_sequoia() {
    let resolution = PatchsetResolver::with_catalog(
        OsTarget::new(23, 0, "23A344", "14.0"),
        Arc::new(HostProfile::default()),
        Box::new(FakeEnvironment::default()),
        vec![
            Box::new(TestCapability::gpu("Graphics: Gen B", GraphicsSubclass::Metal3802)),
            Box::new(TestCapability::gpu("Graphics: Gen A", GraphicsSubclass::Metal31001)),
        ],
    )
    .resolve();

    assert!(resolution.plan.contains("Graphics: Gen B"));
}

#[test]
fn native_os_suppression_clears_actions_and_requirements() {
    let mut cap = TestCapability::gpu("Graphics: Native", GraphicsSubclass::Metal31001);
    cap.native = true;
    cap.kdk = true;
    cap.sip = vec![SipBit::AllowUntrustedKexts];

    let mut env = FakeEnvironment::default();
    env.kdk_installed = false;
    env.csr = 0; // SIP fully enabled

    let resolution = resolver(env, vec![Box::new(cap)]).resolve();

    assert!(resolution.plan.is_empty());
    assert!(!resolution.validation.kdk_required);
    // No SIP bits required means the SIP gate cannot block
    assert!(!resolution.validation.sip_enabled);
    assert!(resolution.can_patch);
}

#[test]
fn amfi_requirement_is_monotonic() {
    let mut env = FakeEnvironment::default();
    env.boot_args = String::new();

    let lenient = resolver(
        env.clone(),
        vec![Box::new(TestCapability::gpu("Graphics: A", GraphicsSubclass::Metal31001))],
    )
    .resolve();
    assert!(!lenient.validation.amfi_enabled);

    let mut strict_cap = TestCapability::gpu("Graphics: B", GraphicsSubclass::Metal31001);
    strict_cap.amfi = AmfiLevel::LibraryValidation;
    let strict = resolver(
        env,
        vec![
            Box::new(TestCapability::gpu("Graphics: A", GraphicsSubclass::Metal31001)),
            Box::new(strict_cap),
        ],
    )
    .resolve();
    assert!(strict.validation.amfi_enabled);
}

#[test]
fn amfipass_override_skips_amfi_gate() {
    let mut env = FakeEnvironment::default();
    env.boot_args = String::new();
    env.loaded_kexts
        .insert("com.dhinakg.AMFIPass".to_string(), "1.4.1".to_string());

    let mut cap = TestCapability::gpu("Graphics: A", GraphicsSubclass::NonMetal);
    cap.amfi = AmfiLevel::FullDisable;

    let resolution = resolver(env, vec![Box::new(cap)]).resolve();
    assert!(!resolution.validation.amfi_enabled);
}

#[test]
fn outdated_amfipass_does_not_override() {
    let mut env = FakeEnvironment::default();
    env.boot_args = String::new();
    env.loaded_kexts
        .insert("com.dhinakg.AMFIPass".to_string(), "1.3.0".to_string());

    let mut cap = TestCapability::gpu("Graphics: A", GraphicsSubclass::NonMetal);
    cap.amfi = AmfiLevel::FullDisable;

    let resolution = resolver(env, vec![Box::new(cap)]).resolve();
    assert!(resolution.validation.amfi_enabled);
}

#[test]
fn can_unpatch_depends_only_on_sip() {
    let mut cap = TestCapability::gpu("Graphics: A", GraphicsSubclass::Metal31001);
    cap.sip = vec![
        SipBit::AllowUntrustedKexts,
        SipBit::AllowUnrestrictedFs,
        SipBit::AllowUnauthenticatedRoot,
    ];
    cap.amfi = AmfiLevel::FullDisable;

    // SIP satisfied but FileVault and AMFI block
    let mut env = FakeEnvironment::default();
    env.csr = 0x803;
    env.filevault = true;
    env.boot_args = String::new();

    let resolution = resolver(env, vec![Box::new(cap)]).resolve();
    assert!(!resolution.can_patch);
    assert!(resolution.can_unpatch);

    // SIP enabled flips unpatching off
    let mut cap = TestCapability::gpu("Graphics: A", GraphicsSubclass::Metal31001);
    cap.sip = vec![SipBit::AllowUntrustedKexts];
    let mut env = FakeEnvironment::default();
    env.csr = 0;
    let resolution = resolver(env, vec![Box::new(cap)]).resolve();
    assert!(!resolution.can_unpatch);
}

#[test]
fn end_to_end_clean_metal_host() {
    let resolution = resolver(
        FakeEnvironment::default(),
        vec![Box::new(TestCapability::gpu(
            "GPU: Legacy Metal",
            GraphicsSubclass::Metal31001,
        ))],
    )
    .resolve();

    assert!(resolution.can_patch);
    assert_eq!(resolution.plan.entries.len(), 1);
    assert_eq!(resolution.plan.entries[0].capability, "GPU: Legacy Metal");
    assert!(resolution.plan.entries[0]
        .installs
        .iter()
        .all(|a| a.kind == PatchType::OverwriteSystemVolume));
    assert_eq!(resolution.device_properties.get("GPU: Legacy Metal"), Some(true));
    assert_eq!(
        resolution.device_properties.get("Validation: Patching Not Possible"),
        Some(false)
    );
}

#[test]
fn end_to_end_sip_blocked_host() {
    let mut cap = TestCapability::gpu("GPU: Legacy Metal", GraphicsSubclass::Metal31001);
    cap.sip = vec![SipBit::AllowUntrustedKexts];

    let mut env = FakeEnvironment::default();
    env.csr = 0;

    let resolution = resolver(env, vec![Box::new(cap)]).resolve();

    assert!(!resolution.can_patch);
    assert_eq!(
        resolution.device_properties.get("Validation: Patching Not Possible"),
        Some(true)
    );
    let errors = resolution.detailed_errors();
    assert!(errors.contains(&ValidationGate::SipEnabled.label().to_string()));
    // The SIP breakdown detail rides along
    assert!(errors.iter().any(|e| e.contains("Booted SIP")));
}

#[test]
fn missing_network_prunes_to_networking_fix() {
    let mut gpu = TestCapability::gpu("Graphics: A", GraphicsSubclass::Metal31001);
    gpu.kdk = true;

    let mut env = FakeEnvironment::default();
    env.network = false;
    env.kdk_installed = false;

    let resolution = resolver(
        env,
        vec![
            Box::new(gpu),
            Box::new(TestCapability::networking("Networking: Fix")),
        ],
    )
    .resolve();

    // Only the networking fix is offered, and it is applicable now
    assert!(!resolution.plan.contains("Graphics: A"));
    assert!(resolution.plan.contains("Networking: Fix"));
    assert!(resolution.can_patch);
    assert!(!resolution.validation.missing_network);
    assert!(!resolution.validation.kdk_required);
    assert!(!resolution.validation.kdk_missing);
}

#[test]
fn missing_network_with_prior_networking_install_waives_gate() {
    let mut gpu = TestCapability::gpu("Graphics: A", GraphicsSubclass::Metal31001);
    gpu.kdk = true;

    let mut env = FakeEnvironment::default();
    env.network = false;
    env.kdk_installed = false;
    env.applied = vec!["Networking: Fix".to_string()];

    let resolution = resolver(
        env,
        vec![
            Box::new(gpu),
            Box::new(TestCapability::networking("Networking: Fix")),
        ],
    )
    .resolve();

    // Nothing is pruned; the gate and auxiliary flags are cleared
    assert!(resolution.plan.contains("Graphics: A"));
    assert!(resolution.plan.contains("Networking: Fix"));
    assert!(!resolution.validation.missing_network);
    assert!(resolution.can_patch);
}

#[test]
fn missing_network_without_networking_capability_clears_gate() {
    let mut gpu = TestCapability::gpu("Graphics: A", GraphicsSubclass::Metal31001);
    gpu.kdk = true;

    let mut env = FakeEnvironment::default();
    env.network = false;
    env.kdk_installed = false;

    let resolution = resolver(env, vec![Box::new(gpu)]).resolve();

    assert!(!resolution.validation.missing_network);
    assert!(resolution.plan.contains("Graphics: A"));
}

#[test]
fn missing_network_skipped_when_other_gates_block() {
    let mut gpu = TestCapability::gpu("Graphics: A", GraphicsSubclass::Metal31001);
    gpu.kdk = true;

    let mut env = FakeEnvironment::default();
    env.network = false;
    env.kdk_installed = false;
    env.filevault = true;

    let resolution = resolver(
        env,
        vec![
            Box::new(gpu),
            Box::new(TestCapability::networking("Networking: Fix")),
        ],
    )
    .resolve();

    // FileVault blocks anyway: no pruning, network gate stays raised
    assert!(resolution.plan.contains("Graphics: A"));
    assert!(resolution.validation.missing_network);
    assert!(!resolution.can_patch);
}

#[test]
fn validation_mode_keeps_absent_capabilities_and_skips_stripping() {
    let mut absent = TestCapability::gpu("Graphics: Absent", GraphicsSubclass::NonMetal);
    absent.present = false;
    let metal = TestCapability::gpu("Graphics: Metal", GraphicsSubclass::Metal31001);

    let resolution = PatchsetResolver::with_catalog(
        sequoia(),
        Arc::new(HostProfile::default()),
        Box::new(FakeEnvironment::default()),
        vec![Box::new(absent), Box::new(metal)],
    )
    .validation_mode(true)
    .resolve();

    // Absent hardware and conflicting generations are all retained so every
    // referenced resource file can be checked
    assert!(resolution.plan.contains("Graphics: Absent"));
    assert!(resolution.plan.contains("Graphics: Metal"));
}

#[test]
fn detection_mode_skips_absent_capabilities() {
    let mut absent = TestCapability::gpu("Graphics: Absent", GraphicsSubclass::NonMetal);
    absent.present = false;

    let resolution = resolver(FakeEnvironment::default(), vec![Box::new(absent)]).resolve();
    assert!(!resolution.plan.contains("Graphics: Absent"));
    assert!(resolution.plan.is_empty());
}

#[test]
fn device_properties_order_capabilities_then_settings_then_gates() {
    let resolution = resolver(
        FakeEnvironment::default(),
        vec![Box::new(TestCapability::gpu("Graphics: A", GraphicsSubclass::Metal31001))],
    )
    .resolve();

    let keys: Vec<&str> = resolution.device_properties.keys().collect();
    let cap_pos = keys.iter().position(|k| *k == "Graphics: A").unwrap();
    let setting_pos = keys
        .iter()
        .position(|k| k.starts_with("Settings:"))
        .unwrap();
    let gate_pos = keys
        .iter()
        .position(|k| k.starts_with("Validation:"))
        .unwrap();
    assert!(cap_pos < setting_pos);
    assert!(setting_pos < gate_pos);
    assert_eq!(
        keys.last().copied(),
        Some(ValidationGate::UnpatchingNotPossible.label())
    );
}
