//! rootpatch core
//!
//! This crate patches and configures macOS hosts to run on hardware Apple no
//! longer natively supports, or to restore driver functionality stripped in
//! later OS releases. It is the backend consumed by GUI/CLI frontends; the
//! core itself never prompts and reports progress through logging only.
//!
//! The system is organized into functional modules:
//! - **error**: Unified error type hierarchy
//! - **models**: Core data structures and types
//! - **chunklist**: Chunk-based integrity verification of downloaded images
//! - **catalog**: Closed, ordered hardware capability catalog
//! - **resolver**: Hardware patchset detection and resolution engine
//! - **host**: Live environment probes (SIP, AMFI, NVRAM, loaded kexts)
//! - **mount**: Root volume mounting and APFS snapshot lifecycle
//! - **executor**: Patch plan execution against the mounted root
//! - **kernelcache**: Kernel collection and dyld cache rebuilds
//! - **resources**: KDK / Metal support package handling and downloads
//! - **system**: Captured-output command execution
//! - **config**: Patcher settings and fixed constants

pub mod error;
pub mod models;

pub mod chunklist;

pub mod catalog;
pub mod resolver;

pub mod host;
pub mod system;

pub mod config;

pub mod mount;

pub mod kernelcache;

pub mod resources;

pub mod executor;

// Re-export the log crate for macro usage
pub use log;

// Re-export error types for easy access
pub use error::{ConfigError, PatchError, ResourceError, Result};

// Re-export model types for easy access
pub use models::{
    AmfiLevel,
    CapabilityPatches,
    DeviceProperties,
    DynamicResource,
    GpuArchitecture,
    GpuDevice,
    // Enums
    GpuVendor,
    GraphicsSubclass,
    HardwareVariant,
    // Hardware structs
    HostProfile,
    MacOsRelease,
    OsTarget,
    // Plan structs
    PatchPlan,
    PatchSource,
    PatchType,
    SipBit,
    WirelessCard,
    WirelessChipset,
};

// Re-export the capability trait and catalog constructor
pub use catalog::{build_catalog, HardwareCapability};

// Re-export the resolver surface
pub use resolver::{PatchsetResolution, PatchsetResolver, ValidationGate, ValidationState};

// Re-export the environment seam and live implementation
pub use host::{Environment, LiveEnvironment};

// Re-export verification and execution entry points
pub use chunklist::{ChunklistStatus, ChunklistVerification};
pub use executor::RootVolumePatcher;

// Re-export settings
pub use config::PatcherSettings;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_constant() {
        assert_eq!(VERSION, "2.4.0");
    }

    #[test]
    fn test_error_reexport() {
        // Verify error types are accessible via crate root
        let _: Result<i32> = Ok(42);
    }

    #[test]
    fn test_models_reexport() {
        // Verify model types are accessible via crate root
        let _gpu = GpuVendor::Nvidia;
        let _level = AmfiLevel::FullDisable;
    }

    #[test]
    fn test_enum_variants_accessible() {
        assert_eq!(ChunklistStatus::InProgress, ChunklistStatus::InProgress);
        assert_eq!(MacOsRelease::Sequoia.major(), 24);
    }
}
