//! Error types returned by the translation and remapping front-ends.
//!
//! A fault returned here has already been reported to the guest (through the
//! event log or the hardware error registers) when the architecture requires
//! it; callers only need to abort the access.

use thiserror::Error;

/// Reason a DMA address translation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The device id lies beyond the programmed device table segment.
    DevIdInvalid,
    /// The device table entry could not be read.
    DevTabHwError,
    /// The device table entry has reserved bits set.
    IllegalDte,
    /// The DTE is valid but its translation fields are not (TV=0).
    DteTranslationDisabled,
    /// The DTE paging mode is not a supported root level.
    InvalidRootLevel,
    /// A page table entry on the walk was not present.
    NotPresent,
    /// A page table entry had reserved bits set.
    ReservedBits,
    /// A page table entry's next level does not descend.
    InvalidLevelEncoding,
    /// A sized leaf encodes a page size outside its level's range.
    InvalidPageSize,
    /// IOVA bits of a skipped level are non-zero.
    SkippedLevelIovaNotZero,
    /// The IOVA exceeds what the root level can map.
    IovaOutOfRange,
    /// A page table entry could not be read.
    PageTabHwError,
}

/// Reason an interrupt remap failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrFault {
    /// The device id lies beyond the programmed device table segment.
    DevIdInvalid,
    /// The device table entry could not be read.
    DevTabHwError,
    /// The interrupt half of the DTE is malformed.
    IllegalDte,
    /// A remappable interrupt addressed outside the MSI region.
    OutsideMsiRegion,
    /// The MSI uses a reserved delivery mode.
    InvalidDeliveryMode,
    /// The table offset lies beyond the programmed table length.
    AddrInvalid,
    /// The remapping entry is not enabled.
    RemapDisabled,
    /// The remapping entry uses guest virtual APIC mode.
    GuestModeUnsupported,
    /// The remapping entry has a reserved interrupt type.
    ReservedIntType,
    /// The remapping entry could not be read.
    IntrTabHwError,
}

/// Errors returned by the IOMMU front-ends.
#[derive(Debug, Error)]
pub enum IommuError {
    /// Address translation failed and no physical address may be used.
    #[error("amd-vi: address translation failed ({0:?})")]
    TranslationFailed(Fault),
    /// The mapping exists but does not permit the requested access.
    #[error("amd-vi: access denied")]
    AccessDenied,
    /// Interrupt remapping failed; the interrupt must be dropped.
    #[error("amd-vi: interrupt remapping failed ({0:?})")]
    InterruptRemapFailed(IntrFault),
    /// Interrupt delivery was target aborted by the device table entry.
    #[error("amd-vi: interrupt remapping denied")]
    InterruptRemapDenied,
    /// The IOMMU's own requester id issued the request.
    #[error("amd-vi: request from the IOMMU itself")]
    CannotCallSelf,
    /// The device lock could not be acquired in time; retry later.
    #[error("amd-vi: device busy")]
    Busy,
    /// A zero-length access was requested.
    #[error("amd-vi: zero-length access")]
    EmptyAccess,
    /// The command worker thread could not be started.
    #[error("amd-vi: failed to spawn command worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),
    /// The engine was created with an unusable configuration.
    #[error("amd-vi: {0}")]
    Config(#[from] ConfigError),
}

/// Errors raised while loading an [`IommuConfig`](crate::IommuConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read IOMMU config: {0}")]
    Io(#[from] std::io::Error),
    /// The configuration is not valid TOML or has unknown keys.
    #[error("failed to parse IOMMU config: {0}")]
    Parse(#[from] toml::de::Error),
    /// A value is out of range.
    #[error("invalid IOMMU config: {0}")]
    Invalid(String),
}
