//! Interrupt remapping table lookup.
//!
//! Reads the one table entry an MSI selects and validates it. Like the page
//! walker this does not log or raise events.

use amdvi_format::{DeviceTableEntry, InterruptRemapEntry, MsiMessage};

use crate::error::IntrFault;
use crate::platform::GuestMemory;

/// Why an interrupt table lookup failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrTableFault {
    /// The DTE encodes a reserved table length.
    InvalidTableLength,
    /// The entry offset lies beyond the table.
    AddrInvalid,
    /// The entry could not be read.
    ReadFailed {
        /// Address of the entry.
        addr: u64,
    },
    /// RemapEn is clear.
    RemapDisabled,
    /// GuestMode is set.
    GuestModeUnsupported,
    /// IntType is neither fixed nor arbitrated.
    ReservedIntType,
}

impl IntrTableFault {
    /// The remap failure reported to the caller.
    #[must_use]
    pub fn intr_fault(self) -> IntrFault {
        match self {
            Self::InvalidTableLength => IntrFault::IllegalDte,
            Self::AddrInvalid => IntrFault::AddrInvalid,
            Self::ReadFailed { .. } => IntrFault::IntrTabHwError,
            Self::RemapDisabled => IntrFault::RemapDisabled,
            Self::GuestModeUnsupported => IntrFault::GuestModeUnsupported,
            Self::ReservedIntType => IntrFault::ReservedIntType,
        }
    }
}

/// A successful table lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrteLookup {
    /// Byte offset of the entry within the table (the IRTE cache key part).
    pub offset: u16,
    /// The validated entry.
    pub irte: InterruptRemapEntry,
    /// The remapped message.
    pub msi: MsiMessage,
}

/// Looks up and applies the remapping entry `msi` selects in `dte`'s table.
///
/// # Errors
///
/// Returns the first [`IntrTableFault`] encountered. For faults raised after
/// the entry was read, the entry is returned alongside so the caller can honour
/// its SupIOPF bit.
pub fn lookup<M: GuestMemory>(
    mem: &M,
    dte: &DeviceTableEntry,
    msi: &MsiMessage,
) -> Result<IrteLookup, (IntrTableFault, Option<InterruptRemapEntry>)> {
    let table_size = dte
        .intr_table_size()
        .ok_or((IntrTableFault::InvalidTableLength, None))?;
    let offset = InterruptRemapEntry::offset_for(msi.data);
    if u64::from(offset) >= table_size {
        return Err((IntrTableFault::AddrInvalid, None));
    }

    let addr = dte.intr_table_root() + u64::from(offset);
    let irte = InterruptRemapEntry(
        mem.read_int::<u32>(addr)
            .map_err(|_| (IntrTableFault::ReadFailed { addr }, None))?,
    );

    if !irte.remap_enabled() {
        return Err((IntrTableFault::RemapDisabled, Some(irte)));
    }
    if irte.guest_mode() {
        return Err((IntrTableFault::GuestModeUnsupported, Some(irte)));
    }
    if irte.int_type() > 1 {
        return Err((IntrTableFault::ReservedIntType, Some(irte)));
    }

    Ok(IrteLookup {
        offset,
        irte,
        msi: msi.remapped(irte),
    })
}
