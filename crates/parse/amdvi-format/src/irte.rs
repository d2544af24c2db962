//! Interrupt remapping table entries (32-bit format).

use crate::bits;

/// Mask of the MSI data bits that index the interrupt remapping table.
pub const MSI_DATA_IRTE_INDEX_MASK: u32 = 0x7ff;

const REMAP_EN: u32 = 0;
const SUP_IOPF: u32 = 1;
const INT_TYPE_SHIFT: u32 = 2;
const RQ_EOI: u32 = 5;
const DM: u32 = 6;
const GUEST_MODE: u32 = 7;
const DEST_SHIFT: u32 = 8;
const VECTOR_SHIFT: u32 = 16;

/// A raw interrupt remapping table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterruptRemapEntry(pub u32);

impl InterruptRemapEntry {
    /// Size of an entry in bytes.
    pub const SIZE: usize = 4;

    /// Builds an enabled entry delivering `vector` to `dest`.
    ///
    /// `int_type` is the delivery mode of the remapped interrupt (0 fixed,
    /// 1 arbitrated); `logical` selects logical destination mode.
    #[must_use]
    pub const fn remapped(dest: u8, vector: u8, int_type: u8, logical: bool) -> Self {
        let mut raw = 1 << REMAP_EN;
        raw |= ((int_type as u32) & 0x7) << INT_TYPE_SHIFT;
        if logical {
            raw |= 1 << DM;
        }
        raw |= (dest as u32) << DEST_SHIFT;
        raw |= (vector as u32) << VECTOR_SHIFT;
        Self(raw)
    }

    /// Byte offset into the table selected by MSI `data`.
    #[must_use]
    pub const fn offset_for(data: u32) -> u16 {
        ((data & MSI_DATA_IRTE_INDEX_MASK) * Self::SIZE as u32) as u16
    }

    /// RemapEn: the entry is enabled.
    #[must_use]
    pub const fn remap_enabled(self) -> bool {
        self.0 & (1 << REMAP_EN) != 0
    }

    /// SupIOPF: suppress I/O page fault events caused by this entry.
    #[must_use]
    pub const fn suppress_io_page_faults(self) -> bool {
        self.0 & (1 << SUP_IOPF) != 0
    }

    /// IntType: the delivery mode of the remapped interrupt.
    #[must_use]
    pub const fn int_type(self) -> u8 {
        bits(self.0 as u64, INT_TYPE_SHIFT, 3) as u8
    }

    /// RqEoi: request an EOI broadcast.
    #[must_use]
    pub const fn request_eoi(self) -> bool {
        self.0 & (1 << RQ_EOI) != 0
    }

    /// DM: logical destination mode.
    #[must_use]
    pub const fn dest_mode_logical(self) -> bool {
        self.0 & (1 << DM) != 0
    }

    /// GuestMode: guest virtual APIC format (not supported by the remapper).
    #[must_use]
    pub const fn guest_mode(self) -> bool {
        self.0 & (1 << GUEST_MODE) != 0
    }

    /// Destination APIC id.
    #[must_use]
    pub const fn destination(self) -> u8 {
        bits(self.0 as u64, DEST_SHIFT, 8) as u8
    }

    /// Interrupt vector.
    #[must_use]
    pub const fn vector(self) -> u8 {
        bits(self.0 as u64, VECTOR_SHIFT, 8) as u8
    }

    /// Returns the entry with SupIOPF set or cleared.
    #[must_use]
    pub const fn with_suppress_io_page_faults(self, sup: bool) -> Self {
        if sup {
            Self(self.0 | 1 << SUP_IOPF)
        } else {
            Self(self.0 & !(1 << SUP_IOPF))
        }
    }
}
