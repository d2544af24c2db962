//! I/O page table entries and access permissions.
//!
//! An I/O page table entry (PTE or PDE) is a single 64-bit word. The
//! next-level field selects its shape: 0 is a leaf at the natural page size of
//! its level, 7 is a leaf with the page size encoded in the address bits, and
//! 1-6 point at a lower-level table.

use bitflags::bitflags;

use crate::{PHYS_ADDR_MASK, bits, with_bit, with_bits};

bitflags! {
    /// I/O access permission bits (IR/IW).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct IoPerm: u8 {
        /// DMA read permitted.
        const READ = 1 << 0;
        /// DMA write permitted.
        const WRITE = 1 << 1;
    }
}

/// Deepest page table level supported.
pub const MAX_LEVEL: u8 = 6;

/// Number of entries in one page table.
pub const ENTRIES_PER_TABLE: u64 = 512;

/// IOVA bit shift for the table index at each level, and the natural page
/// shift of a leaf at that level. Index 7 bounds the largest encodable page.
pub const LEVEL_SHIFTS: [u8; 8] = [0, 12, 21, 30, 39, 48, 57, 63];

/// Next-level value marking a leaf with an encoded (non-default) page size.
pub const NEXT_LEVEL_SIZED_LEAF: u8 = 7;

/// Shift of the IR/IW permission pair in PTEs and DTEs.
pub const PERM_SHIFT: u32 = 61;

/// Reserved bits of a leaf-shaped entry (next-level 0 or 7).
pub const LEAF_RSVD_MASK: u64 = 0x07f0_0000_0000_0000;

/// Reserved bits of a directory-shaped entry (next-level 1-6).
pub const DIR_RSVD_MASK: u64 = 0x1ff0_0000_0000_0000;

const PRESENT_BIT: u32 = 0;
const NEXT_LEVEL_SHIFT: u32 = 9;

/// A raw I/O page table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IoPageTableEntry(pub u64);

impl IoPageTableEntry {
    /// Size of one entry in bytes.
    pub const SIZE: usize = 8;

    /// Builds a present entry.
    #[must_use]
    pub const fn new(addr: u64, next_level: u8, perm: IoPerm) -> Self {
        let mut raw = addr & PHYS_ADDR_MASK;
        raw = with_bit(raw, PRESENT_BIT, true);
        raw = with_bits(raw, NEXT_LEVEL_SHIFT, 3, next_level as u64);
        raw = with_bits(raw, PERM_SHIFT, 2, perm.bits() as u64);
        Self(raw)
    }

    /// Whether the entry is present.
    #[must_use]
    pub const fn present(self) -> bool {
        self.0 & (1 << PRESENT_BIT) != 0
    }

    /// The next-level field (bits 11:9).
    #[must_use]
    pub const fn next_level(self) -> u8 {
        bits(self.0, NEXT_LEVEL_SHIFT, 3) as u8
    }

    /// Whether the entry is leaf-shaped (next-level 0 or 7).
    #[must_use]
    pub const fn is_leaf(self) -> bool {
        matches!(self.next_level(), 0 | NEXT_LEVEL_SIZED_LEAF)
    }

    /// The 4 KiB aligned address field (bits 51:12).
    #[must_use]
    pub const fn addr(self) -> u64 {
        self.0 & PHYS_ADDR_MASK
    }

    /// The IR/IW permission bits.
    #[must_use]
    pub const fn perm(self) -> IoPerm {
        IoPerm::from_bits_truncate(bits(self.0, PERM_SHIFT, 2) as u8)
    }

    /// Whether any reserved bit for this entry's shape is set.
    #[must_use]
    pub const fn has_reserved_bits(self) -> bool {
        let mask = if self.is_leaf() {
            LEAF_RSVD_MASK
        } else {
            DIR_RSVD_MASK
        };
        self.0 & mask != 0
    }

    /// Page shift encoded in the address of a next-level-7 leaf.
    ///
    /// The page size is given by the first zero address bit at or above bit
    /// 12: a zero at bit 12 encodes 8 KiB, a zero at bit 20 encodes 2 MiB.
    /// The result may exceed 63 when every address bit is set.
    #[must_use]
    pub const fn encoded_page_shift(self) -> u8 {
        encoded_size_shift(self.0)
    }
}

/// Computes the size shift encoded by the first zero bit at or above bit 12.
///
/// Shared by sized leaves and the `S` form of page invalidation commands.
#[must_use]
pub const fn encoded_size_shift(addr: u64) -> u8 {
    12 + (addr >> 12).trailing_ones() as u8 + 1
}

/// Mask of the offset within a page of `1 << shift` bytes.
#[must_use]
pub const fn page_offset_mask(shift: u8) -> u64 {
    if shift >= 64 {
        u64::MAX
    } else {
        (1u64 << shift) - 1
    }
}
