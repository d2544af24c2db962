//! Device table entries.
//!
//! A device table entry (DTE) is 256 bits, stored as four little-endian
//! qwords. Words 0 and 1 hold the DMA translation controls, words 2 and 3
//! the interrupt remapping controls. Each half carries its own reserved-bit
//! mask, checked by the path that consumes it.

use crate::bytes::{qwords_to_bytes, read_qwords};
use crate::pte::{IoPerm, PERM_SHIFT};
use crate::{PHYS_ADDR_MASK, bits, with_bit, with_bits};

/// Reserved bits of DTE word 0.
pub const DTE_QWORD0_RSVD_MASK: u64 = 0x8000_0000_0000_007c;
/// Reserved bits of DTE word 1.
pub const DTE_QWORD1_RSVD_MASK: u64 = 1 << 42;
/// Reserved bits of DTE word 2.
pub const DTE_QWORD2_RSVD_MASK: u64 = 0x08f0_0000_0000_0000;
/// Reserved bits of DTE word 3.
pub const DTE_QWORD3_RSVD_MASK: u64 = 0x003f_ffff_ffff_ffff;

/// Mask of the interrupt table root pointer in word 2 (bits 51:6).
pub const INTR_TABLE_ROOT_MASK: u64 = 0x000f_ffff_ffff_ffc0;

/// Largest valid interrupt table length encoding (2^(10+1) = 2048 entries).
pub const MAX_INTR_TABLE_LEN: u8 = 10;

// -- Word 0 -----------------------------------------------------------------
const V: u32 = 0;
const TV: u32 = 1;
const MODE_SHIFT: u32 = 9;

// -- Word 1 -----------------------------------------------------------------
const SE: u32 = 33;
const SA: u32 = 34;

// -- Word 2 -----------------------------------------------------------------
const IV: u32 = 0;
const INT_TAB_LEN_SHIFT: u32 = 1;
const IG: u32 = 5;
const INIT_PASS: u32 = 56;
const EINT_PASS: u32 = 57;
const NMI_PASS: u32 = 58;
const INT_CTL_SHIFT: u32 = 60;
const LINT0_PASS: u32 = 62;
const LINT1_PASS: u32 = 63;

/// Interrupt control field (IntCtl) of a device table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrCtl {
    /// Fixed and arbitrated interrupts are target aborted.
    TargetAbort,
    /// Fixed and arbitrated interrupts are forwarded unmapped.
    ForwardUnmapped,
    /// Fixed and arbitrated interrupts are remapped through the table.
    Remap,
    /// Reserved encoding.
    Reserved,
}

impl IntrCtl {
    /// Decodes the 2-bit field.
    #[must_use]
    pub const fn from_bits(raw: u8) -> Self {
        match raw & 0x3 {
            0 => Self::TargetAbort,
            1 => Self::ForwardUnmapped,
            2 => Self::Remap,
            _ => Self::Reserved,
        }
    }

    /// Returns the 2-bit encoding.
    #[must_use]
    pub const fn bits(self) -> u8 {
        match self {
            Self::TargetAbort => 0,
            Self::ForwardUnmapped => 1,
            Self::Remap => 2,
            Self::Reserved => 3,
        }
    }
}

/// A raw 256-bit device table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceTableEntry {
    /// The four little-endian qwords, word 0 first.
    pub words: [u64; 4],
}

impl DeviceTableEntry {
    /// Size of a DTE in bytes.
    pub const SIZE: usize = 32;

    /// An all-zero (invalid) entry.
    #[must_use]
    pub const fn new() -> Self {
        Self { words: [0; 4] }
    }

    /// Decodes an entry from the first 32 bytes of `data`.
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        read_qwords::<4>(data, 0).map(|words| Self { words })
    }

    /// Encodes the entry as 32 little-endian bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        qwords_to_bytes(&self.words)
    }

    // -----------------------------------------------------------------------
    // Translation half (words 0-1)
    // -----------------------------------------------------------------------

    /// V: the entry is valid.
    #[must_use]
    pub const fn valid(&self) -> bool {
        self.words[0] & (1 << V) != 0
    }

    /// TV: the translation fields are valid.
    #[must_use]
    pub const fn translation_valid(&self) -> bool {
        self.words[0] & (1 << TV) != 0
    }

    /// Paging mode: 0 disables translation, 1-6 give the root table level.
    #[must_use]
    pub const fn mode(&self) -> u8 {
        bits(self.words[0], MODE_SHIFT, 3) as u8
    }

    /// Page table root pointer.
    #[must_use]
    pub const fn root_ptr(&self) -> u64 {
        self.words[0] & PHYS_ADDR_MASK
    }

    /// IR/IW I/O permissions.
    #[must_use]
    pub const fn perm(&self) -> IoPerm {
        IoPerm::from_bits_truncate(bits(self.words[0], PERM_SHIFT, 2) as u8)
    }

    /// Domain identifier.
    #[must_use]
    pub const fn domain_id(&self) -> u16 {
        bits(self.words[1], 0, 16) as u16
    }

    /// SE: suppress I/O page fault events after the first.
    #[must_use]
    pub const fn suppress_io_page_faults(&self) -> bool {
        self.words[1] & (1 << SE) != 0
    }

    /// SA: suppress all I/O page fault events.
    #[must_use]
    pub const fn suppress_all_io_page_faults(&self) -> bool {
        self.words[1] & (1 << SA) != 0
    }

    /// Whether any reserved bit of the translation half is set.
    #[must_use]
    pub const fn has_translation_rsvd_bits(&self) -> bool {
        (self.words[0] & DTE_QWORD0_RSVD_MASK) != 0 || (self.words[1] & DTE_QWORD1_RSVD_MASK) != 0
    }

    // -----------------------------------------------------------------------
    // Interrupt half (words 2-3)
    // -----------------------------------------------------------------------

    /// IV: the interrupt map fields are valid.
    #[must_use]
    pub const fn intr_map_valid(&self) -> bool {
        self.words[2] & (1 << IV) != 0
    }

    /// Raw IntTabLen field; the table holds `2^(len + 1)` entries.
    #[must_use]
    pub const fn intr_table_len(&self) -> u8 {
        bits(self.words[2], INT_TAB_LEN_SHIFT, 4) as u8
    }

    /// Interrupt table size in bytes, or `None` for a reserved length.
    #[must_use]
    pub const fn intr_table_size(&self) -> Option<u64> {
        let len = self.intr_table_len();
        if len > MAX_INTR_TABLE_LEN {
            None
        } else {
            Some((1u64 << (len + 1)) * crate::irte::InterruptRemapEntry::SIZE as u64)
        }
    }

    /// IG: ignore unmapped interrupts (no fault is logged for them).
    #[must_use]
    pub const fn ignore_unmapped_intr(&self) -> bool {
        self.words[2] & (1 << IG) != 0
    }

    /// Interrupt remapping table root pointer (64-byte aligned).
    #[must_use]
    pub const fn intr_table_root(&self) -> u64 {
        self.words[2] & INTR_TABLE_ROOT_MASK
    }

    /// INIT pass-through.
    #[must_use]
    pub const fn init_pass(&self) -> bool {
        self.words[2] & (1 << INIT_PASS) != 0
    }

    /// ExtINT pass-through.
    #[must_use]
    pub const fn ext_int_pass(&self) -> bool {
        self.words[2] & (1 << EINT_PASS) != 0
    }

    /// NMI pass-through.
    #[must_use]
    pub const fn nmi_pass(&self) -> bool {
        self.words[2] & (1 << NMI_PASS) != 0
    }

    /// Interrupt control.
    #[must_use]
    pub const fn intr_ctl(&self) -> IntrCtl {
        IntrCtl::from_bits(bits(self.words[2], INT_CTL_SHIFT, 2) as u8)
    }

    /// LINT0 pass-through.
    #[must_use]
    pub const fn lint0_pass(&self) -> bool {
        self.words[2] & (1 << LINT0_PASS) != 0
    }

    /// LINT1 pass-through.
    #[must_use]
    pub const fn lint1_pass(&self) -> bool {
        self.words[2] & (1 << LINT1_PASS) != 0
    }

    /// Whether any reserved bit of the interrupt half is set.
    #[must_use]
    pub const fn has_intr_rsvd_bits(&self) -> bool {
        (self.words[2] & DTE_QWORD2_RSVD_MASK) != 0 || (self.words[3] & DTE_QWORD3_RSVD_MASK) != 0
    }

    // -----------------------------------------------------------------------
    // Builders
    // -----------------------------------------------------------------------

    /// Sets V.
    #[must_use]
    pub const fn with_valid(mut self, valid: bool) -> Self {
        self.words[0] = with_bit(self.words[0], V, valid);
        self
    }

    /// Sets TV.
    #[must_use]
    pub const fn with_translation_valid(mut self, tv: bool) -> Self {
        self.words[0] = with_bit(self.words[0], TV, tv);
        self
    }

    /// Sets the paging mode and root table pointer.
    #[must_use]
    pub const fn with_page_table(mut self, mode: u8, root: u64) -> Self {
        let w = with_bits(self.words[0], MODE_SHIFT, 3, mode as u64);
        self.words[0] = (w & !PHYS_ADDR_MASK) | (root & PHYS_ADDR_MASK);
        self
    }

    /// Sets IR/IW.
    #[must_use]
    pub const fn with_perm(mut self, perm: IoPerm) -> Self {
        self.words[0] = with_bits(self.words[0], PERM_SHIFT, 2, perm.bits() as u64);
        self
    }

    /// Sets the domain identifier.
    #[must_use]
    pub const fn with_domain_id(mut self, domain_id: u16) -> Self {
        self.words[1] = with_bits(self.words[1], 0, 16, domain_id as u64);
        self
    }

    /// Sets SE and SA.
    #[must_use]
    pub const fn with_fault_suppression(mut self, first: bool, all: bool) -> Self {
        self.words[1] = with_bit(self.words[1], SE, first);
        self.words[1] = with_bit(self.words[1], SA, all);
        self
    }

    /// Enables interrupt remapping with the given table and control.
    #[must_use]
    pub const fn with_intr_table(mut self, root: u64, len: u8, ctl: IntrCtl) -> Self {
        let mut w = self.words[2] & !INTR_TABLE_ROOT_MASK;
        w |= root & INTR_TABLE_ROOT_MASK;
        w = with_bit(w, IV, true);
        w = with_bits(w, INT_TAB_LEN_SHIFT, 4, len as u64);
        w = with_bits(w, INT_CTL_SHIFT, 2, ctl.bits() as u64);
        self.words[2] = w;
        self
    }

    /// Sets IV without touching the other interrupt fields.
    #[must_use]
    pub const fn with_intr_map_valid(mut self, iv: bool) -> Self {
        self.words[2] = with_bit(self.words[2], IV, iv);
        self
    }

    /// Sets IG.
    #[must_use]
    pub const fn with_ignore_unmapped_intr(mut self, ig: bool) -> Self {
        self.words[2] = with_bit(self.words[2], IG, ig);
        self
    }

    /// Sets the NMI, INIT and ExtINT pass-through bits.
    #[must_use]
    pub const fn with_intr_pass(mut self, nmi: bool, init: bool, ext_int: bool) -> Self {
        self.words[2] = with_bit(self.words[2], NMI_PASS, nmi);
        self.words[2] = with_bit(self.words[2], INIT_PASS, init);
        self.words[2] = with_bit(self.words[2], EINT_PASS, ext_int);
        self
    }
}
