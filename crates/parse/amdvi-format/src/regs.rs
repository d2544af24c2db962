//! AMD-Vi MMIO register offsets and bit definitions.
//!
//! Only the registers the emulation models are listed. All registers are 64
//! bits wide.

use bitflags::bitflags;

use crate::{PHYS_ADDR_MASK, bits};

// ---------------------------------------------------------------------------
// Register offsets
// ---------------------------------------------------------------------------

/// Device table base address (segment 0).
pub const DEV_TAB_BAR: u64 = 0x0000;
/// Command buffer base address.
pub const CMD_BUF_BAR: u64 = 0x0008;
/// Event log base address.
pub const EVT_LOG_BAR: u64 = 0x0010;
/// Control register.
pub const CONTROL: u64 = 0x0018;
/// Extended feature register (read-only).
pub const EXT_FEATURE: u64 = 0x0030;
/// Hardware event upper (event code and first operand).
pub const HW_EVT_HI: u64 = 0x0040;
/// Hardware event lower (second operand).
pub const HW_EVT_LO: u64 = 0x0048;
/// Hardware event status.
pub const HW_EVT_STATUS: u64 = 0x0050;
/// Device table segment 1 base address; segments 2-7 follow at 8-byte strides.
pub const DEV_TAB_SEG_FIRST: u64 = 0x0100;
/// Device table segment 7 base address.
pub const DEV_TAB_SEG_LAST: u64 = 0x0130;
/// Command buffer head pointer.
pub const CMD_BUF_HEAD: u64 = 0x2000;
/// Command buffer tail pointer.
pub const CMD_BUF_TAIL: u64 = 0x2008;
/// Event log head pointer.
pub const EVT_LOG_HEAD: u64 = 0x2010;
/// Event log tail pointer.
pub const EVT_LOG_TAIL: u64 = 0x2018;
/// Status register.
pub const STATUS: u64 = 0x2020;

/// Maximum number of device table segments.
pub const MAX_DEV_TAB_SEGMENTS: usize = 8;

/// Mask applied to ring head/tail pointer writes.
pub const RING_PTR_MASK: u64 = 0x7fff0;

/// Smallest ring length encoding accepted (2^8 entries).
pub const MIN_RING_LEN: u8 = 8;

/// Largest ring length encoding (2^15 entries).
pub const MAX_RING_LEN: u8 = 15;

// ---------------------------------------------------------------------------
// Control / status
// ---------------------------------------------------------------------------

bitflags! {
    /// Control register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Control: u64 {
        /// IommuEn.
        const IOMMU_EN = 1 << 0;
        /// HtTunEn.
        const HT_TUN_EN = 1 << 1;
        /// EventLogEn.
        const EVT_LOG_EN = 1 << 2;
        /// EventIntEn.
        const EVT_INTR_EN = 1 << 3;
        /// ComWaitIntEn.
        const COMP_WAIT_INTR_EN = 1 << 4;
        /// CmdBufEn.
        const CMD_BUF_EN = 1 << 12;
        /// PprLogEn.
        const PPR_LOG_EN = 1 << 13;
        /// GTEn.
        const GT_EN = 1 << 16;
        /// GAEn.
        const GA_EN = 1 << 17;

        const _ = !0;
    }
}

impl Control {
    /// Number of device table segments selected by DevTblSegEn (bits 36:34).
    ///
    /// Reserved encodings (4-7) are clamped to eight segments.
    #[must_use]
    pub const fn dev_tab_seg_code(self) -> u8 {
        let code = bits(self.bits(), 34, 3) as u8;
        if code > 3 { 3 } else { code }
    }
}

bitflags! {
    /// Status register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Status: u64 {
        /// EventOverflow (RW1C).
        const EVT_OVERFLOW = 1 << 0;
        /// EventLogInt (RW1C).
        const EVT_LOG_INTR = 1 << 1;
        /// ComWaitInt (RW1C).
        const COMP_WAIT_INTR = 1 << 2;
        /// EventLogRun.
        const EVT_LOG_RUN = 1 << 3;
        /// CmdBufRun.
        const CMD_BUF_RUN = 1 << 4;
        /// PprOverflow (RW1C).
        const PPR_OVERFLOW = 1 << 5;
        /// PprInt (RW1C).
        const PPR_INTR = 1 << 6;
        /// GALogRun.
        const GA_LOG_RUN = 1 << 8;
        /// GALogOverflow (RW1C).
        const GA_LOG_OVERFLOW = 1 << 9;
        /// GAInt (RW1C).
        const GA_INTR = 1 << 10;
    }
}

/// Write-1-to-clear bits of the status register.
pub const STATUS_RW1C_MASK: u64 = 0x667;

bitflags! {
    /// Hardware event status bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HwEvtStatus: u64 {
        /// HEV: the hardware event registers hold a valid event.
        const VALID = 1 << 0;
        /// HEO: a second event arrived while HEV was set.
        const OVERFLOW = 1 << 1;
    }
}

/// Extended feature register contents advertised by the emulation.
///
/// HATS (bits 11:10) = 2: six-level host page tables. No optional command
/// or log features are advertised.
pub const EXT_FEATURE_VALUE: u64 = 2 << 10;

// ---------------------------------------------------------------------------
// Base address registers
// ---------------------------------------------------------------------------

/// Device table base address register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DevTabBar(pub u64);

impl DevTabBar {
    /// Bits software may write.
    pub const WRITABLE_MASK: u64 = PHYS_ADDR_MASK | 0x1ff;

    /// Builds a BAR for a table of `size_pages` 4 KiB pages (1-512).
    #[must_use]
    pub const fn new(base: u64, size_pages: u16) -> Self {
        let size = if size_pages == 0 { 0 } else { (size_pages - 1) as u64 & 0x1ff };
        Self((base & PHYS_ADDR_MASK) | size)
    }

    /// Table base address.
    #[must_use]
    pub const fn base(self) -> u64 {
        self.0 & PHYS_ADDR_MASK
    }

    /// Table size in bytes.
    #[must_use]
    pub const fn size_bytes(self) -> u64 {
        (bits(self.0, 0, 9) + 1) * crate::PAGE_SIZE
    }
}

/// Command buffer or event log base address register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RingBar(pub u64);

impl RingBar {
    /// Bits software may write.
    pub const WRITABLE_MASK: u64 = PHYS_ADDR_MASK | (0xf << 56);

    /// Builds a BAR for a ring of `2^len` entries.
    #[must_use]
    pub const fn new(base: u64, len: u8) -> Self {
        Self((base & PHYS_ADDR_MASK) | (((len & 0xf) as u64) << 56))
    }

    /// Ring base address.
    #[must_use]
    pub const fn base(self) -> u64 {
        self.0 & PHYS_ADDR_MASK
    }

    /// Length encoding: the ring holds `2^len` entries.
    #[must_use]
    pub const fn len_log2(self) -> u8 {
        bits(self.0, 56, 4) as u8
    }

    /// Whether the length encoding is one software may program.
    #[must_use]
    pub const fn is_valid_len(self) -> bool {
        self.len_log2() >= MIN_RING_LEN
    }

    /// Number of 16-byte entries.
    #[must_use]
    pub const fn entries(self) -> u64 {
        1 << self.len_log2()
    }

    /// Ring size in bytes.
    #[must_use]
    pub const fn size_bytes(self) -> u64 {
        self.entries() * 16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dev_tab_bar_size() {
        let bar = DevTabBar::new(0x10_0000, 2);
        assert_eq!(bar.base(), 0x10_0000);
        assert_eq!(bar.size_bytes(), 0x2000);
        assert_eq!(bar.0, 0x10_0001);
        assert_eq!(DevTabBar::new(0, 512).size_bytes(), 512 * 0x1000);
    }

    #[test]
    fn ring_bar_len() {
        let bar = RingBar::new(0x20_0000, 8);
        assert_eq!(bar.base(), 0x20_0000);
        assert_eq!(bar.entries(), 256);
        assert_eq!(bar.size_bytes(), 4096);
        assert!(bar.is_valid_len());
        assert!(!RingBar::new(0x20_0000, 7).is_valid_len());
        assert_eq!(RingBar::new(0, 15).size_bytes(), 0x8_0000);
    }

    #[test]
    fn control_preserves_unknown_bits_and_segments() {
        let ctl = Control::from_bits_retain(Control::IOMMU_EN.bits() | (2 << 34));
        assert!(ctl.contains(Control::IOMMU_EN));
        assert_eq!(ctl.dev_tab_seg_code(), 2);
        assert_eq!(Control::from_bits_retain(7 << 34).dev_tab_seg_code(), 3);
    }
}
