//! `amdvi-format` --- bit-exact AMD-Vi IOMMU record layouts.
//!
//! Every structure the IOMMU consumes from guest memory (device table entries,
//! I/O page table entries, interrupt remapping table entries, command buffer
//! records) and every structure it produces (event log records, remapped MSI
//! messages) is described here as a thin wrapper over its raw little-endian
//! words. Decoding never panics: records are read from byte slices through
//! [`bytes::LeInt::read_at`], and malformed command records surface as
//! [`CommandError`].
//!
//! The crate is `no_std` and allocation-free so it can be shared between a
//! VMM-side emulation engine and guest-side drivers.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

pub mod bytes;
pub mod command;
pub mod dte;
pub mod event;
pub mod irte;
pub mod msi;
pub mod pte;
pub mod regs;

pub use command::{Command, CommandError};
pub use dte::{DeviceTableEntry, IntrCtl};
pub use event::{Event, EventCode, HwErrorKind, IoFaultFlags};
pub use irte::InterruptRemapEntry;
pub use msi::{DeliveryMode, MsiMessage};
pub use pte::{IoPageTableEntry, IoPerm};

/// Size of a 4 KiB page, the unit of every IOMMU translation.
pub const PAGE_SIZE: u64 = 0x1000;

/// Shift of a 4 KiB page.
pub const PAGE_SHIFT: u8 = 12;

/// Mask selecting the offset within a 4 KiB page.
pub const PAGE_OFFSET_MASK: u64 = PAGE_SIZE - 1;

/// Mask of a 52-bit system physical address aligned to 4 KiB.
pub const PHYS_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

/// Extracts `width` bits of `value` starting at bit `shift`.
#[inline]
#[must_use]
pub(crate) const fn bits(value: u64, shift: u32, width: u32) -> u64 {
    (value >> shift) & ((1u64 << width) - 1)
}

/// Returns `value` with `width` bits at `shift` replaced by `field`.
#[inline]
#[must_use]
pub(crate) const fn with_bits(value: u64, shift: u32, width: u32, field: u64) -> u64 {
    let mask = ((1u64 << width) - 1) << shift;
    (value & !mask) | ((field << shift) & mask)
}

/// Returns `value` with bit `bit` set or cleared.
#[inline]
#[must_use]
pub(crate) const fn with_bit(value: u64, bit: u32, set: bool) -> u64 {
    if set {
        value | (1u64 << bit)
    } else {
        value & !(1u64 << bit)
    }
}
