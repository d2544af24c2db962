//! MSI address/data decoding for interrupt remapping.

use crate::irte::InterruptRemapEntry;
use crate::{bits, with_bit, with_bits};

/// Base of the architectural MSI address region.
pub const MSI_ADDR_BASE: u64 = 0xfee0_0000;

/// Mask applied to an MSI address before comparing it with [`MSI_ADDR_BASE`].
pub const MSI_ADDR_REGION_MASK: u64 = 0xffff_ffff_fff0_0000;

const ADDR_DM: u32 = 2;
const ADDR_RH: u32 = 3;
const ADDR_DEST_SHIFT: u32 = 12;

const DATA_VECTOR_SHIFT: u32 = 0;
const DATA_DELIVERY_SHIFT: u32 = 8;

/// Delivery mode of an MSI (data bits 10:8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Fixed.
    Fixed,
    /// Lowest priority (arbitrated).
    LowestPriority,
    /// System management interrupt.
    Smi,
    /// Non-maskable interrupt.
    Nmi,
    /// INIT.
    Init,
    /// External interrupt.
    ExtInt,
    /// Reserved encoding (3 or 6).
    Reserved(u8),
}

impl DeliveryMode {
    /// Decodes the 3-bit field.
    #[must_use]
    pub const fn from_bits(raw: u8) -> Self {
        match raw & 0x7 {
            0 => Self::Fixed,
            1 => Self::LowestPriority,
            2 => Self::Smi,
            4 => Self::Nmi,
            5 => Self::Init,
            7 => Self::ExtInt,
            other => Self::Reserved(other),
        }
    }

    /// Whether the mode is remappable (fixed or arbitrated).
    #[must_use]
    pub const fn is_remappable(self) -> bool {
        matches!(self, Self::Fixed | Self::LowestPriority)
    }
}

/// A message-signaled interrupt as written by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsiMessage {
    /// MSI address.
    pub addr: u64,
    /// MSI data.
    pub data: u32,
}

impl MsiMessage {
    /// Builds a message from its parts.
    #[must_use]
    pub const fn new(addr: u64, data: u32) -> Self {
        Self { addr, data }
    }

    /// Builds a fixed, physical-destination message for `dest` and `vector`.
    #[must_use]
    pub const fn fixed(dest: u8, vector: u8) -> Self {
        Self {
            addr: MSI_ADDR_BASE | ((dest as u64) << ADDR_DEST_SHIFT),
            data: vector as u32,
        }
    }

    /// Whether the address lies in the architectural MSI region.
    #[must_use]
    pub const fn in_msi_region(&self) -> bool {
        self.addr & MSI_ADDR_REGION_MASK == MSI_ADDR_BASE
    }

    /// Destination mode: `true` for logical.
    #[must_use]
    pub const fn dest_mode_logical(&self) -> bool {
        self.addr & (1 << ADDR_DM) != 0
    }

    /// Redirection hint.
    #[must_use]
    pub const fn redirection_hint(&self) -> bool {
        self.addr & (1 << ADDR_RH) != 0
    }

    /// Destination APIC id.
    #[must_use]
    pub const fn dest_id(&self) -> u8 {
        bits(self.addr, ADDR_DEST_SHIFT, 8) as u8
    }

    /// Interrupt vector.
    #[must_use]
    pub const fn vector(&self) -> u8 {
        bits(self.data as u64, DATA_VECTOR_SHIFT, 8) as u8
    }

    /// Delivery mode.
    #[must_use]
    pub const fn delivery_mode(&self) -> DeliveryMode {
        DeliveryMode::from_bits(bits(self.data as u64, DATA_DELIVERY_SHIFT, 3) as u8)
    }

    /// Rewrites the message through a remapping entry.
    ///
    /// Destination mode, destination id, vector and delivery mode come from
    /// the entry; every other bit of the source message is preserved.
    #[must_use]
    pub const fn remapped(&self, irte: InterruptRemapEntry) -> Self {
        let mut addr = with_bit(self.addr, ADDR_DM, irte.dest_mode_logical());
        addr = with_bits(addr, ADDR_DEST_SHIFT, 8, irte.destination() as u64);
        let mut data = with_bits(self.data as u64, DATA_VECTOR_SHIFT, 8, irte.vector() as u64);
        data = with_bits(data, DATA_DELIVERY_SHIFT, 3, irte.int_type() as u64);
        Self {
            addr,
            data: data as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_check() {
        assert!(MsiMessage::new(0xfee0_0000, 0).in_msi_region());
        assert!(MsiMessage::new(0xfeef_f00c, 0).in_msi_region());
        assert!(!MsiMessage::new(0xfef0_0000, 0).in_msi_region());
        assert!(!MsiMessage::new(0x1_fee0_0000, 0).in_msi_region());
    }

    #[test]
    fn delivery_modes_decode() {
        assert_eq!(MsiMessage::new(0, 0x0100).delivery_mode(), DeliveryMode::LowestPriority);
        assert_eq!(MsiMessage::new(0, 0x0400).delivery_mode(), DeliveryMode::Nmi);
        assert_eq!(MsiMessage::new(0, 0x0300).delivery_mode(), DeliveryMode::Reserved(3));
        assert_eq!(MsiMessage::new(0, 0x0600).delivery_mode(), DeliveryMode::Reserved(6));
        assert!(DeliveryMode::Fixed.is_remappable());
        assert!(!DeliveryMode::Smi.is_remappable());
    }

    #[test]
    fn remap_overwrites_only_routing_fields() {
        // Source: RH set, dest 0x01, physical, vector 0x20, fixed, trigger bit 15 set.
        let src = MsiMessage::new(0xfee0_1008, 0x8020);
        let irte = InterruptRemapEntry::remapped(0x7f, 0x41, 1, true);
        let out = src.remapped(irte);
        assert_eq!(out.dest_id(), 0x7f);
        assert!(out.dest_mode_logical());
        assert!(out.redirection_hint());
        assert_eq!(out.vector(), 0x41);
        assert_eq!(out.delivery_mode(), DeliveryMode::LowestPriority);
        assert_eq!(out.addr, 0xfee7_f00c);
        assert_eq!(out.data, 0x8141);
    }
}
