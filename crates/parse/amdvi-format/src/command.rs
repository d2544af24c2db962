//! Command buffer records.
//!
//! Each command is 16 bytes (two qwords) with the opcode in bits 63:60 of the
//! first qword. Decoding validates every reserved bit; a command with a
//! reserved bit set is illegal and must halt the command buffer rather than be
//! skipped.

use core::fmt;

use crate::bytes::{qwords_to_bytes, read_qwords};
use crate::bits;

/// Size of one command record in bytes.
pub const COMMAND_SIZE: usize = 16;

// ---------------------------------------------------------------------------
// Opcodes
// ---------------------------------------------------------------------------

/// `COMPLETION_WAIT`.
pub const OP_COMPLETION_WAIT: u8 = 0x1;
/// `INVALIDATE_DEVTAB_ENTRY`.
pub const OP_INV_DEV_TAB_ENTRY: u8 = 0x2;
/// `INVALIDATE_IOMMU_PAGES`.
pub const OP_INV_IOMMU_PAGES: u8 = 0x3;
/// `INVALIDATE_IOTLB_PAGES`.
pub const OP_INV_IOTLB_PAGES: u8 = 0x4;
/// `INVALIDATE_INTERRUPT_TABLE`.
pub const OP_INV_INTR_TABLE: u8 = 0x5;
/// `PREFETCH_IOMMU_PAGES`.
pub const OP_PREFETCH_IOMMU_PAGES: u8 = 0x6;
/// `COMPLETE_PPR_REQUEST`.
pub const OP_COMPLETE_PPR_REQUEST: u8 = 0x7;
/// `INVALIDATE_IOMMU_ALL`.
pub const OP_INV_IOMMU_ALL: u8 = 0x8;

// ---------------------------------------------------------------------------
// Valid-bit masks
// ---------------------------------------------------------------------------

const COMPLETION_WAIT_QWORD0_VALID: u64 = 0xf00f_ffff_ffff_ffff;
const INV_DTE_QWORD0_VALID: u64 = 0xf000_0000_0000_ffff;
const INV_PAGES_QWORD0_VALID: u64 = 0xf000_ffff_000f_ffff;
const INV_PAGES_QWORD1_VALID: u64 = 0xffff_ffff_ffff_f007;
const INV_ALL_QWORD0_VALID: u64 = 0xf000_0000_0000_0000;

const STORE_ADDR_MASK: u64 = 0x000f_ffff_ffff_fff8;

/// Errors produced while decoding a command record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandError {
    /// The opcode is not defined.
    UnknownOpcode(u8),
    /// A reserved bit of a defined command is set.
    ReservedBitsSet {
        /// The command's opcode.
        opcode: u8,
    },
    /// Fewer than 16 bytes were supplied.
    Truncated,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownOpcode(op) => write!(f, "unknown command opcode {op:#x}"),
            Self::ReservedBitsSet { opcode } => {
                write!(f, "reserved bits set in command with opcode {opcode:#x}")
            }
            Self::Truncated => write!(f, "truncated command record"),
        }
    }
}

/// A decoded command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Wait for completion of prior commands, optionally storing data and
    /// raising an interrupt.
    CompletionWait {
        /// S: write `store_data` to `store_addr`.
        store: bool,
        /// I: raise the completion-wait interrupt.
        interrupt: bool,
        /// F: flush queue.
        flush: bool,
        /// 8-byte aligned store address.
        store_addr: u64,
        /// Data to store.
        store_data: u64,
    },
    /// Invalidate the cached DTE of one device.
    InvalidateDevTabEntry {
        /// Device id.
        device_id: u16,
    },
    /// Invalidate IOTLB entries of a domain.
    InvalidateIommuPages {
        /// Domain id.
        domain_id: u16,
        /// Page-aligned address (bits 63:12).
        addr: u64,
        /// S: the range size is encoded in the address.
        size: bool,
        /// PDE: also invalidate page directory entries.
        pde: bool,
    },
    /// Invalidate a remote (device-side) IOTLB. Not supported by the engine.
    InvalidateIotlbPages {
        /// Raw command words.
        raw: [u64; 2],
    },
    /// Invalidate the cached interrupt table entries of one device.
    InvalidateIntrTable {
        /// Device id.
        device_id: u16,
    },
    /// Prefetch translations. Not supported by the engine.
    PrefetchIommuPages {
        /// Raw command words.
        raw: [u64; 2],
    },
    /// Complete a peripheral page request. Not supported by the engine.
    CompletePprRequest {
        /// Raw command words.
        raw: [u64; 2],
    },
    /// Invalidate every cached structure.
    InvalidateIommuAll,
}

impl Command {
    /// Extracts the opcode of a raw record.
    #[must_use]
    pub const fn opcode_of(qword0: u64) -> u8 {
        bits(qword0, 60, 4) as u8
    }

    /// Decodes a 16-byte record.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::UnknownOpcode`] for undefined opcodes,
    /// [`CommandError::ReservedBitsSet`] when a reserved bit is set, and
    /// [`CommandError::Truncated`] when fewer than 16 bytes are given.
    pub fn from_bytes(data: &[u8]) -> Result<Self, CommandError> {
        let [q0, q1] = read_qwords::<2>(data, 0).ok_or(CommandError::Truncated)?;
        Self::from_qwords(q0, q1)
    }

    /// Decodes a record from its two qwords.
    ///
    /// # Errors
    ///
    /// See [`Command::from_bytes`].
    pub fn from_qwords(q0: u64, q1: u64) -> Result<Self, CommandError> {
        let opcode = Self::opcode_of(q0);
        let check = |valid: bool| {
            if valid {
                Ok(())
            } else {
                Err(CommandError::ReservedBitsSet { opcode })
            }
        };
        match opcode {
            OP_COMPLETION_WAIT => {
                check(q0 & !COMPLETION_WAIT_QWORD0_VALID == 0)?;
                Ok(Self::CompletionWait {
                    store: q0 & 1 != 0,
                    interrupt: q0 & (1 << 1) != 0,
                    flush: q0 & (1 << 2) != 0,
                    store_addr: q0 & STORE_ADDR_MASK,
                    store_data: q1,
                })
            }
            OP_INV_DEV_TAB_ENTRY | OP_INV_INTR_TABLE => {
                check(q0 & !INV_DTE_QWORD0_VALID == 0 && q1 == 0)?;
                let device_id = bits(q0, 0, 16) as u16;
                Ok(if opcode == OP_INV_DEV_TAB_ENTRY {
                    Self::InvalidateDevTabEntry { device_id }
                } else {
                    Self::InvalidateIntrTable { device_id }
                })
            }
            OP_INV_IOMMU_PAGES => {
                check(q0 & !INV_PAGES_QWORD0_VALID == 0 && q1 & !INV_PAGES_QWORD1_VALID == 0)?;
                Ok(Self::InvalidateIommuPages {
                    domain_id: bits(q0, 32, 16) as u16,
                    addr: q1 & !0xfff,
                    size: q1 & 1 != 0,
                    pde: q1 & (1 << 1) != 0,
                })
            }
            OP_INV_IOTLB_PAGES => Ok(Self::InvalidateIotlbPages { raw: [q0, q1] }),
            OP_PREFETCH_IOMMU_PAGES => Ok(Self::PrefetchIommuPages { raw: [q0, q1] }),
            OP_COMPLETE_PPR_REQUEST => Ok(Self::CompletePprRequest { raw: [q0, q1] }),
            OP_INV_IOMMU_ALL => {
                check(q0 & !INV_ALL_QWORD0_VALID == 0 && q1 == 0)?;
                Ok(Self::InvalidateIommuAll)
            }
            other => Err(CommandError::UnknownOpcode(other)),
        }
    }

    /// The command's opcode.
    #[must_use]
    pub const fn opcode(&self) -> u8 {
        match self {
            Self::CompletionWait { .. } => OP_COMPLETION_WAIT,
            Self::InvalidateDevTabEntry { .. } => OP_INV_DEV_TAB_ENTRY,
            Self::InvalidateIommuPages { .. } => OP_INV_IOMMU_PAGES,
            Self::InvalidateIotlbPages { .. } => OP_INV_IOTLB_PAGES,
            Self::InvalidateIntrTable { .. } => OP_INV_INTR_TABLE,
            Self::PrefetchIommuPages { .. } => OP_PREFETCH_IOMMU_PAGES,
            Self::CompletePprRequest { .. } => OP_COMPLETE_PPR_REQUEST,
            Self::InvalidateIommuAll => OP_INV_IOMMU_ALL,
        }
    }

    /// Encodes the command as its two qwords.
    #[must_use]
    pub const fn to_qwords(&self) -> [u64; 2] {
        let op = (self.opcode() as u64) << 60;
        match *self {
            Self::CompletionWait {
                store,
                interrupt,
                flush,
                store_addr,
                store_data,
            } => {
                let q0 = op
                    | (store_addr & STORE_ADDR_MASK)
                    | (store as u64)
                    | ((interrupt as u64) << 1)
                    | ((flush as u64) << 2);
                [q0, store_data]
            }
            Self::InvalidateDevTabEntry { device_id } | Self::InvalidateIntrTable { device_id } => {
                [op | device_id as u64, 0]
            }
            Self::InvalidateIommuPages {
                domain_id,
                addr,
                size,
                pde,
            } => [
                op | ((domain_id as u64) << 32),
                (addr & !0xfff) | (size as u64) | ((pde as u64) << 1),
            ],
            Self::InvalidateIotlbPages { raw }
            | Self::PrefetchIommuPages { raw }
            | Self::CompletePprRequest { raw } => raw,
            Self::InvalidateIommuAll => [op, 0],
        }
    }

    /// Encodes the command as 16 little-endian bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; COMMAND_SIZE] {
        qwords_to_bytes(&self.to_qwords())
    }
}
