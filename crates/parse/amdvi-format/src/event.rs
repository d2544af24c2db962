//! Event log records.
//!
//! Events are 16 bytes with the event code in bits 63:60 of the first qword.
//! Only the event types the engine produces are modelled.

use bitflags::bitflags;

use crate::bytes::qwords_to_bytes;
use crate::bits;

/// Size of one event record in bytes.
pub const EVENT_SIZE: usize = 16;

/// Event codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventCode {
    /// `ILLEGAL_DEV_TABLE_ENTRY`.
    IllegalDevTabEntry = 0x1,
    /// `IO_PAGE_FAULT`.
    IoPageFault = 0x2,
    /// `DEV_TAB_HARDWARE_ERROR`.
    DevTabHwError = 0x3,
    /// `PAGE_TAB_HARDWARE_ERROR`.
    PageTabHwError = 0x4,
    /// `ILLEGAL_COMMAND_ERROR`.
    IllegalCommand = 0x5,
    /// `COMMAND_HARDWARE_ERROR`.
    CommandHwError = 0x6,
}

impl EventCode {
    /// Decodes the code of a raw record's first qword.
    #[must_use]
    pub const fn from_qword0(qword0: u64) -> Option<Self> {
        match bits(qword0, 60, 4) {
            0x1 => Some(Self::IllegalDevTabEntry),
            0x2 => Some(Self::IoPageFault),
            0x3 => Some(Self::DevTabHwError),
            0x4 => Some(Self::PageTabHwError),
            0x5 => Some(Self::IllegalCommand),
            0x6 => Some(Self::CommandHwError),
            _ => None,
        }
    }
}

bitflags! {
    /// Access qualifier flags of I/O page fault and illegal DTE events.
    ///
    /// Bit positions are relative to bit 48 of the first qword.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IoFaultFlags: u16 {
        /// GN: the request carried a PASID.
        const GUEST = 1 << 0;
        /// NX: no-execute requested.
        const NO_EXECUTE = 1 << 1;
        /// US: user-mode request.
        const USER = 1 << 2;
        /// I: the request was an interrupt.
        const INTERRUPT = 1 << 3;
        /// PR: the faulting entry was present.
        const PRESENT = 1 << 4;
        /// RW: the request was a write.
        const WRITE = 1 << 5;
        /// PE: permission denied.
        const PERM_DENIED = 1 << 6;
        /// RZ: a reserved bit was set (or a field was out of range).
        const RSVD_NOT_ZERO = 1 << 7;
        /// TR: the request was an ATS translation request.
        const TRANSLATION = 1 << 8;
    }
}

/// Flags that are meaningful in an `ILLEGAL_DEV_TABLE_ENTRY` event.
const ILLEGAL_DTE_FLAGS: IoFaultFlags = IoFaultFlags::INTERRUPT
    .union(IoFaultFlags::WRITE)
    .union(IoFaultFlags::RSVD_NOT_ZERO)
    .union(IoFaultFlags::TRANSLATION);

/// Hardware error type (bits 57:56 of hardware error events).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwErrorKind {
    /// Master abort.
    MasterAbort,
    /// Target abort.
    TargetAbort,
    /// Data error.
    DataError,
}

impl HwErrorKind {
    const fn bits(self) -> u64 {
        match self {
            Self::MasterAbort => 0b00,
            Self::TargetAbort => 0b01,
            Self::DataError => 0b10,
        }
    }
}

/// An event log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A device table entry had reserved bits set or an invalid field.
    IllegalDevTabEntry {
        /// Requesting device.
        device_id: u16,
        /// Address of the request.
        addr: u64,
        /// Access qualifiers (I, RW, RZ, TR are encoded).
        flags: IoFaultFlags,
    },
    /// An I/O page fault.
    IoPageFault {
        /// Requesting device.
        device_id: u16,
        /// Domain of the device.
        domain_id: u16,
        /// Faulting address.
        addr: u64,
        /// Access qualifiers.
        flags: IoFaultFlags,
    },
    /// Device table could not be read.
    DevTabHwError {
        /// Requesting device.
        device_id: u16,
        /// Address of the device table entry.
        addr: u64,
        /// The request was an interrupt.
        interrupt: bool,
        /// The request was a write.
        write: bool,
        /// Error type.
        kind: HwErrorKind,
    },
    /// A page table (or interrupt table) could not be read.
    PageTabHwError {
        /// Requesting device.
        device_id: u16,
        /// Domain of the device.
        domain_id: u16,
        /// Address of the table entry.
        addr: u64,
        /// The request was an interrupt.
        interrupt: bool,
        /// The request was a write.
        write: bool,
        /// Error type.
        kind: HwErrorKind,
    },
    /// A malformed or unsupported command.
    IllegalCommand {
        /// Address of the command.
        addr: u64,
    },
    /// The command buffer (or a completion-wait store) could not be accessed.
    CommandHwError {
        /// Address of the access.
        addr: u64,
        /// Error type.
        kind: HwErrorKind,
    },
}

impl Event {
    /// The event's code.
    #[must_use]
    pub const fn code(&self) -> EventCode {
        match self {
            Self::IllegalDevTabEntry { .. } => EventCode::IllegalDevTabEntry,
            Self::IoPageFault { .. } => EventCode::IoPageFault,
            Self::DevTabHwError { .. } => EventCode::DevTabHwError,
            Self::PageTabHwError { .. } => EventCode::PageTabHwError,
            Self::IllegalCommand { .. } => EventCode::IllegalCommand,
            Self::CommandHwError { .. } => EventCode::CommandHwError,
        }
    }

    /// Encodes the event as its two qwords.
    #[must_use]
    pub const fn to_qwords(&self) -> [u64; 2] {
        let code = (self.code() as u64) << 60;
        match *self {
            Self::IllegalDevTabEntry {
                device_id,
                addr,
                flags,
            } => {
                let flags = flags.intersection(ILLEGAL_DTE_FLAGS).bits() as u64;
                [code | (flags << 48) | device_id as u64, addr & !0x3]
            }
            Self::IoPageFault {
                device_id,
                domain_id,
                addr,
                flags,
            } => [
                code | ((flags.bits() as u64 & 0x1ff) << 48) | ((domain_id as u64) << 32) | device_id as u64,
                addr,
            ],
            Self::DevTabHwError {
                device_id,
                addr,
                interrupt,
                write,
                kind,
            } => [
                code | hw_qualifiers(interrupt, write, kind) | device_id as u64,
                addr & !0xf,
            ],
            Self::PageTabHwError {
                device_id,
                domain_id,
                addr,
                interrupt,
                write,
                kind,
            } => [
                code | hw_qualifiers(interrupt, write, kind)
                    | ((domain_id as u64) << 32)
                    | device_id as u64,
                addr & !0x7,
            ],
            Self::IllegalCommand { addr } => [code, addr & !0xf],
            Self::CommandHwError { addr, kind } => [code | (kind.bits() << 56), addr & !0xf],
        }
    }

    /// Encodes the event as 16 little-endian bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; EVENT_SIZE] {
        qwords_to_bytes(&self.to_qwords())
    }
}

/// I (51), RW (53) and Type (57:56) of hardware error events.
const fn hw_qualifiers(interrupt: bool, write: bool, kind: HwErrorKind) -> u64 {
    ((interrupt as u64) << 51) | ((write as u64) << 53) | (kind.bits() << 56)
}
