//! Services the engine consumes from the virtual machine monitor.
//!
//! The engine never touches guest RAM or the interrupt controller directly.
//! Every table, ring and store access goes through [`GuestMemory`], and the
//! IOMMU's own interrupt and PCI target-abort status go through [`Platform`].

use thiserror::Error;

use amdvi_format::bytes::LeInt;

/// A guest physical memory access that could not be completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("guest memory {op} failed at {addr:#x} ({len} bytes)")]
pub struct MemoryError {
    /// Whether the access was a read or a write.
    pub op: MemoryOp,
    /// Guest physical address of the access.
    pub addr: u64,
    /// Length of the access.
    pub len: usize,
}

/// Direction of a guest memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryOp {
    /// Read from guest memory.
    Read,
    /// Write to guest memory.
    Write,
}

impl core::fmt::Display for MemoryOp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Read => f.write_str("read"),
            Self::Write => f.write_str("write"),
        }
    }
}

/// Guest physical memory.
pub trait GuestMemory {
    /// Reads `buf.len()` bytes from guest physical address `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError`] if any byte of the range is not backed.
    fn read_phys(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryError>;

    /// Writes `buf` to guest physical address `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError`] if any byte of the range is not backed.
    fn write_phys(&self, addr: u64, buf: &[u8]) -> Result<(), MemoryError>;

    /// Reads a little-endian integer.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError`] if the range is not backed.
    fn read_int<T: LeInt>(&self, addr: u64) -> Result<T, MemoryError>
    where
        Self: Sized,
    {
        let mut buf = [0u8; 8];
        let buf = &mut buf[..T::SIZE];
        self.read_phys(addr, buf)?;
        T::read_at(buf, 0).ok_or(MemoryError {
            op: MemoryOp::Read,
            addr,
            len: T::SIZE,
        })
    }
}

/// Everything the engine needs from its host.
///
/// Implementations must be callable from any thread: translations run on
/// vCPU and device threads while commands drain on the worker thread.
pub trait Platform: GuestMemory + Send + Sync + 'static {
    /// Signals the IOMMU's own MSI (event log and completion-wait interrupts).
    fn raise_interrupt(&self);

    /// Records a PCI target abort on behalf of the IOMMU (sets the
    /// signalled-target-abort bit in its PCI status register).
    fn target_abort(&self);
}

impl<T: GuestMemory + ?Sized> GuestMemory for &T {
    fn read_phys(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        (**self).read_phys(addr, buf)
    }

    fn write_phys(&self, addr: u64, buf: &[u8]) -> Result<(), MemoryError> {
        (**self).write_phys(addr, buf)
    }
}

impl<T: GuestMemory + ?Sized> GuestMemory for std::sync::Arc<T> {
    fn read_phys(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        (**self).read_phys(addr, buf)
    }

    fn write_phys(&self, addr: u64, buf: &[u8]) -> Result<(), MemoryError> {
        (**self).write_phys(addr, buf)
    }
}
