//! `amdvi-engine` --- an AMD-Vi compatible IOMMU for virtual machine monitors.
//!
//! The engine sits on the DMA and interrupt paths of emulated devices:
//!
//! - [`Iommu::memory_access`] translates a device's I/O virtual addresses to
//!   system physical addresses through the guest's device table and I/O page
//!   tables.
//! - [`Iommu::msi_remap`] rewrites device MSIs through the guest's interrupt
//!   remapping tables.
//! - [`Iommu::mmio_read`] / [`Iommu::mmio_write`] expose the register file;
//!   a background worker drains the guest's command buffer and applies its
//!   invalidations to the DTE, IOTLB and IRTE caches.
//!
//! Faults are reported to the guest through its event log and the hardware
//! error registers, and to the caller as [`IommuError`]. Guest memory, the
//! IOMMU's own interrupt and PCI target aborts are provided by the embedder
//! through [`Platform`].
//!
//! Record layouts live in the `amdvi-format` crate.

#![warn(missing_docs)]

pub mod cache;
pub mod config;
pub mod error;
pub mod intr_table;
pub mod memory;
pub mod platform;
pub mod regs;
pub mod walker;
pub mod worker;

mod cmd;
mod event_log;
mod iommu;
mod remap;
mod report;
mod translate;

pub use cache::CacheOccupancy;
pub use config::IommuConfig;
pub use error::{ConfigError, Fault, IntrFault, IommuError};
pub use iommu::Iommu;
pub use memory::SparseMemory;
pub use platform::{GuestMemory, MemoryError, MemoryOp, Platform};
pub use translate::Translation;

pub use amdvi_format::{IoPerm, MsiMessage};
