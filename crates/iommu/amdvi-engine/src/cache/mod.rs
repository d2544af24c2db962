//! The three translation caches and the lock domain that guards them.
//!
//! All three live in one [`Caches`] value behind a single mutex, held only for
//! the duration of a lookup or an update, never across guest memory accesses.

pub mod dte;
pub mod iotlb;
pub mod irte;

pub use dte::{DteCache, DteCacheEntry, DteFlags};
pub use iotlb::{Iotlb, PageLookup, iotlb_key};
pub use irte::{IrteCache, IrteCacheFull, irte_key};

use crate::config::IommuConfig;

/// DTE, IOTLB and IRTE caches.
#[derive(Debug)]
pub struct Caches {
    /// Device table entry cache.
    pub dte: DteCache,
    /// I/O TLB.
    pub iotlb: Iotlb,
    /// Interrupt remapping entry cache.
    pub irte: IrteCache,
}

impl Caches {
    /// Creates empty caches sized from `config`.
    #[must_use]
    pub fn new(config: &IommuConfig) -> Self {
        Self {
            dte: DteCache::new(config.dte_cache_entries),
            iotlb: Iotlb::new(config.iotlb_entries),
            irte: IrteCache::new(config.irte_cache_entries),
        }
    }

    /// Drops every cached structure.
    pub fn clear(&mut self) {
        self.dte.remove_all();
        self.iotlb.remove_all();
        self.irte.remove_all();
    }

    /// Entry counts of the three caches.
    #[must_use]
    pub fn occupancy(&self) -> CacheOccupancy {
        CacheOccupancy {
            dte: self.dte.len(),
            iotlb: self.iotlb.len(),
            irte: self.irte.len(),
        }
    }
}

/// Snapshot of how many entries each cache holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheOccupancy {
    /// Cached devices.
    pub dte: usize,
    /// Indexed IOTLB entries, evict-pending ones included.
    pub iotlb: usize,
    /// Cached interrupt remapping entries.
    pub irte: usize,
}
