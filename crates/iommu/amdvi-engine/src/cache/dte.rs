//! Device table entry cache.
//!
//! A small fixed array scanned linearly. Device id 0 marks a free slot, so the
//! host bridge (00:00.0) is never cached and always takes the slow path.
//! When every slot is taken new devices are simply not cached.

use amdvi_format::{DeviceTableEntry, IntrCtl, IoPerm};
use bitflags::bitflags;

bitflags! {
    /// Cached per-device flags, a compact projection of a DTE.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DteFlags: u16 {
        /// The slot holds a DTE read from guest memory.
        const PRESENT = 1 << 0;
        /// DTE.V.
        const VALID = 1 << 1;
        /// Permissions apply without page table translation (mode 0).
        const IO_PERM = 1 << 2;
        /// DTE.IR.
        const IO_PERM_READ = 1 << 3;
        /// DTE.IW.
        const IO_PERM_WRITE = 1 << 4;
        /// Reserved permission bit.
        const IO_PERM_RSVD = 1 << 5;
        /// Accesses are translated through the IOTLB.
        const ADDR_TRANSLATE = 1 << 6;
        /// DTE.SA.
        const SUPPRESS_ALL_IOPF = 1 << 7;
        /// DTE.SE.
        const SUPPRESS_IOPF = 1 << 8;
        /// DTE.IV.
        const INTR_MAP_VALID = 1 << 9;
        /// DTE.IG.
        const IGNORE_UNMAPPED_INTR = 1 << 10;
        /// An I/O page fault was already logged for the device.
        const IO_PAGE_FAULT_RAISED = 1 << 11;
        /// Low bit of DTE.IntCtl.
        const INTR_CTRL_LO = 1 << 12;
        /// High bit of DTE.IntCtl.
        const INTR_CTRL_HI = 1 << 13;
        /// The interrupt half of the DTE has no reserved bits set.
        const INTR_RSVD_CLEAR = 1 << 14;
    }
}

const PERM_SHIFT: u32 = 3;
const INTR_CTRL_SHIFT: u32 = 12;

impl DteFlags {
    /// Flags that describe the interrupt half of the DTE.
    pub const INTR_MASK: Self = Self::INTR_MAP_VALID
        .union(Self::IGNORE_UNMAPPED_INTR)
        .union(Self::INTR_CTRL_LO)
        .union(Self::INTR_CTRL_HI)
        .union(Self::INTR_RSVD_CLEAR);

    /// Flags computed by the engine rather than copied from the DTE.
    pub const COMPUTED_MASK: Self = Self::IO_PERM
        .union(Self::ADDR_TRANSLATE)
        .union(Self::IO_PAGE_FAULT_RAISED);

    /// Projects the architectural bits of a DTE.
    #[must_use]
    pub fn from_dte(dte: &DeviceTableEntry) -> Self {
        let mut flags = Self::PRESENT;
        flags.set(Self::VALID, dte.valid());
        flags |= Self::from_perm(dte.perm());
        flags.set(Self::SUPPRESS_ALL_IOPF, dte.suppress_all_io_page_faults());
        flags.set(Self::SUPPRESS_IOPF, dte.suppress_io_page_faults());
        flags.set(Self::INTR_MAP_VALID, dte.intr_map_valid());
        flags.set(Self::IGNORE_UNMAPPED_INTR, dte.ignore_unmapped_intr());
        flags.set(Self::INTR_RSVD_CLEAR, !dte.has_intr_rsvd_bits());
        flags | Self::from_bits_retain(u16::from(dte.intr_ctl().bits()) << INTR_CTRL_SHIFT)
    }

    /// The IO permission bits as flags.
    #[must_use]
    pub fn from_perm(perm: IoPerm) -> Self {
        Self::from_bits_retain(u16::from(perm.bits()) << PERM_SHIFT)
    }

    /// The cached IO permissions.
    #[must_use]
    pub fn perm(self) -> IoPerm {
        IoPerm::from_bits_truncate(((self.bits() >> PERM_SHIFT) & 0x3) as u8)
    }

    /// The cached interrupt control.
    #[must_use]
    pub fn intr_ctl(self) -> IntrCtl {
        IntrCtl::from_bits(((self.bits() >> INTR_CTRL_SHIFT) & 0x3) as u8)
    }
}

/// A cached DTE projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DteCacheEntry {
    /// Device flags.
    pub flags: DteFlags,
    /// Domain id of the device.
    pub domain_id: u16,
}

/// Fixed-capacity DTE cache keyed by device id.
#[derive(Debug)]
pub struct DteCache {
    device_ids: Box<[u16]>,
    entries: Box<[DteCacheEntry]>,
}

impl DteCache {
    /// Creates an empty cache with `capacity` slots.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            device_ids: vec![0; capacity].into_boxed_slice(),
            entries: vec![DteCacheEntry::default(); capacity].into_boxed_slice(),
        }
    }

    fn slot_of(&self, device_id: u16) -> Option<usize> {
        if device_id == 0 {
            return None;
        }
        self.device_ids.iter().position(|&id| id == device_id)
    }

    /// Returns the cached entry of `device_id`.
    #[must_use]
    pub fn lookup(&self, device_id: u16) -> Option<DteCacheEntry> {
        self.slot_of(device_id).map(|idx| self.entries[idx])
    }

    /// Caches `dte` for `device_id` with flags `(from_dte(dte) | or) & and`.
    ///
    /// An existing slot is overwritten; otherwise the first free slot is
    /// claimed. Returns `false` when the cache is full.
    pub fn insert_or_update(
        &mut self,
        device_id: u16,
        dte: &DeviceTableEntry,
        or: DteFlags,
        and: DteFlags,
    ) -> bool {
        if device_id == 0 {
            return false;
        }
        let idx = match self.slot_of(device_id) {
            Some(idx) => idx,
            None => match self.device_ids.iter().position(|&id| id == 0) {
                Some(idx) => idx,
                None => {
                    log::trace!("amd-vi: DTE cache full, {device_id:#06x} not cached");
                    return false;
                }
            },
        };
        self.device_ids[idx] = device_id;
        self.entries[idx] = DteCacheEntry {
            flags: (DteFlags::from_dte(dte) | or) & and,
            domain_id: dte.domain_id(),
        };
        true
    }

    /// Updates the flags of a cached device to `(flags | or) & and`.
    ///
    /// Returns `false` if the device is not cached.
    pub fn update_flags(&mut self, device_id: u16, or: DteFlags, and: DteFlags) -> bool {
        match self.slot_of(device_id) {
            Some(idx) => {
                let entry = &mut self.entries[idx];
                entry.flags = (entry.flags | or) & and;
                true
            }
            None => false,
        }
    }

    /// Drops the cached entry of `device_id`.
    pub fn remove(&mut self, device_id: u16) {
        if let Some(idx) = self.slot_of(device_id) {
            self.device_ids[idx] = 0;
            self.entries[idx] = DteCacheEntry::default();
        }
    }

    /// Drops every entry.
    pub fn remove_all(&mut self) {
        self.device_ids.fill(0);
        self.entries.fill(DteCacheEntry::default());
    }

    /// Number of cached devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.device_ids.iter().filter(|&&id| id != 0).count()
    }

    /// Whether no device is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dte(domain: u16) -> DeviceTableEntry {
        DeviceTableEntry::new()
            .with_valid(true)
            .with_translation_valid(true)
            .with_perm(IoPerm::READ)
            .with_domain_id(domain)
    }

    #[test]
    fn flags_project_dte() {
        let d = dte(1)
            .with_fault_suppression(true, false)
            .with_intr_table(0x1000, 2, IntrCtl::Remap);
        let flags = DteFlags::from_dte(&d);
        assert!(flags.contains(DteFlags::PRESENT | DteFlags::VALID | DteFlags::IO_PERM_READ));
        assert!(!flags.contains(DteFlags::IO_PERM_WRITE));
        assert!(flags.contains(DteFlags::SUPPRESS_IOPF | DteFlags::INTR_MAP_VALID));
        assert_eq!(flags.perm(), IoPerm::READ);
        assert_eq!(flags.intr_ctl(), IntrCtl::Remap);
        assert!(flags.contains(DteFlags::INTR_RSVD_CLEAR));
        assert!(!flags.intersects(DteFlags::COMPUTED_MASK));
    }

    #[test]
    fn reserved_interrupt_bits_are_projected() {
        let mut d = dte(1).with_intr_table(0x1000, 2, IntrCtl::ForwardUnmapped);
        d.words[2] |= 1 << 52;
        let flags = DteFlags::from_dte(&d);
        assert!(flags.contains(DteFlags::INTR_MAP_VALID));
        assert!(!flags.contains(DteFlags::INTR_RSVD_CLEAR));
    }

    #[test]
    fn insert_then_lookup() {
        let mut cache = DteCache::new(4);
        assert!(cache.insert_or_update(0x10, &dte(7), DteFlags::ADDR_TRANSLATE, DteFlags::all()));
        let entry = cache.lookup(0x10).unwrap();
        assert_eq!(entry.domain_id, 7);
        assert!(entry.flags.contains(DteFlags::ADDR_TRANSLATE | DteFlags::VALID));
        assert!(cache.lookup(0x11).is_none());
    }

    #[test]
    fn update_in_place_does_not_duplicate() {
        let mut cache = DteCache::new(2);
        cache.insert_or_update(0x10, &dte(1), DteFlags::empty(), DteFlags::all());
        cache.insert_or_update(0x10, &dte(2), DteFlags::empty(), DteFlags::all());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup(0x10).unwrap().domain_id, 2);
    }

    #[test]
    fn and_mask_strips_flags() {
        let mut cache = DteCache::new(2);
        cache.insert_or_update(0x10, &dte(1), DteFlags::empty(), DteFlags::PRESENT);
        assert_eq!(cache.lookup(0x10).unwrap().flags, DteFlags::PRESENT);
    }

    #[test]
    fn full_cache_fails_silently() {
        let mut cache = DteCache::new(2);
        assert!(cache.insert_or_update(1, &dte(1), DteFlags::empty(), DteFlags::all()));
        assert!(cache.insert_or_update(2, &dte(1), DteFlags::empty(), DteFlags::all()));
        assert!(!cache.insert_or_update(3, &dte(1), DteFlags::empty(), DteFlags::all()));
        assert!(cache.lookup(3).is_none());
        assert!(cache.lookup(1).is_some());
    }

    #[test]
    fn device_zero_is_never_cached() {
        let mut cache = DteCache::new(2);
        assert!(!cache.insert_or_update(0, &dte(1), DteFlags::empty(), DteFlags::all()));
        assert!(cache.lookup(0).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn update_flags_and_remove() {
        let mut cache = DteCache::new(2);
        assert!(!cache.update_flags(5, DteFlags::IO_PAGE_FAULT_RAISED, DteFlags::all()));
        cache.insert_or_update(5, &dte(1), DteFlags::empty(), DteFlags::all());
        assert!(cache.update_flags(5, DteFlags::IO_PAGE_FAULT_RAISED, DteFlags::all()));
        assert!(cache.lookup(5).unwrap().flags.contains(DteFlags::IO_PAGE_FAULT_RAISED));

        cache.remove(5);
        assert!(cache.lookup(5).is_none());
        // The freed slot is reusable.
        cache.insert_or_update(6, &dte(1), DteFlags::empty(), DteFlags::all());
        cache.insert_or_update(7, &dte(1), DteFlags::empty(), DteFlags::all());
        assert_eq!(cache.len(), 2);

        cache.remove_all();
        assert!(cache.is_empty());
    }
}
