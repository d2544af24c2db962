//! I/O page table walker.
//!
//! Resolves one 4 KiB IOVA page through the guest's multi-level page table.
//! The walker performs no logging and raises no events; every failure comes
//! back as a [`WalkFault`] for the caller to report.
//!
//! Each step strictly lowers the level, so a walk rooted at level `L` reads at
//! most `L` entries.

use amdvi_format::pte::{ENTRIES_PER_TABLE, LEVEL_SHIFTS, MAX_LEVEL, NEXT_LEVEL_SIZED_LEAF, page_offset_mask};
use amdvi_format::{DeviceTableEntry, IoPageTableEntry, IoPerm};

use crate::cache::PageLookup;
use crate::error::{Fault, IommuError};
use crate::platform::GuestMemory;

/// Why a walk stopped without a translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkFault {
    /// The DTE mode is not a level the walker can start from.
    InvalidRootLevel,
    /// The IOVA has bits set above what the root level maps.
    IovaOutOfRange,
    /// An entry on the path was not present.
    NotPresent,
    /// An entry had reserved bits set.
    ReservedBits,
    /// An entry's next level did not descend.
    InvalidLevelEncoding,
    /// A sized leaf encodes a page size outside its level's range.
    InvalidPageSize,
    /// IOVA bits belonging to a skipped level are non-zero.
    SkippedLevelIovaNotZero,
    /// An entry lacks the requested permission.
    PermissionDenied,
    /// An entry could not be read from guest memory.
    ReadFailed {
        /// Address of the entry.
        addr: u64,
    },
}

impl WalkFault {
    /// Whether the faulting entry was present (the PR bit of the event).
    #[must_use]
    pub fn entry_present(self) -> bool {
        !matches!(self, Self::NotPresent | Self::InvalidRootLevel | Self::IovaOutOfRange)
    }

    /// Whether the fault reports a malformed field (the RZ bit of the event).
    #[must_use]
    pub fn reserved_not_zero(self) -> bool {
        matches!(
            self,
            Self::InvalidRootLevel
                | Self::ReservedBits
                | Self::InvalidLevelEncoding
                | Self::InvalidPageSize
                | Self::SkippedLevelIovaNotZero
                | Self::IovaOutOfRange
        )
    }

    /// The error the front-end returns for this fault.
    ///
    /// A permission failure is an access denial; everything else is a
    /// translation failure.
    #[must_use]
    pub fn into_error(self) -> IommuError {
        let fault = match self {
            Self::PermissionDenied => return IommuError::AccessDenied,
            Self::InvalidRootLevel => Fault::InvalidRootLevel,
            Self::IovaOutOfRange => Fault::IovaOutOfRange,
            Self::NotPresent => Fault::NotPresent,
            Self::ReservedBits => Fault::ReservedBits,
            Self::InvalidLevelEncoding => Fault::InvalidLevelEncoding,
            Self::InvalidPageSize => Fault::InvalidPageSize,
            Self::SkippedLevelIovaNotZero => Fault::SkippedLevelIovaNotZero,
            Self::ReadFailed { .. } => Fault::PageTabHwError,
        };
        IommuError::TranslationFailed(fault)
    }
}

/// Mask of the IOVA bits that select entries at `level` and below.
fn level_span_mask(level: u8) -> u64 {
    page_offset_mask(LEVEL_SHIFTS[usize::from(level) + 1])
}

/// Walks the page table of `dte` for the page containing `iova`.
///
/// `perm` must be a subset of every entry's permissions along the path; the
/// returned lookup carries the intersection of all of them.
///
/// # Errors
///
/// Returns the first [`WalkFault`] encountered.
pub fn walk<M: GuestMemory>(
    mem: &M,
    dte: &DeviceTableEntry,
    iova: u64,
    perm: IoPerm,
) -> Result<PageLookup, WalkFault> {
    let mut level = dte.mode();
    if level == 0 || level > MAX_LEVEL {
        return Err(WalkFault::InvalidRootLevel);
    }
    if level < MAX_LEVEL && iova & !level_span_mask(level) != 0 {
        return Err(WalkFault::IovaOutOfRange);
    }

    let mut table = dte.root_ptr();
    let mut granted = IoPerm::all();
    loop {
        let shift = LEVEL_SHIFTS[usize::from(level)];
        let index = (iova >> shift) & (ENTRIES_PER_TABLE - 1);
        let pte_addr = table + index * IoPageTableEntry::SIZE as u64;
        let pte = IoPageTableEntry(
            mem.read_int::<u64>(pte_addr)
                .map_err(|_| WalkFault::ReadFailed { addr: pte_addr })?,
        );

        if !pte.present() {
            return Err(WalkFault::NotPresent);
        }
        if pte.has_reserved_bits() {
            return Err(WalkFault::ReservedBits);
        }
        if !pte.perm().contains(perm) {
            return Err(WalkFault::PermissionDenied);
        }
        granted &= pte.perm();

        let next = pte.next_level();
        if next == 0 {
            return Ok(PageLookup {
                phys: pte.addr() & !page_offset_mask(shift),
                shift,
                perm: granted,
            });
        }
        if next == NEXT_LEVEL_SIZED_LEAF {
            let page_shift = pte.encoded_page_shift();
            if page_shift <= shift || page_shift >= LEVEL_SHIFTS[usize::from(level) + 1] {
                return Err(WalkFault::InvalidPageSize);
            }
            return Ok(PageLookup {
                phys: pte.addr() & !page_offset_mask(page_shift),
                shift: page_shift,
                perm: granted,
            });
        }
        if next >= level {
            return Err(WalkFault::InvalidLevelEncoding);
        }

        // Levels between `next` and `level` are skipped; their index bits
        // must be zero.
        let skipped = page_offset_mask(shift) & !level_span_mask(next);
        if iova & skipped != 0 {
            return Err(WalkFault::SkippedLevelIovaNotZero);
        }

        table = pte.addr();
        level = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SparseMemory;

    const RW: IoPerm = IoPerm::READ.union(IoPerm::WRITE);

    fn write_pte(mem: &SparseMemory, table: u64, index: u64, pte: IoPageTableEntry) {
        mem.map(table, 0x1000);
        mem.write_phys(table + index * 8, &pte.0.to_le_bytes()).unwrap();
    }

    fn dte(mode: u8, root: u64) -> DeviceTableEntry {
        DeviceTableEntry::new()
            .with_valid(true)
            .with_translation_valid(true)
            .with_page_table(mode, root)
            .with_perm(RW)
    }

    /// Three-level table mapping IOVA 0x40_3000 to 0x9000.
    fn three_level(mem: &SparseMemory) -> DeviceTableEntry {
        let iova = 0x40_3000u64;
        write_pte(mem, 0x1_0000, (iova >> 30) & 0x1ff, IoPageTableEntry::new(0x1_1000, 2, RW));
        write_pte(mem, 0x1_1000, (iova >> 21) & 0x1ff, IoPageTableEntry::new(0x1_2000, 1, RW));
        write_pte(mem, 0x1_2000, (iova >> 12) & 0x1ff, IoPageTableEntry::new(0x9000, 0, RW));
        dte(3, 0x1_0000)
    }

    #[test]
    fn walks_three_levels_to_leaf() {
        let mem = SparseMemory::new();
        let dte = three_level(&mem);
        let page = walk(&mem, &dte, 0x40_3000, IoPerm::WRITE).unwrap();
        assert_eq!(page, PageLookup { phys: 0x9000, shift: 12, perm: RW });
    }

    #[test]
    fn missing_entry_is_not_present() {
        let mem = SparseMemory::new();
        let dte = three_level(&mem);
        assert_eq!(walk(&mem, &dte, 0x40_4000, IoPerm::READ), Err(WalkFault::NotPresent));
    }

    #[test]
    fn unreadable_table_reports_entry_address() {
        let mem = SparseMemory::new();
        let dte = dte(2, 0x5_0000);
        assert_eq!(
            walk(&mem, &dte, 0x20_0000, IoPerm::READ),
            Err(WalkFault::ReadFailed { addr: 0x5_0008 })
        );
    }

    #[test]
    fn permission_is_checked_at_every_level() {
        let mem = SparseMemory::new();
        write_pte(&mem, 0x1_0000, 0, IoPageTableEntry::new(0x1_1000, 1, IoPerm::READ));
        write_pte(&mem, 0x1_1000, 0, IoPageTableEntry::new(0x9000, 0, RW));
        let dte = dte(2, 0x1_0000);
        assert_eq!(walk(&mem, &dte, 0, IoPerm::WRITE), Err(WalkFault::PermissionDenied));
        let page = walk(&mem, &dte, 0, IoPerm::READ).unwrap();
        assert_eq!(page.perm, IoPerm::READ);
    }

    #[test]
    fn reserved_bits_fault() {
        let mem = SparseMemory::new();
        let bad = IoPageTableEntry(IoPageTableEntry::new(0x9000, 0, RW).0 | 1 << 55);
        write_pte(&mem, 0x1_0000, 0, bad);
        assert_eq!(walk(&mem, &dte(1, 0x1_0000), 0, IoPerm::READ), Err(WalkFault::ReservedBits));
    }

    #[test]
    fn non_descending_level_is_rejected() {
        let mem = SparseMemory::new();
        // A level-2 entry pointing at level 2 would loop forever.
        write_pte(&mem, 0x1_0000, 0, IoPageTableEntry::new(0x1_0000, 2, RW));
        assert_eq!(
            walk(&mem, &dte(2, 0x1_0000), 0, IoPerm::READ),
            Err(WalkFault::InvalidLevelEncoding)
        );
    }

    #[test]
    fn large_leaf_at_level_two() {
        let mem = SparseMemory::new();
        write_pte(&mem, 0x1_0000, 1, IoPageTableEntry::new(0x4020_0000, 0, RW));
        let page = walk(&mem, &dte(2, 0x1_0000), 0x23_4000, IoPerm::READ).unwrap();
        assert_eq!(page.shift, 21);
        assert_eq!(page.phys, 0x4020_0000);
        assert_eq!(page.phys_for(0x23_4567), 0x4023_4567);
    }

    #[test]
    fn sized_leaf_within_level_range() {
        let mem = SparseMemory::new();
        // Level 2 entry, next-level 7, address bits 13:12 set: 32 KiB page.
        write_pte(&mem, 0x1_0000, 0, IoPageTableEntry::new(0x8_3000, 7, RW));
        let page = walk(&mem, &dte(2, 0x1_0000), 0x2000, IoPerm::READ);
        assert_eq!(page, Err(WalkFault::InvalidPageSize));

        // The same encoding at level 1 is valid: 12 < 15 < 21.
        let mem = SparseMemory::new();
        write_pte(&mem, 0x1_0000, 2, IoPageTableEntry::new(0x8_3000, 7, RW));
        let page = walk(&mem, &dte(1, 0x1_0000), 0x2000, IoPerm::READ).unwrap();
        assert_eq!(page.shift, 15);
        assert_eq!(page.phys, 0x8_0000);
    }

    #[test]
    fn skipped_level_bits_must_be_zero() {
        let mem = SparseMemory::new();
        // Level 3 entry jumps straight to level 1, skipping level 2.
        write_pte(&mem, 0x1_0000, 0, IoPageTableEntry::new(0x1_1000, 1, RW));
        write_pte(&mem, 0x1_1000, 5, IoPageTableEntry::new(0x7000, 0, RW));
        let dte = dte(3, 0x1_0000);
        assert_eq!(walk(&mem, &dte, 0x5000, IoPerm::READ).unwrap().phys, 0x7000);
        assert_eq!(
            walk(&mem, &dte, 0x20_5000, IoPerm::READ),
            Err(WalkFault::SkippedLevelIovaNotZero)
        );
    }

    #[test]
    fn root_level_bounds() {
        let mem = SparseMemory::new();
        assert_eq!(walk(&mem, &dte(7, 0), 0, IoPerm::READ), Err(WalkFault::InvalidRootLevel));
        assert_eq!(walk(&mem, &dte(0, 0), 0, IoPerm::READ), Err(WalkFault::InvalidRootLevel));
        // A one-level table maps 2 MiB of IOVA.
        assert_eq!(
            walk(&mem, &dte(1, 0x1_0000), 0x20_0000, IoPerm::READ),
            Err(WalkFault::IovaOutOfRange)
        );
    }

    #[test]
    fn walk_reads_at_most_root_level_entries() {
        use std::cell::Cell;

        struct Counting<'a> {
            inner: &'a SparseMemory,
            reads: Cell<usize>,
        }
        impl GuestMemory for Counting<'_> {
            fn read_phys(&self, addr: u64, buf: &mut [u8]) -> Result<(), crate::platform::MemoryError> {
                self.reads.set(self.reads.get() + 1);
                self.inner.read_phys(addr, buf)
            }
            fn write_phys(&self, addr: u64, buf: &[u8]) -> Result<(), crate::platform::MemoryError> {
                self.inner.write_phys(addr, buf)
            }
        }

        let mem = SparseMemory::new();
        let dte = three_level(&mem);
        let counting = Counting { inner: &mem, reads: Cell::new(0) };
        walk(&counting, &dte, 0x40_3000, IoPerm::READ).unwrap();
        assert_eq!(counting.reads.get(), 3);
    }
}
