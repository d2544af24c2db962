//! DMA address translation front-end.
//!
//! A request first consults the DTE cache and, for translated devices, the
//! IOTLB. Anything the caches cannot answer in full goes to the slow path,
//! which re-reads the device table entry and walks the guest page table one
//! 4 KiB page at a time, refilling both caches on success.

use amdvi_format::pte::MAX_LEVEL;
use amdvi_format::{
    DeviceTableEntry, Event, HwErrorKind, IoFaultFlags, IoPerm, PAGE_OFFSET_MASK, PAGE_SIZE,
};

use crate::cache::{DteFlags, Iotlb, PageLookup};
use crate::error::{Fault, IommuError};
use crate::iommu::Shared;
use crate::platform::Platform;
use crate::regs::DevTabLayout;
use crate::report::Request;
use crate::walker::{self, WalkFault};

/// A translated DMA range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    /// System physical address of the first byte.
    pub phys: u64,
    /// Bytes from the start of the access that are physically contiguous.
    pub len: usize,
}

impl Translation {
    /// An untranslated range.
    #[must_use]
    pub const fn identity(iova: u64, len: usize) -> Self {
        Self { phys: iova, len }
    }
}

/// Accumulates the uniform prefix of an access page by page: physically
/// contiguous, with the permission and page size of its first page.
#[derive(Debug)]
struct ContiguousRange {
    iova: u64,
    len: usize,
    done: usize,
    phys: Option<u64>,
    perm: IoPerm,
    shift: u8,
}

impl ContiguousRange {
    fn new(iova: u64, len: usize) -> Self {
        Self {
            iova,
            len,
            done: 0,
            phys: None,
            perm: IoPerm::empty(),
            shift: 0,
        }
    }

    /// IOVA of the next byte to translate.
    fn next_iova(&self) -> u64 {
        self.iova.wrapping_add(self.done as u64)
    }

    fn is_complete(&self) -> bool {
        self.done == self.len
    }

    /// Extends the range with the page at [`Self::next_iova`], resolved as
    /// `page`. Returns `false`, leaving the range unchanged, if `page` does
    /// not continue it.
    fn push(&mut self, page: &PageLookup) -> bool {
        let iova = self.next_iova();
        let phys = page.phys_for(iova);
        match self.phys {
            None => {
                self.phys = Some(phys);
                self.perm = page.perm;
                self.shift = page.shift;
            }
            Some(start) => {
                if start.wrapping_add(self.done as u64) != phys
                    || page.perm != self.perm
                    || page.shift != self.shift
                {
                    return false;
                }
            }
        }
        let in_page = PAGE_SIZE - (iova & PAGE_OFFSET_MASK);
        self.done += in_page.min((self.len - self.done) as u64) as usize;
        true
    }

    fn translation(&self) -> Option<Translation> {
        self.phys.map(|phys| Translation { phys, len: self.done })
    }

    /// The prefix gathered so far, or the whole access untranslated.
    fn or_identity(&self) -> Translation {
        self.translation()
            .unwrap_or(Translation::identity(self.iova, self.len))
    }
}

/// What the caches could answer.
enum Cached {
    /// The answer, possibly cut short where the next page breaks uniformity.
    Hit(Translation),
    /// A uniform prefix; the rest missed.
    Prefix(ContiguousRange),
    Miss,
}

impl<P: Platform> Shared<P> {
    /// Translates `len` bytes at `iova` for `device_id`.
    pub(crate) fn memory_access(
        &self,
        device_id: u16,
        iova: u64,
        len: usize,
        perm: IoPerm,
    ) -> Result<Translation, IommuError> {
        if len == 0 {
            return Err(IommuError::EmptyAccess);
        }
        let layout = {
            let state = self.lock_device()?;
            if !state.is_enabled() {
                return Ok(Translation::identity(iova, len));
            }
            state.dev_tab_layout()
        };

        match self.lookup_cached(device_id, iova, len, perm) {
            Cached::Hit(found) => Ok(found),
            Cached::Miss => {
                self.translate_uncached(&layout, device_id, ContiguousRange::new(iova, len), perm)
            }
            // The slow path continues the cached prefix.
            Cached::Prefix(range) => self.translate_uncached(&layout, device_id, range, perm),
        }
    }

    fn lookup_cached(&self, device_id: u16, iova: u64, len: usize, perm: IoPerm) -> Cached {
        let mut caches = self.caches.lock();
        let Some(entry) = caches.dte.lookup(device_id) else {
            return Cached::Miss;
        };
        let flags = entry.flags;
        if flags.contains(DteFlags::PRESENT | DteFlags::VALID | DteFlags::ADDR_TRANSLATE) {
            return lookup_iotlb(&mut caches.iotlb, entry.domain_id, iova, len, perm);
        }
        if flags.contains(DteFlags::PRESENT | DteFlags::VALID | DteFlags::IO_PERM) {
            // Insufficient permission goes to the slow path to be reported.
            return if flags.perm().contains(perm) {
                Cached::Hit(Translation::identity(iova, len))
            } else {
                Cached::Miss
            };
        }
        if flags.contains(DteFlags::PRESENT) && !flags.contains(DteFlags::VALID) {
            return Cached::Hit(Translation::identity(iova, len));
        }
        Cached::Miss
    }

    /// Translates what `range` has not covered yet from guest memory.
    ///
    /// When the DTE no longer calls for a page walk, a cached prefix is
    /// returned alone.
    fn translate_uncached(
        &self,
        layout: &DevTabLayout,
        device_id: u16,
        range: ContiguousRange,
        perm: IoPerm,
    ) -> Result<Translation, IommuError> {
        let req = Request::memory(device_id, range.next_iova(), perm);
        let dte = self
            .read_dte(layout, req)
            .map_err(|fault| IommuError::TranslationFailed(fault.fault()))?;

        if !dte.valid() {
            self.cache_dte(
                device_id,
                &dte,
                DteFlags::empty(),
                DteFlags::empty(),
                DteFlags::PRESENT | DteFlags::INTR_MASK,
            );
            return Ok(range.or_identity());
        }
        if dte.has_translation_rsvd_bits() {
            self.illegal_dte(req);
            return Err(IommuError::TranslationFailed(Fault::IllegalDte));
        }
        if !dte.translation_valid() {
            self.io_page_fault(req, Some(&dte), IoFaultFlags::empty(), None);
            return Err(IommuError::TranslationFailed(Fault::DteTranslationDisabled));
        }
        if !dte.perm().contains(perm) {
            self.io_page_fault(
                req,
                Some(&dte),
                IoFaultFlags::PRESENT | IoFaultFlags::PERM_DENIED,
                None,
            );
            return Err(IommuError::AccessDenied);
        }

        match dte.mode() {
            0 => {
                self.cache_dte(
                    device_id,
                    &dte,
                    DteFlags::IO_PAGE_FAULT_RAISED,
                    DteFlags::IO_PERM,
                    !DteFlags::ADDR_TRANSLATE,
                );
                Ok(range.or_identity())
            }
            mode if mode > MAX_LEVEL => {
                log::debug!("amd-vi: DTE of {device_id:#06x} has root level {mode}");
                self.io_page_fault(req, Some(&dte), IoFaultFlags::RSVD_NOT_ZERO, None);
                Err(IommuError::TranslationFailed(Fault::InvalidRootLevel))
            }
            _ => self.walk_range(req, &dte, range, perm),
        }
    }

    /// Walks the remaining pages of `range` and refills the caches.
    ///
    /// A fault on any page fails the whole access.
    fn walk_range(
        &self,
        req: Request,
        dte: &DeviceTableEntry,
        mut range: ContiguousRange,
        perm: IoPerm,
    ) -> Result<Translation, IommuError> {
        let mut pages: Vec<(u64, PageLookup)> = Vec::new();
        let mut last: Option<(u64, PageLookup)> = None;

        while !range.is_complete() {
            let iova = range.next_iova();
            let page = match last {
                Some((prev, page)) if prev >> page.shift == iova >> page.shift => page,
                _ => walker::walk(&self.platform, dte, iova, perm)
                    .map_err(|fault| self.walk_failed(req.at(iova), dte, fault))?,
            };
            if !range.push(&page) {
                break;
            }
            pages.push((iova, page));
            last = Some((iova, page));
        }

        {
            let mut caches = self.caches.lock();
            for &(iova, page) in &pages {
                caches.iotlb.insert(dte.domain_id(), iova, page);
            }
        }
        self.cache_dte(
            req.device_id,
            dte,
            DteFlags::IO_PAGE_FAULT_RAISED,
            DteFlags::ADDR_TRANSLATE,
            !DteFlags::IO_PERM,
        );

        range
            .translation()
            .ok_or(IommuError::TranslationFailed(Fault::NotPresent))
    }

    /// Reports a walk fault and converts it to the caller's error.
    fn walk_failed(&self, req: Request, dte: &DeviceTableEntry, fault: WalkFault) -> IommuError {
        match fault {
            WalkFault::ReadFailed { addr } => {
                log::warn!("amd-vi: failed to read page table entry at {addr:#x}");
                self.log_hw_error(&Event::PageTabHwError {
                    device_id: req.device_id,
                    domain_id: dte.domain_id(),
                    addr,
                    interrupt: false,
                    write: req.write,
                    kind: HwErrorKind::TargetAbort,
                });
                self.platform.target_abort();
            }
            _ => {
                let mut flags = IoFaultFlags::empty();
                flags.set(IoFaultFlags::PRESENT, fault.entry_present());
                flags.set(IoFaultFlags::RSVD_NOT_ZERO, fault.reserved_not_zero());
                flags.set(IoFaultFlags::PERM_DENIED, fault == WalkFault::PermissionDenied);
                self.io_page_fault(req, Some(dte), flags, None);
            }
        }
        fault.into_error()
    }
}

/// Answers as much of the access as the IOTLB holds.
fn lookup_iotlb(iotlb: &mut Iotlb, domain_id: u16, iova: u64, len: usize, perm: IoPerm) -> Cached {
    let mut range = ContiguousRange::new(iova, len);
    while !range.is_complete() {
        let cur = range.next_iova();
        let Some(page) = iotlb.lookup(domain_id, cur).filter(|page| page.perm.contains(perm)) else {
            break;
        };
        if !range.push(&page) {
            return range.translation().map_or(Cached::Miss, Cached::Hit);
        }
    }
    match range.translation() {
        None => Cached::Miss,
        Some(found) if range.is_complete() => Cached::Hit(found),
        Some(_) => Cached::Prefix(range),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RW: IoPerm = IoPerm::READ.union(IoPerm::WRITE);

    fn page(phys: u64, shift: u8, perm: IoPerm) -> PageLookup {
        PageLookup { phys, shift, perm }
    }

    fn prefix(cached: Cached) -> Option<Translation> {
        match cached {
            Cached::Prefix(range) => range.translation(),
            _ => None,
        }
    }

    #[test]
    fn contiguous_range_splits_at_page_boundaries() {
        let mut range = ContiguousRange::new(0x1ff0, 0x20);
        assert!(range.push(&page(0x9000, 12, RW)));
        assert_eq!(range.next_iova(), 0x2000);
        assert!(range.push(&page(0xa000, 12, RW)));
        assert!(range.is_complete());
        assert_eq!(range.translation(), Some(Translation { phys: 0x9ff0, len: 0x20 }));
    }

    #[test]
    fn contiguous_range_stops_at_discontinuity() {
        let mut range = ContiguousRange::new(0x1000, 0x2000);
        assert!(range.push(&page(0x5000, 12, RW)));
        assert!(!range.push(&page(0x8000, 12, RW)));
        assert!(!range.is_complete());
        assert_eq!(range.translation(), Some(Translation { phys: 0x5000, len: 0x1000 }));
    }

    #[test]
    fn contiguous_range_stops_at_permission_change() {
        let mut range = ContiguousRange::new(0, 0x2000);
        assert!(range.push(&page(0x5000, 12, RW)));
        assert!(!range.push(&page(0x6000, 12, IoPerm::READ)));
        assert_eq!(range.translation(), Some(Translation { phys: 0x5000, len: 0x1000 }));
    }

    #[test]
    fn contiguous_range_stops_at_page_size_change() {
        let mut range = ContiguousRange::new(0x1f_f000, 0x2000);
        assert!(range.push(&page(0x4000_0000, 21, RW)));
        assert!(!range.push(&page(0x4020_0000, 12, RW)));
        assert_eq!(range.translation(), Some(Translation { phys: 0x401f_f000, len: 0x1000 }));
    }

    #[test]
    fn empty_range_passes_through() {
        let range = ContiguousRange::new(0x3000, 0x40);
        assert_eq!(range.or_identity(), Translation::identity(0x3000, 0x40));
    }

    #[test]
    fn iotlb_answers_full_prefix_or_miss() {
        let mut iotlb = Iotlb::new(8);
        iotlb.insert(1, 0x1000, page(0x7000, 12, RW));
        iotlb.insert(1, 0x2000, page(0x8000, 12, RW));
        iotlb.insert(1, 0x3000, page(0x9000, 12, IoPerm::READ));

        assert!(matches!(
            lookup_iotlb(&mut iotlb, 1, 0x1000, 0x2000, IoPerm::READ),
            Cached::Hit(Translation { phys: 0x7000, len: 0x2000 })
        ));
        // The third page lacks write permission.
        assert_eq!(
            prefix(lookup_iotlb(&mut iotlb, 1, 0x1000, 0x3000, IoPerm::WRITE)),
            Some(Translation { phys: 0x7000, len: 0x2000 })
        );
        assert!(matches!(
            lookup_iotlb(&mut iotlb, 2, 0x1000, 0x10, IoPerm::READ),
            Cached::Miss
        ));
    }

    #[test]
    fn iotlb_discontinuity_is_a_hit() {
        let mut iotlb = Iotlb::new(8);
        iotlb.insert(1, 0x1000, page(0x7000, 12, IoPerm::READ));
        iotlb.insert(1, 0x2000, page(0x3000, 12, IoPerm::READ));
        assert!(matches!(
            lookup_iotlb(&mut iotlb, 1, 0x1800, 0x1000, IoPerm::READ),
            Cached::Hit(Translation { phys: 0x7800, len: 0x800 })
        ));
    }

    #[test]
    fn iotlb_stops_at_differing_permission() {
        let mut iotlb = Iotlb::new(8);
        iotlb.insert(1, 0x1000, page(0x7000, 12, RW));
        iotlb.insert(1, 0x2000, page(0x8000, 12, IoPerm::READ));
        assert!(matches!(
            lookup_iotlb(&mut iotlb, 1, 0x1000, 0x2000, IoPerm::READ),
            Cached::Hit(Translation { phys: 0x7000, len: 0x1000 })
        ));
    }

    #[test]
    fn iotlb_stops_at_differing_page_size() {
        let mut iotlb = Iotlb::new(8);
        iotlb.insert(1, 0x1f_f000, page(0x4000_0000, 21, RW));
        iotlb.insert(1, 0x20_0000, page(0x4020_0000, 12, RW));
        assert!(matches!(
            lookup_iotlb(&mut iotlb, 1, 0x1f_f000, 0x2000, IoPerm::READ),
            Cached::Hit(Translation { phys: 0x401f_f000, len: 0x1000 })
        ));
    }
}
