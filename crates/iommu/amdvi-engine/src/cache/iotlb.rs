//! I/O translation lookaside buffer.
//!
//! Entries come from a pool allocated up front and are never freed, only
//! recycled. Each claimed entry sits on a recency list (an index-linked list
//! over the pool, LRU at the head) and, while it maps something, in an ordered
//! index keyed by `(domain, IOVA page)`.
//!
//! Domain invalidation cannot unlink entries while walking the index, so it
//! marks them evict-pending instead. Evict-pending entries stay indexed and
//! keep their pool slot, but lookups treat them as misses, and they sit at the
//! LRU end so they are the next to be recycled.

use std::collections::BTreeMap;

use amdvi_format::pte::page_offset_mask;
use amdvi_format::{IoPerm, PAGE_SHIFT};

/// Bits of the IOVA page number kept in the key.
const KEY_IOVA_MASK: u64 = 0xff_ffff_ffff;
/// Shift of the domain id within the key.
const KEY_DOMAIN_SHIFT: u32 = 40;
/// IOVA bits the key can represent; higher addresses are never cached.
const KEY_IOVA_BITS: u8 = PAGE_SHIFT + 40;

/// The result of resolving one IOVA page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLookup {
    /// System physical base of the page, aligned to its own size.
    pub phys: u64,
    /// Page size as a shift (12 for 4 KiB).
    pub shift: u8,
    /// Permissions granted by the whole walk.
    pub perm: IoPerm,
}

impl PageLookup {
    /// System physical address of `iova` within this page.
    #[must_use]
    pub fn phys_for(&self, iova: u64) -> u64 {
        let mask = page_offset_mask(self.shift);
        (self.phys & !mask) | (iova & mask)
    }
}

/// Whether `iova` fits in an IOTLB key without aliasing another page.
#[must_use]
pub fn is_cacheable(iova: u64) -> bool {
    iova >> KEY_IOVA_BITS == 0
}

/// Packs a domain id and IOVA into an IOTLB key.
#[must_use]
pub fn iotlb_key(domain_id: u16, iova: u64) -> u64 {
    (u64::from(domain_id) << KEY_DOMAIN_SHIFT) | ((iova >> PAGE_SHIFT) & KEY_IOVA_MASK)
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    key: u64,
    page: PageLookup,
    evict_pending: bool,
    indexed: bool,
    prev: Option<usize>,
    next: Option<usize>,
}

impl Slot {
    const EMPTY: Self = Self {
        key: 0,
        page: PageLookup {
            phys: 0,
            shift: PAGE_SHIFT,
            perm: IoPerm::empty(),
        },
        evict_pending: false,
        indexed: false,
        prev: None,
        next: None,
    };
}

/// IOTLB with LRU recycling.
#[derive(Debug)]
pub struct Iotlb {
    slots: Box<[Slot]>,
    /// Number of pool slots handed out so far.
    claimed: usize,
    index: BTreeMap<u64, usize>,
    /// Least recently used end.
    lru: Option<usize>,
    /// Most recently used end.
    mru: Option<usize>,
}

impl Iotlb {
    /// Creates an IOTLB with a pool of `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![Slot::EMPTY; capacity].into_boxed_slice(),
            claimed: 0,
            index: BTreeMap::new(),
            lru: None,
            mru: None,
        }
    }

    /// Pool size.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of indexed entries, evict-pending ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether nothing is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    // -----------------------------------------------------------------------
    // Recency list
    // -----------------------------------------------------------------------

    fn unlink(&mut self, idx: usize) {
        let Slot { prev, next, .. } = self.slots[idx];
        match prev {
            Some(p) => self.slots[p].next = next,
            None => self.lru = next,
        }
        match next {
            Some(n) => self.slots[n].prev = prev,
            None => self.mru = prev,
        }
        self.slots[idx].prev = None;
        self.slots[idx].next = None;
    }

    fn push_mru(&mut self, idx: usize) {
        self.slots[idx].prev = self.mru;
        self.slots[idx].next = None;
        match self.mru {
            Some(m) => self.slots[m].next = Some(idx),
            None => self.lru = Some(idx),
        }
        self.mru = Some(idx);
    }

    fn push_lru(&mut self, idx: usize) {
        self.slots[idx].next = self.lru;
        self.slots[idx].prev = None;
        match self.lru {
            Some(l) => self.slots[l].prev = Some(idx),
            None => self.mru = Some(idx),
        }
        self.lru = Some(idx);
    }

    fn move_to_mru(&mut self, idx: usize) {
        if self.mru != Some(idx) {
            self.unlink(idx);
            self.push_mru(idx);
        }
    }

    fn move_to_lru(&mut self, idx: usize) {
        if self.lru != Some(idx) {
            self.unlink(idx);
            self.push_lru(idx);
        }
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Looks up the page containing `iova` in `domain_id`.
    ///
    /// A hit becomes most recently used. Evict-pending entries miss, and so
    /// does any IOVA above the key range.
    pub fn lookup(&mut self, domain_id: u16, iova: u64) -> Option<PageLookup> {
        if !is_cacheable(iova) {
            return None;
        }
        let idx = *self.index.get(&iotlb_key(domain_id, iova))?;
        if self.slots[idx].evict_pending {
            return None;
        }
        self.move_to_mru(idx);
        Some(self.slots[idx].page)
    }

    /// Caches the translation of the page containing `iova`.
    ///
    /// An existing entry for the key is refreshed in place. Otherwise an
    /// unclaimed pool entry is used, or the least recently used entry is
    /// recycled. IOVAs above the key range are not cached.
    pub fn insert(&mut self, domain_id: u16, iova: u64, page: PageLookup) {
        if self.slots.is_empty() || !is_cacheable(iova) {
            return;
        }
        let key = iotlb_key(domain_id, iova);
        if let Some(&idx) = self.index.get(&key) {
            let slot = &mut self.slots[idx];
            slot.page = page;
            slot.evict_pending = false;
            self.move_to_mru(idx);
            return;
        }

        let idx = if self.claimed < self.slots.len() {
            let idx = self.claimed;
            self.claimed += 1;
            idx
        } else {
            let Some(idx) = self.lru else {
                return;
            };
            if self.slots[idx].indexed {
                self.index.remove(&self.slots[idx].key);
            }
            self.unlink(idx);
            idx
        };

        let slot = &mut self.slots[idx];
        slot.key = key;
        slot.page = page;
        slot.evict_pending = false;
        slot.indexed = true;
        self.index.insert(key, idx);
        self.push_mru(idx);
    }

    /// Removes entries for every page of `[iova, iova + len)` in `domain_id`.
    ///
    /// Removed entries move to the LRU end for early reuse.
    pub fn remove_range(&mut self, domain_id: u16, iova: u64, len: u64) {
        if len == 0 {
            return;
        }
        let end = iova.saturating_add(len - 1);
        let mut first = iotlb_key(domain_id, iova);
        let mut last = iotlb_key(domain_id, end);
        // Ranges wider than the key space (or wrapping it) cover the domain.
        if (end >> PAGE_SHIFT) - (iova >> PAGE_SHIFT) >= KEY_IOVA_MASK || last < first {
            first = iotlb_key(domain_id, 0);
            last = first | KEY_IOVA_MASK;
        }
        let victims: Vec<(u64, usize)> = self
            .index
            .range(first..=last)
            .map(|(&k, &i)| (k, i))
            .collect();
        for (key, idx) in victims {
            self.index.remove(&key);
            self.slots[idx].indexed = false;
            self.slots[idx].evict_pending = false;
            self.move_to_lru(idx);
        }
    }

    /// Marks every entry of `domain_id` evict-pending.
    ///
    /// Entries stay indexed (so [`Iotlb::len`] is unchanged) until recycled.
    pub fn remove_domain(&mut self, domain_id: u16) {
        let first = u64::from(domain_id) << KEY_DOMAIN_SHIFT;
        let last = first | KEY_IOVA_MASK;
        let victims: Vec<usize> = self.index.range(first..=last).map(|(_, &i)| i).collect();
        for idx in victims {
            self.slots[idx].evict_pending = true;
            self.move_to_lru(idx);
        }
    }

    /// Drops every entry and returns the whole pool.
    pub fn remove_all(&mut self) {
        self.index.clear();
        self.slots.fill(Slot::EMPTY);
        self.claimed = 0;
        self.lru = None;
        self.mru = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(phys: u64) -> PageLookup {
        PageLookup {
            phys,
            shift: 12,
            perm: IoPerm::READ | IoPerm::WRITE,
        }
    }

    #[test]
    fn key_packs_domain_and_page() {
        assert_eq!(iotlb_key(0x1234, 0x5678_9abc), 0x1234_0000_0005_6789);
        assert_eq!(iotlb_key(1, u64::MAX), (1 << 40) | 0xff_ffff_ffff);
    }

    #[test]
    fn phys_for_masks_with_entry_size() {
        let large = PageLookup {
            phys: 0x4020_0000,
            shift: 21,
            perm: IoPerm::READ,
        };
        assert_eq!(large.phys_for(0x1234_5678), 0x4025_5678);
        assert_eq!(page(0x9000).phys_for(0x1_2345), 0x9345);
    }

    #[test]
    fn insert_and_lookup() {
        let mut tlb = Iotlb::new(4);
        tlb.insert(1, 0x1000, page(0xa000));
        assert_eq!(tlb.lookup(1, 0x1fff), Some(page(0xa000)));
        assert_eq!(tlb.lookup(2, 0x1000), None);
        assert_eq!(tlb.lookup(1, 0x2000), None);
    }

    #[test]
    fn addresses_above_key_range_are_not_cached() {
        let mut tlb = Iotlb::new(4);
        tlb.insert(1, 0, page(0xa000));
        tlb.insert(1, 1 << 52, page(0xb000));
        assert_eq!(tlb.len(), 1);
        assert_eq!(tlb.lookup(1, 1 << 52), None);
        assert_eq!(tlb.lookup(1, 0), Some(page(0xa000)));
        assert!(is_cacheable((1 << 52) - 1));
        assert!(!is_cacheable(u64::MAX));
    }

    #[test]
    fn reinsert_updates_in_place() {
        let mut tlb = Iotlb::new(4);
        tlb.insert(1, 0x1000, page(0xa000));
        tlb.insert(1, 0x1000, page(0xb000));
        assert_eq!(tlb.len(), 1);
        assert_eq!(tlb.lookup(1, 0x1000), Some(page(0xb000)));
    }

    #[test]
    fn eviction_recycles_least_recently_used() {
        let mut tlb = Iotlb::new(3);
        for i in 0..3u64 {
            tlb.insert(1, i << 12, page(0x10_0000 + (i << 12)));
        }
        // Touch page 0 so page 1 becomes the LRU entry.
        assert!(tlb.lookup(1, 0).is_some());
        tlb.insert(1, 3 << 12, page(0x20_0000));
        assert_eq!(tlb.len(), 3);
        assert!(tlb.lookup(1, 1 << 12).is_none());
        assert!(tlb.lookup(1, 0).is_some());
        assert!(tlb.lookup(1, 2 << 12).is_some());
        assert_eq!(tlb.lookup(1, 3 << 12), Some(page(0x20_0000)));
    }

    #[test]
    fn remove_range_unindexes_pages() {
        let mut tlb = Iotlb::new(8);
        for i in 0..4u64 {
            tlb.insert(1, i << 12, page(i << 12));
        }
        tlb.insert(2, 1 << 12, page(0));
        tlb.remove_range(1, 0x1000, 0x2000);
        assert_eq!(tlb.len(), 3);
        assert!(tlb.lookup(1, 0).is_some());
        assert!(tlb.lookup(1, 0x1000).is_none());
        assert!(tlb.lookup(1, 0x2000).is_none());
        assert!(tlb.lookup(1, 0x3000).is_some());
        assert!(tlb.lookup(2, 0x1000).is_some());
    }

    #[test]
    fn removed_entries_are_recycled_first() {
        let mut tlb = Iotlb::new(2);
        tlb.insert(1, 0x1000, page(0x1000));
        tlb.insert(1, 0x2000, page(0x2000));
        tlb.remove_range(1, 0x2000, 0x1000);
        tlb.insert(1, 0x3000, page(0x3000));
        // The MRU-but-removed slot was reused instead of evicting 0x1000.
        assert!(tlb.lookup(1, 0x1000).is_some());
        assert!(tlb.lookup(1, 0x3000).is_some());
    }

    #[test]
    fn remove_domain_is_lazy() {
        let mut tlb = Iotlb::new(4);
        tlb.insert(1, 0x1000, page(0x1000));
        tlb.insert(1, 0x2000, page(0x2000));
        tlb.insert(2, 0x1000, page(0x9000));
        tlb.remove_domain(1);
        assert!(tlb.lookup(1, 0x1000).is_none());
        assert!(tlb.lookup(1, 0x2000).is_none());
        assert!(tlb.lookup(2, 0x1000).is_some());
        assert_eq!(tlb.len(), 3);

        // Re-inserting a pending key revives it in place.
        tlb.insert(1, 0x1000, page(0x5000));
        assert_eq!(tlb.lookup(1, 0x1000), Some(page(0x5000)));
        assert_eq!(tlb.len(), 3);
    }

    #[test]
    fn pending_entries_are_recycled_before_live_ones() {
        let mut tlb = Iotlb::new(3);
        tlb.insert(2, 0x1000, page(0x1000));
        tlb.insert(1, 0x1000, page(0x2000));
        tlb.insert(1, 0x2000, page(0x3000));
        tlb.remove_domain(1);
        tlb.insert(3, 0x1000, page(0x4000));
        tlb.insert(3, 0x2000, page(0x5000));
        assert_eq!(tlb.len(), 3);
        assert!(tlb.lookup(2, 0x1000).is_some());
        assert!(tlb.lookup(3, 0x1000).is_some());
        assert!(tlb.lookup(3, 0x2000).is_some());
    }

    #[test]
    fn remove_range_clamps_huge_lengths() {
        let mut tlb = Iotlb::new(4);
        tlb.insert(1, 0xffff_f000, page(0));
        tlb.insert(2, 0, page(0));
        tlb.remove_range(1, 0, u64::MAX);
        assert!(tlb.lookup(1, 0xffff_f000).is_none());
        assert!(tlb.lookup(2, 0).is_some());
    }

    #[test]
    fn remove_all_resets_pool() {
        let mut tlb = Iotlb::new(2);
        tlb.insert(1, 0x1000, page(0x1000));
        tlb.insert(1, 0x2000, page(0x2000));
        tlb.remove_all();
        assert!(tlb.is_empty());
        tlb.insert(1, 0x3000, page(0x3000));
        tlb.insert(1, 0x4000, page(0x4000));
        assert_eq!(tlb.len(), 2);
    }

    #[test]
    fn zero_capacity_never_caches() {
        let mut tlb = Iotlb::new(0);
        tlb.insert(1, 0, page(0));
        assert!(tlb.lookup(1, 0).is_none());
    }
}
