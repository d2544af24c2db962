//! Page-granular in-memory guest physical address space.
//!
//! [`SparseMemory`] backs only the pages that were explicitly mapped; an
//! access touching any unmapped page fails as a whole without partial effect.
//! It is meant for embedders that emulate small guests and for exercising the
//! engine's hardware-error paths.

use std::collections::BTreeMap;

use amdvi_format::{PAGE_OFFSET_MASK, PAGE_SHIFT, PAGE_SIZE};
use parking_lot::RwLock;

use crate::platform::{GuestMemory, MemoryError, MemoryOp};

type Page = Box<[u8; PAGE_SIZE as usize]>;

/// Sparse guest physical memory.
#[derive(Debug, Default)]
pub struct SparseMemory {
    pages: RwLock<BTreeMap<u64, Page>>,
}

impl SparseMemory {
    /// Creates an empty address space.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Backs every page overlapping `[addr, addr + len)` with zeroed memory.
    ///
    /// Pages that are already mapped keep their contents.
    pub fn map(&self, addr: u64, len: u64) {
        let mut pages = self.pages.write();
        for pfn in page_frames(addr, len) {
            pages
                .entry(pfn)
                .or_insert_with(|| Box::new([0u8; PAGE_SIZE as usize]));
        }
    }

    /// Removes the backing of every page overlapping `[addr, addr + len)`.
    pub fn unmap(&self, addr: u64, len: u64) {
        let mut pages = self.pages.write();
        for pfn in page_frames(addr, len) {
            pages.remove(&pfn);
        }
    }

    /// Whether every byte of `[addr, addr + len)` is backed.
    #[must_use]
    pub fn is_mapped(&self, addr: u64, len: u64) -> bool {
        let pages = self.pages.read();
        page_frames(addr, len).all(|pfn| pages.contains_key(&pfn))
    }

    /// Number of mapped pages.
    #[must_use]
    pub fn mapped_pages(&self) -> usize {
        self.pages.read().len()
    }
}

/// Page frame numbers overlapping `[addr, addr + len)`.
fn page_frames(addr: u64, len: u64) -> impl Iterator<Item = u64> {
    let first = addr >> PAGE_SHIFT;
    let last = if len == 0 {
        first
    } else {
        addr.saturating_add(len - 1) >> PAGE_SHIFT
    };
    let count = if len == 0 { 0 } else { last - first + 1 };
    (0..count).map(move |i| first + i)
}

impl GuestMemory for SparseMemory {
    fn read_phys(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        let err = MemoryError {
            op: MemoryOp::Read,
            addr,
            len: buf.len(),
        };
        let pages = self.pages.read();
        if !page_frames(addr, buf.len() as u64).all(|pfn| pages.contains_key(&pfn)) {
            return Err(err);
        }
        let mut cur = addr;
        let mut done = 0;
        while done < buf.len() {
            let page = pages.get(&(cur >> PAGE_SHIFT)).ok_or(err)?;
            let off = (cur & PAGE_OFFSET_MASK) as usize;
            let n = (buf.len() - done).min(page.len() - off);
            buf[done..done + n].copy_from_slice(&page[off..off + n]);
            done += n;
            cur += n as u64;
        }
        Ok(())
    }

    fn write_phys(&self, addr: u64, buf: &[u8]) -> Result<(), MemoryError> {
        let err = MemoryError {
            op: MemoryOp::Write,
            addr,
            len: buf.len(),
        };
        let mut pages = self.pages.write();
        if !page_frames(addr, buf.len() as u64).all(|pfn| pages.contains_key(&pfn)) {
            return Err(err);
        }
        let mut cur = addr;
        let mut done = 0;
        while done < buf.len() {
            let page = pages.get_mut(&(cur >> PAGE_SHIFT)).ok_or(err)?;
            let off = (cur & PAGE_OFFSET_MASK) as usize;
            let n = (buf.len() - done).min(page.len() - off);
            page[off..off + n].copy_from_slice(&buf[done..done + n]);
            done += n;
            cur += n as u64;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmapped_access_fails() {
        let mem = SparseMemory::new();
        let mut buf = [0u8; 4];
        let err = mem.read_phys(0x1000, &mut buf).unwrap_err();
        assert_eq!(err.op, MemoryOp::Read);
        assert_eq!(err.addr, 0x1000);
        assert!(mem.write_phys(0x1000, &buf).is_err());
    }

    #[test]
    fn access_spanning_pages() {
        let mem = SparseMemory::new();
        mem.map(0x1000, 0x2000);
        assert_eq!(mem.mapped_pages(), 2);
        let data: Vec<u8> = (0..16).collect();
        mem.write_phys(0x1ff8, &data).unwrap();
        let mut back = [0u8; 16];
        mem.read_phys(0x1ff8, &mut back).unwrap();
        assert_eq!(&back[..], &data[..]);
        assert_eq!(mem.read_int::<u64>(0x2000).unwrap(), 0x0f0e_0d0c_0b0a_0908);
    }

    #[test]
    fn partially_mapped_write_has_no_effect() {
        let mem = SparseMemory::new();
        mem.map(0x1000, 0x1000);
        assert!(mem.write_phys(0x1ffc, &[0xff; 8]).is_err());
        assert_eq!(mem.read_int::<u32>(0x1ffc).unwrap(), 0);
    }

    #[test]
    fn unmap_removes_backing() {
        let mem = SparseMemory::new();
        mem.map(0x4000, 0x3000);
        mem.unmap(0x5000, 1);
        assert!(mem.is_mapped(0x4000, 0x1000));
        assert!(!mem.is_mapped(0x4000, 0x2000));
        assert!(mem.is_mapped(0x6000, 0x1000));
    }
}
