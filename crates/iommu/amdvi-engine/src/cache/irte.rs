//! Interrupt remapping entry cache.
//!
//! Same linear-scan layout as the DTE cache, keyed by the device id and the
//! byte offset of the entry within that device's table.

use amdvi_format::InterruptRemapEntry;

/// Key value marking a free slot.
const KEY_NIL: u32 = u32::MAX;

/// Packs a device id and table byte offset into an IRTE cache key.
#[must_use]
pub fn irte_key(device_id: u16, offset: u16) -> u32 {
    (u32::from(device_id) << 16) | u32::from(offset)
}

/// Returned when an entry cannot be cached because every slot is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrteCacheFull;

/// Fixed-capacity IRTE cache.
#[derive(Debug)]
pub struct IrteCache {
    keys: Box<[u32]>,
    entries: Box<[InterruptRemapEntry]>,
}

impl IrteCache {
    /// Creates an empty cache with `capacity` slots.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            keys: vec![KEY_NIL; capacity].into_boxed_slice(),
            entries: vec![InterruptRemapEntry::default(); capacity].into_boxed_slice(),
        }
    }

    /// Returns the cached entry for `(device_id, offset)`.
    #[must_use]
    pub fn lookup(&self, device_id: u16, offset: u16) -> Option<InterruptRemapEntry> {
        let key = irte_key(device_id, offset);
        self.keys
            .iter()
            .position(|&k| k == key)
            .map(|idx| self.entries[idx])
    }

    /// Caches `irte` for `(device_id, offset)`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns [`IrteCacheFull`] if the key is absent and no slot is free.
    pub fn insert_or_update(
        &mut self,
        device_id: u16,
        offset: u16,
        irte: InterruptRemapEntry,
    ) -> Result<(), IrteCacheFull> {
        let key = irte_key(device_id, offset);
        let idx = self
            .keys
            .iter()
            .position(|&k| k == key)
            .or_else(|| self.keys.iter().position(|&k| k == KEY_NIL))
            .ok_or(IrteCacheFull)?;
        self.keys[idx] = key;
        self.entries[idx] = irte;
        Ok(())
    }

    /// Drops every entry belonging to `device_id`.
    pub fn remove_device(&mut self, device_id: u16) {
        for (key, entry) in self.keys.iter_mut().zip(self.entries.iter_mut()) {
            if *key != KEY_NIL && (*key >> 16) as u16 == device_id {
                *key = KEY_NIL;
                *entry = InterruptRemapEntry::default();
            }
        }
    }

    /// Drops every entry.
    pub fn remove_all(&mut self) {
        self.keys.fill(KEY_NIL);
        self.entries.fill(InterruptRemapEntry::default());
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.iter().filter(|&&k| k != KEY_NIL).count()
    }

    /// Whether nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn irte(vector: u8) -> InterruptRemapEntry {
        InterruptRemapEntry::remapped(1, vector, 0, false)
    }

    #[test]
    fn key_layout() {
        assert_eq!(irte_key(0x1234, 0x0010), 0x1234_0010);
    }

    #[test]
    fn insert_lookup_update() {
        let mut cache = IrteCache::new(2);
        cache.insert_or_update(0x10, 4, irte(0x20)).unwrap();
        assert_eq!(cache.lookup(0x10, 4), Some(irte(0x20)));
        assert_eq!(cache.lookup(0x10, 8), None);
        cache.insert_or_update(0x10, 4, irte(0x21)).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup(0x10, 4), Some(irte(0x21)));
    }

    #[test]
    fn full_cache_reports_distinct_error() {
        let mut cache = IrteCache::new(1);
        cache.insert_or_update(0x10, 0, irte(1)).unwrap();
        assert_eq!(cache.insert_or_update(0x11, 0, irte(2)), Err(IrteCacheFull));
        // Updating an existing key still works when full.
        assert_eq!(cache.insert_or_update(0x10, 0, irte(3)), Ok(()));
    }

    #[test]
    fn remove_device_clears_all_offsets() {
        let mut cache = IrteCache::new(4);
        cache.insert_or_update(0x10, 0, irte(1)).unwrap();
        cache.insert_or_update(0x10, 4, irte(2)).unwrap();
        cache.insert_or_update(0x11, 0, irte(3)).unwrap();
        cache.remove_device(0x10);
        assert_eq!(cache.len(), 1);
        assert!(cache.lookup(0x10, 0).is_none());
        assert!(cache.lookup(0x10, 4).is_none());
        assert!(cache.lookup(0x11, 0).is_some());
        cache.remove_all();
        assert!(cache.is_empty());
    }

    #[test]
    fn device_zero_offset_zero_is_cacheable() {
        let mut cache = IrteCache::new(1);
        cache.insert_or_update(0, 0, irte(9)).unwrap();
        assert_eq!(cache.lookup(0, 0), Some(irte(9)));
    }
}
