//! Little-endian integer access on byte slices.
//!
//! All IOMMU structures are little-endian. Reads are bounds-checked and return
//! `None` instead of panicking when the slice is too short.

/// An integer that can be read from and written to a little-endian byte slice.
pub trait LeInt: Sized + Copy {
    /// Encoded size in bytes.
    const SIZE: usize;

    /// Reads a value at byte offset `off`, or `None` if out of bounds.
    fn read_at(data: &[u8], off: usize) -> Option<Self>;

    /// Writes the value at byte offset `off`. Returns `false` if out of bounds.
    fn write_at(self, data: &mut [u8], off: usize) -> bool;
}

macro_rules! impl_le_int {
    ($($ty:ty),* $(,)?) => {
        $(
            impl LeInt for $ty {
                const SIZE: usize = core::mem::size_of::<$ty>();

                #[inline]
                fn read_at(data: &[u8], off: usize) -> Option<Self> {
                    let end = off.checked_add(Self::SIZE)?;
                    let raw = data.get(off..end)?;
                    let mut buf = [0u8; core::mem::size_of::<$ty>()];
                    buf.copy_from_slice(raw);
                    Some(<$ty>::from_le_bytes(buf))
                }

                #[inline]
                fn write_at(self, data: &mut [u8], off: usize) -> bool {
                    let Some(end) = off.checked_add(Self::SIZE) else {
                        return false;
                    };
                    match data.get_mut(off..end) {
                        Some(dst) => {
                            dst.copy_from_slice(&self.to_le_bytes());
                            true
                        }
                        None => false,
                    }
                }
            }
        )*
    };
}

impl_le_int!(u16, u32, u64);

/// Reads `N` consecutive `u64` words starting at byte offset `off`.
#[must_use]
pub fn read_qwords<const N: usize>(data: &[u8], off: usize) -> Option<[u64; N]> {
    let mut out = [0u64; N];
    for (i, word) in out.iter_mut().enumerate() {
        *word = u64::read_at(data, off.checked_add(i * 8)?)?;
    }
    Some(out)
}

/// Encodes `N` `u64` words into a little-endian byte array of `M` bytes.
///
/// `M` must equal `N * 8`; extra words or bytes are ignored.
#[must_use]
pub fn qwords_to_bytes<const N: usize, const M: usize>(words: &[u64; N]) -> [u8; M] {
    let mut out = [0u8; M];
    for (i, word) in words.iter().enumerate() {
        let _ = word.write_at(&mut out, i * 8);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_at_is_little_endian() {
        let data = [0x78, 0x56, 0x34, 0x12, 0xff];
        assert_eq!(u32::read_at(&data, 0), Some(0x1234_5678));
        assert_eq!(u16::read_at(&data, 3), Some(0xff12));
    }

    #[test]
    fn read_at_out_of_bounds_is_none() {
        let data = [0u8; 7];
        assert_eq!(u64::read_at(&data, 0), None);
        assert_eq!(u16::read_at(&data, 6), None);
        assert_eq!(u16::read_at(&data, usize::MAX), None);
    }

    #[test]
    fn write_at_rejects_short_slice() {
        let mut data = [0u8; 4];
        assert!(!0xdead_beef_u64.write_at(&mut data, 0));
        assert!(0xbeef_u16.write_at(&mut data, 2));
        assert_eq!(data, [0, 0, 0xef, 0xbe]);
    }

    #[test]
    fn qwords_round_trip_through_bytes() {
        let words = [0x0123_4567_89ab_cdef_u64, 0xfedc_ba98_7654_3210];
        let bytes: [u8; 16] = qwords_to_bytes(&words);
        assert_eq!(bytes[0], 0xef);
        assert_eq!(read_qwords::<2>(&bytes, 0), Some(words));
    }
}
