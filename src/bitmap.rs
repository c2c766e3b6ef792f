use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::MetaError;

/// A growable bitmap tracking which pages of the logical file are durable.
///
/// Each bit records whether a page has been fully written to disk (1) or
/// not (0). Bits are numbered from the high bit of the first byte. The map
/// grows on demand as higher page indices are set.
#[derive(Debug, Clone, Default)]
pub struct PageBitmap {
    bits: Vec<u8>,
    highest_set: Option<u64>,
}

impl PageBitmap {
    /// Creates an empty bitmap.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the page at `index` as complete, growing the map if needed.
    pub fn set(&mut self, index: u64) {
        let byte = (index / 8) as usize;
        if byte >= self.bits.len() {
            self.bits.resize(byte + 1, 0);
        }
        self.bits[byte] |= 1 << (7 - (index % 8));
        self.highest_set = Some(self.highest_set.map_or(index, |h| h.max(index)));
    }

    /// Returns true if the page at `index` is complete.
    pub fn test(&self, index: u64) -> bool {
        let byte = (index / 8) as usize;
        if byte >= self.bits.len() {
            return false;
        }
        (self.bits[byte] >> (7 - (index % 8))) & 1 == 1
    }

    /// Clears the bit for the page at `index`.
    pub fn clear(&mut self, index: u64) {
        let byte = (index / 8) as usize;
        if byte < self.bits.len() {
            self.bits[byte] &= !(1 << (7 - (index % 8)));
        }
        if self.highest_set == Some(index) {
            self.highest_set = (0..index).rev().find(|&i| self.test(i));
        }
    }

    /// Clears every bit.
    pub fn clear_all(&mut self) {
        self.bits.clear();
        self.highest_set = None;
    }

    /// Returns true if every page in `first..=last` is complete.
    pub fn range_complete(&self, first: u64, last: u64) -> bool {
        (first..=last).all(|i| self.test(i))
    }

    /// Finds the first run of consecutive complete pages within
    /// `first..=last`, returned as an inclusive index pair.
    pub fn complete_run(&self, first: u64, last: u64) -> Option<(u64, u64)> {
        let start = (first..=last).find(|&i| self.test(i))?;
        let mut end = start;
        while end < last && self.test(end + 1) {
            end += 1;
        }
        Some((start, end))
    }

    /// Highest page index that was ever set, if any.
    pub fn highest_set(&self) -> Option<u64> {
        self.highest_set
    }

    /// Number of complete pages.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Number of complete pages within `first..=last`.
    pub fn count_range(&self, first: u64, last: u64) -> usize {
        (first..=last).filter(|&i| self.test(i)).count()
    }

    /// Serializes the bitmap for the metadata file.
    pub fn pack(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + self.bits.len());
        buf.put_u64_le(self.bits.len() as u64 * 8);
        buf.put_slice(&self.bits);
        buf.freeze()
    }

    /// Rebuilds a bitmap from its serialized form.
    pub fn unpack(mut data: Bytes) -> Result<Self, MetaError> {
        if data.len() < 8 {
            return Err(MetaError::Truncated {
                need: 8,
                have: data.len(),
            });
        }
        let bit_len = data.get_u64_le();
        let byte_len = (bit_len as usize).div_ceil(8);
        if data.len() < byte_len {
            return Err(MetaError::Truncated {
                need: byte_len,
                have: data.len(),
            });
        }
        let bits = data[..byte_len].to_vec();
        let mut map = Self {
            bits,
            highest_set: None,
        };
        map.highest_set = (0..bit_len).rev().find(|&i| map.test(i));
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_test() {
        let mut map = PageBitmap::new();
        assert!(!map.test(0));
        map.set(0);
        map.set(9);
        assert!(map.test(0));
        assert!(map.test(9));
        assert!(!map.test(1));
        assert_eq!(map.count(), 2);
        assert_eq!(map.highest_set(), Some(9));
    }

    #[test]
    fn test_clear() {
        let mut map = PageBitmap::new();
        map.set(3);
        map.set(7);
        map.clear(7);
        assert!(!map.test(7));
        assert_eq!(map.highest_set(), Some(3));
        map.clear_all();
        assert_eq!(map.count(), 0);
        assert_eq!(map.highest_set(), None);
    }

    #[test]
    fn test_range_complete() {
        let mut map = PageBitmap::new();
        for i in 2..=5 {
            map.set(i);
        }
        assert!(map.range_complete(2, 5));
        assert!(!map.range_complete(1, 5));
        assert!(!map.range_complete(2, 6));
    }

    #[test]
    fn test_complete_run() {
        let mut map = PageBitmap::new();
        map.set(1);
        map.set(2);
        map.set(3);
        map.set(6);
        assert_eq!(map.complete_run(0, 10), Some((1, 3)));
        assert_eq!(map.complete_run(4, 10), Some((6, 6)));
        assert_eq!(map.complete_run(4, 5), None);
    }

    #[test]
    fn test_pack_round_trip() {
        let mut map = PageBitmap::new();
        map.set(0);
        map.set(13);
        map.set(100);
        let packed = map.pack();
        let restored = PageBitmap::unpack(packed).unwrap();
        for i in 0..=110 {
            assert_eq!(map.test(i), restored.test(i), "bit {i}");
        }
        assert_eq!(restored.highest_set(), Some(100));
    }

    #[test]
    fn test_unpack_truncated() {
        assert!(PageBitmap::unpack(Bytes::from_static(&[1, 2])).is_err());
    }
}
