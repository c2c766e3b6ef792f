use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};

/// A page that is not yet fully written, buffered in memory.
///
/// Valid data occupies `valid_from..valid_to` within the page-sized buffer.
/// An entry exists only while the page's completeness bit is clear; the
/// moment the valid region covers the whole page the entry is promoted to
/// an aligned disk write and removed from the store.
#[derive(Debug)]
pub struct PartialPage {
    pub page: u64,
    pub valid_from: u32,
    pub valid_to: u32,
    buf: BytesMut,
}

impl PartialPage {
    fn new(page: u64, page_size: u32) -> Self {
        Self {
            page,
            valid_from: 0,
            valid_to: 0,
            buf: BytesMut::zeroed(page_size as usize),
        }
    }

    /// The buffered bytes from `valid_from` to `valid_to`.
    pub fn valid_bytes(&self) -> &[u8] {
        &self.buf[self.valid_from as usize..self.valid_to as usize]
    }

    /// Consumes the entry, returning the full page buffer.
    pub fn into_buffer(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Outcome of merging a fragment into the store.
#[derive(Debug, PartialEq, Eq)]
pub enum Merge {
    /// Fragment buffered; the page is still incomplete.
    Buffered,
    /// Fragment refused: it does not connect to the buffered region yet.
    Gap,
    /// The page is now fully buffered; the returned buffer must be written
    /// as one aligned page, after which the page bit may be set.
    Promoted(Bytes),
}

/// Ordered collection of partial pages, keyed by page index.
///
/// Normally holds at most one entry; more than one can exist transiently
/// while writes land out of order.
#[derive(Debug)]
pub struct PartialStore {
    pages: BTreeMap<u64, PartialPage>,
    page_size: u32,
}

impl PartialStore {
    pub fn new(page_size: u32) -> Self {
        Self {
            pages: BTreeMap::new(),
            page_size,
        }
    }

    /// Merges `data` into the partial page at `page`, starting `rel` bytes
    /// into the page. The fragment must fit inside one page. Growth must be
    /// contiguous: fragments that leave a hole on either side of the
    /// buffered region are refused with [`Merge::Gap`] and can be retried
    /// once the intervening bytes arrive.
    ///
    /// The caller is responsible for skipping pages whose bit is already
    /// set; buffered data never overwrites durable pages.
    pub fn merge(&mut self, page: u64, rel: u32, data: &[u8]) -> Merge {
        let len = data.len() as u32;
        assert!(
            rel + len <= self.page_size,
            "fragment [{rel}, {}) exceeds page size {}",
            rel + len,
            self.page_size
        );
        if len == 0 {
            return Merge::Buffered;
        }

        let page_size = self.page_size;
        let entry = self.pages.entry(page).or_insert_with(|| {
            let mut p = PartialPage::new(page, page_size);
            p.valid_from = rel;
            p.valid_to = rel;
            p
        });

        if rel > entry.valid_to {
            // Hole after the buffered tail.
            return Merge::Gap;
        }
        if rel < entry.valid_from && rel + len < entry.valid_from {
            // Prepend that does not reach the buffered region.
            return Merge::Gap;
        }

        entry.buf[rel as usize..(rel + len) as usize].copy_from_slice(data);
        entry.valid_from = entry.valid_from.min(rel);
        entry.valid_to = entry.valid_to.max(rel + len);

        if entry.valid_from == 0 && entry.valid_to == self.page_size {
            let full = self.pages.remove(&page).expect("entry just merged");
            Merge::Promoted(full.into_buffer())
        } else {
            Merge::Buffered
        }
    }

    pub fn get(&self, page: u64) -> Option<&PartialPage> {
        self.pages.get(&page)
    }

    /// Removes and returns the entry for `page`, if any.
    pub fn take(&mut self, page: u64) -> Option<PartialPage> {
        self.pages.remove(&page)
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PartialPage> {
        self.pages.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_and_promote() {
        let mut store = PartialStore::new(8);
        assert_eq!(store.merge(0, 0, &[1, 2, 3, 4]), Merge::Buffered);
        match store.merge(0, 4, &[5, 6, 7, 8]) {
            Merge::Promoted(buf) => assert_eq!(buf.as_ref(), &[1, 2, 3, 4, 5, 6, 7, 8]),
            other => panic!("expected promotion, got {other:?}"),
        }
        assert!(store.is_empty());
    }

    #[test]
    fn test_trailing_then_leading() {
        let mut store = PartialStore::new(8);
        // Bytes land mid-page first, then the start of the page arrives.
        assert_eq!(store.merge(1, 2, &[9, 9]), Merge::Buffered);
        assert_eq!(store.merge(1, 0, &[7, 7]), Merge::Buffered);
        let p = store.get(1).unwrap();
        assert_eq!(p.valid_from, 0);
        assert_eq!(p.valid_to, 4);
        assert_eq!(p.valid_bytes(), &[7, 7, 9, 9]);
    }

    #[test]
    fn test_gap_after_tail() {
        let mut store = PartialStore::new(8);
        assert_eq!(store.merge(0, 0, &[1, 2]), Merge::Buffered);
        assert_eq!(store.merge(0, 4, &[5, 6]), Merge::Gap);
        // Refused data is not buffered.
        assert_eq!(store.get(0).unwrap().valid_to, 2);
    }

    #[test]
    fn test_prepend_that_does_not_meet() {
        let mut store = PartialStore::new(8);
        assert_eq!(store.merge(0, 4, &[5, 6]), Merge::Buffered);
        assert_eq!(store.merge(0, 0, &[1, 2]), Merge::Gap);
        assert_eq!(store.merge(0, 0, &[1, 2, 3, 4]), Merge::Buffered);
        let p = store.get(0).unwrap();
        assert_eq!(p.valid_from, 0);
        assert_eq!(p.valid_to, 6);
    }

    #[test]
    fn test_overlap_rewrite() {
        let mut store = PartialStore::new(8);
        assert_eq!(store.merge(0, 0, &[1, 2, 3]), Merge::Buffered);
        assert_eq!(store.merge(0, 2, &[9, 9]), Merge::Buffered);
        assert_eq!(store.get(0).unwrap().valid_bytes(), &[1, 2, 9, 9]);
    }

    #[test]
    fn test_take() {
        let mut store = PartialStore::new(8);
        store.merge(3, 0, &[1]);
        let p = store.take(3).unwrap();
        assert_eq!(p.page, 3);
        assert!(store.is_empty());
        assert!(store.take(3).is_none());
    }
}
