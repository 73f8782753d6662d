// vim: tw=80

use crate::types::*;

/// A cursor over the bytes of an `SGList`.
///
/// Yields reference-counted slices without copying.  A slice returned by
/// `next` never crosses an iovec boundary, so callers that need lockstep
/// progress across several lists should advance all cursors by the minimum
/// of their `peek_len`s.
pub struct SGCursor<'a> {
    sglist: &'a [IoVec],
    /// Index of the iovec the cursor is within
    idx: usize,
    /// Byte offset within that iovec
    offset: usize,
}

impl<'a> SGCursor<'a> {
    /// Bytes remaining in the current iovec, or 0 at the end of the list.
    pub fn peek_len(&self) -> usize {
        if self.idx < self.sglist.len() {
            self.sglist[self.idx].len() - self.offset
        } else {
            0
        }
    }

    /// Return up to `max` bytes as a single `IoVec`, advancing the cursor.
    pub fn next(&mut self, max: usize) -> Option<IoVec> {
        if self.idx >= self.sglist.len() || max == 0 {
            return None;
        }
        let iovec = &self.sglist[self.idx];
        let take = std::cmp::min(max, iovec.len() - self.offset);
        let r = iovec.slice(self.offset, self.offset + take);
        self.offset += take;
        if self.offset == iovec.len() {
            self.idx += 1;
            self.offset = 0;
        }
        Some(r)
    }
}

impl<'a> From<&'a SGList> for SGCursor<'a> {
    fn from(sglist: &'a SGList) -> Self {
        SGCursor { sglist, idx: 0, offset: 0 }
    }
}

#[cfg(test)]
mod tests {
    use divbuf::DivBufShared;
    use pretty_assertions::assert_eq;
    use super::*;

    #[test]
    fn walk() {
        let dbs0 = DivBufShared::from(vec![1u8; 6]);
        let dbs1 = DivBufShared::from(vec![2u8; 4]);
        let sglist = vec![dbs0.try_const().unwrap(),
                          dbs1.try_const().unwrap()];
        let mut cursor = SGCursor::from(&sglist);
        assert_eq!(cursor.peek_len(), 6);
        // A short take stays within the iovec
        let a = cursor.next(4).unwrap();
        assert_eq!(&a[..], &[1u8; 4][..]);
        assert_eq!(cursor.peek_len(), 2);
        // An oversized take is clamped at the iovec boundary
        let b = cursor.next(100).unwrap();
        assert_eq!(&b[..], &[1u8; 2][..]);
        assert_eq!(cursor.peek_len(), 4);
        let c = cursor.next(4).unwrap();
        assert_eq!(&c[..], &[2u8; 4][..]);
        assert_eq!(cursor.peek_len(), 0);
        assert!(cursor.next(1).is_none());
    }

    #[test]
    fn empty() {
        let sglist = SGList::new();
        let mut cursor = SGCursor::from(&sglist);
        assert_eq!(cursor.peek_len(), 0);
        assert!(cursor.next(1).is_none());
    }
}
