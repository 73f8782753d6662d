// vim: tw=80
//! Small helpers shared by the dRAID modules

use divbuf::DivBufShared;
use lazy_static::lazy_static;

/// Size of the shared page of zeros: one skip sector at the largest
/// supported ashift.
pub const ZERO_REGION_LEN: usize = 64 * 1024;

lazy_static! {
    /// A page of zeros that never changes.
    ///
    /// Every skip sector in every write stripe is a slice of this page, so
    /// padding a short column costs a refcount bump rather than an
    /// allocation.
    pub static ref ZERO_REGION: DivBufShared =
        DivBufShared::from(vec![0u8; ZERO_REGION_LEN]);
}

/// Smallest multiple of `align` that is not less than `x`.
///
/// All dRAID alignment is in terms of sectors, group widths, and rows, so
/// only the byte-offset width is needed.
pub fn roundup(x: u64, align: u64) -> u64 {
    debug_assert!(align > 0);
    x.div_ceil(align) * align
}

/// Total number of payload bytes in a scatter-gather list.
pub fn sglist_len<T>(sglist: &[T]) -> usize
    where T: std::ops::Deref<Target = [u8]>
{
    sglist.iter().map(|iovec| iovec.len()).sum()
}

#[cfg(test)]
mod t {
use pretty_assertions::assert_eq;
use super::*;

#[test]
fn test_roundup() {
    assert_eq!(roundup(0, 9), 0);
    assert_eq!(roundup(1, 9), 9);
    assert_eq!(roundup(9, 9), 9);
    assert_eq!(roundup(10, 9), 18);
    // Sector-sized alignment, the common case
    assert_eq!(roundup(4097, 4096), 8192);
}

#[test]
fn test_sglist_len() {
    let empty: [&[u8]; 0] = [];
    assert_eq!(sglist_len(&empty), 0);
    assert_eq!(sglist_len(&[&[0u8; 7][..]]), 7);
    assert_eq!(sglist_len(&[&[0u8; 4096][..], &[0u8; 512][..]]), 4608);
}

#[test]
fn zero_region_is_zeroed() {
    let db = ZERO_REGION.try_const().unwrap();
    assert_eq!(db.len(), ZERO_REGION_LEN);
    assert!(db.iter().all(|b| *b == 0));
}

}
