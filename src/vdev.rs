// vim: tw=80

use std::{
    fmt,
    num::NonZeroU8,
    pin::Pin
};

#[cfg(test)] use mockall::automock;

use crate::types::*;

/// How much redundancy a dRAID has left.
///
/// Rolled up from the child slots: a slot is sick when its leaf cannot
/// serve reads or when a replacing/sparing pair is interposed on it (the
/// `Child::Interior` case), and every sick slot costs each stripe one
/// column of protection.  `Degraded(n)` records that count while it stays
/// within the parity budget; beyond `nparity` the vdev is `Faulted` and
/// reconstruction is impossible.  `Rebuilding` is the window where a
/// distributed spare holds a slot by itself and the resilver is still
/// filling it in.  Variants are ordered healthiest first so a pool can
/// report the maximum over its vdevs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum Health {
    /// Every child slot is serving I/O
    Online,
    /// This many child slots' worth of redundancy is gone
    Degraded(NonZeroU8),
    /// A distributed spare is absorbing a rebuild; not all of its data has
    /// been reconstructed yet
    Rebuilding,
    /// More slots are gone than the parity level can mask
    Faulted,
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Health::Online => write!(f, "Online"),
            Health::Degraded(n) => write!(f, "Degraded({n})"),
            Health::Rebuilding => write!(f, "Rebuilding"),
            Health::Faulted => write!(f, "Faulted"),
        }
    }
}

/// Completion future of an asynchronous vdev operation.
///
/// Child I/Os complete on the I/O pipeline's threads, so the future must
/// be both `Send` and `Sync`.
pub type BoxVdevFut =
    Pin<Box<dyn futures::Future<Output = Result<()>> + Send + Sync>>;

/// Which of a child's dirty time logs to query.
///
/// The DTL itself lives with the surrounding engine; the dRAID core only
/// ever asks range questions of it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DtlKind {
    /// The child was entirely absent while these txgs were written
    Missing,
    /// Some I/O to the child failed during these txgs
    Partial,
}

/// A range→boolean oracle over a vdev's dirty time log.
pub trait Dtl: Send + Sync {
    /// Does the log of kind `kind` contain any part of `size` bytes written
    /// in `txg`?
    fn contains(&self, kind: DtlKind, txg: TxgT, size: u64) -> bool;
}

/// A DTL that has never recorded an outage.  Healthy children and unit tests
/// use this.
#[derive(Debug, Default)]
pub struct CleanDtl();

impl Dtl for CleanDtl {
    fn contains(&self, _kind: DtlKind, _txg: TxgT, _size: u64) -> bool {
        false
    }
}

/// VdevLeaf: the capability set that a dRAID consumes from each real child
/// device.
///
/// All offsets are in bytes, relative to the start of the child's allocatable
/// space.  Reads and writes must be sector aligned.
#[cfg_attr(test, automock)]
pub trait VdevLeafApi: Send + Sync {
    /// Open the device.  Returns an error if the device is missing or
    /// unusable; the parent decides how many such failures it can tolerate.
    fn open(&self) -> Result<()>;

    /// Close the device.
    fn close(&self);

    /// Usable capacity in bytes, excluding label reservations.
    fn asize(&self) -> u64;

    /// Minimum-sector-size exponent.
    fn ashift(&self) -> u64;

    fn uuid(&self) -> Uuid;

    /// May reads currently be issued to this device?
    fn readable(&self) -> bool;

    /// May writes currently be issued to this device?
    fn writeable(&self) -> bool;

    /// Does the device support TRIM/UNMAP?
    fn has_trim(&self) -> bool;

    /// Query the device's dirty time log.
    fn dtl_contains(&self, kind: DtlKind, txg: TxgT, size: u64) -> bool;

    /// Asynchronously read a contiguous portion of the device.
    fn read_at(&self, buf: IoVecMut, offset: u64) -> BoxVdevFut;

    /// Vectored variant of `read_at`.
    fn readv_at(&self, bufs: SGListMut, offset: u64) -> BoxVdevFut;

    /// Asynchronously write a contiguous portion of the device.
    fn write_at(&self, buf: IoVec, offset: u64) -> BoxVdevFut;

    /// Vectored variant of `write_at`.
    fn writev_at(&self, bufs: SGList, offset: u64) -> BoxVdevFut;

    /// Asynchronously discard a contiguous portion of the device.
    fn trim(&self, offset: u64, len: u64) -> BoxVdevFut;

    /// Flush the device's write cache.
    fn flush(&self) -> BoxVdevFut;
}
