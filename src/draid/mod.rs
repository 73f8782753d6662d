// vim: tw=80

//! dRAID: distributed-spare RAID
//!
//! A dRAID vdev is comprised of multiple raidz redundancy groups which are
//! spread over the dRAID children.  To ensure an even distribution, and
//! avoid hot spots, a permutation mapping is applied to the order of the
//! children.  By reserving a small fraction of each child's capacity,
//! virtual distributed spare disks are created, which similarly span all of
//! the children.  Resilvering to a distributed spare can therefore read and
//! write across the whole fleet in parallel.

use std::sync::Arc;

use crate::{
    types::*,
    vdev::*,
};

mod map;
mod geometry;
mod sgcursor;
mod codec;
mod row_map;
mod vdev_draid;
mod spare;

pub use self::geometry::{
    DraidConfig,
    DraidParams,
    MAX_BLOCK_SIZE,
    MAX_PARITY,
    ROW_SIZE,
};
pub use self::map::{DraidMap, MAX_CHILDREN, MAX_MAPS};
pub use self::row_map::{RowCol, RowMap};
pub use self::spare::{DraidSpare, SpareConfig, SpareName};
pub use self::vdev_draid::{IoFlags, VdevDraid};

/// Why an interior vdev temporarily sits in a child slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InteriorKind {
    /// The original device is being replaced by a new one
    Replacing,
    /// A spare has been attached alongside the original device
    Sparing,
}

/// A mirror-like vdev standing in for a child while it is being replaced or
/// spared out.  The members are kept in sync; the first readable member
/// serves reads.
#[derive(Clone)]
pub struct InteriorVdev {
    pub kind: InteriorKind,
    pub children: Vec<Child>,
}

/// One slot in a dRAID's child array.
///
/// Three kinds of device can occupy a slot; they share a capability set but
/// not an implementation.  A top-level dRAID owns its real children; a
/// distributed spare in a slot is only a projection onto the tail columns of
/// the permutation and holds a non-owning reference back to its parent.
#[derive(Clone)]
pub enum Child {
    /// A real leaf device
    Leaf(Arc<dyn VdevLeafApi>),
    /// A distributed spare
    Spare(Arc<DraidSpare>),
    /// A replacing or sparing pair
    Interior(Arc<InteriorVdev>),
}

impl Child {
    pub fn leaf(leaf: Arc<dyn VdevLeafApi>) -> Self {
        Child::Leaf(leaf)
    }

    pub fn is_spare(&self) -> bool {
        matches!(self, Child::Spare(_))
    }

    /// Open the device.  Spares are validated when they are created and
    /// carry no state of their own.
    pub fn open(&self) -> Result<()> {
        match self {
            Child::Leaf(leaf) => leaf.open(),
            Child::Spare(_) => Ok(()),
            Child::Interior(iv) => {
                // A pair is usable if any member opens
                let mut r = Err(Error::NoEntry);
                for child in &iv.children {
                    if child.open().is_ok() {
                        r = Ok(());
                    }
                }
                r
            }
        }
    }

    pub fn close(&self) {
        match self {
            Child::Leaf(leaf) => leaf.close(),
            Child::Spare(_) => (),
            Child::Interior(iv) => {
                for child in &iv.children {
                    child.close();
                }
            }
        }
    }

    /// Usable capacity, when the slot holds real storage.
    pub fn asize(&self) -> Option<u64> {
        match self {
            Child::Leaf(leaf) => Some(leaf.asize()),
            Child::Spare(_) => None,
            Child::Interior(iv) => {
                iv.children.iter().filter_map(Child::asize).min()
            }
        }
    }

    pub fn ashift(&self) -> Option<u64> {
        match self {
            Child::Leaf(leaf) => Some(leaf.ashift()),
            Child::Spare(_) => None,
            Child::Interior(iv) => {
                iv.children.iter().filter_map(Child::ashift).max()
            }
        }
    }

    /// Is the device readable at the given offset?  A distributed spare
    /// resolves to a concrete child first.
    pub fn readable_at(&self, offset: u64) -> bool {
        match self {
            Child::Leaf(leaf) => leaf.readable(),
            Child::Spare(spare) => {
                match spare.get_child(offset) {
                    Ok(child) => child.readable_at(offset),
                    Err(_) => false,
                }
            }
            Child::Interior(iv) => {
                iv.children.iter().any(|c| c.readable_at(offset))
            }
        }
    }

    pub fn writeable_at(&self, offset: u64) -> bool {
        match self {
            Child::Leaf(leaf) => leaf.writeable(),
            Child::Spare(spare) => {
                match spare.get_child(offset) {
                    Ok(child) => child.writeable_at(offset),
                    Err(_) => false,
                }
            }
            Child::Interior(iv) => {
                iv.children.iter().any(|c| c.writeable_at(offset))
            }
        }
    }

    /// Is the range `txg..txg` of `size` bytes missing from this device?
    ///
    /// A distributed spare does not fit the DTL model: its effective child
    /// is determined by offset, and DTLs recorded before the spare became
    /// active are meaningless.  So the spare is resolved to the child under
    /// the offset, recursively, and the question asked there.
    pub fn missing(&self, offset: u64, txg: TxgT, size: u64) -> bool {
        match self {
            Child::Leaf(leaf) => {
                leaf.dtl_contains(DtlKind::Missing, txg, size)
            }
            Child::Spare(spare) => {
                match spare.get_child(offset) {
                    Ok(child) => child.missing(offset, txg, size),
                    Err(_) => true,
                }
            }
            Child::Interior(iv) => {
                // Current if any readable member has the data
                !iv.children.iter().any(|c| {
                    c.readable_at(offset) && !c.missing(offset, txg, size)
                })
            }
        }
    }

    /// Is the device at this offset mid-repair?  True when the slot (or the
    /// slot a spare resolves to) is a replacing or sparing pair.
    pub fn faulted_at(&self, offset: u64) -> bool {
        match self {
            Child::Leaf(_) => false,
            Child::Interior(_) => true,
            Child::Spare(spare) => {
                matches!(spare.get_child(offset), Ok(Child::Interior(_)))
            }
        }
    }

    /// The first distributed spare in this subtree, if any.
    pub fn find_spare(&self) -> Option<Arc<DraidSpare>> {
        match self {
            Child::Leaf(_) => None,
            Child::Spare(spare) => Some(spare.clone()),
            Child::Interior(iv) => {
                iv.children.iter().find_map(Child::find_spare)
            }
        }
    }

    /// Number of distributed spares active in this subtree.
    pub fn active_spares(&self) -> usize {
        match self {
            Child::Leaf(_) => 0,
            Child::Spare(_) => 1,
            Child::Interior(iv) => {
                iv.children.iter().map(Child::active_spares).sum()
            }
        }
    }

    pub fn has_trim(&self) -> bool {
        match self {
            Child::Leaf(leaf) => leaf.has_trim(),
            Child::Spare(_) => false,
            Child::Interior(iv) => iv.children.iter().all(Child::has_trim),
        }
    }

    pub fn readv_at(&self, bufs: SGListMut, offset: u64) -> BoxVdevFut {
        match self {
            Child::Leaf(leaf) => leaf.readv_at(bufs, offset),
            Child::Spare(spare) => spare.readv_at_data(bufs, offset),
            Child::Interior(iv) => {
                match iv.children.iter().find(|c| c.readable_at(offset)) {
                    Some(child) => child.readv_at(bufs, offset),
                    None => {
                        Box::pin(futures::future::err(Error::NoEntry))
                    }
                }
            }
        }
    }

    pub fn read_at(&self, buf: IoVecMut, offset: u64) -> BoxVdevFut {
        self.readv_at(vec![buf], offset)
    }

    pub fn writev_at(&self, bufs: SGList, offset: u64) -> BoxVdevFut {
        match self {
            Child::Leaf(leaf) => leaf.writev_at(bufs, offset),
            Child::Spare(spare) => spare.writev_at_data(bufs, offset),
            Child::Interior(iv) => {
                // All writeable members stay in sync
                use futures::{TryFutureExt, TryStreamExt,
                              stream::FuturesUnordered};
                if !iv.children.iter().any(|c| c.writeable_at(offset)) {
                    return Box::pin(futures::future::err(Error::NoEntry));
                }
                let fut = iv.children.iter()
                    .filter(|c| c.writeable_at(offset))
                    .map(|c| c.writev_at(bufs.clone(), offset))
                    .collect::<FuturesUnordered<_>>()
                    .try_collect::<Vec<_>>()
                    .map_ok(drop);
                Box::pin(fut)
            }
        }
    }

    pub fn write_at(&self, buf: IoVec, offset: u64) -> BoxVdevFut {
        self.writev_at(vec![buf], offset)
    }

    pub fn trim(&self, offset: u64, len: u64) -> BoxVdevFut {
        match self {
            Child::Leaf(leaf) => leaf.trim(offset, len),
            Child::Spare(spare) => spare.trim_data(offset, len),
            Child::Interior(iv) => {
                use futures::{TryFutureExt, TryStreamExt,
                              stream::FuturesUnordered};
                let fut = iv.children.iter()
                    .map(|c| c.trim(offset, len))
                    .collect::<FuturesUnordered<_>>()
                    .try_collect::<Vec<_>>()
                    .map_ok(drop);
                Box::pin(fut)
            }
        }
    }

    pub fn flush(&self) -> BoxVdevFut {
        match self {
            Child::Leaf(leaf) => leaf.flush(),
            Child::Spare(spare) => spare.flush(),
            Child::Interior(iv) => {
                use futures::{TryFutureExt, TryStreamExt,
                              stream::FuturesUnordered};
                let fut = iv.children.iter()
                    .map(Child::flush)
                    .collect::<FuturesUnordered<_>>()
                    .try_collect::<Vec<_>>()
                    .map_ok(drop);
                Box::pin(fut)
            }
        }
    }
}
