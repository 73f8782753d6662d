// vim: tw=80

//! dRAID distributed spares
//!
//! A distributed spare is a virtual leaf vdev whose capacity is sliced off
//! the tail of every real child.  The last `nspares` columns of each
//! permutation decide which child holds a given offset, so rebuild I/O to a
//! spare spreads over the whole fleet.  A spare can only replace children of
//! its own dRAID, and its name encodes everything needed to find it again.

use std::sync::{Arc, Weak};

use futures::FutureExt;
use serde_derive::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    label::*,
    types::*,
    vdev::BoxVdevFut,
};
use super::{Child, IoFlags, VdevDraid};

/// Identity of a distributed spare: `draid<parity>-<vdev>-<spare>`.
///
/// The grammar is frozen; the name is the only persisted state a spare has.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SpareName {
    pub nparity: u64,
    pub vdev_id: u64,
    pub spare_id: u64,
}

impl std::fmt::Display for SpareName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "draid{}-{}-{}", self.nparity, self.vdev_id, self.spare_id)
    }
}

impl std::str::FromStr for SpareName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let rest = s.strip_prefix("draid").ok_or(Error::InvalidInput)?;
        let mut fields = rest.splitn(3, '-');
        let mut next = || -> Result<u64> {
            fields.next()
                .filter(|f| !f.is_empty())
                .and_then(|f| f.parse().ok())
                .ok_or(Error::InvalidInput)
        };
        let nparity = next()?;
        let vdev_id = next()?;
        let spare_id = next()?;
        Ok(SpareName { nparity, vdev_id, spare_id })
    }
}

/// The label-equivalent configuration a spare reports instead of reading a
/// real label from disk.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SpareConfig {
    pub is_spare: bool,
    pub version: u64,
    pub pool_name: String,
    pub pool_guid: Uuid,
    pub pool_txg: TxgT,
    pub top_guid: Uuid,
    pub state: PoolState,
    pub guid: Uuid,
}

/// `DraidSpare`: a dRAID distributed spare vdev
///
/// Holds nothing but its identity and a non-owning reference to the parent
/// top-level vdev; every I/O resolves, per offset, to one of the parent's
/// real children.
#[derive(Debug)]
pub struct DraidSpare {
    name: SpareName,
    parent: Weak<VdevDraid>,
    uuid: Uuid,
}

impl DraidSpare {
    /// Open a distributed spare by name.
    ///
    /// The name must reference an existing top-level dRAID vdev whose
    /// parity level matches and which has enough spares.
    pub fn open(name: &str, top_vdevs: &[Arc<VdevDraid>])
        -> Result<Arc<Self>>
    {
        let sname: SpareName = name.parse()?;

        let tvd = top_vdevs.get(sname.vdev_id as usize)
            .ok_or(Error::InvalidInput)?;
        let vdc = tvd.config();
        if vdc.nparity != sname.nparity || sname.spare_id >= vdc.nspares {
            return Err(Error::InvalidInput);
        }

        Ok(Arc::new(DraidSpare {
            name: sname,
            parent: Arc::downgrade(tvd),
            uuid: Uuid::new_v4(),
        }))
    }

    pub fn name(&self) -> SpareName {
        self.name
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn parent(&self) -> Result<Arc<VdevDraid>> {
        // The parent owns the children this spare projects onto; if it is
        // gone the spare is effectively closed
        self.parent.upgrade().ok_or(Error::NoEntry)
    }

    /// Usable capacity, matching the smallest child of the parent.
    pub fn asize(&self) -> Result<u64> {
        Ok(self.parent()?.child_asize())
    }

    /// Full device size as seen by the label machinery: the usable capacity
    /// plus the simulated label reservations at both ends.
    pub fn psize(&self) -> Result<u64> {
        Ok(self.asize()? + LABEL_START_SIZE + LABEL_END_SIZE)
    }

    /// Resolve the real child responsible for `offset` (relative to the
    /// allocatable space) via the tail columns of the permutation.  Another
    /// distributed spare in the slot resolves recursively.
    pub fn get_child(&self, offset: u64) -> Result<Child> {
        let parent = self.parent()?;
        if offset >= parent.child_asize() {
            return Err(Error::NoEntry);
        }
        let vdc = parent.config();
        debug_assert!(self.name.spare_id < vdc.nspares);

        let perm = offset / vdc.devslicesz;
        let (base, iter) = vdc.map().get_perm(perm);
        let cid = vdc.map().permute_id(base, iter,
            vdc.children - 1 - self.name.spare_id);
        let child = parent.child(cid);

        if let Child::Spare(spare) = &child {
            spare.get_child(offset)
        } else {
            Ok(child)
        }
    }

    /// Is this spare in use?  True when it occupies a slot in its parent's
    /// child tree, directly or under a replacing/sparing pair.
    pub fn is_active(&self) -> bool {
        let parent = match self.parent() {
            Ok(p) => p,
            Err(_) => return false,
        };
        (0..parent.nchildren()).any(|i| {
            parent.child(i).find_spare()
                .map(|s| std::ptr::eq(Arc::as_ptr(&s), self))
                .unwrap_or(false)
        })
    }

    /// Does `offset` (in the full, label-inclusive address space) fall in a
    /// simulated label region?
    fn offset_is_label(&self, offset: u64) -> Result<bool> {
        Ok(offset < LABEL_START_SIZE ||
           offset >= self.psize()? - LABEL_END_SIZE)
    }

    /// Read from the spare.  `offset` is in the full address space,
    /// including the simulated labels.
    ///
    /// The label ranges are not persisted anywhere.  Probe reads succeed
    /// with zeroed data so the device looks labeled; the config-reader path
    /// uses [`DraidSpare::read_config`] instead of the pipeline.  Any other
    /// label-range read is an error.
    pub fn read_at(&self, mut buf: IoVecMut, offset: u64,
                   flags: IoFlags) -> BoxVdevFut
    {
        match self.offset_is_label(offset) {
            Err(e) => Box::pin(futures::future::err(e)),
            Ok(true) => {
                if flags.probe {
                    for b in buf.iter_mut() {
                        *b = 0;
                    }
                    Box::pin(futures::future::ok::<(), Error>(()))
                } else {
                    Box::pin(futures::future::err(Error::IoError))
                }
            }
            Ok(false) => {
                self.readv_at_data(vec![buf], offset - LABEL_START_SIZE)
            }
        }
    }

    /// Write to the spare.  `offset` is in the full address space.
    ///
    /// Probe and config writes to the label ranges are accepted and
    /// discarded so that label initialization succeeds; everything else in
    /// the label range is an error.
    pub fn write_at(&self, buf: IoVec, offset: u64,
                    flags: IoFlags) -> BoxVdevFut
    {
        match self.offset_is_label(offset) {
            Err(e) => Box::pin(futures::future::err(e)),
            Ok(true) => {
                if flags.probe || flags.config_writer {
                    Box::pin(futures::future::ok::<(), Error>(()))
                } else {
                    Box::pin(futures::future::err(Error::IoError))
                }
            }
            Ok(false) => {
                self.writev_at_data(vec![buf], offset - LABEL_START_SIZE)
            }
        }
    }

    /// Read at an offset relative to the allocatable space, forwarding to
    /// the child under the offset.
    pub fn readv_at_data(&self, bufs: SGListMut, offset: u64) -> BoxVdevFut {
        match self.get_child(offset) {
            Err(e) => Box::pin(futures::future::err(e)),
            Ok(child) => {
                if !child.readable_at(offset) {
                    return Box::pin(futures::future::err(Error::NoEntry));
                }
                child.readv_at(bufs, offset)
            }
        }
    }

    /// Write at an offset relative to the allocatable space.
    pub fn writev_at_data(&self, bufs: SGList, offset: u64) -> BoxVdevFut {
        match self.get_child(offset) {
            Err(e) => Box::pin(futures::future::err(e)),
            Ok(child) => {
                if !child.writeable_at(offset) {
                    return Box::pin(futures::future::err(Error::NoEntry));
                }
                child.writev_at(bufs, offset)
            }
        }
    }

    /// Discard a range.  The child under the offset must support trim.
    /// The label ranges are never trimmed.
    pub fn trim_data(&self, offset: u64, len: u64) -> BoxVdevFut {
        match self.get_child(offset) {
            Err(e) => Box::pin(futures::future::err(e)),
            Ok(child) => {
                if !child.has_trim() {
                    return Box::pin(
                        futures::future::err(Error::NotSupported));
                }
                child.trim(offset, len)
            }
        }
    }

    /// Flush the write caches of every child of the parent; any of them may
    /// hold this spare's data.
    pub fn flush(&self) -> BoxVdevFut {
        let parent = match self.parent() {
            Ok(p) => p,
            Err(e) => return Box::pin(futures::future::err(e)),
        };
        let fut = futures::future::join_all(
            (0..parent.nchildren())
                .map(|i| parent.child(i).flush())
        ).map(|results| {
            let mut r = Ok(());
            for result in results {
                if let Err(e) = result {
                    warn!(error = %e, "dRAID spare flush failed");
                    if r.is_ok() {
                        r = Err(e);
                    }
                }
            }
            r
        });
        Box::pin(fut)
    }

    /// Synthesize the label-equivalent configuration for this spare.
    ///
    /// The spare has no real label; this descriptor stands in for one when
    /// the configuration is read.  The guid is taken from the matching
    /// entry of the pool's spare list so that repeated opens agree.
    pub fn read_config(&self, pool: &PoolIdent, spares: &[Arc<DraidSpare>])
        -> Result<SpareConfig>
    {
        let parent = self.parent()?;
        let guid = spares.iter()
            .find(|s| s.name == self.name)
            .map(|s| s.uuid)
            .unwrap_or(self.uuid);
        let state = if self.is_active() {
            PoolState::Active
        } else {
            PoolState::Spare
        };
        Ok(SpareConfig {
            is_spare: true,
            version: pool.version,
            pool_name: pool.name.clone(),
            pool_guid: pool.guid,
            pool_txg: pool.txg,
            top_guid: parent.uuid(),
            state,
            guid,
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use super::*;

    mod name {
        use super::*;
        use pretty_assertions::assert_eq;

        /// Round-trip every legal field combination shape.
        #[rstest]
        #[case(1, 0, 0)]
        #[case(2, 17, 3)]
        #[case(3, 255, 99)]
        fn round_trip(#[case] nparity: u64, #[case] vdev_id: u64,
                      #[case] spare_id: u64)
        {
            let name = SpareName { nparity, vdev_id, spare_id };
            let s = name.to_string();
            assert_eq!(s.parse::<SpareName>().unwrap(), name);
        }

        #[test]
        fn format() {
            let name = SpareName { nparity: 1, vdev_id: 0, spare_id: 0 };
            assert_eq!(name.to_string(), "draid1-0-0");
        }

        #[rstest]
        #[case("draid1-0")]
        #[case("draid1-0-0-0")]
        #[case("draid--1-0")]
        #[case("draid1-0-")]
        #[case("raid1-0-0")]
        #[case("draidx-0-0")]
        #[case("")]
        fn malformed(#[case] s: &str) {
            assert_eq!(s.parse::<SpareName>().unwrap_err(),
                       Error::InvalidInput);
        }
    }
}
