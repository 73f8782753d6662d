// vim: tw=80

use std::sync::{Arc, RwLock};

use divbuf::{DivBufInaccessible, DivBufShared};
use fixedbitset::FixedBitSet;
use futures::{FutureExt, future};
use tracing::{debug, warn};

use crate::{
    types::*,
    util::*,
    vdev::*,
};
use super::{
    Child,
    codec::*,
    geometry::*,
    row_map::*,
};

/// The I/O flag set dRAID distinguishes.  All other pipeline flags pass
/// through unexamined.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct IoFlags {
    /// Full-pool verification read
    pub scrub: bool,
    /// Healing repair read
    pub resilver: bool,
    /// Sequential rebuild read; must be issued at group boundaries
    pub rebuild: bool,
    /// Device probe
    pub probe: bool,
    /// Label/configuration writer
    pub config_writer: bool,
}

impl IoFlags {
    fn repair_read(&self) -> bool {
        self.scrub || self.resilver
    }
}

/// A child I/O tagged with its stripe column.
type ColFut = std::pin::Pin<Box<dyn futures::Future<Output = (usize, Result<()>)> + Send + Sync>>;

/// `VdevDraid`: the top-level distributed-RAID vdev
///
/// Owns the configuration and permutation map, dispatches one child I/O per
/// stripe column, invokes the parity math, and answers the block-sizing and
/// degradation queries the rest of the pool asks of a top-level vdev.
pub struct VdevDraid {
    vdc: DraidConfig,

    codec: Codec,

    /// Child devices.  Slot order is frozen at creation; a slot's occupant
    /// changes only while a device is being replaced or spared out.
    children: RwLock<Box<[Child]>>,

    /// Usable capacity of the smallest non-spare child, in bytes
    child_asize: u64,

    /// Usable capacity of the whole vdev, in bytes
    asize: u64,

    /// This vdev's own dirty time log
    dtl: Arc<dyn Dtl>,

    uuid: Uuid,
}

impl std::fmt::Debug for VdevDraid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VdevDraid").field("uuid", &self.uuid).finish()
    }
}

impl VdevDraid {
    /// Open a top-level dRAID vdev.
    ///
    /// Builds the configuration and permutation map, then opens the
    /// non-spare children followed by the distributed spares.  The ordering
    /// matters: spares derive their size from the opened children.  Up to
    /// `nparity` children may fail to open; any more and the whole vdev
    /// fails with `NoReplicas`.
    pub fn open(params: &DraidParams, children: Vec<Child>,
                dtl: Arc<dyn Dtl>) -> Result<Arc<Self>>
    {
        if children.len() as u64 != params.children {
            return Err(Error::InvalidInput);
        }

        let ashift = children.iter()
            .filter_map(Child::ashift)
            .max()
            .ok_or(Error::InvalidInput)?;
        let vdc = DraidConfig::new(params, ashift)?;

        let mut open_errors = 0;
        for child in children.iter().filter(|c| !c.is_spare()) {
            if let Err(e) = child.open() {
                warn!("dRAID child failed to open: {e}");
                open_errors += 1;
            }
        }
        for child in children.iter().filter(|c| c.is_spare()) {
            let _ = child.open();
        }
        if open_errors > vdc.nparity {
            return Err(Error::NoReplicas);
        }

        let child_asize = children.iter()
            .filter_map(Child::asize)
            .min()
            .ok_or(Error::InvalidInput)?;
        let asize = vdc.usable_asize(child_asize);

        let codec = Codec::new(vdc.groupwidth as u32, vdc.nparity as u32);

        Ok(Arc::new(VdevDraid {
            vdc,
            codec,
            children: RwLock::new(children.into_boxed_slice()),
            child_asize,
            asize,
            dtl,
            uuid: Uuid::new_v4(),
        }))
    }

    /// Close all children.  The configuration is dropped with the vdev.
    pub fn close(&self) {
        for child in self.children.read().unwrap().iter() {
            child.close();
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn config(&self) -> &DraidConfig {
        &self.vdc
    }

    /// The current occupant of a child slot.
    pub fn child(&self, idx: usize) -> Child {
        self.children.read().unwrap()[idx].clone()
    }

    /// A consistent view of all child slots.  Each I/O works against one
    /// snapshot.
    fn children(&self) -> Box<[Child]> {
        self.children.read().unwrap().clone()
    }

    pub fn nchildren(&self) -> usize {
        self.children.read().unwrap().len()
    }

    /// Swap the occupant of a child slot, e.g. to interpose a replacing or
    /// sparing pair.  In-flight I/Os keep the slot's previous occupant.
    pub fn replace_child(&self, idx: usize, child: Child) {
        self.children.write().unwrap()[idx] = child;
    }

    /// Usable capacity of the smallest non-spare child.  Distributed spares
    /// size themselves from this.
    pub fn child_asize(&self) -> u64 {
        self.child_asize
    }

    /// Usable capacity of the whole vdev.
    pub fn asize_total(&self) -> u64 {
        self.asize
    }

    /// Allocated size for a `psize`-byte block, parity and padding included.
    pub fn asize(&self, psize: u64) -> u64 {
        self.vdc.asize(psize)
    }

    pub fn asize_to_psize(&self, asize: u64) -> u64 {
        self.vdc.asize_to_psize(asize)
    }

    pub fn metaslab_init(&self, ms_start: u64, ms_size: u64) -> (u64, u64) {
        self.vdc.metaslab_init(ms_start, ms_size)
    }

    pub fn max_rebuildable_asize(&self, max_segment: u64) -> u64 {
        self.vdc.max_rebuildable_asize(max_segment)
    }

    /// Number of distributed spares active anywhere in the child tree.
    fn active_spares(&self) -> usize {
        self.children.read().unwrap().iter()
            .map(Child::active_spares)
            .sum()
    }

    /// Is any member of the group at `offset` faulted or mid-repair?
    pub fn group_degraded(&self, offset: u64) -> bool {
        let phys = self.vdc.logical_to_physical(offset);
        let (base, iter) = self.vdc.map().get_perm(phys.perm);
        let children = self.children();

        for i in 0..self.vdc.groupwidth {
            let c = (phys.groupstart + i) % self.vdc.ndisks;
            let cid = self.vdc.map().permute_id(base, iter, c);
            if children[cid].faulted_at(phys.offset) {
                return true;
            }
        }
        false
    }

    /// Does the block at `offset` need to be resilvered?
    ///
    /// With several spares active at once a rebuild double-fault cannot be
    /// ruled out, so everything is resilvered.  A sequential rebuild has no
    /// meaningful birth txg and falls back to group degradation.  A healing
    /// resilver skips txgs that were never partial.
    pub fn need_resilver(&self, offset: u64, phys_birth: Option<TxgT>)
        -> bool
    {
        if self.vdc.nspares > 1 && self.active_spares() > 1 {
            return true;
        }

        match phys_birth {
            None => self.group_degraded(offset),
            Some(txg) => {
                if !self.dtl.contains(DtlKind::Partial, txg, 1) {
                    false
                } else {
                    self.group_degraded(offset)
                }
            }
        }
    }

    /// Health of the vdev, rolled up from its child slots.
    ///
    /// A slot mid-repair counts as sick until the interposed pair is
    /// detached; a slot held by a bare distributed spare reads fine but
    /// reports `Rebuilding` until then.
    pub fn status(&self) -> Health {
        let children = self.children.read().unwrap();
        let sick = children.iter()
            .filter(|c| match c {
                Child::Leaf(leaf) => !leaf.readable(),
                Child::Spare(_) => false,
                Child::Interior(_) => true,
            })
            .count();
        let rebuilding = children.iter()
            .any(|c| c.active_spares() > 0);
        if sick as u64 > self.vdc.nparity {
            Health::Faulted
        } else if let Some(n) = std::num::NonZeroU8::new(sick as u8) {
            Health::Degraded(n)
        } else if rebuilding {
            Health::Rebuilding
        } else {
            Health::Online
        }
    }

    /// Reassess and report health after a child state change.
    pub fn state_change(&self) -> Health {
        let health = self.status();
        debug!(%health, "dRAID state change");
        health
    }

    /// Translate a logical range to the physical range it occupies on one
    /// child.  Returns an empty range when the child is not a member of the
    /// group.  Requests never span more than one group.
    pub fn xlate(&self, child_idx: usize, start: u64, end: u64) -> (u64, u64)
    {
        let vdc = &self.vdc;
        debug_assert_eq!(start % vdc.sector(), 0);
        debug_assert_eq!(end % vdc.sector(), 0);
        debug_assert_eq!(vdc.offset_to_group(start),
                         vdc.offset_to_group(end - 1));

        let phys = vdc.logical_to_physical(start);
        let (base, iter) = vdc.map().get_perm(phys.perm);
        let mut pstart = phys.offset;
        let mut pend = pstart;

        for i in 0..vdc.groupwidth {
            let c = (phys.groupstart + i) % vdc.ndisks;
            if c == 0 && i != 0 {
                // The group wrapped onto the next row
                pstart += ROW_SIZE;
                pend = pstart;
            }
            let id = vdc.map().permute_id(base, iter, c);
            if id == child_idx {
                let b_size = (end >> vdc.ashift) - (start >> vdc.ashift);
                debug_assert!(b_size > 0);
                pend = pstart +
                    (((b_size - 1) / vdc.groupwidth + 1) << vdc.ashift);
                break;
            }
        }

        debug_assert!(pstart <= start);
        debug_assert!(pend - pstart <= end - start);
        (pstart, pend)
    }

    /// Cross-check one column of a stripe against `xlate`.
    #[cfg(debug_assertions)]
    fn io_verify(&self, rm: &RowMap, offset: u64, asize: u64, c: usize) {
        let rc = &rm.col[c];
        let (pstart, pend) = self.xlate(rc.devidx, offset, offset + asize);
        debug_assert_eq!(rc.offset, pstart);
        debug_assert_eq!(rc.offset + rm.parity_size, pend);
    }

    #[cfg(not(debug_assertions))]
    fn io_verify(&self, _rm: &RowMap, _offset: u64, _asize: u64, _c: usize) {
    }

    /// Write one full stripe.
    ///
    /// The I/O must be group-aligned and must not cross a group boundary.
    /// Unlike raidz, the skip sectors are zero filled and every stripe
    /// column is always written.  The stripe survives as long as no more
    /// than `nparity` column writes fail.
    #[tracing::instrument(skip(self, buf))]
    pub fn write_at(self: Arc<Self>, buf: IoVec, offset: u64) -> BoxVdevFut
    {
        Box::pin(async move { self.write_at_inner(buf, offset).await })
    }

    async fn write_at_inner(&self, buf: IoVec, offset: u64) -> Result<()> {
        let vdc = &self.vdc;
        let psize = buf.len() as u64;
        debug_assert!(psize > 0);
        debug_assert_eq!(psize % vdc.sector(), 0);
        debug_assert_eq!(offset, vdc.astart(offset));

        let mut rm = RowMap::new(vdc, offset, psize);
        debug_assert_eq!(vdc.offset_to_group(offset),
                         vdc.offset_to_group(offset + rm.asize - 1));
        let children = self.children();

        // Lay out the data columns and generate parity over the full
        // padded stripe.
        let data_bufs = rm.write_data_bufs(buf);
        let mut parity =
            vec![vec![0u8; rm.parity_size as usize]; rm.firstdatacol];
        self.codec.encodev(rm.parity_size as usize, &data_bufs, &mut parity);
        let parity_bufs = parity.into_iter()
            .map(|v| {
                let dbs = DivBufShared::from(v);
                dbs.try_const().unwrap()
            })
            .collect::<Vec<_>>();

        let mut futs: Vec<ColFut> = Vec::with_capacity(rm.scols);
        for (c, pbuf) in parity_bufs.into_iter().enumerate() {
            self.io_verify(&rm, offset, rm.asize, c);
            let child = &children[rm.col[c].devidx];
            let fut = child.writev_at(vec![pbuf], rm.col[c].offset);
            futs.push(Box::pin(fut.map(move |r| (c, r))) as ColFut);
        }
        for (i, dbufs) in data_bufs.into_iter().enumerate() {
            let c = rm.firstdatacol + i;
            self.io_verify(&rm, offset, rm.asize, c);
            let child = &children[rm.col[c].devidx];
            let fut = child.writev_at(dbufs, rm.col[c].offset);
            futs.push(Box::pin(fut.map(move |r| (c, r))) as ColFut);
        }

        let mut first_error = None;
        let mut failed = 0u64;
        for (c, r) in future::join_all(futs).await {
            if let Err(e) = r {
                warn!(column = c, error = %e, "dRAID child write failed");
                rm.col[c].error = Some(e);
                first_error.get_or_insert(e);
                failed += 1;
            }
        }

        // Writable iff enough columns survive to read the data back
        if failed > vdc.nparity {
            Err(first_error.unwrap_or(Error::IoError))
        } else {
            Ok(())
        }
    }

    /// Read one block.
    ///
    /// Normal reads map only the populated data columns.  Scrub and
    /// resilver reads use the expanded layout which also reads parity and
    /// the zero filled skip sectors so they can be verified.  Any failed or
    /// skipped data column forces reconstruction from the survivors.
    #[tracing::instrument(skip(self, buf))]
    pub fn read_at(self: Arc<Self>, buf: IoVecMut, offset: u64,
                   flags: IoFlags, txg: Option<TxgT>) -> BoxVdevFut
    {
        Box::pin(async move {
            self.read_at_inner(buf, offset, flags, txg).await
        })
    }

    async fn read_at_inner(&self, buf: IoVecMut, offset: u64, flags: IoFlags,
                           txg: Option<TxgT>) -> Result<()>
    {
        let vdc = &self.vdc;
        let psize = buf.len() as u64;
        debug_assert!(psize > 0);
        debug_assert_eq!(psize % vdc.sector(), 0);
        debug_assert_eq!(offset, vdc.astart(offset));

        let mut rm = RowMap::new(vdc, offset, psize);
        debug_assert_eq!(vdc.offset_to_group(offset),
                         vdc.offset_to_group(offset + rm.asize - 1));
        // Sequential rebuild I/O is always group aligned
        debug_assert!(!flags.rebuild || rm.nskip == 0);

        let scrub_mode = flags.repair_read() && rm.nskip > 0;
        let dbi = buf.clone_inaccessible();
        let children = self.children();

        let mut _skip_dbs = None;
        let mut data_bufs: Vec<Option<SGListMut>> = if scrub_mode {
            let (bufs, skip) = rm.scrub_data_bufs(buf);
            _skip_dbs = skip;
            bufs.into_iter().map(Some).collect()
        } else {
            rm.read_data_bufs(buf)
        };

        // Parity read targets; only issued when needed
        let parity_dbs = (0..rm.firstdatacol)
            .map(|_| {
                DivBufShared::from(vec![0u8; rm.parity_size as usize])
            })
            .collect::<Vec<_>>();

        // Walk the columns in reverse so parity is decided last; errors on
        // the way force the parity columns to be read.
        let mut missingdata = 0;
        for c in (0..rm.cols).rev() {
            let rc = &mut rm.col[c];
            let child = &children[rc.devidx];

            if !child.readable_at(rc.offset) {
                if c >= rm.firstdatacol {
                    missingdata += 1;
                }
                rc.error = Some(Error::NoEntry);
                rc.tried = true;
                rc.skipped = true;
                continue;
            }

            if let Some(t) = txg {
                if child.missing(rc.offset, t, 1) {
                    if c >= rm.firstdatacol {
                        missingdata += 1;
                    }
                    rc.error = Some(Error::Stale);
                    rc.skipped = true;
                    continue;
                }
            }

            // A distributed spare under this column may sit on a device
            // which is itself being replaced.  That data must be rewritten
            // to the new device or it will be missed once the old device
            // detaches.
            if flags.resilver {
                if let Some(spare) = child.find_spare() {
                    if let Ok(Child::Interior(_)) =
                        spare.get_child(rc.offset)
                    {
                        rc.repair = true;
                    }
                }
            }
        }

        let read_parity = missingdata > 0 || flags.repair_read();
        let mut futs: Vec<ColFut> = Vec::with_capacity(rm.cols);
        for c in (0..rm.cols).rev() {
            if rm.col[c].skipped {
                continue;
            }
            let child = &children[rm.col[c].devidx];
            if c >= rm.firstdatacol {
                if let Some(bufs) = data_bufs[c - rm.firstdatacol].take() {
                    rm.col[c].tried = true;
                    let fut = child.readv_at(bufs, rm.col[c].offset);
                    futs.push(Box::pin(fut.map(move |r| (c, r))) as ColFut);
                }
            } else if read_parity {
                rm.col[c].tried = true;
                let pbuf = parity_dbs[c].try_mut().unwrap();
                let fut = child.read_at(pbuf, rm.col[c].offset);
                futs.push(Box::pin(fut.map(move |r| (c, r))) as ColFut);
            }
        }
        // Buffers of skipped columns still alias the caller's backing and
        // must be released before reconstruction can reclaim it
        drop(data_bufs);
        for (c, r) in future::join_all(futs).await {
            if let Err(e) = r {
                warn!(column = c, error = %e, "dRAID child read failed");
                rm.col[c].error = Some(e);
            }
        }

        let col_ok = |rc: &RowCol| rc.error.is_none() && !rc.skipped;
        let data_ok = (rm.firstdatacol..rm.cols)
            .all(|c| col_ok(&rm.col[c]));

        if data_ok {
            if flags.repair_read() {
                self.scrub_verify(&rm, &dbi, &parity_dbs, &_skip_dbs)?;
            }
            self.repair_columns(&rm, &children, &dbi, &parity_dbs).await;
            return Ok(());
        }

        self.reconstruct_stripe(&mut rm, &children, &dbi, parity_dbs, flags)
            .await
    }

    /// With every column in hand, check that parity matches the padded
    /// stripe.  Skip sector contents were read rather than assumed zero;
    /// that is the point of the scrub layout.
    fn scrub_verify(&self, rm: &RowMap, dbi: &DivBufInaccessible,
                    parity_dbs: &[DivBufShared],
                    skip_dbs: &Option<DivBufShared>) -> Result<()>
    {
        for c in 0..rm.firstdatacol {
            if !(rm.col[c].tried && rm.col[c].error.is_none()) {
                // Missing parity; nothing to verify against
                return Ok(());
            }
        }

        let data = dbi.try_mut().unwrap().freeze();
        let skip = skip_dbs.as_ref().map(|dbs| dbs.try_const().unwrap());
        let mut shards = Vec::with_capacity(rm.scols);
        let mut doff = 0usize;
        let mut soff = 0usize;
        for c in rm.firstdatacol..rm.scols {
            let rc = &rm.col[c];
            let mut shard = Vec::with_capacity(rm.parity_size as usize);
            shard.extend_from_slice(&data[doff..doff + rc.size as usize]);
            doff += rc.size as usize;
            if rc.size < rm.parity_size {
                let skip = skip.as_ref().unwrap();
                let pad = (rm.parity_size - rc.size) as usize;
                shard.extend_from_slice(&skip[soff..soff + pad]);
                soff += pad;
            }
            shards.push(shard);
        }
        for dbs in parity_dbs.iter() {
            shards.push(dbs.try_const().unwrap().to_vec());
        }
        // reed-solomon expects data shards before parity shards, which is
        // the order built above
        if !self.codec.verify(&shards) {
            return Err(Error::ChecksumMismatch);
        }
        Ok(())
    }

    /// Rewrite any repair-marked columns with the data just read.  Repair
    /// failures are logged, not fatal; the next scrub will try again.
    async fn repair_columns(&self, rm: &RowMap, children: &[Child],
                            dbi: &DivBufInaccessible,
                            parity_dbs: &[DivBufShared])
    {
        if !rm.col.iter().any(|rc| rc.repair) {
            return;
        }
        let data = dbi.try_mut().unwrap().freeze();
        let mut futs: Vec<ColFut> = Vec::new();
        let mut doff = 0usize;
        for c in 0..rm.cols {
            let rc = &rm.col[c];
            let len = rc.size as usize;
            if c >= rm.firstdatacol {
                if rc.repair {
                    // Rewrite the whole padded column, skip sector included
                    let child = &children[rc.devidx];
                    let mut sglist = SGList::new();
                    if len > 0 {
                        sglist.push(data.slice(doff, doff + len));
                    }
                    if (len as u64) < rm.parity_size {
                        let pad = (rm.parity_size - len as u64) as usize;
                        sglist.push(
                            ZERO_REGION.try_const().unwrap().slice_to(pad));
                    }
                    futs.push(Box::pin(child.writev_at(sglist, rc.offset)
                        .map(move |r| (c, r))) as ColFut);
                }
                doff += len;
            } else if rc.repair && rc.tried && rc.error.is_none() {
                let child = &children[rc.devidx];
                let pbuf = parity_dbs[c].try_const().unwrap();
                futs.push(Box::pin(child.writev_at(vec![pbuf], rc.offset)
                    .map(move |r| (c, r))) as ColFut);
            }
        }
        for (c, r) in future::join_all(futs).await {
            if let Err(e) = r {
                warn!(column = c, error = %e, "dRAID repair write failed");
            }
        }
    }

    /// Rebuild the missing data columns from the survivors.
    ///
    /// Re-enters the stripe with the expanded layout: parity and the skip
    /// sectors of surviving columns are read if they were not already, the
    /// erasure code reconstructs the missing columns, and the rebuilt bytes
    /// are copied into the caller's buffer.
    async fn reconstruct_stripe(&self, rm: &mut RowMap, children: &[Child],
                                dbi: &DivBufInaccessible,
                                parity_dbs: Vec<DivBufShared>,
                                flags: IoFlags) -> Result<()>
    {
        let vdc = &self.vdc;
        let col_ok = |rc: &RowCol| rc.tried && rc.error.is_none() &&
            !rc.skipped;

        let mut erasures = FixedBitSet::with_capacity(rm.scols);
        for c in rm.firstdatacol..rm.cols {
            if !col_ok(&rm.col[c]) {
                erasures.insert(c);
            }
        }
        debug!(missing = erasures.count_ones(..),
               "dRAID reconstructing stripe");

        // Read any parity column that was not read in the first pass
        let mut futs: Vec<ColFut> = Vec::new();
        for c in 0..rm.firstdatacol {
            let rc = &mut rm.col[c];
            if rc.tried {
                continue;
            }
            let child = &children[rc.devidx];
            if !child.readable_at(rc.offset) {
                rc.error = Some(Error::NoEntry);
                rc.skipped = true;
                continue;
            }
            rc.tried = true;
            let pbuf = parity_dbs[c].try_mut().unwrap();
            futs.push(Box::pin(child.read_at(pbuf, rc.offset)
                .map(move |r| (c, r))) as ColFut);
        }

        // Read the skip sectors of surviving short and empty columns; the
        // parity was computed over them.
        let mut skip_shards: Vec<Option<DivBufShared>> =
            (0..rm.scols).map(|_| None).collect();
        if rm.nskip > 0 {
            let first_skip = std::cmp::max(rm.skipstart, rm.firstdatacol);
            let scols = rm.scols;
            for c in first_skip..scols {
                let rc = &rm.col[c];
                if c < rm.cols && !col_ok(rc) {
                    continue;
                }
                let child = &children[rc.devidx];
                if !child.readable_at(rc.offset) {
                    continue;
                }
                let pad = rm.parity_size - rc.size;
                debug_assert_eq!(pad, vdc.sector());
                let dbs = DivBufShared::from(vec![0u8; pad as usize]);
                let fut = child.read_at(dbs.try_mut().unwrap(),
                                        rc.offset + rc.size);
                skip_shards[c] = Some(dbs);
                futs.push(Box::pin(fut.map(move |r| (c + scols, r))) as ColFut);
            }
        }

        let mut skip_errors = FixedBitSet::with_capacity(rm.scols);
        for (tag, r) in future::join_all(futs).await {
            if let Err(e) = r {
                if tag < rm.scols {
                    warn!(column = tag, error = %e,
                          "dRAID parity read failed");
                    rm.col[tag].error = Some(e);
                } else {
                    warn!(column = tag - rm.scols, error = %e,
                          "dRAID skip sector read failed");
                    skip_errors.insert(tag - rm.scols);
                }
            }
        }

        // Assemble the shards: data columns first, then parity, every one
        // padded to the parity size.
        let data = dbi.try_mut().unwrap().freeze();
        let ndata = vdc.ndata as usize;
        let mut shards: Vec<Option<Vec<u8>>> = Vec::with_capacity(rm.scols);
        let mut doff = 0usize;
        for c in rm.firstdatacol..rm.scols {
            let rc = &rm.col[c];
            let len = rc.size as usize;
            let needs_skip = rc.size < rm.parity_size && rm.nskip > 0;
            let good = if c < rm.cols {
                col_ok(rc) && !skip_errors.contains(c) &&
                    (!needs_skip || skip_shards[c].is_some())
            } else {
                // Pure skip column: usable iff its sector was readable
                skip_shards[c].is_some() && !skip_errors.contains(c)
            };
            if !good {
                doff += len;
                shards.push(None);
                continue;
            }
            let mut shard = Vec::with_capacity(rm.parity_size as usize);
            shard.extend_from_slice(&data[doff..doff + len]);
            doff += len;
            if let Some(dbs) = &skip_shards[c] {
                shard.extend_from_slice(&dbs.try_const().unwrap()[..]);
            }
            // Scrub layouts carry their skip bytes in the column reads
            // themselves, so a full-length shard may already be in hand
            debug_assert_eq!(shard.len(), rm.parity_size as usize);
            shards.push(Some(shard));
        }
        for c in 0..rm.firstdatacol {
            let rc = &rm.col[c];
            if col_ok(rc) {
                shards.push(Some(
                    parity_dbs[c].try_const().unwrap().to_vec()));
            } else {
                shards.push(None);
            }
        }
        drop(data);

        let survivors = shards.iter().filter(|s| s.is_some()).count();
        if survivors < ndata {
            warn!(survivors, ndata, "dRAID stripe is unreadable");
            return Err(Error::IoError);
        }

        self.codec.reconstruct(&mut shards)?;

        // Copy the rebuilt columns into the caller's buffer
        let mut out = dbi.try_mut().unwrap();
        for c in rm.firstdatacol..rm.scols {
            let rc = &rm.col[c];
            let len = rc.size as usize;
            if len == 0 {
                continue;
            }
            let mut dst = out.split_to(len);
            let rebuilt = (c < rm.cols && !col_ok(&rm.col[c])) ||
                skip_errors.contains(c);
            if rebuilt {
                let shard = shards[c - rm.firstdatacol].as_ref().unwrap();
                dst[..].copy_from_slice(&shard[..len]);
            }
        }
        drop(out);

        if flags.repair_read() {
            self.repair_columns(rm, children, dbi, &parity_dbs).await;
        }
        Ok(())
    }

    /// Flush every child's write cache.
    pub fn flush(&self) -> BoxVdevFut {
        use futures::{TryFutureExt, TryStreamExt,
                      stream::FuturesUnordered};
        let fut = self.children().iter()
            .map(Child::flush)
            .collect::<FuturesUnordered<_>>()
            .try_collect::<Vec<_>>()
            .map_ok(drop);
        Box::pin(fut)
    }
}
