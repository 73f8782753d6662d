// vim: tw=80

//! Per-I/O stripe layout
//!
//! Every dRAID I/O covers exactly one group and allocates a full stripe
//! width.  The `RowMap` records which child each column lands on and how the
//! I/O buffer maps onto the columns.  Unlike raidz, short stripes are padded
//! with zero filled skip sectors so that every column has the same on-disk
//! footprint; the skip sectors are written, participate in parity, and are
//! read back during scrub and resilver.

use divbuf::DivBufShared;

use crate::{
    types::*,
    util::*,
};
use super::geometry::*;

/// One column of a parity stripe.
#[derive(Debug)]
pub struct RowCol {
    /// Index of the target device in the dRAID's child array
    pub devidx: usize,
    /// Byte offset of this column on the child
    pub offset: u64,
    /// Real data bytes carried by this column, before skip padding
    pub size: u64,
    /// First error reported for this column
    pub error: Option<Error>,
    /// An I/O was actually issued to the child
    pub tried: bool,
    /// The column was skipped rather than issued
    pub skipped: bool,
    /// Resilver must rewrite this column even if it reads cleanly
    pub repair: bool,
}

/// Per-I/O layout: an array of column descriptors covering one parity
/// stripe.  Lives for the duration of the I/O.
pub struct RowMap {
    /// Stripe columns; always the full group width
    pub scols: usize,
    /// Populated columns.  Write and scrub layouts treat the full stripe
    /// width as populated so that parity covers the skip sectors.
    pub cols: usize,
    /// Number of columns carrying `q+1` sectors, counted from column 0 with
    /// parity included; equivalently the first skip-padded column
    pub skipstart: usize,
    /// First data column; everything below is parity
    pub firstdatacol: usize,
    /// Zero filled sectors padding the stripe to a full group width
    pub nskip: usize,
    /// Allocated bytes for this I/O, parity and skip padding included
    pub asize: u64,
    /// Length of every populated column after padding, in bytes
    pub parity_size: u64,
    /// Sector size in bytes
    sector: u64,
    pub col: Vec<RowCol>,
}

impl RowMap {
    /// Compute the stripe layout for an I/O of `psize` payload bytes at
    /// `offset`.  Pure geometry; buffers are attached by the layout
    /// methods below.
    pub fn new(vdc: &DraidConfig, offset: u64, psize: u64) -> RowMap {
        let phys = vdc.logical_to_physical(offset);
        let wrap = vdc.group_wrap(phys.groupstart);
        let groupwidth = vdc.groupwidth;

        // The I/O's size in sectors.
        let psize = psize >> vdc.ashift;

        // "Quotient": data sectors on every column past the big ones.
        let q = psize / vdc.ndata;
        // "Remainder": data sectors in the partial stripe row.
        let r = psize - q * vdc.ndata;
        // Columns (parity included) which carry a remainder sector.
        let bc = if r == 0 { 0 } else { r + vdc.nparity };
        debug_assert!(bc < groupwidth);
        // Total data and parity sectors for this I/O.
        let tot = psize + vdc.nparity * (q + u64::from(r != 0));

        let cols = if q == 0 { bc } else { groupwidth };

        let (base, iter) = vdc.map().get_perm(phys.perm);
        let mut physical_offset = phys.offset;
        let mut asize = 0;
        let mut col = Vec::with_capacity(groupwidth as usize);
        for i in 0..groupwidth {
            let c = (phys.groupstart + i) % vdc.ndisks;

            // The group wrapped onto the next row.
            if i == wrap {
                physical_offset += ROW_SIZE;
            }

            let sectors = if i >= cols {
                0
            } else if i < bc {
                q + 1
            } else {
                q
            };
            let size = sectors << vdc.ashift;
            asize += size;

            col.push(RowCol {
                devidx: vdc.map().permute_id(base, iter, c),
                offset: physical_offset,
                size,
                error: None,
                tried: false,
                skipped: false,
                repair: false,
            });
        }
        debug_assert_eq!(asize, tot << vdc.ashift);

        let rm_asize = roundup(tot, groupwidth) << vdc.ashift;
        let nskip = roundup(tot, groupwidth) - tot;
        debug_assert_eq!(rm_asize - asize, nskip << vdc.ashift);
        debug_assert!(nskip < vdc.ndata);
        if bc > 0 {
            debug_assert_eq!(nskip, groupwidth - bc);
        }

        RowMap {
            scols: groupwidth as usize,
            cols: cols as usize,
            skipstart: bc as usize,
            firstdatacol: vdc.nparity as usize,
            nskip: nskip as usize,
            asize: rm_asize,
            parity_size: (q + u64::from(r != 0)) << vdc.ashift,
            sector: vdc.sector(),
            col,
        }
    }

    /// Number of data columns in the full stripe.
    pub fn ndatacols(&self) -> usize {
        self.scols - self.firstdatacol
    }

    fn skip_sector(&self) -> IoVec {
        ZERO_REGION.try_const().unwrap().slice_to(self.sector as usize)
    }

    /// Full-stripe write layout.
    ///
    /// Maps the I/O buffer onto the data columns and promotes the stripe to
    /// its full width: a big column maps `parity_size` bytes of `buf`; a
    /// short column maps its real bytes followed by a borrowed zero skip
    /// sector; an empty column is a single skip sector.  Returns one
    /// `SGList` per data column, each `parity_size` long, suitable both for
    /// parity generation and for issue to the children.
    pub fn write_data_bufs(&mut self, mut buf: IoVec) -> Vec<SGList> {
        let mut bufs = Vec::with_capacity(self.ndatacols());
        for i in self.firstdatacol..self.scols {
            let rc = &self.col[i];
            let mut sglist = SGList::new();
            if self.skipstart == 0 || i < self.skipstart {
                debug_assert_eq!(rc.size, self.parity_size);
                sglist.push(buf.split_to(rc.size as usize));
            } else if i < self.cols {
                debug_assert_eq!(rc.size + self.sector, self.parity_size);
                sglist.push(buf.split_to(rc.size as usize));
                sglist.push(self.skip_sector());
            } else {
                debug_assert_eq!(rc.size, 0);
                debug_assert_eq!(self.sector, self.parity_size);
                sglist.push(self.skip_sector());
            }
            debug_assert_eq!(sglist_len(&sglist), self.parity_size as usize);
            bufs.push(sglist);
        }
        debug_assert!(buf.is_empty());
        self.cols = self.scols;
        bufs
    }

    /// Normal read layout: tight slices of the caller's buffer for the
    /// populated data columns only.  Unpopulated columns yield `None`.
    pub fn read_data_bufs(&self, mut buf: IoVecMut)
        -> Vec<Option<SGListMut>>
    {
        let mut bufs = Vec::with_capacity(self.ndatacols());
        for i in self.firstdatacol..self.scols {
            let rc = &self.col[i];
            if i < self.cols && rc.size > 0 {
                let col = buf.split_to(rc.size as usize);
                bufs.push(Some(vec![col]));
            } else {
                bufs.push(None);
            }
        }
        debug_assert!(buf.is_empty());
        bufs
    }

    /// Scrub/resilver read layout.
    ///
    /// Like the write layout, but skip sectors must be read back and
    /// verified, so they are backed by one linear allocation instead of the
    /// shared zero page.  Returns the per-data-column buffers plus the skip
    /// sector backing store, and promotes the stripe to its full width.
    pub fn scrub_data_bufs(&mut self, mut buf: IoVecMut)
        -> (Vec<SGListMut>, Option<DivBufShared>)
    {
        let skip_dbs = if self.nskip > 0 {
            Some(DivBufShared::from(
                vec![0u8; self.nskip * self.sector as usize]))
        } else {
            None
        };
        let mut skip_bufs = skip_dbs.as_ref().map(|dbs| {
            dbs.try_mut().unwrap()
        });

        let mut bufs = Vec::with_capacity(self.ndatacols());
        for i in self.firstdatacol..self.scols {
            let rc = &self.col[i];
            let mut sglist = SGListMut::new();
            if self.skipstart == 0 || i < self.skipstart {
                sglist.push(buf.split_to(rc.size as usize));
            } else if i < self.cols {
                sglist.push(buf.split_to(rc.size as usize));
                let skip = skip_bufs.as_mut().unwrap()
                    .split_to(self.sector as usize);
                sglist.push(skip);
            } else {
                let skip = skip_bufs.as_mut().unwrap()
                    .split_to(self.sector as usize);
                sglist.push(skip);
            }
            debug_assert_eq!(sglist_len(&sglist), self.parity_size as usize);
            bufs.push(sglist);
        }
        debug_assert!(buf.is_empty());
        debug_assert!(skip_bufs.map(|sb| sb.is_empty()).unwrap_or(true));
        self.cols = self.scols;
        (bufs, skip_dbs)
    }
}
