// vim: tw=80

//! dRAID geometry
//!
//! Pure arithmetic translating the dRAID's logical address space into
//! per-child physical addresses.  A "row" is a 16 MiB chunk at the same
//! offset of every child.  A "group" is `groupwidth` sequential columns
//! holding one parity stripe; groups wrap across rows so that any group
//! width divides evenly into any disk count.  A "slice" is the set of rows
//! holding `ngroups` groups; one permutation applies per slice.

use serde_derive::{Deserialize, Serialize};

use crate::{
    types::*,
    util::*,
};
use super::map::DraidMap;

/// log2 of the row size.  Equal to the pool's maximum block shift: a row on
/// a single child must be able to hold a maximum-sized block's data column.
pub const ROW_SHIFT: u64 = 24;

/// The amount of data written to each child of a group within one
/// permutation.
pub const ROW_SIZE: u64 = 1 << ROW_SHIFT;

/// Largest block the pool can address.
pub const MAX_BLOCK_SIZE: u64 = 1 << ROW_SHIFT;

/// Highest supported parity level.
pub const MAX_PARITY: u64 = 3;

/// dRAID layout parameters, fixed at pool creation.
///
/// These arrive from the pool configuration; everything else about the
/// layout is derived.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct DraidParams {
    /// Data columns per group
    pub ndata: u64,
    /// Parity columns per group
    pub nparity: u64,
    /// Distributed spares
    pub nspares: u64,
    /// Total child devices, including spare capacity
    pub children: u64,
    /// Groups per slice
    pub ngroups: u64,
}

/// Result of translating a logical offset: which permutation applies, where
/// the group starts in the permuted child order, and the byte offset of the
/// stripe on each member child.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Physical {
    pub perm: u64,
    pub groupstart: u64,
    pub offset: u64,
}

/// The per-vdev dRAID configuration: the creation-time parameters, the
/// permutation map they select, and the derived constants.  Built at open,
/// immutable thereafter.
#[derive(Debug)]
pub struct DraidConfig {
    pub ndata: u64,
    pub nparity: u64,
    pub nspares: u64,
    pub children: u64,
    pub ngroups: u64,

    map: DraidMap,

    /// = ndata + nparity
    pub groupwidth: u64,
    /// = children - nspares
    pub ndisks: u64,
    /// = groupwidth * ROW_SIZE
    pub groupsz: u64,
    /// Bytes each child contributes to one slice
    pub devslicesz: u64,

    /// Minimum-sector-size exponent of the pool
    pub ashift: u64,
}

impl DraidConfig {
    /// Validate the parameters and build the configuration, generating the
    /// permutation map for the child count.
    pub fn new(params: &DraidParams, ashift: u64) -> Result<Self> {
        let DraidParams { ndata, nparity, nspares, children, ngroups } =
            *params;

        if !(1..=MAX_PARITY).contains(&nparity) ||
            children < nparity + 1 ||
            ndata == 0 || ngroups == 0 ||
            !(9..=16).contains(&ashift)
        {
            return Err(Error::InvalidInput);
        }

        let groupwidth = ndata + nparity;
        if children <= nspares || groupwidth > children - nspares {
            return Err(Error::InvalidInput);
        }
        let ndisks = children - nspares;
        if (groupwidth * ngroups) % ndisks != 0 {
            return Err(Error::InvalidInput);
        }

        let map = DraidMap::open(children)?;

        let groupsz = groupwidth * ROW_SIZE;
        let devslicesz = (groupsz * ngroups) / ndisks;
        debug_assert!(groupwidth >= 2);
        debug_assert!(devslicesz >= ROW_SIZE);
        debug_assert_eq!(devslicesz % ROW_SIZE, 0);

        Ok(DraidConfig {
            ndata, nparity, nspares, children, ngroups,
            map,
            groupwidth, ndisks, groupsz, devslicesz,
            ashift,
        })
    }

    pub fn map(&self) -> &DraidMap {
        &self.map
    }

    /// The pool's minimum sector size in bytes.
    pub fn sector(&self) -> u64 {
        1 << self.ashift
    }

    /// Sectors per row on one child.
    fn blocks_per_row(&self) -> u64 {
        ROW_SIZE >> self.ashift
    }

    /// Given a logical offset, return the permutation index, the group's
    /// starting column within the permuted child order, and the byte offset
    /// of the stripe on the first group member.
    pub fn logical_to_physical(&self, offset: u64) -> Physical {
        // The sector offset within a group chunk.  Allocations are always
        // full stripes, so it is a multiple of the group width.
        let b_offset = (offset >> self.ashift) %
            (self.blocks_per_row() * self.groupwidth);
        debug_assert_eq!(b_offset % self.groupwidth, 0);

        let group = offset / self.groupsz;
        let groupstart = (group * self.groupwidth) % self.ndisks;

        // Each permutation covers (groupwidth * ngroups) / ndisks rows.
        // Find the row where this group begins.
        let perm = group / self.ngroups;
        let row = perm * ((self.groupwidth * self.ngroups) / self.ndisks) +
            ((group % self.ngroups) * self.groupwidth) / self.ndisks;

        let offset = (self.blocks_per_row() * row +
                      b_offset / self.groupwidth) << self.ashift;
        Physical { perm, groupstart, offset }
    }

    /// The group number containing a logical offset.
    pub fn offset_to_group(&self, offset: u64) -> u64 {
        offset / self.groupsz
    }

    /// The logical starting offset of a group.
    pub fn group_to_offset(&self, group: u64) -> u64 {
        group * self.groupsz
    }

    /// The column at which a group starting at `groupstart` wraps onto the
    /// next row, or `groupwidth` if it doesn't wrap.
    pub fn group_wrap(&self, groupstart: u64) -> u64 {
        if groupstart + self.groupwidth > self.ndisks {
            self.ndisks - groupstart
        } else {
            self.groupwidth
        }
    }

    /// Round a logical offset up to the next group-width-aligned allocation
    /// boundary.
    pub fn astart(&self, offset: u64) -> u64 {
        roundup(offset, self.groupwidth << self.ashift)
    }

    /// The allocated size for a payload of `psize` bytes: the payload
    /// rounded up to full stripe rows, parity and skip padding included.
    pub fn asize(&self, psize: u64) -> u64 {
        debug_assert!(psize > 0);
        let rows = (psize - 1) / (self.ndata << self.ashift) + 1;
        let asize = (rows * self.groupwidth) << self.ashift;

        debug_assert!(asize <= self.groupsz);
        debug_assert_eq!(asize % self.groupwidth, 0);
        asize
    }

    /// Deflate an allocated size back to the payload size, stripping parity
    /// and skip padding.
    pub fn asize_to_psize(&self, asize: u64) -> u64 {
        debug_assert_eq!(asize % self.groupwidth, 0);
        (asize / self.groupwidth) * self.ndata
    }

    /// Align a metaslab to the group width.  Full stripe writes make any
    /// remainder unallocatable, and initialize/TRIM expect translation
    /// requests on aligned boundaries.
    pub fn metaslab_init(&self, ms_start: u64, ms_size: u64) -> (u64, u64) {
        let sz = self.groupwidth << self.ashift;
        let astart = self.astart(ms_start);
        let asize = ((ms_size - (astart - ms_start)) / sz) * sz;

        debug_assert_eq!(astart % sz, 0);
        debug_assert_eq!(asize % sz, 0);
        (astart, asize)
    }

    /// The asize of the largest block which can be rebuilt with I/Os of at
    /// most `max_segment` bytes per child.
    ///
    /// When the payload does not divide evenly by the data width the
    /// remainder sectors are discarded, otherwise the skip padding would
    /// make `asize_to_psize` report a payload larger than the maximum
    /// allowed block size.
    pub fn max_rebuildable_asize(&self, max_segment: u64) -> u64 {
        let psize = std::cmp::min(
            roundup(max_segment * self.ndata, self.sector()),
            MAX_BLOCK_SIZE);

        let psize = ((psize >> self.ashift) / self.ndata * self.ndata)
            << self.ashift;
        self.asize(psize)
    }

    /// Usable capacity of the whole dRAID given the smallest child's
    /// capacity: rounded down to full rows, scaled by the data disk count,
    /// then rounded down to full groups.
    pub fn usable_asize(&self, child_asize: u64) -> u64 {
        let child_asize = (child_asize / ROW_SIZE) * ROW_SIZE;
        ((child_asize * self.ndisks) / self.groupsz) * self.groupsz
    }
}
