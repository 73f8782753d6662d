// vim: tw=80
//! On-disk label geometry and pool identity
//!
//! Real label I/O belongs to the surrounding engine.  This module only
//! records the reserved regions at both ends of every leaf-shaped vdev,
//! which the distributed spare must simulate, and the pool identity fields
//! that a spare's synthesized configuration reports.

use serde_derive::{Deserialize, Serialize};

use crate::types::*;

/// Size of a single label copy, in bytes.
pub const LABEL_SIZE: u64 = 256 * 1024;

/// Reserved boot region following the front labels.
pub const BOOT_SIZE: u64 = 7 << 19;

/// Reserved region at the front of every leaf vdev: two label copies plus
/// the boot block.
pub const LABEL_START_SIZE: u64 = 2 * LABEL_SIZE + BOOT_SIZE;

/// Reserved region at the end of every leaf vdev: two more label copies.
pub const LABEL_END_SIZE: u64 = 2 * LABEL_SIZE;

/// Identity of the pool that owns a dRAID, as recorded in vdev labels.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PoolIdent {
    pub name: String,
    pub guid: Uuid,
    /// Most recently synced transaction group
    pub txg: TxgT,
    /// On-disk format version
    pub version: u64,
}

/// Pool state recorded in a spare's synthesized configuration.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum PoolState {
    /// The spare is attached and in use
    Active,
    /// The spare is available but idle
    Spare,
}

#[cfg(test)]
mod t {
    use super::*;

    #[test]
    fn reserved_regions() {
        // Frozen: 4 MiB at the front, 512 KiB at the back
        assert_eq!(LABEL_START_SIZE, 4 * 1024 * 1024);
        assert_eq!(LABEL_END_SIZE, 512 * 1024);
    }
}
