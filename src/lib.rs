// vim: tw=80

//! dRAID: a distributed-RAID redundancy layer
//!
//! dRAID sits between a pool's logical address space and its physical child
//! devices, providing raidz-class parity with virtual distributed spares.
//! Because spare capacity is sliced off the tail of every child, a rebuild
//! reads from and writes to all surviving children in parallel instead of
//! funneling through a single replacement disk.
//!
//! The layout is deterministic: a frozen, seed-driven permutation table
//! scatters redundancy groups across the children, and the same table
//! addresses the distributed spares.  Everything here must therefore stay
//! bit-for-bit compatible with existing pools.

pub mod draid;
pub mod label;
pub mod types;
pub mod util;
pub mod vdev;

pub use crate::types::*;
pub use crate::util::*;
