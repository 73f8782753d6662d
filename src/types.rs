// vim: tw=80
//! Common type definitions used throughout the dRAID crate

use divbuf::{DivBuf, DivBufMut};
use serde_derive::{Deserialize, Serialize};
use serde::{
    Deserialize,
    Serialize,
    Serializer,
    de::Deserializer,
};
use std::fmt::{self, Display, Formatter};

/// A single I/O buffer.  Reference counted, so several views of the same
/// allocation can be in flight at once; a stripe column and the shared zero
/// page both hand out slices this way.
pub type IoVec = DivBuf;

/// Exclusively owned, writable variant of [`IoVec`].
pub type IoVecMut = DivBufMut;

/// A scatter-gather list, the unit of vectored child I/O.  Composite stripe
/// columns are one of these: real data segments followed by zero fill.
pub type SGList = Vec<IoVec>;

/// Exclusively owned, writable variant of [`SGList`].
pub type SGListMut = Vec<IoVecMut>;

/// Transaction group numbers.  Total order over everything ever written to
/// the pool.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq,
         PartialOrd, Serialize)]
pub struct TxgT(pub u64);

impl From<u64> for TxgT {
    fn from(t: u64) -> Self {
        TxgT(t)
    }
}

impl From<TxgT> for u64 {
    fn from(t: TxgT) -> Self {
        t.0
    }
}

/// The dRAID error type.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// No frozen permutation map exists for the requested child count
    NotFound,
    /// Bad geometry, malformed spare name, or other caller error
    InvalidInput,
    /// A generated permutation map disagrees with its recorded checksum, or
    /// parity did not verify
    ChecksumMismatch,
    /// Too many children failed to open
    NoReplicas,
    /// A child returned an error, or a label-range I/O was rejected
    IoError,
    /// The DTL says this range is not current on this child
    Stale,
    /// The child is not readable at all for this offset
    NoEntry,
    /// Trim or ioctl on a child that does not support it
    NotSupported,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            Error::NotFound => "no permutation map for that child count",
            Error::InvalidInput => "invalid input",
            Error::ChecksumMismatch => "checksum mismatch",
            Error::NoReplicas => "too many children unavailable",
            Error::IoError => "I/O error",
            Error::Stale => "data not current on child",
            Error::NoEntry => "child not readable",
            Error::NotSupported => "operation not supported",
        };
        s.fmt(f)
    }
}

impl std::error::Error for Error {}

pub type Result<T = ()> = std::result::Result<T, Error>;

/// Identifies a vdev or pool for the lifetime of the pool.
///
/// Guids appear in vdev labels and in the configuration a distributed
/// spare synthesizes, so their encoding must be fixed-size: a slice-style
/// encoding would prefix a length and change the label layout.  This
/// newtype encodes the guid as its two 64-bit halves instead.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct Uuid(uuid::Uuid);

impl Uuid {
    pub fn new_v4() -> Self {
        Uuid(uuid::Uuid::new_v4())
    }

    pub fn parse_str(input: &str) -> Result<Uuid> {
        uuid::Uuid::parse_str(input)
            .map(Uuid)
            .map_err(|_| Error::InvalidInput)
    }
}

impl<'de> Deserialize<'de> for Uuid {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
        where D: Deserializer<'de>
    {
        <(u64, u64)>::deserialize(deserializer)
            .map(|(hi, lo)| Uuid(uuid::Uuid::from_u64_pair(hi, lo)))
    }
}

impl Display for Uuid {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Serialize for Uuid {
    fn serialize<S>(&self, serializer: S)
        -> std::result::Result<S::Ok, S::Error>
        where S: Serializer
    {
        self.0.as_u64_pair().serialize(serializer)
    }
}
