// vim: tw=80

use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::types::*;
use super::sgcursor::*;

/// An encoder/decoder for Reed-Solomon erasure coding in GF(2^8), oriented
/// towards RAID applications
///
/// dRAID reuses the raidz parity math unchanged; this type is the seam.
/// Parity is generated over a full stripe of equally sized columns (skip
/// padding included), and reconstruction accepts any `k` surviving columns.
pub struct Codec {
    /// Total number of columns in the RAID stripe
    ///
    /// GF(2^8) works with up to 255 columns.
    m: u32,

    /// Redundancy level of the RAID array.
    ///
    /// This many columns may be lost before the data becomes irrecoverable.
    f: u32,

    rs: ReedSolomon,
}

impl Codec {
    /// Initialize a new erasure codec
    ///
    /// # Parameters
    ///
    /// - `stripesize`: Total number of columns in the RAID stripe.  May be
    ///                 up to 255.
    /// - `redundancy`: Redundancy level of the RAID array.  This many
    ///                 columns may be lost before the data becomes
    ///                 irrecoverable.
    pub fn new(stripesize: u32, redundancy: u32) -> Self {
        let m = stripesize;
        let f = redundancy;
        debug_assert!(f >= 1 && f < m);
        let rs = ReedSolomon::new((m - f) as usize, f as usize).unwrap();
        Codec { m, f, rs }
    }

    /// Generate parity columns from a complete set of data columns
    ///
    /// # Parameters
    /// - `len`:    Size of each column, in bytes
    /// - `data`:   Input array: `k` columns of `len` bytes each
    /// - `parity`: Storage for parity columns.  `f` columns of `len` bytes
    ///             each; will be populated upon return.
    pub fn encode(&self, len: usize, data: &[&[u8]], parity: &mut [Vec<u8>]) {
        debug_assert_eq!(data.len(), (self.m - self.f) as usize);
        debug_assert_eq!(parity.len(), self.f as usize);
        debug_assert!(data.iter().all(|d| d.len() == len));
        debug_assert!(parity.iter().all(|p| p.len() == len));
        let mut prefs = parity.iter_mut()
            .map(|v| &mut v[..])
            .collect::<Vec<_>>();
        self.rs.encode_sep(data, &mut prefs[..]).unwrap();
    }

    /// Encode parity, using vectored input
    ///
    /// Like `encode`, but the data columns may be discontiguous, and each
    /// may have a different segment structure.  Parity is a bytewise linear
    /// combination of the data columns, so the stripe is encoded in runs
    /// bounded by the shortest segment at each position.
    pub fn encodev(&self, len: usize, data: &[SGList],
                   parity: &mut [Vec<u8>])
    {
        let mut cursors: Vec<SGCursor> =
            data.iter()
                .map(SGCursor::from)
                .collect();
        let mut l = 0;
        while l < len {
            let ncl =
                cursors.iter()
                       .map(SGCursor::peek_len)
                       .min().unwrap();
            let iovecs = cursors.iter_mut()
                .map(|sg| sg.next(ncl).unwrap())
                .collect::<Vec<_>>();
            let refs = iovecs.iter()
                .map(|iovec| &iovec[..])
                .collect::<Vec<_>>();
            let mut prefs: Vec<&mut [u8]> = parity.iter_mut()
                .map(|v| &mut v[l..l + ncl])
                .collect();
            self.rs.encode_sep(&refs[..], &mut prefs[..]).unwrap();
            l += ncl;
        }
    }

    /// Verify that the parity columns match the data columns.
    ///
    /// # Parameters
    /// - `shards`: All `m` columns in stripe order, data before parity,
    ///             each the same length.
    pub fn verify(&self, shards: &[Vec<u8>]) -> bool {
        debug_assert_eq!(shards.len(), self.m as usize);
        self.rs.verify(shards).unwrap_or(false)
    }

    /// Reconstruct missing columns from the survivors
    ///
    /// # Parameters
    ///
    /// - `shards`: All `m` columns in stripe order, data before parity.
    ///             Missing columns are `None` and are populated upon
    ///             successful return; the rest must all be the same length.
    ///
    /// Fails with `IoError` when fewer than `k` columns survive.
    pub fn reconstruct(&self, shards: &mut [Option<Vec<u8>>]) -> Result<()> {
        debug_assert_eq!(shards.len(), self.m as usize);
        self.rs.reconstruct(shards).map_err(|_| Error::IoError)
    }

    /// Return the degree of redundancy
    pub fn protection(&self) -> u32 {
        self.f
    }

    /// Return the total number of columns in the raid stripe
    pub fn stripesize(&self) -> u32 {
        self.m
    }
}

#[cfg(test)]
mod tests {
    use divbuf::DivBufShared;
    use itertools::Itertools;
    use pretty_assertions::assert_eq;
    use rand::Rng;
    use super::*;

    fn random_column(len: usize) -> Vec<u8> {
        let mut rng = rand::thread_rng();
        (0..len).map(|_| rng.gen()).collect()
    }

    // Roundtrip data through the codec for various array sizes and erasure
    // sets
    #[test]
    fn comprehensive() {
        let cfgs = [
            (3, 1), (9, 1),
            (4, 2), (10, 2),
            (6, 3), (19, 3),
        ];
        let len = 64;

        for (m, f) in cfgs {
            let k = m - f;
            let codec = Codec::new(m as u32, f as u32);

            let data: Vec<Vec<u8>> = (0..k).map(|_| random_column(len))
                .collect();
            let mut parity = vec![vec![0u8; len]; f];
            let drefs: Vec<&[u8]> = data.iter().map(|v| &v[..]).collect();
            codec.encode(len, &drefs, &mut parity);

            // Iterate over all possible failure combinations
            for erasures in (0..m).combinations(f) {
                // Skip the combination where only parity is missing
                if erasures[0] >= k {
                    continue;
                }
                let mut shards: Vec<Option<Vec<u8>>> = data.iter()
                    .chain(parity.iter())
                    .cloned()
                    .map(Some)
                    .collect();
                for e in &erasures {
                    shards[*e] = None;
                }
                codec.reconstruct(&mut shards).unwrap();
                for e in &erasures {
                    if *e < k {
                        assert_eq!(shards[*e].as_ref().unwrap(), &data[*e],
                            "miscompare for m={m:?}, f={f:?}, \
                             erasures={erasures:?}");
                    }
                }
            }
        }
    }

    // Test encoding from discontiguous data columns
    #[test]
    fn encodev() {
        let len = 16;
        let codec = Codec::new(3, 1);

        // First, make the reference parity using contiguous encode
        let da0 = random_column(len);
        let da1 = random_column(len);
        let mut pa = vec![vec![0u8; len]];
        codec.encode(len, &[&da0[..], &da1[..]], &mut pa);

        // Next, split the same data into misaligned SGLists
        let chop = |v: &[u8], at: &[usize]| -> SGList {
            let mut sg = SGList::new();
            let mut prev = 0;
            for &i in at.iter().chain(std::iter::once(&v.len())) {
                let dbs = DivBufShared::from(Vec::from(&v[prev..i]));
                sg.push(dbs.try_const().unwrap());
                prev = i;
            }
            sg
        };
        let sg0 = chop(&da0, &[4, 9, 14]);
        let sg1 = chop(&da1, &[4, 8, 14]);

        let mut pv = vec![vec![0u8; len]];
        codec.encodev(len, &[sg0, sg1], &mut pv);

        assert_eq!(pa, pv);
    }

    #[test]
    fn verify_detects_corruption() {
        let len = 32;
        let codec = Codec::new(5, 2);
        let data: Vec<Vec<u8>> = (0..3).map(|_| random_column(len)).collect();
        let mut parity = vec![vec![0u8; len]; 2];
        let drefs: Vec<&[u8]> = data.iter().map(|v| &v[..]).collect();
        codec.encode(len, &drefs, &mut parity);

        let mut shards: Vec<Vec<u8>> = data.iter().chain(parity.iter())
            .cloned().collect();
        assert!(codec.verify(&shards));
        shards[1][7] ^= 0xa5;
        assert!(!codec.verify(&shards));
    }

    #[test]
    fn too_few_survivors() {
        let len = 8;
        let codec = Codec::new(4, 1);
        let data: Vec<Vec<u8>> = (0..3).map(|_| random_column(len)).collect();
        let mut parity = vec![vec![0u8; len]];
        let drefs: Vec<&[u8]> = data.iter().map(|v| &v[..]).collect();
        codec.encode(len, &drefs, &mut parity);

        let mut shards: Vec<Option<Vec<u8>>> = data.into_iter()
            .chain(parity)
            .map(Some)
            .collect();
        shards[0] = None;
        shards[2] = None;
        assert_eq!(codec.reconstruct(&mut shards).unwrap_err(),
                   Error::IoError);
    }
}
