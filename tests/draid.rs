// vim: tw=80
//! Functional tests for the dRAID vdev, using RAM-backed leaf devices.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use divbuf::DivBufShared;
use futures::future;
use pretty_assertions::assert_eq;
use rand::RngCore;

use draid::{
    draid::*,
    label::*,
    types::*,
    vdev::*,
};

const SECTOR: usize = 4096;

/// A RAM-backed leaf device.  Stores sectors sparsely so that row-sized
/// offsets don't cost row-sized memory.
struct RamVdev {
    uuid: Uuid,
    asize: u64,
    sectors: Mutex<HashMap<u64, Vec<u8>>>,
    readable: AtomicBool,
    writeable: AtomicBool,
    /// Readable, but every read fails
    fail_reads: AtomicBool,
}

impl RamVdev {
    fn new(asize: u64) -> Arc<Self> {
        Arc::new(RamVdev {
            uuid: Uuid::new_v4(),
            asize,
            sectors: Mutex::new(HashMap::new()),
            readable: AtomicBool::new(true),
            writeable: AtomicBool::new(true),
            fail_reads: AtomicBool::new(false),
        })
    }

    fn set_readable(&self, v: bool) {
        self.readable.store(v, Ordering::Relaxed);
    }

    fn set_fail_reads(&self, v: bool) {
        self.fail_reads.store(v, Ordering::Relaxed);
    }

    /// Directly read raw device contents, bypassing the vdev layer.
    fn peek(&self, offset: u64, len: usize) -> Vec<u8> {
        assert_eq!(offset as usize % SECTOR, 0);
        let sectors = self.sectors.lock().unwrap();
        let mut v = Vec::with_capacity(len);
        let mut sector = offset / SECTOR as u64;
        while v.len() < len {
            match sectors.get(&sector) {
                Some(s) => v.extend_from_slice(s),
                None => v.extend_from_slice(&[0u8; SECTOR]),
            }
            sector += 1;
        }
        v.truncate(len);
        v
    }

    /// Directly overwrite raw device contents, bypassing the vdev layer.
    fn poke(&self, offset: u64, data: &[u8]) {
        assert_eq!(offset as usize % SECTOR, 0);
        assert_eq!(data.len() % SECTOR, 0);
        let mut sectors = self.sectors.lock().unwrap();
        for (i, chunk) in data.chunks_exact(SECTOR).enumerate() {
            sectors.insert(offset / SECTOR as u64 + i as u64,
                           chunk.to_vec());
        }
    }
}

impl VdevLeafApi for RamVdev {
    fn open(&self) -> Result<()> {
        if self.readable.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(Error::NoEntry)
        }
    }

    fn close(&self) {}

    fn asize(&self) -> u64 {
        self.asize
    }

    fn ashift(&self) -> u64 {
        12
    }

    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn readable(&self) -> bool {
        self.readable.load(Ordering::Relaxed)
    }

    fn writeable(&self) -> bool {
        self.writeable.load(Ordering::Relaxed)
    }

    fn has_trim(&self) -> bool {
        false
    }

    fn dtl_contains(&self, _kind: DtlKind, _txg: TxgT, _size: u64) -> bool {
        false
    }

    fn read_at(&self, buf: IoVecMut, offset: u64) -> BoxVdevFut {
        self.readv_at(vec![buf], offset)
    }

    fn readv_at(&self, mut bufs: SGListMut, offset: u64) -> BoxVdevFut {
        if !self.readable() || self.fail_reads.load(Ordering::Relaxed) {
            return Box::pin(future::err(Error::IoError));
        }
        let mut off = offset;
        for buf in bufs.iter_mut() {
            let data = self.peek(off, buf.len());
            buf[..].copy_from_slice(&data);
            off += buf.len() as u64;
        }
        Box::pin(future::ok::<(), Error>(()))
    }

    fn write_at(&self, buf: IoVec, offset: u64) -> BoxVdevFut {
        self.writev_at(vec![buf], offset)
    }

    fn writev_at(&self, bufs: SGList, offset: u64) -> BoxVdevFut {
        if !self.writeable() {
            return Box::pin(future::err(Error::IoError));
        }
        let mut flat = Vec::new();
        for buf in &bufs {
            flat.extend_from_slice(&buf[..]);
        }
        self.poke(offset, &flat);
        Box::pin(future::ok::<(), Error>(()))
    }

    fn trim(&self, _offset: u64, _len: u64) -> BoxVdevFut {
        Box::pin(future::err(Error::NotSupported))
    }

    fn flush(&self) -> BoxVdevFut {
        Box::pin(future::ok::<(), Error>(()))
    }
}

/// 64 MiB per device: four rows
const DEV_ASIZE: u64 = 64 * 1024 * 1024;

fn ram_pool(params: &DraidParams)
    -> (Vec<Arc<RamVdev>>, Arc<VdevDraid>)
{
    let devs = (0..params.children)
        .map(|_| RamVdev::new(DEV_ASIZE))
        .collect::<Vec<_>>();
    let children = devs.iter()
        .map(|d| Child::leaf(d.clone() as Arc<dyn VdevLeafApi>))
        .collect::<Vec<_>>();
    let vd = VdevDraid::open(params, children,
                             Arc::new(CleanDtl::default()))
        .unwrap();
    (devs, vd)
}

fn params_14() -> DraidParams {
    DraidParams { ndata: 8, nparity: 1, nspares: 2, children: 14,
                  ngroups: 4 }
}

fn random_buf(len: usize) -> (DivBufShared, Vec<u8>) {
    let mut v = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut v);
    (DivBufShared::from(v.clone()), v)
}

async fn write_block(vd: &Arc<VdevDraid>, offset: u64, len: usize)
    -> Vec<u8>
{
    let (dbs, payload) = random_buf(len);
    vd.clone().write_at(dbs.try_const().unwrap(), offset).await.unwrap();
    payload
}

async fn read_block(vd: &Arc<VdevDraid>, offset: u64, len: usize,
                    flags: IoFlags) -> Result<Vec<u8>>
{
    let dbs = DivBufShared::from(vec![0u8; len]);
    vd.clone().read_at(dbs.try_mut().unwrap(), offset, flags, None).await?;
    Ok(dbs.try_const().unwrap().to_vec())
}

#[tokio::test]
async fn write_read_roundtrip() {
    let (_devs, vd) = ram_pool(&params_14());
    let groupsz = vd.config().groupsz;

    // A padded single-sector block, a full multi-row stripe, and a block
    // in the wrapping second group
    for (offset, len) in [(0u64, SECTOR), (vd.asize(SECTOR as u64), 65536),
                          (groupsz, 65536)] {
        let payload = write_block(&vd, offset, len).await;
        let read = read_block(&vd, offset, len, IoFlags::default()).await
            .unwrap();
        assert_eq!(payload, read, "offset {offset} len {len}");
    }
}

/// Any single child can die and every block is still readable, bit-exact.
#[tokio::test]
async fn degraded_read_single_failure() {
    let (devs, vd) = ram_pool(&params_14());
    let payload = write_block(&vd, 0, 65536).await;
    let small = write_block(&vd, vd.asize(65536), SECTOR).await;

    for dev in &devs {
        dev.set_readable(false);
        let read = read_block(&vd, 0, 65536, IoFlags::default()).await
            .unwrap();
        assert_eq!(payload, read);
        let read = read_block(&vd, vd.asize(65536), SECTOR,
                              IoFlags::default()).await.unwrap();
        assert_eq!(small, read);
        dev.set_readable(true);
    }
}

/// Double parity survives any two simultaneous failures.
#[tokio::test]
async fn degraded_read_double_failure() {
    let params = DraidParams { ndata: 4, nparity: 2, nspares: 1,
                               children: 10, ngroups: 3 };
    let (devs, vd) = ram_pool(&params);
    let payload = write_block(&vd, 0, 32768).await;

    for i in 0..devs.len() {
        for j in (i + 1)..devs.len() {
            devs[i].set_readable(false);
            devs[j].set_readable(false);
            let read = read_block(&vd, 0, 32768, IoFlags::default()).await
                .unwrap();
            assert_eq!(payload, read, "failed devices {i} and {j}");
            devs[i].set_readable(true);
            devs[j].set_readable(true);
        }
    }
}

/// A device which errors reads (rather than disappearing) also forces
/// reconstruction.
#[tokio::test]
async fn read_error_recovery() {
    let (devs, vd) = ram_pool(&params_14());
    let payload = write_block(&vd, 0, SECTOR).await;

    for dev in &devs {
        dev.set_fail_reads(true);
        let read = read_block(&vd, 0, SECTOR, IoFlags::default()).await
            .unwrap();
        assert_eq!(payload, read);
        dev.set_fail_reads(false);
    }
}

/// A sequential rebuild read is just a group-aligned read.
#[tokio::test]
async fn rebuild_read() {
    let (devs, vd) = ram_pool(&params_14());
    // An exact multiple of the data width: no skip sectors
    let payload = write_block(&vd, 0, 65536).await;
    devs[3].set_readable(false);
    let flags = IoFlags { rebuild: true, ..Default::default() };
    let read = read_block(&vd, 0, 65536, flags).await.unwrap();
    assert_eq!(payload, read);
}

mod scrub {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn healthy() {
        let (_devs, vd) = ram_pool(&params_14());
        let payload = write_block(&vd, 0, SECTOR).await;
        let flags = IoFlags { scrub: true, ..Default::default() };
        let read = read_block(&vd, 0, SECTOR, flags).await.unwrap();
        assert_eq!(payload, read);
    }

    /// Scrub reads the zero filled skip sectors back and verifies them;
    /// silent corruption there is invisible to a normal read but not to a
    /// scrub.
    #[tokio::test]
    async fn corrupted_skip_sector() {
        let (devs, vd) = ram_pool(&params_14());
        let payload = write_block(&vd, 0, SECTOR).await;

        // Clobber the on-disk skip sector of the last stripe column
        let rm = RowMap::new(vd.config(), 0, SECTOR as u64);
        let rc = &rm.col[rm.scols - 1];
        assert_eq!(rc.size, 0);
        devs[rc.devidx].poke(rc.offset, &[0xffu8; SECTOR]);

        // A normal read doesn't touch skip sectors
        let read = read_block(&vd, 0, SECTOR, IoFlags::default()).await
            .unwrap();
        assert_eq!(payload, read);

        // A scrub does
        let flags = IoFlags { scrub: true, ..Default::default() };
        let e = read_block(&vd, 0, SECTOR, flags).await.unwrap_err();
        assert_eq!(e, Error::ChecksumMismatch);
    }

    /// Scrubbing a degraded stripe reconstructs from the skip sectors.
    #[tokio::test]
    async fn degraded() {
        let (devs, vd) = ram_pool(&params_14());
        let payload = write_block(&vd, 0, SECTOR).await;

        let rm = RowMap::new(vd.config(), 0, SECTOR as u64);
        let data_dev = rm.col[rm.firstdatacol].devidx;
        devs[data_dev].set_readable(false);

        let flags = IoFlags { scrub: true, ..Default::default() };
        let read = read_block(&vd, 0, SECTOR, flags).await.unwrap();
        assert_eq!(payload, read);
    }

    /// A 10-child single-parity layout scrubs through a child failure.
    #[tokio::test]
    async fn degraded_narrow() {
        let params = DraidParams { ndata: 4, nparity: 1, nspares: 1,
                                   children: 10, ngroups: 9 };
        let (devs, vd) = ram_pool(&params);
        // Two sectors: one short column plus skip padding
        let payload = write_block(&vd, 0, 2 * SECTOR).await;

        let rm = RowMap::new(vd.config(), 0, 2 * SECTOR as u64);
        assert!(rm.nskip > 0);
        devs[rm.col[rm.firstdatacol].devidx].set_readable(false);

        let flags = IoFlags { scrub: true, ..Default::default() };
        let read = read_block(&vd, 0, 2 * SECTOR, flags).await.unwrap();
        assert_eq!(payload, read);
    }
}

mod spare {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn open_validation() {
        let (_devs, vd) = ram_pool(&params_14());
        let tops = [vd.clone()];

        assert!(DraidSpare::open("draid1-0-0", &tops).is_ok());
        assert!(DraidSpare::open("draid1-0-1", &tops).is_ok());
        // Wrong parity level
        assert_eq!(DraidSpare::open("draid2-0-0", &tops).unwrap_err(),
                   Error::InvalidInput);
        // No such top-level vdev
        assert_eq!(DraidSpare::open("draid1-1-0", &tops).unwrap_err(),
                   Error::InvalidInput);
        // Spare id out of range
        assert_eq!(DraidSpare::open("draid1-0-2", &tops).unwrap_err(),
                   Error::InvalidInput);
        // Malformed
        assert_eq!(DraidSpare::open("draid1-0", &tops).unwrap_err(),
                   Error::InvalidInput);
    }

    #[tokio::test]
    async fn sizes() {
        let (_devs, vd) = ram_pool(&params_14());
        let spare = DraidSpare::open("draid1-0-0", &[vd.clone()]).unwrap();
        assert_eq!(spare.asize().unwrap(), DEV_ASIZE);
        assert_eq!(spare.psize().unwrap(),
                   DEV_ASIZE + LABEL_START_SIZE + LABEL_END_SIZE);
    }

    /// Data written through the spare reads back, and lands on the child
    /// selected by the tail of the permutation.
    #[tokio::test]
    async fn io_roundtrip() {
        let (_devs, vd) = ram_pool(&params_14());
        let spare = DraidSpare::open("draid1-0-0", &[vd.clone()]).unwrap();
        let devslicesz = vd.config().devslicesz;

        // One offset in the first slice, one in the second
        for offset in [0u64, devslicesz + 8 * SECTOR as u64] {
            let (dbs, payload) = random_buf(SECTOR);
            spare.writev_at_data(vec![dbs.try_const().unwrap()], offset)
                .await.unwrap();

            let rdbs = DivBufShared::from(vec![0u8; SECTOR]);
            spare.readv_at_data(vec![rdbs.try_mut().unwrap()], offset)
                .await.unwrap();
            assert_eq!(&rdbs.try_const().unwrap()[..], &payload[..]);

            // And the bytes live on the resolved child
            match spare.get_child(offset).unwrap() {
                Child::Leaf(leaf) => {
                    let dbs2 = DivBufShared::from(vec![0u8; SECTOR]);
                    leaf.read_at(dbs2.try_mut().unwrap(), offset)
                        .await.unwrap();
                    assert_eq!(&dbs2.try_const().unwrap()[..],
                               &payload[..]);
                }
                _ => panic!("expected a leaf"),
            }
        }
    }

    #[tokio::test]
    async fn label_range_semantics() {
        let (_devs, vd) = ram_pool(&params_14());
        let spare = DraidSpare::open("draid1-0-0", &[vd.clone()]).unwrap();

        // Probe reads of the label region succeed with zeroed data
        let dbs = DivBufShared::from(vec![0xffu8; SECTOR]);
        let probe = IoFlags { probe: true, ..Default::default() };
        spare.read_at(dbs.try_mut().unwrap(), 0, probe).await.unwrap();
        assert!(dbs.try_const().unwrap().iter().all(|b| *b == 0));

        // Other label reads fail
        let dbs = DivBufShared::from(vec![0u8; SECTOR]);
        let e = spare.read_at(dbs.try_mut().unwrap(), 0,
                              IoFlags::default())
            .await.unwrap_err();
        assert_eq!(e, Error::IoError);

        // The tail label region behaves the same
        let tail = spare.psize().unwrap() - LABEL_END_SIZE;
        let dbs = DivBufShared::from(vec![0u8; SECTOR]);
        let e = spare.read_at(dbs.try_mut().unwrap(), tail,
                              IoFlags::default())
            .await.unwrap_err();
        assert_eq!(e, Error::IoError);

        // Config writers may "write" labels; the bits go nowhere
        let dbs = DivBufShared::from(vec![0u8; SECTOR]);
        let cw = IoFlags { config_writer: true, ..Default::default() };
        spare.write_at(dbs.try_const().unwrap(), 0, cw).await.unwrap();

        // Ordinary label writes fail
        let dbs = DivBufShared::from(vec![0u8; SECTOR]);
        let e = spare.write_at(dbs.try_const().unwrap(), 0,
                               IoFlags::default())
            .await.unwrap_err();
        assert_eq!(e, Error::IoError);
    }

    #[tokio::test]
    async fn trim_unsupported() {
        let (_devs, vd) = ram_pool(&params_14());
        let spare = DraidSpare::open("draid1-0-0", &[vd.clone()]).unwrap();
        let e = spare.trim_data(0, SECTOR as u64).await.unwrap_err();
        assert_eq!(e, Error::NotSupported);
    }

    #[tokio::test]
    async fn config() {
        let (_devs, vd) = ram_pool(&params_14());
        let spare = DraidSpare::open("draid1-0-0", &[vd.clone()]).unwrap();
        assert!(!spare.is_active());

        let pool = PoolIdent {
            name: "tank".to_string(),
            guid: Uuid::new_v4(),
            txg: TxgT(42),
            version: 5000,
        };
        let config = spare.read_config(&pool, &[spare.clone()]).unwrap();
        assert!(config.is_spare);
        assert_eq!(config.pool_name, "tank");
        assert_eq!(config.pool_guid, pool.guid);
        assert_eq!(config.top_guid, vd.uuid());
        assert_eq!(config.state, PoolState::Spare);
        assert_eq!(config.guid, spare.uuid());

        // The config round-trips through serialization like a label
        let serialized = bincode::serialize(&config).unwrap();
        let config2: SpareConfig = bincode::deserialize(&serialized)
            .unwrap();
        assert_eq!(config2.pool_name, config.pool_name);
        assert_eq!(config2.guid, config.guid);
    }

    /// A resilver read through an active spare rewrites columns whose data
    /// belongs on a device that is itself being replaced.
    #[tokio::test]
    async fn resilver_repair() {
        let (_devs, vd) = ram_pool(&params_14());
        let spare = DraidSpare::open("draid1-0-0", &[vd.clone()]).unwrap();
        let payload = write_block(&vd, 0, SECTOR).await;

        let rm = RowMap::new(vd.config(), 0, SECTOR as u64);
        let data_col = &rm.col[rm.firstdatacol];

        // The spare's target slot for this offset
        let spare_target = match spare.get_child(data_col.offset).unwrap() {
            Child::Leaf(leaf) => leaf.uuid(),
            _ => panic!("expected a leaf"),
        };
        let target_idx = (0..vd.nchildren())
            .find(|i| match vd.child(*i) {
                Child::Leaf(leaf) => leaf.uuid() == spare_target,
                _ => false,
            })
            .unwrap();
        assert!(target_idx != data_col.devidx,
                "test requires distinct slots");

        // The spare's target device is being replaced by a fresh one
        let new_dev = RamVdev::new(DEV_ASIZE);
        let repl = InteriorVdev {
            kind: InteriorKind::Replacing,
            children: vec![
                Child::leaf(new_dev.clone() as Arc<dyn VdevLeafApi>)
            ],
        };
        vd.replace_child(target_idx, Child::Interior(Arc::new(repl)));

        // And the spare is attached alongside the data column's device
        let sparing = InteriorVdev {
            kind: InteriorKind::Sparing,
            children: vec![
                vd.child(data_col.devidx),
                Child::Spare(spare.clone()),
            ],
        };
        vd.replace_child(data_col.devidx,
                         Child::Interior(Arc::new(sparing)));
        assert!(spare.is_active());

        let flags = IoFlags { resilver: true, ..Default::default() };
        let read = read_block(&vd, 0, SECTOR, flags).await.unwrap();
        assert_eq!(payload, read);

        // The repair write flowed through the spare onto the replacement
        assert_eq!(new_dev.peek(data_col.offset, SECTOR), payload);
    }
}
