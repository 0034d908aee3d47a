//! Shared test harness: a mock PG parent plus simulated shard stores.
//!
//! The harness captures every sub-op the backend sends, serves it from
//! in-memory per-shard stores, and feeds the replies back through the
//! event entry point, so whole read/write flows run without a cluster.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use ecstore::parent::{PgInfo, PgParent, ShardInfo};
use ecstore::read::{EcAlign, EcExtent};
use ecstore::{ClientWrite, EcBackend, EcConfig, PgEvent};
use ecstore_core::{ErasureCode, ReedSolomonCodec, ShardExtentMap, StripeInfo};
use ecstore_proto::message::{PgStats, SubOpRead, SubOpReadReply, SubOpWrite, SubOpWriteReply};
use ecstore_proto::transaction::TransactionOp;
use ecstore_proto::{ObjectId, PgShard, ReqId, ShardId, SubOpMessage, Version};

pub const K: usize = 2;
pub const M: usize = 1;
pub const CHUNK: u64 = 4096;
pub const STRIPE: u64 = 8192;

pub struct MockParent {
    pub whoami: PgShard,
    pub acting: BTreeSet<PgShard>,
    pub backfill: BTreeSet<PgShard>,
    pub missing: Mutex<BTreeMap<PgShard, BTreeSet<ObjectId>>>,
    pub missing_loc: Mutex<BTreeMap<ObjectId, BTreeSet<PgShard>>>,
    pub rollback_horizon: Mutex<Version>,
    tid: AtomicU64,
    pub sent: Mutex<Vec<(PgShard, SubOpMessage)>>,
    pub local_writes: Mutex<Vec<SubOpWrite>>,
}

impl MockParent {
    pub fn new(n: usize) -> Self {
        let shards: BTreeSet<PgShard> = (0..n)
            .map(|i| PgShard::new(i as u32, ShardId::new(i as u8)))
            .collect();
        Self {
            whoami: PgShard::new(0, ShardId::new(0)),
            acting: shards,
            backfill: BTreeSet::new(),
            missing: Mutex::new(BTreeMap::new()),
            missing_loc: Mutex::new(BTreeMap::new()),
            rollback_horizon: Mutex::new(Version::zero()),
            tid: AtomicU64::new(0),
            sent: Mutex::new(Vec::new()),
            local_writes: Mutex::new(Vec::new()),
        }
    }

    pub fn mark_missing(&self, shard: PgShard, oid: ObjectId) {
        self.missing
            .lock()
            .unwrap()
            .entry(shard)
            .or_default()
            .insert(oid);
    }

    pub fn take_sent(&self) -> Vec<(PgShard, SubOpMessage)> {
        std::mem::take(&mut self.sent.lock().unwrap())
    }

    pub fn take_local_writes(&self) -> Vec<SubOpWrite> {
        std::mem::take(&mut self.local_writes.lock().unwrap())
    }
}

impl PgParent for MockParent {
    fn get_acting_shards(&self) -> BTreeSet<PgShard> {
        self.acting.clone()
    }

    fn get_backfill_shards(&self) -> BTreeSet<PgShard> {
        self.backfill.clone()
    }

    fn get_acting_recovery_backfill_shards(&self) -> BTreeSet<PgShard> {
        self.acting.union(&self.backfill).copied().collect()
    }

    fn get_shard_missing(&self, shard: &PgShard) -> BTreeSet<ObjectId> {
        self.missing
            .lock()
            .unwrap()
            .get(shard)
            .cloned()
            .unwrap_or_default()
    }

    fn get_shard_info(&self, _shard: &PgShard) -> ShardInfo {
        ShardInfo {
            last_backfill: ObjectId::MAX,
            stats: PgStats::default(),
        }
    }

    fn get_missing_loc_shards(&self) -> BTreeMap<ObjectId, BTreeSet<PgShard>> {
        self.missing_loc.lock().unwrap().clone()
    }

    fn whoami_shard(&self) -> PgShard {
        self.whoami
    }

    fn get_tid(&self) -> u64 {
        self.tid.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn get_info(&self) -> PgInfo {
        PgInfo {
            pgid: 1,
            stats: PgStats::default(),
        }
    }

    fn get_osdmap_epoch(&self) -> u64 {
        7
    }

    fn get_interval_start_epoch(&self) -> u64 {
        5
    }

    fn send_cluster_messages(&self, messages: Vec<(PgShard, SubOpMessage)>, _epoch: u64) {
        self.sent.lock().unwrap().extend(messages);
    }

    fn handle_local_sub_write(&self, write: SubOpWrite) {
        self.local_writes.lock().unwrap().push(write);
    }

    fn apply_stats(&self, _oid: ObjectId, _delta: PgStats) {}

    fn can_rollback_to(&self) -> Version {
        *self.rollback_horizon.lock().unwrap()
    }

    fn should_send_op(&self, _shard: &PgShard, _oid: ObjectId) -> bool {
        true
    }

    fn allows_ec_overwrites(&self) -> bool {
        true
    }
}

type ShardStore = HashMap<ObjectId, Vec<u8>>;
type AttrStore = HashMap<ObjectId, BTreeMap<String, Vec<u8>>>;

pub struct TestCluster {
    pub parent: Arc<MockParent>,
    pub backend: EcBackend,
    pub sinfo: Arc<StripeInfo>,
    pub codec: Arc<ReedSolomonCodec>,
    pub stores: HashMap<ShardId, ShardStore>,
    pub attrs: HashMap<ShardId, AttrStore>,
    /// Shards that answer every read with an I/O error.
    pub down: BTreeSet<ShardId>,
}

impl TestCluster {
    pub fn new(cfg: EcConfig) -> Self {
        let codec = Arc::new(ReedSolomonCodec::new(K, M).unwrap());
        let sinfo = Arc::new(StripeInfo::new(codec.as_ref(), STRIPE).unwrap());
        let parent = Arc::new(MockParent::new(K + M));
        let backend = EcBackend::new(
            cfg,
            codec.clone() as Arc<dyn ErasureCode>,
            sinfo.clone(),
            parent.clone(),
        );
        let stores = (0..(K + M) as u8)
            .map(|i| (ShardId::new(i), ShardStore::new()))
            .collect();
        let attrs = (0..(K + M) as u8)
            .map(|i| (ShardId::new(i), AttrStore::new()))
            .collect();
        Self {
            parent,
            backend,
            sinfo,
            codec,
            stores,
            attrs,
            down: BTreeSet::new(),
        }
    }

    /// Write a whole object straight into the shard stores, parity
    /// included, bypassing the pipelines.
    pub fn put_object(&mut self, oid: ObjectId, data: &[u8]) {
        let mut sem = ShardExtentMap::new(self.sinfo.clone());
        sem.insert_ro_buffer(0, data);
        sem.insert_parity_buffers();
        sem.encode(self.codec.as_ref(), None, 0).unwrap();

        for (&shard, emap) in sem.extent_maps() {
            let store = self.stores.get_mut(&shard).unwrap();
            let obj = store.entry(oid).or_default();
            for (off, buf) in emap.iter() {
                write_at(obj, off, buf);
            }
        }
    }

    /// Process queued sub-ops until the cluster is quiescent.
    pub fn pump(&mut self) {
        loop {
            let sent = self.parent.take_sent();
            let locals = self.parent.take_local_writes();
            if sent.is_empty() && locals.is_empty() {
                break;
            }
            for (to, message) in sent {
                match message {
                    SubOpMessage::Read(read) => self.serve_read(to, read),
                    SubOpMessage::Write(write) => self.serve_write(to, write),
                    other => panic!("unexpected outbound message: {:?}", other.tid()),
                }
            }
            for write in locals {
                let to = self.parent.whoami;
                self.serve_write(to, write);
            }
        }
    }

    fn serve_read(&mut self, to: PgShard, read: SubOpRead) {
        let mut reply = SubOpReadReply {
            from: to,
            tid: read.tid,
            ..Default::default()
        };
        if self.down.contains(&to.shard) {
            for oid in read.to_read.keys() {
                reply
                    .errors
                    .insert(*oid, ecstore_proto::EcError::Io);
            }
        } else {
            let store = &self.stores[&to.shard];
            for (oid, extents) in &read.to_read {
                let obj = store.get(oid).cloned().unwrap_or_default();
                let bufs = reply.buffers_read.entry(*oid).or_default();
                for &(off, len, _flags) in extents {
                    bufs.push((off, read_at(&obj, off, len)));
                }
            }
            for oid in &read.attrs_to_read {
                let attrs = self.attrs[&to.shard]
                    .get(oid)
                    .cloned()
                    .unwrap_or_default();
                reply.attrs_read.insert(*oid, attrs);
            }
        }
        self.backend.handle_event(PgEvent::Message {
            from: to,
            message: SubOpMessage::ReadReply(reply),
        });
    }

    fn serve_write(&mut self, to: PgShard, write: SubOpWrite) {
        for op in &write.transaction.ops {
            match op {
                TransactionOp::Write { oid, offset, data } => {
                    let obj = self
                        .stores
                        .get_mut(&to.shard)
                        .unwrap()
                        .entry(*oid)
                        .or_default();
                    write_at(obj, *offset, data);
                }
                TransactionOp::SetAttr { oid, key, value } => {
                    self.attrs
                        .get_mut(&to.shard)
                        .unwrap()
                        .entry(*oid)
                        .or_default()
                        .insert(key.clone(), value.clone());
                }
                _ => {}
            }
        }
        let reply = SubOpWriteReply {
            from: to,
            tid: write.tid,
            version: write.version,
            committed: true,
            applied: true,
        };
        self.backend.handle_event(PgEvent::Message {
            from: to,
            message: SubOpMessage::WriteReply(reply),
        });
    }

    /// Submit a client read; the result slot fills once pumped.
    pub fn submit_read(
        &mut self,
        oid: ObjectId,
        offset: u64,
        size: u64,
    ) -> Arc<Mutex<Option<BTreeMap<ObjectId, EcExtent>>>> {
        let slot = Arc::new(Mutex::new(None));
        let out = slot.clone();
        let mut reads = BTreeMap::new();
        reads.insert(oid, vec![EcAlign::new(offset, size)]);
        self.backend.handle_event(PgEvent::ClientRead {
            reads,
            fast_read: false,
            on_complete: Box::new(move |results| {
                *out.lock().unwrap() = Some(results);
            }),
        });
        slot
    }

    /// Read and return the decoded bytes, pumping to completion.
    pub fn read_object(&mut self, oid: ObjectId, offset: u64, size: u64) -> Vec<u8> {
        let slot = self.submit_read(oid, offset, size);
        self.pump();
        let results = slot.lock().unwrap().take().expect("read completed");
        let extent = &results[&oid];
        assert!(extent.err.is_none(), "read error: {:?}", extent.err);
        extent.emap.read(offset, size).expect("bytes present")
    }

    /// Submit an overwrite; the slot records the committed version.
    pub fn submit_write(
        &mut self,
        oid: ObjectId,
        offset: u64,
        data: Vec<u8>,
        object_size: u64,
        version: Version,
    ) -> Arc<Mutex<Option<Version>>> {
        let slot = Arc::new(Mutex::new(None));
        let out = slot.clone();
        let attrs = self.attrs[&ShardId::new(0)]
            .get(&oid)
            .cloned()
            .unwrap_or_default();
        self.backend.handle_event(PgEvent::ClientWrite(ClientWrite {
            oid,
            offset,
            data,
            object_size,
            attrs,
            version,
            reqid: ReqId { client: 1, tid: version.v },
            trim_to: Version::zero(),
            pg_committed_to: Version::zero(),
            invalidates_cache: false,
            on_commit: Some(Box::new(move |v| {
                *out.lock().unwrap() = Some(v);
            })),
        }));
        slot
    }

    /// Write and wait for commit.
    pub fn write_object(
        &mut self,
        oid: ObjectId,
        offset: u64,
        data: Vec<u8>,
        object_size: u64,
        version: Version,
    ) {
        let slot = self.submit_write(oid, offset, data, object_size, version);
        self.pump();
        assert_eq!(slot.lock().unwrap().take(), Some(version));
    }
}

pub fn write_at(obj: &mut Vec<u8>, off: u64, data: &[u8]) {
    let end = off as usize + data.len();
    if obj.len() < end {
        obj.resize(end, 0);
    }
    obj[off as usize..end].copy_from_slice(data);
}

pub fn read_at(obj: &[u8], off: u64, len: u64) -> Vec<u8> {
    let mut out = vec![0u8; len as usize];
    let have = obj.len().saturating_sub(off as usize).min(len as usize);
    if have > 0 {
        out[..have].copy_from_slice(&obj[off as usize..off as usize + have]);
    }
    out
}

/// Deterministic test payload.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u64).wrapping_mul(31).wrapping_add(seed as u64) as u8)
        .collect()
}
