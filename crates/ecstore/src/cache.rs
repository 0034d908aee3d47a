//! Extent-granular cache for read-modify-write overwrites.
//!
//! Each object in flight has a `CacheObject` tracking what is cached,
//! what is being requested, what is being read, and what queued writes
//! have promised to produce. Ops queue FIFO per object; the head op
//! completes as soon as the cache covers its reads, which gives the
//! "read happens-before overlapping subsequent read" guarantee across
//! in-flight ops on the same object.
//!
//! Pinning is chunk-granular: every op pins the lines its writes touch
//! for its whole lifetime. A line with no pins sits in a process-wide
//! FIFO and is evicted (its chunk erased from the object's cache)
//! whenever cached bytes exceed the soft cap.
//!
//! Mutating entry points never call upward. They return a
//! [`CacheOutcome`] listing ops that became ready and backend reads
//! that must be issued; the owner executes those effects.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use ecstore_core::{ExtentSet, ShardExtentMap, StripeInfo};
use ecstore_proto::{ObjectId, ShardId};
use lru::LruCache;
use tracing::{debug, trace};

/// Chunk-aligned pin unit address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LineAddress {
    pub oid: ObjectId,
    pub offset: u64,
}

#[derive(Debug, Default)]
struct Line {
    ref_count: u64,
}

struct CacheOp {
    tid: u64,
    reads: BTreeMap<ShardId, ExtentSet>,
    complete: bool,
}

/// Per-object cache state.
struct CacheObject {
    cache: ShardExtentMap,
    requesting: BTreeMap<ShardId, ExtentSet>,
    reading: BTreeMap<ShardId, ExtentSet>,
    writing: BTreeMap<ShardId, ExtentSet>,
    waiting_ops: VecDeque<CacheOp>,
}

impl CacheObject {
    fn new(sinfo: Arc<StripeInfo>) -> Self {
        Self {
            cache: ShardExtentMap::new(sinfo),
            requesting: BTreeMap::new(),
            reading: BTreeMap::new(),
            writing: BTreeMap::new(),
            waiting_ops: VecDeque::new(),
        }
    }
}

/// Effects for the owner to execute after a cache entry point.
#[derive(Default)]
pub struct CacheOutcome {
    /// Ops whose reads the cache now covers, with their bytes.
    pub ready: Vec<(u64, ObjectId, ShardExtentMap)>,
    /// Backend reads to issue. At most one per object is outstanding.
    pub backend_reads: Vec<(ObjectId, BTreeMap<ShardId, ExtentSet>)>,
}

impl CacheOutcome {
    fn merge(&mut self, other: CacheOutcome) {
        self.ready.extend(other.ready);
        self.backend_reads.extend(other.backend_reads);
    }
}

/// How a new request's reads will be satisfied.
pub struct RequestSplit {
    /// Extents nobody has: the cache will fetch them from the shards.
    pub remote_read: BTreeMap<ShardId, ExtentSet>,
    /// Extents promised by reads or writes already in flight.
    pub pending_read: BTreeMap<ShardId, ExtentSet>,
}

pub struct ExtentCache {
    sinfo: Arc<StripeInfo>,
    objects: HashMap<ObjectId, CacheObject>,
    lines: HashMap<LineAddress, Line>,
    /// Order index over lines with `ref_count == 0`. Entries are pushed
    /// on unpin and never touched again, so pop order is FIFO.
    lru: LruCache<LineAddress, ()>,
    /// Pinned line set per `(oid, tid)`, kept until `complete`.
    pins: HashMap<(ObjectId, u64), ExtentSet>,
    size: u64,
    max_size: u64,
}

impl ExtentCache {
    pub fn new(sinfo: Arc<StripeInfo>, max_size: u64) -> Self {
        Self {
            sinfo,
            objects: HashMap::new(),
            lines: HashMap::new(),
            lru: LruCache::unbounded(),
            pins: HashMap::new(),
            size: 0,
            max_size,
        }
    }

    /// Cached bytes across all objects.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// True when no op is queued against `oid`.
    pub fn idle(&self, oid: ObjectId) -> bool {
        self.objects
            .get(&oid)
            .map_or(true, |obj| obj.waiting_ops.is_empty())
    }

    pub fn contains_object(&self, oid: ObjectId) -> bool {
        self.objects.contains_key(&oid)
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    /// Enqueue an op: pin its write footprint, work out which of its
    /// reads need fetching, and record its write promises for later
    /// ops to rely on.
    pub fn request(
        &mut self,
        tid: u64,
        oid: ObjectId,
        to_read: &BTreeMap<ShardId, ExtentSet>,
        writes: &BTreeMap<ShardId, ExtentSet>,
    ) -> (RequestSplit, CacheOutcome) {
        self.pin(tid, oid, writes);
        let sinfo = self.sinfo.clone();
        let obj = self
            .objects
            .entry(oid)
            .or_insert_with(|| CacheObject::new(sinfo));
        let mut split = RequestSplit {
            remote_read: BTreeMap::new(),
            pending_read: BTreeMap::new(),
        };

        for (&shard, eset) in to_read {
            let mut request = eset.clone();
            if let Some(emap) = obj.cache.extent_maps().get(&shard) {
                request.subtract(&emap.interval_set());
            }
            let mut promised = ExtentSet::new();
            if let Some(r) = obj.reading.get(&shard) {
                promised.union_with(&request.intersection(r));
                request.subtract(r);
            }
            if let Some(w) = obj.writing.get(&shard) {
                promised.union_with(&request.intersection(w));
                request.subtract(w);
            }
            if !promised.is_empty() {
                split.pending_read.insert(shard, promised);
            }
            if !request.is_empty() {
                obj.requesting
                    .entry(shard)
                    .or_default()
                    .union_with(&request);
                split.remote_read.insert(shard, request);
            }
        }

        // Later ops read these bytes from the cache instead of disk.
        for (&shard, eset) in writes {
            obj.writing.entry(shard).or_default().union_with(eset);
        }

        obj.waiting_ops.push_back(CacheOp {
            tid,
            reads: to_read.clone(),
            complete: false,
        });
        trace!(%oid, tid, "cache request queued");

        let mut outcome = CacheOutcome::default();
        Self::cache_maybe_ready(oid, obj, &mut outcome);
        Self::send_reads(oid, obj, &mut outcome);
        (split, outcome)
    }

    /// A backend read finished: fold the buffers in and move forward.
    pub fn read_done(&mut self, oid: ObjectId, buffers: ShardExtentMap) -> CacheOutcome {
        let mut outcome = CacheOutcome::default();
        let Some(obj) = self.objects.get_mut(&oid) else {
            debug!(%oid, "read_done for object with no cache state");
            return outcome;
        };
        obj.reading.clear();

        let old = obj.cache.size();
        obj.cache.insert(&buffers);
        self.size += obj.cache.size() - old;

        Self::cache_maybe_ready(oid, obj, &mut outcome);
        Self::send_reads(oid, obj, &mut outcome);
        outcome
    }

    /// The head op's write landed: publish its bytes and retire its
    /// write promises.
    pub fn write_done(&mut self, tid: u64, oid: ObjectId, buffers: ShardExtentMap) -> CacheOutcome {
        let mut outcome = CacheOutcome::default();
        let obj = self
            .objects
            .get_mut(&oid)
            .expect("write_done for unknown object");
        let head = obj.waiting_ops.pop_front().expect("write_done with no op");
        assert_eq!(head.tid, tid, "writes must complete in queue order");

        let old = obj.cache.size();
        obj.cache.insert(&buffers);
        self.size += obj.cache.size() - old;

        for (&shard, emap) in buffers.extent_maps() {
            if let Some(w) = obj.writing.get_mut(&shard) {
                w.subtract(&emap.interval_set());
                if w.is_empty() {
                    obj.writing.remove(&shard);
                }
            }
        }

        Self::cache_maybe_ready(oid, obj, &mut outcome);
        Self::send_reads(oid, obj, &mut outcome);
        self.free_maybe();
        outcome
    }

    /// Release an op's pins. Lines that drop to zero references join
    /// the eviction queue, and the cache is trimmed back under its cap.
    pub fn complete(&mut self, tid: u64, oid: ObjectId) {
        let Some(eset) = self.pins.remove(&(oid, tid)) else {
            return;
        };
        let chunk = self.sinfo.chunk_size();
        for (start, len) in eset.iter() {
            let mut off = start;
            while off < start + len {
                let addr = LineAddress { oid, offset: off };
                let line = self.lines.get_mut(&addr).expect("pin without line");
                assert!(line.ref_count > 0);
                line.ref_count -= 1;
                if line.ref_count == 0 {
                    self.lru.push(addr, ());
                }
                off += chunk;
            }
        }
        self.free_maybe();
    }

    /// Drop every queued op and pin. Cached clean bytes stay, subject
    /// to the cap.
    pub fn on_change(&mut self) {
        for obj in self.objects.values_mut() {
            obj.waiting_ops.clear();
            obj.requesting.clear();
            obj.reading.clear();
            obj.writing.clear();
        }
        let pinned: Vec<(ObjectId, u64)> = self.pins.keys().copied().collect();
        for (oid, tid) in pinned {
            self.complete(tid, oid);
        }
        self.free_maybe();
    }

    fn pin(&mut self, tid: u64, oid: ObjectId, writes: &BTreeMap<ShardId, ExtentSet>) {
        let mut eset = ExtentSet::new();
        for e in writes.values() {
            eset.union_with(e);
        }
        eset.align(self.sinfo.chunk_size());

        let chunk = self.sinfo.chunk_size();
        for (start, len) in eset.iter() {
            let mut off = start;
            while off < start + len {
                let addr = LineAddress { oid, offset: off };
                self.lru.pop(&addr);
                self.lines.entry(addr).or_default().ref_count += 1;
                off += chunk;
            }
        }
        self.pins.insert((oid, tid), eset);
    }

    fn cache_maybe_ready(oid: ObjectId, obj: &mut CacheObject, outcome: &mut CacheOutcome) {
        let Some(op) = obj.waiting_ops.front_mut() else {
            return;
        };
        if op.complete || !obj.cache.contains(&op.reads) {
            return;
        }
        op.complete = true;
        let result = obj.cache.intersect(&op.reads);
        trace!(%oid, tid = op.tid, "cache ready");
        outcome.ready.push((op.tid, oid, result));
    }

    fn send_reads(oid: ObjectId, obj: &mut CacheObject, outcome: &mut CacheOutcome) {
        // One read in flight per object; everything requested so far
        // rides along in a single backend read.
        if !obj.reading.is_empty() || obj.requesting.is_empty() {
            return;
        }
        obj.reading = std::mem::take(&mut obj.requesting);
        outcome.backend_reads.push((oid, obj.reading.clone()));
    }

    fn free_maybe(&mut self) {
        while self.size > self.max_size {
            let Some((addr, _)) = self.lru.pop_lru() else {
                break;
            };
            self.lines.remove(&addr);
            let Some(obj) = self.objects.get_mut(&addr.oid) else {
                continue;
            };
            let old = obj.cache.size();
            obj.cache.erase_stripe(addr.offset, self.sinfo.chunk_size());
            self.size -= old - obj.cache.size();
            debug!(oid = %addr.oid, offset = addr.offset, "evicted cache line");
            if obj.cache.is_empty() && obj.waiting_ops.is_empty() {
                self.objects.remove(&addr.oid);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecstore_proto::EcResult;

    fn sinfo() -> Arc<StripeInfo> {
        Arc::new(StripeInfo::from_layout(2, 1, 8192, vec![], 0).unwrap())
    }

    fn eset(ivals: &[(u64, u64)]) -> ExtentSet {
        ivals.iter().copied().collect()
    }

    fn shard_map(entries: &[(u8, &[(u64, u64)])]) -> BTreeMap<ShardId, ExtentSet> {
        entries
            .iter()
            .map(|(s, ivals)| (ShardId::new(*s), eset(ivals)))
            .collect()
    }

    fn sem_with(si: &Arc<StripeInfo>, entries: &[(u8, u64, Vec<u8>)]) -> ShardExtentMap {
        let mut sem = ShardExtentMap::new(si.clone());
        for (shard, off, buf) in entries {
            sem.insert_in_shard(ShardId::new(*shard), *off, buf.clone());
        }
        sem
    }

    #[test]
    fn test_request_miss_issues_backend_read() -> EcResult<()> {
        let si = sinfo();
        let mut cache = ExtentCache::new(si.clone(), 1 << 20);
        let oid = ObjectId::new(1);

        let reads = shard_map(&[(0, &[(0, 4096)])]);
        let writes = shard_map(&[(0, &[(0, 100)])]);
        let (split, outcome) = cache.request(1, oid, &reads, &writes);

        assert!(outcome.ready.is_empty());
        assert_eq!(outcome.backend_reads.len(), 1);
        assert_eq!(outcome.backend_reads[0].0, oid);
        assert_eq!(split.remote_read, reads);
        assert!(split.pending_read.is_empty());

        // Read completes: the op becomes ready with the bytes.
        let buffers = sem_with(&si, &[(0, 0, vec![7u8; 4096])]);
        let outcome = cache.read_done(oid, buffers);
        assert_eq!(outcome.ready.len(), 1);
        let (tid, roid, result) = &outcome.ready[0];
        assert_eq!((*tid, *roid), (1, oid));
        assert_eq!(
            result.get_buffer(ShardId::new(0), 0, 4096, false)?,
            vec![7u8; 4096]
        );
        Ok(())
    }

    #[test]
    fn test_request_hit_is_ready_immediately() {
        let si = sinfo();
        let mut cache = ExtentCache::new(si.clone(), 1 << 20);
        let oid = ObjectId::new(2);

        // Prime the cache through a first op.
        let reads = shard_map(&[(0, &[(0, 4096)])]);
        let writes = shard_map(&[(0, &[(0, 4096)])]);
        let (_, _) = cache.request(1, oid, &reads, &writes);
        cache.read_done(oid, sem_with(&si, &[(0, 0, vec![1u8; 4096])]));
        cache.write_done(1, oid, sem_with(&si, &[(0, 0, vec![2u8; 4096])]));
        cache.complete(1, oid);

        // Same extents again: no backend read, ready at once.
        let (split, outcome) = cache.request(2, oid, &reads, &writes);
        assert!(split.remote_read.is_empty());
        assert!(outcome.backend_reads.is_empty());
        assert_eq!(outcome.ready.len(), 1);
        assert_eq!(
            outcome.ready[0]
                .2
                .get_buffer(ShardId::new(0), 0, 4096, false)
                .unwrap(),
            vec![2u8; 4096]
        );
    }

    #[test]
    fn test_overlapping_read_waits_for_prior_write() {
        let si = sinfo();
        let mut cache = ExtentCache::new(si.clone(), 1 << 20);
        let oid = ObjectId::new(3);

        // Op 1 writes [0, 4096) with nothing to read.
        let w1 = shard_map(&[(0, &[(0, 4096)])]);
        let (_, o1) = cache.request(1, oid, &BTreeMap::new(), &w1);
        assert_eq!(o1.ready.len(), 1); // no reads, ready immediately

        // Op 2 reads the same range. The bytes are promised by op 1,
        // so no backend read goes out and op 2 is not yet ready.
        let r2 = shard_map(&[(0, &[(0, 4096)])]);
        let w2 = shard_map(&[(0, &[(0, 4096)])]);
        let (split, o2) = cache.request(2, oid, &r2, &w2);
        assert!(o2.ready.is_empty());
        assert!(o2.backend_reads.is_empty());
        assert_eq!(split.pending_read, r2);
        assert!(split.remote_read.is_empty());

        // Op 1's write lands; op 2 sees exactly those bytes.
        let o = cache.write_done(1, oid, sem_with(&si, &[(0, 0, vec![9u8; 4096])]));
        assert_eq!(o.ready.len(), 1);
        assert_eq!(o.ready[0].0, 2);
        assert_eq!(
            o.ready[0]
                .2
                .get_buffer(ShardId::new(0), 0, 4096, false)
                .unwrap(),
            vec![9u8; 4096]
        );
    }

    #[test]
    fn test_single_backend_read_in_flight() {
        let si = sinfo();
        let mut cache = ExtentCache::new(si.clone(), 1 << 20);
        let oid = ObjectId::new(4);

        let (_, o1) = cache.request(
            1,
            oid,
            &shard_map(&[(0, &[(0, 4096)])]),
            &shard_map(&[(0, &[(0, 100)])]),
        );
        assert_eq!(o1.backend_reads.len(), 1);

        // A second op requesting different extents queues them while
        // the first read is in flight.
        let (_, o2) = cache.request(
            2,
            oid,
            &shard_map(&[(1, &[(0, 4096)])]),
            &shard_map(&[(1, &[(0, 100)])]),
        );
        assert!(o2.backend_reads.is_empty());

        // When the first read lands, the queued extents go out.
        let o3 = cache.read_done(oid, sem_with(&si, &[(0, 0, vec![1u8; 4096])]));
        assert_eq!(o3.backend_reads.len(), 1);
        assert_eq!(
            o3.backend_reads[0].1,
            shard_map(&[(1, &[(0, 4096)])])
        );
    }

    #[test]
    fn test_pin_then_evict_with_zero_cap() {
        let si = sinfo();
        let mut cache = ExtentCache::new(si.clone(), 0);
        let oid = ObjectId::new(5);

        let writes = shard_map(&[(0, &[(0, 4096)])]);
        let (_, _) = cache.request(1, oid, &BTreeMap::new(), &writes);
        cache.write_done(1, oid, sem_with(&si, &[(0, 0, vec![5u8; 4096])]));

        // While pinned, nothing can be evicted despite the zero cap.
        assert!(cache.size() > 0);
        assert!(cache.contains_object(oid));

        cache.complete(1, oid);
        assert_eq!(cache.size(), 0);
        assert!(!cache.contains_object(oid));
        assert_eq!(cache.line_count(), 0);
    }

    #[test]
    fn test_pins_are_chunk_aligned() {
        let si = sinfo();
        let mut cache = ExtentCache::new(si.clone(), 1 << 20);
        let oid = ObjectId::new(6);

        // A 100-byte write spanning a chunk boundary pins two lines.
        let writes = shard_map(&[(0, &[(4000, 200)])]);
        let (_, _) = cache.request(1, oid, &BTreeMap::new(), &writes);
        assert_eq!(cache.line_count(), 2);
        cache.write_done(1, oid, sem_with(&si, &[(0, 4000, vec![1u8; 200])]));
        cache.complete(1, oid);
        // Under the cap, lines stay resident but unpinned.
        assert!(cache.size() > 0);
    }

    #[test]
    fn test_on_change_drops_ops_and_pins() {
        let si = sinfo();
        let mut cache = ExtentCache::new(si.clone(), 0);
        let oid = ObjectId::new(7);

        let (_, _) = cache.request(
            1,
            oid,
            &shard_map(&[(0, &[(0, 4096)])]),
            &shard_map(&[(0, &[(0, 4096)])]),
        );
        cache.read_done(oid, sem_with(&si, &[(0, 0, vec![1u8; 4096])]));
        cache.on_change();

        assert!(cache.idle(oid));
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.line_count(), 0);
    }
}
