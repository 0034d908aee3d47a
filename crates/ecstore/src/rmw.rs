//! Read-modify-write pipeline.
//!
//! Overwrites pass through three FIFO queues: `waiting_state` (may be
//! blocked by an invalid cache), `waiting_reads` (waiting for the
//! pre-image bytes), and `waiting_commit` (waiting for commit acks from
//! every shard). `check_ops` greedily applies the three transition
//! predicates until none fires; every external completion re-enters it.
//!
//! The pipeline owns the extent cache. Cache effects that need I/O
//! (backend reads) are surfaced to the owner as [`RmwEffects`]; results
//! come back through `on_cache_read_done` / `on_read_complete`.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use ecstore_core::hash_info::HashInfoRef;
use ecstore_core::{ErasureCode, ExtentSet, ShardExtentMap, StripeInfo};
use ecstore_proto::constants::HINFO_KEY;
use ecstore_proto::message::{LogEntry, PgStats, SubOpWrite, SubOpWriteReply};
use ecstore_proto::transaction::{ShardTransaction, TransactionOp};
use ecstore_proto::{EcResult, ObjectId, PgShard, ReqId, ShardId, SpgId, SubOpMessage, Version};
use tracing::{debug, trace, warn};

use crate::cache::{CacheOutcome, ExtentCache};
use crate::config::EcConfig;
use crate::parent::PgParent;

/// Per-shard read and write footprints of one overwrite.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WritePlan {
    pub to_read: BTreeMap<ShardId, ExtentSet>,
    pub will_write: BTreeMap<ShardId, ExtentSet>,
}

/// Plan an overwrite of `[ro_offset, ro_offset+len)` against an object
/// currently `object_size` bytes long.
///
/// Data shards write exactly the striped image of the range; coding
/// shards write the full chunk rows the range touches. Reads cover the
/// unwritten remainder of each touched row, clamped to the bytes that
/// exist, so the encoder always sees complete rows.
pub fn plan_overwrite(
    sinfo: &StripeInfo,
    ro_offset: u64,
    len: u64,
    object_size: u64,
) -> WritePlan {
    let mut plan = WritePlan::default();
    if len == 0 {
        return plan;
    }

    let data_writes = sinfo.ro_range_to_shard_extent_set(ro_offset, len);
    let (row_off, row_len) = sinfo.chunk_aligned_offset_len_to_chunk(ro_offset, len);

    for raw in 0..sinfo.k() {
        let shard = sinfo.shard(raw);
        let shard_size = sinfo.ro_offset_to_shard_offset(object_size, raw);
        let mut rows: ExtentSet = [(row_off, row_len)].into_iter().collect();
        // Nothing to read past the end of the object.
        if shard_size < row_off + row_len {
            rows.erase(shard_size, row_off + row_len - shard_size);
        }
        if let Some(w) = data_writes.get(&shard) {
            rows.subtract(w);
        }
        if !rows.is_empty() {
            plan.to_read.insert(shard, rows);
        }
    }

    // Parity covers exactly the rectangle the encoder will produce:
    // the union of everything read and written on the data shards.
    let mut parity_rows = ExtentSet::new();
    for eset in plan.to_read.values() {
        parity_rows.union_with(eset);
    }
    for eset in data_writes.values() {
        parity_rows.union_with(eset);
    }

    plan.will_write = data_writes;
    for shard in sinfo.coding_shards() {
        plan.will_write.insert(shard, parity_rows.clone());
    }
    plan
}

/// The concrete write carried by an op.
pub struct ClassicalOp {
    /// New bytes, already carved into shard space.
    pub writes: ShardExtentMap,
    /// RO size of the object before this op.
    pub before_size: u64,
    /// Rolling hashes to maintain, when the object tracks them.
    pub hinfo: Option<HashInfoRef>,
    /// Op invalidates cache assumptions (truncate and friends).
    pub invalidates_cache: bool,
}

/// Tagged op variants; each knows how to turn itself into shard
/// transactions.
pub enum OpPayload {
    Classical(ClassicalOp),
    /// No transaction at all; exists to carry a log entry that rolls
    /// the rollback horizon forward.
    Dummy,
}

/// One overwrite in flight.
pub struct RmwOp {
    pub tid: u64,
    pub hoid: ObjectId,
    pub reqid: ReqId,
    pub version: Version,
    pub trim_to: Version,
    pub pg_committed_to: Version,
    pub plan: WritePlan,
    pub payload: OpPayload,
    pub log_entries: Vec<LogEntry>,
    pub temp_added: BTreeSet<ObjectId>,
    pub temp_cleared: BTreeSet<ObjectId>,
    pub using_cache: bool,
    /// Reads the cache could not satisfy and must fetch from shards.
    pub remote_read: BTreeMap<ShardId, ExtentSet>,
    /// Reads promised by ops already in flight on the same object.
    pub pending_read: BTreeMap<ShardId, ExtentSet>,
    pub remote_read_result: Option<ShardExtentMap>,
    pub pending_apply: BTreeSet<PgShard>,
    pub pending_commit: BTreeSet<PgShard>,
    /// Callbacks ordered behind this op's sub-write dispatch.
    pub on_write: Vec<Box<dyn FnOnce() + Send>>,
    /// Fired once every shard has committed.
    pub on_commit: Option<Box<dyn FnOnce(Version) + Send>>,
    reads_outstanding: bool,
}

impl RmwOp {
    pub fn new_write(
        tid: u64,
        hoid: ObjectId,
        reqid: ReqId,
        version: Version,
        trim_to: Version,
        pg_committed_to: Version,
        plan: WritePlan,
        payload: ClassicalOp,
        log_entries: Vec<LogEntry>,
    ) -> Self {
        Self {
            tid,
            hoid,
            reqid,
            version,
            trim_to,
            pg_committed_to,
            plan,
            payload: OpPayload::Classical(payload),
            log_entries,
            temp_added: BTreeSet::new(),
            temp_cleared: BTreeSet::new(),
            using_cache: false,
            remote_read: BTreeMap::new(),
            pending_read: BTreeMap::new(),
            remote_read_result: None,
            pending_apply: BTreeSet::new(),
            pending_commit: BTreeSet::new(),
            on_write: Vec::new(),
            on_commit: None,
            reads_outstanding: false,
        }
    }

    fn new_dummy(tid: u64, hoid: ObjectId, reqid: ReqId, trim_to: Version, roll_to: Version) -> Self {
        Self {
            tid,
            hoid,
            reqid,
            version: Version::zero(),
            trim_to,
            pg_committed_to: roll_to,
            plan: WritePlan::default(),
            payload: OpPayload::Dummy,
            log_entries: Vec::new(),
            temp_added: BTreeSet::new(),
            temp_cleared: BTreeSet::new(),
            using_cache: false,
            remote_read: BTreeMap::new(),
            pending_read: BTreeMap::new(),
            remote_read_result: None,
            pending_apply: BTreeSet::new(),
            pending_commit: BTreeSet::new(),
            on_write: Vec::new(),
            on_commit: None,
            reads_outstanding: false,
        }
    }

    /// Any data-shard read makes this a true read-modify-write.
    pub fn requires_rmw(&self) -> bool {
        !self.plan.to_read.is_empty()
    }

    pub fn invalidates_cache(&self) -> bool {
        match &self.payload {
            OpPayload::Classical(c) => c.invalidates_cache,
            OpPayload::Dummy => false,
        }
    }

    pub fn read_in_progress(&self) -> bool {
        self.reads_outstanding
    }

    pub fn write_in_progress(&self) -> bool {
        !self.pending_apply.is_empty() || !self.pending_commit.is_empty()
    }

    /// Produce the bytes this op writes and the per-shard transactions
    /// carrying them. The returned map's footprint must equal
    /// `plan.will_write`; the pipeline asserts it.
    fn generate_transactions(
        &mut self,
        codec: &dyn ErasureCode,
        sinfo: &Arc<StripeInfo>,
    ) -> EcResult<(ShardExtentMap, BTreeMap<ShardId, ShardTransaction>)> {
        let classical = match &self.payload {
            OpPayload::Dummy => {
                return Ok((ShardExtentMap::new(sinfo.clone()), BTreeMap::new()));
            }
            OpPayload::Classical(c) => c,
        };

        let mut sem = ShardExtentMap::new(sinfo.clone());
        if let Some(read) = self.remote_read_result.take() {
            sem.insert(&read);
        }
        sem.insert(&classical.writes);
        sem.insert_parity_buffers();

        let overwrite = sem
            .ro_range()
            .is_some_and(|(start, _)| start < classical.before_size);
        let new_end = sem
            .ro_range()
            .map(|(_, end)| end)
            .unwrap_or(0)
            .max(classical.before_size);

        if let Some(hinfo) = &classical.hinfo {
            if let Ok(mut hi) = hinfo.lock() {
                if overwrite {
                    // The rolling hashes cannot follow a mid-object
                    // write; keep only the size.
                    let new_total = ((new_end + sinfo.stripe_width() - 1)
                        / sinfo.stripe_width())
                        * sinfo.chunk_size();
                    hi.set_total_chunk_size_clear_hash(new_total);
                }
                sem.encode(codec, Some(&mut hi), classical.before_size)?;
            }
        } else {
            sem.encode(codec, None, classical.before_size)?;
        }

        let written = sem.intersect(&self.plan.will_write);
        let hinfo_bytes = classical
            .hinfo
            .as_ref()
            .and_then(|h| h.lock().ok().map(|hi| hi.encode()));

        let mut transactions = BTreeMap::new();
        for (&shard, eset) in &self.plan.will_write {
            let mut txn = ShardTransaction::new();
            for (off, len) in eset.iter() {
                let data = written.get_buffer(shard, off, len, false)?;
                txn.push(TransactionOp::Write {
                    oid: self.hoid,
                    offset: off,
                    data,
                });
            }
            transactions.insert(shard, txn);
        }

        // Every shard carries the updated hash info, written or not.
        if let Some(bytes) = &hinfo_bytes {
            for raw in 0..sinfo.k_plus_m() {
                let txn = transactions.entry(sinfo.shard(raw)).or_default();
                txn.push(TransactionOp::SetAttr {
                    oid: self.hoid,
                    key: HINFO_KEY.to_string(),
                    value: bytes.clone(),
                });
            }
        }
        Ok((written, transactions))
    }
}

/// Global gate serializing overwrites across cache-invalidating ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineState {
    CacheValid,
    CacheInvalid,
}

/// Reads the owner must issue on the pipeline's behalf.
#[derive(Default)]
pub struct RmwEffects {
    pub reads: Vec<RmwRead>,
}

impl RmwEffects {
    pub fn merge(&mut self, other: RmwEffects) {
        self.reads.extend(other.reads);
    }

    pub fn is_empty(&self) -> bool {
        self.reads.is_empty()
    }
}

pub struct RmwRead {
    pub kind: RmwReadKind,
    pub oid: ObjectId,
    pub want: BTreeMap<ShardId, ExtentSet>,
}

/// Where a requested read's result is delivered.
pub enum RmwReadKind {
    /// Straight to the op (cache disabled): `on_read_complete(tid, ..)`.
    Direct { tid: u64 },
    /// Into the cache: `on_cache_read_done(oid, ..)`.
    Cache,
}

pub struct RMWPipeline {
    cfg: EcConfig,
    codec: Arc<dyn ErasureCode>,
    sinfo: Arc<StripeInfo>,
    parent: Arc<dyn PgParent>,
    cache: ExtentCache,
    ops: BTreeMap<u64, RmwOp>,
    waiting_state: VecDeque<u64>,
    waiting_reads: VecDeque<u64>,
    waiting_commit: VecDeque<u64>,
    completed_to: Version,
    committed_to: Version,
    pipeline_state: PipelineState,
}

impl RMWPipeline {
    pub fn new(
        cfg: EcConfig,
        codec: Arc<dyn ErasureCode>,
        sinfo: Arc<StripeInfo>,
        parent: Arc<dyn PgParent>,
    ) -> Self {
        let cache = ExtentCache::new(sinfo.clone(), cfg.cache_max_size);
        Self {
            cfg,
            codec,
            sinfo,
            parent,
            cache,
            ops: BTreeMap::new(),
            waiting_state: VecDeque::new(),
            waiting_reads: VecDeque::new(),
            waiting_commit: VecDeque::new(),
            completed_to: Version::zero(),
            committed_to: Version::zero(),
            pipeline_state: PipelineState::CacheValid,
        }
    }

    pub fn completed_to(&self) -> Version {
        self.completed_to
    }

    pub fn committed_to(&self) -> Version {
        self.committed_to
    }

    pub fn cache(&self) -> &ExtentCache {
        &self.cache
    }

    pub fn idle(&self) -> bool {
        self.ops.is_empty()
    }

    /// Enqueue an overwrite and run the state machine.
    pub fn start_rmw(&mut self, op: RmwOp) -> RmwEffects {
        debug!(tid = op.tid, oid = %op.hoid, version = %op.version, "start rmw");
        assert!(!self.ops.contains_key(&op.tid));
        self.waiting_state.push_back(op.tid);
        self.ops.insert(op.tid, op);
        self.check_ops()
    }

    /// Greedily apply the three transition predicates until quiescent.
    pub fn check_ops(&mut self) -> RmwEffects {
        let mut eff = RmwEffects::default();
        loop {
            if self.try_state_to_reads(&mut eff) {
                continue;
            }
            if self.try_reads_to_commit(&mut eff) {
                continue;
            }
            if self.try_finish_rmw() {
                continue;
            }
            break;
        }
        eff
    }

    fn try_state_to_reads(&mut self, eff: &mut RmwEffects) -> bool {
        let Some(&tid) = self.waiting_state.front() else {
            return false;
        };
        {
            let op = &self.ops[&tid];
            if op.requires_rmw() {
                // Overwrites are a pool feature; a plan with reads on a
                // pool without it is a protocol violation.
                assert!(
                    self.parent.allows_ec_overwrites(),
                    "rmw requires overwrite support"
                );
                if self.pipeline_state == PipelineState::CacheInvalid {
                    debug!(tid, "blocked: rmw while cache is invalid");
                    return false;
                }
            }
        }

        self.waiting_state.pop_front();
        self.waiting_reads.push_back(tid);

        let using_cache = self.cfg.cache_enabled && self.pipeline_state == PipelineState::CacheValid;
        let op = self.ops.get_mut(&tid).expect("op queued");
        op.using_cache = using_cache;
        if using_cache && op.invalidates_cache() {
            debug!(tid, "invalidating cache after this op");
            self.pipeline_state = PipelineState::CacheInvalid;
        }

        let op = self.ops.get_mut(&tid).expect("op queued");
        if op.using_cache {
            let hoid = op.hoid;
            let (split, outcome) =
                self.cache
                    .request(tid, hoid, &op.plan.to_read, &op.plan.will_write);
            op.remote_read = split.remote_read;
            op.pending_read = split.pending_read;
            op.reads_outstanding = true;
            trace!(tid, remote = ?op.remote_read, pending = ?op.pending_read, "cache split");
            self.process_cache_outcome(outcome, eff);
        } else {
            op.remote_read = op.plan.to_read.clone();
            if !op.remote_read.is_empty() {
                op.reads_outstanding = true;
                eff.reads.push(RmwRead {
                    kind: RmwReadKind::Direct { tid },
                    oid: op.hoid,
                    want: op.remote_read.clone(),
                });
            }
        }
        true
    }

    fn try_reads_to_commit(&mut self, eff: &mut RmwEffects) -> bool {
        let Some(&tid) = self.waiting_reads.front() else {
            return false;
        };
        if self.ops[&tid].read_in_progress() {
            return false;
        }
        self.waiting_reads.pop_front();
        self.waiting_commit.push_back(tid);

        let hoid = self.ops[&tid].hoid;
        let all_shards = self.parent.get_acting_recovery_backfill_shards();
        let backfill_shards = self.parent.get_backfill_shards();
        let info = self.parent.get_info();
        let map_epoch = self.parent.get_osdmap_epoch();
        let min_epoch = self.parent.get_interval_start_epoch();
        let whoami = self.parent.whoami_shard();
        let should_send: BTreeMap<PgShard, bool> = all_shards
            .iter()
            .map(|s| (*s, self.parent.should_send_op(s, hoid)))
            .collect();

        let codec = self.codec.clone();
        let sinfo = self.sinfo.clone();
        let op = self.ops.get_mut(&tid).expect("op queued");
        debug!(tid, oid = %hoid, "starting commit");

        op.pending_read.clear();
        let (written, mut transactions) = match op.generate_transactions(codec.as_ref(), &sinfo) {
            Ok(out) => out,
            Err(e) => panic!("generate_transactions failed for tid {}: {}", tid, e),
        };
        assert_eq!(
            written.extent_set_map(),
            op.plan.will_write,
            "write footprint must match the plan"
        );
        op.remote_read.clear();
        op.remote_read_result = None;

        let mut messages = Vec::with_capacity(all_shards.len());
        let mut local_write = None;
        for pg_shard in &all_shards {
            op.pending_apply.insert(*pg_shard);
            op.pending_commit.insert(*pg_shard);

            let send = should_send[pg_shard];
            let transaction = if send {
                transactions.remove(&pg_shard.shard).unwrap_or_default()
            } else {
                ShardTransaction::new()
            };
            let stats = if send || !backfill_shards.contains(pg_shard) {
                info.stats
            } else {
                self.parent.get_shard_info(pg_shard).stats
            };

            let msg = SubOpWrite {
                pgid: SpgId {
                    pgid: info.pgid,
                    shard: pg_shard.shard,
                },
                map_epoch,
                min_epoch,
                from: whoami,
                tid,
                reqid: op.reqid,
                hoid,
                stats,
                transaction,
                version: op.version,
                trim_to: op.trim_to,
                pg_committed_to: op.pg_committed_to,
                log_entries: op.log_entries.clone(),
                temp_added: op.temp_added.clone(),
                temp_cleared: op.temp_cleared.clone(),
                backfill_or_removal: !send,
            };
            if *pg_shard == whoami {
                local_write = Some(msg);
            } else {
                messages.push((*pg_shard, SubOpMessage::Write(msg)));
            }
        }

        let on_write: Vec<_> = op.on_write.drain(..).collect();
        let using_cache = op.using_cache;
        let written_bytes = written.size();

        self.parent.apply_stats(
            hoid,
            PgStats {
                objects: 0,
                bytes: written_bytes,
            },
        );
        if using_cache {
            let outcome = self.cache.write_done(tid, hoid, written);
            self.process_cache_outcome(outcome, eff);
        }
        if !messages.is_empty() {
            self.parent.send_cluster_messages(messages, map_epoch);
        }
        if let Some(write) = local_write {
            self.parent.handle_local_sub_write(write);
        }
        for cb in on_write {
            cb();
        }
        true
    }

    fn try_finish_rmw(&mut self) -> bool {
        let Some(&tid) = self.waiting_commit.front() else {
            return false;
        };
        if self.ops[&tid].write_in_progress() {
            return false;
        }
        self.waiting_commit.pop_front();
        let mut op = self.ops.remove(&tid).expect("op queued");
        debug!(tid, oid = %op.hoid, version = %op.version, "rmw finished");

        if op.pg_committed_to > self.completed_to {
            self.completed_to = op.pg_committed_to;
        }
        if op.version > self.committed_to {
            self.committed_to = op.version;
        }

        if op.version > self.parent.can_rollback_to()
            && self.waiting_reads.is_empty()
            && self.waiting_commit.is_empty()
        {
            // Nothing behind this op will push the rollback horizon
            // past it; submit an empty op whose log entry does.
            let dummy_tid = self.parent.get_tid();
            debug!(tid, dummy_tid, "queueing roll-forward op");
            let dummy = RmwOp::new_dummy(dummy_tid, op.hoid, op.reqid, op.trim_to, op.version);
            self.waiting_reads.push_back(dummy_tid);
            self.ops.insert(dummy_tid, dummy);
        }

        if op.using_cache {
            self.cache.complete(tid, op.hoid);
        }
        if let Some(cb) = op.on_commit.take() {
            cb(op.version);
        }

        if self.waiting_reads.is_empty() && self.waiting_commit.is_empty() {
            self.pipeline_state = PipelineState::CacheValid;
        }
        true
    }

    /// A direct (no-cache) pre-image read finished.
    pub fn on_read_complete(&mut self, tid: u64, result: EcResult<ShardExtentMap>) -> RmwEffects {
        let sem = match result {
            Ok(sem) => sem,
            Err(e) => panic!("rmw pre-image read failed for tid {}: {}", tid, e),
        };
        if let Some(op) = self.ops.get_mut(&tid) {
            op.remote_read_result = Some(sem);
            op.reads_outstanding = false;
        } else {
            debug!(tid, "read completion for finished op");
        }
        self.check_ops()
    }

    /// A cache backend read finished.
    pub fn on_cache_read_done(
        &mut self,
        oid: ObjectId,
        result: EcResult<ShardExtentMap>,
    ) -> RmwEffects {
        let sem = match result {
            Ok(sem) => sem,
            Err(e) => panic!("cache backend read failed for {}: {}", oid, e),
        };
        let outcome = self.cache.read_done(oid, sem);
        let mut eff = RmwEffects::default();
        self.process_cache_outcome(outcome, &mut eff);
        eff.merge(self.check_ops());
        eff
    }

    /// A shard acknowledged a sub-write.
    pub fn handle_sub_write_reply(&mut self, from: PgShard, reply: SubOpWriteReply) -> RmwEffects {
        let Some(op) = self.ops.get_mut(&reply.tid) else {
            debug!(tid = reply.tid, %from, "write reply for unknown op");
            return RmwEffects::default();
        };
        if reply.committed {
            op.pending_commit.remove(&from);
        }
        if reply.applied {
            op.pending_apply.remove(&from);
        }
        trace!(
            tid = reply.tid,
            %from,
            pending_commit = op.pending_commit.len(),
            "sub-write reply"
        );
        self.check_ops()
    }

    /// Run `cb` no earlier than the sub-write dispatch of the most
    /// recently submitted write; inline if nothing is queued.
    pub fn call_write_ordered(&mut self, cb: Box<dyn FnOnce() + Send>) {
        if let Some(&tid) = self.waiting_state.back() {
            self.ops.get_mut(&tid).expect("op queued").on_write.push(cb);
        } else if let Some(&tid) = self.waiting_reads.back() {
            self.ops.get_mut(&tid).expect("op queued").on_write.push(cb);
        } else {
            cb();
        }
    }

    /// Epoch change: drop every op, release every pin, reset horizons.
    pub fn on_change(&mut self) {
        debug!(dropped = self.ops.len(), "rmw pipeline on_change");
        self.completed_to = Version::zero();
        self.committed_to = Version::zero();
        self.pipeline_state = PipelineState::CacheValid;
        self.waiting_state.clear();
        self.waiting_reads.clear();
        self.waiting_commit.clear();
        self.ops.clear();
        self.cache.on_change();
    }

    fn process_cache_outcome(&mut self, outcome: CacheOutcome, eff: &mut RmwEffects) {
        for (oid, want) in outcome.backend_reads {
            eff.reads.push(RmwRead {
                kind: RmwReadKind::Cache,
                oid,
                want,
            });
        }
        for (tid, oid, result) in outcome.ready {
            match self.ops.get_mut(&tid) {
                Some(op) => {
                    trace!(tid, %oid, "cache ready");
                    op.remote_read_result = Some(result);
                    op.pending_read.clear();
                    op.reads_outstanding = false;
                }
                None => warn!(tid, %oid, "cache ready for unknown op"),
            }
        }
    }
}
