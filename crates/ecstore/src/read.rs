//! Read pipeline: plan, dispatch, gather, decode.
//!
//! A client read is striped into per-shard want-sets, narrowed to the
//! minimum set of available shards that can decode it, dispatched as
//! sub-reads, and decoded back into a contiguous buffer when the
//! replies drain. Shard errors trigger a re-plan over the remaining
//! shards rather than a subtraction from the first plan, so a retry
//! may legitimately re-read a shard.
//!
//! The same machinery serves three other consumers through completion
//! targets: RMW ops reading their pre-image, extent-cache backend
//! reads, and recovery reads that reconstruct a missing shard's
//! extents. Client completions fire strictly in submission order via a
//! FIFO of in-progress statuses, no matter how the decodes interleave.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use ecstore_core::codec::SubChunkPlan;
use ecstore_core::{ErasureCode, ExtentMap, ExtentSet, ShardExtentMap, StripeInfo};
use ecstore_proto::constants::PAGE_SIZE;
use ecstore_proto::message::{SubOpRead, SubOpReadReply};
use ecstore_proto::{EcError, EcResult, ObjectId, PgShard, ShardId, SpgId, SubOpMessage};
use tracing::{debug, trace, warn};

use crate::config::EcConfig;
use crate::parent::PgParent;

/// Default sub-read message priority.
pub const DEFAULT_PRIORITY: u8 = 127;
/// Priority for recovery-driven reads.
pub const RECOVERY_PRIORITY: u8 = 63;

/// One client-visible byte range to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcAlign {
    pub offset: u64,
    pub size: u64,
    pub flags: u32,
}

impl EcAlign {
    pub fn new(offset: u64, size: u64) -> Self {
        Self {
            offset,
            size,
            flags: 0,
        }
    }
}

/// Planned read for one shard.
#[derive(Debug, Clone, Default)]
pub struct ShardRead {
    pub extents: ExtentSet,
    pub subchunk: SubChunkPlan,
}

/// Per-object read request inside a [`ReadOp`].
pub struct ReadRequest {
    /// Client ranges to decode, RO space. Empty for shard-extent reads.
    pub to_read: Vec<EcAlign>,
    /// Exact shard extents the caller wants back, for RMW, cache, and
    /// recovery reads.
    pub want_shard_extents: Option<BTreeMap<ShardId, ExtentSet>>,
    /// The planned sub-reads.
    pub shard_reads: BTreeMap<PgShard, ShardRead>,
    pub want_attrs: bool,
}

/// Per-object accumulated result.
pub struct ReadResult {
    pub errors: BTreeMap<PgShard, EcError>,
    pub attrs: Option<BTreeMap<String, Vec<u8>>>,
    pub buffers_read: ShardExtentMap,
    /// Terminal error; set once no further retry can help.
    pub r: Option<EcError>,
}

impl ReadResult {
    fn new(sinfo: Arc<StripeInfo>) -> Self {
        Self {
            errors: BTreeMap::new(),
            attrs: None,
            buffers_read: ShardExtentMap::new(sinfo),
            r: None,
        }
    }
}

/// Decoded outcome for one object of a client read.
pub struct EcExtent {
    pub err: Option<EcError>,
    pub emap: ExtentMap,
}

pub type ClientReadCallback = Box<dyn FnOnce(BTreeMap<ObjectId, EcExtent>) + Send>;

/// What a recovery read hands back: the reconstructed shard extents
/// plus any attributes that were requested along the way.
pub struct RecoveryReadResult {
    pub buffers: ShardExtentMap,
    pub attrs: Option<BTreeMap<String, Vec<u8>>>,
}

pub type RecoveryReadCallback = Box<dyn FnOnce(ObjectId, EcResult<RecoveryReadResult>) + Send>;

/// Who gets the result of a [`ReadOp`].
pub enum CompletionTarget {
    /// A client read; completions flow through the FIFO statuses.
    Client { status_id: u64 },
    /// An RMW op's pre-image read, keyed by the RMW op's tid.
    Rmw { tid: u64 },
    /// An extent-cache backend read.
    CacheFill,
    /// A recovery read; the callback fires on completion.
    Recovery { cb: RecoveryReadCallback },
}

/// Completions the owner must deliver after pipeline entry points.
pub enum ReadCompletion {
    Client {
        cb: ClientReadCallback,
        results: BTreeMap<ObjectId, EcExtent>,
    },
    Rmw {
        tid: u64,
        oid: ObjectId,
        result: EcResult<ShardExtentMap>,
    },
    CacheFill {
        oid: ObjectId,
        result: EcResult<ShardExtentMap>,
    },
}

/// One in-flight multi-object read.
pub struct ReadOp {
    pub tid: u64,
    pub priority: u8,
    pub do_redundant_reads: bool,
    pub for_recovery: bool,
    pub to_read: BTreeMap<ObjectId, ReadRequest>,
    pub complete: BTreeMap<ObjectId, ReadResult>,
    /// Raw-shard indices the caller needs decoded, per object.
    pub want_to_read: BTreeMap<ObjectId, BTreeSet<usize>>,
    pub obj_to_source: BTreeMap<ObjectId, BTreeSet<PgShard>>,
    pub source_to_obj: BTreeMap<PgShard, BTreeSet<ObjectId>>,
    pub in_progress: BTreeSet<PgShard>,
    target: CompletionTarget,
}

struct ClientReadStatus {
    id: u64,
    objects_remaining: usize,
    results: BTreeMap<ObjectId, EcExtent>,
    cb: Option<ClientReadCallback>,
}

impl ClientReadStatus {
    fn complete_object(&mut self, oid: ObjectId, outcome: EcExtent) {
        self.results.insert(oid, outcome);
        self.objects_remaining -= 1;
    }
}

pub struct ReadPipeline {
    cfg: EcConfig,
    codec: Arc<dyn ErasureCode>,
    sinfo: Arc<StripeInfo>,
    parent: Arc<dyn PgParent>,
    tid_to_read_map: BTreeMap<u64, ReadOp>,
    shard_to_read_map: BTreeMap<PgShard, BTreeSet<u64>>,
    in_progress_client_reads: VecDeque<ClientReadStatus>,
    next_status_id: u64,
}

impl ReadPipeline {
    pub fn new(
        cfg: EcConfig,
        codec: Arc<dyn ErasureCode>,
        sinfo: Arc<StripeInfo>,
        parent: Arc<dyn PgParent>,
    ) -> Self {
        Self {
            cfg,
            codec,
            sinfo,
            parent,
            tid_to_read_map: BTreeMap::new(),
            shard_to_read_map: BTreeMap::new(),
            in_progress_client_reads: VecDeque::new(),
            next_status_id: 0,
        }
    }

    pub fn outstanding_ops(&self) -> usize {
        self.tid_to_read_map.len()
    }

    /// Read and decode client byte ranges across objects. Completions
    /// are returned as they become deliverable, which may already
    /// include this read if every object failed planning.
    pub fn objects_read_and_reconstruct(
        &mut self,
        reads: BTreeMap<ObjectId, Vec<EcAlign>>,
        fast_read: bool,
        cb: ClientReadCallback,
    ) -> Vec<ReadCompletion> {
        let status_id = self.next_status_id;
        self.next_status_id += 1;
        self.in_progress_client_reads.push_back(ClientReadStatus {
            id: status_id,
            objects_remaining: reads.len(),
            results: BTreeMap::new(),
            cb: Some(cb),
        });
        if reads.is_empty() {
            return self.kick_reads();
        }

        let redundant = fast_read || self.cfg.redundant_reads;
        let mut to_read = BTreeMap::new();
        let mut want_to_read = BTreeMap::new();

        for (oid, aligns) in reads {
            let want_shard_reads = self.get_want_to_read_shards(&aligns);
            let want_raw: BTreeSet<usize> = want_shard_reads
                .iter()
                .enumerate()
                .filter(|(_, sr)| !sr.extents.is_empty())
                .map(|(i, _)| i)
                .collect();
            if want_raw.is_empty() {
                // Zero-length ranges want no shards at all.
                self.status_mut(status_id).complete_object(
                    oid,
                    EcExtent {
                        err: None,
                        emap: ExtentMap::new(),
                    },
                );
                continue;
            }

            match self.get_min_avail_to_read_shards(
                oid,
                &want_shard_reads,
                false,
                redundant,
                &BTreeSet::new(),
            ) {
                Ok(shard_reads) => {
                    to_read.insert(
                        oid,
                        ReadRequest {
                            to_read: aligns,
                            want_shard_extents: None,
                            shard_reads,
                            want_attrs: false,
                        },
                    );
                    want_to_read.insert(oid, want_raw);
                }
                Err(e) => {
                    warn!(%oid, error = %e, "cannot plan read");
                    self.status_mut(status_id).complete_object(
                        oid,
                        EcExtent {
                            err: Some(e),
                            emap: ExtentMap::new(),
                        },
                    );
                }
            }
        }

        if !to_read.is_empty() {
            self.start_read_op(
                DEFAULT_PRIORITY,
                want_to_read,
                to_read,
                redundant,
                false,
                CompletionTarget::Client { status_id },
            );
        }
        self.kick_reads()
    }

    /// Read exact shard extents (reconstructing any that are missing)
    /// on behalf of the RMW pipeline, the cache, or recovery.
    pub fn read_shard_extents(
        &mut self,
        oid: ObjectId,
        want: BTreeMap<ShardId, ExtentSet>,
        priority: u8,
        for_recovery: bool,
        want_attrs: bool,
        target: CompletionTarget,
    ) -> EcResult<u64> {
        let mut want_shard_reads = vec![ShardRead::default(); self.sinfo.k_plus_m()];
        let mut want_raw = BTreeSet::new();
        for (&shard, eset) in &want {
            let raw = self.sinfo.raw_shard(shard);
            want_shard_reads[raw].extents.union_with(eset);
            want_raw.insert(raw);
        }

        let shard_reads = self.get_min_avail_to_read_shards(
            oid,
            &want_shard_reads,
            for_recovery,
            false,
            &BTreeSet::new(),
        )?;

        let mut to_read = BTreeMap::new();
        to_read.insert(
            oid,
            ReadRequest {
                to_read: Vec::new(),
                want_shard_extents: Some(want),
                shard_reads,
                want_attrs,
            },
        );
        let mut want_map = BTreeMap::new();
        want_map.insert(oid, want_raw);

        Ok(self.start_read_op(
            if for_recovery {
                RECOVERY_PRIORITY
            } else {
                DEFAULT_PRIORITY
            },
            want_map,
            to_read,
            false,
            for_recovery,
            target,
        ))
    }

    /// Striping plan: which extents of which raw shards a set of client
    /// ranges wants. With partial reads disabled, every data shard's
    /// full chunk-aligned footprint is read instead.
    pub fn get_want_to_read_shards(&self, to_read: &[EcAlign]) -> Vec<ShardRead> {
        let mut out = vec![ShardRead::default(); self.sinfo.k_plus_m()];
        if self.cfg.partial_reads {
            for align in to_read {
                for (shard, eset) in self
                    .sinfo
                    .ro_range_to_shard_extent_set(align.offset, align.size)
                {
                    out[self.sinfo.raw_shard(shard)].extents.union_with(&eset);
                }
            }
        } else {
            for raw in 0..self.sinfo.k() {
                for align in to_read {
                    let (off, len) = self
                        .sinfo
                        .chunk_aligned_offset_len_to_chunk(align.offset, align.size);
                    out[raw].extents.insert(off, len);
                }
            }
        }
        out
    }

    /// Availability pass: which shards can serve reads for `hoid`.
    fn get_all_avail_shards(
        &self,
        hoid: ObjectId,
        error_shards: &BTreeSet<PgShard>,
        for_recovery: bool,
    ) -> (BTreeSet<ShardId>, BTreeMap<ShardId, PgShard>) {
        let mut have = BTreeSet::new();
        let mut shards = BTreeMap::new();

        for pg_shard in self.parent.get_acting_shards() {
            if error_shards.contains(&pg_shard) {
                continue;
            }
            if self.parent.get_shard_missing(&pg_shard).contains(&hoid) {
                continue;
            }
            if have.insert(pg_shard.shard) {
                shards.insert(pg_shard.shard, pg_shard);
            }
        }

        if for_recovery {
            for pg_shard in self.parent.get_backfill_shards() {
                if error_shards.contains(&pg_shard) || have.contains(&pg_shard.shard) {
                    continue;
                }
                let info = self.parent.get_shard_info(&pg_shard);
                if hoid < info.last_backfill
                    && !self.parent.get_shard_missing(&pg_shard).contains(&hoid)
                {
                    have.insert(pg_shard.shard);
                    shards.insert(pg_shard.shard, pg_shard);
                }
            }

            if let Some(locs) = self.parent.get_missing_loc_shards().get(&hoid) {
                for pg_shard in locs {
                    if error_shards.contains(pg_shard) {
                        continue;
                    }
                    if have.insert(pg_shard.shard) {
                        shards.insert(pg_shard.shard, *pg_shard);
                    }
                }
            }
        }

        (have, shards)
    }

    /// Narrow a want-plan to concrete per-shard reads over available
    /// shards, growing reads with the extents needed for decode and
    /// rounding everything to page bounds.
    pub fn get_min_avail_to_read_shards(
        &self,
        hoid: ObjectId,
        want_shard_reads: &[ShardRead],
        for_recovery: bool,
        do_redundant_reads: bool,
        error_shards: &BTreeSet<PgShard>,
    ) -> EcResult<BTreeMap<PgShard, ShardRead>> {
        // Redundant reads never make sense for recovery.
        assert!(!for_recovery || !do_redundant_reads);

        let (have_ids, shards) = self.get_all_avail_shards(hoid, error_shards, for_recovery);
        let have_raw: BTreeSet<usize> = have_ids
            .iter()
            .map(|&id| self.sinfo.raw_shard(id))
            .collect();
        let want_raw: BTreeSet<usize> = want_shard_reads
            .iter()
            .enumerate()
            .filter(|(_, sr)| !sr.extents.is_empty())
            .map(|(i, _)| i)
            .collect();

        let mut need = self.codec.minimum_to_decode(&want_raw, &have_raw)?;

        if do_redundant_reads {
            let full: SubChunkPlan = vec![(0, self.codec.sub_chunk_count())];
            need = have_raw.iter().map(|&r| (r, full.clone())).collect();
        }

        // Extents that must be read on every scheduled shard so a
        // missing shard can be decoded. Without the experimental
        // partial-reads flag this is the superset of all want extents:
        // the retry path may re-plan, and must be able to decode from
        // whatever the first pass read.
        let mut extra_extents = ExtentSet::new();
        for (raw, sr) in want_shard_reads.iter().enumerate() {
            if sr.extents.is_empty() {
                continue;
            }
            if !have_raw.contains(&raw)
                || do_redundant_reads
                || !self.cfg.partial_reads_experimental
            {
                extra_extents.union_with(&sr.extents);
            }
        }

        let mut out = BTreeMap::new();
        for (raw, subchunk) in need {
            if !have_raw.contains(&raw) {
                continue;
            }
            let pg_shard = shards[&self.sinfo.shard(raw)];
            let mut extents = extra_extents.clone();
            if let Some(sr) = want_shard_reads.get(raw) {
                extents.union_with(&sr.extents);
            }
            extents.align(PAGE_SIZE);
            out.insert(pg_shard, ShardRead { extents, subchunk });
        }
        Ok(out)
    }

    /// Register and dispatch a new read op.
    pub fn start_read_op(
        &mut self,
        priority: u8,
        want_to_read: BTreeMap<ObjectId, BTreeSet<usize>>,
        to_read: BTreeMap<ObjectId, ReadRequest>,
        do_redundant_reads: bool,
        for_recovery: bool,
        target: CompletionTarget,
    ) -> u64 {
        let tid = self.parent.get_tid();
        assert!(!self.tid_to_read_map.contains_key(&tid));
        let complete = to_read
            .keys()
            .map(|&oid| (oid, ReadResult::new(self.sinfo.clone())))
            .collect();
        let oids: Vec<ObjectId> = to_read.keys().copied().collect();
        self.tid_to_read_map.insert(
            tid,
            ReadOp {
                tid,
                priority,
                do_redundant_reads,
                for_recovery,
                to_read,
                complete,
                want_to_read,
                obj_to_source: BTreeMap::new(),
                source_to_obj: BTreeMap::new(),
                in_progress: BTreeSet::new(),
                target,
            },
        );
        debug!(tid, objects = oids.len(), "starting read op");
        self.dispatch_reads(tid, &oids);
        tid
    }

    /// Build and send sub-read messages for the given objects of an op.
    fn dispatch_reads(&mut self, tid: u64, oids: &[ObjectId]) {
        let info = self.parent.get_info();
        let map_epoch = self.parent.get_osdmap_epoch();
        let min_epoch = self.parent.get_interval_start_epoch();
        let from = self.parent.whoami_shard();

        let op = self.tid_to_read_map.get_mut(&tid).expect("op just inserted");
        let mut messages: BTreeMap<PgShard, SubOpRead> = BTreeMap::new();

        for &oid in oids {
            let rr = &op.to_read[&oid];
            let mut need_attrs = rr.want_attrs
                && op.complete.get(&oid).map_or(true, |res| res.attrs.is_none());
            let flags = rr.to_read.first().map(|a| a.flags).unwrap_or(0);

            for (&pg_shard, shard_read) in &rr.shard_reads {
                let msg = messages.entry(pg_shard).or_insert_with(|| SubOpRead {
                    pgid: SpgId {
                        pgid: info.pgid,
                        shard: pg_shard.shard,
                    },
                    map_epoch,
                    min_epoch,
                    from,
                    tid,
                    priority: op.priority,
                    to_read: BTreeMap::new(),
                    subchunks: BTreeMap::new(),
                    attrs_to_read: BTreeSet::new(),
                });
                if need_attrs {
                    // Attrs ride on exactly one shard per object.
                    msg.attrs_to_read.insert(oid);
                    need_attrs = false;
                }
                msg.subchunks.insert(oid, shard_read.subchunk.clone());
                msg.to_read.insert(
                    oid,
                    shard_read
                        .extents
                        .iter()
                        .map(|(off, len)| (off, len, flags))
                        .collect(),
                );
                op.obj_to_source.entry(oid).or_default().insert(pg_shard);
                op.source_to_obj.entry(pg_shard).or_default().insert(oid);
            }
        }

        let mut to_send = Vec::with_capacity(messages.len());
        for (pg_shard, msg) in messages {
            op.in_progress.insert(pg_shard);
            self.shard_to_read_map
                .entry(pg_shard)
                .or_default()
                .insert(tid);
            to_send.push((pg_shard, SubOpMessage::Read(msg)));
        }
        trace!(tid, shards = to_send.len(), "dispatching sub-reads");
        if !to_send.is_empty() {
            self.parent.send_cluster_messages(to_send, map_epoch);
        }
    }

    /// Fold a shard's reply into its op. When the op's outstanding
    /// shard set drains, either complete it or schedule more reads.
    pub fn handle_sub_read_reply(
        &mut self,
        from: PgShard,
        reply: SubOpReadReply,
    ) -> Vec<ReadCompletion> {
        let tid = reply.tid;
        let Some(op) = self.tid_to_read_map.get_mut(&tid) else {
            // On-change dropped the op; the reply is stale.
            debug!(tid, %from, "reply for unknown read op");
            return Vec::new();
        };

        for (oid, bufs) in reply.buffers_read {
            if let Some(res) = op.complete.get_mut(&oid) {
                for (off, data) in bufs {
                    res.buffers_read.insert_in_shard(from.shard, off, data);
                }
            }
        }
        for (oid, attrs) in reply.attrs_read {
            if let Some(res) = op.complete.get_mut(&oid) {
                res.attrs = Some(attrs);
            }
        }
        for (oid, err) in reply.errors {
            if let Some(res) = op.complete.get_mut(&oid) {
                warn!(tid, %from, %oid, error = %err, "shard read error");
                res.errors.insert(from, err);
                // Whatever the shard sent for this object is suspect.
                res.buffers_read.erase_shard(from.shard);
            }
        }

        op.in_progress.remove(&from);
        let drained = op.in_progress.is_empty();
        if let Some(tids) = self.shard_to_read_map.get_mut(&from) {
            tids.remove(&tid);
        }

        if !drained {
            return Vec::new();
        }
        self.check_op_complete(tid)
    }

    /// All outstanding replies for `tid` have arrived. Objects whose
    /// errors can be absorbed (enough shards still read) are cleared;
    /// the rest get one re-plan; anything unplannable goes terminal.
    fn check_op_complete(&mut self, tid: u64) -> Vec<ReadCompletion> {
        let op = &self.tid_to_read_map[&tid];
        let mut to_retry = Vec::new();
        let mut to_fail: Vec<(ObjectId, EcError)> = Vec::new();

        for (&oid, res) in &op.complete {
            if res.r.is_some() || res.errors.is_empty() {
                continue;
            }
            let avail: BTreeSet<usize> = res
                .buffers_read
                .extent_maps()
                .keys()
                .map(|&s| self.sinfo.raw_shard(s))
                .collect();
            let want = &op.want_to_read[&oid];
            if self.codec.minimum_to_decode(want, &avail).is_ok() {
                // Decode can proceed without the errored shards.
                continue;
            }
            to_retry.push(oid);
        }

        // Errors that decode can absorb are forgotten.
        let op = self.tid_to_read_map.get_mut(&tid).expect("op exists");
        for (&oid, res) in op.complete.iter_mut() {
            if res.r.is_none() && !to_retry.contains(&oid) {
                res.errors.clear();
            }
        }

        let mut rescheduled = Vec::new();
        for oid in to_retry {
            match self.plan_remaining_reads(tid, oid) {
                Ok(()) => rescheduled.push(oid),
                Err(e) => to_fail.push((oid, e)),
            }
        }
        if !rescheduled.is_empty() {
            debug!(tid, objects = rescheduled.len(), "re-reading after shard errors");
            self.dispatch_reads(tid, &rescheduled);
        }

        let op = self.tid_to_read_map.get_mut(&tid).expect("op exists");
        for (oid, err) in to_fail {
            warn!(tid, %oid, error = %err, "read failed, no shards left to try");
            if let Some(res) = op.complete.get_mut(&oid) {
                res.r = Some(err);
            }
        }

        if op.in_progress.is_empty() {
            self.complete_read_op(tid)
        } else {
            Vec::new()
        }
    }

    /// Re-plan an object's reads from scratch over the shards that have
    /// not errored. Prior reads are deliberately not subtracted: a
    /// partial first pass may need to re-read a shard, and overlapping
    /// buffers simply overwrite.
    fn plan_remaining_reads(&mut self, tid: u64, oid: ObjectId) -> EcResult<()> {
        let op = &self.tid_to_read_map[&tid];
        let rr = &op.to_read[&oid];
        let res = &op.complete[&oid];
        let error_shards: BTreeSet<PgShard> = res.errors.keys().copied().collect();

        let want_shard_reads = match &rr.want_shard_extents {
            Some(want) => {
                let mut wsr = vec![ShardRead::default(); self.sinfo.k_plus_m()];
                for (&shard, eset) in want {
                    wsr[self.sinfo.raw_shard(shard)].extents.union_with(eset);
                }
                wsr
            }
            None => self.get_want_to_read_shards(&rr.to_read),
        };

        let shard_reads = self.get_min_avail_to_read_shards(
            oid,
            &want_shard_reads,
            op.for_recovery,
            false,
            &error_shards,
        )?;

        let op = self.tid_to_read_map.get_mut(&tid).expect("op exists");
        let rr = op.to_read.get_mut(&oid).expect("request exists");
        rr.shard_reads = shard_reads;
        Ok(())
    }

    /// Finalize an op: run per-object decode for its target and clean
    /// up the indexes.
    fn complete_read_op(&mut self, tid: u64) -> Vec<ReadCompletion> {
        let mut op = self.tid_to_read_map.remove(&tid).expect("op exists");
        assert_eq!(op.to_read.len(), op.complete.len());
        for pg_shard in op.source_to_obj.keys() {
            if let Some(tids) = self.shard_to_read_map.get_mut(pg_shard) {
                tids.remove(&tid);
            }
        }
        debug!(tid, "completing read op");

        let target = std::mem::replace(&mut op.target, CompletionTarget::CacheFill);
        match target {
            CompletionTarget::Client { status_id } => {
                for (oid, rr) in &op.to_read {
                    assert!(op.want_to_read.contains_key(oid));
                    let res = op.complete.get_mut(oid).expect("result exists");
                    let outcome = self.finish_client_request(rr, res);
                    self.status_mut(status_id).complete_object(*oid, outcome);
                }
                self.kick_reads()
            }
            CompletionTarget::Rmw { tid: rmw_tid } => {
                let (oid, result) = Self::finish_shard_read(&self.codec, &mut op);
                vec![ReadCompletion::Rmw {
                    tid: rmw_tid,
                    oid,
                    result,
                }]
            }
            CompletionTarget::CacheFill => {
                let (oid, result) = Self::finish_shard_read(&self.codec, &mut op);
                vec![ReadCompletion::CacheFill { oid, result }]
            }
            CompletionTarget::Recovery { cb } => {
                let (oid, result) = Self::finish_shard_read(&self.codec, &mut op);
                let attrs = op
                    .complete
                    .get_mut(&oid)
                    .and_then(|res| res.attrs.take());
                cb(
                    oid,
                    result.map(|buffers| RecoveryReadResult { buffers, attrs }),
                );
                Vec::new()
            }
        }
    }

    /// Decode one client object: re-slice shard buffers into per-chunk
    /// rectangles, decode each chunk, and trim to the requested ranges.
    fn finish_client_request(&self, rr: &ReadRequest, res: &mut ReadResult) -> EcExtent {
        if let Some(err) = res.r {
            return EcExtent {
                err: Some(err),
                emap: ExtentMap::new(),
            };
        }
        assert!(res.errors.is_empty());

        let mut emap = ExtentMap::new();
        for read in &rr.to_read {
            let (off, chunks) = self.shard_buffers_to_chunk_buffers(read, &res.buffers_read);
            let mut bl = Vec::new();
            for (want, bufs) in chunks {
                match self.codec.decode_concat(&want, &bufs) {
                    Ok(decoded) => bl.extend_from_slice(&decoded),
                    Err(e) => {
                        debug!(error = %e, "decode failed");
                        res.r = Some(e);
                        return EcExtent {
                            err: Some(e),
                            emap: ExtentMap::new(),
                        };
                    }
                }
            }
            let len = read.size.min((bl.len() as u64).saturating_sub(off));
            if len > 0 {
                emap.insert(
                    read.offset,
                    bl[off as usize..(off + len) as usize].to_vec(),
                );
            }
        }
        EcExtent { err: None, emap }
    }

    /// Deliver a shard-extent read: reconstruct wanted extents that are
    /// missing, then trim to exactly what was asked for.
    fn finish_shard_read(
        codec: &Arc<dyn ErasureCode>,
        op: &mut ReadOp,
    ) -> (ObjectId, EcResult<ShardExtentMap>) {
        let (&oid, _) = op
            .to_read
            .iter()
            .next()
            .expect("shard-extent reads carry one object");
        let rr = &op.to_read[&oid];
        let want = rr
            .want_shard_extents
            .clone()
            .expect("shard-extent read without want set");
        let res = op.complete.get_mut(&oid).expect("result exists");

        if let Some(err) = res.r {
            return (oid, Err(err));
        }
        let sinfo = res.buffers_read.stripe_info().clone();
        let mut sem = std::mem::replace(&mut res.buffers_read, ShardExtentMap::new(sinfo));
        if let Err(e) = sem.decode(codec.as_ref(), &want) {
            return (oid, Err(e));
        }
        (oid, Ok(sem.intersect(&want)))
    }

    /// Slice shard buffers into one rectangular chunk map per chunk the
    /// read touches. Each chunk prefers the buffer of its own shard;
    /// when that shard was not read, every shard holding the range
    /// contributes and decode fills the gap. Returns the byte offset of
    /// the read's first byte within the first chunk's decoded output.
    fn shard_buffers_to_chunk_buffers(
        &self,
        read: &EcAlign,
        buffers: &ShardExtentMap,
    ) -> (u64, Vec<(BTreeSet<usize>, BTreeMap<usize, Vec<u8>>)>) {
        let chunk_size = self.sinfo.chunk_size();
        let stripe_width = self.sinfo.stripe_width();
        let k = self.sinfo.k() as u64;

        let (a_off, a_len) = self.sinfo.offset_len_to_page_bounds(read.offset, read.size);
        let (ca_off, ca_len) = self.sinfo.offset_len_to_chunk_bounds(read.offset, read.size);

        let mut raw = (a_off / chunk_size) % k;
        let mut out = Vec::new();

        let mut chunk_offset = ca_off;
        while chunk_offset < ca_off + ca_len {
            if raw == k {
                raw = 0;
            }
            let sub_off = chunk_offset.max(a_off);
            let sub_shard_off =
                (chunk_offset / stripe_width) * chunk_size + sub_off - chunk_offset;
            let sub_len = (a_off + a_len).min(chunk_offset + chunk_size) - sub_off;

            let primary = self.sinfo.shard(raw as usize);
            let mut want = BTreeSet::new();
            want.insert(raw as usize);

            let mut bufs = BTreeMap::new();
            if let Ok(buf) = buffers.get_buffer(primary, sub_shard_off, sub_len, false) {
                bufs.insert(raw as usize, buf);
            } else {
                for (&shard, emap) in buffers.extent_maps() {
                    if let Some(buf) = emap.read(sub_shard_off, sub_len) {
                        bufs.insert(self.sinfo.raw_shard(shard), buf);
                    }
                }
            }
            out.push((want, bufs));

            chunk_offset += chunk_size;
            raw += 1;
        }

        (read.offset - a_off, out)
    }

    /// Fire client callbacks whose turn has come. Strictly FIFO: a
    /// finished read behind an unfinished one waits.
    pub fn kick_reads(&mut self) -> Vec<ReadCompletion> {
        let mut out = Vec::new();
        while let Some(front) = self.in_progress_client_reads.front() {
            if front.objects_remaining > 0 {
                break;
            }
            let mut st = self
                .in_progress_client_reads
                .pop_front()
                .expect("front exists");
            if let Some(cb) = st.cb.take() {
                out.push(ReadCompletion::Client {
                    cb,
                    results: std::mem::take(&mut st.results),
                });
            }
        }
        out
    }

    /// Epoch change: drop everything silently. Callers reissue.
    pub fn on_change(&mut self) {
        for (tid, op) in &self.tid_to_read_map {
            debug!(tid, objects = op.to_read.len(), "cancelling read op");
        }
        self.tid_to_read_map.clear();
        self.shard_to_read_map.clear();
        self.in_progress_client_reads.clear();
    }

    fn status_mut(&mut self, status_id: u64) -> &mut ClientReadStatus {
        self.in_progress_client_reads
            .iter_mut()
            .find(|st| st.id == status_id)
            .expect("client read status exists")
    }
}
