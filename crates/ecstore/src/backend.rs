//! The per-PG backend: event loop and pipeline orchestration.
//!
//! All pipeline state belongs to one `EcBackend`, driven by a single
//! consumer draining a [`PgEvent`] queue. External completions (sub-op
//! replies, client submissions, membership changes) enter as events;
//! every completion path ends by re-running the RMW state machine and
//! kicking the client-read FIFO, which is what keeps the pipelines
//! live-lock free.
//!
//! In the C predecessor this shape was callbacks posted onto the PG
//! worker; here it is a tokio task over an mpsc channel.

use std::collections::BTreeMap;
use std::sync::Arc;

use ecstore_core::hash_info::HashInfoRegistry;
use ecstore_core::{ErasureCode, ExtentSet, ShardExtentMap, StripeInfo};
use ecstore_proto::message::LogEntry;
use ecstore_proto::{ObjectId, PgShard, ReqId, ShardId, SubOpMessage, Version};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::EcConfig;
use crate::parent::PgParent;
use crate::read::{
    ClientReadCallback, CompletionTarget, EcAlign, ReadCompletion, ReadPipeline,
    RecoveryReadCallback, DEFAULT_PRIORITY,
};
use crate::rmw::{plan_overwrite, ClassicalOp, RMWPipeline, RmwEffects, RmwOp, RmwReadKind};

/// A client overwrite submission.
pub struct ClientWrite {
    pub oid: ObjectId,
    pub offset: u64,
    pub data: Vec<u8>,
    /// RO size of the object before this write.
    pub object_size: u64,
    /// Current object attributes (the hash-info attribute rides here).
    pub attrs: BTreeMap<String, Vec<u8>>,
    pub version: Version,
    pub reqid: ReqId,
    pub trim_to: Version,
    pub pg_committed_to: Version,
    pub invalidates_cache: bool,
    pub on_commit: Option<Box<dyn FnOnce(Version) + Send>>,
}

/// Everything that can wake the PG worker.
pub enum PgEvent {
    ClientRead {
        reads: BTreeMap<ObjectId, Vec<EcAlign>>,
        fast_read: bool,
        on_complete: ClientReadCallback,
    },
    ClientWrite(ClientWrite),
    /// Reconstruct a missing shard's extents for recovery.
    RecoveryRead {
        oid: ObjectId,
        want: BTreeMap<ShardId, ExtentSet>,
        on_complete: RecoveryReadCallback,
    },
    /// A sub-op frame from a peer shard.
    Message { from: PgShard, message: SubOpMessage },
    /// Epoch/interval change: drop everything in flight.
    OnChange,
}

pub struct EcBackend {
    sinfo: Arc<StripeInfo>,
    parent: Arc<dyn PgParent>,
    read_pipeline: ReadPipeline,
    rmw_pipeline: RMWPipeline,
    hash_registry: HashInfoRegistry,
}

impl EcBackend {
    pub fn new(
        cfg: EcConfig,
        codec: Arc<dyn ErasureCode>,
        sinfo: Arc<StripeInfo>,
        parent: Arc<dyn PgParent>,
    ) -> Self {
        let read_pipeline =
            ReadPipeline::new(cfg.clone(), codec.clone(), sinfo.clone(), parent.clone());
        let rmw_pipeline = RMWPipeline::new(cfg, codec, sinfo.clone(), parent.clone());
        Self {
            sinfo,
            parent,
            read_pipeline,
            rmw_pipeline,
            hash_registry: HashInfoRegistry::new(),
        }
    }

    pub fn read_pipeline(&self) -> &ReadPipeline {
        &self.read_pipeline
    }

    pub fn rmw_pipeline(&self) -> &RMWPipeline {
        &self.rmw_pipeline
    }

    /// Drain events until the sender closes or shutdown fires.
    pub async fn run(mut self, mut rx: UnboundedReceiver<PgEvent>, shutdown: Arc<Notify>) {
        info!("pg worker starting");
        loop {
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Some(event) => self.handle_event(event),
                        None => break,
                    }
                }
                _ = shutdown.notified() => {
                    info!("pg worker shutting down");
                    break;
                }
            }
        }
    }

    /// Single-consumer dispatch; everything the pipelines do happens
    /// inside here.
    pub fn handle_event(&mut self, event: PgEvent) {
        match event {
            PgEvent::ClientRead {
                reads,
                fast_read,
                on_complete,
            } => {
                let completions =
                    self.read_pipeline
                        .objects_read_and_reconstruct(reads, fast_read, on_complete);
                self.deliver(completions);
            }
            PgEvent::ClientWrite(write) => self.submit_write(write),
            PgEvent::RecoveryRead {
                oid,
                want,
                on_complete,
            } => {
                if let Err(e) = self.read_pipeline.read_shard_extents(
                    oid,
                    want,
                    crate::read::RECOVERY_PRIORITY,
                    true,
                    true,
                    CompletionTarget::Recovery { cb: on_complete },
                ) {
                    warn!(%oid, error = %e, "recovery read cannot be planned");
                }
            }
            PgEvent::Message { from, message } => self.handle_message(from, message),
            PgEvent::OnChange => self.on_change(),
        }
    }

    fn handle_message(&mut self, from: PgShard, message: SubOpMessage) {
        match message {
            SubOpMessage::ReadReply(reply) => {
                let completions = self.read_pipeline.handle_sub_read_reply(from, reply);
                self.deliver(completions);
            }
            SubOpMessage::WriteReply(reply) => {
                let effects = self.rmw_pipeline.handle_sub_write_reply(from, reply);
                self.run_effects(effects);
            }
            SubOpMessage::Read(_) | SubOpMessage::Write(_) => {
                // Serving sub-ops is the shard executor's job, not the
                // primary pipeline's.
                warn!(%from, "unexpected sub-op request on pg worker");
            }
        }
    }

    /// Build the plan and payload for an overwrite and feed the RMW
    /// pipeline.
    fn submit_write(&mut self, write: ClientWrite) {
        let tid = self.parent.get_tid();
        let len = write.data.len() as u64;
        debug!(oid = %write.oid, offset = write.offset, len, tid, "client write");

        let plan = plan_overwrite(&self.sinfo, write.offset, len, write.object_size);
        let mut writes = ShardExtentMap::new(self.sinfo.clone());
        writes.insert_ro_buffer(write.offset, &write.data);

        let shard_size = ((write.object_size + self.sinfo.stripe_width() - 1)
            / self.sinfo.stripe_width())
            * self.sinfo.chunk_size();
        let hinfo = self.hash_registry.get_hash_info(
            write.oid,
            self.sinfo.k_plus_m(),
            true,
            &write.attrs,
            shard_size,
        );

        let payload = ClassicalOp {
            writes,
            before_size: write.object_size,
            hinfo,
            invalidates_cache: write.invalidates_cache,
        };
        let log_entries = vec![LogEntry {
            version: write.version,
            oid: write.oid,
        }];
        let mut op = RmwOp::new_write(
            tid,
            write.oid,
            write.reqid,
            write.version,
            write.trim_to,
            write.pg_committed_to,
            plan,
            payload,
            log_entries,
        );
        op.on_commit = write.on_commit;

        let effects = self.rmw_pipeline.start_rmw(op);
        self.run_effects(effects);
    }

    /// Order a callback behind the most recently submitted write.
    pub fn call_write_ordered(&mut self, cb: Box<dyn FnOnce() + Send>) {
        self.rmw_pipeline.call_write_ordered(cb);
    }

    /// Route finished reads to their consumers.
    fn deliver(&mut self, completions: Vec<ReadCompletion>) {
        for completion in completions {
            match completion {
                ReadCompletion::Client { cb, results } => cb(results),
                ReadCompletion::Rmw { tid, oid: _, result } => {
                    let effects = self.rmw_pipeline.on_read_complete(tid, result);
                    self.run_effects(effects);
                }
                ReadCompletion::CacheFill { oid, result } => {
                    let effects = self.rmw_pipeline.on_cache_read_done(oid, result);
                    self.run_effects(effects);
                }
            }
        }
    }

    /// Issue the reads the RMW pipeline asked for.
    fn run_effects(&mut self, effects: RmwEffects) {
        for read in effects.reads {
            let target = match read.kind {
                RmwReadKind::Direct { tid } => CompletionTarget::Rmw { tid },
                RmwReadKind::Cache => CompletionTarget::CacheFill,
            };
            match self.read_pipeline.read_shard_extents(
                read.oid,
                read.want,
                DEFAULT_PRIORITY,
                false,
                false,
                target,
            ) {
                Ok(_) => {}
                // An overwrite that cannot read its pre-image cannot
                // roll forward or back; this is not survivable.
                Err(e) => panic!("cannot plan rmw pre-image read for {}: {}", read.oid, e),
            }
        }
    }

    fn on_change(&mut self) {
        debug!("on_change: dropping all in-flight ops");
        self.read_pipeline.on_change();
        self.rmw_pipeline.on_change();
        self.hash_registry.on_change();
    }
}
