//! The seam between the pipelines and the owning placement group.
//!
//! Membership, missing sets, the log horizon, message transport, and
//! local transaction execution all live behind `PgParent`. The
//! pipelines hold it as `Arc<dyn PgParent>` and call it with `&self`;
//! implementations use interior mutability where they need state (the
//! tid counter, outgoing message queues).

use std::collections::{BTreeMap, BTreeSet};

use ecstore_proto::message::PgStats;
use ecstore_proto::{ObjectId, PgShard, SubOpMessage, SubOpWrite, Version};

/// Placement group identity and aggregate stats.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgInfo {
    pub pgid: u32,
    pub stats: PgStats,
}

/// What the PG knows about one shard peer.
#[derive(Debug, Clone, Copy)]
pub struct ShardInfo {
    /// Objects strictly below this id are populated on the shard;
    /// `ObjectId::MAX` once backfill has finished.
    pub last_backfill: ObjectId,
    pub stats: PgStats,
}

pub trait PgParent: Send + Sync {
    /// Shards currently acting for the PG.
    fn get_acting_shards(&self) -> BTreeSet<PgShard>;

    /// Shards being backfilled.
    fn get_backfill_shards(&self) -> BTreeSet<PgShard>;

    /// Every shard a write must reach: acting, recovering, backfilling.
    fn get_acting_recovery_backfill_shards(&self) -> BTreeSet<PgShard>;

    /// Objects the shard is known to be missing.
    fn get_shard_missing(&self, shard: &PgShard) -> BTreeSet<ObjectId>;

    fn get_shard_info(&self, shard: &PgShard) -> ShardInfo;

    /// Known locations of objects missing from the acting set.
    fn get_missing_loc_shards(&self) -> BTreeMap<ObjectId, BTreeSet<PgShard>>;

    /// This OSD's own shard.
    fn whoami_shard(&self) -> PgShard;

    /// Allocate a transaction id. Monotonic per PG.
    fn get_tid(&self) -> u64;

    fn get_info(&self) -> PgInfo;

    fn get_osdmap_epoch(&self) -> u64;

    fn get_interval_start_epoch(&self) -> u64;

    /// Ship sub-op messages to peer shards. The transport is fire and
    /// forget; replies come back as events.
    fn send_cluster_messages(&self, messages: Vec<(PgShard, SubOpMessage)>, epoch: u64);

    /// Execute a sub-write addressed to this OSD's own shard. The
    /// executor must post the matching `SubOpWriteReply` back to the
    /// worker once the transaction commits, exactly as a remote shard
    /// would.
    fn handle_local_sub_write(&self, write: SubOpWrite);

    /// Fold an op's stats delta into the PG stats.
    fn apply_stats(&self, oid: ObjectId, delta: PgStats);

    /// The log's current rollback horizon.
    fn can_rollback_to(&self) -> Version;

    /// Whether a sub-write's transaction should be shipped to `shard`
    /// for `oid` (backfill targets past their horizon only get the log
    /// entries).
    fn should_send_op(&self, shard: &PgShard, oid: ObjectId) -> bool;

    /// Pool allows partial-stripe overwrites.
    fn allows_ec_overwrites(&self) -> bool;
}
