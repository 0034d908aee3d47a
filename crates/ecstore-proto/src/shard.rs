/// Shard, placement-group, and version identifiers.
///
/// A "shard" is one of the `k + m` storage locations holding a slice of
/// every object in a placement group. `ShardId` is the *physical* shard
/// id used for placement and message routing; the codec-facing
/// *raw-shard index* is a plain `usize` translated through the stripe
/// layout's chunk mapping.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Physical shard id within a placement group, `0..k+m`.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ShardId(pub u8);

impl ShardId {
    #[inline]
    pub const fn new(id: u8) -> Self {
        Self(id)
    }

    #[inline]
    pub const fn raw(self) -> u8 {
        self.0
    }
}

impl fmt::Debug for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A shard as placed on a concrete OSD: the routing address for sub-ops.
///
/// Two acting sets may place the same `ShardId` on different OSDs across
/// an interval change, so identity is the pair, not the shard id alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct PgShard {
    /// The OSD holding this shard.
    pub osd: u32,
    /// Which shard of the stripe it holds.
    pub shard: ShardId,
}

impl PgShard {
    pub const fn new(osd: u32, shard: ShardId) -> Self {
        Self { osd, shard }
    }
}

impl fmt::Display for PgShard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.osd, self.shard)
    }
}

/// Placement group id qualified with the shard a message is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpgId {
    pub pgid: u32,
    pub shard: ShardId,
}

impl fmt::Display for SpgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.pgid, self.shard)
    }
}

/// A log version: epoch-qualified sequence number.
///
/// Ordered lexicographically by `(epoch, v)`. Commit horizons
/// (`completed_to`, `committed_to`, `pg_committed_to`, `trim_to`) are
/// all versions and only ever advance.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Version {
    pub epoch: u64,
    pub v: u64,
}

impl Version {
    pub const fn new(epoch: u64, v: u64) -> Self {
        Self { epoch, v }
    }

    pub const fn zero() -> Self {
        Self { epoch: 0, v: 0 }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}'{}", self.epoch, self.v)
    }
}

/// Client request id, for idempotency tracking in the log.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ReqId {
    /// Originating client id.
    pub client: u64,
    /// Client-local sequence number.
    pub tid: u64,
}

impl fmt::Display for ReqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client.{}:{}", self.client, self.tid)
    }
}
