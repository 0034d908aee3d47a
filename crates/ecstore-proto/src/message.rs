/// Sub-op wire messages exchanged between shards.
///
/// One read and one write message, each with a matching reply. Messages
/// are serde enums serialized with bincode behind a u32 length prefix;
/// the transport that actually moves frames between OSDs is external
/// and only sees opaque byte frames.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::constants::MAX_FRAME_LEN;
use crate::error::EcError;
use crate::oid::ObjectId;
use crate::shard::{PgShard, ReqId, SpgId, Version};
use crate::transaction::ShardTransaction;

/// One byte extent of a sub-read: `(offset, length, flags)`.
pub type ReadExtent = (u64, u64, u32);

/// Sub-chunk selector required by helper-plane codes: `(start, count)`
/// pairs in sub-chunk units.
pub type SubChunkSelector = Vec<(u64, u64)>;

/// Aggregate statistics snapshot carried on sub-writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgStats {
    pub objects: u64,
    pub bytes: u64,
}

/// Minimal log entry shipped with a sub-write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub version: Version,
    pub oid: ObjectId,
}

/// Read request for one shard, possibly covering several objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubOpRead {
    pub pgid: SpgId,
    pub map_epoch: u64,
    pub min_epoch: u64,
    pub from: PgShard,
    pub tid: u64,
    pub priority: u8,
    /// Byte extents wanted per object, in shard-local offsets.
    pub to_read: BTreeMap<ObjectId, Vec<ReadExtent>>,
    /// Sub-chunk selectors per object.
    pub subchunks: BTreeMap<ObjectId, SubChunkSelector>,
    /// Objects whose attributes should be returned. At most one shard
    /// per object carries the attr request.
    pub attrs_to_read: BTreeSet<ObjectId>,
}

/// Reply to a [`SubOpRead`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubOpReadReply {
    pub from: PgShard,
    pub tid: u64,
    /// Buffers returned per object: `(shard offset, bytes)`.
    pub buffers_read: BTreeMap<ObjectId, Vec<(u64, Vec<u8>)>>,
    /// Attributes for objects listed in `attrs_to_read`.
    pub attrs_read: BTreeMap<ObjectId, BTreeMap<String, Vec<u8>>>,
    /// Per-object errors; an object appears here or in `buffers_read`,
    /// never both.
    pub errors: BTreeMap<ObjectId, EcError>,
}

/// Write request for one shard: the shard's slice of an RMW commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubOpWrite {
    pub pgid: SpgId,
    pub map_epoch: u64,
    pub min_epoch: u64,
    pub from: PgShard,
    pub tid: u64,
    pub reqid: ReqId,
    pub hoid: ObjectId,
    pub stats: PgStats,
    pub transaction: ShardTransaction,
    pub version: Version,
    pub trim_to: Version,
    pub pg_committed_to: Version,
    pub log_entries: Vec<LogEntry>,
    pub temp_added: BTreeSet<ObjectId>,
    pub temp_cleared: BTreeSet<ObjectId>,
    /// True when the receiver should only record the log entries, not
    /// apply the transaction (backfill targets past their horizon).
    pub backfill_or_removal: bool,
}

/// Reply to a [`SubOpWrite`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubOpWriteReply {
    pub from: PgShard,
    pub tid: u64,
    pub version: Version,
    pub committed: bool,
    pub applied: bool,
}

/// Envelope for every sub-op frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SubOpMessage {
    Read(SubOpRead),
    ReadReply(SubOpReadReply),
    Write(SubOpWrite),
    WriteReply(SubOpWriteReply),
}

impl SubOpMessage {
    /// Serialize into a length-prefixed frame ready for the wire.
    pub fn encode_frame(&self) -> Result<Vec<u8>, EcError> {
        let body = bincode::serialize(self).map_err(|_| EcError::InvalidParams)?;
        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Decode a frame produced by [`encode_frame`](Self::encode_frame).
    pub fn decode_frame(frame: &[u8]) -> Result<Self, EcError> {
        if frame.len() < 4 {
            return Err(EcError::InvalidParams);
        }
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        if len > MAX_FRAME_LEN || frame.len() < 4 + len {
            return Err(EcError::InvalidParams);
        }
        bincode::deserialize(&frame[4..4 + len]).map_err(|_| EcError::InvalidParams)
    }

    /// Tid of the enclosed message, for routing replies to read ops.
    pub fn tid(&self) -> u64 {
        match self {
            SubOpMessage::Read(m) => m.tid,
            SubOpMessage::ReadReply(m) => m.tid,
            SubOpMessage::Write(m) => m.tid,
            SubOpMessage::WriteReply(m) => m.tid,
        }
    }
}
