//! Per-object rolling shard hashes.
//!
//! Every append to an object rolls a CRC per shard over the bytes
//! written to that shard, so a later read of any whole shard can be
//! validated without touching the others. The hashes and the total
//! per-shard size are persisted as one object attribute under
//! [`HINFO_KEY`](ecstore_proto::constants::HINFO_KEY).
//!
//! Wire layout, little endian:
//!
//! ```text
//! +--------+---------------------+----------------------+
//! | ver(1) | total_chunk_size(8) | hash(4) * num_shards |
//! +--------+---------------------+----------------------+
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

use ecstore_proto::constants::HINFO_KEY;
use ecstore_proto::{EcError, EcResult, ObjectId, ShardId};
use tracing::{debug, warn};

const HINFO_VERSION: u8 = 1;
const HINFO_HEADER_LEN: usize = 9;

/// Initial CRC seed for a shard that has never been appended to.
const EMPTY_HASH: u32 = u32::MAX;

#[derive(Clone, PartialEq, Eq)]
pub struct HashInfo {
    total_chunk_size: u64,
    cumulative_shard_hashes: Vec<u32>,
}

impl HashInfo {
    /// A fresh hash info for `num_shards` shards.
    pub fn new(num_shards: usize) -> Self {
        Self {
            total_chunk_size: 0,
            cumulative_shard_hashes: vec![EMPTY_HASH; num_shards],
        }
    }

    pub fn total_chunk_size(&self) -> u64 {
        self.total_chunk_size
    }

    pub fn has_chunk_hash(&self) -> bool {
        !self.cumulative_shard_hashes.is_empty()
    }

    pub fn num_shards(&self) -> usize {
        self.cumulative_shard_hashes.len()
    }

    /// Cumulative hash for one shard.
    pub fn chunk_hash(&self, shard: ShardId) -> EcResult<u32> {
        self.cumulative_shard_hashes
            .get(shard.raw() as usize)
            .copied()
            .ok_or(EcError::OutOfRange)
    }

    /// Roll the shard hashes over freshly appended buffers.
    ///
    /// `old_size` must equal the current total and every buffer must
    /// have the same length; violations are protocol errors. The CRC
    /// covers exactly what is passed in: callers that include parity
    /// buffers get parity CRCs.
    pub fn append(&mut self, old_size: u64, to_append: &BTreeMap<ShardId, Vec<u8>>) {
        assert_eq!(
            old_size, self.total_chunk_size,
            "hash info append must continue from the current size"
        );
        let Some(size_to_append) = to_append.values().next().map(|b| b.len() as u64) else {
            return;
        };
        if self.has_chunk_hash() {
            assert_eq!(to_append.len(), self.cumulative_shard_hashes.len());
            for (shard, buf) in to_append {
                assert_eq!(buf.len() as u64, size_to_append);
                let idx = shard.raw() as usize;
                assert!(idx < self.cumulative_shard_hashes.len());
                let mut hasher =
                    crc32fast::Hasher::new_with_initial(self.cumulative_shard_hashes[idx]);
                hasher.update(buf);
                self.cumulative_shard_hashes[idx] = hasher.finalize();
            }
        }
        self.total_chunk_size += size_to_append;
    }

    /// Forget the hashes but keep tracking size at `new_size`. Used
    /// when an overwrite lands somewhere the rolling hashes cannot
    /// follow.
    pub fn set_total_chunk_size_clear_hash(&mut self, new_size: u64) {
        self.cumulative_shard_hashes.clear();
        self.total_chunk_size = new_size;
    }

    pub fn clear(&mut self) {
        self.total_chunk_size = 0;
        for h in &mut self.cumulative_shard_hashes {
            *h = EMPTY_HASH;
        }
    }

    /// Serialize into the attribute layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(HINFO_HEADER_LEN + 4 * self.cumulative_shard_hashes.len());
        out.push(HINFO_VERSION);
        out.extend_from_slice(&self.total_chunk_size.to_le_bytes());
        for h in &self.cumulative_shard_hashes {
            out.extend_from_slice(&h.to_le_bytes());
        }
        out
    }

    /// Parse the attribute layout.
    pub fn decode(buf: &[u8]) -> EcResult<Self> {
        if buf.len() < HINFO_HEADER_LEN || buf[0] != HINFO_VERSION {
            return Err(EcError::HashInfoCorrupt);
        }
        let rest = &buf[HINFO_HEADER_LEN..];
        if rest.len() % 4 != 0 {
            return Err(EcError::HashInfoCorrupt);
        }
        let total_chunk_size = u64::from_le_bytes(buf[1..9].try_into().unwrap());
        let cumulative_shard_hashes = rest
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        Ok(Self {
            total_chunk_size,
            cumulative_shard_hashes,
        })
    }
}

impl fmt::Debug for HashInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcs={}", self.total_chunk_size)?;
        for h in &self.cumulative_shard_hashes {
            write!(f, " {:x}", h)?;
        }
        Ok(())
    }
}

/// Shared handle to a hash info that in-flight writes mutate.
pub type HashInfoRef = Arc<Mutex<HashInfo>>;

/// Cache of per-object hash infos whose on-disk attribute may be ahead
/// of or behind the in-memory state while writes are in flight.
#[derive(Default)]
pub struct HashInfoRegistry {
    registry: HashMap<ObjectId, HashInfoRef>,
}

impl HashInfoRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the hash info for `oid`, decoding it from the object's
    /// attributes on a miss. A corrupt attribute or a size mismatch is
    /// treated as a missing hash info; `create` (or an empty object)
    /// synthesizes a fresh one.
    pub fn get_hash_info(
        &mut self,
        oid: ObjectId,
        num_shards: usize,
        mut create: bool,
        attrs: &BTreeMap<String, Vec<u8>>,
        size: u64,
    ) -> Option<HashInfoRef> {
        if let Some(hinfo) = self.registry.get(&oid) {
            return Some(hinfo.clone());
        }
        debug!(%oid, "hash info not cached, decoding attr");

        let mut hinfo = HashInfo::new(num_shards);
        match attrs.get(HINFO_KEY) {
            Some(bl) if !bl.is_empty() => match HashInfo::decode(bl) {
                Ok(decoded) => {
                    if decoded.total_chunk_size() != size {
                        warn!(
                            %oid,
                            expected = size,
                            actual = decoded.total_chunk_size(),
                            "hash info size mismatch"
                        );
                        return None;
                    }
                    hinfo = decoded;
                    create = true;
                }
                Err(_) => {
                    warn!(%oid, "cannot decode hash info attr");
                    return None;
                }
            },
            _ => {
                debug!(%oid, "missing hash info attr");
                if size == 0 {
                    // Empty object with no attr: invent one.
                    create = true;
                }
            }
        }

        if create {
            Some(self.put(oid, hinfo))
        } else {
            None
        }
    }

    /// Register `hinfo` for `oid` unless one is already cached.
    pub fn maybe_put_hash_info(&mut self, oid: ObjectId, hinfo: HashInfo) -> HashInfoRef {
        self.put(oid, hinfo)
    }

    fn put(&mut self, oid: ObjectId, hinfo: HashInfo) -> HashInfoRef {
        self.registry
            .entry(oid)
            .or_insert_with(|| Arc::new(Mutex::new(hinfo)))
            .clone()
    }

    pub fn forget(&mut self, oid: ObjectId) {
        self.registry.remove(&oid);
    }

    pub fn on_change(&mut self) {
        self.registry.clear();
    }
}
