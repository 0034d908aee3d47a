//! Backend tunables.
//!
//! Loading these from files or flags is the embedder's problem; the
//! pipelines only ever see this struct.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EcConfig {
    /// Plan sub-chunk-minimal reads instead of reading every data
    /// shard's full chunk-aligned footprint.
    pub partial_reads: bool,
    /// Let retries trust shards that were already read once. Off by
    /// default: the retry path re-plans from scratch, which may re-read
    /// a shard.
    pub partial_reads_experimental: bool,
    /// Route overwrite reads through the extent cache.
    pub cache_enabled: bool,
    /// Soft cap on cached bytes. Pinned lines can push usage above it.
    pub cache_max_size: u64,
    /// Issue redundant reads for client I/O by default ("fast reads").
    pub redundant_reads: bool,
}

impl Default for EcConfig {
    fn default() -> Self {
        Self {
            partial_reads: true,
            partial_reads_experimental: false,
            cache_enabled: true,
            cache_max_size: 64 << 20,
            redundant_reads: false,
        }
    }
}
