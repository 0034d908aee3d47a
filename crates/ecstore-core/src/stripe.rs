//! Striping algebra: mapping object byte ranges onto shards.
//!
//! An object's bytes ("RO space") are laid out across `k` data shards
//! in `chunk_size` pieces: stripe 0 is chunk 0 of every data shard in
//! raw-shard order, stripe 1 is chunk 1, and so on. `m` coding shards
//! hold parity over each stripe. A `chunk_mapping` permutation
//! translates the codec's raw-shard indices to the physical shard ids
//! objects are actually placed on.
//!
//! Everything here is integer math. `chunk_size` is required to be a
//! power of two so chunk and page alignment reduce to masking; only
//! division by `stripe_width` is a general division.

use std::collections::BTreeMap;

use ecstore_proto::constants::PAGE_SIZE;
use ecstore_proto::{EcError, EcResult, ShardId};

use crate::codec::ErasureCode;
use crate::extent::ExtentSet;

/// Round `val` up to the next page boundary.
#[inline]
pub fn align_page_next(val: u64) -> u64 {
    (val + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Round `val` down to the previous page boundary.
#[inline]
pub fn align_page_prev(val: u64) -> u64 {
    val & !(PAGE_SIZE - 1)
}

/// Immutable per-pool stripe layout.
#[derive(Debug, Clone)]
pub struct StripeInfo {
    k: usize,
    m: usize,
    chunk_size: u64,
    stripe_width: u64,
    plugin_flags: u64,
    /// raw-shard index -> physical shard id
    chunk_mapping: Vec<ShardId>,
    /// physical shard id -> raw-shard index
    chunk_mapping_reverse: BTreeMap<ShardId, usize>,
}

impl StripeInfo {
    /// Build the layout from a codec and the pool's stripe width.
    pub fn new(codec: &dyn ErasureCode, stripe_width: u64) -> EcResult<Self> {
        Self::from_layout(
            codec.data_chunk_count(),
            codec.coding_chunk_count(),
            stripe_width,
            codec.chunk_mapping(),
            codec.supported_optimizations(),
        )
    }

    /// Build the layout from explicit parameters. `chunk_mapping` may be
    /// shorter than `k + m`; missing entries default to the identity.
    pub fn from_layout(
        k: usize,
        m: usize,
        stripe_width: u64,
        chunk_mapping: Vec<usize>,
        plugin_flags: u64,
    ) -> EcResult<Self> {
        if k == 0 || stripe_width == 0 || stripe_width % k as u64 != 0 {
            return Err(EcError::InvalidParams);
        }
        let chunk_size = stripe_width / k as u64;
        if !chunk_size.is_power_of_two() {
            return Err(EcError::InvalidParams);
        }

        let n = k + m;
        let mut mapping = Vec::with_capacity(n);
        for raw in 0..n {
            let shard = *chunk_mapping.get(raw).unwrap_or(&raw);
            if shard >= n {
                return Err(EcError::InvalidParams);
            }
            mapping.push(ShardId::new(shard as u8));
        }
        let mut reverse = BTreeMap::new();
        for (raw, &shard) in mapping.iter().enumerate() {
            if reverse.insert(shard, raw).is_some() {
                // Not a permutation.
                return Err(EcError::InvalidParams);
            }
        }

        Ok(Self {
            k,
            m,
            chunk_size,
            stripe_width,
            plugin_flags,
            chunk_mapping: mapping,
            chunk_mapping_reverse: reverse,
        })
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn m(&self) -> usize {
        self.m
    }

    pub fn k_plus_m(&self) -> usize {
        self.k + self.m
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn stripe_width(&self) -> u64 {
        self.stripe_width
    }

    pub fn supports_partial_reads(&self) -> bool {
        self.plugin_flags & crate::codec::FLAG_PARTIAL_READ != 0
    }

    pub fn supports_partial_writes(&self) -> bool {
        self.plugin_flags & crate::codec::FLAG_PARTIAL_WRITE != 0
    }

    /// Physical shard id for a raw-shard index.
    pub fn shard(&self, raw_shard: usize) -> ShardId {
        self.chunk_mapping[raw_shard]
    }

    /// Raw-shard index for a physical shard id.
    pub fn raw_shard(&self, shard: ShardId) -> usize {
        self.chunk_mapping_reverse[&shard]
    }

    /// True if `shard` holds data (its raw index is below `k`).
    pub fn is_data_shard(&self, shard: ShardId) -> bool {
        self.raw_shard(shard) < self.k
    }

    /// The physical shard ids of all data shards, in raw order.
    pub fn data_shards(&self) -> impl Iterator<Item = ShardId> + '_ {
        (0..self.k).map(|raw| self.shard(raw))
    }

    /// The physical shard ids of all coding shards, in raw order.
    pub fn coding_shards(&self) -> impl Iterator<Item = ShardId> + '_ {
        (self.k..self.k + self.m).map(|raw| self.shard(raw))
    }

    /// Translate a set of physical shard ids to raw-shard indices.
    pub fn shards_to_raw(&self, shards: impl IntoIterator<Item = ShardId>) -> Vec<usize> {
        shards.into_iter().map(|s| self.raw_shard(s)).collect()
    }

    /// RO offset for a byte at `shard_offset` within `raw_shard`.
    pub fn calc_ro_offset(&self, raw_shard: usize, shard_offset: u64) -> u64 {
        (shard_offset / self.chunk_size) * self.stripe_width
            + raw_shard as u64 * self.chunk_size
            + (shard_offset & (self.chunk_size - 1))
    }

    /// Shard offset at which `ro_offset` lands on `raw_shard`. When the
    /// offset maps to a different shard, this is where the shard's own
    /// portion of the addressed stripe starts or ends.
    pub fn ro_offset_to_shard_offset(&self, ro_offset: u64, raw_shard: usize) -> u64 {
        let full_stripes = (ro_offset / self.stripe_width) * self.chunk_size;
        let offset_shard = ((ro_offset / self.chunk_size) % self.k as u64) as usize;
        if raw_shard == offset_shard {
            full_stripes + (ro_offset & (self.chunk_size - 1))
        } else if raw_shard < offset_shard {
            full_stripes + self.chunk_size
        } else {
            full_stripes
        }
    }

    /// Chunk offset of the stripe containing `offset` (rounds down).
    pub fn logical_to_prev_chunk_offset(&self, offset: u64) -> u64 {
        (offset / self.stripe_width) * self.chunk_size
    }

    /// Chunk offset of the next stripe boundary at or after `offset`.
    pub fn logical_to_next_chunk_offset(&self, offset: u64) -> u64 {
        ((offset + self.stripe_width - 1) / self.stripe_width) * self.chunk_size
    }

    pub fn logical_to_prev_stripe_offset(&self, offset: u64) -> u64 {
        offset - offset % self.stripe_width
    }

    pub fn logical_to_next_stripe_offset(&self, offset: u64) -> u64 {
        if offset % self.stripe_width == 0 {
            offset
        } else {
            offset - offset % self.stripe_width + self.stripe_width
        }
    }

    /// Widen `(off, len)` to whole-stripe bounds in RO space.
    pub fn offset_len_to_stripe_bounds(&self, off: u64, len: u64) -> (u64, u64) {
        let start = self.logical_to_prev_stripe_offset(off);
        let end_len = self.logical_to_next_stripe_offset((off - start) + len);
        (start, end_len)
    }

    /// Widen `(off, len)` to chunk bounds.
    pub fn offset_len_to_chunk_bounds(&self, off: u64, len: u64) -> (u64, u64) {
        let start = off & !(self.chunk_size - 1);
        let tmp = (off - start) + len;
        let end = (tmp + self.chunk_size - 1) & !(self.chunk_size - 1);
        (start, end)
    }

    /// Widen `(off, len)` to page bounds.
    pub fn offset_len_to_page_bounds(&self, off: u64, len: u64) -> (u64, u64) {
        let start = align_page_prev(off);
        let tmp = (off - start) + len;
        (start, align_page_next(tmp))
    }

    /// Stripe-align an RO range, then convert it to the per-shard chunk
    /// range it occupies: the full chunk-aligned footprint of the range
    /// on every data shard.
    pub fn chunk_aligned_offset_len_to_chunk(&self, off: u64, len: u64) -> (u64, u64) {
        let (s_off, s_len) = self.offset_len_to_stripe_bounds(off, len);
        (
            (s_off / self.stripe_width) * self.chunk_size,
            ((s_len + self.stripe_width - 1) / self.stripe_width) * self.chunk_size,
        )
    }

    /// Chunk offset for a stripe-aligned RO offset.
    pub fn aligned_logical_offset_to_chunk_offset(&self, offset: u64) -> u64 {
        debug_assert_eq!(offset % self.stripe_width, 0);
        (offset / self.stripe_width) * self.chunk_size
    }

    /// RO offset for a chunk-aligned shard offset.
    pub fn aligned_chunk_offset_to_logical_offset(&self, offset: u64) -> u64 {
        debug_assert_eq!(offset & (self.chunk_size - 1), 0);
        (offset / self.chunk_size) * self.stripe_width
    }

    /// The minimal per-raw-shard extents touched by an RO range.
    ///
    /// Walks the raw shards covered by `(ro_offset, ro_size)` and emits
    /// one `(raw_shard, shard_offset, len)` triple per shard. Shards
    /// before the range's first chunk start one chunk later; shards
    /// after the last chunk end one chunk earlier; the first and last
    /// shards carry the intra-chunk remainders.
    fn ro_range_to_raw_extents(&self, ro_offset: u64, ro_size: u64) -> Vec<(usize, u64, u64)> {
        if ro_size == 0 {
            return Vec::new();
        }
        let k = self.k as u64;
        let chunk_size = self.chunk_size;

        let begin_div = ro_offset / self.stripe_width;
        let end_div = (ro_offset + ro_size + self.stripe_width - 1) / self.stripe_width - 1;
        let start = begin_div * chunk_size;
        let end = end_div * chunk_size;

        let start_shard = (ro_offset - begin_div * self.stripe_width) / chunk_size;
        let chunk_count =
            (ro_offset + ro_size + chunk_size - 1) / chunk_size - ro_offset / chunk_size;
        let end_shard = start_shard + chunk_count.min(k);
        let last_shard = (start_shard + chunk_count - 1) % k;

        let mut out = Vec::with_capacity((end_shard - start_shard) as usize);
        for i in start_shard..end_shard {
            let raw_shard = if i >= k { i - k } else { i };

            let start_adj = if raw_shard < start_shard {
                // Shards before the start begin on the next chunk.
                chunk_size
            } else if raw_shard == start_shard {
                ro_offset & (chunk_size - 1)
            } else {
                0
            };

            let end_adj = if raw_shard < last_shard {
                // Shards before the last extend one chunk further.
                chunk_size
            } else if raw_shard == last_shard {
                ((ro_offset + ro_size - 1) & (chunk_size - 1)) + 1
            } else {
                0
            };

            out.push((
                raw_shard as usize,
                start + start_adj,
                end + end_adj - start - start_adj,
            ));
        }
        out
    }

    /// Per-physical-shard extent sets for an RO range.
    pub fn ro_range_to_shard_extent_set(
        &self,
        ro_offset: u64,
        ro_size: u64,
    ) -> BTreeMap<ShardId, ExtentSet> {
        let mut out: BTreeMap<ShardId, ExtentSet> = BTreeMap::new();
        for (raw, off, len) in self.ro_range_to_raw_extents(ro_offset, ro_size) {
            out.entry(self.shard(raw)).or_default().insert(off, len);
        }
        out
    }

    /// As [`ro_range_to_shard_extent_set`](Self::ro_range_to_shard_extent_set),
    /// also accumulating the union of all shard extents into `superset`.
    pub fn ro_range_to_shard_extent_set_with_superset(
        &self,
        ro_offset: u64,
        ro_size: u64,
        superset: &mut ExtentSet,
    ) -> BTreeMap<ShardId, ExtentSet> {
        let mut out: BTreeMap<ShardId, ExtentSet> = BTreeMap::new();
        for (raw, off, len) in self.ro_range_to_raw_extents(ro_offset, ro_size) {
            out.entry(self.shard(raw)).or_default().insert(off, len);
            superset.insert(off, len);
        }
        out
    }

    /// Carve a contiguous RO buffer into per-shard slices.
    ///
    /// Each touched shard receives exactly one contiguous shard-space
    /// buffer; the RO bytes for chunk row `c` of raw shard `r` sit at
    /// stride `k * chunk_size` in the input. Returns
    /// `shard -> (shard_offset, bytes)`.
    pub fn ro_range_to_shard_slices(
        &self,
        ro_offset: u64,
        buf: &[u8],
    ) -> BTreeMap<ShardId, (u64, Vec<u8>)> {
        let ro_size = buf.len() as u64;
        let mut out = BTreeMap::new();
        for (raw, off, len) in self.ro_range_to_raw_extents(ro_offset, ro_size) {
            let mut shard_buf = Vec::with_capacity(len as usize);
            let mut pos = off;
            let end = off + len;
            while pos < end {
                // One chunk row (or the partial head/tail of one).
                let row_end = ((pos / self.chunk_size) + 1) * self.chunk_size;
                let piece = row_end.min(end) - pos;
                let ro = self.calc_ro_offset(raw, pos) - ro_offset;
                shard_buf.extend_from_slice(&buf[ro as usize..(ro + piece) as usize]);
                pos += piece;
            }
            out.insert(self.shard(raw), (off, shard_buf));
        }
        out
    }

    /// True when the whole range sits inside one stripe.
    pub fn offset_len_in_same_stripe(&self, off: u64, len: u64) -> bool {
        if len == 0 {
            return true;
        }
        off / self.stripe_width == (off + len - 1) / self.stripe_width
    }
}
