//! Per-shard extent maps with an object-space bounding box.
//!
//! A `ShardExtentMap` holds, for each shard, the buffers currently
//! known for that shard's slice of one object, and tracks the range of
//! RO space those buffers span. It is the common currency between the
//! pipelines: sub-read replies land in one, the cache stores one per
//! object, and encode/decode operate on one in place.
//!
//! Two invariants hold after every mutator: no shard key maps to an
//! empty extent map, and `[ro_start, ro_end)` is either the exact
//! bounding box of the data-shard extents or both ends are the invalid
//! sentinel.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use ecstore_proto::{EcError, EcResult, ShardId};

use crate::codec::ErasureCode;
use crate::extent::{ExtentMap, ExtentSet};
use crate::hash_info::HashInfo;
use crate::stripe::StripeInfo;

const INVALID_OFFSET: u64 = u64::MAX;

#[derive(Clone)]
pub struct ShardExtentMap {
    sinfo: Arc<StripeInfo>,
    ro_start: u64,
    ro_end: u64,
    extent_maps: BTreeMap<ShardId, ExtentMap>,
}

impl ShardExtentMap {
    pub fn new(sinfo: Arc<StripeInfo>) -> Self {
        Self {
            sinfo,
            ro_start: INVALID_OFFSET,
            ro_end: INVALID_OFFSET,
            extent_maps: BTreeMap::new(),
        }
    }

    /// Build from existing per-shard maps. Empty shards are dropped.
    pub fn from_maps(sinfo: Arc<StripeInfo>, maps: BTreeMap<ShardId, ExtentMap>) -> Self {
        let mut sem = Self::new(sinfo);
        sem.extent_maps = maps;
        sem.extent_maps.retain(|_, emap| !emap.is_empty());
        sem.compute_ro_range();
        sem
    }

    pub fn stripe_info(&self) -> &Arc<StripeInfo> {
        &self.sinfo
    }

    pub fn is_empty(&self) -> bool {
        self.ro_end == INVALID_OFFSET && self.extent_maps.is_empty()
    }

    /// RO-space bounding box, `None` when no data-shard extents exist.
    pub fn ro_range(&self) -> Option<(u64, u64)> {
        if self.ro_end == INVALID_OFFSET {
            None
        } else {
            Some((self.ro_start, self.ro_end))
        }
    }

    pub fn extent_maps(&self) -> &BTreeMap<ShardId, ExtentMap> {
        &self.extent_maps
    }

    pub fn contains_shard(&self, shard: ShardId) -> bool {
        self.extent_maps.contains_key(&shard)
    }

    /// Total buffer bytes held across all shards.
    pub fn size(&self) -> u64 {
        self.extent_maps.values().map(|e| e.size()).sum()
    }

    /// The present extents per shard, without the bytes.
    pub fn extent_set_map(&self) -> BTreeMap<ShardId, ExtentSet> {
        self.extent_maps
            .iter()
            .map(|(&shard, emap)| (shard, emap.interval_set()))
            .collect()
    }

    /// Union of every shard's extents, in shard space.
    pub fn extent_superset(&self) -> ExtentSet {
        let mut eset = ExtentSet::new();
        for emap in self.extent_maps.values() {
            eset.union_with(&emap.interval_set());
        }
        eset
    }

    /// True iff every extent of `other` is present here.
    pub fn contains(&self, other: &BTreeMap<ShardId, ExtentSet>) -> bool {
        other.iter().all(|(shard, eset)| {
            self.extent_maps
                .get(shard)
                .is_some_and(|emap| emap.interval_set().contains_set(eset))
        })
    }

    /// Recompute `[ro_start, ro_end)` from the data shards.
    ///
    /// Walking every extent is not cheap; mutators that know the new
    /// bounds pass hints to `insert_in_shard_hinted` instead.
    fn compute_ro_range(&mut self) {
        let mut start = INVALID_OFFSET;
        let mut end = 0;
        for raw in 0..self.sinfo.k() {
            let shard = self.sinfo.shard(raw);
            if let Some(emap) = self.extent_maps.get(&shard) {
                let eset = emap.interval_set();
                let s = self.sinfo.calc_ro_offset(raw, eset.range_start());
                let e = self.sinfo.calc_ro_offset(raw, eset.range_end() - 1) + 1;
                start = start.min(s);
                end = end.max(e);
            }
        }
        if end != 0 {
            self.ro_start = start;
            self.ro_end = end;
        } else {
            self.ro_start = INVALID_OFFSET;
            self.ro_end = INVALID_OFFSET;
        }
    }

    fn grow_ro_range(&mut self, new_start: u64, new_end: u64) {
        if self.ro_end == INVALID_OFFSET {
            self.ro_start = new_start;
            self.ro_end = new_end;
        } else {
            self.ro_start = self.ro_start.min(new_start);
            self.ro_end = self.ro_end.max(new_end);
        }
    }

    /// Insert a buffer into one shard, recomputing the RO bounds from
    /// the shard offset. Zero-length buffers are ignored.
    pub fn insert_in_shard(&mut self, shard: ShardId, off: u64, buf: Vec<u8>) {
        if buf.is_empty() {
            return;
        }
        let raw = self.sinfo.raw_shard(shard);
        let new_start = self.sinfo.calc_ro_offset(raw, off);
        let new_end = self
            .sinfo
            .calc_ro_offset(raw, off + buf.len() as u64 - 1)
            + 1;
        self.insert_in_shard_hinted(shard, off, buf, new_start, new_end);
    }

    /// Insert with caller-supplied RO bounds, skipping the conversion.
    pub fn insert_in_shard_hinted(
        &mut self,
        shard: ShardId,
        off: u64,
        buf: Vec<u8>,
        new_start: u64,
        new_end: u64,
    ) {
        if buf.is_empty() {
            return;
        }
        self.extent_maps.entry(shard).or_default().insert(off, buf);
        if self.sinfo.is_data_shard(shard) {
            self.grow_ro_range(new_start, new_end);
        }
    }

    /// Union another map into this one; `other`'s bytes win on overlap.
    pub fn insert(&mut self, other: &ShardExtentMap) {
        for (&shard, emap) in &other.extent_maps {
            self.extent_maps
                .entry(shard)
                .or_default()
                .union_with(emap);
        }
        if let Some((s, e)) = other.ro_range() {
            self.grow_ro_range(s, e);
        }
    }

    /// Carve a contiguous RO buffer across the shards.
    pub fn insert_ro_buffer(&mut self, ro_offset: u64, buf: &[u8]) {
        let ro_end = ro_offset + buf.len() as u64;
        for (shard, (off, slice)) in self.sinfo.clone().ro_range_to_shard_slices(ro_offset, buf) {
            self.insert_in_shard_hinted(shard, off, slice, ro_offset, ro_end);
        }
    }

    /// Insert a run of zeros in RO space.
    pub fn insert_ro_zero_buffer(&mut self, ro_offset: u64, ro_length: u64) {
        self.insert_ro_buffer(ro_offset, &vec![0u8; ro_length as usize]);
    }

    /// Extend the map with zeros so every byte up to (not including)
    /// `ro_offset` is populated.
    pub fn append_zeros_to_ro_offset(&mut self, ro_offset: u64) {
        let cur_end = if self.ro_end == INVALID_OFFSET {
            0
        } else {
            self.ro_end
        };
        if ro_offset <= cur_end {
            return;
        }
        self.insert_ro_zero_buffer(cur_end, ro_offset - cur_end);
    }

    /// Rearrange an RO-space extent map into shard space. A pure
    /// transformation: no parity is generated.
    pub fn insert_ro_extent_map(&mut self, host: &ExtentMap) {
        for (off, buf) in host.iter() {
            self.insert_ro_buffer(off, buf);
        }
    }

    /// A new map holding only the requested extents. Shards absent from
    /// `other` are dropped; extents not present here are simply not in
    /// the result.
    pub fn intersect(&self, other: &BTreeMap<ShardId, ExtentSet>) -> ShardExtentMap {
        let mut out = ShardExtentMap::new(self.sinfo.clone());
        for (shard, eset) in other {
            if let Some(emap) = self.extent_maps.get(shard) {
                let hit = emap.intersect(eset);
                if !hit.is_empty() {
                    out.extent_maps.insert(*shard, hit);
                }
            }
        }
        out.compute_ro_range();
        out
    }

    /// Intersect with an RO range, fast-pathing total overlap and total
    /// disjointness.
    pub fn intersect_ro_range(&self, ro_offset: u64, ro_length: u64) -> ShardExtentMap {
        match self.ro_range() {
            None => return ShardExtentMap::new(self.sinfo.clone()),
            Some((start, end)) => {
                if ro_offset <= start && ro_offset + ro_length >= end {
                    return self.clone();
                }
                if ro_offset >= end || ro_offset + ro_length <= start {
                    return ShardExtentMap::new(self.sinfo.clone());
                }
            }
        }
        let want = self
            .sinfo
            .ro_range_to_shard_extent_set(ro_offset, ro_length);
        self.intersect(&want)
    }

    /// Drop everything at or after `ro_offset`.
    pub fn erase_after_ro_offset(&mut self, ro_offset: u64) {
        let Some((_, end)) = self.ro_range() else {
            return;
        };
        if ro_offset >= end {
            return;
        }
        let to_erase = self
            .sinfo
            .ro_range_to_shard_extent_set(ro_offset, end - ro_offset);
        for (shard, eset) in to_erase {
            if let Some(emap) = self.extent_maps.get_mut(&shard) {
                let cut = eset.range_start();
                let shard_end = emap.interval_set().range_end();
                if shard_end > cut {
                    emap.erase(cut, shard_end - cut);
                }
                if emap.is_empty() {
                    self.extent_maps.remove(&shard);
                }
            }
        }
        self.compute_ro_range();
    }

    /// Erase a shard-space range from every shard.
    pub fn erase_stripe(&mut self, offset: u64, length: u64) {
        self.extent_maps.retain(|_, emap| {
            emap.erase(offset, length);
            !emap.is_empty()
        });
        self.compute_ro_range();
    }

    pub fn erase_shard(&mut self, shard: ShardId) {
        if self.extent_maps.remove(&shard).is_some() {
            self.compute_ro_range();
        }
    }

    /// Allocate zeroed buffers on every coding shard over the union of
    /// present extents, so the codec sees a rectangular region. Buffers
    /// already provided (e.g. by a previous encode) are preserved.
    pub fn insert_parity_buffers(&mut self) {
        let encode_set = self.extent_superset();
        for raw in self.sinfo.k()..self.sinfo.k_plus_m() {
            let shard = self.sinfo.shard(raw);
            for (offset, length) in encode_set.iter() {
                let emap = self.extent_maps.entry(shard).or_default();
                if !emap.contains(offset, length) {
                    emap.insert(offset, vec![0u8; length as usize]);
                }
            }
        }
    }

    /// Encode parity over every rectangular region of present data.
    ///
    /// Absent data shards are zero-filled (and kept, so the zeros can
    /// be written out and cached). When `hinfo` is given and this map
    /// starts exactly at the object's previous end, the freshly built
    /// buffers are appended into the rolling hashes.
    pub fn encode(
        &mut self,
        codec: &dyn ErasureCode,
        mut hinfo: Option<&mut HashInfo>,
        before_ro_size: u64,
    ) -> EcResult<()> {
        let encode_set = self.extent_superset();
        let coding: std::collections::BTreeSet<usize> =
            (self.sinfo.k()..self.sinfo.k_plus_m()).collect();

        for (offset, length) in encode_set.iter() {
            let mut by_shard = self.slice(offset, length);

            for raw in 0..self.sinfo.k() {
                let shard = self.sinfo.shard(raw);
                if !by_shard.contains_key(&shard) {
                    let zeros = vec![0u8; length as usize];
                    // Keep the zeros: they are real bytes of the stripe.
                    self.insert_in_shard(shard, offset, zeros.clone());
                    by_shard.insert(shard, zeros);
                }
            }

            let mut raw_chunks: BTreeMap<usize, Vec<u8>> = (0..self.sinfo.k())
                .map(|raw| (raw, by_shard[&self.sinfo.shard(raw)].clone()))
                .collect();
            codec
                .encode_chunks(&coding, &mut raw_chunks)
                .map_err(|_| EcError::EncodeFailed)?;

            for &raw in &coding {
                let shard = self.sinfo.shard(raw);
                let parity = raw_chunks.remove(&raw).ok_or(EcError::EncodeFailed)?;
                by_shard.insert(shard, parity.clone());
                self.extent_maps.entry(shard).or_default().insert(offset, parity);
            }

            if let Some(h) = hinfo.as_deref_mut() {
                if self.ro_start >= before_ro_size {
                    assert_eq!(
                        self.ro_start, before_ro_size,
                        "append must start at the previous object end"
                    );
                    h.append(offset, &by_shard);
                }
            }
        }
        Ok(())
    }

    /// Reconstruct the extents of `want` that are not already present,
    /// one missing shard at a time, and insert the results. Present
    /// shards must cover each wanted region.
    pub fn decode(
        &mut self,
        codec: &dyn ErasureCode,
        want: &BTreeMap<ShardId, ExtentSet>,
    ) -> EcResult<()> {
        let mut decoded_any = false;
        for (&shard, eset) in want {
            // A shard with reads is assumed complete; the reply handler
            // erases buffers for shards whose reads failed.
            if self.contains_shard(shard) {
                continue;
            }
            decoded_any = true;

            for (offset, length) in eset.iter() {
                // Sources are shards that genuinely hold the whole
                // region; zero-padding here would decode garbage.
                let mut raw_chunks: BTreeMap<usize, Vec<u8>> = BTreeMap::new();
                for (&s, emap) in &self.extent_maps {
                    if s == shard {
                        continue;
                    }
                    if let Some(buf) = emap.read(offset, length) {
                        raw_chunks.insert(self.sinfo.raw_shard(s), buf);
                    }
                }
                let raw = self.sinfo.raw_shard(shard);
                let want_raw: std::collections::BTreeSet<usize> = [raw].into_iter().collect();

                let mut out = codec
                    .decode(&want_raw, &raw_chunks, self.sinfo.chunk_size())
                    .map_err(|_| EcError::DecodeFailed)?;
                let buf = out.remove(&raw).ok_or(EcError::DecodeFailed)?;
                if buf.len() as u64 != length {
                    return Err(EcError::DecodeFailed);
                }
                self.extent_maps.entry(shard).or_default().insert(offset, buf);
            }
        }
        if decoded_any {
            self.compute_ro_range();
        }
        Ok(())
    }

    /// Bytes of one shard over `[offset, offset+length)`. With
    /// `zero_pad`, absent ranges read as zeros; without it they are an
    /// error.
    pub fn get_buffer(
        &self,
        shard: ShardId,
        offset: u64,
        length: u64,
        zero_pad: bool,
    ) -> EcResult<Vec<u8>> {
        let emap = match self.extent_maps.get(&shard) {
            Some(emap) => emap,
            None if zero_pad => return Ok(vec![0u8; length as usize]),
            None => return Err(EcError::OutOfRange),
        };
        if let Some(buf) = emap.read(offset, length) {
            return Ok(buf);
        }
        if !zero_pad {
            return Err(EcError::OutOfRange);
        }
        let mut out = vec![0u8; length as usize];
        let want: ExtentSet = [(offset, length)].into_iter().collect();
        for (o, b) in emap.intersect(&want).iter() {
            let at = (o - offset) as usize;
            out[at..at + b.len()].copy_from_slice(b);
        }
        Ok(out)
    }

    /// Dense `shard -> buffer` view of a rectangular shard-space
    /// region, zero-padding within present shards. Shards with no
    /// extents at all are not materialized.
    pub fn slice(&self, offset: u64, length: u64) -> BTreeMap<ShardId, Vec<u8>> {
        self.extent_maps
            .keys()
            .map(|&shard| {
                let buf = self
                    .get_buffer(shard, offset, length, true)
                    .unwrap_or_else(|_| vec![0u8; length as usize]);
                (shard, buf)
            })
            .collect()
    }

    /// Reassemble a contiguous RO byte range by walking the data shards
    /// chunk by chunk. Every required extent must be present; there is
    /// no implicit zero-fill here.
    pub fn get_ro_buffer(&self, ro_offset: u64, ro_length: u64) -> EcResult<Vec<u8>> {
        let chunk_size = self.sinfo.chunk_size();
        let stripe_width = self.sinfo.stripe_width();
        let k = self.sinfo.k() as u64;

        let (ca_off, ca_len) = self.sinfo.offset_len_to_chunk_bounds(ro_offset, ro_length);
        let mut raw_shard = (ro_offset / chunk_size) % k;
        let mut out = Vec::with_capacity(ro_length as usize);

        let mut chunk_offset = ca_off;
        while chunk_offset < ca_off + ca_len {
            if raw_shard == k {
                raw_shard = 0;
            }
            let piece_start = chunk_offset.max(ro_offset);
            let shard_offset =
                (chunk_offset / stripe_width) * chunk_size + piece_start - chunk_offset;
            let piece_len =
                (ro_offset + ro_length).min(chunk_offset + chunk_size) - piece_start;

            let buf = self.get_buffer(
                self.sinfo.shard(raw_shard as usize),
                shard_offset,
                piece_len,
                false,
            )?;
            out.extend_from_slice(&buf);

            chunk_offset += chunk_size;
            raw_shard += 1;
        }
        Ok(out)
    }
}

impl fmt::Debug for ShardExtentMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sem({{")?;
        match self.ro_range() {
            Some((s, e)) => write!(f, "{}~{}", s, e - s)?,
            None => write!(f, "empty")?,
        }
        write!(f, "}}, maps={{")?;
        for (i, (shard, emap)) in self.extent_maps.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {:?}", shard, emap)?;
        }
        write!(f, "}})")
    }
}
