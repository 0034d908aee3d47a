//! Erasure code seam.
//!
//! Wraps the `reed-solomon-erasure` crate behind the interface the
//! pipelines plan against: chunk counts, sub-chunk selectors, the
//! raw-to-physical chunk mapping, `minimum_to_decode`, and the
//! encode/decode entry points. Everything at this seam speaks
//! raw-shard indices; physical shard ids exist only above it.

use std::collections::{BTreeMap, BTreeSet};

use ecstore_proto::{EcError, EcResult};
use reed_solomon_erasure::galois_8::ReedSolomon;

/// Plugin can serve a read from a subset of each chunk.
pub const FLAG_PARTIAL_READ: u64 = 1 << 0;
/// Plugin can recompute parity from a partial stripe delta.
pub const FLAG_PARTIAL_WRITE: u64 = 1 << 1;

/// Sub-chunk selector: `(start, count)` pairs in sub-chunk units.
/// Codes without a helper plane always use the full range `[(0, 1)]`.
pub type SubChunkPlan = Vec<(u64, u64)>;

/// The erasure code interface consumed by the pipelines.
pub trait ErasureCode: Send + Sync {
    /// Number of data chunks `k`.
    fn data_chunk_count(&self) -> usize;

    /// Number of coding chunks `m`.
    fn coding_chunk_count(&self) -> usize;

    fn chunk_count(&self) -> usize {
        self.data_chunk_count() + self.coding_chunk_count()
    }

    /// Sub-chunks per chunk; 1 unless the code has a helper plane.
    fn sub_chunk_count(&self) -> u64 {
        1
    }

    /// Raw-shard index to physical shard id mapping. Empty means
    /// identity; entries past the end of the vector are identity.
    fn chunk_mapping(&self) -> Vec<usize> {
        Vec::new()
    }

    /// Optimization flags ([`FLAG_PARTIAL_READ`], [`FLAG_PARTIAL_WRITE`]).
    fn supported_optimizations(&self) -> u64 {
        0
    }

    /// Which shards (and which sub-chunks of them) must be read to
    /// produce `want`, given that `have` are available.
    fn minimum_to_decode(
        &self,
        want: &BTreeSet<usize>,
        have: &BTreeSet<usize>,
    ) -> EcResult<BTreeMap<usize, SubChunkPlan>>;

    /// Reconstruct the `want` chunks from the provided chunks. All
    /// provided buffers must have equal length. `chunk_size` is only
    /// meaningful to helper-plane codes.
    fn decode(
        &self,
        want: &BTreeSet<usize>,
        chunks: &BTreeMap<usize, Vec<u8>>,
        chunk_size: u64,
    ) -> EcResult<BTreeMap<usize, Vec<u8>>>;

    /// Decode and concatenate the `want` chunks in raw-shard order.
    fn decode_concat(
        &self,
        want: &BTreeSet<usize>,
        chunks: &BTreeMap<usize, Vec<u8>>,
    ) -> EcResult<Vec<u8>> {
        let missing: BTreeSet<usize> = want
            .iter()
            .copied()
            .filter(|w| !chunks.contains_key(w))
            .collect();
        let decoded = if missing.is_empty() {
            BTreeMap::new()
        } else {
            self.decode(&missing, chunks, 0)?
        };
        let mut out = Vec::new();
        for w in want {
            let buf = chunks
                .get(w)
                .or_else(|| decoded.get(w))
                .ok_or(EcError::DecodeFailed)?;
            out.extend_from_slice(buf);
        }
        Ok(out)
    }

    /// Compute the `coding` chunks over a full set of data chunks.
    /// `chunks` must hold every data chunk (zero-filled where the
    /// caller has no bytes), all of equal length; the computed parity
    /// buffers are inserted into `chunks`.
    fn encode_chunks(
        &self,
        coding: &BTreeSet<usize>,
        chunks: &mut BTreeMap<usize, Vec<u8>>,
    ) -> EcResult<()>;
}

/// GF(2^8) Reed–Solomon implementation, the default codec.
pub struct ReedSolomonCodec {
    rs: ReedSolomon,
    k: usize,
    m: usize,
    mapping: Vec<usize>,
}

impl ReedSolomonCodec {
    /// Create a codec with `k` data and `m` coding chunks.
    pub fn new(k: usize, m: usize) -> EcResult<Self> {
        let rs = ReedSolomon::new(k, m).map_err(|_| EcError::InvalidParams)?;
        Ok(Self {
            rs,
            k,
            m,
            mapping: Vec::new(),
        })
    }

    /// As [`new`](Self::new) with an explicit chunk mapping permutation.
    pub fn with_mapping(k: usize, m: usize, mapping: Vec<usize>) -> EcResult<Self> {
        let mut codec = Self::new(k, m)?;
        codec.mapping = mapping;
        Ok(codec)
    }

    fn equal_len(chunks: &BTreeMap<usize, Vec<u8>>) -> EcResult<usize> {
        let mut len = None;
        for buf in chunks.values() {
            match len {
                None => len = Some(buf.len()),
                Some(l) if l == buf.len() => {}
                Some(_) => return Err(EcError::InvalidParams),
            }
        }
        len.ok_or(EcError::InvalidParams)
    }
}

impl ErasureCode for ReedSolomonCodec {
    fn data_chunk_count(&self) -> usize {
        self.k
    }

    fn coding_chunk_count(&self) -> usize {
        self.m
    }

    fn chunk_mapping(&self) -> Vec<usize> {
        self.mapping.clone()
    }

    fn supported_optimizations(&self) -> u64 {
        FLAG_PARTIAL_READ
    }

    fn minimum_to_decode(
        &self,
        want: &BTreeSet<usize>,
        have: &BTreeSet<usize>,
    ) -> EcResult<BTreeMap<usize, SubChunkPlan>> {
        let full: SubChunkPlan = vec![(0, self.sub_chunk_count())];

        if want.iter().all(|w| have.contains(w)) {
            // Nothing to reconstruct; read exactly what is wanted.
            return Ok(want.iter().map(|&w| (w, full.clone())).collect());
        }
        if have.len() < self.k {
            return Err(EcError::InsufficientShards);
        }

        // Any k available chunks reconstruct the rest. Prefer chunks we
        // want anyway, then data chunks, then parity.
        let mut picked: BTreeSet<usize> = want.intersection(have).copied().collect();
        for &h in have {
            if picked.len() >= self.k {
                break;
            }
            if h < self.k {
                picked.insert(h);
            }
        }
        for &h in have {
            if picked.len() >= self.k {
                break;
            }
            picked.insert(h);
        }
        // `picked` may exceed k when want ∩ have was already large;
        // every picked chunk is genuinely read, so keep them all.
        Ok(picked.into_iter().map(|p| (p, full.clone())).collect())
    }

    fn decode(
        &self,
        want: &BTreeSet<usize>,
        chunks: &BTreeMap<usize, Vec<u8>>,
        _chunk_size: u64,
    ) -> EcResult<BTreeMap<usize, Vec<u8>>> {
        let len = Self::equal_len(chunks)?;
        let n = self.k + self.m;
        let mut shards: Vec<Option<Vec<u8>>> = (0..n)
            .map(|i| chunks.get(&i).cloned())
            .collect();
        // Guard against stray indices the codec does not know about.
        if chunks.keys().any(|&i| i >= n) {
            return Err(EcError::InvalidParams);
        }
        if len == 0 {
            return Ok(want.iter().map(|&w| (w, Vec::new())).collect());
        }

        self.rs
            .reconstruct(&mut shards)
            .map_err(|_| EcError::DecodeFailed)?;

        let mut out = BTreeMap::new();
        for &w in want {
            let buf = shards
                .get(w)
                .and_then(|s| s.clone())
                .ok_or(EcError::DecodeFailed)?;
            out.insert(w, buf);
        }
        Ok(out)
    }

    fn encode_chunks(
        &self,
        coding: &BTreeSet<usize>,
        chunks: &mut BTreeMap<usize, Vec<u8>>,
    ) -> EcResult<()> {
        let len = Self::equal_len(chunks)?;
        let mut shards: Vec<Vec<u8>> = Vec::with_capacity(self.k + self.m);
        for i in 0..self.k {
            match chunks.get(&i) {
                Some(buf) => shards.push(buf.clone()),
                // Encoding needs the full data rectangle.
                None => return Err(EcError::InvalidParams),
            }
        }
        for _ in 0..self.m {
            shards.push(vec![0u8; len]);
        }

        self.rs.encode(&mut shards).map_err(|_| EcError::EncodeFailed)?;

        for &c in coding {
            if c < self.k || c >= self.k + self.m {
                return Err(EcError::InvalidParams);
            }
            chunks.insert(c, shards[c].clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks_for(k: usize, len: usize) -> BTreeMap<usize, Vec<u8>> {
        (0..k).map(|i| (i, vec![(i + 1) as u8; len])).collect()
    }

    #[test]
    fn test_encode_then_reconstruct() {
        let codec = ReedSolomonCodec::new(4, 2).unwrap();
        let mut chunks = chunks_for(4, 1024);
        let coding: BTreeSet<usize> = [4, 5].into_iter().collect();
        codec.encode_chunks(&coding, &mut chunks).unwrap();
        assert_eq!(chunks.len(), 6);

        // Lose two chunks and reconstruct them.
        let lost0 = chunks.remove(&0).unwrap();
        let lost3 = chunks.remove(&3).unwrap();
        let want: BTreeSet<usize> = [0, 3].into_iter().collect();
        let decoded = codec.decode(&want, &chunks, 0).unwrap();
        assert_eq!(decoded[&0], lost0);
        assert_eq!(decoded[&3], lost3);
    }

    #[test]
    fn test_encode_requires_full_data_rectangle() {
        let codec = ReedSolomonCodec::new(2, 1).unwrap();
        let mut chunks = BTreeMap::new();
        chunks.insert(0, vec![1u8; 64]);
        let coding: BTreeSet<usize> = [2].into_iter().collect();
        assert_eq!(
            codec.encode_chunks(&coding, &mut chunks),
            Err(EcError::InvalidParams)
        );
    }

    #[test]
    fn test_minimum_to_decode_all_available() {
        let codec = ReedSolomonCodec::new(2, 1).unwrap();
        let want: BTreeSet<usize> = [0, 1].into_iter().collect();
        let have: BTreeSet<usize> = [0, 1, 2].into_iter().collect();
        let need = codec.minimum_to_decode(&want, &have).unwrap();
        assert_eq!(need.keys().copied().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(need[&0], vec![(0, 1)]);
    }

    #[test]
    fn test_minimum_to_decode_with_missing_shard() {
        let codec = ReedSolomonCodec::new(2, 1).unwrap();
        let want: BTreeSet<usize> = [0, 1].into_iter().collect();
        let have: BTreeSet<usize> = [1, 2].into_iter().collect();
        let need = codec.minimum_to_decode(&want, &have).unwrap();
        // Shard 0 is gone; the plan reads the survivor plus parity.
        assert_eq!(need.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_minimum_to_decode_insufficient() {
        let codec = ReedSolomonCodec::new(2, 1).unwrap();
        let want: BTreeSet<usize> = [0].into_iter().collect();
        let have: BTreeSet<usize> = [1].into_iter().collect();
        assert_eq!(
            codec.minimum_to_decode(&want, &have),
            Err(EcError::InsufficientShards)
        );
    }

    #[test]
    fn test_decode_concat_mixes_present_and_decoded() {
        let codec = ReedSolomonCodec::new(2, 1).unwrap();
        let mut chunks = chunks_for(2, 32);
        let coding: BTreeSet<usize> = [2].into_iter().collect();
        codec.encode_chunks(&coding, &mut chunks).unwrap();

        let chunk0 = chunks.remove(&0).unwrap();
        let want: BTreeSet<usize> = [0, 1].into_iter().collect();
        let out = codec.decode_concat(&want, &chunks).unwrap();
        assert_eq!(&out[..32], &chunk0[..]);
        assert_eq!(&out[32..], &[2u8; 32][..]);
    }
}
