//! Protocol-wide constants.

/// Sub-op protocol version carried in every message.
pub const EC_PROTO_VER: u8 = 1;

/// Host page size assumed when rounding shard reads. Sub-reads are
/// widened to page bounds so the backing store never does a partial
/// page read on our behalf.
pub const PAGE_SIZE: u64 = 4096;

/// Alignment the erasure-code plugins want their chunk buffers to have.
pub const SIMD_ALIGN: usize = 32;

/// Object attribute key under which the per-object hash info is stored.
pub const HINFO_KEY: &str = "hinfo_key";

/// Maximum sub-op frame size accepted by the decode helpers.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;
