//! # ecstore-core
//!
//! The pure algorithmic core of the ecstore erasure-coded backend:
//! interval containers, the striping algebra mapping object byte
//! ranges onto shards, the shard extent map, per-object rolling shard
//! hashes, and the erasure-code seam.
//!
//! Nothing in this crate does I/O or holds pipeline state; everything
//! is deterministic and directly testable.

pub mod codec;
pub mod extent;
pub mod hash_info;
pub mod shard_map;
pub mod stripe;

pub use codec::{ErasureCode, ReedSolomonCodec};
pub use extent::{ExtentMap, ExtentSet};
pub use hash_info::{HashInfo, HashInfoRegistry};
pub use shard_map::ShardExtentMap;
pub use stripe::StripeInfo;
