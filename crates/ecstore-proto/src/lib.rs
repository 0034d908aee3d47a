//! # ecstore-proto
//!
//! Protocol types, constants, and wire messages for the ecstore
//! erasure-coded object storage backend.
//!
//! This crate defines the sub-op wire protocol spoken between shards,
//! object and shard identifiers, error codes, and the opaque per-shard
//! transaction container handed to the object-store executor.

pub mod constants;
pub mod error;
pub mod message;
pub mod oid;
pub mod shard;
pub mod transaction;

// Re-export commonly used types at the crate root
pub use error::{EcError, EcResult};
pub use message::{SubOpMessage, SubOpRead, SubOpReadReply, SubOpWrite, SubOpWriteReply};
pub use oid::ObjectId;
pub use shard::{PgShard, ReqId, ShardId, SpgId, Version};
pub use transaction::{ShardTransaction, TransactionOp};
