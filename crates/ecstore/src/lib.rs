//! # ecstore
//!
//! The erasure-coded object storage backend: translates client reads
//! and writes over an object's byte space into per-shard sub-ops,
//! decodes results, and orders read-modify-write overwrites through an
//! extent-granular cache with pinning and LRU eviction.
//!
//! The crate is built around four pieces:
//!
//! - [`read::ReadPipeline`] plans, dispatches, gathers, and decodes
//!   sub-reads for clients, recovery, and the RMW pre-image path.
//! - [`rmw::RMWPipeline`] serializes overwrites through a three-queue
//!   state machine and produces per-shard transactions.
//! - [`cache::ExtentCache`] keeps overwrite pre-images hot, coalesces
//!   overlapping requests, and pins lines while ops are in flight.
//! - [`backend::EcBackend`] owns the above and drains the PG event
//!   queue on a single worker.
//!
//! Cluster membership, transport, and the object-store executor are
//! external; they appear here only as the [`parent::PgParent`] seam.

pub mod backend;
pub mod cache;
pub mod config;
pub mod parent;
pub mod read;
pub mod rmw;

pub use backend::{ClientWrite, EcBackend, PgEvent};
pub use cache::ExtentCache;
pub use config::EcConfig;
pub use parent::{PgInfo, PgParent, ShardInfo};
pub use read::{EcAlign, EcExtent, ReadPipeline};
pub use rmw::{plan_overwrite, RMWPipeline, RmwOp, WritePlan};
