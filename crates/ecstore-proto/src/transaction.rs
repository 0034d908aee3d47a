/// Opaque per-shard object-store transactions.
///
/// The backend composes one transaction per shard for every write; the
/// object-store executor that applies them lives outside this codebase.
/// The container therefore only has to carry composition: an ordered
/// list of primitive mutations that must apply atomically on one shard.

use serde::{Deserialize, Serialize};

use crate::oid::ObjectId;

/// A single primitive mutation within a shard transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionOp {
    /// Write `data` at `offset` within the shard's slice of `oid`.
    Write {
        oid: ObjectId,
        offset: u64,
        data: Vec<u8>,
    },
    /// Zero `length` bytes at `offset`.
    Zero {
        oid: ObjectId,
        offset: u64,
        length: u64,
    },
    /// Truncate the shard's slice of `oid` to `size`.
    Truncate { oid: ObjectId, size: u64 },
    /// Set an object attribute.
    SetAttr {
        oid: ObjectId,
        key: String,
        value: Vec<u8>,
    },
    /// Remove the shard's slice of `oid` entirely.
    Delete { oid: ObjectId },
}

/// An ordered batch of mutations for one shard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardTransaction {
    pub ops: Vec<TransactionOp>,
}

impl ShardTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn push(&mut self, op: TransactionOp) {
        self.ops.push(op);
    }

    /// Total bytes of write payload carried by this transaction.
    pub fn write_bytes(&self) -> u64 {
        self.ops
            .iter()
            .map(|op| match op {
                TransactionOp::Write { data, .. } => data.len() as u64,
                _ => 0,
            })
            .sum()
    }
}
