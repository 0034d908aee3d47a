/// Object ID type.
///
/// Objects live in a flat 64-bit namespace. The backend only ever
/// compares, orders, and hashes ids; carving structure out of the bits
/// belongs to the layer above. Ordering matters: backfill progress is
/// expressed as "everything up to this object", so `ObjectId` is `Ord`.

use std::fmt;

/// A 64-bit object identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct ObjectId(pub u64);

impl ObjectId {
    /// Create a new ObjectId from a raw u64.
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw u64 value.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Sentinel id ordering after every real object. Used as the
    /// "backfill complete" marker.
    pub const MAX: ObjectId = ObjectId(u64::MAX);
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "oid({:#018x})", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<u64> for ObjectId {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl From<ObjectId> for u64 {
    fn from(oid: ObjectId) -> Self {
        oid.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering() {
        assert!(ObjectId::new(1) < ObjectId::new(2));
        assert!(ObjectId::new(2) < ObjectId::MAX);
    }

    #[test]
    fn test_display() {
        assert_eq!(ObjectId::new(0x2a).to_string(), "000000000000002a");
    }
}
