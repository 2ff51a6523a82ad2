//! Identifier types shared across the workspace.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque local 64-bit row identifier, unique within one table.
pub type DatabaseId = i64;

/// Identifies one descriptor across the local database and the wire.
///
/// A descriptor is addressed either by its local row id (positive once the
/// row exists, `0` before local assignment) or by the pair
/// `(twincode_outbound_id, sequence_id)`, which is what peers exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DescriptorId {
    /// Local row id; `0` when not yet assigned locally.
    pub database_id: DatabaseId,
    /// Twincode outbound of the descriptor's owner.
    pub twincode_outbound_id: Uuid,
    /// Owner-allocated monotonic sequence id.
    pub sequence_id: i64,
}

impl DescriptorId {
    /// Build an id from a local row.
    pub fn new(database_id: DatabaseId, twincode_outbound_id: Uuid, sequence_id: i64) -> Self {
        Self {
            database_id,
            twincode_outbound_id,
            sequence_id,
        }
    }

    /// Build an id as received from the wire, before local assignment.
    pub fn remote(twincode_outbound_id: Uuid, sequence_id: i64) -> Self {
        Self {
            database_id: 0,
            twincode_outbound_id,
            sequence_id,
        }
    }

    /// Whether the local row id has been assigned.
    pub fn has_database_id(&self) -> bool {
        self.database_id > 0
    }

    /// Two ids refer to the same descriptor when their row ids are both
    /// assigned and equal, or when their `(twincode, sequence)` pairs match.
    ///
    /// Structural equality (`==`) is stricter; wire-received ids with
    /// `database_id == 0` compare equal to stored ids only through this.
    pub fn same_descriptor(&self, other: &DescriptorId) -> bool {
        if self.database_id > 0 && other.database_id > 0 {
            return self.database_id == other.database_id;
        }
        self.twincode_outbound_id == other.twincode_outbound_id
            && self.sequence_id == other.sequence_id
    }
}

impl std::fmt::Display for DescriptorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.database_id, self.twincode_outbound_id, self.sequence_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_descriptor_by_database_id() {
        let twincode_a = Uuid::new_v4();
        let twincode_b = Uuid::new_v4();
        let a = DescriptorId::new(7, twincode_a, 1);
        let b = DescriptorId::new(7, twincode_b, 99);
        assert!(a.same_descriptor(&b));
    }

    #[test]
    fn test_same_descriptor_by_pair() {
        let twincode = Uuid::new_v4();
        let local = DescriptorId::new(12, twincode, 4);
        let remote = DescriptorId::remote(twincode, 4);
        assert!(local.same_descriptor(&remote));
        assert!(remote.same_descriptor(&local));
    }

    #[test]
    fn test_different_descriptors() {
        let twincode = Uuid::new_v4();
        let a = DescriptorId::new(1, twincode, 4);
        let b = DescriptorId::new(2, twincode, 5);
        assert!(!a.same_descriptor(&b));
        assert!(!DescriptorId::remote(twincode, 4).same_descriptor(&DescriptorId::remote(twincode, 5)));
    }

    #[test]
    fn test_remote_has_no_database_id() {
        let id = DescriptorId::remote(Uuid::new_v4(), 3);
        assert!(!id.has_database_id());
    }
}
