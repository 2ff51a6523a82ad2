//! In-memory descriptor cache.
//!
//! Maps descriptor identities to weakly held descriptors: an entry lives
//! only while some other part of the engine still holds the `Arc`. Lookups
//! accept either a filled database id or the `(twincode, sequence)` pair.
//! The internal mutex is never held across I/O; every operation is a pure
//! map access.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use uuid::Uuid;

use colloquy_model::Descriptor;
use colloquy_types::{DatabaseId, DescriptorId};

#[derive(Default)]
struct Inner {
    by_id: HashMap<DatabaseId, Weak<Descriptor>>,
    pairs: HashMap<(Uuid, i64), DatabaseId>,
}

/// Weakly held descriptor cache with two-axis lookup.
#[derive(Default)]
pub struct DescriptorCache {
    inner: Mutex<Inner>,
}

impl DescriptorCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Look up a live descriptor by either identity axis.
    pub fn get(&self, id: &DescriptorId) -> Option<Arc<Descriptor>> {
        let inner = self.lock();
        let database_id = if id.database_id > 0 {
            id.database_id
        } else {
            *inner
                .pairs
                .get(&(id.twincode_outbound_id, id.sequence_id))?
        };
        inner.by_id.get(&database_id)?.upgrade()
    }

    /// Insert or replace the cached descriptor.
    ///
    /// The descriptor must already have its database id assigned.
    pub fn insert(&self, descriptor: &Arc<Descriptor>) {
        let id = descriptor.envelope().id;
        if id.database_id <= 0 {
            return;
        }
        let mut inner = self.lock();
        inner.by_id.insert(id.database_id, Arc::downgrade(descriptor));
        inner
            .pairs
            .insert((id.twincode_outbound_id, id.sequence_id), id.database_id);
    }

    /// Drop one entry.
    pub fn remove(&self, id: &DescriptorId) {
        let mut inner = self.lock();
        let database_id = if id.database_id > 0 {
            id.database_id
        } else {
            match inner.pairs.get(&(id.twincode_outbound_id, id.sequence_id)) {
                Some(db_id) => *db_id,
                None => return,
            }
        };
        inner.by_id.remove(&database_id);
        inner
            .pairs
            .retain(|_, mapped| *mapped != database_id);
    }

    /// Drop every live entry matching a predicate (dead entries too).
    pub fn remove_where(&self, predicate: impl Fn(&Descriptor) -> bool) {
        let mut inner = self.lock();
        let Inner { by_id, pairs } = &mut *inner;
        by_id.retain(|_, weak| match weak.upgrade() {
            Some(descriptor) => !predicate(&descriptor),
            None => false,
        });
        pairs.retain(|_, database_id| by_id.contains_key(database_id));
    }

    /// Sweep entries whose descriptor was dropped; returns survivors.
    pub fn purge(&self) -> usize {
        let mut inner = self.lock();
        let Inner { by_id, pairs } = &mut *inner;
        by_id.retain(|_, weak| weak.strong_count() > 0);
        pairs.retain(|_, database_id| by_id.contains_key(database_id));
        by_id.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(database_id: DatabaseId, twincode: Uuid, sequence: i64) -> Arc<Descriptor> {
        Arc::new(Descriptor::object(
            DescriptorId::new(database_id, twincode, sequence),
            1,
            100,
            "cached".into(),
        ))
    }

    #[test]
    fn test_lookup_both_axes() {
        let cache = DescriptorCache::new();
        let twincode = Uuid::new_v4();
        let descriptor = descriptor(9, twincode, 4);
        cache.insert(&descriptor);

        let by_id = cache
            .get(&DescriptorId::new(9, Uuid::nil(), 0))
            .expect("by database id");
        assert_eq!(by_id.envelope().id.database_id, 9);

        let by_pair = cache
            .get(&DescriptorId::remote(twincode, 4))
            .expect("by pair");
        assert_eq!(by_pair.envelope().id.database_id, 9);
    }

    #[test]
    fn test_entry_evicted_when_dropped() {
        let cache = DescriptorCache::new();
        let twincode = Uuid::new_v4();
        let strong = descriptor(5, twincode, 1);
        cache.insert(&strong);
        drop(strong);

        assert!(cache.get(&DescriptorId::remote(twincode, 1)).is_none());
        assert_eq!(cache.purge(), 0);
    }

    #[test]
    fn test_unassigned_id_not_cached() {
        let cache = DescriptorCache::new();
        let twincode = Uuid::new_v4();
        let unsaved = descriptor(0, twincode, 1);
        cache.insert(&unsaved);
        assert!(cache.get(&DescriptorId::remote(twincode, 1)).is_none());
    }

    #[test]
    fn test_remove_and_remove_where() {
        let cache = DescriptorCache::new();
        let twincode = Uuid::new_v4();
        let first = descriptor(1, twincode, 1);
        let second = descriptor(2, twincode, 2);
        cache.insert(&first);
        cache.insert(&second);

        cache.remove(&first.envelope().id);
        assert!(cache.get(&DescriptorId::remote(twincode, 1)).is_none());
        assert!(cache.get(&DescriptorId::remote(twincode, 2)).is_some());

        cache.remove_where(|d| d.envelope().conversation_id == 1);
        assert!(cache.get(&DescriptorId::remote(twincode, 2)).is_none());
    }
}
