use std::sync::Arc;
#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::bucket::Bucket;

/// Result of [`BucketStore::load_or_store`].
#[derive(Debug, Clone)]
pub enum Loaded {
    /// The candidate was inserted.
    Stored(Arc<Bucket>),
    /// Another writer got there first; this is its bucket.
    Existing(Arc<Bucket>),
}

/// Concurrent key to bucket map.
///
/// Values are immutable `Arc<Bucket>` snapshots. Writers replace a snapshot
/// only if it is still the exact allocation they read, so concurrent updates
/// to one key are serialized by optimistic retry while different keys land
/// in independent shards.
#[derive(Debug, Default)]
pub struct BucketStore {
    buckets: DashMap<String, Arc<Bucket>>,
    #[cfg(test)]
    reject_swaps: AtomicBool,
}

impl BucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, key: &str) -> Option<Arc<Bucket>> {
        self.buckets.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Insert `candidate` unless the key already has a bucket.
    pub fn load_or_store(&self, key: &str, candidate: Arc<Bucket>) -> Loaded {
        match self.buckets.entry(key.to_owned()) {
            Entry::Occupied(entry) => Loaded::Existing(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&candidate));
                Loaded::Stored(candidate)
            }
        }
    }

    /// Replace the bucket for `key` with `new` if the stored snapshot is
    /// still `expected`.
    ///
    /// Fails when another writer installed a newer snapshot or the key was
    /// deleted in the meantime.
    pub fn compare_and_swap(&self, key: &str, expected: &Arc<Bucket>, new: Arc<Bucket>) -> bool {
        #[cfg(test)]
        if self.reject_swaps.load(Ordering::Relaxed) {
            return false;
        }
        let Some(mut slot) = self.buckets.get_mut(key) else {
            return false;
        };
        if !Arc::ptr_eq(slot.value(), expected) {
            return false;
        }
        *slot.value_mut() = new;
        true
    }

    pub fn delete(&self, key: &str) -> bool {
        self.buckets.remove(key).is_some()
    }

    /// Delete `key` only if `predicate` holds for the bucket stored at the
    /// moment of removal.
    pub fn delete_if(&self, key: &str, predicate: impl FnOnce(&Bucket) -> bool) -> bool {
        self.buckets
            .remove_if(key, |_, bucket| predicate(bucket))
            .is_some()
    }

    /// Visit every entry until `visit` returns `false`.
    ///
    /// Shard read locks are held while visiting, so `visit` must not write
    /// to this store. Entries may change as soon as they have been visited.
    pub fn range(&self, mut visit: impl FnMut(&str, &Bucket) -> bool) {
        for entry in self.buckets.iter() {
            if !visit(entry.key(), entry.value()) {
                break;
            }
        }
    }

    /// Make every [`compare_and_swap`](Self::compare_and_swap) lose, as if
    /// another writer always got there first.
    #[cfg(test)]
    pub(crate) fn set_reject_swaps(&self, reject: bool) {
        self.reject_swaps.store(reject, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
