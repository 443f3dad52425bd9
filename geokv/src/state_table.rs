//! Keyed tables of in-flight operation state. Each daemon owns one table per
//! kind of entry (transactions, replicated reads/writes/locks, migrations).
//! get_or_create returns a scoped reference that pins the entry; a sweep
//! collects entries that report themselves finished once no reference is
//! outstanding. Entries guard their own mutable state with an internal
//! mutex, so the table itself only serializes map membership.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

/// Striped to keep unrelated keys off the same mutex.
const SHARDS: usize = 16;

/// Implemented by entries so the sweeper knows when they are collectable.
pub trait Finished {
    fn finished(&self) -> bool;
}

pub struct StateTable<K, V> {
    shards: Vec<Mutex<HashMap<K, Arc<V>>>>,
}

impl<K: Hash + Eq + Clone, V: Finished> StateTable<K, V> {
    pub fn new() -> Self {
        StateTable { shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect() }
    }

    fn shard(&self, key: &K) -> &Mutex<HashMap<K, Arc<V>>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() % SHARDS as u64) as usize]
    }

    /// Returns the entry for the key, creating it if absent. The returned
    /// reference pins the entry for as long as it is held.
    pub fn get_or_create(&self, key: K, create: impl FnOnce() -> V) -> Arc<V> {
        let mut shard = self.shard(&key).lock().expect("state table poisoned");
        shard.entry(key).or_insert_with(|| Arc::new(create())).clone()
    }

    /// Returns the entry for the key if it exists and is not yet finished.
    /// Finished entries are dead to new arrivals; they only wait for the
    /// sweeper.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let shard = self.shard(key).lock().expect("state table poisoned");
        shard.get(key).filter(|v| !v.finished()).cloned()
    }

    /// Visits every live entry, e.g. to resend timed-out requests.
    pub fn for_each(&self, mut f: impl FnMut(&K, &Arc<V>)) {
        for shard in &self.shards {
            let shard = shard.lock().expect("state table poisoned");
            for (k, v) in shard.iter() {
                f(k, v);
            }
        }
    }

    /// Drops entries that are finished and unreferenced. Entries still
    /// pinned by a reference survive until a later sweep.
    pub fn collect_garbage(&self) {
        for shard in &self.shards {
            let mut shard = shard.lock().expect("state table poisoned");
            shard.retain(|_, v| !(v.finished() && Arc::strong_count(v) == 1));
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().expect("state table poisoned").len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Hash + Eq + Clone, V: Finished> Default for StateTable<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Entry {
        done: AtomicBool,
    }

    impl Entry {
        fn new() -> Self {
            Entry { done: AtomicBool::new(false) }
        }
    }

    impl Finished for Entry {
        fn finished(&self) -> bool {
            self.done.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn get_or_create_returns_the_same_entry() {
        let table: StateTable<u64, Entry> = StateTable::new();
        let a = table.get_or_create(7, Entry::new);
        let b = table.get_or_create(7, Entry::new);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn finished_entries_are_invisible_and_swept() {
        let table: StateTable<u64, Entry> = StateTable::new();
        let entry = table.get_or_create(7, Entry::new);
        entry.done.store(true, Ordering::SeqCst);

        // Finished entries no longer resolve.
        assert!(table.get(&7).is_none());

        // A pinned entry survives the sweep; an unpinned one does not.
        table.collect_garbage();
        assert_eq!(table.len(), 1);
        drop(entry);
        table.collect_garbage();
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn unfinished_entries_survive_the_sweep() {
        let table: StateTable<u64, Entry> = StateTable::new();
        drop(table.get_or_create(7, Entry::new));
        table.collect_garbage();
        assert_eq!(table.len(), 1);
        assert!(table.get(&7).is_some());
    }

    #[test]
    fn for_each_visits_all_shards() {
        let table: StateTable<u64, Entry> = StateTable::new();
        for k in 0..100 {
            drop(table.get_or_create(k, Entry::new));
        }
        let mut seen = 0;
        table.for_each(|_, _| seen += 1);
        assert_eq!(seen, 100);
    }
}
