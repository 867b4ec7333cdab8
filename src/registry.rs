//! Sharded table of garbage-collectable objects.
//!
//! Sessions park here keyed by peer address. There is no background
//! sweeper: each bucket sweeps itself when touched, once its population
//! passes a threshold or enough wall-clock time has passed since its
//! last sweep.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

const BUCKET_COUNT: usize = 1024;
const GC_INTERVAL: Duration = Duration::from_secs(600);
const MIN_THRESHOLD: usize = 10;

/// Contract for table residents.
pub(crate) trait GcObject {
    fn can_gc(&self) -> bool;
    fn execute_gc(&self);
}

struct Bucket<T> {
    map: HashMap<String, T>,
    threshold: usize,
    last_gc: Instant,
}

impl<T: GcObject> Bucket<T> {
    fn new() -> Bucket<T> {
        Bucket { map: HashMap::new(), threshold: MIN_THRESHOLD, last_gc: Instant::now() }
    }

    fn gc(&mut self, now: Instant) {
        if self.map.len() <= self.threshold && now - self.last_gc < GC_INTERVAL {
            return;
        }
        self.map.retain(|_, object| {
            if object.can_gc() {
                object.execute_gc();
                false
            } else {
                true
            }
        });
        self.threshold = (2 * self.map.len()).max(MIN_THRESHOLD);
        self.last_gc = now;
    }
}

pub(crate) struct Table<T> {
    buckets: Vec<Mutex<Bucket<T>>>,
}

impl<T: GcObject + Clone> Table<T> {
    pub fn new() -> Table<T> {
        Table { buckets: (0..BUCKET_COUNT).map(|_| Mutex::new(Bucket::new())).collect() }
    }

    fn bucket(&self, key: &str) -> &Mutex<Bucket<T>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.buckets[hasher.finish() as usize % self.buckets.len()]
    }

    pub fn get(&self, key: &str) -> Option<T> {
        let mut bucket = self.bucket(key).lock().unwrap();
        bucket.gc(Instant::now());
        bucket.map.get(key).cloned()
    }

    /// Returns the resident for the key, creating it if absent.
    pub fn get_or_insert_with(&self, key: &str, make: impl FnOnce() -> T) -> T {
        let mut bucket = self.bucket(key).lock().unwrap();
        bucket.gc(Instant::now());
        bucket.map.entry(key.to_string()).or_insert_with(make).clone()
    }

    pub fn remove(&self, key: &str) {
        let mut bucket = self.bucket(key).lock().unwrap();
        bucket.gc(Instant::now());
        if let Some(object) = bucket.map.remove(key) {
            object.execute_gc();
        }
    }

    /// Removes and collects every resident, collectable or not.
    pub fn drain(&self) {
        for bucket in &self.buckets {
            let mut bucket = bucket.lock().unwrap();
            for (_, object) in bucket.map.drain() {
                object.execute_gc();
            }
        }
    }

    /// Runs every resident through the collector, unconditionally.
    pub fn sweep(&self) {
        for bucket in &self.buckets {
            let mut bucket = bucket.lock().unwrap();
            bucket.map.retain(|_, object| {
                if object.can_gc() {
                    object.execute_gc();
                    false
                } else {
                    true
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Clone)]
    struct Item {
        collectable: Arc<AtomicBool>,
        collected: Arc<AtomicUsize>,
    }

    impl Item {
        fn new() -> Item {
            Item {
                collectable: Arc::new(AtomicBool::new(false)),
                collected: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl GcObject for Item {
        fn can_gc(&self) -> bool {
            self.collectable.load(Ordering::SeqCst)
        }

        fn execute_gc(&self) {
            self.collected.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn get_or_insert_reuses_the_resident() {
        let table: Table<Item> = Table::new();
        let a = table.get_or_insert_with("k", Item::new);
        let b = table.get_or_insert_with("k", Item::new);
        assert!(Arc::ptr_eq(&a.collectable, &b.collectable));
        assert!(table.get("k").is_some());
        assert!(table.get("other").is_none());
    }

    #[test]
    fn remove_collects_the_resident() {
        let table: Table<Item> = Table::new();
        let item = table.get_or_insert_with("k", Item::new);
        table.remove("k");
        assert_eq!(item.collected.load(Ordering::SeqCst), 1);
        assert!(table.get("k").is_none());
    }

    #[test]
    fn sweep_reaps_only_collectable_residents() {
        let table: Table<Item> = Table::new();
        let keep = table.get_or_insert_with("keep", Item::new);
        let reap = table.get_or_insert_with("reap", Item::new);
        reap.collectable.store(true, Ordering::SeqCst);

        table.sweep();
        assert!(table.get("keep").is_some());
        assert!(table.get("reap").is_none());
        assert_eq!(reap.collected.load(Ordering::SeqCst), 1);
        assert_eq!(keep.collected.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn access_past_threshold_triggers_the_bucket_gc() {
        let table: Table<Item> = Table::new();
        // Park enough collectable residents in one bucket to cross the
        // population threshold, then touch it.
        let items: Vec<Item> = (0..MIN_THRESHOLD + 2)
            .map(|i| {
                let item = table.get_or_insert_with(&format!("k{}", i), Item::new);
                item.collectable.store(true, Ordering::SeqCst);
                item
            })
            .collect();
        // Keys hash across buckets, so force a sweep through every one.
        table.sweep();
        let collected: usize =
            items.iter().map(|i| i.collected.load(Ordering::SeqCst)).sum();
        assert_eq!(collected, items.len());
    }
}
