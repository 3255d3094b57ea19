use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fnv::{FnvHashMap, FnvHasher};
use inline_array::InlineArray;
use parking_lot::{Mutex, RwLock};

use crate::record::Slot;

/// Where the current version of a key lives.
#[derive(Debug, Clone)]
pub(crate) enum Entry {
    /// An in-memory slot.
    Hot(Arc<Slot>),
    /// A record at `offset` of the recovered checkpoint log.
    Cold { offset: u64 },
}

impl Entry {
    /// Identity, not value, equality: two entries are the same if they
    /// name the same slot or the same log record.
    pub fn same(&self, other: &Entry) -> bool {
        match (self, other) {
            (Entry::Hot(a), Entry::Hot(b)) => Arc::ptr_eq(a, b),
            (Entry::Cold { offset: a }, Entry::Cold { offset: b }) => a == b,
            _ => false,
        }
    }
}

type Bucket = Mutex<FnvHashMap<InlineArray, Entry>>;

/// The engine's hash index: a power-of-two number of buckets, each behind
/// its own lock. Bucket locks are only held to resolve or swap an entry,
/// never while a slot is being mutated.
#[derive(Debug)]
pub(crate) struct HashIndex {
    buckets: RwLock<Box<[Bucket]>>,
    len: AtomicU64,
}

fn new_buckets(n: usize) -> Box<[Bucket]> {
    (0..n).map(|_| Mutex::new(FnvHashMap::default())).collect()
}

fn bucket_of(key: &[u8], n_buckets: usize) -> usize {
    let mut hasher = FnvHasher::default();
    key.hash(&mut hasher);
    (hasher.finish() as usize) & (n_buckets - 1)
}

impl HashIndex {
    pub fn new(table_size: u64) -> HashIndex {
        let n = table_size.clamp(1, 1 << 32).next_power_of_two() as usize;
        HashIndex {
            buckets: RwLock::new(new_buckets(n)),
            len: AtomicU64::new(0),
        }
    }

    pub fn table_size(&self) -> u64 {
        self.buckets.read().len() as u64
    }

    /// Number of keys.
    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    pub fn get(&self, key: &InlineArray) -> Option<Entry> {
        let buckets = self.buckets.read();
        let bucket = buckets[bucket_of(key, buckets.len())].lock();
        bucket.get(key).cloned()
    }

    /// Inserts `entry` unless the key already exists, in which case the
    /// current entry is returned.
    pub fn insert_if_absent(
        &self,
        key: &InlineArray,
        entry: Entry,
    ) -> Result<(), Entry> {
        let buckets = self.buckets.read();
        let mut bucket = buckets[bucket_of(key, buckets.len())].lock();
        if let Some(existing) = bucket.get(key) {
            return Err(existing.clone());
        }
        bucket.insert(key.clone(), entry);
        self.len.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Swaps in `new` only if the key still maps to `expected`. On
    /// failure returns what the key maps to now.
    pub fn replace(
        &self,
        key: &InlineArray,
        expected: &Entry,
        new: Entry,
    ) -> Result<(), Option<Entry>> {
        let buckets = self.buckets.read();
        let mut bucket = buckets[bucket_of(key, buckets.len())].lock();
        match bucket.get_mut(key) {
            Some(current) if current.same(expected) => {
                *current = new;
                Ok(())
            }
            other => Err(other.cloned()),
        }
    }

    /// Doubles the bucket count, rehashing every entry. Returns the new
    /// table size.
    pub fn grow(&self) -> u64 {
        let mut buckets = self.buckets.write();
        let new_len = buckets.len() * 2;
        let grown = new_buckets(new_len);
        for bucket in buckets.iter() {
            for (key, entry) in bucket.lock().drain() {
                grown[bucket_of(&key, new_len)].lock().insert(key, entry);
            }
        }
        *buckets = grown;
        new_len as u64
    }

    /// Copies out every entry. Buckets are visited one at a time, so the
    /// result is only a point-in-time view per bucket.
    pub fn entries(&self) -> Vec<(InlineArray, Entry)> {
        let buckets = self.buckets.read();
        let mut ret = Vec::with_capacity(self.len() as usize);
        for bucket in buckets.iter() {
            ret.extend(
                bucket.lock().iter().map(|(k, v)| (k.clone(), v.clone())),
            );
        }
        ret
    }

    /// `histogram[n]` is the number of buckets holding exactly `n` keys.
    pub fn distribution(&self) -> Vec<u64> {
        let buckets = self.buckets.read();
        let mut histogram = vec![];
        for bucket in buckets.iter() {
            let n = bucket.lock().len();
            if histogram.len() <= n {
                histogram.resize(n + 1, 0);
            }
            histogram[n] += 1;
        }
        histogram
    }
}
