#[cfg(test)]
use mock_instant::thread_local::Instant;
#[cfg(not(test))]
use std::time::Instant;

use std::hash::Hash;
use std::time::Duration;

use linked_hash_map::LinkedHashMap;

/// Returns the allocated memory in bytes.
pub trait ByteSize {
    /// Returns the amount of allocated memory in bytes.
    ///
    /// Note that most probably this is an approximation and not the exact byte value. However,
    /// it should represent the "largest" part of an instance (e.g. the reply bytes of a cache
    /// entry).
    fn allocated_size(&self) -> usize;
}

impl ByteSize for String {
    fn allocated_size(&self) -> usize {
        self.capacity()
    }
}

/// Provides a size constrained cache with a fixed time to live per entry.
///
/// A cache behaves just like a **Map** as long as there is no shortage in storage. However, if
/// either the max number of entries is reached or if the allocated memory is above a certain
/// limit, old (least recently used) entries will be evicted.
///
/// Each entry expires once its TTL has elapsed since it was last **put**. Expired entries are
/// never returned by **get**, but they still occupy memory until they are either evicted to
/// make room, replaced or removed by a periodic **sweep**.
///
/// # Examples
/// ```
/// # use ldapcache::lru::LRUCache;
/// # use std::time::Duration;
///
/// // Specifies a cache which can store up to 128 entries which can allocate up to 1024 bytes of
/// // memory. Each entry expires 15 minutes after it was stored.
/// let mut lru = LRUCache::new(128, 1024, Duration::from_secs(15 * 60));
///
/// lru.put("Foo".to_owned(), "Bar".to_owned()).unwrap();
/// assert_eq!(lru.get(&"Foo".to_owned()).unwrap(), &"Bar".to_owned());
///
/// // this will hit the max memory constraint...
/// lru.put("Foo2".to_owned(), "X".repeat(1020)).unwrap();
/// // ..and therefore will throw the other entry out:
/// assert_eq!(lru.get(&"Foo".to_owned()).is_some(), false);
/// assert_eq!(lru.get(&"Foo2".to_owned()).is_some(), true);
///```
pub struct LRUCache<K: Hash + Eq, V> {
    num_entries: usize,
    capacity: usize,
    allocated_memory: usize,
    max_memory: usize,
    ttl: Duration,
    reads: usize,
    hits: usize,
    writes: usize,
    map: LinkedHashMap<K, Entry<V>>,
}

struct Entry<V> {
    mem_size: usize,
    expires: Instant,
    value: V,
}

impl<K: Hash + Eq + Clone + ByteSize, V: ByteSize> LRUCache<K, V> {
    /// Creates a new cache which can store up to **capacity** entries or as many until
    /// they allocated **max_memory** of heap. Each entry is kept for **ttl**.
    pub fn new(capacity: usize, max_memory: usize, ttl: Duration) -> Self {
        LRUCache {
            num_entries: 0,
            capacity,
            allocated_memory: 0,
            max_memory,
            ttl,
            reads: 0,
            hits: 0,
            writes: 0,
            map: LinkedHashMap::new(),
        }
    }

    /// Stores the given value for the given key.
    ///
    /// Replacing an existing entry resets its time to live.
    ///
    /// # Errors
    /// Fails if the given entry is larger than **max_memory** (the max total size of the cache).
    pub fn put(&mut self, key: K, value: V) -> anyhow::Result<()> {
        let entry = Entry {
            mem_size: key.allocated_size() + value.allocated_size(),
            expires: Instant::now() + self.ttl,
            value,
        };

        if entry.mem_size > self.max_memory {
            return Err(anyhow::anyhow!(
                "The entry to be cached is larger than the whole cache size!"
            ));
        }

        let mut delta_mem: isize = entry.mem_size as isize;
        let mut delta_count = 1;

        if let Some(stale_entry) = self.map.insert(key, entry) {
            delta_mem -= stale_entry.mem_size as isize;
            delta_count = 0
        }

        self.writes += 1;
        self.num_entries += delta_count;
        self.allocated_memory = (self.allocated_memory as isize + delta_mem) as usize;

        self.enforce_constraints();

        Ok(())
    }

    fn enforce_constraints(&mut self) {
        while self.num_entries > self.capacity || self.allocated_memory > self.max_memory {
            match self.map.pop_front() {
                Some((_, lru_entry)) => {
                    self.num_entries -= 1;
                    self.allocated_memory -= lru_entry.mem_size;
                }
                None => return,
            }
        }
    }

    /// Returns the value which has previously been stored for the given key or **None** if
    /// no live value is present.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.reads += 1;

        let now = Instant::now();

        match self.map.get_refresh(key) {
            Some(entry) if entry.expires > now => {
                self.hits += 1;
                Some(&entry.value)
            }
            _ => None,
        }
    }

    /// Removes all expired entries and returns how many were dropped.
    pub fn sweep(&mut self) -> usize {
        let now = Instant::now();
        let expired: Vec<K> = self
            .map
            .iter()
            .filter(|(_, entry)| entry.expires <= now)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            if let Some(entry) = self.map.remove(key) {
                self.num_entries -= 1;
                self.allocated_memory -= entry.mem_size;
            }
        }

        expired.len()
    }

    /// Removes all entries in this cache.
    ///
    /// Note that this will also zero all metrics (reads, writes, cache hits).
    pub fn flush(&mut self) {
        self.map.clear();
        self.allocated_memory = 0;
        self.num_entries = 0;
        self.reads = 0;
        self.writes = 0;
        self.hits = 0;
    }

    /// Returns the number of elements in the cache.
    ///
    /// Note that this includes expired entries which haven't been swept yet.
    pub fn len(&self) -> usize {
        self.num_entries
    }

    /// Determines if the cache is completely empty.
    pub fn is_empty(&self) -> bool {
        self.num_entries == 0
    }

    /// Returns to overall capacity (max number of entries) of this cache.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Changes the maximal number of entries permitted in this cache.
    pub fn set_capacity(&mut self, capacity: usize) {
        let previous_capacity = self.capacity;
        self.capacity = capacity;
        if previous_capacity > self.capacity {
            self.enforce_constraints();
        }
    }

    /// Returns the maximal amount of memory to be (roughly) occupied by this cache.
    pub fn max_memory(&self) -> usize {
        self.max_memory
    }

    /// Specifies the maximal amount of memory to be (roughly) occupied by this cache.
    pub fn set_max_memory(&mut self, max_memory: usize) {
        let previous_max_memory = self.max_memory;
        self.max_memory = max_memory;
        if previous_max_memory > self.max_memory {
            self.enforce_constraints();
        }
    }

    /// Returns the time to live applied to new entries.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Specifies the time to live to apply on entries.
    ///
    /// Note that this will not affect existing entries, but only ones placed in the cache
    /// after this call.
    pub fn set_ttl(&mut self, ttl: Duration) {
        self.ttl = ttl;
    }

    /// Returns the amount of memory allocated to store the keys and values of this cache.
    pub fn allocated_memory(&self) -> usize {
        self.allocated_memory
    }

    /// Returns the cache hit rate in percent.
    ///
    /// Note that all metrics are reset when **flush()** is called.
    pub fn hit_rate(&self) -> f32 {
        match self.reads {
            0 => 0.,
            n => self.hits as f32 / n as f32 * 100.,
        }
    }

    /// Returns the total number of reads performed on this cache since the last flush.
    pub fn reads(&self) -> usize {
        self.reads
    }

    /// Returns the total number of writes performed on this cache since the last flush.
    pub fn writes(&self) -> usize {
        self.writes
    }
}

#[cfg(test)]
mod tests {
    use crate::lru::LRUCache;
    use mock_instant::thread_local::MockClock;
    use std::time::Duration;

    fn key(name: &str) -> String {
        name.to_owned()
    }

    #[test]
    fn capacity_is_enforced() {
        // Plenty of memory but only room for three entries...
        let mut lru = LRUCache::new(3, 8192, Duration::from_secs(60 * 60));

        lru.put(key("A"), key("1")).unwrap();
        lru.put(key("B"), key("2")).unwrap();
        lru.put(key("C"), key("3")).unwrap();
        assert_eq!(lru.len(), 3);

        // Touching "A" makes "B" the least recently used entry...
        assert_eq!(lru.get(&key("A")).unwrap(), "1");
        lru.put(key("D"), key("4")).unwrap();

        assert_eq!(lru.len(), 3);
        assert_eq!(lru.get(&key("B")), None);
        assert_eq!(lru.get(&key("A")).unwrap(), "1");
        assert_eq!(lru.get(&key("C")).unwrap(), "3");
        assert_eq!(lru.get(&key("D")).unwrap(), "4");

        // Shrinking the cache evicts the oldest entries right away...
        lru.set_capacity(1);
        assert_eq!(lru.len(), 1);
        assert_eq!(lru.get(&key("D")).unwrap(), "4");
    }

    #[test]
    fn max_memory_is_enforced() {
        let mut lru = LRUCache::new(128, 20, Duration::from_secs(60 * 60));

        // Each entry accounts for 5 bytes...
        lru.put(key("K1"), key("abc")).unwrap();
        lru.put(key("K2"), key("abc")).unwrap();
        lru.put(key("K3"), key("abc")).unwrap();
        lru.put(key("K4"), key("abc")).unwrap();
        assert_eq!(lru.allocated_memory(), 20);

        // Replacing an entry corrects the accounting...
        lru.put(key("K4"), key("a")).unwrap();
        assert_eq!(lru.allocated_memory(), 18);

        // A larger entry pushes the oldest one out...
        lru.put(key("K5"), key("abcde")).unwrap();
        assert_eq!(lru.get(&key("K1")), None);
        assert_eq!(lru.len(), 4);
        assert_eq!(lru.allocated_memory(), 20);

        // An entry which can never fit is rejected...
        assert_eq!(lru.put(key("K6"), "x".repeat(100)).is_err(), true);
    }

    #[test]
    fn ttl_is_enforced_and_reset_on_put() {
        let mut lru = LRUCache::new(16, 1024, Duration::from_secs(15 * 60));

        lru.put(key("Foo"), key("Bar")).unwrap();
        MockClock::advance(Duration::from_secs(10 * 60));
        assert_eq!(lru.get(&key("Foo")).unwrap(), "Bar");

        // Re-storing the value restarts its clock...
        lru.put(key("Foo"), key("Bar1")).unwrap();
        MockClock::advance(Duration::from_secs(10 * 60));
        assert_eq!(lru.get(&key("Foo")).unwrap(), "Bar1");

        MockClock::advance(Duration::from_secs(6 * 60));
        assert_eq!(lru.get(&key("Foo")), None);
    }

    #[test]
    fn sweep_drops_expired_entries() {
        let mut lru = LRUCache::new(16, 1024, Duration::from_secs(60));

        lru.put(key("Old"), key("1")).unwrap();
        MockClock::advance(Duration::from_secs(45));
        lru.put(key("New"), key("2")).unwrap();
        MockClock::advance(Duration::from_secs(30));

        assert_eq!(lru.sweep(), 1);
        assert_eq!(lru.len(), 1);
        assert_eq!(lru.allocated_memory(), 4);
        assert_eq!(lru.get(&key("New")).unwrap(), "2");

        // Nothing left to sweep...
        assert_eq!(lru.sweep(), 0);
    }

    #[test]
    fn metrics_are_computed_correctly() {
        let mut lru = LRUCache::new(4, 1024, Duration::from_secs(60 * 60));

        lru.put(key("A"), key("A")).unwrap();
        lru.put(key("B"), key("B")).unwrap();
        lru.put(key("C"), key("C")).unwrap();

        assert_eq!(lru.get(&key("A")).is_some(), true);
        assert_eq!(lru.get(&key("B")).is_some(), true);
        assert_eq!(lru.get(&key("C")).is_some(), true);
        assert_eq!(lru.get(&key("D")).is_none(), true);

        assert_eq!(lru.writes(), 3);
        assert_eq!(lru.reads(), 4);
        assert_eq!(lru.hit_rate().round() as i32, 75);

        lru.flush();
        assert_eq!(lru.is_empty(), true);
        assert_eq!(lru.reads(), 0);
        assert_eq!(lru.allocated_memory(), 0);
    }
}
