//! Provides the shared cache which maps request fingerprints to upstream replies.
//!
//! To use this facility, [install](install) has to be invoked. The settings are fetched from
//! the system config and will be automatically re-applied once the config changes.
//!
//! # Configuration
//! The cache is controlled via the **cache** object in the system config (or the environment,
//! see [config](crate::config)):
//!
//! ```yaml
//! cache:
//!     # Specifies the time to live of each reply, either as plain minutes or as
//!     # duration. Supports common suffixes like: s, m, h, d
//!     duration: 15
//!     # Specifies the maximal number of requests to store
//!     size: 100000
//!     # Specifies the maximal amount of memory to use (in bytes).
//!     # Supports common suffixes like: k, m, g, t
//!     max_memory: 256m
//! ```
//!
//! Expired entries are never delivered. They are dropped by a background task which sweeps the
//! cache every two TTL periods. Changing the TTL flushes the whole cache.
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::config::{Config, Settings};
use crate::fingerprint::Fingerprint;
use crate::fmt::{format_duration, format_size};
use crate::lru::{ByteSize, LRUCache};
use crate::message::Message;
use crate::platform::Platform;

/// Determines how often the maintenance task checks if the platform is still running.
const MAINTENANCE_TICK: Duration = Duration::from_millis(500);

/// Represents what the upstream server answered for a request.
#[derive(Clone, Debug, PartialEq)]
pub enum CacheEntry {
    /// The upstream server closed the connection without answering at all (e.g. for an
    /// UnbindRequest).
    NoReply,

    /// Contains the raw bytes of all messages which make up the reply, in the order in which
    /// they were received.
    Replies(Vec<Bytes>),
}

impl CacheEntry {
    /// Creates an entry for the given reply messages.
    ///
    /// # Example
    /// ```
    /// # use ldapcache::lru::cache::CacheEntry;
    /// # use ldapcache::message::Message;
    /// assert_eq!(CacheEntry::from_replies(&[]), CacheEntry::NoReply);
    ///
    /// let entry = CacheEntry::from_replies(&[
    ///     Message::example(2, 4, b"cn=a"),
    ///     Message::example(2, 5, b""),
    /// ]);
    /// assert_eq!(entry.replies().len(), 2);
    /// ```
    pub fn from_replies(replies: &[Message]) -> Self {
        if replies.is_empty() {
            CacheEntry::NoReply
        } else {
            CacheEntry::Replies(replies.iter().map(|reply| reply.raw().clone()).collect())
        }
    }

    /// Returns the raw reply messages (which is an empty slice for **NoReply**).
    pub fn replies(&self) -> &[Bytes] {
        match self {
            CacheEntry::NoReply => &[],
            CacheEntry::Replies(replies) => replies.as_slice(),
        }
    }
}

impl ByteSize for CacheEntry {
    fn allocated_size(&self) -> usize {
        self.replies().iter().map(|reply| reply.len()).sum()
    }
}

/// Provides a snapshot of the metrics of a [ReplyCache](ReplyCache).
#[derive(Clone, Debug, PartialEq)]
pub struct CacheStats {
    /// The number of stored requests (including expired ones which haven't been swept yet).
    pub entries: usize,
    /// The max number of requests to store.
    pub capacity: usize,
    /// The memory occupied by keys and replies.
    pub allocated_memory: usize,
    /// The max amount of memory to occupy.
    pub max_memory: usize,
    /// The number of lookups since the cache was created or last flushed.
    pub reads: usize,
    /// The percentage of successful lookups.
    pub hit_rate: f32,
}

impl Display for CacheStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} / {} entries, {} / {}, {} reads, {:.2} % hits",
            self.entries,
            self.capacity,
            format_size(self.allocated_memory),
            format_size(self.max_memory),
            self.reads,
            self.hit_rate
        )
    }
}

/// Stores the replies of the upstream server keyed by the fingerprint of each request.
///
/// The cache is shared by all sessions. All operations lock an internal mutex for a very short
/// period, as no I/O is ever performed while holding it.
///
/// # Example
/// ```
/// # use ldapcache::config::Settings;
/// # use ldapcache::fingerprint::Fingerprint;
/// # use ldapcache::lru::cache::{CacheEntry, ReplyCache};
/// let cache = ReplyCache::new(&Settings::default());
/// let key = Fingerprint::of(b"request");
///
/// assert_eq!(cache.lookup(&key), None);
/// cache.store(key, CacheEntry::NoReply);
/// assert_eq!(cache.lookup(&key), Some(CacheEntry::NoReply));
/// ```
pub struct ReplyCache {
    cache: Mutex<LRUCache<Fingerprint, CacheEntry>>,
}

impl ReplyCache {
    /// Creates a new cache using the given settings.
    pub fn new(settings: &Settings) -> Self {
        ReplyCache {
            cache: Mutex::new(LRUCache::new(
                settings.cache_size,
                settings.cache_max_memory,
                settings.cache_duration,
            )),
        }
    }

    /// Returns the live entry for the given fingerprint.
    ///
    /// The entry is cloned, which is cheap as the reply bytes themselves are shared.
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        self.cache.lock().get(fingerprint).cloned()
    }

    /// Stores (or replaces) the entry for the given fingerprint.
    ///
    /// This resets the time to live of the entry. An entry which is larger than the whole
    /// cache is skipped.
    pub fn store(&self, fingerprint: Fingerprint, entry: CacheEntry) {
        if let Err(error) = self.cache.lock().put(fingerprint, entry) {
            log::warn!("Not caching the reply for {}: {}", fingerprint, error);
        }
    }

    /// Drops all expired entries and returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.cache.lock().sweep()
    }

    /// Returns the current time to live of new entries.
    pub fn ttl(&self) -> Duration {
        self.cache.lock().ttl()
    }

    /// Returns the current metrics of the cache.
    pub fn stats(&self) -> CacheStats {
        let cache = self.cache.lock();
        CacheStats {
            entries: cache.len(),
            capacity: cache.capacity(),
            allocated_memory: cache.allocated_memory(),
            max_memory: cache.max_memory(),
            reads: cache.reads(),
            hit_rate: cache.hit_rate(),
        }
    }

    /// Applies the given settings.
    ///
    /// Note that a changed TTL flushes the cache, as otherwise existing entries would live on
    /// with the previous TTL.
    pub fn reconfigure(&self, settings: &Settings) {
        let mut cache = self.cache.lock();

        if cache.capacity() != settings.cache_size {
            log::info!(
                "Updating the size of the reply cache from {} to {}.",
                cache.capacity(),
                settings.cache_size
            );
            cache.set_capacity(settings.cache_size);
        }

        if cache.max_memory() != settings.cache_max_memory {
            log::info!(
                "Updating max_memory of the reply cache from {} to {}.",
                format_size(cache.max_memory()),
                format_size(settings.cache_max_memory)
            );
            cache.set_max_memory(settings.cache_max_memory);
        }

        if cache.ttl() != settings.cache_duration {
            log::info!(
                "Updating the TTL of the reply cache from {} to {}.",
                format_duration(cache.ttl()),
                format_duration(settings.cache_duration)
            );
            cache.set_ttl(settings.cache_duration);

            log::info!("Flushing the reply cache due to changed TTL settings...");
            cache.flush();
        }
    }
}

/// Creates and installs the [ReplyCache](ReplyCache) into the given platform.
///
/// This also starts the maintenance task which sweeps expired entries and re-applies the
/// settings once the config changes. Requires a [Config](Config) to be present.
pub fn install(platform: Arc<Platform>) -> Arc<ReplyCache> {
    let config = platform.require::<Config>();
    let cache = Arc::new(ReplyCache::new(&config.current()));
    platform.register::<ReplyCache>(cache.clone());

    log::info!(
        "Caching replies for {} (sweeping every {}).",
        format_duration(cache.ttl()),
        format_duration(config.current().sweep_interval())
    );

    maintenance_loop(platform, config, cache.clone());

    cache
}

fn maintenance_loop(platform: Arc<Platform>, config: Arc<Config>, cache: Arc<ReplyCache>) {
    let mut config_changed = config.notifier();
    crate::spawn!(async move {
        let mut next_sweep = tokio::time::Instant::now() + config.current().sweep_interval();

        while platform.is_running() {
            tokio::select! {
                change = config_changed.recv() => match change {
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    _ => {
                        let settings = config.current();
                        cache.reconfigure(&settings);
                        next_sweep = tokio::time::Instant::now() + settings.sweep_interval();
                    }
                },
                _ = tokio::time::sleep(MAINTENANCE_TICK) => {
                    if tokio::time::Instant::now() >= next_sweep {
                        let swept = cache.sweep();
                        log::debug!("Swept {} expired replies. Cache: {}", swept, cache.stats());
                        next_sweep =
                            tokio::time::Instant::now() + config.current().sweep_interval();
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use crate::config::{Config, Settings};
    use crate::fingerprint::Fingerprint;
    use crate::lru::cache::{CacheEntry, ReplyCache};
    use crate::message::Message;
    use crate::platform::Platform;
    use mock_instant::thread_local::MockClock;
    use std::time::Duration;

    fn settings(minutes: u64) -> Settings {
        Settings {
            cache_duration: Duration::from_secs(minutes * 60),
            ..Settings::default()
        }
    }

    #[test]
    fn entries_expire_after_the_ttl() {
        let cache = ReplyCache::new(&settings(15));
        let key = Fingerprint::of(b"search");
        let entry = CacheEntry::from_replies(&[Message::example(1, 5, b"")]);

        cache.store(key, entry.clone());
        MockClock::advance(Duration::from_secs(14 * 60));
        assert_eq!(cache.lookup(&key), Some(entry));

        MockClock::advance(Duration::from_secs(2 * 60));
        assert_eq!(cache.lookup(&key), None);

        // The expired entry still occupies memory until it is swept...
        assert_eq!(cache.stats().entries, 1);
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn storing_again_replaces_the_entry() {
        let cache = ReplyCache::new(&settings(15));
        let key = Fingerprint::of(b"bind");

        cache.store(key, CacheEntry::NoReply);
        let replies = CacheEntry::from_replies(&[Message::example(1, 1, b"ok")]);
        cache.store(key, replies.clone());

        assert_eq!(cache.lookup(&key), Some(replies));
        assert_eq!(cache.stats().entries, 1);
    }

    #[test]
    fn oversized_entries_are_skipped() {
        let cache = ReplyCache::new(&Settings {
            cache_max_memory: 64,
            ..Settings::default()
        });
        let key = Fingerprint::of(b"huge");

        cache.store(
            key,
            CacheEntry::from_replies(&[Message::example(1, 4, &[b'x'; 128])]),
        );
        assert_eq!(cache.lookup(&key), None);
        assert_eq!(cache.stats().allocated_memory, 0);
    }

    #[test]
    fn a_changed_ttl_flushes_the_cache() {
        let cache = ReplyCache::new(&settings(15));
        let key = Fingerprint::of(b"search");
        cache.store(key, CacheEntry::NoReply);

        // Unchanged settings leave the contents alone...
        cache.reconfigure(&settings(15));
        assert_eq!(cache.lookup(&key), Some(CacheEntry::NoReply));

        cache.reconfigure(&Settings {
            cache_size: 10,
            ..settings(5)
        });
        assert_eq!(cache.lookup(&key), None);
        assert_eq!(cache.ttl(), Duration::from_secs(5 * 60));
        assert_eq!(cache.stats().capacity, 10);
    }

    #[test]
    fn install_registers_the_cache() {
        crate::testing::test_async(async {
            let platform = Platform::new();
            let config = std::sync::Arc::new(Config::new("test_settings.yml"));
            config
                .load_from_string("cache:\n    duration: 3", None)
                .unwrap();
            platform.register::<Config>(config.clone());

            let cache = crate::lru::cache::install(platform.clone());
            assert_eq!(cache.ttl(), Duration::from_secs(3 * 60));
            assert_eq!(platform.find::<ReplyCache>().is_some(), true);

            // Config changes are picked up by the maintenance task...
            config
                .load_from_string("cache:\n    duration: 4", None)
                .unwrap();
            for _ in 0..50 {
                if cache.ttl() == Duration::from_secs(4 * 60) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert_eq!(cache.ttl(), Duration::from_secs(4 * 60));

            platform.terminate();
        });
    }
}
