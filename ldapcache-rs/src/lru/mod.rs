//! Provides a size constrained LRU Cache along with the reply cache of the proxy.
//!
//! An LRU cache drops the least recently used entry if it is about to grow beyond the given
//! limits. Additionally each entry expires once its TTL (time to live) has elapsed. Expired
//! entries are never delivered, but they still occupy memory until they are either evicted or
//! swept away by [LRUCache::sweep](LRUCache::sweep).
//!
//! The cache itself is generic and can store all kinds of values for which the
//! [ByteSize](ByteSize) trait is implemented.
//!
//! The [cache](cache) module provides the shared [ReplyCache](cache::ReplyCache) which maps
//! request fingerprints to the replies of the upstream server. To enable it,
//! [cache::install](cache::install) has to be called.
pub mod cache;
mod lru_cache;

pub use lru_cache::ByteSize;
pub use lru_cache::LRUCache;
