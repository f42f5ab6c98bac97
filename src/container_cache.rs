//! Bounded path→id cache for `ObjectMetaStore::getOrCreateContainer`
//! implementations (spec §5, §9): "a bounded LRU with explicit
//! get/remember/sweep". Exported as a standalone utility — the core itself
//! never calls it, since container-path lookups live inside the metadata
//! store collaborator, not this crate.

use lru::LruCache;
use std::num::NonZeroUsize;

/// A bounded, least-recently-used path→container-id cache.
pub struct ContainerCache {
    entries: LruCache<String, String>,
}

impl ContainerCache {
    pub fn new(max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::new(1).unwrap());
        ContainerCache {
            entries: LruCache::new(capacity),
        }
    }

    pub fn get(&mut self, path: &str) -> Option<&String> {
        self.entries.get(path)
    }

    /// Inserts or refreshes `path → container_id`, evicting the
    /// least-recently-used entry if the cache is at capacity.
    pub fn remember(&mut self, path: impl Into<String>, container_id: impl Into<String>) {
        self.entries.put(path.into(), container_id.into());
    }

    pub fn forget(&mut self, path: &str) {
        self.entries.pop(path);
    }

    /// Explicit sweep hook: the cache is already self-evicting on insert, so
    /// this just reports current occupancy for callers that want to log it.
    pub fn sweep(&self) -> usize {
        self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remembers_and_returns_entries() {
        let mut cache = ContainerCache::new(2);
        cache.remember("/a", "id-a");
        assert_eq!(cache.get("/a"), Some(&"id-a".to_string()));
    }

    #[test]
    fn evicts_least_recently_used_entry_over_capacity() {
        let mut cache = ContainerCache::new(2);
        cache.remember("/a", "id-a");
        cache.remember("/b", "id-b");
        cache.get("/a");
        cache.remember("/c", "id-c");

        assert!(cache.get("/b").is_none());
        assert_eq!(cache.get("/a"), Some(&"id-a".to_string()));
        assert_eq!(cache.get("/c"), Some(&"id-c".to_string()));
    }

    #[test]
    fn forget_removes_a_single_entry() {
        let mut cache = ContainerCache::new(4);
        cache.remember("/a", "id-a");
        cache.forget("/a");
        assert!(cache.get("/a").is_none());
    }
}
