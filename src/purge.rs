//! Post-release scrubbing of process-wide caches.
//!
//! Once a region is unmapped its addresses can be handed out again by the OS. Any cache in
//! the process that still maps something to (or from) an address inside the old region
//! would then hand out a pointer into unrelated memory. The loader knows which such caches
//! exist; this module gives it a place to register them, and the mapper runs every
//! registered cache over the released span before the unmap happens.
//!
//! # Key Components
//!
//! - [`StaleCache`] - Implemented by anything that can drop entries pointing into a span
//! - [`PurgeRegistry`] - Ordered set of registered caches
//! - [`AddressCache`] - Ready-made concurrent address-to-address cache
//!
//! # Examples
//!
//! ```rust
//! use std::sync::Arc;
//! use nearmap::purge::{AddressCache, PurgeRegistry};
//!
//! let registry = PurgeRegistry::new();
//! let descriptors = Arc::new(AddressCache::new("type descriptors"));
//! registry.register(descriptors.clone())?;
//!
//! descriptors.insert(0x7000_1000, 0x5000_0000);
//! descriptors.insert(0x5000_0010, 0x7000_2000);
//!
//! let removed = registry.purge_stale(0x7000_0000..0x7001_0000)?;
//! assert_eq!(removed, 2);
//! assert!(descriptors.is_empty());
//! # Ok::<(), nearmap::Error>(())
//! ```

use std::{
    fmt,
    ops::Range,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, RwLock,
    },
};

use dashmap::DashMap;

use crate::Result;

/// A process-wide cache that may hold raw addresses of code or metadata.
pub trait StaleCache: Send + Sync {
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    /// Removes every entry whose key or value lies inside `span`.
    ///
    /// Returns the number of entries removed.
    ///
    /// Runs while the releasing mapper holds its tracker lock and the registry holds its
    /// read lock. It must not release regions or change the registry, or it deadlocks.
    fn purge_range(&self, span: Range<usize>) -> usize;
}

/// Identifies a registration, for [`PurgeRegistry::unregister`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheId(usize);

struct FnCache<F> {
    name: String,
    purge: F,
}

impl<F> StaleCache for FnCache<F>
where
    F: Fn(Range<usize>) -> usize + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn purge_range(&self, span: Range<usize>) -> usize {
        (self.purge)(span)
    }
}

/// The set of caches to scrub when a region is released.
#[derive(Default)]
pub struct PurgeRegistry {
    caches: RwLock<Vec<(CacheId, Arc<dyn StaleCache>)>>,
    next_id: AtomicUsize,
}

impl PurgeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        PurgeRegistry::default()
    }

    /// Registers a cache; caches are scrubbed in registration order.
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if the registry lock is poisoned.
    pub fn register(&self, cache: Arc<dyn StaleCache>) -> Result<CacheId> {
        let id = CacheId(self.next_id.fetch_add(1, Ordering::Relaxed));
        write_lock!(self.caches).push((id, cache));
        Ok(id)
    }

    /// Registers a purge callback under `name`.
    ///
    /// The callback receives the released span and returns how many entries it removed.
    /// It runs under the same locks as [`StaleCache::purge_range`] and must not call back
    /// into [`crate::MemoryMapper::release_region`] or this registry.
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if the registry lock is poisoned.
    pub fn register_fn<F>(&self, name: impl Into<String>, purge: F) -> Result<CacheId>
    where
        F: Fn(Range<usize>) -> usize + Send + Sync + 'static,
    {
        self.register(Arc::new(FnCache {
            name: name.into(),
            purge,
        }))
    }

    /// Removes a registration. Returns `false` if `id` was not registered.
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if the registry lock is poisoned.
    pub fn unregister(&self, id: CacheId) -> Result<bool> {
        let mut caches = write_lock!(self.caches);
        let before = caches.len();
        caches.retain(|(registered, _)| *registered != id);
        Ok(caches.len() != before)
    }

    /// Scrubs every registered cache of entries pointing into `span`.
    ///
    /// Returns the total number of entries removed.
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if the registry lock is poisoned.
    pub fn purge_stale(&self, span: Range<usize>) -> Result<usize> {
        let caches = read_lock!(self.caches);

        let mut total = 0;
        for (_, cache) in caches.iter() {
            let removed = cache.purge_range(span.clone());
            if removed > 0 {
                log::warn!(
                    "purged {removed} stale entries from {} for {:#x}..{:#x}",
                    cache.name(),
                    span.start,
                    span.end
                );
            }
            total += removed;
        }

        Ok(total)
    }

    /// Number of registered caches.
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if the registry lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(read_lock!(self.caches).len())
    }

    /// Returns `true` if nothing is registered.
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if the registry lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(read_lock!(self.caches).is_empty())
    }
}

impl fmt::Debug for PurgeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        if let Ok(caches) = self.caches.read() {
            for (_, cache) in caches.iter() {
                list.entry(&cache.name());
            }
        }
        list.finish()
    }
}

/// Concurrent cache from one address to another.
///
/// Suited to lookups such as "type descriptor at X behaves as described at Y". Reads and
/// writes from many threads proceed without a global lock; purging takes each shard in
/// turn.
#[derive(Debug)]
pub struct AddressCache {
    name: String,
    entries: DashMap<usize, usize>,
}

impl AddressCache {
    /// Creates an empty cache called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        AddressCache {
            name: name.into(),
            entries: DashMap::new(),
        }
    }

    /// Stores `value` under `key`, returning the previous value.
    pub fn insert(&self, key: usize, value: usize) -> Option<usize> {
        self.entries.insert(key, value)
    }

    /// Looks up `key`.
    #[must_use]
    pub fn get(&self, key: usize) -> Option<usize> {
        self.entries.get(&key).map(|entry| *entry.value())
    }

    /// Removes `key`, returning its value.
    pub fn remove(&self, key: usize) -> Option<usize> {
        self.entries.remove(&key).map(|(_, value)| value)
    }

    /// Returns `true` if `key` is present.
    #[must_use]
    pub fn contains_key(&self, key: usize) -> bool {
        self.entries.contains_key(&key)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the cache holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes all entries.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Snapshot of all entries, in no particular order.
    #[must_use]
    pub fn entries(&self) -> Vec<(usize, usize)> {
        self.entries
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }
}

impl StaleCache for AddressCache {
    fn name(&self) -> &str {
        &self.name
    }

    fn purge_range(&self, span: Range<usize>) -> usize {
        let mut removed = 0;
        self.entries.retain(|key, value| {
            let stale = span.contains(key) || span.contains(value);
            removed += usize::from(stale);
            !stale
        });
        removed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;

    #[test]
    fn address_cache_purges_keys_and_values() {
        let cache = AddressCache::new("test");
        cache.insert(0x1000, 0x9000);
        cache.insert(0x9000, 0x1000);
        cache.insert(0x2000, 0x3000);
        cache.insert(0x1fff, 0x3000);

        let removed = cache.purge_range(0x1000..0x2000);
        assert_eq!(removed, 3);
        assert_eq!(cache.entries(), vec![(0x2000, 0x3000)]);
    }

    #[test]
    fn purge_span_end_is_exclusive() {
        let cache = AddressCache::new("test");
        cache.insert(0x2000, 0x2000);
        assert_eq!(cache.purge_range(0x1000..0x2000), 0);
        assert_eq!(cache.get(0x2000), Some(0x2000));
    }

    #[test]
    fn registry_runs_every_cache() {
        let registry = PurgeRegistry::new();
        let first = Arc::new(AddressCache::new("first"));
        let second = Arc::new(AddressCache::new("second"));
        registry.register(first.clone()).unwrap();
        registry.register(second.clone()).unwrap();

        first.insert(0x1800, 1);
        second.insert(2, 0x1800);
        second.insert(3, 4);

        assert_eq!(registry.purge_stale(0x1000..0x2000).unwrap(), 2);
        assert!(first.is_empty());
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn registry_callbacks() {
        let registry = PurgeRegistry::new();
        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();

        let id = registry
            .register_fn("callback", move |span| {
                assert_eq!(span, 0x4000..0x5000);
                flag.store(true, Ordering::SeqCst);
                7
            })
            .unwrap();

        assert_eq!(registry.len().unwrap(), 1);
        assert_eq!(registry.purge_stale(0x4000..0x5000).unwrap(), 7);
        assert!(called.load(Ordering::SeqCst));

        assert!(registry.unregister(id).unwrap());
        assert!(!registry.unregister(id).unwrap());
        assert!(registry.is_empty().unwrap());
        assert_eq!(registry.purge_stale(0x4000..0x5000).unwrap(), 0);
    }

    #[test]
    fn registry_debug_lists_names() {
        let registry = PurgeRegistry::new();
        registry.register_fn("alpha", |_| 0).unwrap();
        registry
            .register(Arc::new(AddressCache::new("beta")))
            .unwrap();
        assert_eq!(format!("{registry:?}"), r#"["alpha", "beta"]"#);
    }
}
