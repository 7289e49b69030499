//! Read-through object cache for group and forum aggregates.
//!
//! The lock is only held for map access and never across a loader's await,
//! so two concurrent misses on one key may both hit the store. Both loads
//! produce the same aggregate; the later insert simply wins.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, trace};
use uuid::Uuid;

use parley_types::models::{Forum, Group};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Group(Uuid),
    Forum(Uuid),
}

#[derive(Debug, Clone)]
pub enum CachedObject {
    Group(Arc<Group>),
    Forum(Arc<Forum>),
}

#[derive(Debug, Default)]
pub struct ObjectCache {
    entries: RwLock<HashMap<CacheKey, CachedObject>>,
}

impl ObjectCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CacheKey) -> Option<CachedObject> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn insert(&self, key: CacheKey, object: CachedObject) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, object);
    }

    /// Returns the cached object, or runs `loader` and caches what it finds.
    /// A loader returning `None` caches nothing.
    pub async fn get_or_load<F, Fut, E>(&self, key: CacheKey, loader: F) -> Result<Option<CachedObject>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<CachedObject>, E>>,
    {
        if let Some(hit) = self.get(&key) {
            trace!(?key, "cache hit");
            return Ok(Some(hit));
        }

        debug!(?key, "cache miss");
        let loaded = loader().await?;
        if let Some(object) = &loaded {
            self.insert(key, object.clone());
        }
        Ok(loaded)
    }

    pub fn invalidate(&self, key: &CacheKey) {
        if self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
        {
            debug!(?key, "cache entry evicted");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn group() -> Arc<Group> {
        Arc::new(Group::new(Uuid::new_v4(), "General"))
    }

    #[tokio::test]
    async fn test_get_or_load_populates_once() {
        let cache = ObjectCache::new();
        let g = group();
        let key = CacheKey::Group(g.id);
        let loads = AtomicUsize::new(0);

        for _ in 0..3 {
            let counter = &loads;
            let value = g.clone();
            let loaded: Result<_, ()> = cache
                .get_or_load(key, || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Some(CachedObject::Group(value)))
                })
                .await;
            assert!(matches!(loaded, Ok(Some(CachedObject::Group(_)))));
        }

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_entity_is_not_cached() {
        let cache = ObjectCache::new();
        let key = CacheKey::Forum(Uuid::new_v4());

        let loaded: Result<_, ()> = cache.get_or_load(key, || async { Ok(None) }).await;
        assert!(matches!(loaded, Ok(None)));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_loader_error_leaves_cache_untouched() {
        let cache = ObjectCache::new();
        let key = CacheKey::Forum(Uuid::new_v4());

        let loaded = cache.get_or_load(key, || async { Err::<Option<CachedObject>, _>("store down") }).await;
        assert_eq!(loaded.unwrap_err(), "store down");
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn test_invalidate_removes_only_that_key() {
        let cache = ObjectCache::new();
        let a = group();
        let b = group();
        cache.insert(CacheKey::Group(a.id), CachedObject::Group(a.clone()));
        cache.insert(CacheKey::Group(b.id), CachedObject::Group(b.clone()));

        cache.invalidate(&CacheKey::Group(a.id));

        assert!(cache.get(&CacheKey::Group(a.id)).is_none());
        assert!(cache.get(&CacheKey::Group(b.id)).is_some());
    }
}
