//! In-process LRU cache of resolved answers (tier L1).

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lineage_storage::{EntityId, EntityPath, MaterializedAnswer, PATH_SEPARATOR};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;

/// Default maximum number of entries.
pub const DEFAULT_LOCAL_CAPACITY: usize = 10_000;

/// A cached answer with its expiry metadata.
#[derive(Debug, Clone)]
struct LocalEntry {
    answer: Arc<MaterializedAnswer>,
    inserted_at: Instant,
    ttl: Duration,
    access_count: u64,
}

impl LocalEntry {
    fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() > self.ttl
    }
}

struct Inner {
    entries: LruCache<EntityId, LocalEntry>,
    /// Path of every cached answer, for subtree and ancestor invalidation.
    by_path: BTreeMap<String, EntityId>,
}

impl Inner {
    fn unindex(&mut self, id: &EntityId, path: &EntityPath) {
        if self.by_path.get(path.as_str()) == Some(id) {
            self.by_path.remove(path.as_str());
        }
    }

    fn remove(&mut self, id: &EntityId) -> bool {
        match self.entries.pop(id) {
            Some(entry) => {
                self.unindex(id, &entry.answer.path);
                true
            }
            None => false,
        }
    }
}

/// Counters exposed for SLO reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalCacheStats {
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub hit_rate: f64,
}

/// Size-bounded, thread-safe LRU cache keyed by entity id.
///
/// The lock guards only in-memory map mutation and is never held across an
/// `.await`; callers fetch from slower tiers without the lock and re-enter
/// through [`LocalCache::put`]. Expired entries are treated as misses and
/// dropped on access; [`LocalCache::sweep_expired`] bounds memory.
///
/// A path index allows invalidating every cached answer that depends on a
/// mutated path: the entry itself, its cached descendants (whose ancestor
/// arrays contain it) and its cached ancestors (whose descendant counts
/// changed).
pub struct LocalCache {
    inner: Mutex<Inner>,
    capacity: NonZeroUsize,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl std::fmt::Debug for LocalCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCache")
            .field("capacity", &self.capacity)
            .field("default_ttl", &self.default_ttl)
            .field("len", &self.len())
            .finish()
    }
}

impl LocalCache {
    /// Creates a cache holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                by_path: BTreeMap::new(),
            }),
            capacity,
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// TTL applied by [`Self::put_default`].
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Looks up an answer, promoting it to most recently used.
    pub fn get(&self, id: &EntityId) -> Option<Arc<MaterializedAnswer>> {
        let found = {
            let mut inner = self.inner.lock();
            Self::get_locked(&mut inner, id, &self.expirations)
        };
        self.record(found.is_some());
        found
    }

    /// Looks up an answer by the path it was cached under.
    pub fn get_by_path(&self, path: &EntityPath) -> Option<Arc<MaterializedAnswer>> {
        let found = {
            let mut inner = self.inner.lock();
            match inner.by_path.get(path.as_str()).cloned() {
                Some(id) => Self::get_locked(&mut inner, &id, &self.expirations),
                None => None,
            }
        };
        self.record(found.is_some());
        found
    }

    fn get_locked(
        inner: &mut Inner,
        id: &EntityId,
        expirations: &AtomicU64,
    ) -> Option<Arc<MaterializedAnswer>> {
        let expired = match inner.entries.get_mut(id) {
            None => return None,
            Some(entry) if entry.is_expired() => true,
            Some(entry) => {
                entry.access_count += 1;
                return Some(Arc::clone(&entry.answer));
            }
        };
        if expired {
            inner.remove(id);
            expirations.fetch_add(1, Ordering::Relaxed);
        }
        None
    }

    fn record(&self, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Inserts an answer, evicting the least recently used entry when full.
    pub fn put(&self, answer: Arc<MaterializedAnswer>, ttl: Duration) {
        let id = answer.entity_id.clone();
        let path = answer.path.as_str().to_string();
        let entry = LocalEntry {
            answer,
            inserted_at: Instant::now(),
            ttl,
            access_count: 0,
        };

        let mut inner = self.inner.lock();
        if let Some((old_id, old)) = inner.entries.push(id.clone(), entry) {
            if old_id != id {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
            inner.unindex(&old_id, &old.answer.path);
        }
        // a different entity cached under the same path is now outdated
        if let Some(previous) = inner.by_path.insert(path, id.clone())
            && previous != id
        {
            inner.entries.pop(&previous);
        }
    }

    /// Inserts with the default TTL.
    pub fn put_default(&self, answer: Arc<MaterializedAnswer>) {
        self.put(answer, self.default_ttl);
    }

    /// Removes one entry. Returns `true` if it was present.
    pub fn invalidate(&self, id: &EntityId) -> bool {
        self.inner.lock().remove(id)
    }

    /// Removes every cached answer depending on `prefix`: the entry at the
    /// prefix, all cached descendants and all cached ancestors.
    ///
    /// Returns the number of entries removed.
    pub fn invalidate_related(&self, prefix: &EntityPath) -> usize {
        let mut inner = self.inner.lock();

        let start = prefix.as_str().to_string();
        let end = format!("{prefix}/");
        let mut doomed: Vec<EntityId> = inner
            .by_path
            .range(start..end)
            .filter(|(path, _)| {
                path.len() == prefix.as_str().len()
                    || path[prefix.as_str().len()..].starts_with(PATH_SEPARATOR)
            })
            .map(|(_, id)| id.clone())
            .collect();
        doomed.extend(
            prefix
                .ancestors()
                .iter()
                .filter_map(|p| inner.by_path.get(p.as_str()).cloned()),
        );

        doomed.iter().filter(|id| inner.remove(id)).count()
    }

    /// Drops every entry.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.by_path.clear();
    }

    /// Removes expired entries. Returns how many were dropped.
    pub fn sweep_expired(&self) -> usize {
        let mut inner = self.inner.lock();
        let expired: Vec<EntityId> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            inner.remove(id);
        }
        self.expirations
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    /// Number of entries, including expired ones not yet dropped.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    /// How many times an entry was served since insertion.
    pub fn access_count(&self, id: &EntityId) -> Option<u64> {
        self.inner.lock().entries.peek(id).map(|e| e.access_count)
    }

    /// Entry ids from most to least recently used.
    pub fn keys_by_recency(&self) -> Vec<EntityId> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// `true` when the path index and the LRU agree and size is within bounds.
    pub fn is_consistent(&self) -> bool {
        let inner = self.inner.lock();
        inner.entries.len() <= self.capacity.get()
            && inner.by_path.len() == inner.entries.len()
            && inner.by_path.iter().all(|(path, id)| {
                inner
                    .entries
                    .peek(id)
                    .is_some_and(|e| e.answer.path.as_str() == path)
            })
    }

    pub fn stats(&self) -> LocalCacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        LocalCacheStats {
            size: self.len(),
            capacity: self.capacity(),
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }
}

impl Default for LocalCache {
    fn default() -> Self {
        Self::new(DEFAULT_LOCAL_CAPACITY, Duration::from_secs(300))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lineage_storage::SourceHash;
    use time::OffsetDateTime;

    fn answer(id: &str, path: &str) -> Arc<MaterializedAnswer> {
        let path = EntityPath::parse(path).unwrap();
        Arc::new(MaterializedAnswer {
            entity_id: EntityId::new(id),
            ancestors: path
                .ancestors()
                .iter()
                .map(|p| p.leaf_label().to_string())
                .collect(),
            path,
            descendant_count: 0,
            computed_at: OffsetDateTime::UNIX_EPOCH,
            source_hash: SourceHash(1),
        })
    }

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn test_get_put() {
        let cache = LocalCache::new(10, TTL);
        assert!(cache.get(&"a".into()).is_none());
        cache.put(answer("a", "root.a"), TTL);
        let hit = cache.get(&"a".into()).unwrap();
        assert_eq!(hit.ancestors, vec!["root".to_string()]);
        assert_eq!(cache.access_count(&"a".into()), Some(1));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate, 0.5);
    }

    #[test]
    fn test_lru_eviction_order() {
        let cache = LocalCache::new(2, TTL);
        cache.put(answer("a", "root.a"), TTL);
        cache.put(answer("b", "root.b"), TTL);
        // touch a so b becomes least recently used
        cache.get(&"a".into());
        cache.put(answer("c", "root.c"), TTL);

        assert!(cache.get(&"b".into()).is_none());
        assert!(cache.get(&"a".into()).is_some());
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 1);
        assert!(cache.is_consistent());
    }

    #[test]
    fn test_replace_does_not_count_eviction() {
        let cache = LocalCache::new(2, TTL);
        cache.put(answer("a", "root.a"), TTL);
        cache.put(answer("a", "root.b.a"), TTL);
        assert_eq!(cache.stats().evictions, 0);
        assert!(cache.get_by_path(&EntityPath::parse("root.a").unwrap()).is_none());
        assert!(cache.get_by_path(&EntityPath::parse("root.b.a").unwrap()).is_some());
        assert!(cache.is_consistent());
    }

    #[test]
    fn test_expired_entry_is_miss() {
        let cache = LocalCache::new(10, TTL);
        cache.put(answer("a", "root.a"), Duration::ZERO);
        std::thread::sleep(Duration::from_millis(2));
        assert!(cache.get(&"a".into()).is_none());
        assert_eq!(cache.stats().expirations, 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_sweep_expired() {
        let cache = LocalCache::new(10, TTL);
        cache.put(answer("a", "root.a"), Duration::ZERO);
        cache.put(answer("b", "root.b"), TTL);
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(cache.sweep_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.is_consistent());
    }

    #[test]
    fn test_invalidate_related_covers_subtree_and_ancestors() {
        let cache = LocalCache::new(10, TTL);
        cache.put(answer("root", "root"), TTL);
        cache.put(answer("acme", "root.acme"), TTL);
        cache.put(answer("div", "root.acme.division_a"), TTL);
        cache.put(answer("team", "root.acme.division_a.team_1"), TTL);
        cache.put(answer("acme2", "root.acme2"), TTL);
        cache.put(answer("other", "root.other"), TTL);

        let removed = cache.invalidate_related(&EntityPath::parse("root.acme").unwrap());
        assert_eq!(removed, 4);
        assert!(cache.get(&"acme2".into()).is_some());
        assert!(cache.get(&"other".into()).is_some());
        assert!(cache.get(&"root".into()).is_none());
        assert!(cache.get(&"team".into()).is_none());
        assert!(cache.is_consistent());
    }

    #[test]
    fn test_concurrent_access_respects_capacity() {
        let cache = Arc::new(LocalCache::new(100, TTL));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..1_000 {
                        let n = (i * 7 + t * 13) % 1_000;
                        let id = format!("e{n}");
                        if cache.get(&EntityId::new(id.clone())).is_none() {
                            cache.put(answer(&id, &format!("root.{id}")), TTL);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(cache.len() <= 100);
        assert!(cache.is_consistent());
    }
}
