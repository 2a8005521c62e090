//! In-process entity caches
//!
//! Four cooperating structures back the engine's fast paths:
//!
//! - [`EntityCache`] — positive cache, one per entity kind, reachable by id
//!   or by any of the entity's names, LRU-bounded and age-bounded.
//! - [`NegativeCache`] — "known absent" markers for domain lookups by
//!   externally supplied keys, with their own TTL.
//! - [`ComputeCache`] — side table of computed values (direct group ids,
//!   membership snapshots) keyed by entity id, invalidated as a whole per
//!   entity by the `entry modified` event.
//! - [`AclGroupCache`] — bounded cache of member-list-trimmed groups with
//!   their upward membership, kept apart from the general group cache so
//!   authorization lookups are not evicted by ordinary group traffic.
//!
//! A cached entity is shared as `Arc<Entity>`; replacement is a pointer
//! swap. Callers must never mutate a cached entity outside the modify path.

use crate::domain::{DomainKey, Entity, GroupMembership};
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Observable cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CachedEntry {
    entity: Arc<Entity>,
    // every name this entry is indexed under, kept for clean removal
    names: Vec<String>,
    refreshed_at: Instant,
}

struct EntityCacheInner {
    by_id: LruCache<Uuid, CachedEntry>,
    by_name: HashMap<String, Uuid>,
    hits: u64,
    misses: u64,
}

/// Positive entity cache, keyed by id and by every address of the entity
pub struct EntityCache {
    inner: Mutex<EntityCacheInner>,
    max_age: Duration,
}

impl EntityCache {
    pub fn new(max_entries: usize, max_age: Duration) -> Self {
        let cap = NonZeroUsize::new(max_entries.max(1)).expect("max(1) is non-zero");
        Self {
            inner: Mutex::new(EntityCacheInner {
                by_id: LruCache::new(cap),
                by_name: HashMap::new(),
                hits: 0,
                misses: 0,
            }),
            max_age,
        }
    }

    pub fn get_by_id(&self, id: Uuid) -> Option<Arc<Entity>> {
        let mut inner = self.inner.lock().unwrap();
        let fresh = match inner.by_id.get(&id) {
            Some(entry) if entry.refreshed_at.elapsed() <= self.max_age => {
                Some(entry.entity.clone())
            }
            Some(_) => None, // expired by age: a miss, and the entry goes
            None => None,
        };
        match fresh {
            Some(entity) => {
                inner.hits += 1;
                Some(entity)
            }
            None => {
                Self::evict(&mut inner, id);
                inner.misses += 1;
                None
            }
        }
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<Entity>> {
        let id = {
            let inner = self.inner.lock().unwrap();
            inner.by_name.get(&name.to_lowercase()).copied()
        };
        match id {
            Some(id) => self.get_by_id(id),
            None => {
                self.inner.lock().unwrap().misses += 1;
                None
            }
        }
    }

    /// Insert or replace. A replaced entry's old names are unindexed, so a
    /// renamed entity is never reachable under its old address.
    pub fn put(&self, entity: Arc<Entity>) {
        let mut inner = self.inner.lock().unwrap();
        Self::evict(&mut inner, entity.id);

        let names: Vec<String> = entity
            .cache_keys()
            .iter()
            .map(|k| k.to_lowercase())
            .collect();
        for name in &names {
            inner.by_name.insert(name.clone(), entity.id);
        }
        let evicted = inner.by_id.push(
            entity.id,
            CachedEntry {
                entity,
                names,
                refreshed_at: Instant::now(),
            },
        );
        if let Some((old_id, old)) = evicted {
            for name in &old.names {
                // a name reindexed to the new entry above must survive
                if inner.by_name.get(name) == Some(&old_id) {
                    inner.by_name.remove(name);
                }
            }
        }
    }

    /// Refresh-in-place: same as [`put`](Self::put), the new entry starts a
    /// fresh age window
    pub fn replace(&self, entity: Arc<Entity>) {
        self.put(entity);
    }

    pub fn remove(&self, entity: &Entity) {
        let mut inner = self.inner.lock().unwrap();
        Self::evict(&mut inner, entity.id);
    }

    pub fn remove_by_id(&self, id: Uuid) {
        let mut inner = self.inner.lock().unwrap();
        Self::evict(&mut inner, id);
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.by_id.clear();
        inner.by_name.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        CacheStats {
            size: inner.by_id.len(),
            hits: inner.hits,
            misses: inner.misses,
        }
    }

    fn evict(inner: &mut EntityCacheInner, id: Uuid) {
        if let Some(old) = inner.by_id.pop(&id) {
            for name in &old.names {
                if inner.by_name.get(name) == Some(&id) {
                    inner.by_name.remove(name);
                }
            }
        }
    }
}

/// Cache of "confirmed absent" domain lookups
pub struct NegativeCache {
    inner: Mutex<LruCache<DomainKey, Instant>>,
    ttl: Duration,
}

impl NegativeCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(max_entries.max(1)).expect("max(1) is non-zero");
        Self {
            inner: Mutex::new(LruCache::new(cap)),
            ttl,
        }
    }

    /// True if this key was recently confirmed absent
    pub fn contains(&self, key: &DomainKey) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.get(key) {
            Some(inserted_at) if inserted_at.elapsed() <= self.ttl => true,
            Some(_) => {
                inner.pop(key);
                false
            }
            None => false,
        }
    }

    pub fn put(&self, key: DomainKey) {
        self.inner.lock().unwrap().push(key, Instant::now());
    }

    pub fn remove(&self, key: &DomainKey) {
        self.inner.lock().unwrap().pop(key);
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}

/// Computed values attached to an entity, living outside the entity itself
#[derive(Default, Clone)]
pub struct EntityComputed {
    /// Direct group ids, verified lazily on use
    pub direct_group_ids: Option<Vec<Uuid>>,
    /// Full transitive membership
    pub membership: Option<Arc<GroupMembership>>,
    /// Admin-only transitive membership
    pub admin_membership: Option<Arc<GroupMembership>>,
}

/// Side table of computed per-entity data, keyed by entity id.
///
/// A single `invalidate` covers every computed value for the entity;
/// callers never clear individual fields.
#[derive(Default)]
pub struct ComputeCache {
    inner: Mutex<HashMap<Uuid, EntityComputed>>,
}

impl ComputeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: Uuid) -> Option<EntityComputed> {
        self.inner.lock().unwrap().get(&id).cloned()
    }

    pub fn update(&self, id: Uuid, apply: impl FnOnce(&mut EntityComputed)) {
        let mut inner = self.inner.lock().unwrap();
        apply(inner.entry(id).or_default());
    }

    /// The "entity attributes changed" event
    pub fn invalidate(&self, id: Uuid) {
        self.inner.lock().unwrap().remove(&id);
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}

/// One access-control group: trimmed entity plus its upward membership
#[derive(Clone)]
pub struct AclGroupEntry {
    pub group: Arc<Entity>,
    pub membership: Arc<GroupMembership>,
}

struct AclGroupCacheInner {
    entries: LruCache<Uuid, (AclGroupEntry, Instant)>,
    hits: u64,
    misses: u64,
}

/// Bounded cache for authorization group lookups, separate from the general
/// group cache. Invalidation is wholesale: any membership-affecting write
/// clears it entirely.
pub struct AclGroupCache {
    inner: Mutex<AclGroupCacheInner>,
    max_age: Duration,
}

impl AclGroupCache {
    pub fn new(max_entries: usize, max_age: Duration) -> Self {
        let cap = NonZeroUsize::new(max_entries.max(1)).expect("max(1) is non-zero");
        Self {
            inner: Mutex::new(AclGroupCacheInner {
                entries: LruCache::new(cap),
                hits: 0,
                misses: 0,
            }),
            max_age,
        }
    }

    pub fn get(&self, id: Uuid) -> Option<AclGroupEntry> {
        let mut inner = self.inner.lock().unwrap();
        match inner.entries.get(&id) {
            Some((entry, refreshed_at)) if refreshed_at.elapsed() <= self.max_age => {
                let entry = entry.clone();
                inner.hits += 1;
                Some(entry)
            }
            Some(_) => {
                inner.entries.pop(&id);
                inner.misses += 1;
                None
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    pub fn put(&self, entry: AclGroupEntry) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.push(entry.group.id, (entry, Instant::now()));
    }

    pub fn invalidate_all(&self) {
        self.inner.lock().unwrap().entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        CacheStats {
            size: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
        }
    }
}
