//! Per-key outcome caches.
//!
//! Two variants: [`KeyCache`], owned by a single request-scoped loader, and
//! [`SharedKeyCache`], a process-wide, read-mostly cache for near-static
//! reference tables that loaders opt into explicitly at construction.
//!
//! Both memoize the whole outcome of resolving a key — the row group or the
//! recorded failure — and both treat entries as immutable once present: a
//! forced refetch must evict first, nothing is invalidated silently.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::group::Group;
use crate::key::Key;

/// The memoized result of resolving one key.
pub type Outcome<R, E> = Result<Group<R>, E>;

/// Request-scoped per-key cache. One per loader, living exactly as long as
/// the loader does.
#[derive(Debug)]
pub struct KeyCache<R, E> {
    entries: HashMap<Key, Outcome<R, E>>,
}

impl<R, E> KeyCache<R, E> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop the entry for a key. Returns whether anything was evicted.
    pub fn evict(&mut self, key: &Key) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<R, E: Clone> KeyCache<R, E> {
    pub fn get(&self, key: &Key) -> Option<Outcome<R, E>> {
        self.entries.get(key).cloned()
    }

    /// Record an outcome. An entry already present is kept as-is: entries
    /// are immutable for the lifetime of the cache unless evicted first.
    pub fn set(&mut self, key: Key, outcome: Outcome<R, E>) {
        self.entries.entry(key).or_insert(outcome);
    }
}

impl<R, E> Default for KeyCache<R, E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide cache for near-static reference tables.
///
/// Reads take a lock-free snapshot; writes copy the map, so this is only
/// suitable for small, rarely-written tables (the relationship-type lookups
/// of this system, for instance). Invalidation is manual, via [`evict`] or
/// [`clear`], when the underlying reference data changes.
///
/// [`evict`]: SharedKeyCache::evict
/// [`clear`]: SharedKeyCache::clear
pub struct SharedKeyCache<R, E> {
    entries: ArcSwap<HashMap<Key, Outcome<R, E>>>,
}

impl<R, E> std::fmt::Debug for SharedKeyCache<R, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedKeyCache")
            .field("entries", &self.len())
            .finish()
    }
}

impl<R, E> SharedKeyCache<R, E> {
    pub fn new() -> Self {
        Self {
            entries: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }

    pub fn clear(&self) {
        self.entries.store(Arc::new(HashMap::new()));
    }
}

impl<R, E: Clone> SharedKeyCache<R, E> {
    pub fn get(&self, key: &Key) -> Option<Outcome<R, E>> {
        self.entries.load().get(key).cloned()
    }

    /// Record an outcome, keeping any entry already present.
    pub fn set(&self, key: Key, outcome: Outcome<R, E>) {
        self.entries.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.entry(key.clone()).or_insert_with(|| outcome.clone());
            next
        });
    }

    pub fn evict(&self, key: &Key) -> bool {
        let mut removed = false;
        self.entries.rcu(|current| {
            let mut next = HashMap::clone(current);
            removed = next.remove(key).is_some();
            next
        });
        removed
    }
}

impl<R, E> Default for SharedKeyCache<R, E> {
    fn default() -> Self {
        Self::new()
    }
}
