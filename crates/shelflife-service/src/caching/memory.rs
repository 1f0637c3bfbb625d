use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use moka::ops::compute::{CompResult, Op};
use tokio::time::Instant;

use super::{CacheKey, CacheResult, CacheStatus};

/// A value accepted into the [`CacheStore`], together with the windows it was stored with.
///
/// Entries are never modified. A refresh replaces the whole entry.
#[derive(Debug)]
pub struct CacheEntry<T> {
    value: T,
    created_at: Instant,
    ttl: Duration,
    stale_window: Duration,
}

impl<T> CacheEntry<T> {
    /// Creates an entry created right now.
    pub fn new(value: T, ttl: Duration, stale_window: Duration) -> Self {
        Self {
            value,
            created_at: Instant::now(),
            ttl,
            stale_window,
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.created_at)
    }

    pub fn freshness(&self) -> Freshness {
        let age = self.age();
        if age <= self.ttl {
            Freshness::Fresh
        } else if age <= self.ttl.saturating_add(self.stale_window) {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }
}

/// The tier an entry is in, derived from its age on every read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Freshness {
    /// `age <= ttl`
    Fresh,
    /// `ttl < age <= ttl + stale_window`
    Stale,
    /// Too old to be served at all.
    Expired,
}

impl Freshness {
    /// The status a value of this tier is served with, if it is served at all.
    pub fn status(self) -> Option<CacheStatus> {
        match self {
            Self::Fresh => Some(CacheStatus::Hit),
            Self::Stale => Some(CacheStatus::Stale),
            Self::Expired => None,
        }
    }
}

/// Process-lifetime map of cached values.
///
/// The map is unbounded and has no eviction policy of its own: an entry lives until it is
/// replaced, invalidated, or read after it expired.
pub struct CacheStore<T> {
    entries: moka::sync::Cache<CacheKey, Arc<CacheEntry<T>>>,
}

impl<T> fmt::Debug for CacheStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStore")
            .field("entries", &self.entries.entry_count())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Default for CacheStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> CacheStore<T> {
    pub fn new() -> Self {
        Self {
            entries: moka::sync::Cache::builder().build(),
        }
    }

    /// Looks up the value of `key` along with its tier.
    ///
    /// An entry that is past its stale window is removed, and reads as absent.
    pub fn get(&self, key: &CacheKey) -> Option<CacheResult<T>> {
        let entry = self.entries.get(key)?;
        let freshness = entry.freshness();
        tracing::trace!(%key, ?freshness, age = ?entry.age(), "Memory cache lookup");

        match freshness.status() {
            Some(status) => Some(CacheResult::new(entry.value.clone(), status)),
            None => {
                self.remove_expired(key, &entry);
                None
            }
        }
    }

    /// Stores `value`, replacing whatever was stored for `key` before.
    pub fn set(&self, key: CacheKey, value: T, ttl: Duration, stale_window: Duration) {
        let entry = CacheEntry::new(value, ttl, stale_window);
        self.entries.insert(key, Arc::new(entry));
    }

    /// Stores `value` unless a servable entry exists for `key`.
    ///
    /// Returns `true` if the value was stored.
    pub fn promote(&self, key: &CacheKey, value: T, ttl: Duration, stale_window: Duration) -> bool {
        let result = self
            .entries
            .entry_by_ref(key)
            .and_compute_with(|current| match current {
                Some(current) if current.value().freshness() != Freshness::Expired => Op::Nop,
                _ => Op::Put(Arc::new(CacheEntry::new(value, ttl, stale_window))),
            });
        matches!(result, CompResult::Inserted(_) | CompResult::ReplacedWith(_))
    }

    pub fn invalidate(&self, key: &CacheKey) {
        self.entries.invalidate(key);
    }

    pub fn entry_count(&self) -> u64 {
        self.entries.entry_count()
    }

    /// Removes `expired`, unless it was replaced in the meantime.
    fn remove_expired(&self, key: &CacheKey, expired: &Arc<CacheEntry<T>>) {
        let result = self
            .entries
            .entry_by_ref(key)
            .and_compute_with(|current| match current {
                Some(current) if Arc::ptr_eq(current.value(), expired) => Op::Remove,
                _ => Op::Nop,
            });
        if matches!(result, CompResult::Removed(_)) {
            tracing::trace!(%key, "Purged expired entry");
        }
    }
}
