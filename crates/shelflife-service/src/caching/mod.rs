//! # Caching
//!
//! Values of a slow backing store are cached in three layers:
//!
//! - The [`CacheStore`] keeps values in memory. A value is served as fresh during its `ttl`, then
//!   as stale for another `stale_window` while it is refreshed in the background. After that it
//!   is gone.
//! - The [`InFlightRegistry`] tracks the fetches and background refreshes that are currently
//!   running, at most one per key. Concurrent misses of a key wait on the same fetch instead of
//!   each hitting the backing store.
//! - [`Snapshots`] are durable copies of the last fetched value of each key. They are only read
//!   when the backing store fails and memory has nothing to serve. A volatile tier is rewritten
//!   after every fetch, a read-only seed tier is produced at deploy time.
//!
//! The [`Cacher`] ties these together. Every [`CacheResult`] carries a [`CacheStatus`] telling
//! which path the value took, which is usually surfaced as the [`STATUS_HEADER`] response header.
//!
//! A [`Cacher`] is an explicit service object. The [`Caches`] built from the
//! [`Config`](crate::config::Config) hands them out and owns the shared snapshot tiers.
//!
//! ## Invalidation
//!
//! Writes to the backing store must be followed by [`Cacher::invalidate`]. This drops the cached
//! value and the record of any operation in flight for the key. Such an operation keeps running,
//! but its result is not stored, so the next lookup fetches the value after the write.
//!
//! ## Cleanup
//!
//! The volatile tier is never pruned by a running process. The `cleanup` command removes
//! unusable snapshots, leftovers of interrupted writes, and optionally snapshots that were not
//! rewritten within `snapshots.retention`.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{CacheConfig, Config};

mod cache_key;
mod cacher;
mod cleanup;
mod collection;
mod error;
mod fs;
mod in_flight;
mod memory;
mod snapshot;
mod status;

pub use cache_key::CacheKey;
pub use cacher::Cacher;
pub use cleanup::{CleanupStats, cleanup};
pub use collection::Collection;
pub use error::FetchError;
pub use fs::FilesystemSnapshotStore;
pub use in_flight::{Completion, Flight, FlightKind, InFlightRegistry, Registrations};
pub use memory::{CacheEntry, CacheStore, Freshness};
pub use snapshot::{
    LoadedSnapshot, MemorySnapshotStore, SnapshotStore, SnapshotTier, Snapshots, seed_snapshot,
};
pub use status::{CacheResult, CacheStatus, STATUS_HEADER};

/// The windows a fetched value is stored with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FetchOptions {
    /// How long the value is served as fresh.
    pub ttl: Duration,
    /// How long after `ttl` the value is still served while being refreshed.
    pub stale_window: Duration,
}

impl FetchOptions {
    pub fn new(ttl: Duration, stale_window: Duration) -> Self {
        Self { ttl, stale_window }
    }
}

impl Default for FetchOptions {
    fn default() -> Self {
        CacheConfig::default().into()
    }
}

impl From<CacheConfig> for FetchOptions {
    fn from(config: CacheConfig) -> Self {
        Self::new(config.ttl, config.stale_window)
    }
}

/// Hands out the [`Cacher`]s of a process.
///
/// All caches share the same snapshot tiers. Snapshot names are derived from the key alone, so
/// keys have to be unique across caches.
#[derive(Debug, Clone)]
pub struct Caches {
    options: FetchOptions,
    snapshots: Snapshots,
}

impl Caches {
    pub fn new(options: FetchOptions, snapshots: Snapshots) -> Self {
        Self { options, snapshots }
    }

    /// Creates the configured snapshot tiers.
    ///
    /// The volatile snapshot directory is created if it does not exist.
    pub fn from_config(config: &Config) -> io::Result<Self> {
        std::fs::create_dir_all(&config.snapshots.volatile_dir)?;
        Ok(Self::new(
            config.caches.into(),
            Snapshots::from_config(&config.snapshots),
        ))
    }

    pub fn options(&self) -> FetchOptions {
        self.options
    }

    pub fn snapshots(&self) -> &Snapshots {
        &self.snapshots
    }

    /// Creates a new, empty cache called `name`.
    ///
    /// Every call returns an independent cache, so this belongs in the composition root.
    pub fn cacher<T, E>(&self, name: impl Into<Arc<str>>) -> Cacher<T, E>
    where
        T: Collection,
        E: std::error::Error + Clone + Send + Sync + 'static,
    {
        self.cacher_with(name, self.options)
    }

    /// Like [`cacher`](Self::cacher), with different default windows.
    pub fn cacher_with<T, E>(&self, name: impl Into<Arc<str>>, options: FetchOptions) -> Cacher<T, E>
    where
        T: Collection,
        E: std::error::Error + Clone + Send + Sync + 'static,
    {
        Cacher::new(name, options, self.snapshots.clone())
    }
}
