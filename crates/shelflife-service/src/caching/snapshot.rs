use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::config::SnapshotConfig;

use super::fs::{FilesystemSnapshotStore, write_atomically};
use super::{CacheKey, Collection};

/// A durable store of named blobs, holding one snapshot per [`CacheKey`].
///
/// Blobs are addressed by [`CacheKey::snapshot_name`].
#[async_trait]
pub trait SnapshotStore: fmt::Debug + Send + Sync {
    /// Replaces the blob stored under `name`.
    async fn put(&self, name: &str, bytes: Bytes) -> io::Result<()>;

    /// Reads the blob stored under `name`, or `None` if there is none.
    async fn get(&self, name: &str) -> io::Result<Option<Bytes>>;
}

/// A [`SnapshotStore`] living in process memory.
///
/// Used in tests, and for seeds that are compiled into a binary.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    blobs: Mutex<HashMap<String, Bytes>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding the given blobs.
    pub fn with_blobs<I, N>(blobs: I) -> Self
    where
        I: IntoIterator<Item = (N, Bytes)>,
        N: Into<String>,
    {
        let blobs = blobs.into_iter().map(|(n, b)| (n.into(), b)).collect();
        Self {
            blobs: Mutex::new(blobs),
        }
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn put(&self, name: &str, bytes: Bytes) -> io::Result<()> {
        self.blobs.lock().insert(name.to_owned(), bytes);
        Ok(())
    }

    async fn get(&self, name: &str) -> io::Result<Option<Bytes>> {
        Ok(self.blobs.lock().get(name).cloned())
    }
}

/// The tier a snapshot was loaded from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotTier {
    /// Written by this or an earlier process after a successful fetch.
    Volatile,
    /// Produced at deploy time, never written at runtime.
    Seed,
}

impl SnapshotTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Volatile => "volatile",
            Self::Seed => "seed",
        }
    }
}

impl fmt::Display for SnapshotTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A usable snapshot, along with where it was found.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadedSnapshot<T> {
    pub value: T,
    pub tier: SnapshotTier,
}

/// The two snapshot tiers: volatile first, then seed.
#[derive(Clone, Debug)]
pub struct Snapshots {
    volatile: Arc<dyn SnapshotStore>,
    seed: Option<Arc<dyn SnapshotStore>>,
}

impl Snapshots {
    pub fn new(volatile: Arc<dyn SnapshotStore>, seed: Option<Arc<dyn SnapshotStore>>) -> Self {
        Self { volatile, seed }
    }

    /// Filesystem tiers in the configured directories.
    pub fn from_config(config: &SnapshotConfig) -> Self {
        let volatile = Arc::new(FilesystemSnapshotStore::writable(&config.volatile_dir));
        let seed = config
            .seed_dir
            .as_ref()
            .map(|dir| Arc::new(FilesystemSnapshotStore::read_only(dir)) as Arc<dyn SnapshotStore>);
        Self::new(volatile, seed)
    }

    /// An in-memory volatile tier without seeds.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemorySnapshotStore::new()), None)
    }

    /// Writes `value` to the volatile tier.
    ///
    /// This never fails: errors are logged, and the return value tells whether a snapshot was
    /// written. Empty collections are not written, as they would never be loaded again and would
    /// replace the last usable snapshot.
    pub async fn persist<T: Collection>(&self, key: &CacheKey, value: &T) -> bool {
        if value.is_empty() {
            tracing::debug!(%key, "Not persisting empty snapshot");
            return false;
        }

        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    %key,
                    "Failed to serialize snapshot",
                );
                return false;
            }
        };

        let name = key.snapshot_name();
        match self.volatile.put(&name, bytes).await {
            Ok(()) => {
                tracing::trace!(%key, file = %name, "Persisted snapshot");
                true
            }
            Err(e) => {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    %key,
                    file = %name,
                    "Failed to persist snapshot",
                );
                false
            }
        }
    }

    /// Loads the most recent usable snapshot of `key`.
    ///
    /// The volatile tier takes precedence over the seed tier. Snapshots that cannot be read,
    /// do not decode, or decode to an empty collection are skipped.
    pub async fn load<T: Collection>(&self, key: &CacheKey) -> Option<LoadedSnapshot<T>> {
        let name = key.snapshot_name();

        let tiers = std::iter::once((SnapshotTier::Volatile, &self.volatile))
            .chain(self.seed.iter().map(|seed| (SnapshotTier::Seed, seed)));

        for (tier, store) in tiers {
            let bytes = match store.get(&name).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!(
                        error = &e as &dyn std::error::Error,
                        %key,
                        %tier,
                        "Failed to read snapshot",
                    );
                    continue;
                }
            };

            match decode::<T>(&bytes) {
                Ok(value) => return Some(LoadedSnapshot { value, tier }),
                Err(e) => {
                    tracing::warn!(%key, %tier, "Skipping unusable snapshot: {e:#}");
                }
            }
        }

        None
    }
}

/// Decodes a snapshot, rejecting empty collections.
fn decode<T: Collection>(bytes: &[u8]) -> Result<T> {
    let value: T = serde_json::from_slice(bytes).context("snapshot is malformed")?;
    if value.is_empty() {
        anyhow::bail!("snapshot is empty");
    }
    Ok(value)
}

/// Writes `bytes` as the seed snapshot of `key` into `dir`.
///
/// The bytes must be a non-empty JSON collection, otherwise they would be skipped on load.
/// Returns the path of the written file.
pub fn seed_snapshot(dir: &Path, key: &CacheKey, bytes: &[u8]) -> Result<PathBuf> {
    let value: serde_json::Value = decode(bytes).with_context(|| format!("invalid seed for `{key}`"))?;
    if !(value.is_array() || value.is_object()) {
        anyhow::bail!("invalid seed for `{key}`: expected a JSON array or object");
    }

    let path = dir.join(key.snapshot_name());
    write_atomically(&path, bytes)
        .with_context(|| format!("failed to write seed to `{}`", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> CacheKey {
        CacheKey::from("orgs:list")
    }

    fn blob(json: &'static str) -> (String, Bytes) {
        (key().snapshot_name(), Bytes::from_static(json.as_bytes()))
    }

    fn tiers(volatile: Option<&'static str>, seed: Option<&'static str>) -> Snapshots {
        let volatile = MemorySnapshotStore::with_blobs(volatile.map(blob));
        let seed: Arc<dyn SnapshotStore> = Arc::new(MemorySnapshotStore::with_blobs(seed.map(blob)));
        Snapshots::new(Arc::new(volatile), Some(seed))
    }

    #[tokio::test]
    async fn test_persist_and_load() {
        let snapshots = Snapshots::in_memory();
        assert_eq!(snapshots.load::<Vec<String>>(&key()).await, None);

        let orgs = vec!["a".to_owned(), "b".to_owned()];
        assert!(snapshots.persist(&key(), &orgs).await);

        let loaded = snapshots.load::<Vec<String>>(&key()).await.unwrap();
        assert_eq!(loaded.value, orgs);
        assert_eq!(loaded.tier, SnapshotTier::Volatile);
    }

    #[tokio::test]
    async fn test_volatile_wins() {
        let snapshots = tiers(Some(r#"["volatile"]"#), Some(r#"["seed"]"#));
        let loaded = snapshots.load::<Vec<String>>(&key()).await.unwrap();
        assert_eq!(loaded.value, ["volatile"]);
        assert_eq!(loaded.tier, SnapshotTier::Volatile);
    }

    #[tokio::test]
    async fn test_falls_through_to_seed() {
        for volatile in [None, Some("[]"), Some("{not json"), Some("null")] {
            let snapshots = tiers(volatile, Some(r#"["seed"]"#));
            let loaded = snapshots.load::<Vec<String>>(&key()).await.unwrap();
            assert_eq!(loaded.value, ["seed"], "volatile: {volatile:?}");
            assert_eq!(loaded.tier, SnapshotTier::Seed);
        }
    }

    #[tokio::test]
    async fn test_empty_snapshots_are_rejected() {
        let snapshots = tiers(Some("[]"), Some("[]"));
        assert_eq!(snapshots.load::<Vec<String>>(&key()).await, None);

        let snapshots = tiers(Some("{}"), None);
        assert_eq!(snapshots.load::<serde_json::Value>(&key()).await, None);
    }

    #[tokio::test]
    async fn test_empty_is_not_persisted() {
        let volatile = Arc::new(MemorySnapshotStore::with_blobs([blob(r#"["good"]"#)]));
        let snapshots = Snapshots::new(volatile, None);

        assert!(!snapshots.persist(&key(), &Vec::<String>::new()).await);
        let loaded = snapshots.load::<Vec<String>>(&key()).await.unwrap();
        assert_eq!(loaded.value, ["good"]);
    }

    #[tokio::test]
    async fn test_persist_failure_is_swallowed() {
        let dir = shelflife_test::tempdir();
        let read_only = Arc::new(FilesystemSnapshotStore::read_only(dir.path()));
        let snapshots = Snapshots::new(read_only, None);

        assert!(!snapshots.persist(&key(), &vec![1, 2, 3]).await);
    }

    #[tokio::test]
    async fn test_seed_snapshot() {
        let dir = shelflife_test::tempdir();

        let path = seed_snapshot(dir.path(), &key(), br#"[{"id": "a"}]"#).unwrap();
        assert_eq!(path, dir.path().join(key().snapshot_name()));

        let seed: Arc<dyn SnapshotStore> = Arc::new(FilesystemSnapshotStore::read_only(dir.path()));
        let snapshots = Snapshots::new(Arc::new(MemorySnapshotStore::new()), Some(seed));
        let loaded = snapshots.load::<serde_json::Value>(&key()).await.unwrap();
        assert_eq!(loaded.tier, SnapshotTier::Seed);
        assert_eq!(loaded.value, serde_json::json!([{"id": "a"}]));

        assert!(seed_snapshot(dir.path(), &key(), b"[]").is_err());
        assert!(seed_snapshot(dir.path(), &key(), b"[1").is_err());
        assert!(seed_snapshot(dir.path(), &key(), b"42").is_err());
    }
}
