use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::NamedTempFile;

use super::snapshot::SnapshotStore;

/// File name prefix of snapshots that are still being written.
///
/// Such files are renamed into place once fully written. Leftovers of crashed writes are
/// removed by `cleanup`.
pub(super) const TEMP_PREFIX: &str = ".tmp-";

/// A [`SnapshotStore`] keeping one file per snapshot in a flat directory.
///
/// Writes are atomic: a snapshot is written to a temporary file next to its final location and
/// then renamed over it, so readers see either the old or the new snapshot, never a partial one.
#[derive(Debug, Clone)]
pub struct FilesystemSnapshotStore {
    dir: PathBuf,
    writable: bool,
}

impl FilesystemSnapshotStore {
    /// A store that creates `dir` on demand and overwrites snapshots on `put`.
    pub fn writable(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            writable: true,
        }
    }

    /// A store that only ever reads from `dir`.
    ///
    /// Every `put` fails with [`io::ErrorKind::PermissionDenied`].
    pub fn read_only(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            writable: false,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

#[async_trait]
impl SnapshotStore for FilesystemSnapshotStore {
    async fn put(&self, name: &str, bytes: Bytes) -> io::Result<()> {
        if !self.writable {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("snapshot directory `{}` is read-only", self.dir.display()),
            ));
        }

        let path = self.path(name);
        tokio::task::spawn_blocking(move || write_atomically(&path, &bytes))
            .await
            .map_err(io::Error::other)?
    }

    async fn get(&self, name: &str) -> io::Result<Option<Bytes>> {
        match tokio::fs::read(self.path(name)).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Writes `contents` to `path` through a temporary file in the same directory.
///
/// Creates the parent directory if needed.
pub(super) fn write_atomically(path: &Path, contents: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist snapshot"))?;

    let mut temp_file = tempfile_in(parent)?;
    temp_file.write_all(contents)?;
    temp_file.as_file().sync_data()?;
    persist_tempfile(temp_file, path)
}

fn tempfile_in(dir: &Path) -> io::Result<NamedTempFile> {
    // `cleanup` could potentially remove the directory we are operating in, so retry.
    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    loop {
        retries += 1;

        if let Err(e) = std::fs::create_dir_all(dir) {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                path = %dir.display(),
                "Failed to create snapshot directory",
            );
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match tempfile::Builder::new().prefix(TEMP_PREFIX).tempfile_in(dir) {
            Ok(temp_file) => return Ok(temp_file),
            Err(e) => {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %dir.display(),
                    "Failed to create temporary snapshot file",
                );
                if retries > MAX_RETRIES {
                    return Err(e);
                }
            }
        }
    }
}

fn persist_tempfile(mut temp_file: NamedTempFile, path: &Path) -> io::Result<()> {
    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    loop {
        retries += 1;

        match temp_file.persist(path) {
            Ok(_) => return Ok(()),
            Err(e) => {
                temp_file = e.file;
                let err = e.error;
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    path = %path.display(),
                    "Failed to persist snapshot file",
                );
                if retries > MAX_RETRIES {
                    return Err(err);
                }
            }
        }
    }
}

/// Turns a `NotFound` error into `Ok(None)`.
///
/// Files may vanish at any time while `cleanup` runs concurrently with a process.
pub(super) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get() {
        let dir = shelflife_test::tempdir();
        let store = FilesystemSnapshotStore::writable(dir.path().join("volatile"));

        assert_eq!(store.get("orgs.json").await.unwrap(), None);

        store
            .put("orgs.json", Bytes::from_static(b"[1]"))
            .await
            .unwrap();
        store
            .put("orgs.json", Bytes::from_static(b"[1,2]"))
            .await
            .unwrap();
        let bytes = store.get("orgs.json").await.unwrap().unwrap();
        assert_eq!(&bytes[..], b"[1,2]");

        // only the snapshot itself is left behind
        let files: Vec<_> = std::fs::read_dir(store.dir())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(files, ["orgs.json"]);
    }

    #[tokio::test]
    async fn test_read_only() {
        let dir = shelflife_test::tempdir();
        std::fs::write(dir.path().join("orgs.json"), b"[1]").unwrap();

        let store = FilesystemSnapshotStore::read_only(dir.path());
        let err = store
            .put("orgs.json", Bytes::from_static(b"[]"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);

        let bytes = store.get("orgs.json").await.unwrap().unwrap();
        assert_eq!(&bytes[..], b"[1]");
    }

    #[test]
    fn test_catch_not_found() {
        let dir = shelflife_test::tempdir();
        let missing = dir.path().join("missing");

        let result = catch_not_found(|| std::fs::metadata(&missing)).unwrap();
        assert!(result.is_none());

        let result = catch_not_found(|| std::fs::metadata(dir.path())).unwrap();
        assert!(result.is_some());
    }
}
