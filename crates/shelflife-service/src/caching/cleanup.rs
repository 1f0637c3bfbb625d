use std::fs::{read_dir, remove_file};
use std::path::Path;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};

use crate::config::SnapshotConfig;

use super::Collection;
use super::fs::{TEMP_PREFIX, catch_not_found};

/// Temporary files younger than this may still be written to.
const TEMP_FILE_GRACE: Duration = Duration::from_secs(3600);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStats {
    pub removed_files: usize,
    pub removed_bytes: u64,

    pub retained_files: usize,
    pub retained_bytes: u64,
}

/// Why a file is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Removal {
    /// Leftover of an interrupted write.
    Abandoned,
    /// Can not be served.
    Unusable,
    /// Not rewritten within the retention period.
    Expired,
}

/// Cleans up the volatile snapshot directory.
///
/// Removes temporary files of interrupted writes, snapshots that are malformed or empty, and
/// snapshots older than the configured retention. Seed snapshots are never touched.
/// If `dry_run` is `true`, no files will actually be deleted.
pub fn cleanup(config: &SnapshotConfig, dry_run: bool) -> Result<CleanupStats> {
    let dir = &config.volatile_dir;
    tracing::info!("Cleaning up snapshots in `{}`", dir.display());

    let mut stats = CleanupStats::default();
    let Some(entries) = catch_not_found(|| read_dir(dir))? else {
        tracing::warn!("Directory not found: `{}`", dir.display());
        return Ok(stats);
    };

    let now = SystemTime::now();
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            tracing::warn!("Skipping unexpected directory `{}`", path.display());
            continue;
        }
        try_cleanup_path(&path, config.retention, now, &mut stats, dry_run)
            .with_context(|| format!("failed to clean up `{}`", path.display()))?;
    }

    tracing::info!("Cleaning up snapshots complete");
    tracing::info!(
        "Retained {} files, totaling {} bytes",
        stats.retained_files,
        stats.retained_bytes,
    );
    tracing::info!(
        "Removed {} files, totaling {} bytes",
        stats.removed_files,
        stats.removed_bytes,
    );

    metric!(gauge("caches.cleanup.files") = stats.retained_files as u64);
    metric!(gauge("caches.cleanup.bytes") = stats.retained_bytes);
    metric!(counter("caches.cleanup.files_removed") += stats.removed_files as i64);
    metric!(counter("caches.cleanup.bytes_removed") += stats.removed_bytes as i64);

    Ok(stats)
}

/// Tries to clean up the file at `path`, returning `true` if it was removed.
fn try_cleanup_path(
    path: &Path,
    retention: Option<Duration>,
    now: SystemTime,
    stats: &mut CleanupStats,
    dry_run: bool,
) -> Result<bool> {
    tracing::trace!("Checking file `{}`", path.display());
    let Some(metadata) = catch_not_found(|| path.metadata())? else {
        return Ok(true);
    };
    let size = metadata.len();
    let age = now
        .duration_since(metadata.modified()?)
        .unwrap_or_default();

    let Some(removal) = check_file(path, age, retention)? else {
        stats.retained_bytes += size;
        stats.retained_files += 1;
        return Ok(false);
    };

    tracing::debug!(?removal, "Removing file `{}`", path.display());
    if !dry_run {
        catch_not_found(|| remove_file(path))?;
    }
    stats.removed_bytes += size;
    stats.removed_files += 1;

    Ok(true)
}

fn check_file(path: &Path, age: Duration, retention: Option<Duration>) -> Result<Option<Removal>> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy())
        .unwrap_or_default();

    if file_name.starts_with(TEMP_PREFIX) {
        return Ok((age > TEMP_FILE_GRACE).then_some(Removal::Abandoned));
    }
    if !file_name.ends_with(".json") {
        tracing::debug!("Retaining foreign file `{}`", path.display());
        return Ok(None);
    }

    let Some(bytes) = catch_not_found(|| std::fs::read(path))? else {
        return Ok(None);
    };
    match serde_json::from_slice::<serde_json::Value>(&bytes) {
        Ok(value) if !value.is_empty() => {}
        _ => return Ok(Some(Removal::Unusable)),
    }

    let expired = retention.is_some_and(|retention| age > retention);
    Ok(expired.then_some(Removal::Expired))
}
