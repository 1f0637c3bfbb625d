//! Exposes the command line application.
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use shelflife_service::caching::{
    CacheKey, CleanupStats, Collection, Snapshots, cleanup, seed_snapshot,
};
use shelflife_service::config::Config;
use shelflife_service::metrics;

use crate::logging;

/// Manage the snapshots behind the shelflife caches.
#[derive(Debug, Parser)]
#[command(name = "shelflife", author, version, about, long_about = None)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write a JSON collection as the seed snapshot of a key.
    Seed {
        /// The cache key the snapshot is served for.
        key: String,

        /// The JSON file holding the collection.
        file: PathBuf,

        /// Directory of the seed tier. Defaults to `snapshots.seed_dir` of the configuration.
        #[arg(long, value_name = "DIR")]
        dir: Option<PathBuf>,
    },

    /// Show the snapshot a failing fetch of a key would fall back to.
    Inspect {
        /// The cache key to look up.
        key: String,
    },

    /// Clean up the volatile snapshot directory.
    Cleanup {
        /// Only report what would be removed.
        #[arg(long)]
        dry_run: bool,
    },
}

/// What `inspect` prints for a usable snapshot.
#[derive(Debug, Serialize, PartialEq, Eq)]
struct Summary {
    key: String,
    file: String,
    tier: &'static str,
    items: usize,
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config.as_deref()).context("failed loading config")?;

    // SAFETY: No other threads exist yet. Sentry starts its transport thread below, and the
    // runtime of `inspect` is started after that.
    unsafe { logging::init_logging(&config) };

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();

        if let Some(hostname_tag) = config.metrics.hostname_tag.clone() {
            if tags.contains_key(&hostname_tag) {
                tracing::warn!(
                    "tag {} defined both as hostname tag and as a custom tag",
                    hostname_tag
                );
            }
            if let Some(hostname) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(hostname_tag, hostname);
            } else {
                tracing::error!("could not read host name");
            }
        };

        metrics::configure_statsd(&config.metrics.prefix, statsd, tags)
            .context("failed to configure statsd")?;
    }

    match cli.command {
        Command::Seed { key, file, dir } => {
            let path = seed(&config, &CacheKey::from(key), &file, dir.as_deref())?;
            println!("{}", path.display());
        }
        Command::Inspect { key } => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("failed to start runtime")?;
            let key = CacheKey::from(key);
            let Some(summary) = runtime.block_on(inspect(&config, &key)) else {
                anyhow::bail!("no usable snapshot for `{key}`");
            };
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Cleanup { dry_run } => {
            let stats = cleanup(&config.snapshots, dry_run).context("failed to clean up snapshots")?;
            report_cleanup(stats, dry_run);
        }
    }

    Ok(())
}

fn seed(config: &Config, key: &CacheKey, file: &Path, dir: Option<&Path>) -> Result<PathBuf> {
    let Some(dir) = dir.or(config.snapshots.seed_dir.as_deref()) else {
        anyhow::bail!("no seed directory, pass `--dir` or configure `snapshots.seed_dir`");
    };
    let bytes = fs::read(file).with_context(|| format!("failed to read `{}`", file.display()))?;

    let path = seed_snapshot(dir, key, &bytes)?;
    tracing::info!(%key, "Wrote seed snapshot to `{}`", path.display());
    Ok(path)
}

async fn inspect(config: &Config, key: &CacheKey) -> Option<Summary> {
    let snapshots = Snapshots::from_config(&config.snapshots);
    let loaded = snapshots.load::<serde_json::Value>(key).await?;

    Some(Summary {
        key: key.to_string(),
        file: key.snapshot_name(),
        tier: loaded.tier.as_str(),
        items: loaded.value.len(),
    })
}

fn report_cleanup(stats: CleanupStats, dry_run: bool) {
    let verb = if dry_run { "Would remove" } else { "Removed" };
    println!(
        "{verb} {} files ({} bytes), retained {} files ({} bytes)",
        stats.removed_files, stats.removed_bytes, stats.retained_files, stats.retained_bytes,
    );
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;
    use shelflife_service::config::SnapshotConfig;

    use super::*;

    fn config_in(dir: &Path) -> Config {
        Config {
            snapshots: SnapshotConfig {
                volatile_dir: dir.join("volatile"),
                seed_dir: Some(dir.join("seed")),
                retention: None,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_cli() {
        Cli::command().debug_assert();

        let cli = Cli::try_parse_from(["shelflife", "cleanup", "--dry-run", "-c", "config.yml"])
            .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("config.yml")));
        assert!(matches!(cli.command, Command::Cleanup { dry_run: true }));

        let cli = Cli::try_parse_from(["shelflife", "seed", "orgs:list", "orgs.json"]).unwrap();
        assert!(matches!(cli.command, Command::Seed { dir: None, .. }));

        assert!(Cli::try_parse_from(["shelflife", "inspect"]).is_err());
    }

    #[tokio::test]
    async fn test_seed_then_inspect() {
        shelflife_test::setup();
        let dir = shelflife_test::tempdir();
        let config = config_in(dir.path());
        let key = CacheKey::from("orgs:list");

        assert_eq!(inspect(&config, &key).await, None);

        let fixture = shelflife_test::fixture("snapshots/orgs.json");
        let path = seed(&config, &key, &fixture, None).unwrap();
        assert_eq!(path, dir.path().join("seed").join(key.snapshot_name()));

        let summary = inspect(&config, &key).await.unwrap();
        assert_eq!(
            summary,
            Summary {
                key: "orgs:list".into(),
                file: key.snapshot_name(),
                tier: "seed",
                items: 3,
            }
        );
    }

    #[test]
    fn test_seed_requires_dir() {
        let dir = shelflife_test::tempdir();
        let config = Config::default();
        let fixture = shelflife_test::fixture("snapshots/orgs.json");

        let key = CacheKey::from("orgs:list");
        assert!(seed(&config, &key, &fixture, None).is_err());
        assert!(seed(&config, &key, &fixture, Some(dir.path())).is_ok());
    }

    #[test]
    fn test_seed_rejects_empty() {
        let dir = shelflife_test::tempdir();
        let config = config_in(dir.path());
        let fixture = shelflife_test::fixture("snapshots/empty.json");

        let key = CacheKey::from("orgs:list");
        assert!(seed(&config, &key, &fixture, None).is_err());
    }
}
