use std::path::Path;
use std::time::Duration;

use shelflife_service::caching::FetchOptions;
use shelflife_service::config::{Config, LogFormat};

use crate::fixture;

#[test]
fn test_config_file() {
    let config = Config::get(Some(fixture("config.yml").as_path())).unwrap();

    assert_eq!(config.logging.format, LogFormat::Json);
    assert_eq!(config.metrics.prefix, "shelflife.test");
    assert_eq!(config.metrics.custom_tags["region"], "eu");
    assert_eq!(
        FetchOptions::from(config.caches),
        FetchOptions::new(Duration::from_secs(10), Duration::from_secs(120))
    );
    assert_eq!(
        config.snapshots.retention,
        Some(Duration::from_secs(14 * 24 * 3600))
    );
    // not configured, so the default is kept
    assert_eq!(config.snapshots.seed_dir, None);
}

#[test]
fn test_missing_config_file() {
    let result = Config::get(Some(Path::new("/does/not/exist.yml")));
    assert!(result.is_err());
}
