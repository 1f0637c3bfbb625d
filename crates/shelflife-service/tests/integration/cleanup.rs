use std::fs;

use serde_json::json;
use shelflife_service::caching::{CacheKey, cleanup};

use crate::{Backend, KEY, orgs_cacher, read_fixture, setup_config};

#[tokio::test]
async fn test_cleanup_keeps_live_snapshots() {
    let (config, _snapshot_dir) = setup_config(|_| {});
    let volatile_dir = &config.snapshots.volatile_dir;

    let cacher = orgs_cacher(&config);
    let backend = Backend::new(Ok(json!([{"id": "acme"}])));
    cacher.cached_fetch(KEY, backend.fetcher()).await.unwrap();

    let broken = volatile_dir.join(CacheKey::from("orgs:broken").snapshot_name());
    fs::write(&broken, read_fixture("snapshots/malformed.json")).unwrap();

    let stats = cleanup(&config.snapshots, false).unwrap();
    assert_eq!(stats.retained_files, 1);
    assert_eq!(stats.removed_files, 1);
    assert!(volatile_dir.join(CacheKey::from(KEY).snapshot_name()).is_file());
    assert!(!broken.exists());
}
