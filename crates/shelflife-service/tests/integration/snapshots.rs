use std::fs;

use serde_json::json;
use shelflife_service::caching::{CacheKey, CacheResult, CacheStatus, seed_snapshot};

use crate::{Backend, KEY, json_fixture, orgs_cacher, read_fixture, setup_config, unavailable};

#[tokio::test]
async fn test_snapshot_survives_restart() {
    let (config, _snapshot_dir) = setup_config(|_| {});
    let orgs = json!([{"id": "acme"}]);

    let cacher = orgs_cacher(&config);
    let backend = Backend::new(Ok(orgs.clone()));
    let result = cacher.cached_fetch(KEY, backend.fetcher()).await.unwrap();
    assert_eq!(result.status, CacheStatus::Miss);

    let path = config
        .snapshots
        .volatile_dir
        .join(CacheKey::from(KEY).snapshot_name());
    assert!(path.is_file());

    // a new process, with the backing store down
    let cacher = orgs_cacher(&config);
    let backend = Backend::new(Err(unavailable()));
    let result = cacher.cached_fetch(KEY, backend.fetcher()).await.unwrap();
    assert_eq!(result, CacheResult::new(orgs, CacheStatus::PersistentStale));
}

#[tokio::test]
async fn test_seed_snapshot() {
    let (config, _snapshot_dir) = setup_config(|_| {});
    let seed_dir = config.snapshots.seed_dir.as_deref().unwrap();
    seed_snapshot(seed_dir, &KEY.into(), &read_fixture("snapshots/orgs.json")).unwrap();

    let cacher = orgs_cacher(&config);
    let backend = Backend::new(Err(unavailable()));
    let result = cacher.cached_fetch(KEY, backend.fetcher()).await.unwrap();
    assert_eq!(result.value, json_fixture("snapshots/orgs.json"));
    assert_eq!(result.status, CacheStatus::PersistentStale);

    // the seed tier is never written to
    let backend = Backend::new(Ok(json!([{"id": "hooli"}])));
    cacher.invalidate(KEY);
    cacher.cached_fetch(KEY, backend.fetcher()).await.unwrap();
    assert_eq!(fs::read_dir(seed_dir).unwrap().count(), 1);
    let seeded = fs::read(seed_dir.join(CacheKey::from(KEY).snapshot_name())).unwrap();
    assert_eq!(seeded, read_fixture("snapshots/orgs.json"));
}

#[tokio::test]
async fn test_malformed_volatile_falls_through_to_seed() {
    let (config, _snapshot_dir) = setup_config(|_| {});
    let name = CacheKey::from(KEY).snapshot_name();

    fs::create_dir_all(&config.snapshots.volatile_dir).unwrap();
    fs::write(
        config.snapshots.volatile_dir.join(&name),
        read_fixture("snapshots/malformed.json"),
    )
    .unwrap();
    let seed_dir = config.snapshots.seed_dir.as_deref().unwrap();
    seed_snapshot(seed_dir, &KEY.into(), &read_fixture("snapshots/orgs.json")).unwrap();

    let cacher = orgs_cacher(&config);
    let backend = Backend::new(Err(unavailable()));
    let result = cacher.cached_fetch(KEY, backend.fetcher()).await.unwrap();
    assert_eq!(result.value, json_fixture("snapshots/orgs.json"));
}

#[tokio::test]
async fn test_no_usable_snapshot() {
    let (config, _snapshot_dir) = setup_config(|_| {});
    let name = CacheKey::from(KEY).snapshot_name();

    fs::create_dir_all(&config.snapshots.volatile_dir).unwrap();
    fs::write(
        config.snapshots.volatile_dir.join(&name),
        read_fixture("snapshots/empty.json"),
    )
    .unwrap();

    let cacher = orgs_cacher(&config);
    let backend = Backend::new(Err(unavailable()));
    let err = cacher
        .cached_fetch(KEY, backend.fetcher())
        .await
        .unwrap_err();
    assert_eq!(err, unavailable());
}

#[test]
fn test_invalid_seeds_are_rejected() {
    let (config, _snapshot_dir) = setup_config(|_| {});
    let seed_dir = config.snapshots.seed_dir.as_deref().unwrap();

    for fixture in ["snapshots/empty.json", "snapshots/malformed.json"] {
        let result = seed_snapshot(seed_dir, &KEY.into(), &read_fixture(fixture));
        assert!(result.is_err(), "{fixture}");
    }
    assert!(!seed_dir.exists());
}
