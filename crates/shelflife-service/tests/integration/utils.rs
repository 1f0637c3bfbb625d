use serde_json::Value;
use shelflife_service::caching::{Cacher, Caches, FetchError};
use shelflife_service::config::Config;
use shelflife_test as test;

pub use test::{fixture, read_fixture};

pub type Backend = test::MockBackend<Value, FetchError>;

pub const KEY: &str = "orgs:list";

/// Setup tests and create the caches of a process.
///
/// This function returns the configuration, and a temporary directory holding the snapshot
/// tiers: `volatile/` and `seed/`. The directory is cleaned up when the [`TempDir`] instance
/// is dropped. Keep it as guard until the test has finished.
///
/// [`TempDir`]: test::TempDir
pub fn setup_config(update_config: impl FnOnce(&mut Config)) -> (Config, test::TempDir) {
    test::setup();

    let snapshot_dir = test::tempdir();
    let mut config = Config::default();
    config.snapshots.volatile_dir = snapshot_dir.path().join("volatile");
    config.snapshots.seed_dir = Some(snapshot_dir.path().join("seed"));
    update_config(&mut config);

    (config, snapshot_dir)
}

/// Creates a fresh `orgs` cache, as a newly started process would.
pub fn orgs_cacher(config: &Config) -> Cacher<Value> {
    Caches::from_config(config).unwrap().cacher("orgs")
}

/// The parsed contents of a JSON fixture.
pub fn json_fixture(path: &str) -> Value {
    serde_json::from_slice(&read_fixture(path)).unwrap()
}

pub fn unavailable() -> FetchError {
    FetchError::Unavailable("connection refused".into())
}
