//! Helpers for testing the caches.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. When dropped too early, the volatile snapshot directory is
//!    silently created again on the next write. To avoid this, assign it to a variable in the
//!    test function (e.g. `let snapshot_dir = test::tempdir()`).
//!
//!  - A [`MockBackend`] counts how often it was called and can be slowed down with
//!    [`with_delay`](MockBackend::with_delay). Under `#[tokio::test(start_paused = true)]` the delay
//!    is virtual and controlled with `tokio::time::advance`.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `shelflife` crates and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("shelflife=trace,shelflife_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`into_path`](TempDir::into_path) is called. Use it as a guard to automatically clean up after
/// tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Returns the absolute path to the given fixture.
///
/// Fixtures are located in the `tests/fixtures` directory, located from the workspace root.
/// Fixtures can be either files, or directories.
///
/// # Panics
///
/// Panics if the fixture path does not exist on the file system.
pub fn fixture(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();

    let mut full_path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    full_path.pop(); // to /crates/
    full_path.pop(); // to /
    full_path.push("./tests/fixtures/");
    full_path.push(path);

    assert!(full_path.exists(), "'{}' does not exist", path.display());

    full_path
}

/// Returns the contents of a fixture.
///
/// # Panics
///
/// Panics if the fixture does not exist or cannot be read.
pub fn read_fixture(path: impl AsRef<Path>) -> Vec<u8> {
    std::fs::read(fixture(path)).unwrap()
}

/// The future returned by a [`MockBackend`] fetcher.
pub type MockFetch<T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send>>;

struct MockBackendInner<T, E> {
    calls: AtomicUsize,
    response: Mutex<Result<T, E>>,
    delay: Duration,
}

/// A stand-in for the backing store behind a cache.
///
/// Every fetch answers with the response configured at the moment the fetch starts, after the
/// configured delay.
pub struct MockBackend<T, E> {
    inner: Arc<MockBackendInner<T, E>>,
}

impl<T, E> Clone for MockBackend<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E> MockBackend<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// A backend answering every fetch with `response`.
    pub fn new(response: Result<T, E>) -> Self {
        Self {
            inner: Arc::new(MockBackendInner {
                calls: AtomicUsize::new(0),
                response: Mutex::new(response),
                delay: Duration::ZERO,
            }),
        }
    }

    /// Makes every fetch take `delay`.
    ///
    /// # Panics
    ///
    /// Panics if the backend was already cloned.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("backend was already shared")
            .delay = delay;
        self
    }

    /// Changes the response of all fetches started from now on.
    pub fn set_response(&self, response: Result<T, E>) {
        *self.inner.response.lock() = response;
    }

    /// The number of fetches started so far.
    pub fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    /// Starts a fetch.
    pub fn fetch(&self) -> MockFetch<T, E> {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        let response = self.inner.response.lock().clone();
        let delay = self.inner.delay;

        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            response
        })
    }

    /// Returns a fetcher to hand to a cache.
    ///
    /// The fetch only starts, and is only counted, once the cache calls the fetcher.
    pub fn fetcher(&self) -> impl FnOnce() -> MockFetch<T, E> + Send + 'static {
        let backend = self.clone();
        move || backend.fetch()
    }
}
