use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use sentry::{Hub, SentryFutureExt};
use tokio::time::Instant;

use crate::utils::defer::defer;

use super::in_flight::{Flight, FlightKind, InFlightRegistry, Registrations};
use super::memory::CacheStore;
use super::snapshot::{LoadedSnapshot, Snapshots};
use super::{CacheKey, CacheResult, CacheStatus, Collection, FetchError, FetchOptions};

struct CacherInner<T, E> {
    /// Cache identifier used for metric names and logs.
    name: Arc<str>,
    /// Windows used by [`Cacher::cached_fetch`] and [`Cacher::set`].
    options: FetchOptions,
    store: CacheStore<T>,
    flights: InFlightRegistry<T, E>,
    snapshots: Snapshots,
}

/// A stale-while-revalidate cache in front of a slow backing store.
///
/// All reads go through [`cached_fetch`](Self::cached_fetch), which serves values from memory
/// while they are fresh or stale, makes sure concurrent misses of a key share a single fetch, and
/// falls back to the last durable snapshot when the backing store fails.
///
/// Clones share the same cache. A `Cacher` is meant to be created once per process, usually via
/// [`Caches::cacher`](super::Caches::cacher).
pub struct Cacher<T, E = FetchError> {
    inner: Arc<CacherInner<T, E>>,
}

impl<T, E> Clone for Cacher<T, E> {
    fn clone(&self) -> Self {
        // https://github.com/rust-lang/rust/issues/26925
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E> fmt::Debug for Cacher<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cacher")
            .field("name", &self.inner.name)
            .field("options", &self.inner.options)
            .field("store", &self.inner.store)
            .field("flights", &self.inner.flights)
            .finish()
    }
}

/// The outcome of the synchronous part of a lookup.
enum Step<T, E, F> {
    /// Memory had a fresh or stale value.
    Cached(CacheResult<T>),
    /// Another caller's operation is in flight. The fetcher was not used.
    Joined(Flight<T, E>, F),
    /// A new fetch was registered with the fetcher.
    Started(Flight<T, E>),
}

impl<T, E> Cacher<T, E>
where
    T: Collection,
    E: Error + Clone + Send + Sync + 'static,
{
    pub fn new(name: impl Into<Arc<str>>, options: FetchOptions, snapshots: Snapshots) -> Self {
        Self {
            inner: Arc::new(CacherInner {
                name: name.into(),
                options,
                store: CacheStore::new(),
                flights: InFlightRegistry::new(),
                snapshots,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The default windows of this cache.
    pub fn options(&self) -> FetchOptions {
        self.inner.options
    }

    /// Looks `key` up in memory only.
    pub fn get(&self, key: impl Into<CacheKey>) -> Option<CacheResult<T>> {
        self.inner.store.get(&key.into())
    }

    /// Stores `value` with the default windows of this cache.
    pub fn set(&self, key: impl Into<CacheKey>, value: T) {
        self.set_with(key, value, self.inner.options)
    }

    pub fn set_with(&self, key: impl Into<CacheKey>, value: T, options: FetchOptions) {
        self.inner
            .store
            .set(key.into(), value, options.ttl, options.stale_window);
    }

    /// Forgets the cached value of `key` and any operation in flight for it.
    ///
    /// This has to be called after every write to the backing store that affects `key`. An
    /// operation that is still running when its record is cleared does not write its result
    /// into the cache, so the next lookup starts a new fetch. Lookups that are falling back to
    /// a snapshot still return it, but do not put it back into memory.
    pub fn invalidate(&self, key: impl Into<CacheKey>) {
        let key = key.into();
        let mut flights = self.inner.flights.lock();
        self.inner.store.invalidate(&key);
        if let Some(flight) = flights.invalidate(&key) {
            tracing::debug!(
                cache = self.name(),
                %key,
                kind = flight.kind().as_str(),
                "Invalidated in-flight operation",
            );
        }
    }

    /// Whether a fetch or revalidation of `key` is currently running.
    pub fn is_in_flight(&self, key: impl Into<CacheKey>) -> bool {
        self.inner.flights.has(&key.into())
    }

    /// Returns the value of `key`, using the default windows of this cache.
    ///
    /// See [`cached_fetch_with`](Self::cached_fetch_with).
    pub async fn cached_fetch<F, Fut>(
        &self,
        key: impl Into<CacheKey>,
        fetcher: F,
    ) -> Result<CacheResult<T>, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.cached_fetch_with(key, self.inner.options, fetcher)
            .await
    }

    /// Returns the value of `key`.
    ///
    /// - A fresh value is returned right away as [`Hit`](CacheStatus::Hit).
    /// - A stale value is returned right away as [`Stale`](CacheStatus::Stale). Unless an
    ///   operation for `key` is already in flight, `fetcher` is spawned in the background to
    ///   refresh it.
    /// - Otherwise the value is fetched as [`Miss`](CacheStatus::Miss). If another caller is
    ///   already fetching `key`, this waits for that fetch instead of calling `fetcher`.
    ///
    /// Fetched values are stored with the windows in `options` and written to the volatile
    /// snapshot tier.
    ///
    /// # Errors
    ///
    /// If the fetch fails, the last usable snapshot of `key` is returned as
    /// [`PersistentStale`](CacheStatus::PersistentStale) and put back into memory. The error of the
    /// fetch is only returned when there is no such snapshot either.
    pub async fn cached_fetch_with<F, Fut>(
        &self,
        key: impl Into<CacheKey>,
        options: FetchOptions,
        fetcher: F,
    ) -> Result<CacheResult<T>, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let key = key.into();
        let name = self.name();
        metric!(counter("caches.access") += 1, "cache" => name);

        // snapshots only go back into memory if `key` is not invalidated during this lookup
        let generation = self.inner.flights.generation(&key);
        let mut fetcher = fetcher;
        loop {
            match self.begin(&key, options, fetcher) {
                Step::Cached(result) => {
                    metric!(
                        counter("caches.memory.hit") += 1,
                        "cache" => name,
                        "status" => result.status.as_str(),
                    );
                    return Ok(result);
                }
                Step::Started(flight) => {
                    let Some(result) = flight.wait().await else {
                        // The fetcher was ours, so its panic is ours as well.
                        panic!("fetch of `{key}` in cache `{name}` was abandoned");
                    };
                    return self.settle(&key, generation, options, result).await;
                }
                Step::Joined(flight, unused) => {
                    metric!(
                        counter("caches.flight.joined") += 1,
                        "cache" => name,
                        "kind" => flight.kind().as_str(),
                    );
                    let id = flight.id();
                    match flight.wait().await {
                        Some(result) => {
                            return self.settle(&key, generation, options, result).await;
                        }
                        None => {
                            tracing::warn!(cache = name, %key, "In-flight operation was abandoned");
                            self.inner.flights.clear_flight(&key, id);
                            fetcher = unused;
                        }
                    }
                }
            }
        }
    }

    /// Checks memory and the in-flight records, and registers a new operation if needed.
    ///
    /// This runs under the registry lock and never suspends, so two callers can not both see
    /// `key` as absent and both start a fetch.
    fn begin<F, Fut>(&self, key: &CacheKey, options: FetchOptions, fetcher: F) -> Step<T, E, F>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let mut spawn = None;
        let step = {
            let mut flights = self.inner.flights.lock();
            match self.inner.store.get(key) {
                Some(result) => {
                    if result.status == CacheStatus::Stale {
                        if flights.has(key) {
                            metric!(counter("caches.revalidation.skipped") += 1, "cache" => self.name());
                        } else {
                            let kind = FlightKind::Revalidation;
                            let (_, task) = self.create_flight(&mut flights, key, kind, options, fetcher);
                            spawn = Some(task);
                        }
                    }
                    Step::Cached(result)
                }
                None => match flights.get(key) {
                    Some(flight) => Step::Joined(flight, fetcher),
                    None => {
                        let kind = FlightKind::Fetch;
                        let (flight, task) = self.create_flight(&mut flights, key, kind, options, fetcher);
                        spawn = Some(task);
                        Step::Started(flight)
                    }
                },
            }
        };

        // Spawned outside the lock, a task dropped right away clears its own record.
        if let Some(task) = spawn {
            tokio::spawn(task);
        }
        step
    }

    /// Registers an operation for `key` and creates the task running it.
    ///
    /// The task calls `fetcher`, commits a successful result and settles the flight. If it is
    /// dropped before that, it clears its record so that the next caller starts over.
    fn create_flight<F, Fut>(
        &self,
        flights: &mut Registrations<'_, T, E>,
        key: &CacheKey,
        kind: FlightKind,
        options: FetchOptions,
        fetcher: F,
    ) -> (Flight<T, E>, BoxFuture<'static, ()>)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let (flight, completion) = flights.register(key.clone(), kind);
        let id = flight.id();
        tracing::debug!(cache = self.name(), %key, kind = kind.as_str(), "Starting {}", kind.as_str());

        let abandon_token = {
            let inner = Arc::clone(&self.inner);
            let key = key.clone();
            defer(move || {
                if inner.flights.clear_flight(&key, id) {
                    tracing::error!(cache = &*inner.name, %key, "In-flight operation abandoned");
                }
            })
        };

        let inner = Arc::clone(&self.inner);
        let key = key.clone();
        let task = async move {
            let abandon_token = abandon_token; // move into the future

            let start = Instant::now();
            let result = fetcher().await;
            let outcome = if result.is_ok() { "ok" } else { "error" };
            metric!(
                counter("caches.fetch") += 1,
                "cache" => &*inner.name,
                "kind" => kind.as_str(),
                "result" => outcome,
            );
            metric!(
                timer("caches.fetch.duration") = start.elapsed(),
                "cache" => &*inner.name,
                "kind" => kind.as_str(),
                "result" => outcome,
            );

            match &result {
                Ok(value) => inner.commit(&key, id, kind, options, value).await,
                Err(error) => inner.discard(&key, id, kind, error),
            }

            abandon_token.disarm();
            completion.complete(result);
        }
        // Revalidations outlive the request that triggered them, so give them their own hub.
        .bind_hub(Hub::new_from_top(Hub::current()));

        (flight, Box::pin(task))
    }

    /// Turns the result of a fetch into the result of a lookup.
    async fn settle(
        &self,
        key: &CacheKey,
        generation: u64,
        options: FetchOptions,
        result: Result<T, E>,
    ) -> Result<CacheResult<T>, E> {
        match result {
            Ok(value) => Ok(CacheResult::new(value, CacheStatus::Miss)),
            Err(error) => self.fall_back(key, generation, options, error).await,
        }
    }

    /// Serves the last usable snapshot of `key` after a failed fetch.
    ///
    /// The snapshot is put back into memory unless a live value was stored meanwhile, or `key`
    /// was invalidated since `generation`.
    async fn fall_back(
        &self,
        key: &CacheKey,
        generation: u64,
        options: FetchOptions,
        error: E,
    ) -> Result<CacheResult<T>, E> {
        let name = self.name();

        let Some(LoadedSnapshot { value, tier }) = self.inner.snapshots.load::<T>(key).await else {
            metric!(counter("caches.snapshot.miss") += 1, "cache" => name);
            metric!(counter("caches.exhausted") += 1, "cache" => name);
            tracing::warn!(
                error = &error as &dyn Error,
                cache = name,
                %key,
                "Fetch failed and no snapshot is available",
            );
            return Err(error);
        };

        metric!(counter("caches.snapshot.hit") += 1, "cache" => name, "tier" => tier.as_str());
        tracing::warn!(
            error = &error as &dyn Error,
            cache = name,
            %key,
            %tier,
            "Fetch failed, serving snapshot",
        );

        {
            let flights = self.inner.flights.lock();
            if flights.generation(key) != generation {
                tracing::debug!(cache = name, %key, "Not promoting snapshot of invalidated key");
            } else if !self.inner.store.promote(
                key,
                value.clone(),
                options.ttl,
                options.stale_window,
            ) {
                tracing::debug!(cache = name, %key, "Not promoting snapshot over a live value");
            }
        }

        Ok(CacheResult::new(value, CacheStatus::PersistentStale))
    }
}

impl<T, E> CacherInner<T, E>
where
    T: Collection,
    E: Error + Clone + Send + Sync + 'static,
{
    /// Stores a fetched value, unless the operation was invalidated in the meantime.
    ///
    /// Storing the value and clearing the record happen under the registry lock. The value is
    /// then written to the volatile snapshot tier before it is handed out.
    async fn commit(
        &self,
        key: &CacheKey,
        id: u64,
        kind: FlightKind,
        options: FetchOptions,
        value: &T,
    ) {
        let committed = {
            let mut flights = self.flights.lock();
            let current = flights.clear_flight(key, id);
            if current {
                self.store
                    .set(key.clone(), value.clone(), options.ttl, options.stale_window);
            }
            current
        };

        if !committed {
            tracing::debug!(
                cache = &*self.name,
                %key,
                kind = kind.as_str(),
                "Discarding result of invalidated operation",
            );
            return;
        }

        let written = self.snapshots.persist(key, value).await;
        metric!(
            counter("caches.snapshot.write") += 1,
            "cache" => &*self.name,
            "result" => if written { "written" } else { "skipped" },
        );
    }

    /// Clears the record of a failed operation.
    ///
    /// A stale value that was being revalidated stays in place until it expires.
    fn discard(&self, key: &CacheKey, id: u64, kind: FlightKind, error: &E) {
        self.flights.clear_flight(key, id);

        match kind {
            FlightKind::Revalidation => tracing::warn!(
                error = error as &dyn Error,
                cache = &*self.name,
                %key,
                "Revalidation failed, keeping stale value",
            ),
            FlightKind::Fetch => tracing::debug!(
                error = error as &dyn Error,
                cache = &*self.name,
                %key,
                "Fetch failed",
            ),
        }
    }
}
