use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use parking_lot::{Mutex, MutexGuard};

use super::CacheKey;

type FlightChannel<T, E> = Shared<oneshot::Receiver<Result<T, E>>>;

/// Why an operation is in flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlightKind {
    /// A caller found nothing usable in memory and is waiting for the result.
    Fetch,
    /// A stale value was served and is being refreshed in the background.
    Revalidation,
}

impl FlightKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Revalidation => "revalidation",
        }
    }
}

/// A handle to a pending operation that any number of callers can wait on.
pub struct Flight<T, E> {
    id: u64,
    kind: FlightKind,
    channel: FlightChannel<T, E>,
}

impl<T: Clone, E: Clone> Clone for Flight<T, E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            kind: self.kind,
            channel: self.channel.clone(),
        }
    }
}

impl<T, E> fmt::Debug for Flight<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flight")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl<T: Clone, E: Clone> Flight<T, E> {
    /// Identifies this registration. Ids are never reused within a registry.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> FlightKind {
        self.kind
    }

    /// Waits for the operation to settle.
    ///
    /// Returns `None` if the operation was abandoned without producing a result, which happens
    /// when it panics or its runtime shuts down.
    pub async fn wait(self) -> Option<Result<T, E>> {
        self.channel.await.ok()
    }
}

/// The producing side of a [`Flight`].
#[must_use = "waiters of the flight only wake up once it is completed"]
pub struct Completion<T, E> {
    sender: oneshot::Sender<Result<T, E>>,
}

impl<T, E> Completion<T, E> {
    /// Hands `result` to everyone waiting on the flight.
    pub fn complete(self, result: Result<T, E>) {
        // nobody waiting is fine, revalidations usually have no waiters
        self.sender.send(result).ok();
    }
}

/// Process-lifetime map of pending operations, at most one per key.
///
/// The registry also counts how often each key was invalidated. Work that started before an
/// invalidation compares [`generation`](Self::generation)s to find out it is outdated.
///
/// All methods lock the registry for their duration only. Use [`lock`](Self::lock) to run
/// several steps atomically.
pub struct InFlightRegistry<T, E> {
    next_id: AtomicU64,
    state: Mutex<State<T, E>>,
}

struct State<T, E> {
    flights: BTreeMap<CacheKey, Flight<T, E>>,
    generations: BTreeMap<CacheKey, u64>,
}

impl<T, E> fmt::Debug for InFlightRegistry<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flights = self.state.try_lock().map(|s| s.flights.len()).unwrap_or_default();
        f.debug_struct("InFlightRegistry")
            .field("flights", &flights)
            .finish()
    }
}

impl<T: Clone, E: Clone> Default for InFlightRegistry<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone, E: Clone> InFlightRegistry<T, E> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            state: Mutex::new(State {
                flights: BTreeMap::new(),
                generations: BTreeMap::new(),
            }),
        }
    }

    /// Locks the registry.
    ///
    /// The guard must not be held across an `.await`.
    pub fn lock(&self) -> Registrations<'_, T, E> {
        Registrations {
            next_id: &self.next_id,
            state: self.state.lock(),
        }
    }

    pub fn has(&self, key: &CacheKey) -> bool {
        self.lock().has(key)
    }

    /// Removes the record of `key` if it still belongs to the registration `id`.
    pub fn clear_flight(&self, key: &CacheKey, id: u64) -> bool {
        self.lock().clear_flight(key, id)
    }

    /// How often `key` was invalidated so far.
    pub fn generation(&self, key: &CacheKey) -> u64 {
        self.lock().generation(key)
    }
}

/// A locked [`InFlightRegistry`].
pub struct Registrations<'a, T, E> {
    next_id: &'a AtomicU64,
    state: MutexGuard<'a, State<T, E>>,
}

impl<T: Clone, E: Clone> Registrations<'_, T, E> {
    pub fn has(&self, key: &CacheKey) -> bool {
        self.state.flights.contains_key(key)
    }

    pub fn get(&self, key: &CacheKey) -> Option<Flight<T, E>> {
        self.state.flights.get(key).cloned()
    }

    /// Records a new pending operation for `key`.
    ///
    /// Returns the handle to wait on and the [`Completion`] to settle it with. There must not be
    /// a record for `key` yet.
    pub fn register(&mut self, key: CacheKey, kind: FlightKind) -> (Flight<T, E>, Completion<T, E>) {
        let (sender, receiver) = oneshot::channel();
        let flight = Flight {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            kind,
            channel: receiver.shared(),
        };

        let evicted = self.state.flights.insert(key, flight.clone());
        debug_assert!(evicted.is_none());

        (flight, Completion { sender })
    }

    pub fn clear(&mut self, key: &CacheKey) -> Option<Flight<T, E>> {
        self.state.flights.remove(key)
    }

    /// Clears the record of `key` and starts a new generation for it.
    pub fn invalidate(&mut self, key: &CacheKey) -> Option<Flight<T, E>> {
        *self.state.generations.entry(key.clone()).or_default() += 1;
        self.clear(key)
    }

    pub fn generation(&self, key: &CacheKey) -> u64 {
        self.state.generations.get(key).copied().unwrap_or_default()
    }

    pub fn clear_flight(&mut self, key: &CacheKey, id: u64) -> bool {
        if self.is_current(key, id) {
            self.state.flights.remove(key);
            true
        } else {
            false
        }
    }

    /// Whether the record of `key` belongs to the registration `id`.
    ///
    /// This is `false` once the record was cleared, even if the operation is still running.
    pub fn is_current(&self, key: &CacheKey, id: u64) -> bool {
        self.state.flights.get(key).is_some_and(|flight| flight.id == id)
    }
}
