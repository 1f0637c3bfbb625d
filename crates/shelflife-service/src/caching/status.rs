use std::fmt;

use serde::{Deserialize, Serialize};

/// Name of the response header collaborators use to surface a [`CacheStatus`].
pub const STATUS_HEADER: &str = "X-Cache-Status";

/// Where the value of a [`CacheResult`] came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheStatus {
    /// Served from memory within its TTL.
    Hit,
    /// Served from memory past its TTL but within the stale window. A background refresh has been
    /// started, or one was already running.
    Stale,
    /// Freshly fetched from the backing store.
    Miss,
    /// The backing store failed and the value was recovered from a durable snapshot.
    PersistentStale,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Stale => "STALE",
            Self::Miss => "MISS",
            Self::PersistentStale => "PERSISTENT_STALE",
        }
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value together with the [`CacheStatus`] describing how it was obtained.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CacheResult<T> {
    pub value: T,
    pub status: CacheStatus,
}

impl<T> CacheResult<T> {
    pub fn new(value: T, status: CacheStatus) -> Self {
        Self { value, status }
    }
}
