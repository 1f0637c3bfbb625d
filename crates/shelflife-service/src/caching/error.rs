use std::time::Duration;

use thiserror::Error;

/// Why the backing store could not produce a value.
///
/// This is the default error type of a [`Cacher`](super::Cacher). It is `Clone` so that every
/// caller waiting on the same in-flight fetch receives the same error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The backing store could not be reached or answered with a server error.
    ///
    /// The attached string contains the backing store's response.
    #[error("backing store unavailable: {0}")]
    Unavailable(String),
    /// The backing store rejected the request because a read quota is exhausted.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    /// The fetch itself gave up after the given time.
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    /// The backing store answered, but the response could not be turned into a collection.
    #[error("malformed response: {0}")]
    Malformed(String),
    /// An unexpected error in the cache itself.
    #[error("internal error")]
    InternalError,
}

impl FetchError {
    /// Whether the backing store is degraded, rather than the request being wrong.
    ///
    /// Callers that end up with such an error after every fallback was exhausted should answer
    /// with a "service unavailable" kind of response.
    pub fn is_degraded(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::QuotaExceeded(_) | Self::Timeout(_)
        )
    }
}
