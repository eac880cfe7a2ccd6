use std::time::Duration;

use thiserror::Error;

/// An error handed out by an [`EagerCache`](crate::EagerCache).
///
/// Errors are stored in the cache and cloned to every reader waiting on the failed transition,
/// which is why the underlying collaborator errors are kept as rendered strings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The loader failed to produce a value.
    ///
    /// The attached string contains the loader's error, including its causes.
    #[error("failed to load: {0}")]
    LoadFailed(String),
    /// The invalidator failed.
    ///
    /// The attached string contains the invalidator's error, including its causes.
    #[error("failed to invalidate: {0}")]
    InvalidateFailed(String),
    /// A collaborator wrapped in a [`Timeout`](crate::Timeout) did not finish in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// A reader observed a state it cannot make progress from.
    #[error("inconsistent cache state: {0}")]
    Inconsistent(String),
}

impl CacheError {
    /// Converts a loader error into a `CacheError`.
    ///
    /// Timeouts raised by the [`Timeout`](crate::Timeout) adapter are passed through as they are.
    pub(crate) fn from_load_error(err: &anyhow::Error) -> Self {
        Self::from_collaborator_error(err, Self::LoadFailed)
    }

    /// Converts an invalidator error into a `CacheError`.
    pub(crate) fn from_invalidate_error(err: &anyhow::Error) -> Self {
        Self::from_collaborator_error(err, Self::InvalidateFailed)
    }

    fn from_collaborator_error(err: &anyhow::Error, wrap: fn(String) -> Self) -> Self {
        match err.downcast_ref::<Self>() {
            Some(timeout @ Self::Timeout(_)) => timeout.clone(),
            _ => wrap(format!("{err:#}")),
        }
    }
}
