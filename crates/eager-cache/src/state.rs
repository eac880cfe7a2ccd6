use std::fmt;

use crate::error::CacheError;

/// The lifecycle state of an [`EagerCache`](crate::EagerCache).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheState {
    /// No value is cached and none is being computed.
    Invalid,
    /// The invalidator is running. The previous value is no longer served.
    Invalidating,
    /// The loader is running.
    Loading,
    /// A value is cached and is handed out to readers.
    Ready,
    /// The last load or invalidation failed.
    Failed,
}

impl CacheState {
    /// Whether a new load may be started from this state.
    pub fn can_load(self) -> bool {
        matches!(self, Self::Invalid | Self::Failed)
    }

    /// Whether an invalidation has already completed or is underway.
    ///
    /// Calling [`invalidate`](crate::EagerCache::invalidate) in one of these states is a no-op.
    pub fn is_invalidated(self) -> bool {
        matches!(self, Self::Invalid | Self::Invalidating)
    }
}

impl AsRef<str> for CacheState {
    fn as_ref(&self) -> &str {
        match self {
            Self::Invalid => "invalid",
            Self::Invalidating => "invalidating",
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

/// A lifecycle notification published by an [`EagerCache`](crate::EagerCache).
///
/// Receivers are obtained with [`EagerCache::subscribe`](crate::EagerCache::subscribe).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// The cache moved into a new state.
    StateChanged(CacheState),
    /// The invalidator failed.
    ///
    /// This is published right after the corresponding
    /// [`StateChanged(Failed)`](CacheState::Failed) event. It is the only way invalidation
    /// failures are reported, since `invalidate` does not return a result.
    InvalidateFailed(CacheError),
}
