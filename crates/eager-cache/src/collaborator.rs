//! The capabilities an [`EagerCache`](crate::EagerCache) is built from.
//!
//! The cache does not know how its value is produced or what has to happen upstream before it
//! may be thrown away. Both are supplied by the embedder as a [`Loader`] and an
//! [`Invalidator`]. Plain closures returning a future implement either trait.

use std::future::Future;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::error::CacheError;

/// Produces the value held by an [`EagerCache`](crate::EagerCache).
pub trait Loader<V>: Send + Sync + 'static {
    /// Starts computing a fresh value.
    ///
    /// This is invoked exactly once per load attempt, at the moment the cache transitions into
    /// [`Loading`](crate::CacheState::Loading). Anything the computation depends on should be
    /// captured here rather than when the returned future is first polled.
    fn load(&self) -> BoxFuture<'static, anyhow::Result<V>>;
}

impl<V, F, Fut> Loader<V> for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
{
    fn load(&self) -> BoxFuture<'static, anyhow::Result<V>> {
        self().boxed()
    }
}

/// Performs whatever cleanup is needed before a cached value may be discarded.
pub trait Invalidator: Send + Sync + 'static {
    /// Starts the cleanup. Invoked once per invalidation that passes the cache's guard.
    fn invalidate(&self) -> BoxFuture<'static, anyhow::Result<()>>;
}

impl<F, Fut> Invalidator for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn invalidate(&self) -> BoxFuture<'static, anyhow::Result<()>> {
        self().boxed()
    }
}

/// An [`Invalidator`] that always succeeds right away.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopInvalidator;

impl Invalidator for NoopInvalidator {
    fn invalidate(&self) -> BoxFuture<'static, anyhow::Result<()>> {
        futures::future::ready(Ok(())).boxed()
    }
}

/// Bounds the runtime of a [`Loader`] or [`Invalidator`].
///
/// When the deadline passes, the wrapped computation is dropped and the call fails with
/// [`CacheError::Timeout`].
#[derive(Debug, Clone)]
pub struct Timeout<T> {
    inner: T,
    timeout: Duration,
}

impl<T> Timeout<T> {
    pub fn new(inner: T, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

async fn with_timeout<T>(
    timeout: Duration,
    future: BoxFuture<'static, anyhow::Result<T>>,
) -> anyhow::Result<T> {
    tokio::time::timeout(timeout, future)
        .await
        .unwrap_or_else(|_| Err(CacheError::Timeout(timeout).into()))
}

impl<V, L> Loader<V> for Timeout<L>
where
    V: Send + 'static,
    L: Loader<V>,
{
    fn load(&self) -> BoxFuture<'static, anyhow::Result<V>> {
        with_timeout(self.timeout, self.inner.load()).boxed()
    }
}

impl<I: Invalidator> Invalidator for Timeout<I> {
    fn invalidate(&self) -> BoxFuture<'static, anyhow::Result<()>> {
        with_timeout(self.timeout, self.inner.invalidate()).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timeout_elapses() {
        let loader = Timeout::new(
            || async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, anyhow::Error>(1)
            },
            Duration::from_millis(50),
        );

        let result: anyhow::Result<i32> = loader.load().await;
        let err = result.unwrap_err();
        assert_eq!(
            err.downcast_ref::<CacheError>(),
            Some(&CacheError::Timeout(Duration::from_millis(50)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_passes_result() {
        let invalidator = Timeout::new(
            || async { Err::<(), _>(anyhow::anyhow!("upstream refused")) },
            Duration::from_secs(1),
        );
        let err = invalidator.invalidate().await.unwrap_err();
        assert_eq!(err.to_string(), "upstream refused");

        let loader = Timeout::new(
            || async { Ok::<_, anyhow::Error>("fresh") },
            Duration::from_secs(1),
        );
        let result: anyhow::Result<&str> = loader.load().await;
        assert_eq!(result.unwrap(), "fresh");
    }

    #[tokio::test]
    async fn test_noop_invalidator() {
        assert!(NoopInvalidator.invalidate().await.is_ok());
    }
}
