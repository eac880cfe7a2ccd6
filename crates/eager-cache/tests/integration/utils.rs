use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("eager_cache=debug"))
        .with_target(false)
        .with_test_writer()
        .try_init()
        .ok();
}

/// A stand-in for the upstream data a cache is derived from.
///
/// Every load reads the version that is current at the time the load is started.
#[derive(Clone, Default)]
pub struct Upstream {
    version: Arc<AtomicU64>,
    loads: Arc<AtomicUsize>,
}

impl Upstream {
    /// Publishes a new upstream version and returns it.
    pub fn bump(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// A loader closure that takes `delay` to derive a value from this upstream.
    pub fn loader(
        &self,
        delay: Duration,
    ) -> impl Fn() -> futures::future::BoxFuture<'static, anyhow::Result<u64>> + Send + Sync + 'static
    {
        let upstream = self.clone();
        move || {
            upstream.loads.fetch_add(1, Ordering::SeqCst);
            let version = upstream.version.load(Ordering::SeqCst);
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                Ok(version)
            })
        }
    }
}
