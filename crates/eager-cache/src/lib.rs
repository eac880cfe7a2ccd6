//! A self-healing asynchronous cache for a single value.
//!
//! The [`EagerCache`] holds one value that is expensive to compute and serves it to any number
//! of concurrent readers. The value is produced by a [`Loader`], and can be discarded at any
//! time with [`EagerCache::invalidate`]. Readers never observe a half-finished refresh, nor a
//! value that was invalidated before they asked for it.
//!
//! ```ignore
//! let cache = EagerCache::new("states", || async { fetch_states().await });
//!
//! let states = cache.get().await?;
//! // upstream changed
//! cache.invalidate();
//! let fresh_states = cache.get().await?;
//! ```

#[macro_use]
pub mod metrics;

mod cache;
mod collaborator;
pub mod config;
mod error;
pub mod logging;
mod state;


pub use cache::EagerCache;
pub use collaborator::{Invalidator, Loader, NoopInvalidator, Timeout};
pub use config::CacheConfig;
pub use error::CacheError;
pub use state::{CacheEvent, CacheState};
