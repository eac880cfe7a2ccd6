//! The cache state machine.
//!
//! An [`EagerCache`] holds a single value. The value is produced by a [`Loader`] and discarded
//! through an [`Invalidator`], and every change of the cache's [`CacheState`] is broadcast to
//! whoever is waiting on it.
//!
//! There are no locks held across suspension points. The cache state lives in a [`watch`]
//! channel, and each operation performs a single atomic read-modify-write on it. Everything
//! else is a reaction to the state changes published by that channel: readers wait for the
//! next change and re-evaluate, and a running load watches for invalidations and restarts
//! itself once one completes.
//!
//! Every load is tagged with a generation. When a load finishes after its generation has been
//! superseded (because the cache was invalidated and reloaded in the meantime), its result is
//! thrown away instead of overwriting the fresher state.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use futures::future::{self, BoxFuture};
use tokio::sync::{broadcast, watch};
use tracing::Instrument;

use crate::collaborator::{Invalidator, Loader, NoopInvalidator, Timeout};
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::state::{CacheEvent, CacheState};


/// Number of lifecycle events buffered per subscriber before it starts lagging.
const EVENT_CAPACITY: usize = 64;

/// Everything that changes on a transition.
struct Slot<V> {
    state: CacheState,
    /// Only `Some` while `state` is `Ready`.
    value: Option<Arc<V>>,
    /// Bumped once for every load that is started.
    generation: u64,
    /// The error that most recently moved the cache into `Failed`.
    failure: Option<CacheError>,
    /// Bumped on every transition into `Failed`.
    ///
    /// Waiters only see the latest state, which may have moved on from `Failed` by the time they
    /// wake up. Comparing this counter tells them a failure happened while they were waiting.
    failures: u64,
}

impl<V> Slot<V> {
    fn new() -> Self {
        Self {
            state: CacheState::Invalid,
            value: None,
            generation: 0,
            failure: None,
            failures: 0,
        }
    }

    /// Moves into `state`, returning `false` if the slot already was in it.
    fn set_state(&mut self, state: CacheState) -> bool {
        if self.state == state {
            return false;
        }
        self.state = state;
        true
    }

    /// Moves into `Failed` because of `error`, returning `false` if the slot already was in it.
    fn fail(&mut self, error: CacheError) -> bool {
        self.value = None;
        if !self.set_state(CacheState::Failed) {
            return false;
        }
        self.failure = Some(error);
        self.failures += 1;
        true
    }
}

struct Shared<V> {
    moniker: String,
    slot: watch::Sender<Slot<V>>,
    events: broadcast::Sender<CacheEvent>,
    loader: Box<dyn Loader<V>>,
    invalidator: Box<dyn Invalidator>,
}

impl<V> Shared<V> {
    /// Applies `f` to the slot under the channel lock.
    ///
    /// `f` returns whether it changed the state. If so, the change is published to all waiters
    /// and event subscribers before the lock is released.
    fn transition(&self, f: impl FnOnce(&mut Slot<V>) -> bool) -> bool {
        self.slot.send_if_modified(|slot| {
            let changed = f(slot);
            if changed {
                self.publish(slot.state, slot.generation);
            }
            changed
        })
    }

    fn publish(&self, state: CacheState, generation: u64) {
        tracing::debug!(cache = %self.moniker, %state, generation, "Setting state");
        metric!(
            counter("eager_cache.transition") += 1,
            "cache" => self.moniker.as_str(),
            "state" => state.as_ref(),
        );
        // Sending only fails if nobody is subscribed.
        self.events.send(CacheEvent::StateChanged(state)).ok();
    }
}

/// A self-healing cache for a single, expensive to compute value.
///
/// Readers call [`get`](Self::get), which hands out the cached value or waits until a fresh one
/// has been loaded. [`invalidate`](Self::invalidate) discards the value; readers arriving
/// afterwards never observe it again, and loads that were running while the invalidation
/// happened are discarded and restarted.
///
/// Handles are cheap to clone, and all clones share the same state.
///
/// Loads and invalidations are spawned onto the current Tokio runtime. Calling
/// [`load`](Self::load) or [`invalidate`](Self::invalidate) outside of a runtime panics.
pub struct EagerCache<V> {
    shared: Arc<Shared<V>>,
}

impl<V> Clone for EagerCache<V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<V> fmt::Debug for EagerCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.shared.slot.borrow();
        f.debug_struct("EagerCache")
            .field("moniker", &self.shared.moniker)
            .field("state", &slot.state)
            .field("generation", &slot.generation)
            .finish()
    }
}

impl<V> EagerCache<V>
where
    V: Send + Sync + 'static,
{
    /// Creates a cache that discards its value without any further cleanup.
    pub fn new(moniker: impl Into<String>, loader: impl Loader<V>) -> Self {
        Self::with_invalidator(moniker, loader, NoopInvalidator)
    }

    /// Creates a cache that runs `invalidator` every time its value is discarded.
    pub fn with_invalidator(
        moniker: impl Into<String>,
        loader: impl Loader<V>,
        invalidator: impl Invalidator,
    ) -> Self {
        Self::from_parts(moniker.into(), Box::new(loader), Box::new(invalidator))
    }

    /// Creates a cache according to `config`.
    ///
    /// The collaborators are wrapped in [`Timeout`] if the corresponding timeouts are configured.
    pub fn from_config(
        config: &CacheConfig,
        loader: impl Loader<V>,
        invalidator: impl Invalidator,
    ) -> Self {
        let loader: Box<dyn Loader<V>> = match config.load_timeout {
            Some(timeout) => Box::new(Timeout::new(loader, timeout)),
            None => Box::new(loader),
        };
        let invalidator: Box<dyn Invalidator> = match config.invalidate_timeout {
            Some(timeout) => Box::new(Timeout::new(invalidator, timeout)),
            None => Box::new(invalidator),
        };
        Self::from_parts(config.moniker.clone(), loader, invalidator)
    }

    fn from_parts(
        moniker: String,
        loader: Box<dyn Loader<V>>,
        invalidator: Box<dyn Invalidator>,
    ) -> Self {
        let (slot, _) = watch::channel(Slot::new());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                moniker,
                slot,
                events,
                loader,
                invalidator,
            }),
        }
    }

    /// The name of this cache, as used in logs and metrics.
    pub fn moniker(&self) -> &str {
        &self.shared.moniker
    }

    /// The current state.
    pub fn state(&self) -> CacheState {
        self.shared.slot.borrow().state
    }

    /// The number of loads started so far.
    pub fn generation(&self) -> u64 {
        self.shared.slot.borrow().generation
    }

    /// Subscribes to the lifecycle events of this cache.
    ///
    /// The receiver sees every event published after this call. A receiver that falls more
    /// than a few dozen events behind skips the oldest ones and gets a
    /// [`Lagged`](broadcast::error::RecvError::Lagged) error.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.shared.events.subscribe()
    }

    /// Starts loading a fresh value.
    ///
    /// This does nothing unless the cache is [`Invalid`](CacheState::Invalid) or
    /// [`Failed`](CacheState::Failed): in every other state a value is either present, already
    /// being loaded, or a load will be started once the running invalidation completes.
    ///
    /// Returns right away. The outcome can be observed through [`get`](Self::get),
    /// [`state`](Self::state) or [`subscribe`](Self::subscribe).
    pub fn load(&self) {
        // Subscribing ahead of the transition makes sure the watcher sees every later change.
        let watcher = self.shared.slot.subscribe();
        let mut generation = 0;
        let started = self.shared.transition(|slot| {
            if !slot.state.can_load() {
                return false;
            }
            slot.generation += 1;
            slot.value = None;
            generation = slot.generation;
            slot.set_state(CacheState::Loading)
        });
        if !started {
            return;
        }

        let computation = catch_unwind(AssertUnwindSafe(|| self.shared.loader.load()))
            .unwrap_or_else(|_| future::err(anyhow::anyhow!("loader panicked")).boxed());
        let span = tracing::debug_span!("load", cache = %self.shared.moniker, generation);

        self.spawn_load_watcher(watcher, generation, span.clone());

        let this = self.clone();
        tokio::spawn(
            async move { this.complete_load(generation, computation).await }.instrument(span),
        );
    }

    /// Reacts to state changes while the load tagged with `generation` is outstanding.
    ///
    /// If an invalidation completes before that load does, the load's result will be discarded,
    /// so a fresh load is started right away.
    fn spawn_load_watcher(
        &self,
        mut watcher: watch::Receiver<Slot<V>>,
        generation: u64,
        span: tracing::Span,
    ) {
        let this = self.clone();
        let task = async move {
            loop {
                let (state, current) = {
                    let slot = watcher.borrow_and_update();
                    (slot.state, slot.generation)
                };
                match state {
                    CacheState::Loading if current == generation => {}
                    CacheState::Ready | CacheState::Loading | CacheState::Failed => return,
                    CacheState::Invalidating => {
                        tracing::trace!("Invalidating state while loading, continuing to wait");
                    }
                    CacheState::Invalid => {
                        tracing::debug!("Invalid state while loading, reloading");
                        this.load();
                        return;
                    }
                }
                if watcher.changed().await.is_err() {
                    return;
                }
            }
        };
        tokio::spawn(task.instrument(span));
    }

    async fn complete_load(
        &self,
        generation: u64,
        computation: BoxFuture<'static, anyhow::Result<V>>,
    ) {
        let start = Instant::now();
        let result = match AssertUnwindSafe(computation).catch_unwind().await {
            Ok(result) => result.map_err(|err| CacheError::from_load_error(&err)),
            Err(_) => Err(CacheError::LoadFailed("loader panicked".into())),
        };

        let mut status = "ok";
        self.shared.transition(|slot| match result {
            Ok(value) if slot.generation == generation && slot.state == CacheState::Loading => {
                slot.value = Some(Arc::new(value));
                slot.set_state(CacheState::Ready)
            }
            Ok(_) => {
                status = "preempted";
                tracing::debug!("Load preempted by invalidation, discarding its result");
                false
            }
            Err(err) => {
                // A failed load is never swallowed, even if it was superseded.
                status = "error";
                tracing::debug!(error = &err as &dyn std::error::Error, "Failed to load");
                slot.fail(err)
            }
        });

        metric!(
            timer("eager_cache.load.duration") = start.elapsed(),
            "cache" => self.shared.moniker.as_str(),
            "status" => status,
        );
    }

    /// Returns the cached value, loading it first if necessary.
    ///
    /// Resolves immediately while the cache is [`Ready`](CacheState::Ready). Otherwise a load is
    /// started if none is running, and the call waits for state changes until a value is
    /// available. Any number of concurrent readers are served by the same load.
    ///
    /// # Errors
    ///
    /// If the cache moves into [`Failed`](CacheState::Failed) while waiting, the error that
    /// caused it is returned. The cache stays usable; the next call retries the load.
    pub async fn get(&self) -> Result<Arc<V>, CacheError> {
        let mut receiver = self.shared.slot.subscribe();
        let mut failures = None;

        loop {
            let state = {
                let slot = receiver.borrow_and_update();
                // A failure while waiting rejects this call, even if a retry has started since.
                if slot.failures != *failures.get_or_insert(slot.failures) {
                    return Err(slot.failure.clone().unwrap_or_else(|| {
                        CacheError::Inconsistent("failed without an error".into())
                    }));
                }
                match (slot.state, &slot.value) {
                    (CacheState::Ready, Some(value)) => return Ok(Arc::clone(value)),
                    (CacheState::Ready, None) => {
                        return Err(CacheError::Inconsistent("ready without a value".into()));
                    }
                    (state, _) => state,
                }
            };

            if state.can_load() {
                tracing::debug!(
                    cache = %self.shared.moniker,
                    %state,
                    "Loading and waiting for state change",
                );
                self.load();
            } else {
                tracing::trace!(cache = %self.shared.moniker, %state, "Waiting for state change");
            }

            if receiver.changed().await.is_err() {
                return Err(CacheError::Inconsistent(format!(
                    "stopped receiving state changes while {state}"
                )));
            }
        }
    }

    /// Discards the cached value.
    ///
    /// This does nothing if the cache is already [`Invalid`](CacheState::Invalid) or
    /// [`Invalidating`](CacheState::Invalidating). Otherwise the value stops being served right
    /// away, the invalidator runs, and the cache becomes [`Invalid`](CacheState::Invalid).
    ///
    /// Returns right away. If the invalidator fails, the cache moves into
    /// [`Failed`](CacheState::Failed) and a [`CacheEvent::InvalidateFailed`] event is published.
    pub fn invalidate(&self) {
        let started = self.shared.transition(|slot| {
            !slot.state.is_invalidated() && slot.set_state(CacheState::Invalidating)
        });
        if !started {
            tracing::trace!(cache = %self.shared.moniker, "Already invalidated");
            return;
        }

        let cleanup = catch_unwind(AssertUnwindSafe(|| self.shared.invalidator.invalidate()))
            .unwrap_or_else(|_| future::err(anyhow::anyhow!("invalidator panicked")).boxed());
        let span = tracing::debug_span!("invalidate", cache = %self.shared.moniker);

        let this = self.clone();
        tokio::spawn(async move { this.complete_invalidate(cleanup).await }.instrument(span));
    }

    async fn complete_invalidate(&self, cleanup: BoxFuture<'static, anyhow::Result<()>>) {
        let result = match AssertUnwindSafe(cleanup).catch_unwind().await {
            Ok(result) => result.map_err(|err| CacheError::from_invalidate_error(&err)),
            Err(_) => Err(CacheError::InvalidateFailed("invalidator panicked".into())),
        };

        let shared = &self.shared;
        match result {
            Ok(()) => {
                metric!(
                    counter("eager_cache.invalidate") += 1,
                    "cache" => shared.moniker.as_str(),
                    "status" => "ok",
                );
                shared.transition(|slot| {
                    slot.value = None;
                    slot.set_state(CacheState::Invalid)
                });
            }
            Err(err) => {
                metric!(
                    counter("eager_cache.invalidate") += 1,
                    "cache" => shared.moniker.as_str(),
                    "status" => "error",
                );
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "Failed to invalidate cache",
                );
                // The failure event goes out under the same lock, right after the state change.
                shared.slot.send_if_modified(|slot| {
                    let changed = slot.fail(err.clone());
                    if changed {
                        shared.publish(slot.state, slot.generation);
                    }
                    shared.events.send(CacheEvent::InvalidateFailed(err)).ok();
                    changed
                });
            }
        }
    }
}
