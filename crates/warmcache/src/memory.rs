use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::{self, BoxFuture, FutureExt, Shared, TryFutureExt};
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;

use crate::cache_key::CacheKey;
use crate::descriptor::CacheDescriptor;
use crate::metrics::{CacheStats, LocalStats};
use crate::reload::{ReloadState, ReloadStateCell};
use crate::shared_cache::SharedTier;
use crate::store::EntryStore;
use crate::value::{CacheValue, ComputationError};

/// The result of a running computation, shared by everyone waiting on it.
type ComputationChannel<V, E> = Shared<oneshot::Receiver<Result<V, E>>>;

pub(crate) struct CacherInner<V, E> {
    descriptor: Arc<CacheDescriptor>,
    store: EntryStore<V>,
    /// The currently running computations, at most one per key.
    current_computations: Mutex<HashMap<CacheKey, ComputationChannel<V, E>>>,
    shared_tier: Option<SharedTier<V>>,
    stats: LocalStats,
    state: ReloadStateCell,
}

impl<V, E> CacherInner<V, E> {
    fn lock_computations(&self) -> MutexGuard<'_, HashMap<CacheKey, ComputationChannel<V, E>>> {
        self.current_computations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_warm(&self) {
        if self.descriptor.auto_reload {
            self.state.set(ReloadState::Warm);
        }
    }
}

/// Removes a computation from the running ones when it finishes, or when its task panics.
struct RemoveComputationToken<V, E> {
    inner: Arc<CacherInner<V, E>>,
    key: CacheKey,
}

impl<V, E> Drop for RemoveComputationToken<V, E> {
    fn drop(&mut self) {
        self.inner.lock_computations().remove(&self.key);
    }
}

/// Memoizes the results of a single declared computation.
///
/// Every call site resolves a key through [`resolve`](Self::resolve), passing the computation
/// that produces the value. The computation only runs if the value is not in memory, not
/// already being computed by someone else, and not in the shared cache.
///
/// Cloning a [`Cacher`] is cheap, all clones share the same entries.
pub struct Cacher<V, E> {
    inner: Arc<CacherInner<V, E>>,
}

impl<V, E> Clone for Cacher<V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: CacheValue, E> std::fmt::Debug for Cacher<V, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let running = self
            .inner
            .current_computations
            .try_lock()
            .map(|computations| computations.len())
            .unwrap_or_default();
        f.debug_struct("Cacher")
            .field("descriptor", &self.inner.descriptor)
            .field("in-memory items", &self.inner.store.len())
            .field("running computations", &running)
            .field("shared_tier", &self.inner.shared_tier)
            .finish()
    }
}

impl<V: CacheValue, E: ComputationError> Cacher<V, E> {
    /// Creates a cacher that only keeps entries in memory.
    pub fn new(descriptor: Arc<CacheDescriptor>) -> Self {
        let store = EntryStore::new(&descriptor);
        Self::from_parts(descriptor, store, None)
    }

    pub(crate) fn from_parts(
        descriptor: Arc<CacheDescriptor>,
        store: EntryStore<V>,
        shared_tier: Option<SharedTier<V>>,
    ) -> Self {
        Self {
            inner: Arc::new(CacherInner {
                descriptor,
                store,
                current_computations: Mutex::default(),
                shared_tier,
                stats: LocalStats::default(),
                state: ReloadStateCell::default(),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<CacherInner<V, E>> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(inner: &Weak<CacherInner<V, E>>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    /// Removes expired entries every `sweep_interval`, or every `ttl` if that is shorter.
    ///
    /// The task stops once the last clone of this cacher is gone.
    pub(crate) fn spawn_janitor(&self, sweep_interval: Duration, runtime: &tokio::runtime::Handle) {
        let period = sweep_interval
            .min(self.inner.descriptor.ttl)
            .max(Duration::from_millis(1));
        let inner = self.downgrade();

        runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.store.run_pending_tasks();
            }
        });
    }

    /// Returns the value for `key`, computing it with `compute` if necessary.
    ///
    /// This tries the following things in order:
    /// 1. Looks the value up in memory.
    /// 2. Joins a computation for the same key that is already running.
    /// 3. Looks the value up in the shared cache, if the descriptor is distributed.
    /// 4. Runs `compute`.
    ///
    /// Concurrent calls for the same key never run more than one computation, all of them get
    /// the same result. A present result is kept in memory and written to the shared cache.
    /// Absent results and errors are returned as they are, and never kept.
    ///
    /// The computation runs on its own task. It finishes, and its result is kept, even if
    /// every caller waiting on it is dropped.
    ///
    /// # Panics
    ///
    /// Panics if the computation panics.
    pub async fn resolve<F, Fut>(&self, key: CacheKey, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        self.inner.stats.record_access();
        if let Some(value) = self.lookup_memory(&key) {
            return Ok(value);
        }

        self.spawn_computation(key, compute, false).await
    }

    /// Recomputes an evicted entry in the background.
    ///
    /// Unlike [`resolve`](Self::resolve), this never reads from the shared cache, whose copy
    /// was written together with the evicted one, and is not counted as an access. A running
    /// computation for the same key is joined.
    pub(crate) async fn reload<F, Fut>(&self, key: CacheKey, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        if let Some(value) = self.inner.store.get(&key) {
            return Ok(value);
        }

        self.spawn_computation(key, compute, true).await
    }

    /// Spawns the computation as a separate task, unless one is already running for `key`.
    ///
    /// NOTE: This function itself is *not* `async`, because it should eagerly spawn the
    /// computation, even if the returned future is never polled.
    fn spawn_computation<F, Fut>(
        &self,
        key: CacheKey,
        compute: F,
        is_reload: bool,
    ) -> BoxFuture<'static, Result<V, E>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let channel = {
            let mut current_computations = self.inner.lock_computations();
            if let Some(channel) = current_computations.get(&key) {
                tracing::trace!(cache = self.name(), %key, "Joining running computation");
                channel.clone()
            } else {
                // The previous computation may have finished since we looked.
                let finished = if is_reload {
                    self.inner.store.get(&key)
                } else {
                    self.lookup_memory(&key)
                };
                if let Some(value) = finished {
                    return future::ready(Ok(value)).boxed();
                }

                let inner = Arc::clone(&self.inner);
                let computation = Self::lookup_or_compute(inner, key.clone(), compute, is_reload);
                let channel = self.create_channel(key.clone(), computation);
                let evicted = current_computations.insert(key, channel.clone());
                debug_assert!(evicted.is_none());
                channel
            }
        };

        let name = self.name().to_owned();
        channel
            .unwrap_or_else(move |_cancelled| panic!("{name} computation channel dropped"))
            .boxed()
    }

    /// Runs `computation` on a new task and returns a shareable channel of its result.
    fn create_channel<Fut>(&self, key: CacheKey, computation: Fut) -> ComputationChannel<V, E>
    where
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let remove_computation_token = RemoveComputationToken {
            inner: Arc::clone(&self.inner),
            key,
        };

        tokio::spawn(async move {
            let result = computation.await;
            // Drop the token first to evict from the map. This ensures that callers either
            // get a channel that will receive data, or they create a new channel.
            drop(remove_computation_token);
            sender.send(result).ok();
        });

        receiver.shared()
    }

    /// Looks the value up in the shared cache or computes it, and remembers it.
    ///
    /// This does not take care of ensuring the computation only happens once even for
    /// concurrent requests, see the public [`Cacher::resolve`] for this.
    async fn lookup_or_compute<F, Fut>(
        inner: Arc<CacherInner<V, E>>,
        key: CacheKey,
        compute: F,
        is_reload: bool,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let name = inner.descriptor.name.as_str();

        if let Some(tier) = inner.shared_tier.as_ref().filter(|_| !is_reload) {
            if let Some(value) = tier.read_through(&key).await {
                tracing::trace!(cache = name, %key, "Loaded entry from shared cache");
                inner.store.put(key, value.clone());
                inner.mark_warm();
                return Ok(value);
            }
        }

        tracing::trace!(cache = name, %key, "Computing entry");
        inner.stats.record_computation();
        let result = compute().await;

        match &result {
            Ok(value) if value.is_absent() => {
                tracing::trace!(cache = name, %key, "Computation returned no value");
            }
            Ok(value) => {
                inner.store.put(key.clone(), value.clone());
                if let Some(tier) = &inner.shared_tier {
                    tier.write_through(&key, value);
                }
                inner.mark_warm();
            }
            Err(err) => {
                tracing::debug!(cache = name, %key, error = ?err, "Computation failed");
            }
        }
        result
    }

    fn lookup_memory(&self, key: &CacheKey) -> Option<V> {
        let value = self.inner.store.get(key)?;
        self.inner.stats.record_memory_hit();
        if let Some(tier) = &self.inner.shared_tier {
            tier.record_local_hit();
        }
        Some(value)
    }

    /// Returns the value for `key` if it is in memory, without computing anything.
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        self.inner.store.get(key)
    }

    /// Removes the entry for `key`, also from the shared cache.
    ///
    /// This never triggers an automatic reload. Returns whether there was an entry in memory.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let removed = self.inner.store.invalidate(key);
        if let Some(tier) = &self.inner.shared_tier {
            // Completion is of no interest, failures are logged by the service.
            drop(tier.delete(key));
        }
        if self.inner.descriptor.auto_reload {
            self.inner.state.set(ReloadState::Cold);
        }
        removed
    }

    /// Removes all entries from memory.
    ///
    /// The shared cache cannot be enumerated and is left as it is.
    pub fn invalidate_all(&self) {
        self.inner.store.clear();
        if self.inner.descriptor.auto_reload {
            self.inner.state.set(ReloadState::Cold);
        }
    }

    /// The number of entries in memory.
    pub fn len(&self) -> usize {
        self.inner.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.store.is_empty()
    }

    pub fn name(&self) -> &str {
        &self.inner.descriptor.name
    }

    pub fn descriptor(&self) -> &CacheDescriptor {
        &self.inner.descriptor
    }

    /// The shared cache of this descriptor, if it is distributed and a shared cache exists.
    pub fn shared_tier(&self) -> Option<&SharedTier<V>> {
        self.inner.shared_tier.as_ref()
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.stats.snapshot(self.inner.store.evictions())
    }

    /// Applies pending expirations and evictions, reporting them to the removal listener.
    pub(crate) fn run_pending_tasks(&self) {
        self.inner.store.run_pending_tasks();
    }

    /// The number of computations currently running.
    pub(crate) fn running_computations(&self) -> usize {
        self.inner.lock_computations().len()
    }

    pub(crate) fn reload_state(&self) -> ReloadState {
        self.inner.state.get()
    }

    pub(crate) fn set_reload_state(&self, state: ReloadState) {
        self.inner.state.set(state);
    }
}
