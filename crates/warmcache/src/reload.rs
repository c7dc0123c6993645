//! Keeping the entries of zero-argument computations warm.
//!
//! The store of an auto reloading cache reports its removals to a [`reload_worker`]. Whenever
//! the single entry was evicted, by expiry or capacity, the worker runs the computation again
//! through the single-flight path of the [`Cacher`]. A reload therefore never overlaps with
//! another reload or with a computation started by a caller. It skips the shared cache, since
//! the copy in there was written together with the evicted entry.

use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::mpsc;

use crate::cache_key::CacheKey;
use crate::memory::{Cacher, CacherInner};
use crate::store::RemovalEvent;
use crate::value::{CacheValue, ComputationError};

/// Where an auto reloading cache is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReloadState {
    /// There is no entry. This is the initial state, and the state after a failed reload.
    Cold,
    /// There is an entry.
    Warm,
    /// The entry was evicted and the computation is running again.
    Reloading,
}

#[derive(Debug)]
pub(crate) struct ReloadStateCell(AtomicU8);

impl Default for ReloadStateCell {
    fn default() -> Self {
        Self(AtomicU8::new(ReloadState::Cold as u8))
    }
}

impl ReloadStateCell {
    pub fn get(&self) -> ReloadState {
        match self.0.load(Ordering::Acquire) {
            x if x == ReloadState::Warm as u8 => ReloadState::Warm,
            x if x == ReloadState::Reloading as u8 => ReloadState::Reloading,
            _ => ReloadState::Cold,
        }
    }

    pub fn set(&self, state: ReloadState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// The zero-argument computation of an auto reloading cache.
pub(crate) type Loader<V, E> = Arc<dyn Fn() -> BoxFuture<'static, Result<V, E>> + Send + Sync>;

pub(crate) fn boxed_loader<V, E, F, Fut>(loader: F) -> Loader<V, E>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V, E>> + Send + 'static,
{
    Arc::new(move || loader().boxed())
}

/// A [`Cacher`] for a zero-argument computation that reloads its entry whenever it is evicted.
///
/// Created by [`CacheEngine::auto_reload`](crate::CacheEngine::auto_reload), which also
/// starts the background reloading.
pub struct AutoReloadCacher<V, E> {
    cacher: Cacher<V, E>,
    loader: Loader<V, E>,
}

impl<V, E> Clone for AutoReloadCacher<V, E> {
    fn clone(&self) -> Self {
        Self {
            cacher: self.cacher.clone(),
            loader: Arc::clone(&self.loader),
        }
    }
}

impl<V: CacheValue, E> std::fmt::Debug for AutoReloadCacher<V, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoReloadCacher")
            .field("cacher", &self.cacher)
            .finish_non_exhaustive()
    }
}

impl<V: CacheValue, E: ComputationError> AutoReloadCacher<V, E> {
    pub(crate) fn new(cacher: Cacher<V, E>, loader: Loader<V, E>) -> Self {
        Self { cacher, loader }
    }

    /// Returns the memoized value, computing it if necessary.
    pub async fn load(&self) -> Result<V, E> {
        let loader = Arc::clone(&self.loader);
        self.cacher.resolve(CacheKey::empty(), move || loader()).await
    }

    pub fn state(&self) -> ReloadState {
        self.cacher.reload_state()
    }

    /// The underlying cacher, e.g. for invalidation or statistics.
    pub fn cacher(&self) -> &Cacher<V, E> {
        &self.cacher
    }
}

/// Type erased [`AutoReloadCacher`], to warm up caches of different types at once.
pub(crate) trait Warm: Send + Sync {
    fn name(&self) -> &str;

    /// Loads the value and logs failures, returning whether a value is now cached.
    fn warm(&self) -> BoxFuture<'static, bool>;
}

impl<V: CacheValue, E: ComputationError> Warm for AutoReloadCacher<V, E> {
    fn name(&self) -> &str {
        self.cacher.name()
    }

    fn warm(&self) -> BoxFuture<'static, bool> {
        let this = self.clone();
        async move {
            match this.load().await {
                Ok(value) => !value.is_absent(),
                Err(err) => {
                    tracing::error!(cache = this.cacher.name(), error = ?err, "Failed to load cache");
                    false
                }
            }
        }
        .boxed()
    }
}

/// Consumes the removal events of an auto reloading cache and reloads evicted entries.
///
/// Explicit invalidations and overwrites are ignored. Terminates once the cacher is gone.
pub(crate) async fn reload_worker<V, E>(
    mut events: mpsc::UnboundedReceiver<RemovalEvent>,
    cacher: Weak<CacherInner<V, E>>,
    loader: Loader<V, E>,
) where
    V: CacheValue,
    E: ComputationError,
{
    while let Some(event) = events.recv().await {
        if !event.cause.was_evicted() {
            continue;
        }
        let Some(cacher) = Cacher::upgrade(&cacher) else {
            break;
        };

        tracing::debug!(cache = cacher.name(), cause = ?event.cause, "Reloading evicted entry");
        cacher.set_reload_state(ReloadState::Reloading);

        let loader = Arc::clone(&loader);
        tokio::spawn(async move {
            match cacher.reload(event.key, move || loader()).await {
                Ok(value) if !value.is_absent() => {
                    cacher.set_reload_state(ReloadState::Warm);
                    tracing::debug!(cache = cacher.name(), "Reloaded entry");
                }
                Ok(_) => {
                    cacher.set_reload_state(ReloadState::Cold);
                    tracing::debug!(cache = cacher.name(), "Reload returned no value");
                }
                Err(err) => {
                    cacher.set_reload_state(ReloadState::Cold);
                    tracing::error!(cache = cacher.name(), error = ?err, "Failed to reload entry");
                }
            }
        });
    }
    tracing::trace!("Reload worker terminated");
}
