//! A cache to be shared between different processes.
//!
//! The goal of this cache is to have a faster warm-up time when starting a new process, by
//! looking up entries that another process has already computed. It is only used by
//! descriptors declared as `distributed`.
//!
//! The shared cache is never the source of truth. Every operation on it is allowed to fail,
//! and failures are logged but otherwise hidden. After a failure the backend is considered
//! unavailable and bypassed until a periodic health check succeeds again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use crate::cache_key::CacheKey;

mod backend;
mod codec;
mod config;
mod tier;

pub use backend::{FilesystemBackend, MemoryBackend, SharedCacheBackend, SharedCacheError};
pub use config::{
    FilesystemSharedCacheConfig, MemorySharedCacheConfig, SharedCacheBackendConfig,
    SharedCacheConfig,
};
pub use tier::SharedTier;

/// Message to send upload tasks across the [`SharedCacheService::upload_queue_tx`].
#[derive(Debug)]
struct UploadMessage {
    /// The cache type/name.
    cache: Arc<str>,
    /// The key to store the data at.
    key: String,
    /// What to do with the key.
    op: UploadOp,
    /// A channel to notify completion of the operation.
    done_tx: oneshot::Sender<()>,
}

#[derive(Debug)]
enum UploadOp {
    Store { content: Bytes, ttl: Duration },
    Delete,
}

impl AsRef<str> for UploadOp {
    fn as_ref(&self) -> &str {
        match self {
            UploadOp::Store { .. } => "store",
            UploadOp::Delete => "delete",
        }
    }
}

/// A shared cache service.
///
/// Reads go straight to the backend, limited by the `fetch_timeout`. Writes and deletes are
/// queued and run in the background by an upload worker, at most `max_concurrent_uploads` at
/// a time.
///
/// While the backend is unavailable, fetches are misses and writes are dropped without
/// talking to it.
#[derive(Debug, Clone)]
pub struct SharedCacheService {
    backend: Arc<dyn SharedCacheBackend>,
    available: Arc<AtomicBool>,
    upload_queue_tx: mpsc::Sender<UploadMessage>,
    fetch_timeout: Duration,
    key_prefix: Arc<str>,
}

impl SharedCacheService {
    /// Creates the service with the backend described in `config`.
    ///
    /// The upload worker and the health check are spawned onto `runtime`.
    pub fn new(config: SharedCacheConfig, runtime: &tokio::runtime::Handle) -> Self {
        let backend: Arc<dyn SharedCacheBackend> = match &config.backend {
            SharedCacheBackendConfig::Memory(_) => Arc::new(MemoryBackend::new()),
            SharedCacheBackendConfig::Filesystem(cfg) => Arc::new(FilesystemBackend::from(cfg)),
        };
        Self::with_backend(config, backend, runtime)
    }

    /// Creates the service with a custom `backend`.
    ///
    /// The `backend` configured in `config` is ignored, all other settings apply.
    pub fn with_backend(
        config: SharedCacheConfig,
        backend: Arc<dyn SharedCacheBackend>,
        runtime: &tokio::runtime::Handle,
    ) -> Self {
        let available = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel(config.max_upload_queue_size.max(1));
        runtime.spawn(Self::upload_worker(
            rx,
            backend.clone(),
            available.clone(),
            config.max_concurrent_uploads.max(1),
            config.store_timeout,
        ));
        runtime.spawn(Self::health_check_worker(
            backend.clone(),
            Arc::downgrade(&available),
            config.health_check_interval,
            config.fetch_timeout,
        ));

        tracing::info!(backend = backend.name(), "Shared cache enabled");
        SharedCacheService {
            backend,
            available,
            upload_queue_tx: tx,
            fetch_timeout: config.fetch_timeout,
            key_prefix: config.key_prefix.into(),
        }
    }

    /// Long running task managing concurrent uploads to the shared cache.
    ///
    /// Terminates once every [`SharedCacheService`] is gone and all uploads are done.
    async fn upload_worker(
        mut work_rx: mpsc::Receiver<UploadMessage>,
        backend: Arc<dyn SharedCacheBackend>,
        available: Arc<AtomicBool>,
        max_concurrent_uploads: usize,
        store_timeout: Duration,
    ) {
        let (done_tx, mut done_rx) = mpsc::channel::<()>(max_concurrent_uploads);
        let mut uploads_counter = max_concurrent_uploads;
        let mut closed = false;
        loop {
            tokio::select! {
                message = work_rx.recv(), if uploads_counter > 0 && !closed => {
                    match message {
                        Some(message) => {
                            uploads_counter -= 1;
                            tokio::spawn(Self::single_uploader(
                                done_tx.clone(),
                                backend.clone(),
                                available.clone(),
                                message,
                                store_timeout,
                            ));
                            let uploads_in_flight = max_concurrent_uploads - uploads_counter;
                            tracing::trace!(uploads_in_flight, "Started shared cache upload");
                        }
                        None => closed = true,
                    }
                }
                Some(_) = done_rx.recv() => {
                    uploads_counter += 1;
                }
            }

            if closed && uploads_counter == max_concurrent_uploads {
                break;
            }
        }
        tracing::debug!("Shared cache upload worker terminated");
    }

    /// Does a single upload to the shared cache backend.
    ///
    /// Handles error reporting.
    async fn single_uploader(
        done_tx: mpsc::Sender<()>,
        backend: Arc<dyn SharedCacheBackend>,
        available: Arc<AtomicBool>,
        message: UploadMessage,
        store_timeout: Duration,
    ) {
        let UploadMessage {
            cache,
            key,
            op,
            done_tx: complete_tx,
        } = message;
        let op_name = op.as_ref().to_owned();

        let future = async {
            match op {
                UploadOp::Store { content, ttl } => {
                    backend.store(&key, content, ttl).await.map(|bytes| {
                        tracing::trace!(cache = %cache, %key, bytes, "Stored shared cache entry");
                    })
                }
                UploadOp::Delete => backend.delete(&key).await.map(|existed| {
                    tracing::trace!(cache = %cache, %key, existed, "Deleted shared cache entry");
                }),
            }
        };
        let res = tokio::time::timeout(store_timeout, future)
            .await
            .unwrap_or(Err(SharedCacheError::Timeout));

        if let Err(err) = res {
            if err.is_outage() {
                mark_unavailable(&available, backend.name());
            }
            log_error(backend.name(), &op_name, &cache, err);
        }

        // Tell the work coordinator we're done.
        done_tx.send(()).await.unwrap_or_else(|err| {
            let stderr: &dyn std::error::Error = &err;
            tracing::error!(
                stderr,
                "Shared cache single_uploader failed to send done message",
            );
        });

        // Tell the original work submitter we're done, if they dropped this we don't care.
        complete_tx.send(()).ok();
    }

    /// Checks the backend every `interval` and updates its availability.
    ///
    /// Terminates once every [`SharedCacheService`] is gone.
    async fn health_check_worker(
        backend: Arc<dyn SharedCacheBackend>,
        available: Weak<AtomicBool>,
        interval: Duration,
        timeout: Duration,
    ) {
        // The backend is assumed to be available at startup.
        let period = interval.max(Duration::from_millis(1));
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let Some(available) = available.upgrade() else {
                break;
            };

            let res = tokio::time::timeout(timeout, backend.health_check())
                .await
                .unwrap_or(Err(SharedCacheError::Timeout));
            match res {
                Ok(()) => {
                    if !available.swap(true, Ordering::Relaxed) {
                        tracing::info!(backend = backend.name(), "Shared cache is available again");
                    }
                }
                Err(err) => {
                    mark_unavailable(&available, backend.name());
                    log_error(backend.name(), "health_check", "", err);
                }
            }
        }
        tracing::debug!("Shared cache health check terminated");
    }

    /// Whether the backend is used at the moment.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    /// Returns the name of the backend configured.
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// The key an entry of `cache` is stored at in the backend.
    ///
    /// This is `{key_prefix}{cache}/{hash}`, with the hex SHA-256 hash of the cache key.
    pub fn remote_key(&self, cache: &str, key: &CacheKey) -> String {
        format!("{}{cache}/{}", self.key_prefix, key.hex())
    }

    /// Retrieves an entry from the shared cache.
    ///
    /// Errors are transparently hidden, either a cache item is available or it is not.
    #[tracing::instrument(name = "fetch_shared_cache", skip(self))]
    pub async fn fetch(&self, cache: &str, key: &CacheKey) -> Option<Bytes> {
        let key = self.remote_key(cache, key);
        if !self.is_available() {
            tracing::trace!(%key, "Shared cache unavailable, skipping fetch");
            return None;
        }

        let res = tokio::time::timeout(self.fetch_timeout, self.backend.fetch(&key))
            .await
            .unwrap_or(Err(SharedCacheError::Timeout));

        match res {
            Ok(Some(bytes)) => {
                tracing::trace!(%key, bytes = bytes.len(), "Shared cache hit");
                Some(bytes)
            }
            Ok(None) => {
                tracing::trace!(%key, "Shared cache miss");
                None
            }
            Err(err) => {
                if err.is_outage() {
                    mark_unavailable(&self.available, self.backend_name());
                }
                log_error(self.backend_name(), "fetch", cache, err);
                None
            }
        }
    }

    /// Places an entry on the shared cache for `ttl`, overwriting any previous one.
    ///
    /// Errors are transparently hidden, this service handles any errors itself.
    ///
    /// # Return
    ///
    /// A [`oneshot::Receiver`] is returned which will receive a value once the entry has
    /// been stored in the shared cache. Due to backpressure it is possible that the entry is
    /// never stored, in which case the corresponding [`oneshot::Sender`] is dropped and
    /// awaiting the receiver will resolve into an [`Err`]. The same happens while the backend
    /// is unavailable.
    pub fn store(
        &self,
        cache: &str,
        key: &CacheKey,
        content: Bytes,
        ttl: Duration,
    ) -> oneshot::Receiver<()> {
        self.enqueue(cache, key, UploadOp::Store { content, ttl })
    }

    /// Removes an entry from the shared cache.
    ///
    /// Behaves like [`store`](Self::store) regarding queueing and errors.
    pub fn delete(&self, cache: &str, key: &CacheKey) -> oneshot::Receiver<()> {
        self.enqueue(cache, key, UploadOp::Delete)
    }

    fn enqueue(&self, cache: &str, key: &CacheKey, op: UploadOp) -> oneshot::Receiver<()> {
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let op_name = op.as_ref().to_owned();
        if !self.is_available() {
            tracing::debug!(cache, op = %op_name, "Shared cache unavailable, skipping upload");
            return done_rx;
        }

        let message = UploadMessage {
            cache: cache.into(),
            key: self.remote_key(cache, key),
            op,
            done_tx,
        };
        match self.upload_queue_tx.try_send(message) {
            Ok(_) => (),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::error!(cache, op = %op_name, "Shared cache upload queue full");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::error!(cache, op = %op_name, "Shared cache upload queue closed");
            }
        }
        done_rx
    }
}

fn mark_unavailable(available: &AtomicBool, backend: &str) {
    if available.swap(false, Ordering::Relaxed) {
        tracing::warn!(backend, "Shared cache unavailable until the next health check");
    }
}

fn log_error(backend: &str, op: &str, cache: &str, err: SharedCacheError) {
    let details = err.details();
    match err {
        SharedCacheError::Other(err) => {
            let stderr: &dyn std::error::Error = &*err;
            tracing::error!(stderr, cache, op, "Error talking to {} shared cache", backend);
        }
        err => {
            tracing::warn!(cache, op, details, "Error talking to {} shared cache: {}", backend, err);
        }
    }
}
