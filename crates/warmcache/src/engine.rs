use std::any::Any;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::descriptor::CacheDescriptor;
use crate::error::ConfigError;
use crate::memory::Cacher;
use crate::metrics::SharedCacheMetrics;
use crate::registry::Registry;
use crate::reload::{self, AutoReloadCacher, Warm};
use crate::shared_cache::{SharedCacheService, SharedTier};
use crate::store::{EntryStore, RemovalEvent};
use crate::value::{CacheValue, ComputationError};

/// Owns the caches of all declared computations.
///
/// Every declared descriptor gets exactly one [`Cacher`], created the first time it is asked
/// for. Asking again returns a handle to the same cacher, so an engine is typically created
/// once at startup and shared.
pub struct CacheEngine {
    registry: Arc<Registry>,
    shared_cache: Option<SharedCacheService>,
    metrics: Arc<SharedCacheMetrics>,
    sweep_interval: Option<Duration>,
    runtime: Handle,
    /// The opened cachers, each a `Cacher<V, E>` of the types it was first opened with.
    cachers: Mutex<HashMap<String, Box<dyn Any + Send + Sync>>>,
    warmers: Mutex<Vec<Arc<dyn Warm>>>,
}

impl std::fmt::Debug for CacheEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEngine")
            .field("registry", &self.registry)
            .field("shared_cache", &self.shared_cache)
            .field("sweep_interval", &self.sweep_interval)
            .field("opened caches", &lock(&self.cachers).len())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CacheEngine {
    /// Creates an engine for the caches in `registry`, without a shared cache.
    ///
    /// Background tasks (expiry sweeps, reloads, uploads) are spawned onto `runtime`.
    pub fn new(registry: Registry, runtime: Handle) -> Self {
        Self {
            registry: Arc::new(registry),
            shared_cache: None,
            metrics: Arc::default(),
            sweep_interval: Config::default().sweep_interval,
            runtime,
            cachers: Mutex::default(),
            warmers: Mutex::default(),
        }
    }

    /// Mirrors all distributed caches into `shared_cache`.
    ///
    /// This also creates the hit and miss counters of every distributed descriptor.
    pub fn with_shared_cache(mut self, shared_cache: SharedCacheService) -> Self {
        self.metrics = Arc::new(SharedCacheMetrics::for_registry(&self.registry));
        self.shared_cache = Some(shared_cache);
        self
    }

    /// Sets the interval of the background expiry sweep, `None` to only expire lazily.
    pub fn with_sweep_interval(mut self, sweep_interval: Option<Duration>) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }

    /// Creates the registry, the shared cache and the engine declared in `config`.
    pub fn from_config(config: &Config, runtime: Handle) -> Result<Self, ConfigError> {
        let registry = Registry::from_config(config)?;
        let mut engine = Self::new(registry, runtime).with_sweep_interval(config.sweep_interval);
        if let Some(shared_cache) = config.active_shared_cache() {
            let service = SharedCacheService::new(shared_cache.clone(), &engine.runtime);
            engine = engine.with_shared_cache(service);
        }
        Ok(engine)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn shared_cache(&self) -> Option<&SharedCacheService> {
        self.shared_cache.as_ref()
    }

    /// The shared cache hit and miss counters of all distributed descriptors.
    ///
    /// Empty if there is no shared cache.
    pub fn shared_cache_metrics(&self) -> &SharedCacheMetrics {
        &self.metrics
    }

    /// Returns the cacher of the descriptor called `name`.
    ///
    /// The cacher is created on first use. Auto reloading caches have to be opened with
    /// [`auto_reload`](Self::auto_reload) first.
    pub fn cacher<V, E>(&self, name: &str) -> Result<Cacher<V, E>, ConfigError>
    where
        V: CacheValue,
        E: ComputationError,
    {
        let descriptor = self.lookup(name)?;
        let mut cachers = lock(&self.cachers);
        match cachers.entry(descriptor.name.clone()) {
            Entry::Occupied(entry) => entry
                .get()
                .downcast_ref::<Cacher<V, E>>()
                .cloned()
                .ok_or_else(|| ConfigError::TypeMismatch(descriptor.name.clone())),
            Entry::Vacant(entry) => {
                if descriptor.auto_reload {
                    return Err(ConfigError::MissingLoader(descriptor.name.clone()));
                }
                let cacher = self.create_cacher::<V, E>(descriptor, None);
                entry.insert(Box::new(cacher.clone()));
                Ok(cacher)
            }
        }
    }

    /// Opens the auto reloading cache called `name`, with the computation to reload it with.
    ///
    /// This starts reloading the entry in the background whenever it is evicted. Each auto
    /// reloading cache can only be opened once, its cacher is available through
    /// [`cacher`](Self::cacher) afterwards.
    pub fn auto_reload<V, E, F, Fut>(
        &self,
        name: &str,
        loader: F,
    ) -> Result<AutoReloadCacher<V, E>, ConfigError>
    where
        V: CacheValue,
        E: ComputationError,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let descriptor = self.lookup(name)?;
        if !descriptor.auto_reload {
            return Err(ConfigError::NotAutoReload(descriptor.name.clone()));
        }

        let mut cachers = lock(&self.cachers);
        let Entry::Vacant(entry) = cachers.entry(descriptor.name.clone()) else {
            return Err(ConfigError::AlreadyOpened(descriptor.name.clone()));
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cacher = self.create_cacher::<V, E>(descriptor, Some(events_tx));
        let loader = reload::boxed_loader(loader);
        self.runtime.spawn(reload::reload_worker(
            events_rx,
            cacher.downgrade(),
            Arc::clone(&loader),
        ));
        entry.insert(Box::new(cacher.clone()));
        drop(cachers);

        let reloader = AutoReloadCacher::new(cacher, loader);
        lock(&self.warmers).push(Arc::new(reloader.clone()));
        tracing::debug!(cache = name, "Opened auto reloading cache");
        Ok(reloader)
    }

    /// Runs the computation of every opened auto reloading cache once.
    ///
    /// Failures are logged. Returns the number of caches that hold a value afterwards.
    pub async fn warm_up(&self) -> usize {
        let warmers = lock(&self.warmers).clone();
        tracing::info!("Start auto load of {} caches", warmers.len());

        let results = futures::future::join_all(warmers.iter().map(|warmer| {
            tracing::debug!(cache = warmer.name(), "Auto loading cache");
            warmer.warm()
        }))
        .await;

        let warmed = results.into_iter().filter(|warmed| *warmed).count();
        tracing::info!("Finish auto load, {} of {} caches warm", warmed, warmers.len());
        warmed
    }

    fn lookup(&self, name: &str) -> Result<&Arc<CacheDescriptor>, ConfigError> {
        self.registry
            .lookup(name)
            .ok_or_else(|| ConfigError::UnknownCache(name.to_owned()))
    }

    fn create_cacher<V, E>(
        &self,
        descriptor: &Arc<CacheDescriptor>,
        removal_listener: Option<mpsc::UnboundedSender<RemovalEvent>>,
    ) -> Cacher<V, E>
    where
        V: CacheValue,
        E: ComputationError,
    {
        let store = match removal_listener {
            Some(listener) => EntryStore::with_removal_listener(descriptor, listener),
            None => EntryStore::new(descriptor),
        };

        let shared_tier = match &self.shared_cache {
            Some(service) if descriptor.distributed => self
                .metrics
                .get(&descriptor.name)
                .map(|stats| SharedTier::new(descriptor, service.clone(), Arc::clone(stats))),
            _ => None,
        };

        let cacher = Cacher::from_parts(Arc::clone(descriptor), store, shared_tier);
        if let Some(sweep_interval) = self.sweep_interval {
            cacher.spawn_janitor(sweep_interval, &self.runtime);
        }
        cacher
    }
}
