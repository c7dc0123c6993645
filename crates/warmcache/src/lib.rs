//! # Warmcache
//!
//! Memoization for asynchronous computations. A computation is declared once at startup as a
//! [`CacheDescriptor`], and every call site then goes through [`Cacher::resolve`], which
//! returns a memoized result or runs the computation and remembers its result.
//!
//! ## Cache Layers
//!
//! Warmcache has a two-layered caching architecture:
//!
//! - An in-memory layer, one bounded [`EntryStore`] per descriptor, with write-time based
//!   expiry and least-recently-used eviction. This layer also does request coalescing:
//!   concurrent callers for the same key share a single computation running on its own task.
//! - An optional shared layer, backed by a [`SharedCacheBackend`], for descriptors marked as
//!   `distributed`. Values are encoded according to the declared [`Shape`] of the
//!   computation, and entries expire with the descriptor's time to live. The shared layer is
//!   strictly best effort: fetch failures degrade to a miss, store failures are dropped, and
//!   both are only logged. After a failure the backend is bypassed until a health check
//!   passes again.
//!
//! A lookup goes through the following steps:
//! - First, it goes through the in-memory layer.
//! - On miss, it joins a computation for the same key that is already in flight, if any.
//! - Otherwise it tries the shared layer next, if the descriptor is `distributed`.
//! - On miss, it finally runs the computation. A present result is stored in memory and
//!   written through to the shared layer. Absent results (an empty `Option`) and errors are
//!   never stored, and errors reach every waiting caller unchanged.
//!
//! ## Auto reload
//!
//! Zero-argument computations may be declared with `auto_reload`. Their store reports every
//! eviction to a background worker, which runs the computation again through the same
//! single-flight path, so the entry is kept warm without a caller asking for it. Reloads
//! never read the shared layer, whose copy is as old as the evicted entry. See
//! [`AutoReloadCacher`] and [`ReloadState`].
//!
//! ## Metrics
//!
//! Nothing is pushed anywhere. Each [`Cacher`] exposes [`CacheStats`] (accesses, memory hits,
//! computations, evictions), and the [`CacheEngine`] exposes one saturating hit / miss record
//! per distributed descriptor through [`SharedCacheMetrics`].
//!
//! ## Configuration
//!
//! The whole setup can be loaded from YAML via [`Config`], including the list of descriptors.
//! [`CacheEngine::from_config`] builds the [`Registry`], the shared cache service and the
//! engine in one go. Invalid declarations fail with a [`ConfigError`] at that point, and
//! never later.

mod cache_key;
mod config;
mod descriptor;
mod engine;
mod error;
pub mod logging;
mod memory;
mod metrics;
mod registry;
mod reload;
mod shared_cache;
mod store;
mod value;


pub use cache_key::{CacheKey, CacheKeyBuilder};
pub use config::{Config, LogFormat, Logging};
pub use descriptor::{CacheDescriptor, ElementType, Shape};
pub use engine::CacheEngine;
pub use error::{CodecError, ConfigError};
pub use memory::Cacher;
pub use metrics::{CacheStats, SharedCacheMetrics, TierSnapshot, TierStats};
pub use registry::Registry;
pub use reload::{AutoReloadCacher, ReloadState};
pub use shared_cache::{
    FilesystemBackend, FilesystemSharedCacheConfig, MemoryBackend, MemorySharedCacheConfig,
    SharedCacheBackend, SharedCacheBackendConfig, SharedCacheConfig, SharedCacheError,
    SharedCacheService, SharedTier,
};
pub use store::{EntryStore, RemovalCause, RemovalEvent};
pub use value::{CacheValue, ComputationError};
