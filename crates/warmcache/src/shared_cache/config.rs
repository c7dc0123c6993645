use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesystemSharedCacheConfig {
    pub path: PathBuf,
}

/// Keeps the shared cache in the memory of the current process.
///
/// This is only useful for tests and for sharing between engines within one process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemorySharedCacheConfig {}

/// The backend to use for the shared cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SharedCacheBackendConfig {
    Memory(MemorySharedCacheConfig),
    Filesystem(FilesystemSharedCacheConfig),
}

/// A remote cache that can be shared between processes.
///
/// Entries of `distributed` caches that are not in memory are looked up from here before
/// being computed, and every newly computed entry is written here as well.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedCacheConfig {
    /// The number of allowed concurrent uploads to the shared cache.
    ///
    /// Uploading to the shared cache is not critical and should not disrupt any normal
    /// work. This limits the number of concurrent uploads so that associated resources are
    /// kept in check.
    #[serde(default = "default_max_concurrent_uploads")]
    pub max_concurrent_uploads: usize,

    /// The number of queued up uploads to the cache.
    ///
    /// If more items need to be uploaded to the shared cache than there are allowed
    /// concurrently the uploads will be queued. If the queue is full the uploads are
    /// simply dropped.
    #[serde(default = "default_max_upload_queue_size")]
    pub max_upload_queue_size: usize,

    /// Maximum time to wait for a fetch from the shared cache.
    ///
    /// A fetch that takes longer is treated as a miss.
    #[serde(default = "default_fetch_timeout", with = "humantime_serde")]
    pub fetch_timeout: Duration,

    /// Maximum time a single upload may take.
    #[serde(default = "default_store_timeout", with = "humantime_serde")]
    pub store_timeout: Duration,

    /// Interval in which an unavailable backend is checked for recovery.
    ///
    /// After an error talking to the backend, the shared cache is bypassed until the next
    /// successful health check.
    #[serde(default = "default_health_check_interval", with = "humantime_serde")]
    pub health_check_interval: Duration,

    /// Prepended to every key, to separate deployments sharing one backend.
    #[serde(default)]
    pub key_prefix: String,

    /// The backend to use for the shared cache.
    #[serde(flatten)]
    pub backend: SharedCacheBackendConfig,
}

impl SharedCacheConfig {
    /// Creates a configuration with default limits for the given `backend`.
    pub fn new(backend: SharedCacheBackendConfig) -> Self {
        Self {
            max_concurrent_uploads: default_max_concurrent_uploads(),
            max_upload_queue_size: default_max_upload_queue_size(),
            fetch_timeout: default_fetch_timeout(),
            store_timeout: default_store_timeout(),
            health_check_interval: default_health_check_interval(),
            key_prefix: String::new(),
            backend,
        }
    }
}

fn default_max_upload_queue_size() -> usize {
    400
}

fn default_max_concurrent_uploads() -> usize {
    20
}

fn default_fetch_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_store_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(50)
}
