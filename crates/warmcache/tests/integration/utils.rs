use std::path::Path;
use std::time::Duration;

use warmcache::{
    CacheDescriptor, CacheEngine, Config, FilesystemSharedCacheConfig, SharedCacheBackendConfig,
    SharedCacheConfig,
};
use warmcache_test as test;

pub use test::{CallCounter, TempDir, wait_for};

/// Setup tests and create an engine.
///
/// The engine mirrors distributed caches into a filesystem shared cache inside a temporary
/// directory. The directory is cleaned up when the [`TempDir`] instance is dropped. Keep it as
/// guard until the test has finished.
///
/// The `update_config` closure can modify any default configuration if needed before the
/// engine is created.
pub fn setup_engine(
    caches: Vec<CacheDescriptor>,
    update_config: impl FnOnce(&mut Config),
) -> (CacheEngine, TempDir) {
    test::setup();

    let shared_cache_dir = test::tempdir();

    let mut config = Config {
        shared_cache: Some(filesystem_shared_cache(shared_cache_dir.path())),
        sweep_interval: Some(Duration::from_millis(10)),
        caches,
        ..Default::default()
    };
    update_config(&mut config);

    let handle = tokio::runtime::Handle::current();
    let engine = CacheEngine::from_config(&config, handle).unwrap();

    (engine, shared_cache_dir)
}

/// A shared cache configuration for the directory at `path`.
pub fn filesystem_shared_cache(path: &Path) -> SharedCacheConfig {
    SharedCacheConfig::new(SharedCacheBackendConfig::Filesystem(
        FilesystemSharedCacheConfig {
            path: path.to_owned(),
        },
    ))
}

/// Counts the entries written to the filesystem shared cache in `dir`.
pub fn shared_cache_files(dir: &TempDir) -> usize {
    fn count(path: &Path) -> usize {
        std::fs::read_dir(path)
            .into_iter()
            .flatten()
            .flatten()
            .map(|entry| {
                let path = entry.path();
                if path.file_name().is_some_and(|name| name == ".tmp") {
                    0
                } else if path.is_dir() {
                    count(&path)
                } else {
                    1
                }
            })
            .sum()
    }
    count(dir.path())
}
