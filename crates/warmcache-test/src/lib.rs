//! Helpers for testing caches and the engine.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. When dropped too early, the directory is deleted while the
//!    shared cache may still write into it. To avoid this, assign it to a variable in the test
//!    function (e.g. `let _cache_dir = warmcache_test::tempdir()`).
//!
//!  - Background work (reloads, uploads, expiry sweeps) runs on spawned tasks. Use
//!    [`wait_for`] instead of fixed sleeps when a test depends on it, unless the test runs
//!    with a paused clock.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `warmcache` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("warmcache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`into_path`](TempDir::into_path) is called. Use it as a guard to automatically clean up after
/// tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Counts how often a computation ran.
///
/// Clones share the same count, so one clone can be moved into the computation and the other
/// one kept by the test.
#[derive(Debug, Clone, Default)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a call and returns the number of calls before this one.
    pub fn hit(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst)
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Polls `predicate` until it returns `true`.
///
/// # Panics
///
/// Panics if `predicate` is still `false` after `timeout`.
pub async fn wait_for(mut predicate: impl FnMut() -> bool, timeout: Duration) {
    let start = tokio::time::Instant::now();
    while !predicate() {
        if start.elapsed() >= timeout {
            panic!(
                "condition not met within {}",
                humantime::format_duration(timeout)
            );
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
