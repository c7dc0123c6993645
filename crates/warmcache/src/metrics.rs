//! Counters polled by whoever is interested. Nothing in here is pushed anywhere.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::registry::Registry;

fn saturating_increment(counter: &AtomicU64) {
    // `Err` means the counter is already saturated.
    counter
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_add(1))
        .ok();
}

/// Hit and miss counters of the shared cache for a single descriptor.
///
/// Both counters saturate instead of wrapping around.
#[derive(Debug, Default)]
pub struct TierStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TierStats {
    pub fn record_hit(&self) {
        saturating_increment(&self.hits);
    }

    pub fn record_miss(&self) {
        saturating_increment(&self.misses);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// The total number of lookups, `hits + misses`, saturating at [`u64::MAX`].
    pub fn requests(&self) -> u64 {
        self.snapshot().requests
    }

    /// Reads all counters at once.
    pub fn snapshot(&self) -> TierSnapshot {
        let hits = self.hits();
        let misses = self.misses();
        TierSnapshot {
            hits,
            misses,
            requests: hits.saturating_add(misses),
        }
    }
}

/// A point in time reading of [`TierStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub requests: u64,
}

/// The shared cache counters of every distributed descriptor, keyed by descriptor name.
///
/// Records exist from startup on, for every descriptor marked as `distributed`, so a
/// descriptor that was never looked up reports zeros rather than being missing.
#[derive(Debug, Default)]
pub struct SharedCacheMetrics {
    records: HashMap<String, Arc<TierStats>>,
}

impl SharedCacheMetrics {
    /// Creates one record per distributed descriptor in `registry`.
    pub fn for_registry(registry: &Registry) -> Self {
        let records = registry
            .iter()
            .filter(|descriptor| descriptor.distributed)
            .map(|descriptor| (descriptor.name.clone(), Arc::default()))
            .collect();
        Self { records }
    }

    /// Returns the record of the descriptor `name`.
    ///
    /// `None` if the descriptor does not exist or is not distributed.
    pub fn get(&self, name: &str) -> Option<&Arc<TierStats>> {
        self.records.get(name)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Reads the counters of every record, sorted by descriptor name.
    pub fn snapshot(&self) -> BTreeMap<String, TierSnapshot> {
        self.records
            .iter()
            .map(|(name, stats)| (name.clone(), stats.snapshot()))
            .collect()
    }
}

/// Process lifetime counters of a single [`Cacher`](crate::Cacher).
#[derive(Debug, Default)]
pub(crate) struct LocalStats {
    accesses: AtomicU64,
    memory_hits: AtomicU64,
    computations: AtomicU64,
}

impl LocalStats {
    pub fn record_access(&self) {
        saturating_increment(&self.accesses);
    }

    pub fn record_memory_hit(&self) {
        saturating_increment(&self.memory_hits);
    }

    pub fn record_computation(&self) {
        saturating_increment(&self.computations);
    }

    pub fn snapshot(&self, evictions: u64) -> CacheStats {
        CacheStats {
            accesses: self.accesses.load(Ordering::Relaxed),
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            computations: self.computations.load(Ordering::Relaxed),
            evictions,
        }
    }
}

/// A point in time reading of the counters of a [`Cacher`](crate::Cacher).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Calls to `resolve`.
    pub accesses: u64,
    /// Calls answered from the in-memory store, without waiting on anything.
    pub memory_hits: u64,
    /// Invocations of the underlying computation.
    pub computations: u64,
    /// Entries removed by expiry or capacity.
    pub evictions: u64,
}
