use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::cache_key::CacheKey;
use crate::descriptor::{CacheDescriptor, Shape};
use crate::metrics::TierStats;
use crate::value::CacheValue;

use super::{SharedCacheService, codec};

/// The shared cache, as seen by a single distributed descriptor.
///
/// Encodes and decodes values according to the descriptor's [`Shape`] and counts hits and
/// misses. Entries are written with the descriptor's time to live. Failures of any kind never
/// reach the caller: a read that fails is a miss, a write that fails is dropped.
pub struct SharedTier<V> {
    cache: Arc<str>,
    shape: Shape,
    ttl: Duration,
    service: SharedCacheService,
    stats: Arc<TierStats>,
    _value: PhantomData<fn() -> V>,
}

impl<V> Clone for SharedTier<V> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            shape: self.shape,
            ttl: self.ttl,
            service: self.service.clone(),
            stats: Arc::clone(&self.stats),
            _value: PhantomData,
        }
    }
}

impl<V> std::fmt::Debug for SharedTier<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedTier")
            .field("cache", &self.cache)
            .field("shape", &self.shape)
            .field("service", &self.service)
            .finish()
    }
}

impl<V: CacheValue> SharedTier<V> {
    pub fn new(
        descriptor: &CacheDescriptor,
        service: SharedCacheService,
        stats: Arc<TierStats>,
    ) -> Self {
        Self {
            cache: descriptor.name.as_str().into(),
            shape: descriptor.shape,
            ttl: descriptor.ttl,
            service,
            stats,
            _value: PhantomData,
        }
    }

    /// Looks up `key` in the shared cache, counting a hit or a miss.
    ///
    /// While the backend is unavailable this is a miss without asking it.
    pub async fn read_through(&self, key: &CacheKey) -> Option<V> {
        let value = match self.service.fetch(&self.cache, key).await {
            Some(bytes) => match codec::decode::<V>(&self.shape, &bytes) {
                Ok(value) if !value.is_absent() => Some(value),
                Ok(_) => None,
                Err(err) => {
                    tracing::error!(
                        cache = %self.cache,
                        %key,
                        error = &err as &dyn std::error::Error,
                        "Failed to decode shared cache entry"
                    );
                    None
                }
            },
            None => None,
        };

        match value {
            Some(_) => self.stats.record_hit(),
            None => self.stats.record_miss(),
        }
        value
    }

    /// Writes `value` to the shared cache in the background.
    ///
    /// Returns `None` if nothing is going to be written, because the value is absent or does
    /// not fit the declared shape. Otherwise the returned receiver resolves once the write is
    /// done, or errors if the write was dropped, e.g. because the backend is unavailable.
    pub fn write_through(&self, key: &CacheKey, value: &V) -> Option<oneshot::Receiver<()>> {
        match codec::encode(&self.shape, value) {
            Ok(Some(content)) => Some(self.service.store(&self.cache, key, content, self.ttl)),
            Ok(None) => None,
            Err(err) => {
                tracing::error!(
                    cache = %self.cache,
                    %key,
                    error = &err as &dyn std::error::Error,
                    "Failed to encode value for the shared cache"
                );
                None
            }
        }
    }

    /// Deletes `key` from the shared cache in the background.
    pub fn delete(&self, key: &CacheKey) -> oneshot::Receiver<()> {
        self.service.delete(&self.cache, key)
    }

    /// Counts a lookup that was answered from memory, without asking the shared cache.
    pub(crate) fn record_local_hit(&self) {
        self.stats.record_hit();
    }

    /// The hit and miss counters of this descriptor.
    pub fn stats(&self) -> &TierStats {
        &self.stats
    }
}
