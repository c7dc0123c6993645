//! The bounded in-memory table behind every [`Cacher`](crate::Cacher).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use moka::policy::EvictionPolicy;
use tokio::sync::mpsc;

use crate::cache_key::CacheKey;
use crate::descriptor::CacheDescriptor;

pub use moka::notification::RemovalCause;

/// Emitted for every entry that leaves an [`EntryStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovalEvent {
    pub key: CacheKey,
    pub cause: RemovalCause,
}

/// A bounded map of memoized values for a single descriptor.
///
/// Entries expire once they are older than the `ttl`, and the least recently used entry is
/// evicted when the store grows past its capacity. Every removal is reported to the removal
/// listener, if one is attached.
///
/// Expired entries are never returned, but they are only removed (and reported) by the
/// store's maintenance, which runs on writes and on [`run_pending_tasks`](Self::run_pending_tasks).
pub struct EntryStore<V> {
    name: String,
    ttl: Duration,
    capacity: usize,
    cache: moka::sync::Cache<CacheKey, V>,
    evictions: Arc<AtomicU64>,
}

impl<V: Clone + Send + Sync + 'static> std::fmt::Debug for EntryStore<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryStore")
            .field("name", &self.name)
            .field("ttl", &self.ttl)
            .field("capacity", &self.capacity)
            .field("entry_count", &self.cache.entry_count())
            .finish()
    }
}

impl<V: Clone + Send + Sync + 'static> EntryStore<V> {
    /// Creates an empty store sized according to the `descriptor`.
    pub fn new(descriptor: &CacheDescriptor) -> Self {
        Self::build(descriptor, None)
    }

    /// Creates an empty store that reports every removal to `listener`.
    pub fn with_removal_listener(
        descriptor: &CacheDescriptor,
        listener: mpsc::UnboundedSender<RemovalEvent>,
    ) -> Self {
        Self::build(descriptor, Some(listener))
    }

    fn build(
        descriptor: &CacheDescriptor,
        listener: Option<mpsc::UnboundedSender<RemovalEvent>>,
    ) -> Self {
        let evictions = Arc::new(AtomicU64::new(0));

        let name = descriptor.name.clone();
        let counter = Arc::clone(&evictions);
        let cache = moka::sync::Cache::builder()
            .name(&descriptor.name)
            .max_capacity(descriptor.capacity as u64)
            .time_to_live(descriptor.ttl)
            .eviction_policy(EvictionPolicy::lru())
            .eviction_listener(move |key: Arc<CacheKey>, _value, cause: RemovalCause| {
                if cause.was_evicted() {
                    counter.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(cache = %name, %key, ?cause, "Evicted entry");
                } else {
                    tracing::trace!(cache = %name, %key, ?cause, "Removed entry");
                }

                if let Some(listener) = &listener {
                    // The listener going away only means nobody is interested anymore.
                    let key = CacheKey::clone(&key);
                    listener.send(RemovalEvent { key, cause }).ok();
                }
            })
            .build();

        Self {
            name: descriptor.name.clone(),
            ttl: descriptor.ttl,
            capacity: descriptor.capacity,
            cache,
            evictions,
        }
    }

    /// Returns the value for `key`, unless it is missing or expired.
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        self.cache.get(key)
    }

    /// Stores `value` for `key`, restarting its time to live.
    ///
    /// If the store is over capacity afterwards, the least recently used entry is evicted
    /// before this returns.
    pub fn put(&self, key: CacheKey, value: V) {
        self.cache.insert(key, value);
        self.cache.run_pending_tasks();
    }

    /// Removes the entry for `key`, returning whether there was one.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.cache.remove(key).is_some()
    }

    /// Removes all entries.
    pub fn clear(&self) {
        // `invalidate_all` is lazy and would report the entries as expired.
        let keys: Vec<_> = self.cache.iter().map(|(key, _)| key).collect();
        for key in keys {
            self.cache.remove(&*key);
        }
        self.cache.run_pending_tasks();
    }

    /// Removes expired entries and applies pending evictions, reporting them to the listener.
    pub fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks();
    }

    /// The number of live entries.
    pub fn len(&self) -> usize {
        self.cache.run_pending_tasks();
        self.cache.entry_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V> EntryStore<V> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The number of entries this store has evicted on its own, by expiry or size.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use warmcache_test::wait_for;

    use super::*;

    fn descriptor(ttl: Duration, capacity: usize) -> CacheDescriptor {
        CacheDescriptor::new("Test.store")
            .with_ttl(ttl)
            .with_capacity(capacity)
    }

    fn key(name: &str) -> CacheKey {
        CacheKey::for_testing(name)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<RemovalEvent>) -> Vec<RemovalEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[tokio::test]
    async fn test_evicts_least_recently_used() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let store = EntryStore::with_removal_listener(&descriptor(Duration::from_secs(60), 2), tx);

        store.put(key("a"), "a".to_owned());
        store.put(key("b"), "b".to_owned());
        store.put(key("c"), "c".to_owned());

        assert_eq!(store.get(&key("a")), None);
        assert_eq!(store.get(&key("b")).as_deref(), Some("b"));
        assert_eq!(store.get(&key("c")).as_deref(), Some("c"));
        assert_eq!(store.len(), 2);

        let events = drain(&mut rx);
        assert_eq!(
            events,
            [RemovalEvent {
                key: key("a"),
                cause: RemovalCause::Size
            }]
        );
        assert_eq!(store.evictions(), 1);
    }

    #[tokio::test]
    async fn test_eleventh_insert_evicts_exactly_one() {
        let store = EntryStore::new(&descriptor(Duration::from_secs(60), 10));
        for i in 0..10 {
            store.put(key(&i.to_string()), i.to_string());
        }

        store.put(key("10"), "10".into());
        assert_eq!(store.len(), 10);
        assert_eq!(store.get(&key("0")), None);
        for i in 1..=10 {
            assert!(store.get(&key(&i.to_string())).is_some(), "{i} was evicted");
        }
        assert_eq!(store.evictions(), 1);
    }

    #[tokio::test]
    async fn test_reads_refresh_recency() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let store = EntryStore::with_removal_listener(&descriptor(Duration::from_secs(60), 2), tx);

        store.put(key("a"), "a".to_owned());
        store.put(key("b"), "b".to_owned());
        assert!(store.get(&key("a")).is_some());
        store.put(key("c"), "c".to_owned());

        assert_eq!(store.get(&key("a")).as_deref(), Some("a"));
        assert_eq!(store.get(&key("b")), None);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key, key("b"));
    }

    #[tokio::test]
    async fn test_overwrite_is_not_an_eviction() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let store = EntryStore::with_removal_listener(&descriptor(Duration::from_secs(60), 2), tx);

        store.put(key("a"), "a".to_owned());
        store.put(key("b"), "b".to_owned());
        store.put(key("a"), "a2".to_owned());
        store.put(key("c"), "c".to_owned());

        assert_eq!(store.get(&key("a")).as_deref(), Some("a2"));
        assert_eq!(store.get(&key("b")), None);

        let causes: Vec<_> = drain(&mut rx).into_iter().map(|e| e.cause).collect();
        assert_eq!(causes, [RemovalCause::Replaced, RemovalCause::Size]);
        assert_eq!(store.evictions(), 1);
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let store =
            EntryStore::with_removal_listener(&descriptor(Duration::from_millis(100), 10), tx);

        store.put(key("a"), "a".to_owned());
        assert_eq!(store.get(&key("a")).as_deref(), Some("a"));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(store.get(&key("a")), None);

        store.run_pending_tasks();
        assert!(store.is_empty());

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].cause, RemovalCause::Expired);
        assert!(events[0].cause.was_evicted());
        assert_eq!(store.evictions(), 1);
    }

    #[tokio::test]
    async fn test_expiry_counts_from_the_last_write() {
        let store = EntryStore::new(&descriptor(Duration::from_millis(300), 10));

        store.put(key("old"), "old".to_owned());
        tokio::time::sleep(Duration::from_millis(200)).await;
        store.put(key("new"), "new".to_owned());

        wait_for(|| store.get(&key("old")).is_none(), Duration::from_secs(2)).await;
        assert_eq!(store.get(&key("new")).as_deref(), Some("new"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_is_not_an_eviction() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let store = EntryStore::with_removal_listener(&descriptor(Duration::from_secs(60), 10), tx);

        store.put(key("a"), "a".to_owned());
        store.put(key("b"), "b".to_owned());
        assert!(store.invalidate(&key("a")));
        assert!(!store.invalidate(&key("a")));
        store.clear();
        assert!(store.is_empty());

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.cause == RemovalCause::Explicit));
        assert_eq!(store.evictions(), 0);
    }
}
