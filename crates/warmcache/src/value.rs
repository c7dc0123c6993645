use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// A value that can be memoized.
///
/// Values are cloned out of the cache for every caller, so expensive values should be wrapped
/// in an [`Arc`]. They are also serializable, to be mirrored into the shared cache.
pub trait CacheValue: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Whether this is the explicitly empty result of a computation.
    ///
    /// Absent results are handed back to the caller but never stored. Only an empty
    /// [`Option`] is absent; falsy values such as `0`, `""` or an empty list are cached.
    fn is_absent(&self) -> bool {
        false
    }
}

macro_rules! impl_present_value {
    ($($ty:ty),* $(,)?) => {
        $(impl CacheValue for $ty {})*
    };
}

impl_present_value!(
    (),
    bool,
    char,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    f32,
    f64,
    String,
    serde_json::Value,
);

impl<T: CacheValue> CacheValue for Option<T> {
    fn is_absent(&self) -> bool {
        self.is_none()
    }
}

impl<T: CacheValue> CacheValue for Vec<T> {}

impl<K, V> CacheValue for HashMap<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + Serialize + DeserializeOwned + 'static,
    V: CacheValue,
{
}

impl<K, V> CacheValue for BTreeMap<K, V>
where
    K: Clone + Ord + Send + Sync + Serialize + DeserializeOwned + 'static,
    V: CacheValue,
{
}

impl<T> CacheValue for Arc<T>
where
    T: CacheValue,
{
    fn is_absent(&self) -> bool {
        T::is_absent(self)
    }
}

/// The error type of a memoized computation.
///
/// A failure is handed to every caller waiting on the same computation, so it has to be
/// [`Clone`]. Wrap non-cloneable errors in an [`Arc`].
pub trait ComputationError: Clone + fmt::Debug + Send + Sync + 'static {}

impl<E> ComputationError for E where E: Clone + fmt::Debug + Send + Sync + 'static {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_empty_optionals_are_absent() {
        assert!(None::<u32>.is_absent());
        assert!(!Some(0u32).is_absent());
        assert!(!0u32.is_absent());
        assert!(!String::new().is_absent());
        assert!(!Vec::<String>::new().is_absent());
        assert!(!false.is_absent());
        assert!(Arc::new(None::<String>).is_absent());
    }
}
