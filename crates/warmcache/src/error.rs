use thiserror::Error;

/// An invalid cache declaration or an invalid use of a declared cache.
///
/// These are only ever raised while setting caches up, never on a lookup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Two descriptors were declared with the same name.
    #[error("cache `{0}` is declared more than once")]
    DuplicateName(String),
    /// An auto reloading descriptor was declared for a computation that takes arguments.
    #[error("cache `{name}` takes {arity} argument(s) and cannot be reloaded automatically")]
    AutoReloadWithArguments { name: String, arity: usize },
    /// A descriptor was declared with room for no entries.
    #[error("cache `{0}` has a capacity of zero")]
    ZeroCapacity(String),
    /// A descriptor was declared with entries that expire right away.
    #[error("cache `{0}` has a time to live of zero")]
    ZeroTtl(String),
    /// No descriptor with the requested name exists.
    #[error("cache `{0}` is not declared")]
    UnknownCache(String),
    /// The cache was opened before with a different value or error type.
    #[error("cache `{0}` was already opened with different types")]
    TypeMismatch(String),
    /// An auto reloading cache was opened without its loader.
    #[error("cache `{0}` reloads automatically and must be opened with its loader")]
    MissingLoader(String),
    /// A loader was given for a cache that does not reload automatically.
    #[error("cache `{0}` is not declared with `auto_reload`")]
    NotAutoReload(String),
    /// An auto reloading cache was opened a second time with a loader.
    #[error("cache `{0}` already has a loader")]
    AlreadyOpened(String),
}

/// Failure encoding or decoding a value for the shared cache.
///
/// This is never seen by callers. A decode failure is treated as a miss, an encode failure
/// drops the write.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The value does not have the declared shape.
    #[error("value does not match the declared {expected} shape")]
    ShapeMismatch { expected: &'static str },
    /// Serialization failed.
    #[error("failed to (de)serialize value")]
    Json(#[from] serde_json::Error),
}
