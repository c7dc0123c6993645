use std::fmt::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};

/// The key of a single memoized result, derived from the argument list of a computation.
///
/// Two keys are equal when their metadata is equal. The metadata is a human-readable (but not
/// necessarily machine-readable) rendering of the arguments, which is SHA256-hashed to form
/// the key used in the shared cache.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    metadata: Arc<str>,
    hash: [u8; 32],
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "<no arguments>");
        }
        for b in &self.hash[..8] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl Default for CacheKey {
    fn default() -> Self {
        Self::empty()
    }
}

impl CacheKey {
    /// The fixed key used by computations without arguments.
    pub fn empty() -> Self {
        Self::builder().build()
    }

    /// Creates a key from the rendered arguments of a computation.
    ///
    /// An empty argument list gives the same key as [`CacheKey::empty`].
    pub fn from_args(args: &[&dyn fmt::Display]) -> Self {
        let mut builder = Self::builder();
        for arg in args {
            builder.arg(arg);
        }
        builder.build()
    }

    /// Creates a [`CacheKeyBuilder`] to feed arguments into one by one.
    pub fn builder() -> CacheKeyBuilder {
        CacheKeyBuilder {
            metadata: String::new(),
        }
    }

    /// Whether this is the key of a computation without arguments.
    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty()
    }

    /// Returns the human-readable metadata that forms the basis of the [`CacheKey`].
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// Returns the hex-formatted sha-256 hash of the metadata.
    ///
    /// This is stable across processes and is what the shared cache is keyed by.
    pub fn hex(&self) -> String {
        let mut hex = String::with_capacity(64);
        for b in &self.hash {
            let _ = write!(hex, "{b:02x}");
        }
        hex
    }

    #[cfg(test)]
    pub(crate) fn for_testing(key: &str) -> Self {
        Self::from_args(&[&key])
    }
}

/// A builder for [`CacheKey`]s.
///
/// Every argument is length-prefixed, so that `("a,b")` and `("a", "b")` end up as different
/// keys, and no argument can be crafted to look like several.
pub struct CacheKeyBuilder {
    metadata: String,
}

impl CacheKeyBuilder {
    /// Appends one argument.
    pub fn arg(&mut self, arg: &dyn fmt::Display) -> &mut Self {
        let rendered = arg.to_string();
        let _ = writeln!(self.metadata, "{}:{rendered}", rendered.len());
        self
    }

    /// Finalizes the builder into a [`CacheKey`].
    pub fn build(self) -> CacheKey {
        let hash = Sha256::digest(self.metadata.as_bytes());
        CacheKey {
            metadata: self.metadata.into(),
            hash: hash.into(),
        }
    }
}
