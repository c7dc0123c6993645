use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use crate::config::Config;
use crate::descriptor::CacheDescriptor;
use crate::error::ConfigError;

/// The table of every declared [`CacheDescriptor`], keyed by name.
///
/// The registry is built once at startup and never changes afterwards. All declarations are
/// validated while building it, so an invalid declaration aborts startup.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    descriptors: HashMap<String, Arc<CacheDescriptor>>,
}

impl Registry {
    /// Validates and registers all `descriptors`.
    ///
    /// Fails on the first descriptor that:
    /// - has the same name as a previous one,
    /// - reloads automatically but takes arguments,
    /// - has a capacity of zero,
    /// - has a time to live of zero.
    pub fn new(descriptors: impl IntoIterator<Item = CacheDescriptor>) -> Result<Self, ConfigError> {
        let mut table = HashMap::new();
        for descriptor in descriptors {
            if descriptor.auto_reload && descriptor.arity > 0 {
                return Err(ConfigError::AutoReloadWithArguments {
                    name: descriptor.name,
                    arity: descriptor.arity,
                });
            }
            if descriptor.capacity == 0 {
                return Err(ConfigError::ZeroCapacity(descriptor.name));
            }
            if descriptor.ttl.is_zero() {
                return Err(ConfigError::ZeroTtl(descriptor.name));
            }

            match table.entry(descriptor.name.clone()) {
                Entry::Occupied(_) => return Err(ConfigError::DuplicateName(descriptor.name)),
                Entry::Vacant(entry) => {
                    tracing::debug!(
                        cache = %descriptor.name,
                        ttl = ?descriptor.ttl,
                        capacity = descriptor.capacity,
                        auto_reload = descriptor.auto_reload,
                        distributed = descriptor.distributed,
                        "Registered cache"
                    );
                    entry.insert(Arc::new(descriptor));
                }
            }
        }

        Ok(Self { descriptors: table })
    }

    /// Registers the `caches` declared in `config`.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Self::new(config.caches.iter().cloned())
    }

    /// Looks up the descriptor called `name`.
    pub fn lookup(&self, name: &str) -> Option<&Arc<CacheDescriptor>> {
        self.descriptors.get(name)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Iterates over all descriptors, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<CacheDescriptor>> {
        self.descriptors.values()
    }
}
