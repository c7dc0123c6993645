use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::descriptor::CacheDescriptor;
use crate::shared_cache::SharedCacheConfig;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The default log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configures the logging system.
    pub logging: Logging,

    /// Global switch for the shared cache.
    ///
    /// When disabled, the `distributed` flag of every cache is ignored, even if a
    /// `shared_cache` is configured.
    pub enable_shared_cache: bool,

    /// The shared cache that `distributed` caches are mirrored into.
    pub shared_cache: Option<SharedCacheConfig>,

    /// Interval in which expired entries are removed in the background.
    ///
    /// Caches with a shorter time to live are swept at their time to live instead. Setting
    /// this to `null` leaves removal to the store's own housekeeping, which runs along with
    /// lookups and writes, so expired auto reloading caches are reloaded less promptly.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Option<Duration>,

    /// All caches, declared once at startup.
    pub caches: Vec<CacheDescriptor>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            logging: Logging::default(),
            enable_shared_cache: true,
            shared_cache: None,
            sweep_interval: Some(Duration::from_secs(1)),
            caches: Vec::new(),
        }
    }
}

impl Config {
    /// Loads the configuration from the file at `path`, or the default configuration.
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    /// Parses a YAML configuration.
    pub fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }

    /// The shared cache configuration, unless the shared cache is disabled.
    pub fn active_shared_cache(&self) -> Option<&SharedCacheConfig> {
        if self.enable_shared_cache {
            self.shared_cache.as_ref()
        } else {
            None
        }
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl<'de> de::Visitor<'de> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use crate::descriptor::{ElementType, Shape};
    use crate::shared_cache::SharedCacheBackendConfig;

    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::get(None).unwrap();
        assert!(cfg.enable_shared_cache);
        assert!(cfg.shared_cache.is_none());
        assert_eq!(cfg.sweep_interval, Some(Duration::from_secs(1)));
        assert!(cfg.caches.is_empty());
        assert_eq!(cfg.logging.level, LevelFilter::INFO);
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
            logging:
              level: debug
              format: json
            sweep_interval: 250ms
            shared_cache:
              max_concurrent_uploads: 4
              fetch_timeout: 2s
              key_prefix: "staging/"
              filesystem:
                path: /tmp/warmcache
            caches:
              - name: Catalog.names
                ttl: 10m
                auto_reload: true
                distributed: true
                shape:
                  list: string
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert_eq!(cfg.sweep_interval, Some(Duration::from_millis(250)));

        let shared_cache = cfg.active_shared_cache().unwrap();
        assert_eq!(shared_cache.max_concurrent_uploads, 4);
        assert_eq!(shared_cache.max_upload_queue_size, 400);
        assert_eq!(shared_cache.fetch_timeout, Duration::from_secs(2));
        assert_eq!(shared_cache.store_timeout, Duration::from_secs(60));
        assert_eq!(shared_cache.health_check_interval, Duration::from_secs(50));
        assert_eq!(shared_cache.key_prefix, "staging/");
        match &shared_cache.backend {
            SharedCacheBackendConfig::Filesystem(fs) => {
                assert_eq!(fs.path, PathBuf::from("/tmp/warmcache"))
            }
            other => panic!("unexpected backend {other:?}"),
        }

        let descriptor = &cfg.caches[0];
        assert_eq!(descriptor.ttl, Duration::from_secs(600));
        assert!(descriptor.auto_reload);
        assert_eq!(descriptor.shape, Shape::List(ElementType::String));
    }

    #[test]
    fn test_disabled_shared_cache() {
        let yaml = r#"
            enable_shared_cache: false
            shared_cache:
              memory: {}
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert!(cfg.shared_cache.is_some());
        assert!(cfg.active_shared_cache().is_none());
    }

    #[test]
    fn test_disabling_sweep() {
        let yaml = r#"
            sweep_interval: null
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.sweep_interval, None);
    }

    #[test]
    fn test_invalid_level() {
        let yaml = r#"
            logging:
              level: verbose
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_empty_file() {
        // Empty files aren't supported
        let yaml = r#""#;
        let result = Config::from_reader(yaml.as_bytes());
        assert!(result.is_err());
    }

    #[test]
    fn test_get_from_file() {
        let dir = warmcache_test::tempdir();
        let path = dir.path().join("config.yml");
        fs::write(&path, "caches:\n  - name: Catalog.names\n").unwrap();

        let cfg = Config::get(Some(&path)).unwrap();
        assert_eq!(cfg.caches.len(), 1);
        assert!(Config::get(Some(&dir.path().join("missing.yml"))).is_err());
    }
}
