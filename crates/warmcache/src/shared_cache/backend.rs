use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Error};
use async_trait::async_trait;
use bytes::Bytes;
use tempfile::NamedTempFile;
use tokio::fs;
use tokio::io::{self, AsyncWriteExt};
use tokio::time::Instant;

use super::config::FilesystemSharedCacheConfig;

/// Errors using the cache backend.
///
/// Timeouts are kept apart since they are considered to be normal at scale, as long as their
/// ratio stays low. They are logged as warnings, everything else as errors.
#[derive(thiserror::Error, Debug)]
pub enum SharedCacheError {
    #[error("timeout connecting to cache service")]
    ConnectTimeout,
    #[error("timeout talking to cache service")]
    Timeout,
    #[error(transparent)]
    Other(#[from] Error),
}

impl SharedCacheError {
    pub(crate) fn details(&self) -> &'static str {
        match self {
            Self::ConnectTimeout => "connect-timeout",
            Self::Timeout => "timeout",
            Self::Other(_) => "other",
        }
    }

    /// Whether the backend should be considered unreachable after this error.
    ///
    /// A slow operation alone does not take the backend out of service.
    pub(crate) fn is_outage(&self) -> bool {
        !matches!(self, Self::Timeout)
    }
}

/// A key-value store that the shared cache is kept in.
///
/// Implementations only move bytes. Timeouts, queueing and error reporting are handled by
/// the [`SharedCacheService`](super::SharedCacheService).
#[async_trait]
pub trait SharedCacheBackend: fmt::Debug + Send + Sync + 'static {
    /// A short name for logs.
    fn name(&self) -> &'static str;

    /// Fetches the contents stored at `key`, `None` if there are none.
    async fn fetch(&self, key: &str) -> Result<Option<Bytes>, SharedCacheError>;

    /// Stores `content` at `key`, overwriting previous contents.
    ///
    /// The contents must not be returned by [`fetch`](Self::fetch) once `ttl` has passed.
    /// Returns the number of bytes written.
    async fn store(
        &self,
        key: &str,
        content: Bytes,
        ttl: Duration,
    ) -> Result<u64, SharedCacheError>;

    /// Deletes the contents stored at `key`, returning whether there were any.
    async fn delete(&self, key: &str) -> Result<bool, SharedCacheError>;

    /// Checks that the backend is reachable.
    async fn health_check(&self) -> Result<(), SharedCacheError>;
}

/// A shared cache living in the memory of the current process.
///
/// Expired entries are dropped by the fetch that finds them.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, (Bytes, Instant)>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of stored keys.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether anything is stored at `key`, expired or not.
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }
}

#[async_trait]
impl SharedCacheBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn fetch(&self, key: &str) -> Result<Option<Bytes>, SharedCacheError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(key) {
            Some((content, expires)) if *expires > Instant::now() => Ok(Some(content.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn store(
        &self,
        key: &str,
        content: Bytes,
        ttl: Duration,
    ) -> Result<u64, SharedCacheError> {
        let bytes = content.len() as u64;
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_owned(), (content, Instant::now() + ttl));
        Ok(bytes)
    }

    async fn delete(&self, key: &str) -> Result<bool, SharedCacheError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.remove(key).is_some())
    }

    async fn health_check(&self) -> Result<(), SharedCacheError> {
        Ok(())
    }
}

/// Length of the expiry header in front of every file of the [`FilesystemBackend`].
const EXPIRY_HEADER_LEN: usize = 8;

fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|since| since.as_millis().try_into().unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// A shared cache in a directory, one file per key.
///
/// Files are written to a temporary file first and then moved into place, so readers never
/// see partial contents. Every file starts with the time it expires at, as big endian
/// milliseconds since the unix epoch. Expired files are deleted by the fetch that finds them.
#[derive(Debug, Clone)]
pub struct FilesystemBackend {
    path: PathBuf,
}

impl FilesystemBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl From<&FilesystemSharedCacheConfig> for FilesystemBackend {
    fn from(config: &FilesystemSharedCacheConfig) -> Self {
        Self::new(config.path.clone())
    }
}

#[async_trait]
impl SharedCacheBackend for FilesystemBackend {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    async fn fetch(&self, key: &str) -> Result<Option<Bytes>, SharedCacheError> {
        let abspath = self.path.join(key);
        tracing::trace!("Fetching shared cache entry from {}", abspath.display());
        let contents = match fs::read(&abspath).await {
            Ok(contents) => Bytes::from(contents),
            Err(err) => match err.kind() {
                io::ErrorKind::NotFound => return Ok(None),
                _ => Err(err).context("Failed to read file in shared cache")?,
            },
        };

        let expires = contents
            .get(..EXPIRY_HEADER_LEN)
            .and_then(|header| header.try_into().ok())
            .map(u64::from_be_bytes);
        match expires {
            Some(expires) if expires > unix_millis(SystemTime::now()) => {
                Ok(Some(contents.slice(EXPIRY_HEADER_LEN..)))
            }
            _ => {
                tracing::trace!("Removing expired shared cache entry {}", abspath.display());
                // Another process may have replaced or removed it in the meantime.
                fs::remove_file(&abspath).await.ok();
                Ok(None)
            }
        }
    }

    async fn store(
        &self,
        key: &str,
        content: Bytes,
        ttl: Duration,
    ) -> Result<u64, SharedCacheError> {
        let abspath = self.path.join(key);
        let parent_dir = abspath
            .parent()
            .ok_or_else(|| Error::msg("Shared cache directory not found"))?;
        fs::create_dir_all(parent_dir)
            .await
            .context("Failed to create parent directories")?;

        let temp_dir = parent_dir.join(".tmp");
        fs::create_dir_all(&temp_dir)
            .await
            .context("failed to create tempdir")?;
        let temp_file = NamedTempFile::new_in(&temp_dir).context("failed to create tempfile")?;
        let dup_file = temp_file.reopen().context("failed to dup filedescriptor")?;
        let mut dest = fs::File::from_std(dup_file);

        let expires = unix_millis(SystemTime::now() + ttl);
        dest.write_all(&expires.to_be_bytes())
            .await
            .context("Failed to write expiry into file")?;
        dest.write_all(&content)
            .await
            .context("Failed to copy data into file")?;
        dest.flush().await.context("Failed to flush file")?;

        temp_file
            .persist(&abspath)
            .context("Failed to save file in shared cache")?;
        Ok(content.len() as u64)
    }

    async fn delete(&self, key: &str) -> Result<bool, SharedCacheError> {
        match fs::remove_file(self.path.join(key)).await {
            Ok(()) => Ok(true),
            Err(err) => match err.kind() {
                io::ErrorKind::NotFound => Ok(false),
                _ => Err(err).context("Failed to delete file in shared cache")?,
            },
        }
    }

    async fn health_check(&self) -> Result<(), SharedCacheError> {
        fs::create_dir_all(&self.path)
            .await
            .context("Shared cache directory is not accessible")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_memory_backend() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.fetch("a/b").await.unwrap(), None);

        let written = backend
            .store("a/b", Bytes::from_static(b"[1]"), TTL)
            .await
            .unwrap();
        assert_eq!(written, 3);
        assert!(backend.contains_key("a/b"));
        assert_eq!(
            backend.fetch("a/b").await.unwrap(),
            Some(Bytes::from_static(b"[1]"))
        );

        assert!(backend.delete("a/b").await.unwrap());
        assert!(!backend.delete("a/b").await.unwrap());
        assert!(backend.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_backend_expiry() {
        let backend = MemoryBackend::new();
        backend
            .store("a/b", Bytes::from_static(b"1"), Duration::from_secs(1))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(backend.fetch("a/b").await.unwrap().is_some());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(backend.fetch("a/b").await.unwrap(), None);
        assert!(!backend.contains_key("a/b"));
    }

    #[tokio::test]
    async fn test_filesystem_backend() {
        let dir = warmcache_test::tempdir();
        let backend = FilesystemBackend::new(dir.path());

        assert_eq!(backend.fetch("Catalog.names/abc").await.unwrap(), None);

        backend
            .store("Catalog.names/abc", Bytes::from_static(b"\"first\""), TTL)
            .await
            .unwrap();
        backend
            .store("Catalog.names/abc", Bytes::from_static(b"\"second\""), TTL)
            .await
            .unwrap();
        assert_eq!(
            backend.fetch("Catalog.names/abc").await.unwrap(),
            Some(Bytes::from_static(b"\"second\""))
        );
        assert!(dir.path().join("Catalog.names/abc").is_file());

        assert!(backend.delete("Catalog.names/abc").await.unwrap());
        assert_eq!(backend.fetch("Catalog.names/abc").await.unwrap(), None);
        assert!(!backend.delete("Catalog.names/abc").await.unwrap());
    }

    #[tokio::test]
    async fn test_filesystem_backend_expiry() {
        let dir = warmcache_test::tempdir();
        let backend = FilesystemBackend::new(dir.path());

        backend
            .store("Catalog.size/abc", Bytes::from_static(b"7"), Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(
            backend.fetch("Catalog.size/abc").await.unwrap(),
            Some(Bytes::from_static(b"7"))
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(backend.fetch("Catalog.size/abc").await.unwrap(), None);
        assert!(!dir.path().join("Catalog.size/abc").exists());
    }

    #[tokio::test]
    async fn test_filesystem_backend_truncated_entry() {
        let dir = warmcache_test::tempdir();
        let backend = FilesystemBackend::new(dir.path());
        std::fs::create_dir_all(dir.path().join("Catalog.size")).unwrap();
        std::fs::write(dir.path().join("Catalog.size/abc"), b"7").unwrap();

        assert_eq!(backend.fetch("Catalog.size/abc").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_filesystem_health_check() {
        let dir = warmcache_test::tempdir();
        let backend = FilesystemBackend::new(dir.path().join("shared"));
        backend.health_check().await.unwrap();
        assert!(dir.path().join("shared").is_dir());

        let file = dir.path().join("file");
        std::fs::write(&file, b"").unwrap();
        let backend = FilesystemBackend::new(file.join("shared"));
        assert!(backend.health_check().await.is_err());
    }
}
