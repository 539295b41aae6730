//! Durable key-value storage used by the offline queue and pointer cache.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Async key-value store. Keys are `/`-separated paths of safe segments.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Ensure each key segment is safe for filesystem operations.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::Storage("key cannot be empty".into()));
    }
    for segment in key.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(Error::Storage(format!("invalid key segment in `{key}`")));
        }
        if segment.contains('\\') || segment.chars().any(|c| c.is_control()) {
            return Err(Error::Storage(format!("invalid character in key `{key}`")));
        }
    }
    Ok(())
}

/// One file per key under `root`, written atomically.
#[derive(Debug, Clone)]
pub struct FileKvStore {
    root: PathBuf,
}

impl FileKvStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

fn write_atomic(path: &Path, value: &str) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::Storage(format!("missing parent for {}", path.display())))?;
    fs::create_dir_all(parent)?;
    let tmp = tempfile::NamedTempFile::new_in(parent)?;
    fs::write(tmp.path(), value)?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

#[async_trait]
impl KvStore for FileKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path(key)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path(key)?;
        let value = value.to_string();
        tokio::task::spawn_blocking(move || write_atomic(&path, &value)).await?
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Volatile store for tests and sessions without a data directory.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    map: Mutex<HashMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.map.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        validate_key(key)?;
        self.map.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.map.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn file_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let kv = FileKvStore::new(dir.path());
        assert_eq!(kv.get("offline-edits").await.unwrap(), None);
        kv.set("latest/p1.0.", "aa11").await.unwrap();
        kv.set("latest/p1.0.", "bb22").await.unwrap();
        assert_eq!(
            kv.get("latest/p1.0.").await.unwrap().as_deref(),
            Some("bb22")
        );
        assert!(dir.path().join("latest/p1.0.").exists());
        kv.delete("latest/p1.0.").await.unwrap();
        kv.delete("latest/p1.0.").await.unwrap();
        assert_eq!(kv.get("latest/p1.0.").await.unwrap(), None);
    }

    #[tokio::test]
    async fn rejects_unsafe_keys() {
        let dir = TempDir::new().unwrap();
        let kv = FileKvStore::new(dir.path());
        for key in ["", "../escape", "a//b", "a/./b", "bad\\key", "ctl\u{7}"] {
            assert!(kv.set(key, "x").await.is_err(), "accepted {key:?}");
        }
        assert!(MemoryKvStore::new().set("..", "x").await.is_err());
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let kv = MemoryKvStore::new();
        kv.set("k", "v").await.unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));
        kv.delete("k").await.unwrap();
        assert!(kv.get("k").await.unwrap().is_none());
    }
}
