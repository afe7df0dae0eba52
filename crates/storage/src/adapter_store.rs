use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Result, StoreError};

/// Contents of a located adapter file.
#[derive(Debug, Clone)]
pub struct LocatedAdapter {
    pub size_bytes: u64,
    pub bytes: Bytes,
}

impl LocatedAdapter {
    pub fn new(bytes: Bytes) -> Self {
        Self {
            size_bytes: bytes.len() as u64,
            bytes,
        }
    }
}

/// Where adapter files live on this machine.
#[async_trait]
pub trait AdapterStore: Send + Sync {
    /// `Ok(None)` when no adapter of that name exists.
    async fn locate(&self, name: &str) -> Result<Option<LocatedAdapter>>;
    async fn store(&self, name: &str, bytes: &[u8]) -> Result<()>;
    async fn list(&self) -> Result<Vec<String>>;

    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.locate(name).await?.is_some())
    }
}

fn check_name(name: &str) -> Result<()> {
    let valid = !name.trim().is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(name.to_string()))
    }
}

#[derive(Default)]
pub struct MemoryAdapterStore {
    files: RwLock<BTreeMap<String, Bytes>>,
}

impl MemoryAdapterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, bytes: impl Into<Bytes>) {
        self.files.write().insert(name.into(), bytes.into());
    }

    pub fn delete(&self, name: &str) -> bool {
        self.files.write().remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Bytes> {
        self.files.read().get(name).cloned()
    }
}

#[async_trait]
impl AdapterStore for MemoryAdapterStore {
    async fn locate(&self, name: &str) -> Result<Option<LocatedAdapter>> {
        Ok(self.get(name).map(LocatedAdapter::new))
    }

    async fn store(&self, name: &str, bytes: &[u8]) -> Result<()> {
        check_name(name)?;
        self.insert(name, Bytes::copy_from_slice(bytes));
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.files.read().keys().cloned().collect())
    }
}

/// Adapters as plain files in one directory, named after the adapter.
pub struct DirectoryAdapterStore {
    root: PathBuf,
}

impl DirectoryAdapterStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl AdapterStore for DirectoryAdapterStore {
    async fn locate(&self, name: &str) -> Result<Option<LocatedAdapter>> {
        if check_name(name).is_err() {
            return Ok(None);
        }
        let path = self.root.join(name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                debug!(adapter = %name, bytes = bytes.len(), "Located adapter");
                Ok(Some(LocatedAdapter::new(Bytes::from(bytes))))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn store(&self, name: &str, bytes: &[u8]) -> Result<()> {
        check_name(name)?;
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.root.join(name);
        let tmp = self.root.join(format!(".{name}.partial"));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(adapter = %name, bytes = bytes.len(), "Stored adapter");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryAdapterStore::new();
        assert!(store.locate("missing").await.unwrap().is_none());

        store.store("gemma-lora-v1", b"weights").await.unwrap();
        let located = store.locate("gemma-lora-v1").await.unwrap().unwrap();
        assert_eq!(located.size_bytes, 7);
        assert_eq!(&located.bytes[..], b"weights");
        assert!(store.exists("gemma-lora-v1").await.unwrap());
    }

    #[tokio::test]
    async fn test_directory_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryAdapterStore::new(dir.path().join("adapters"));

        assert!(store.list().await.unwrap().is_empty());
        store.store("b-adapter", b"bbb").await.unwrap();
        store.store("a-adapter", b"aa").await.unwrap();

        assert_eq!(store.list().await.unwrap(), vec!["a-adapter", "b-adapter"]);
        let located = store.locate("b-adapter").await.unwrap().unwrap();
        assert_eq!(located.size_bytes, 3);
        assert!(store.locate("c-adapter").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_directory_store_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryAdapterStore::new(dir.path());
        assert!(store.store("../evil", b"x").await.is_err());
        assert!(store.locate("../evil").await.unwrap().is_none());
    }
}
