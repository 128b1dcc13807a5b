//! Key/value backends standing in for browser local storage.
//!
//! Values are opaque strings (JSON text written by the record store). A
//! backend never caches: every `get` observes the latest `set`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::db::PgBackend;
use crate::error::StoreError;

pub trait KvBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

/// A single JSON object file holding every key.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the entries and whether the file was unreadable as JSON.
    async fn load(&self) -> Result<(BTreeMap<String, String>, bool), StoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok((BTreeMap::new(), false))
            }
            Err(err) => return Err(err.into()),
        };

        let content = match String::from_utf8(bytes) {
            Ok(content) => content,
            Err(err) => {
                warn!(
                    "storage file {} is not UTF-8, treating as empty: {}",
                    self.path.display(),
                    err
                );
                return Ok((BTreeMap::new(), true));
            }
        };

        if content.trim().is_empty() {
            return Ok((BTreeMap::new(), false));
        }

        match serde_json::from_str(&content) {
            Ok(entries) => Ok((entries, false)),
            Err(err) => {
                warn!(
                    "storage file {} is corrupt, treating as empty: {}",
                    self.path.display(),
                    err
                );
                Ok((BTreeMap::new(), true))
            }
        }
    }

    async fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let body = serde_json::to_string_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("persisted {} keys to {}", entries.len(), self.path.display());
        Ok(())
    }

    async fn update<F>(&self, apply: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut BTreeMap<String, String>),
    {
        let _guard = self.write_lock.lock().await;
        let (mut entries, corrupt) = self.load().await?;

        if corrupt {
            let backup = self.path.with_extension("json.corrupt");
            tokio::fs::copy(&self.path, &backup).await?;
            warn!("kept unreadable storage file as {}", backup.display());
        }

        apply(&mut entries);
        self.persist(&entries).await
    }
}

impl KvBackend for FileBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let (entries, _) = self.load().await?;
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.update(|entries| {
            entries.insert(key.to_string(), value.to_string());
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.update(|entries| {
            entries.remove(key);
        })
        .await
    }
}

/// The backend chosen at startup from configuration.
pub enum Backend {
    Memory(MemoryBackend),
    File(FileBackend),
    Postgres(PgBackend),
}

impl Backend {
    /// Directory of the file backend's data, used as a report anchor.
    pub fn data_dir(&self) -> Option<PathBuf> {
        match self {
            Backend::File(file) => file
                .path()
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf),
            _ => None,
        }
    }
}

impl KvBackend for Backend {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self {
            Backend::Memory(inner) => inner.get(key).await,
            Backend::File(inner) => inner.get(key).await,
            Backend::Postgres(inner) => inner.get(key).await,
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        match self {
            Backend::Memory(inner) => inner.set(key, value).await,
            Backend::File(inner) => inner.set(key, value).await,
            Backend::Postgres(inner) => inner.set(key, value).await,
        }
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        match self {
            Backend::Memory(inner) => inner.remove(key).await,
            Backend::File(inner) => inner.remove(key).await,
            Backend::Postgres(inner) => inner.remove(key).await,
        }
    }
}
