//! Shared key/value stores used for cross-context coordination.
//!
//! `SharedStore` is the small surface the coordinator needs: string reads and
//! writes plus change notifications. `MemoryStore` backs in-process contexts
//! (and tests); `FileStore` backs separate processes via one file per key.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use fs2::FileExt;
use tokio::sync::{broadcast, RwLock};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store io: {0}")]
    Io(#[from] std::io::Error),
}

/// A key was set (`value` present) or cleared (`value` absent).
#[derive(Debug, Clone)]
pub struct KeyChange {
    pub key: String,
    pub value: Option<String>,
}

#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn write(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
    /// Subscribe to changes for all keys in this store.
    fn watch(&self) -> broadcast::Receiver<KeyChange>;
}

/// In-memory store shared by cloning. All clones see the same entries and
/// the same change feed.
#[derive(Clone)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<String, String>>>,
    changes: broadcast::Sender<KeyChange>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            changes,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn write(&self, key: &str, value: &str) -> Result<(), StoreError> {
        // Send while holding the lock so peers see changes in write order.
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), value.to_string());
        let _ = self.changes.send(KeyChange {
            key: key.to_string(),
            value: Some(value.to_string()),
        });
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        if entries.remove(key).is_some() {
            let _ = self.changes.send(KeyChange {
                key: key.to_string(),
                value: None,
            });
        }
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<KeyChange> {
        self.changes.subscribe()
    }
}

/// File-backed store: one JSON file per key under a directory, guarded with
/// advisory file locks so concurrent processes see whole values.
///
/// Change events cover writes made through this instance only; claims written
/// by other processes are observed on the next read.
pub struct FileStore {
    dir: PathBuf,
    changes: broadcast::Sender<KeyChange>,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            dir: dir.into(),
            changes,
        }
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_key(key)))
    }
}

/// Keys may contain separators like `:`; flatten anything that is not safe
/// in a file name.
fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[async_trait]
impl SharedStore for FileStore {
    async fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.key_path(key);
        let contents = tokio::task::spawn_blocking(move || -> std::io::Result<Option<String>> {
            let mut file = match std::fs::File::open(&path) {
                Ok(file) => file,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(err) => return Err(err),
            };
            file.lock_shared()?;
            let mut contents = String::new();
            file.read_to_string(&mut contents)?;
            Ok(Some(contents))
        })
        .await
        .map_err(join_error)??;
        Ok(contents)
    }

    async fn write(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.key_path(key);
        let dir = self.dir.clone();
        let value_owned = value.to_string();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            std::fs::create_dir_all(&dir)?;
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;
            file.lock_exclusive()?;
            file.set_len(0)?;
            file.write_all(value_owned.as_bytes())?;
            file.flush()?;
            Ok(())
        })
        .await
        .map_err(join_error)??;
        let _ = self.changes.send(KeyChange {
            key: key.to_string(),
            value: Some(value.to_string()),
        });
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let path = self.key_path(key);
        let existed = tokio::task::spawn_blocking(move || -> std::io::Result<bool> {
            match std::fs::remove_file(&path) {
                Ok(()) => Ok(true),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(err) => Err(err),
            }
        })
        .await
        .map_err(join_error)??;
        if existed {
            let _ = self.changes.send(KeyChange {
                key: key.to_string(),
                value: None,
            });
        }
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<KeyChange> {
        self.changes.subscribe()
    }
}

fn join_error(err: tokio::task::JoinError) -> StoreError {
    StoreError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        err.to_string(),
    ))
}
