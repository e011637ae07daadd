//! Key-value storage with per-key change notification.
//!
//! Values live in one of two areas: `Sync` for settings that follow the user
//! between installs, `Local` for per-device state such as the notebook and
//! sync metadata. [`MemoryStore`] keeps everything in process; [`FileStore`]
//! additionally mirrors it to a JSON file.

use crate::error::StorageError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tokio::sync::{Mutex, broadcast};

const CHANGE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageArea {
    Sync,
    Local,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StorageChange {
    pub area: StorageArea,
    pub key: String,
    pub old_value: Option<JsonValue>,
    pub new_value: Option<JsonValue>,
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, area: StorageArea, key: &str) -> Result<Option<JsonValue>, StorageError>;
    async fn set(&self, area: StorageArea, key: &str, value: JsonValue) -> Result<(), StorageError>;
    async fn remove(&self, area: StorageArea, key: &str) -> Result<(), StorageError>;
    /// Changes to `key` in `area` made after this call.
    fn subscribe(&self, area: StorageArea, key: &str) -> Subscription;
}

impl dyn KvStore {
    pub async fn get_as<T: DeserializeOwned>(
        &self,
        area: StorageArea,
        key: &str,
    ) -> Result<Option<T>, StorageError> {
        match self.get(area, key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn set_as<T: Serialize + ?Sized>(
        &self,
        area: StorageArea,
        key: &str,
        value: &T,
    ) -> Result<(), StorageError> {
        self.set(area, key, serde_json::to_value(value)?).await
    }
}

/// Handle on a stream of changes to one key. Dropping it unsubscribes.
pub struct Subscription {
    area: StorageArea,
    key: String,
    rx: broadcast::Receiver<StorageChange>,
}

impl Subscription {
    /// Waits for the next change. `None` once the store is gone.
    pub async fn next(&mut self) -> Option<StorageChange> {
        loop {
            match self.rx.recv().await {
                Ok(change) if change.area == self.area && change.key == self.key => {
                    return Some(change);
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(key = %self.key, skipped, "storage subscription lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

pub struct MemoryStore {
    entries: RwLock<HashMap<(StorageArea, String), JsonValue>>,
    changes: broadcast::Sender<StorageChange>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            entries: RwLock::new(HashMap::new()),
            changes,
        }
    }

    fn with_entries(entries: HashMap<(StorageArea, String), JsonValue>) -> Self {
        let store = Self::new();
        if let Ok(mut guard) = store.entries.write() {
            *guard = entries;
        }
        store
    }

    fn write(
        &self,
        area: StorageArea,
        key: &str,
        value: Option<JsonValue>,
    ) -> Result<(), StorageError> {
        let old_value = {
            let mut entries = self
                .entries
                .write()
                .map_err(|e| StorageError::LockError(e.to_string()))?;
            match &value {
                Some(v) => entries.insert((area, key.to_string()), v.clone()),
                None => entries.remove(&(area, key.to_string())),
            }
        };

        if old_value.is_none() && value.is_none() {
            return Ok(());
        }

        // no receivers is fine
        let _ = self.changes.send(StorageChange {
            area,
            key: key.to_string(),
            old_value,
            new_value: value,
        });
        Ok(())
    }

    /// Current contents with one pending write applied on top.
    fn snapshot_with(
        &self,
        area: StorageArea,
        key: &str,
        value: Option<&JsonValue>,
    ) -> Result<Snapshot, StorageError> {
        let entries = self
            .entries
            .read()
            .map_err(|e| StorageError::LockError(e.to_string()))?;
        let mut snapshot = Snapshot::default();
        for ((area, key), value) in entries.iter() {
            snapshot.area_mut(*area).insert(key.clone(), value.clone());
        }
        match value {
            Some(v) => snapshot.area_mut(area).insert(key.to_string(), v.clone()),
            None => snapshot.area_mut(area).remove(key),
        };
        Ok(snapshot)
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, area: StorageArea, key: &str) -> Result<Option<JsonValue>, StorageError> {
        let entries = self
            .entries
            .read()
            .map_err(|e| StorageError::LockError(e.to_string()))?;
        Ok(entries.get(&(area, key.to_string())).cloned())
    }

    async fn set(&self, area: StorageArea, key: &str, value: JsonValue) -> Result<(), StorageError> {
        self.write(area, key, Some(value))
    }

    async fn remove(&self, area: StorageArea, key: &str) -> Result<(), StorageError> {
        self.write(area, key, None)
    }

    fn subscribe(&self, area: StorageArea, key: &str) -> Subscription {
        Subscription {
            area,
            key: key.to_string(),
            rx: self.changes.subscribe(),
        }
    }
}

/// On-disk layout of a [`FileStore`].
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    sync: BTreeMap<String, JsonValue>,
    #[serde(default)]
    local: BTreeMap<String, JsonValue>,
}

impl Snapshot {
    fn area_mut(&mut self, area: StorageArea) -> &mut BTreeMap<String, JsonValue> {
        match area {
            StorageArea::Sync => &mut self.sync,
            StorageArea::Local => &mut self.local,
        }
    }
}

/// A [`MemoryStore`] persisted to a JSON file after every write.
pub struct FileStore {
    path: PathBuf,
    inner: MemoryStore,
    tx_lock: Mutex<()>,
}

impl FileStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let snapshot: Snapshot = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => Snapshot::default(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Snapshot::default(),
            Err(e) => return Err(e.into()),
        };

        let mut entries = HashMap::new();
        for (key, value) in snapshot.sync {
            entries.insert((StorageArea::Sync, key), value);
        }
        for (key, value) in snapshot.local {
            entries.insert((StorageArea::Local, key), value);
        }

        tracing::debug!(path = ?path, entries = entries.len(), "opened store");
        Ok(Self {
            path,
            inner: MemoryStore::with_entries(entries),
            tx_lock: Mutex::new(()),
        })
    }

    /// Writes the file with the change applied, then commits it in memory.
    /// A failed write leaves both memory and subscribers untouched.
    async fn write_through(
        &self,
        area: StorageArea,
        key: &str,
        value: Option<JsonValue>,
    ) -> Result<(), StorageError> {
        let _guard = self.tx_lock.lock().await;
        let snapshot = self.inner.snapshot_with(area, key, value.as_ref())?;
        self.persist(&snapshot).await?;
        self.inner.write(area, key, value)
    }

    async fn persist(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl KvStore for FileStore {
    async fn get(&self, area: StorageArea, key: &str) -> Result<Option<JsonValue>, StorageError> {
        self.inner.get(area, key).await
    }

    async fn set(&self, area: StorageArea, key: &str, value: JsonValue) -> Result<(), StorageError> {
        self.write_through(area, key, Some(value)).await
    }

    async fn remove(&self, area: StorageArea, key: &str) -> Result<(), StorageError> {
        self.write_through(area, key, None).await
    }

    fn subscribe(&self, area: StorageArea, key: &str) -> Subscription {
        self.inner.subscribe(area, key)
    }
}
