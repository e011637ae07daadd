use crate::error::StorageError;
use crate::model::{Meta, WebdavConfig};
use crate::storage::{KvStore, StorageArea, Subscription};
use futures_util::Stream;
use futures_util::stream;
use serde_json::{Map, Value as JsonValue};
use std::sync::Arc;

/// Key of the map `{ serviceID: config }` in the sync area.
pub const SYNC_CONFIG_KEY: &str = "syncConfig";

pub fn meta_key(service_id: &str) -> String {
    format!("syncMeta.{}", service_id)
}

#[derive(Clone)]
pub struct ConfigStore {
    kv: Arc<dyn KvStore>,
}

impl ConfigStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    async fn load_map(&self) -> Result<Map<String, JsonValue>, StorageError> {
        match self.kv.get(StorageArea::Sync, SYNC_CONFIG_KEY).await? {
            Some(JsonValue::Object(map)) => Ok(map),
            Some(JsonValue::Null) | None => Ok(Map::new()),
            Some(other) => Err(StorageError::InvalidValue(format!(
                "{} is not an object: {}",
                SYNC_CONFIG_KEY, other
            ))),
        }
    }

    pub async fn get(&self, service_id: &str) -> Result<Option<WebdavConfig>, StorageError> {
        let map = self.load_map().await?;
        match map.get(service_id) {
            Some(JsonValue::Null) | None => Ok(None),
            Some(value) => {
                let config: WebdavConfig = serde_json::from_value(value.clone())?;
                Ok(Some(config.normalized()))
            }
        }
    }

    pub async fn set(&self, service_id: &str, config: &WebdavConfig) -> Result<(), StorageError> {
        let mut map = self.load_map().await?;
        let value = serde_json::to_value(config)?;
        if map.get(service_id) == Some(&value) {
            return Ok(());
        }
        map.insert(service_id.to_string(), value);
        self.kv
            .set(StorageArea::Sync, SYNC_CONFIG_KEY, JsonValue::Object(map))
            .await
    }

    pub async fn remove(&self, service_id: &str) -> Result<(), StorageError> {
        let mut map = self.load_map().await?;
        if map.remove(service_id).is_none() {
            return Ok(());
        }
        self.kv
            .set(StorageArea::Sync, SYNC_CONFIG_KEY, JsonValue::Object(map))
            .await
    }

    /// The current config for `service_id`, then one item per change to it.
    /// Writes that leave this service's entry untouched are not yielded.
    pub fn watch(&self, service_id: &str) -> impl Stream<Item = Option<WebdavConfig>> + Send + 'static {
        let subscription = self.kv.subscribe(StorageArea::Sync, SYNC_CONFIG_KEY);
        let state = WatchState {
            store: self.clone(),
            service_id: service_id.to_string(),
            subscription,
            last: None,
        };

        stream::unfold(state, |mut state| async move {
            loop {
                if state.last.is_some() {
                    state.subscription.next().await?;
                }

                let current = match state.store.get(&state.service_id).await {
                    Ok(config) => config,
                    Err(e) => {
                        tracing::warn!(service_id = %state.service_id, error = %e, "unreadable sync config");
                        None
                    }
                };

                if state.last.as_ref() == Some(&current) {
                    continue;
                }
                state.last = Some(current.clone());
                return Some((current, state));
            }
        })
    }
}

struct WatchState {
    store: ConfigStore,
    service_id: String,
    subscription: Subscription,
    last: Option<Option<WebdavConfig>>,
}

/// Per-service [`Meta`], stored as a JSON-encoded string in the local area.
#[derive(Clone)]
pub struct MetaStore {
    kv: Arc<dyn KvStore>,
}

impl MetaStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub async fn get(&self, service_id: &str) -> Result<Option<Meta>, StorageError> {
        match self.kv.get(StorageArea::Local, &meta_key(service_id)).await? {
            Some(JsonValue::String(text)) => Ok(Some(serde_json::from_str(&text)?)),
            Some(JsonValue::Null) | None => Ok(None),
            Some(other) => Err(StorageError::InvalidValue(format!(
                "meta for {} is not a string: {}",
                service_id, other
            ))),
        }
    }

    pub async fn set(&self, service_id: &str, meta: &Meta) -> Result<(), StorageError> {
        let text = serde_json::to_string(meta)?;
        self.kv
            .set(StorageArea::Local, &meta_key(service_id), JsonValue::String(text))
            .await
    }
}
