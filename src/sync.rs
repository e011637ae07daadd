use crate::error::{InitError, StorageError, TransportError};
use crate::message::{Message, MessageBus};
use crate::model::{Meta, NotebookFile, WebdavConfig, Word, now_millis};
use crate::notebook::NotebookStore;
use crate::storage::KvStore;
use crate::store::{ConfigStore, MetaStore};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A remote holding one copy of the notebook.
#[async_trait]
pub trait SyncService: Send + Sync {
    fn service_id(&self) -> &'static str;

    /// Prepares the remote for syncing. `meta` is the locally recorded state,
    /// used to detect a remote that is behind this device.
    async fn initialize(&self, config: &WebdavConfig, meta: &Meta) -> Result<(), InitError>;

    async fn upload(&self, config: &WebdavConfig, text: String) -> Result<StatusCode, TransportError>;

    async fn download_if_changed(
        &self,
        config: &WebdavConfig,
        meta: &Meta,
    ) -> Result<Download, TransportError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteFile {
    pub timestamp: Option<i64>,
    pub words: Vec<Word>,
    pub etag: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Download {
    Changed(RemoteFile),
    NotModified,
    /// The server answered without a usable file, e.g. 404 before the first upload.
    Absent { status: u16 },
    Stale { remote: i64, local: i64 },
    Invalid(InvalidPayload),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidPayload {
    #[error("malformed notebook file: {0}")]
    Malformed(String),
    #[error("words is not an array")]
    WordsNotArray,
    #[error("word {index} has no date")]
    WordMissingDate { index: usize },
    #[error("remote file has no timestamp")]
    MissingTimestamp,
}

/// Decides what a downloaded notebook file means relative to `meta`.
pub fn classify_remote(body: &[u8], etag: String, meta: &Meta) -> Download {
    let json: JsonValue = match serde_json::from_slice(body) {
        Ok(json) => json,
        Err(e) => return Download::Invalid(InvalidPayload::Malformed(e.to_string())),
    };
    let JsonValue::Object(mut object) = json else {
        return Download::Invalid(InvalidPayload::Malformed("not an object".to_string()));
    };

    let words = match object.remove("words") {
        Some(JsonValue::Array(words)) => words,
        _ => return Download::Invalid(InvalidPayload::WordsNotArray),
    };
    if let Some(index) = words.iter().position(|w| w.get("date").is_none()) {
        return Download::Invalid(InvalidPayload::WordMissingDate { index });
    }

    let timestamp = match object.get("timestamp") {
        None | Some(JsonValue::Null) => None,
        Some(JsonValue::Number(n)) => match n.as_i64() {
            Some(ts) => Some(ts),
            None => {
                return Download::Invalid(InvalidPayload::Malformed(format!(
                    "timestamp {} is not an integer",
                    n
                )));
            }
        },
        Some(other) => {
            return Download::Invalid(InvalidPayload::Malformed(format!("timestamp is {}", other)));
        }
    };

    if let Some(local) = meta.timestamp {
        let Some(remote) = timestamp else {
            return Download::Invalid(InvalidPayload::MissingTimestamp);
        };
        if remote <= local {
            return Download::Stale { remote, local };
        }
    }

    Download::Changed(RemoteFile {
        timestamp,
        words,
        etag,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    NoConfig,
    EmptyNotebook,
    InvalidPayload(InvalidPayload),
    Transport(String),
    Serialize(String),
    UploadFailed(u16),
    Storage(String),
}

/// Result of a best-effort sync cycle. None of these are errors: failures are
/// logged and left for the next cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Applied { timestamp: Option<i64> },
    Uploaded { timestamp: i64 },
    Unchanged,
    Skipped(SkipReason),
}

impl SyncOutcome {
    pub fn record(&self, stats: &mut SyncStats) {
        match self {
            SyncOutcome::Applied { .. } => stats.applied += 1,
            SyncOutcome::Uploaded { .. } => stats.uploaded += 1,
            SyncOutcome::Unchanged => stats.unchanged += 1,
            SyncOutcome::Skipped(_) => stats.skipped += 1,
        }
    }
}

#[derive(Debug, Default)]
pub struct SyncStats {
    pub applied: i32,
    pub uploaded: i32,
    pub unchanged: i32,
    pub skipped: i32,
}

fn log_skip(service_id: &str, reason: &SkipReason) {
    tracing::debug!(service_id, reason = ?reason, "sync skipped");
}

fn log_storage_error(service_id: &str, what: &str, e: &StorageError) {
    tracing::error!("Failed to {} for {}: {}", what, service_id, crate::unpack_error(e));
}

/// Orchestrates notebook sync for one service.
///
/// Calls are not serialized against each other: a manual upload running while
/// the periodic loop downloads may interleave their meta reads and writes.
pub struct Syncer {
    service: Arc<dyn SyncService>,
    configs: ConfigStore,
    metas: MetaStore,
    notebook: Arc<dyn NotebookStore>,
    bus: MessageBus,
}

impl Syncer {
    pub fn new(
        service: Arc<dyn SyncService>,
        kv: Arc<dyn KvStore>,
        notebook: Arc<dyn NotebookStore>,
        bus: MessageBus,
    ) -> Self {
        Self {
            service,
            configs: ConfigStore::new(kv.clone()),
            metas: MetaStore::new(kv),
            notebook,
            bus,
        }
    }

    pub fn service_id(&self) -> &'static str {
        self.service.service_id()
    }

    pub fn configs(&self) -> &ConfigStore {
        &self.configs
    }

    pub fn metas(&self) -> &MetaStore {
        &self.metas
    }

    async fn load_config(&self) -> Result<Option<WebdavConfig>, SkipReason> {
        self.configs.get(self.service_id()).await.map_err(|e| {
            log_storage_error(self.service_id(), "read sync config", &e);
            SkipReason::Storage(e.to_string())
        })
    }

    pub async fn initialize(&self, config: &WebdavConfig) -> Result<(), InitError> {
        let meta = match self.metas.get(self.service_id()).await {
            Ok(meta) => meta.unwrap_or_default(),
            Err(e) => {
                log_storage_error(self.service_id(), "read sync meta", &e);
                Meta::default()
            }
        };
        self.service.initialize(config, &meta).await?;
        tracing::info!(service_id = self.service_id(), url = %config.url, "remote initialized");
        Ok(())
    }

    pub async fn download_now(&self) -> SyncOutcome {
        match self.load_config().await {
            Ok(Some(config)) => self.download(&config).await,
            Ok(None) => {
                let reason = SkipReason::NoConfig;
                log_skip(self.service_id(), &reason);
                SyncOutcome::Skipped(reason)
            }
            Err(reason) => SyncOutcome::Skipped(reason),
        }
    }

    pub async fn upload_now(&self) -> SyncOutcome {
        let service_id = self.service_id();
        let config = match self.load_config().await {
            Ok(Some(config)) => config,
            Ok(None) => {
                let reason = SkipReason::NoConfig;
                log_skip(service_id, &reason);
                return SyncOutcome::Skipped(reason);
            }
            Err(reason) => return SyncOutcome::Skipped(reason),
        };

        // pick up newer remote words before overwriting them
        let pre = self.download(&config).await;
        tracing::debug!(service_id, outcome = ?pre, "pre-upload download finished");

        let words = match self.notebook.get_words().await {
            Ok(words) => words,
            Err(e) => {
                log_storage_error(service_id, "read notebook", &e);
                return SyncOutcome::Skipped(SkipReason::Storage(e.to_string()));
            }
        };
        if words.is_empty() {
            let reason = SkipReason::EmptyNotebook;
            log_skip(service_id, &reason);
            return SyncOutcome::Skipped(reason);
        }

        let timestamp = now_millis();
        let file = NotebookFile {
            timestamp: Some(timestamp),
            words,
        };
        let text = match serde_json::to_string(&file) {
            Ok(text) => text,
            Err(e) => {
                let reason = SkipReason::Serialize(e.to_string());
                log_skip(service_id, &reason);
                return SyncOutcome::Skipped(reason);
            }
        };

        match self.service.upload(&config, text).await {
            Ok(status) if status.is_success() => {}
            Ok(status) => {
                let reason = SkipReason::UploadFailed(status.as_u16());
                log_skip(service_id, &reason);
                return SyncOutcome::Skipped(reason);
            }
            Err(e) => {
                let reason = SkipReason::Transport(crate::unpack_error(&e));
                log_skip(service_id, &reason);
                return SyncOutcome::Skipped(reason);
            }
        }

        // the PUT response carries no etag we trust, so clear it
        let meta = Meta {
            timestamp: Some(timestamp),
            etag: Some(String::new()),
        };
        if let Err(e) = self.metas.set(service_id, &meta).await {
            log_storage_error(service_id, "write sync meta", &e);
            return SyncOutcome::Skipped(SkipReason::Storage(e.to_string()));
        }

        tracing::info!(service_id, timestamp, "notebook uploaded");
        self.bus.send(Message::NotebookSynced {
            service_id: service_id.to_string(),
            timestamp,
        });
        SyncOutcome::Uploaded { timestamp }
    }

    /// One download cycle: applies the remote file only if it is newer than
    /// the recorded meta.
    pub async fn download(&self, config: &WebdavConfig) -> SyncOutcome {
        let service_id = self.service_id();
        let meta = match self.metas.get(service_id).await {
            Ok(meta) => meta.unwrap_or_default(),
            Err(e) => {
                log_storage_error(service_id, "read sync meta", &e);
                return SyncOutcome::Skipped(SkipReason::Storage(e.to_string()));
            }
        };

        let remote = match self.service.download_if_changed(config, &meta).await {
            Ok(Download::Changed(remote)) => remote,
            Ok(Download::NotModified) => return SyncOutcome::Unchanged,
            Ok(Download::Absent { status }) => {
                tracing::debug!(service_id, status, "no remote notebook");
                return SyncOutcome::Unchanged;
            }
            Ok(Download::Stale { remote, local }) => {
                tracing::debug!(service_id, remote, local, "remote notebook is not newer");
                return SyncOutcome::Unchanged;
            }
            Ok(Download::Invalid(invalid)) => {
                let reason = SkipReason::InvalidPayload(invalid);
                log_skip(service_id, &reason);
                return SyncOutcome::Skipped(reason);
            }
            Err(e) => {
                let reason = SkipReason::Transport(crate::unpack_error(&e));
                log_skip(service_id, &reason);
                return SyncOutcome::Skipped(reason);
            }
        };

        let count = remote.words.len();
        if let Err(e) = self.notebook.save_words(remote.words).await {
            log_storage_error(service_id, "save notebook", &e);
            return SyncOutcome::Skipped(SkipReason::Storage(e.to_string()));
        }

        let meta = Meta {
            timestamp: remote.timestamp,
            etag: Some(remote.etag),
        };
        if let Err(e) = self.metas.set(service_id, &meta).await {
            log_storage_error(service_id, "write sync meta", &e);
            return SyncOutcome::Skipped(SkipReason::Storage(e.to_string()));
        }

        tracing::info!(service_id, count, timestamp = ?remote.timestamp, "remote notebook applied");
        if let Some(timestamp) = remote.timestamp {
            self.bus.send(Message::NotebookSynced {
                service_id: service_id.to_string(),
                timestamp,
            });
        }
        SyncOutcome::Applied {
            timestamp: remote.timestamp,
        }
    }

    /// Downloads whenever a config is present: once right away, then every
    /// `config.duration`. A config change restarts the cadence. Runs until
    /// `cancel` fires.
    pub async fn run_periodic(&self, cancel: CancellationToken) -> SyncStats {
        let service_id = self.service_id();
        let configs = self.configs.watch(service_id);
        tokio::pin!(configs);

        let mut stats = SyncStats::default();
        let mut current: Option<WebdavConfig> = None;

        loop {
            let config = match current.clone() {
                Some(config) => config,
                None => {
                    tracing::debug!(service_id, "no sync config, idling");
                    tokio::select! {
                        next = configs.next() => match next {
                            Some(config) => current = config,
                            None => break,
                        },
                        _ = cancel.cancelled() => break,
                    }
                    continue;
                }
            };

            tokio::select! {
                outcome = self.download(&config) => outcome.record(&mut stats),
                _ = cancel.cancelled() => break,
            }

            tokio::select! {
                next = configs.next() => match next {
                    Some(config) => {
                        tracing::debug!(service_id, "sync config changed");
                        current = config;
                    }
                    None => break,
                },
                _ = tokio::time::sleep(config.interval()) => {}
                _ = cancel.cancelled() => break,
            }
        }

        tracing::info!(
            service_id,
            applied = stats.applied,
            uploaded = stats.uploaded,
            unchanged = stats.unchanged,
            skipped = stats.skipped,
            "periodic sync stopped"
        );
        stats
    }
}
