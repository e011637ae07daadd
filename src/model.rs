use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Duration;

/// The only remote backend currently supported.
pub const WEBDAV_SERVICE_ID: &str = "webdav";

pub const REMOTE_DIR: &str = "Saladict/";
pub const REMOTE_FILE: &str = "notebook.json";

const DEFAULT_DURATION_MS: u64 = 15 * 60 * 1000;
const MIN_DURATION_MS: u64 = 1000;

fn default_duration() -> u64 {
    DEFAULT_DURATION_MS
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebdavConfig {
    pub url: String,
    pub user: String,
    pub passwd: String,
    /// Milliseconds between periodic downloads.
    #[serde(default = "default_duration")]
    pub duration: u64,
}

impl WebdavConfig {
    /// Returns the config with a trailing slash on `url`.
    pub fn normalized(mut self) -> Self {
        if !self.url.ends_with('/') {
            self.url.push('/');
        }
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.duration.max(MIN_DURATION_MS))
    }

    pub fn dir_url(&self) -> String {
        format!("{}{}", self.url, REMOTE_DIR)
    }

    pub fn file_url(&self) -> String {
        format!("{}{}{}", self.url, REMOTE_DIR, REMOTE_FILE)
    }
}

/// Fingerprint of the last remote state reconciled for a service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// A saved word. Opaque to sync apart from the `date` field.
pub type Word = JsonValue;

/// Wire format of `Saladict/notebook.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotebookFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    pub words: Vec<Word>,
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
