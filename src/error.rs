use std::{error::Error, fmt};

#[derive(Debug)]
pub enum StorageError {
    SerdeError(serde_json::Error),
    IoError(std::io::Error),
    LockError(String),
    InvalidValue(String),
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        use StorageError::*;
        match self {
            SerdeError(e) => Some(e as &dyn Error),
            IoError(e) => Some(e as &dyn Error),
            _ => None,
        }
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use StorageError::*;
        match self {
            SerdeError(e) => write!(f, "SerdeError: {}", e),
            IoError(e) => write!(f, "IoError: {}", e),
            LockError(s) => write!(f, "LockError: {}", s),
            InvalidValue(s) => write!(f, "InvalidValue: {}", s),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(error: serde_json::Error) -> Self {
        StorageError::SerdeError(error)
    }
}

impl From<std::io::Error> for StorageError {
    fn from(error: std::io::Error) -> Self {
        StorageError::IoError(error)
    }
}

/// Failure of a single HTTP exchange with the remote.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("{method} {url} failed")]
    Request {
        method: String,
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("client setup failed")]
    Client(#[source] reqwest::Error),
    #[error("{0}")]
    Other(String),
}

/// Reasons `initialize` can refuse to proceed. Every variant needs a caller
/// decision; `reason()` gives the short code used in user messaging.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("network: {0}")]
    Network(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("mkcol: could not create {url}: {detail}")]
    Mkcol { url: String, detail: String },
    #[error("dir: {href} exists but is not a directory")]
    Dir { href: String },
    #[error("exist: local notebook ({local}) is newer than the remote copy ({remote})")]
    Exist { local: i64, remote: i64 },
}

impl InitError {
    pub fn reason(&self) -> &'static str {
        match self {
            InitError::Network(_) => "network",
            InitError::Parse(_) => "parse",
            InitError::Mkcol { .. } => "mkcol",
            InitError::Dir { .. } => "dir",
            InitError::Exist { .. } => "exist",
        }
    }
}

impl From<TransportError> for InitError {
    fn from(error: TransportError) -> Self {
        InitError::Network(crate::unpack_error(&error))
    }
}
