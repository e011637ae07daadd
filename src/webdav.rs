use crate::error::{InitError, TransportError};
use crate::model::{Meta, REMOTE_DIR, WEBDAV_SERVICE_ID, WebdavConfig};
use crate::sync::{Download, SyncService, classify_remote};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use quick_xml::Reader;
use quick_xml::events::Event;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use std::time::Duration;

/// One `<response>` of a PROPFIND multistatus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DavEntry {
    pub href: String,
    pub is_collection: bool,
}

/// Extracts href and collection flag of every response. Namespace prefixes
/// are ignored.
pub fn parse_multistatus(xml: &str) -> Result<Vec<DavEntry>, InitError> {
    let parse_error = |e: quick_xml::Error| InitError::Parse(e.to_string());
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut seen_root = false;
    let mut current: Option<DavEntry> = None;
    let mut in_href = false;
    let mut in_resourcetype = false;

    loop {
        match reader.read_event().map_err(parse_error)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"multistatus" => seen_root = true,
                b"response" => {
                    current = Some(DavEntry {
                        href: String::new(),
                        is_collection: false,
                    })
                }
                b"href" => in_href = current.is_some(),
                b"resourcetype" => in_resourcetype = true,
                b"collection" if in_resourcetype => {
                    if let Some(entry) = current.as_mut() {
                        entry.is_collection = true;
                    }
                }
                _ => {}
            },
            Event::Empty(e) => {
                if in_resourcetype && e.local_name().as_ref() == b"collection" {
                    if let Some(entry) = current.as_mut() {
                        entry.is_collection = true;
                    }
                }
            }
            Event::Text(t) if in_href => {
                if let Some(entry) = current.as_mut() {
                    entry.href.push_str(&t.unescape().map_err(parse_error)?);
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"response" => {
                    if let Some(entry) = current.take() {
                        entries.push(entry);
                    }
                }
                b"href" => in_href = false,
                b"resourcetype" => in_resourcetype = false,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    if !seen_root {
        return Err(InitError::Parse("no multistatus element".to_string()));
    }
    Ok(entries)
}

fn basic_auth(config: &WebdavConfig) -> String {
    format!(
        "Basic {}",
        STANDARD.encode(format!("{}:{}", config.user, config.passwd))
    )
}

fn method(name: &'static str) -> Result<Method, TransportError> {
    Method::from_bytes(name.as_bytes()).map_err(|e| TransportError::Other(format!("{}: {}", name, e)))
}

pub struct WebdavService {
    client: Client,
}

impl WebdavService {
    pub fn new(timeout: Option<Duration>) -> Result<Self, TransportError> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(TransportError::Client)?;
        Ok(Self { client })
    }

    fn request(&self, method: Method, url: &str, config: &WebdavConfig) -> RequestBuilder {
        self.client
            .request(method, url)
            .header(AUTHORIZATION, basic_auth(config))
    }

    async fn send(&self, builder: RequestBuilder, method: &str, url: &str) -> Result<reqwest::Response, TransportError> {
        tracing::debug!(method, url, "webdav request");
        builder.send().await.map_err(|source| TransportError::Request {
            method: method.to_string(),
            url: url.to_string(),
            source,
        })
    }

    async fn ensure_dir(&self, config: &WebdavConfig) -> Result<(), InitError> {
        let url = config.url.as_str();
        let propfind = self
            .request(method("PROPFIND")?, url, config)
            .header("Depth", "2");
        let response = self.send(propfind, "PROPFIND", url).await?;

        let status = response.status();
        if !status.is_success() {
            return Err(InitError::Network(format!("PROPFIND {} returned {}", url, status)));
        }
        let body = response
            .text()
            .await
            .map_err(|e| InitError::Network(e.to_string()))?;

        let entries = parse_multistatus(&body)?;
        match entries.iter().find(|entry| entry.href.ends_with(REMOTE_DIR)) {
            Some(entry) if entry.is_collection => Ok(()),
            Some(entry) => Err(InitError::Dir {
                href: entry.href.clone(),
            }),
            None => self.create_dir(config).await,
        }
    }

    async fn create_dir(&self, config: &WebdavConfig) -> Result<(), InitError> {
        let url = config.dir_url();
        let mkcol = self.request(method("MKCOL")?, &url, config);
        match self.send(mkcol, "MKCOL", &url).await {
            Ok(response) if response.status().is_success() => {
                tracing::info!(url = %url, "created remote directory");
                Ok(())
            }
            Ok(response) => Err(InitError::Mkcol {
                url,
                detail: response.status().to_string(),
            }),
            Err(e) => Err(InitError::Mkcol {
                url,
                detail: crate::unpack_error(&e),
            }),
        }
    }
}

#[async_trait]
impl SyncService for WebdavService {
    fn service_id(&self) -> &'static str {
        WEBDAV_SERVICE_ID
    }

    async fn initialize(&self, config: &WebdavConfig, meta: &Meta) -> Result<(), InitError> {
        self.ensure_dir(config).await?;

        let Some(local) = meta.timestamp else {
            return Ok(());
        };
        // unconditional fetch so the remote timestamp can be compared
        if let Download::Changed(remote) = self.download_if_changed(config, &Meta::default()).await? {
            if let Some(remote) = remote.timestamp.filter(|remote| *remote < local) {
                return Err(InitError::Exist { local, remote });
            }
        }
        Ok(())
    }

    async fn upload(&self, config: &WebdavConfig, text: String) -> Result<StatusCode, TransportError> {
        let url = config.file_url();
        let put = self
            .request(Method::PUT, &url, config)
            .header(CONTENT_TYPE, "application/json")
            .body(text);
        let response = self.send(put, "PUT", &url).await?;
        Ok(response.status())
    }

    async fn download_if_changed(
        &self,
        config: &WebdavConfig,
        meta: &Meta,
    ) -> Result<Download, TransportError> {
        let url = config.file_url();
        let mut get = self.request(Method::GET, &url, config);
        if let Some(etag) = meta.etag.as_deref().filter(|etag| !etag.is_empty()) {
            get = get.header(IF_NONE_MATCH, etag).header(IF_MODIFIED_SINCE, etag);
        }

        let response = self.send(get, "GET", &url).await?;
        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            return Ok(Download::NotModified);
        }
        if !status.is_success() {
            return Ok(Download::Absent {
                status: status.as_u16(),
            });
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response.bytes().await.map_err(|source| TransportError::Request {
            method: "GET".to_string(),
            url: url.clone(),
            source,
        })?;

        Ok(classify_remote(&body, etag, meta))
    }
}
