use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use notebook_sync::error::InitError;
use notebook_sync::message::MessageBus;
use notebook_sync::model::{Meta, WebdavConfig};
use notebook_sync::notebook::{KvNotebook, NotebookStore};
use notebook_sync::storage::{KvStore, MemoryStore};
use notebook_sync::sync::{Download, InvalidPayload, SkipReason, SyncOutcome, SyncService, Syncer};
use notebook_sync::webdav::WebdavService;
use serde_json::json;

#[derive(Debug, Clone)]
struct Recorded {
    method: String,
    path: String,
    headers: HeaderMap,
}

struct FakeDav {
    requests: Vec<Recorded>,
    propfind_status: StatusCode,
    propfind_body: String,
    mkcol_status: StatusCode,
    put_status: StatusCode,
    file: Option<(String, String)>,
    next_etag: u32,
}

impl FakeDav {
    fn new(propfind_body: &str) -> Self {
        Self {
            requests: Vec::new(),
            propfind_status: StatusCode::MULTI_STATUS,
            propfind_body: propfind_body.to_string(),
            mkcol_status: StatusCode::CREATED,
            put_status: StatusCode::CREATED,
            file: None,
            next_etag: 1,
        }
    }

    fn count(&self, method: &str) -> usize {
        self.requests.iter().filter(|r| r.method == method).count()
    }
}

type Shared = Arc<Mutex<FakeDav>>;

async fn handle(State(state): State<Shared>, method: Method, uri: Uri, headers: HeaderMap, body: String) -> Response {
    let mut dav = state.lock().unwrap();
    dav.requests.push(Recorded {
        method: method.to_string(),
        path: uri.path().to_string(),
        headers: headers.clone(),
    });

    match method.as_str() {
        "PROPFIND" => (dav.propfind_status, dav.propfind_body.clone()).into_response(),
        "MKCOL" => dav.mkcol_status.into_response(),
        "PUT" => {
            if dav.put_status.is_success() {
                let etag = format!("\"v{}\"", dav.next_etag);
                dav.next_etag += 1;
                dav.file = Some((body, etag));
            }
            dav.put_status.into_response()
        }
        "GET" => match &dav.file {
            Some((_, etag)) if headers.get(header::IF_NONE_MATCH).and_then(|v| v.to_str().ok()) == Some(etag.as_str()) => {
                StatusCode::NOT_MODIFIED.into_response()
            }
            Some((content, etag)) => (StatusCode::OK, [(header::ETAG, etag.clone())], content.clone()).into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        },
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

async fn spawn_server(dav: FakeDav) -> (Shared, WebdavConfig) {
    let state: Shared = Arc::new(Mutex::new(dav));
    let app = Router::new().fallback(handle).with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (state, config_for(addr))
}

fn config_for(addr: SocketAddr) -> WebdavConfig {
    WebdavConfig {
        url: format!("http://{}/dav/", addr),
        user: "alice".to_string(),
        passwd: "secret".to_string(),
        duration: 60_000,
    }
}

fn multistatus(saladict: Option<bool>) -> String {
    let entry = match saladict {
        Some(true) => "<d:response><d:href>/dav/Saladict/</d:href><d:propstat><d:prop><d:resourcetype><d:collection/></d:resourcetype></d:prop></d:propstat></d:response>",
        Some(false) => "<d:response><d:href>/dav/Saladict/</d:href><d:propstat><d:prop><d:resourcetype/></d:prop></d:propstat></d:response>",
        None => "",
    };
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?><d:multistatus xmlns:d="DAV:"><d:response><d:href>/dav/</d:href><d:propstat><d:prop><d:resourcetype><d:collection/></d:resourcetype></d:prop></d:propstat></d:response>{}</d:multistatus>"#,
        entry
    )
}

fn service() -> WebdavService {
    WebdavService::new(None).unwrap()
}

#[tokio::test]
async fn test_initialize_existing_directory() {
    let (state, config) = spawn_server(FakeDav::new(&multistatus(Some(true)))).await;

    service().initialize(&config, &Meta::default()).await.unwrap();

    let dav = state.lock().unwrap();
    assert_eq!(dav.count("PROPFIND"), 1);
    assert_eq!(dav.count("MKCOL"), 0);
    let propfind = &dav.requests[0];
    assert_eq!(propfind.path, "/dav/");
    assert_eq!(propfind.headers.get("depth").unwrap(), "2");
    assert_eq!(propfind.headers.get(header::AUTHORIZATION).unwrap(), "Basic YWxpY2U6c2VjcmV0");
}

#[tokio::test]
async fn test_initialize_rejects_non_directory() {
    let (state, config) = spawn_server(FakeDav::new(&multistatus(Some(false)))).await;

    let err = service().initialize(&config, &Meta::default()).await.unwrap_err();
    assert_eq!(err.reason(), "dir");
    assert!(matches!(err, InitError::Dir { ref href } if href == "/dav/Saladict/"));
    assert_eq!(state.lock().unwrap().count("MKCOL"), 0);
}

#[tokio::test]
async fn test_initialize_creates_missing_directory() {
    let (state, config) = spawn_server(FakeDav::new(&multistatus(None))).await;

    service().initialize(&config, &Meta::default()).await.unwrap();

    let dav = state.lock().unwrap();
    assert_eq!(dav.count("MKCOL"), 1);
    let mkcol = dav.requests.iter().find(|r| r.method == "MKCOL").unwrap();
    assert_eq!(mkcol.path, "/dav/Saladict/");
}

#[tokio::test]
async fn test_initialize_reports_failed_mkcol() {
    let mut dav = FakeDav::new(&multistatus(None));
    dav.mkcol_status = StatusCode::METHOD_NOT_ALLOWED;
    let (state, config) = spawn_server(dav).await;

    let err = service().initialize(&config, &Meta::default()).await.unwrap_err();
    assert_eq!(err.reason(), "mkcol");
    assert_eq!(state.lock().unwrap().count("MKCOL"), 1);
}

#[tokio::test]
async fn test_initialize_reports_unparsable_listing() {
    let (_state, config) = spawn_server(FakeDav::new("<html><body>sign in</body></html>")).await;

    let err = service().initialize(&config, &Meta::default()).await.unwrap_err();
    assert_eq!(err.reason(), "parse");
}

#[tokio::test]
async fn test_initialize_reports_unreachable_server() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = service().initialize(&config_for(addr), &Meta::default()).await.unwrap_err();
    assert_eq!(err.reason(), "network");
}

#[tokio::test]
async fn test_initialize_reports_rejected_credentials() {
    let mut dav = FakeDav::new("");
    dav.propfind_status = StatusCode::UNAUTHORIZED;
    let (_state, config) = spawn_server(dav).await;

    let err = service().initialize(&config, &Meta::default()).await.unwrap_err();
    assert_eq!(err.reason(), "network");
}

#[tokio::test]
async fn test_initialize_detects_older_remote() {
    let mut dav = FakeDav::new(&multistatus(Some(true)));
    dav.file = Some((r#"{"timestamp": 1000, "words": [{"date": 1}]}"#.to_string(), "\"v0\"".to_string()));
    let (_state, config) = spawn_server(dav).await;

    let local = Meta {
        timestamp: Some(2000),
        etag: Some("\"v0\"".to_string()),
    };
    let err = service().initialize(&config, &local).await.unwrap_err();
    assert!(matches!(err, InitError::Exist { local: 2000, remote: 1000 }));

    let newer_remote = Meta {
        timestamp: Some(500),
        etag: None,
    };
    service().initialize(&config, &newer_remote).await.unwrap();
}

#[tokio::test]
async fn test_download_sends_preconditions_and_honours_304() {
    let mut dav = FakeDav::new("");
    dav.file = Some((r#"{"timestamp": 900, "words": [{"date": 1}]}"#.to_string(), "\"v7\"".to_string()));
    let (state, config) = spawn_server(dav).await;

    let meta = Meta {
        timestamp: Some(100),
        etag: Some("\"v7\"".to_string()),
    };
    assert_eq!(service().download_if_changed(&config, &meta).await.unwrap(), Download::NotModified);

    let dav = state.lock().unwrap();
    let get = &dav.requests[0];
    assert_eq!(get.path, "/dav/Saladict/notebook.json");
    assert_eq!(get.headers.get(header::IF_NONE_MATCH).unwrap(), "\"v7\"");
    assert_eq!(get.headers.get(header::IF_MODIFIED_SINCE).unwrap(), "\"v7\"");
}

#[tokio::test]
async fn test_download_skips_preconditions_for_empty_etag() {
    let mut dav = FakeDav::new("");
    dav.file = Some((r#"{"timestamp": 900, "words": [{"date": 1}]}"#.to_string(), "\"v7\"".to_string()));
    let (state, config) = spawn_server(dav).await;

    let meta = Meta {
        timestamp: Some(100),
        etag: Some(String::new()),
    };
    let Download::Changed(remote) = service().download_if_changed(&config, &meta).await.unwrap() else {
        panic!("expected a changed file");
    };
    assert_eq!(remote.timestamp, Some(900));
    assert_eq!(remote.etag, "\"v7\"");

    let dav = state.lock().unwrap();
    assert!(dav.requests[0].headers.get(header::IF_NONE_MATCH).is_none());
}

#[tokio::test]
async fn test_download_of_missing_or_bad_file() {
    let (state, config) = spawn_server(FakeDav::new("")).await;
    assert_eq!(
        service().download_if_changed(&config, &Meta::default()).await.unwrap(),
        Download::Absent { status: 404 }
    );

    state.lock().unwrap().file = Some((r#"{"timestamp": 900, "words": "not-an-array"}"#.to_string(), "\"v1\"".to_string()));
    assert_eq!(
        service().download_if_changed(&config, &Meta::default()).await.unwrap(),
        Download::Invalid(InvalidPayload::WordsNotArray)
    );
}

#[tokio::test]
async fn test_upload_puts_literal_text() {
    let (state, config) = spawn_server(FakeDav::new("")).await;

    let status = service().upload(&config, "{\"timestamp\":1,\"words\":[]}".to_string()).await.unwrap();
    assert!(status.is_success());

    let dav = state.lock().unwrap();
    assert_eq!(dav.requests[0].path, "/dav/Saladict/notebook.json");
    assert_eq!(dav.file.as_ref().unwrap().0, "{\"timestamp\":1,\"words\":[]}");
}

struct Device {
    notebook: Arc<KvNotebook>,
    syncer: Syncer,
}

async fn device(config: &WebdavConfig) -> Device {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let bus = MessageBus::new();
    let notebook = Arc::new(KvNotebook::new(kv.clone(), bus.clone()));
    let syncer = Syncer::new(Arc::new(service()), kv.clone(), notebook.clone(), bus);
    syncer.configs().set(syncer.service_id(), config).await.unwrap();
    Device { notebook, syncer }
}

#[tokio::test]
async fn test_two_devices_converge() {
    let (state, config) = spawn_server(FakeDav::new(&multistatus(Some(true)))).await;
    let laptop = device(&config).await;
    let phone = device(&config).await;

    laptop.syncer.initialize(&config).await.unwrap();
    laptop
        .notebook
        .save_words(vec![json!({"date": 1, "text": "serendipity"})])
        .await
        .unwrap();

    let SyncOutcome::Uploaded { timestamp } = laptop.syncer.upload_now().await else {
        panic!("expected upload");
    };
    let laptop_meta = laptop.syncer.metas().get("webdav").await.unwrap().unwrap();
    assert_eq!(laptop_meta.etag.as_deref(), Some(""));
    assert_eq!(laptop_meta.timestamp, Some(timestamp));

    assert_eq!(
        phone.syncer.download_now().await,
        SyncOutcome::Applied {
            timestamp: Some(timestamp)
        }
    );
    assert_eq!(
        phone.notebook.get_words().await.unwrap(),
        vec![json!({"date": 1, "text": "serendipity"})]
    );
    let phone_meta = phone.syncer.metas().get("webdav").await.unwrap().unwrap();
    assert_eq!(phone_meta.etag.as_deref(), Some("\"v1\""));

    // the phone now holds the server etag, so the next poll is a 304
    assert_eq!(phone.syncer.download_now().await, SyncOutcome::Unchanged);
    assert_eq!(state.lock().unwrap().count("PUT"), 1);

    // the laptop's own upload is not newer than its meta
    assert_eq!(laptop.syncer.download_now().await, SyncOutcome::Unchanged);
}

#[tokio::test]
async fn test_rejected_upload_is_skipped() {
    let mut dav = FakeDav::new("");
    dav.put_status = StatusCode::INSUFFICIENT_STORAGE;
    let (_state, config) = spawn_server(dav).await;
    let laptop = device(&config).await;
    laptop.notebook.save_words(vec![json!({"date": 1})]).await.unwrap();

    assert_eq!(laptop.syncer.upload_now().await, SyncOutcome::Skipped(SkipReason::UploadFailed(507)));
    assert_eq!(laptop.syncer.metas().get("webdav").await.unwrap(), None);
}
