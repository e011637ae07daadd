use std::sync::Arc;

use clap::Parser;
use notebook_sync::config::{Cli, Command, Config, default_config_dir, default_config_path};
use notebook_sync::error::InitError;
use notebook_sync::message::{MessageBus, log_messages};
use notebook_sync::notebook::{KvNotebook, NotebookStore};
use notebook_sync::storage::{FileStore, KvStore};
use notebook_sync::sync::{SyncOutcome, Syncer};
use notebook_sync::webdav::WebdavService;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn init_tracing(debug: bool, json: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn report(outcome: &SyncOutcome) {
    match outcome {
        SyncOutcome::Applied { timestamp } => tracing::info!(timestamp = ?timestamp, "remote notebook applied"),
        SyncOutcome::Uploaded { timestamp } => tracing::info!(timestamp, "notebook uploaded"),
        SyncOutcome::Unchanged => tracing::info!("notebook already up to date"),
        SyncOutcome::Skipped(reason) => tracing::warn!(reason = ?reason, "sync skipped"),
    }
}

#[tokio::main]
async fn main() {
    let args = Cli::parse();

    // --config puts the store next to the config file, otherwise ~/.notebook-sync/
    let (config_path, data_dir) = match args.config_path {
        Some(path) => {
            let path = std::path::PathBuf::from(path);
            let dir = path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| std::path::PathBuf::from("."));
            (path, dir)
        }
        None => (default_config_path(), default_config_dir()),
    };

    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        eprintln!("failed to create data directory {:?}: {}", data_dir, e);
        std::process::exit(1);
    }

    let cfg = Config::new_or_default(&config_path.to_string_lossy()).unwrap_or_else(|e| {
        eprintln!("failed to load config file {:?}: {}", config_path, e);
        std::process::exit(1);
    });
    init_tracing(args.verbose || cfg.app.debug, args.json);

    let store_path = cfg.app.get_store(&data_dir);
    let kv: Arc<dyn KvStore> = Arc::new(FileStore::open(&store_path).await.unwrap_or_else(|e| {
        tracing::error!(error = %e, path = ?store_path, "failed to open store");
        std::process::exit(1);
    }));
    let service = Arc::new(WebdavService::new(cfg.app.get_timeout()).unwrap_or_else(|e| {
        tracing::error!(error = %notebook_sync::unpack_error(&e), "failed to set up http client");
        std::process::exit(1);
    }));

    let bus = MessageBus::new();
    let notebook = Arc::new(KvNotebook::new(kv.clone(), bus.clone()));
    let syncer = Arc::new(Syncer::new(service, kv, notebook.clone(), bus.clone()));

    if let Some(webdav) = &cfg.webdav {
        if let Err(e) = syncer.configs().set(syncer.service_id(), webdav).await {
            tracing::error!(error = %e, "failed to store sync config");
            std::process::exit(1);
        }
    }

    match args.command {
        Command::Init { force } => {
            let config = match syncer.configs().get(syncer.service_id()).await {
                Ok(Some(config)) => config,
                Ok(None) => {
                    tracing::error!("no webdav section configured");
                    std::process::exit(1);
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to read sync config");
                    std::process::exit(1);
                }
            };

            match syncer.initialize(&config).await {
                Ok(()) => report(&syncer.download_now().await),
                Err(InitError::Exist { local, remote }) if force => {
                    tracing::warn!(local, remote, "remote notebook is older, overwriting");
                    report(&syncer.upload_now().await);
                }
                Err(e @ InitError::Exist { .. }) => {
                    tracing::error!(reason = e.reason(), "{}; rerun with --force to overwrite", e);
                    std::process::exit(2);
                }
                Err(e) => {
                    tracing::error!(reason = e.reason(), error = %e, "initialization failed");
                    std::process::exit(1);
                }
            }
        }
        Command::Upload => report(&syncer.upload_now().await),
        Command::Download => report(&syncer.download_now().await),
        Command::Words => match notebook.get_words().await {
            Ok(words) => match serde_json::to_string_pretty(&words) {
                Ok(text) => println!("{}", text),
                Err(e) => {
                    tracing::error!(error = %e, "failed to encode notebook");
                    std::process::exit(1);
                }
            },
            Err(e) => {
                tracing::error!(error = %e, "failed to read notebook");
                std::process::exit(1);
            }
        },
        Command::Watch => {
            let cancellation_token = CancellationToken::new();
            let events = tokio::spawn(log_messages(bus.listen(), cancellation_token.clone()));
            let worker = {
                let syncer = syncer.clone();
                let token = cancellation_token.clone();
                tokio::spawn(async move { syncer.run_periodic(token).await })
            };

            tracing::info!(service_id = syncer.service_id(), "periodic sync running");
            if let Err(e) = signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl+c");
            }
            tracing::info!("ctrl+c signal received, preparing to shutdown");
            cancellation_token.cancel();

            if let Err(e) = worker.await {
                tracing::error!(error = %e, "periodic sync task failed");
            }
            if let Err(e) = events.await {
                tracing::error!(error = %e, "event logger task failed");
            }
            tracing::info!("notebook-sync going off, graceful shutdown complete");
        }
    }
}
