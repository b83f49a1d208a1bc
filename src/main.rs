use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn, LevelFilter};
use schemars::schema_for;

use ord_directory_server::cache::Cache;
use ord_directory_server::config::{Config, Source};
use ord_directory_server::docservice::DocumentService;
use ord_directory_server::fetch::FetchCoordinates;
use ord_directory_server::fsmanager::FsManager;
use ord_directory_server::http::{self, AppState, RemoteState};
use ord_directory_server::scheduler::UpdateScheduler;
use ord_directory_server::state::UpdateStateManager;
use ord_directory_server::status::{run_status_publisher, StatusObserver, StatusSnapshot};

#[derive(Parser)]
#[command(name = "ord-directory-server", about = "Read-only ORD directory server")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Override the default (info) log level. Also settable via RUST_LOG.
    #[arg(long)]
    log_level: Option<LevelFilter>,

    /// Emit the configuration file's JSON Schema to stdout and exit.
    #[arg(long)]
    print_schema: bool,
}

fn init_logging(level: Option<LevelFilter>) -> Result<()> {
    let spec = match level {
        Some(l) => l.to_string(),
        None => "info".to_owned(),
    };
    flexi_logger::Logger::try_with_env_or_str(spec)
        .context("configuring logger")?
        .log_to_stderr()
        .start()
        .context("starting logger")?;
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_schema {
        let schema = serde_json::to_string_pretty(&schema_for!(Config))?;
        println!("{schema}");
        return Ok(());
    }

    init_logging(args.log_level)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?
        .block_on(run(args.config))
}

async fn run(config_path: PathBuf) -> Result<()> {
    let config = Config::load(&config_path)
        .with_context(|| format!("loading configuration from {config_path:?}"))?;

    let cache = Arc::new(Cache::new());

    let (docservice, remote, shutdown_scheduler) = match &config.source {
        Source::Local { directory } => {
            info!("serving ORD documents from local directory {directory:?}");
            let docservice = DocumentService::new_local(
                directory.clone(),
                cache.clone(),
                config.base_url.clone(),
                config.auth_methods.clone(),
            );
            (Arc::new(docservice), None, None)
        }
        Source::Github {
            github_repository,
            github_branch,
            github_api_url,
            github_token,
        } => {
            let fsmanager = Arc::new(FsManager::new(config.data_root.clone()));
            fsmanager
                .recover_startup_garbage()
                .await
                .context("cleaning up leftover temp/backup directories")?;

            let state = Arc::new(UpdateStateManager::new());
            let coords = FetchCoordinates {
                api_url: github_api_url.clone(),
                repository: github_repository.clone(),
                branch: github_branch.clone(),
                token: github_token.clone(),
            };

            let scheduler = Arc::new(UpdateScheduler::new(
                fsmanager.clone(),
                state.clone(),
                cache.clone(),
                coords,
                ".".to_owned(),
                config.documents_subdirectory.clone(),
                config.base_url.clone(),
                config.auth_methods.clone(),
                Duration::from_secs(config.update_delay_secs),
            ));

            info!(
                "bootstrapping content from {github_repository}@{github_branch} into {:?}",
                config.data_root
            );
            scheduler.run_once_on_startup().await;

            let initial_total_files = fsmanager
                .get_metadata()
                .await
                .ok()
                .flatten()
                .map(|m| m.total_files)
                .unwrap_or(0);
            let total_files = Arc::new(AtomicU64::new(initial_total_files));

            let status = Arc::new(StatusObserver::new(StatusSnapshot {
                state: state.snapshot(),
                branch: github_branch.clone(),
                repository: github_repository.clone(),
                total_files: initial_total_files,
                is_warming: cache.is_warming(),
                cache_generation: cache.generation(),
            }));

            tokio::spawn(run_status_publisher(
                status.clone(),
                state.clone(),
                github_branch.clone(),
                github_repository.clone(),
                total_files.clone(),
                {
                    let cache = cache.clone();
                    move || cache.is_warming()
                },
                {
                    let cache = cache.clone();
                    move || cache.generation()
                },
                Duration::from_secs(2),
            ));

            tokio::spawn(refresh_total_files(fsmanager.clone(), total_files));

            let docservice = DocumentService::new_remote(
                fsmanager,
                config.documents_subdirectory.clone(),
                cache.clone(),
                config.base_url.clone(),
                config.auth_methods.clone(),
            );

            let remote_state = Arc::new(RemoteState {
                scheduler: scheduler.clone(),
                status,
                webhook_secret: config.webhook_secret.clone(),
            });

            (Arc::new(docservice), Some(remote_state), Some(scheduler))
        }
    };

    let app_state = AppState { docservice, remote };
    let readiness_timeout = Duration::from_secs(config.readiness_timeout_secs);
    let router = http::build_router(app_state, readiness_timeout);

    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!("listening on {addr}");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    if let Some(scheduler) = shutdown_scheduler {
        scheduler.shutdown();
    }
    Ok(())
}

// A service that synchronizes content via atomic renames must not be
// killed mid-swap; we only stop accepting new connections and let
// axum::serve drain in-flight requests, then cancel any fetch still
// running so its cancellation handle is honored promptly.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received, draining in-flight requests");
}

// Re-reads totalFiles from the metadata sidecar periodically so the status
// snapshot reflects the most recent successful fetch even though the
// scheduler itself doesn't push updates into the status module directly.
async fn refresh_total_files(fsmanager: Arc<FsManager>, total_files: Arc<AtomicU64>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(2));
    loop {
        ticker.tick().await;
        match fsmanager.get_metadata().await {
            Ok(Some(metadata)) => total_files.store(metadata.total_files, Ordering::Relaxed),
            Ok(None) => {}
            Err(e) => warn!("reading metadata for status snapshot: {e}"),
        }
    }
}

