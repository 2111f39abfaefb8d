use anyhow::Result;
use recording_ingest::{
    app,
    config::{AppConfig, Command, StorageBackend},
    db,
    services::{jobs::JobWorker, state::AppState},
    storage::{LocalObjectStore, ObjectStore, S3ObjectStore},
};
use std::{io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + command ---
    let (cfg, command) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting recording-ingest with config: {:?}", cfg);

    // --- Initialize SQLite connection ---
    let db = Arc::new(db::connect(&cfg.database_url, 5).await?);
    db::run_migrations(&db).await?;

    match command {
        Command::Migrate => {
            tracing::info!("Database migration complete.");
            return Ok(());
        }
        Command::IssueToken(owner) => {
            let tokens = recording_ingest::services::tokens::TokenService::new(db.clone());
            let token = tokens.issue(&owner).await?;
            println!("{}", token);
            return Ok(());
        }
        Command::Serve => {}
    }

    // --- Object store ---
    let store: Arc<dyn ObjectStore> = match &cfg.storage {
        StorageBackend::Local { storage_dir } => {
            if !Path::new(storage_dir).exists() {
                std::fs::create_dir_all(storage_dir)?;
                tracing::info!("Created storage directory at {}", storage_dir);
            }
            Arc::new(LocalObjectStore::with_min_part_size(
                storage_dir,
                cfg.ingest.min_part_size_bytes,
            ))
        }
        StorageBackend::S3 {
            bucket,
            region,
            endpoint,
        } => {
            tracing::info!(bucket = %bucket, endpoint = ?endpoint, "Using S3 object store");
            Arc::new(S3ObjectStore::connect(bucket.clone(), region.clone(), endpoint.clone()).await)
        }
    };

    let state = AppState::new(db.clone(), store, &cfg);

    // --- Background worker ---
    let shutdown = CancellationToken::new();
    let worker = JobWorker::new(state.jobs.clone(), Arc::new(state.dispatcher(&cfg)));
    let worker_task = tokio::spawn(worker.run(shutdown.clone()));

    // --- Build router ---
    let app = app(state, cfg.max_chunk_bytes);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("Shutdown signal received"),
                _ = server_shutdown.cancelled() => {}
            }
        })
        .await?;

    shutdown.cancel();
    worker_task.await?;
    Ok(())
}
