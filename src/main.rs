use anyhow::Result;
use axum::Router;
use share_store::{
    config,
    routes,
    services::{ShareService, SqliteRecordStore, StoreBackend, chunk_store, expiry},
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{fs, io::ErrorKind, path::Path, str::FromStr, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + one-shot tasks ---
    let (cfg, tasks) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting share-store with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if cfg.store_backend == StoreBackend::Filesystem && !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    tracing::debug!("Connecting using raw URL => {}", db_url);

    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let options = SqliteConnectOptions::from_str(db_url)?.create_if_missing(true);
    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?,
    );
    let records = SqliteRecordStore::new(db);

    // --- Apply schema (idempotent); exit here in migration mode ---
    records.migrate().await?;
    if tasks.migrate {
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    // --- Initialize core service ---
    let chunks = chunk_store::from_config(cfg.store_backend, &cfg.storage_dir).await?;
    tracing::info!("Using {} chunk store", chunks.backend_name());
    let service = ShareService::new(
        Arc::new(records),
        chunks,
        cfg.assembler_options(),
        cfg.share_settings(),
    )?;

    // --- Handle purge mode ---
    if tasks.purge_expired {
        let report = service.purge_expired(expiry::now()).await?;
        tracing::info!(
            "Purge complete: {} shares removed, {} bytes freed, {} errors",
            report.records_removed,
            report.bytes_freed,
            report.errors.len()
        );
        return Ok(());
    }

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(service);

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
    axum::serve(listener, app).await?;

    Ok(())
}
