use anyhow::{Context, Result};
use bodyscan_ingest::api::{start_api_server, AppState};
use bodyscan_ingest::config::{Config, SessionBackend, StorageBackend};
use bodyscan_ingest::photo_store::{MemoryPhotoStore, PhotoStore, S3PhotoStore};
use bodyscan_ingest::scan_ingest::ScanIngestor;
use bodyscan_ingest::session_store::{MemorySessionStore, PgSessionStore, SessionStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level, &config.service.log_format);

    info!(
        service = %config.service.name,
        storage = ?config.storage.backend,
        sessions = ?config.sessions.backend,
        "Starting bodyscan ingest service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let photos = init_photo_store(&config).await?;
    let (sessions, sweeper) = init_session_store(&config).await?;

    let ingestor = Arc::new(ScanIngestor::new(photos, sessions, config.presigned_url_expiry()));
    let api_state = AppState::new(ingestor, config.limits.clone());

    // Spawn API server task
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Ingest service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down ingest service");

    api_handle.abort();
    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }

    info!("Ingest service stopped");

    Ok(())
}

async fn init_photo_store(config: &Config) -> Result<Arc<dyn PhotoStore>> {
    let store: Arc<dyn PhotoStore> = match (config.storage.backend, &config.storage.s3) {
        (StorageBackend::S3, Some(s3)) => Arc::new(
            S3PhotoStore::new(s3)
                .await
                .context("Failed to initialize S3 photo store")?,
        ),
        (StorageBackend::S3, None) => anyhow::bail!("storage.s3 must be set for the s3 backend"),
        (StorageBackend::Memory, _) => {
            info!(bucket = %config.storage.memory_bucket, "Using in-memory photo store");
            Arc::new(MemoryPhotoStore::new(config.storage.memory_bucket.clone()))
        }
    };
    Ok(store)
}

async fn init_session_store(
    config: &Config,
) -> Result<(Arc<dyn SessionStore>, Option<tokio::task::JoinHandle<()>>)> {
    match (config.sessions.backend, &config.database) {
        (SessionBackend::Postgres, Some(database)) => {
            let store = PgSessionStore::new(database)
                .await
                .context("Failed to initialize session store")?;

            // Run migrations if enabled
            if database.run_migrations {
                store
                    .run_migrations()
                    .await
                    .context("Failed to run database migrations")?;
            }

            let store: Arc<dyn SessionStore> = Arc::new(store);
            Ok((store, None))
        }
        (SessionBackend::Postgres, None) => anyhow::bail!("database must be set for the postgres session backend"),
        (SessionBackend::Memory, _) => {
            let store = Arc::new(MemorySessionStore::new(config.session_ttl()));
            info!(ttl_secs = store.ttl().as_secs(), "Using in-memory session store");

            let sweeper = tokio::spawn({
                let store = store.clone();
                async move {
                    let mut ticker = tokio::time::interval(SESSION_SWEEP_INTERVAL);
                    loop {
                        ticker.tick().await;
                        let purged = store.purge_expired();
                        if purged > 0 {
                            debug!(purged, "Expired sessions purged");
                        }
                    }
                }
            });

            Ok((store as Arc<dyn SessionStore>, Some(sweeper)))
        }
    }
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, log_format: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    if log_format == "pretty" {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
