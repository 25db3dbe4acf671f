use anyhow::{Context, Result};
use clips_service::api::{start_api_server, AppState};
use clips_service::clip_store::PgDriver;
use clips_service::config::Config;
use clips_service::retry::RetryPolicy;
use clips_service::store_manager::StoreManager;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Request duration buckets, in seconds
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        environment = %config.service.environment,
        "Starting Clips Service"
    );

    // Initialize metrics
    let prometheus = init_metrics()?;

    // Initialize store
    let policy = RetryPolicy::from(&config.database);
    let store = Arc::new(StoreManager::new(
        PgDriver::new(&config.database),
        config.database.url.clone(),
        policy,
    ));

    if !store.initialize().await {
        warn!(
            database = %config.database.redacted_url(),
            "Store unavailable at startup, running degraded until it recovers"
        );
    }

    let state = AppState::new(&config, store.clone(), Some(prometheus));

    if let Err(e) = start_api_server(state, &config, shutdown_signal()).await {
        error!(error = %e, "API server error");
    }

    info!("Shutting down clips service");

    store.shutdown().await;

    info!("Clips service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Install the Prometheus recorder rendered at `/metrics`
fn init_metrics() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("clips_http_request_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .context("Invalid histogram buckets")?
        .install_recorder()
        .context("Failed to install Prometheus metrics recorder")?;

    info!("Prometheus metrics recorder installed");

    Ok(handle)
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
