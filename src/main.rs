//! HTLC Relayer binary
//!
//! Loads configuration, starts the watchers, dispatcher and sweeper, and serves
//! the read-only API and metrics endpoints until a shutdown signal arrives.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use htlc_relayer::api;
use htlc_relayer::config::{LoggingConfig, Settings};
use htlc_relayer::metrics::MetricsServer;
use htlc_relayer::Relayer;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load()?;

    init_logging(&settings.logging);

    info!("Starting HTLC Relayer v{}", env!("CARGO_PKG_VERSION"));
    info!(
        instance_id = %settings.relayer.instance_id,
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );

    let relayer = Arc::new(
        Relayer::from_settings(&settings)
            .await
            .context("Failed to initialize relayer")?,
    );

    relayer.start().await.context("Failed to start relayer")?;

    let cancel = CancellationToken::new();

    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let relayer = relayer.clone();
        let cancel = cancel.clone();
        async move {
            if let Err(e) = api::run_server(config, relayer, cancel).await {
                error!("API server error: {}", e);
            }
        }
    });

    let metrics_handle = settings.metrics.enabled.then(|| {
        let server = MetricsServer::new(settings.metrics.port);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = server.run(cancel).await {
                error!("Metrics server error: {}", e);
            }
        })
    });

    info!("HTLC Relayer is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    relayer.stop().await;
    cancel.cancel();

    if let Err(e) = api_handle.await {
        warn!("API server task ended abnormally: {}", e);
    }
    if let Some(handle) = metrics_handle {
        if let Err(e) = handle.await {
            warn!("Metrics server task ended abnormally: {}", e);
        }
    }

    info!("HTLC Relayer stopped");
    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(
            config
                .filter
                .as_deref()
                .unwrap_or("info,htlc_relayer=debug,sqlx=warn,hyper=warn"),
        )
    });

    let registry = tracing_subscriber::registry().with(filter);
    if config.json {
        registry
            .with(fmt::layer().json().with_current_span(false))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
