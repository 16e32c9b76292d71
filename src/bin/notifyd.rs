//! notifyd: notification service
//!
//! Consumes notification events from RabbitMQ, persists them and pushes
//! live updates to connected WebSocket clients.
//!
//! ## Configuration
//! - `notifyd.yaml`, `--config <path>` or NOTIFYD_CONFIG: YAML configuration
//! - NOTIFYD__<SECTION>__<KEY>: per-key overrides (e.g. NOTIFYD__AMQP__URL)
//! - RABBITMQ_URL, DATABASE_URL, PORT: legacy overrides
//! - NOTIFYD_LOG: tracing filter (default: info)

use tracing::{error, info};

use notifyd::app::Application;
use notifyd::config::Config;
use notifyd::utils::bootstrap::{init_tracing, parse_config_path};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = parse_config_path();
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        exchange = %config.amqp.exchange,
        port = config.server.port,
        "Starting notifyd"
    );

    let app = Application::build(config).await?;
    app.run(shutdown_signal()).await?;

    Ok(())
}

/// Resolves on Ctrl+C or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
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
    info!("Shutdown signal received");
}
