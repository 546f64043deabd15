//! Ticker hub
//!
//! Main entry point: upstream feed in, WebSocket consumers out

use std::sync::Arc;

use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ticker_core::Settings;
use ticker_price_feed::{AggregationEngine, FeedConfig, WebSocketFeed};
use ticker_server::{
    EndpointRegistry, EndpointServer, EndpointServerConfig, FanOutRouter, ServiceConfig,
    TickerService,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    info!("Starting Ticker Hub v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load()?;
    info!("Upstream feed: {}", settings.feed.url);

    let engine = Arc::new(AggregationEngine::new(settings.history.capacity));
    let registry = Arc::new(EndpointRegistry::new());
    let router = Arc::new(FanOutRouter::new(engine, registry));

    let mut service = TickerService::new(ServiceConfig::from(&settings), Arc::clone(&router));
    service
        .start(WebSocketFeed::new(FeedConfig::from(&settings.feed)))
        .await?;
    info!("Feed pump started");

    let server = EndpointServer::new(EndpointServerConfig::from(&settings.server), router);

    // Setup shutdown channel
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
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
                    error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C");
            }
            _ = terminate => {
                info!("Received termination signal");
            }
        }

        let _ = shutdown_tx.send(());
    });

    info!("Consumers connect on ws://{}", server.address());
    info!("Press Ctrl+C to shutdown");

    let result = server.start_with_shutdown(shutdown_rx).await;
    service.stop().await;

    if let Err(e) = result {
        error!("Server error: {}", e);
        return Err(e);
    }

    info!("Shutdown complete");
    Ok(())
}
