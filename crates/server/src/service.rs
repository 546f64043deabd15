//! Feed -> router pump
//!
//! Owns the only task that applies tick batches, so batches never interleave.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info};

use ticker_core::{Settings, Tick};
use ticker_price_feed::TickFeed;

use crate::router::FanOutRouter;

/// Service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub batch_buffer: usize,
    pub stats_interval: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            batch_buffer: 1_024,
            stats_interval: Duration::from_secs(60),
        }
    }
}

impl From<&Settings> for ServiceConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            batch_buffer: settings.feed.batch_buffer,
            stats_interval: settings.stats_interval(),
        }
    }
}

pub struct TickerService {
    config: ServiceConfig,
    router: Arc<FanOutRouter>,
    handles: Vec<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
    running: Arc<RwLock<bool>>,
}

impl TickerService {
    pub fn new(config: ServiceConfig, router: Arc<FanOutRouter>) -> Self {
        Self {
            config,
            router,
            handles: vec![],
            pump: None,
            running: Arc::new(RwLock::new(false)),
        }
    }

    pub fn router(&self) -> Arc<FanOutRouter> {
        Arc::clone(&self.router)
    }

    /// Start the feed, the pump and the periodic stats log
    pub async fn start<F>(&mut self, feed: F) -> anyhow::Result<()>
    where
        F: TickFeed + 'static,
    {
        if *self.running.read().await {
            anyhow::bail!("service already running");
        }
        info!("Starting ticker service");
        *self.running.write().await = true;

        // Leftovers from a run whose feed already ended
        for handle in self.handles.drain(..) {
            handle.abort();
        }

        let (tx, rx) = mpsc::channel::<Vec<Tick>>(self.config.batch_buffer.max(1));

        self.handles.push(tokio::spawn(async move {
            match feed.run(tx).await {
                Ok(()) => info!("Feed finished"),
                Err(e) => error!("Feed stopped: {}", e),
            }
        }));

        self.pump = Some(tokio::spawn(pump(
            rx,
            Arc::clone(&self.router),
            Arc::clone(&self.running),
        )));

        let router = Arc::clone(&self.router);
        let running = Arc::clone(&self.running);
        let stats_interval = self.config.stats_interval;

        self.handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(stats_interval);
            interval.tick().await;

            loop {
                interval.tick().await;

                if !*running.read().await {
                    break;
                }

                let engine = router.engine().stats();
                let routing = router.stats();
                info!(
                    "Ticker state: {} instruments, {} ticks ({} rejected), {} endpoints, {} broadcasts, {} dropped",
                    engine.instrument_count,
                    engine.tick_count,
                    engine.rejected_count,
                    routing.endpoints,
                    routing.broadcasts,
                    routing.dropped_endpoints
                );
            }
        }));

        Ok(())
    }

    /// Wait until the feed is exhausted and every batch it produced is applied
    pub async fn drained(&mut self) {
        if let Some(pump) = self.pump.take() {
            let _ = pump.await;
        }
    }

    pub async fn stop(&mut self) {
        info!("Stopping ticker service");
        *self.running.write().await = false;

        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }

    /// True from `start` until `stop`, or until the feed ends and its last
    /// batch has been applied
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

async fn pump(
    mut rx: mpsc::Receiver<Vec<Tick>>,
    router: Arc<FanOutRouter>,
    running: Arc<RwLock<bool>>,
) {
    while let Some(batch) = rx.recv().await {
        router.on_tick_batch(&batch);
    }
    *running.write().await = false;
    info!("Feed channel closed; serving last-known state");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::EndpointRegistry;
    use ticker_core::ServerMessage;
    use async_trait::async_trait;
    use ticker_core::FeedResult;
    use ticker_price_feed::{AggregationEngine, ReplayFeed};

    /// Holds the channel open and never sends
    struct SilentFeed;

    #[async_trait]
    impl TickFeed for SilentFeed {
        async fn run(self, tx: mpsc::Sender<Vec<Tick>>) -> FeedResult<()> {
            tx.closed().await;
            Ok(())
        }
    }

    fn service() -> TickerService {
        let router = Arc::new(FanOutRouter::new(
            Arc::new(AggregationEngine::default()),
            Arc::new(EndpointRegistry::new()),
        ));
        TickerService::new(ServiceConfig::default(), router)
    }

    #[tokio::test]
    async fn test_service_creation() {
        let service = service();
        assert!(!service.is_running().await);
    }

    #[tokio::test]
    async fn test_replay_reaches_endpoints_and_state_survives_feed_end() {
        let mut service = service();
        let router = service.router();
        let (id, mut rx) = router.connect(16);

        let feed = ReplayFeed::new(vec![
            vec![Tick::new("AAPL", 100.0)],
            vec![Tick::new("AAPL", 110.0)],
        ]);
        service.start(feed).await.unwrap();
        service.drained().await;
        assert!(!service.is_running().await);

        assert!(matches!(rx.recv().await, Some(ServerMessage::Init(_))));
        assert!(matches!(rx.recv().await, Some(ServerMessage::Update(_))));
        assert!(matches!(rx.recv().await, Some(ServerMessage::Update(_))));

        assert!(router.on_history_request(id, "AAPL"));
        match rx.recv().await {
            Some(ServerMessage::Dataset { dataset, .. }) => assert_eq!(dataset.len(), 2),
            other => panic!("expected dataset, got {:?}", other),
        }

        service.stop().await;
        assert!(!service.is_running().await);
        assert_eq!(router.engine().snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_double_start_is_rejected() {
        let mut service = service();
        service.start(SilentFeed).await.unwrap();
        assert!(service.is_running().await);
        assert!(service.start(SilentFeed).await.is_err());
        service.stop().await;
    }

    #[tokio::test]
    async fn test_restart_after_feed_ends() {
        let mut service = service();
        service.start(ReplayFeed::new(vec![])).await.unwrap();
        service.drained().await;
        assert!(!service.is_running().await);

        service.start(SilentFeed).await.unwrap();
        assert!(service.is_running().await);
        service.stop().await;
        assert!(!service.is_running().await);
    }
}
