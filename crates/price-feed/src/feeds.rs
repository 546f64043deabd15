//! Upstream WebSocket feed
//!
//! The feed sends JSON text frames shaped as `[[name, price], ...]`.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use ticker_core::{FeedError, FeedResult, FeedSettings, Tick};

/// Feed configuration
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub url: String,
    pub reconnect_delay: Duration,
    /// 0 means retry forever
    pub max_reconnects: u32,
}

impl From<&FeedSettings> for FeedConfig {
    fn from(settings: &FeedSettings) -> Self {
        Self {
            url: settings.url.clone(),
            reconnect_delay: settings.reconnect_delay(),
            max_reconnects: settings.max_reconnects,
        }
    }
}

/// A source of tick batches
#[async_trait::async_trait]
pub trait TickFeed: Send {
    /// Deliver batches until the source ends or the receiver is dropped
    async fn run(self, tx: mpsc::Sender<Vec<Tick>>) -> FeedResult<()>;
}

/// Decode one upstream frame.
///
/// Entries that are not `[string, number]` pairs are skipped; the rest keep
/// their order.
pub fn decode_frame(text: &str) -> FeedResult<Vec<Tick>> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| FeedError::InvalidFrame(e.to_string()))?;

    let entries = match value {
        Value::Array(entries) => entries,
        other => {
            return Err(FeedError::InvalidFrame(format!(
                "expected an array, got {}",
                kind_of(&other)
            )))
        }
    };

    let total = entries.len();
    let ticks: Vec<Tick> = entries.iter().filter_map(decode_entry).collect();

    if ticks.len() < total {
        debug!("Skipped {} malformed entries in frame", total - ticks.len());
    }

    Ok(ticks)
}

fn decode_entry(entry: &Value) -> Option<Tick> {
    match entry.as_array()?.as_slice() {
        [Value::String(name), Value::Number(price)] => Some(Tick::new(name.as_str(), price.as_f64()?)),
        _ => None,
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Why one connection ended
enum SessionEnd {
    /// Upstream closed or dropped; worth reconnecting
    Upstream,
    /// Nobody is listening for batches anymore
    ReceiverGone,
}

/// Single upstream WebSocket connection with reconnects
pub struct WebSocketFeed {
    config: FeedConfig,
}

impl WebSocketFeed {
    pub fn new(config: FeedConfig) -> Self {
        Self { config }
    }

    async fn connect_and_listen(
        &self,
        tx: &mpsc::Sender<Vec<Tick>>,
    ) -> FeedResult<SessionEnd> {
        info!("Connecting to feed at {}", self.config.url);

        let (ws_stream, _) = connect_async(self.config.url.as_str())
            .await
            .map_err(|e| FeedError::ConnectionFailed(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        info!("Connected to feed");

        let end = loop {
            let Some(msg) = read.next().await else {
                break SessionEnd::Upstream;
            };

            match msg {
                Ok(Message::Text(text)) => match decode_frame(&text) {
                    Ok(batch) if batch.is_empty() => {}
                    Ok(batch) => {
                        if tx.send(batch).await.is_err() {
                            debug!("Batch channel closed");
                            break SessionEnd::ReceiverGone;
                        }
                    }
                    Err(e) => warn!("Dropping frame: {}", e),
                },
                Ok(Message::Ping(data)) => {
                    if let Err(e) = write.send(Message::Pong(data)).await {
                        return Err(FeedError::ConnectionFailed(e.to_string()));
                    }
                }
                Ok(Message::Close(_)) => {
                    info!("Feed closed by server");
                    break SessionEnd::Upstream;
                }
                Err(e) => {
                    error!("Feed WebSocket error: {}", e);
                    return Err(FeedError::ConnectionFailed(e.to_string()));
                }
                _ => {}
            }
        };

        Ok(end)
    }
}

#[async_trait::async_trait]
impl TickFeed for WebSocketFeed {
    async fn run(self, tx: mpsc::Sender<Vec<Tick>>) -> FeedResult<()> {
        let mut reconnect_count = 0;

        loop {
            match self.connect_and_listen(&tx).await {
                Ok(SessionEnd::ReceiverGone) => return Ok(()),
                Ok(SessionEnd::Upstream) => warn!("Feed disconnected"),
                Err(e) => error!("Feed error: {}", e),
            }

            if tx.is_closed() {
                return Ok(());
            }

            reconnect_count += 1;
            if self.config.max_reconnects > 0 && reconnect_count > self.config.max_reconnects {
                error!("Max reconnects reached for feed");
                return Err(FeedError::ReconnectsExhausted(self.config.max_reconnects));
            }

            warn!(
                "Reconnecting feed in {:?} (attempt {}/{})",
                self.config.reconnect_delay, reconnect_count, self.config.max_reconnects
            );
            tokio::time::sleep(self.config.reconnect_delay).await;
        }
    }
}

/// Feed backed by an in-memory list of batches; used for replays and tests
pub struct ReplayFeed {
    batches: Vec<Vec<Tick>>,
}

impl ReplayFeed {
    pub fn new(batches: Vec<Vec<Tick>>) -> Self {
        Self { batches }
    }
}

#[async_trait::async_trait]
impl TickFeed for ReplayFeed {
    async fn run(self, tx: mpsc::Sender<Vec<Tick>>) -> FeedResult<()> {
        for batch in self.batches {
            tx.send(batch).await.map_err(|_| FeedError::Disconnected)?;
        }
        Ok(())
    }
}
