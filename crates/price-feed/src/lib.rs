//! Price feed ingestion and aggregation
//!
//! Features:
//! - Single upstream WebSocket connection with automatic reconnection
//! - Per-tick derived state (price, change, high, low)
//! - Bounded rolling history per instrument
//! - Consistent point-in-time reads alongside a single writer

pub mod engine;
pub mod feeds;
pub mod history;

pub use engine::{AggregationEngine, EngineStats};
pub use feeds::{decode_frame, FeedConfig, ReplayFeed, TickFeed, WebSocketFeed};
pub use history::HistoryBuffer;
