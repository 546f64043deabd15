//! Error types

use thiserror::Error;

use crate::EndpointId;

/// Per-tick rejection. Never aborts the rest of a batch.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TickError {
    #[error("Tick has an empty instrument name")]
    EmptyName,

    #[error("Invalid price for {name}: {price}")]
    InvalidPrice { name: String, price: f64 },
}

/// Upstream feed errors
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Feed disconnected")]
    Disconnected,

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Gave up after {0} reconnect attempts")]
    ReconnectsExhausted(u32),
}

/// Consumer wire protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Failed to decode client message: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Failed to encode server message: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Delivery failures towards a single endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EndpointError {
    #[error("{0} is closed")]
    Closed(EndpointId),

    #[error("{0} is not draining its buffer")]
    Lagging(EndpointId),
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type alias
pub type TickResult<T> = Result<T, TickError>;
pub type FeedResult<T> = Result<T, FeedError>;
pub type ProtocolResult<T> = Result<T, ProtocolError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
