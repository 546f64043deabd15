//! Fan-out hub for the ticker feed
//!
//! Multiplexes one upstream feed to any number of consumer endpoints and
//! answers per-endpoint history requests.

pub mod registry;
pub mod router;
pub mod server;
pub mod service;

pub use registry::{Endpoint, EndpointRegistry};
pub use router::{FanOutRouter, RouterStats};
pub use server::{EndpointServer, EndpointServerBuilder, EndpointServerConfig};
pub use service::{ServiceConfig, TickerService};
