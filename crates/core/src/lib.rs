//! Core types and utilities for the ticker hub
//!
//! This crate provides shared types used across all components:
//! - Tick, instrument state and history sample definitions
//! - Consumer wire protocol messages
//! - Service configuration
//! - Error types

pub mod types;
pub mod protocol;
pub mod settings;
pub mod errors;

pub use types::*;
pub use protocol::*;
pub use settings::*;
pub use errors::*;
