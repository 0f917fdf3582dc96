//! ==============================================================================
//! error.rs - error taxonomy
//! ==============================================================================
//!
//! construction-time problems (`Configuration`) surface to the caller.
//! everything else is raised per operation and absorbed by the loops that
//! hit it: a failed publish, an unreachable broker, a garbled payload or a
//! broken draw surface is logged and the component keeps going.
//!
//! ==============================================================================

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TelemetryError {
    /// invalid interval / cycle / amplitude / key set
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// broker unreachable, client not connected, ack timeout
    #[error("Connection error: {0}")]
    Connection(String),

    /// payload not parseable or not the expected structure
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// draw surface failure
    #[error("Render error: {0}")]
    Render(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<toml::de::Error> for TelemetryError {
    fn from(e: toml::de::Error) -> Self {
        TelemetryError::Configuration(e.to_string())
    }
}

impl From<serde_json::Error> for TelemetryError {
    fn from(e: serde_json::Error) -> Self {
        TelemetryError::Protocol(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TelemetryError>;
