//! Error types for sampling, publishing and configuration.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Failure of a single measurement. Never fatal: the assembler substitutes a
/// zero for the affected field.
#[derive(Debug, Error)]
pub enum SampleError {
    #[error("counter unavailable at {path}: {source}")]
    CounterUnavailable {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("malformed counter data: {0}")]
    ParseFailure(String),

    #[error("missing field {0}")]
    MissingField(&'static str),

    #[error("counter did not advance since the previous sample")]
    DivisionByZero,

    #[error("invalid counter state: {0}")]
    InvalidState(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("broker connection failed: {0}")]
    Connect(String),

    #[error("failed to hand payload to the mqtt client: {0}")]
    Send(#[from] rumqttc::ClientError),

    #[error("not connected to the broker")]
    Disconnected,

    #[error("no delivery confirmation within {0:?}")]
    Timeout(Duration),

    #[error("publisher is shut down")]
    Closed,

    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable {0} is not set")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}
