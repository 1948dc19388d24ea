//! Error types for murmur-core.

use thiserror::Error;

/// Error type for engine operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Invalid schedule request: {0}")]
    Schedule(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Sample error: {0}")]
    Sample(String),

    #[error("Cannot load sample: {0}")]
    Load(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Audio sink error: {0}")]
    Device(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
