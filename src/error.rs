//! Error types for the clipcap training subsystem

use thiserror::Error;

/// Main error type for clipcap operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unknown language model type or variant
    #[error("Unsupported language model variant: {0}")]
    UnsupportedVariant(String),

    /// Device specification error
    #[error("Device specification error: {0}")]
    Device(String),

    /// Checkpoint persistence error
    #[error("Checkpoint persistence error: {0}")]
    Persistence(String),

    /// Dataset error
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Tensor operation error
    #[error("Tensor operation error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Snapshot encoding error
    #[error("Snapshot encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    /// Other errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for clipcap operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an unsupported-variant error
    pub fn unsupported_variant(msg: impl Into<String>) -> Self {
        Self::UnsupportedVariant(msg.into())
    }

    /// Create a device specification error
    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device(msg.into())
    }

    /// Create a persistence error
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Create a dataset error
    pub fn dataset(msg: impl Into<String>) -> Self {
        Self::Dataset(msg.into())
    }
}
