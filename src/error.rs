//! Error types for the transport.

use crate::types::Status;
use thiserror::Error;

/// Main error type for transport and log store operations.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The log exists with settings the transport cannot use.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Subscribing against a log that has never held a record.
    #[error("Log {0} is empty, no watermark to start from")]
    EmptyLog(String),

    /// The store or the log went away underneath the caller.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Record of {size} bytes exceeds log capacity of {capacity} bytes")]
    RecordTooLarge { size: u64, capacity: u64 },

    #[error("Invalid status transition: {from:?} -> {to:?}")]
    InvalidTransition { from: Status, to: Status },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Store is locked by another process")]
    Locked,

    #[error("Subscription worker panicked")]
    WorkerPanicked,
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        TransportError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for TransportError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        TransportError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for TransportError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        TransportError::Deserialization(e.to_string())
    }
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
