//! Error types for DriftKV
//!
//! Provides a unified error type for all operations.

use std::thread::ThreadId;
use std::time::Duration;

use thiserror::Error;

/// Result type alias using DriftError
pub type Result<T> = std::result::Result<T, DriftError>;

/// Unified error type for DriftKV operations
#[derive(Debug, Error)]
pub enum DriftError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Usage Errors
    // -------------------------------------------------------------------------
    #[error("Store accessed from thread {current:?}, but it is confined to {owner:?}")]
    WrongThread { owner: ThreadId, current: ThreadId },

    #[error("Access to store after close()")]
    Closed,

    // -------------------------------------------------------------------------
    // Capacity Errors
    // -------------------------------------------------------------------------
    #[error("Capacity exhausted: {0}")]
    CapacityExhausted(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    // -------------------------------------------------------------------------
    // Concurrency Errors
    // -------------------------------------------------------------------------
    #[error("Lock on segment {segment} not acquired within {timeout:?}")]
    LockTimeout { segment: usize, timeout: Duration },

    // -------------------------------------------------------------------------
    // Transport Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    // -------------------------------------------------------------------------
    // Setup Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store file corrupted: {0}")]
    Corruption(String),
}

impl DriftError {
    /// True for programmer errors (wrong thread, use after close)
    pub fn is_usage_error(&self) -> bool {
        matches!(self, DriftError::WrongThread { .. } | DriftError::Closed)
    }

    /// True when the caller may retry the same operation
    pub fn is_retryable(&self) -> bool {
        matches!(self, DriftError::LockTimeout { .. })
    }
}

impl From<bincode::Error> for DriftError {
    fn from(e: bincode::Error) -> Self {
        DriftError::Serialization(e.to_string())
    }
}
