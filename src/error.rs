//! Error types for rtxkv
//!
//! Provides a unified error type for all operations. Protocol-level aborts
//! travel through the same type as `RtxError::Aborted` so callers can tell an
//! expected conflict apart from an infrastructure failure with `is_abort()`.

use thiserror::Error;

use crate::events::AbortReason;
use crate::store::TableId;

/// Result type alias using RtxError
pub type Result<T> = std::result::Result<T, RtxError>;

/// Unified error type for rtxkv operations
#[derive(Debug, Error)]
pub enum RtxError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Transaction Outcomes
    // -------------------------------------------------------------------------
    #[error("Key not found: node {node} table {table} key {key}")]
    KeyNotFound { node: u8, table: TableId, key: u64 },

    #[error("Transaction aborted: {0:?}")]
    Aborted(AbortReason),

    #[error("Invalid set index {index} (set holds {len} items)")]
    InvalidIndex { index: usize, len: usize },

    #[error("Length mismatch at index {index}: expected {expected} bytes, got {actual}")]
    LengthMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Value at index {index} has not been forwarded yet")]
    ValueNotReady { index: usize },

    #[error("No active transaction")]
    NotActive,

    // -------------------------------------------------------------------------
    // Storage Errors
    // -------------------------------------------------------------------------
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Access out of bounds: offset {offset} len {len} (region {region} bytes)")]
    OutOfBounds { offset: u64, len: usize, region: usize },

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Log Errors
    // -------------------------------------------------------------------------
    #[error("Log error: {0}")]
    Log(String),

    #[error("Log corruption detected: {0}")]
    LogCorruption(String),

    // -------------------------------------------------------------------------
    // Network Errors
    // -------------------------------------------------------------------------
    #[error("Network error: {0}")]
    Network(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl RtxError {
    /// True when the error is an abort signal the workload may retry.
    pub fn is_abort(&self) -> bool {
        matches!(self, RtxError::Aborted(_))
    }

    /// The abort reason, if this error is an abort.
    pub fn abort_reason(&self) -> Option<AbortReason> {
        match self {
            RtxError::Aborted(reason) => Some(*reason),
            _ => None,
        }
    }
}

impl From<bincode::Error> for RtxError {
    fn from(e: bincode::Error) -> Self {
        RtxError::Serialization(e.to_string())
    }
}
