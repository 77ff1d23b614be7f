//! Error types for FrameKV
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using KvError
pub type Result<T> = std::result::Result<T, KvError>;

/// Unified error type for FrameKV operations
#[derive(Debug, Error)]
pub enum KvError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Record Errors
    // -------------------------------------------------------------------------
    #[error("Corrupted record at position {position}: {reason}")]
    CorruptedRecord { position: u64, reason: String },

    #[error("Checksum mismatch for record at position {position}: expected 0x{expected:08x}, computed 0x{actual:08x}")]
    ChecksumMismatch {
        position: u64,
        expected: u64,
        actual: u64,
    },

    #[error("Record at position {position} declares {declared_length}B but the file ends at {file_size}B")]
    PrematureEndOfFile {
        position: u64,
        declared_length: u64,
        file_size: u64,
    },

    // -------------------------------------------------------------------------
    // Store State Errors
    // -------------------------------------------------------------------------
    #[error("Store has already been closed")]
    StoreClosed,

    #[error("Internal state violation: {0}")]
    InternalState(String),

    #[error("Unknown record type: {0}")]
    UnknownRecordType(u8),

    #[error("Generation {generation} precedes generation {latest} already written")]
    InvalidGeneration { generation: i64, latest: i64 },

    #[error("Snapshot as of generation {requested} is unavailable, history starts at {oldest}")]
    SnapshotUnavailable { requested: i64, oldest: i64 },

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl KvError {
    /// True for errors that mean the bytes on disk cannot be trusted.
    ///
    /// Callers typically react to all of these the same way: stop replaying
    /// at the last intact generation boundary (see `store::recover`).
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            KvError::CorruptedRecord { .. }
                | KvError::ChecksumMismatch { .. }
                | KvError::PrematureEndOfFile { .. }
        )
    }

    pub(crate) fn corrupted(position: u64, reason: impl Into<String>) -> Self {
        KvError::CorruptedRecord {
            position,
            reason: reason.into(),
        }
    }
}

impl From<bincode::Error> for KvError {
    fn from(err: bincode::Error) -> Self {
        KvError::Serialization(err.to_string())
    }
}
