use thiserror::Error;

use loralink_core::{CoreError, TransferFailure};
use loralink_storage::StoreError;

/// Errors from room connections, adapter sharing and transfers.
///
/// Transfer errors abort only the transfer they belong to; the room
/// connection and other transfers carry on.
#[derive(Error, Debug)]
pub enum GridError {
    /// Transport unreachable or the join was rejected
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Operation needs an active room
    #[error("not connected to a room")]
    NotConnected,

    /// A single chunk did not match its checksum
    #[error("chunk {index} of transfer {topic} failed checksum validation")]
    ChunkValidation { topic: String, index: u32 },

    /// The reassembled payload did not match the announced checksum
    #[error("transfer {topic} failed whole-file checksum: expected {expected}, got {actual}")]
    FileChecksum {
        topic: String,
        expected: String,
        actual: String,
    },

    /// Transfer did not finish before its deadline
    #[error("transfer {0} timed out")]
    TransferTimeout(String),

    /// No adapter with this name in the local file store
    #[error("adapter not found: {0}")]
    AdapterNotFound(String),

    /// No in-flight transfer for this topic
    #[error("transfer not found: {0}")]
    TransferNotFound(String),

    /// A download for this topic is already running
    #[error("transfer already in progress: {0}")]
    TransferExists(String),

    /// Transfer was cancelled locally or by leaving the room
    #[error("transfer {0} cancelled")]
    TransferCancelled(String),

    /// Wire protocol violation or unexpected message
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Failed to encode or decode a wire message
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl GridError {
    /// Classification for `transfer:error` events, if this is a transfer error.
    pub fn transfer_failure(&self) -> Option<TransferFailure> {
        match self {
            GridError::ChunkValidation { .. } => Some(TransferFailure::ChunkValidation),
            GridError::FileChecksum { .. } => Some(TransferFailure::FileChecksum),
            GridError::TransferTimeout(_) => Some(TransferFailure::Timeout),
            GridError::TransferCancelled(_) => Some(TransferFailure::Cancelled),
            GridError::Protocol(_) => Some(TransferFailure::Protocol),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for GridError {
    fn from(e: serde_json::Error) -> Self {
        GridError::Serialization(e.to_string())
    }
}

/// Convenience Result type for grid operations
pub type Result<T> = std::result::Result<T, GridError>;
