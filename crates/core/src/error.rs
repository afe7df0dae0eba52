use thiserror::Error;

/// Errors raised by the shared loralink primitives.
///
/// These cover topic derivation, checksum parsing and event dispatch.
#[derive(Error, Debug)]
pub enum CoreError {
    /// A private room code was empty after normalization
    #[error("Invalid room code: {0}")]
    InvalidRoomCode(String),

    /// An event handler reported a failure while handling an event
    #[error("Event handler failed: {0}")]
    HandlerFailed(String),

    /// A checksum string is not a 64-character hex digest
    #[error("Invalid checksum: {0}")]
    InvalidChecksum(String),
}

/// Convenience Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;
