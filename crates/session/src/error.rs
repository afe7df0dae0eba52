use thiserror::Error;

use loralink_grid::GridError;

#[derive(Error, Debug)]
pub enum SessionError {
    /// Manual reconnect with nothing persisted to go back to
    #[error("no previous session to restore")]
    NoLastSession,

    #[error("download unavailable: {0}")]
    DownloadUnavailable(String),

    #[error(transparent)]
    Grid(#[from] GridError),
}

pub type Result<T> = std::result::Result<T, SessionError>;
