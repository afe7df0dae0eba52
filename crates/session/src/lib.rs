pub mod config;
pub mod downloads;
pub mod error;
pub mod reconnect;
pub mod service;

pub use config::{DownloadConfig, ReconnectConfig, SessionConfig};
pub use downloads::DownloadTracker;
pub use error::{Result, SessionError};
pub use reconnect::{Attempt, ReconnectionCoordinator};
pub use service::P2pService;
