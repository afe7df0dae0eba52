use std::time::Duration;

use loralink_grid::TransferConfig;
use loralink_storage::SessionStateConfig;

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Minimum spacing between automatic reconnect attempts
    pub cooldown: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// How long a completed download stays listed
    pub completed_retention: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            completed_retention: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub transfer: TransferConfig,
    pub reconnect: ReconnectConfig,
    pub downloads: DownloadConfig,
    pub state: SessionStateConfig,
}
