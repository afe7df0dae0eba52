use serde::{Deserialize, Serialize};

/// Chunk-level progress of a single inbound transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub topic: String,
    pub received_chunks: u32,
    /// Zero until the first chunk announces the total
    pub total_chunks: u32,
    pub received_bytes: u64,
}

impl TransferProgress {
    pub fn percent(&self) -> f64 {
        if self.total_chunks == 0 {
            return 0.0;
        }
        (self.received_chunks as f64 / self.total_chunks as f64) * 100.0
    }
}

/// Why an inbound transfer ended without completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferFailure {
    ChunkValidation,
    FileChecksum,
    Timeout,
    Cancelled,
    Protocol,
}

impl TransferFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferFailure::ChunkValidation => "chunk-validation",
            TransferFailure::FileChecksum => "file-checksum",
            TransferFailure::Timeout => "timeout",
            TransferFailure::Cancelled => "cancelled",
            TransferFailure::Protocol => "protocol",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Downloading,
    Completed,
    Error,
    Cancelled,
}

impl DownloadStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, DownloadStatus::Downloading)
    }
}

/// User-facing view of one download, keyed by adapter name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub adapter_name: String,
    /// 0..=100
    pub progress: f64,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub status: DownloadStatus,
    pub error: Option<String>,
}

impl DownloadProgress {
    pub fn started(adapter_name: impl Into<String>, total_bytes: u64) -> Self {
        Self {
            adapter_name: adapter_name.into(),
            progress: 0.0,
            downloaded_bytes: 0,
            total_bytes,
            status: DownloadStatus::Downloading,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent() {
        let mut progress = TransferProgress {
            topic: "t".into(),
            received_chunks: 0,
            total_chunks: 0,
            received_bytes: 0,
        };
        assert_eq!(progress.percent(), 0.0);
        progress.total_chunks = 4;
        progress.received_chunks = 1;
        assert_eq!(progress.percent(), 25.0);
    }

    #[test]
    fn test_finished_statuses() {
        assert!(!DownloadStatus::Downloading.is_finished());
        assert!(DownloadStatus::Completed.is_finished());
        assert!(DownloadStatus::Cancelled.is_finished());
    }
}
