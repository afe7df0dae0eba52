use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::id::PeerId;

/// Milliseconds since the unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// One shared instance of an adapter file.
///
/// `topic` identifies this particular share (32 random bytes, hex), not a
/// room, so re-sharing the same file yields a different topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterInfo {
    pub name: String,
    pub size_bytes: u64,
    pub checksum: String,
    pub topic: String,
    pub announced_at: u64,
}

impl AdapterInfo {
    pub fn new(name: impl Into<String>, size_bytes: u64, checksum: String, topic: String) -> Self {
        Self {
            name: name.into(),
            size_bytes,
            checksum,
            topic,
            announced_at: now_millis(),
        }
    }
}

/// An adapter announced by a remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableAdapter {
    pub peer_id: PeerId,
    pub info: AdapterInfo,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_info_wire_names() {
        let info = AdapterInfo::new("gemma-lora-v1", 42, "ab".repeat(32), "cd".repeat(32));
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["name"], "gemma-lora-v1");
        assert_eq!(value["sizeBytes"], 42);
        assert!(value.get("announcedAt").is_some());
    }
}
