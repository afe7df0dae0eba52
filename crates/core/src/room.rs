use serde::{Deserialize, Serialize};

/// Which family of room a connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomKind {
    /// The single well-known community room
    General,
    /// Peers sharing a local network
    Local,
    /// Peers that know the same room code
    Private,
}

impl RoomKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomKind::General => "general",
            RoomKind::Local => "local",
            RoomKind::Private => "private",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "general" => Some(RoomKind::General),
            "local" => Some(RoomKind::Local),
            "private" => Some(RoomKind::Private),
            _ => None,
        }
    }
}

impl std::fmt::Display for RoomKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The room this process is connected to. At most one exists at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub kind: RoomKind,
    pub topic: String,
    pub code: Option<String>,
    pub peers_count: u32,
    pub active: bool,
}

impl Room {
    pub fn new(kind: RoomKind, topic: String, code: Option<String>) -> Self {
        Self {
            kind,
            topic,
            code,
            peers_count: 0,
            active: true,
        }
    }

    pub fn short_topic(&self) -> &str {
        &self.topic[..self.topic.len().min(8)]
    }
}
