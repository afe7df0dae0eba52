use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a remote peer as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short_id(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A fresh unguessable instance topic: 32 random bytes, hex encoded.
pub fn random_topic() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_generation() {
        let id1 = PeerId::generate();
        let id2 = PeerId::generate();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_peer_id_short_id() {
        let id = PeerId::new("abcdef0123456789");
        assert_eq!(id.short_id(), "abcdef01");
        assert_eq!(PeerId::new("abc").short_id(), "abc");
    }

    #[test]
    fn test_random_topic_shape() {
        let topic = random_topic();
        assert_eq!(topic.len(), 64);
        assert!(topic.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(topic, random_topic());
    }

    #[test]
    fn test_peer_id_serializes_as_string() {
        let id = PeerId::new("peer-a");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"peer-a\"");
    }
}
