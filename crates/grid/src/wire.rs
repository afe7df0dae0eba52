use bytes::Bytes;
use serde::{Deserialize, Serialize};

use loralink_core::AdapterInfo;

use crate::error::{GridError, Result};

/// Largest application payload accepted from a peer
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16 MB

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMessage {
    pub topic: String,
    pub index: u32,
    pub total: u32,
    #[serde(with = "base64_bytes")]
    pub chunk: Bytes,
    pub chunk_checksum: String,
}

/// Application messages carried inside transport payloads.
///
/// Encoded as `{"type": "...", "data": ...}` JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum WireMessage {
    /// Full list of what the sender currently shares
    AdapterList(Vec<AdapterInfo>),
    /// Ask the owner of a shared instance to stream it
    AdapterRequest { topic: String },
    AdapterChunk(ChunkMessage),
}

impl WireMessage {
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(GridError::Protocol(format!(
                "message too large: {} bytes",
                data.len()
            )));
        }
        Ok(serde_json::from_slice(data)?)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            WireMessage::AdapterList(_) => "adapter-list",
            WireMessage::AdapterRequest { .. } => "adapter-request",
            WireMessage::AdapterChunk(_) => "adapter-chunk",
        }
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_request_shape() {
        let msg = WireMessage::AdapterRequest {
            topic: "ab".repeat(32),
        };
        let value: Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "adapter-request");
        assert_eq!(value["data"]["topic"], "ab".repeat(32));
    }

    #[test]
    fn test_chunk_shape() {
        let msg = WireMessage::AdapterChunk(ChunkMessage {
            topic: "t".into(),
            index: 2,
            total: 3,
            chunk: Bytes::from_static(b"hi"),
            chunk_checksum: "c".into(),
        });
        let value: Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "adapter-chunk");
        assert_eq!(value["data"]["index"], 2);
        assert_eq!(value["data"]["chunk"], "aGk=");
        assert_eq!(value["data"]["chunkChecksum"], "c");

        assert_eq!(WireMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_list_shape() {
        let info = AdapterInfo::new("gemma-lora-v1", 3, "00".repeat(32), "11".repeat(32));
        let msg = WireMessage::AdapterList(vec![info]);
        let value: Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "adapter-list");
        assert_eq!(value["data"][0]["name"], "gemma-lora-v1");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(WireMessage::decode(b"not json").is_err());
        assert!(WireMessage::decode(br#"{"type":"unknown","data":{}}"#).is_err());
        assert!(WireMessage::decode(br#"{"type":"adapter-chunk","data":{"topic":"t","index":0,"total":1,"chunk":"***","chunkChecksum":"c"}}"#).is_err());
    }
}
