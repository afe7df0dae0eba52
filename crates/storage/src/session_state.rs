//! Durable session state: last room, sharing state and room history.
//!
//! The stored document is versioned JSON. Loading never fails: each field is
//! validated on its own and anything missing or malformed falls back to its
//! default. Saving swallows backend errors after logging them.

use loralink_core::RoomKind;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::kv::KvStore;

/// Current schema version written by [`PersistenceStore::save`]
pub const SCHEMA_VERSION: u64 = 1;

#[derive(Debug, Clone)]
pub struct SessionStateConfig {
    pub key: String,
    pub history_limit: usize,
}

impl Default for SessionStateConfig {
    fn default() -> Self {
        Self {
            key: "loralink.session".to_string(),
            history_limit: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    #[default]
    Auto,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastRoom {
    pub kind: RoomKind,
    pub code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomHistoryEntry {
    pub kind: RoomKind,
    pub code: Option<String>,
    pub timestamp: u64,
}

impl RoomHistoryEntry {
    fn dedup_key(&self) -> (RoomKind, Option<String>) {
        (self.kind, self.code.as_ref().map(|c| c.trim().to_uppercase()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub last_room: Option<LastRoom>,
    pub last_mode: ConnectionMode,
    pub shared_adapter_names: BTreeSet<String>,
    pub is_sharing: bool,
    /// Most recent first
    pub room_history: Vec<RoomHistoryEntry>,
}

impl PersistedState {
    /// Puts a room at the head of the history, dropping older duplicates.
    pub fn record_room(&mut self, kind: RoomKind, code: Option<String>, timestamp: u64, limit: usize) {
        let entry = RoomHistoryEntry {
            kind,
            code,
            timestamp,
        };
        let key = entry.dedup_key();
        self.room_history.retain(|e| e.dedup_key() != key);
        self.room_history.insert(0, entry);
        self.room_history.truncate(limit);
    }

    pub fn set_last_room(&mut self, kind: RoomKind, code: Option<String>) {
        self.last_room = Some(LastRoom { kind, code });
    }

    /// Returns true if the name was newly added.
    pub fn remember_shared(&mut self, name: &str) -> bool {
        let added = self.shared_adapter_names.insert(name.to_string());
        self.is_sharing = true;
        added
    }

    pub fn forget_shared(&mut self, name: &str) -> bool {
        let removed = self.shared_adapter_names.remove(name);
        if self.shared_adapter_names.is_empty() {
            self.is_sharing = false;
        }
        removed
    }

    /// Validates a stored document field by field.
    pub fn from_value(value: &Value, history_limit: usize) -> Self {
        let Some(object) = value.as_object() else {
            warn!("Persisted session state is not an object, using defaults");
            return Self::default();
        };

        let version = match object.get("version") {
            None => 0,
            Some(v) => match v.as_u64() {
                Some(v) => v,
                None => {
                    warn!("Persisted session state has a malformed version, using defaults");
                    return Self::default();
                }
            },
        };
        if version > SCHEMA_VERSION {
            warn!(version, "Persisted session state is from a newer schema, using defaults");
            return Self::default();
        }
        if version < SCHEMA_VERSION {
            debug!(from = version, to = SCHEMA_VERSION, "Migrating persisted session state");
        }

        let mut state = Self {
            last_room: parse_last_room(object.get("lastRoom")),
            last_mode: object
                .get("lastMode")
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default(),
            shared_adapter_names: object
                .get("sharedAdapterNames")
                .and_then(Value::as_array)
                .map(|names| {
                    names
                        .iter()
                        .filter_map(Value::as_str)
                        .filter(|n| !n.trim().is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            is_sharing: object
                .get("isSharing")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            room_history: Vec::new(),
        };

        let mut history: Vec<RoomHistoryEntry> = object
            .get("roomHistory")
            .and_then(Value::as_array)
            .map(|entries| entries.iter().filter_map(parse_history_entry).collect())
            .unwrap_or_default();
        // Stable sort keeps stored order among equal timestamps
        history.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        for entry in history {
            let key = entry.dedup_key();
            if state.room_history.iter().all(|e| e.dedup_key() != key) {
                state.room_history.push(entry);
            }
        }
        state.room_history.truncate(history_limit);

        state
    }

    pub fn to_value(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()));
        if let Value::Object(ref mut object) = value {
            object.insert("version".to_string(), Value::from(SCHEMA_VERSION));
        }
        value
    }
}

fn parse_kind(value: Option<&Value>) -> Option<RoomKind> {
    value.and_then(Value::as_str).and_then(RoomKind::parse)
}

fn parse_code(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
}

fn parse_last_room(value: Option<&Value>) -> Option<LastRoom> {
    let object = value?.as_object()?;
    let kind = parse_kind(object.get("kind"))?;
    let code = parse_code(object.get("code"));
    if kind == RoomKind::Private && code.is_none() {
        return None;
    }
    Some(LastRoom { kind, code })
}

fn parse_history_entry(value: &Value) -> Option<RoomHistoryEntry> {
    let object = value.as_object()?;
    let kind = parse_kind(object.get("kind"))?;
    let code = parse_code(object.get("code"));
    if kind == RoomKind::Private && code.is_none() {
        return None;
    }
    Some(RoomHistoryEntry {
        kind,
        code,
        timestamp: object.get("timestamp").and_then(Value::as_u64)?,
    })
}

/// Loads and saves [`PersistedState`] through a [`KvStore`].
#[derive(Clone)]
pub struct PersistenceStore {
    kv: Arc<dyn KvStore>,
    config: SessionStateConfig,
}

impl PersistenceStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self::with_config(kv, SessionStateConfig::default())
    }

    pub fn with_config(kv: Arc<dyn KvStore>, config: SessionStateConfig) -> Self {
        Self { kv, config }
    }

    pub fn history_limit(&self) -> usize {
        self.config.history_limit
    }

    /// Never fails; unreadable or invalid state yields the default.
    pub async fn load(&self) -> PersistedState {
        let raw = match self.kv.get(&self.config.key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return PersistedState::default(),
            Err(e) => {
                warn!(error = %e, "Failed to read session state");
                return PersistedState::default();
            }
        };

        match serde_json::from_str::<Value>(&raw) {
            Ok(value) => PersistedState::from_value(&value, self.config.history_limit),
            Err(e) => {
                warn!(error = %e, "Stored session state is not valid JSON");
                PersistedState::default()
            }
        }
    }

    /// Returns whether the write reached the backend.
    pub async fn save(&self, state: &PersistedState) -> bool {
        let raw = state.to_value().to_string();
        match self.kv.set(&self.config.key, &raw).await {
            Ok(()) => {
                debug!(bytes = raw.len(), "Saved session state");
                true
            }
            Err(e) => {
                warn!(error = %e, "Failed to save session state");
                false
            }
        }
    }

    pub async fn clear(&self) {
        if let Err(e) = self.kv.remove(&self.config.key).await {
            warn!(error = %e, "Failed to clear session state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{KvStore, MemoryKvStore};
    use serde_json::json;

    fn store() -> (Arc<MemoryKvStore>, PersistenceStore) {
        let kv = Arc::new(MemoryKvStore::new());
        let store = PersistenceStore::new(kv.clone());
        (kv, store)
    }

    #[tokio::test]
    async fn test_missing_state_is_default() {
        let (_, store) = store();
        assert_eq!(store.load().await, PersistedState::default());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let (_, store) = store();
        let mut state = PersistedState::default();
        state.set_last_room(RoomKind::Private, Some("PIZZA-123".into()));
        state.last_mode = ConnectionMode::Manual;
        state.remember_shared("gemma-lora-v1");
        state.record_room(RoomKind::Private, Some("PIZZA-123".into()), 1000, 10);

        assert!(store.save(&state).await);
        assert_eq!(store.load().await, state);
    }

    #[tokio::test]
    async fn test_garbage_is_default() {
        let (kv, store) = store();
        kv.set("loralink.session", "{not json").await.unwrap();
        assert_eq!(store.load().await, PersistedState::default());

        kv.set("loralink.session", "[1,2,3]").await.unwrap();
        assert_eq!(store.load().await, PersistedState::default());
    }

    #[tokio::test]
    async fn test_unavailable_backend_is_swallowed() {
        let (kv, store) = store();
        kv.set_available(false);
        assert!(!store.save(&PersistedState::default()).await);
        assert_eq!(store.load().await, PersistedState::default());
        store.clear().await;
    }

    #[test]
    fn test_malformed_fields_are_coerced() {
        let value = json!({
            "version": 1,
            "lastRoom": { "kind": "basement", "code": "X" },
            "lastMode": 7,
            "sharedAdapterNames": "not-a-list",
            "isSharing": "yes",
            "roomHistory": { "oops": true }
        });
        let state = PersistedState::from_value(&value, 10);
        assert_eq!(state, PersistedState::default());
    }

    #[test]
    fn test_private_room_without_code_is_dropped() {
        let value = json!({ "lastRoom": { "kind": "private", "code": "  " } });
        assert_eq!(PersistedState::from_value(&value, 10).last_room, None);

        let value = json!({ "lastRoom": { "kind": "general" } });
        assert_eq!(
            PersistedState::from_value(&value, 10).last_room,
            Some(LastRoom {
                kind: RoomKind::General,
                code: None
            })
        );
    }

    #[test]
    fn test_unversioned_document_is_migrated() {
        let value = json!({
            "lastRoom": { "kind": "private", "code": "PIZZA-123" },
            "sharedAdapterNames": ["a", 5, "b", ""],
            "isSharing": true
        });
        let state = PersistedState::from_value(&value, 10);
        assert_eq!(state.last_room.unwrap().code.as_deref(), Some("PIZZA-123"));
        assert_eq!(
            state.shared_adapter_names.into_iter().collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert!(state.is_sharing);
    }

    #[test]
    fn test_future_version_is_default() {
        let value = json!({ "version": 99, "isSharing": true });
        assert_eq!(PersistedState::from_value(&value, 10), PersistedState::default());
    }

    #[test]
    fn test_history_dedup_and_bound() {
        let mut state = PersistedState::default();
        for i in 0..15u64 {
            state.record_room(RoomKind::Private, Some(format!("ROOM-{i}")), i, 10);
        }
        state.record_room(RoomKind::Private, Some("room-14".into()), 100, 10);

        assert_eq!(state.room_history.len(), 10);
        assert_eq!(state.room_history[0].code.as_deref(), Some("room-14"));
        assert_eq!(state.room_history[0].timestamp, 100);
        assert_eq!(state.room_history[1].code.as_deref(), Some("ROOM-13"));
        assert!(state
            .room_history
            .iter()
            .all(|e| e.code.as_deref() != Some("ROOM-14")));
    }

    #[test]
    fn test_loaded_history_is_sorted_and_deduplicated() {
        let value = json!({
            "roomHistory": [
                { "kind": "private", "code": "A", "timestamp": 1 },
                { "kind": "private", "code": "B", "timestamp": 5 },
                { "kind": "private", "code": "a", "timestamp": 3 },
                { "kind": "private", "timestamp": 9 },
                { "kind": "general", "timestamp": 2 }
            ]
        });
        let state = PersistedState::from_value(&value, 10);
        let codes: Vec<_> = state
            .room_history
            .iter()
            .map(|e| (e.kind, e.code.clone()))
            .collect();
        assert_eq!(
            codes,
            vec![
                (RoomKind::Private, Some("B".to_string())),
                (RoomKind::Private, Some("a".to_string())),
                (RoomKind::General, None),
            ]
        );
    }

    #[test]
    fn test_forget_last_shared_clears_flag() {
        let mut state = PersistedState::default();
        state.remember_shared("x");
        assert!(state.is_sharing);
        assert!(state.forget_shared("x"));
        assert!(!state.is_sharing);
    }
}
