//! Room topic derivation.
//!
//! Two peers typing the same code must land on the same topic, so inputs are
//! trimmed and upper-cased before hashing. Nothing here touches the network.

use rand::Rng;

use crate::checksum::checksum;
use crate::error::{CoreError, Result};
use crate::room::RoomKind;

/// Derivation string of the community room
pub const GENERAL_ROOM_SEED: &str = "loralink:general:v1";
/// Prefix for local-network room derivations
pub const LOCAL_ROOM_PREFIX: &str = "loralink:local:";
/// Prefix for private room derivations
pub const PRIVATE_ROOM_PREFIX: &str = "loralink:private:";
/// Network label used when no local identifier is available
pub const DEFAULT_LOCAL_NETWORK: &str = "LAN";

const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const CODE_GROUP_LEN: usize = 4;

/// Trims and upper-cases a room code or network identifier.
pub fn normalize(raw: &str) -> String {
    raw.trim().to_uppercase()
}

/// The string that gets hashed for a room.
pub fn derivation(kind: RoomKind, raw_input: &str) -> Result<String> {
    let normalized = normalize(raw_input);
    match kind {
        RoomKind::General => Ok(GENERAL_ROOM_SEED.to_string()),
        RoomKind::Local => {
            let network = if normalized.is_empty() {
                DEFAULT_LOCAL_NETWORK.to_string()
            } else {
                normalized
            };
            Ok(format!("{LOCAL_ROOM_PREFIX}{network}"))
        }
        RoomKind::Private => {
            if normalized.is_empty() {
                return Err(CoreError::InvalidRoomCode(raw_input.to_string()));
            }
            Ok(format!("{PRIVATE_ROOM_PREFIX}{normalized}"))
        }
    }
}

/// Resolves a room kind and user input to its 64-hex topic.
pub fn resolve(kind: RoomKind, raw_input: &str) -> Result<String> {
    let derived = derivation(kind, raw_input)?;
    Ok(checksum(derived.as_bytes()))
}

/// The code remembered for a room: normalized input, or `None` for the
/// general room and for a local room on the default network.
pub fn room_code(kind: RoomKind, raw_input: &str) -> Option<String> {
    let normalized = normalize(raw_input);
    match kind {
        RoomKind::General => None,
        _ if normalized.is_empty() => None,
        _ => Some(normalized),
    }
}

/// A random private room code such as `K7QM-2XPA`.
pub fn generate_room_code() -> String {
    let mut rng = rand::thread_rng();
    let mut group = || -> String {
        (0..CODE_GROUP_LEN)
            .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
            .collect()
    };
    let first = group();
    let second = group();
    format!("{first}-{second}")
}
