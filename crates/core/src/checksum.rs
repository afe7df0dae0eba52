//! SHA-256 content checksums.
//!
//! Sender and receiver run in different processes, so every checksum in the
//! system goes through this one routine and is rendered as lowercase hex.

use sha2::{Digest, Sha256};

use crate::error::{CoreError, Result};

/// Length of a hex encoded SHA-256 digest
pub const CHECKSUM_HEX_LEN: usize = 64;

/// Lowercase hex SHA-256 of `data`.
pub fn checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Checks `data` against an expected hex digest, ignoring case.
pub fn validate(data: &[u8], expected: &str) -> bool {
    let expected = expected.trim();
    if expected.len() != CHECKSUM_HEX_LEN {
        return false;
    }
    checksum(data).eq_ignore_ascii_case(expected)
}

/// Normalizes a received checksum, rejecting anything that is not a digest.
pub fn parse_checksum(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.len() != CHECKSUM_HEX_LEN || !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(CoreError::InvalidChecksum(raw.to_string()));
    }
    Ok(trimmed.to_ascii_lowercase())
}

/// Incremental hashing for payloads assembled piece by piece.
#[derive(Default)]
pub struct ChecksumBuilder {
    hasher: Sha256,
}

impl ChecksumBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vector() {
        assert_eq!(
            checksum(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            checksum(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_validate_accepts_own_checksum() {
        let data = b"gemma-lora-v1 weights";
        assert!(validate(data, &checksum(data)));
    }

    #[test]
    fn test_validate_is_case_insensitive() {
        let data = b"payload";
        assert!(validate(data, &checksum(data).to_uppercase()));
    }

    #[test]
    fn test_validate_rejects_other_payload() {
        let data = b"payload";
        let other = b"payloae";
        assert!(!validate(data, &checksum(other)));
        assert!(!validate(data, "not-a-digest"));
    }

    #[test]
    fn test_builder_matches_one_shot() {
        let mut builder = ChecksumBuilder::new();
        builder.update(b"hello ");
        builder.update(b"world");
        assert_eq!(builder.finish(), checksum(b"hello world"));
    }

    #[test]
    fn test_parse_checksum() {
        let digest = checksum(b"x").to_uppercase();
        assert_eq!(parse_checksum(&digest).unwrap(), checksum(b"x"));
        assert!(parse_checksum("zz").is_err());
    }
}
