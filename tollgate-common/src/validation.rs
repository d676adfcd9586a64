//! Input validation utilities for wire-facing fields

use crate::error::{TollError, TollResult};

/// Maximum accepted reader id length
const MAX_READER_ID_LEN: usize = 64;
/// Maximum accepted nonce length (hex chars)
const MAX_NONCE_LEN: usize = 128;
/// Tag hash is hex SHA-256
const TAG_HASH_LEN: usize = 64;
/// Signature is hex HMAC-SHA256
const SIGNATURE_LEN: usize = 64;

/// Validation utilities for common data types
pub struct ValidationUtils;

impl ValidationUtils {
    /// Validate hex string format and length
    pub fn validate_hex_string(hex_str: &str, expected_chars: usize) -> TollResult<()> {
        if hex_str.is_empty() {
            return Err(TollError::validation("Hex string cannot be empty"));
        }

        if hex_str.len() != expected_chars {
            return Err(TollError::validation(format!(
                "Invalid hex length: expected {}, got {}",
                expected_chars,
                hex_str.len()
            )));
        }

        if !hex_str.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(TollError::validation("Invalid hex characters"));
        }

        Ok(())
    }

    /// Validate a tag hash (hex SHA-256 of the raw UID)
    pub fn validate_tag_hash(tag_hash: &str) -> TollResult<()> {
        Self::validate_hex_string(tag_hash, TAG_HASH_LEN)
            .map_err(|_| TollError::validation("tag_hash must be 64 hex characters"))
    }

    /// Validate and decode an event signature (hex HMAC-SHA256)
    pub fn parse_signature_hex(signature: &str) -> TollResult<[u8; 32]> {
        Self::validate_hex_string(signature, SIGNATURE_LEN)
            .map_err(|_| TollError::validation("signature must be 64 hex characters"))?;

        let bytes = hex::decode(signature)
            .map_err(|e| TollError::validation(format!("Invalid signature hex: {}", e)))?;

        let mut sig = [0u8; 32];
        sig.copy_from_slice(&bytes);
        Ok(sig)
    }

    /// Validate a reader id (non-empty, bounded, printable ASCII)
    pub fn validate_reader_id(reader_id: &str) -> TollResult<()> {
        if reader_id.is_empty() {
            return Err(TollError::validation("reader_id cannot be empty"));
        }

        if reader_id.len() > MAX_READER_ID_LEN {
            return Err(TollError::validation(format!(
                "reader_id too long: {} chars (max {})",
                reader_id.len(),
                MAX_READER_ID_LEN
            )));
        }

        if !reader_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(TollError::validation(
                "reader_id may contain only alphanumerics, '-' and '_'",
            ));
        }

        Ok(())
    }

    /// Validate a reader-chosen nonce
    pub fn validate_nonce(nonce: &str) -> TollResult<()> {
        if nonce.is_empty() {
            return Err(TollError::validation("nonce cannot be empty"));
        }

        if nonce.len() > MAX_NONCE_LEN {
            return Err(TollError::validation(format!(
                "nonce too long: {} chars (max {})",
                nonce.len(),
                MAX_NONCE_LEN
            )));
        }

        if nonce.contains(':') {
            // ':' is the composite-key separator in the nonce ledger
            return Err(TollError::validation("nonce may not contain ':'"));
        }

        Ok(())
    }

    /// Validate a timestamp is within a plausible epoch range
    pub fn validate_timestamp(timestamp: u64) -> TollResult<()> {
        const MIN_TIMESTAMP: u64 = 1609459200; // 2021-01-01
        const MAX_TIMESTAMP: u64 = 32503680000; // 2999-12-31

        if timestamp < MIN_TIMESTAMP {
            return Err(TollError::validation("Timestamp too old"));
        }

        if timestamp > MAX_TIMESTAMP {
            return Err(TollError::validation("Timestamp too far in future"));
        }

        Ok(())
    }

    /// Validate range for numeric values
    pub fn validate_range<T: PartialOrd + Copy + std::fmt::Debug>(
        value: T,
        min: T,
        max: T,
        field_name: &str,
    ) -> TollResult<T> {
        if value < min || value > max {
            return Err(TollError::validation(format!(
                "{} out of range (min: {:?}, max: {:?})",
                field_name, min, max
            )));
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_validation() {
        assert!(ValidationUtils::validate_hex_string("deadbeef", 8).is_ok());
        assert!(ValidationUtils::validate_hex_string("abc", 8).is_err());
        assert!(ValidationUtils::validate_hex_string("xyzw", 4).is_err());
        assert!(ValidationUtils::validate_hex_string("", 0).is_err());
    }

    #[test]
    fn test_tag_hash_validation() {
        let valid = "1234567890abcdef1234567890abcdef1234567890abcdef1234567890abcdef";
        assert!(ValidationUtils::validate_tag_hash(valid).is_ok());
        assert!(ValidationUtils::validate_tag_hash("invalid").is_err());
    }

    #[test]
    fn test_reader_id_validation() {
        assert!(ValidationUtils::validate_reader_id("lane-03_north").is_ok());
        assert!(ValidationUtils::validate_reader_id("").is_err());
        assert!(ValidationUtils::validate_reader_id("has space").is_err());
        assert!(ValidationUtils::validate_reader_id(&"x".repeat(100)).is_err());
    }

    #[test]
    fn test_nonce_validation() {
        assert!(ValidationUtils::validate_nonce("a1b2c3d4").is_ok());
        assert!(ValidationUtils::validate_nonce("").is_err());
        assert!(ValidationUtils::validate_nonce("has:colon").is_err());
        assert!(ValidationUtils::validate_nonce(&"n".repeat(200)).is_err());
    }

    #[test]
    fn test_timestamp_validation() {
        assert!(ValidationUtils::validate_timestamp(1700000000).is_ok());
        assert!(ValidationUtils::validate_timestamp(1000000000).is_err());
        assert!(ValidationUtils::validate_timestamp(99999999999).is_err());
    }

    #[test]
    fn test_signature_parse() {
        let sig_hex = "00".repeat(32);
        let parsed = ValidationUtils::parse_signature_hex(&sig_hex).unwrap();
        assert_eq!(parsed, [0u8; 32]);
        assert!(ValidationUtils::parse_signature_hex("short").is_err());
    }
}
