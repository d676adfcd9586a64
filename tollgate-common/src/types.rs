//! Common type definitions and constants used throughout Tollgate

use serde::{Deserialize, Serialize};

/// Reader identifier - opaque string assigned at registration
pub type ReaderId = String;

/// Card identifier - hex SHA-256 of the raw RFID UID bytes
pub type TagHash = String;

/// Event identifier - hex-encoded random 16 bytes, assigned at acceptance
pub type EventId = String;

/// Timestamp in seconds since Unix epoch
pub type Timestamp = u64;

/// Chain link sequence number
pub type Seq = u64;

/// Hash type - 32-byte SHA-256
pub type Hash = [u8; 32];

/// Violation classes recognized by the trust engine.
///
/// Critical classes quarantine a reader on a single occurrence regardless
/// of its current score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationClass {
    /// Signature did not verify against the reader secret
    BadSignature,
    /// Nonce was already observed for this reader
    Replay,
    /// Event carried a superseded key version
    BadKeyVersion,
    /// Event timestamp outside the allowed drift window
    StaleTimestamp,
    /// Per-reader rate limit exhausted
    RateExceeded,
    /// Fraud rule layer flagged the decision
    FraudRule,
    /// ML fusion blocked the decision
    FraudMl,
    /// Non-positive amount or a deduction that would drive balance negative
    BalanceManipulation,
}

impl ViolationClass {
    /// Critical violations quarantine on first occurrence.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            ViolationClass::BadSignature
                | ViolationClass::Replay
                | ViolationClass::BalanceManipulation
        )
    }

    /// Stable identifier used in reason codes and stored records.
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationClass::BadSignature => "BAD_SIGNATURE",
            ViolationClass::Replay => "REPLAY",
            ViolationClass::BadKeyVersion => "BAD_KEY_VERSION",
            ViolationClass::StaleTimestamp => "STALE_TIMESTAMP",
            ViolationClass::RateExceeded => "RATE_EXCEEDED",
            ViolationClass::FraudRule => "FRAUD_RULE",
            ViolationClass::FraudMl => "FRAUD_ML",
            ViolationClass::BalanceManipulation => "BALANCE_MANIPULATION",
        }
    }
}

/// Cryptographic sizes
pub mod sizes {
    /// Hash size in bytes (SHA-256)
    pub const HASH_SIZE: usize = 32;

    /// Per-reader HMAC secret size in bytes
    pub const SECRET_SIZE: usize = 32;

    /// Event id size in bytes (before hex encoding)
    pub const EVENT_ID_SIZE: usize = 16;

    /// Reader nonce size in bytes (before hex encoding)
    pub const NONCE_SIZE: usize = 16;
}

/// Database key prefixes for the logical tables
pub mod keyspace {
    /// Reader registry
    pub const READER_PREFIX: &str = "reader";
    /// Nonce ledger; composite key `{reader_id}:{nonce}`
    pub const NONCE_PREFIX: &str = "nonce";
    /// Card balances
    pub const CARD_PREFIX: &str = "card";
    /// Tariff table
    pub const TARIFF_PREFIX: &str = "tariff";
    /// Decision log, sequence keyed
    pub const DECISION_PREFIX: &str = "decision";
    /// Decision event-id index
    pub const DECISION_EVENT_PREFIX: &str = "decision_by_event";
    /// VDF chain links, sequence keyed
    pub const VDF_LINK_PREFIX: &str = "vdf_link";
    /// Link event-id index; makes appends idempotent per event
    pub const VDF_LINK_EVENT_PREFIX: &str = "vdf_link_by_event";
    /// Ledger anchors
    pub const ANCHOR_PREFIX: &str = "anchor";
    /// Quarantine records
    pub const QUARANTINE_PREFIX: &str = "quarantine";
    /// Probation challenges
    pub const CHALLENGE_PREFIX: &str = "challenge";
    /// Peer consensus votes; composite key `{subject}:{voter}`
    pub const PEER_VOTE_PREFIX: &str = "peer_vote";
    /// Open peer-consensus rounds, keyed by subject reader
    pub const CONSENSUS_PREFIX: &str = "consensus";
    /// Suspect tags propagated from quarantined readers
    pub const SUSPECT_TAG_PREFIX: &str = "suspect_tag";
    /// Whitelisted tags for KNOWN_TAG challenges
    pub const WHITELIST_TAG_PREFIX: &str = "whitelist_tag";
    /// Chain metadata (head pointer, genesis seed)
    pub const CHAIN_META_KEY: &str = "chain_meta";
    /// Anchor queue metadata (high-water mark)
    pub const ANCHOR_META_KEY: &str = "anchor_meta";
}

/// Utility extension for hash values
pub trait HashExt {
    /// Create a zero hash
    fn zero() -> Self;
    /// Check if hash is zero
    fn is_zero(&self) -> bool;
}

impl HashExt for Hash {
    fn zero() -> Self {
        [0u8; 32]
    }

    fn is_zero(&self) -> bool {
        *self == [0u8; 32]
    }
}
