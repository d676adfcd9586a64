//! Request and response bodies for the HTTP surface.
//!
//! All bodies are JSON; timestamps are integer seconds since epoch.

use serde::{Deserialize, Serialize};
use tollgate_common::types::{Seq, Timestamp};

/// One inbound toll event as submitted by a reader.
///
/// The signature covers the UTF-8 concatenation
/// `tag_hash || reader_id || decimal_timestamp || nonce` with no
/// separators, independent of JSON field order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TollEventRequest {
    /// Hex SHA-256 of the raw RFID UID
    pub tag_hash: String,
    /// Registered reader identifier
    pub reader_id: String,
    /// Seconds since epoch, bounded by the drift policy
    pub timestamp: Timestamp,
    /// Reader-unique random string
    pub nonce: String,
    /// Hex HMAC-SHA256 over the canonical message
    pub signature: String,
    /// Reader's current key version
    pub key_version: u32,
}

impl TollEventRequest {
    /// The canonical signature message.
    pub fn canonical_message(&self) -> Vec<u8> {
        format!(
            "{}{}{}{}",
            self.tag_hash, self.reader_id, self.timestamp, self.nonce
        )
        .into_bytes()
    }
}

/// Successful ingest outcome (allow and block are both 200s; a block is a
/// business outcome, not an error).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestResponse {
    pub decision: String,
    pub reason_codes: Vec<String>,
    pub trust_score: i64,
    pub event_id: String,
    pub vdf_seq: Option<Seq>,
}

/// Rejection body for non-200 ingest outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectionBody {
    pub error: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterReaderRequest {
    pub reader_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterReaderResponse {
    pub reader_id: String,
    /// Hex-encoded shared secret; shown once at registration
    pub secret: String,
    pub key_version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotateSecretRequest {
    pub reader_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotateSecretResponse {
    pub reader_id: String,
    /// Hex-encoded replacement secret; earlier-key signatures are void
    pub secret: String,
    pub new_key_version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetTrustRequest {
    pub reader_id: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForceQuarantineRequest {
    pub reader_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerVoteRequest {
    pub subject_reader_id: String,
    pub voter_reader_id: String,
    /// APPROVE or REJECT
    pub vote: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerVoteResponse {
    /// "pending" or "restored"
    pub outcome: String,
    pub approvals: usize,
    pub eligible: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeResponseRequest {
    pub reader_id: String,
    pub challenge_id: String,
    pub response: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeResponseResponse {
    pub passed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhitelistTagRequest {
    pub tag_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearNoncesRequest {
    /// Delete nonce records observed before this timestamp
    pub before: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearNoncesResponse {
    pub removed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReseedGenesisRequest {
    pub seed: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryAnchorRequest {
    pub id: u64,
}

/// Reader state exposed over telemetry and admin responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderView {
    pub reader_id: String,
    pub key_version: u32,
    pub trust_score: i64,
    pub status: String,
    pub auth_failures: u64,
    pub replay_attempts: u64,
    pub consecutive_successes: u32,
    pub last_violation_at: Option<Timestamp>,
    pub last_update_at: Timestamp,
}

/// Aggregate counters for `/stats/summary`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSummary {
    pub readers: usize,
    pub active_readers: usize,
    pub quarantined_readers: usize,
    pub total_decisions: u64,
    pub nonce_records: usize,
    pub chain_head: Seq,
    pub pending_anchors: usize,
    pub anchor_backpressure_warnings: u64,
}

/// `/system/status` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    pub version: String,
    /// False while a fatal startup condition keeps ingest refused
    pub ingest_enabled: bool,
    pub chain_head: Seq,
    pub server_time: Timestamp,
}

/// `/blockchain/audit` body: anchors plus a fresh chain verdict.
#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub verdict: tollgate_chain::ChainVerdict,
    pub anchors: Vec<tollgate_chain::Anchor>,
    /// Whether every SENT anchor's root still matches the chain
    pub anchors_consistent: bool,
}
