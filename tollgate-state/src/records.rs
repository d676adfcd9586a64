//! Quarantine, probation-challenge, peer-vote and tag-suspicion records

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tollgate_common::{
    database::{StoreOps, TollDatabase},
    error::TollResult,
    serialization::{EncodingType, TollSerialize},
    types::{keyspace, ReaderId, TagHash, Timestamp, ViolationClass},
};

/// One quarantine episode for a reader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quarantine {
    pub reader_id: ReaderId,
    pub entered_at: Timestamp,
    pub severity: u8,
    pub trigger_violation: ViolationClass,
    pub cleared_at: Option<Timestamp>,
}

impl TollSerialize for Quarantine {
    fn preferred_encoding() -> EncodingType {
        EncodingType::Bincode
    }
}

/// Probation challenge kinds, issued one of each per severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChallengeKind {
    KnownTag,
    Timing,
    HashVerify,
}

impl ChallengeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeKind::KnownTag => "KNOWN_TAG",
            ChallengeKind::Timing => "TIMING",
            ChallengeKind::HashVerify => "HASH_VERIFY",
        }
    }
}

/// One issued probation challenge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbationChallenge {
    pub challenge_id: String,
    pub reader_id: ReaderId,
    pub kind: ChallengeKind,
    /// Challenge material: the whitelisted tag hash (KNOWN_TAG), the
    /// server nonce (TIMING), or hex bytes to hash (HASH_VERIFY).
    pub payload: String,
    /// Expected answer, where precomputable.
    pub expected_response: Option<String>,
    pub issued_at: Timestamp,
    pub attempts_remaining: u32,
    pub expires_at: Timestamp,
    pub passed: Option<bool>,
}

impl ProbationChallenge {
    pub fn is_open(&self, now: Timestamp) -> bool {
        self.passed.is_none() && now <= self.expires_at && self.attempts_remaining > 0
    }
}

impl TollSerialize for ProbationChallenge {
    fn preferred_encoding() -> EncodingType {
        EncodingType::Bincode
    }
}

/// Peer consensus ballot values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Vote {
    Approve,
    Reject,
}

/// One peer vote; unique on `(subject, voter)`, latest wins within the
/// voting window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerVote {
    pub subject_reader_id: ReaderId,
    pub voter_reader_id: ReaderId,
    pub vote: Vote,
    pub cast_at: Timestamp,
}

impl TollSerialize for PeerVote {
    fn preferred_encoding() -> EncodingType {
        EncodingType::Bincode
    }
}

/// An open peer-consensus round for a quarantined reader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusRound {
    pub reader_id: ReaderId,
    pub opened_at: Timestamp,
    pub expires_at: Timestamp,
    pub eligible_peers: Vec<ReaderId>,
}

impl TollSerialize for ConsensusRound {
    fn preferred_encoding() -> EncodingType {
        EncodingType::Bincode
    }
}

/// A tag marked suspect by quarantine propagation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspectTag {
    pub tag_hash: TagHash,
    pub source_reader: ReaderId,
    pub marked_at: Timestamp,
    pub expires_at: Timestamp,
}

impl TollSerialize for SuspectTag {
    fn preferred_encoding() -> EncodingType {
        EncodingType::Bincode
    }
}

/// Store for quarantine / probation / consensus records.
#[derive(Clone)]
pub struct RecordStore {
    db: Arc<TollDatabase>,
}

impl RecordStore {
    pub fn new(db: Arc<TollDatabase>) -> Self {
        Self { db }
    }

    // --- quarantine ---

    fn quarantine_key(reader_id: &str, entered_at: Timestamp) -> String {
        format!("{}:{:016x}", reader_id, entered_at)
    }

    pub async fn put_quarantine(&self, q: &Quarantine) -> TollResult<()> {
        self.db
            .store_data(
                keyspace::QUARANTINE_PREFIX,
                &Self::quarantine_key(&q.reader_id, q.entered_at),
                q,
            )
            .await
    }

    /// All quarantine episodes for a reader, oldest first.
    pub async fn quarantines_for(&self, reader_id: &str) -> TollResult<Vec<Quarantine>> {
        let entries: Vec<(String, Quarantine)> =
            self.db.scan_prefix(keyspace::QUARANTINE_PREFIX).await?;
        Ok(entries
            .into_iter()
            .filter(|(key, _)| key.starts_with(&format!("{}:", reader_id)))
            .map(|(_, q)| q)
            .collect())
    }

    /// The uncleared quarantine episode, if any.
    pub async fn active_quarantine(&self, reader_id: &str) -> TollResult<Option<Quarantine>> {
        Ok(self
            .quarantines_for(reader_id)
            .await?
            .into_iter()
            .rev()
            .find(|q| q.cleared_at.is_none()))
    }

    // --- challenges ---

    fn challenge_key(reader_id: &str, challenge_id: &str) -> String {
        format!("{}:{}", reader_id, challenge_id)
    }

    pub async fn put_challenge(&self, c: &ProbationChallenge) -> TollResult<()> {
        self.db
            .store_data(
                keyspace::CHALLENGE_PREFIX,
                &Self::challenge_key(&c.reader_id, &c.challenge_id),
                c,
            )
            .await
    }

    pub async fn challenge(
        &self,
        reader_id: &str,
        challenge_id: &str,
    ) -> TollResult<Option<ProbationChallenge>> {
        self.db
            .load_data(
                keyspace::CHALLENGE_PREFIX,
                &Self::challenge_key(reader_id, challenge_id),
            )
            .await
    }

    pub async fn challenges_for(&self, reader_id: &str) -> TollResult<Vec<ProbationChallenge>> {
        let entries: Vec<(String, ProbationChallenge)> =
            self.db.scan_prefix(keyspace::CHALLENGE_PREFIX).await?;
        Ok(entries
            .into_iter()
            .filter(|(key, _)| key.starts_with(&format!("{}:", reader_id)))
            .map(|(_, c)| c)
            .collect())
    }

    pub async fn all_challenges(&self) -> TollResult<Vec<ProbationChallenge>> {
        let entries: Vec<(String, ProbationChallenge)> =
            self.db.scan_prefix(keyspace::CHALLENGE_PREFIX).await?;
        Ok(entries.into_iter().map(|(_, c)| c).collect())
    }

    pub async fn delete_challenges_for(&self, reader_id: &str) -> TollResult<()> {
        let entries = self.db.keys_with_prefix(keyspace::CHALLENGE_PREFIX).await?;
        for key in entries {
            if key.starts_with(&format!("{}:", reader_id)) {
                self.db.delete_data(keyspace::CHALLENGE_PREFIX, &key).await?;
            }
        }
        Ok(())
    }

    // --- peer votes ---

    fn vote_key(subject: &str, voter: &str) -> String {
        format!("{}:{}", subject, voter)
    }

    /// Record a vote. Overwrites any earlier vote from the same voter for
    /// the same subject (latest wins within the window).
    pub async fn put_vote(&self, vote: &PeerVote) -> TollResult<()> {
        self.db
            .store_data(
                keyspace::PEER_VOTE_PREFIX,
                &Self::vote_key(&vote.subject_reader_id, &vote.voter_reader_id),
                vote,
            )
            .await
    }

    pub async fn votes_for(&self, subject: &str) -> TollResult<Vec<PeerVote>> {
        let entries: Vec<(String, PeerVote)> =
            self.db.scan_prefix(keyspace::PEER_VOTE_PREFIX).await?;
        Ok(entries
            .into_iter()
            .filter(|(key, _)| key.starts_with(&format!("{}:", subject)))
            .map(|(_, v)| v)
            .collect())
    }

    pub async fn clear_votes_for(&self, subject: &str) -> TollResult<()> {
        let keys = self.db.keys_with_prefix(keyspace::PEER_VOTE_PREFIX).await?;
        for key in keys {
            if key.starts_with(&format!("{}:", subject)) {
                self.db.delete_data(keyspace::PEER_VOTE_PREFIX, &key).await?;
            }
        }
        Ok(())
    }

    // --- consensus rounds ---

    pub async fn put_consensus(&self, round: &ConsensusRound) -> TollResult<()> {
        self.db
            .store_data(keyspace::CONSENSUS_PREFIX, &round.reader_id, round)
            .await
    }

    pub async fn consensus_for(&self, reader_id: &str) -> TollResult<Option<ConsensusRound>> {
        self.db.load_data(keyspace::CONSENSUS_PREFIX, reader_id).await
    }

    pub async fn all_consensus(&self) -> TollResult<Vec<ConsensusRound>> {
        let entries: Vec<(String, ConsensusRound)> =
            self.db.scan_prefix(keyspace::CONSENSUS_PREFIX).await?;
        Ok(entries.into_iter().map(|(_, r)| r).collect())
    }

    pub async fn clear_consensus(&self, reader_id: &str) -> TollResult<()> {
        self.db
            .delete_data(keyspace::CONSENSUS_PREFIX, reader_id)
            .await
    }

    // --- suspect and whitelisted tags ---

    pub async fn mark_suspect(&self, tag: &SuspectTag) -> TollResult<()> {
        self.db
            .store_data(keyspace::SUSPECT_TAG_PREFIX, &tag.tag_hash, tag)
            .await
    }

    /// Whether a tag is currently suspect.
    pub async fn is_suspect(&self, tag_hash: &str, now: Timestamp) -> TollResult<bool> {
        let tag: Option<SuspectTag> = self
            .db
            .load_data(keyspace::SUSPECT_TAG_PREFIX, tag_hash)
            .await?;
        Ok(tag.map(|t| now <= t.expires_at).unwrap_or(false))
    }

    pub async fn sweep_suspects(&self, now: Timestamp) -> TollResult<usize> {
        let entries: Vec<(String, SuspectTag)> =
            self.db.scan_prefix(keyspace::SUSPECT_TAG_PREFIX).await?;
        let mut removed = 0;
        for (key, tag) in entries {
            if now > tag.expires_at {
                self.db
                    .delete_data(keyspace::SUSPECT_TAG_PREFIX, &key)
                    .await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub async fn whitelist_tag(&self, tag_hash: &str, now: Timestamp) -> TollResult<()> {
        self.db
            .store_data(keyspace::WHITELIST_TAG_PREFIX, tag_hash, &now.to_string())
            .await
    }

    pub async fn is_whitelisted(&self, tag_hash: &str) -> TollResult<bool> {
        self.db.exists(keyspace::WHITELIST_TAG_PREFIX, tag_hash).await
    }

    pub async fn whitelisted_tags(&self) -> TollResult<Vec<String>> {
        self.db.keys_with_prefix(keyspace::WHITELIST_TAG_PREFIX).await
    }
}
