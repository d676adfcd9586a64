//! Reader registry: per-device secrets, key versions, trust state

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tollgate_common::{
    crypto::CryptoUtils,
    database::{StoreOps, TollDatabase},
    error::TollResult,
    serialization::{EncodingType, TollSerialize},
    types::{keyspace, ReaderId, Timestamp},
};

/// Enforcement status of a reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReaderStatus {
    Active,
    Degraded,
    Suspended,
    Quarantined,
    Probation,
}

impl ReaderStatus {
    /// Stable wire identifier.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReaderStatus::Active => "ACTIVE",
            ReaderStatus::Degraded => "DEGRADED",
            ReaderStatus::Suspended => "SUSPENDED",
            ReaderStatus::Quarantined => "QUARANTINED",
            ReaderStatus::Probation => "PROBATION",
        }
    }

    /// Suspended and quarantined readers are refused at ingest.
    pub fn is_serving(&self) -> bool {
        !matches!(self, ReaderStatus::Suspended | ReaderStatus::Quarantined)
    }
}

/// Violation and success counters tracked per reader.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReaderCounters {
    pub auth_failures: u64,
    pub replay_attempts: u64,
    pub consecutive_successes: u32,
    pub drift_failures: u32,
    pub total_accepted: u64,
}

/// One registered RFID reader.
///
/// Created by admin registration, mutated only by the trust engine and
/// admin rotation; never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reader {
    pub reader_id: ReaderId,
    pub secret: Vec<u8>,
    pub key_version: u32,
    pub trust_score: f64,
    pub status: ReaderStatus,
    pub last_violation_at: Option<Timestamp>,
    pub last_update_at: Timestamp,
    pub registered_at: Timestamp,
    pub counters: ReaderCounters,
}

impl Reader {
    /// A freshly registered reader: version 1, full trust, active.
    pub fn register(reader_id: ReaderId, now: Timestamp) -> Self {
        Self {
            reader_id,
            secret: CryptoUtils::generate_secret(),
            key_version: 1,
            trust_score: 100.0,
            status: ReaderStatus::Active,
            last_violation_at: None,
            last_update_at: now,
            registered_at: now,
            counters: ReaderCounters::default(),
        }
    }

    /// Replace the secret and bump the key version, invalidating all
    /// signatures made under earlier versions.
    pub fn rotate_secret(&mut self) -> u32 {
        self.secret = CryptoUtils::generate_secret();
        self.key_version += 1;
        self.key_version
    }

    /// Trust score rounded for wire representation.
    pub fn score_rounded(&self) -> i64 {
        self.trust_score.round() as i64
    }
}

impl TollSerialize for Reader {
    fn preferred_encoding() -> EncodingType {
        EncodingType::Bincode
    }
}

/// Typed store over the reader registry table.
#[derive(Clone)]
pub struct ReaderStore {
    db: Arc<TollDatabase>,
}

impl ReaderStore {
    pub fn new(db: Arc<TollDatabase>) -> Self {
        Self { db }
    }

    pub async fn get(&self, reader_id: &str) -> TollResult<Option<Reader>> {
        self.db.load_data(keyspace::READER_PREFIX, reader_id).await
    }

    pub async fn put(&self, reader: &Reader) -> TollResult<()> {
        self.db
            .store_data(keyspace::READER_PREFIX, &reader.reader_id, reader)
            .await
    }

    pub async fn exists(&self, reader_id: &str) -> TollResult<bool> {
        self.db.exists(keyspace::READER_PREFIX, reader_id).await
    }

    pub async fn list(&self) -> TollResult<Vec<Reader>> {
        Ok(self
            .db
            .scan_prefix::<Reader>(keyspace::READER_PREFIX)
            .await?
            .into_iter()
            .map(|(_, reader)| reader)
            .collect())
    }

    /// Readers currently eligible to vote in peer consensus.
    pub async fn active_peers(&self, exclude: &str) -> TollResult<Vec<Reader>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|r| r.status == ReaderStatus::Active && r.reader_id != exclude)
            .collect())
    }
}
