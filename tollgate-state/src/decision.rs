//! Append-only decision log

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tollgate_common::{
    database::{StoreOps, TollDatabase},
    error::TollResult,
    serialization::{EncodingType, TollSerialize},
    types::{keyspace, EventId, ReaderId, Seq, TagHash, Timestamp},
};

/// Final outcome of a fraud decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Block,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::Block => "block",
        }
    }
}

/// One persisted decision, with the ML scores and trust snapshot that
/// produced it. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub event_id: EventId,
    pub reader_id: ReaderId,
    pub tag_hash: TagHash,
    pub timestamp: Timestamp,
    pub ml_a: Option<f64>,
    pub ml_b: Option<f64>,
    pub iso_flag: bool,
    pub rule_flags: Vec<String>,
    pub trust_snapshot: f64,
    pub decision: Decision,
    pub reason_codes: Vec<String>,
    pub amount: u64,
}

impl TollSerialize for DecisionRecord {
    fn preferred_encoding() -> EncodingType {
        EncodingType::Bincode
    }
}

/// Sequence-keyed decision log with an event-id index.
pub struct DecisionStore {
    db: Arc<TollDatabase>,
    next_seq: AtomicU64,
}

impl DecisionStore {
    /// Open the store, recovering the next sequence from the last key.
    pub async fn open(db: Arc<TollDatabase>) -> TollResult<Self> {
        let keys = db.keys_with_prefix(keyspace::DECISION_PREFIX).await?;
        let next_seq = keys
            .last()
            .and_then(|k| u64::from_str_radix(k, 16).ok())
            .map(|seq| seq + 1)
            .unwrap_or(0);

        Ok(Self {
            db,
            next_seq: AtomicU64::new(next_seq),
        })
    }

    /// Append a record, returning its log sequence.
    pub async fn append(&self, record: &DecisionRecord) -> TollResult<Seq> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.db
            .store_data(keyspace::DECISION_PREFIX, &TollDatabase::seq_key(seq), record)
            .await?;
        self.db
            .store_data(
                keyspace::DECISION_EVENT_PREFIX,
                &record.event_id,
                &seq.to_string(),
            )
            .await?;
        Ok(seq)
    }

    /// Look up a decision by event id.
    pub async fn by_event(&self, event_id: &str) -> TollResult<Option<DecisionRecord>> {
        let seq: Option<String> = self
            .db
            .load_data(keyspace::DECISION_EVENT_PREFIX, event_id)
            .await?;

        match seq {
            Some(seq) => {
                let seq: u64 = seq
                    .parse()
                    .map_err(|_| tollgate_common::error::TollError::state("bad decision index"))?;
                self.db
                    .load_data(keyspace::DECISION_PREFIX, &TollDatabase::seq_key(seq))
                    .await
            }
            None => Ok(None),
        }
    }

    /// All decisions in log order.
    pub async fn all(&self) -> TollResult<Vec<DecisionRecord>> {
        Ok(self
            .db
            .scan_prefix::<DecisionRecord>(keyspace::DECISION_PREFIX)
            .await?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }

    /// The most recent `limit` decisions, newest first.
    pub async fn recent(&self, limit: usize) -> TollResult<Vec<DecisionRecord>> {
        let mut records = self.all().await?;
        records.reverse();
        records.truncate(limit);
        Ok(records)
    }

    /// Total decisions logged (telemetry).
    pub fn len(&self) -> u64 {
        self.next_seq.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(event_id: &str, reader: &str) -> DecisionRecord {
        DecisionRecord {
            event_id: event_id.to_string(),
            reader_id: reader.to_string(),
            tag_hash: "cd".repeat(32),
            timestamp: 1_700_000_000,
            ml_a: Some(0.1),
            ml_b: None,
            iso_flag: false,
            rule_flags: vec![],
            trust_snapshot: 100.0,
            decision: Decision::Allow,
            reason_codes: vec![],
            amount: 50,
        }
    }

    #[tokio::test]
    async fn test_append_assigns_sequences() {
        let dir = tempdir().unwrap();
        let db = Arc::new(TollDatabase::new(dir.path().join("db").to_str().unwrap()).unwrap());
        let store = DecisionStore::open(db).await.unwrap();

        assert_eq!(store.append(&record("e1", "r1")).await.unwrap(), 0);
        assert_eq!(store.append(&record("e2", "r1")).await.unwrap(), 1);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_event_index() {
        let dir = tempdir().unwrap();
        let db = Arc::new(TollDatabase::new(dir.path().join("db").to_str().unwrap()).unwrap());
        let store = DecisionStore::open(db).await.unwrap();

        store.append(&record("e1", "r1")).await.unwrap();
        store.append(&record("e2", "r2")).await.unwrap();

        let found = store.by_event("e2").await.unwrap().unwrap();
        assert_eq!(found.reader_id, "r2");
        assert!(store.by_event("e9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_seq_recovery_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let db = Arc::new(TollDatabase::new(path.to_str().unwrap()).unwrap());
            let store = DecisionStore::open(db).await.unwrap();
            store.append(&record("e1", "r1")).await.unwrap();
            store.append(&record("e2", "r1")).await.unwrap();
        }

        let db = Arc::new(TollDatabase::new(path.to_str().unwrap()).unwrap());
        let store = DecisionStore::open(db).await.unwrap();
        assert_eq!(store.append(&record("e3", "r1")).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_recent_orders_newest_first() {
        let dir = tempdir().unwrap();
        let db = Arc::new(TollDatabase::new(dir.path().join("db").to_str().unwrap()).unwrap());
        let store = DecisionStore::open(db).await.unwrap();

        for i in 0..5 {
            store.append(&record(&format!("e{}", i), "r1")).await.unwrap();
        }

        let recent = store.recent(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].event_id, "e4");
        assert_eq!(recent[1].event_id, "e3");
    }
}
