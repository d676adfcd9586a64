//! Nonce ledger: replay protection with bounded retention

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tollgate_common::{
    database::{StoreOps, TollDatabase},
    error::TollResult,
    serialization::{EncodingType, TollSerialize},
    types::{keyspace, Timestamp},
};

/// One observed `(reader_id, nonce)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonceRecord {
    pub observed_at: Timestamp,
}

impl TollSerialize for NonceRecord {
    fn preferred_encoding() -> EncodingType {
        EncodingType::Bincode
    }
}

/// Set of observed nonces keyed `{reader_id}:{nonce}`.
///
/// Uniqueness is enforced by the callers holding the per-reader lock
/// across `seen` + `record`; the ledger itself only provides the O(1)
/// point lookup and the retention sweep.
#[derive(Clone)]
pub struct NonceLedger {
    db: Arc<TollDatabase>,
}

impl NonceLedger {
    pub fn new(db: Arc<TollDatabase>) -> Self {
        Self { db }
    }

    fn key(reader_id: &str, nonce: &str) -> String {
        format!("{}:{}", reader_id, nonce)
    }

    /// O(1) duplicate test.
    pub async fn seen(&self, reader_id: &str, nonce: &str) -> TollResult<bool> {
        self.db
            .exists(keyspace::NONCE_PREFIX, &Self::key(reader_id, nonce))
            .await
    }

    /// Record an accepted nonce. Committed only on full acceptance of the
    /// surrounding event.
    pub async fn record(&self, reader_id: &str, nonce: &str, now: Timestamp) -> TollResult<()> {
        self.db
            .store_data(
                keyspace::NONCE_PREFIX,
                &Self::key(reader_id, nonce),
                &NonceRecord { observed_at: now },
            )
            .await
    }

    /// Delete records observed before the cutoff; returns how many were
    /// collected.
    pub async fn clear_before(&self, cutoff: Timestamp) -> TollResult<usize> {
        let entries: Vec<(String, NonceRecord)> =
            self.db.scan_prefix(keyspace::NONCE_PREFIX).await?;

        let mut removed = 0;
        for (key, record) in entries {
            if record.observed_at < cutoff {
                self.db.delete_data(keyspace::NONCE_PREFIX, &key).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Retention sweep: collect records older than `retention` seconds.
    pub async fn gc(&self, now: Timestamp, retention: u64) -> TollResult<usize> {
        self.clear_before(now.saturating_sub(retention)).await
    }

    /// Total records currently held (telemetry).
    pub async fn len(&self) -> TollResult<usize> {
        Ok(self
            .db
            .keys_with_prefix(keyspace::NONCE_PREFIX)
            .await?
            .len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ledger() -> (tempfile::TempDir, NonceLedger) {
        let dir = tempdir().unwrap();
        let db = Arc::new(TollDatabase::new(dir.path().join("db").to_str().unwrap()).unwrap());
        (dir, NonceLedger::new(db))
    }

    #[tokio::test]
    async fn test_seen_after_record() {
        let (_dir, ledger) = ledger();

        assert!(!ledger.seen("r1", "n1").await.unwrap());
        ledger.record("r1", "n1", 1_700_000_000).await.unwrap();
        assert!(ledger.seen("r1", "n1").await.unwrap());

        // Same nonce under a different reader is distinct
        assert!(!ledger.seen("r2", "n1").await.unwrap());
    }

    #[tokio::test]
    async fn test_gc_respects_retention() {
        let (_dir, ledger) = ledger();
        let now = 1_700_000_000;

        ledger.record("r1", "old", now - 700).await.unwrap();
        ledger.record("r1", "fresh", now - 10).await.unwrap();

        // Retention of 600s (2 x 300s drift) collects only the old record
        let removed = ledger.gc(now, 600).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!ledger.seen("r1", "old").await.unwrap());
        assert!(ledger.seen("r1", "fresh").await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_before() {
        let (_dir, ledger) = ledger();

        for (nonce, at) in [("a", 100u64), ("b", 200), ("c", 300)] {
            ledger.record("r1", nonce, at).await.unwrap();
        }

        let removed = ledger.clear_before(250).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(ledger.len().await.unwrap(), 1);
    }
}
