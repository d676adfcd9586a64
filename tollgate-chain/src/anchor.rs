//! Ledger anchoring: batches chain links under a Merkle root and submits
//! them to the external ledger with retry, exponential backoff and full
//! jitter. Backpressure is bounded: a deep queue raises a warning counter
//! but never blocks or drops ingest.

use crate::chain::VdfChain;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tollgate_common::{
    crypto::MerkleTree,
    database::{StoreOps, TollDatabase},
    error::{TollError, TollResult},
    serialization::{EncodingType, TollSerialize},
    types::{keyspace, Seq, Timestamp},
};
use tollgate_policy::{LedgerKind, PolicyStore, TrustPolicy};

/// Anchor lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnchorStatus {
    Pending,
    Sent,
    Failed,
}

/// One ledger submission covering a contiguous link range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anchor {
    pub id: u64,
    pub seq_from: Seq,
    pub seq_to: Seq,
    pub root_hash: String,
    pub ledger_receipt: Option<String>,
    pub status: AnchorStatus,
    pub attempts: u32,
    pub last_attempt: Option<Timestamp>,
    pub next_attempt_at: Timestamp,
    pub created_at: Timestamp,
}

impl TollSerialize for Anchor {
    fn preferred_encoding() -> EncodingType {
        EncodingType::Bincode
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AnchorMeta {
    next_id: u64,
    last_anchored_seq: Seq,
}

impl TollSerialize for AnchorMeta {
    fn preferred_encoding() -> EncodingType {
        EncodingType::Bincode
    }
}

/// The external ledger. Submission is idempotent on `client_reference`.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Submit a payload; returns the ledger receipt.
    async fn submit(
        &self,
        client_reference: &str,
        payload: &serde_json::Value,
    ) -> TollResult<String>;

    fn name(&self) -> &'static str;
}

/// Accepts nothing; anchors stay pending until a real ledger is
/// configured.
pub struct NullLedger;

#[async_trait]
impl LedgerClient for NullLedger {
    async fn submit(&self, _reference: &str, _payload: &serde_json::Value) -> TollResult<String> {
        Err(TollError::transient("no ledger configured"))
    }

    fn name(&self) -> &'static str {
        "null"
    }
}

/// In-memory ledger for tests and staging. Idempotent per reference.
#[derive(Default)]
pub struct MockLedger {
    receipts: Mutex<HashMap<String, String>>,
    /// Fail this many submissions before succeeding (transient errors)
    fail_first: AtomicU64,
}

impl MockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_first(n: u64) -> Self {
        Self {
            receipts: Mutex::new(HashMap::new()),
            fail_first: AtomicU64::new(n),
        }
    }

    pub fn receipt_count(&self) -> usize {
        self.receipts.lock().expect("mock lock").len()
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    async fn submit(&self, reference: &str, _payload: &serde_json::Value) -> TollResult<String> {
        if self
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TollError::transient("mock ledger unavailable"));
        }

        let mut receipts = self.receipts.lock().expect("mock lock");
        let receipt = receipts
            .entry(reference.to_string())
            .or_insert_with(|| format!("mock-receipt-{}", reference))
            .clone();
        Ok(receipt)
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// HTTP ledger gateway client.
pub struct HttpLedger {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpLedger {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl LedgerClient for HttpLedger {
    async fn submit(&self, reference: &str, payload: &serde_json::Value) -> TollResult<String> {
        let mut body = payload.clone();
        body["client_reference"] = serde_json::Value::String(reference.to_string());

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| TollError::transient(format!("ledger unreachable: {}", e)))?;

        let status = response.status();
        if status.is_client_error() {
            // Schema rejection and the like will not succeed on retry
            return Err(TollError::validation(format!(
                "ledger rejected anchor: {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(TollError::transient(format!("ledger error: {}", status)));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| TollError::transient(format!("bad ledger response: {}", e)))?;

        json.get("receipt")
            .and_then(|r| r.as_str())
            .map(|r| r.to_string())
            .ok_or_else(|| TollError::transient("ledger response missing receipt"))
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Build the ledger client selected by policy.
pub fn ledger_from_policy(policy: &TrustPolicy) -> TollResult<Box<dyn LedgerClient>> {
    match policy.anchor.ledger {
        LedgerKind::Null => Ok(Box::new(NullLedger)),
        LedgerKind::Mock => Ok(Box::new(MockLedger::new())),
        LedgerKind::Real => {
            let endpoint = policy
                .anchor
                .ledger_endpoint
                .as_deref()
                .ok_or_else(|| TollError::config("ledger = real requires ledger_endpoint"))?;
            Ok(Box::new(HttpLedger::new(endpoint)))
        }
    }
}

/// The anchor queue and its single background worker.
pub struct AnchorQueue {
    db: Arc<TollDatabase>,
    ledger: Box<dyn LedgerClient>,
    policy: Arc<PolicyStore>,
    backpressure_warnings: AtomicU64,
    meta: tokio::sync::Mutex<AnchorMeta>,
}

impl AnchorQueue {
    pub async fn open(
        db: Arc<TollDatabase>,
        ledger: Box<dyn LedgerClient>,
        policy: Arc<PolicyStore>,
    ) -> TollResult<Self> {
        let meta: AnchorMeta = db
            .load_data(keyspace::ANCHOR_META_KEY, "current")
            .await?
            .unwrap_or(AnchorMeta {
                next_id: 0,
                last_anchored_seq: 0,
            });

        Ok(Self {
            db,
            ledger,
            policy,
            backpressure_warnings: AtomicU64::new(0),
            meta: tokio::sync::Mutex::new(meta),
        })
    }

    /// Times the queue depth exceeded the policy bound (telemetry).
    pub fn backpressure_warnings(&self) -> u64 {
        self.backpressure_warnings.load(Ordering::Relaxed)
    }

    async fn store_anchor(&self, anchor: &Anchor) -> TollResult<()> {
        self.db
            .store_data(
                keyspace::ANCHOR_PREFIX,
                &TollDatabase::seq_key(anchor.id),
                anchor,
            )
            .await
    }

    pub async fn anchor(&self, id: u64) -> TollResult<Option<Anchor>> {
        self.db
            .load_data(keyspace::ANCHOR_PREFIX, &TollDatabase::seq_key(id))
            .await
    }

    pub async fn all(&self) -> TollResult<Vec<Anchor>> {
        Ok(self
            .db
            .scan_prefix::<Anchor>(keyspace::ANCHOR_PREFIX)
            .await?
            .into_iter()
            .map(|(_, anchor)| anchor)
            .collect())
    }

    /// Anchors not yet acknowledged by the ledger (admin surface).
    pub async fn unacknowledged(&self) -> TollResult<Vec<Anchor>> {
        Ok(self
            .all()
            .await?
            .into_iter()
            .filter(|a| a.status != AnchorStatus::Sent)
            .collect())
    }

    /// Re-queue a failed anchor for immediate retry.
    pub async fn retry(&self, id: u64, now: Timestamp) -> TollResult<Anchor> {
        let mut anchor = self
            .anchor(id)
            .await?
            .ok_or_else(|| TollError::validation(format!("unknown anchor {}", id)))?;

        anchor.status = AnchorStatus::Pending;
        anchor.next_attempt_at = now;
        self.store_anchor(&anchor).await?;
        Ok(anchor)
    }

    /// Accumulate links into anchors: a full batch, or any partial batch
    /// older than the policy's max delay.
    pub async fn batch_tick(&self, chain: &VdfChain, now: Timestamp) -> TollResult<usize> {
        let policy = self.policy.current();
        let mut meta = self.meta.lock().await;
        let head = chain.head_seq().await;

        let mut created = 0usize;
        while meta.last_anchored_seq < head {
            let seq_from = meta.last_anchored_seq + 1;
            let available = head - meta.last_anchored_seq;

            let take = if available >= policy.anchor.batch_size as u64 {
                policy.anchor.batch_size as u64
            } else {
                // Partial batch: only when the oldest pending link has
                // waited past max_delay
                let oldest = chain
                    .link(seq_from)
                    .await?
                    .ok_or_else(|| TollError::chain(format!("missing link {}", seq_from)))?;
                if now.saturating_sub(oldest.computed_at) < policy.anchor.max_delay {
                    break;
                }
                available
            };

            let seq_to = seq_from + take - 1;
            let mut pairs = Vec::with_capacity(take as usize);
            for seq in seq_from..=seq_to {
                let link = chain
                    .link(seq)
                    .await?
                    .ok_or_else(|| TollError::chain(format!("missing link {}", seq)))?;
                pairs.push((link.seq, link.vdf_output));
            }

            let root = MerkleTree::from_links(&pairs).root();
            let anchor = Anchor {
                id: meta.next_id,
                seq_from,
                seq_to,
                root_hash: hex::encode(root),
                ledger_receipt: None,
                status: AnchorStatus::Pending,
                attempts: 0,
                last_attempt: None,
                next_attempt_at: now,
                created_at: now,
            };
            self.store_anchor(&anchor).await?;

            meta.next_id += 1;
            meta.last_anchored_seq = seq_to;
            created += 1;
            tracing::info!(
                id = anchor.id,
                seq_from,
                seq_to,
                root = %anchor.root_hash,
                "anchor batch enqueued"
            );
        }

        self.db
            .store_data(keyspace::ANCHOR_META_KEY, "current", &*meta)
            .await?;
        drop(meta);

        let pending = self.unacknowledged().await?.len();
        if pending > policy.anchor.queue_max {
            self.backpressure_warnings.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                pending,
                max = policy.anchor.queue_max,
                "anchor queue depth above bound; ingest continues"
            );
        }

        Ok(created)
    }

    fn backoff_delay(policy: &TrustPolicy, attempts: u32) -> Duration {
        use rand::Rng;
        let exp = policy
            .anchor
            .backoff_base_ms
            .saturating_mul(1u64 << attempts.min(16))
            .min(policy.anchor.backoff_cap_ms);
        // Full jitter over [0, exp]
        Duration::from_millis(rand::thread_rng().gen_range(0..=exp))
    }

    /// Submit due pending anchors once. Returns how many reached the
    /// ledger.
    pub async fn drain(&self, now: Timestamp) -> TollResult<usize> {
        let policy = self.policy.current();
        let deadline = Duration::from_millis(policy.deadlines.ledger_deadline_ms);
        let mut sent = 0usize;

        for mut anchor in self.all().await? {
            if anchor.status != AnchorStatus::Pending || anchor.next_attempt_at > now {
                continue;
            }

            let payload = serde_json::json!({
                "root_hash": anchor.root_hash,
                "seq_from": anchor.seq_from,
                "seq_to": anchor.seq_to,
            });

            anchor.attempts += 1;
            anchor.last_attempt = Some(now);

            let result =
                tokio::time::timeout(deadline, self.ledger.submit(&anchor.root_hash, &payload))
                    .await
                    .unwrap_or_else(|_| Err(TollError::deadline("ledger submit timed out")));

            match result {
                Ok(receipt) => {
                    anchor.status = AnchorStatus::Sent;
                    anchor.ledger_receipt = Some(receipt);
                    sent += 1;
                    tracing::info!(id = anchor.id, "anchor acknowledged by ledger");
                }
                Err(err) if err.is_transient() => {
                    let delay = Self::backoff_delay(&policy, anchor.attempts);
                    anchor.next_attempt_at = now + delay.as_secs().max(1);
                    tracing::debug!(
                        id = anchor.id,
                        attempts = anchor.attempts,
                        retry_in = delay.as_secs().max(1),
                        %err,
                        "anchor submit deferred"
                    );
                }
                Err(err) => {
                    anchor.status = AnchorStatus::Failed;
                    tracing::error!(id = anchor.id, %err, "anchor permanently failed");
                }
            }

            self.store_anchor(&anchor).await?;
        }

        Ok(sent)
    }

    /// The single background worker: batch then drain, until shutdown.
    pub async fn run(
        self: Arc<Self>,
        chain: Arc<VdfChain>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
        clock: impl Fn() -> Timestamp + Send + 'static,
    ) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let now = clock();
                    if let Err(err) = self.batch_tick(&chain, now).await {
                        tracing::error!(%err, "anchor batching failed");
                    }
                    if let Err(err) = self.drain(now).await {
                        tracing::error!(%err, "anchor drain failed");
                    }
                }
            }
        }
        tracing::debug!("anchor worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn setup(
        ledger: Box<dyn LedgerClient>,
        policy: TrustPolicy,
    ) -> (tempfile::TempDir, Arc<VdfChain>, AnchorQueue) {
        let dir = tempdir().unwrap();
        let db = Arc::new(TollDatabase::new(dir.path().join("db").to_str().unwrap()).unwrap());
        let chain = Arc::new(VdfChain::open(db.clone(), "seed").await.unwrap());
        let queue = AnchorQueue::open(db, ledger, Arc::new(PolicyStore::new(policy)))
            .await
            .unwrap();
        (dir, chain, queue)
    }

    async fn append_n(chain: &VdfChain, n: u64, base: Timestamp) {
        for i in 1..=n {
            chain
                .append(&format!("e{}", i), "r1", base + i, 8, 4, base + i)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_full_batch_is_anchored() {
        let mut policy = TrustPolicy::default();
        policy.anchor.batch_size = 4;
        let (_dir, chain, queue) = setup(Box::new(MockLedger::new()), policy).await;
        let now = 1_700_000_000;

        append_n(&chain, 4, now).await;
        let created = queue.batch_tick(&chain, now).await.unwrap();
        assert_eq!(created, 1);

        let anchors = queue.all().await.unwrap();
        assert_eq!(anchors.len(), 1);
        assert_eq!(anchors[0].seq_from, 1);
        assert_eq!(anchors[0].seq_to, 4);
        assert_eq!(anchors[0].status, AnchorStatus::Pending);

        let sent = queue.drain(now).await.unwrap();
        assert_eq!(sent, 1);
        let anchor = queue.anchor(0).await.unwrap().unwrap();
        assert_eq!(anchor.status, AnchorStatus::Sent);
        assert!(anchor.ledger_receipt.is_some());
    }

    #[tokio::test]
    async fn test_partial_batch_waits_for_max_delay() {
        let mut policy = TrustPolicy::default();
        policy.anchor.batch_size = 16;
        policy.anchor.max_delay = 30;
        let (_dir, chain, queue) = setup(Box::new(MockLedger::new()), policy).await;
        let now = 1_700_000_000;

        append_n(&chain, 3, now).await;

        // Too fresh: nothing batched
        assert_eq!(queue.batch_tick(&chain, now + 5).await.unwrap(), 0);

        // Past max_delay the partial batch flushes
        assert_eq!(queue.batch_tick(&chain, now + 60).await.unwrap(), 1);
        let anchor = queue.anchor(0).await.unwrap().unwrap();
        assert_eq!(anchor.seq_from, 1);
        assert_eq!(anchor.seq_to, 3);
    }

    #[tokio::test]
    async fn test_transient_failure_backs_off_then_succeeds() {
        let mut policy = TrustPolicy::default();
        policy.anchor.batch_size = 2;
        policy.anchor.backoff_base_ms = 1000;
        let (_dir, chain, queue) = setup(Box::new(MockLedger::failing_first(2)), policy).await;
        let now = 1_700_000_000;

        append_n(&chain, 2, now).await;
        queue.batch_tick(&chain, now).await.unwrap();

        // First two submissions fail transiently and stay pending
        assert_eq!(queue.drain(now).await.unwrap(), 0);
        let anchor = queue.anchor(0).await.unwrap().unwrap();
        assert_eq!(anchor.status, AnchorStatus::Pending);
        assert_eq!(anchor.attempts, 1);
        assert!(anchor.next_attempt_at > now);

        // Far enough in the future the retry lands
        assert_eq!(queue.drain(now + 1000).await.unwrap(), 0);
        assert_eq!(queue.drain(now + 10_000).await.unwrap(), 1);
        let anchor = queue.anchor(0).await.unwrap().unwrap();
        assert_eq!(anchor.status, AnchorStatus::Sent);
    }

    #[tokio::test]
    async fn test_null_ledger_keeps_anchors_pending() {
        let mut policy = TrustPolicy::default();
        policy.anchor.batch_size = 1;
        let (_dir, chain, queue) = setup(Box::new(NullLedger), policy).await;
        let now = 1_700_000_000;

        append_n(&chain, 1, now).await;
        queue.batch_tick(&chain, now).await.unwrap();
        queue.drain(now).await.unwrap();

        let anchor = queue.anchor(0).await.unwrap().unwrap();
        assert_eq!(anchor.status, AnchorStatus::Pending);
        assert_eq!(queue.unacknowledged().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_idempotent_retry_same_reference() {
        let mut policy = TrustPolicy::default();
        policy.anchor.batch_size = 1;
        let ledger = Box::new(MockLedger::new());
        let (_dir, chain, queue) = setup(ledger, policy).await;
        let now = 1_700_000_000;

        append_n(&chain, 1, now).await;
        queue.batch_tick(&chain, now).await.unwrap();
        queue.drain(now).await.unwrap();

        let first = queue.anchor(0).await.unwrap().unwrap();

        // Force a retry of an already-sent anchor: same reference, same
        // receipt on the ledger side
        queue.retry(0, now + 10).await.unwrap();
        queue.drain(now + 10).await.unwrap();

        let second = queue.anchor(0).await.unwrap().unwrap();
        assert_eq!(first.ledger_receipt, second.ledger_receipt);
    }

    #[tokio::test]
    async fn test_backpressure_warning_counter() {
        let mut policy = TrustPolicy::default();
        policy.anchor.batch_size = 1;
        policy.anchor.queue_max = 1;
        let (_dir, chain, queue) = setup(Box::new(NullLedger), policy).await;
        let now = 1_700_000_000;

        append_n(&chain, 3, now).await;
        queue.batch_tick(&chain, now).await.unwrap();

        // Three pending anchors against a bound of one
        assert!(queue.backpressure_warnings() > 0);
    }

    #[tokio::test]
    async fn test_meta_survives_reopen() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("db");
        let now = 1_700_000_000;
        let mut policy = TrustPolicy::default();
        policy.anchor.batch_size = 2;

        {
            let db = Arc::new(TollDatabase::new(db_path.to_str().unwrap()).unwrap());
            let chain = Arc::new(VdfChain::open(db.clone(), "seed").await.unwrap());
            let queue = AnchorQueue::open(
                db,
                Box::new(MockLedger::new()),
                Arc::new(PolicyStore::new(policy.clone())),
            )
            .await
            .unwrap();
            append_n(&chain, 2, now).await;
            queue.batch_tick(&chain, now).await.unwrap();
        }

        let db = Arc::new(TollDatabase::new(db_path.to_str().unwrap()).unwrap());
        let chain = Arc::new(VdfChain::open(db.clone(), "seed").await.unwrap());
        let queue = AnchorQueue::open(
            db,
            Box::new(MockLedger::new()),
            Arc::new(PolicyStore::new(policy)),
        )
        .await
        .unwrap();

        // Already-anchored links are not re-batched
        assert_eq!(queue.batch_tick(&chain, now + 100).await.unwrap(), 0);
    }
}
