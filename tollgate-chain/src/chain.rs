//! The tamper-evident VDF chain.
//!
//! Every accepted event becomes one link: `vdf_input = SHA256(prev_output
//! || event_id || reader_id || timestamp_le)` and `vdf_output =
//! VDF(vdf_input, difficulty)`. Appends are strictly serialized on the
//! head mutex; ingest never computes a VDF inline but hands work to the
//! bounded [`VdfAppender`] pool, with a reconciliation pass guaranteeing
//! exactly one link per decision.

use crate::vdf;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tollgate_common::{
    crypto::CryptoUtils,
    database::{StoreOps, TollDatabase},
    error::{TollError, TollResult},
    serialization::{EncodingType, TollSerialize},
    types::{keyspace, EventId, Hash, ReaderId, Seq, Timestamp},
};
use tollgate_policy::PolicyStore;
use tollgate_state::DecisionRecord;

/// One chain link. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VdfLink {
    pub seq: Seq,
    pub event_id: EventId,
    pub reader_id: ReaderId,
    pub timestamp: Timestamp,
    pub prev_output: Hash,
    pub vdf_input: Hash,
    pub vdf_output: Hash,
    pub proof_checkpoints: Vec<Hash>,
    pub difficulty: u64,
    pub checkpoint_granularity: u64,
    pub computed_at: Timestamp,
}

impl TollSerialize for VdfLink {
    fn preferred_encoding() -> EncodingType {
        EncodingType::Bincode
    }
}

/// Persistent chain metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChainMeta {
    head_seq: Seq,
    genesis_seed: String,
}

impl TollSerialize for ChainMeta {
    fn preferred_encoding() -> EncodingType {
        EncodingType::Bincode
    }
}

/// Tamper classes reported by chain verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TamperClass {
    VdfMismatch,
    PrevPointerBroken,
    Inserted,
    Deleted,
    Reordered,
}

impl TamperClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            TamperClass::VdfMismatch => "VDF_MISMATCH",
            TamperClass::PrevPointerBroken => "PREV_POINTER_BROKEN",
            TamperClass::Inserted => "INSERTED",
            TamperClass::Deleted => "DELETED",
            TamperClass::Reordered => "REORDERED",
        }
    }
}

/// Verification verdict: the first broken link, if any.
#[derive(Debug, Clone, Serialize)]
pub struct ChainVerdict {
    pub valid: bool,
    pub first_broken_seq: Option<Seq>,
    pub class: Option<TamperClass>,
    pub checked_links: u64,
}

impl ChainVerdict {
    fn ok(checked: u64) -> Self {
        Self {
            valid: true,
            first_broken_seq: None,
            class: None,
            checked_links: checked,
        }
    }

    fn broken(seq: Option<Seq>, class: TamperClass, checked: u64) -> Self {
        Self {
            valid: false,
            first_broken_seq: seq,
            class: Some(class),
            checked_links: checked,
        }
    }
}

struct ChainHead {
    seq: Seq,
    output: Hash,
}

/// The chain itself: genesis handling, serialized appends, verification
/// and the reconciliation scan.
pub struct VdfChain {
    db: Arc<TollDatabase>,
    head: Mutex<ChainHead>,
}

impl VdfChain {
    /// Open the chain, creating the genesis link when the store is empty.
    ///
    /// A stored genesis seed differing from the configured one is a fatal
    /// startup condition.
    pub async fn open(db: Arc<TollDatabase>, genesis_seed: &str) -> TollResult<Self> {
        let meta: Option<ChainMeta> = db
            .load_data(keyspace::CHAIN_META_KEY, "current")
            .await?;

        let head = match meta {
            Some(meta) => {
                if meta.genesis_seed != genesis_seed {
                    return Err(TollError::fatal(format!(
                        "genesis seed mismatch: chain was seeded with {:?}",
                        meta.genesis_seed
                    )));
                }
                let link: VdfLink = db
                    .load_data(keyspace::VDF_LINK_PREFIX, &TollDatabase::seq_key(meta.head_seq))
                    .await?
                    .ok_or_else(|| TollError::fatal("chain head link missing"))?;
                ChainHead {
                    seq: link.seq,
                    output: link.vdf_output,
                }
            }
            None => {
                let genesis_output = CryptoUtils::hash(genesis_seed.as_bytes());
                let genesis = VdfLink {
                    seq: 0,
                    event_id: "genesis".to_string(),
                    reader_id: String::new(),
                    timestamp: 0,
                    prev_output: genesis_output,
                    vdf_input: [0u8; 32],
                    vdf_output: genesis_output,
                    proof_checkpoints: Vec::new(),
                    difficulty: 0,
                    checkpoint_granularity: 0,
                    computed_at: 0,
                };
                db.store_data(keyspace::VDF_LINK_PREFIX, &TollDatabase::seq_key(0), &genesis)
                    .await?;
                db.store_data(
                    keyspace::CHAIN_META_KEY,
                    "current",
                    &ChainMeta {
                        head_seq: 0,
                        genesis_seed: genesis_seed.to_string(),
                    },
                )
                .await?;
                tracing::info!(seed = genesis_seed, "chain genesis created");
                ChainHead {
                    seq: 0,
                    output: genesis_output,
                }
            }
        };

        Ok(Self {
            db,
            head: Mutex::new(head),
        })
    }

    /// Derive a link input from the previous output and event fields.
    pub fn link_input(
        prev_output: &Hash,
        event_id: &str,
        reader_id: &str,
        timestamp: Timestamp,
    ) -> Hash {
        CryptoUtils::hash_multiple(&[
            prev_output,
            event_id.as_bytes(),
            reader_id.as_bytes(),
            &timestamp.to_le_bytes(),
        ])
    }

    /// Append one link. Strictly serialized on the head mutex; the VDF
    /// itself runs on a blocking thread.
    ///
    /// Idempotent per event: a second append for an already-linked event
    /// returns the existing link, so the reconciliation sweep and the
    /// ingest-path enqueue can race without duplicating links.
    pub async fn append(
        &self,
        event_id: &str,
        reader_id: &str,
        timestamp: Timestamp,
        difficulty: u64,
        granularity: u64,
        now: Timestamp,
    ) -> TollResult<VdfLink> {
        let mut head = self.head.lock().await;

        if let Some(seq) = self
            .db
            .load_data::<String>(keyspace::VDF_LINK_EVENT_PREFIX, event_id)
            .await?
        {
            let seq: Seq = seq
                .parse()
                .map_err(|_| TollError::chain("corrupt link event index"))?;
            return self
                .link(seq)
                .await?
                .ok_or_else(|| TollError::chain(format!("indexed link {} missing", seq)));
        }

        let vdf_input = Self::link_input(&head.output, event_id, reader_id, timestamp);
        let proof = tokio::task::spawn_blocking(move || vdf::compute(&vdf_input, difficulty, granularity))
            .await
            .map_err(|e| TollError::internal(format!("vdf worker panicked: {}", e)))?;

        let link = VdfLink {
            seq: head.seq + 1,
            event_id: event_id.to_string(),
            reader_id: reader_id.to_string(),
            timestamp,
            prev_output: head.output,
            vdf_input,
            vdf_output: proof.output,
            proof_checkpoints: proof.checkpoints,
            difficulty,
            checkpoint_granularity: granularity,
            computed_at: now,
        };

        self.db
            .store_data(
                keyspace::VDF_LINK_PREFIX,
                &TollDatabase::seq_key(link.seq),
                &link,
            )
            .await?;
        self.db
            .store_data(
                keyspace::VDF_LINK_EVENT_PREFIX,
                event_id,
                &link.seq.to_string(),
            )
            .await?;

        let mut meta: ChainMeta = self
            .db
            .load_data(keyspace::CHAIN_META_KEY, "current")
            .await?
            .ok_or_else(|| TollError::fatal("chain meta missing"))?;
        meta.head_seq = link.seq;
        self.db
            .store_data(keyspace::CHAIN_META_KEY, "current", &meta)
            .await?;

        head.seq = link.seq;
        head.output = link.vdf_output;

        tracing::debug!(seq = link.seq, event_id, "chain link appended");
        Ok(link)
    }

    /// Current head sequence.
    pub async fn head_seq(&self) -> Seq {
        self.head.lock().await.seq
    }

    /// Load one link.
    pub async fn link(&self, seq: Seq) -> TollResult<Option<VdfLink>> {
        self.db
            .load_data(keyspace::VDF_LINK_PREFIX, &TollDatabase::seq_key(seq))
            .await
    }

    /// All links in sequence order (genesis included).
    pub async fn links(&self) -> TollResult<Vec<VdfLink>> {
        Ok(self
            .db
            .scan_prefix::<VdfLink>(keyspace::VDF_LINK_PREFIX)
            .await?
            .into_iter()
            .map(|(_, link)| link)
            .collect())
    }

    /// Verify the chain against the decision log, reporting the first
    /// broken link and its tamper class. `up_to` bounds the scan for
    /// partial verification.
    pub async fn verify(
        &self,
        decisions: &[DecisionRecord],
        reorder_tolerance: u64,
        up_to: Option<Seq>,
    ) -> TollResult<ChainVerdict> {
        let links = self.links().await?;
        let Some(genesis) = links.first() else {
            return Err(TollError::fatal("chain has no genesis"));
        };
        if genesis.seq != 0 {
            return Err(TollError::fatal("chain genesis missing"));
        }

        let decision_ids: std::collections::HashSet<&str> =
            decisions.iter().map(|d| d.event_id.as_str()).collect();

        let mut prev_output = genesis.vdf_output;
        let mut prev_ts: Option<Timestamp> = None;
        let mut checked = 0u64;
        let mut linked_ids = std::collections::HashSet::new();

        for link in links.iter().skip(1) {
            if let Some(limit) = up_to {
                if link.seq > limit {
                    break;
                }
            }
            checked += 1;

            if link.prev_output != prev_output {
                return Ok(ChainVerdict::broken(
                    Some(link.seq),
                    TamperClass::PrevPointerBroken,
                    checked,
                ));
            }

            let expected_input =
                Self::link_input(&prev_output, &link.event_id, &link.reader_id, link.timestamp);
            if expected_input != link.vdf_input
                || !vdf::verify(
                    &link.vdf_input,
                    link.difficulty,
                    link.checkpoint_granularity,
                    &link.vdf_output,
                    &link.proof_checkpoints,
                )
            {
                return Ok(ChainVerdict::broken(
                    Some(link.seq),
                    TamperClass::VdfMismatch,
                    checked,
                ));
            }

            if let Some(prev) = prev_ts {
                if link.timestamp + reorder_tolerance < prev {
                    return Ok(ChainVerdict::broken(
                        Some(link.seq),
                        TamperClass::Reordered,
                        checked,
                    ));
                }
            }

            if !decision_ids.contains(link.event_id.as_str()) {
                return Ok(ChainVerdict::broken(
                    Some(link.seq),
                    TamperClass::Deleted,
                    checked,
                ));
            }

            linked_ids.insert(link.event_id.as_str());
            prev_output = link.vdf_output;
            prev_ts = Some(link.timestamp);
        }

        // Full-chain verification also detects decisions that no link
        // references (insertions into the decision log)
        if up_to.is_none() {
            for decision in decisions {
                if !linked_ids.contains(decision.event_id.as_str()) {
                    return Ok(ChainVerdict::broken(None, TamperClass::Inserted, checked));
                }
            }
        }

        Ok(ChainVerdict::ok(checked))
    }

    /// Decisions that have no chain link yet; each must eventually
    /// produce exactly one link.
    pub async fn reconcile(
        &self,
        decisions: &[DecisionRecord],
    ) -> TollResult<Vec<DecisionRecord>> {
        let linked: std::collections::HashSet<String> = self
            .links()
            .await?
            .into_iter()
            .skip(1)
            .map(|l| l.event_id)
            .collect();

        Ok(decisions
            .iter()
            .filter(|d| !linked.contains(&d.event_id))
            .cloned()
            .collect())
    }

    /// Replace the genesis seed. Refused unless the chain is empty.
    pub async fn reseed(&self, seed: &str) -> TollResult<()> {
        let mut head = self.head.lock().await;
        if head.seq != 0 {
            return Err(TollError::validation(
                "cannot reseed a chain that already has links",
            ));
        }

        let genesis_output = CryptoUtils::hash(seed.as_bytes());
        let genesis = VdfLink {
            seq: 0,
            event_id: "genesis".to_string(),
            reader_id: String::new(),
            timestamp: 0,
            prev_output: genesis_output,
            vdf_input: [0u8; 32],
            vdf_output: genesis_output,
            proof_checkpoints: Vec::new(),
            difficulty: 0,
            checkpoint_granularity: 0,
            computed_at: 0,
        };
        self.db
            .store_data(keyspace::VDF_LINK_PREFIX, &TollDatabase::seq_key(0), &genesis)
            .await?;
        self.db
            .store_data(
                keyspace::CHAIN_META_KEY,
                "current",
                &ChainMeta {
                    head_seq: 0,
                    genesis_seed: seed.to_string(),
                },
            )
            .await?;

        head.output = genesis_output;
        tracing::info!(seed, "chain genesis reseeded");
        Ok(())
    }

    /// Overwrite a stored link (test hook for tamper scenarios).
    #[doc(hidden)]
    pub async fn overwrite_link(&self, link: &VdfLink) -> TollResult<()> {
        self.db
            .store_data(
                keyspace::VDF_LINK_PREFIX,
                &TollDatabase::seq_key(link.seq),
                link,
            )
            .await
    }
}

/// One queued append.
struct AppendRequest {
    event_id: EventId,
    reader_id: ReaderId,
    timestamp: Timestamp,
    computed_at: Timestamp,
    respond: Option<oneshot::Sender<TollResult<Seq>>>,
}

/// Bounded append queue drained by a small worker pool.
///
/// Ingest enqueues and, depending on `response_awaits_vdf`, either waits
/// for the assigned sequence or returns immediately and lets
/// reconciliation guarantee the link.
#[derive(Clone)]
pub struct VdfAppender {
    tx: mpsc::Sender<AppendRequest>,
}

impl VdfAppender {
    /// Spawn the worker pool.
    pub fn spawn(
        chain: Arc<VdfChain>,
        policy: Arc<PolicyStore>,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Self {
        let snapshot = policy.current();
        let (tx, rx) = mpsc::channel::<AppendRequest>(snapshot.vdf.queue_depth);
        let rx = Arc::new(Mutex::new(rx));

        for worker in 0..snapshot.vdf.vdf_workers.max(1) {
            let chain = chain.clone();
            let policy = policy.clone();
            let rx = rx.clone();
            let mut shutdown = shutdown.clone();

            tokio::spawn(async move {
                loop {
                    let request = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            _ = shutdown.changed() => break,
                            request = rx.recv() => request,
                        }
                    };
                    let Some(request) = request else { break };

                    let snapshot = policy.current();
                    let result = chain
                        .append(
                            &request.event_id,
                            &request.reader_id,
                            request.timestamp,
                            snapshot.vdf.difficulty,
                            snapshot.vdf.checkpoint_granularity,
                            request.computed_at,
                        )
                        .await;

                    match &result {
                        Ok(link) => {
                            tracing::debug!(worker, seq = link.seq, "link appended")
                        }
                        Err(err) => {
                            tracing::error!(worker, %err, event_id = %request.event_id, "vdf append failed")
                        }
                    }

                    if let Some(respond) = request.respond {
                        let _ = respond.send(result.map(|l| l.seq));
                    }
                }
                tracing::debug!(worker, "vdf worker stopped");
            });
        }

        Self { tx }
    }

    /// Fire-and-forget append; a full queue is tolerated because the
    /// reconciliation pass re-enqueues unlinked decisions.
    pub fn enqueue(
        &self,
        event_id: &str,
        reader_id: &str,
        timestamp: Timestamp,
        now: Timestamp,
    ) -> bool {
        let accepted = self
            .tx
            .try_send(AppendRequest {
                event_id: event_id.to_string(),
                reader_id: reader_id.to_string(),
                timestamp,
                computed_at: now,
                respond: None,
            })
            .is_ok();
        if !accepted {
            tracing::warn!(event_id, "vdf queue full, deferring to reconciliation");
        }
        accepted
    }

    /// Append and wait for the assigned sequence (`response_awaits_vdf`).
    pub async fn enqueue_wait(
        &self,
        event_id: &str,
        reader_id: &str,
        timestamp: Timestamp,
        now: Timestamp,
    ) -> TollResult<Seq> {
        let (respond, waiter) = oneshot::channel();
        self.tx
            .send(AppendRequest {
                event_id: event_id.to_string(),
                reader_id: reader_id.to_string(),
                timestamp,
                computed_at: now,
                respond: Some(respond),
            })
            .await
            .map_err(|_| TollError::internal("vdf worker pool stopped"))?;

        waiter
            .await
            .map_err(|_| TollError::internal("vdf worker dropped the response"))?
    }
}
