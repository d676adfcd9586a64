//! The toll node: wires verification, fraud fusion, trust updates, the
//! decision log, the VDF chain and the anchor queue into one pipeline,
//! and owns the background workers.

use crate::clock::Clock;
use crate::config::NodeConfig;
use crate::ingest::IngestVerifier;
use crate::ratelimit::RateLimiter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tollgate_chain::{ledger_from_policy, AnchorQueue, VdfAppender, VdfChain};
use tollgate_common::{
    crypto::CryptoUtils,
    error::{TollError, TollResult},
    types::ViolationClass,
};
use tollgate_fraud::{FraudDetector, FraudInput, FraudVerdict};
use tollgate_policy::{PolicyStore, TrustPolicy};
use tollgate_rpc::{IngestResponse, TollEventRequest};
use tollgate_state::{Decision, DecisionRecord, ReaderStatus, TollState};
use tollgate_trust::TrustEngine;

/// Reason code for a scan of a tag with no registered card.
pub const REASON_UNKNOWN_CARD: &str = "UNKNOWN_CARD";
/// Reason code for a card whose tariff class has no table entry.
pub const REASON_UNKNOWN_TARIFF: &str = "UNKNOWN_TARIFF";
/// Reason code when the deduction itself fails post-decision.
pub const REASON_INSUFFICIENT_BALANCE: &str = "INSUFFICIENT_BALANCE";

pub struct TollNode {
    pub(crate) config: NodeConfig,
    pub(crate) state: Arc<TollState>,
    pub(crate) policy: Arc<PolicyStore>,
    pub(crate) trust: Arc<TrustEngine>,
    pub(crate) fraud: tokio::sync::RwLock<FraudDetector>,
    pub(crate) chain: Arc<VdfChain>,
    pub(crate) appender: VdfAppender,
    pub(crate) anchors: Arc<AnchorQueue>,
    pub(crate) clock: Arc<Clock>,
    pub(crate) verifier: IngestVerifier,
    pub(crate) ingest_enabled: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl TollNode {
    /// Construct the node: open stores, the chain (creating genesis if
    /// needed), run the startup chain verification, and spawn the VDF
    /// worker pool. Background workers start with [`TollNode::start`].
    pub async fn new(config: NodeConfig) -> TollResult<Arc<Self>> {
        let policy = match &config.policy_path {
            Some(path) => Arc::new(PolicyStore::from_file(path)?),
            None => Arc::new(PolicyStore::new(TrustPolicy::default())),
        };
        let snapshot = policy.current();

        let state = Arc::new(TollState::open(&config.db_path).await?);
        let chain = Arc::new(VdfChain::open(state.db.clone(), &snapshot.vdf.genesis_seed).await?);

        // A broken chain at startup is fatal for ingest; admin endpoints
        // stay available for recovery. Decisions not yet linked (a crash
        // inside the append window) are not tampering: reconciliation
        // converges them, so INSERTED alone does not disable ingest.
        let decisions = state.decisions.all().await?;
        let verdict = chain
            .verify(&decisions, snapshot.timing.reorder_tolerance, None)
            .await?;
        let ingest_ok = verdict.valid || verdict.class == Some(tollgate_chain::TamperClass::Inserted);
        if !verdict.valid {
            tracing::error!(
                first_broken_seq = ?verdict.first_broken_seq,
                class = ?verdict.class.map(|c| c.as_str()),
                recoverable = ingest_ok,
                "startup chain verification failed"
            );
        }

        let trust = Arc::new(TrustEngine::new(state.clone(), policy.clone()));
        let fraud = tokio::sync::RwLock::new(FraudDetector::from_policy(&snapshot)?);
        let limiter = Arc::new(RateLimiter::new());
        let verifier = IngestVerifier::new(state.clone(), trust.clone(), limiter.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let appender = VdfAppender::spawn(chain.clone(), policy.clone(), shutdown_rx);

        let ledger = ledger_from_policy(&snapshot)?;
        let anchors = Arc::new(AnchorQueue::open(state.db.clone(), ledger, policy.clone()).await?);

        tracing::info!(
            db = %config.db_path,
            chain_head = chain.head_seq().await,
            vdf_difficulty = snapshot.vdf.difficulty,
            "toll node initialized"
        );

        Ok(Arc::new(Self {
            config,
            state,
            policy,
            trust,
            fraud,
            chain,
            appender,
            anchors,
            clock: Arc::new(Clock::new()),
            verifier,
            ingest_enabled: AtomicBool::new(ingest_ok),
            shutdown_tx,
        }))
    }

    /// Spawn the anchor worker and the sweeper.
    pub fn start(self: &Arc<Self>) {
        let anchors = self.anchors.clone();
        let chain = self.chain.clone();
        let clock = self.clock.clone();
        let shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(anchors.run(chain, shutdown, move || clock.now()));

        let node = self.clone();
        let shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(node.sweep_loop(shutdown));
    }

    /// Signal every background task to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    pub fn state(&self) -> &Arc<TollState> {
        &self.state
    }

    /// Whether ingest is currently served (false after a fatal startup
    /// condition).
    pub fn ingest_enabled(&self) -> bool {
        self.ingest_enabled.load(Ordering::Relaxed)
    }

    /// Process one toll event end to end.
    pub async fn process_event(&self, event: TollEventRequest) -> TollResult<IngestResponse> {
        if !self.ingest_enabled() {
            return Err(TollError::fatal(
                "chain integrity failure; ingest is disabled until recovery",
            ));
        }

        IngestVerifier::validate_shape(&event)?;
        let policy = self.policy.current();
        let deadline = Duration::from_millis(policy.deadlines.ingest_deadline_ms);

        // The outer deadline aborts before the nonce write, so an expired
        // request leaves no partial state
        tokio::time::timeout(deadline, self.process_inner(event, &policy))
            .await
            .map_err(|_| TollError::deadline("ingest deadline exceeded"))?
    }

    async fn process_inner(
        &self,
        event: TollEventRequest,
        policy: &TrustPolicy,
    ) -> TollResult<IngestResponse> {
        let now = self.clock.now();

        // The reader's critical section spans verification, the fraud
        // decision, trust updates and the decision log append
        let _guard = self.trust.lock_reader(&event.reader_id).await;

        let reader = self.verifier.verify(&event, policy, now).await?;
        let event_id = CryptoUtils::generate_event_id();

        {
            let fraud = self.fraud.read().await;
            fraud.stats().record(&event.reader_id, now);
        }

        let card = self.state.cards.get(&event.tag_hash).await?;
        let tag_suspect = self
            .state
            .records
            .is_suspect(&event.tag_hash, now)
            .await?;

        let (verdict, amount) = match &card {
            None => (Self::block_verdict(REASON_UNKNOWN_CARD), 0),
            Some(card) => match self.state.cards.amount_for(card).await {
                Err(_) => (Self::block_verdict(REASON_UNKNOWN_TARIFF), 0),
                Ok(amount) => {
                    let fraud = self.fraud.read().await;
                    let verdict = fraud
                        .evaluate(
                            policy,
                            FraudInput {
                                reader_id: &event.reader_id,
                                tag_hash: &event.tag_hash,
                                timestamp: event.timestamp,
                                amount: amount as i64,
                                card,
                                reader_trust: reader.trust_score,
                                reader_degraded: reader.status == ReaderStatus::Degraded,
                                tag_suspect,
                            },
                        )
                        .await;
                    (verdict, amount)
                }
            },
        };

        // Violations feed back into the trust engine before the response
        for (class, confidence) in &verdict.violations {
            self.trust
                .record_violation(&event.reader_id, *class, *confidence, now)
                .await?;
        }

        let mut decision = verdict.decision;
        let mut reason_codes = verdict.reason_codes.clone();

        // Deduct on allow; a failed deduction is balance manipulation
        let mut deducted = None;
        if decision == Decision::Allow {
            match self.state.cards.deduct(&event.tag_hash, amount).await {
                Ok(_) => deducted = Some(amount),
                Err(_) => {
                    decision = Decision::Block;
                    reason_codes.push(REASON_INSUFFICIENT_BALANCE.to_string());
                    self.trust
                        .record_violation(
                            &event.reader_id,
                            ViolationClass::BalanceManipulation,
                            1.0,
                            now,
                        )
                        .await?;
                }
            }
        }

        // A clean allow advances the success streak
        let reader_after = if decision == Decision::Allow && verdict.violations.is_empty() {
            self.trust.record_success(&event.reader_id, now).await?
        } else {
            self.state
                .readers
                .get(&event.reader_id)
                .await?
                .unwrap_or(reader.clone())
        };

        let record = DecisionRecord {
            event_id: event_id.clone(),
            reader_id: event.reader_id.clone(),
            tag_hash: event.tag_hash.clone(),
            timestamp: event.timestamp,
            ml_a: verdict.ml_a,
            ml_b: verdict.ml_b,
            iso_flag: verdict.iso_flag,
            rule_flags: verdict
                .rule_flags
                .iter()
                .map(|f| f.as_str().to_string())
                .collect(),
            trust_snapshot: reader_after.trust_score,
            decision,
            reason_codes: reason_codes.clone(),
            amount,
        };

        // Rollback the deduction when the decision cannot be persisted
        if let Err(err) = self.state.decisions.append(&record).await {
            if let Some(amount) = deducted {
                if let Err(refund_err) = self.state.cards.refund(&event.tag_hash, amount).await {
                    tracing::error!(%refund_err, tag = %event.tag_hash, "refund after failed append");
                }
            }
            return Err(err);
        }

        // An accepted scan of a whitelisted tag answers KNOWN_TAG
        // probation challenges
        if reader.status == ReaderStatus::Probation && decision == Decision::Allow {
            self.trust
                .note_probation_scan(&event.reader_id, &event.tag_hash, now)
                .await?;
        }

        // Hand the link to the worker pool; never compute a VDF inline
        let vdf_seq = if policy.vdf.response_awaits_vdf {
            match self
                .appender
                .enqueue_wait(&event_id, &event.reader_id, event.timestamp, now)
                .await
            {
                Ok(seq) => Some(seq),
                Err(err) => {
                    tracing::warn!(%err, event_id, "vdf append deferred to reconciliation");
                    None
                }
            }
        } else {
            self.appender
                .enqueue(&event_id, &event.reader_id, event.timestamp, now);
            None
        };

        Ok(IngestResponse {
            decision: decision.as_str().to_string(),
            reason_codes,
            trust_score: reader_after.score_rounded(),
            event_id,
            vdf_seq,
        })
    }

    fn block_verdict(reason: &str) -> FraudVerdict {
        FraudVerdict {
            rule_flags: Vec::new(),
            ml_a: None,
            ml_b: None,
            iso_flag: false,
            decision: Decision::Block,
            reason_codes: vec![reason.to_string()],
            violations: Vec::new(),
        }
    }

    /// Periodic sweeper: nonce GC, suspicion expiry, healing progression,
    /// cross-reader stats recompute and chain reconciliation.
    async fn sweep_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let interval = self.policy.current().timing.sweep_interval.max(1);
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(Duration::from_secs(interval)) => {
                    if let Err(err) = self.sweep_once().await {
                        tracing::error!(%err, "sweep failed");
                    }
                }
            }
        }
        tracing::debug!("sweeper stopped");
    }

    /// One sweep pass; also driven directly by tests.
    pub async fn sweep_once(&self) -> TollResult<()> {
        let now = self.clock.now();
        let policy = self.policy.current();

        let removed = self.state.nonces.gc(now, policy.nonce_retention()).await?;
        if removed > 0 {
            tracing::debug!(removed, "nonce records collected");
        }
        self.state.records.sweep_suspects(now).await?;

        self.trust.healing_tick(now).await?;

        let active: Vec<String> = self
            .state
            .readers
            .list()
            .await?
            .into_iter()
            .filter(|r| r.status == ReaderStatus::Active)
            .map(|r| r.reader_id)
            .collect();
        {
            let fraud = self.fraud.read().await;
            fraud
                .stats()
                .recompute(now, policy.timing.cross_window, &active);
            fraud.prune_scans(now, policy.timing.duplicate_window);
        }

        // Every accepted decision must eventually carry exactly one link
        let decisions = self.state.decisions.all().await?;
        let missing = self.chain.reconcile(&decisions).await?;
        for decision in missing {
            self.appender.enqueue(
                &decision.event_id,
                &decision.reader_id,
                decision.timestamp,
                now,
            );
        }

        Ok(())
    }

    /// Reload the trust policy and rebuild the scorer engine.
    pub async fn reload_policy(&self) -> TollResult<()> {
        let path = self
            .config
            .policy_path
            .as_deref()
            .ok_or_else(|| TollError::config("no policy file configured"))?;
        self.policy.reload(path)?;
        self.fraud
            .write()
            .await
            .rebuild_engine(&self.policy.current())?;
        Ok(())
    }
}
