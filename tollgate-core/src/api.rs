//! TollApi implementation: the node behind the HTTP surface.

use crate::node::TollNode;
use async_trait::async_trait;
use tollgate_chain::{Anchor, AnchorStatus, ChainVerdict};
use tollgate_common::{
    crypto::{CryptoUtils, MerkleTree},
    error::{TollError, TollResult},
    types::{Timestamp, ViolationClass},
    validation::ValidationUtils,
};
use tollgate_rpc::{
    AuditReport, ChallengeResponseRequest, ChallengeResponseResponse, ClearNoncesResponse,
    IngestResponse, PeerVoteRequest, PeerVoteResponse, ReaderView, RegisterReaderResponse,
    RotateSecretResponse, StatsSummary, SystemStatus, TollApi, TollEventRequest,
};
use tollgate_state::{DecisionRecord, Reader, ReaderStatus, Vote};
use tollgate_trust::healing::ConsensusOutcome;

fn reader_view(reader: &Reader) -> ReaderView {
    ReaderView {
        reader_id: reader.reader_id.clone(),
        key_version: reader.key_version,
        trust_score: reader.score_rounded(),
        status: reader.status.as_str().to_string(),
        auth_failures: reader.counters.auth_failures,
        replay_attempts: reader.counters.replay_attempts,
        consecutive_successes: reader.counters.consecutive_successes,
        last_violation_at: reader.last_violation_at,
        last_update_at: reader.last_update_at,
    }
}

#[async_trait]
impl TollApi for TollNode {
    async fn ingest(&self, event: TollEventRequest) -> TollResult<IngestResponse> {
        self.process_event(event).await
    }

    fn server_time(&self) -> Timestamp {
        self.clock.now()
    }

    fn check_admin_key(&self, provided: &str) -> bool {
        !self.config.admin_key.is_empty()
            && CryptoUtils::constant_time_eq(provided.as_bytes(), self.config.admin_key.as_bytes())
    }

    async fn register_reader(&self, reader_id: String) -> TollResult<RegisterReaderResponse> {
        ValidationUtils::validate_reader_id(&reader_id)?;
        if self.state.readers.exists(&reader_id).await? {
            return Err(TollError::validation(format!(
                "reader {} already registered",
                reader_id
            )));
        }

        let reader = Reader::register(reader_id.clone(), self.clock.now());
        self.state.readers.put(&reader).await?;
        tracing::info!(reader_id, "reader registered");

        Ok(RegisterReaderResponse {
            reader_id,
            secret: hex::encode(&reader.secret),
            key_version: reader.key_version,
        })
    }

    async fn rotate_reader_secret(&self, reader_id: String) -> TollResult<RotateSecretResponse> {
        let _guard = self.trust.lock_reader(&reader_id).await;
        let mut reader = self
            .state
            .readers
            .get(&reader_id)
            .await?
            .ok_or_else(|| TollError::validation(format!("unknown reader {}", reader_id)))?;

        let new_key_version = reader.rotate_secret();
        self.state.readers.put(&reader).await?;
        tracing::info!(reader_id, new_key_version, "reader secret rotated");

        Ok(RotateSecretResponse {
            reader_id,
            secret: hex::encode(&reader.secret),
            new_key_version,
        })
    }

    async fn reset_trust(&self, reader_id: String, score: f64) -> TollResult<ReaderView> {
        ValidationUtils::validate_range(score, 0.0, 100.0, "score")?;
        let _guard = self.trust.lock_reader(&reader_id).await;
        let reader = self
            .trust
            .reset_trust(&reader_id, score, self.clock.now())
            .await?;
        Ok(reader_view(&reader))
    }

    async fn force_quarantine(&self, reader_id: String, reason: String) -> TollResult<()> {
        let _guard = self.trust.lock_reader(&reader_id).await;
        // Free-text reasons map onto the closest violation class
        let class = match reason.to_ascii_uppercase().as_str() {
            "REPLAY" => ViolationClass::Replay,
            "BAD_SIGNATURE" => ViolationClass::BadSignature,
            "BALANCE_MANIPULATION" => ViolationClass::BalanceManipulation,
            _ => ViolationClass::FraudRule,
        };
        tracing::warn!(reader_id, reason, "quarantine forced by admin");
        self.trust
            .force_quarantine(&reader_id, class, self.clock.now())
            .await
    }

    async fn cast_peer_vote(&self, request: PeerVoteRequest) -> TollResult<PeerVoteResponse> {
        let vote = match request.vote.to_ascii_uppercase().as_str() {
            "APPROVE" => Vote::Approve,
            "REJECT" => Vote::Reject,
            other => {
                return Err(TollError::validation(format!(
                    "vote must be APPROVE or REJECT, got {:?}",
                    other
                )))
            }
        };

        let _guard = self.trust.lock_reader(&request.subject_reader_id).await;
        let outcome = self
            .trust
            .cast_peer_vote(
                &request.subject_reader_id,
                &request.voter_reader_id,
                vote,
                self.clock.now(),
            )
            .await?;

        Ok(match outcome {
            ConsensusOutcome::Restored => PeerVoteResponse {
                outcome: "restored".to_string(),
                approvals: 0,
                eligible: 0,
            },
            ConsensusOutcome::Pending {
                approvals,
                eligible,
            } => PeerVoteResponse {
                outcome: "pending".to_string(),
                approvals,
                eligible,
            },
        })
    }

    async fn respond_challenge(
        &self,
        request: ChallengeResponseRequest,
    ) -> TollResult<ChallengeResponseResponse> {
        let _guard = self.trust.lock_reader(&request.reader_id).await;
        let passed = self
            .trust
            .submit_challenge_response(
                &request.reader_id,
                &request.challenge_id,
                &request.response,
                self.clock.now(),
            )
            .await?;
        Ok(ChallengeResponseResponse { passed })
    }

    async fn whitelist_tag(&self, tag_hash: String) -> TollResult<()> {
        ValidationUtils::validate_tag_hash(&tag_hash)?;
        self.state
            .records
            .whitelist_tag(&tag_hash, self.clock.now())
            .await
    }

    async fn clear_nonces(&self, before: Timestamp) -> TollResult<ClearNoncesResponse> {
        let removed = self.state.nonces.clear_before(before).await?;
        tracing::info!(removed, before, "nonce records cleared by admin");
        Ok(ClearNoncesResponse { removed })
    }

    async fn reseed_genesis(&self, seed: String) -> TollResult<()> {
        if seed.is_empty() {
            return Err(TollError::validation("seed cannot be empty"));
        }
        self.chain.reseed(&seed).await?;
        // A clean reseed recovers the fatal state
        self.ingest_enabled
            .store(true, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    async fn reload_policy(&self) -> TollResult<()> {
        TollNode::reload_policy(self).await
    }

    async fn verify_chain(&self) -> TollResult<ChainVerdict> {
        let policy = self.policy.current();
        let decisions = self.state.decisions.all().await?;
        self.chain
            .verify(&decisions, policy.timing.reorder_tolerance, None)
            .await
    }

    async fn pending_anchors(&self) -> TollResult<Vec<Anchor>> {
        self.anchors.unacknowledged().await
    }

    async fn retry_anchor(&self, id: u64) -> TollResult<Anchor> {
        self.anchors.retry(id, self.clock.now()).await
    }

    async fn readers(&self) -> TollResult<Vec<ReaderView>> {
        Ok(self
            .state
            .readers
            .list()
            .await?
            .iter()
            .map(reader_view)
            .collect())
    }

    async fn decisions(&self, limit: usize) -> TollResult<Vec<DecisionRecord>> {
        self.state.decisions.recent(limit.min(1000)).await
    }

    async fn audit(&self) -> TollResult<AuditReport> {
        let verdict = self.verify_chain().await?;
        let anchors = self.anchors.all().await?;

        // Recompute every acknowledged anchor's root against the chain
        let mut anchors_consistent = true;
        for anchor in anchors.iter().filter(|a| a.status == AnchorStatus::Sent) {
            let mut pairs = Vec::new();
            for seq in anchor.seq_from..=anchor.seq_to {
                match self.chain.link(seq).await? {
                    Some(link) => pairs.push((link.seq, link.vdf_output)),
                    None => {
                        anchors_consistent = false;
                        break;
                    }
                }
            }
            if hex::encode(MerkleTree::from_links(&pairs).root()) != anchor.root_hash {
                anchors_consistent = false;
            }
        }

        Ok(AuditReport {
            verdict,
            anchors,
            anchors_consistent,
        })
    }

    async fn stats_summary(&self) -> TollResult<StatsSummary> {
        let readers = self.state.readers.list().await?;
        let active_readers = readers
            .iter()
            .filter(|r| r.status == ReaderStatus::Active)
            .count();
        let quarantined_readers = readers
            .iter()
            .filter(|r| r.status == ReaderStatus::Quarantined)
            .count();

        Ok(StatsSummary {
            readers: readers.len(),
            active_readers,
            quarantined_readers,
            total_decisions: self.state.decisions.len(),
            nonce_records: self.state.nonces.len().await?,
            chain_head: self.chain.head_seq().await,
            pending_anchors: self.anchors.unacknowledged().await?.len(),
            anchor_backpressure_warnings: self.anchors.backpressure_warnings(),
        })
    }

    async fn system_status(&self) -> TollResult<SystemStatus> {
        Ok(SystemStatus {
            version: env!("CARGO_PKG_VERSION").to_string(),
            ingest_enabled: self.ingest_enabled(),
            chain_head: self.chain.head_seq().await,
            server_time: self.clock.now(),
        })
    }
}
