//! Self-healing lifecycle: quarantine recovery, probation challenges and
//! peer consensus.
//!
//! Quarantined readers recover score through the periodic healing sweep;
//! past the probation entry floor they receive graduated challenges (one
//! KNOWN_TAG, one TIMING, one HASH_VERIFY per severity level). Passing
//! them all opens a peer-consensus round; enough approvals restore the
//! reader at the policy's restore score. Failure at any stage returns the
//! reader to quarantine with incremented severity, capped at 3.

use crate::TrustEngine;
use tollgate_common::{
    crypto::CryptoUtils,
    error::{TollError, TollResult},
    types::Timestamp,
};
use tollgate_state::{
    ChallengeKind, ConsensusRound, ProbationChallenge, Quarantine, ReaderStatus, Vote,
};

/// Result of casting one peer vote.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsensusOutcome {
    /// Round still open
    Pending { approvals: usize, eligible: usize },
    /// Ratio met; the reader has been restored
    Restored,
}

impl TrustEngine {
    /// Periodic healing sweep, run by the node's sweeper task.
    ///
    /// Advances quarantine recovery, expires stalled challenges and
    /// consensus rounds, and moves readers between lifecycle stages.
    pub async fn healing_tick(&self, now: Timestamp) -> TollResult<()> {
        let policy = self.policy();
        let readers = self.state().readers.list().await?;

        for reader in readers {
            match reader.status {
                ReaderStatus::Quarantined => {
                    let _guard = self.lock_reader(&reader.reader_id).await;
                    let Some(mut reader) =
                        self.state().readers.get(&reader.reader_id).await?
                    else {
                        continue;
                    };
                    if reader.status != ReaderStatus::Quarantined {
                        continue;
                    }

                    // Quarantine recovery follows the decay formula but
                    // runs only here, never on event updates
                    let hours = now.saturating_sub(reader.last_update_at) as f64 / 3600.0;
                    if hours > 0.0 {
                        let recovery = (policy.decay.recovery_rate * (1.0 + hours).ln())
                            .min(policy.decay.recovery_cap);
                        reader.trust_score = (reader.trust_score + recovery).min(100.0);
                        reader.last_update_at = now;
                    }

                    if reader.trust_score >= policy.thresholds.probation_entry_floor {
                        self.enter_probation(&mut reader, now).await?;
                    }
                    self.state().readers.put(&reader).await?;
                }
                ReaderStatus::Probation => {
                    let _guard = self.lock_reader(&reader.reader_id).await;
                    let challenges =
                        self.state().records.challenges_for(&reader.reader_id).await?;

                    let any_failed = challenges.iter().any(|c| {
                        c.passed == Some(false) || (c.passed.is_none() && now > c.expires_at)
                    });
                    if any_failed {
                        self.fail_healing(&reader.reader_id, now).await?;
                        continue;
                    }

                    if !challenges.is_empty() && challenges.iter().all(|c| c.passed == Some(true))
                    {
                        self.open_consensus(&reader.reader_id, now).await?;
                    }
                }
                _ => {}
            }
        }

        // Expired consensus rounds fail the healing attempt
        for round in self.state().records.all_consensus().await? {
            if now > round.expires_at {
                let _guard = self.lock_reader(&round.reader_id).await;
                // Re-check under the lock; a vote may have closed it
                if self
                    .state()
                    .records
                    .consensus_for(&round.reader_id)
                    .await?
                    .is_some()
                {
                    self.fail_healing(&round.reader_id, now).await?;
                }
            }
        }

        Ok(())
    }

    /// Issue the graduated challenge set and move the reader to
    /// probation. Caller holds the reader lock.
    async fn enter_probation(
        &self,
        reader: &mut tollgate_state::Reader,
        now: Timestamp,
    ) -> TollResult<()> {
        let policy = self.policy();
        let severity = self
            .state()
            .records
            .active_quarantine(&reader.reader_id)
            .await?
            .map(|q| q.severity)
            .unwrap_or(1);

        let whitelisted = self.state().records.whitelisted_tags().await?;

        self.state()
            .records
            .delete_challenges_for(&reader.reader_id)
            .await?;

        // One challenge of each kind per severity level
        for round in 0..severity {
            for kind in [
                ChallengeKind::KnownTag,
                ChallengeKind::Timing,
                ChallengeKind::HashVerify,
            ] {
                let (payload, expected_response) = match kind {
                    // The reader must next process a whitelisted tag;
                    // with none configured, any whitelisted tag passes
                    ChallengeKind::KnownTag => (
                        whitelisted
                            .get(round as usize % whitelisted.len().max(1))
                            .cloned()
                            .unwrap_or_default(),
                        None,
                    ),
                    // Echo the server nonce inside the timing window
                    ChallengeKind::Timing => {
                        let nonce = CryptoUtils::generate_nonce();
                        (nonce.clone(), Some(nonce))
                    }
                    // Return SHA-256 of the supplied bytes
                    ChallengeKind::HashVerify => {
                        let material = CryptoUtils::generate_nonce();
                        let digest = CryptoUtils::hash(
                            &hex::decode(&material).expect("nonce is valid hex"),
                        );
                        (material, Some(CryptoUtils::hash_to_hex(&digest)))
                    }
                };

                self.state()
                    .records
                    .put_challenge(&ProbationChallenge {
                        challenge_id: format!("{}-{}", kind.as_str().to_lowercase(), round),
                        reader_id: reader.reader_id.clone(),
                        kind,
                        payload,
                        expected_response,
                        issued_at: now,
                        attempts_remaining: policy.healing.challenge_max_attempts,
                        expires_at: now + policy.healing.challenge_ttl,
                        passed: None,
                    })
                    .await?;
            }
        }

        reader.status = ReaderStatus::Probation;
        tracing::info!(
            reader_id = %reader.reader_id,
            severity,
            "reader entered probation"
        );
        Ok(())
    }

    /// Note an accepted scan from a probation reader, which is how
    /// KNOWN_TAG challenges are answered. Caller holds the reader lock.
    pub async fn note_probation_scan(
        &self,
        reader_id: &str,
        tag_hash: &str,
        now: Timestamp,
    ) -> TollResult<()> {
        if !self.state().records.is_whitelisted(tag_hash).await? {
            return Ok(());
        }

        let challenges = self.state().records.challenges_for(reader_id).await?;
        for mut challenge in challenges {
            if challenge.kind == ChallengeKind::KnownTag
                && challenge.is_open(now)
                && (challenge.payload.is_empty() || challenge.payload == tag_hash)
            {
                challenge.passed = Some(true);
                self.state().records.put_challenge(&challenge).await?;
            }
        }

        self.check_probation_progress(reader_id, now).await
    }

    /// Answer a TIMING or HASH_VERIFY challenge. Caller holds the reader
    /// lock. Returns whether the response passed.
    pub async fn submit_challenge_response(
        &self,
        reader_id: &str,
        challenge_id: &str,
        response: &str,
        now: Timestamp,
    ) -> TollResult<bool> {
        let policy = self.policy();
        let mut challenge = self
            .state()
            .records
            .challenge(reader_id, challenge_id)
            .await?
            .ok_or_else(|| {
                TollError::validation(format!("unknown challenge {}", challenge_id))
            })?;

        if challenge.kind == ChallengeKind::KnownTag {
            return Err(TollError::validation(
                "KNOWN_TAG challenges are answered by processing the tag",
            ));
        }

        if !challenge.is_open(now) {
            return Err(TollError::validation("challenge is closed or expired"));
        }

        let passed = match challenge.kind {
            ChallengeKind::Timing => {
                let in_window = now.saturating_sub(challenge.issued_at) * 1000
                    <= policy.healing.timing_window_ms;
                in_window && challenge.expected_response.as_deref() == Some(response)
            }
            ChallengeKind::HashVerify => {
                challenge.expected_response.as_deref() == Some(response)
            }
            ChallengeKind::KnownTag => unreachable!(),
        };

        if passed {
            challenge.passed = Some(true);
            self.state().records.put_challenge(&challenge).await?;
            self.check_probation_progress(reader_id, now).await?;
        } else {
            challenge.attempts_remaining = challenge.attempts_remaining.saturating_sub(1);
            if challenge.attempts_remaining == 0 {
                challenge.passed = Some(false);
                self.state().records.put_challenge(&challenge).await?;
                self.fail_healing(reader_id, now).await?;
            } else {
                self.state().records.put_challenge(&challenge).await?;
            }
        }

        Ok(passed)
    }

    /// All challenges passed opens the consensus stage.
    async fn check_probation_progress(&self, reader_id: &str, now: Timestamp) -> TollResult<()> {
        let challenges = self.state().records.challenges_for(reader_id).await?;
        if !challenges.is_empty() && challenges.iter().all(|c| c.passed == Some(true)) {
            self.open_consensus(reader_id, now).await?;
        }
        Ok(())
    }

    /// Open a peer-consensus round, or restore outright when the
    /// deployment has too few eligible peers to vote.
    async fn open_consensus(&self, reader_id: &str, now: Timestamp) -> TollResult<()> {
        if self.state().records.consensus_for(reader_id).await?.is_some() {
            return Ok(());
        }

        let policy = self.policy();
        let peers = self.state().readers.active_peers(reader_id).await?;

        if peers.len() < policy.healing.min_consensus_peers {
            tracing::info!(
                reader_id,
                peers = peers.len(),
                "too few eligible peers for consensus, restoring on challenges alone"
            );
            return self.restore_reader(reader_id, now).await;
        }

        self.state().records.clear_votes_for(reader_id).await?;
        self.state()
            .records
            .put_consensus(&ConsensusRound {
                reader_id: reader_id.to_string(),
                opened_at: now,
                expires_at: now + policy.healing.consensus_timeout,
                eligible_peers: peers.into_iter().map(|r| r.reader_id).collect(),
            })
            .await?;

        tracing::info!(reader_id, "peer consensus round opened");
        Ok(())
    }

    /// Cast one peer vote. Caller holds the subject's reader lock.
    ///
    /// Self-votes are rejected; a repeated vote from the same voter
    /// overwrites the earlier one (latest wins within the window).
    pub async fn cast_peer_vote(
        &self,
        subject: &str,
        voter: &str,
        vote: Vote,
        now: Timestamp,
    ) -> TollResult<ConsensusOutcome> {
        if subject == voter {
            return Err(TollError::validation("self-voting is not permitted"));
        }

        let policy = self.policy();
        let round = self
            .state()
            .records
            .consensus_for(subject)
            .await?
            .ok_or_else(|| {
                TollError::validation(format!("no open consensus round for {}", subject))
            })?;

        if now > round.expires_at {
            self.fail_healing(subject, now).await?;
            return Err(TollError::validation("consensus round has expired"));
        }

        if !round.eligible_peers.iter().any(|p| p == voter) {
            return Err(TollError::validation(format!(
                "{} is not an eligible voter for {}",
                voter, subject
            )));
        }

        self.state()
            .records
            .put_vote(&tollgate_state::PeerVote {
                subject_reader_id: subject.to_string(),
                voter_reader_id: voter.to_string(),
                vote,
                cast_at: now,
            })
            .await?;

        let votes = self.state().records.votes_for(subject).await?;
        let approvals = votes.iter().filter(|v| v.vote == Vote::Approve).count();
        let eligible = round.eligible_peers.len();

        if approvals as f64 / eligible as f64 >= policy.healing.consensus_approval_ratio {
            self.restore_reader(subject, now).await?;
            return Ok(ConsensusOutcome::Restored);
        }

        Ok(ConsensusOutcome::Pending {
            approvals,
            eligible,
        })
    }

    /// Restore a reader to ACTIVE at the policy's restore score, closing
    /// all lifecycle records.
    async fn restore_reader(&self, reader_id: &str, now: Timestamp) -> TollResult<()> {
        let policy = self.policy();
        let mut reader = self
            .state()
            .readers
            .get(reader_id)
            .await?
            .ok_or_else(|| TollError::state(format!("unknown reader {}", reader_id)))?;

        reader.status = ReaderStatus::Active;
        reader.trust_score = policy.thresholds.restore_score;
        reader.last_update_at = now;
        reader.counters.consecutive_successes = 0;
        self.state().readers.put(&reader).await?;

        if let Some(mut q) = self.state().records.active_quarantine(reader_id).await? {
            q.cleared_at = Some(now);
            self.state().records.put_quarantine(&q).await?;
        }
        self.state().records.delete_challenges_for(reader_id).await?;
        self.state().records.clear_consensus(reader_id).await?;
        self.state().records.clear_votes_for(reader_id).await?;

        tracing::info!(reader_id, score = policy.thresholds.restore_score, "reader restored");
        Ok(())
    }

    /// Any healing failure re-quarantines with incremented severity
    /// (capped at 3) and restarts recovery from the quarantine floor.
    pub async fn fail_healing(&self, reader_id: &str, now: Timestamp) -> TollResult<()> {
        let policy = self.policy();
        let mut reader = self
            .state()
            .readers
            .get(reader_id)
            .await?
            .ok_or_else(|| TollError::state(format!("unknown reader {}", reader_id)))?;

        let previous = self.state().records.active_quarantine(reader_id).await?;
        let (severity, trigger) = match &previous {
            Some(q) => ((q.severity + 1).min(3), q.trigger_violation),
            None => (1, tollgate_common::types::ViolationClass::FraudRule),
        };

        if let Some(mut q) = previous {
            q.cleared_at = Some(now);
            self.state().records.put_quarantine(&q).await?;
        }

        self.state()
            .records
            .put_quarantine(&Quarantine {
                reader_id: reader_id.to_string(),
                entered_at: now,
                severity,
                trigger_violation: trigger,
                cleared_at: None,
            })
            .await?;

        reader.status = ReaderStatus::Quarantined;
        reader.trust_score = policy.thresholds.quarantine_floor;
        reader.last_update_at = now;
        self.state().readers.put(&reader).await?;

        self.state().records.delete_challenges_for(reader_id).await?;
        self.state().records.clear_consensus(reader_id).await?;
        self.state().records.clear_votes_for(reader_id).await?;

        tracing::warn!(reader_id, severity, "healing failed, reader re-quarantined");
        Ok(())
    }
}
