//! # Tollgate Trust
//!
//! The self-healing reader trust engine. Applies weighted penalties and
//! logarithmic decay recovery to per-reader trust scores, drives the
//! graduated enforcement statuses, and restores quarantined readers via
//! probation challenges plus peer consensus.
//!
//! All mutations of one reader happen inside that reader's logical
//! critical section: callers obtain the section with
//! [`TrustEngine::lock_reader`] and hold it across ingest verification,
//! trust updates and lifecycle transitions.

pub mod healing;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use tollgate_common::{
    error::{TollError, TollResult},
    types::{ReaderId, Timestamp, ViolationClass},
};
use tollgate_policy::{PolicyStore, TrustPolicy};
use tollgate_state::{Quarantine, Reader, ReaderStatus, SuspectTag, TollState};

/// Outcome of applying one violation.
#[derive(Debug, Clone)]
pub struct PenaltyOutcome {
    pub new_score: f64,
    pub status: ReaderStatus,
    pub quarantined_now: bool,
}

/// Score decay applied before any update, per the recovery formula
/// `min(cap, rate * ln(1 + hours))`.
///
/// Applies only when the last violation is at least `recovery_min_gap`
/// seconds old; quarantined readers recover solely through the healing
/// sweep.
pub fn apply_decay(reader: &mut Reader, policy: &TrustPolicy, now: Timestamp) {
    if reader.status == ReaderStatus::Quarantined {
        return;
    }

    let gap_ok = match reader.last_violation_at {
        Some(at) => now.saturating_sub(at) >= policy.decay.recovery_min_gap,
        None => true,
    };
    if !gap_ok {
        return;
    }

    let hours = now.saturating_sub(reader.last_update_at) as f64 / 3600.0;
    if hours <= 0.0 {
        return;
    }

    let recovery = (policy.decay.recovery_rate * (1.0 + hours).ln()).min(policy.decay.recovery_cap);
    reader.trust_score = (reader.trust_score + recovery).min(100.0);
}

/// Weighted penalty for one violation:
/// `base_penalty[v] * weight[v] * clamp(confidence, 0.5, 1.0)`.
pub fn weighted_penalty(policy: &TrustPolicy, class: ViolationClass, confidence: f64) -> f64 {
    let entry = policy.violation(class);
    entry.base_penalty * entry.weight * confidence.clamp(0.5, 1.0)
}

/// Status classification from score, for readers not in a lifecycle
/// state (quarantine/probation).
pub fn classify(policy: &TrustPolicy, score: f64) -> ReaderStatus {
    if score >= policy.thresholds.trusted_floor {
        ReaderStatus::Active
    } else if score >= policy.thresholds.degraded_floor {
        ReaderStatus::Degraded
    } else {
        ReaderStatus::Suspended
    }
}

/// The trust engine. Owns the per-reader lock map and mediates every
/// reader mutation.
pub struct TrustEngine {
    state: Arc<TollState>,
    policy: Arc<PolicyStore>,
    locks: Mutex<HashMap<ReaderId, Arc<tokio::sync::Mutex<()>>>>,
}

impl TrustEngine {
    pub fn new(state: Arc<TollState>, policy: Arc<PolicyStore>) -> Self {
        Self {
            state,
            policy,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn state(&self) -> &Arc<TollState> {
        &self.state
    }

    pub fn policy(&self) -> Arc<TrustPolicy> {
        self.policy.current()
    }

    /// Enter the reader's logical critical section.
    ///
    /// Every path that mutates the reader (ingest, trust updates,
    /// probation and consensus transitions) must hold this guard first.
    pub async fn lock_reader(&self, reader_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().expect("lock map is never poisoned");
            locks
                .entry(reader_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Apply one violation to a reader. Caller holds the reader lock.
    ///
    /// Applies decay, then the weighted penalty, updates counters, and
    /// performs the status transition including quarantine entry with
    /// tag-suspicion propagation.
    pub async fn record_violation(
        &self,
        reader_id: &str,
        class: ViolationClass,
        confidence: f64,
        now: Timestamp,
    ) -> TollResult<PenaltyOutcome> {
        let policy = self.policy.current();
        let mut reader = self
            .state
            .readers
            .get(reader_id)
            .await?
            .ok_or_else(|| TollError::state(format!("unknown reader {}", reader_id)))?;

        // Repeated-drift gate: isolated stale timestamps are a validation
        // outcome, not a trust violation
        if class == ViolationClass::StaleTimestamp {
            reader.counters.drift_failures += 1;
            if reader.counters.drift_failures < policy.timing.drift_violation_after {
                reader.last_update_at = now;
                self.state.readers.put(&reader).await?;
                return Ok(PenaltyOutcome {
                    new_score: reader.trust_score,
                    status: reader.status,
                    quarantined_now: false,
                });
            }
        }

        apply_decay(&mut reader, &policy, now);

        let delta = weighted_penalty(&policy, class, confidence);
        reader.trust_score = (reader.trust_score + delta).clamp(0.0, 100.0);
        reader.last_violation_at = Some(now);
        reader.last_update_at = now;
        reader.counters.consecutive_successes = 0;

        match class {
            ViolationClass::BadSignature | ViolationClass::BadKeyVersion => {
                reader.counters.auth_failures += 1
            }
            ViolationClass::Replay => reader.counters.replay_attempts += 1,
            _ => {}
        }

        let occurrences = match class {
            ViolationClass::BadSignature | ViolationClass::BadKeyVersion => {
                reader.counters.auth_failures
            }
            ViolationClass::Replay => reader.counters.replay_attempts,
            _ => 1,
        };

        let entry = policy.violation(class);
        let class_quarantines = entry
            .quarantine_after
            .is_some_and(|after| occurrences >= after as u64);
        let score_quarantines = reader.trust_score < policy.thresholds.quarantine_floor;

        let quarantined_now = reader.status != ReaderStatus::Quarantined
            && (class_quarantines || score_quarantines);

        if quarantined_now {
            self.enter_quarantine(&mut reader, class, entry.severity, now)
                .await?;
        } else if !matches!(
            reader.status,
            ReaderStatus::Quarantined | ReaderStatus::Probation
        ) {
            reader.status = classify(&policy, reader.trust_score);
        }

        self.state.readers.put(&reader).await?;

        tracing::info!(
            reader_id,
            class = class.as_str(),
            score = reader.trust_score,
            status = reader.status.as_str(),
            "violation recorded"
        );

        Ok(PenaltyOutcome {
            new_score: reader.trust_score,
            status: reader.status,
            quarantined_now,
        })
    }

    /// Record an allowed decision. Caller holds the reader lock.
    ///
    /// Applies decay, advances the success streak and grants the streak
    /// reward.
    pub async fn record_success(&self, reader_id: &str, now: Timestamp) -> TollResult<Reader> {
        let policy = self.policy.current();
        let mut reader = self
            .state
            .readers
            .get(reader_id)
            .await?
            .ok_or_else(|| TollError::state(format!("unknown reader {}", reader_id)))?;

        apply_decay(&mut reader, &policy, now);

        reader.counters.consecutive_successes += 1;
        reader.counters.drift_failures = 0;
        reader.counters.total_accepted += 1;

        if policy.fraud.reward_streak > 0
            && reader.counters.consecutive_successes % policy.fraud.reward_streak == 0
        {
            reader.trust_score = (reader.trust_score + policy.fraud.reward_points).min(100.0);
        }

        if !matches!(
            reader.status,
            ReaderStatus::Quarantined | ReaderStatus::Probation
        ) {
            reader.status = classify(&policy, reader.trust_score);
        }

        reader.last_update_at = now;
        self.state.readers.put(&reader).await?;
        Ok(reader)
    }

    /// Force quarantine from the admin surface. Caller holds the reader
    /// lock.
    pub async fn force_quarantine(
        &self,
        reader_id: &str,
        class: ViolationClass,
        now: Timestamp,
    ) -> TollResult<()> {
        let policy = self.policy.current();
        let mut reader = self
            .state
            .readers
            .get(reader_id)
            .await?
            .ok_or_else(|| TollError::state(format!("unknown reader {}", reader_id)))?;

        if reader.status != ReaderStatus::Quarantined {
            let severity = policy.violation(class).severity;
            self.enter_quarantine(&mut reader, class, severity, now)
                .await?;
            self.state.readers.put(&reader).await?;
        }
        Ok(())
    }

    /// Reset a reader's trust score from the admin surface. Caller holds
    /// the reader lock.
    pub async fn reset_trust(&self, reader_id: &str, score: f64, now: Timestamp) -> TollResult<Reader> {
        let policy = self.policy.current();
        let mut reader = self
            .state
            .readers
            .get(reader_id)
            .await?
            .ok_or_else(|| TollError::state(format!("unknown reader {}", reader_id)))?;

        reader.trust_score = score.clamp(0.0, 100.0);
        reader.status = classify(&policy, reader.trust_score);
        reader.last_update_at = now;
        reader.counters.consecutive_successes = 0;

        // An admin reset also closes any open lifecycle state
        if let Some(mut q) = self.state.records.active_quarantine(reader_id).await? {
            q.cleared_at = Some(now);
            self.state.records.put_quarantine(&q).await?;
        }
        self.state.records.delete_challenges_for(reader_id).await?;
        self.state.records.clear_consensus(reader_id).await?;
        self.state.records.clear_votes_for(reader_id).await?;

        self.state.readers.put(&reader).await?;
        Ok(reader)
    }

    /// Transition a reader into quarantine: record the episode and
    /// propagate suspicion over the tags it recently touched.
    async fn enter_quarantine(
        &self,
        reader: &mut Reader,
        trigger: ViolationClass,
        severity: u8,
        now: Timestamp,
    ) -> TollResult<()> {
        let policy = self.policy.current();

        reader.status = ReaderStatus::Quarantined;

        self.state
            .records
            .put_quarantine(&Quarantine {
                reader_id: reader.reader_id.clone(),
                entered_at: now,
                severity: severity.clamp(1, 3),
                trigger_violation: trigger,
                cleared_at: None,
            })
            .await?;

        // Every tag this reader touched recently becomes suspect,
        // raising fraud sensitivity for the suspicion TTL
        let window_start = now.saturating_sub(policy.timing.suspicion_window);
        let decisions = self.state.decisions.all().await?;
        let mut marked = 0usize;
        for decision in decisions
            .iter()
            .filter(|d| d.reader_id == reader.reader_id && d.timestamp >= window_start)
        {
            self.state
                .records
                .mark_suspect(&SuspectTag {
                    tag_hash: decision.tag_hash.clone(),
                    source_reader: reader.reader_id.clone(),
                    marked_at: now,
                    expires_at: now + policy.timing.suspicion_ttl,
                })
                .await?;
            marked += 1;
        }

        tracing::warn!(
            reader_id = %reader.reader_id,
            trigger = trigger.as_str(),
            severity,
            suspect_tags = marked,
            "reader quarantined"
        );

        Ok(())
    }
}
