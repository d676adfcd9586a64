//! # Tollgate Fraud
//!
//! Fraud-decision fusion for accepted toll events: a deterministic rule
//! layer, two opaque ML scorers with an isolation flag, and a
//! cross-reader outlier signal, fused into one allow/block decision whose
//! reason codes carry every contributing flag. Violations feed back into
//! the trust engine.

pub mod outlier;
pub mod rules;
pub mod scorer;

pub use outlier::{CrossStats, StatsTracker};
pub use rules::{evaluate_rules, RuleFlag};
pub use scorer::{FeatureVector, FileScorer, IsolationModel, MlEngine, MlScorer, MockScorer, NullScorer};

use std::collections::HashMap;
use std::sync::Mutex;
use tollgate_common::{
    error::TollResult,
    types::{TagHash, Timestamp, ViolationClass},
};
use tollgate_policy::TrustPolicy;
use tollgate_state::{Card, Decision};

/// Everything the detector needs to judge one accepted event.
pub struct FraudInput<'a> {
    pub reader_id: &'a str,
    pub tag_hash: &'a str,
    pub timestamp: Timestamp,
    pub amount: i64,
    pub card: &'a Card,
    pub reader_trust: f64,
    pub reader_degraded: bool,
    pub tag_suspect: bool,
}

/// The fused verdict for one event.
#[derive(Debug, Clone)]
pub struct FraudVerdict {
    pub rule_flags: Vec<RuleFlag>,
    pub ml_a: Option<f64>,
    pub ml_b: Option<f64>,
    pub iso_flag: bool,
    pub decision: Decision,
    pub reason_codes: Vec<String>,
    /// Violations to report to the trust engine, with confidence
    pub violations: Vec<(ViolationClass, f64)>,
}

/// Reason code attached when the ML consensus condition blocks.
pub const REASON_ML_BLOCK: &str = "ML_BLOCK";
/// Reason code attached when a degraded reader is blocked on any flag.
pub const REASON_DEGRADED_FLAG: &str = "DEGRADED_READER_FLAG";

/// The fraud detector. Holds the scorer engine, the outlier tracker and
/// the same-tag duplicate window state.
pub struct FraudDetector {
    engine: MlEngine,
    stats: StatsTracker,
    last_scans: Mutex<HashMap<TagHash, Timestamp>>,
}

impl FraudDetector {
    /// Build from the current policy snapshot.
    pub fn from_policy(policy: &TrustPolicy) -> TollResult<Self> {
        Ok(Self {
            engine: MlEngine::from_policy(policy)?,
            stats: StatsTracker::new(),
            last_scans: Mutex::new(HashMap::new()),
        })
    }

    /// Test constructor with an explicit engine.
    pub fn with_engine(engine: MlEngine) -> Self {
        Self {
            engine,
            stats: StatsTracker::new(),
            last_scans: Mutex::new(HashMap::new()),
        }
    }

    /// Swap the scorer engine after a policy reload.
    pub fn rebuild_engine(&mut self, policy: &TrustPolicy) -> TollResult<()> {
        self.engine = MlEngine::from_policy(policy)?;
        Ok(())
    }

    /// The outlier tracker, recorded into by ingest and recomputed by the
    /// sweeper.
    pub fn stats(&self) -> &StatsTracker {
        &self.stats
    }

    fn take_last_scan(&self, tag_hash: &str, now: Timestamp) -> Option<Timestamp> {
        let mut scans = self
            .last_scans
            .lock()
            .expect("scan lock is never poisoned");
        scans.insert(tag_hash.to_string(), now)
    }

    /// Drop duplicate-window entries older than the window (sweeper).
    pub fn prune_scans(&self, now: Timestamp, window: u64) {
        let cutoff = now.saturating_sub(window);
        self.last_scans
            .lock()
            .expect("scan lock is never poisoned")
            .retain(|_, at| *at >= cutoff);
    }

    /// Judge one event. The caller (ingest pipeline) holds the per-reader
    /// lock; this method itself only touches detector-local state.
    pub async fn evaluate(&self, policy: &TrustPolicy, input: FraudInput<'_>) -> FraudVerdict {
        let last_scan = self.take_last_scan(input.tag_hash, input.timestamp);

        let mut rule_flags = evaluate_rules(
            policy,
            input.card,
            input.amount,
            input.timestamp,
            last_scan,
        );

        let stats = self.stats.snapshot();
        if stats.is_outlier(input.reader_id, policy.fraud.cross_multiplier) {
            rule_flags.push(RuleFlag::CrossOutlier);
        }

        let volume_ratio = if stats.mean_active > 0.0 {
            stats.count_for(input.reader_id) as f64 / stats.mean_active
        } else {
            1.0
        };

        let features = FeatureVector {
            amount_ratio: input.amount.max(0) as f64 / policy.fraud.amount_ceiling.max(1) as f64,
            trust_ratio: input.reader_trust / 100.0,
            volume_ratio,
            recent_duplicate: if rule_flags.contains(&RuleFlag::DuplicateScanWindow) {
                1.0
            } else {
                0.0
            },
            suspect_tag: if input.tag_suspect { 1.0 } else { 0.0 },
        };

        let (ml_a, ml_b, iso_flag) = self.engine.evaluate(&features).await;

        // Suspect tags lower the block threshold for the suspicion TTL
        let threshold = if input.tag_suspect {
            (policy.fraud.ml_block_threshold - policy.fraud.suspicion_discount).max(0.0)
        } else {
            policy.fraud.ml_block_threshold
        };

        let critical_rule = rule_flags.iter().any(|f| f.is_critical());
        let ml_consensus = matches!((ml_a, ml_b), (Some(a), Some(b)) if a >= threshold && b >= threshold)
            && iso_flag;
        let degraded_flagged = input.reader_degraded && !rule_flags.is_empty();

        let decision = if critical_rule || ml_consensus || degraded_flagged {
            Decision::Block
        } else {
            Decision::Allow
        };

        // Reason codes carry every contributing flag, not only the first
        let mut reason_codes: Vec<String> =
            rule_flags.iter().map(|f| f.as_str().to_string()).collect();
        if ml_consensus {
            reason_codes.push(REASON_ML_BLOCK.to_string());
        }
        if degraded_flagged {
            reason_codes.push(REASON_DEGRADED_FLAG.to_string());
        }

        let mut violations = Vec::new();
        let balance_flags = rule_flags.iter().any(|f| {
            matches!(
                f,
                RuleFlag::NonPositiveAmount | RuleFlag::InsufficientBalance
            )
        });
        if balance_flags {
            violations.push((ViolationClass::BalanceManipulation, 1.0));
        }
        if rule_flags.iter().any(|f| {
            !matches!(
                f,
                RuleFlag::NonPositiveAmount | RuleFlag::InsufficientBalance
            )
        }) {
            violations.push((ViolationClass::FraudRule, 1.0));
        }
        if ml_consensus {
            let confidence = match (ml_a, ml_b) {
                (Some(a), Some(b)) => (a + b) / 2.0,
                _ => 1.0,
            };
            violations.push((ViolationClass::FraudMl, confidence));
        }

        FraudVerdict {
            rule_flags,
            ml_a,
            ml_b,
            iso_flag,
            decision,
            reason_codes,
            violations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tollgate_state::VehicleType;

    fn detector(scores: Option<(f64, f64)>, iso: bool) -> FraudDetector {
        let engine = match scores {
            Some((a, b)) => MlEngine::with_parts(
                Box::new(MockScorer::new(a)),
                Box::new(MockScorer::new(b)),
                IsolationModel::Fixed(iso),
                Duration::from_millis(50),
            ),
            None => MlEngine::with_parts(
                Box::new(NullScorer),
                Box::new(NullScorer),
                IsolationModel::Fixed(iso),
                Duration::from_millis(50),
            ),
        };
        FraudDetector::with_engine(engine)
    }

    fn card(balance: u64) -> Card {
        Card {
            tag_hash: "ab".repeat(32),
            balance,
            vehicle_type: VehicleType::Car,
            tariff_class: "standard".to_string(),
        }
    }

    fn input<'a>(card: &'a Card, amount: i64) -> FraudInput<'a> {
        FraudInput {
            reader_id: "r1",
            tag_hash: &card.tag_hash,
            timestamp: 1_700_000_000,
            amount,
            card,
            reader_trust: 100.0,
            reader_degraded: false,
            tag_suspect: false,
        }
    }

    #[tokio::test]
    async fn test_clean_event_allows() {
        let detector = detector(Some((0.1, 0.1)), false);
        let policy = TrustPolicy::default();
        let card = card(500);

        let verdict = detector.evaluate(&policy, input(&card, 50)).await;
        assert_eq!(verdict.decision, Decision::Allow);
        assert!(verdict.reason_codes.is_empty());
        assert!(verdict.violations.is_empty());
    }

    #[tokio::test]
    async fn test_ml_consensus_blocks_only_with_iso() {
        let policy = TrustPolicy::default();
        let card = card(500);

        // Both above threshold but iso unset: allow
        let verdict = detector(Some((0.9, 0.9)), false)
            .evaluate(&policy, input(&card, 50))
            .await;
        assert_eq!(verdict.decision, Decision::Allow);

        // Both above threshold and iso set: block with FRAUD_ML violation
        let verdict = detector(Some((0.9, 0.9)), true)
            .evaluate(&policy, input(&card, 50))
            .await;
        assert_eq!(verdict.decision, Decision::Block);
        assert!(verdict.reason_codes.contains(&REASON_ML_BLOCK.to_string()));
        assert!(verdict
            .violations
            .iter()
            .any(|(class, _)| *class == ViolationClass::FraudMl));
    }

    #[tokio::test]
    async fn test_one_score_below_threshold_allows() {
        let policy = TrustPolicy::default();
        let card = card(500);

        let verdict = detector(Some((0.9, 0.5)), true)
            .evaluate(&policy, input(&card, 50))
            .await;
        assert_eq!(verdict.decision, Decision::Allow);
    }

    #[tokio::test]
    async fn test_unavailable_scorers_are_neutral() {
        let policy = TrustPolicy::default();
        let card = card(500);

        // iso set but no scores: the consensus condition cannot fire
        let verdict = detector(None, true).evaluate(&policy, input(&card, 50)).await;
        assert_eq!(verdict.decision, Decision::Allow);
        assert_eq!(verdict.ml_a, None);
        assert_eq!(verdict.ml_b, None);
    }

    #[tokio::test]
    async fn test_critical_rule_blocks_regardless() {
        let policy = TrustPolicy::default();
        let card = card(500);

        let verdict = detector(Some((0.0, 0.0)), false)
            .evaluate(&policy, input(&card, 0))
            .await;
        assert_eq!(verdict.decision, Decision::Block);
        assert!(verdict
            .reason_codes
            .contains(&"NON_POSITIVE_AMOUNT".to_string()));
        assert!(verdict
            .violations
            .iter()
            .any(|(class, _)| *class == ViolationClass::BalanceManipulation));
    }

    #[tokio::test]
    async fn test_degraded_reader_blocks_on_any_flag() {
        let policy = TrustPolicy::default();
        let card = card(500);
        let det = detector(Some((0.0, 0.0)), false);

        // First scan primes the duplicate window
        det.evaluate(&policy, input(&card, 50)).await;

        // Second scan within the window from a degraded reader blocks
        let mut degraded = input(&card, 50);
        degraded.reader_degraded = true;
        let verdict = det.evaluate(&policy, degraded).await;
        assert_eq!(verdict.decision, Decision::Block);
        assert!(verdict
            .reason_codes
            .contains(&REASON_DEGRADED_FLAG.to_string()));
        assert!(verdict
            .reason_codes
            .contains(&"DUPLICATE_SCAN_WINDOW".to_string()));

        // Same duplicate from an active reader only raises the flag
        let det = detector(Some((0.0, 0.0)), false);
        det.evaluate(&policy, input(&card, 50)).await;
        let verdict = det.evaluate(&policy, input(&card, 50)).await;
        assert_eq!(verdict.decision, Decision::Allow);
        assert!(verdict
            .violations
            .iter()
            .any(|(class, _)| *class == ViolationClass::FraudRule));
    }

    #[tokio::test]
    async fn test_suspect_tag_lowers_threshold() {
        let policy = TrustPolicy::default();
        let card = card(500);

        // 0.7 is below the 0.8 threshold normally
        let verdict = detector(Some((0.7, 0.7)), true)
            .evaluate(&policy, input(&card, 50))
            .await;
        assert_eq!(verdict.decision, Decision::Allow);

        // ...but above the suspect-discounted 0.6 threshold
        let mut suspect = input(&card, 50);
        suspect.tag_suspect = true;
        let verdict = detector(Some((0.7, 0.7)), true)
            .evaluate(&policy, suspect)
            .await;
        assert_eq!(verdict.decision, Decision::Block);
    }
}
