//! # Tollgate Policy
//!
//! Declarative trust policy for the toll-processing backend. The policy is
//! a plain YAML document; a [`PolicyStore`] holds the current snapshot
//! behind an `Arc` and swaps it atomically on reload, so readers never see
//! a half-updated policy.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tollgate_common::{
    error::{TollError, TollResult},
    types::ViolationClass,
};

/// Per-violation-class policy entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ViolationPolicy {
    /// Signed score delta before weighting (negative for violations)
    pub base_penalty: f64,
    /// Multiplier applied to the base penalty
    pub weight: f64,
    /// Quarantine severity contributed by this class (1..=3)
    pub severity: u8,
    /// Occurrences of this class before the reader is quarantined
    /// outright; `None` means the class never auto-quarantines.
    pub quarantine_after: Option<u32>,
}

/// Trust score decay parameters (§ trust engine).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecayPolicy {
    /// Points recovered per `ln(1 + hours)` unit
    pub recovery_rate: f64,
    /// Cap on recovery applied in one update
    pub recovery_cap: f64,
    /// Seconds since the last violation before decay applies
    pub recovery_min_gap: u64,
}

/// Score floors driving status classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdPolicy {
    /// Scores at or above this are ACTIVE
    pub trusted_floor: f64,
    /// Scores in `[degraded_floor, trusted_floor)` are DEGRADED
    pub degraded_floor: f64,
    /// Scores below this quarantine regardless of violation class
    pub quarantine_floor: f64,
    /// Quarantined readers entering probation must have decayed past this
    pub probation_entry_floor: f64,
    /// Score granted on successful restoration
    pub restore_score: f64,
}

/// Per-reader token bucket parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatePolicy {
    /// Sustained events per second
    pub rate_per_sec: f64,
    /// Bucket capacity
    pub burst: u32,
}

/// Windows and intervals (seconds unless noted).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingPolicy {
    /// Maximum |now - timestamp| accepted at ingest
    pub max_timestamp_drift: u64,
    /// Same-tag duplicate scan window
    pub duplicate_window: u64,
    /// Lookback for tag-suspicion propagation on quarantine entry
    pub suspicion_window: u64,
    /// How long propagated suspicion raises fraud sensitivity
    pub suspicion_ttl: u64,
    /// Cross-reader outlier comparison window
    pub cross_window: u64,
    /// Cross-reader stats snapshot recompute interval
    pub cross_stats_interval: u64,
    /// Background sweeper cadence
    pub sweep_interval: u64,
    /// Chain timestamps may run backwards by at most this much
    pub reorder_tolerance: u64,
    /// Consecutive drift rejections before they count as a violation
    pub drift_violation_after: u32,
}

/// Fraud detection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FraudPolicy {
    /// Absolute per-event amount ceiling
    pub amount_ceiling: u64,
    /// Per-vehicle-type amount ceilings, keyed by lowercase type name
    pub vehicle_ceilings: HashMap<String, u64>,
    /// Both ML scores at or above this (plus iso) block
    pub ml_block_threshold: f64,
    /// Threshold reduction while the tag is suspect
    pub suspicion_discount: f64,
    /// Reader counts above `multiplier x` peer mean are outliers
    pub cross_multiplier: f64,
    /// Allow-decisions per reward grant
    pub reward_streak: u32,
    /// Score points granted per completed streak
    pub reward_points: f64,
    /// Which ML scorer implementation to use
    pub scorer: ScorerKind,
    /// Fixed scores returned by the mock scorer (a, b)
    pub mock_scores: (f64, f64),
    /// Weight files for the file-backed scorer pair
    pub model_a_path: Option<String>,
    pub model_b_path: Option<String>,
}

/// ML scorer implementation selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScorerKind {
    /// File-backed logistic model
    Real,
    /// Fixed scores, for tests and staging
    Mock,
    /// Always unavailable; fusion sees neutral scores
    Null,
}

/// VDF chain parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VdfPolicy {
    /// Iterated-SHA256 difficulty `d`
    pub difficulty: u64,
    /// Number of proof checkpoints per link
    pub checkpoint_granularity: u64,
    /// VDF append worker pool size
    pub vdf_workers: usize,
    /// Bounded append queue depth
    pub queue_depth: usize,
    /// Whether ingest responses wait for the link append
    pub response_awaits_vdf: bool,
    /// Genesis seed; genesis output is SHA256(seed)
    pub genesis_seed: String,
}

/// Ledger anchoring parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorPolicy {
    /// Links per anchor batch
    pub batch_size: usize,
    /// Max seconds a partial batch may wait
    pub max_delay: u64,
    /// Backoff base in milliseconds
    pub backoff_base_ms: u64,
    /// Backoff cap in milliseconds
    pub backoff_cap_ms: u64,
    /// Pending-anchor depth that trips the backpressure warning
    pub queue_max: usize,
    /// Which ledger client implementation to use
    pub ledger: LedgerKind,
    /// Endpoint for the HTTP ledger client
    pub ledger_endpoint: Option<String>,
}

/// Ledger client implementation selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerKind {
    /// HTTP submission to `ledger_endpoint`
    Real,
    /// In-memory ledger, for tests and staging
    Mock,
    /// Accepts nothing; anchors stay pending
    Null,
}

/// Self-healing lifecycle parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingPolicy {
    /// Fraction of eligible peers that must approve restoration
    pub consensus_approval_ratio: f64,
    /// Seconds a consensus round stays open
    pub consensus_timeout: u64,
    /// Minimum eligible peers for a consensus round to open
    pub min_consensus_peers: usize,
    /// Attempts per probation challenge
    pub challenge_max_attempts: u32,
    /// Seconds before an issued challenge expires
    pub challenge_ttl: u64,
    /// Response window for TIMING challenges, milliseconds
    pub timing_window_ms: u64,
}

/// External call deadlines, milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadlinePolicy {
    pub ml_deadline_ms: u64,
    pub ledger_deadline_ms: u64,
    pub ingest_deadline_ms: u64,
}

/// The complete declarative trust policy.
///
/// Read-only after load; reloads swap the whole snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustPolicy {
    pub violations: HashMap<ViolationClass, ViolationPolicy>,
    pub decay: DecayPolicy,
    pub thresholds: ThresholdPolicy,
    pub rate: RatePolicy,
    pub timing: TimingPolicy,
    pub fraud: FraudPolicy,
    pub vdf: VdfPolicy,
    pub anchor: AnchorPolicy,
    pub healing: HealingPolicy,
    pub deadlines: DeadlinePolicy,
}

impl Default for TrustPolicy {
    fn default() -> Self {
        let mut violations = HashMap::new();
        violations.insert(
            ViolationClass::BadSignature,
            ViolationPolicy {
                base_penalty: -40.0,
                weight: 1.0,
                severity: 2,
                quarantine_after: Some(3),
            },
        );
        violations.insert(
            ViolationClass::Replay,
            ViolationPolicy {
                base_penalty: -40.0,
                weight: 1.0,
                severity: 1,
                quarantine_after: Some(1),
            },
        );
        violations.insert(
            ViolationClass::BadKeyVersion,
            ViolationPolicy {
                base_penalty: -15.0,
                weight: 1.0,
                severity: 1,
                quarantine_after: None,
            },
        );
        violations.insert(
            ViolationClass::StaleTimestamp,
            ViolationPolicy {
                base_penalty: -5.0,
                weight: 1.0,
                severity: 1,
                quarantine_after: None,
            },
        );
        violations.insert(
            ViolationClass::RateExceeded,
            ViolationPolicy {
                base_penalty: -10.0,
                weight: 1.0,
                severity: 1,
                quarantine_after: None,
            },
        );
        violations.insert(
            ViolationClass::FraudRule,
            ViolationPolicy {
                base_penalty: -20.0,
                weight: 1.0,
                severity: 2,
                quarantine_after: None,
            },
        );
        violations.insert(
            ViolationClass::FraudMl,
            ViolationPolicy {
                base_penalty: -15.0,
                weight: 1.0,
                severity: 1,
                quarantine_after: None,
            },
        );
        violations.insert(
            ViolationClass::BalanceManipulation,
            ViolationPolicy {
                base_penalty: -50.0,
                weight: 1.0,
                severity: 3,
                quarantine_after: Some(1),
            },
        );

        let mut vehicle_ceilings = HashMap::new();
        vehicle_ceilings.insert("car".to_string(), 100);
        vehicle_ceilings.insert("motorcycle".to_string(), 50);
        vehicle_ceilings.insert("bus".to_string(), 200);
        vehicle_ceilings.insert("truck".to_string(), 300);

        Self {
            violations,
            decay: DecayPolicy {
                recovery_rate: 5.0,
                recovery_cap: 25.0,
                recovery_min_gap: 1800,
            },
            thresholds: ThresholdPolicy {
                trusted_floor: 70.0,
                degraded_floor: 35.0,
                quarantine_floor: 15.0,
                probation_entry_floor: 40.0,
                restore_score: 75.0,
            },
            rate: RatePolicy {
                rate_per_sec: 5.0,
                burst: 10,
            },
            timing: TimingPolicy {
                max_timestamp_drift: 300,
                duplicate_window: 60,
                suspicion_window: 3600,
                suspicion_ttl: 86400,
                cross_window: 3600,
                cross_stats_interval: 60,
                sweep_interval: 60,
                reorder_tolerance: 300,
                drift_violation_after: 5,
            },
            fraud: FraudPolicy {
                amount_ceiling: 500,
                vehicle_ceilings,
                ml_block_threshold: 0.8,
                suspicion_discount: 0.2,
                cross_multiplier: 3.0,
                reward_streak: 10,
                reward_points: 2.0,
                scorer: ScorerKind::Null,
                mock_scores: (0.1, 0.1),
                model_a_path: None,
                model_b_path: None,
            },
            vdf: VdfPolicy {
                difficulty: 1000,
                checkpoint_granularity: 10,
                vdf_workers: 1,
                queue_depth: 1024,
                response_awaits_vdf: false,
                genesis_seed: "tollgate-genesis".to_string(),
            },
            anchor: AnchorPolicy {
                batch_size: 16,
                max_delay: 30,
                backoff_base_ms: 1000,
                backoff_cap_ms: 60000,
                queue_max: 256,
                ledger: LedgerKind::Null,
                ledger_endpoint: None,
            },
            healing: HealingPolicy {
                consensus_approval_ratio: 0.6,
                consensus_timeout: 3600,
                min_consensus_peers: 3,
                challenge_max_attempts: 3,
                challenge_ttl: 600,
                timing_window_ms: 5000,
            },
            deadlines: DeadlinePolicy {
                ml_deadline_ms: 500,
                ledger_deadline_ms: 5000,
                ingest_deadline_ms: 2000,
            },
        }
    }
}

impl TrustPolicy {
    /// Load a policy from a YAML file
    pub fn load(path: impl AsRef<Path>) -> TollResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let policy: TrustPolicy = serde_yaml::from_str(&raw)
            .map_err(|e| TollError::fatal(format!("Policy file parse error: {}", e)))?;
        policy.validate()?;
        Ok(policy)
    }

    /// Policy entry for a violation class; classes absent from the file
    /// fall back to the built-in defaults.
    pub fn violation(&self, class: ViolationClass) -> ViolationPolicy {
        if let Some(entry) = self.violations.get(&class) {
            return *entry;
        }
        *TrustPolicy::default()
            .violations
            .get(&class)
            .expect("default policy covers every class")
    }

    /// Nonce records older than `2 x max_timestamp_drift` are collectable.
    pub fn nonce_retention(&self) -> u64 {
        2 * self.timing.max_timestamp_drift
    }

    /// Validate internal consistency
    pub fn validate(&self) -> TollResult<()> {
        if self.thresholds.degraded_floor >= self.thresholds.trusted_floor {
            return Err(TollError::config(
                "degraded_floor must be below trusted_floor",
            ));
        }
        if self.thresholds.quarantine_floor >= self.thresholds.degraded_floor {
            return Err(TollError::config(
                "quarantine_floor must be below degraded_floor",
            ));
        }
        if !(0.0..=1.0).contains(&self.healing.consensus_approval_ratio) {
            return Err(TollError::config(
                "consensus_approval_ratio must be within [0, 1]",
            ));
        }
        if !(0.0..=1.0).contains(&self.fraud.ml_block_threshold) {
            return Err(TollError::config("ml_block_threshold must be within [0, 1]"));
        }
        if self.vdf.difficulty == 0 {
            return Err(TollError::config("vdf difficulty must be at least 1"));
        }
        if self.vdf.checkpoint_granularity == 0 {
            return Err(TollError::config(
                "vdf checkpoint_granularity must be at least 1",
            ));
        }
        if self.vdf.vdf_workers == 0 {
            return Err(TollError::config("vdf_workers must be at least 1"));
        }
        if self.anchor.batch_size == 0 {
            return Err(TollError::config("anchor batch_size must be at least 1"));
        }
        if self.vdf.genesis_seed.is_empty() {
            return Err(TollError::config("vdf genesis_seed cannot be empty"));
        }
        if self.rate.rate_per_sec <= 0.0 {
            return Err(TollError::config("rate_per_sec must be positive"));
        }
        for (class, entry) in &self.violations {
            if entry.base_penalty > 0.0 {
                return Err(TollError::config(format!(
                    "violation {:?} base_penalty must not be positive",
                    class
                )));
            }
            if !(1..=3).contains(&entry.severity) {
                return Err(TollError::config(format!(
                    "violation {:?} severity must be 1..=3",
                    class
                )));
            }
        }
        Ok(())
    }
}

/// Shared policy snapshot holder.
///
/// `current()` clones an `Arc`; `reload()` parses, validates and swaps the
/// pointer, so in-flight requests keep the snapshot they started with.
pub struct PolicyStore {
    snapshot: RwLock<Arc<TrustPolicy>>,
}

impl PolicyStore {
    /// Wrap an already-validated policy
    pub fn new(policy: TrustPolicy) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(policy)),
        }
    }

    /// Load the initial snapshot from a file
    pub fn from_file(path: impl AsRef<Path>) -> TollResult<Self> {
        Ok(Self::new(TrustPolicy::load(path)?))
    }

    /// Get the current snapshot
    pub fn current(&self) -> Arc<TrustPolicy> {
        self.snapshot
            .read()
            .expect("policy lock is never poisoned")
            .clone()
    }

    /// Replace the snapshot with a freshly parsed file.
    ///
    /// A parse or validation failure leaves the old snapshot in place.
    pub fn reload(&self, path: impl AsRef<Path>) -> TollResult<()> {
        let fresh = TrustPolicy::load(path.as_ref())?;
        let mut guard = self
            .snapshot
            .write()
            .expect("policy lock is never poisoned");
        *guard = Arc::new(fresh);
        tracing::info!(path = %path.as_ref().display(), "trust policy reloaded");
        Ok(())
    }

    /// Swap in an in-memory policy (admin/test path)
    pub fn replace(&self, policy: TrustPolicy) -> TollResult<()> {
        policy.validate()?;
        let mut guard = self
            .snapshot
            .write()
            .expect("policy lock is never poisoned");
        *guard = Arc::new(policy);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_policy_validates() {
        TrustPolicy::default().validate().unwrap();
    }

    #[test]
    fn test_violation_lookup_falls_back() {
        let mut policy = TrustPolicy::default();
        policy.violations.clear();
        let entry = policy.violation(ViolationClass::Replay);
        assert_eq!(entry.base_penalty, -40.0);
        assert_eq!(entry.quarantine_after, Some(1));
    }

    #[test]
    fn test_invalid_thresholds_rejected() {
        let mut policy = TrustPolicy::default();
        policy.thresholds.degraded_floor = 90.0;
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let policy = TrustPolicy::default();
        let yaml = serde_yaml::to_string(&policy).unwrap();
        let parsed: TrustPolicy = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(
            parsed.thresholds.trusted_floor,
            policy.thresholds.trusted_floor
        );
        assert_eq!(parsed.vdf.difficulty, policy.vdf.difficulty);
    }

    #[test]
    fn test_store_reload_swaps_snapshot() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let mut policy = TrustPolicy::default();
        policy.vdf.difficulty = 64;
        write!(file, "{}", serde_yaml::to_string(&policy).unwrap()).unwrap();

        let store = PolicyStore::new(TrustPolicy::default());
        assert_eq!(store.current().vdf.difficulty, 1000);

        store.reload(file.path()).unwrap();
        assert_eq!(store.current().vdf.difficulty, 64);
    }

    #[test]
    fn test_store_reload_keeps_old_on_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not: [valid").unwrap();

        let store = PolicyStore::new(TrustPolicy::default());
        assert!(store.reload(file.path()).is_err());
        assert_eq!(store.current().vdf.difficulty, 1000);
    }

    #[test]
    fn test_nonce_retention_derived() {
        let policy = TrustPolicy::default();
        assert_eq!(policy.nonce_retention(), 600);
    }
}
