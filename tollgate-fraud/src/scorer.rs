//! ML scoring layer: two opaque scorers plus an isolation flag.
//!
//! Scorers are external collaborators with contract
//! `score(features) -> f64 in [0, 1]`; unavailability yields `None` which
//! participates as neutral in fusion. Three implementations exist (real,
//! mocked, null), selected by policy.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tollgate_common::error::{TollError, TollResult};
use tollgate_policy::{ScorerKind, TrustPolicy};

/// Feature vector handed to the scorers for one event.
#[derive(Debug, Clone)]
pub struct FeatureVector {
    /// Amount relative to the absolute ceiling
    pub amount_ratio: f64,
    /// Reader trust score scaled to [0, 1]
    pub trust_ratio: f64,
    /// Reader event count in the cross window, scaled by peer mean
    pub volume_ratio: f64,
    /// 1.0 when the same tag was scanned within the duplicate window
    pub recent_duplicate: f64,
    /// 1.0 when the tag is currently suspect
    pub suspect_tag: f64,
}

impl FeatureVector {
    /// Flatten into the ordered slice the model files are trained against.
    pub fn as_slice(&self) -> [f64; 5] {
        [
            self.amount_ratio,
            self.trust_ratio,
            self.volume_ratio,
            self.recent_duplicate,
            self.suspect_tag,
        ]
    }
}

/// One opaque scoring function.
#[async_trait]
pub trait MlScorer: Send + Sync {
    /// Score an event; higher means more likely fraudulent.
    async fn score(&self, features: &FeatureVector) -> TollResult<f64>;

    /// Implementation name for logs and telemetry.
    fn name(&self) -> &'static str;
}

/// Always-unavailable scorer; fusion sees a neutral score.
pub struct NullScorer;

#[async_trait]
impl MlScorer for NullScorer {
    async fn score(&self, _features: &FeatureVector) -> TollResult<f64> {
        Err(TollError::transient("no scorer configured"))
    }

    fn name(&self) -> &'static str {
        "null"
    }
}

/// Fixed-score scorer for tests and staging.
pub struct MockScorer {
    score: f64,
}

impl MockScorer {
    pub fn new(score: f64) -> Self {
        Self { score }
    }
}

#[async_trait]
impl MlScorer for MockScorer {
    async fn score(&self, _features: &FeatureVector) -> TollResult<f64> {
        Ok(self.score.clamp(0.0, 1.0))
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Weight file layout for [`FileScorer`].
#[derive(Debug, Deserialize)]
struct ModelWeights {
    weights: Vec<f64>,
    bias: f64,
}

/// File-backed logistic model: `sigmoid(w . x + b)`.
pub struct FileScorer {
    weights: Vec<f64>,
    bias: f64,
}

impl FileScorer {
    /// Load weights from a JSON model file.
    pub fn load(path: impl AsRef<Path>) -> TollResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let model: ModelWeights = serde_json::from_str(&raw)
            .map_err(|e| TollError::config(format!("bad model file: {}", e)))?;
        Ok(Self {
            weights: model.weights,
            bias: model.bias,
        })
    }
}

#[async_trait]
impl MlScorer for FileScorer {
    async fn score(&self, features: &FeatureVector) -> TollResult<f64> {
        let x = features.as_slice();
        if self.weights.len() != x.len() {
            return Err(TollError::config(format!(
                "model expects {} features, got {}",
                self.weights.len(),
                x.len()
            )));
        }

        let z: f64 = self
            .weights
            .iter()
            .zip(x.iter())
            .map(|(w, v)| w * v)
            .sum::<f64>()
            + self.bias;
        Ok(1.0 / (1.0 + (-z).exp()))
    }

    fn name(&self) -> &'static str {
        "logistic"
    }
}

/// Isolation flagger: marks events whose features sit outside the
/// envelope observed during training.
pub enum IsolationModel {
    /// Any feature outside `mean +- tolerance` flags the event
    Envelope { means: Vec<f64>, tolerance: f64 },
    /// Fixed flag, for tests
    Fixed(bool),
    /// Never flags
    Null,
}

impl IsolationModel {
    pub fn flag(&self, features: &FeatureVector) -> bool {
        match self {
            IsolationModel::Envelope { means, tolerance } => features
                .as_slice()
                .iter()
                .zip(means.iter())
                .any(|(v, m)| (v - m).abs() > *tolerance),
            IsolationModel::Fixed(flag) => *flag,
            IsolationModel::Null => false,
        }
    }
}

/// The scorer pair plus isolation flagger chosen by policy.
pub struct MlEngine {
    scorer_a: Box<dyn MlScorer>,
    scorer_b: Box<dyn MlScorer>,
    isolation: IsolationModel,
    deadline: Duration,
}

impl MlEngine {
    /// Build the engine from the policy's scorer selection.
    pub fn from_policy(policy: &TrustPolicy) -> TollResult<Self> {
        let (scorer_a, scorer_b): (Box<dyn MlScorer>, Box<dyn MlScorer>) =
            match policy.fraud.scorer {
                ScorerKind::Null => (Box::new(NullScorer), Box::new(NullScorer)),
                ScorerKind::Mock => (
                    Box::new(MockScorer::new(policy.fraud.mock_scores.0)),
                    Box::new(MockScorer::new(policy.fraud.mock_scores.1)),
                ),
                ScorerKind::Real => {
                    let a = policy.fraud.model_a_path.as_deref().ok_or_else(|| {
                        TollError::config("scorer = real requires model_a_path")
                    })?;
                    let b = policy.fraud.model_b_path.as_deref().ok_or_else(|| {
                        TollError::config("scorer = real requires model_b_path")
                    })?;
                    (Box::new(FileScorer::load(a)?), Box::new(FileScorer::load(b)?))
                }
            };

        let isolation = match policy.fraud.scorer {
            ScorerKind::Null => IsolationModel::Null,
            ScorerKind::Mock => IsolationModel::Fixed(false),
            ScorerKind::Real => IsolationModel::Envelope {
                means: vec![0.2, 0.9, 1.0, 0.0, 0.0],
                tolerance: 2.0,
            },
        };

        Ok(Self {
            scorer_a,
            scorer_b,
            isolation,
            deadline: Duration::from_millis(policy.deadlines.ml_deadline_ms),
        })
    }

    /// Test/staging constructor with explicit parts.
    pub fn with_parts(
        scorer_a: Box<dyn MlScorer>,
        scorer_b: Box<dyn MlScorer>,
        isolation: IsolationModel,
        deadline: Duration,
    ) -> Self {
        Self {
            scorer_a,
            scorer_b,
            isolation,
            deadline,
        }
    }

    async fn score_one(&self, scorer: &dyn MlScorer, features: &FeatureVector) -> Option<f64> {
        match tokio::time::timeout(self.deadline, scorer.score(features)).await {
            Ok(Ok(score)) => Some(score.clamp(0.0, 1.0)),
            Ok(Err(err)) => {
                tracing::debug!(scorer = scorer.name(), %err, "scorer unavailable, degrading to neutral");
                None
            }
            Err(_) => {
                tracing::warn!(scorer = scorer.name(), "scorer deadline exceeded");
                None
            }
        }
    }

    /// Score an event with both models plus the isolation flag.
    pub async fn evaluate(&self, features: &FeatureVector) -> (Option<f64>, Option<f64>, bool) {
        let ml_a = self.score_one(self.scorer_a.as_ref(), features).await;
        let ml_b = self.score_one(self.scorer_b.as_ref(), features).await;
        let iso = self.isolation.flag(features);
        (ml_a, ml_b, iso)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn features() -> FeatureVector {
        FeatureVector {
            amount_ratio: 0.1,
            trust_ratio: 1.0,
            volume_ratio: 1.0,
            recent_duplicate: 0.0,
            suspect_tag: 0.0,
        }
    }

    #[tokio::test]
    async fn test_null_scorer_degrades_to_neutral() {
        let engine = MlEngine::with_parts(
            Box::new(NullScorer),
            Box::new(NullScorer),
            IsolationModel::Null,
            Duration::from_millis(50),
        );
        let (a, b, iso) = engine.evaluate(&features()).await;
        assert_eq!(a, None);
        assert_eq!(b, None);
        assert!(!iso);
    }

    #[tokio::test]
    async fn test_mock_scores_pass_through() {
        let engine = MlEngine::with_parts(
            Box::new(MockScorer::new(0.9)),
            Box::new(MockScorer::new(0.85)),
            IsolationModel::Fixed(true),
            Duration::from_millis(50),
        );
        let (a, b, iso) = engine.evaluate(&features()).await;
        assert_eq!(a, Some(0.9));
        assert_eq!(b, Some(0.85));
        assert!(iso);
    }

    #[tokio::test]
    async fn test_file_scorer_logistic() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"weights": [0.0, 0.0, 0.0, 0.0, 0.0], "bias": 0.0}}"#
        )
        .unwrap();

        let scorer = FileScorer::load(file.path()).unwrap();
        // Zero weights: sigmoid(0) = 0.5 regardless of input
        let score = scorer.score(&features()).await.unwrap();
        assert!((score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_envelope_isolation() {
        let iso = IsolationModel::Envelope {
            means: vec![0.0, 0.0, 0.0, 0.0, 0.0],
            tolerance: 0.5,
        };
        let mut f = features();
        assert!(iso.flag(&f)); // trust_ratio 1.0 is outside 0 +- 0.5
        f.trust_ratio = 0.2;
        f.volume_ratio = 0.2;
        assert!(!iso.flag(&f));
    }
}
