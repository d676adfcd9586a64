//! Ingest verification: authenticates one inbound toll event.
//!
//! The checks run in a fixed order, each terminating on failure:
//! reader lookup, key version, HMAC signature (constant time), timestamp
//! freshness, nonce uniqueness, rate limit, reader status. Failures that
//! are attributable to the reader are reported to the trust engine before
//! the rejection is returned. The nonce is committed only on full
//! acceptance; until then the only observable side effects of a failure
//! are the rate-limiter token and the trust penalty.

use crate::ratelimit::RateLimiter;
use std::sync::Arc;
use tollgate_common::{
    crypto::CryptoUtils,
    error::{RejectCode, TollError, TollResult},
    types::Timestamp,
    validation::ValidationUtils,
};
use tollgate_policy::TrustPolicy;
use tollgate_rpc::TollEventRequest;
use tollgate_state::{Reader, TollState};
use tollgate_trust::TrustEngine;

pub struct IngestVerifier {
    state: Arc<TollState>,
    trust: Arc<TrustEngine>,
    limiter: Arc<RateLimiter>,
}

impl IngestVerifier {
    pub fn new(state: Arc<TollState>, trust: Arc<TrustEngine>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            state,
            trust,
            limiter,
        }
    }

    /// Shape validation before any store access; failures are 400s, not
    /// rejections.
    pub fn validate_shape(event: &TollEventRequest) -> TollResult<()> {
        ValidationUtils::validate_reader_id(&event.reader_id)?;
        ValidationUtils::validate_tag_hash(&event.tag_hash)?;
        ValidationUtils::validate_nonce(&event.nonce)?;
        ValidationUtils::parse_signature_hex(&event.signature)?;
        ValidationUtils::validate_timestamp(event.timestamp)?;
        Ok(())
    }

    async fn reject(
        &self,
        event: &TollEventRequest,
        code: RejectCode,
        detail: String,
        now: Timestamp,
    ) -> TollError {
        if let Some(class) = code.violation() {
            if let Err(err) = self
                .trust
                .record_violation(&event.reader_id, class, 1.0, now)
                .await
            {
                tracing::error!(%err, reader_id = %event.reader_id, "failed to record violation");
            }
        }
        TollError::Rejected { code, detail }
    }

    /// Run the verification sequence. The caller holds the reader's
    /// critical section. On success the nonce is committed and the
    /// reader snapshot (pre-decision) is returned.
    pub async fn verify(
        &self,
        event: &TollEventRequest,
        policy: &TrustPolicy,
        now: Timestamp,
    ) -> TollResult<Reader> {
        // 1. Reader lookup; unattributable, no penalty
        let Some(reader) = self.state.readers.get(&event.reader_id).await? else {
            return Err(TollError::rejected(
                RejectCode::UnknownReader,
                format!("reader {} is not registered", event.reader_id),
            ));
        };

        // 2. Superseded key version
        if event.key_version < reader.key_version {
            return Err(self
                .reject(
                    event,
                    RejectCode::BadKeyVersion,
                    format!(
                        "key version {} superseded by {}",
                        event.key_version, reader.key_version
                    ),
                    now,
                )
                .await);
        }

        // 3. HMAC over the canonical message, constant-time compare
        let signature = ValidationUtils::parse_signature_hex(&event.signature)?;
        if !CryptoUtils::hmac_verify(&reader.secret, &event.canonical_message(), &signature) {
            return Err(self
                .reject(
                    event,
                    RejectCode::BadSignature,
                    "signature verification failed".to_string(),
                    now,
                )
                .await);
        }

        // 4. Timestamp freshness; exactly max_drift old is still fresh
        let drift = now.abs_diff(event.timestamp);
        if drift > policy.timing.max_timestamp_drift {
            return Err(self
                .reject(
                    event,
                    RejectCode::StaleTimestamp,
                    format!(
                        "timestamp drift {}s exceeds {}s",
                        drift, policy.timing.max_timestamp_drift
                    ),
                    now,
                )
                .await);
        }

        // 5. Nonce uniqueness
        if self.state.nonces.seen(&event.reader_id, &event.nonce).await? {
            return Err(self
                .reject(
                    event,
                    RejectCode::Replay,
                    format!("nonce {} was already observed", event.nonce),
                    now,
                )
                .await);
        }

        // 6. Rate limit; the token is consumed either way
        if !self.limiter.try_acquire(
            &event.reader_id,
            now,
            policy.rate.rate_per_sec,
            policy.rate.burst,
        ) {
            return Err(self
                .reject(
                    event,
                    RejectCode::RateLimited,
                    "per-reader rate limit exhausted".to_string(),
                    now,
                )
                .await);
        }

        // 7. Enforcement status gate
        if !reader.status.is_serving() {
            return Err(TollError::rejected(
                RejectCode::ReaderSuspended,
                format!("reader is {}", reader.status.as_str()),
            ));
        }

        // 8. Full acceptance: commit the nonce
        self.state
            .nonces
            .record(&event.reader_id, &event.nonce, now)
            .await?;

        Ok(reader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tollgate_policy::PolicyStore;
    use tollgate_state::ReaderStatus;

    struct Fixture {
        _dir: tempfile::TempDir,
        state: Arc<TollState>,
        trust: Arc<TrustEngine>,
        verifier: IngestVerifier,
        policy: TrustPolicy,
    }

    async fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let state = Arc::new(
            TollState::open(dir.path().join("db").to_str().unwrap())
                .await
                .unwrap(),
        );
        let policy = TrustPolicy::default();
        let store = Arc::new(PolicyStore::new(policy.clone()));
        let trust = Arc::new(TrustEngine::new(state.clone(), store));
        let verifier = IngestVerifier::new(state.clone(), trust.clone(), Arc::new(RateLimiter::new()));
        Fixture {
            _dir: dir,
            state,
            trust,
            verifier,
            policy,
        }
    }

    fn signed_event(reader: &Reader, tag: &str, ts: u64, nonce: &str) -> TollEventRequest {
        let mut event = TollEventRequest {
            tag_hash: tag.to_string(),
            reader_id: reader.reader_id.clone(),
            timestamp: ts,
            nonce: nonce.to_string(),
            signature: String::new(),
            key_version: reader.key_version,
        };
        let sig = CryptoUtils::hmac_sign(&reader.secret, &event.canonical_message());
        event.signature = hex::encode(sig);
        event
    }

    async fn register(fixture: &Fixture, id: &str, now: u64) -> Reader {
        let reader = Reader::register(id.to_string(), now);
        fixture.state.readers.put(&reader).await.unwrap();
        reader
    }

    #[tokio::test]
    async fn test_valid_event_accepted_and_nonce_committed() {
        let fixture = fixture().await;
        let now = 1_700_000_000;
        let reader = register(&fixture, "r1", now).await;
        let event = signed_event(&reader, &"ab".repeat(32), now, "n1");

        let _guard = fixture.trust.lock_reader("r1").await;
        let accepted = fixture
            .verifier
            .verify(&event, &fixture.policy, now)
            .await
            .unwrap();
        assert_eq!(accepted.reader_id, "r1");
        assert!(fixture.state.nonces.seen("r1", "n1").await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_reader() {
        let fixture = fixture().await;
        let now = 1_700_000_000;
        let ghost = Reader::register("ghost".to_string(), now);
        let event = signed_event(&ghost, &"ab".repeat(32), now, "n1");

        let err = fixture
            .verifier
            .verify(&event, &fixture.policy, now)
            .await
            .unwrap_err();
        assert!(
            matches!(err, TollError::Rejected { code: RejectCode::UnknownReader, .. })
        );
    }

    #[tokio::test]
    async fn test_bad_signature_penalizes() {
        let fixture = fixture().await;
        let now = 1_700_000_000;
        let reader = register(&fixture, "r1", now).await;
        let mut event = signed_event(&reader, &"ab".repeat(32), now, "n1");
        event.signature = "00".repeat(32);

        let _guard = fixture.trust.lock_reader("r1").await;
        let err = fixture
            .verifier
            .verify(&event, &fixture.policy, now)
            .await
            .unwrap_err();
        assert!(
            matches!(err, TollError::Rejected { code: RejectCode::BadSignature, .. })
        );

        // The trust penalty is the only persistent effect
        let reader = fixture.state.readers.get("r1").await.unwrap().unwrap();
        assert_eq!(reader.trust_score, 60.0);
        assert_eq!(reader.counters.auth_failures, 1);
        assert!(!fixture.state.nonces.seen("r1", "n1").await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_key_version() {
        let fixture = fixture().await;
        let now = 1_700_000_000;
        let mut reader = register(&fixture, "r1", now).await;
        let event = signed_event(&reader, &"ab".repeat(32), now, "n1");

        // Rotate after the event was built
        reader.rotate_secret();
        fixture.state.readers.put(&reader).await.unwrap();

        let _guard = fixture.trust.lock_reader("r1").await;
        let err = fixture
            .verifier
            .verify(&event, &fixture.policy, now)
            .await
            .unwrap_err();
        assert!(
            matches!(err, TollError::Rejected { code: RejectCode::BadKeyVersion, .. })
        );
    }

    #[tokio::test]
    async fn test_drift_boundary() {
        let fixture = fixture().await;
        let now = 1_700_000_000;
        let reader = register(&fixture, "r1", now).await;

        // Exactly max_drift old: accepted
        let event = signed_event(&reader, &"ab".repeat(32), now - 300, "edge");
        let _guard = fixture.trust.lock_reader("r1").await;
        assert!(fixture
            .verifier
            .verify(&event, &fixture.policy, now)
            .await
            .is_ok());

        // One second beyond: stale
        let event = signed_event(&reader, &"ab".repeat(32), now - 301, "past");
        let err = fixture
            .verifier
            .verify(&event, &fixture.policy, now)
            .await
            .unwrap_err();
        assert!(
            matches!(err, TollError::Rejected { code: RejectCode::StaleTimestamp, .. })
        );
    }

    #[tokio::test]
    async fn test_replay_detected() {
        let fixture = fixture().await;
        let now = 1_700_000_000;
        let reader = register(&fixture, "r1", now).await;
        let event = signed_event(&reader, &"ab".repeat(32), now, "n1");

        let _guard = fixture.trust.lock_reader("r1").await;
        fixture
            .verifier
            .verify(&event, &fixture.policy, now)
            .await
            .unwrap();

        let err = fixture
            .verifier
            .verify(&event, &fixture.policy, now)
            .await
            .unwrap_err();
        assert!(matches!(err, TollError::Rejected { code: RejectCode::Replay, .. }));

        let reader = fixture.state.readers.get("r1").await.unwrap().unwrap();
        assert_eq!(reader.counters.replay_attempts, 1);
    }

    #[tokio::test]
    async fn test_rate_limit() {
        let fixture = fixture().await;
        let now = 1_700_000_000;
        let reader = register(&fixture, "r1", now).await;

        let _guard = fixture.trust.lock_reader("r1").await;
        // Burst of 10 passes, the 11th is limited
        for i in 0..10 {
            let event = signed_event(&reader, &"ab".repeat(32), now, &format!("n{}", i));
            fixture
                .verifier
                .verify(&event, &fixture.policy, now)
                .await
                .unwrap();
        }

        let event = signed_event(&reader, &"ab".repeat(32), now, "n10");
        let err = fixture
            .verifier
            .verify(&event, &fixture.policy, now)
            .await
            .unwrap_err();
        assert!(matches!(err, TollError::Rejected { code: RejectCode::RateLimited, .. }));
    }

    #[tokio::test]
    async fn test_suspended_reader_refused() {
        let fixture = fixture().await;
        let now = 1_700_000_000;
        let mut reader = register(&fixture, "r1", now).await;
        reader.status = ReaderStatus::Quarantined;
        fixture.state.readers.put(&reader).await.unwrap();

        let event = signed_event(&reader, &"ab".repeat(32), now, "n1");
        let _guard = fixture.trust.lock_reader("r1").await;
        let err = fixture
            .verifier
            .verify(&event, &fixture.policy, now)
            .await
            .unwrap_err();
        assert!(
            matches!(err, TollError::Rejected { code: RejectCode::ReaderSuspended, .. })
        );
        // No nonce is burned for a refused reader
        assert!(!fixture.state.nonces.seen("r1", "n1").await.unwrap());
    }

    #[test]
    fn test_shape_validation() {
        let event = TollEventRequest {
            tag_hash: "not-hex".to_string(),
            reader_id: "r1".to_string(),
            timestamp: 1_700_000_000,
            nonce: "n1".to_string(),
            signature: "00".repeat(32),
            key_version: 1,
        };
        assert!(IngestVerifier::validate_shape(&event).is_err());
    }
}
