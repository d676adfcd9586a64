//! # Tollgate RPC - HTTP API Server
//!
//! The HTTP surface of the toll backend:
//!
//! - **Ingest**: `POST /toll` for reader-submitted events; allow/block are
//!   200s, rejections map to the status codes below.
//! - **Time**: `GET /time` returns plain-text epoch seconds so readers can
//!   bound their clock drift.
//! - **Admin**: key-protected operations (register/rotate readers, trust
//!   resets, quarantine, nonce clearing, genesis reseed, anchor retry,
//!   policy reload). The `X-API-Key` header is compared in constant time.
//! - **Telemetry**: read-only views over readers, decisions, the chain
//!   audit and aggregate stats.
//!
//! Rejection status mapping: 401 crypto/unknown-reader failures, 409
//! replay, 423 suspended reader, 429 rate-limited, 408 timestamp drift,
//! 400 malformed payloads, 503 degraded service.
//!
//! The node side implements [`TollApi`]; this crate owns routing,
//! serialization and error mapping only.

pub mod types;

pub use types::*;

use async_trait::async_trait;
use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tollgate_chain::{Anchor, ChainVerdict};
use tollgate_common::error::{RejectCode, TollError, TollResult};
use tollgate_common::types::Timestamp;
use tollgate_state::DecisionRecord;

/// The node-side API consumed by the HTTP layer.
#[async_trait]
pub trait TollApi: Send + Sync + 'static {
    /// Process one inbound toll event end to end.
    async fn ingest(&self, event: TollEventRequest) -> TollResult<IngestResponse>;

    /// Server wall clock, seconds since epoch.
    fn server_time(&self) -> Timestamp;

    /// Constant-time admin key check.
    fn check_admin_key(&self, provided: &str) -> bool;

    async fn register_reader(&self, reader_id: String) -> TollResult<RegisterReaderResponse>;
    async fn rotate_reader_secret(&self, reader_id: String) -> TollResult<RotateSecretResponse>;
    async fn reset_trust(&self, reader_id: String, score: f64) -> TollResult<ReaderView>;
    async fn force_quarantine(&self, reader_id: String, reason: String) -> TollResult<()>;
    async fn cast_peer_vote(&self, request: PeerVoteRequest) -> TollResult<PeerVoteResponse>;
    async fn respond_challenge(
        &self,
        request: ChallengeResponseRequest,
    ) -> TollResult<ChallengeResponseResponse>;
    async fn whitelist_tag(&self, tag_hash: String) -> TollResult<()>;
    async fn clear_nonces(&self, before: Timestamp) -> TollResult<ClearNoncesResponse>;
    async fn reseed_genesis(&self, seed: String) -> TollResult<()>;
    async fn reload_policy(&self) -> TollResult<()>;
    async fn verify_chain(&self) -> TollResult<ChainVerdict>;
    async fn pending_anchors(&self) -> TollResult<Vec<Anchor>>;
    async fn retry_anchor(&self, id: u64) -> TollResult<Anchor>;

    async fn readers(&self) -> TollResult<Vec<ReaderView>>;
    async fn decisions(&self, limit: usize) -> TollResult<Vec<DecisionRecord>>;
    async fn audit(&self) -> TollResult<AuditReport>;
    async fn stats_summary(&self) -> TollResult<StatsSummary>;
    async fn system_status(&self) -> TollResult<SystemStatus>;
}

/// HTTP status for one rejection code.
fn reject_status(code: RejectCode) -> StatusCode {
    match code {
        RejectCode::UnknownReader | RejectCode::BadKeyVersion | RejectCode::BadSignature => {
            StatusCode::UNAUTHORIZED
        }
        RejectCode::Replay => StatusCode::CONFLICT,
        RejectCode::StaleTimestamp => StatusCode::REQUEST_TIMEOUT,
        RejectCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        RejectCode::ReaderSuspended => StatusCode::LOCKED,
    }
}

/// Map a domain error onto an HTTP response.
pub fn error_response(err: TollError) -> Response {
    let (status, body) = match err {
        TollError::Rejected { code, detail } => (
            reject_status(code),
            RejectionBody {
                error: code.as_str().to_string(),
                detail,
            },
        ),
        TollError::Unauthorized => (
            StatusCode::UNAUTHORIZED,
            RejectionBody {
                error: "UNAUTHORIZED".to_string(),
                detail: "missing or invalid API key".to_string(),
            },
        ),
        TollError::Validation(detail) => (
            StatusCode::BAD_REQUEST,
            RejectionBody {
                error: "MALFORMED".to_string(),
                detail,
            },
        ),
        TollError::Fatal(detail) => (
            StatusCode::SERVICE_UNAVAILABLE,
            RejectionBody {
                error: "SERVICE_DEGRADED".to_string(),
                detail,
            },
        ),
        TollError::Transient(detail) | TollError::Deadline(detail) => (
            StatusCode::SERVICE_UNAVAILABLE,
            RejectionBody {
                error: "TEMPORARILY_UNAVAILABLE".to_string(),
                detail,
            },
        ),
        other => (
            StatusCode::INTERNAL_SERVER_ERROR,
            RejectionBody {
                error: "INTERNAL".to_string(),
                detail: other.to_string(),
            },
        ),
    };
    (status, Json(body)).into_response()
}

type Api = Arc<dyn TollApi>;

fn require_admin(api: &Api, headers: &HeaderMap) -> TollResult<()> {
    let provided = headers
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if api.check_admin_key(provided) {
        Ok(())
    } else {
        Err(TollError::Unauthorized)
    }
}

macro_rules! respond {
    ($result:expr) => {
        match $result {
            Ok(value) => Json(value).into_response(),
            Err(err) => error_response(err),
        }
    };
}

async fn ingest(State(api): State<Api>, Json(event): Json<TollEventRequest>) -> Response {
    respond!(api.ingest(event).await)
}

async fn time(State(api): State<Api>) -> String {
    api.server_time().to_string()
}

async fn register_reader(
    State(api): State<Api>,
    headers: HeaderMap,
    Json(request): Json<RegisterReaderRequest>,
) -> Response {
    if let Err(err) = require_admin(&api, &headers) {
        return error_response(err);
    }
    respond!(api.register_reader(request.reader_id).await)
}

async fn rotate_reader(
    State(api): State<Api>,
    headers: HeaderMap,
    Json(request): Json<RotateSecretRequest>,
) -> Response {
    if let Err(err) = require_admin(&api, &headers) {
        return error_response(err);
    }
    respond!(api.rotate_reader_secret(request.reader_id).await)
}

async fn reset_trust(
    State(api): State<Api>,
    headers: HeaderMap,
    Json(request): Json<ResetTrustRequest>,
) -> Response {
    if let Err(err) = require_admin(&api, &headers) {
        return error_response(err);
    }
    respond!(api.reset_trust(request.reader_id, request.score).await)
}

async fn force_quarantine(
    State(api): State<Api>,
    headers: HeaderMap,
    Json(request): Json<ForceQuarantineRequest>,
) -> Response {
    if let Err(err) = require_admin(&api, &headers) {
        return error_response(err);
    }
    respond!(api.force_quarantine(request.reader_id, request.reason).await)
}

async fn peer_vote(
    State(api): State<Api>,
    headers: HeaderMap,
    Json(request): Json<PeerVoteRequest>,
) -> Response {
    if let Err(err) = require_admin(&api, &headers) {
        return error_response(err);
    }
    respond!(api.cast_peer_vote(request).await)
}

async fn respond_challenge(
    State(api): State<Api>,
    headers: HeaderMap,
    Json(request): Json<ChallengeResponseRequest>,
) -> Response {
    if let Err(err) = require_admin(&api, &headers) {
        return error_response(err);
    }
    respond!(api.respond_challenge(request).await)
}

async fn whitelist_tag(
    State(api): State<Api>,
    headers: HeaderMap,
    Json(request): Json<WhitelistTagRequest>,
) -> Response {
    if let Err(err) = require_admin(&api, &headers) {
        return error_response(err);
    }
    respond!(api.whitelist_tag(request.tag_hash).await)
}

async fn clear_nonces(
    State(api): State<Api>,
    headers: HeaderMap,
    Json(request): Json<ClearNoncesRequest>,
) -> Response {
    if let Err(err) = require_admin(&api, &headers) {
        return error_response(err);
    }
    respond!(api.clear_nonces(request.before).await)
}

async fn reseed_genesis(
    State(api): State<Api>,
    headers: HeaderMap,
    Json(request): Json<ReseedGenesisRequest>,
) -> Response {
    if let Err(err) = require_admin(&api, &headers) {
        return error_response(err);
    }
    respond!(api.reseed_genesis(request.seed).await)
}

async fn reload_policy(State(api): State<Api>, headers: HeaderMap) -> Response {
    if let Err(err) = require_admin(&api, &headers) {
        return error_response(err);
    }
    respond!(api.reload_policy().await)
}

async fn verify_chain(State(api): State<Api>, headers: HeaderMap) -> Response {
    if let Err(err) = require_admin(&api, &headers) {
        return error_response(err);
    }
    respond!(api.verify_chain().await)
}

async fn pending_anchors(State(api): State<Api>, headers: HeaderMap) -> Response {
    if let Err(err) = require_admin(&api, &headers) {
        return error_response(err);
    }
    respond!(api.pending_anchors().await)
}

async fn retry_anchor(
    State(api): State<Api>,
    headers: HeaderMap,
    Json(request): Json<RetryAnchorRequest>,
) -> Response {
    if let Err(err) = require_admin(&api, &headers) {
        return error_response(err);
    }
    respond!(api.retry_anchor(request.id).await)
}

async fn readers(State(api): State<Api>) -> Response {
    respond!(api.readers().await)
}

async fn decisions(State(api): State<Api>, Query(params): Query<HashMap<String, String>>) -> Response {
    let limit = params
        .get("limit")
        .and_then(|l| l.parse().ok())
        .unwrap_or(100);
    respond!(api.decisions(limit).await)
}

async fn audit(State(api): State<Api>) -> Response {
    respond!(api.audit().await)
}

async fn stats_summary(State(api): State<Api>) -> Response {
    respond!(api.stats_summary().await)
}

async fn system_status(State(api): State<Api>) -> Response {
    respond!(api.system_status().await)
}

/// Build the full router over an API implementation.
pub fn router(api: Api) -> Router {
    Router::new()
        // Reader-facing
        .route("/toll", post(ingest))
        .route("/time", get(time))
        // Admin (X-API-Key)
        .route("/reader/register", post(register_reader))
        .route("/reader/rotate", post(rotate_reader))
        .route("/reader/trust/reset", post(reset_trust))
        .route("/reader/force_quarantine", post(force_quarantine))
        .route("/peer_vote", post(peer_vote))
        .route("/challenge/respond", post(respond_challenge))
        .route("/tag/whitelist", post(whitelist_tag))
        .route("/nonces/clear", post(clear_nonces))
        .route("/vdf/reseed", post(reseed_genesis))
        .route("/vdf/verify", get(verify_chain))
        .route("/anchor/pending", get(pending_anchors))
        .route("/anchor/retry", post(retry_anchor))
        .route("/policy/reload", post(reload_policy))
        // Telemetry (read-only)
        .route("/readers", get(readers))
        .route("/decisions", get(decisions))
        .route("/blockchain/audit", get(audit))
        .route("/stats/summary", get(stats_summary))
        .route("/system/status", get(system_status))
        .with_state(api)
}

/// Configuration for the HTTP server.
pub struct RpcConfig {
    /// Socket address to bind the server to (IP:port)
    pub listen_addr: SocketAddr,
}

/// Start the HTTP server and serve until the listener fails.
pub async fn start_server(config: RpcConfig, api: Api) -> TollResult<()> {
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .map_err(|e| TollError::internal(format!("failed to bind {}: {}", config.listen_addr, e)))?;

    let addr = listener
        .local_addr()
        .map_err(|e| TollError::internal(format!("failed to get local address: {}", e)))?;
    tracing::info!("RPC server listening on {}", addr);

    axum::serve(listener, router(api))
        .await
        .map_err(|e| TollError::internal(format!("server error: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    struct StubApi;

    #[async_trait]
    impl TollApi for StubApi {
        async fn ingest(&self, event: TollEventRequest) -> TollResult<IngestResponse> {
            if event.reader_id == "missing" {
                return Err(TollError::rejected(
                    RejectCode::UnknownReader,
                    "no such reader",
                ));
            }
            if event.nonce == "dup" {
                return Err(TollError::rejected(RejectCode::Replay, "nonce replayed"));
            }
            Ok(IngestResponse {
                decision: "allow".to_string(),
                reason_codes: vec![],
                trust_score: 100,
                event_id: "e1".to_string(),
                vdf_seq: Some(1),
            })
        }

        fn server_time(&self) -> Timestamp {
            1_700_000_000
        }

        fn check_admin_key(&self, provided: &str) -> bool {
            provided == "secret-key"
        }

        async fn register_reader(&self, reader_id: String) -> TollResult<RegisterReaderResponse> {
            Ok(RegisterReaderResponse {
                reader_id,
                secret: "ab".repeat(32),
                key_version: 1,
            })
        }

        async fn rotate_reader_secret(
            &self,
            reader_id: String,
        ) -> TollResult<RotateSecretResponse> {
            Ok(RotateSecretResponse {
                reader_id,
                secret: "cd".repeat(32),
                new_key_version: 2,
            })
        }

        async fn reset_trust(&self, _: String, _: f64) -> TollResult<ReaderView> {
            Err(TollError::validation("unused"))
        }
        async fn force_quarantine(&self, _: String, _: String) -> TollResult<()> {
            Ok(())
        }
        async fn cast_peer_vote(&self, _: PeerVoteRequest) -> TollResult<PeerVoteResponse> {
            Err(TollError::validation("unused"))
        }
        async fn respond_challenge(
            &self,
            _: ChallengeResponseRequest,
        ) -> TollResult<ChallengeResponseResponse> {
            Err(TollError::validation("unused"))
        }
        async fn whitelist_tag(&self, _: String) -> TollResult<()> {
            Ok(())
        }
        async fn clear_nonces(&self, _: Timestamp) -> TollResult<ClearNoncesResponse> {
            Ok(ClearNoncesResponse { removed: 0 })
        }
        async fn reseed_genesis(&self, _: String) -> TollResult<()> {
            Ok(())
        }
        async fn reload_policy(&self) -> TollResult<()> {
            Ok(())
        }
        async fn verify_chain(&self) -> TollResult<ChainVerdict> {
            Err(TollError::validation("unused"))
        }
        async fn pending_anchors(&self) -> TollResult<Vec<Anchor>> {
            Ok(vec![])
        }
        async fn retry_anchor(&self, _: u64) -> TollResult<Anchor> {
            Err(TollError::validation("unknown anchor"))
        }
        async fn readers(&self) -> TollResult<Vec<ReaderView>> {
            Ok(vec![])
        }
        async fn decisions(&self, _: usize) -> TollResult<Vec<DecisionRecord>> {
            Ok(vec![])
        }
        async fn audit(&self) -> TollResult<AuditReport> {
            Err(TollError::validation("unused"))
        }
        async fn stats_summary(&self) -> TollResult<StatsSummary> {
            Err(TollError::validation("unused"))
        }
        async fn system_status(&self) -> TollResult<SystemStatus> {
            Ok(SystemStatus {
                version: "test".to_string(),
                ingest_enabled: true,
                chain_head: 0,
                server_time: 1_700_000_000,
            })
        }
    }

    fn event_body(reader_id: &str, nonce: &str) -> String {
        serde_json::json!({
            "tag_hash": "ab".repeat(32),
            "reader_id": reader_id,
            "timestamp": 1_700_000_000u64,
            "nonce": nonce,
            "signature": "00".repeat(32),
            "key_version": 1
        })
        .to_string()
    }

    async fn send(router: Router, request: Request<Body>) -> (StatusCode, String) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8_lossy(&bytes).to_string())
    }

    #[tokio::test]
    async fn test_ingest_allow_is_200() {
        let app = router(Arc::new(StubApi));
        let request = Request::post("/toll")
            .header("content-type", "application/json")
            .body(Body::from(event_body("r1", "n1")))
            .unwrap();

        let (status, body) = send(app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("\"decision\":\"allow\""));
    }

    #[tokio::test]
    async fn test_unknown_reader_is_401_and_replay_is_409() {
        let app = router(Arc::new(StubApi));
        let request = Request::post("/toll")
            .header("content-type", "application/json")
            .body(Body::from(event_body("missing", "n1")))
            .unwrap();
        let (status, body) = send(app, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.contains("UNKNOWN_READER"));

        let app = router(Arc::new(StubApi));
        let request = Request::post("/toll")
            .header("content-type", "application/json")
            .body(Body::from(event_body("r1", "dup")))
            .unwrap();
        let (status, body) = send(app, request).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body.contains("REPLAY"));
    }

    #[tokio::test]
    async fn test_time_is_plain_text() {
        let app = router(Arc::new(StubApi));
        let request = Request::get("/time").body(Body::empty()).unwrap();
        let (status, body) = send(app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "1700000000");
    }

    #[tokio::test]
    async fn test_admin_requires_key() {
        let app = router(Arc::new(StubApi));
        let body = serde_json::json!({"reader_id": "lane-1"}).to_string();

        let request = Request::post("/reader/register")
            .header("content-type", "application/json")
            .body(Body::from(body.clone()))
            .unwrap();
        let (status, _) = send(app, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let app = router(Arc::new(StubApi));
        let request = Request::post("/reader/register")
            .header("content-type", "application/json")
            .header("X-API-Key", "secret-key")
            .body(Body::from(body))
            .unwrap();
        let (status, body) = send(app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("\"key_version\":1"));
    }

    #[test]
    fn test_reject_status_mapping() {
        assert_eq!(reject_status(RejectCode::UnknownReader), StatusCode::UNAUTHORIZED);
        assert_eq!(reject_status(RejectCode::BadKeyVersion), StatusCode::UNAUTHORIZED);
        assert_eq!(reject_status(RejectCode::BadSignature), StatusCode::UNAUTHORIZED);
        assert_eq!(reject_status(RejectCode::Replay), StatusCode::CONFLICT);
        assert_eq!(reject_status(RejectCode::StaleTimestamp), StatusCode::REQUEST_TIMEOUT);
        assert_eq!(reject_status(RejectCode::RateLimited), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(reject_status(RejectCode::ReaderSuspended), StatusCode::LOCKED);
    }

    #[test]
    fn test_canonical_message_is_concatenation() {
        let event = TollEventRequest {
            tag_hash: "aabb".to_string(),
            reader_id: "r1".to_string(),
            timestamp: 1700000000,
            nonce: "n1".to_string(),
            signature: String::new(),
            key_version: 1,
        };
        assert_eq!(event.canonical_message(), b"aabbr11700000000n1".to_vec());
    }
}
