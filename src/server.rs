//! BROski Rewards Server
//!
//! HTTP API for the IDE: feature gating, reward recording, totals,
//! leaderboard, quests and treasury status.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::auth::verify_admin_token;
use crate::chain::{ChainClient, NetworkInfo};
use crate::config::RewardsConfig;
use crate::disperser::TreasuryBalance;
use crate::error::Error;
use crate::gate::{AccessResult, FeatureAccessChecker};
use crate::leaderboard::{LeaderboardAggregator, LeaderboardEntry, Timeframe, DEFAULT_LIMIT};
use crate::ledger::RewardLedger;
use crate::payout::PayoutWorker;
use crate::quests::{QuestBoard, QuestStatus};
use crate::storage::{PayoutKey, PayoutState, PayoutStatus, RewardTotals};

pub struct AppState {
    pub access: Arc<FeatureAccessChecker>,
    pub ledger: Arc<RewardLedger>,
    pub leaderboard: LeaderboardAggregator,
    pub quests: QuestBoard,
    /// `None` when no token or treasury key is configured
    pub payouts: Option<Arc<PayoutWorker>>,
    pub chain: Option<ChainClient>,
    pub admin_token: Option<String>,
    pub started_at: std::time::Instant,
}

impl AppState {
    fn rules(&self) -> &RewardsConfig {
        self.ledger.rules()
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/web3/network", get(network_handler))
        .route("/api/access/batch", post(access_batch_handler))
        .route("/api/access/:feature", get(access_handler))
        .route("/api/deployments", post(deployment_handler))
        .route("/api/contributions", post(contribution_handler))
        .route("/api/rewards/leaderboard", get(leaderboard_handler))
        .route("/api/rewards/:address", get(rewards_handler))
        .route("/api/quests", get(quests_handler))
        .route("/api/quests/:id/claim", post(claim_handler))
        .route("/api/payouts/treasury", get(treasury_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// ERRORS
// ============================================================================

/// JSON error body: `{"error": <kind>, "message": <text>}`
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            Error::InvalidAddress(_)
            | Error::UnknownContributionType(_)
            | Error::QuestIncomplete { .. } => StatusCode::BAD_REQUEST,
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::AccessDenied { .. } => StatusCode::FORBIDDEN,
            Error::QuestNotFound(_) => StatusCode::NOT_FOUND,
            Error::QuestAlreadyClaimed(_) | Error::DuplicateDeployment { .. } => {
                StatusCode::CONFLICT
            }
            Error::TransferFailed(_) => StatusCode::BAD_GATEWAY,
            Error::ChainQueryFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        let body = serde_json::json!({
            "error": self.0.kind(),
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ============================================================================
// HEALTH & NETWORK
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub payouts_enabled: bool,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        payouts_enabled: state.payouts.is_some(),
    })
}

async fn network_handler(State(state): State<Arc<AppState>>) -> ApiResult<NetworkInfo> {
    let chain = state
        .chain
        .as_ref()
        .ok_or_else(|| Error::ChainQueryFailed("no RPC provider configured".to_string()))?;
    let info = chain
        .network_info()
        .await
        .map_err(|e| Error::ChainQueryFailed(e.to_string()))?;
    Ok(Json(info))
}

// ============================================================================
// ACCESS
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct AddressQuery {
    pub address: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BatchAccessRequest {
    pub address: String,
    pub features: Vec<String>,
}

fn required_address(query: &AddressQuery) -> Result<&str, Error> {
    query
        .address
        .as_deref()
        .ok_or_else(|| Error::InvalidAddress("missing address".to_string()))
}

async fn access_handler(
    State(state): State<Arc<AppState>>,
    Path(feature): Path<String>,
    Query(query): Query<AddressQuery>,
) -> ApiResult<AccessResult> {
    let address = required_address(&query)?;
    let result = state.access.check_access(&feature, address).await?;
    Ok(Json(result))
}

async fn access_batch_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BatchAccessRequest>,
) -> ApiResult<IndexMap<String, AccessResult>> {
    let results = state
        .access
        .check_multiple(&request.features, &request.address)
        .await?;
    Ok(Json(results))
}

// ============================================================================
// REWARDS
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct DeploymentRequest {
    pub address: String,
    pub contract_address: String,
    pub chain: String,
    pub tx_hash: String,
}

#[derive(Debug, Serialize)]
pub struct RewardResponse {
    pub success: bool,
    pub id: i64,
    pub reward_amount: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reward_type: Option<String>,
    pub payout_status: PayoutStatus,
    pub payout_tx_hash: Option<String>,
    pub message: String,
}

/// Settle a fresh record on the request path. Failures leave it for the
/// background worker.
async fn settle_now(state: &AppState, key: PayoutKey, recorded: PayoutState) -> PayoutState {
    let Some(worker) = &state.payouts else {
        return recorded;
    };
    match worker.settle(key).await {
        Ok(settled) => settled,
        Err(e) => {
            warn!("Immediate payout of {} failed, left for retry: {}", key, e);
            recorded
        }
    }
}

fn payout_message(amount: u64, payout: &PayoutState) -> String {
    match payout.status {
        PayoutStatus::Paid => format!("🎉 You earned {} BROski$!", amount),
        PayoutStatus::Failed => format!(
            "Recorded {} BROski$; the transfer was flagged for manual review",
            amount
        ),
        _ => format!("Recorded {} BROski$; payout is on its way", amount),
    }
}

async fn deployment_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DeploymentRequest>,
) -> ApiResult<RewardResponse> {
    let rules = state.rules();
    if rules.is_mainnet(&request.chain) {
        state
            .access
            .require_access(&rules.deploy_gate_feature, &request.address)
            .await?;
    }

    let record = state
        .ledger
        .record_deployment(
            &request.address,
            &request.contract_address,
            &request.chain,
            &request.tx_hash,
        )
        .await?;

    let payout = settle_now(&state, PayoutKey::deployment(record.id), record.payout.clone()).await;

    Ok(Json(RewardResponse {
        success: true,
        id: record.id,
        reward_amount: record.reward_amount,
        reward_type: Some(record.reward_type.to_string()),
        message: payout_message(record.reward_amount, &payout),
        payout_status: payout.status,
        payout_tx_hash: payout.tx_hash,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ContributionRequest {
    pub address: String,
    pub contribution_type: String,
    pub reference: String,
    pub custom_amount: Option<u64>,
}

async fn contribution_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<ContributionRequest>,
) -> ApiResult<RewardResponse> {
    let header = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    if !verify_admin_token(state.admin_token.as_deref(), header) {
        return Err(Error::Unauthorized.into());
    }

    let record = state
        .ledger
        .record_contribution(
            &request.address,
            &request.contribution_type,
            &request.reference,
            request.custom_amount,
        )
        .await?;

    let payout =
        settle_now(&state, PayoutKey::contribution(record.id), record.payout.clone()).await;

    Ok(Json(RewardResponse {
        success: true,
        id: record.id,
        reward_amount: record.reward_amount,
        reward_type: None,
        message: payout_message(record.reward_amount, &payout),
        payout_status: payout.status,
        payout_tx_hash: payout.tx_hash,
    }))
}

async fn rewards_handler(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> ApiResult<RewardTotals> {
    let totals = state.ledger.get_user_totals(&address).await?;
    Ok(Json(totals))
}

#[derive(Debug, Deserialize)]
pub struct LeaderboardQuery {
    pub timeframe: Option<String>,
    pub limit: Option<usize>,
}

async fn leaderboard_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LeaderboardQuery>,
) -> ApiResult<Vec<LeaderboardEntry>> {
    let timeframe = Timeframe::parse(query.timeframe.as_deref().unwrap_or("month"));
    let entries = state
        .leaderboard
        .top_earners(timeframe, query.limit.unwrap_or(DEFAULT_LIMIT))
        .await?;
    Ok(Json(entries))
}

// ============================================================================
// QUESTS
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub address: String,
}

async fn quests_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AddressQuery>,
) -> ApiResult<Vec<QuestStatus>> {
    let quests = state.quests.list(query.address.as_deref()).await?;
    Ok(Json(quests))
}

async fn claim_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<ClaimRequest>,
) -> ApiResult<RewardResponse> {
    let record = state.quests.claim(&id, &request.address).await?;
    let payout =
        settle_now(&state, PayoutKey::contribution(record.id), record.payout.clone()).await;

    Ok(Json(RewardResponse {
        success: true,
        id: record.id,
        reward_amount: record.reward_amount,
        reward_type: None,
        message: payout_message(record.reward_amount, &payout),
        payout_status: payout.status,
        payout_tx_hash: payout.tx_hash,
    }))
}

// ============================================================================
// PAYOUTS
// ============================================================================

async fn treasury_handler(State(state): State<Arc<AppState>>) -> ApiResult<TreasuryBalance> {
    let worker = state
        .payouts
        .as_ref()
        .ok_or_else(|| Error::ChainQueryFailed("payouts are not configured".to_string()))?;
    let balance = worker.disperser().treasury_balance().await?;
    Ok(Json(balance))
}

/// Run the server
pub async fn run_server(host: &str, port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);
    let addr = format!("{}:{}", host, port);

    info!("Starting BROski Rewards server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, PayoutConfig};
    use crate::disperser::tests::{fast_chain_config, FakeToken};
    use crate::disperser::RewardDisperser;
    use crate::gate::tests::{FakeGate, USER};
    use crate::storage::SqliteStorage;
    use axum::http::HeaderValue;
    use std::time::Duration;

    const CONTRACT: &str = "0x00000000000000000000000000000000000000aa";

    fn app_state(gate: FakeGate, with_payouts: bool) -> (Arc<AppState>, Arc<FakeToken>) {
        let config = Config::default();
        let store = Arc::new(SqliteStorage::in_memory().unwrap());
        let ledger = Arc::new(RewardLedger::new(store.clone(), config.rewards.clone()));
        let token = Arc::new(FakeToken::default());
        let payouts = with_payouts.then(|| {
            let disperser = Arc::new(RewardDisperser::new(token.clone(), &fast_chain_config()));
            Arc::new(PayoutWorker::new(
                store.clone(),
                disperser,
                PayoutConfig::default(),
            ))
        });

        let state = AppState {
            access: Arc::new(FeatureAccessChecker::new(
                Arc::new(gate),
                Duration::from_millis(200),
            )),
            leaderboard: LeaderboardAggregator::new(store),
            quests: QuestBoard::new(config.quests, ledger.clone()),
            ledger,
            payouts,
            chain: None,
            admin_token: Some("s3cret".to_string()),
            started_at: std::time::Instant::now(),
        };
        (Arc::new(state), token)
    }

    fn deployment(chain: &str) -> Json<DeploymentRequest> {
        Json(DeploymentRequest {
            address: USER.to_string(),
            contract_address: CONTRACT.to_string(),
            chain: chain.to_string(),
            tx_hash: "0xfeed".to_string(),
        })
    }

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (Error::InvalidAddress("x".into()), StatusCode::BAD_REQUEST),
            (Error::Unauthorized, StatusCode::UNAUTHORIZED),
            (
                Error::AccessDenied {
                    feature: "f".into(),
                    reason: "r".into(),
                },
                StatusCode::FORBIDDEN,
            ),
            (Error::QuestNotFound("q".into()), StatusCode::NOT_FOUND),
            (Error::QuestAlreadyClaimed("q".into()), StatusCode::CONFLICT),
            (
                Error::DuplicateDeployment {
                    chain: "sepolia".into(),
                    tx_hash: "0xfeed".into(),
                },
                StatusCode::CONFLICT,
            ),
            (Error::TransferFailed("t".into()), StatusCode::BAD_GATEWAY),
            (
                Error::ChainQueryFailed("c".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (Error::Storage("s".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError(error).into_response().status(), status);
        }
    }

    #[tokio::test]
    async fn test_testnet_deployment_recorded_and_paid() {
        let (state, token) = app_state(FakeGate::granting(&[]), true);

        let Json(response) = deployment_handler(State(state.clone()), deployment("sepolia"))
            .await
            .unwrap();
        assert!(response.success);
        assert_eq!(response.reward_amount, 500);
        assert_eq!(response.reward_type.as_deref(), Some("first_deploy"));
        assert_eq!(response.payout_status, PayoutStatus::Paid);
        assert!(response.payout_tx_hash.is_some());
        assert_eq!(token.transfers(), 1);
    }

    #[tokio::test]
    async fn test_replayed_deployment_is_conflict() {
        let (state, token) = app_state(FakeGate::granting(&[]), true);
        deployment_handler(State(state.clone()), deployment("sepolia"))
            .await
            .unwrap();

        let err = deployment_handler(State(state.clone()), deployment("sepolia"))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert_eq!(err.0.kind(), "duplicate_deployment");
        assert_eq!(token.transfers(), 1);

        let Json(totals) = rewards_handler(State(state), Path(USER.to_string()))
            .await
            .unwrap();
        assert_eq!(totals.total_earned, 500);
    }

    #[tokio::test]
    async fn test_mainnet_deployment_requires_gate() {
        let (state, _) = app_state(FakeGate::granting(&[]), false);
        let err = deployment_handler(State(state.clone()), deployment("mainnet"))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);

        let (state, _) = state_granting_deploy();
        let Json(response) = deployment_handler(State(state), deployment("mainnet"))
            .await
            .unwrap();
        // No payout worker configured: stays in the outbox
        assert_eq!(response.payout_status, PayoutStatus::Pending);
    }

    fn state_granting_deploy() -> (Arc<AppState>, Arc<FakeToken>) {
        app_state(FakeGate::granting(&["deploy-mainnet"]), false)
    }

    #[tokio::test]
    async fn test_contributions_need_admin_token() {
        let (state, _) = app_state(FakeGate::granting(&[]), false);
        let request = || {
            Json(ContributionRequest {
                address: USER.to_string(),
                contribution_type: "pr_merge".to_string(),
                reference: "https://github.com/hypercode/ide/pull/3".to_string(),
                custom_amount: None,
            })
        };

        let err = contribution_handler(State(state.clone()), HeaderMap::new(), request())
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer s3cret"));
        let Json(response) = contribution_handler(State(state), headers, request())
            .await
            .unwrap();
        assert_eq!(response.reward_amount, 100);
    }

    #[tokio::test]
    async fn test_access_routes() {
        let (state, _) = app_state(FakeGate::granting(&["ai-assist"]), false);

        let Json(result) = access_handler(
            State(state.clone()),
            Path("ai-assist".to_string()),
            Query(AddressQuery {
                address: Some(USER.to_string()),
            }),
        )
        .await
        .unwrap();
        assert!(result.can_access);

        let err = access_handler(
            State(state.clone()),
            Path("ai-assist".to_string()),
            Query(AddressQuery { address: None }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let Json(batch) = access_batch_handler(
            State(state),
            Json(BatchAccessRequest {
                address: USER.to_string(),
                features: vec!["ai-assist".to_string(), "nft-themes".to_string()],
            }),
        )
        .await
        .unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batch["ai-assist"].can_access);
        assert!(!batch["nft-themes"].can_access);
    }

    #[tokio::test]
    async fn test_totals_and_leaderboard() {
        let (state, _) = app_state(FakeGate::granting(&[]), false);
        deployment_handler(State(state.clone()), deployment("sepolia"))
            .await
            .unwrap();

        let Json(totals) = rewards_handler(State(state.clone()), Path(USER.to_lowercase()))
            .await
            .unwrap();
        assert_eq!(totals.total_earned, 500);

        let Json(entries) = leaderboard_handler(
            State(state),
            Query(LeaderboardQuery {
                timeframe: Some("week".to_string()),
                limit: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].badge, "🥇");
    }

    #[tokio::test]
    async fn test_quest_claim_errors() {
        let (state, _) = app_state(FakeGate::granting(&[]), false);
        let err = claim_handler(
            State(state.clone()),
            Path("ship-it".to_string()),
            Json(ClaimRequest {
                address: USER.to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let err = claim_handler(
            State(state),
            Path("nope".to_string()),
            Json(ClaimRequest {
                address: USER.to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_treasury_and_network_unavailable_without_chain() {
        let (state, _) = app_state(FakeGate::granting(&[]), false);
        let err = treasury_handler(State(state.clone())).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        let err = network_handler(State(state)).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);

        let (state, _) = app_state(FakeGate::granting(&[]), true);
        let Json(balance) = treasury_handler(State(state)).await.unwrap();
        assert_eq!(balance.tokens, "1500");
    }
}
