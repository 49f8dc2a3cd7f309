//! Request handlers.

use super::{
    errors::ApiError,
    middleware::{AccountIdentity, RequestId},
    models::*,
};
use crate::errors::CasinoError;
use crate::models::{now_secs, Account};
use crate::services::ServiceContainer;
use crate::store;
use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use serde::Deserialize;
use std::sync::Arc;

/// Shared application state
pub struct AppState {
    pub container: Arc<ServiceContainer>,
    pub version: String,
}

/// Reject requests that arrived without the trusted identity header.
fn require_identity(
    identity: Option<Extension<AccountIdentity>>,
    request_id: &RequestId,
) -> Result<String, ApiError> {
    identity.map(|Extension(id)| id.0).ok_or_else(|| {
        ApiError::bad_request(
            request_id.0.clone(),
            "missing account identity".to_string(),
        )
    })
}

/// Health check handler - minimal response time
/// GET /health
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "Running".to_string(),
        version: state.version.clone(),
    })
}

/// Register an account and assign it a deposit wallet. Idempotent: an
/// already-registered account gets its existing address back.
/// POST /api/account/register
pub async fn register_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ApiError> {
    if req.account_id.is_empty() {
        return Err(ApiError::bad_request(
            request_id.0,
            "account_id must not be empty".to_string(),
        ));
    }
    if req.referrer.as_deref() == Some(req.account_id.as_str()) {
        return Err(ApiError::bad_request(
            request_id.0,
            "an account cannot refer itself".to_string(),
        ));
    }

    let storage = state.container.storage();
    if let Some(existing) = store::load_account(&storage, &req.account_id)
        .map_err(|e| ApiError::from_domain(request_id.0.clone(), e))?
    {
        return Ok(Json(RegisterResponse {
            account_id: existing.id,
            deposit_address: existing.deposit_address.unwrap_or_default(),
        }));
    }

    let wallet = state
        .container
        .chain()
        .generate_wallet()
        .await
        .map_err(|e| ApiError::from_domain(request_id.0.clone(), e))?;

    let mut account = Account::new(req.account_id.clone());
    account.deposit_address = Some(wallet.address.clone());
    account.referrer = req.referrer;
    store::register_account(&storage, &account)
        .map_err(|e| ApiError::from_domain(request_id.0.clone(), e))?;

    tracing::info!(account = %account.id, "Account registered");
    Ok(Json(RegisterResponse {
        account_id: account.id,
        deposit_address: wallet.address,
    }))
}

/// GET /api/account/balance
pub async fn balance_handler(
    Extension(request_id): Extension<RequestId>,
    identity: Option<Extension<AccountIdentity>>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let account_id = require_identity(identity, &request_id)?;
    let account = store::load_account(&state.container.storage(), &account_id)
        .map_err(|e| ApiError::from_domain(request_id.0.clone(), e))?
        .ok_or_else(|| {
            ApiError::not_found(request_id.0.clone(), format!("account {}", account_id))
        })?;

    Ok(Json(BalanceResponse {
        playable: account.playable_balance(crate::models::GameMode::Real),
        balances: account.balances(),
        wagering_requirement: account.active_wagering_requirement,
        wagering_progress: account.wagering_progress,
        account_id: account.id,
    }))
}

#[derive(Debug, Deserialize)]
pub struct TransactionsQuery {
    #[serde(default = "default_tx_limit")]
    pub limit: usize,
}

fn default_tx_limit() -> usize {
    50
}

/// GET /api/account/transactions
pub async fn transactions_handler(
    Extension(request_id): Extension<RequestId>,
    identity: Option<Extension<AccountIdentity>>,
    State(state): State<Arc<AppState>>,
    Query(query): Query<TransactionsQuery>,
) -> Result<Json<TransactionsResponse>, ApiError> {
    let account_id = require_identity(identity, &request_id)?;
    let transactions =
        store::load_transactions(&state.container.storage(), &account_id, query.limit)
            .map_err(|e| ApiError::from_domain(request_id.0.clone(), e))?;
    Ok(Json(TransactionsResponse {
        account_id,
        transactions,
    }))
}

/// POST /api/game/start
pub async fn start_game_handler(
    Extension(request_id): Extension<RequestId>,
    identity: Option<Extension<AccountIdentity>>,
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartGameRequest>,
) -> Result<Json<GameResponse>, ApiError> {
    let account_id = require_identity(identity, &request_id)?;
    let game = state
        .container
        .game()
        .start_game(&account_id, req.stake, req.mode)
        .await
        .map_err(|e| ApiError::from_domain(request_id.0.clone(), e))?;
    Ok(Json(GameResponse {
        game,
        rounds: Vec::new(),
    }))
}

/// POST /api/game/:id/roll
pub async fn roll_handler(
    Extension(request_id): Extension<RequestId>,
    identity: Option<Extension<AccountIdentity>>,
    State(state): State<Arc<AppState>>,
    Path(game_id): Path<String>,
    Json(req): Json<RollRequest>,
) -> Result<Json<RollResponse>, ApiError> {
    let account_id = require_identity(identity, &request_id)?;
    if req.client_seed.is_empty() {
        return Err(ApiError::bad_request(
            request_id.0,
            "client_seed must not be empty".to_string(),
        ));
    }

    let outcome = state
        .container
        .game()
        .roll_dice(&account_id, &game_id, &req.client_seed)
        .await
        .map_err(|e| ApiError::from_domain(request_id.0.clone(), e))?;

    Ok(Json(RollResponse {
        game_id,
        seq: outcome.round.seq,
        dice: outcome.round.dice,
        points: outcome.round.points,
        multiplier_x10: outcome.round.multiplier_x10,
        total_pot: outcome.total_pot,
        game_over: outcome.game_over,
        can_cash_out: outcome.can_cash_out,
        server_seed: outcome.round.server_seed,
    }))
}

/// POST /api/game/:id/cashout
pub async fn cash_out_handler(
    Extension(request_id): Extension<RequestId>,
    identity: Option<Extension<AccountIdentity>>,
    State(state): State<Arc<AppState>>,
    Path(game_id): Path<String>,
) -> Result<Json<CashOutResponse>, ApiError> {
    let account_id = require_identity(identity, &request_id)?;
    let (payout, win_streak) = state
        .container
        .game()
        .cash_out(&account_id, &game_id)
        .await
        .map_err(|e| ApiError::from_domain(request_id.0.clone(), e))?;
    Ok(Json(CashOutResponse {
        game_id,
        payout,
        win_streak,
    }))
}

/// GET /api/game/:id
pub async fn game_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(game_id): Path<String>,
) -> Result<Json<GameResponse>, ApiError> {
    let storage = state.container.storage();
    let game = store::load_game(&storage, &game_id)
        .map_err(|e| ApiError::from_domain(request_id.0.clone(), e))?
        .ok_or_else(|| ApiError::not_found(request_id.0.clone(), format!("game {}", game_id)))?;
    let rounds = store::load_rounds(&storage, &game_id)
        .map_err(|e| ApiError::from_domain(request_id.0.clone(), e))?;
    Ok(Json(GameResponse { game, rounds }))
}

/// GET /api/game/:id/verify
pub async fn verify_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(game_id): Path<String>,
) -> Result<Json<VerifyResponse>, ApiError> {
    let valid = state
        .container
        .game()
        .verify_game(&game_id)
        .map_err(|e| match e {
            CasinoError::InvalidGameState(msg) => ApiError::not_found(request_id.0.clone(), msg),
            other => ApiError::from_domain(request_id.0.clone(), other),
        })?;
    Ok(Json(VerifyResponse { game_id, valid }))
}

/// Deposit webhook pushed by the chain watcher. Idempotent: replays of an
/// already-credited transfer return success with outcome "duplicate".
/// POST /api/deposit/webhook
pub async fn deposit_webhook_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Json(req): Json<DepositWebhookRequest>,
) -> Result<Json<DepositWebhookResponse>, ApiError> {
    let event = crate::chain::TransferEvent {
        tx_hash: req.tx_hash.clone(),
        from: req.from,
        to: req.to,
        amount: req.amount,
        confirmations: req.confirmations,
        timestamp: if req.timestamp > 0 { req.timestamp } else { now_secs() },
    };

    let result = state
        .container
        .reconciler()
        .process_deposit_event(&req.account_id, &event)
        .await;

    let outcome = match result {
        Ok(Some(deposit)) if deposit.status == crate::models::DepositStatus::Confirmed => {
            "credited"
        }
        Ok(Some(_)) => "pending",
        Ok(None) => "ignored",
        Err(CasinoError::DuplicateEvent { .. }) => "duplicate",
        Err(e) => return Err(ApiError::from_domain(request_id.0, e)),
    };

    Ok(Json(DepositWebhookResponse {
        tx_hash: req.tx_hash,
        outcome: outcome.to_string(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct DepositCheckQuery {
    /// Unix seconds; transfers older than this are skipped. Defaults to 0,
    /// the whole address history.
    #[serde(default)]
    pub since: i64,
}

/// On-demand deposit check: scan the caller's deposit address for new
/// transfers and run each through the reconciler.
/// POST /api/deposit/check
pub async fn deposit_check_handler(
    Extension(request_id): Extension<RequestId>,
    identity: Option<Extension<AccountIdentity>>,
    State(state): State<Arc<AppState>>,
    Query(query): Query<DepositCheckQuery>,
) -> Result<Json<DepositCheckResponse>, ApiError> {
    let account_id = require_identity(identity, &request_id)?;
    let deposits = state
        .container
        .reconciler()
        .record_deposit_events(&account_id, query.since)
        .await
        .map_err(|e| ApiError::from_domain(request_id.0.clone(), e))?;
    Ok(Json(DepositCheckResponse {
        account_id,
        deposits,
    }))
}

/// POST /api/withdraw
pub async fn withdraw_handler(
    Extension(request_id): Extension<RequestId>,
    identity: Option<Extension<AccountIdentity>>,
    State(state): State<Arc<AppState>>,
    Json(req): Json<WithdrawRequest>,
) -> Result<Json<WithdrawResponse>, ApiError> {
    let account_id = require_identity(identity, &request_id)?;
    let withdrawal = state
        .container
        .reconciler()
        .request_withdrawal(&account_id, req.amount, &req.to_address)
        .await
        .map_err(|e| ApiError::from_domain(request_id.0.clone(), e))?;
    Ok(Json(WithdrawResponse { withdrawal }))
}

/// GET /api/affiliate/:id/stats
pub async fn affiliate_stats_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(affiliate_id): Path<String>,
) -> Result<Json<crate::affiliate::AffiliateStats>, ApiError> {
    let stats = state
        .container
        .affiliate()
        .stats(&affiliate_id)
        .map_err(|e| ApiError::from_domain(request_id.0.clone(), e))?;
    Ok(Json(stats))
}

/// Operator acknowledgment of a paid-out period.
/// POST /api/affiliate/:id/periods/:period_id/finish
pub async fn finish_period_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path((affiliate_id, period_id)): Path<(String, String)>,
) -> Result<Json<crate::models::PayoutPeriod>, ApiError> {
    let period = state
        .container
        .affiliate()
        .finish_period(&affiliate_id, &period_id)
        .map_err(|e| match e {
            CasinoError::InvalidInput(msg) => ApiError::not_found(request_id.0.clone(), msg),
            other => ApiError::from_domain(request_id.0.clone(), other),
        })?;
    Ok(Json(period))
}
