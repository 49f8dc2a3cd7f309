//! Route definitions.
//!
//! Maps URLs to handlers with type-safe routing.

use super::handlers::*;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

/// Build the API router with all endpoints
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health check (high priority)
        .route("/health", get(health_handler))
        // Accounts
        .route("/api/account/register", post(register_handler))
        .route("/api/account/balance", get(balance_handler))
        .route("/api/account/transactions", get(transactions_handler))
        // Game round trip
        .route("/api/game/start", post(start_game_handler))
        .route("/api/game/:id/roll", post(roll_handler))
        .route("/api/game/:id/cashout", post(cash_out_handler))
        .route("/api/game/:id", get(game_handler))
        .route("/api/game/:id/verify", get(verify_handler))
        // Money in and out
        .route("/api/deposit/webhook", post(deposit_webhook_handler))
        .route("/api/deposit/check", post(deposit_check_handler))
        .route("/api/withdraw", post(withdraw_handler))
        // Affiliate program
        .route("/api/affiliate/:id/stats", get(affiliate_stats_handler))
        .route(
            "/api/affiliate/:id/periods/:period_id/finish",
            post(finish_period_handler),
        )
        // Attach shared state
        .with_state(state)
}
