//! API request and response models.

use crate::models::{Balances, Deposit, Game, GameMode, LedgerTransaction, Round, Withdrawal};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub account_id: String,
    #[serde(default)]
    pub referrer: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub account_id: String,
    pub deposit_address: String,
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub account_id: String,
    pub balances: Balances,
    /// Cash plus bonus, what a real-mode bet can draw on.
    pub playable: u64,
    pub wagering_requirement: u64,
    pub wagering_progress: u64,
}

#[derive(Debug, Serialize)]
pub struct TransactionsResponse {
    pub account_id: String,
    pub transactions: Vec<LedgerTransaction>,
}

#[derive(Debug, Deserialize)]
pub struct StartGameRequest {
    /// Stake in micro-units.
    pub stake: u64,
    pub mode: GameMode,
}

#[derive(Debug, Deserialize)]
pub struct RollRequest {
    pub client_seed: String,
}

#[derive(Debug, Serialize)]
pub struct RollResponse {
    pub game_id: String,
    pub seq: u32,
    pub dice: [u8; 3],
    pub points: u32,
    pub multiplier_x10: u32,
    pub total_pot: u64,
    pub game_over: bool,
    pub can_cash_out: bool,
    /// Revealed after the roll so the player can verify it.
    pub server_seed: String,
}

#[derive(Debug, Serialize)]
pub struct CashOutResponse {
    pub game_id: String,
    pub payout: u64,
    pub win_streak: u32,
}

#[derive(Debug, Serialize)]
pub struct GameResponse {
    pub game: Game,
    pub rounds: Vec<Round>,
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub game_id: String,
    pub valid: bool,
}

/// Transfer notification pushed by the chain-watcher service.
#[derive(Debug, Deserialize)]
pub struct DepositWebhookRequest {
    pub account_id: String,
    pub tx_hash: String,
    pub from: String,
    pub to: String,
    pub amount: u64,
    pub confirmations: u32,
    pub timestamp: i64,
}

#[derive(Debug, Serialize)]
pub struct DepositWebhookResponse {
    pub tx_hash: String,
    /// "credited", "pending", "ignored" or "duplicate".
    pub outcome: String,
}

#[derive(Debug, Serialize)]
pub struct DepositCheckResponse {
    pub account_id: String,
    /// Deposit rows recorded or re-evaluated by this check.
    pub deposits: Vec<Deposit>,
}

#[derive(Debug, Deserialize)]
pub struct WithdrawRequest {
    pub amount: u64,
    pub to_address: String,
}

#[derive(Debug, Serialize)]
pub struct WithdrawResponse {
    pub withdrawal: Withdrawal,
}
