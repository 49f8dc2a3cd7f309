//! Domain records for the settlement engine.
//!
//! Monetary amounts are u64 micro-units (6 decimals, matching TRC-20 USDT);
//! signed per-bucket deltas on transaction records are i64. Records are
//! serialized with serde_json and persisted through `store`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Micro-units per whole stablecoin token.
pub const MICRO: u64 = 1_000_000;

pub fn now_secs() -> i64 {
    Utc::now().timestamp()
}

/// Snapshot of all four buckets, stored on every transaction record.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Balances {
    pub cash: u64,
    pub bonus: u64,
    pub locked: u64,
    pub virtual_funds: u64,
}

/// Signed per-bucket movement of a single ledger operation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BucketDeltas {
    pub cash: i64,
    pub bonus: i64,
    pub locked: i64,
    pub virtual_funds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    /// TRC-20 deposit address assigned to this account, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deposit_address: Option<String>,
    /// Affiliate that referred this account, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,

    pub cash: u64,
    pub bonus: u64,
    pub locked: u64,
    pub virtual_funds: u64,

    pub active_wagering_requirement: u64,
    pub wagering_progress: u64,

    // Lifetime counters. Deposit/withdrawal totals feed the affiliate
    // net-flow profit proxy.
    pub total_deposited: u64,
    pub total_withdrawn: u64,
    pub games_played: u64,
    pub total_invested: u64,
    pub current_win_streak: u32,
    pub max_win_streak: u32,

    /// Per-account score adjustment factor consumed by the win-chance
    /// policy when that policy is enabled. 1.0 = neutral.
    #[serde(default = "default_win_chance")]
    pub win_chance: f64,

    /// Per-account transaction sequence, advanced on every ledger append.
    pub tx_seq: u64,

    pub created_at: i64,
}

fn default_win_chance() -> f64 {
    1.0
}

impl Account {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            deposit_address: None,
            referrer: None,
            cash: 0,
            bonus: 0,
            locked: 0,
            virtual_funds: 0,
            active_wagering_requirement: 0,
            wagering_progress: 0,
            total_deposited: 0,
            total_withdrawn: 0,
            games_played: 0,
            total_invested: 0,
            current_win_streak: 0,
            max_win_streak: 0,
            win_chance: 1.0,
            tx_seq: 0,
            created_at: now_secs(),
        }
    }

    pub fn balances(&self) -> Balances {
        Balances {
            cash: self.cash,
            bonus: self.bonus,
            locked: self.locked,
            virtual_funds: self.virtual_funds,
        }
    }

    /// Playable balance for a game mode: cash + bonus in real mode,
    /// the virtual bucket in demo mode.
    pub fn playable_balance(&self, mode: GameMode) -> u64 {
        match mode {
            GameMode::Real => self.cash.saturating_add(self.bonus),
            GameMode::Virtual => self.virtual_funds,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GameMode {
    Real,
    Virtual,
}

impl fmt::Display for GameMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GameMode::Real => write!(f, "real"),
            GameMode::Virtual => write!(f, "virtual"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    Active,
    CashedOut,
    Lost,
}

/// One active stake session. Terminal (`CashedOut`/`Lost`) games are never
/// mutated again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Game {
    pub id: String,
    pub owner: String,
    pub mode: GameMode,
    pub stake: u64,
    pub total_pot: u64,
    pub status: GameStatus,
    pub final_pot: u64,
    /// Number of rounds rolled so far; the next round gets seq = rounds + 1.
    pub rounds: u32,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<i64>,
}

impl Game {
    pub fn is_active(&self) -> bool {
        self.status == GameStatus::Active
    }
}

/// One dice throw within a game. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round {
    pub game_id: String,
    /// 1-based, gapless within the game.
    pub seq: u32,
    pub dice: [u8; 3],
    pub points: u32,
    /// Pot multiplier times ten, so pot math stays integral (11 = 1.1x).
    pub multiplier_x10: u32,
    pub pot_before: u64,
    pub pot_after: u64,
    /// Hex server seed, revealable after the round for verification.
    pub server_seed: String,
    pub client_seed: String,
    /// Equal to `seq`.
    pub nonce: u32,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TxKind {
    Deposit,
    Withdrawal,
    Bet,
    Payout,
    Bonus,
}

impl fmt::Display for TxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxKind::Deposit => "deposit",
            TxKind::Withdrawal => "withdrawal",
            TxKind::Bet => "bet",
            TxKind::Payout => "payout",
            TxKind::Bonus => "bonus",
        };
        write!(f, "{}", s)
    }
}

/// Append-only ledger entry. `balances_after` must equal the account's
/// post-mutation state; the ledger writes both in one batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub account_id: String,
    /// Per-account sequence, dense from 1.
    pub seq: u64,
    pub kind: TxKind,
    pub deltas: BucketDeltas,
    pub balances_after: Balances,
    pub description: String,
    /// Chain tx hash, withdrawal id, or similar external reference.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DepositStatus {
    Pending,
    Confirmed,
}

/// One row per observed chain deposit, keyed uniquely by tx hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deposit {
    pub tx_hash: String,
    pub account_id: String,
    pub address: String,
    pub amount: u64,
    pub confirmations: u32,
    pub status: DepositStatus,
    /// Bonus credited alongside this deposit, zero if none.
    pub bonus_granted: u64,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credited_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WithdrawalStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Withdrawal {
    pub id: String,
    pub account_id: String,
    pub amount: u64,
    pub to_address: String,
    pub status: WithdrawalStatus,
    /// Chain transaction id of the successful (or attempted) send.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_tx_id: Option<String>,
    /// True once the debited amount has been returned after a failed send.
    pub refunded: bool,
    /// Set when a send timed out with unknown outcome; the reconciliation
    /// pass re-checks these against the chain.
    pub needs_reconciliation: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PeriodStatus {
    Ongoing,
    Pending,
    Finished,
}

/// One accrual window for an affiliate. At most one `Ongoing` period per
/// affiliate exists at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutPeriod {
    pub id: String,
    pub affiliate_id: String,
    pub period_start: i64,
    pub period_end: i64,
    /// Net referred-user profit folded in so far; may go negative.
    pub total_profit: i64,
    /// Payable commission, clamped at zero.
    pub commission: u64,
    /// Commission rate in whole percent.
    pub rate: u32,
    pub status: PeriodStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
}
