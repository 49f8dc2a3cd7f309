//! Round state machine: start, roll, cash out.
//!
//! One stake session moves `NoGame -> Active -> {CashedOut, Lost}`. Roll and
//! cash-out on the same game serialize on a per-game async lock, which is
//! what makes round sequence numbers gapless. Money only moves through the
//! `Ledger`; game and round rows ride in the ledger's write batch so a
//! terminal game and its payout (or forfeit) commit together.

use crate::config::GameConfig;
use crate::errors::{CasinoError, CasinoResult};
use crate::fairness;
use crate::ledger::Ledger;
use crate::models::{
    now_secs, Account, Game, GameMode, GameStatus, Round, MICRO,
};
use crate::storage::Storage;
use crate::store;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Recognized three-die straights, sorted.
const STRAIGHTS: [[u8; 3]; 4] = [[1, 2, 3], [2, 3, 4], [3, 4, 5], [4, 5, 6]];

/// The score ladder; every reachable point total lands on it.
const SCORE_TIERS: [u32; 10] = [0, 50, 100, 150, 200, 250, 300, 400, 500, 600];

/// Multiplier table, times ten so pot math stays integral. Totals off the
/// table keep the pot unchanged (1.0x).
static MULTIPLIERS_X10: Lazy<HashMap<u32, u32>> = Lazy::new(|| {
    HashMap::from([
        (50, 11),
        (100, 12),
        (150, 13),
        (200, 14),
        (250, 16),
        (300, 18),
        (400, 20),
        (500, 21),
        (600, 22),
    ])
});

/// Score a throw: triple n is n x 100, a straight is 100, otherwise
/// 100 per die showing 1 plus 50 per die showing 5.
pub fn score_dice(dice: [u8; 3]) -> u32 {
    if dice[0] == dice[1] && dice[1] == dice[2] {
        return dice[0] as u32 * 100;
    }
    let mut sorted = dice;
    sorted.sort_unstable();
    if STRAIGHTS.contains(&sorted) {
        return 100;
    }
    let ones = dice.iter().filter(|&&d| d == 1).count() as u32;
    let fives = dice.iter().filter(|&&d| d == 5).count() as u32;
    ones * 100 + fives * 50
}

/// Pot multiplier, times ten, keyed by exact point total.
pub fn multiplier_x10(points: u32) -> u32 {
    MULTIPLIERS_X10.get(&points).copied().unwrap_or(10)
}

/// Apply one round's multiplier to the pot. Saturates at `u64::MAX` instead
/// of wrapping; an astronomically long run caps out rather than corrupting
/// the pot.
pub fn grow_pot(pot: u64, points: u32) -> u64 {
    let grown = pot as u128 * multiplier_x10(points) as u128 / 10;
    u64::try_from(grown).unwrap_or(u64::MAX)
}

/// Pluggable score adjustment applied after raw scoring and before the
/// multiplier lookup. The default is a no-op; see `WinChancePolicy` for the
/// per-account variant.
pub trait ScorePolicy: Send + Sync {
    fn adjust(&self, account: &Account, points: u32) -> u32;
}

/// Leaves every score untouched.
pub struct NoAdjust;

impl ScorePolicy for NoAdjust {
    fn adjust(&self, _account: &Account, points: u32) -> u32 {
        points
    }
}

/// Probabilistically nudges a nonzero score one tier up or down based on the
/// account's `win_chance` factor. A zero-score throw is never promoted, so
/// the policy cannot fabricate a win, and demotion floors at zero.
pub struct WinChancePolicy;

impl ScorePolicy for WinChancePolicy {
    fn adjust(&self, account: &Account, points: u32) -> u32 {
        if points == 0 || account.win_chance == 1.0 {
            return points;
        }
        let p = (account.win_chance - 1.0).abs().min(1.0);
        if rand::random::<f64>() >= p {
            return points;
        }
        let Some(idx) = SCORE_TIERS.iter().position(|&t| t == points) else {
            return points;
        };
        if account.win_chance > 1.0 {
            SCORE_TIERS[(idx + 1).min(SCORE_TIERS.len() - 1)]
        } else {
            SCORE_TIERS[idx.saturating_sub(1)]
        }
    }
}

/// Result of one roll, returned to the API layer.
#[derive(Debug, Clone)]
pub struct RollOutcome {
    pub round: Round,
    pub game_over: bool,
    pub total_pot: u64,
    pub can_cash_out: bool,
}

pub struct GameEngine {
    storage: Storage,
    ledger: Arc<Ledger>,
    policy: Arc<dyn ScorePolicy>,
    /// Allowed stakes in micro-units.
    allowed_stakes: Vec<u64>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl GameEngine {
    pub fn new(storage: Storage, ledger: Arc<Ledger>, config: &GameConfig) -> Self {
        let policy: Arc<dyn ScorePolicy> = if config.win_chance_policy {
            Arc::new(WinChancePolicy)
        } else {
            Arc::new(NoAdjust)
        };
        Self {
            storage,
            ledger,
            policy,
            allowed_stakes: config.allowed_stakes.iter().map(|s| s * MICRO).collect(),
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, game_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(game_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Start a new game: validate the stake, debit it, create the Active
    /// game with `total_pot = stake`.
    pub async fn start_game(
        &self,
        account_id: &str,
        stake: u64,
        mode: GameMode,
    ) -> CasinoResult<Game> {
        if !self.allowed_stakes.contains(&stake) {
            return Err(CasinoError::invalid_input(format!(
                "stake {} micro is not an allowed denomination",
                stake
            )));
        }

        let game = Game {
            id: Uuid::new_v4().to_string(),
            owner: account_id.to_string(),
            mode,
            stake,
            total_pot: stake,
            status: GameStatus::Active,
            final_pot: 0,
            rounds: 0,
            created_at: now_secs(),
            closed_at: None,
        };

        let extra = vec![(store::game_key(&game.id), store::encode(&game)?)];
        self.ledger
            .debit_stake(account_id, stake, mode, &game.id, extra)
            .await?;

        tracing::info!(game_id = %game.id, owner = %account_id, stake, %mode, "Game started");
        Ok(game)
    }

    /// Roll the next round. Serialized per game; the loser of a race against
    /// a terminal transition observes non-Active state and gets
    /// `InvalidGameState` with no mutation.
    pub async fn roll_dice(
        &self,
        account_id: &str,
        game_id: &str,
        client_seed: &str,
    ) -> CasinoResult<RollOutcome> {
        let lock = self.lock_for(game_id);
        let _guard = lock.lock().await;

        let mut game = self.load_owned_active(account_id, game_id)?;
        let account = store::load_account(&self.storage, account_id)?
            .ok_or_else(|| CasinoError::invalid_input(format!("unknown account {}", account_id)))?;

        let seq = game.rounds + 1;
        let server_seed = fairness::generate_server_seed();
        let dice = fairness::roll(&server_seed, client_seed, seq);
        let raw_points = score_dice(dice);
        let points = self.policy.adjust(&account, raw_points);

        let pot_before = game.total_pot;
        let (pot_after, game_over) = if points == 0 {
            (0, true)
        } else {
            (grow_pot(pot_before, points), false)
        };

        let round = Round {
            game_id: game.id.clone(),
            seq,
            dice,
            points,
            multiplier_x10: multiplier_x10(points),
            pot_before,
            pot_after,
            server_seed,
            client_seed: client_seed.to_string(),
            nonce: seq,
            timestamp: now_secs(),
        };

        game.rounds = seq;
        if game_over {
            game.status = GameStatus::Lost;
            game.total_pot = 0;
            game.final_pot = 0;
            game.closed_at = Some(now_secs());
            let extra = vec![
                (store::game_key(&game.id), store::encode(&game)?),
                (store::round_key(&game.id, seq), store::encode(&round)?),
            ];
            // Pot forfeited; streak reset goes through the ledger's account
            // lock so the account write cannot race a money move.
            self.ledger.record_bust(account_id, extra).await?;
            tracing::info!(game_id = %game.id, seq, ?dice, "Bust, pot forfeited");
        } else {
            game.total_pot = pot_after;
            self.storage.batch_write(&[
                (store::game_key(&game.id), store::encode(&game)?),
                (store::round_key(&game.id, seq), store::encode(&round)?),
            ])?;
            tracing::debug!(game_id = %game.id, seq, ?dice, points, pot_after, "Round scored");
        }

        Ok(RollOutcome {
            round,
            game_over,
            total_pot: game.total_pot,
            can_cash_out: !game_over,
        })
    }

    /// Cash out an active game: pot returns to the originating bucket, the
    /// game goes terminal, the win streak advances.
    pub async fn cash_out(&self, account_id: &str, game_id: &str) -> CasinoResult<(u64, u32)> {
        let lock = self.lock_for(game_id);
        let _guard = lock.lock().await;

        let mut game = self.load_owned_active(account_id, game_id)?;

        game.status = GameStatus::CashedOut;
        game.final_pot = game.total_pot;
        game.closed_at = Some(now_secs());

        let extra = vec![(store::game_key(&game.id), store::encode(&game)?)];
        self.ledger
            .credit_payout(account_id, game.final_pot, game.mode, &game.id, extra)
            .await?;

        let account = store::load_account(&self.storage, account_id)?
            .ok_or_else(|| CasinoError::invalid_input(format!("unknown account {}", account_id)))?;

        tracing::info!(game_id = %game.id, final_pot = game.final_pot, "Cashed out");
        Ok((game.final_pot, account.current_win_streak))
    }

    /// Recompute every stored round of a game from its revealed seed
    /// material. True only if all faces, points and pot arithmetic check out.
    pub fn verify_game(&self, game_id: &str) -> CasinoResult<bool> {
        let Some(game) = store::load_game(&self.storage, game_id)? else {
            return Err(CasinoError::invalid_game_state(format!(
                "game {} not found",
                game_id
            )));
        };
        let rounds = store::load_rounds(&self.storage, game_id)?;

        let mut expected_seq = 1u32;
        let mut pot = game.stake;
        for round in &rounds {
            if round.seq != expected_seq || round.nonce != round.seq {
                return Ok(false);
            }
            if !fairness::verify(&round.server_seed, &round.client_seed, round.nonce, round.dice)
            {
                return Ok(false);
            }
            if round.pot_before != pot {
                return Ok(false);
            }
            // The stored points may differ from the raw score when a score
            // policy is active, but the pot arithmetic must follow them.
            let expected_after = if round.points == 0 {
                0
            } else {
                grow_pot(pot, round.points)
            };
            if round.pot_after != expected_after
                || round.multiplier_x10 != multiplier_x10(round.points)
            {
                return Ok(false);
            }
            pot = round.pot_after;
            expected_seq += 1;
        }
        Ok(true)
    }

    fn load_owned_active(&self, account_id: &str, game_id: &str) -> CasinoResult<Game> {
        let Some(game) = store::load_game(&self.storage, game_id)? else {
            return Err(CasinoError::invalid_game_state(format!(
                "game {} not found",
                game_id
            )));
        };
        if game.owner != account_id {
            return Err(CasinoError::invalid_game_state(format!(
                "game {} does not belong to {}",
                game_id, account_id
            )));
        }
        if !game.is_active() {
            return Err(CasinoError::invalid_game_state(format!(
                "game {} is not active",
                game_id
            )));
        }
        Ok(game)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, Storage, Arc<Ledger>, GameEngine) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let ledger = Arc::new(Ledger::new(storage.clone()));
        let engine = GameEngine::new(storage.clone(), ledger.clone(), &GameConfig::default());
        (dir, storage, ledger, engine)
    }

    fn seed_account(storage: &Storage, id: &str, cash: u64) {
        let mut account = Account::new(id);
        account.cash = cash;
        store::store_account(storage, &account).unwrap();
    }

    #[test]
    fn test_scoring_table() {
        // Triples.
        assert_eq!(score_dice([4, 4, 4]), 400);
        assert_eq!(score_dice([1, 1, 1]), 100);
        // Straights in any order.
        assert_eq!(score_dice([3, 1, 2]), 100);
        assert_eq!(score_dice([6, 4, 5]), 100);
        // Ones and fives.
        assert_eq!(score_dice([1, 1, 5]), 250);
        assert_eq!(score_dice([1, 5, 5]), 200);
        assert_eq!(score_dice([5, 2, 2]), 50);
        // Nothing.
        assert_eq!(score_dice([2, 3, 6]), 0);
        assert_eq!(score_dice([2, 2, 6]), 0);
    }

    #[test]
    fn test_multiplier_table() {
        assert_eq!(multiplier_x10(250), 16);
        assert_eq!(multiplier_x10(600), 22);
        // Off-table totals pass through unchanged.
        assert_eq!(multiplier_x10(350), 10);
        assert_eq!(multiplier_x10(0), 10);
    }

    #[test]
    fn test_pot_growth_saturates_instead_of_wrapping() {
        // Near the top of the range a 2.2x step would wrap u64 arithmetic.
        assert_eq!(grow_pot(u64::MAX - 1, 600), u64::MAX);
        assert_eq!(grow_pot(u64::MAX / 2, 600), u64::MAX);
        // Ordinary pots stay exact.
        assert_eq!(grow_pot(10 * MICRO, 250), 16 * MICRO);
        assert_eq!(grow_pot(10 * MICRO, 350), 10 * MICRO);
    }

    #[test]
    fn test_win_chance_policy_never_promotes_bust() {
        let mut account = Account::new("a");
        account.win_chance = 5.0;
        let policy = WinChancePolicy;
        for _ in 0..100 {
            assert_eq!(policy.adjust(&account, 0), 0);
        }
    }

    #[test]
    fn test_win_chance_policy_moves_one_tier() {
        let mut account = Account::new("a");
        account.win_chance = 2.0; // always adjusts
        let policy = WinChancePolicy;
        for _ in 0..50 {
            assert_eq!(policy.adjust(&account, 250), 300);
        }
        account.win_chance = 0.0; // always demotes
        for _ in 0..50 {
            assert_eq!(policy.adjust(&account, 50), 0);
        }
    }

    #[tokio::test]
    async fn test_start_game_rejects_bad_stake() {
        let (_dir, storage, _ledger, engine) = setup();
        seed_account(&storage, "alice", 100 * MICRO);

        let err = engine
            .start_game("alice", 3 * MICRO, GameMode::Real)
            .await
            .unwrap_err();
        assert!(matches!(err, CasinoError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_start_game_debits_stake_and_creates_active_game() {
        let (_dir, storage, _ledger, engine) = setup();
        seed_account(&storage, "alice", 100 * MICRO);

        let game = engine
            .start_game("alice", 10 * MICRO, GameMode::Real)
            .await
            .unwrap();
        assert_eq!(game.status, GameStatus::Active);
        assert_eq!(game.total_pot, 10 * MICRO);

        let account = store::load_account(&storage, "alice").unwrap().unwrap();
        assert_eq!(account.cash, 90 * MICRO);

        let stored = store::load_game(&storage, &game.id).unwrap().unwrap();
        assert_eq!(stored.owner, "alice");
    }

    #[tokio::test]
    async fn test_rounds_are_gapless_and_session_balances_exactly() {
        let (_dir, storage, _ledger, engine) = setup();
        seed_account(&storage, "alice", 100 * MICRO);
        let before = 100 * MICRO;

        let game = engine
            .start_game("alice", 10 * MICRO, GameMode::Real)
            .await
            .unwrap();

        // Roll until bust or five scoring rounds, then cash out.
        let mut game_over = false;
        for i in 0..5 {
            let outcome = engine
                .roll_dice("alice", &game.id, &format!("client-{}", i))
                .await
                .unwrap();
            if outcome.game_over {
                game_over = true;
                break;
            }
        }
        let final_pot = if game_over {
            0
        } else {
            let (pot, _streak) = engine.cash_out("alice", &game.id).await.unwrap();
            pot
        };

        let rounds = store::load_rounds(&storage, &game.id).unwrap();
        let seqs: Vec<u32> = rounds.iter().map(|r| r.seq).collect();
        let expect: Vec<u32> = (1..=rounds.len() as u32).collect();
        assert_eq!(seqs, expect);

        // Exact session accounting: after = before - stake + final_pot.
        let account = store::load_account(&storage, "alice").unwrap().unwrap();
        assert_eq!(account.cash, before - 10 * MICRO + final_pot);

        let stored = store::load_game(&storage, &game.id).unwrap().unwrap();
        assert!(!stored.is_active());
        assert!(engine.verify_game(&game.id).unwrap());
    }

    #[tokio::test]
    async fn test_roll_on_foreign_game_fails_without_mutation() {
        let (_dir, storage, _ledger, engine) = setup();
        seed_account(&storage, "alice", 100 * MICRO);
        seed_account(&storage, "mallory", 100 * MICRO);

        let game = engine
            .start_game("alice", 10 * MICRO, GameMode::Real)
            .await
            .unwrap();

        let err = engine
            .roll_dice("mallory", &game.id, "seed")
            .await
            .unwrap_err();
        assert!(matches!(err, CasinoError::InvalidGameState(_)));
        assert!(store::load_rounds(&storage, &game.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_operations_on_terminal_game_fail() {
        let (_dir, storage, _ledger, engine) = setup();
        seed_account(&storage, "alice", 100 * MICRO);

        let game = engine
            .start_game("alice", 10 * MICRO, GameMode::Real)
            .await
            .unwrap();
        engine.cash_out("alice", &game.id).await.unwrap();

        let err = engine.roll_dice("alice", &game.id, "s").await.unwrap_err();
        assert!(matches!(err, CasinoError::InvalidGameState(_)));
        let err = engine.cash_out("alice", &game.id).await.unwrap_err();
        assert!(matches!(err, CasinoError::InvalidGameState(_)));

        // Double cash-out must not have paid twice.
        let account = store::load_account(&storage, "alice").unwrap().unwrap();
        assert_eq!(account.cash, 100 * MICRO);
    }

    #[tokio::test]
    async fn test_virtual_mode_only_touches_virtual_bucket() {
        let (_dir, storage, _ledger, engine) = setup();
        let mut account = Account::new("alice");
        account.cash = 50 * MICRO;
        account.virtual_funds = 50 * MICRO;
        store::store_account(&storage, &account).unwrap();

        let game = engine
            .start_game("alice", 10 * MICRO, GameMode::Virtual)
            .await
            .unwrap();
        engine.cash_out("alice", &game.id).await.unwrap();

        let account = store::load_account(&storage, "alice").unwrap().unwrap();
        assert_eq!(account.cash, 50 * MICRO);
        assert_eq!(account.virtual_funds, 50 * MICRO);
    }

    #[tokio::test]
    async fn test_win_streak_resets_on_bust() {
        let (_dir, storage, _ledger, engine) = setup();
        seed_account(&storage, "alice", 1000 * MICRO);

        // Win one game to build a streak.
        let g1 = engine
            .start_game("alice", 10 * MICRO, GameMode::Real)
            .await
            .unwrap();
        engine.cash_out("alice", &g1.id).await.unwrap();
        let account = store::load_account(&storage, "alice").unwrap().unwrap();
        assert_eq!(account.current_win_streak, 1);

        // Keep rolling fresh games until one busts.
        for _ in 0..50 {
            let g = engine
                .start_game("alice", 10 * MICRO, GameMode::Real)
                .await
                .unwrap();
            let outcome = engine.roll_dice("alice", &g.id, "c").await.unwrap();
            if outcome.game_over {
                let account = store::load_account(&storage, "alice").unwrap().unwrap();
                assert_eq!(account.current_win_streak, 0);
                return;
            }
            engine.cash_out("alice", &g.id).await.unwrap();
        }
        panic!("no bust observed in 50 single-roll games");
    }
}
