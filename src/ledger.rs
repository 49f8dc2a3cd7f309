//! Authoritative multi-bucket ledger.
//!
//! Every balance-affecting operation serializes on a per-account async lock,
//! then commits the mutated account together with its appended
//! `LedgerTransaction` rows in a single RocksDB write batch. Callers may pass
//! extra key/value pairs (a game row, a deposit row) to ride in the same
//! batch, so a money move and the record that explains it can never diverge.
//!
//! Wagering-unlock accounting lives here too: real-mode bet debits advance
//! `wagering_progress` (monotone, capped at the requirement) and, once the
//! requirement is met, convert the locked bonus amount to cash inside the
//! same atomic unit.

use crate::errors::{CasinoError, CasinoResult};
use crate::models::{
    Account, Balances, BucketDeltas, GameMode, LedgerTransaction, TxKind, now_secs,
};
use crate::storage::Storage;
use crate::store;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Extra rows a caller wants committed atomically with a ledger operation.
pub type ExtraItems = Vec<(Vec<u8>, Vec<u8>)>;

/// One pending ledger entry inside an atomic operation.
struct Entry {
    kind: TxKind,
    deltas: BucketDeltas,
    description: String,
    reference: Option<String>,
}

pub struct Ledger {
    storage: Storage,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Ledger {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, account_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Credit a confirmed deposit, optionally granting a deposit bonus in the
    /// same atomic unit. `bonus` is `(amount, wagering_multiplier)`.
    pub async fn credit_deposit(
        &self,
        account_id: &str,
        amount: u64,
        bonus: Option<(u64, u64)>,
        reference: &str,
        extra: ExtraItems,
    ) -> CasinoResult<Vec<LedgerTransaction>> {
        let lock = self.lock_for(account_id);
        let _guard = lock.lock().await;

        let mut account = self.load(account_id)?;
        account.cash = account.cash.saturating_add(amount);
        account.total_deposited = account.total_deposited.saturating_add(amount);

        let mut entries = vec![Entry {
            kind: TxKind::Deposit,
            deltas: BucketDeltas {
                cash: amount as i64,
                ..Default::default()
            },
            description: format!("Chain deposit of {} micro", amount),
            reference: Some(reference.to_string()),
        }];

        if let Some((bonus_amount, multiplier)) = bonus {
            if bonus_amount > 0 {
                account.bonus = account.bonus.saturating_add(bonus_amount);
                account.locked = account.locked.saturating_add(bonus_amount);
                account.active_wagering_requirement = account
                    .active_wagering_requirement
                    .saturating_add(bonus_amount.saturating_mul(multiplier));
                entries.push(Entry {
                    kind: TxKind::Bonus,
                    deltas: BucketDeltas {
                        bonus: bonus_amount as i64,
                        locked: bonus_amount as i64,
                        ..Default::default()
                    },
                    description: format!(
                        "Deposit bonus {} micro ({}x wagering)",
                        bonus_amount, multiplier
                    ),
                    reference: Some(reference.to_string()),
                });
            }
        }

        self.commit(account, entries, extra)
    }

    /// Debit a stake from the playable bucket(s) of `mode`. Real-mode stakes
    /// come out of cash first, then bonus, and advance wagering progress;
    /// the wagering unlock fires here when the requirement is met.
    pub async fn debit_stake(
        &self,
        account_id: &str,
        amount: u64,
        mode: GameMode,
        game_id: &str,
        extra: ExtraItems,
    ) -> CasinoResult<Vec<LedgerTransaction>> {
        let lock = self.lock_for(account_id);
        let _guard = lock.lock().await;

        let mut account = self.load(account_id)?;
        let available = account.playable_balance(mode);
        if available < amount {
            return Err(CasinoError::InsufficientBalance {
                needed: amount,
                available,
            });
        }

        let mut deltas = BucketDeltas::default();
        match mode {
            GameMode::Real => {
                let from_cash = amount.min(account.cash);
                let from_bonus = amount - from_cash;
                account.cash -= from_cash;
                account.bonus -= from_bonus;
                deltas.cash = -(from_cash as i64);
                deltas.bonus = -(from_bonus as i64);
            }
            GameMode::Virtual => {
                account.virtual_funds -= amount;
                deltas.virtual_funds = -(amount as i64);
            }
        }

        account.games_played += 1;
        account.total_invested = account.total_invested.saturating_add(amount);

        let mut entries = vec![Entry {
            kind: TxKind::Bet,
            deltas,
            description: format!("Stake {} micro ({} mode)", amount, mode),
            reference: Some(game_id.to_string()),
        }];

        if mode == GameMode::Real {
            advance_wagering(&mut account, amount, &mut entries);
        }

        self.commit(account, entries, extra)
    }

    /// Credit a cashed-out pot back to the bucket the mode plays from.
    pub async fn credit_payout(
        &self,
        account_id: &str,
        amount: u64,
        mode: GameMode,
        game_id: &str,
        extra: ExtraItems,
    ) -> CasinoResult<Vec<LedgerTransaction>> {
        let lock = self.lock_for(account_id);
        let _guard = lock.lock().await;

        let mut account = self.load(account_id)?;
        let mut deltas = BucketDeltas::default();
        match mode {
            GameMode::Real => {
                account.cash = account.cash.saturating_add(amount);
                deltas.cash = amount as i64;
            }
            GameMode::Virtual => {
                account.virtual_funds = account.virtual_funds.saturating_add(amount);
                deltas.virtual_funds = amount as i64;
            }
        }

        account.current_win_streak += 1;
        account.max_win_streak = account.max_win_streak.max(account.current_win_streak);

        let entries = vec![Entry {
            kind: TxKind::Payout,
            deltas,
            description: format!("Cash out {} micro ({} mode)", amount, mode),
            reference: Some(game_id.to_string()),
        }];

        self.commit(account, entries, extra)
    }

    /// Reset the win streak after a bust. Not a money move, but serialized
    /// under the account lock with the busted game row.
    pub async fn record_bust(&self, account_id: &str, extra: ExtraItems) -> CasinoResult<()> {
        let lock = self.lock_for(account_id);
        let _guard = lock.lock().await;

        let mut account = self.load(account_id)?;
        account.current_win_streak = 0;

        let mut items: ExtraItems = vec![(
            store::account_key(&account.id),
            store::encode(&account)?,
        )];
        items.extend(extra);
        self.storage.batch_write(&items)?;
        Ok(())
    }

    /// Debit a withdrawal request from cash, pessimistically, before any
    /// external send is attempted.
    pub async fn debit_withdrawal(
        &self,
        account_id: &str,
        amount: u64,
        withdrawal_id: &str,
        extra: ExtraItems,
    ) -> CasinoResult<Vec<LedgerTransaction>> {
        let lock = self.lock_for(account_id);
        let _guard = lock.lock().await;

        let mut account = self.load(account_id)?;
        if account.cash < amount {
            return Err(CasinoError::InsufficientBalance {
                needed: amount,
                available: account.cash,
            });
        }
        account.cash -= amount;
        account.total_withdrawn = account.total_withdrawn.saturating_add(amount);

        let entries = vec![Entry {
            kind: TxKind::Withdrawal,
            deltas: BucketDeltas {
                cash: -(amount as i64),
                ..Default::default()
            },
            description: format!("Withdrawal debit {} micro", amount),
            reference: Some(withdrawal_id.to_string()),
        }];

        self.commit(account, entries, extra)
    }

    /// Compensating credit after a failed or timed-out external send.
    pub async fn refund_withdrawal(
        &self,
        account_id: &str,
        amount: u64,
        withdrawal_id: &str,
        extra: ExtraItems,
    ) -> CasinoResult<Vec<LedgerTransaction>> {
        let lock = self.lock_for(account_id);
        let _guard = lock.lock().await;

        let mut account = self.load(account_id)?;
        account.cash = account.cash.saturating_add(amount);
        account.total_withdrawn = account.total_withdrawn.saturating_sub(amount);

        let entries = vec![Entry {
            kind: TxKind::Withdrawal,
            deltas: BucketDeltas {
                cash: amount as i64,
                ..Default::default()
            },
            description: format!("Withdrawal refund {} micro", amount),
            reference: Some(withdrawal_id.to_string()),
        }];

        self.commit(account, entries, extra)
    }

    /// Re-apply a withdrawal debit after reconciliation found that a
    /// previously refunded send actually landed on-chain.
    pub async fn reclaim_refund(
        &self,
        account_id: &str,
        amount: u64,
        withdrawal_id: &str,
        extra: ExtraItems,
    ) -> CasinoResult<Vec<LedgerTransaction>> {
        let lock = self.lock_for(account_id);
        let _guard = lock.lock().await;

        let mut account = self.load(account_id)?;
        // The refund may already have been spent; claw back what is there.
        let reclaimed = amount.min(account.cash);
        account.cash -= reclaimed;
        account.total_withdrawn = account.total_withdrawn.saturating_add(amount);

        let entries = vec![Entry {
            kind: TxKind::Withdrawal,
            deltas: BucketDeltas {
                cash: -(reclaimed as i64),
                ..Default::default()
            },
            description: format!(
                "Reconciled send confirmed on-chain; reclaimed {} of {} micro",
                reclaimed, amount
            ),
            reference: Some(withdrawal_id.to_string()),
        }];

        self.commit(account, entries, extra)
    }

    /// Grant a standalone bonus with a wagering requirement attached.
    pub async fn grant_bonus(
        &self,
        account_id: &str,
        amount: u64,
        multiplier: u64,
        reference: &str,
    ) -> CasinoResult<Vec<LedgerTransaction>> {
        if amount == 0 {
            return Err(CasinoError::invalid_input("bonus amount must be positive"));
        }
        let lock = self.lock_for(account_id);
        let _guard = lock.lock().await;

        let mut account = self.load(account_id)?;
        account.bonus = account.bonus.saturating_add(amount);
        account.locked = account.locked.saturating_add(amount);
        account.active_wagering_requirement = account
            .active_wagering_requirement
            .saturating_add(amount.saturating_mul(multiplier));

        let entries = vec![Entry {
            kind: TxKind::Bonus,
            deltas: BucketDeltas {
                bonus: amount as i64,
                locked: amount as i64,
                ..Default::default()
            },
            description: format!("Bonus grant {} micro ({}x wagering)", amount, multiplier),
            reference: Some(reference.to_string()),
        }];

        self.commit(account, entries, extra_none())
    }

    fn load(&self, account_id: &str) -> CasinoResult<Account> {
        store::load_account(&self.storage, account_id)?
            .ok_or_else(|| CasinoError::invalid_input(format!("unknown account {}", account_id)))
    }

    /// Apply pending entries to the (already mutated) account and write
    /// everything in one batch. `balances_after` on each entry reflects the
    /// account state after that entry's deltas, in order.
    fn commit(
        &self,
        mut account: Account,
        entries: Vec<Entry>,
        extra: ExtraItems,
    ) -> CasinoResult<Vec<LedgerTransaction>> {
        let final_balances = account.balances();
        let mut running = final_balances;
        // Walk entries backwards to reconstruct intermediate balances.
        let mut txs: Vec<LedgerTransaction> = Vec::with_capacity(entries.len());
        let mut afters: Vec<Balances> = Vec::with_capacity(entries.len());
        for entry in entries.iter().rev() {
            afters.push(running);
            running = apply_deltas(running, invert(entry.deltas));
        }
        afters.reverse();

        let timestamp = now_secs();
        for (entry, balances_after) in entries.into_iter().zip(afters) {
            account.tx_seq += 1;
            txs.push(LedgerTransaction {
                account_id: account.id.clone(),
                seq: account.tx_seq,
                kind: entry.kind,
                deltas: entry.deltas,
                balances_after,
                description: entry.description,
                reference: entry.reference,
                timestamp,
            });
        }

        let mut items: ExtraItems = Vec::with_capacity(2 + txs.len() + extra.len());
        items.push((store::account_key(&account.id), store::encode(&account)?));
        for tx in &txs {
            items.push((store::tx_key(&tx.account_id, tx.seq), store::encode(tx)?));
        }
        items.extend(extra);

        self.storage.batch_write(&items)?;
        Ok(txs)
    }
}

fn extra_none() -> ExtraItems {
    Vec::new()
}

/// Advance wagering progress by a real-mode bet and, if the requirement is
/// now met, convert the unlockable bonus to cash. Progress never decreases
/// and never exceeds the requirement.
fn advance_wagering(account: &mut Account, bet: u64, entries: &mut Vec<Entry>) {
    if account.active_wagering_requirement == 0 {
        return;
    }

    account.wagering_progress = account
        .wagering_progress
        .saturating_add(bet)
        .min(account.active_wagering_requirement);

    if account.wagering_progress < account.active_wagering_requirement {
        return;
    }

    // Unlock: what remains of the bonus converts, never more than was locked.
    let unlock = account.locked.min(account.bonus);
    let released_lock = account.locked;
    account.cash = account.cash.saturating_add(unlock);
    account.bonus -= unlock;
    account.locked = 0;
    account.active_wagering_requirement = 0;
    account.wagering_progress = 0;

    entries.push(Entry {
        kind: TxKind::Bonus,
        deltas: BucketDeltas {
            cash: unlock as i64,
            bonus: -(unlock as i64),
            locked: -(released_lock as i64),
            ..Default::default()
        },
        description: format!("Wagering requirement met; {} micro unlocked", unlock),
        reference: None,
    });
}

fn apply_deltas(b: Balances, d: BucketDeltas) -> Balances {
    Balances {
        cash: (b.cash as i64 + d.cash).max(0) as u64,
        bonus: (b.bonus as i64 + d.bonus).max(0) as u64,
        locked: (b.locked as i64 + d.locked).max(0) as u64,
        virtual_funds: (b.virtual_funds as i64 + d.virtual_funds).max(0) as u64,
    }
}

fn invert(d: BucketDeltas) -> BucketDeltas {
    BucketDeltas {
        cash: -d.cash,
        bonus: -d.bonus,
        locked: -d.locked,
        virtual_funds: -d.virtual_funds,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MICRO;

    fn setup() -> (tempfile::TempDir, Storage, Ledger) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let ledger = Ledger::new(storage.clone());
        (dir, storage, ledger)
    }

    fn seed_account(storage: &Storage, id: &str, cash: u64) {
        let mut account = Account::new(id);
        account.cash = cash;
        store::store_account(storage, &account).unwrap();
    }

    #[tokio::test]
    async fn test_deposit_credit_appends_consistent_transaction() {
        let (_dir, storage, ledger) = setup();
        seed_account(&storage, "alice", 0);

        let txs = ledger
            .credit_deposit("alice", 50 * MICRO, None, "hash-1", Vec::new())
            .await
            .unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].deltas.cash, (50 * MICRO) as i64);
        assert_eq!(txs[0].balances_after.cash, 50 * MICRO);

        let account = store::load_account(&storage, "alice").unwrap().unwrap();
        assert_eq!(account.cash, 50 * MICRO);
        assert_eq!(account.total_deposited, 50 * MICRO);
        assert_eq!(account.tx_seq, 1);
    }

    #[tokio::test]
    async fn test_deposit_with_bonus_writes_two_entries_atomically() {
        let (_dir, storage, ledger) = setup();
        seed_account(&storage, "alice", 0);

        let txs = ledger
            .credit_deposit("alice", 100 * MICRO, Some((10 * MICRO, 20)), "hash-2", Vec::new())
            .await
            .unwrap();
        assert_eq!(txs.len(), 2);
        assert_eq!(txs[0].kind, TxKind::Deposit);
        assert_eq!(txs[1].kind, TxKind::Bonus);
        // Intermediate balances: first entry sees only the cash credit.
        assert_eq!(txs[0].balances_after.bonus, 0);
        assert_eq!(txs[1].balances_after.bonus, 10 * MICRO);

        let account = store::load_account(&storage, "alice").unwrap().unwrap();
        assert_eq!(account.active_wagering_requirement, 200 * MICRO);
        assert_eq!(account.locked, 10 * MICRO);
    }

    #[tokio::test]
    async fn test_stake_debit_rejects_insufficient_balance() {
        let (_dir, storage, ledger) = setup();
        seed_account(&storage, "alice", 5 * MICRO);

        let err = ledger
            .debit_stake("alice", 10 * MICRO, GameMode::Real, "g1", Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CasinoError::InsufficientBalance { .. }));

        // No mutation happened.
        let account = store::load_account(&storage, "alice").unwrap().unwrap();
        assert_eq!(account.cash, 5 * MICRO);
        assert_eq!(account.tx_seq, 0);
    }

    #[tokio::test]
    async fn test_stake_splits_cash_then_bonus() {
        let (_dir, storage, ledger) = setup();
        let mut account = Account::new("alice");
        account.cash = 3 * MICRO;
        account.bonus = 10 * MICRO;
        store::store_account(&storage, &account).unwrap();

        let txs = ledger
            .debit_stake("alice", 5 * MICRO, GameMode::Real, "g1", Vec::new())
            .await
            .unwrap();
        assert_eq!(txs[0].deltas.cash, -(3 * MICRO as i64));
        assert_eq!(txs[0].deltas.bonus, -(2 * MICRO as i64));

        let account = store::load_account(&storage, "alice").unwrap().unwrap();
        assert_eq!(account.cash, 0);
        assert_eq!(account.bonus, 8 * MICRO);
        assert_eq!(account.games_played, 1);
    }

    #[tokio::test]
    async fn test_wagering_progress_monotone_and_capped() {
        let (_dir, storage, ledger) = setup();
        seed_account(&storage, "alice", 1000 * MICRO);
        ledger
            .grant_bonus("alice", 10 * MICRO, 2, "promo")
            .await
            .unwrap();

        // Requirement is 20; a 15 bet advances progress to 15.
        ledger
            .debit_stake("alice", 15 * MICRO, GameMode::Real, "g1", Vec::new())
            .await
            .unwrap();
        let account = store::load_account(&storage, "alice").unwrap().unwrap();
        assert_eq!(account.wagering_progress, 15 * MICRO);
        assert!(account.wagering_progress <= account.active_wagering_requirement);

        // Next bet crosses the requirement; the bonus unlocks to cash.
        ledger
            .debit_stake("alice", 15 * MICRO, GameMode::Real, "g2", Vec::new())
            .await
            .unwrap();
        let account = store::load_account(&storage, "alice").unwrap().unwrap();
        assert_eq!(account.active_wagering_requirement, 0);
        assert_eq!(account.wagering_progress, 0);
        assert_eq!(account.locked, 0);
        assert_eq!(account.bonus, 0);
        // 1000 deposit-free cash - 30 staked + 10 unlocked bonus.
        assert_eq!(account.cash, (1000 - 30 + 10) * MICRO);
    }

    #[tokio::test]
    async fn test_withdrawal_refund_restores_exact_balance() {
        let (_dir, storage, ledger) = setup();
        seed_account(&storage, "alice", 80 * MICRO);

        ledger
            .debit_withdrawal("alice", 30 * MICRO, "w1", Vec::new())
            .await
            .unwrap();
        let mid = store::load_account(&storage, "alice").unwrap().unwrap();
        assert_eq!(mid.cash, 50 * MICRO);
        assert_eq!(mid.total_withdrawn, 30 * MICRO);

        ledger
            .refund_withdrawal("alice", 30 * MICRO, "w1", Vec::new())
            .await
            .unwrap();
        let after = store::load_account(&storage, "alice").unwrap().unwrap();
        assert_eq!(after.cash, 80 * MICRO);
        assert_eq!(after.total_withdrawn, 0);
    }

    #[tokio::test]
    async fn test_transaction_log_is_dense_and_balanced() {
        let (_dir, storage, ledger) = setup();
        seed_account(&storage, "alice", 100 * MICRO);

        ledger
            .debit_stake("alice", 10 * MICRO, GameMode::Real, "g1", Vec::new())
            .await
            .unwrap();
        ledger
            .credit_payout("alice", 16 * MICRO, GameMode::Real, "g1", Vec::new())
            .await
            .unwrap();

        let txs = store::load_transactions(&storage, "alice", 100).unwrap();
        assert_eq!(txs.len(), 2);
        let seqs: Vec<u64> = txs.iter().map(|t| t.seq).collect();
        assert_eq!(seqs, vec![1, 2]);

        // balances_after must chain: prior balances + deltas.
        let mut running = Balances {
            cash: 100 * MICRO,
            ..Default::default()
        };
        for tx in &txs {
            running = apply_deltas(running, tx.deltas);
            assert_eq!(running, tx.balances_after);
        }
        assert_eq!(running.cash, 106 * MICRO);
    }

    #[tokio::test]
    async fn test_concurrent_stakes_serialize_per_account() {
        let (_dir, storage, ledger) = setup();
        seed_account(&storage, "alice", 10 * MICRO);
        let ledger = Arc::new(ledger);

        // Two concurrent 10-token stakes; exactly one can succeed.
        let a = {
            let l = ledger.clone();
            tokio::spawn(async move {
                l.debit_stake("alice", 10 * MICRO, GameMode::Real, "g1", Vec::new())
                    .await
            })
        };
        let b = {
            let l = ledger.clone();
            tokio::spawn(async move {
                l.debit_stake("alice", 10 * MICRO, GameMode::Real, "g2", Vec::new())
                    .await
            })
        };

        let results = [a.await.unwrap(), b.await.unwrap()];
        let ok = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(ok, 1);

        let account = store::load_account(&storage, "alice").unwrap().unwrap();
        assert_eq!(account.cash, 0);
    }
}
