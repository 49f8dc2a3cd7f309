//! Persistent domain records in RocksDB.
//!
//! Key schema (all values serde_json):
//!   account:{id}                     -> Account
//!   game:{id}                        -> Game
//!   round:{game_id}:{seq:06}         -> Round        (ordered scan per game)
//!   tx:{account_id}:{seq:020}        -> LedgerTransaction (append-only)
//!   deposit:{tx_hash}                -> Deposit      (tx hash is the unique key)
//!   wd:{id}                          -> Withdrawal
//!   wdrec:{id}                       -> ()           (reconciliation index)
//!   period:{affiliate_id}:{id}       -> PayoutPeriod
//!   ongoing:{affiliate_id}           -> period id    (at most one per affiliate)
//!   ref:{affiliate_id}:{account_id}  -> ()           (referral index)
//!   foldmark:{affiliate_id}:{account} -> i64         (profit already folded)

use crate::errors::{CasinoError, CasinoResult};
use crate::models::{Account, Deposit, Game, LedgerTransaction, PayoutPeriod, Round, Withdrawal};
use crate::storage::Storage;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub fn account_key(id: &str) -> Vec<u8> {
    format!("account:{}", id).into_bytes()
}

pub fn game_key(id: &str) -> Vec<u8> {
    format!("game:{}", id).into_bytes()
}

pub fn round_key(game_id: &str, seq: u32) -> Vec<u8> {
    format!("round:{}:{:06}", game_id, seq).into_bytes()
}

pub fn tx_key(account_id: &str, seq: u64) -> Vec<u8> {
    format!("tx:{}:{:020}", account_id, seq).into_bytes()
}

pub fn deposit_key(tx_hash: &str) -> Vec<u8> {
    format!("deposit:{}", tx_hash).into_bytes()
}

pub fn withdrawal_key(id: &str) -> Vec<u8> {
    format!("wd:{}", id).into_bytes()
}

fn reconcile_index_key(id: &str) -> Vec<u8> {
    format!("wdrec:{}", id).into_bytes()
}

fn period_key(affiliate_id: &str, id: &str) -> Vec<u8> {
    format!("period:{}:{}", affiliate_id, id).into_bytes()
}

fn ongoing_key(affiliate_id: &str) -> Vec<u8> {
    format!("ongoing:{}", affiliate_id).into_bytes()
}

fn referral_key(affiliate_id: &str, account_id: &str) -> Vec<u8> {
    format!("ref:{}:{}", affiliate_id, account_id).into_bytes()
}

fn fold_mark_key(affiliate_id: &str, account_id: &str) -> Vec<u8> {
    format!("foldmark:{}:{}", affiliate_id, account_id).into_bytes()
}

pub fn encode<T: Serialize>(value: &T) -> CasinoResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(CasinoError::from)
}

fn get_json<T: DeserializeOwned>(storage: &Storage, key: &[u8]) -> CasinoResult<Option<T>> {
    let Some(bytes) = storage.get(key) else {
        return Ok(None);
    };
    let value = serde_json::from_slice(&bytes).map_err(|e| {
        CasinoError::storage(format!(
            "Corrupt record at {}: {}",
            String::from_utf8_lossy(key),
            e
        ))
    })?;
    Ok(Some(value))
}

fn put_json<T: Serialize>(storage: &Storage, key: &[u8], value: &T) -> CasinoResult<()> {
    storage.put(key, &encode(value)?)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Accounts

pub fn load_account(storage: &Storage, id: &str) -> CasinoResult<Option<Account>> {
    get_json(storage, &account_key(id))
}

pub fn store_account(storage: &Storage, account: &Account) -> CasinoResult<()> {
    put_json(storage, &account_key(&account.id), account)
}

/// Create-or-register: stores the account and, when it carries a referrer,
/// the referral index row the affiliate accrual pass iterates.
pub fn register_account(storage: &Storage, account: &Account) -> CasinoResult<()> {
    let mut items: Vec<(Vec<u8>, Vec<u8>)> =
        vec![(account_key(&account.id), encode(account)?)];
    if let Some(referrer) = &account.referrer {
        items.push((referral_key(referrer, &account.id), Vec::new()));
    }
    storage.batch_write(&items)?;
    Ok(())
}

/// Account ids with an assigned deposit address, for the deposit poller.
pub fn list_accounts_with_deposit_address(storage: &Storage) -> CasinoResult<Vec<Account>> {
    let rows = storage.scan_prefix(b"account:", None, usize::MAX);
    let mut accounts = Vec::new();
    for (key, value) in rows {
        let account: Account = serde_json::from_slice(&value).map_err(|e| {
            CasinoError::storage(format!(
                "Corrupt account at {}: {}",
                String::from_utf8_lossy(&key),
                e
            ))
        })?;
        if account.deposit_address.is_some() {
            accounts.push(account);
        }
    }
    Ok(accounts)
}

// ---------------------------------------------------------------------------
// Games and rounds

pub fn load_game(storage: &Storage, id: &str) -> CasinoResult<Option<Game>> {
    get_json(storage, &game_key(id))
}

pub fn store_game(storage: &Storage, game: &Game) -> CasinoResult<()> {
    put_json(storage, &game_key(&game.id), game)
}

/// All rounds of a game in sequence order.
pub fn load_rounds(storage: &Storage, game_id: &str) -> CasinoResult<Vec<Round>> {
    let prefix = format!("round:{}:", game_id).into_bytes();
    let rows = storage.scan_prefix(&prefix, None, usize::MAX);
    let mut rounds = Vec::with_capacity(rows.len());
    for (key, value) in rows {
        let round: Round = serde_json::from_slice(&value).map_err(|e| {
            CasinoError::storage(format!(
                "Corrupt round at {}: {}",
                String::from_utf8_lossy(&key),
                e
            ))
        })?;
        rounds.push(round);
    }
    Ok(rounds)
}

// ---------------------------------------------------------------------------
// Ledger transactions

/// Most recent transactions for an account, newest last.
pub fn load_transactions(
    storage: &Storage,
    account_id: &str,
    limit: usize,
) -> CasinoResult<Vec<LedgerTransaction>> {
    let prefix = format!("tx:{}:", account_id).into_bytes();
    let rows = storage.scan_prefix(&prefix, None, usize::MAX);
    let mut txs = Vec::new();
    for (key, value) in rows {
        let tx: LedgerTransaction = serde_json::from_slice(&value).map_err(|e| {
            CasinoError::storage(format!(
                "Corrupt transaction at {}: {}",
                String::from_utf8_lossy(&key),
                e
            ))
        })?;
        txs.push(tx);
    }
    if txs.len() > limit {
        let skip = txs.len() - limit;
        txs.drain(..skip);
    }
    Ok(txs)
}

// ---------------------------------------------------------------------------
// Deposits and withdrawals

pub fn load_deposit(storage: &Storage, tx_hash: &str) -> CasinoResult<Option<Deposit>> {
    get_json(storage, &deposit_key(tx_hash))
}

pub fn store_deposit(storage: &Storage, deposit: &Deposit) -> CasinoResult<()> {
    put_json(storage, &deposit_key(&deposit.tx_hash), deposit)
}

pub fn load_withdrawal(storage: &Storage, id: &str) -> CasinoResult<Option<Withdrawal>> {
    get_json(storage, &withdrawal_key(id))
}

/// Store a withdrawal and keep the reconciliation index in step: rows that
/// need a chain re-check get an index entry, settled rows lose it.
pub fn store_withdrawal(storage: &Storage, withdrawal: &Withdrawal) -> CasinoResult<()> {
    let index_key = reconcile_index_key(&withdrawal.id);
    if withdrawal.needs_reconciliation {
        storage.batch_write(&[
            (withdrawal_key(&withdrawal.id), encode(withdrawal)?),
            (index_key, Vec::new()),
        ])?;
    } else {
        put_json(storage, &withdrawal_key(&withdrawal.id), withdrawal)?;
        storage.delete(&index_key).ok();
    }
    Ok(())
}

/// Withdrawals flagged for a chain re-check.
pub fn load_reconcilable_withdrawals(storage: &Storage) -> CasinoResult<Vec<Withdrawal>> {
    let rows = storage.scan_prefix(b"wdrec:", None, usize::MAX);
    let mut withdrawals = Vec::new();
    for (key, _) in rows {
        let id = String::from_utf8_lossy(&key)
            .trim_start_matches("wdrec:")
            .to_string();
        match load_withdrawal(storage, &id)? {
            Some(wd) => withdrawals.push(wd),
            None => {
                tracing::warn!(id = %id, "Reconciliation index points at missing withdrawal");
            }
        }
    }
    Ok(withdrawals)
}

// ---------------------------------------------------------------------------
// Affiliate periods

pub fn load_period(
    storage: &Storage,
    affiliate_id: &str,
    id: &str,
) -> CasinoResult<Option<PayoutPeriod>> {
    get_json(storage, &period_key(affiliate_id, id))
}

/// Store a period and keep the one-ongoing-per-affiliate pointer in step.
pub fn store_period(storage: &Storage, period: &PayoutPeriod) -> CasinoResult<()> {
    use crate::models::PeriodStatus;

    let key = period_key(&period.affiliate_id, &period.id);
    if period.status == PeriodStatus::Ongoing {
        storage.batch_write(&[
            (key, encode(period)?),
            (ongoing_key(&period.affiliate_id), period.id.clone().into_bytes()),
        ])?;
    } else {
        put_json(storage, &key, period)?;
        // Only clear the pointer if it still names this period.
        if load_ongoing_period_id(storage, &period.affiliate_id).as_deref() == Some(&period.id) {
            storage.delete(&ongoing_key(&period.affiliate_id)).ok();
        }
    }
    Ok(())
}

pub fn load_ongoing_period_id(storage: &Storage, affiliate_id: &str) -> Option<String> {
    storage
        .get(&ongoing_key(affiliate_id))
        .map(|b| String::from_utf8_lossy(&b).to_string())
}

pub fn load_ongoing_period(
    storage: &Storage,
    affiliate_id: &str,
) -> CasinoResult<Option<PayoutPeriod>> {
    match load_ongoing_period_id(storage, affiliate_id) {
        Some(id) => load_period(storage, affiliate_id, &id),
        None => Ok(None),
    }
}

pub fn load_periods(storage: &Storage, affiliate_id: &str) -> CasinoResult<Vec<PayoutPeriod>> {
    let prefix = format!("period:{}:", affiliate_id).into_bytes();
    let rows = storage.scan_prefix(&prefix, None, usize::MAX);
    let mut periods = Vec::with_capacity(rows.len());
    for (key, value) in rows {
        let period: PayoutPeriod = serde_json::from_slice(&value).map_err(|e| {
            CasinoError::storage(format!(
                "Corrupt period at {}: {}",
                String::from_utf8_lossy(&key),
                e
            ))
        })?;
        periods.push(period);
    }
    Ok(periods)
}

/// Account ids referred by an affiliate.
pub fn load_referrals(storage: &Storage, affiliate_id: &str) -> Vec<String> {
    let prefix = format!("ref:{}:", affiliate_id);
    storage
        .scan_prefix(prefix.as_bytes(), None, usize::MAX)
        .into_iter()
        .map(|(key, _)| {
            String::from_utf8_lossy(&key)
                .trim_start_matches(&prefix)
                .to_string()
        })
        .collect()
}

/// Affiliate ids that have at least one referral.
pub fn list_affiliates(storage: &Storage) -> Vec<String> {
    let rows = storage.scan_prefix(b"ref:", None, usize::MAX);
    let mut affiliates: Vec<String> = Vec::new();
    for (key, _) in rows {
        let rest = String::from_utf8_lossy(&key);
        let rest = rest.trim_start_matches("ref:");
        if let Some((affiliate, _)) = rest.split_once(':') {
            if affiliates.last().map(String::as_str) != Some(affiliate) {
                affiliates.push(affiliate.to_string());
            }
        }
    }
    affiliates
}

/// Net profit of a referral already folded into any of the affiliate's
/// periods. Global per (affiliate, referral), so a fresh period only sees
/// flow since the previous one closed.
pub fn load_fold_mark(storage: &Storage, affiliate_id: &str, account_id: &str) -> i64 {
    storage
        .get(&fold_mark_key(affiliate_id, account_id))
        .and_then(|b| String::from_utf8_lossy(&b).parse().ok())
        .unwrap_or(0)
}

/// Persist fold marks together with their period in one batch, so an accrual
/// pass can never double count after a crash between the two writes.
pub fn store_period_with_fold_marks(
    storage: &Storage,
    period: &PayoutPeriod,
    marks: &[(String, i64)],
) -> CasinoResult<()> {
    let mut items: Vec<(Vec<u8>, Vec<u8>)> = vec![(
        period_key(&period.affiliate_id, &period.id),
        encode(period)?,
    )];
    for (account_id, profit) in marks {
        items.push((
            fold_mark_key(&period.affiliate_id, account_id),
            profit.to_string().into_bytes(),
        ));
    }
    storage.batch_write(&items)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{now_secs, PeriodStatus};

    fn open() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        (dir, storage)
    }

    #[test]
    fn test_account_round_trip_and_referral_index() {
        let (_dir, storage) = open();

        let mut account = Account::new("alice");
        account.referrer = Some("bob".to_string());
        register_account(&storage, &account).unwrap();

        let loaded = load_account(&storage, "alice").unwrap().unwrap();
        assert_eq!(loaded.id, "alice");
        assert_eq!(load_referrals(&storage, "bob"), vec!["alice".to_string()]);
        assert_eq!(list_affiliates(&storage), vec!["bob".to_string()]);
    }

    #[test]
    fn test_rounds_scan_in_sequence_order() {
        let (_dir, storage) = open();

        for seq in [3u32, 1, 2] {
            let round = Round {
                game_id: "g1".to_string(),
                seq,
                dice: [1, 2, 3],
                points: 100,
                multiplier_x10: 12,
                pot_before: 10,
                pot_after: 12,
                server_seed: "s".to_string(),
                client_seed: "c".to_string(),
                nonce: seq,
                timestamp: now_secs(),
            };
            put_json(&storage, &round_key("g1", seq), &round).unwrap();
        }

        let rounds = load_rounds(&storage, "g1").unwrap();
        let seqs: Vec<u32> = rounds.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn test_withdrawal_reconcile_index_tracks_flag() {
        let (_dir, storage) = open();

        let mut wd = Withdrawal {
            id: "w1".to_string(),
            account_id: "alice".to_string(),
            amount: 100,
            to_address: "T123".to_string(),
            status: crate::models::WithdrawalStatus::Failed,
            chain_tx_id: None,
            refunded: true,
            needs_reconciliation: true,
            error: Some("timeout".to_string()),
            created_at: now_secs(),
            completed_at: None,
        };
        store_withdrawal(&storage, &wd).unwrap();
        assert_eq!(load_reconcilable_withdrawals(&storage).unwrap().len(), 1);

        wd.needs_reconciliation = false;
        store_withdrawal(&storage, &wd).unwrap();
        assert!(load_reconcilable_withdrawals(&storage).unwrap().is_empty());
    }

    #[test]
    fn test_ongoing_period_pointer() {
        let (_dir, storage) = open();

        let mut period = PayoutPeriod {
            id: "p1".to_string(),
            affiliate_id: "bob".to_string(),
            period_start: 0,
            period_end: 100,
            total_profit: 0,
            commission: 0,
            rate: 20,
            status: PeriodStatus::Ongoing,
            finished_at: None,
        };
        store_period(&storage, &period).unwrap();
        assert_eq!(
            load_ongoing_period(&storage, "bob").unwrap().unwrap().id,
            "p1"
        );

        period.status = PeriodStatus::Pending;
        store_period(&storage, &period).unwrap();
        assert!(load_ongoing_period(&storage, "bob").unwrap().is_none());
    }

    #[test]
    fn test_fold_marks_round_trip() {
        let (_dir, storage) = open();

        let period = PayoutPeriod {
            id: "p2".to_string(),
            affiliate_id: "bob".to_string(),
            period_start: 0,
            period_end: 100,
            total_profit: 55,
            commission: 11,
            rate: 20,
            status: PeriodStatus::Ongoing,
            finished_at: None,
        };
        store_period_with_fold_marks(&storage, &period, &[("alice".to_string(), 55)]).unwrap();

        assert_eq!(load_fold_mark(&storage, "bob", "alice"), 55);
        assert_eq!(load_fold_mark(&storage, "bob", "carol"), 0);
    }
}
