//! Deposit/withdrawal reconciliation against the chain.
//!
//! Deposits are idempotent on their chain tx hash: however many times the
//! same transfer arrives (webhook retry, poller overlap, concurrent
//! deliveries), it credits exactly once. Withdrawals debit pessimistically
//! before the external send; a send that fails or times out triggers a
//! compensating refund, and timed-out sends with unknown outcome are flagged
//! for a later chain re-check that can reclaim the refund if the transfer
//! actually landed.

use crate::chain::{ChainClient, TransferEvent};
use crate::config::ReconcilerConfig;
use crate::errors::{CasinoError, CasinoResult};
use crate::ledger::Ledger;
use crate::models::{
    now_secs, Deposit, DepositStatus, Withdrawal, WithdrawalStatus, MICRO,
};
use crate::storage::Storage;
use crate::store;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

pub struct Reconciler {
    storage: Storage,
    ledger: Arc<Ledger>,
    chain: Arc<dyn ChainClient>,
    config: ReconcilerConfig,
    /// Per-tx-hash locks so the dedup read and the credit commit form one
    /// critical section; concurrent deliveries of the same transfer
    /// serialize here.
    deposit_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Reconciler {
    pub fn new(
        storage: Storage,
        ledger: Arc<Ledger>,
        chain: Arc<dyn ChainClient>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            storage,
            ledger,
            chain,
            config,
            deposit_locks: DashMap::new(),
        }
    }

    fn lock_for_deposit(&self, tx_hash: &str) -> Arc<Mutex<()>> {
        self.deposit_locks
            .entry(tx_hash.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Process one observed transfer for an account. Handles webhook pushes
    /// and poller findings identically.
    ///
    /// Below-minimum transfers are ignored without a record. A transfer short
    /// of confirmations is recorded Pending and re-evaluated on the next
    /// sighting. A confirmed transfer credits cash plus the capped deposit
    /// bonus, with the deposit row riding in the ledger batch. A tx hash seen
    /// after its deposit confirmed is a `DuplicateEvent`.
    pub async fn process_deposit_event(
        &self,
        account_id: &str,
        event: &TransferEvent,
    ) -> CasinoResult<Option<Deposit>> {
        if event.amount < self.config.min_deposit_tokens * MICRO {
            tracing::debug!(
                tx_hash = %event.tx_hash,
                amount = event.amount,
                "Ignoring below-minimum deposit"
            );
            return Ok(None);
        }

        let lock = self.lock_for_deposit(&event.tx_hash);
        let _guard = lock.lock().await;

        let existing = store::load_deposit(&self.storage, &event.tx_hash)?;
        if let Some(deposit) = &existing {
            if deposit.status == DepositStatus::Confirmed {
                return Err(CasinoError::duplicate(event.tx_hash.clone()));
            }
        }

        let mut deposit = existing.unwrap_or(Deposit {
            tx_hash: event.tx_hash.clone(),
            account_id: account_id.to_string(),
            address: event.to.clone(),
            amount: event.amount,
            confirmations: event.confirmations,
            status: DepositStatus::Pending,
            bonus_granted: 0,
            created_at: now_secs(),
            credited_at: None,
        });
        deposit.confirmations = event.confirmations;

        if event.confirmations < self.config.confirmations_required {
            store::store_deposit(&self.storage, &deposit)?;
            tracing::info!(
                tx_hash = %event.tx_hash,
                confirmations = event.confirmations,
                "Deposit pending confirmations"
            );
            return Ok(Some(deposit));
        }

        let bonus_amount = self.deposit_bonus(deposit.amount);
        deposit.status = DepositStatus::Confirmed;
        deposit.bonus_granted = bonus_amount;
        deposit.credited_at = Some(now_secs());

        let bonus = if bonus_amount > 0 {
            Some((bonus_amount, self.config.wagering_multiplier))
        } else {
            None
        };
        let extra = vec![(
            store::deposit_key(&deposit.tx_hash),
            store::encode(&deposit)?,
        )];
        self.ledger
            .credit_deposit(account_id, deposit.amount, bonus, &deposit.tx_hash, extra)
            .await?;

        tracing::info!(
            tx_hash = %deposit.tx_hash,
            account = %account_id,
            amount = deposit.amount,
            bonus = bonus_amount,
            "Deposit credited"
        );
        Ok(Some(deposit))
    }

    fn deposit_bonus(&self, amount: u64) -> u64 {
        if self.config.deposit_bonus_percent == 0 {
            return 0;
        }
        // u128 intermediate keeps the percentage exact for any u64 amount.
        let raw = (amount as u128 * self.config.deposit_bonus_percent as u128 / 100) as u64;
        raw.min(self.config.deposit_bonus_cap_tokens * MICRO)
    }

    /// Check one account's deposit address for new transfers and run each
    /// through `process_deposit_event`. Duplicates are expected and skipped
    /// quietly. Returns the rows that were recorded or re-evaluated.
    pub async fn record_deposit_events(
        &self,
        account_id: &str,
        since: i64,
    ) -> CasinoResult<Vec<Deposit>> {
        let account = store::load_account(&self.storage, account_id)?.ok_or_else(|| {
            CasinoError::invalid_input(format!("unknown account {}", account_id))
        })?;
        let Some(address) = account.deposit_address else {
            return Err(CasinoError::invalid_input(format!(
                "account {} has no deposit address",
                account_id
            )));
        };

        let events = self.chain.list_new_deposits(&address, since).await?;
        let mut deposits = Vec::new();
        for event in events {
            match self.process_deposit_event(account_id, &event).await {
                Ok(Some(deposit)) => deposits.push(deposit),
                Ok(None) => {}
                Err(CasinoError::DuplicateEvent { .. }) => {}
                Err(e) => {
                    tracing::error!(tx_hash = %event.tx_hash, error = %e, "Deposit processing failed");
                }
            }
        }
        Ok(deposits)
    }

    /// One deposit-poller sweep: run the per-account check for every account
    /// with a deposit address.
    pub async fn poll_deposits(&self, since: i64) -> CasinoResult<usize> {
        let accounts = store::list_accounts_with_deposit_address(&self.storage)?;
        let mut credited = 0;
        for account in accounts {
            match self.record_deposit_events(&account.id, since).await {
                Ok(deposits) => {
                    credited += deposits
                        .iter()
                        .filter(|d| d.status == DepositStatus::Confirmed)
                        .count();
                }
                Err(e) => {
                    tracing::warn!(account = %account.id, error = %e, "Deposit poll failed");
                }
            }
        }
        Ok(credited)
    }

    /// Request a withdrawal: validate, debit cash atomically with the
    /// Processing row, then attempt the external send under a hard timeout.
    ///
    /// Outcomes: success completes the row with the chain tx id; a definite
    /// failure refunds in full; a timeout refunds too but flags the row for
    /// reconciliation because the send outcome is unknown.
    pub async fn request_withdrawal(
        &self,
        account_id: &str,
        amount: u64,
        to_address: &str,
    ) -> CasinoResult<Withdrawal> {
        if amount < self.config.min_withdrawal_tokens * MICRO {
            return Err(CasinoError::invalid_input(format!(
                "minimum withdrawal is {} tokens",
                self.config.min_withdrawal_tokens
            )));
        }
        if !self.chain.is_valid_address(to_address) {
            return Err(CasinoError::invalid_input(format!(
                "invalid destination address {}",
                to_address
            )));
        }

        let mut withdrawal = Withdrawal {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            amount,
            to_address: to_address.to_string(),
            status: WithdrawalStatus::Processing,
            chain_tx_id: None,
            refunded: false,
            needs_reconciliation: false,
            error: None,
            created_at: now_secs(),
            completed_at: None,
        };

        // Debit and the Processing row commit together; only unspendable
        // money ever leaves for the chain.
        let extra = vec![(
            store::withdrawal_key(&withdrawal.id),
            store::encode(&withdrawal)?,
        )];
        self.ledger
            .debit_withdrawal(account_id, amount, &withdrawal.id, extra)
            .await?;

        let send = tokio::time::timeout(
            Duration::from_secs(self.config.send_timeout_secs),
            self.chain.send_stablecoin(to_address, amount, &withdrawal.id),
        )
        .await;

        match send {
            Ok(Ok(tx_id)) => {
                withdrawal.status = WithdrawalStatus::Completed;
                withdrawal.chain_tx_id = Some(tx_id);
                withdrawal.completed_at = Some(now_secs());
                store::store_withdrawal(&self.storage, &withdrawal)?;
                tracing::info!(id = %withdrawal.id, amount, "Withdrawal completed");
                Ok(withdrawal)
            }
            Ok(Err(e)) => {
                self.fail_and_refund(&mut withdrawal, e.to_string(), false)
                    .await?;
                Err(CasinoError::external_send(format!(
                    "send failed, amount refunded: {}",
                    e
                )))
            }
            Err(_) => {
                // Timed out. Refund now, but the send may still land; leave a
                // reconciliation flag so the sweep can re-check the chain.
                self.fail_and_refund(&mut withdrawal, "send timed out".to_string(), true)
                    .await?;
                Err(CasinoError::external_send(
                    "send timed out, amount refunded pending reconciliation",
                ))
            }
        }
    }

    async fn fail_and_refund(
        &self,
        withdrawal: &mut Withdrawal,
        error: String,
        needs_reconciliation: bool,
    ) -> CasinoResult<()> {
        withdrawal.status = WithdrawalStatus::Failed;
        withdrawal.refunded = true;
        withdrawal.needs_reconciliation = needs_reconciliation;
        withdrawal.error = Some(error.clone());

        // The refund and the Failed row commit together. The wdrec index is
        // maintained by store_withdrawal, written after the batch; a crash in
        // between loses only the index hint, not money.
        let extra = vec![(
            store::withdrawal_key(&withdrawal.id),
            store::encode(withdrawal)?,
        )];
        self.ledger
            .refund_withdrawal(&withdrawal.account_id, withdrawal.amount, &withdrawal.id, extra)
            .await?;
        if needs_reconciliation {
            store::store_withdrawal(&self.storage, withdrawal)?;
        }
        tracing::warn!(id = %withdrawal.id, error = %error, "Withdrawal failed, refunded");
        Ok(())
    }

    /// Reconciliation sweep over flagged withdrawals: if the timed-out send
    /// is found on chain, reclaim the refund and complete the row; otherwise
    /// the refund stands and the flag clears.
    pub async fn reconcile_withdrawals(&self) -> CasinoResult<usize> {
        let flagged = store::load_reconcilable_withdrawals(&self.storage)?;
        let mut reclaimed = 0;
        for mut withdrawal in flagged {
            // Look up by the withdrawal's own reference; an earlier send of
            // the same amount to the same destination can never match.
            let found = match self.chain.find_transfer(&withdrawal.id).await {
                Ok(found) => found,
                Err(e) => {
                    tracing::warn!(id = %withdrawal.id, error = %e, "Reconciliation lookup failed");
                    continue;
                }
            };

            withdrawal.needs_reconciliation = false;
            match found {
                Some(transfer) if transfer.amount == withdrawal.amount => {
                    withdrawal.status = WithdrawalStatus::Completed;
                    withdrawal.chain_tx_id = Some(transfer.tx_hash);
                    withdrawal.refunded = false;
                    withdrawal.completed_at = Some(now_secs());

                    let extra = vec![(
                        store::withdrawal_key(&withdrawal.id),
                        store::encode(&withdrawal)?,
                    )];
                    self.ledger
                        .reclaim_refund(
                            &withdrawal.account_id,
                            withdrawal.amount,
                            &withdrawal.id,
                            extra,
                        )
                        .await?;
                    // Clear the index entry now that the row is settled.
                    store::store_withdrawal(&self.storage, &withdrawal)?;
                    reclaimed += 1;
                    tracing::info!(id = %withdrawal.id, "Timed-out send found on chain, refund reclaimed");
                }
                _ => {
                    store::store_withdrawal(&self.storage, &withdrawal)?;
                    tracing::info!(id = %withdrawal.id, "Timed-out send not on chain, refund stands");
                }
            }
        }
        Ok(reclaimed)
    }
}

/// Background worker that periodically polls deposit addresses and runs the
/// withdrawal reconciliation sweep.
pub struct DepositPoller {
    reconciler: Arc<Reconciler>,
    interval: Duration,
}

impl DepositPoller {
    pub fn new(reconciler: Arc<Reconciler>, config: &ReconcilerConfig) -> Self {
        Self {
            reconciler,
            interval: Duration::from_secs(config.poll_interval_secs),
        }
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        // Overlap the lookback window one tick to tolerate clock skew;
        // idempotency absorbs the resulting duplicates.
        let lookback = self.interval.as_secs() as i64 * 2;
        tracing::info!(interval_secs = self.interval.as_secs(), "Deposit poller started");
        loop {
            ticker.tick().await;
            let since = now_secs() - lookback;
            match self.reconciler.poll_deposits(since).await {
                Ok(credited) if credited > 0 => {
                    tracing::info!(credited, "Deposit poll credited transfers");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Deposit poll sweep failed"),
            }
            if let Err(e) = self.reconciler.reconcile_withdrawals().await {
                tracing::error!(error = %e, "Withdrawal reconciliation sweep failed");
            }
        }
    }
}
