//! External chain abstraction.
//!
//! The reconciler and withdrawal path talk to TRON through this trait so
//! tests run against an in-process mock. Amounts are micro-units, the native
//! 6-decimal precision of TRC-20 USDT, so no scaling happens at this layer.

use crate::errors::{CasinoError, CasinoResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

/// An incoming stablecoin transfer observed on chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferEvent {
    /// Chain transaction hash. Unique; the reconciler's idempotency key.
    pub tx_hash: String,
    pub from: String,
    pub to: String,
    pub amount: u64,
    pub confirmations: u32,
    pub timestamp: i64,
}

/// A generated deposit wallet.
#[derive(Debug, Clone)]
pub struct Wallet {
    pub address: String,
    /// Hex-encoded private key, held by the operator's signer.
    pub private_key: String,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Generate a fresh deposit wallet for an account.
    async fn generate_wallet(&self) -> CasinoResult<Wallet>;

    /// Stablecoin balance of an address, in micro-units.
    async fn stablecoin_balance(&self, address: &str) -> CasinoResult<u64>;

    /// Native-token balance of an address, for gas monitoring.
    async fn gas_balance(&self, address: &str) -> CasinoResult<u64>;

    /// Incoming transfers to `address` at or after `since` (unix seconds).
    async fn list_new_deposits(
        &self,
        address: &str,
        since: i64,
    ) -> CasinoResult<Vec<TransferEvent>>;

    /// Send stablecoin from the hot wallet, tagged with a caller-generated
    /// reference (the withdrawal id) carried in the transfer memo. Returns
    /// the chain tx hash.
    async fn send_stablecoin(&self, to: &str, amount: u64, reference: &str)
        -> CasinoResult<String>;

    /// Look up an outgoing transfer by the reference it was sent with. Used
    /// by the reconciliation pass to decide whether a timed-out send landed;
    /// the reference pins the lookup to that one attempt, so earlier sends
    /// to the same destination and amount can never satisfy it.
    async fn find_transfer(&self, reference: &str) -> CasinoResult<Option<TransferEvent>>;

    /// Syntactic address validation, no network round trip.
    fn is_valid_address(&self, address: &str) -> bool;
}

/// In-process chain double for tests. Deposits are scripted by pushing
/// `TransferEvent`s; sends can be told to fail, hang past any timeout, or
/// "land anyway" so the reconciliation path is exercisable.
#[derive(Default)]
pub struct MockChainClient {
    deposits: Mutex<HashMap<String, Vec<TransferEvent>>>,
    /// Outgoing sends keyed by caller reference, visible to `find_transfer`.
    sent: Mutex<HashMap<String, TransferEvent>>,
    wallet_seq: AtomicU64,
    pub fail_sends: std::sync::atomic::AtomicBool,
    pub hang_sends: std::sync::atomic::AtomicBool,
    /// When hanging, also record the transfer as landed on chain.
    pub land_hung_sends: std::sync::atomic::AtomicBool,
}

impl MockChainClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_deposit(&self, event: TransferEvent) {
        self.deposits
            .lock()
            .unwrap()
            .entry(event.to.clone())
            .or_default()
            .push(event);
    }

    pub fn sent_total(&self) -> u64 {
        self.sent.lock().unwrap().values().map(|t| t.amount).sum()
    }

    fn record_send(&self, to: &str, amount: u64, reference: &str) -> String {
        let tx_hash = format!("mock-tx-{}", Uuid::new_v4());
        let event = TransferEvent {
            tx_hash: tx_hash.clone(),
            from: "hot-wallet".to_string(),
            to: to.to_string(),
            amount,
            confirmations: 1,
            timestamp: crate::models::now_secs(),
        };
        self.sent.lock().unwrap().insert(reference.to_string(), event);
        tx_hash
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn generate_wallet(&self) -> CasinoResult<Wallet> {
        let n = self.wallet_seq.fetch_add(1, Ordering::SeqCst);
        Ok(Wallet {
            address: format!("Tmock{:034}", n),
            private_key: format!("{:064x}", n),
        })
    }

    async fn stablecoin_balance(&self, address: &str) -> CasinoResult<u64> {
        let deposits = self.deposits.lock().unwrap();
        Ok(deposits
            .get(address)
            .map(|evs| evs.iter().map(|e| e.amount).sum())
            .unwrap_or(0))
    }

    async fn gas_balance(&self, _address: &str) -> CasinoResult<u64> {
        Ok(1_000_000)
    }

    async fn list_new_deposits(
        &self,
        address: &str,
        since: i64,
    ) -> CasinoResult<Vec<TransferEvent>> {
        let deposits = self.deposits.lock().unwrap();
        Ok(deposits
            .get(address)
            .map(|evs| {
                evs.iter()
                    .filter(|e| e.timestamp >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn send_stablecoin(
        &self,
        to: &str,
        amount: u64,
        reference: &str,
    ) -> CasinoResult<String> {
        if self.hang_sends.load(Ordering::SeqCst) {
            if self.land_hung_sends.load(Ordering::SeqCst) {
                self.record_send(to, amount, reference);
            }
            // Outlive any realistic caller timeout.
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            return Err(CasinoError::external_send("mock send hung"));
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(CasinoError::external_send("mock send failure"));
        }
        Ok(self.record_send(to, amount, reference))
    }

    async fn find_transfer(&self, reference: &str) -> CasinoResult<Option<TransferEvent>> {
        Ok(self.sent.lock().unwrap().get(reference).cloned())
    }

    fn is_valid_address(&self, address: &str) -> bool {
        address.starts_with('T') && address.len() >= 10
    }
}
