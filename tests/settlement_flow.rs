//! End-to-end settlement flow over a real RocksDB store and the mock chain:
//! register, deposit with bonus, play through the wagering requirement,
//! withdraw through a failing send, and verify the ledger stayed exact.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use tresdice::chain::{MockChainClient, TransferEvent};
use tresdice::models::{now_secs, Account, DepositStatus, GameMode, GameStatus, MICRO};
use tresdice::store;
use tresdice::{CasinoConfig, ServiceContainer};

fn build_container(dir: &tempfile::TempDir) -> (Arc<MockChainClient>, ServiceContainer) {
    let mut config = CasinoConfig::default();
    config.storage.data_dir = dir.path().to_string_lossy().to_string();
    let chain = Arc::new(MockChainClient::new());
    let container = ServiceContainer::new(config, chain.clone()).unwrap();
    (chain, container)
}

fn deposit_event(tx_hash: &str, to: &str, amount: u64) -> TransferEvent {
    TransferEvent {
        tx_hash: tx_hash.to_string(),
        from: "Tplayerwallet0001".to_string(),
        to: to.to_string(),
        amount,
        confirmations: 2,
        timestamp: now_secs(),
    }
}

#[tokio::test]
async fn test_full_settlement_flow() {
    let dir = tempfile::tempdir().unwrap();
    let (chain, container) = build_container(&dir);
    let storage = container.storage();

    // Register alice with bob as referrer and a generated deposit wallet.
    let wallet = container.chain().generate_wallet().await.unwrap();
    let mut alice = Account::new("alice");
    alice.deposit_address = Some(wallet.address.clone());
    alice.referrer = Some("bob".to_string());
    store::register_account(&storage, &alice).unwrap();

    // A 100-token deposit credits cash plus a 10-token bonus at 20x wagering.
    let deposit = container
        .reconciler()
        .process_deposit_event("alice", &deposit_event("tx-dep-1", &wallet.address, 100 * MICRO))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(deposit.status, DepositStatus::Confirmed);
    assert_eq!(deposit.bonus_granted, 10 * MICRO);

    let account = store::load_account(&storage, "alice").unwrap().unwrap();
    assert_eq!(account.cash, 100 * MICRO);
    assert_eq!(account.bonus, 10 * MICRO);
    assert_eq!(account.locked, 10 * MICRO);
    assert_eq!(account.active_wagering_requirement, 200 * MICRO);

    // A replay of the same webhook must not credit twice.
    let replay = container
        .reconciler()
        .process_deposit_event("alice", &deposit_event("tx-dep-1", &wallet.address, 100 * MICRO))
        .await;
    assert!(replay.is_err());
    let account = store::load_account(&storage, "alice").unwrap().unwrap();
    assert_eq!(account.total_deposited, 100 * MICRO);

    // Play real-mode games until the 200-token wagering requirement is met.
    // Stakes count toward progress whether the game wins or busts.
    let game_engine = container.game();
    let mut played = 0u64;
    while store::load_account(&storage, "alice")
        .unwrap()
        .unwrap()
        .active_wagering_requirement
        > 0
    {
        let account = store::load_account(&storage, "alice").unwrap().unwrap();
        if account.playable_balance(GameMode::Real) < 10 * MICRO {
            break;
        }
        let game = game_engine
            .start_game("alice", 10 * MICRO, GameMode::Real)
            .await
            .unwrap();
        let outcome = game_engine
            .roll_dice("alice", &game.id, "integration-seed")
            .await
            .unwrap();
        if !outcome.game_over {
            game_engine.cash_out("alice", &game.id).await.unwrap();
        }
        played += 1;
        assert!(played < 200, "wagering requirement never unlocked");
    }

    let account = store::load_account(&storage, "alice").unwrap().unwrap();
    if account.active_wagering_requirement == 0 && account.locked == 0 {
        // Unlocked: bonus bucket has been folded into cash.
        assert_eq!(account.bonus, 0);
    }

    // Every game is terminal and every round chain verifies.
    let games = storage.scan_prefix(b"game:", None, usize::MAX);
    assert_eq!(games.len() as u64, played);
    for (key, value) in &games {
        let game: tresdice::models::Game = serde_json::from_slice(value).unwrap();
        assert_ne!(game.status, GameStatus::Active, "game {:?} left active", key);
        assert!(game_engine.verify_game(&game.id).unwrap());
    }

    // The ledger's final balances_after row matches the account.
    let txs = store::load_transactions(&storage, "alice", 10_000).unwrap();
    let last = txs.last().unwrap();
    assert_eq!(last.balances_after, account.balances());
    assert_eq!(last.seq, account.tx_seq);

    // Withdrawal through a failing send refunds exactly.
    let cash_before = account.cash;
    if cash_before >= 10 * MICRO {
        chain.fail_sends.store(true, Ordering::SeqCst);
        let err = container
            .reconciler()
            .request_withdrawal("alice", 10 * MICRO, "Tdestination0001")
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let account = store::load_account(&storage, "alice").unwrap().unwrap();
        assert_eq!(account.cash, cash_before);
        assert_eq!(account.total_withdrawn, 0);
        assert_eq!(chain.sent_total(), 0);

        // A successful retry completes and debits once.
        chain.fail_sends.store(false, Ordering::SeqCst);
        let withdrawal = container
            .reconciler()
            .request_withdrawal("alice", 10 * MICRO, "Tdestination0001")
            .await
            .unwrap();
        assert!(withdrawal.chain_tx_id.is_some());
        let account = store::load_account(&storage, "alice").unwrap().unwrap();
        assert_eq!(account.cash, cash_before - 10 * MICRO);
        assert_eq!(chain.sent_total(), 10 * MICRO);
    }

    // Affiliate accrual folds alice's net flow into bob's ongoing period.
    container.affiliate().run_accrual_pass().unwrap();
    let stats = container.affiliate().stats("bob").unwrap();
    assert_eq!(stats.referral_count, 1);
    let ongoing = stats.ongoing.unwrap();
    let account = store::load_account(&storage, "alice").unwrap().unwrap();
    let expected_profit =
        account.total_deposited as i64 - account.total_withdrawn as i64;
    assert_eq!(ongoing.total_profit, expected_profit);
    assert_eq!(
        ongoing.commission,
        (expected_profit.max(0) as u64) * 20 / 100
    );
}

#[tokio::test]
async fn test_settlement_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    let account_id = "carol";
    {
        let (_chain, container) = build_container(&dir);
        let storage = container.storage();
        let mut carol = Account::new(account_id);
        carol.deposit_address = Some("Tcarolwallet0001".to_string());
        store::register_account(&storage, &carol).unwrap();

        container
            .reconciler()
            .process_deposit_event(
                account_id,
                &deposit_event("tx-dep-carol", "Tcarolwallet0001", 50 * MICRO),
            )
            .await
            .unwrap();
    }
    // Container dropped; RocksDB lock released.

    let (_chain, container) = build_container(&dir);
    let storage = container.storage();
    let account = store::load_account(&storage, account_id).unwrap().unwrap();
    assert_eq!(account.cash, 50 * MICRO);

    // Idempotency survives too: the same tx hash is still a duplicate.
    let replay = container
        .reconciler()
        .process_deposit_event(
            account_id,
            &deposit_event("tx-dep-carol", "Tcarolwallet0001", 50 * MICRO),
        )
        .await;
    assert!(replay.is_err());
}
