//! Service layer wiring the engines together.
//!
//! The container owns one `Storage` handle and hands out `Arc`s to the
//! ledger, game engine, reconciler and affiliate engine built on top of it.
//! The chain client is injectable so tests run against the mock.

use crate::affiliate::AffiliateEngine;
use crate::chain::ChainClient;
use crate::config::CasinoConfig;
use crate::errors::CasinoResult;
use crate::game::GameEngine;
use crate::ledger::Ledger;
use crate::reconciler::Reconciler;
use crate::storage::Storage;
use std::sync::Arc;

pub struct ServiceContainer {
    config: CasinoConfig,
    storage: Storage,
    chain: Arc<dyn ChainClient>,
    ledger: Arc<Ledger>,
    game: Arc<GameEngine>,
    reconciler: Arc<Reconciler>,
    affiliate: Arc<AffiliateEngine>,
}

impl ServiceContainer {
    pub fn new(config: CasinoConfig, chain: Arc<dyn ChainClient>) -> CasinoResult<Self> {
        let storage = Storage::open(&config.storage.data_dir)?;
        Self::with_storage(config, chain, storage)
    }

    /// Build on an already opened storage handle. Tests use this with a
    /// tempdir-backed store.
    pub fn with_storage(
        config: CasinoConfig,
        chain: Arc<dyn ChainClient>,
        storage: Storage,
    ) -> CasinoResult<Self> {
        let ledger = Arc::new(Ledger::new(storage.clone()));
        let game = Arc::new(GameEngine::new(
            storage.clone(),
            ledger.clone(),
            &config.game,
        ));
        let reconciler = Arc::new(Reconciler::new(
            storage.clone(),
            ledger.clone(),
            chain.clone(),
            config.reconciler.clone(),
        ));
        let affiliate = Arc::new(AffiliateEngine::new(
            storage.clone(),
            config.affiliate.clone(),
        ));

        Ok(Self {
            config,
            storage,
            chain,
            ledger,
            game,
            reconciler,
            affiliate,
        })
    }

    pub fn config(&self) -> &CasinoConfig {
        &self.config
    }

    pub fn storage(&self) -> Storage {
        self.storage.clone()
    }

    pub fn chain(&self) -> Arc<dyn ChainClient> {
        Arc::clone(&self.chain)
    }

    pub fn ledger(&self) -> Arc<Ledger> {
        Arc::clone(&self.ledger)
    }

    pub fn game(&self) -> Arc<GameEngine> {
        Arc::clone(&self.game)
    }

    pub fn reconciler(&self) -> Arc<Reconciler> {
        Arc::clone(&self.reconciler)
    }

    pub fn affiliate(&self) -> Arc<AffiliateEngine> {
        Arc::clone(&self.affiliate)
    }
}
