//! Configuration for the tresdice service.
//!
//! TOML file, environment-variable overrides, and validation of the final
//! values. Money thresholds are configured in whole tokens and converted to
//! micro-units at the point of use.

use crate::errors::{CasinoError, CasinoResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CasinoConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub game: GameConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub affiliate: AffiliateConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "./casino_data".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub listen_address: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub request_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            port: 8080,
            allowed_origins: vec!["*".to_string()],
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameConfig {
    /// Allowed stake denominations, in whole tokens.
    pub allowed_stakes: Vec<u64>,
    /// Enables the per-account win-chance score adjustment policy.
    /// Off by default; see `game::ScorePolicy`.
    pub win_chance_policy: bool,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            allowed_stakes: vec![1, 5, 10, 25, 50, 100],
            win_chance_policy: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Deposits below this (whole tokens) are ignored, not recorded.
    pub min_deposit_tokens: u64,
    /// Confirmations needed before a deposit credits.
    pub confirmations_required: u32,
    /// Deposit bonus as a percentage of the deposit, zero disables.
    pub deposit_bonus_percent: u32,
    /// Cap on a single deposit bonus, in whole tokens.
    pub deposit_bonus_cap_tokens: u64,
    /// Wagering requirement multiplier applied to granted bonuses.
    pub wagering_multiplier: u64,
    /// Minimum withdrawal, in whole tokens.
    pub min_withdrawal_tokens: u64,
    /// Hard timeout for a chain send attempt.
    pub send_timeout_secs: u64,
    /// Deposit poll worker tick interval.
    pub poll_interval_secs: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            min_deposit_tokens: 10,
            confirmations_required: 1,
            deposit_bonus_percent: 10,
            deposit_bonus_cap_tokens: 100,
            wagering_multiplier: 20,
            min_withdrawal_tokens: 10,
            send_timeout_secs: 30,
            poll_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffiliateConfig {
    /// Default commission rate in whole percent.
    pub default_rate_percent: u32,
    /// Accrual worker tick interval.
    pub accrual_interval_secs: u64,
}

impl Default for AffiliateConfig {
    fn default() -> Self {
        Self {
            default_rate_percent: 20,
            accrual_interval_secs: 300,
        }
    }
}

/// Configuration loader with environment variable support.
pub struct ConfigLoader {
    config_path: Option<String>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Load configuration from file and environment variables.
    pub fn load(&self) -> CasinoResult<CasinoConfig> {
        let mut config = if let Some(ref path) = self.config_path {
            self.load_from_file(path)?
        } else {
            CasinoConfig::default()
        };

        self.apply_env_overrides(&mut config)?;
        self.validate(&config)?;
        Ok(config)
    }

    fn load_from_file(&self, path: &str) -> CasinoResult<CasinoConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CasinoError::Configuration(format!("Failed to read {}: {}", path, e))
        })?;

        toml::from_str(&content)
            .map_err(|e| CasinoError::Configuration(format!("Failed to parse TOML: {}", e)))
    }

    fn apply_env_overrides(&self, config: &mut CasinoConfig) -> CasinoResult<()> {
        if let Ok(dir) = env::var("TRESDICE_DATA_DIR") {
            config.storage.data_dir = dir;
        }
        if let Ok(addr) = env::var("TRESDICE_API_ADDRESS") {
            config.api.listen_address = addr;
        }
        if let Ok(port) = env::var("TRESDICE_API_PORT") {
            config.api.port = port.parse().map_err(|_| {
                CasinoError::Configuration(format!("Invalid TRESDICE_API_PORT: {}", port))
            })?;
        }
        Ok(())
    }

    fn validate(&self, config: &CasinoConfig) -> CasinoResult<()> {
        if config.storage.data_dir.is_empty() {
            return Err(CasinoError::Configuration(
                "storage.data_dir must not be empty".to_string(),
            ));
        }
        if config.api.port == 0 {
            return Err(CasinoError::Configuration(
                "api.port cannot be zero".to_string(),
            ));
        }
        if config.game.allowed_stakes.is_empty() {
            return Err(CasinoError::Configuration(
                "game.allowed_stakes must not be empty".to_string(),
            ));
        }
        if config.reconciler.deposit_bonus_percent > 100 {
            return Err(CasinoError::Configuration(
                "reconciler.deposit_bonus_percent cannot exceed 100".to_string(),
            ));
        }
        if config.reconciler.confirmations_required == 0 {
            return Err(CasinoError::Configuration(
                "reconciler.confirmations_required must be at least 1".to_string(),
            ));
        }
        if config.reconciler.send_timeout_secs == 0 {
            return Err(CasinoError::Configuration(
                "reconciler.send_timeout_secs must be at least 1".to_string(),
            ));
        }
        if config.affiliate.default_rate_percent > 100 {
            return Err(CasinoError::Configuration(
                "affiliate.default_rate_percent cannot exceed 100".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
