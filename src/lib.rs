//! Tresdice - dice casino settlement engine.
//!
//! Provably-fair three-dice rounds, a multi-bucket monetary ledger with
//! bonus wagering, an idempotent TRC-20 deposit/withdrawal reconciler and
//! monthly affiliate commission accrual, served over an axum HTTP API on a
//! RocksDB store.

pub mod affiliate;
pub mod api;
pub mod chain;
pub mod config;
pub mod errors;
pub mod fairness;
pub mod game;
pub mod ledger;
pub mod models;
pub mod reconciler;
pub mod services;
pub mod storage;
pub mod store;

pub use config::{CasinoConfig, ConfigLoader};
pub use errors::{CasinoError, CasinoResult};
pub use services::ServiceContainer;
