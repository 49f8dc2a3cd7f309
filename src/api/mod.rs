//! HTTP API service.
//!
//! Thin axum surface over the service container: account registration and
//! balances, the game round trip, the deposit webhook, withdrawals and
//! affiliate queries. Identity arrives in a trusted header set by the
//! upstream auth proxy.

pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod server;

pub use server::ApiServer;
