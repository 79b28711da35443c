//! # Kalatori server
//!
//! The daemon that hosts the Kalatori reconciliation engine. It is responsible for:
//! * loading the chain and currency configuration and connecting to every configured chain,
//! * recovering interrupted withdrawals on startup,
//! * exposing the order API over HTTP,
//! * notifying merchants' callback URLs when orders are paid and settled,
//! * periodically expiring stale orders and retrying deferred withdrawals.
//!
//! ## Configuration
//! The server is configured via environment variables. See [config](config/index.html) for more information.
//!
//! ## Routes
//! * `POST /v2/order/{order_id}`: creates an order (with a JSON body) or reads it (with an empty body).
//! * `POST /v2/order/{order_id}/forceWithdrawal`: retries the withdrawal of a paid order.
//! * `GET /v2/status`: service metadata, supported currencies and chain watcher health.
//! * `GET /health`: liveness probe. Returns 503 when a chain watcher is degraded.
pub mod cli;
pub mod config;
pub mod data_objects;
pub mod errors;
pub mod integrations;
pub mod maintenance_worker;
pub mod routes;
pub mod server;

#[cfg(test)]
mod endpoint_tests;
