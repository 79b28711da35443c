//! # Order storage
//!
//! The engine owns its orders, but keeps them in an [`traits::OrderStore`]. The store is the single source of truth
//! for order state and must be durable: the engine can be killed at any moment and has to pick up where it left off.
//!
//! Every mutation of an order goes through a compare-and-swap on the order's `version` column, so a writer that
//! raced with another writer finds out instead of silently overwriting the other's work. Transfers are unique per
//! `(order_id, tx_id)`, which makes crediting idempotent even across restarts.
pub mod traits;

#[cfg(feature = "sqlite")]
pub mod sqlite;
