//! Kalatori Payment Engine
//!
//! The engine is the heart of the Kalatori payment gateway. For every order it derives a dedicated receiving account,
//! watches the order's chain for transfers to that account, reconciles what arrives against the amount and currency
//! that were asked for, and forwards the funds to the merchant once the order is fully paid. The engine never holds
//! funds on anyone's behalf: every payment account is swept to the merchant's own address.
//!
//! The library is organised as follows:
//! 1. Static configuration: the [`currency`] registry and the [`derivation`] of payment accounts.
//! 2. Storage ([`mod@db`]). Orders live in an [`OrderStore`]. SQLite is the supported backend. The data types used
//!    by the store are defined in [`db_types`] and are public.
//! 3. Chain access ([`chain`]). The engine talks to chains through the [`ChainClient`] capability. A
//!    [`ChainWatcher`] per RPC endpoint follows finalized blocks and delivers transfers to tracked accounts.
//! 4. The engine itself ([`ReconciliationEngine`]), with its per-order [`TransferDispatcher`] and the
//!    [`WithdrawalExecutor`].
//!
//! The engine also emits events that can be subscribed to (see [`events`]), e.g. to notify the merchant when an
//! order is paid or settled.
pub mod chain;
pub mod currency;
mod db;
pub mod db_types;
pub mod derivation;
pub mod events;
pub mod helpers;
mod kpe_api;

#[cfg(any(feature = "test_utils", test))]
pub mod test_utils;

pub use chain::{AccountIndex, ChainClient, ChainError, ChainWatcher, HealthBoard, HttpChainClient, WatcherHealth};
#[cfg(feature = "sqlite")]
pub use db::sqlite::{SqliteDatabase, SqliteDatabaseError};
pub use db::traits::{CreditResult, InsertOrderResult, OrderStore};
pub use kpe_api::{
    dispatcher::TransferDispatcher,
    errors::{EngineError, WithdrawalError},
    order_objects::{EngineConfig, OrderCreation, OrderRequest},
    reconciliation::ReconciliationEngine,
    runtime::WatcherSet,
    withdrawal::WithdrawalExecutor,
};
