use std::future::Future;

use crate::{
    db::traits::{CreditResult, InsertOrderResult},
    db_types::{NewOrder, NewTransfer, Order, OrderId, WithdrawalStatus, WithdrawalUpdate},
};

/// The behaviour the reconciliation engine requires from an order storage backend.
///
/// Methods return `Send` futures so that the engine can drive them from spawned tasks.
pub trait OrderStore: Clone + Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    fn url(&self) -> &str;

    /// Stores a new order. If an order with the same id already exists, it is returned unchanged in
    /// [`InsertOrderResult::AlreadyExists`] and the new order is discarded.
    fn insert_order(&self, order: NewOrder) -> impl Future<Output = Result<InsertOrderResult, Self::Error>> + Send;

    fn fetch_order(&self, order_id: &OrderId) -> impl Future<Output = Result<Option<Order>, Self::Error>> + Send;

    fn fetch_order_by_account(&self, address: &str) -> impl Future<Output = Result<Option<Order>, Self::Error>> + Send;

    /// Atomically appends `transfer` to the order, recomputes `repaid_amount` from all credited transfers and updates
    /// `payment_status`. Only succeeds if the order's version still equals `expected_version`.
    fn credit_transfer(
        &self,
        order_id: &OrderId,
        expected_version: i64,
        transfer: NewTransfer,
    ) -> impl Future<Output = Result<CreditResult, Self::Error>> + Send;

    /// Records a transfer that does not count towards the order's total (e.g. the wrong asset was sent). Returns
    /// `false` if the transfer was already recorded.
    fn record_foreign_transfer(
        &self,
        order_id: &OrderId,
        transfer: NewTransfer,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send;

    /// Compare-and-swap update of the withdrawal status. Returns `None` if the order's version did not match.
    fn update_withdrawal(
        &self,
        order_id: &OrderId,
        update: WithdrawalUpdate,
    ) -> impl Future<Output = Result<Option<Order>, Self::Error>> + Send;

    /// Marks a pending order as expired. Returns `None` if the version did not match or the order is already paid.
    fn mark_expired(
        &self,
        order_id: &OrderId,
        expected_version: i64,
        message: &str,
    ) -> impl Future<Output = Result<Option<Order>, Self::Error>> + Send;

    /// All orders whose payment accounts still need watching: not expired, and not yet withdrawn.
    fn fetch_monitored_orders(&self) -> impl Future<Output = Result<Vec<Order>, Self::Error>> + Send;

    fn fetch_orders_by_withdrawal_status(
        &self,
        status: WithdrawalStatus,
    ) -> impl Future<Output = Result<Vec<Order>, Self::Error>> + Send;

    /// The last block on `endpoint` whose transfers were fully processed.
    fn fetch_watermark(&self, endpoint: &str) -> impl Future<Output = Result<Option<u64>, Self::Error>> + Send;

    fn save_watermark(&self, endpoint: &str, block_number: u64) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn close(&self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}
