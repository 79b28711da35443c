use crate::db_types::Order;

/// Emitted once, when the credited amount of an order first reaches the requested amount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderPaidEvent {
    pub order: Order,
}

impl OrderPaidEvent {
    pub fn new(order: Order) -> Self {
        Self { order }
    }
}

/// Emitted when the withdrawal of an order's balance to the merchant has been finalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderSettledEvent {
    pub order: Order,
    pub withdrawal_tx: String,
}

impl OrderSettledEvent {
    pub fn new(order: Order, withdrawal_tx: String) -> Self {
        Self { order, withdrawal_tx }
    }
}

/// Emitted when a withdrawal attempt ends in the `failed` state and needs operator attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawalFailedEvent {
    pub order: Order,
    pub reason: String,
}

impl WithdrawalFailedEvent {
    pub fn new(order: Order, reason: String) -> Self {
        Self { order, reason }
    }
}
