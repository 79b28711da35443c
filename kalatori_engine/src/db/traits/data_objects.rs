use crate::db_types::Order;

#[derive(Debug, Clone)]
pub enum InsertOrderResult {
    Inserted(Order),
    AlreadyExists(Order),
}

/// The outcome of an attempt to credit a transfer to an order.
#[derive(Debug, Clone)]
pub enum CreditResult {
    /// The transfer was recorded and the order's totals updated. Contains the updated order.
    Credited(Order),
    /// A transfer with this id has already been recorded against the order. Nothing was changed.
    Duplicate,
    /// The order was modified since it was read. Nothing was changed.
    VersionConflict,
}
