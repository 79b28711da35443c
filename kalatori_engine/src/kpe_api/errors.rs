use thiserror::Error;

use crate::{derivation::DerivationError, db_types::OrderId};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("Order not found")]
    OrderNotFound(OrderId),
    #[error("Order {0} already exists with different parameters")]
    DuplicateOrderMismatch(OrderId),
    #[error("Unsupported currency: {0}")]
    UnsupportedCurrency(String),
    #[error("Could not derive a payment account: {0}")]
    DerivationError(#[from] DerivationError),
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
    #[error("Withdrawal is not allowed: {0}")]
    WithdrawalNotAllowed(String),
    #[error("Database error: {0}")]
    DatabaseError(String),
}

impl EngineError {
    /// Whether the same request may succeed if it is made again. Every other error is a property of the request.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::DatabaseError(_))
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WithdrawalError {
    #[error("The payment account holds no funds to withdraw")]
    InsufficientBalance,
    #[error("Withdrawal could not be submitted: {0}")]
    SubmissionError(String),
    #[error("Withdrawal was rejected: {0}")]
    Rejected(String),
    #[error("Could not derive the signing key: {0}")]
    Derivation(#[from] DerivationError),
}
