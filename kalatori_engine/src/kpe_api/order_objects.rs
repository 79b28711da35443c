use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::db_types::Order;

/// The caller-supplied parameters of a new order. `amount` is in human units of `currency`, e.g. `12.5` DOT.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub amount: f64,
    pub currency: String,
    #[serde(default)]
    pub callback: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderCreation {
    Created(Order),
    /// An identical order already existed and has been returned unchanged.
    Existing(Order),
}

impl OrderCreation {
    pub fn is_new(&self) -> bool {
        matches!(self, OrderCreation::Created(_))
    }

    pub fn order(&self) -> &Order {
        match self {
            OrderCreation::Created(o) | OrderCreation::Existing(o) => o,
        }
    }

    pub fn into_order(self) -> Order {
        match self {
            OrderCreation::Created(o) | OrderCreation::Existing(o) => o,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long an order stays monitored while it is unpaid
    pub order_lifetime: chrono::Duration,
    /// Submission attempts per withdrawal before it is deferred to the next maintenance sweep
    pub withdrawal_attempts: u32,
    /// Initial delay between retries of chain operations. Doubles on each failure.
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
    /// How many times the finality of a withdrawal is checked before the check is deferred
    pub finality_checks: u32,
    pub finality_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            order_lifetime: chrono::Duration::hours(24),
            withdrawal_attempts: 5,
            retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(60),
            finality_checks: 20,
            finality_interval: Duration::from_secs(6),
        }
    }
}
