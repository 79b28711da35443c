//! Engine events and the hooks that react to them.
//!
//! The engine publishes an event when an order becomes paid, when its withdrawal settles, and when a withdrawal
//! fails. The server hooks into these to notify merchants.
mod channel;
mod event_types;
mod hooks;

pub use channel::{EventHandler, EventProducer, Handler};
pub use event_types::{OrderPaidEvent, OrderSettledEvent, WithdrawalFailedEvent};
pub use hooks::{EventHandlers, EventHooks, EventProducers};
