//! Chain access: the client capability the engine depends on, and the watchers that turn block subscriptions into
//! transfer events for the engine.
mod account_index;
mod client;
mod health;
mod http_client;
mod watcher;

pub use account_index::AccountIndex;
pub use client::{BlockRef, ChainClient, ChainError, ChainEvent, ChainEventStream, ChainTransfer, TxFinality};
pub use health::{HealthBoard, WatcherHealth};
pub use http_client::HttpChainClient;
pub use watcher::{ChainWatcher, Delivery, ObservedTransfer};
