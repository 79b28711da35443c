mod data_objects;
mod order_store;

pub use data_objects::{CreditResult, InsertOrderResult};
pub use order_store::OrderStore;
