pub mod dispatcher;
pub mod errors;
pub mod order_objects;
pub mod reconciliation;
pub mod runtime;
pub mod withdrawal;
