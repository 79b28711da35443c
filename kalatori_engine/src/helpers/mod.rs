mod backoff;
mod keyed_lock;

pub use backoff::Backoff;
pub use keyed_lock::{KeyedGuard, KeyedLock};
