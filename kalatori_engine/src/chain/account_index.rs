use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use log::*;

use crate::db_types::{Order, OrderId};

/// In-memory map from payment account to order id, for every order whose account is being watched.
///
/// Watchers consult the index to decide which transfers concern the engine. It is rebuilt from the order store at
/// startup, so losing it on a restart loses nothing.
#[derive(Debug, Clone, Default)]
pub struct AccountIndex {
    accounts: Arc<RwLock<HashMap<String, OrderId>>>,
}

impl AccountIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, address: &str, order_id: &OrderId) {
        match self.accounts.write() {
            Ok(mut map) => {
                map.insert(address.to_string(), order_id.clone());
            },
            Err(e) => error!("🔭️ Account index is poisoned: {e}"),
        }
    }

    pub fn remove(&self, address: &str) -> Option<OrderId> {
        self.accounts.write().ok().and_then(|mut map| map.remove(address))
    }

    pub fn lookup(&self, address: &str) -> Option<OrderId> {
        self.accounts.read().ok().and_then(|map| map.get(address).cloned())
    }

    pub fn len(&self) -> usize {
        self.accounts.read().map(|m| m.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replaces the contents of the index with the accounts of the given orders.
    pub fn rebuild<'a, I: IntoIterator<Item = &'a Order>>(&self, orders: I) {
        let fresh = orders
            .into_iter()
            .filter(|o| o.is_monitored())
            .map(|o| (o.payment_account.clone(), o.order_id.clone()))
            .collect::<HashMap<_, _>>();
        let count = fresh.len();
        match self.accounts.write() {
            Ok(mut map) => *map = fresh,
            Err(e) => error!("🔭️ Account index is poisoned: {e}"),
        }
        info!("🔭️ Tracking {count} payment accounts");
    }
}
