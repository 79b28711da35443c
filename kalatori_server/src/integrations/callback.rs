//! Merchant callback notifications
//!
//! When an order is paid, and again when its funds have been forwarded, the order representation is POSTed as JSON
//! to the `callback` URL the merchant supplied with the order. Notifications are best-effort: failures are logged
//! and not retried, since the merchant can always read the order back from the API.
use std::{sync::Arc, time::Duration};

use kalatori_engine::{
    currency::CurrencyRegistry,
    db_types::Order,
    events::{EventHandlers, EventHooks},
};
use log::*;
use reqwest::Client;

use crate::{data_objects::OrderResponse, data_objects::ServerInfo, errors::ServerError};

pub const CALLBACK_EVENT_BUFFER_SIZE: usize = 25;
const CALLBACK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct CallbackNotifier {
    client: Client,
    registry: Arc<CurrencyRegistry>,
    server_info: ServerInfo,
}

impl CallbackNotifier {
    pub fn new(registry: CurrencyRegistry, server_info: ServerInfo) -> Result<Self, ServerError> {
        let client = Client::builder()
            .timeout(CALLBACK_TIMEOUT)
            .build()
            .map_err(|e| ServerError::InitializeError(format!("Could not create the callback HTTP client. {e}")))?;
        Ok(Self { client, registry: Arc::new(registry), server_info })
    }

    /// Posts the order to its callback URL. Orders without a callback are skipped.
    pub async fn notify(&self, order: Order) {
        if order.callback.is_empty() {
            trace!("📬️ Order {} has no callback URL", order.order_id);
            return;
        }
        let Some(currency) = self.registry.get(&order.currency) else {
            error!("📬️ Cannot notify the callback of order {}. {} is not configured", order.order_id, order.currency);
            return;
        };
        let url = order.callback.clone();
        let order_id = order.order_id.clone();
        let body = OrderResponse::new(order, currency, &self.registry, &self.server_info);
        match self.client.post(&url).json(&body).send().await {
            Ok(res) if res.status().is_success() => {
                debug!("📬️ Callback {url} for order {order_id} acknowledged with {}", res.status())
            },
            Ok(res) => warn!("📬️ Callback {url} for order {order_id} responded with {}", res.status()),
            Err(e) => warn!("📬️ Could not reach callback {url} for order {order_id}. {e}"),
        }
    }
}

/// Creates the event handlers that notify merchants when their orders are paid and when they are settled.
pub fn create_callback_handlers(notifier: CallbackNotifier) -> EventHandlers {
    let mut hooks = EventHooks::default();
    let on_paid = notifier.clone();
    hooks.on_order_paid(move |ev| {
        let notifier = on_paid.clone();
        Box::pin(async move { notifier.notify(ev.order).await })
    });
    hooks.on_order_settled(move |ev| {
        let notifier = notifier.clone();
        Box::pin(async move { notifier.notify(ev.order).await })
    });
    EventHandlers::new(CALLBACK_EVENT_BUFFER_SIZE, hooks)
}
