use std::{future::Future, pin::Pin, sync::Arc};

use crate::events::{EventHandler, EventProducer, Handler, OrderPaidEvent, OrderSettledEvent, WithdrawalFailedEvent};

type BoxedFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Default, Clone)]
pub struct EventProducers {
    pub order_paid_producer: Vec<EventProducer<OrderPaidEvent>>,
    pub order_settled_producer: Vec<EventProducer<OrderSettledEvent>>,
    pub withdrawal_failed_producer: Vec<EventProducer<WithdrawalFailedEvent>>,
}

pub struct EventHandlers {
    pub on_order_paid: Option<EventHandler<OrderPaidEvent>>,
    pub on_order_settled: Option<EventHandler<OrderSettledEvent>>,
    pub on_withdrawal_failed: Option<EventHandler<WithdrawalFailedEvent>>,
}

impl EventHandlers {
    pub fn new(buffer_size: usize, hooks: EventHooks) -> Self {
        let on_order_paid = hooks.on_order_paid.map(|f| EventHandler::new(buffer_size, f));
        let on_order_settled = hooks.on_order_settled.map(|f| EventHandler::new(buffer_size, f));
        let on_withdrawal_failed = hooks.on_withdrawal_failed.map(|f| EventHandler::new(buffer_size, f));
        Self { on_order_paid, on_order_settled, on_withdrawal_failed }
    }

    pub fn producers(&self) -> EventProducers {
        let mut result = EventProducers::default();
        if let Some(handler) = &self.on_order_paid {
            result.order_paid_producer.push(handler.subscribe());
        }
        if let Some(handler) = &self.on_order_settled {
            result.order_settled_producer.push(handler.subscribe());
        }
        if let Some(handler) = &self.on_withdrawal_failed {
            result.withdrawal_failed_producer.push(handler.subscribe());
        }
        result
    }

    pub async fn start_handlers(self) {
        if let Some(handler) = self.on_order_paid {
            tokio::spawn(handler.start_handler());
        }
        if let Some(handler) = self.on_order_settled {
            tokio::spawn(handler.start_handler());
        }
        if let Some(handler) = self.on_withdrawal_failed {
            tokio::spawn(handler.start_handler());
        }
    }
}

#[derive(Default, Clone)]
pub struct EventHooks {
    pub on_order_paid: Option<Handler<OrderPaidEvent>>,
    pub on_order_settled: Option<Handler<OrderSettledEvent>>,
    pub on_withdrawal_failed: Option<Handler<WithdrawalFailedEvent>>,
}

impl EventHooks {
    pub fn on_order_paid<F>(&mut self, f: F) -> &mut Self
    where F: (Fn(OrderPaidEvent) -> BoxedFuture) + Send + Sync + 'static {
        self.on_order_paid = Some(Arc::new(f));
        self
    }

    pub fn on_order_settled<F>(&mut self, f: F) -> &mut Self
    where F: (Fn(OrderSettledEvent) -> BoxedFuture) + Send + Sync + 'static {
        self.on_order_settled = Some(Arc::new(f));
        self
    }

    pub fn on_withdrawal_failed<F>(&mut self, f: F) -> &mut Self
    where F: (Fn(WithdrawalFailedEvent) -> BoxedFuture) + Send + Sync + 'static {
        self.on_withdrawal_failed = Some(Arc::new(f));
        self
    }
}
