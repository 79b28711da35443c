//! Routes transfers from the chain watchers to the engine.
//!
//! Each order gets a FIFO queue. At most one transfer per order is being processed at any time, and the order's
//! transfers are processed in the sequence the watchers delivered them, which is finalization order. Transfers for
//! different orders are processed concurrently.
//!
//! A delivery is acknowledged as soon as its outcome is stored, and before any withdrawal it triggers. Errors that
//! would recur on every replay are acknowledged too; only transient failures leave the delivery unacknowledged so that
//! the watcher replays its block.
use std::collections::{HashMap, VecDeque};

use log::*;
use tokio::sync::mpsc;

use crate::{
    chain::{ChainClient, Delivery},
    db::traits::OrderStore,
    db_types::{OrderId, WithdrawalStatus},
    kpe_api::reconciliation::ReconciliationEngine,
};

pub struct TransferDispatcher<B, C> {
    engine: ReconciliationEngine<B, C>,
}

impl<B, C> TransferDispatcher<B, C>
where
    B: OrderStore,
    C: ChainClient,
{
    pub fn new(engine: ReconciliationEngine<B, C>) -> Self {
        Self { engine }
    }

    /// Runs until every sender of `deliveries` has been dropped and all queued transfers have been processed.
    pub async fn run(self, mut deliveries: mpsc::Receiver<Delivery>) {
        // An order has an entry here while one of its transfers is being processed.
        let mut queues: HashMap<OrderId, VecDeque<Delivery>> = HashMap::new();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<OrderId>();
        let mut open = true;
        debug!("🧾️ Transfer dispatcher started");
        while open || !queues.is_empty() {
            tokio::select! {
                delivery = deliveries.recv(), if open => match delivery {
                    Some(delivery) => match queues.get_mut(&delivery.order_id) {
                        Some(queue) => queue.push_back(delivery),
                        None => {
                            queues.insert(delivery.order_id.clone(), VecDeque::new());
                            self.spawn(delivery, done_tx.clone());
                        },
                    },
                    None => open = false,
                },
                Some(order_id) = done_rx.recv() => {
                    match queues.get_mut(&order_id).and_then(|q| q.pop_front()) {
                        Some(next) => self.spawn(next, done_tx.clone()),
                        None => {
                            queues.remove(&order_id);
                        },
                    }
                },
            }
        }
        debug!("🧾️ Transfer dispatcher has shut down");
    }

    fn spawn(&self, delivery: Delivery, done: mpsc::UnboundedSender<OrderId>) {
        let engine = self.engine.clone();
        tokio::spawn(async move {
            let Delivery { order_id, transfer, ack } = delivery;
            let id = order_id.clone();
            // Processing runs in its own task so that a panic cannot wedge the order's queue.
            let outcome = tokio::spawn(async move {
                let order = match engine.record_transfer(&id, transfer).await {
                    Ok(order) => order,
                    Err(e) if e.is_transient() => return Err(e),
                    Err(e) => {
                        warn!("🧾️ Transfer for order {id} cannot be processed and is skipped: {e}");
                        let _ = ack.send(());
                        return Ok(());
                    },
                };
                let _ = ack.send(());
                if order.is_paid() && order.withdrawal_status == WithdrawalStatus::Waiting {
                    if let Err(e) = engine.withdraw_if_paid(&id).await {
                        error!("🧾️ Could not withdraw order {id}: {e}. The next maintenance sweep will retry.");
                    }
                }
                Ok(())
            })
            .await;
            match outcome {
                Ok(Ok(())) => {},
                Ok(Err(e)) => error!("🧾️ Could not process a transfer for order {order_id}: {e}"),
                Err(e) => error!("🧾️ Transfer processing for order {order_id} panicked: {e}"),
            }
            let _ = done.send(order_id);
        });
    }
}
