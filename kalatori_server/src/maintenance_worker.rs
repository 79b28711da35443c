use std::time::Duration;

use kalatori_engine::{db_types::Order, ChainClient, OrderStore, ReconciliationEngine};
use log::*;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Starts the maintenance worker. Every `interval` it expires unpaid orders that have outlived their lifetime, and
/// drives withdrawals that were deferred or are still waiting for finality. The worker stops when `shutdown` is
/// cancelled.
pub fn start_maintenance_worker<B, C>(
    engine: ReconciliationEngine<B, C>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()>
where
    B: OrderStore,
    C: ChainClient,
{
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        // The first tick completes immediately. Startup recovery has just run, so skip it.
        timer.tick().await;
        info!("🕰️ Maintenance worker started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = timer.tick() => {},
            }
            run_maintenance(&engine).await;
        }
        info!("🕰️ Maintenance worker has stopped");
    })
}

pub async fn run_maintenance<B: OrderStore, C: ChainClient>(engine: &ReconciliationEngine<B, C>) {
    trace!("🕰️ Running order expiry job");
    match engine.expire_orders().await {
        Ok(expired) if expired.is_empty() => trace!("🕰️ No orders expired"),
        Ok(expired) => {
            info!("🕰️ {} orders expired", expired.len());
            debug!("🕰️ Expired orders: {}", order_list(&expired));
        },
        Err(e) => error!("🕰️ Error running order expiry job: {e}"),
    }
    match engine.resume_withdrawals().await {
        Ok(orders) if orders.is_empty() => trace!("🕰️ No withdrawals to resume"),
        Ok(orders) => info!("🕰️ Resumed {} withdrawals: {}", orders.len(), order_list(&orders)),
        Err(e) => error!("🕰️ Error resuming withdrawals: {e}"),
    }
}

fn order_list(orders: &[Order]) -> String {
    orders.iter().map(|o| format!("{} ({})", o.order_id, o.state())).collect::<Vec<String>>().join(", ")
}

#[cfg(test)]
mod test {
    use kalatori_engine::{
        db_types::{OrderId, OrderState},
        test_utils::{test_config, TestHarness},
        OrderRequest,
    };

    use super::*;

    #[tokio::test]
    async fn worker_expires_orders_until_shutdown() {
        let mut config = test_config();
        config.order_lifetime = chrono::Duration::seconds(-1);
        let h = TestHarness::with_config(config, Default::default()).await;
        let request = OrderRequest { amount: 1.0, currency: "DOT".into(), callback: String::new() };
        let id = OrderId::from("stale");
        h.engine.create_order(id.clone(), request).await.unwrap();

        let shutdown = CancellationToken::new();
        let worker = start_maintenance_worker(h.engine.clone(), Duration::from_millis(20), shutdown.clone());
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.cancel();
        worker.await.unwrap();
        assert_eq!(h.engine.fetch_order(&id).await.unwrap().state(), OrderState::Expired);
    }
}
