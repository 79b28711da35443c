use std::time::Duration;

use kalatori_engine::{
    db_types::{Order, OrderId, OrderState},
    test_utils::TestHarness,
};

/// Polls `condition` every 10ms until it holds, panicking with `what` after `timeout`.
pub async fn wait_for<F: FnMut() -> bool>(what: &str, timeout: Duration, mut condition: F) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("Timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Withdrawals run after the watcher has moved on, so tests wait for the order itself.
#[allow(dead_code)]
pub async fn wait_for_state(h: &TestHarness, order_id: &OrderId, state: OrderState) -> Order {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        let order = h.engine.fetch_order(order_id).await.unwrap();
        if order.state() == state {
            return order;
        }
        assert!(tokio::time::Instant::now() < deadline, "Timed out waiting for {order_id} to be {state}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub const TIMEOUT: Duration = Duration::from_secs(10);
