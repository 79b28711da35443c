use std::time::Duration;

use kalatori_engine::{
    chain::TxFinality,
    db_types::{AssetRef, Order, OrderId, OrderState},
    events::EventProducers,
    test_utils::{test_config, TestHarness, POLKADOT_RPC},
    OrderRequest,
    OrderStore,
    WatcherSet,
};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

use crate::support::{wait_for, wait_for_state, TIMEOUT};

mod support;

const DOT: u128 = 10_000_000_000;

async fn dot_order(h: &TestHarness, id: &str, amount: f64) -> Order {
    let request = OrderRequest { amount, currency: "DOT".into(), callback: String::new() };
    h.engine.create_order(OrderId::from(id), request).await.unwrap().into_order()
}

async fn wait_for_watermark(h: &TestHarness, height: u64) {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while h.db.fetch_watermark(POLKADOT_RPC).await.unwrap() < Some(height) {
        assert!(tokio::time::Instant::now() < deadline, "Timed out waiting for block {height}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[test]
fn junk_transfers_do_not_stall_the_watcher() {
    let sys = Runtime::new().unwrap();
    sys.block_on(async move {
        let h = TestHarness::new().await;
        let order = dot_order(&h, "junk-1", 2.0).await;
        let shutdown = CancellationToken::new();
        let watchers = WatcherSet::start(&h.engine, shutdown.clone());
        wait_for("the watchers to subscribe", TIMEOUT, || h.polkadot.live_subscribers() == 1).await;

        h.polkadot.produce_block(vec![h.polkadot.transfer(&order.payment_account, AssetRef::Asset(4242), u128::MAX)]);
        h.polkadot.produce_block(vec![h.polkadot.transfer(&order.payment_account, AssetRef::Native, 2 * DOT)]);
        wait_for_watermark(&h, 2).await;

        let order = wait_for_state(&h, &order.order_id, OrderState::Completed).await;
        assert_eq!(order.repaid_amount.value(), 2 * DOT as i64);
        assert_eq!(order.transactions.len(), 2);
        assert_eq!(order.transactions[0].amount, u128::MAX);
        assert!(!order.transactions[0].credited);
        assert_eq!(h.polkadot.subscriptions(), 1);
        shutdown.cancel();
        watchers.join().await;
    });
}

#[test]
fn disconnect_before_the_first_block_misses_nothing() {
    let sys = Runtime::new().unwrap();
    sys.block_on(async move {
        let h = TestHarness::new().await;
        h.polkadot.produce_block(vec![]);
        let order = dot_order(&h, "early-drop-1", 2.0).await;
        let shutdown = CancellationToken::new();
        let watchers = WatcherSet::start(&h.engine, shutdown.clone());
        wait_for("the watchers to subscribe", TIMEOUT, || h.polkadot.live_subscribers() == 1).await;
        // The head at startup is the resume point
        assert_eq!(h.db.fetch_watermark(POLKADOT_RPC).await.unwrap(), Some(1));

        h.polkadot.fail_next_subscriptions(3);
        h.polkadot.disconnect();
        h.polkadot.produce_block(vec![h.polkadot.transfer(&order.payment_account, AssetRef::Native, 2 * DOT)]);

        let order = wait_for_state(&h, &order.order_id, OrderState::Completed).await;
        assert_eq!(order.repaid_amount.value(), 2 * DOT as i64);
        assert_eq!(h.polkadot.subscriptions(), 2);
        wait_for_watermark(&h, 2).await;
        shutdown.cancel();
        watchers.join().await;
    });
}

#[test]
fn pending_withdrawal_does_not_hold_up_other_orders() {
    let sys = Runtime::new().unwrap();
    sys.block_on(async move {
        let mut config = test_config();
        config.finality_checks = 1000;
        let h = TestHarness::with_config(config, EventProducers::default()).await;
        h.polkadot.set_default_finality(TxFinality::Pending);
        let first = dot_order(&h, "slow-1", 1.0).await;
        let second = dot_order(&h, "slow-2", 1.0).await;
        let shutdown = CancellationToken::new();
        let watchers = WatcherSet::start(&h.engine, shutdown.clone());
        wait_for("the watchers to subscribe", TIMEOUT, || h.polkadot.live_subscribers() == 1).await;

        h.polkadot.produce_block(vec![h.polkadot.transfer(&first.payment_account, AssetRef::Native, DOT)]);
        wait_for("the first withdrawal", TIMEOUT, || h.polkadot.submissions().len() == 1).await;
        h.polkadot.produce_block(vec![h.polkadot.transfer(&second.payment_account, AssetRef::Native, DOT)]);
        wait_for_watermark(&h, 2).await;

        // The first order is still waiting for finality while the second has been credited
        let second = h.engine.fetch_order(&second.order_id).await.unwrap();
        assert!(second.is_paid());
        assert_eq!(h.engine.fetch_order(&first.order_id).await.unwrap().state(), OrderState::Withdrawing);

        wait_for("the second withdrawal", TIMEOUT, || h.polkadot.submissions().len() == 2).await;
        for submission in h.polkadot.submissions() {
            h.polkadot.set_finality(&submission.tx_id, TxFinality::Finalized);
        }
        wait_for_state(&h, &first.order_id, OrderState::Completed).await;
        wait_for_state(&h, &second.order_id, OrderState::Completed).await;
        shutdown.cancel();
        watchers.join().await;
    });
}
