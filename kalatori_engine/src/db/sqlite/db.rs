use std::fmt::Debug;

use log::*;
use sqlx::SqlitePool;

use super::{db_url, new_pool, orders, orders::OrderQueryFilter, transfers, watermarks, SqliteDatabaseError};
use crate::{
    db::traits::{CreditResult, InsertOrderResult, OrderStore},
    db_types::{NewOrder, NewTransfer, Order, OrderId, WithdrawalStatus, WithdrawalUpdate},
};

#[derive(Clone)]
pub struct SqliteDatabase {
    url: String,
    pool: SqlitePool,
}

impl Debug for SqliteDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SqliteDatabase ({})", self.url)
    }
}

impl SqliteDatabase {
    /// Connects to the database given by `KALATORI_DATABASE_URL`, or the default location.
    pub async fn new(max_connections: u32) -> Result<Self, SqliteDatabaseError> {
        let url = db_url();
        Self::new_with_url(&url, max_connections).await
    }

    pub async fn new_with_url(url: &str, max_connections: u32) -> Result<Self, SqliteDatabaseError> {
        let pool = new_pool(url, max_connections).await?;
        Ok(Self { url: url.to_string(), pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Brings the schema up to date. The migrations are embedded in the binary.
    pub async fn migrate(&self) -> Result<(), SqliteDatabaseError> {
        sqlx::migrate!("./src/db/sqlite/migrations").run(&self.pool).await?;
        info!("🗃️ Database migrations complete");
        Ok(())
    }
}

impl OrderStore for SqliteDatabase {
    type Error = SqliteDatabaseError;

    fn url(&self) -> &str {
        self.url.as_str()
    }

    async fn insert_order(&self, order: NewOrder) -> Result<InsertOrderResult, Self::Error> {
        let mut conn = self.pool.acquire().await?;
        orders::idempotent_insert(order, &mut conn).await
    }

    async fn fetch_order(&self, order_id: &OrderId) -> Result<Option<Order>, Self::Error> {
        let mut conn = self.pool.acquire().await?;
        orders::fetch_order(order_id, &mut conn).await
    }

    async fn fetch_order_by_account(&self, address: &str) -> Result<Option<Order>, Self::Error> {
        let mut conn = self.pool.acquire().await?;
        orders::fetch_order_by_account(address, &mut conn).await
    }

    /// In a single atomic transaction,
    /// * checks that the order is still at `expected_version`,
    /// * inserts the transfer, unless it has been recorded already,
    /// * recomputes the credited total from the transfers table and stores it with the new payment status.
    async fn credit_transfer(
        &self,
        order_id: &OrderId,
        expected_version: i64,
        transfer: NewTransfer,
    ) -> Result<CreditResult, Self::Error> {
        let mut tx = self.pool.begin().await?;
        let version = orders::fetch_version(order_id, &mut tx)
            .await?
            .ok_or_else(|| SqliteDatabaseError::QueryError(format!("Order {order_id} does not exist")))?;
        if version != expected_version {
            debug!("🗃️ Order {order_id} is at version {version}, not {expected_version}. Not crediting.");
            return Ok(CreditResult::VersionConflict);
        }
        if !transfers::idempotent_insert(order_id, &transfer, true, &mut tx).await? {
            debug!("🗃️ Transfer {} was already credited to order {order_id}", transfer.tx_id);
            return Ok(CreditResult::Duplicate);
        }
        let total = transfers::credited_total(order_id, &mut tx).await?;
        if !orders::update_totals(order_id, expected_version, total, &mut tx).await? {
            return Ok(CreditResult::VersionConflict);
        }
        let order = orders::fetch_order(order_id, &mut tx)
            .await?
            .ok_or_else(|| SqliteDatabaseError::QueryError(format!("Order {order_id} vanished while crediting")))?;
        tx.commit().await?;
        debug!("🗃️ Transfer {} credited to order {order_id}. Total is now {total}", transfer.tx_id);
        Ok(CreditResult::Credited(order))
    }

    async fn record_foreign_transfer(&self, order_id: &OrderId, transfer: NewTransfer) -> Result<bool, Self::Error> {
        let mut conn = self.pool.acquire().await?;
        transfers::idempotent_insert(order_id, &transfer, false, &mut conn).await
    }

    async fn update_withdrawal(
        &self,
        order_id: &OrderId,
        update: WithdrawalUpdate,
    ) -> Result<Option<Order>, Self::Error> {
        let mut tx = self.pool.begin().await?;
        if !orders::update_withdrawal(order_id, &update, &mut tx).await? {
            debug!("🗃️ Withdrawal update for order {order_id} lost the race at version {}", update.expected_version);
            return Ok(None);
        }
        let order = orders::fetch_order(order_id, &mut tx).await?;
        tx.commit().await?;
        trace!("🗃️ Order {order_id} withdrawal status is now {}", update.status);
        Ok(order)
    }

    async fn mark_expired(
        &self,
        order_id: &OrderId,
        expected_version: i64,
        message: &str,
    ) -> Result<Option<Order>, Self::Error> {
        let mut tx = self.pool.begin().await?;
        if !orders::mark_expired(order_id, expected_version, message, &mut tx).await? {
            return Ok(None);
        }
        let order = orders::fetch_order(order_id, &mut tx).await?;
        tx.commit().await?;
        Ok(order)
    }

    async fn fetch_monitored_orders(&self) -> Result<Vec<Order>, Self::Error> {
        let mut conn = self.pool.acquire().await?;
        orders::fetch_orders(OrderQueryFilter::Monitored, &mut conn).await
    }

    async fn fetch_orders_by_withdrawal_status(&self, status: WithdrawalStatus) -> Result<Vec<Order>, Self::Error> {
        let mut conn = self.pool.acquire().await?;
        orders::fetch_orders(OrderQueryFilter::WithdrawalStatus(status), &mut conn).await
    }

    async fn fetch_watermark(&self, endpoint: &str) -> Result<Option<u64>, Self::Error> {
        let mut conn = self.pool.acquire().await?;
        watermarks::fetch_watermark(endpoint, &mut conn).await
    }

    async fn save_watermark(&self, endpoint: &str, block_number: u64) -> Result<(), Self::Error> {
        let mut conn = self.pool.acquire().await?;
        watermarks::save_watermark(endpoint, block_number, &mut conn).await
    }

    async fn close(&self) -> Result<(), Self::Error> {
        self.pool.close().await;
        info!("🗃️ Database connection pool closed");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use chrono::{Duration, Utc};
    use kalatori_common::BaseUnits;

    use super::*;
    use crate::{
        db_types::{AssetRef, PaymentStatus, WithdrawalTx},
        test_utils::prepare_env::{prepare_test_env, random_db_path},
    };

    async fn new_db() -> SqliteDatabase {
        let url = random_db_path();
        prepare_test_env(&url).await;
        SqliteDatabase::new_with_url(&url, 5).await.expect("Error creating database")
    }

    fn new_order(id: &str, amount: i64) -> NewOrder {
        let now = Utc::now();
        NewOrder {
            order_id: OrderId::from(id),
            amount: BaseUnits::from(amount),
            currency: "DOT".into(),
            callback: "https://shop.example/callback".into(),
            payment_account: format!("account-{id}"),
            recipient: "merchant".into(),
            death: now + Duration::hours(1),
            created_at: now,
        }
    }

    fn transfer(tx_id: &str, amount: u128) -> NewTransfer {
        NewTransfer {
            tx_id: tx_id.into(),
            chain_name: "polkadot".into(),
            asset: AssetRef::Native,
            amount,
            block_number: 10,
            block_hash: "0xabc".into(),
        }
    }

    #[tokio::test]
    async fn insert_is_idempotent() {
        let db = new_db().await;
        let first = match db.insert_order(new_order("o1", 100)).await.unwrap() {
            InsertOrderResult::Inserted(o) => o,
            InsertOrderResult::AlreadyExists(_) => panic!("Order should be new"),
        };
        assert_eq!(first.version, 0);
        assert_eq!(first.payment_status, PaymentStatus::Pending);
        let mut again = new_order("o1", 500);
        again.payment_account = "something-else".into();
        match db.insert_order(again).await.unwrap() {
            InsertOrderResult::AlreadyExists(o) => assert_eq!(o, first),
            InsertOrderResult::Inserted(_) => panic!("Order should already exist"),
        }
        let by_account = db.fetch_order_by_account("account-o1").await.unwrap().unwrap();
        assert_eq!(by_account.order_id, first.order_id);
        assert!(db.fetch_order(&OrderId::from("nope")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn crediting_is_idempotent_and_versioned() {
        let db = new_db().await;
        db.insert_order(new_order("o2", 100)).await.unwrap();
        let id = OrderId::from("o2");
        let order = match db.credit_transfer(&id, 0, transfer("tx1", 50)).await.unwrap() {
            CreditResult::Credited(o) => o,
            r => panic!("Unexpected result {r:?}"),
        };
        assert_eq!(order.repaid_amount, BaseUnits::from(50));
        assert_eq!(order.payment_status, PaymentStatus::Pending);
        assert_eq!(order.version, 1);
        assert!(order.is_consistent());

        assert!(matches!(db.credit_transfer(&id, 0, transfer("tx2", 50)).await.unwrap(), CreditResult::VersionConflict));
        assert!(matches!(db.credit_transfer(&id, 1, transfer("tx1", 50)).await.unwrap(), CreditResult::Duplicate));

        let order = match db.credit_transfer(&id, 1, transfer("tx2", 60)).await.unwrap() {
            CreditResult::Credited(o) => o,
            r => panic!("Unexpected result {r:?}"),
        };
        assert_eq!(order.repaid_amount, BaseUnits::from(110));
        assert_eq!(order.payment_status, PaymentStatus::Paid);
        assert_eq!(order.transactions.len(), 2);
        assert!(order.is_consistent());
    }

    #[tokio::test]
    async fn foreign_transfers_are_not_counted() {
        let db = new_db().await;
        db.insert_order(new_order("o3", 100)).await.unwrap();
        let id = OrderId::from("o3");
        let mut foreign = transfer("tx9", 100);
        foreign.asset = AssetRef::Asset(1984);
        assert!(db.record_foreign_transfer(&id, foreign.clone()).await.unwrap());
        assert!(!db.record_foreign_transfer(&id, foreign).await.unwrap());
        let order = db.fetch_order(&id).await.unwrap().unwrap();
        assert_eq!(order.repaid_amount, BaseUnits::from(0));
        assert_eq!(order.transactions.len(), 1);
        assert!(!order.transactions[0].credited);
        assert!(order.is_consistent());
    }

    #[tokio::test]
    async fn amounts_beyond_base_units_are_kept_exactly() {
        let db = new_db().await;
        db.insert_order(new_order("o6", 100)).await.unwrap();
        let id = OrderId::from("o6");
        let mut huge = transfer("tx-huge", u128::MAX);
        huge.asset = AssetRef::Asset(4242);
        assert!(db.record_foreign_transfer(&id, huge).await.unwrap());
        let order = db.fetch_order(&id).await.unwrap().unwrap();
        assert_eq!(order.transactions[0].amount, u128::MAX);
        assert!(order.is_consistent());

        // Credited amounts are bounded by the order total's range
        let err = db.credit_transfer(&id, order.version, transfer("tx-big", u128::from(u64::MAX))).await.unwrap_err();
        assert!(matches!(err, SqliteDatabaseError::AmountOverflow(_)));
        let order = db.fetch_order(&id).await.unwrap().unwrap();
        assert_eq!(order.transactions.len(), 1);
        assert_eq!(order.repaid_amount, BaseUnits::from(0));
    }

    #[tokio::test]
    async fn withdrawal_updates_use_compare_and_swap() {
        let db = new_db().await;
        db.insert_order(new_order("o4", 100)).await.unwrap();
        let id = OrderId::from("o4");
        let update = WithdrawalUpdate {
            expected_version: 0,
            status: WithdrawalStatus::Withdrawing,
            withdrawal_tx: WithdrawalTx::Keep,
            message: "Withdrawal in progress".into(),
        };
        let order = db.update_withdrawal(&id, update.clone()).await.unwrap().unwrap();
        assert_eq!(order.withdrawal_status, WithdrawalStatus::Withdrawing);
        assert!(db.update_withdrawal(&id, update).await.unwrap().is_none());

        let done = WithdrawalUpdate {
            expected_version: 1,
            status: WithdrawalStatus::Failed,
            withdrawal_tx: WithdrawalTx::Record("0xfeed".into()),
            message: String::new(),
        };
        let order = db.update_withdrawal(&id, done).await.unwrap().unwrap();
        assert_eq!(order.withdrawal_tx.as_deref(), Some("0xfeed"));

        let keep = WithdrawalUpdate {
            expected_version: 2,
            status: WithdrawalStatus::Failed,
            withdrawal_tx: WithdrawalTx::Keep,
            message: "Still failed".into(),
        };
        let order = db.update_withdrawal(&id, keep).await.unwrap().unwrap();
        assert_eq!(order.withdrawal_tx.as_deref(), Some("0xfeed"));

        let retry = WithdrawalUpdate {
            expected_version: 3,
            status: WithdrawalStatus::Withdrawing,
            withdrawal_tx: WithdrawalTx::Clear,
            message: "Withdrawal in progress".into(),
        };
        let order = db.update_withdrawal(&id, retry).await.unwrap().unwrap();
        assert_eq!(order.withdrawal_tx, None);

        let done = WithdrawalUpdate {
            expected_version: 4,
            status: WithdrawalStatus::Completed,
            withdrawal_tx: WithdrawalTx::Record("0xbeef".into()),
            message: String::new(),
        };
        let order = db.update_withdrawal(&id, done).await.unwrap().unwrap();
        assert_eq!(order.withdrawal_tx.as_deref(), Some("0xbeef"));
        let completed = db.fetch_orders_by_withdrawal_status(WithdrawalStatus::Completed).await.unwrap();
        assert_eq!(completed.len(), 1);
        assert!(db.fetch_monitored_orders().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expiry_and_watermarks() {
        let db = new_db().await;
        db.insert_order(new_order("o5", 100)).await.unwrap();
        let id = OrderId::from("o5");
        let order = db.mark_expired(&id, 0, "Order expired").await.unwrap().unwrap();
        assert!(order.expired);
        assert_eq!(order.message, "Order expired");
        assert!(db.mark_expired(&id, 0, "Order expired").await.unwrap().is_none());
        assert!(db.fetch_monitored_orders().await.unwrap().is_empty());

        assert_eq!(db.fetch_watermark("ws://node").await.unwrap(), None);
        db.save_watermark("ws://node", 42).await.unwrap();
        db.save_watermark("ws://node", 40).await.unwrap();
        assert_eq!(db.fetch_watermark("ws://node").await.unwrap(), Some(42));
    }
}
