use chrono::Utc;
use kalatori_common::BaseUnits;
use log::*;
use sqlx::SqliteConnection;

use crate::{
    db::{sqlite::SqliteDatabaseError, traits::InsertOrderResult},
    db_types::{NewOrder, Order, OrderId, OrderRow, PaymentStatus, WithdrawalStatus, WithdrawalTx, WithdrawalUpdate},
};

const ORDER_COLUMNS: &str = "order_id, amount, currency, callback, payment_account, recipient, repaid_amount, \
                             payment_status, withdrawal_status, withdrawal_tx, expired, message, death, created_at, \
                             updated_at, version";

/// Inserts the order if no order with the same id exists yet. Either way, the stored order is returned.
pub async fn idempotent_insert(
    order: NewOrder,
    conn: &mut SqliteConnection,
) -> Result<InsertOrderResult, SqliteDatabaseError> {
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO orders
            (order_id, amount, currency, callback, payment_account, recipient, death, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&order.order_id)
    .bind(order.amount)
    .bind(&order.currency)
    .bind(&order.callback)
    .bind(&order.payment_account)
    .bind(&order.recipient)
    .bind(order.death)
    .bind(order.created_at)
    .bind(order.created_at)
    .execute(&mut *conn)
    .await?;
    let inserted = result.rows_affected() > 0;
    let stored = fetch_order(&order.order_id, conn).await?.ok_or_else(|| {
        // The insert was ignored, but not because of the order id. The only other unique column is the account.
        SqliteDatabaseError::QueryError(format!(
            "Payment account {} is already assigned to another order",
            order.payment_account
        ))
    })?;
    if inserted {
        debug!("🗃️ Order {} has been saved in the DB", order.order_id);
        Ok(InsertOrderResult::Inserted(stored))
    } else {
        Ok(InsertOrderResult::AlreadyExists(stored))
    }
}

pub async fn fetch_order(order_id: &OrderId, conn: &mut SqliteConnection) -> Result<Option<Order>, SqliteDatabaseError> {
    let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE order_id = ?");
    let row = sqlx::query_as::<_, OrderRow>(&sql).bind(order_id).fetch_optional(&mut *conn).await?;
    with_transfers(row, conn).await
}

pub async fn fetch_order_by_account(
    address: &str,
    conn: &mut SqliteConnection,
) -> Result<Option<Order>, SqliteDatabaseError> {
    let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE payment_account = ?");
    let row = sqlx::query_as::<_, OrderRow>(&sql).bind(address).fetch_optional(&mut *conn).await?;
    with_transfers(row, conn).await
}

async fn with_transfers(
    row: Option<OrderRow>,
    conn: &mut SqliteConnection,
) -> Result<Option<Order>, SqliteDatabaseError> {
    match row {
        Some(row) => {
            let transfers = super::transfers::fetch_transfers_for_order(&row.order_id, conn).await?;
            Ok(Some(row.into_order(transfers)))
        },
        None => Ok(None),
    }
}

/// Which orders [`fetch_orders`] should return.
#[derive(Debug, Clone, Copy)]
pub enum OrderQueryFilter {
    /// Orders that are neither expired nor withdrawn.
    Monitored,
    WithdrawalStatus(WithdrawalStatus),
}

/// Fetches orders matching the filter, oldest first.
pub async fn fetch_orders(
    filter: OrderQueryFilter,
    conn: &mut SqliteConnection,
) -> Result<Vec<Order>, SqliteDatabaseError> {
    let rows = match filter {
        OrderQueryFilter::Monitored => {
            let sql = format!(
                "SELECT {ORDER_COLUMNS} FROM orders WHERE expired = 0 AND withdrawal_status != ? ORDER BY created_at \
                 ASC"
            );
            sqlx::query_as::<_, OrderRow>(&sql).bind(WithdrawalStatus::Completed).fetch_all(&mut *conn).await?
        },
        OrderQueryFilter::WithdrawalStatus(status) => {
            let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE withdrawal_status = ? ORDER BY created_at ASC");
            sqlx::query_as::<_, OrderRow>(&sql).bind(status).fetch_all(&mut *conn).await?
        },
    };
    let mut orders = Vec::with_capacity(rows.len());
    for row in rows {
        let transfers = super::transfers::fetch_transfers_for_order(&row.order_id, conn).await?;
        orders.push(row.into_order(transfers));
    }
    trace!("🗃️ Fetched {} orders for {filter:?}", orders.len());
    Ok(orders)
}

/// Version of the order, or `None` if the order does not exist.
pub async fn fetch_version(order_id: &OrderId, conn: &mut SqliteConnection) -> Result<Option<i64>, SqliteDatabaseError> {
    let version = sqlx::query_scalar("SELECT version FROM orders WHERE order_id = ?")
        .bind(order_id)
        .fetch_optional(conn)
        .await?;
    Ok(version)
}

/// Stores a freshly computed credited total, and derives the payment status from it.
pub async fn update_totals(
    order_id: &OrderId,
    expected_version: i64,
    repaid_amount: BaseUnits,
    conn: &mut SqliteConnection,
) -> Result<bool, SqliteDatabaseError> {
    let result = sqlx::query(
        r#"
        UPDATE orders SET
            repaid_amount = ?,
            payment_status = CASE WHEN ? >= amount THEN ? ELSE ? END,
            updated_at = ?,
            version = version + 1
        WHERE order_id = ? AND version = ?
        "#,
    )
    .bind(repaid_amount)
    .bind(repaid_amount)
    .bind(PaymentStatus::Paid)
    .bind(PaymentStatus::Pending)
    .bind(Utc::now())
    .bind(order_id)
    .bind(expected_version)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn update_withdrawal(
    order_id: &OrderId,
    update: &WithdrawalUpdate,
    conn: &mut SqliteConnection,
) -> Result<bool, SqliteDatabaseError> {
    let (clear, tx_id) = match &update.withdrawal_tx {
        WithdrawalTx::Keep => (false, None),
        WithdrawalTx::Record(tx_id) => (false, Some(tx_id.as_str())),
        WithdrawalTx::Clear => (true, None),
    };
    let result = sqlx::query(
        r#"
        UPDATE orders SET
            withdrawal_status = ?,
            withdrawal_tx = CASE WHEN ? THEN NULL ELSE COALESCE(?, withdrawal_tx) END,
            message = ?,
            updated_at = ?,
            version = version + 1
        WHERE order_id = ? AND version = ?
        "#,
    )
    .bind(update.status)
    .bind(clear)
    .bind(tx_id)
    .bind(&update.message)
    .bind(Utc::now())
    .bind(order_id)
    .bind(update.expected_version)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn mark_expired(
    order_id: &OrderId,
    expected_version: i64,
    message: &str,
    conn: &mut SqliteConnection,
) -> Result<bool, SqliteDatabaseError> {
    let result = sqlx::query(
        r#"
        UPDATE orders SET expired = 1, message = ?, updated_at = ?, version = version + 1
        WHERE order_id = ? AND version = ? AND payment_status = ? AND withdrawal_status = ?
        "#,
    )
    .bind(message)
    .bind(Utc::now())
    .bind(order_id)
    .bind(expected_version)
    .bind(PaymentStatus::Pending)
    .bind(WithdrawalStatus::Waiting)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() > 0)
}
