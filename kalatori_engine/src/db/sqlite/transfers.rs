use chrono::Utc;
use kalatori_common::BaseUnits;
use log::*;
use sqlx::SqliteConnection;

use crate::{
    db::sqlite::SqliteDatabaseError,
    db_types::{NewTransfer, OrderId, Transfer, TransferRow},
};

/// Records a transfer against an order. Returns `false`, without changing anything, if a transfer with the same
/// `tx_id` has already been recorded for this order.
///
/// Only credited transfers count towards the order's total, and their amount must fit in [`BaseUnits`].
pub async fn idempotent_insert(
    order_id: &OrderId,
    transfer: &NewTransfer,
    credited: bool,
    conn: &mut SqliteConnection,
) -> Result<bool, SqliteDatabaseError> {
    let contribution = if credited {
        BaseUnits::try_from(transfer.amount).map_err(|_| SqliteDatabaseError::AmountOverflow(order_id.to_string()))?
    } else {
        BaseUnits::default()
    };
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO transfers
            (order_id, tx_id, chain_name, asset, amount, raw_amount, block_number, block_hash, credited, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(order_id)
    .bind(&transfer.tx_id)
    .bind(&transfer.chain_name)
    .bind(transfer.asset.to_string())
    .bind(contribution)
    .bind(transfer.amount.to_string())
    .bind(transfer.block_number)
    .bind(&transfer.block_hash)
    .bind(credited)
    .bind(Utc::now())
    .execute(conn)
    .await?;
    let inserted = result.rows_affected() > 0;
    if inserted {
        trace!("🗃️ Transfer {} of {} recorded for order {order_id}", transfer.tx_id, transfer.amount);
    }
    Ok(inserted)
}

/// All transfers recorded for the order, in the order they were recorded.
pub async fn fetch_transfers_for_order(
    order_id: &OrderId,
    conn: &mut SqliteConnection,
) -> Result<Vec<Transfer>, SqliteDatabaseError> {
    let rows = sqlx::query_as::<_, TransferRow>(
        r#"
        SELECT tx_id, chain_name, asset, raw_amount, block_number, block_hash, credited, created_at
        FROM transfers
        WHERE order_id = ?
        ORDER BY id ASC
        "#,
    )
    .bind(order_id)
    .fetch_all(conn)
    .await?;
    rows.into_iter()
        .map(|row| Transfer::try_from(row).map_err(|e| SqliteDatabaseError::QueryError(e.to_string())))
        .collect()
}

/// Recomputes the amount credited to the order from the transfers table.
pub async fn credited_total(order_id: &OrderId, conn: &mut SqliteConnection) -> Result<BaseUnits, SqliteDatabaseError> {
    let amounts: Vec<i64> = sqlx::query_scalar("SELECT amount FROM transfers WHERE order_id = ? AND credited = 1")
        .bind(order_id)
        .fetch_all(conn)
        .await?;
    amounts
        .into_iter()
        .try_fold(0i64, |total, a| total.checked_add(a))
        .map(BaseUnits::from)
        .ok_or_else(|| SqliteDatabaseError::AmountOverflow(order_id.to_string()))
}
