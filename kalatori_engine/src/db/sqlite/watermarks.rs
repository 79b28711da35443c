use chrono::Utc;
use sqlx::SqliteConnection;

use crate::db::sqlite::SqliteDatabaseError;

pub async fn fetch_watermark(endpoint: &str, conn: &mut SqliteConnection) -> Result<Option<u64>, SqliteDatabaseError> {
    let block: Option<i64> = sqlx::query_scalar("SELECT block_number FROM chain_watermarks WHERE endpoint = ?")
        .bind(endpoint)
        .fetch_optional(conn)
        .await?;
    block
        .map(|b| u64::try_from(b).map_err(|_| SqliteDatabaseError::QueryError(format!("Invalid watermark {b}"))))
        .transpose()
}

/// Moves the watermark for `endpoint` forward. The watermark never moves backwards.
pub async fn save_watermark(endpoint: &str, block_number: u64, conn: &mut SqliteConnection) -> Result<(), SqliteDatabaseError> {
    let block = i64::try_from(block_number)
        .map_err(|_| SqliteDatabaseError::QueryError(format!("Block number {block_number} is out of range")))?;
    sqlx::query(
        r#"
        INSERT INTO chain_watermarks (endpoint, block_number, updated_at) VALUES (?, ?, ?)
        ON CONFLICT (endpoint) DO UPDATE SET
            block_number = MAX(block_number, excluded.block_number),
            updated_at = excluded.updated_at
        "#,
    )
    .bind(endpoint)
    .bind(block)
    .bind(Utc::now())
    .execute(conn)
    .await?;
    Ok(())
}
