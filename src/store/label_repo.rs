//! Label id cache: one-time lookup, upsert-on-write. Grounded on
//! `app/gmail/labels.py`'s `gmail_labels` table.

use sqlx::{Row, SqlitePool};

use crate::errors::StoreResult;

pub async fn get_cached_label_id(
    pool: &SqlitePool,
    account_id: i64,
    label_name: &str,
) -> StoreResult<Option<String>> {
    let row = sqlx::query(
        "SELECT label_id FROM gmail_labels WHERE account_id = ? AND label_name = ?",
    )
    .bind(account_id)
    .bind(label_name)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| r.get("label_id")))
}

pub async fn cache_label_id(
    pool: &SqlitePool,
    account_id: i64,
    label_name: &str,
    label_id: &str,
) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO gmail_labels(account_id, label_name, label_id) VALUES (?, ?, ?)
         ON CONFLICT(account_id, label_name) DO UPDATE SET label_id = excluded.label_id",
    )
    .bind(account_id)
    .bind(label_name)
    .bind(label_id)
    .execute(pool)
    .await?;
    Ok(())
}
