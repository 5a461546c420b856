//! Append-only alert log supporting cooldown queries.

use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqlitePool};

use crate::errors::StoreResult;

/// Record the outcome of an alert attempt.
pub async fn record(
    pool: &SqlitePool,
    kind: &str,
    title: &str,
    message: &str,
    success: bool,
) -> StoreResult<()> {
    sqlx::query("INSERT INTO alerts(kind, title, message, success) VALUES (?, ?, ?, ?)")
        .bind(kind)
        .bind(title)
        .bind(message)
        .bind(success)
        .execute(pool)
        .await?;
    Ok(())
}

/// Most recent successful alert timestamp for `kind`, if any.
pub async fn last_success_at(pool: &SqlitePool, kind: &str) -> StoreResult<Option<DateTime<Utc>>> {
    let row = sqlx::query(
        "SELECT created_at FROM alerts WHERE kind = ? AND success = 1
         ORDER BY created_at DESC LIMIT 1",
    )
    .bind(kind)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| {
        let ts: String = r.get("created_at");
        DateTime::parse_from_rfc3339(&ts)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now())
    }))
}

/// Whether a fresh alert of `kind` is currently suppressed by cooldown.
pub async fn within_cooldown(
    pool: &SqlitePool,
    kind: &str,
    cooldown_minutes: i64,
) -> StoreResult<bool> {
    match last_success_at(pool, kind).await? {
        Some(last) => Ok(Utc::now() - last < Duration::minutes(cooldown_minutes)),
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn successful_alert_triggers_cooldown_failed_does_not() {
        let pool = setup().await;
        assert!(!within_cooldown(&pool, "oauth_invalid_grant", 60).await.unwrap());

        record(&pool, "oauth_invalid_grant", "t", "m", false).await.unwrap();
        assert!(
            !within_cooldown(&pool, "oauth_invalid_grant", 60).await.unwrap(),
            "a failed alert must not count against the cooldown"
        );

        record(&pool, "oauth_invalid_grant", "t", "m", true).await.unwrap();
        assert!(within_cooldown(&pool, "oauth_invalid_grant", 60).await.unwrap());
    }
}
