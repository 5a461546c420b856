//! Message lifecycle persistence: idempotent insert, lease acquisition,
//! delivery/deletion completion and failure bookkeeping, stuck-lease sweep.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use sqlx::{Row, SqlitePool};

use crate::errors::StoreResult;
use crate::store::models::{MessageRow, MessageState, NewMessage};

/// `[60, 120, 240, 480, 900, 1800, 3600]` seconds, indexed by `min(attempt_count, 6)`.
const BACKOFF_SCHEDULE_SECONDS: [i64; 7] = [60, 120, 240, 480, 900, 1800, 3600];

const LEASE_TIMEOUT_MINUTES: i64 = 10;

/// Compute the next retry time for a given attempt count, with uniform jitter
/// in `[0.8, 1.2]` applied to the scheduled delay.
pub fn next_attempt_at(attempt_count: i64, now: DateTime<Utc>) -> DateTime<Utc> {
    let idx = attempt_count.clamp(0, 6) as usize;
    let base = BACKOFF_SCHEDULE_SECONDS[idx] as f64;
    let jitter = rand::rng().random_range(0.8..=1.2);
    now + Duration::milliseconds((base * jitter * 1000.0) as i64)
}

fn row_to_message(r: sqlx::sqlite::SqliteRow) -> MessageRow {
    MessageRow {
        id: r.get("id"),
        account_id: r.get("account_id"),
        mailbox_name: r.get("mailbox_name"),
        uidvalidity: r.get("uidvalidity"),
        uid: r.get("uid"),
        message_id: r.get("message_id"),
        rfc822_sha256: r.get("rfc822_sha256"),
        imap_internaldate: r.get("imap_internaldate"),
        imap_flags_json: r.get("imap_flags_json"),
        state: MessageState::parse(&r.get::<String, _>("state")).unwrap_or(MessageState::Fetched),
        attempt_count: r.get("attempt_count"),
        next_attempt_at: r.get::<Option<String>, _>("next_attempt_at").and_then(parse_ts),
        last_error: r.get("last_error"),
        gmail_message_id: r.get("gmail_message_id"),
        gmail_thread_id: r.get("gmail_thread_id"),
        yahoo_deleted_at: r.get::<Option<String>, _>("yahoo_deleted_at").and_then(parse_ts),
        yahoo_delete_attempt_count: r.get("yahoo_delete_attempt_count"),
        yahoo_delete_next_attempt_at: r
            .get::<Option<String>, _>("yahoo_delete_next_attempt_at")
            .and_then(parse_ts),
        yahoo_delete_last_error: r.get("yahoo_delete_last_error"),
    }
}

fn parse_ts(s: String) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Insert a newly fetched message in state `FETCHED`. A no-op if the row
/// already exists (same account/mailbox/uidvalidity/uid).
pub async fn insert_fetched(pool: &SqlitePool, msg: &NewMessage) -> StoreResult<()> {
    sqlx::query(
        "INSERT OR IGNORE INTO messages
            (account_id, mailbox_name, uidvalidity, uid, message_id, rfc822_sha256,
             imap_internaldate, imap_flags_json, state)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'FETCHED')",
    )
    .bind(msg.account_id)
    .bind(&msg.mailbox_name)
    .bind(msg.uidvalidity)
    .bind(msg.uid)
    .bind(&msg.message_id)
    .bind(&msg.rfc822_sha256)
    .bind(&msg.imap_internaldate)
    .bind(&msg.imap_flags_json)
    .execute(pool)
    .await?;
    Ok(())
}

/// Select up to `limit` rows due for delivery, ordered so that never-attempted
/// rows come first, then soonest-due, then oldest-created.
pub async fn select_due_delivery(pool: &SqlitePool, limit: i64) -> StoreResult<Vec<MessageRow>> {
    let rows = sqlx::query(
        "SELECT * FROM messages
          WHERE state IN ('FETCHED', 'FAILED_RETRY')
            AND (next_attempt_at IS NULL OR next_attempt_at <= strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
          ORDER BY (next_attempt_at IS NULL) DESC, next_attempt_at ASC, created_at ASC
          LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(row_to_message).collect())
}

/// Select up to `limit` rows due for source-side deletion.
pub async fn select_due_deletion(pool: &SqlitePool, limit: i64) -> StoreResult<Vec<MessageRow>> {
    let rows = sqlx::query(
        "SELECT * FROM messages
          WHERE state = 'INSERTED' AND yahoo_deleted_at IS NULL
            AND (yahoo_delete_next_attempt_at IS NULL
                 OR yahoo_delete_next_attempt_at <= strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
          ORDER BY (yahoo_delete_next_attempt_at IS NULL) DESC,
                   yahoo_delete_next_attempt_at ASC, created_at ASC
          LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(row_to_message).collect())
}

/// Acquire the delivery lease for a single row. Returns `true` iff exactly one
/// row was updated — the sole mechanism serializing concurrent delivery.
pub async fn acquire_insert_lease(pool: &SqlitePool, id: i64) -> StoreResult<bool> {
    let result = sqlx::query(
        "UPDATE messages SET state = 'INSERTING', updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
          WHERE id = ?
            AND state IN ('FETCHED', 'FAILED_RETRY')
            AND (next_attempt_at IS NULL OR next_attempt_at <= strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn mark_inserted(
    pool: &SqlitePool,
    id: i64,
    gmail_message_id: &str,
    gmail_thread_id: &str,
) -> StoreResult<()> {
    sqlx::query(
        "UPDATE messages SET state = 'INSERTED', gmail_message_id = ?, gmail_thread_id = ?,
         updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') WHERE id = ?",
    )
    .bind(gmail_message_id)
    .bind(gmail_thread_id)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_failed_retry(pool: &SqlitePool, id: i64, last_error: &str) -> StoreResult<()> {
    let row = sqlx::query("SELECT attempt_count FROM messages WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await?;
    let attempt_count: i64 = row.get("attempt_count");
    let next = next_attempt_at(attempt_count, Utc::now());

    sqlx::query(
        "UPDATE messages SET state = 'FAILED_RETRY', attempt_count = attempt_count + 1,
         last_error = ?, next_attempt_at = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
         WHERE id = ?",
    )
    .bind(last_error)
    .bind(next.to_rfc3339())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_failed_perm(pool: &SqlitePool, id: i64, last_error: &str) -> StoreResult<()> {
    sqlx::query(
        "UPDATE messages SET state = 'FAILED_PERM', last_error = ?,
         updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') WHERE id = ?",
    )
    .bind(last_error)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_deleted(pool: &SqlitePool, id: i64) -> StoreResult<()> {
    sqlx::query(
        "UPDATE messages SET yahoo_deleted_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now'),
         updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') WHERE id = ?",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_delete_failed_retry(
    pool: &SqlitePool,
    id: i64,
    last_error: &str,
) -> StoreResult<()> {
    let row = sqlx::query("SELECT yahoo_delete_attempt_count FROM messages WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await?;
    let attempt_count: i64 = row.get("yahoo_delete_attempt_count");
    let next = next_attempt_at(attempt_count, Utc::now());

    sqlx::query(
        "UPDATE messages SET yahoo_delete_attempt_count = yahoo_delete_attempt_count + 1,
         yahoo_delete_last_error = ?, yahoo_delete_next_attempt_at = ?,
         updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') WHERE id = ?",
    )
    .bind(last_error)
    .bind(next.to_rfc3339())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Sweep stuck `INSERTING` leases back to `FAILED_RETRY`. Run once at worker
/// startup; idempotent.
pub async fn recover_stuck_insertions(pool: &SqlitePool) -> StoreResult<u64> {
    let cutoff = (Utc::now() - Duration::minutes(LEASE_TIMEOUT_MINUTES)).to_rfc3339();
    let result = sqlx::query(
        "UPDATE messages SET state = 'FAILED_RETRY', attempt_count = attempt_count + 1,
         last_error = 'lease_timeout', next_attempt_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now'),
         updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
         WHERE state = 'INSERTING' AND updated_at <= ?",
    )
    .bind(cutoff)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mailbox_repo::ensure_account;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup() -> (SqlitePool, i64) {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let account_id = ensure_account(&pool, "user@yahoo.com", "user@gmail.com")
            .await
            .unwrap();
        (pool, account_id)
    }

    async fn insert_one(pool: &SqlitePool, account_id: i64) -> i64 {
        insert_fetched(
            pool,
            &NewMessage {
                account_id,
                mailbox_name: "INBOX".into(),
                uidvalidity: 1,
                uid: 42,
                message_id: Some("<m1@x>".into()),
                rfc822_sha256: "deadbeef".into(),
                imap_internaldate: None,
                imap_flags_json: "[]".into(),
            },
        )
        .await
        .unwrap();
        sqlx::query("SELECT id FROM messages WHERE uid = 42")
            .fetch_one(pool)
            .await
            .unwrap()
            .get("id")
    }

    #[tokio::test]
    async fn insert_fetched_is_idempotent() {
        let (pool, account_id) = setup().await;
        insert_one(&pool, account_id).await;
        insert_one(&pool, account_id).await;
        let count: i64 = sqlx::query("SELECT COUNT(*) AS c FROM messages")
            .fetch_one(&pool)
            .await
            .unwrap()
            .get("c");
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn lease_acquisition_is_exclusive() {
        let (pool, account_id) = setup().await;
        let id = insert_one(&pool, account_id).await;
        assert!(acquire_insert_lease(&pool, id).await.unwrap());
        assert!(!acquire_insert_lease(&pool, id).await.unwrap());
    }

    #[tokio::test]
    async fn mark_inserted_requires_both_gmail_ids() {
        let (pool, account_id) = setup().await;
        let id = insert_one(&pool, account_id).await;
        acquire_insert_lease(&pool, id).await.unwrap();
        mark_inserted(&pool, id, "M1", "T1").await.unwrap();

        let row = sqlx::query("SELECT state, gmail_message_id, gmail_thread_id FROM messages WHERE id = ?")
            .bind(id)
            .fetch_one(&pool)
            .await
            .unwrap();
        let state: String = row.get("state");
        let gmail_message_id: Option<String> = row.get("gmail_message_id");
        let gmail_thread_id: Option<String> = row.get("gmail_thread_id");
        assert_eq!(state, "INSERTED");
        assert!(gmail_message_id.is_some());
        assert!(gmail_thread_id.is_some());
    }

    #[tokio::test]
    async fn stuck_lease_recovery_increments_attempt_count_once() {
        let (pool, account_id) = setup().await;
        let id = insert_one(&pool, account_id).await;
        acquire_insert_lease(&pool, id).await.unwrap();
        let stale = (Utc::now() - Duration::minutes(20)).to_rfc3339();
        sqlx::query("UPDATE messages SET updated_at = ? WHERE id = ?")
            .bind(stale)
            .bind(id)
            .execute(&pool)
            .await
            .unwrap();

        let recovered = recover_stuck_insertions(&pool).await.unwrap();
        assert_eq!(recovered, 1);

        let row = sqlx::query("SELECT state, attempt_count, last_error FROM messages WHERE id = ?")
            .bind(id)
            .fetch_one(&pool)
            .await
            .unwrap();
        let state: String = row.get("state");
        let attempt_count: i64 = row.get("attempt_count");
        let last_error: String = row.get("last_error");
        assert_eq!(state, "FAILED_RETRY");
        assert_eq!(attempt_count, 1);
        assert_eq!(last_error, "lease_timeout");

        assert_eq!(recover_stuck_insertions(&pool).await.unwrap(), 0);
    }

    #[test]
    fn next_attempt_at_respects_jitter_bounds() {
        let now = Utc::now();
        for (attempt, scheduled) in BACKOFF_SCHEDULE_SECONDS.iter().enumerate() {
            for _ in 0..20 {
                let at = next_attempt_at(attempt as i64, now);
                let delta = (at - now).num_milliseconds() as f64 / 1000.0;
                assert!(delta >= *scheduled as f64 * 0.8 - 0.01);
                assert!(delta <= *scheduled as f64 * 1.2 + 0.01);
            }
        }
        // attempt counts beyond the table clamp to the last entry.
        let at = next_attempt_at(99, now);
        let delta = (at - now).num_milliseconds() as f64 / 1000.0;
        assert!(delta <= 3600.0 * 1.2 + 0.01);
    }
}
