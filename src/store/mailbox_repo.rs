//! Account and mailbox cursor persistence.

use sqlx::{Row, SqlitePool};

use crate::errors::StoreResult;
use crate::store::models::MailboxRow;

/// Create the account row if absent, returning its id either way.
pub async fn ensure_account(
    pool: &SqlitePool,
    source_email: &str,
    destination_user: &str,
) -> StoreResult<i64> {
    sqlx::query("INSERT OR IGNORE INTO accounts(source_email, destination_user) VALUES (?, ?)")
        .bind(source_email)
        .bind(destination_user)
        .execute(pool)
        .await?;

    let row = sqlx::query("SELECT id FROM accounts WHERE source_email = ?")
        .bind(source_email)
        .fetch_one(pool)
        .await?;
    Ok(row.get("id"))
}

pub async fn get_mailbox(
    pool: &SqlitePool,
    account_id: i64,
    name: &str,
) -> StoreResult<Option<MailboxRow>> {
    let row = sqlx::query(
        "SELECT account_id, name, uidvalidity, last_seen_uid FROM mailboxes
         WHERE account_id = ? AND name = ?",
    )
    .bind(account_id)
    .bind(name)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| MailboxRow {
        account_id: r.get("account_id"),
        name: r.get("name"),
        uidvalidity: r.get("uidvalidity"),
        last_seen_uid: r.get("last_seen_uid"),
    }))
}

/// Insert the initial cursor row for a mailbox never seen before.
pub async fn initialize_mailbox(
    pool: &SqlitePool,
    account_id: i64,
    name: &str,
    uidvalidity: i64,
    last_seen_uid: i64,
) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO mailboxes(account_id, name, uidvalidity, last_seen_uid, updated_at)
         VALUES (?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))",
    )
    .bind(account_id)
    .bind(name)
    .bind(uidvalidity)
    .bind(last_seen_uid)
    .execute(pool)
    .await?;
    Ok(())
}

/// Reset the cursor to a new UIDVALIDITY, discarding `last_seen_uid`.
pub async fn reset_uidvalidity(
    pool: &SqlitePool,
    account_id: i64,
    name: &str,
    new_uidvalidity: i64,
) -> StoreResult<()> {
    sqlx::query(
        "UPDATE mailboxes SET uidvalidity = ?, last_seen_uid = 0,
         updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
         WHERE account_id = ? AND name = ?",
    )
    .bind(new_uidvalidity)
    .bind(account_id)
    .bind(name)
    .execute(pool)
    .await?;
    Ok(())
}

/// Advance the cursor; never moves it backwards.
pub async fn advance_last_seen_uid(
    pool: &SqlitePool,
    account_id: i64,
    name: &str,
    last_seen_uid: i64,
) -> StoreResult<()> {
    sqlx::query(
        "UPDATE mailboxes SET last_seen_uid = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
         WHERE account_id = ? AND name = ? AND last_seen_uid < ?",
    )
    .bind(last_seen_uid)
    .bind(account_id)
    .bind(name)
    .bind(last_seen_uid)
    .execute(pool)
    .await?;
    Ok(())
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
    async fn uidvalidity_change_resets_cursor_to_zero() {
        let pool = setup().await;
        let account_id = ensure_account(&pool, "user@yahoo.com", "user@gmail.com")
            .await
            .unwrap();
        initialize_mailbox(&pool, account_id, "INBOX", 100, 42)
            .await
            .unwrap();
        reset_uidvalidity(&pool, account_id, "INBOX", 200)
            .await
            .unwrap();
        let row = get_mailbox(&pool, account_id, "INBOX")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.uidvalidity, 200);
        assert_eq!(row.last_seen_uid, 0);
    }

    #[tokio::test]
    async fn advance_last_seen_uid_is_monotonic() {
        let pool = setup().await;
        let account_id = ensure_account(&pool, "user@yahoo.com", "user@gmail.com")
            .await
            .unwrap();
        initialize_mailbox(&pool, account_id, "INBOX", 1, 10)
            .await
            .unwrap();
        advance_last_seen_uid(&pool, account_id, "INBOX", 5)
            .await
            .unwrap();
        let row = get_mailbox(&pool, account_id, "INBOX")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.last_seen_uid, 10, "must never move backwards");

        advance_last_seen_uid(&pool, account_id, "INBOX", 20)
            .await
            .unwrap();
        let row = get_mailbox(&pool, account_id, "INBOX")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.last_seen_uid, 20);
    }
}
