//! Connection pool bootstrap and embedded migrations.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::errors::StoreResult;

/// Open (creating if absent) the sqlite database at `path` and apply pending
/// migrations. Filename-versioned, same ordering contract as a bespoke
/// migration runner, via `sqlx::migrate!`.
pub async fn connect(path: &str) -> StoreResult<SqlitePool> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}
