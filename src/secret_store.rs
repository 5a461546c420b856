//! Secret storage: an opaque `(key, ciphertext, created_at)` KV backed by the
//! state database, encrypted with an AES-256-GCM envelope.
//!
//! The core never touches raw key material beyond `get`/`set`/`created_at` —
//! this module is the concrete, minimal implementation of that boundary.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::errors::StoreResult;

const NONCE_LEN: usize = 12;

#[derive(Clone)]
pub struct SecretStore {
    pool: SqlitePool,
    cipher: Aes256Gcm,
}

impl SecretStore {
    pub fn new(pool: SqlitePool, master_key: &[u8; 32]) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(master_key);
        Self {
            pool,
            cipher: Aes256Gcm::new(key),
        }
    }

    fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let mut ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .expect("AES-GCM encryption is infallible for any plaintext length we use");
        let mut out = nonce.to_vec();
        out.append(&mut ciphertext);
        out
    }

    fn decrypt(&self, envelope: &[u8]) -> Option<Vec<u8>> {
        if envelope.len() < NONCE_LEN {
            return None;
        }
        let (nonce, ciphertext) = envelope.split_at(NONCE_LEN);
        self.cipher
            .decrypt(nonce.into(), ciphertext)
            .ok()
    }

    /// Upsert a secret, refreshing `created_at` to now.
    pub async fn set(&self, key: &str, plaintext: &[u8]) -> StoreResult<()> {
        let envelope = self.encrypt(plaintext);
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO secrets(key, ciphertext, created_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET ciphertext = excluded.ciphertext, created_at = excluded.created_at",
        )
        .bind(key)
        .bind(envelope)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetch and decrypt a secret's plaintext, or `None` if absent.
    pub async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT ciphertext FROM secrets WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|r| {
            let envelope: Vec<u8> = r.get("ciphertext");
            self.decrypt(&envelope)
        }))
    }

    /// Fetch only the `created_at` timestamp, used to detect external rotation
    /// without decrypting the value.
    pub async fn created_at(&self, key: &str) -> StoreResult<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT created_at FROM secrets WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| {
            let ts: String = r.get("created_at");
            DateTime::parse_from_rfc3339(&ts)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now())
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup() -> SecretStore {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query("CREATE TABLE secrets (key TEXT PRIMARY KEY, ciphertext BLOB NOT NULL, created_at TEXT NOT NULL)")
            .execute(&pool)
            .await
            .unwrap();
        SecretStore::new(pool, &[0x42u8; 32])
    }

    #[tokio::test]
    async fn round_trips_a_secret() {
        let store = setup().await;
        store.set("oauth_tokens", b"top secret bytes").await.unwrap();
        let got = store.get("oauth_tokens").await.unwrap();
        assert_eq!(got, Some(b"top secret bytes".to_vec()));
    }

    #[tokio::test]
    async fn missing_key_returns_none() {
        let store = setup().await;
        assert_eq!(store.get("nope").await.unwrap(), None);
        assert_eq!(store.created_at("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn overwrite_updates_created_at() {
        let store = setup().await;
        store.set("k", b"v1").await.unwrap();
        let first = store.created_at("k").await.unwrap().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.set("k", b"v2").await.unwrap();
        let second = store.created_at("k").await.unwrap().unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v2".to_vec()));
        assert!(second >= first);
    }
}
