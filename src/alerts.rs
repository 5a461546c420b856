//! Alert Manager: cooldown-bounded operator notifications, with a concrete
//! Pushover transport. Grounded on `app/notify/manager.py` and
//! `app/notify/pushover.py`.

use secrecy::{ExposeSecret, SecretString};
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::errors::StoreResult;
use crate::store::alert_repo;

#[derive(thiserror::Error, Debug)]
pub enum PushoverError {
    #[error("pushover http {status}: {body}")]
    Http { status: u16, body: String },
    #[error("pushover transport error: {0}")]
    Transport(String),
}

struct PushoverCredentials {
    api_token: SecretString,
    user_key: SecretString,
}

pub struct AlertManager {
    pool: SqlitePool,
    http: reqwest::Client,
    credentials: Option<PushoverCredentials>,
    cooldown_minutes: i64,
}

impl AlertManager {
    /// Disabled unless both credentials are present, matching
    /// `AlertManager.enabled = enabled and bool(api_token) and bool(user_key)`.
    pub fn new(
        pool: SqlitePool,
        api_token: Option<SecretString>,
        user_key: Option<SecretString>,
        cooldown_minutes: i64,
    ) -> Self {
        let credentials = match (api_token, user_key) {
            (Some(api_token), Some(user_key)) => Some(PushoverCredentials { api_token, user_key }),
            _ => None,
        };
        Self {
            pool,
            http: reqwest::Client::new(),
            credentials,
            cooldown_minutes,
        }
    }

    /// Send a cooldown-bounded alert. No-op when disabled or within cooldown.
    pub async fn send(&self, kind: &str, title: &str, message: &str) -> StoreResult<()> {
        let Some(creds) = &self.credentials else {
            return Ok(());
        };
        if alert_repo::within_cooldown(&self.pool, kind, self.cooldown_minutes).await? {
            return Ok(());
        }

        match send_pushover(&self.http, creds, title, message).await {
            Ok(()) => {
                alert_repo::record(&self.pool, kind, title, message, true).await?;
                info!(kind, "pushover_alert");
            }
            Err(err) => {
                let failure_message = format!("send_failed: {err}");
                alert_repo::record(&self.pool, kind, title, &failure_message, false).await?;
                warn!(kind, error = %err, "pushover_alert_failed");
            }
        }
        Ok(())
    }
}

/// Seconds to sleep between attempts. Three attempts total, matching
/// `app/notify/pushover.py`'s retry contract: each attempt re-issues the
/// whole request, re-resolving DNS whenever the prior connection couldn't be
/// reused.
const RETRY_DELAYS_SECONDS: [u64; 2] = [2, 5];

async fn send_pushover(
    http: &reqwest::Client,
    creds: &PushoverCredentials,
    title: &str,
    message: &str,
) -> Result<(), PushoverError> {
    let mut last_err = None;
    for attempt in 0..=RETRY_DELAYS_SECONDS.len() {
        match send_pushover_once(http, creds, title, message).await {
            Ok(()) => return Ok(()),
            Err(err @ PushoverError::Transport(_)) => {
                last_err = Some(err);
                if let Some(delay) = RETRY_DELAYS_SECONDS.get(attempt) {
                    tokio::time::sleep(std::time::Duration::from_secs(*delay)).await;
                }
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err.expect("loop always runs at least once"))
}

async fn send_pushover_once(
    http: &reqwest::Client,
    creds: &PushoverCredentials,
    title: &str,
    message: &str,
) -> Result<(), PushoverError> {
    let params = [
        ("token", creds.api_token.expose_secret()),
        ("user", creds.user_key.expose_secret()),
        ("title", title),
        ("message", message),
    ];

    let response = http
        .post("https://api.pushover.net/1/messages.json")
        .form(&params)
        .timeout(std::time::Duration::from_secs(10))
        .send()
        .await
        .map_err(|e| PushoverError::Transport(e.to_string()))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| PushoverError::Transport(e.to_string()))?;

    if status.as_u16() >= 400 {
        return Err(PushoverError::Http {
            status: status.as_u16(),
            body,
        });
    }

    let parsed: serde_json::Value = serde_json::from_str(&body).unwrap_or(serde_json::Value::Null);
    if parsed.get("status").and_then(|v| v.as_i64()) != Some(1) {
        return Err(PushoverError::Http {
            status: status.as_u16(),
            body,
        });
    }
    Ok(())
}
