//! Label id cache and system-label resolver, grounded on
//! `app/gmail/labels.py`.

use serde::Deserialize;
use serde_json::json;
use sqlx::SqlitePool;

use crate::errors::{DeliveryError, StoreError};
use crate::store::label_repo;

const API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";

#[derive(thiserror::Error, Debug)]
pub enum LabelError {
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("missing required Gmail system labels: {0}")]
    MissingSystemLabels(String),
}

#[derive(Deserialize)]
struct LabelsListResponse {
    #[serde(default)]
    labels: Vec<GmailLabel>,
}

#[derive(Deserialize)]
struct GmailLabel {
    id: String,
    name: String,
}

async fn list_remote_labels(
    http: &reqwest::Client,
    access_token: &str,
) -> Result<Vec<GmailLabel>, DeliveryError> {
    let url = format!("{API_BASE}/users/me/labels");
    let response = http
        .get(&url)
        .bearer_auth(access_token)
        .send()
        .await
        .map_err(|e| DeliveryError::Transport(e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(DeliveryError::Http {
            status: status.as_u16(),
            body,
        });
    }
    let parsed: LabelsListResponse = response
        .json()
        .await
        .map_err(|e| DeliveryError::Transport(e.to_string()))?;
    Ok(parsed.labels)
}

async fn create_remote_label(
    http: &reqwest::Client,
    access_token: &str,
    name: &str,
) -> Result<String, DeliveryError> {
    let url = format!("{API_BASE}/users/me/labels");
    let body = json!({ "name": name, "labelListVisibility": "labelShow" });
    let response = http
        .post(&url)
        .bearer_auth(access_token)
        .json(&body)
        .send()
        .await
        .map_err(|e| DeliveryError::Transport(e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(DeliveryError::Http {
            status: status.as_u16(),
            body,
        });
    }
    let parsed: GmailLabel = response
        .json()
        .await
        .map_err(|e| DeliveryError::Transport(e.to_string()))?;
    Ok(parsed.id)
}

/// Resolve a custom label's id, checked against the cache first, creating it
/// remotely if it doesn't yet exist.
pub async fn ensure_label(
    http: &reqwest::Client,
    pool: &SqlitePool,
    access_token: &str,
    account_id: i64,
    label_name: &str,
) -> Result<String, LabelError> {
    if let Some(cached) = label_repo::get_cached_label_id(pool, account_id, label_name).await? {
        return Ok(cached);
    }

    let remote = list_remote_labels(http, access_token).await?;
    if let Some(found) = remote.iter().find(|l| l.name == label_name) {
        label_repo::cache_label_id(pool, account_id, label_name, &found.id).await?;
        return Ok(found.id.clone());
    }

    let created_id = create_remote_label(http, access_token, label_name).await?;
    label_repo::cache_label_id(pool, account_id, label_name, &created_id).await?;
    Ok(created_id)
}

/// Look up required system label ids (e.g. `INBOX`, `UNREAD`) by name,
/// failing loudly if any is missing.
pub async fn system_label_ids(
    http: &reqwest::Client,
    access_token: &str,
    names: &[&str],
) -> Result<std::collections::HashMap<String, String>, LabelError> {
    let remote = list_remote_labels(http, access_token).await?;
    let by_name: std::collections::HashMap<String, String> =
        remote.into_iter().map(|l| (l.name, l.id)).collect();

    let missing: Vec<&str> = names
        .iter()
        .filter(|n| !by_name.contains_key(**n))
        .copied()
        .collect();
    if !missing.is_empty() {
        return Err(LabelError::MissingSystemLabels(missing.join(", ")));
    }

    Ok(names
        .iter()
        .map(|n| (n.to_string(), by_name[*n].clone()))
        .collect())
}
