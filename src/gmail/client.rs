//! Destination delivery adapter. Plain `reqwest` calls against the Gmail REST
//! API rather than a generated client, so the retryable/permanent HTTP-status
//! classification is explicit, inspectable code.

use base64::Engine;
use serde::Deserialize;
use serde_json::json;

use crate::errors::DeliveryError;

const API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

pub struct GmailClient {
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct ImportResponse {
    id: String,
    #[serde(rename = "threadId")]
    thread_id: String,
}

#[derive(Deserialize)]
struct ListMessagesResponse {
    #[serde(default)]
    messages: Vec<ListedMessage>,
}

#[derive(Deserialize)]
struct ListedMessage {
    #[serde(rename = "threadId")]
    thread_id: String,
}

impl GmailClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("reqwest client builds with default TLS backend"),
        }
    }

    /// `POST .../messages/import`. Returns `(message_id, thread_id)`.
    pub async fn import_raw_message(
        &self,
        access_token: &str,
        user: &str,
        raw_bytes: &[u8],
        label_ids: &[String],
        thread_id: Option<&str>,
    ) -> Result<(String, String), DeliveryError> {
        let raw_b64 = base64::engine::general_purpose::URL_SAFE.encode(raw_bytes);
        let mut body = json!({
            "raw": raw_b64,
            "labelIds": label_ids,
        });
        if let Some(thread_id) = thread_id {
            body["threadId"] = json!(thread_id);
        }

        let url = format!("{API_BASE}/users/{user}/messages/import?internalDateSource=dateHeader");
        let response = self
            .http
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

        let parsed: ImportResponse = response
            .json()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;
        Ok((parsed.id, parsed.thread_id))
    }

    /// `GET .../messages?q=rfc822msgid:...`. A 403 (insufficient scope to
    /// search) is treated as "no match", not an error.
    pub async fn find_thread_by_message_id(
        &self,
        access_token: &str,
        user: &str,
        rfc822_message_id: &str,
    ) -> Result<Option<String>, DeliveryError> {
        let query = format!("rfc822msgid:{rfc822_message_id}");
        let url = format!("{API_BASE}/users/{user}/messages");
        let response = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .query(&[("q", query.as_str()), ("maxResults", "1")])
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 403 {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ListMessagesResponse = response
            .json()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;
        Ok(parsed.messages.into_iter().next().map(|m| m.thread_id))
    }
}

impl Default for GmailClient {
    fn default() -> Self {
        Self::new()
    }
}
