//! Retry Worker: durable delivery of fetched messages into Gmail and durable
//! deletion of delivered messages from the source mailbox. Grounded on
//! `app/sync/retry_worker.py::run_retry_loop`.

use std::time::Duration;

use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::alerts::AlertManager;
use crate::errors::SourceResult;
use crate::gmail::client::GmailClient;
use crate::imap::session::{self, ImapEndpoint};
use crate::oauth::CredentialBroker;
use crate::pipeline;
use crate::store::message_repo;
use crate::store::models::MessageRow;

pub struct RetryWorkerConfig {
    pub endpoint: ImapEndpoint,
    pub gmail_user: String,
    pub custom_label_id: Option<String>,
    pub inbox_label_id: String,
    pub unread_label_id: String,
    pub deliver_to_inbox: bool,
    pub poll_interval: Duration,
    pub batch_limit: i64,
}

fn correlation_id(row: &MessageRow) -> String {
    format!("{}|{}|{}", row.mailbox_name, row.uidvalidity, row.uid)
}

/// Runs the delivery-then-deletion loop forever. Never returns under normal
/// operation; per-message errors are caught and recorded, not propagated.
pub async fn run(
    pool: &SqlitePool,
    cfg: &RetryWorkerConfig,
    broker: &mut CredentialBroker,
    gmail: &GmailClient,
    alerts: &AlertManager,
) -> SourceResult<()> {
    let recovered = message_repo::recover_stuck_insertions(pool)
        .await
        .map_err(|e| crate::errors::SourceError::Protocol(e.to_string()))?;
    if recovered > 0 {
        info!(recovered, "lease_recover");
    }

    loop {
        let delivered = process_due_deliveries(pool, cfg, broker, gmail, alerts).await;
        let deleted = process_due_deletions(pool, cfg).await;

        if delivered == 0 && deleted == 0 {
            tokio::time::sleep(cfg.poll_interval).await;
        }
    }
}

async fn process_due_deliveries(
    pool: &SqlitePool,
    cfg: &RetryWorkerConfig,
    broker: &mut CredentialBroker,
    gmail: &GmailClient,
    alerts: &AlertManager,
) -> usize {
    let rows = match message_repo::select_due_delivery(pool, cfg.batch_limit).await {
        Ok(rows) => rows,
        Err(err) => {
            warn!(error = %err, "select_due_delivery failed");
            return 0;
        }
    };

    let mut processed = 0;
    for row in rows {
        match message_repo::acquire_insert_lease(pool, row.id).await {
            Ok(true) => {}
            Ok(false) => continue,
            Err(err) => {
                warn!(error = %err, "acquire_insert_lease failed");
                continue;
            }
        }
        processed += 1;
        attempt_delivery(pool, cfg, broker, gmail, alerts, row).await;
    }
    processed
}

async fn attempt_delivery(
    pool: &SqlitePool,
    cfg: &RetryWorkerConfig,
    broker: &mut CredentialBroker,
    gmail: &GmailClient,
    alerts: &AlertManager,
    row: MessageRow,
) {
    let cid = correlation_id(&row);
    info!(correlation_id = %cid, "insert_attempt");

    match deliver_once(cfg, broker, gmail, &row).await {
        Ok((gmail_message_id, gmail_thread_id)) => {
            if let Err(err) =
                message_repo::mark_inserted(pool, row.id, &gmail_message_id, &gmail_thread_id).await
            {
                warn!(correlation_id = %cid, error = %err, "mark_inserted failed");
                return;
            }
            info!(correlation_id = %cid, gmail_message_id, gmail_thread_id, "insert_success");
        }
        Err(DeliveryOutcome::Retry(msg)) => {
            if let Err(err) = message_repo::mark_failed_retry(pool, row.id, &msg).await {
                warn!(correlation_id = %cid, error = %err, "mark_failed_retry failed");
            }
            warn!(correlation_id = %cid, error = %msg, "insert_failure");
        }
        Err(DeliveryOutcome::Permanent(msg)) => {
            if let Err(err) = message_repo::mark_failed_perm(pool, row.id, &msg).await {
                warn!(correlation_id = %cid, error = %err, "mark_failed_perm failed");
            }
            warn!(correlation_id = %cid, error = %msg, "insert_failure_perm");
        }
        Err(DeliveryOutcome::OAuth(kind, msg)) => {
            alerts.send(kind, "Gmail credential needs attention", &msg).await.ok();
            if let Err(err) = message_repo::mark_failed_retry(pool, row.id, &msg).await {
                warn!(correlation_id = %cid, error = %err, "mark_failed_retry failed");
            }
            warn!(correlation_id = %cid, error = %msg, "insert_failure_oauth");
        }
    }
}

enum DeliveryOutcome {
    Retry(String),
    Permanent(String),
    OAuth(&'static str, String),
}

async fn deliver_once(
    cfg: &RetryWorkerConfig,
    broker: &mut CredentialBroker,
    gmail: &GmailClient,
    row: &MessageRow,
) -> Result<(String, String), DeliveryOutcome> {
    let access_token = broker
        .access_token()
        .await
        .map_err(|e| DeliveryOutcome::OAuth(e.alert_kind(), e.to_string()))?;

    let mut session = session::connect_authenticated(&cfg.endpoint)
        .await
        .map_err(|e| DeliveryOutcome::Retry(e.to_string()))?;
    session::select(&mut session, &row.mailbox_name, true)
        .await
        .map_err(|e| DeliveryOutcome::Retry(e.to_string()))?;
    let fetched = session::fetch_rfc822(&mut session, row.uid as u32)
        .await
        .map_err(|e| DeliveryOutcome::Retry(e.to_string()))?;

    let prepared = pipeline::prepare_raw_message(
        &fetched.raw,
        &row.mailbox_name,
        row.uidvalidity as u32,
        row.uid as u32,
        &row.rfc822_sha256,
    )
    .map_err(|e| DeliveryOutcome::Permanent(e.to_string()))?;

    let thread_id = resolve_thread_id(gmail, &access_token, &cfg.gmail_user, &fetched.raw).await;

    let plan = pipeline::compute_label_plan(
        cfg.custom_label_id.is_some(),
        cfg.deliver_to_inbox,
        &row.imap_flags_json,
    );
    let mut label_ids = Vec::new();
    if plan.include_custom {
        if let Some(id) = &cfg.custom_label_id {
            label_ids.push(id.clone());
        }
    }
    if plan.include_inbox {
        label_ids.push(cfg.inbox_label_id.clone());
    }
    if plan.include_unread {
        label_ids.push(cfg.unread_label_id.clone());
    }

    gmail.import_raw_message(&access_token, &cfg.gmail_user, &prepared, &label_ids, thread_id.as_deref())
        .await
        .map_err(|e| {
            if e.is_oauth_signal() {
                DeliveryOutcome::OAuth("oauth_delivery_rejected", e.to_string())
            } else if e.is_retryable() {
                DeliveryOutcome::Retry(e.to_string())
            } else {
                DeliveryOutcome::Permanent(e.to_string())
            }
        })
}

/// `In-Reply-To` first, then `References` in reverse order, first hit wins.
async fn resolve_thread_id(
    gmail: &GmailClient,
    access_token: &str,
    gmail_user: &str,
    raw: &[u8],
) -> Option<String> {
    if let Some(in_reply_to) = pipeline::extract_in_reply_to(raw) {
        if let Ok(Some(thread_id)) = gmail
            .find_thread_by_message_id(access_token, gmail_user, &in_reply_to)
            .await
        {
            return Some(thread_id);
        }
    }
    for reference in pipeline::extract_references(raw).into_iter().rev() {
        if let Ok(Some(thread_id)) = gmail
            .find_thread_by_message_id(access_token, gmail_user, &reference)
            .await
        {
            return Some(thread_id);
        }
    }
    None
}

async fn process_due_deletions(pool: &SqlitePool, cfg: &RetryWorkerConfig) -> usize {
    let rows = match message_repo::select_due_deletion(pool, cfg.batch_limit).await {
        Ok(rows) => rows,
        Err(err) => {
            warn!(error = %err, "select_due_deletion failed");
            return 0;
        }
    };

    let mut processed = 0;
    for row in rows {
        processed += 1;
        attempt_deletion(pool, cfg, row).await;
    }
    processed
}

async fn attempt_deletion(pool: &SqlitePool, cfg: &RetryWorkerConfig, row: MessageRow) {
    let cid = correlation_id(&row);

    let outcome = async {
        let mut session = session::connect_authenticated(&cfg.endpoint).await?;
        session::delete_uid(
            &mut session,
            &row.mailbox_name,
            row.uidvalidity as u32,
            row.uid as u32,
        )
        .await
    }
    .await;

    match outcome {
        Ok(()) => {
            if let Err(err) = message_repo::mark_deleted(pool, row.id).await {
                warn!(correlation_id = %cid, error = %err, "mark_deleted failed");
                return;
            }
            info!(correlation_id = %cid, "delete_success");
        }
        // The UID's generation is gone; there is nothing left to act on, so
        // stop retrying rather than loop on an error that can never clear.
        Err(crate::errors::SourceError::UidValidityChanged { .. }) => {
            warn!(correlation_id = %cid, "uidvalidity changed, abandoning delete");
            if let Err(err) = message_repo::mark_deleted(pool, row.id).await {
                warn!(correlation_id = %cid, error = %err, "mark_deleted failed");
            }
        }
        Err(err) => {
            if let Err(store_err) =
                message_repo::mark_delete_failed_retry(pool, row.id, &err.to_string()).await
            {
                warn!(correlation_id = %cid, error = %store_err, "mark_delete_failed_retry failed");
            }
            warn!(correlation_id = %cid, error = %err, "delete_failure");
        }
    }
}
