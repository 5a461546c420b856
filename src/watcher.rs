//! Mailbox Watcher: the IDLE state machine for one mailbox. Grounded on
//! `app/imap/mailbox_watcher.py::watch_mailbox`.

use std::time::Duration;

use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::errors::{SourceError, SourceResult};
use crate::imap::session::{self, FetchedMessage, ImapEndpoint, ImapSession};
use crate::pipeline;
use crate::store::{mailbox_repo, message_repo};
use crate::store::models::NewMessage;

pub struct WatcherConfig {
    pub endpoint: ImapEndpoint,
    pub account_id: i64,
    pub mailbox: String,
    pub idle_deadline: Duration,
    pub poll_interval: Duration,
}

/// Runs the state machine forever, reconnecting internally on any
/// socket/protocol error. Returns `Err` only when the *initial* connection
/// cannot be established at all, so the orchestrator's supervisor can log,
/// sleep, and respawn.
pub async fn run(pool: &SqlitePool, cfg: &WatcherConfig) -> SourceResult<()> {
    let mut session = session::connect_authenticated(&cfg.endpoint).await?;
    let (mut uidvalidity, _) = session::select(&mut session, &cfg.mailbox, true).await?;
    info!(mailbox = %cfg.mailbox, uidvalidity, "imap mailbox watcher started");

    let mut last_seen_uid = initialize_or_reset_cursor(pool, cfg, uidvalidity).await?;

    last_seen_uid = drain(pool, &mut session, cfg, uidvalidity, last_seen_uid).await?;

    loop {
        match idle_then_drain(pool, &mut session, cfg, uidvalidity, last_seen_uid).await {
            Ok((new_uidvalidity, new_last_seen)) => {
                uidvalidity = new_uidvalidity;
                last_seen_uid = new_last_seen;
            }
            Err(err) => {
                warn!(mailbox = %cfg.mailbox, error = %err, "imap error, reconnecting");
                match reconnect(cfg).await {
                    Ok((new_session, new_uidvalidity)) => {
                        session = new_session;
                        uidvalidity = new_uidvalidity;
                    }
                    Err(err) => {
                        warn!(mailbox = %cfg.mailbox, error = %err, "imap reconnect failed");
                    }
                }
                tokio::time::sleep(cfg.poll_interval).await;
            }
        }
    }
}

async fn initialize_or_reset_cursor(
    pool: &SqlitePool,
    cfg: &WatcherConfig,
    uidvalidity: u32,
) -> SourceResult<u32> {
    let stored = mailbox_repo::get_mailbox(pool, cfg.account_id, &cfg.mailbox)
        .await
        .map_err(|e| SourceError::Protocol(e.to_string()))?;

    match stored {
        None => Ok(0),
        Some(row) if row.uidvalidity as u32 != uidvalidity => {
            info!(
                mailbox = %cfg.mailbox,
                old_uidvalidity = row.uidvalidity,
                new_uidvalidity = uidvalidity,
                "uidvalidity changed; resetting cursor"
            );
            mailbox_repo::reset_uidvalidity(pool, cfg.account_id, &cfg.mailbox, uidvalidity as i64)
                .await
                .map_err(|e| SourceError::Protocol(e.to_string()))?;
            Ok(0)
        }
        Some(row) => Ok(row.last_seen_uid as u32),
    }
}

/// Seed `last_seen_uid` for a mailbox row that doesn't exist yet: adopt the
/// current tail without importing history.
async fn seed_last_seen_uid(session: &mut ImapSession) -> SourceResult<u32> {
    let all = session::search_all_uids(session).await?;
    Ok(all.into_iter().max().unwrap_or(0))
}

async fn drain(
    pool: &SqlitePool,
    session: &mut ImapSession,
    cfg: &WatcherConfig,
    uidvalidity: u32,
    last_seen_uid: u32,
) -> SourceResult<u32> {
    let _ = session::noop(session).await;

    let row = mailbox_repo::get_mailbox(pool, cfg.account_id, &cfg.mailbox)
        .await
        .map_err(|e| SourceError::Protocol(e.to_string()))?;
    let last_seen_uid = if row.is_none() {
        let seeded = seed_last_seen_uid(session).await?;
        mailbox_repo::initialize_mailbox(
            pool,
            cfg.account_id,
            &cfg.mailbox,
            uidvalidity as i64,
            seeded as i64,
        )
        .await
        .map_err(|e| SourceError::Protocol(e.to_string()))?;
        seeded
    } else {
        last_seen_uid
    };

    let uids = session::search_uids(session, last_seen_uid + 1).await?;
    let mut max_seen = last_seen_uid;

    for uid in uids {
        if uid <= last_seen_uid {
            continue;
        }
        process_new_uid(pool, session, cfg, uidvalidity, uid).await?;
        max_seen = max_seen.max(uid);
    }

    if max_seen > last_seen_uid {
        mailbox_repo::advance_last_seen_uid(pool, cfg.account_id, &cfg.mailbox, max_seen as i64)
            .await
            .map_err(|e| SourceError::Protocol(e.to_string()))?;
    }
    Ok(max_seen)
}

async fn process_new_uid(
    pool: &SqlitePool,
    session: &mut ImapSession,
    cfg: &WatcherConfig,
    uidvalidity: u32,
    uid: u32,
) -> SourceResult<()> {
    let correlation_id = format!("{}|{}|{}", cfg.mailbox, uidvalidity, uid);
    info!(correlation_id, "message_discovered");

    let FetchedMessage {
        raw,
        flags,
        internal_date,
    } = session::fetch_rfc822(session, uid).await?;

    let message_id = pipeline::extract_message_id(&raw);
    let rfc822_sha256 = pipeline::sha256_hex(&raw);
    let imap_flags_json = serde_json::to_string(&flags).unwrap_or_else(|_| "[]".to_owned());

    message_repo::insert_fetched(
        pool,
        &NewMessage {
            account_id: cfg.account_id,
            mailbox_name: cfg.mailbox.clone(),
            uidvalidity: uidvalidity as i64,
            uid: uid as i64,
            message_id,
            rfc822_sha256,
            imap_internaldate: internal_date,
            imap_flags_json,
        },
    )
    .await
    .map_err(|e| SourceError::Protocol(e.to_string()))?;

    info!(correlation_id, size = raw.len(), "message_fetched");
    Ok(())
}

async fn idle_then_drain(
    pool: &SqlitePool,
    session: &mut ImapSession,
    cfg: &WatcherConfig,
    uidvalidity: u32,
    last_seen_uid: u32,
) -> SourceResult<(u32, u32)> {
    let correlation_id = format!("{}|{}|{}", cfg.mailbox, uidvalidity, last_seen_uid);
    if session::supports_idle(session).await {
        info!(correlation_id, "imap_idle_enter");
        let notified = session::idle_wait(session, cfg.idle_deadline).await;
        info!(correlation_id, notified = notified.is_some(), "imap_idle_exit");
    } else {
        info!(correlation_id, "imap_idle_unsupported, polling instead");
        tokio::time::sleep(cfg.poll_interval).await;
    }

    // Both cues (IDLE notified/timed out, or the poll fallback slept) reconnect and
    // re-select to guarantee a clean state before draining — the simpler of
    // the two documented IDLE policies; see DESIGN.md.
    let (mut new_session, new_uidvalidity) = reconnect(cfg).await?;
    let new_last_seen = drain(pool, &mut new_session, cfg, new_uidvalidity, last_seen_uid).await?;
    *session = new_session;
    Ok((new_uidvalidity, new_last_seen))
}

async fn reconnect(cfg: &WatcherConfig) -> SourceResult<(ImapSession, u32)> {
    let mut session = session::connect_authenticated(&cfg.endpoint).await?;
    let (uidvalidity, _) = session::select(&mut session, &cfg.mailbox, true).await?;
    Ok((session, uidvalidity))
}
