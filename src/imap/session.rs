//! Source IMAP transport and session operations.
//!
//! Every operation is wrapped in a timeout, following the teacher's
//! per-operation `tokio::time::timeout` style. Unlike the teacher (an MCP tool
//! surface over a handful of long-lived accounts), this module serves one
//! source account and adds the one primitive the teacher never needed: IDLE.

use std::sync::Arc;
use std::time::Duration;

use async_imap::extensions::idle::IdleResponse;
use async_imap::types::Fetch;
use async_imap::{Client, Session};
use futures::TryStreamExt;
use rustls::ClientConfig;
use rustls::RootCertStore;
use rustls_pki_types::ServerName;
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use crate::errors::{SourceError, SourceResult};

pub type ImapSession = Session<tokio_rustls::client::TlsStream<TcpStream>>;

const DATA_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const GREETING_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_IDLE_DEADLINE: Duration = Duration::from_secs(900);

/// Source account connection parameters, passed explicitly rather than held
/// globally so watcher and retry-worker connections never share state.
pub struct ImapEndpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: SecretString,
}

/// Connect, TLS-handshake, and LOGIN. Capabilities are implicitly
/// re-populated by the server on every fresh connection.
pub async fn connect_authenticated(endpoint: &ImapEndpoint) -> SourceResult<ImapSession> {
    let tcp = timeout(
        CONNECT_TIMEOUT,
        TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
    )
    .await
    .map_err(|_| SourceError::Timeout("tcp connect timeout".to_owned()))
    .and_then(|r| r.map_err(|e| SourceError::Protocol(format!("tcp connect failed: {e}"))))?;

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));

    let server_name = ServerName::try_from(endpoint.host.clone())
        .map_err(|_| SourceError::InvalidInput("invalid IMAP host for TLS SNI".to_owned()))?;
    let tls_stream = timeout(GREETING_TIMEOUT, connector.connect(server_name, tcp))
        .await
        .map_err(|_| SourceError::Timeout("TLS handshake timeout".to_owned()))
        .and_then(|r| r.map_err(|e| SourceError::Protocol(format!("TLS handshake failed: {e}"))))?;

    let mut client = Client::new(tls_stream);
    let greeting = timeout(GREETING_TIMEOUT, client.read_response())
        .await
        .map_err(|_| SourceError::Timeout("IMAP greeting timeout".to_owned()))
        .and_then(|r| r.map_err(|e| SourceError::Protocol(format!("IMAP greeting failed: {e}"))))?;
    if greeting.is_none() {
        return Err(SourceError::Protocol(
            "IMAP server closed connection before greeting".to_owned(),
        ));
    }

    let pass = endpoint.pass.expose_secret();
    timeout(GREETING_TIMEOUT, client.login(endpoint.user.as_str(), pass))
        .await
        .map_err(|_| SourceError::Timeout("IMAP login timeout".to_owned()))
        .and_then(|r| {
            r.map_err(|(e, _)| SourceError::AuthFailed(e.to_string()))
        })
}

pub async fn noop(session: &mut ImapSession) -> SourceResult<()> {
    timeout(DATA_TIMEOUT, session.noop())
        .await
        .map_err(|_| SourceError::Timeout("NOOP timed out".to_owned()))
        .and_then(|r| r.map_err(|e| SourceError::Protocol(format!("NOOP failed: {e}"))))
}

pub async fn list_all_mailboxes(session: &mut ImapSession) -> SourceResult<Vec<String>> {
    let stream = timeout(DATA_TIMEOUT, session.list(None, Some("*")))
        .await
        .map_err(|_| SourceError::Timeout("LIST timed out".to_owned()))
        .and_then(|r| r.map_err(|e| SourceError::Protocol(format!("LIST failed: {e}"))))?;

    let names = timeout(DATA_TIMEOUT, stream.try_collect::<Vec<_>>())
        .await
        .map_err(|_| SourceError::Timeout("LIST stream timed out".to_owned()))
        .and_then(|r| r.map_err(|e| SourceError::Protocol(format!("LIST stream failed: {e}"))))?;

    Ok(names.iter().map(|n| n.name().to_owned()).collect())
}

/// `SELECT <mailbox> (readonly=false)` or `EXAMINE <mailbox>` (readonly=true).
/// Returns `(uidvalidity, exists)`.
pub async fn select(
    session: &mut ImapSession,
    mailbox: &str,
    readonly: bool,
) -> SourceResult<(u32, u32)> {
    let mailbox_state = if readonly {
        timeout(DATA_TIMEOUT, session.examine(mailbox))
            .await
            .map_err(|_| SourceError::Timeout(format!("EXAMINE timed out for '{mailbox}'")))
            .and_then(|r| r.map_err(|e| SourceError::Protocol(format!("EXAMINE failed: {e}"))))?
    } else {
        timeout(DATA_TIMEOUT, session.select(mailbox))
            .await
            .map_err(|_| SourceError::Timeout(format!("SELECT timed out for '{mailbox}'")))
            .and_then(|r| r.map_err(|e| SourceError::Protocol(format!("SELECT failed: {e}"))))?
    };

    let uid_validity = match mailbox_state.uid_validity {
        Some(v) => v,
        None => status_uid_validity(session, mailbox).await?,
    };
    Ok((uid_validity, mailbox_state.exists))
}

/// `STATUS <mailbox> (UIDVALIDITY)` fallback for servers that omit
/// UIDVALIDITY from the SELECT/EXAMINE response.
async fn status_uid_validity(session: &mut ImapSession, mailbox: &str) -> SourceResult<u32> {
    let stream = timeout(DATA_TIMEOUT, session.status(mailbox, "(UIDVALIDITY)"))
        .await
        .map_err(|_| SourceError::Timeout(format!("STATUS timed out for '{mailbox}'")))
        .and_then(|r| r.map_err(|e| SourceError::Protocol(format!("STATUS failed: {e}"))))?;
    let statuses = timeout(DATA_TIMEOUT, stream.try_collect::<Vec<_>>())
        .await
        .map_err(|_| SourceError::Timeout("STATUS stream timed out".to_owned()))
        .and_then(|r| r.map_err(|e| SourceError::Protocol(format!("STATUS stream failed: {e}"))))?;

    statuses
        .into_iter()
        .find_map(|m| m.uid_validity)
        .ok_or_else(|| SourceError::MissingUidValidity(mailbox.to_owned()))
}

async fn fetch_one(session: &mut ImapSession, uid: u32, query: &str) -> SourceResult<Fetch> {
    let stream = timeout(DATA_TIMEOUT, session.uid_fetch(uid.to_string(), query))
        .await
        .map_err(|_| SourceError::Timeout("UID FETCH timed out".to_owned()))
        .and_then(|r| r.map_err(|e| SourceError::Protocol(format!("uid fetch failed: {e}"))))?;
    let fetches: Vec<Fetch> = timeout(DATA_TIMEOUT, stream.try_collect())
        .await
        .map_err(|_| SourceError::Timeout("UID FETCH stream timed out".to_owned()))
        .and_then(|r| r.map_err(|e| SourceError::Protocol(format!("uid fetch stream failed: {e}"))))?;

    fetches
        .into_iter()
        .next()
        .ok_or_else(|| SourceError::Protocol(format!("message uid {uid} not found")))
}

/// Fetched body plus metadata, exactly what the pipeline and state store need.
pub struct FetchedMessage {
    pub raw: Vec<u8>,
    pub flags: Vec<String>,
    pub internal_date: Option<String>,
}

pub async fn fetch_rfc822(session: &mut ImapSession, uid: u32) -> SourceResult<FetchedMessage> {
    let fetch = fetch_one(session, uid, "RFC822 FLAGS INTERNALDATE").await?;
    let raw = fetch
        .body()
        .ok_or_else(|| SourceError::Protocol("message has no RFC822 body".to_owned()))?
        .to_vec();
    let internal_date = fetch.internal_date().map(|d| d.to_rfc3339());
    Ok(FetchedMessage {
        raw,
        flags: flags_to_strings(&fetch),
        internal_date,
    })
}

pub fn flags_to_strings(fetch: &Fetch) -> Vec<String> {
    fetch.flags().map(|flag| format!("{flag:?}")).collect()
}

/// `UID SEARCH UID since_uid:*`, returned in ascending order. Callers must
/// still guard with `uid > last_seen_uid` since the `:*` form can return the
/// server's current max even when nothing is strictly newer.
pub async fn search_uids(session: &mut ImapSession, since_uid: u32) -> SourceResult<Vec<u32>> {
    let query = format!("UID {since_uid}:*");
    let set = timeout(DATA_TIMEOUT, session.uid_search(query))
        .await
        .map_err(|_| SourceError::Timeout("UID SEARCH timed out".to_owned()))
        .and_then(|r| r.map_err(|e| SourceError::Protocol(format!("uid search failed: {e}"))))?;
    let mut uids: Vec<u32> = set.into_iter().collect();
    uids.sort_unstable();
    Ok(uids)
}

/// Search the whole mailbox (`UID SEARCH 1:*`), used only to seed
/// `last_seen_uid` for a mailbox never watched before.
pub async fn search_all_uids(session: &mut ImapSession) -> SourceResult<Vec<u32>> {
    search_uids(session, 1).await
}

/// Re-select read-write, verify UIDVALIDITY, then STORE+EXPUNGE the UID.
/// Refuses to delete under a different UIDVALIDITY than expected.
pub async fn delete_uid(
    session: &mut ImapSession,
    mailbox: &str,
    expected_uidvalidity: u32,
    uid: u32,
) -> SourceResult<()> {
    let (actual_uidvalidity, _) = select(session, mailbox, false).await?;
    if actual_uidvalidity != expected_uidvalidity {
        return Err(SourceError::UidValidityChanged {
            expected: expected_uidvalidity,
            actual: actual_uidvalidity,
            uid,
        });
    }

    let stream = timeout(
        DATA_TIMEOUT,
        session.uid_store(uid.to_string(), "+FLAGS.SILENT (\\Deleted)"),
    )
    .await
    .map_err(|_| SourceError::Timeout("UID STORE timed out".to_owned()))
    .and_then(|r| r.map_err(|e| SourceError::Protocol(format!("uid store failed: {e}"))))?;
    let _: Vec<Fetch> = timeout(DATA_TIMEOUT, stream.try_collect())
        .await
        .map_err(|_| SourceError::Timeout("UID STORE stream timed out".to_owned()))
        .and_then(|r| r.map_err(|e| SourceError::Protocol(format!("uid store stream failed: {e}"))))?;

    let expunge_stream = timeout(DATA_TIMEOUT, session.uid_expunge(uid.to_string()))
        .await
        .map_err(|_| SourceError::Timeout("UID EXPUNGE timed out".to_owned()))
        .and_then(|r| r.map_err(|e| SourceError::Protocol(format!("UID EXPUNGE failed: {e}"))))?;
    let _: Vec<u32> = timeout(DATA_TIMEOUT, expunge_stream.try_collect())
        .await
        .map_err(|_| SourceError::Timeout("UID EXPUNGE stream timed out".to_owned()))
        .and_then(|r| r.map_err(|e| SourceError::Protocol(format!("UID EXPUNGE stream failed: {e}"))))?;
    Ok(())
}

/// Whether the server's advertised capabilities include IDLE. Queried fresh
/// each cycle rather than cached from connect, since some servers only
/// advertise IDLE post-authentication or post-SELECT.
pub async fn supports_idle(session: &mut ImapSession) -> bool {
    match timeout(DATA_TIMEOUT, session.capabilities()).await {
        Ok(Ok(caps)) => caps.has_str("IDLE"),
        _ => false,
    }
}

/// Block until an untagged response arrives or `deadline` elapses. `Some`
/// means the caller should reconnect-and-drain; `None` means the same
/// (deadline elapsed) — both cues are collapsed to one reconnect policy per
/// the watcher state machine, but the line bytes are kept for logging.
pub async fn idle_wait(session: &mut ImapSession, deadline: Duration) -> Option<Vec<u8>> {
    let mut idle_handle = session.idle();
    if idle_handle.init().await.is_err() {
        return None;
    }
    let (wait_future, _stop_source) = idle_handle.wait_with_timeout(deadline);
    match wait_future.await {
        Ok(IdleResponse::NewData(bytes)) => Some(bytes),
        Ok(IdleResponse::Timeout) | Ok(IdleResponse::ManualInterrupt) => None,
        Err(_) => None,
    }
}
