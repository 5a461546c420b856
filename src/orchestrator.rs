//! Orchestrator: startup sequencing and task supervision. Grounded on
//! `app/sync/orchestrator.py::run` (thread-per-mailbox + foreground retry
//! loop), generalized to `tokio::spawn` tasks per spec.md §5/§9.

use std::time::Duration;

use secrecy::ExposeSecret;
use sqlx::SqlitePool;
use tracing::{error, info, warn};

use crate::alerts::AlertManager;
use crate::config::AppConfig;
use crate::errors::ConfigError;
use crate::gmail::client::GmailClient;
use crate::gmail::labels;
use crate::imap::discovery;
use crate::imap::session::{self, ImapEndpoint, DEFAULT_IDLE_DEADLINE};
use crate::oauth::CredentialBroker;
use crate::retry_worker::{self, RetryWorkerConfig};
use crate::secret_store::SecretStore;
use crate::store::mailbox_repo;
use crate::watcher::{self, WatcherConfig};

const SOURCE_APP_PASSWORD_SECRET_KEY: &str = "source_app_password";
const WATCHER_RESTART_DELAY: Duration = Duration::from_secs(10);
const RETRY_WORKER_POLL_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_WORKER_BATCH_LIMIT: i64 = 50;

/// Load-or-seed the source mailbox password: prefer whatever is already in
/// the secret store, falling back to `YAHOO_APP_PASSWORD` on first run.
async fn load_or_seed_app_password(
    secrets: &SecretStore,
    cfg: &AppConfig,
) -> Result<String, ConfigError> {
    if let Some(stored) = secrets
        .get(SOURCE_APP_PASSWORD_SECRET_KEY)
        .await
        .map_err(|e| ConfigError::InvalidVar {
            key: "source_app_password".to_owned(),
            reason: e.to_string(),
        })?
    {
        return String::from_utf8(stored).map_err(|_| ConfigError::InvalidVar {
            key: "source_app_password".to_owned(),
            reason: "stored app password is not valid UTF-8".to_owned(),
        });
    }

    let Some(password) = &cfg.source_app_password else {
        return Err(ConfigError::MissingVars("YAHOO_APP_PASSWORD".to_owned()));
    };
    let plaintext = password.expose_secret();
    secrets
        .set(SOURCE_APP_PASSWORD_SECRET_KEY, plaintext.as_bytes())
        .await
        .map_err(|e| ConfigError::InvalidVar {
            key: "source_app_password".to_owned(),
            reason: e.to_string(),
        })?;
    Ok(plaintext.to_owned())
}

async fn resolve_watch_mailboxes(
    endpoint: &ImapEndpoint,
    cfg: &AppConfig,
) -> Result<Vec<String>, Box<dyn std::error::Error>> {
    if let Some(explicit) = &cfg.watch_mailboxes {
        return Ok(explicit.clone());
    }
    let mut session = session::connect_authenticated(endpoint).await?;
    let all = session::list_all_mailboxes(&mut session).await?;
    Ok(discovery::discover_mailboxes(&all))
}

/// Startup sequencing plus the long-running supervision loop. Returns only
/// on an unrecoverable startup failure; the retry worker runs in the
/// foreground once watchers are spawned.
pub async fn run(cfg: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let pool: SqlitePool = crate::store::pool::connect(&cfg.sqlite_path).await?;
    let account_id = mailbox_repo::ensure_account(&pool, &cfg.source_email, "me").await?;

    let secrets = SecretStore::new(pool.clone(), &cfg.master_key);
    let app_password = load_or_seed_app_password(&secrets, &cfg).await?;

    let endpoint = ImapEndpoint {
        host: cfg.source_imap_host.clone(),
        port: cfg.source_imap_port,
        user: cfg.source_email.clone(),
        pass: app_password.into(),
    };

    let mut broker = CredentialBroker::new(
        secrets,
        cfg.oauth_client_id.clone(),
        cfg.oauth_client_secret.expose_secret().to_owned(),
        cfg.oauth_redirect_uri.clone(),
    );

    let gmail = GmailClient::new();
    let http = reqwest::Client::new();
    let access_token = broker.access_token().await?;

    let system_labels =
        labels::system_label_ids(&http, &access_token, &["INBOX", "UNREAD"]).await?;
    let inbox_label_id = system_labels["INBOX"].clone();
    let unread_label_id = system_labels["UNREAD"].clone();
    let custom_label_id = if cfg.gmail_label.is_empty() {
        None
    } else {
        Some(labels::ensure_label(&http, &pool, &access_token, account_id, &cfg.gmail_label).await?)
    };

    let alerts = AlertManager::new(
        pool.clone(),
        cfg.pushover_api_token.clone(),
        cfg.pushover_user_key.clone(),
        cfg.pushover_cooldown_minutes,
    );

    let mailboxes = resolve_watch_mailboxes(&endpoint, &cfg).await?;
    if mailboxes.is_empty() {
        warn!("no mailboxes resolved to watch; check WATCH_MAILBOXES or source folder names");
    }
    info!(?mailboxes, "watching mailboxes");

    for mailbox in mailboxes {
        let watcher_cfg = WatcherConfig {
            endpoint: ImapEndpoint {
                host: endpoint.host.clone(),
                port: endpoint.port,
                user: endpoint.user.clone(),
                pass: endpoint.pass.clone(),
            },
            account_id,
            mailbox: mailbox.clone(),
            idle_deadline: DEFAULT_IDLE_DEADLINE,
            poll_interval: WATCHER_RESTART_DELAY,
        };
        let watcher_pool = pool.clone();
        tokio::spawn(async move {
            supervise_watcher(watcher_pool, watcher_cfg, mailbox).await;
        });
    }

    let retry_cfg = RetryWorkerConfig {
        endpoint,
        gmail_user: "me".to_owned(),
        custom_label_id,
        inbox_label_id,
        unread_label_id,
        deliver_to_inbox: cfg.deliver_to_inbox,
        poll_interval: RETRY_WORKER_POLL_INTERVAL,
        batch_limit: RETRY_WORKER_BATCH_LIMIT,
    };
    retry_worker::run(&pool, &retry_cfg, &mut broker, &gmail, &alerts).await?;
    Ok(())
}

/// Log-sleep-restart supervision for one mailbox's watcher task. `watcher::run`
/// only returns `Err` when its *initial* connection fails, so that is the
/// sole trigger for this outer respawn loop.
async fn supervise_watcher(pool: SqlitePool, cfg: WatcherConfig, mailbox: String) {
    loop {
        if let Err(err) = watcher::run(&pool, &cfg).await {
            error!(mailbox = %mailbox, error = %err, "watcher task exited, respawning");
        }
        tokio::time::sleep(WATCHER_RESTART_DELAY).await;
    }
}
