//! mail2gmail: durable, at-least-once IMAP-to-Gmail mail forwarder
//!
//! # Architecture
//!
//! - [`main`]: process entry point, CLI dispatch
//! - [`config`]: environment-driven configuration
//! - [`errors`]: per-concern error hierarchy
//! - [`secret_store`]: AEAD-encrypted secret KV backed by the state database
//! - [`store`]: durable message/mailbox/account state machine
//! - [`imap`]: source IMAP transport, IDLE, mailbox discovery
//! - [`gmail`]: destination HTTP delivery adapter and label cache
//! - [`oauth`]: destination credential broker
//! - [`pipeline`]: trace-header injection and threading-header extraction
//! - [`watcher`]: per-mailbox IDLE state machine
//! - [`retry_worker`]: durable delivery and deletion loop
//! - [`alerts`]: cooldown-bounded operator notifications
//! - [`orchestrator`]: startup sequencing and task supervision

mod alerts;
mod config;
mod errors;
mod gmail;
mod imap;
mod oauth;
mod orchestrator;
mod pipeline;
mod retry_worker;
mod secret_store;
mod store;
mod watcher;

use clap::{Parser, Subcommand};
use config::AppConfig;
use oauth::CredentialBroker;
use secrecy::ExposeSecret;
use secret_store::SecretStore;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mail2gmail", about = "Durable, at-least-once IMAP-to-Gmail mail forwarder")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the watcher + retry worker until terminated.
    Run,
    /// Print an authorization URL, or exchange a pasted authorization code
    /// for tokens when `code` is given.
    Oauth { code: Option<String> },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let cfg = AppConfig::load_from_env()?;

    let filter = EnvFilter::try_new(&cfg.log_level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command.unwrap_or(Command::Run) {
        Command::Run => orchestrator::run(cfg).await,
        Command::Oauth { code } => run_oauth(cfg, code).await,
    };

    if let Err(err) = result {
        tracing::error!(error = %err, "fatal error");
        std::process::exit(1);
    }
    Ok(())
}

async fn run_oauth(cfg: AppConfig, code: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let pool = store::pool::connect(&cfg.sqlite_path).await?;
    let secrets = SecretStore::new(pool, &cfg.master_key);
    let broker = CredentialBroker::new(
        secrets,
        cfg.oauth_client_id.clone(),
        cfg.oauth_client_secret.expose_secret().to_owned(),
        cfg.oauth_redirect_uri.clone(),
    );

    match code {
        None => {
            let url = broker.authorization_url()?;
            println!("Open this URL, authorize, then rerun with the code:\n{url}");
        }
        Some(code) => {
            broker.exchange_code(&code).await?;
            println!("Gmail OAuth tokens stored.");
        }
    }
    Ok(())
}
