//! Application configuration
//!
//! All configuration is loaded from environment variables in one shot via
//! [`AppConfig::load_from_env`]. Missing required variables are aggregated into
//! a single [`ConfigError::MissingVars`] so the process fails fast with one
//! human-readable summary instead of one error per variable.

use std::env;
use std::env::VarError;

use secrecy::SecretString;

use crate::errors::{ConfigError, ConfigResult};

/// Fully resolved application configuration; immutable for the life of the process.
#[derive(Clone)]
pub struct AppConfig {
    pub source_email: String,
    pub source_app_password: Option<SecretString>,
    pub source_imap_host: String,
    pub source_imap_port: u16,
    pub oauth_client_id: String,
    pub oauth_client_secret: SecretString,
    pub oauth_redirect_uri: String,
    pub gmail_label: String,
    pub deliver_to_inbox: bool,
    pub watch_mailboxes: Option<Vec<String>>,
    pub sqlite_path: String,
    pub master_key: [u8; 32],
    pub log_level: String,
    pub pushover_user_key: Option<SecretString>,
    pub pushover_api_token: Option<SecretString>,
    pub pushover_cooldown_minutes: i64,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("source_email", &self.source_email)
            .field("source_imap_host", &self.source_imap_host)
            .field("source_imap_port", &self.source_imap_port)
            .field("oauth_client_id", &self.oauth_client_id)
            .field("oauth_redirect_uri", &self.oauth_redirect_uri)
            .field("gmail_label", &self.gmail_label)
            .field("deliver_to_inbox", &self.deliver_to_inbox)
            .field("watch_mailboxes", &self.watch_mailboxes)
            .field("sqlite_path", &self.sqlite_path)
            .field("log_level", &self.log_level)
            .finish_non_exhaustive()
    }
}

impl AppConfig {
    /// Load configuration from the environment, aggregating every missing
    /// required variable into one error.
    pub fn load_from_env() -> ConfigResult<Self> {
        let source_email = optional_env("YAHOO_EMAIL");
        let oauth_client_id = optional_env("GMAIL_OAUTH_CLIENT_ID");
        let oauth_client_secret = optional_env("GMAIL_OAUTH_CLIENT_SECRET");
        let oauth_redirect_uri = optional_env("GMAIL_OAUTH_REDIRECT_URI");
        let master_key_raw = optional_env("APP_MASTER_KEY");

        let mut missing = Vec::new();
        if source_email.is_none() {
            missing.push("YAHOO_EMAIL");
        }
        if oauth_client_id.is_none() {
            missing.push("GMAIL_OAUTH_CLIENT_ID");
        }
        if oauth_client_secret.is_none() {
            missing.push("GMAIL_OAUTH_CLIENT_SECRET");
        }
        if oauth_redirect_uri.is_none() {
            missing.push("GMAIL_OAUTH_REDIRECT_URI");
        }
        if master_key_raw.is_none() {
            missing.push("APP_MASTER_KEY");
        }
        if !missing.is_empty() {
            return Err(ConfigError::MissingVars(missing.join(", ")));
        }

        let master_key = decode_master_key(&master_key_raw.unwrap())?;

        Ok(Self {
            source_email: source_email.unwrap(),
            source_app_password: optional_env("YAHOO_APP_PASSWORD").map(SecretString::from),
            source_imap_host: optional_env("YAHOO_IMAP_HOST")
                .unwrap_or_else(|| "imap.mail.yahoo.com".to_owned()),
            source_imap_port: parse_u16_env("YAHOO_IMAP_PORT", 993)?,
            oauth_client_id: oauth_client_id.unwrap(),
            oauth_client_secret: SecretString::from(oauth_client_secret.unwrap()),
            oauth_redirect_uri: oauth_redirect_uri.unwrap(),
            gmail_label: gmail_label_env(),
            deliver_to_inbox: parse_bool_env("DELIVER_TO_INBOX", true)?,
            watch_mailboxes: parse_mailboxes(optional_env("WATCH_MAILBOXES")),
            sqlite_path: optional_env("SQLITE_PATH").unwrap_or_else(|| "/data/app.db".to_owned()),
            master_key,
            log_level: optional_env("LOG_LEVEL").unwrap_or_else(|| "INFO".to_owned()),
            pushover_user_key: optional_env("PUSHOVER_USER_KEY").map(SecretString::from),
            pushover_api_token: optional_env("PUSHOVER_API_TOKEN").map(SecretString::from),
            pushover_cooldown_minutes: parse_i64_env("PUSHOVER_COOLDOWN_MINUTES", 60)?,
        })
    }
}

/// `GMAIL_LABEL`, special-cased: unset defaults to `"yahoo"`, but an
/// explicitly empty value is preserved literally so the caller can treat it
/// as "custom labeling disabled" rather than silently falling back.
fn gmail_label_env() -> String {
    match env::var("GMAIL_LABEL") {
        Ok(v) => v.trim().to_owned(),
        Err(_) => "yahoo".to_owned(),
    }
}

fn optional_env(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

fn parse_mailboxes(raw: Option<String>) -> Option<Vec<String>> {
    let raw = raw?;
    let items: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect();
    if items.is_empty() { None } else { Some(items) }
}

fn parse_bool_env(key: &str, default: bool) -> ConfigResult<bool> {
    match env::var(key) {
        Ok(v) => parse_bool_value(&v).ok_or_else(|| ConfigError::InvalidVar {
            key: key.to_owned(),
            reason: format!("'{v}' is not a recognized boolean"),
        }),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(ConfigError::InvalidVar {
            key: key.to_owned(),
            reason: "contains non-unicode data".to_owned(),
        }),
    }
}

fn parse_bool_value(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

fn parse_u16_env(key: &str, default: u16) -> ConfigResult<u16> {
    match env::var(key) {
        Ok(v) => v.parse::<u16>().map_err(|_| ConfigError::InvalidVar {
            key: key.to_owned(),
            reason: format!("'{v}' is not a valid u16"),
        }),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(ConfigError::InvalidVar {
            key: key.to_owned(),
            reason: "contains non-unicode data".to_owned(),
        }),
    }
}

fn parse_i64_env(key: &str, default: i64) -> ConfigResult<i64> {
    match env::var(key) {
        Ok(v) => v.parse::<i64>().map_err(|_| ConfigError::InvalidVar {
            key: key.to_owned(),
            reason: format!("'{v}' is not a valid i64"),
        }),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(ConfigError::InvalidVar {
            key: key.to_owned(),
            reason: "contains non-unicode data".to_owned(),
        }),
    }
}

/// Decode `APP_MASTER_KEY`: base64 first, hex as fallback, must yield 32 bytes.
fn decode_master_key(raw: &str) -> ConfigResult<[u8; 32]> {
    use base64::Engine;
    let trimmed = raw.trim();
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(trimmed)
        .or_else(|_| hex_decode(trimmed))
        .map_err(|_| ConfigError::BadMasterKeyEncoding)?;
    let len = decoded.len();
    decoded
        .try_into()
        .map_err(|_| ConfigError::BadMasterKeyLength(len))
}

fn hex_decode(s: &str) -> Result<Vec<u8>, ()> {
    if s.len() % 2 != 0 {
        return Err(());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| ()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_value_accepts_common_truthy_and_falsy_values() {
        for truthy in ["1", "true", "TRUE", " yes ", "Y", "on"] {
            assert_eq!(parse_bool_value(truthy), Some(true));
        }
        for falsy in ["0", "false", "FALSE", " no ", "N", "off"] {
            assert_eq!(parse_bool_value(falsy), Some(false));
        }
    }

    #[test]
    fn parse_bool_value_rejects_unrecognized_values() {
        for invalid in ["", "2", "maybe", "enabled", "disabled"] {
            assert_eq!(parse_bool_value(invalid), None);
        }
    }

    #[test]
    fn parse_mailboxes_splits_and_trims_and_drops_empty() {
        assert_eq!(
            parse_mailboxes(Some(" Inbox, Bulk ,, Archive".to_owned())),
            Some(vec!["Inbox".to_owned(), "Bulk".to_owned(), "Archive".to_owned()])
        );
        assert_eq!(parse_mailboxes(Some(String::new())), None);
        assert_eq!(parse_mailboxes(None), None);
    }

    #[test]
    fn decode_master_key_accepts_base64_32_bytes() {
        use base64::Engine;
        let raw = base64::engine::general_purpose::STANDARD.encode([7u8; 32]);
        assert_eq!(decode_master_key(&raw).unwrap(), [7u8; 32]);
    }

    #[test]
    fn decode_master_key_accepts_hex_32_bytes() {
        let raw = "ab".repeat(32);
        assert_eq!(decode_master_key(&raw).unwrap(), [0xabu8; 32]);
    }

    #[test]
    fn decode_master_key_rejects_wrong_length() {
        use base64::Engine;
        let raw = base64::engine::general_purpose::STANDARD.encode([7u8; 16]);
        assert!(matches!(
            decode_master_key(&raw),
            Err(ConfigError::BadMasterKeyLength(16))
        ));
    }

    #[test]
    fn decode_master_key_rejects_garbage() {
        assert!(matches!(
            decode_master_key("not valid base64 or hex!!"),
            Err(ConfigError::BadMasterKeyEncoding)
        ));
    }
}
