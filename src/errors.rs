//! Application error hierarchy
//!
//! One `thiserror` enum per concern, following the usual shape: a `#[derive(Error)]`
//! enum plus a `Result` alias. Nothing here decides retry policy — that lives next
//! to the classification logic in [`crate::gmail::client`] and [`crate::oauth`].

use thiserror::Error;

/// Configuration load failure; fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variables: {0}")]
    MissingVars(String),
    #[error("invalid environment variable {key}: {reason}")]
    InvalidVar { key: String, reason: String },
    #[error("APP_MASTER_KEY must be base64 or hex encoded")]
    BadMasterKeyEncoding,
    #[error("APP_MASTER_KEY must decode to 32 bytes, got {0}")]
    BadMasterKeyLength(usize),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Source IMAP adapter failure. Fatal to the current connection, never to the process.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("imap timeout: {0}")]
    Timeout(String),
    #[error("imap authentication failed: {0}")]
    AuthFailed(String),
    #[error("imap protocol error: {0}")]
    Protocol(String),
    #[error("mailbox '{0}' has no UIDVALIDITY")]
    MissingUidValidity(String),
    #[error("refusing to delete uid {uid}: uidvalidity changed (expected {expected}, got {actual})")]
    UidValidityChanged {
        expected: u32,
        actual: u32,
        uid: u32,
    },
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type SourceResult<T> = Result<T, SourceError>;

/// Header-injection / hashing failure. Always non-retryable.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("RFC822 headers/body separator not found")]
    MissingSeparator,
    #[error("RFC822 SHA256 mismatch")]
    HashMismatch,
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Destination delivery (Gmail HTTP API) failure, already classified.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("destination http {status}: {body}")]
    Http { status: u16, body: String },
    #[error("destination transport error: {0}")]
    Transport(String),
}

impl DeliveryError {
    /// HTTP 429/500/502/503/504, and any transport-level failure, are retryable.
    /// Any other 4xx is permanent. See spec §4.2.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http { status, .. } => {
                matches!(status, 429 | 500 | 502 | 503 | 504) || !(400..500).contains(status)
            }
            Self::Transport(_) => true,
        }
    }

    /// 401/403 are retryable AND indicate the OAuth credential needs operator attention.
    pub fn is_oauth_signal(&self) -> bool {
        matches!(self, Self::Http { status, .. } if *status == 401 || *status == 403)
    }
}

pub type DeliveryResult<T> = Result<T, DeliveryError>;

/// Credential broker failure, classified so the retry worker can alert precisely.
#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("oauth tokens missing; run the oauth subcommand")]
    Missing,
    #[error("oauth tokens unreadable: {0}")]
    Unreadable(String),
    #[error("oauth client_id mismatch with configured client")]
    ClientMismatch,
    #[error("oauth token scopes insufficient for required operations")]
    ScopeInsufficient,
    #[error("oauth refresh rejected: invalid_grant")]
    InvalidGrant,
    #[error("oauth refresh rejected: invalid_client")]
    InvalidClient,
    #[error("oauth token invalid and not refreshable")]
    Invalid,
    #[error("oauth token expired with no refresh token present")]
    NotRefreshable,
}

impl OAuthError {
    /// Alert `kind` used by the Alert Manager for this failure, per spec §4.6/§4.7.
    pub fn alert_kind(&self) -> &'static str {
        match self {
            Self::InvalidGrant => "oauth_invalid_grant",
            Self::ClientMismatch => "oauth_client_mismatch",
            Self::ScopeInsufficient => "oauth_scope_insufficient",
            _ => "oauth_invalid",
        }
    }

    /// Classify a refresh-endpoint error body/description into a precise subkind.
    pub fn classify_refresh_failure(error_text: &str) -> Self {
        let lower = error_text.to_ascii_lowercase();
        if lower.contains("invalid_grant") {
            Self::InvalidGrant
        } else if lower.contains("invalid_client") {
            Self::InvalidClient
        } else {
            Self::Invalid
        }
    }
}

pub type OAuthResult<T> = Result<T, OAuthError>;

/// State store failure; wraps `sqlx::Error`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_error_classifies_retryable_statuses() {
        for status in [429, 500, 502, 503, 504] {
            let err = DeliveryError::Http {
                status,
                body: String::new(),
            };
            assert!(err.is_retryable(), "status {status} should be retryable");
        }
    }

    #[test]
    fn delivery_error_classifies_permanent_statuses() {
        let err = DeliveryError::Http {
            status: 400,
            body: String::new(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn delivery_error_flags_oauth_signal_on_401_and_403() {
        for status in [401, 403] {
            let err = DeliveryError::Http {
                status,
                body: String::new(),
            };
            assert!(err.is_oauth_signal());
            assert!(err.is_retryable());
        }
    }

    #[test]
    fn delivery_error_transport_is_retryable() {
        assert!(DeliveryError::Transport("dns".into()).is_retryable());
    }

    #[test]
    fn oauth_error_classification_from_refresh_error_text() {
        assert!(matches!(
            OAuthError::classify_refresh_failure("invalid_grant: token revoked"),
            OAuthError::InvalidGrant
        ));
        assert!(matches!(
            OAuthError::classify_refresh_failure("invalid_client"),
            OAuthError::InvalidClient
        ));
        assert!(matches!(
            OAuthError::classify_refresh_failure("server_error"),
            OAuthError::Invalid
        ));
    }
}
