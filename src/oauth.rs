//! Credential Broker: produces a currently-valid destination-API access
//! token, refreshing via the `oauth2` crate and detecting external token
//! rotation through `secrets.created_at`. Grounded on `app/gmail/oauth.py`
//! and `app/gmail/service_manager.py`.

use chrono::{DateTime, Utc};
use oauth2::basic::BasicClient;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, RedirectUrl, RefreshToken, Scope,
    TokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};

use crate::errors::{OAuthError, OAuthResult};
use crate::secret_store::SecretStore;

pub const TOKEN_SECRET_KEY: &str = "gmail_oauth_tokens";

const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

pub const SCOPES: [&str; 3] = [
    "https://www.googleapis.com/auth/gmail.insert",
    "https://www.googleapis.com/auth/gmail.labels",
    "https://www.googleapis.com/auth/gmail.readonly",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenBundle {
    access_token: String,
    refresh_token: Option<String>,
    client_id: String,
    scopes: Vec<String>,
    expiry: Option<DateTime<Utc>>,
    /// Set every time `refresh()` succeeds, independent of whether the
    /// refresh token itself rotated.
    last_access_token_refresh_at: Option<DateTime<Utc>>,
    /// Set only when the token endpoint actually returns a new refresh
    /// token, so external rotation can be distinguished from a routine
    /// access-token refresh.
    refresh_token_updated_at: Option<DateTime<Utc>>,
}

pub struct CredentialBroker {
    secrets: SecretStore,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    http: reqwest::Client,
    cached_access_token: Option<String>,
    cached_created_at: Option<DateTime<Utc>>,
}

impl CredentialBroker {
    pub fn new(
        secrets: SecretStore,
        client_id: String,
        client_secret: String,
        redirect_uri: String,
    ) -> Self {
        Self {
            secrets,
            client_id,
            client_secret,
            redirect_uri,
            http: reqwest::Client::new(),
            cached_access_token: None,
            cached_created_at: None,
        }
    }

    fn oauth_client(&self) -> OAuthResult<BasicClient> {
        Ok(BasicClient::new(ClientId::new(self.client_id.clone()))
            .set_client_secret(ClientSecret::new(self.client_secret.clone()))
            .set_auth_uri(AuthUrl::new(AUTH_URL.to_owned()).map_err(|e| {
                OAuthError::Unreadable(format!("invalid auth url: {e}"))
            })?)
            .set_token_uri(TokenUrl::new(TOKEN_URL.to_owned()).map_err(|e| {
                OAuthError::Unreadable(format!("invalid token url: {e}"))
            })?)
            .set_redirect_uri(RedirectUrl::new(self.redirect_uri.clone()).map_err(|e| {
                OAuthError::Unreadable(format!("invalid redirect url: {e}"))
            })?))
    }

    /// Print-and-exchange authorization URL for the CLI `oauth` subcommand.
    pub fn authorization_url(&self) -> OAuthResult<String> {
        let client = self.oauth_client()?;
        let (url, _csrf) = client
            .authorize_url(oauth2::CsrfToken::new_random)
            .add_scopes(SCOPES.iter().map(|s| Scope::new(s.to_string())))
            .url();
        Ok(url.to_string())
    }

    /// Exchange a pasted authorization code for tokens and persist them.
    pub async fn exchange_code(&self, code: &str) -> OAuthResult<()> {
        let client = self.oauth_client()?;
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| OAuthError::Unreadable(e.to_string()))?;
        let token_result = client
            .exchange_code(AuthorizationCode::new(code.to_owned()))
            .request_async(&http)
            .await
            .map_err(|e| OAuthError::classify_refresh_failure(&e.to_string()))?;

        let now = Utc::now();
        let bundle = TokenBundle {
            access_token: token_result.access_token().secret().clone(),
            refresh_token: token_result.refresh_token().map(|t| t.secret().clone()),
            client_id: self.client_id.clone(),
            scopes: SCOPES.iter().map(|s| s.to_string()).collect(),
            expiry: token_result
                .expires_in()
                .map(|d| Utc::now() + chrono::Duration::from_std(d).unwrap_or_default()),
            last_access_token_refresh_at: Some(now),
            refresh_token_updated_at: Some(now),
        };
        self.persist(&bundle).await
    }

    async fn persist(&self, bundle: &TokenBundle) -> OAuthResult<()> {
        let payload = serde_json::to_vec(bundle)
            .map_err(|e| OAuthError::Unreadable(e.to_string()))?;
        self.secrets
            .set(TOKEN_SECRET_KEY, &payload)
            .await
            .map_err(|e| OAuthError::Unreadable(e.to_string()))
    }

    async fn load(&self) -> OAuthResult<TokenBundle> {
        let raw = self
            .secrets
            .get(TOKEN_SECRET_KEY)
            .await
            .map_err(|e| OAuthError::Unreadable(e.to_string()))?
            .ok_or(OAuthError::Missing)?;
        serde_json::from_slice(&raw).map_err(|e| OAuthError::Unreadable(e.to_string()))
    }

    /// Return a currently-valid access token, refreshing and/or detecting
    /// external rotation as needed. Call this before every delivery attempt.
    pub async fn access_token(&mut self) -> OAuthResult<String> {
        let created_at = self
            .secrets
            .created_at(TOKEN_SECRET_KEY)
            .await
            .map_err(|e| OAuthError::Unreadable(e.to_string()))?;

        let needs_reload = self.cached_access_token.is_none() || created_at != self.cached_created_at;
        if !needs_reload {
            return Ok(self.cached_access_token.clone().expect("checked above"));
        }

        let mut bundle = self.load().await?;

        if bundle.client_id != self.client_id {
            return Err(OAuthError::ClientMismatch);
        }
        let required: std::collections::HashSet<&str> = SCOPES.iter().copied().collect();
        let have: std::collections::HashSet<&str> = bundle.scopes.iter().map(String::as_str).collect();
        if !required.is_subset(&have) {
            return Err(OAuthError::ScopeInsufficient);
        }

        let is_expired = bundle.expiry.is_some_and(|e| e <= Utc::now());
        if is_expired {
            let refresh_token = bundle
                .refresh_token
                .clone()
                .ok_or(OAuthError::NotRefreshable)?;
            bundle = self.refresh(&refresh_token, bundle).await?;
        }

        self.cached_access_token = Some(bundle.access_token.clone());
        self.cached_created_at = created_at;
        Ok(bundle.access_token)
    }

    async fn refresh(
        &self,
        refresh_token: &str,
        previous: TokenBundle,
    ) -> OAuthResult<TokenBundle> {
        let client = self.oauth_client()?;
        let token_result = client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_owned()))
            .request_async(&self.http)
            .await
            .map_err(|e| OAuthError::classify_refresh_failure(&e.to_string()))?;

        let now = Utc::now();
        let rotated_refresh_token = token_result.refresh_token().map(|t| t.secret().clone());
        let refresh_token_updated_at = if rotated_refresh_token.is_some() {
            Some(now)
        } else {
            previous.refresh_token_updated_at
        };

        let bundle = TokenBundle {
            access_token: token_result.access_token().secret().clone(),
            refresh_token: rotated_refresh_token.or(previous.refresh_token),
            client_id: self.client_id.clone(),
            scopes: previous.scopes,
            expiry: token_result
                .expires_in()
                .map(|d| Utc::now() + chrono::Duration::from_std(d).unwrap_or_default()),
            last_access_token_refresh_at: Some(now),
            refresh_token_updated_at,
        };
        self.persist(&bundle).await?;
        Ok(bundle)
    }
}
