//! OAuth token endpoint
//!
//! Implements the two grants the remote CRM supports on `POST /oauth/token`:
//! `authorization_code` when a dealership connects, and `refresh_token` when
//! the access token is about to expire.

use super::credentials::{CrmAccount, Credentials};
use crate::config::OAuthAppConfig;
use crate::ledger::SyncLedger;
use crate::remote::transport::{ApiRequest, Transport, TransportError};
use crate::{Result, SyncError};
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::Deserialize;
use std::sync::Arc;

/// Access tokens are assumed to last a day when the server omits `expires_in`
const DEFAULT_EXPIRES_IN: i64 = 86_400;

/// Token set returned by either grant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    /// Location the tokens are scoped to, when the server says so
    pub location_id: Option<String>,
}

/// Token endpoint response
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(rename = "locationId", default)]
    location_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// Client for the OAuth token endpoint
pub struct OAuthClient {
    config: OAuthAppConfig,
    token_url: String,
    client_secret: Option<String>,
    transport: Arc<dyn Transport>,
}

impl OAuthClient {
    pub fn new(config: OAuthAppConfig, base_url: &str, transport: Arc<dyn Transport>) -> Self {
        let token_url = config.token_url(base_url);
        Self {
            config,
            token_url,
            client_secret: None,
            transport,
        }
    }

    /// Use this secret instead of reading `client_secret_env`
    pub fn with_client_secret(mut self, secret: impl Into<String>) -> Self {
        self.client_secret = Some(secret.into());
        self
    }

    fn secret(&self) -> Result<String> {
        match &self.client_secret {
            Some(secret) => Ok(secret.clone()),
            None => self.config.client_secret(),
        }
    }

    /// Exchange an authorization code for tokens
    pub async fn exchange_code(&self, code: &str) -> Result<OAuthTokens> {
        let mut form = vec![
            ("grant_type".to_string(), "authorization_code".to_string()),
            ("code".to_string(), code.to_string()),
        ];
        if let Some(ref redirect_uri) = self.config.redirect_uri {
            form.push(("redirect_uri".to_string(), redirect_uri.clone()));
        }
        self.token_request(form).await
    }

    /// Trade a refresh token for a new token set
    pub async fn refresh(&self, refresh_token: &str) -> Result<OAuthTokens> {
        let form = vec![
            ("grant_type".to_string(), "refresh_token".to_string()),
            ("refresh_token".to_string(), refresh_token.to_string()),
        ];
        self.token_request(form).await
    }

    /// Exchange a code and store the result as the tenant's active account
    pub async fn connect(
        &self,
        ledger: &SyncLedger,
        tenant_id: &str,
        code: &str,
        location_id: &str,
    ) -> Result<CrmAccount> {
        let tokens = self.exchange_code(code).await?;
        let account = CrmAccount::new(tenant_id, Credentials::oauth(tokens, location_id));
        ledger.upsert_account(&account)?;

        tracing::info!(tenant = tenant_id, "Connected CRM account through OAuth");
        Ok(account)
    }

    async fn token_request(&self, mut form: Vec<(String, String)>) -> Result<OAuthTokens> {
        form.push(("client_id".to_string(), self.config.client_id.clone()));
        form.push(("client_secret".to_string(), self.secret()?));

        let request = ApiRequest::new(Method::POST, &self.token_url)
            .with_header("Accept", "application/json")
            .with_form(form);

        let response = self.transport.send(request).await.map_err(|e| match e {
            TransportError::Timeout => SyncError::Network("token endpoint timed out".to_string()),
            other => SyncError::Network(other.to_string()),
        })?;

        let parsed: Option<TokenResponse> = response.body_json().ok();

        if !response.is_success() {
            let description = parsed
                .as_ref()
                .and_then(|t| t.error_description.clone().or_else(|| t.error.clone()))
                .unwrap_or_else(|| response.body.clone());
            return match response.status {
                400 | 401 | 403 => Err(SyncError::AuthFailed(format!(
                    "token endpoint rejected grant: {}",
                    description
                ))),
                status => Err(SyncError::Http {
                    status,
                    body: description,
                }),
            };
        }

        let token = parsed.ok_or_else(|| {
            SyncError::AuthFailed("token endpoint returned an unreadable body".to_string())
        })?;

        if let Some(error) = token.error {
            let description = token.error_description.unwrap_or_default();
            return Err(SyncError::AuthFailed(format!("{} {}", error, description)));
        }

        let access_token = token
            .access_token
            .ok_or_else(|| SyncError::AuthFailed("No access token in response".to_string()))?;
        let refresh_token = token
            .refresh_token
            .ok_or_else(|| SyncError::AuthFailed("No refresh token in response".to_string()))?;
        let expires_in = token.expires_in.unwrap_or(DEFAULT_EXPIRES_IN);

        Ok(OAuthTokens {
            access_token,
            refresh_token,
            expires_at: Utc::now() + chrono::Duration::seconds(expires_in),
            location_id: token.location_id,
        })
    }
}
