//! Per-tenant credential resolution
//!
//! The resolver hands the client the tenant's current credentials before every
//! outbound call. Credentials are cached between calls. A refresh or an
//! [`CredentialResolver::invalidate`] drops the cache so the next call reads
//! the account store again, which is how deactivation and key rotation reach
//! a long-lived session.

use super::credentials::{AccountStore, Credentials, OAuthAuth};
use super::oauth::OAuthClient;
use crate::sync::metrics;
use crate::{Result, SyncError};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Refresh OAuth tokens this long before they expire
pub const DEFAULT_REFRESH_SKEW_SECS: i64 = 300;

pub struct CredentialResolver {
    tenant_id: String,
    accounts: Arc<dyn AccountStore>,
    oauth: Option<Arc<OAuthClient>>,
    refresh_skew_secs: i64,
    cached: Mutex<Option<Credentials>>,
}

impl CredentialResolver {
    pub fn new(
        tenant_id: impl Into<String>,
        accounts: Arc<dyn AccountStore>,
        oauth: Option<Arc<OAuthClient>>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            accounts,
            oauth,
            refresh_skew_secs: DEFAULT_REFRESH_SKEW_SECS,
            cached: Mutex::new(None),
        }
    }

    pub fn with_refresh_skew(mut self, secs: i64) -> Self {
        self.refresh_skew_secs = secs;
        self
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Credentials for the next outbound call
    ///
    /// OAuth tokens expiring within the refresh skew are refreshed first.
    pub async fn resolve(&self) -> Result<Credentials> {
        let mut cached = self.cached.lock().await;

        if let Some(creds) = cached.as_ref() {
            if !self.needs_refresh(creds) {
                return Ok(creds.clone());
            }
        }

        let creds = match self.load_active()? {
            Credentials::OAuth(auth) if auth.expires_within(self.refresh_skew_secs, Utc::now()) => {
                debug!(
                    tenant = %self.tenant_id,
                    expires_at = %auth.expires_at,
                    "OAuth token expiring soon, refreshing"
                );
                match self.refresh_oauth(&auth).await {
                    Ok(()) => self.load_active()?,
                    Err(e) if auth.expires_at > Utc::now() => {
                        warn!(
                            tenant = %self.tenant_id,
                            "Proactive token refresh failed, using current token: {}",
                            e
                        );
                        Credentials::OAuth(auth)
                    }
                    Err(e) => return Err(e),
                }
            }
            other => other,
        };

        *cached = Some(creds.clone());
        Ok(creds)
    }

    /// Force a refresh after the server rejected the current token
    ///
    /// Returns `Ok(false)` when the credentials cannot be refreshed (API key).
    /// The cache is dropped either way, so a rotated key is picked up by the
    /// next call.
    pub async fn refresh(&self) -> Result<bool> {
        let mut cached = self.cached.lock().await;
        *cached = None;

        let creds = self.load_active()?;
        let auth = match creds {
            Credentials::ApiKey(_) => {
                debug!(tenant = %self.tenant_id, "API key credentials cannot be refreshed");
                return Ok(false);
            }
            Credentials::OAuth(auth) => auth,
        };

        self.refresh_oauth(&auth).await?;
        Ok(true)
    }

    /// Drop cached credentials
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }

    fn needs_refresh(&self, creds: &Credentials) -> bool {
        match creds {
            Credentials::ApiKey(_) => false,
            Credentials::OAuth(auth) => auth.expires_within(self.refresh_skew_secs, Utc::now()),
        }
    }

    fn load_active(&self) -> Result<Credentials> {
        match self.accounts.load_account(&self.tenant_id)? {
            Some(account) if account.active => Ok(account.credentials),
            Some(_) => {
                debug!(tenant = %self.tenant_id, "CRM account is deactivated");
                Err(SyncError::NoAccount(self.tenant_id.clone()))
            }
            None => Err(SyncError::NoAccount(self.tenant_id.clone())),
        }
    }

    async fn refresh_oauth(&self, auth: &OAuthAuth) -> Result<()> {
        let oauth = self.oauth.as_ref().ok_or_else(|| {
            SyncError::AuthFailed("no OAuth app configured to refresh tokens".to_string())
        })?;

        match oauth.refresh(&auth.refresh_token).await {
            Ok(tokens) => {
                self.accounts.save_tokens(&self.tenant_id, &tokens)?;
                metrics::record_token_refresh("success");
                info!(
                    tenant = %self.tenant_id,
                    expires_at = %tokens.expires_at,
                    "Refreshed OAuth token"
                );
                Ok(())
            }
            Err(e) => {
                metrics::record_token_refresh("failure");
                warn!(tenant = %self.tenant_id, "OAuth token refresh failed: {}", e);
                Err(match e {
                    SyncError::Http { status, body } => {
                        SyncError::AuthFailed(format!("token refresh failed: HTTP {} {}", status, body))
                    }
                    other => other,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::CrmAccount;
    use crate::config::OAuthAppConfig;
    use crate::ledger::SyncLedger;
    use crate::remote::scripted::ScriptedTransport;
    use reqwest::Method;
    use serde_json::json;

    fn oauth_client(transport: Arc<ScriptedTransport>) -> Arc<OAuthClient> {
        let config = OAuthAppConfig {
            token_url: None,
            client_id: "client".into(),
            client_secret_env: "DEALERSYNC_UNUSED".into(),
            redirect_uri: None,
        };
        Arc::new(OAuthClient::new(config, "https://crm.test", transport).with_client_secret("s"))
    }

    fn oauth_account(expires_in_secs: i64) -> CrmAccount {
        CrmAccount::new(
            "d1",
            Credentials::OAuth(OAuthAuth {
                access_token: "old".into(),
                refresh_token: "rt".into(),
                expires_at: Utc::now() + chrono::Duration::seconds(expires_in_secs),
                location_id: "loc".into(),
            }),
        )
    }

    fn access_token(creds: &Credentials) -> &str {
        match creds {
            Credentials::OAuth(auth) => &auth.access_token,
            Credentials::ApiKey(auth) => &auth.api_key,
        }
    }

    #[tokio::test]
    async fn test_missing_or_inactive_account() {
        let ledger = Arc::new(SyncLedger::in_memory().unwrap());
        let resolver = CredentialResolver::new("d1", ledger.clone(), None);
        assert!(matches!(
            resolver.resolve().await,
            Err(SyncError::NoAccount(_))
        ));

        ledger
            .upsert_account(&CrmAccount::new("d1", Credentials::api_key("k", "loc")))
            .unwrap();
        assert!(resolver.resolve().await.is_ok());

        ledger.deactivate_account("d1").unwrap();
        resolver.invalidate().await;
        assert!(matches!(
            resolver.resolve().await,
            Err(SyncError::NoAccount(_))
        ));
    }

    #[tokio::test]
    async fn test_api_key_never_refreshes() {
        let ledger = Arc::new(SyncLedger::in_memory().unwrap());
        ledger
            .upsert_account(&CrmAccount::new("d1", Credentials::api_key("k", "loc")))
            .unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        let resolver = CredentialResolver::new("d1", ledger, Some(oauth_client(transport.clone())));

        assert!(!resolver.refresh().await.unwrap());
        assert_eq!(transport.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_api_key_rotation_and_deactivation_seen_after_refresh() {
        let ledger = Arc::new(SyncLedger::in_memory().unwrap());
        ledger
            .upsert_account(&CrmAccount::new("d1", Credentials::api_key("k1", "loc")))
            .unwrap();
        let resolver = CredentialResolver::new("d1", ledger.clone(), None);
        assert_eq!(access_token(&resolver.resolve().await.unwrap()), "k1");

        ledger
            .upsert_account(&CrmAccount::new("d1", Credentials::api_key("k2", "loc")))
            .unwrap();
        assert!(!resolver.refresh().await.unwrap());
        assert_eq!(access_token(&resolver.resolve().await.unwrap()), "k2");

        ledger.deactivate_account("d1").unwrap();
        assert!(matches!(
            resolver.refresh().await,
            Err(SyncError::NoAccount(_))
        ));
        assert!(matches!(
            resolver.resolve().await,
            Err(SyncError::NoAccount(_))
        ));
    }

    #[tokio::test]
    async fn test_proactive_refresh_when_expiring() {
        let ledger = Arc::new(SyncLedger::in_memory().unwrap());
        ledger.upsert_account(&oauth_account(60)).unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond_json(
            Method::POST,
            "/oauth/token",
            200,
            json!({"access_token": "new", "refresh_token": "rt2", "expires_in": 86400}),
        );
        let resolver =
            CredentialResolver::new("d1", ledger.clone(), Some(oauth_client(transport.clone())));

        let creds = resolver.resolve().await.unwrap();
        assert_eq!(access_token(&creds), "new");

        // Cached and fresh: no second refresh
        let again = resolver.resolve().await.unwrap();
        assert_eq!(access_token(&again), "new");
        assert_eq!(transport.calls(Method::POST, "/oauth/token"), 1);
    }

    #[tokio::test]
    async fn test_refresh_invalidates_cache() {
        let ledger = Arc::new(SyncLedger::in_memory().unwrap());
        ledger.upsert_account(&oauth_account(3600)).unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond_json(
            Method::POST,
            "/oauth/token",
            200,
            json!({"access_token": "rotated", "refresh_token": "rt2", "expires_in": 86400}),
        );
        let resolver = CredentialResolver::new("d1", ledger, Some(oauth_client(transport)));

        assert_eq!(access_token(&resolver.resolve().await.unwrap()), "old");
        assert!(resolver.refresh().await.unwrap());
        assert_eq!(access_token(&resolver.resolve().await.unwrap()), "rotated");
    }

    #[tokio::test]
    async fn test_refresh_failure_surfaces_auth_failed() {
        let ledger = Arc::new(SyncLedger::in_memory().unwrap());
        ledger.upsert_account(&oauth_account(3600)).unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond_json(
            Method::POST,
            "/oauth/token",
            500,
            json!({"error": "server_error"}),
        );
        let resolver = CredentialResolver::new("d1", ledger, Some(oauth_client(transport)));

        assert!(matches!(
            resolver.refresh().await,
            Err(SyncError::AuthFailed(_))
        ));
    }
}
