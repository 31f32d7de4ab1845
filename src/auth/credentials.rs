//! CRM account credentials
//!
//! A tenant connects either with a static API key or through OAuth. Both
//! variants expose the same [`Authorize`] capability, which is all the
//! resilient client depends on.

use super::oauth::OAuthTokens;
use crate::remote::transport::ApiRequest;
use crate::Result;
use chrono::{DateTime, Utc};
use std::fmt;

/// Applies credentials to an outbound request
pub trait Authorize {
    /// Inject auth headers into the request
    fn authorize(&self, request: &mut ApiRequest);

    /// Remote location (sub-account) the credentials are scoped to
    fn location_id(&self) -> &str;

    /// When the credentials stop working, if they expire at all
    fn expires_at(&self) -> Option<DateTime<Utc>> {
        None
    }
}

/// Static location API key, never expires
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKeyAuth {
    pub api_key: String,
    pub location_id: String,
}

impl fmt::Debug for ApiKeyAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeyAuth")
            .field("api_key", &"***")
            .field("location_id", &self.location_id)
            .finish()
    }
}

impl Authorize for ApiKeyAuth {
    fn authorize(&self, request: &mut ApiRequest) {
        request.set_header("Authorization", format!("Bearer {}", self.api_key));
    }

    fn location_id(&self) -> &str {
        &self.location_id
    }
}

/// OAuth access token with its refresh token
#[derive(Clone, PartialEq, Eq)]
pub struct OAuthAuth {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub location_id: String,
}

impl fmt::Debug for OAuthAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthAuth")
            .field("access_token", &"***")
            .field("refresh_token", &"***")
            .field("expires_at", &self.expires_at)
            .field("location_id", &self.location_id)
            .finish()
    }
}

impl OAuthAuth {
    /// Expired, or expiring within `skew_secs`
    pub fn expires_within(&self, skew_secs: i64, now: DateTime<Utc>) -> bool {
        self.expires_at <= now + chrono::Duration::seconds(skew_secs)
    }
}

impl Authorize for OAuthAuth {
    fn authorize(&self, request: &mut ApiRequest) {
        request.set_header("Authorization", format!("Bearer {}", self.access_token));
    }

    fn location_id(&self) -> &str {
        &self.location_id
    }

    fn expires_at(&self) -> Option<DateTime<Utc>> {
        Some(self.expires_at)
    }
}

/// Credentials of one CRM account
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    ApiKey(ApiKeyAuth),
    OAuth(OAuthAuth),
}

impl Credentials {
    pub fn api_key(api_key: impl Into<String>, location_id: impl Into<String>) -> Self {
        Credentials::ApiKey(ApiKeyAuth {
            api_key: api_key.into(),
            location_id: location_id.into(),
        })
    }

    pub fn oauth(tokens: OAuthTokens, location_id: impl Into<String>) -> Self {
        Credentials::OAuth(OAuthAuth {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_at: tokens.expires_at,
            location_id: tokens.location_id.unwrap_or_else(|| location_id.into()),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Credentials::ApiKey(_) => "api_key",
            Credentials::OAuth(_) => "oauth",
        }
    }

    pub fn is_refreshable(&self) -> bool {
        matches!(self, Credentials::OAuth(_))
    }
}

impl Authorize for Credentials {
    fn authorize(&self, request: &mut ApiRequest) {
        match self {
            Credentials::ApiKey(auth) => auth.authorize(request),
            Credentials::OAuth(auth) => auth.authorize(request),
        }
    }

    fn location_id(&self) -> &str {
        match self {
            Credentials::ApiKey(auth) => auth.location_id(),
            Credentials::OAuth(auth) => auth.location_id(),
        }
    }

    fn expires_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Credentials::ApiKey(auth) => auth.expires_at(),
            Credentials::OAuth(auth) => auth.expires_at(),
        }
    }
}

/// Per-tenant CRM account, deactivated rather than deleted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrmAccount {
    pub tenant_id: String,
    pub credentials: Credentials,
    pub active: bool,
}

impl CrmAccount {
    pub fn new(tenant_id: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            credentials,
            active: true,
        }
    }
}

/// Durable home of CRM accounts
pub trait AccountStore: Send + Sync {
    fn load_account(&self, tenant_id: &str) -> Result<Option<CrmAccount>>;

    /// Rotate OAuth tokens in place
    fn save_tokens(&self, tenant_id: &str, tokens: &OAuthTokens) -> Result<()>;
}
