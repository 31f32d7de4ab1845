//! Remote CRM authentication
//!
//! Tenants connect with either a static location API key or OAuth tokens.
//! [`CredentialResolver`] turns the stored account into credentials for each
//! call and refreshes OAuth tokens through [`OAuthClient`].

mod credentials;
mod oauth;
mod resolver;

pub use credentials::{AccountStore, ApiKeyAuth, Authorize, CrmAccount, Credentials, OAuthAuth};
pub use oauth::{OAuthClient, OAuthTokens};
pub use resolver::{CredentialResolver, DEFAULT_REFRESH_SKEW_SECS};
