//! DealerSync configuration file handling
//!
//! Loads and manages the ~/.config/dealersync/config.yaml file.

use super::tenant::TenantConfig;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Remote CRM API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteApiConfig {
    /// Base URL of the remote CRM API
    pub base_url: String,

    /// Value sent in the `Version` header, if the API is versioned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for RemoteApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://services.leadconnectorhq.com".to_string(),
            api_version: Some("2021-07-28".to_string()),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl RemoteApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// OAuth application used for the authorization-code and refresh-token grants
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthAppConfig {
    /// Token endpoint (defaults to `<base_url>/oauth/token`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_url: Option<String>,

    /// OAuth client id
    pub client_id: String,

    /// Environment variable holding the client secret
    pub client_secret_env: String,

    /// Redirect URI registered with the app
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
}

impl OAuthAppConfig {
    /// Read the client secret from the environment
    pub fn client_secret(&self) -> Result<String> {
        let var = self.client_secret_env.trim_start_matches('$');
        std::env::var(var).map_err(|_| {
            crate::SyncError::Config(format!("OAuth client secret env var {} is not set", var))
        })
    }

    pub fn token_url(&self, base_url: &str) -> String {
        self.token_url
            .clone()
            .unwrap_or_else(|| format!("{}/oauth/token", base_url.trim_end_matches('/')))
    }
}

/// DMS adapter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DmsConfig {
    /// Base URL of the DMS adapter API
    pub base_url: String,

    /// Optional environment variable holding a bearer token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,
}

impl DmsConfig {
    pub fn token(&self) -> Option<String> {
        self.token_env
            .as_ref()
            .and_then(|var| std::env::var(var.trim_start_matches('$')).ok())
    }
}

/// Batch orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Ledger rows fetched per page (50-100)
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Pages processed per entity per run
    #[serde(default = "default_max_pages")]
    pub max_pages_per_run: u32,

    /// Seconds between scheduled runs
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Transient failures tolerated before a row is marked `error`
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_page_size() -> u32 {
    50
}

fn default_max_pages() -> u32 {
    10
}

fn default_poll_interval_secs() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    5
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            max_pages_per_run: default_max_pages(),
            poll_interval_secs: default_poll_interval_secs(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl OrchestratorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Retry policy settings for outbound calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Retries after the initial attempt, per failure class
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base backoff in milliseconds (doubles per attempt)
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    /// Upper bound for any single wait, including Retry-After
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,

    /// Refresh OAuth tokens this many seconds before they expire
    #[serde(default = "default_refresh_skew_secs")]
    pub refresh_skew_secs: i64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_secs() -> u64 {
    60
}

fn default_refresh_skew_secs() -> i64 {
    300
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_secs: default_max_backoff_secs(),
            refresh_skew_secs: default_refresh_skew_secs(),
        }
    }
}

/// Trigger server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address for the trigger server
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Disable to run the scheduler without the HTTP surface
    #[serde(default = "default_server_enabled")]
    pub enabled: bool,
}

fn default_bind() -> String {
    "127.0.0.1:8087".to_string()
}

fn default_server_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            enabled: default_server_enabled(),
        }
    }
}

/// DealerSync configuration
///
/// Represents the complete ~/.config/dealersync/config.yaml file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Path to the SQLite ledger
    #[serde(default = "default_database_path")]
    pub database: PathBuf,

    /// Remote CRM API
    #[serde(default)]
    pub remote: RemoteApiConfig,

    /// OAuth app (required for tenants connected through OAuth)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthAppConfig>,

    /// DMS adapter (required for the remote to DMS bridge)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dms: Option<DmsConfig>,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub server: ServerConfig,

    /// Dealership tenants
    #[serde(default)]
    pub tenants: Vec<TenantConfig>,
}

fn default_database_path() -> PathBuf {
    let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(".config");
    path.push("dealersync");
    path.push("ledger.db");
    path
}

impl SyncConfig {
    /// Create a new configuration with defaults and no tenants
    pub fn new() -> Self {
        Self {
            database: default_database_path(),
            remote: RemoteApiConfig::default(),
            oauth: None,
            dms: None,
            orchestrator: OrchestratorConfig::default(),
            retry: RetrySettings::default(),
            server: ServerConfig::default(),
            tenants: Vec::new(),
        }
    }

    /// Load configuration from the default path
    pub fn load_default() -> Result<Self> {
        Self::load(Self::default_path())
    }

    /// Load configuration from a specific path
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(crate::SyncError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        tracing::info!(path = %path.display(), "Loading DealerSync configuration");

        let content = fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;

        tracing::debug!(
            tenants = config.tenants.len(),
            remote = %config.remote.base_url,
            "Configuration loaded successfully"
        );

        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        tracing::info!(path = %path.display(), "Saving DealerSync configuration");

        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)?;

        Ok(())
    }

    /// Default config path (~/.config/dealersync/config.yaml)
    pub fn default_path() -> PathBuf {
        let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(".config");
        path.push("dealersync");
        path.push("config.yaml");
        path
    }

    pub fn with_database(mut self, path: impl Into<PathBuf>) -> Self {
        self.database = path.into();
        self
    }

    pub fn with_remote_url(mut self, base_url: impl Into<String>) -> Self {
        self.remote.base_url = base_url.into();
        self
    }

    pub fn with_tenant(mut self, tenant: TenantConfig) -> Self {
        self.tenants.push(tenant);
        self
    }

    /// Get a tenant by id
    pub fn tenant(&self, tenant_id: &str) -> Option<&TenantConfig> {
        self.tenants.iter().find(|t| t.tenant_id == tenant_id)
    }

    pub fn tenant_ids(&self) -> Vec<&str> {
        self.tenants.iter().map(|t| t.tenant_id.as_str()).collect()
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_defaults() {
        let config = SyncConfig::new();
        assert!(config.tenants.is_empty());
        assert_eq!(config.orchestrator.page_size, 50);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.refresh_skew_secs, 300);
        assert!(config.database.ends_with("dealersync/ledger.db"));
    }

    #[test]
    fn test_save_and_load() {
        let temp_file = NamedTempFile::new().unwrap();
        let config = SyncConfig::new()
            .with_remote_url("https://crm.example.com")
            .with_tenant(TenantConfig::new("dealer-1"));

        config.save(temp_file.path()).unwrap();

        let loaded = SyncConfig::load(temp_file.path()).unwrap();
        assert_eq!(loaded.remote.base_url, "https://crm.example.com");
        assert_eq!(loaded.tenant_ids(), vec!["dealer-1"]);
    }

    #[test]
    fn test_load_missing_file() {
        assert!(SyncConfig::load("/nonexistent/dealersync.yaml").is_err());
    }

    #[test]
    fn test_minimal_yaml() {
        let yaml = r#"
remote:
  base_url: https://crm.example.com
tenants:
  - tenant_id: d1
    sync_appointments_enabled: true
    calendars:
      sales: cal-1
"#;
        let config: SyncConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.remote.timeout_secs, 30);
        let tenant = config.tenant("d1").unwrap();
        assert!(tenant.sync_appointments_enabled);
        assert_eq!(tenant.calendars.sales.as_deref(), Some("cal-1"));
    }

    #[test]
    fn test_oauth_token_url_default() {
        let oauth = OAuthAppConfig {
            token_url: None,
            client_id: "client".into(),
            client_secret_env: "DEALERSYNC_TEST_SECRET_UNSET".into(),
            redirect_uri: None,
        };
        assert_eq!(
            oauth.token_url("https://crm.example.com/"),
            "https://crm.example.com/oauth/token"
        );
        assert!(oauth.client_secret().is_err());
    }
}
