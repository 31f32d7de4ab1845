//! Configuration system
//!
//! Loads ~/.config/dealersync/config.yaml with support for:
//! - The remote CRM API and OAuth app
//! - The DMS adapter
//! - Orchestrator paging and retry policy
//! - Per-tenant sync flags and calendar routing

mod sync_config;
mod tenant;
pub mod validation;

pub use sync_config::{
    DmsConfig, OAuthAppConfig, OrchestratorConfig, RemoteApiConfig, RetrySettings, ServerConfig,
    SyncConfig,
};
pub use tenant::{CalendarMapping, TenantConfig};
pub use validation::{validate_config, validate_config_result, ValidationError};
