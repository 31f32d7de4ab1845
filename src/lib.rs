//! DealerSync - contact and appointment sync between a dealership CRM, a
//! remote marketing CRM and the dealership's DMS
//!
//! # Architecture
//!
//! - **auth**: CRM accounts, API-key and OAuth credentials, the per-tenant resolver
//! - **remote**: HTTP transport, retry policy, the resilient API client, CRM and DMS endpoints
//! - **ledger**: SQLite sync ledger (id mappings, call log, activity trail)
//! - **sync**: Reconcilers, bridge, batch orchestrator and scheduler daemon
//! - **server**: axum trigger server
//! - **config**: YAML configuration and validation

// Core modules
pub mod config;
pub mod error;
pub mod ledger;
pub mod logging;

// Components
pub mod auth;
pub mod remote;
pub mod server;
pub mod sync;

// Re-exports
pub use error::{ErrorCode, Result, SyncError};
