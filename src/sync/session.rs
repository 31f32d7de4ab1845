//! Per-tenant session
//!
//! Everything a reconciliation needs for one tenant, built once and passed to
//! every operation: tenant settings, the ledger, the local record store, the
//! remote CRM API (with its own credential cache) and the DMS adapter.

use super::locks::ContactLocks;
use crate::auth::{CredentialResolver, OAuthClient};
use crate::config::{SyncConfig, TenantConfig};
use crate::ledger::{ActivityAction, EntityKind, RecordStore, SyncActivity, SyncLedger};
use crate::remote::{ApiClient, CrmApi, DmsAdapter, RetryConfig, Transport};
use std::sync::Arc;
use tracing::warn;

/// Default transient failures tolerated before a row is marked `error`
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

pub struct TenantSession {
    pub tenant: TenantConfig,
    pub ledger: Arc<SyncLedger>,
    pub records: Arc<dyn RecordStore>,
    pub crm: CrmApi,
    pub dms: Option<Arc<dyn DmsAdapter>>,
    pub locks: Arc<ContactLocks>,
    pub max_attempts: u32,
}

impl TenantSession {
    /// Session whose local records live in the ledger database
    pub fn new(tenant: TenantConfig, ledger: Arc<SyncLedger>, crm: CrmApi) -> Self {
        Self {
            tenant,
            records: ledger.clone(),
            ledger,
            crm,
            dms: None,
            locks: Arc::new(ContactLocks::new()),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_records(mut self, records: Arc<dyn RecordStore>) -> Self {
        self.records = records;
        self
    }

    pub fn with_dms(mut self, dms: Arc<dyn DmsAdapter>) -> Self {
        self.dms = Some(dms);
        self
    }

    /// Share contact locks with other sessions
    pub fn with_locks(mut self, locks: Arc<ContactLocks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant.tenant_id
    }

    /// Append to the activity trail; failures are logged, never raised
    pub(crate) fn activity(
        &self,
        entity: EntityKind,
        local_id: &str,
        remote_id: Option<&str>,
        action: ActivityAction,
        message: impl Into<String>,
    ) {
        let mut activity = SyncActivity::new(self.tenant_id(), entity, local_id, action, message);
        if let Some(remote_id) = remote_id {
            activity = activity.with_remote_id(remote_id);
        }
        if let Err(e) = self.ledger.record_activity(&activity) {
            warn!(
                tenant = %self.tenant_id(),
                local_id,
                action = %action,
                "Failed to record sync activity: {}",
                e
            );
        }
    }
}

/// Build one session for a configured tenant
pub fn build_session(
    config: &SyncConfig,
    tenant: &TenantConfig,
    ledger: Arc<SyncLedger>,
    transport: Arc<dyn Transport>,
    oauth: Option<Arc<OAuthClient>>,
    dms: Option<Arc<dyn DmsAdapter>>,
    locks: Arc<ContactLocks>,
) -> TenantSession {
    let resolver = Arc::new(
        CredentialResolver::new(&tenant.tenant_id, ledger.clone(), oauth)
            .with_refresh_skew(config.retry.refresh_skew_secs),
    );

    let mut client = ApiClient::new(&config.remote.base_url, transport, resolver)
        .with_retry(RetryConfig::from_settings(&config.retry))
        .with_call_log(ledger.clone());
    if let Some(ref version) = config.remote.api_version {
        client = client.with_api_version(version.as_str());
    }

    let mut session = TenantSession::new(tenant.clone(), ledger, CrmApi::new(client))
        .with_locks(locks)
        .with_max_attempts(config.orchestrator.max_attempts);
    if let Some(dms) = dms {
        session = session.with_dms(dms);
    }
    session
}

/// Build sessions for every configured tenant, sharing one lock table
pub fn build_sessions(
    config: &SyncConfig,
    ledger: Arc<SyncLedger>,
    transport: Arc<dyn Transport>,
    dms: Option<Arc<dyn DmsAdapter>>,
) -> Vec<Arc<TenantSession>> {
    let oauth = config.oauth.as_ref().map(|app| {
        Arc::new(OAuthClient::new(
            app.clone(),
            &config.remote.base_url,
            transport.clone(),
        ))
    });
    let locks = Arc::new(ContactLocks::new());

    config
        .tenants
        .iter()
        .map(|tenant| {
            Arc::new(build_session(
                config,
                tenant,
                ledger.clone(),
                transport.clone(),
                oauth.clone(),
                dms.clone(),
                locks.clone(),
            ))
        })
        .collect()
}
