//! Batch orchestrator
//!
//! Scans the ledger for pending rows in bounded pages and drives the matching
//! reconciler for each one. A failing (or panicking) row is recorded in the
//! report and never stops the rest of the batch.
//!
//! Order within a run:
//!
//! 1. `pending_remote` contacts
//! 2. `pending_remote` appointments (their contacts were just reconciled)
//! 3. `pending_local` contacts, then appointments, through the bridge

use super::appointment::ensure_remote_appointment;
use super::bridge::{pull_remote_appointment, pull_remote_contact};
use super::contact::ensure_remote_contact;
use super::metrics;
use super::session::TenantSession;
use crate::config::validation::PAGE_SIZE_RANGE;
use crate::config::OrchestratorConfig;
use crate::error::ErrorCode;
use crate::ledger::{EntityKind, SyncStatus};
use crate::{Result, SyncError};
use futures::future::join_all;
use futures::FutureExt;
use serde::Serialize;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// One row that failed during a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowError {
    pub entity: EntityKind,
    pub local_id: String,
    pub code: String,
    pub message: String,
}

/// Outcome of one orchestrator run for one tenant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub tenant_id: String,
    pub synced_count: usize,
    /// Rows left alone because their kind of sync is off or has no DMS adapter
    pub skipped_count: usize,
    pub errors: Vec<RowError>,
    /// Set when a credential failure stopped the run early
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
    pub duration_ms: u64,
}

impl BatchReport {
    fn new(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            ..Default::default()
        }
    }

    /// Total rows looked at
    pub fn processed(&self) -> usize {
        self.synced_count + self.errors.len()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// A row picked up from the ledger
struct PendingRow {
    id: i64,
    local_id: String,
    remote_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Push,
    Pull,
}

/// Drives reconciliation over pending ledger rows
#[derive(Debug, Clone)]
pub struct BatchOrchestrator {
    page_size: u32,
    max_pages: u32,
}

impl Default for BatchOrchestrator {
    fn default() -> Self {
        Self::from_config(&OrchestratorConfig::default())
    }
}

impl BatchOrchestrator {
    /// Page size is clamped into [`PAGE_SIZE_RANGE`]
    pub fn new(page_size: u32, max_pages: u32) -> Self {
        Self {
            page_size: page_size.clamp(*PAGE_SIZE_RANGE.start(), *PAGE_SIZE_RANGE.end()),
            max_pages: max_pages.max(1),
        }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(config.page_size, config.max_pages_per_run)
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Run one batch for a tenant
    pub async fn run_batch(&self, session: &TenantSession) -> BatchReport {
        let started = Instant::now();
        let tenant_id = session.tenant_id();
        let mut report = BatchReport::new(tenant_id);
        info!(tenant = %tenant_id, "Starting sync batch");

        // Re-read the account each run so deactivation and key rotation apply
        session.crm.client().resolver().invalidate().await;

        for (entity, pass) in [
            (EntityKind::Contact, Pass::Push),
            (EntityKind::Appointment, Pass::Push),
            (EntityKind::Contact, Pass::Pull),
            (EntityKind::Appointment, Pass::Pull),
        ] {
            if let Err(e) = self.run_phase(session, entity, pass, &mut report).await {
                error!(tenant = %tenant_id, entity = %entity, "Failed to scan ledger: {}", e);
                report.errors.push(RowError {
                    entity,
                    local_id: String::new(),
                    code: e.code().to_string(),
                    message: e.to_string(),
                });
            }
            if report.aborted.is_some() {
                break;
            }
        }

        self.publish_pending(session);
        let elapsed = started.elapsed();
        metrics::record_batch_duration(tenant_id, elapsed.as_secs_f64());
        report.duration_ms = elapsed.as_millis() as u64;

        info!(
            tenant = %tenant_id,
            synced = report.synced_count,
            skipped = report.skipped_count,
            errors = report.errors.len(),
            duration_ms = report.duration_ms,
            "Sync batch complete"
        );
        report
    }

    /// Run batches for several tenants concurrently
    pub async fn run_tenants(&self, sessions: &[Arc<TenantSession>]) -> Vec<BatchReport> {
        join_all(sessions.iter().map(|session| self.run_batch(session))).await
    }

    async fn run_phase(
        &self,
        session: &TenantSession,
        entity: EntityKind,
        pass: Pass,
        report: &mut BatchReport,
    ) -> Result<()> {
        let status = match pass {
            Pass::Push => SyncStatus::PendingRemote,
            Pass::Pull => SyncStatus::PendingLocal,
        };
        let enabled = match entity {
            EntityKind::Contact => session.tenant.sync_contacts_enabled,
            EntityKind::Appointment => session.tenant.sync_appointments_enabled,
        };
        let runnable = enabled && (pass == Pass::Push || session.dms.is_some());

        let mut after_id = 0;
        for page in 0..self.max_pages {
            let rows = self.pending_page(session, entity, status, after_id)?;
            let Some(last) = rows.last() else {
                break;
            };
            after_id = last.id;
            let full_page = rows.len() as u32 == self.page_size;
            debug!(
                tenant = %session.tenant_id(),
                entity = %entity,
                status = %status,
                page,
                rows = rows.len(),
                "Processing ledger page"
            );

            if !runnable {
                report.skipped_count += rows.len();
            } else {
                for row in rows {
                    let outcome = match (entity, pass) {
                        (EntityKind::Contact, Pass::Push) => {
                            isolate(async {
                                ensure_remote_contact(session, &row.local_id).await.map(|_| ())
                            })
                            .await
                        }
                        (EntityKind::Appointment, Pass::Push) => {
                            isolate(async {
                                ensure_remote_appointment(session, &row.local_id)
                                    .await
                                    .map(|_| ())
                            })
                            .await
                        }
                        (EntityKind::Contact, Pass::Pull) => {
                            isolate(async {
                                let remote_id = require_remote_id(&row)?;
                                pull_remote_contact(session, remote_id).await.map(|_| ())
                            })
                            .await
                        }
                        (EntityKind::Appointment, Pass::Pull) => {
                            isolate(async {
                                let remote_id = require_remote_id(&row)?;
                                pull_remote_appointment(session, remote_id).await.map(|_| ())
                            })
                            .await
                        }
                    };

                    match outcome {
                        Ok(()) => report.synced_count += 1,
                        Err(e) => {
                            let code = e.code();
                            report.errors.push(RowError {
                                entity,
                                local_id: row.local_id.clone(),
                                code: code.to_string(),
                                message: e.to_string(),
                            });
                            if matches!(code, ErrorCode::NoAccount | ErrorCode::AuthFailed) {
                                warn!(
                                    tenant = %session.tenant_id(),
                                    code = %code,
                                    "Stopping batch, tenant credentials are unusable"
                                );
                                report.aborted = Some(code.to_string());
                                return Ok(());
                            }
                        }
                    }
                }
            }

            if !full_page {
                break;
            }
        }
        Ok(())
    }

    fn pending_page(
        &self,
        session: &TenantSession,
        entity: EntityKind,
        status: SyncStatus,
        after_id: i64,
    ) -> Result<Vec<PendingRow>> {
        let tenant_id = session.tenant_id();
        let rows = match entity {
            EntityKind::Contact => session
                .ledger
                .pending_contacts(tenant_id, status, after_id, self.page_size)?
                .into_iter()
                .map(|r| PendingRow {
                    id: r.id,
                    local_id: r.local_contact_id,
                    remote_id: r.remote_contact_id,
                })
                .collect(),
            EntityKind::Appointment => session
                .ledger
                .pending_appointments(tenant_id, status, after_id, self.page_size)?
                .into_iter()
                .map(|r| PendingRow {
                    id: r.id,
                    local_id: r.local_appointment_id,
                    remote_id: r.remote_event_id,
                })
                .collect(),
        };
        Ok(rows)
    }

    fn publish_pending(&self, session: &TenantSession) {
        match session.ledger.status_counts(session.tenant_id()) {
            Ok(counts) => {
                for entity in [EntityKind::Contact, EntityKind::Appointment] {
                    metrics::set_pending_rows(
                        session.tenant_id(),
                        entity.as_str(),
                        counts.pending(entity),
                    );
                }
            }
            Err(e) => warn!(tenant = %session.tenant_id(), "Failed to count pending rows: {}", e),
        }
    }
}

fn require_remote_id(row: &PendingRow) -> Result<&str> {
    row.remote_id.as_deref().ok_or_else(|| {
        SyncError::Validation(format!("pending-local row {} has no remote id", row.local_id))
    })
}

/// Run one row, turning a panic into an error
async fn isolate<F>(fut: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!("Row reconciliation panicked: {}", message);
            Err(SyncError::Other(format!("panicked: {}", message)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{AppointmentType, LocalContact, RecordStore, SyncDirection};
    use crate::remote::ApiResponse;
    use crate::sync::bridge::{queue_remote_appointment, queue_remote_contact};
    use crate::sync::testing::{api_key_session, appointment, contact_json, event_json, RecordingDms};
    use reqwest::Method;
    use serde_json::json;

    fn enqueue(session: &TenantSession, contact: LocalContact) {
        session.records.upsert_contact("d1", &contact).unwrap();
        session
            .ledger
            .enqueue_contact("d1", &contact.id, contact.email(), contact.phone())
            .unwrap();
    }

    #[test]
    fn test_page_size_is_clamped() {
        assert_eq!(BatchOrchestrator::new(10, 1).page_size(), 50);
        assert_eq!(BatchOrchestrator::new(500, 1).page_size(), 100);
        assert_eq!(BatchOrchestrator::new(75, 1).page_size(), 75);
        assert_eq!(BatchOrchestrator::new(75, 0).max_pages, 1);
    }

    #[tokio::test]
    async fn test_failures_are_isolated_per_row() {
        let (session, transport) = api_key_session();
        enqueue(&session, LocalContact::new("c1").with_email("a@b.com"));
        enqueue(&session, LocalContact::new("c2"));
        enqueue(&session, LocalContact::new("c3").with_phone("555-0100"));
        transport.respond_json(Method::POST, "/contacts/search", 200, json!({"contacts": []}));
        transport.respond_json(Method::POST, "/contacts/", 200, json!({"contact": contact_json("R1")}));

        let report = BatchOrchestrator::default().run_batch(&session).await;
        assert_eq!(report.synced_count, 2);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].local_id, "c2");
        assert_eq!(report.errors[0].code, "VALIDATION");
        assert!(report.aborted.is_none());
    }

    #[tokio::test]
    async fn test_contacts_run_before_appointments() {
        let (session, transport) = api_key_session();
        enqueue(&session, LocalContact::new("c1").with_email("a@b.com"));
        let appt = appointment("a1", "c1", AppointmentType::Sales);
        session.records.upsert_appointment("d1", &appt).unwrap();
        session.ledger.enqueue_appointment("d1", &appt).unwrap();

        transport.respond_json(Method::POST, "/contacts/search", 200, json!({"contacts": [contact_json("R1")]}));
        transport.respond_json(
            Method::POST,
            "/calendars/events/appointments",
            200,
            event_json("E1", "cal-sales", "R1"),
        );

        let report = BatchOrchestrator::default().run_batch(&session).await;
        assert_eq!(report.synced_count, 2, "{:?}", report.errors);
        let record = session.ledger.get_appointment_record("d1", "a1").unwrap().unwrap();
        assert_eq!(record.remote_event_id.as_deref(), Some("E1"));
    }

    #[tokio::test]
    async fn test_rate_limited_rows_stay_pending() {
        let (session, transport) = api_key_session();
        enqueue(&session, LocalContact::new("c1").with_email("a@b.com"));
        transport.respond(Method::POST, "/contacts/search", ApiResponse::new(429, ""));

        let report = BatchOrchestrator::default().run_batch(&session).await;
        assert_eq!(report.errors[0].code, "RATE_LIMITED");
        let record = session.ledger.get_contact_record("d1", "c1").unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::PendingRemote);

        // Picked up again on the next run; the queued 429 is answered by one retry
        transport.respond_json(Method::POST, "/contacts/search", 200, json!({"contacts": [contact_json("R1")]}));
        let report = BatchOrchestrator::default().run_batch(&session).await;
        assert_eq!(report.synced_count, 1);
    }

    #[tokio::test]
    async fn test_disabled_appointments_are_skipped() {
        let (mut session, transport) = api_key_session();
        session.tenant.sync_appointments_enabled = false;
        let appt = appointment("a1", "c1", AppointmentType::Sales);
        session.ledger.enqueue_appointment("d1", &appt).unwrap();

        let report = BatchOrchestrator::default().run_batch(&session).await;
        assert_eq!(report.skipped_count, 1);
        assert_eq!(transport.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_account_aborts_batch() {
        let (session, transport) = api_key_session();
        session.ledger.deactivate_account("d1").unwrap();
        enqueue(&session, LocalContact::new("c1").with_email("a@b.com"));
        enqueue(&session, LocalContact::new("c2").with_email("b@b.com"));

        let report = BatchOrchestrator::default().run_batch(&session).await;
        assert_eq!(report.aborted.as_deref(), Some("NO_ACCOUNT"));
        assert_eq!(report.errors.len(), 1);
        assert_eq!(transport.total_calls(), 0);
        let untouched = session.ledger.get_contact_record("d1", "c2").unwrap().unwrap();
        assert_eq!(untouched.sync_status, SyncStatus::PendingRemote);
    }

    #[tokio::test]
    async fn test_deactivation_between_batches_aborts() {
        let (session, transport) = api_key_session();
        enqueue(&session, LocalContact::new("c1").with_email("a@b.com"));
        transport.respond_json(Method::POST, "/contacts/search", 200, json!({"contacts": [contact_json("R1")]}));

        let first = BatchOrchestrator::default().run_batch(&session).await;
        assert_eq!(first.synced_count, 1);
        let calls = transport.total_calls();

        session.ledger.deactivate_account("d1").unwrap();
        enqueue(&session, LocalContact::new("c2").with_email("b@b.com"));

        let second = BatchOrchestrator::default().run_batch(&session).await;
        assert_eq!(second.aborted.as_deref(), Some("NO_ACCOUNT"));
        assert_eq!(second.synced_count, 0);
        assert_eq!(transport.total_calls(), calls);
    }

    #[tokio::test]
    async fn test_pending_local_rows_go_through_bridge() {
        let (session, transport) = api_key_session();
        let dms = Arc::new(RecordingDms::default());
        let session = session.with_dms(dms.clone());
        session.records.upsert_contact("d1", &LocalContact::new("c1")).unwrap();
        session
            .ledger
            .link_contact("d1", "c1", "R1", SyncDirection::LocalToRemote)
            .unwrap();
        session.ledger.mark_contact_pending_local("d1", "R1").unwrap();
        transport.respond_json(Method::GET, "/contacts/R1", 200, json!({"contact": contact_json("R1")}));

        let report = BatchOrchestrator::default().run_batch(&session).await;
        assert_eq!(report.synced_count, 1);
        assert_eq!(dms.contact_writes().len(), 1);
        let record = session.ledger.get_contact_record("d1", "c1").unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_queued_unknown_remote_records_reach_dms() {
        let (session, transport) = api_key_session();
        let dms = Arc::new(RecordingDms::default());
        let session = session.with_dms(dms.clone());
        queue_remote_contact(&session, "R9").unwrap();
        queue_remote_appointment(&session, "E9").unwrap();
        transport.respond_json(Method::GET, "/contacts/R9", 200, json!({"contact": contact_json("R9")}));
        transport.respond_json(
            Method::GET,
            "/calendars/events/appointments/E9",
            200,
            json!({"appointment": event_json("E9", "cal-sales", "R9")}),
        );

        let report = BatchOrchestrator::default().run_batch(&session).await;
        assert_eq!(report.synced_count, 2, "{:?}", report.errors);
        assert_eq!(dms.contact_writes().len(), 1);
        assert_eq!(dms.appointment_writes().len(), 1);
        assert_eq!(dms.appointment_writes()[0].1.contact_id, "dms-c1");

        let counts = session.ledger.status_counts("d1").unwrap();
        assert_eq!(counts.pending(EntityKind::Contact), 0);
        assert_eq!(counts.pending(EntityKind::Appointment), 0);
        let event = session.ledger.find_appointment_by_remote_id("d1", "E9").unwrap().unwrap();
        assert_eq!(event.local_appointment_id, "dms-a1");
        assert_eq!(event.local_contact_id, "dms-c1");
    }

    #[tokio::test]
    async fn test_paging_covers_every_row() {
        let (session, transport) = api_key_session();
        for i in 0..120 {
            enqueue(&session, LocalContact::new(format!("c{}", i)).with_email(format!("{}@b.com", i)));
            transport.respond_json(
                Method::POST,
                "/contacts/search",
                200,
                json!({"contacts": [contact_json(&format!("R{}", i))]}),
            );
        }

        let report = BatchOrchestrator::new(50, 10).run_batch(&session).await;
        assert_eq!(report.synced_count, 120);
        assert_eq!(session.ledger.status_counts("d1").unwrap().pending(EntityKind::Contact), 0);
    }

    #[tokio::test]
    async fn test_panicking_row_is_isolated() {
        let result = isolate(async { panic!("boom") }).await;
        let err = result.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Internal);
        assert!(err.to_string().contains("boom"));
    }
}
