//! Appointment reconciliation
//!
//! An appointment is pushed to the calendar mapped to its type, and only once
//! its contact holds a verified remote link. Existing links are updated in
//! place; a link whose event is gone is cleared and the event recreated.

use super::metrics;
use super::session::TenantSession;
use crate::ledger::{ActivityAction, EntityKind, LocalAppointment, SyncDirection};
use crate::remote::EventPayload;
use crate::{Result, SyncError};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppointmentOutcome {
    Created,
    Updated,
    /// Cancelled locally before it ever reached the remote calendar
    Closed,
}

impl AppointmentOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentOutcome::Created => "created",
            AppointmentOutcome::Updated => "updated",
            AppointmentOutcome::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppointmentSync {
    pub local_appointment_id: String,
    pub remote_event_id: Option<String>,
    pub calendar_id: String,
    pub outcome: AppointmentOutcome,
    pub replaced: Option<String>,
}

/// Make sure a local appointment exists on its remote calendar
pub async fn ensure_remote_appointment(
    session: &TenantSession,
    local_appointment_id: &str,
) -> Result<AppointmentSync> {
    if !session.tenant.sync_appointments_enabled {
        metrics::record_reconcile("appointment", "not_enabled");
        return Err(SyncError::NotEnabled("appointment"));
    }

    let result = reconcile(session, local_appointment_id).await;
    match &result {
        Ok(sync) => metrics::record_reconcile("appointment", sync.outcome.as_str()),
        Err(e) => record_failure(session, local_appointment_id, e),
    }
    result
}

fn record_failure(session: &TenantSession, local_appointment_id: &str, e: &SyncError) {
    let code = e.code();
    metrics::record_reconcile("appointment", &code.to_string());
    warn!(
        tenant = %session.tenant_id(),
        local_appointment_id,
        code = %code,
        "Appointment reconciliation failed: {}",
        e
    );

    if let Err(store_err) = session.ledger.record_appointment_failure(
        session.tenant_id(),
        local_appointment_id,
        code,
        &e.to_string(),
        session.max_attempts,
    ) {
        warn!(local_appointment_id, "Failed to record appointment failure: {}", store_err);
    }
    session.activity(
        EntityKind::Appointment,
        local_appointment_id,
        None,
        ActivityAction::Failed,
        format!("{}: {}", code, e),
    );
}

async fn reconcile(session: &TenantSession, local_appointment_id: &str) -> Result<AppointmentSync> {
    let tenant_id = session.tenant_id();
    let appointment = session
        .records
        .get_appointment(tenant_id, local_appointment_id)?
        .ok_or_else(|| {
            SyncError::Validation(format!("local appointment {} not found", local_appointment_id))
        })?;
    let record = session.ledger.ensure_appointment_record(tenant_id, &appointment)?;

    let calendar_id = session
        .tenant
        .calendars
        .calendar_for(appointment.appointment_type)
        .ok_or_else(|| {
            SyncError::Validation(format!(
                "no calendar mapped for {} appointments",
                appointment.appointment_type
            ))
        })?
        .to_string();

    // Held until the event write lands so the contact link cannot be healed
    // to a different id underneath us
    let _guard = session.locks.lock(tenant_id, &appointment.contact_id).await;
    let remote_contact_id = linked_contact(session, &appointment.contact_id)?;

    let mut stale_id = None;
    if let Some(event_id) = record.remote_event_id {
        let payload = event_payload(session, &appointment, &calendar_id, &remote_contact_id).await?;
        match session.crm.update_event(&event_id, &payload).await {
            Ok(_) => {
                session.ledger.link_appointment(
                    tenant_id,
                    &appointment,
                    &event_id,
                    &calendar_id,
                    SyncDirection::LocalToRemote,
                )?;
                session.activity(
                    EntityKind::Appointment,
                    &appointment.id,
                    Some(&event_id),
                    ActivityAction::Updated,
                    format!("updated ({})", payload.appointment_status),
                );
                return Ok(AppointmentSync {
                    local_appointment_id: appointment.id.clone(),
                    remote_event_id: Some(event_id),
                    calendar_id,
                    outcome: AppointmentOutcome::Updated,
                    replaced: None,
                });
            }
            Err(e) if e.is_gone() => {
                session.ledger.clear_appointment_link(tenant_id, &appointment.id)?;
                session.activity(
                    EntityKind::Appointment,
                    &appointment.id,
                    Some(&event_id),
                    ActivityAction::Stale,
                    "stale, re-syncing",
                );
                stale_id = Some(event_id);
            }
            Err(e) => return Err(e),
        }
    }

    if appointment.is_cancelled() {
        session.ledger.mark_appointment_deleted(tenant_id, &appointment.id)?;
        session.activity(
            EntityKind::Appointment,
            &appointment.id,
            None,
            ActivityAction::Skipped,
            "cancelled before reaching the remote calendar",
        );
        return Ok(AppointmentSync {
            local_appointment_id: appointment.id.clone(),
            remote_event_id: None,
            calendar_id,
            outcome: AppointmentOutcome::Closed,
            replaced: stale_id,
        });
    }

    let payload = event_payload(session, &appointment, &calendar_id, &remote_contact_id).await?;
    let event = session.crm.create_event(&payload).await?;
    info!(
        tenant = %tenant_id,
        local_appointment_id = %appointment.id,
        remote_id = %event.id,
        calendar = %calendar_id,
        "Created remote event"
    );

    session.ledger.link_appointment(
        tenant_id,
        &appointment,
        &event.id,
        &calendar_id,
        SyncDirection::LocalToRemote,
    )?;
    if let Some(ref old) = stale_id {
        session.activity(
            EntityKind::Appointment,
            &appointment.id,
            Some(&event.id),
            ActivityAction::StaleReplaced,
            format!("stale id {} replaced by {}", old, event.id),
        );
    }
    session.activity(
        EntityKind::Appointment,
        &appointment.id,
        Some(&event.id),
        ActivityAction::Created,
        format!("created on {}", calendar_id),
    );

    Ok(AppointmentSync {
        local_appointment_id: appointment.id.clone(),
        remote_event_id: Some(event.id),
        calendar_id,
        outcome: AppointmentOutcome::Created,
        replaced: stale_id,
    })
}

/// Remove an appointment's remote event and close its ledger row
///
/// Returns the removed event id, or `None` if nothing was linked. An event
/// that is already gone counts as removed.
pub async fn delete_remote_appointment(
    session: &TenantSession,
    local_appointment_id: &str,
) -> Result<Option<String>> {
    if !session.tenant.sync_appointments_enabled {
        return Err(SyncError::NotEnabled("appointment"));
    }

    let tenant_id = session.tenant_id();
    let Some(record) = session.ledger.get_appointment_record(tenant_id, local_appointment_id)? else {
        return Ok(None);
    };
    let Some(event_id) = record.remote_event_id else {
        return Ok(None);
    };

    match session.crm.delete_event(&event_id).await {
        Ok(()) => {}
        Err(e) if e.is_gone() => {
            warn!(tenant = %tenant_id, remote_id = %event_id, "Remote event already gone");
        }
        Err(e) => {
            record_failure(session, local_appointment_id, &e);
            return Err(e);
        }
    }

    session.ledger.mark_appointment_deleted(tenant_id, local_appointment_id)?;
    session.activity(
        EntityKind::Appointment,
        local_appointment_id,
        Some(&event_id),
        ActivityAction::Deleted,
        "deleted",
    );
    metrics::record_reconcile("appointment", "deleted");
    Ok(Some(event_id))
}

/// Verified remote id of the appointment's contact
fn linked_contact(session: &TenantSession, local_contact_id: &str) -> Result<String> {
    session
        .ledger
        .get_contact_record(session.tenant_id(), local_contact_id)?
        .filter(|record| record.is_linked())
        .and_then(|record| record.remote_contact_id)
        .ok_or_else(|| SyncError::ContactNotSynced(local_contact_id.to_string()))
}

async fn event_payload(
    session: &TenantSession,
    appointment: &LocalAppointment,
    calendar_id: &str,
    remote_contact_id: &str,
) -> Result<EventPayload> {
    Ok(EventPayload {
        calendar_id: calendar_id.to_string(),
        location_id: session.crm.location_id().await?,
        contact_id: remote_contact_id.to_string(),
        title: appointment.title.clone(),
        start_time: appointment.start,
        end_time: appointment.end,
        appointment_status: remote_status(appointment),
    })
}

fn remote_status(appointment: &LocalAppointment) -> String {
    if appointment.is_cancelled() {
        "cancelled".to_string()
    } else if appointment.status.trim().is_empty() {
        "confirmed".to_string()
    } else {
        appointment.status.trim().to_ascii_lowercase()
    }
}
