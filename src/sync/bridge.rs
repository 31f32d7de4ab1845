//! Remote to DMS bridge
//!
//! Pulls remote CRM contacts and events into the DMS. The ledger is looked up
//! by remote id first, so a record that was pushed from the local side is
//! updated in place instead of being created a second time.
//!
//! Remote ids the ledger has never seen are queued under a placeholder local
//! id. The placeholder row carries failures and retries until the DMS assigns
//! a real id, then it is rekeyed onto that id.

use super::metrics;
use super::session::TenantSession;
use crate::ledger::{
    placeholder_local_id, ActivityAction, AppointmentSyncRecord, ContactSyncRecord, EntityKind,
    LocalAppointment, LocalContact, SyncDirection,
};
use crate::remote::{DmsAdapter, RemoteContact};
use crate::{Result, SyncError};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of pulling one remote record into the DMS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pulled {
    pub local_id: String,
    pub remote_id: String,
    /// A new DMS record was created rather than an existing one updated
    pub created: bool,
}

fn dms(session: &TenantSession) -> Result<Arc<dyn DmsAdapter>> {
    session
        .dms
        .clone()
        .ok_or_else(|| SyncError::Config("no DMS adapter configured".into()))
}

/// Pull a remote contact into the DMS
pub async fn pull_remote_contact(session: &TenantSession, remote_contact_id: &str) -> Result<Pulled> {
    if !session.tenant.sync_contacts_enabled {
        return Err(SyncError::NotEnabled("contact"));
    }
    let dms = dms(session)?;
    let tenant_id = session.tenant_id();

    // Keyed by remote id, the local id may not exist yet
    let lock_key = format!("remote:{}", remote_contact_id);
    let _guard = session.locks.lock(tenant_id, &lock_key).await;

    let existing = session.ledger.find_contact_by_remote_id(tenant_id, remote_contact_id)?;
    let result = pull_contact(
        session,
        dms.as_ref(),
        remote_contact_id,
        existing
            .as_ref()
            .filter(|r| !r.is_placeholder())
            .map(|r| r.local_contact_id.as_str()),
    )
    .await;

    match &result {
        Ok(pulled) => {
            metrics::record_reconcile("contact", "pulled");
            session.activity(
                EntityKind::Contact,
                &pulled.local_id,
                Some(remote_contact_id),
                ActivityAction::Pulled,
                if pulled.created { "created in DMS" } else { "updated in DMS" },
            );
        }
        Err(e) => {
            metrics::record_reconcile("contact", &e.code().to_string());
            warn!(
                tenant = %tenant_id,
                remote_id = remote_contact_id,
                "Failed to pull remote contact: {}",
                e
            );
            if let Some(record) = existing {
                if let Err(err) = session.ledger.record_contact_failure(
                    tenant_id,
                    &record.local_contact_id,
                    e.code(),
                    &e.to_string(),
                    session.max_attempts,
                ) {
                    warn!("Failed to record contact failure: {}", err);
                }
                session.activity(
                    EntityKind::Contact,
                    &record.local_contact_id,
                    Some(remote_contact_id),
                    ActivityAction::Failed,
                    format!("{}: {}", e.code(), e),
                );
            }
        }
    }
    result
}

async fn pull_contact(
    session: &TenantSession,
    dms: &dyn DmsAdapter,
    remote_contact_id: &str,
    local_id: Option<&str>,
) -> Result<Pulled> {
    let tenant_id = session.tenant_id();
    let remote = session.crm.get_contact(remote_contact_id).await?;

    let (local_id, created) = match local_id {
        Some(local_id) => {
            let contact = local_from_remote(local_id, &remote);
            dms.update_contact(tenant_id, &contact).await?;
            session.records.upsert_contact(tenant_id, &contact)?;
            session.ledger.mark_contact_synced(tenant_id, local_id)?;
            (local_id.to_string(), false)
        }
        None => {
            let draft = local_from_remote("", &remote);
            let dms_id = dms.create_contact(tenant_id, &draft).await?;
            let contact = LocalContact { id: dms_id.clone(), ..draft };
            session.records.upsert_contact(tenant_id, &contact)?;
            session.ledger.rekey_contact(
                tenant_id,
                &placeholder_local_id(remote_contact_id),
                &dms_id,
            )?;
            session.ledger.link_contact(
                tenant_id,
                &dms_id,
                remote_contact_id,
                SyncDirection::RemoteToLocal,
            )?;
            info!(
                tenant = %tenant_id,
                local_contact_id = %dms_id,
                remote_id = remote_contact_id,
                "Created DMS contact from remote"
            );
            (dms_id, true)
        }
    };

    Ok(Pulled {
        local_id,
        remote_id: remote_contact_id.to_string(),
        created,
    })
}

/// Pull a remote calendar event into the DMS
///
/// The event's contact is pulled first when the ledger does not know it yet.
pub async fn pull_remote_appointment(
    session: &TenantSession,
    remote_event_id: &str,
) -> Result<Pulled> {
    if !session.tenant.sync_appointments_enabled {
        return Err(SyncError::NotEnabled("appointment"));
    }
    let dms = dms(session)?;
    let tenant_id = session.tenant_id();

    let existing = session.ledger.find_appointment_by_remote_id(tenant_id, remote_event_id)?;
    let result = pull_appointment(
        session,
        dms.as_ref(),
        remote_event_id,
        existing
            .as_ref()
            .filter(|r| !r.is_placeholder())
            .map(|r| r.local_appointment_id.as_str()),
    )
    .await;

    match &result {
        Ok(pulled) => {
            metrics::record_reconcile("appointment", "pulled");
            session.activity(
                EntityKind::Appointment,
                &pulled.local_id,
                Some(remote_event_id),
                ActivityAction::Pulled,
                if pulled.created { "created in DMS" } else { "updated in DMS" },
            );
        }
        Err(e) => {
            metrics::record_reconcile("appointment", &e.code().to_string());
            warn!(
                tenant = %tenant_id,
                remote_id = remote_event_id,
                "Failed to pull remote event: {}",
                e
            );
            if let Some(record) = existing {
                if let Err(err) = session.ledger.record_appointment_failure(
                    tenant_id,
                    &record.local_appointment_id,
                    e.code(),
                    &e.to_string(),
                    session.max_attempts,
                ) {
                    warn!("Failed to record appointment failure: {}", err);
                }
                session.activity(
                    EntityKind::Appointment,
                    &record.local_appointment_id,
                    Some(remote_event_id),
                    ActivityAction::Failed,
                    format!("{}: {}", e.code(), e),
                );
            }
        }
    }
    result
}

async fn pull_appointment(
    session: &TenantSession,
    dms: &dyn DmsAdapter,
    remote_event_id: &str,
    local_id: Option<&str>,
) -> Result<Pulled> {
    let tenant_id = session.tenant_id();
    let event = session.crm.get_event(remote_event_id).await?;
    let remote_contact_id = event.contact_id.clone().ok_or_else(|| {
        SyncError::Validation(format!("remote event {} has no contact", remote_event_id))
    })?;

    let local_contact_id = match session
        .ledger
        .find_contact_by_remote_id(tenant_id, &remote_contact_id)?
        .filter(|r| !r.is_placeholder())
    {
        Some(record) => record.local_contact_id,
        None => {
            debug!(
                tenant = %tenant_id,
                remote_id = %remote_contact_id,
                "Pulling unknown contact before its event"
            );
            pull_remote_contact(session, &remote_contact_id).await?.local_id
        }
    };

    let mut appointment = LocalAppointment {
        id: local_id.unwrap_or_default().to_string(),
        contact_id: local_contact_id,
        title: event.title.clone().unwrap_or_else(|| "Appointment".to_string()),
        start: event.start_time,
        end: event.end_time,
        status: event
            .appointment_status
            .clone()
            .unwrap_or_else(|| "confirmed".to_string()),
        appointment_type: session.tenant.calendars.infer_type(&event.calendar_id),
    };

    let created = match local_id {
        Some(_) => {
            dms.update_appointment(tenant_id, &appointment).await?;
            false
        }
        None => {
            appointment.id = dms.create_appointment(tenant_id, &appointment).await?;
            session.ledger.rekey_appointment(
                tenant_id,
                &placeholder_local_id(remote_event_id),
                &appointment.id,
            )?;
            true
        }
    };

    session.records.upsert_appointment(tenant_id, &appointment)?;
    session.ledger.link_appointment(
        tenant_id,
        &appointment,
        remote_event_id,
        &event.calendar_id,
        SyncDirection::RemoteToLocal,
    )?;

    Ok(Pulled {
        local_id: appointment.id,
        remote_id: remote_event_id.to_string(),
        created,
    })
}

/// Queue a remote contact change for the next pending-local pass
///
/// Works for contacts the ledger has never seen as well as linked ones.
pub fn queue_remote_contact(
    session: &TenantSession,
    remote_contact_id: &str,
) -> Result<ContactSyncRecord> {
    if !session.tenant.sync_contacts_enabled {
        return Err(SyncError::NotEnabled("contact"));
    }
    let record = session
        .ledger
        .mark_contact_pending_local(session.tenant_id(), remote_contact_id)?;
    debug!(
        tenant = %session.tenant_id(),
        remote_id = remote_contact_id,
        local_contact_id = %record.local_contact_id,
        "Queued remote contact"
    );
    Ok(record)
}

/// Queue a remote event change for the next pending-local pass
pub fn queue_remote_appointment(
    session: &TenantSession,
    remote_event_id: &str,
) -> Result<AppointmentSyncRecord> {
    if !session.tenant.sync_appointments_enabled {
        return Err(SyncError::NotEnabled("appointment"));
    }
    let record = session
        .ledger
        .mark_appointment_pending_local(session.tenant_id(), remote_event_id)?;
    debug!(
        tenant = %session.tenant_id(),
        remote_id = remote_event_id,
        local_appointment_id = %record.local_appointment_id,
        "Queued remote event"
    );
    Ok(record)
}

fn local_from_remote(local_id: &str, remote: &RemoteContact) -> LocalContact {
    LocalContact {
        id: local_id.to_string(),
        first_name: remote.first_name.clone(),
        last_name: remote.last_name.clone(),
        email: remote.email.clone(),
        phone: remote.phone.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{AppointmentType, RecordStore, SyncStatus};
    use crate::remote::TransportError;
    use crate::sync::testing::{api_key_session, event_json, linked_contact, RecordingDms};
    use reqwest::Method;
    use serde_json::json;

    #[tokio::test]
    async fn test_unknown_remote_contact_is_created_in_dms() {
        let (session, transport) = api_key_session();
        let dms = Arc::new(RecordingDms::default());
        let session = session.with_dms(dms.clone());
        transport.respond_json(
            Method::GET,
            "/contacts/R9",
            200,
            json!({"contact": {"id": "R9", "firstName": "Grace", "email": "g@h.com"}}),
        );

        let pulled = pull_remote_contact(&session, "R9").await.unwrap();
        assert!(pulled.created);
        assert_eq!(pulled.local_id, "dms-c1");

        let record = session.ledger.get_contact_record("d1", "dms-c1").unwrap().unwrap();
        assert_eq!(record.remote_contact_id.as_deref(), Some("R9"));
        assert_eq!(record.sync_direction, SyncDirection::RemoteToLocal);
        let local = session.records.get_contact("d1", "dms-c1").unwrap().unwrap();
        assert_eq!(local.email.as_deref(), Some("g@h.com"));
    }

    #[tokio::test]
    async fn test_known_remote_contact_is_updated_not_created() {
        let (session, transport) = api_key_session();
        let dms = Arc::new(RecordingDms::default());
        let session = session.with_dms(dms.clone());
        linked_contact(&session, "c1", "R1");
        transport.respond_json(
            Method::GET,
            "/contacts/R1",
            200,
            json!({"contact": {"id": "R1", "email": "changed@b.com"}}),
        );

        let first = pull_remote_contact(&session, "R1").await.unwrap();
        let second = pull_remote_contact(&session, "R1").await.unwrap();
        assert!(!first.created && !second.created);
        assert_eq!(first.local_id, "c1");

        let writes = dms.contact_writes();
        assert_eq!(writes.len(), 2);
        assert!(writes.iter().all(|(op, _)| op == "update"));
        assert_eq!(
            session.records.get_contact("d1", "c1").unwrap().unwrap().email.as_deref(),
            Some("changed@b.com")
        );
    }

    #[tokio::test]
    async fn test_pull_event_infers_type_and_pulls_contact() {
        let (session, transport) = api_key_session();
        let dms = Arc::new(RecordingDms::default());
        let session = session.with_dms(dms.clone());
        transport.respond_json(
            Method::GET,
            "/calendars/events/appointments/E1",
            200,
            json!({"appointment": event_json("E1", "cal-service", "R5")}),
        );
        transport.respond_json(Method::GET, "/contacts/R5", 200, json!({"contact": {"id": "R5"}}));

        let pulled = pull_remote_appointment(&session, "E1").await.unwrap();
        assert!(pulled.created);

        let appointments = dms.appointment_writes();
        assert_eq!(appointments.len(), 1);
        assert_eq!(appointments[0].1.appointment_type, AppointmentType::Service);
        assert_eq!(appointments[0].1.contact_id, "dms-c1");

        let record = session
            .ledger
            .find_appointment_by_remote_id("d1", "E1")
            .unwrap()
            .unwrap();
        assert_eq!(record.local_appointment_id, pulled.local_id);
        assert_eq!(record.sync_status, SyncStatus::Synced);

        // Second pull recognises the pair
        let again = pull_remote_appointment(&session, "E1").await.unwrap();
        assert!(!again.created);
        assert_eq!(dms.appointment_writes().len(), 2);
        assert_eq!(transport.calls(Method::GET, "/contacts/R5"), 1);
    }

    #[tokio::test]
    async fn test_dms_failure_is_recorded() {
        let (session, transport) = api_key_session();
        let session = session.with_dms(Arc::new(RecordingDms::failing()));
        linked_contact(&session, "c1", "R1");
        queue_remote_contact(&session, "R1").unwrap();
        transport.respond_json(Method::GET, "/contacts/R1", 200, json!({"contact": {"id": "R1"}}));

        let err = pull_remote_contact(&session, "R1").await.unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::DmsError);
        let record = session.ledger.get_contact_record("d1", "c1").unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Error);
        assert!(record.sync_error.is_some());
    }

    #[tokio::test]
    async fn test_queued_unknown_contact_is_rekeyed_onto_dms_id() {
        let (session, transport) = api_key_session();
        let dms = Arc::new(RecordingDms::default());
        let session = session.with_dms(dms.clone());
        transport.respond_json(Method::GET, "/contacts/R9", 200, json!({"contact": {"id": "R9"}}));

        let queued = queue_remote_contact(&session, "R9").unwrap();
        assert!(queued.is_placeholder());

        let pulled = pull_remote_contact(&session, "R9").await.unwrap();
        assert!(pulled.created);
        assert_eq!(dms.contact_writes().len(), 1);

        let record = session.ledger.find_contact_by_remote_id("d1", "R9").unwrap().unwrap();
        assert_eq!(record.local_contact_id, "dms-c1");
        assert_eq!(record.sync_status, SyncStatus::Synced);
        assert!(session
            .ledger
            .get_contact_record("d1", &placeholder_local_id("R9"))
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_failed_pull_of_unknown_event_stays_queued() {
        let (session, transport) = api_key_session();
        let session = session.with_dms(Arc::new(RecordingDms::default()));
        transport.fail(
            Method::GET,
            "/calendars/events/appointments/E9",
            TransportError::Connect("refused".into()),
        );

        queue_remote_appointment(&session, "E9").unwrap();
        let err = pull_remote_appointment(&session, "E9").await.unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::NetworkError);

        let record = session
            .ledger
            .find_appointment_by_remote_id("d1", "E9")
            .unwrap()
            .unwrap();
        assert!(record.is_placeholder());
        assert_eq!(record.sync_status, SyncStatus::PendingLocal);
        assert_eq!(record.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_queue_respects_sync_flags() {
        let (mut session, _transport) = api_key_session();
        session.tenant.sync_appointments_enabled = false;
        let err = queue_remote_appointment(&session, "E1").unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::NotEnabled);
        assert!(session.ledger.find_appointment_by_remote_id("d1", "E1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_requires_dms_adapter() {
        let (session, transport) = api_key_session();
        let err = pull_remote_contact(&session, "R1").await.unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::Config);
        assert_eq!(transport.total_calls(), 0);
    }
}
