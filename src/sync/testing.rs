//! Shared fixtures for sync tests

use super::session::TenantSession;
use crate::auth::{CredentialResolver, CrmAccount, Credentials};
use crate::config::TenantConfig;
use crate::ledger::{AppointmentType, LocalAppointment, LocalContact, SyncLedger};
use crate::remote::{ApiClient, CrmApi, DmsAdapter, RetryConfig, ScriptedTransport};
use crate::{Result, SyncError};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

/// Tenant `d1` on an API key, appointment sync on, sales and service calendars
pub fn api_key_session() -> (TenantSession, Arc<ScriptedTransport>) {
    let ledger = Arc::new(SyncLedger::in_memory().unwrap());
    ledger
        .upsert_account(&CrmAccount::new("d1", Credentials::api_key("key", "loc-1")))
        .unwrap();

    let transport = Arc::new(ScriptedTransport::new());
    let resolver = Arc::new(CredentialResolver::new("d1", ledger.clone(), None));
    let client = ApiClient::new("https://crm.test", transport.clone(), resolver)
        .with_retry(RetryConfig::quick())
        .with_call_log(ledger.clone());

    let tenant = TenantConfig::new("d1")
        .with_appointment_sync(true)
        .with_calendar(AppointmentType::Sales, "cal-sales")
        .with_calendar(AppointmentType::Service, "cal-service");

    (
        TenantSession::new(tenant, ledger, CrmApi::new(client)),
        transport,
    )
}

pub fn contact_json(id: &str) -> Value {
    json!({"id": id, "email": "a@b.com"})
}

pub fn event_json(id: &str, calendar_id: &str, contact_id: &str) -> Value {
    json!({
        "id": id,
        "calendarId": calendar_id,
        "contactId": contact_id,
        "title": "Visit",
        "startTime": "2026-11-02T15:00:00Z",
        "endTime": "2026-11-02T16:00:00Z",
        "appointmentStatus": "confirmed"
    })
}

pub fn start() -> DateTime<Utc> {
    "2026-11-02T15:00:00Z".parse().unwrap()
}

pub fn appointment(id: &str, contact_id: &str, appointment_type: AppointmentType) -> LocalAppointment {
    LocalAppointment {
        id: id.to_string(),
        contact_id: contact_id.to_string(),
        title: "Visit".to_string(),
        start: start(),
        end: start() + Duration::hours(1),
        status: "confirmed".to_string(),
        appointment_type,
    }
}

/// Seed a local contact already linked to a remote id
pub fn linked_contact(session: &TenantSession, local_id: &str, remote_id: &str) {
    use crate::ledger::{RecordStore, SyncDirection};

    session
        .records
        .upsert_contact(
            session.tenant_id(),
            &LocalContact::new(local_id).with_email("a@b.com"),
        )
        .unwrap();
    session
        .ledger
        .link_contact(session.tenant_id(), local_id, remote_id, SyncDirection::LocalToRemote)
        .unwrap();
}

/// In-memory DMS recording every write
#[derive(Default)]
pub struct RecordingDms {
    pub contacts: Mutex<Vec<(String, LocalContact)>>,
    pub appointments: Mutex<Vec<(String, LocalAppointment)>>,
    pub fail: bool,
}

impl RecordingDms {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn contact_writes(&self) -> Vec<(String, LocalContact)> {
        self.contacts.lock().unwrap().clone()
    }

    pub fn appointment_writes(&self) -> Vec<(String, LocalAppointment)> {
        self.appointments.lock().unwrap().clone()
    }

    fn check(&self) -> Result<()> {
        if self.fail {
            Err(SyncError::Dms("adapter unavailable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DmsAdapter for RecordingDms {
    async fn create_contact(&self, _tenant_id: &str, contact: &LocalContact) -> Result<String> {
        self.check()?;
        let mut contacts = self.contacts.lock().unwrap();
        contacts.push(("create".into(), contact.clone()));
        Ok(format!("dms-c{}", contacts.len()))
    }

    async fn update_contact(&self, _tenant_id: &str, contact: &LocalContact) -> Result<()> {
        self.check()?;
        self.contacts
            .lock()
            .unwrap()
            .push(("update".into(), contact.clone()));
        Ok(())
    }

    async fn create_appointment(
        &self,
        _tenant_id: &str,
        appointment: &LocalAppointment,
    ) -> Result<String> {
        self.check()?;
        let mut appointments = self.appointments.lock().unwrap();
        appointments.push(("create".into(), appointment.clone()));
        Ok(format!("dms-a{}", appointments.len()))
    }

    async fn update_appointment(
        &self,
        _tenant_id: &str,
        appointment: &LocalAppointment,
    ) -> Result<()> {
        self.check()?;
        self.appointments
            .lock()
            .unwrap()
            .push(("update".into(), appointment.clone()));
        Ok(())
    }
}
