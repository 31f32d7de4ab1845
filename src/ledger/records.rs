//! Local record store
//!
//! The product's own contacts and appointments, consumed as a keyed CRUD store.

use crate::ledger::AppointmentType;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A contact as the local CRM holds it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalContact {
    pub id: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

impl LocalContact {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, first: impl Into<String>, last: impl Into<String>) -> Self {
        self.first_name = Some(first.into());
        self.last_name = Some(last.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    /// Email, trimmed, if non-empty
    pub fn email(&self) -> Option<&str> {
        non_empty(self.email.as_deref())
    }

    /// Phone, trimmed, if non-empty
    pub fn phone(&self) -> Option<&str> {
        non_empty(self.phone.as_deref())
    }

    pub fn has_identifiers(&self) -> bool {
        self.email().is_some() || self.phone().is_some()
    }

    pub fn full_name(&self) -> Option<String> {
        let parts: Vec<&str> = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .filter_map(non_empty)
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// An appointment as the local CRM holds it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalAppointment {
    pub id: String,
    pub contact_id: String,
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Free-form status, `cancelled` is treated specially
    pub status: String,
    pub appointment_type: AppointmentType,
}

impl LocalAppointment {
    pub fn is_cancelled(&self) -> bool {
        self.status.eq_ignore_ascii_case("cancelled") || self.status.eq_ignore_ascii_case("canceled")
    }
}

/// Keyed CRUD access to local records, scoped by tenant
pub trait RecordStore: Send + Sync {
    fn get_contact(&self, tenant_id: &str, contact_id: &str) -> Result<Option<LocalContact>>;
    fn upsert_contact(&self, tenant_id: &str, contact: &LocalContact) -> Result<()>;
    fn get_appointment(
        &self,
        tenant_id: &str,
        appointment_id: &str,
    ) -> Result<Option<LocalAppointment>>;
    fn upsert_appointment(&self, tenant_id: &str, appointment: &LocalAppointment) -> Result<()>;
}
