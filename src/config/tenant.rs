//! Tenant configuration
//!
//! One dealership tenant: which kinds of sync are switched on, which remote
//! calendar each appointment type lands on, and the tags stamped on contacts
//! this engine creates remotely.

use crate::ledger::AppointmentType;
use serde::{Deserialize, Serialize};

/// Remote calendar ids per appointment type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarMapping {
    /// Sales department calendar
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sales: Option<String>,

    /// Service department calendar
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,

    /// Test drive calendar (falls back to the sales calendar when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_drive: Option<String>,
}

impl CalendarMapping {
    /// Calendar an appointment of this type is written to
    pub fn calendar_for(&self, appointment_type: AppointmentType) -> Option<&str> {
        match appointment_type {
            AppointmentType::Sales => self.sales.as_deref(),
            AppointmentType::Service => self.service.as_deref(),
            AppointmentType::TestDrive => self.test_drive.as_deref().or(self.sales.as_deref()),
        }
    }

    /// Infer the appointment type of an event from the calendar it lives on
    ///
    /// Service and test-drive calendars are matched explicitly; anything else is
    /// treated as a sales appointment.
    pub fn infer_type(&self, calendar_id: &str) -> AppointmentType {
        if self.service.as_deref() == Some(calendar_id) {
            AppointmentType::Service
        } else if self.test_drive.as_deref() == Some(calendar_id)
            && self.sales.as_deref() != Some(calendar_id)
        {
            AppointmentType::TestDrive
        } else {
            AppointmentType::Sales
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sales.is_none() && self.service.is_none() && self.test_drive.is_none()
    }
}

/// Per-tenant sync settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantConfig {
    /// Tenant identifier (dealership id)
    pub tenant_id: String,

    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Push local contacts to the remote CRM
    #[serde(default = "default_true")]
    pub sync_contacts_enabled: bool,

    /// Push local appointments to remote calendars
    #[serde(default)]
    pub sync_appointments_enabled: bool,

    /// Appointment type to calendar routing
    #[serde(default, skip_serializing_if = "CalendarMapping::is_empty")]
    pub calendars: CalendarMapping,

    /// Source tag on remotely created contacts
    #[serde(default = "default_source_tag")]
    pub source_tag: String,

    /// Lead-source tag on remotely created contacts
    #[serde(default = "default_lead_source_tag")]
    pub lead_source_tag: String,
}

fn default_true() -> bool {
    true
}

fn default_source_tag() -> String {
    "dealersync".to_string()
}

fn default_lead_source_tag() -> String {
    "dealership-crm".to_string()
}

impl TenantConfig {
    /// Create a tenant with contact sync on and appointment sync off
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            name: None,
            sync_contacts_enabled: true,
            sync_appointments_enabled: false,
            calendars: CalendarMapping::default(),
            source_tag: default_source_tag(),
            lead_source_tag: default_lead_source_tag(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Enable or disable contact sync
    pub fn with_contact_sync(mut self, enabled: bool) -> Self {
        self.sync_contacts_enabled = enabled;
        self
    }

    /// Enable or disable appointment sync
    pub fn with_appointment_sync(mut self, enabled: bool) -> Self {
        self.sync_appointments_enabled = enabled;
        self
    }

    /// Route an appointment type to a remote calendar
    pub fn with_calendar(
        mut self,
        appointment_type: AppointmentType,
        calendar_id: impl Into<String>,
    ) -> Self {
        let calendar_id = Some(calendar_id.into());
        match appointment_type {
            AppointmentType::Sales => self.calendars.sales = calendar_id,
            AppointmentType::Service => self.calendars.service = calendar_id,
            AppointmentType::TestDrive => self.calendars.test_drive = calendar_id,
        }
        self
    }

    pub fn with_tags(mut self, source: impl Into<String>, lead_source: impl Into<String>) -> Self {
        self.source_tag = source.into();
        self.lead_source_tag = lead_source.into();
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.tenant_id)
    }
}
