//! Sync ledger row types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Reconciliation state of a ledger row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Local change waiting to be written to the remote CRM
    PendingRemote,
    /// Remote change waiting to be written to the DMS
    PendingLocal,
    /// Last write succeeded
    Synced,
    /// Last write failed permanently (see `sync_error`)
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::PendingRemote => "pending_remote",
            SyncStatus::PendingLocal => "pending_local",
            SyncStatus::Synced => "synced",
            SyncStatus::Error => "error",
        }
    }

    pub fn all() -> [SyncStatus; 4] {
        [
            SyncStatus::PendingRemote,
            SyncStatus::PendingLocal,
            SyncStatus::Synced,
            SyncStatus::Error,
        ]
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, SyncStatus::PendingRemote | SyncStatus::PendingLocal)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_remote" => Ok(SyncStatus::PendingRemote),
            "pending_local" => Ok(SyncStatus::PendingLocal),
            "synced" => Ok(SyncStatus::Synced),
            "error" => Ok(SyncStatus::Error),
            other => Err(format!("unknown sync status: {}", other)),
        }
    }
}

/// Which side last originated a change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    LocalToRemote,
    RemoteToLocal,
}

impl SyncDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncDirection::LocalToRemote => "local_to_remote",
            SyncDirection::RemoteToLocal => "remote_to_local",
        }
    }
}

impl FromStr for SyncDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local_to_remote" => Ok(SyncDirection::LocalToRemote),
            "remote_to_local" => Ok(SyncDirection::RemoteToLocal),
            other => Err(format!("unknown sync direction: {}", other)),
        }
    }
}

/// Department an appointment belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentType {
    #[default]
    Sales,
    Service,
    TestDrive,
}

impl AppointmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentType::Sales => "sales",
            AppointmentType::Service => "service",
            AppointmentType::TestDrive => "test_drive",
        }
    }
}

impl fmt::Display for AppointmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppointmentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "sales" => Ok(AppointmentType::Sales),
            "service" => Ok(AppointmentType::Service),
            "test_drive" | "testdrive" => Ok(AppointmentType::TestDrive),
            other => Err(format!("unknown appointment type: {}", other)),
        }
    }
}

/// Entity a ledger row or activity refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Contact,
    Appointment,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Contact => "contact",
            EntityKind::Appointment => "appointment",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "contact" => Ok(EntityKind::Contact),
            "appointment" => Ok(EntityKind::Appointment),
            other => Err(format!("unknown entity: {}", other)),
        }
    }
}

/// Contact id mapping between the local store and the remote CRM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactSyncRecord {
    pub id: i64,
    pub tenant_id: String,
    pub local_contact_id: String,
    pub remote_contact_id: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub sync_status: SyncStatus,
    pub sync_direction: SyncDirection,
    pub sync_error: Option<String>,
    pub attempt_count: u32,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

const PLACEHOLDER_PREFIX: &str = "remote-only:";

/// Local id held by a row queued from the remote side before the DMS has
/// assigned a real one
pub fn placeholder_local_id(remote_id: &str) -> String {
    format!("{}{}", PLACEHOLDER_PREFIX, remote_id)
}

pub fn is_placeholder_local_id(local_id: &str) -> bool {
    local_id.starts_with(PLACEHOLDER_PREFIX)
}

impl ContactSyncRecord {
    /// Synced with a remote id, i.e. safe to message or book against
    pub fn is_linked(&self) -> bool {
        self.sync_status == SyncStatus::Synced && self.remote_contact_id.is_some()
    }

    /// Known only by its remote id so far
    pub fn is_placeholder(&self) -> bool {
        is_placeholder_local_id(&self.local_contact_id)
    }
}

/// Appointment id mapping between the local store and a remote calendar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppointmentSyncRecord {
    pub id: i64,
    pub tenant_id: String,
    pub local_appointment_id: String,
    pub local_contact_id: String,
    pub remote_event_id: Option<String>,
    pub remote_calendar_id: Option<String>,
    pub scheduled_start: Option<DateTime<Utc>>,
    pub scheduled_end: Option<DateTime<Utc>>,
    pub title: Option<String>,
    pub status: Option<String>,
    pub appointment_type: AppointmentType,
    pub sync_status: SyncStatus,
    pub sync_direction: SyncDirection,
    pub sync_error: Option<String>,
    pub attempt_count: u32,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl AppointmentSyncRecord {
    /// Known only by its remote event id so far
    pub fn is_placeholder(&self) -> bool {
        is_placeholder_local_id(&self.local_appointment_id)
    }
}

/// Audit entries written by the reconcilers and the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityAction {
    Verified,
    Stale,
    Found,
    Created,
    Updated,
    Linked,
    StaleReplaced,
    NoIdentifiers,
    Failed,
    Pulled,
    Pushed,
    Skipped,
    Deleted,
}

impl ActivityAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityAction::Verified => "verified",
            ActivityAction::Stale => "stale",
            ActivityAction::Found => "found",
            ActivityAction::Created => "created",
            ActivityAction::Updated => "updated",
            ActivityAction::Linked => "linked",
            ActivityAction::StaleReplaced => "stale_replaced",
            ActivityAction::NoIdentifiers => "no_identifiers",
            ActivityAction::Failed => "failed",
            ActivityAction::Pulled => "pulled",
            ActivityAction::Pushed => "pushed",
            ActivityAction::Skipped => "skipped",
            ActivityAction::Deleted => "deleted",
        }
    }
}

impl FromStr for ActivityAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let action = match s {
            "verified" => ActivityAction::Verified,
            "stale" => ActivityAction::Stale,
            "found" => ActivityAction::Found,
            "created" => ActivityAction::Created,
            "updated" => ActivityAction::Updated,
            "linked" => ActivityAction::Linked,
            "stale_replaced" => ActivityAction::StaleReplaced,
            "no_identifiers" => ActivityAction::NoIdentifiers,
            "failed" => ActivityAction::Failed,
            "pulled" => ActivityAction::Pulled,
            "pushed" => ActivityAction::Pushed,
            "skipped" => ActivityAction::Skipped,
            "deleted" => ActivityAction::Deleted,
            other => return Err(format!("unknown activity action: {}", other)),
        };
        Ok(action)
    }
}

impl fmt::Display for ActivityAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audit entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncActivity {
    pub tenant_id: String,
    pub entity: EntityKind,
    pub local_id: String,
    pub remote_id: Option<String>,
    pub action: ActivityAction,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl SyncActivity {
    pub fn new(
        tenant_id: impl Into<String>,
        entity: EntityKind,
        local_id: impl Into<String>,
        action: ActivityAction,
        message: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            entity,
            local_id: local_id.into(),
            remote_id: None,
            action,
            message: message.into(),
            created_at: Utc::now(),
        }
    }

    pub fn with_remote_id(mut self, remote_id: impl Into<String>) -> Self {
        self.remote_id = Some(remote_id.into());
        self
    }
}

/// One outbound attempt, for diagnosis only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiCallLog {
    pub tenant_id: String,
    pub endpoint: String,
    pub method: String,
    pub request_summary: Option<String>,
    pub response_status: Option<u16>,
    pub error_message: Option<String>,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// Row counts per entity and status for one tenant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub contacts: Vec<(SyncStatus, u64)>,
    pub appointments: Vec<(SyncStatus, u64)>,
}

impl StatusCounts {
    pub fn count(&self, entity: EntityKind, status: SyncStatus) -> u64 {
        let rows = match entity {
            EntityKind::Contact => &self.contacts,
            EntityKind::Appointment => &self.appointments,
        };
        rows.iter()
            .find(|(s, _)| *s == status)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }

    pub fn pending(&self, entity: EntityKind) -> u64 {
        self.count(entity, SyncStatus::PendingRemote) + self.count(entity, SyncStatus::PendingLocal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_strings() {
        for status in SyncStatus::all() {
            assert_eq!(status.as_str().parse::<SyncStatus>().unwrap(), status);
        }
        assert!("unknown".parse::<SyncStatus>().is_err());
    }

    #[test]
    fn test_appointment_type_parsing() {
        assert_eq!(
            "test-drive".parse::<AppointmentType>().unwrap(),
            AppointmentType::TestDrive
        );
        assert_eq!(
            "Service".parse::<AppointmentType>().unwrap(),
            AppointmentType::Service
        );
        assert_eq!(AppointmentType::default(), AppointmentType::Sales);
    }

    #[test]
    fn test_status_counts_lookup() {
        let counts = StatusCounts {
            contacts: vec![(SyncStatus::PendingRemote, 3), (SyncStatus::Synced, 9)],
            appointments: vec![(SyncStatus::PendingLocal, 1)],
        };
        assert_eq!(counts.count(EntityKind::Contact, SyncStatus::Synced), 9);
        assert_eq!(counts.count(EntityKind::Contact, SyncStatus::Error), 0);
        assert_eq!(counts.pending(EntityKind::Appointment), 1);
    }
}
