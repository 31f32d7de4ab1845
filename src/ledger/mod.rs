//! Sync ledger
//!
//! Durable id mappings between local records and their remote counterparts,
//! plus the API call log and the sync activity trail.

mod models;
mod records;
mod sqlite;

pub use models::{
    is_placeholder_local_id, placeholder_local_id, ActivityAction, ApiCallLog,
    AppointmentSyncRecord, AppointmentType, ContactSyncRecord, EntityKind, StatusCounts,
    SyncActivity, SyncDirection, SyncStatus,
};
pub use records::{LocalAppointment, LocalContact, RecordStore};
pub use sqlite::SyncLedger;
