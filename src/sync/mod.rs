//! Sync engine
//!
//! Reconcilers, the remote to DMS bridge, the batch orchestrator and the
//! scheduler daemon. Every operation takes a [`TenantSession`].

pub mod appointment;
pub mod bridge;
pub mod contact;
pub mod daemon;
pub mod locks;
pub mod messaging;
pub mod metrics;
pub mod orchestrator;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use appointment::{
    delete_remote_appointment, ensure_remote_appointment, AppointmentOutcome, AppointmentSync,
};
pub use bridge::{
    pull_remote_appointment, pull_remote_contact, queue_remote_appointment, queue_remote_contact,
    Pulled,
};
pub use contact::{ensure_remote_contact, ContactOutcome, ContactSync};
pub use daemon::{SyncCommand, SyncDaemon, SyncEvent};
pub use locks::ContactLocks;
pub use messaging::{send_message, SentMessage};
pub use orchestrator::{BatchOrchestrator, BatchReport, RowError};
pub use session::{build_session, build_sessions, TenantSession, DEFAULT_MAX_ATTEMPTS};
