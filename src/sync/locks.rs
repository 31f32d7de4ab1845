//! Per-contact advisory locks
//!
//! Reconciling the same contact concurrently can race between "search found
//! nothing" and "create", producing a duplicate remote contact. Every
//! reconciliation of a contact (and every appointment precondition check)
//! holds the lock for `(tenant_id, local_contact_id)` first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockKey = (String, String);

/// Async mutex per `(tenant_id, local_contact_id)`, dropped when idle
#[derive(Default)]
pub struct ContactLocks {
    locks: Mutex<HashMap<LockKey, Arc<AsyncMutex<()>>>>,
}

/// Held lock on one contact, released on drop
pub struct ContactGuard {
    _guard: OwnedMutexGuard<()>,
}

impl ContactLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to a contact
    pub async fn lock(&self, tenant_id: &str, local_contact_id: &str) -> ContactGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // Idle entries are only referenced by the map
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry((tenant_id.to_string(), local_contact_id.to_string()))
                .or_default()
                .clone()
        };

        ContactGuard {
            _guard: lock.lock_owned().await,
        }
    }

    /// Contacts currently locked or waited on
    pub fn active(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|lock| Arc::strong_count(lock) > 1)
            .count()
    }
}
