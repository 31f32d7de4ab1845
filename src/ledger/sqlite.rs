//! SQLite sync ledger
//!
//! Owns every table the engine persists: CRM accounts, contact and appointment
//! sync records, the API call log, the sync activity trail and the local
//! record store. All rows are keyed by tenant and removed together by
//! [`SyncLedger::purge_tenant`].

use super::models::{
    placeholder_local_id, ActivityAction, ApiCallLog, AppointmentSyncRecord, AppointmentType,
    ContactSyncRecord, EntityKind, StatusCounts, SyncActivity, SyncDirection, SyncStatus,
};
use super::records::{LocalAppointment, LocalContact, RecordStore};
use crate::auth::{AccountStore, ApiKeyAuth, CrmAccount, Credentials, OAuthAuth, OAuthTokens};
use crate::error::ErrorCode;
use crate::{Result, SyncError};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

const CONTACT_COLUMNS: &str = "id, tenant_id, local_contact_id, remote_contact_id, email, phone, \
     sync_status, sync_direction, sync_error, attempt_count, last_synced_at, updated_at";

const APPOINTMENT_COLUMNS: &str = "id, tenant_id, local_appointment_id, local_contact_id, \
     remote_event_id, remote_calendar_id, scheduled_start, scheduled_end, title, status, \
     appointment_type, sync_status, sync_direction, sync_error, attempt_count, last_synced_at, \
     updated_at";

/// Durable id-mapping store shared by every tenant session
pub struct SyncLedger {
    conn: Mutex<Connection>,
}

impl SyncLedger {
    /// Open or create a ledger database
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!(path = %path.display(), "Opening sync ledger");

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        let ledger = Self {
            conn: Mutex::new(conn),
        };
        ledger.init_schema()?;
        Ok(ledger)
    }

    /// Create a ledger backed by an in-memory database
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let ledger = Self {
            conn: Mutex::new(conn),
        };
        ledger.init_schema()?;
        Ok(ledger)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SyncError::Storage("ledger connection lock poisoned".to_string()))
    }

    fn init_schema(&self) -> Result<()> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS crm_accounts (
                tenant_id TEXT PRIMARY KEY,
                auth_type TEXT NOT NULL,
                api_key TEXT,
                access_token TEXT,
                refresh_token TEXT,
                expires_at TEXT,
                location_id TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS contact_sync (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id TEXT NOT NULL,
                local_contact_id TEXT NOT NULL,
                remote_contact_id TEXT,
                email TEXT,
                phone TEXT,
                sync_status TEXT NOT NULL,
                sync_direction TEXT NOT NULL,
                sync_error TEXT,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                last_attempt_at TEXT,
                last_synced_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (tenant_id, local_contact_id)
            );

            CREATE TABLE IF NOT EXISTS appointment_sync (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id TEXT NOT NULL,
                local_appointment_id TEXT NOT NULL,
                local_contact_id TEXT NOT NULL,
                remote_event_id TEXT,
                remote_calendar_id TEXT,
                scheduled_start TEXT,
                scheduled_end TEXT,
                title TEXT,
                status TEXT,
                appointment_type TEXT NOT NULL,
                sync_status TEXT NOT NULL,
                sync_direction TEXT NOT NULL,
                sync_error TEXT,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                last_attempt_at TEXT,
                last_synced_at TEXT,
                deleted_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (tenant_id, local_appointment_id)
            );

            CREATE TABLE IF NOT EXISTS api_call_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id TEXT NOT NULL,
                endpoint TEXT NOT NULL,
                method TEXT NOT NULL,
                request_summary TEXT,
                response_status INTEGER,
                error_message TEXT,
                duration_ms INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sync_activity (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id TEXT NOT NULL,
                entity TEXT NOT NULL,
                local_id TEXT NOT NULL,
                remote_id TEXT,
                action TEXT NOT NULL,
                message TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS local_contacts (
                tenant_id TEXT NOT NULL,
                id TEXT NOT NULL,
                first_name TEXT,
                last_name TEXT,
                email TEXT,
                phone TEXT,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (tenant_id, id)
            );

            CREATE TABLE IF NOT EXISTS local_appointments (
                tenant_id TEXT NOT NULL,
                id TEXT NOT NULL,
                contact_id TEXT NOT NULL,
                title TEXT NOT NULL,
                start_at TEXT NOT NULL,
                end_at TEXT NOT NULL,
                status TEXT NOT NULL,
                appointment_type TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (tenant_id, id)
            );

            CREATE INDEX IF NOT EXISTS idx_contact_sync_status ON contact_sync(tenant_id, sync_status);
            CREATE INDEX IF NOT EXISTS idx_contact_sync_remote ON contact_sync(tenant_id, remote_contact_id);
            CREATE INDEX IF NOT EXISTS idx_appointment_sync_status ON appointment_sync(tenant_id, sync_status);
            CREATE INDEX IF NOT EXISTS idx_appointment_sync_remote ON appointment_sync(tenant_id, remote_event_id);
            CREATE INDEX IF NOT EXISTS idx_api_call_log_tenant ON api_call_log(tenant_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_sync_activity_entity ON sync_activity(tenant_id, entity, local_id);
            "#,
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // CRM accounts
    // ------------------------------------------------------------------

    /// Insert or replace a tenant's CRM account, reactivating it
    pub fn upsert_account(&self, account: &CrmAccount) -> Result<()> {
        let now = now_str();
        let (auth_type, api_key, access_token, refresh_token, expires_at, location_id) =
            match &account.credentials {
                Credentials::ApiKey(auth) => (
                    "api_key",
                    Some(auth.api_key.clone()),
                    None,
                    None,
                    None,
                    auth.location_id.clone(),
                ),
                Credentials::OAuth(auth) => (
                    "oauth",
                    None,
                    Some(auth.access_token.clone()),
                    Some(auth.refresh_token.clone()),
                    Some(auth.expires_at.to_rfc3339()),
                    auth.location_id.clone(),
                ),
            };

        self.conn()?.execute(
            r#"
            INSERT INTO crm_accounts
                (tenant_id, auth_type, api_key, access_token, refresh_token, expires_at,
                 location_id, active, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
            ON CONFLICT(tenant_id) DO UPDATE SET
                auth_type = excluded.auth_type,
                api_key = excluded.api_key,
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at,
                location_id = excluded.location_id,
                active = excluded.active,
                updated_at = excluded.updated_at
            "#,
            params![
                account.tenant_id,
                auth_type,
                api_key,
                access_token,
                refresh_token,
                expires_at,
                location_id,
                account.active as i32,
                now,
            ],
        )?;
        Ok(())
    }

    /// Deactivate a tenant's account. Returns false if there was none.
    pub fn deactivate_account(&self, tenant_id: &str) -> Result<bool> {
        let changed = self.conn()?.execute(
            "UPDATE crm_accounts SET active = 0, updated_at = ?2 WHERE tenant_id = ?1",
            params![tenant_id, now_str()],
        )?;
        Ok(changed > 0)
    }

    // ------------------------------------------------------------------
    // Contact sync records
    // ------------------------------------------------------------------

    /// Mark a local contact as waiting for a remote write
    ///
    /// Creates the row on first use. An existing row keeps its remote link and
    /// has its error state reset.
    pub fn enqueue_contact(
        &self,
        tenant_id: &str,
        local_contact_id: &str,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<ContactSyncRecord> {
        let now = now_str();
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO contact_sync
                (tenant_id, local_contact_id, email, phone, sync_status, sync_direction,
                 attempt_count, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, 'pending_remote', 'local_to_remote', 0, ?5, ?5)
            ON CONFLICT(tenant_id, local_contact_id) DO UPDATE SET
                email = excluded.email,
                phone = excluded.phone,
                sync_status = 'pending_remote',
                sync_direction = 'local_to_remote',
                sync_error = NULL,
                attempt_count = 0,
                updated_at = excluded.updated_at
            "#,
            params![tenant_id, local_contact_id, email, phone, now],
        )?;
        fetch_contact(&conn, tenant_id, local_contact_id)?.ok_or_else(|| missing(local_contact_id))
    }

    /// Get the row for a local contact, creating it on the first sync attempt
    ///
    /// Existing rows only have their identifier snapshot refreshed.
    pub fn ensure_contact_record(
        &self,
        tenant_id: &str,
        local_contact_id: &str,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<ContactSyncRecord> {
        let now = now_str();
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO contact_sync
                (tenant_id, local_contact_id, email, phone, sync_status, sync_direction,
                 attempt_count, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, 'pending_remote', 'local_to_remote', 0, ?5, ?5)
            ON CONFLICT(tenant_id, local_contact_id) DO UPDATE SET
                email = excluded.email,
                phone = excluded.phone
            "#,
            params![tenant_id, local_contact_id, email, phone, now],
        )?;
        fetch_contact(&conn, tenant_id, local_contact_id)?.ok_or_else(|| missing(local_contact_id))
    }

    pub fn get_contact_record(
        &self,
        tenant_id: &str,
        local_contact_id: &str,
    ) -> Result<Option<ContactSyncRecord>> {
        fetch_contact(&*self.conn()?, tenant_id, local_contact_id)
    }

    pub fn find_contact_by_remote_id(
        &self,
        tenant_id: &str,
        remote_contact_id: &str,
    ) -> Result<Option<ContactSyncRecord>> {
        fetch_contact_by_remote(&*self.conn()?, tenant_id, remote_contact_id)
    }

    /// Link a local contact to a remote id and mark it synced
    ///
    /// Refuses to overwrite a different remote id. A stale id must be
    /// cleared with [`SyncLedger::clear_contact_link`] first.
    pub fn link_contact(
        &self,
        tenant_id: &str,
        local_contact_id: &str,
        remote_contact_id: &str,
        direction: SyncDirection,
    ) -> Result<ContactSyncRecord> {
        let now = now_str();
        let conn = self.conn()?;

        if let Some(existing) = fetch_contact(&conn, tenant_id, local_contact_id)? {
            if let Some(current) = existing.remote_contact_id.as_deref() {
                if current != remote_contact_id {
                    return Err(SyncError::Storage(format!(
                        "contact {} is already linked to {}, refusing to link {}",
                        local_contact_id, current, remote_contact_id
                    )));
                }
            }
        }

        conn.execute(
            r#"
            INSERT INTO contact_sync
                (tenant_id, local_contact_id, remote_contact_id, sync_status, sync_direction,
                 attempt_count, last_attempt_at, last_synced_at, created_at, updated_at)
            VALUES (?1, ?2, ?3, 'synced', ?4, 0, ?5, ?5, ?5, ?5)
            ON CONFLICT(tenant_id, local_contact_id) DO UPDATE SET
                remote_contact_id = excluded.remote_contact_id,
                sync_status = 'synced',
                sync_direction = excluded.sync_direction,
                sync_error = NULL,
                attempt_count = 0,
                last_attempt_at = excluded.last_attempt_at,
                last_synced_at = excluded.last_synced_at,
                updated_at = excluded.updated_at
            "#,
            params![
                tenant_id,
                local_contact_id,
                remote_contact_id,
                direction.as_str(),
                now
            ],
        )?;
        fetch_contact(&conn, tenant_id, local_contact_id)?.ok_or_else(|| missing(local_contact_id))
    }

    /// Drop a remote link that no longer resolves. Returns the cleared id.
    pub fn clear_contact_link(
        &self,
        tenant_id: &str,
        local_contact_id: &str,
    ) -> Result<Option<String>> {
        let conn = self.conn()?;
        let previous = fetch_contact(&conn, tenant_id, local_contact_id)?
            .and_then(|record| record.remote_contact_id);

        conn.execute(
            r#"
            UPDATE contact_sync
            SET remote_contact_id = NULL, sync_status = 'pending_remote',
                sync_direction = 'local_to_remote', updated_at = ?3
            WHERE tenant_id = ?1 AND local_contact_id = ?2
            "#,
            params![tenant_id, local_contact_id, now_str()],
        )?;
        Ok(previous)
    }

    /// Queue a remote contact for a remote to DMS pass
    ///
    /// A remote id the ledger has never seen gets a placeholder row keyed by
    /// [`placeholder_local_id`]. The bridge moves it to the DMS id with
    /// [`SyncLedger::rekey_contact`] once the DMS record exists.
    pub fn mark_contact_pending_local(
        &self,
        tenant_id: &str,
        remote_contact_id: &str,
    ) -> Result<ContactSyncRecord> {
        let now = now_str();
        let conn = self.conn()?;
        let changed = conn.execute(
            r#"
            UPDATE contact_sync
            SET sync_status = 'pending_local', sync_direction = 'remote_to_local',
                sync_error = NULL, attempt_count = 0, updated_at = ?3
            WHERE tenant_id = ?1 AND remote_contact_id = ?2
            "#,
            params![tenant_id, remote_contact_id, now],
        )?;

        if changed == 0 {
            conn.execute(
                r#"
                INSERT INTO contact_sync
                    (tenant_id, local_contact_id, remote_contact_id, sync_status, sync_direction,
                     attempt_count, created_at, updated_at)
                VALUES (?1, ?2, ?3, 'pending_local', 'remote_to_local', 0, ?4, ?4)
                ON CONFLICT(tenant_id, local_contact_id) DO UPDATE SET
                    remote_contact_id = excluded.remote_contact_id,
                    sync_status = 'pending_local',
                    sync_direction = 'remote_to_local',
                    sync_error = NULL,
                    attempt_count = 0,
                    updated_at = excluded.updated_at
                "#,
                params![
                    tenant_id,
                    placeholder_local_id(remote_contact_id),
                    remote_contact_id,
                    now
                ],
            )?;
        }
        fetch_contact_by_remote(&conn, tenant_id, remote_contact_id)?
            .ok_or_else(|| missing(remote_contact_id))
    }

    /// Move a contact row (and its activity trail) to a new local id
    ///
    /// When a row already exists under the new id the old row is dropped
    /// instead. Returns false when there was nothing to move.
    pub fn rekey_contact(
        &self,
        tenant_id: &str,
        from_local_id: &str,
        to_local_id: &str,
    ) -> Result<bool> {
        let conn = self.conn()?;
        rekey(&conn, EntityKind::Contact, tenant_id, from_local_id, to_local_id)
    }

    /// Mark a pending-local contact row as written to the DMS
    pub fn mark_contact_synced(&self, tenant_id: &str, local_contact_id: &str) -> Result<()> {
        let now = now_str();
        self.conn()?.execute(
            r#"
            UPDATE contact_sync
            SET sync_status = 'synced', sync_error = NULL, attempt_count = 0,
                last_attempt_at = ?3, last_synced_at = ?3, updated_at = ?3
            WHERE tenant_id = ?1 AND local_contact_id = ?2 AND remote_contact_id IS NOT NULL
            "#,
            params![tenant_id, local_contact_id, now],
        )?;
        Ok(())
    }

    /// Record a failed reconciliation of a contact row
    ///
    /// See [`SyncLedger::record_failure`].
    pub fn record_contact_failure(
        &self,
        tenant_id: &str,
        local_contact_id: &str,
        code: ErrorCode,
        message: &str,
        max_attempts: u32,
    ) -> Result<Option<SyncStatus>> {
        self.record_failure(
            EntityKind::Contact,
            tenant_id,
            local_contact_id,
            code,
            message,
            max_attempts,
        )
    }

    /// Pending contact rows in id order, starting after `after_id`
    pub fn pending_contacts(
        &self,
        tenant_id: &str,
        status: SyncStatus,
        after_id: i64,
        limit: u32,
    ) -> Result<Vec<ContactSyncRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM contact_sync \
             WHERE tenant_id = ?1 AND sync_status = ?2 AND id > ?3 \
             ORDER BY id LIMIT ?4",
            CONTACT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![tenant_id, status.as_str(), after_id, limit],
                contact_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Appointment sync records
    // ------------------------------------------------------------------

    /// Mark a local appointment as waiting for a remote write
    pub fn enqueue_appointment(
        &self,
        tenant_id: &str,
        appointment: &LocalAppointment,
    ) -> Result<AppointmentSyncRecord> {
        self.write_appointment_snapshot(tenant_id, appointment, true)
    }

    /// Get the row for a local appointment, creating it on the first sync attempt
    pub fn ensure_appointment_record(
        &self,
        tenant_id: &str,
        appointment: &LocalAppointment,
    ) -> Result<AppointmentSyncRecord> {
        self.write_appointment_snapshot(tenant_id, appointment, false)
    }

    fn write_appointment_snapshot(
        &self,
        tenant_id: &str,
        appointment: &LocalAppointment,
        reset: bool,
    ) -> Result<AppointmentSyncRecord> {
        let now = now_str();
        let conn = self.conn()?;
        let on_conflict = if reset {
            ", sync_status = 'pending_remote', sync_direction = 'local_to_remote', \
             sync_error = NULL, attempt_count = 0, updated_at = excluded.updated_at"
        } else {
            ""
        };
        let sql = format!(
            r#"
            INSERT INTO appointment_sync
                (tenant_id, local_appointment_id, local_contact_id, scheduled_start,
                 scheduled_end, title, status, appointment_type, sync_status, sync_direction,
                 attempt_count, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending_remote', 'local_to_remote', 0, ?9, ?9)
            ON CONFLICT(tenant_id, local_appointment_id) DO UPDATE SET
                local_contact_id = excluded.local_contact_id,
                scheduled_start = excluded.scheduled_start,
                scheduled_end = excluded.scheduled_end,
                title = excluded.title,
                status = excluded.status,
                appointment_type = excluded.appointment_type{}
            "#,
            on_conflict
        );
        conn.execute(
            &sql,
            params![
                tenant_id,
                appointment.id,
                appointment.contact_id,
                appointment.start.to_rfc3339(),
                appointment.end.to_rfc3339(),
                appointment.title,
                appointment.status,
                appointment.appointment_type.as_str(),
                now,
            ],
        )?;
        fetch_appointment(&conn, tenant_id, &appointment.id)?.ok_or_else(|| missing(&appointment.id))
    }

    pub fn get_appointment_record(
        &self,
        tenant_id: &str,
        local_appointment_id: &str,
    ) -> Result<Option<AppointmentSyncRecord>> {
        fetch_appointment(&*self.conn()?, tenant_id, local_appointment_id)
    }

    pub fn find_appointment_by_remote_id(
        &self,
        tenant_id: &str,
        remote_event_id: &str,
    ) -> Result<Option<AppointmentSyncRecord>> {
        fetch_appointment_by_remote(&*self.conn()?, tenant_id, remote_event_id)
    }

    /// Link a local appointment to a remote event and mark it synced
    ///
    /// Same overwrite rule as [`SyncLedger::link_contact`].
    pub fn link_appointment(
        &self,
        tenant_id: &str,
        appointment: &LocalAppointment,
        remote_event_id: &str,
        remote_calendar_id: &str,
        direction: SyncDirection,
    ) -> Result<AppointmentSyncRecord> {
        let now = now_str();
        let conn = self.conn()?;

        if let Some(existing) = fetch_appointment(&conn, tenant_id, &appointment.id)? {
            if let Some(current) = existing.remote_event_id.as_deref() {
                if current != remote_event_id {
                    return Err(SyncError::Storage(format!(
                        "appointment {} is already linked to {}, refusing to link {}",
                        appointment.id, current, remote_event_id
                    )));
                }
            }
        }

        conn.execute(
            r#"
            INSERT INTO appointment_sync
                (tenant_id, local_appointment_id, local_contact_id, remote_event_id,
                 remote_calendar_id, scheduled_start, scheduled_end, title, status,
                 appointment_type, sync_status, sync_direction, attempt_count,
                 last_attempt_at, last_synced_at, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 'synced', ?11, 0, ?12, ?12, ?12, ?12)
            ON CONFLICT(tenant_id, local_appointment_id) DO UPDATE SET
                local_contact_id = excluded.local_contact_id,
                remote_event_id = excluded.remote_event_id,
                remote_calendar_id = excluded.remote_calendar_id,
                scheduled_start = excluded.scheduled_start,
                scheduled_end = excluded.scheduled_end,
                title = excluded.title,
                status = excluded.status,
                appointment_type = excluded.appointment_type,
                sync_status = 'synced',
                sync_direction = excluded.sync_direction,
                sync_error = NULL,
                attempt_count = 0,
                last_attempt_at = excluded.last_attempt_at,
                last_synced_at = excluded.last_synced_at,
                updated_at = excluded.updated_at
            "#,
            params![
                tenant_id,
                appointment.id,
                appointment.contact_id,
                remote_event_id,
                remote_calendar_id,
                appointment.start.to_rfc3339(),
                appointment.end.to_rfc3339(),
                appointment.title,
                appointment.status,
                appointment.appointment_type.as_str(),
                direction.as_str(),
                now,
            ],
        )?;
        fetch_appointment(&conn, tenant_id, &appointment.id)?.ok_or_else(|| missing(&appointment.id))
    }

    /// Drop a remote event link that no longer resolves. Returns the cleared id.
    pub fn clear_appointment_link(
        &self,
        tenant_id: &str,
        local_appointment_id: &str,
    ) -> Result<Option<String>> {
        let conn = self.conn()?;
        let previous = fetch_appointment(&conn, tenant_id, local_appointment_id)?
            .and_then(|record| record.remote_event_id);

        conn.execute(
            r#"
            UPDATE appointment_sync
            SET remote_event_id = NULL, sync_status = 'pending_remote',
                sync_direction = 'local_to_remote', updated_at = ?3
            WHERE tenant_id = ?1 AND local_appointment_id = ?2
            "#,
            params![tenant_id, local_appointment_id, now_str()],
        )?;
        Ok(previous)
    }

    /// Record that the remote event was deleted. Returns the removed event id.
    pub fn mark_appointment_deleted(
        &self,
        tenant_id: &str,
        local_appointment_id: &str,
    ) -> Result<Option<String>> {
        let now = now_str();
        let conn = self.conn()?;
        let previous = fetch_appointment(&conn, tenant_id, local_appointment_id)?
            .and_then(|record| record.remote_event_id);

        conn.execute(
            r#"
            UPDATE appointment_sync
            SET remote_event_id = NULL, status = 'cancelled', sync_status = 'synced',
                sync_error = NULL, attempt_count = 0, deleted_at = ?3,
                last_synced_at = ?3, updated_at = ?3
            WHERE tenant_id = ?1 AND local_appointment_id = ?2
            "#,
            params![tenant_id, local_appointment_id, now],
        )?;
        Ok(previous)
    }

    /// Queue a remote event for a remote to DMS pass
    ///
    /// Unknown event ids get a placeholder row, as for contacts. Its contact
    /// and type are filled in when the bridge links the pulled appointment.
    pub fn mark_appointment_pending_local(
        &self,
        tenant_id: &str,
        remote_event_id: &str,
    ) -> Result<AppointmentSyncRecord> {
        let now = now_str();
        let conn = self.conn()?;
        let changed = conn.execute(
            r#"
            UPDATE appointment_sync
            SET sync_status = 'pending_local', sync_direction = 'remote_to_local',
                sync_error = NULL, attempt_count = 0, updated_at = ?3
            WHERE tenant_id = ?1 AND remote_event_id = ?2
            "#,
            params![tenant_id, remote_event_id, now],
        )?;

        if changed == 0 {
            conn.execute(
                r#"
                INSERT INTO appointment_sync
                    (tenant_id, local_appointment_id, local_contact_id, remote_event_id,
                     appointment_type, sync_status, sync_direction, attempt_count,
                     created_at, updated_at)
                VALUES (?1, ?2, '', ?3, ?4, 'pending_local', 'remote_to_local', 0, ?5, ?5)
                ON CONFLICT(tenant_id, local_appointment_id) DO UPDATE SET
                    remote_event_id = excluded.remote_event_id,
                    sync_status = 'pending_local',
                    sync_direction = 'remote_to_local',
                    sync_error = NULL,
                    attempt_count = 0,
                    updated_at = excluded.updated_at
                "#,
                params![
                    tenant_id,
                    placeholder_local_id(remote_event_id),
                    remote_event_id,
                    AppointmentType::default().as_str(),
                    now
                ],
            )?;
        }
        fetch_appointment_by_remote(&conn, tenant_id, remote_event_id)?
            .ok_or_else(|| missing(remote_event_id))
    }

    /// Move an appointment row (and its activity trail) to a new local id
    ///
    /// See [`SyncLedger::rekey_contact`].
    pub fn rekey_appointment(
        &self,
        tenant_id: &str,
        from_local_id: &str,
        to_local_id: &str,
    ) -> Result<bool> {
        let conn = self.conn()?;
        rekey(&conn, EntityKind::Appointment, tenant_id, from_local_id, to_local_id)
    }

    pub fn record_appointment_failure(
        &self,
        tenant_id: &str,
        local_appointment_id: &str,
        code: ErrorCode,
        message: &str,
        max_attempts: u32,
    ) -> Result<Option<SyncStatus>> {
        self.record_failure(
            EntityKind::Appointment,
            tenant_id,
            local_appointment_id,
            code,
            message,
            max_attempts,
        )
    }

    /// Pending appointment rows in id order, starting after `after_id`
    pub fn pending_appointments(
        &self,
        tenant_id: &str,
        status: SyncStatus,
        after_id: i64,
        limit: u32,
    ) -> Result<Vec<AppointmentSyncRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM appointment_sync \
             WHERE tenant_id = ?1 AND sync_status = ?2 AND id > ?3 \
             ORDER BY id LIMIT ?4",
            APPOINTMENT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![tenant_id, status.as_str(), after_id, limit],
                appointment_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Store a failure against a ledger row
    ///
    /// Transient codes leave the status as is and bump `attempt_count`, until
    /// `max_attempts` is reached. Anything else moves the row to `error`.
    /// `sync_error` is always set. Returns the resulting status, or `None` if
    /// the row does not exist.
    fn record_failure(
        &self,
        entity: EntityKind,
        tenant_id: &str,
        local_id: &str,
        code: ErrorCode,
        message: &str,
        max_attempts: u32,
    ) -> Result<Option<SyncStatus>> {
        let (table, key) = match entity {
            EntityKind::Contact => ("contact_sync", "local_contact_id"),
            EntityKind::Appointment => ("appointment_sync", "local_appointment_id"),
        };

        let conn = self.conn()?;
        let current: Option<(String, i64)> = conn
            .query_row(
                &format!(
                    "SELECT sync_status, attempt_count FROM {} WHERE tenant_id = ?1 AND {} = ?2",
                    table, key
                ),
                params![tenant_id, local_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((status, attempts)) = current else {
            return Ok(None);
        };

        let attempts = attempts as u32 + 1;
        let status = SyncStatus::from_str(&status).unwrap_or(SyncStatus::PendingRemote);
        let next = if code.is_transient() && attempts < max_attempts {
            status
        } else {
            SyncStatus::Error
        };

        conn.execute(
            &format!(
                "UPDATE {} SET sync_status = ?3, sync_error = ?4, attempt_count = ?5, \
                 last_attempt_at = ?6, updated_at = ?6 WHERE tenant_id = ?1 AND {} = ?2",
                table, key
            ),
            params![
                tenant_id,
                local_id,
                next.as_str(),
                format!("{}: {}", code, message),
                attempts,
                now_str()
            ],
        )?;
        Ok(Some(next))
    }

    // ------------------------------------------------------------------
    // Call log, activity trail, reporting
    // ------------------------------------------------------------------

    /// Append one outbound attempt to the call log
    pub fn log_api_call(&self, entry: &ApiCallLog) -> Result<()> {
        self.conn()?.execute(
            r#"
            INSERT INTO api_call_log
                (tenant_id, endpoint, method, request_summary, response_status,
                 error_message, duration_ms, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                entry.tenant_id,
                entry.endpoint,
                entry.method,
                entry.request_summary,
                entry.response_status,
                entry.error_message,
                entry.duration_ms as i64,
                entry.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Most recent call log entries for a tenant, newest first
    pub fn recent_api_calls(&self, tenant_id: &str, limit: u32) -> Result<Vec<ApiCallLog>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT tenant_id, endpoint, method, request_summary, response_status,
                   error_message, duration_ms, created_at
            FROM api_call_log
            WHERE tenant_id = ?1
            ORDER BY id DESC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt
            .query_map(params![tenant_id, limit], |row| {
                let duration_ms: i64 = row.get(6)?;
                Ok(ApiCallLog {
                    tenant_id: row.get(0)?,
                    endpoint: row.get(1)?,
                    method: row.get(2)?,
                    request_summary: row.get(3)?,
                    response_status: row.get(4)?,
                    error_message: row.get(5)?,
                    duration_ms: duration_ms.max(0) as u64,
                    created_at: parse_ts(row.get(7)?).unwrap_or_else(Utc::now),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn record_activity(&self, activity: &SyncActivity) -> Result<()> {
        self.conn()?.execute(
            r#"
            INSERT INTO sync_activity
                (tenant_id, entity, local_id, remote_id, action, message, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                activity.tenant_id,
                activity.entity.as_str(),
                activity.local_id,
                activity.remote_id,
                activity.action.as_str(),
                activity.message,
                activity.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Audit trail of one entity, oldest first
    pub fn activities_for(
        &self,
        tenant_id: &str,
        entity: EntityKind,
        local_id: &str,
    ) -> Result<Vec<SyncActivity>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT tenant_id, entity, local_id, remote_id, action, message, created_at
            FROM sync_activity
            WHERE tenant_id = ?1 AND entity = ?2 AND local_id = ?3
            ORDER BY id
            "#,
        )?;
        let rows = stmt
            .query_map(params![tenant_id, entity.as_str(), local_id], |row| {
                Ok(SyncActivity {
                    tenant_id: row.get(0)?,
                    entity: parse_col::<EntityKind>(row, 1)?,
                    local_id: row.get(2)?,
                    remote_id: row.get(3)?,
                    action: parse_col::<ActivityAction>(row, 4)?,
                    message: row.get(5)?,
                    created_at: parse_ts(row.get(6)?).unwrap_or_else(Utc::now),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Ledger row counts by entity and status
    pub fn status_counts(&self, tenant_id: &str) -> Result<StatusCounts> {
        let conn = self.conn()?;
        let count = |table: &str| -> Result<Vec<(SyncStatus, u64)>> {
            let mut stmt = conn.prepare(&format!(
                "SELECT sync_status, COUNT(*) FROM {} WHERE tenant_id = ?1 \
                 GROUP BY sync_status ORDER BY sync_status",
                table
            ))?;
            let rows = stmt
                .query_map(params![tenant_id], |row| {
                    let n: i64 = row.get(1)?;
                    Ok((parse_col::<SyncStatus>(row, 0)?, n.max(0) as u64))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        };

        Ok(StatusCounts {
            contacts: count("contact_sync")?,
            appointments: count("appointment_sync")?,
        })
    }

    /// Remove everything owned by a tenant. Returns the number of rows deleted.
    pub fn purge_tenant(&self, tenant_id: &str) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut deleted = 0;
        for table in [
            "crm_accounts",
            "contact_sync",
            "appointment_sync",
            "api_call_log",
            "sync_activity",
            "local_contacts",
            "local_appointments",
        ] {
            deleted += tx.execute(
                &format!("DELETE FROM {} WHERE tenant_id = ?1", table),
                params![tenant_id],
            )?;
        }
        tx.commit()?;

        tracing::info!(tenant = tenant_id, rows = deleted, "Purged tenant from ledger");
        Ok(deleted)
    }
}

impl AccountStore for SyncLedger {
    fn load_account(&self, tenant_id: &str) -> Result<Option<CrmAccount>> {
        let conn = self.conn()?;
        let account = conn
            .query_row(
                r#"
                SELECT tenant_id, auth_type, api_key, access_token, refresh_token,
                       expires_at, location_id, active
                FROM crm_accounts WHERE tenant_id = ?1
                "#,
                params![tenant_id],
                |row| {
                    let auth_type: String = row.get(1)?;
                    let location_id: String = row.get(6)?;
                    let active: i32 = row.get(7)?;
                    let credentials = if auth_type == "api_key" {
                        Credentials::ApiKey(ApiKeyAuth {
                            api_key: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                            location_id,
                        })
                    } else {
                        Credentials::OAuth(OAuthAuth {
                            access_token: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                            refresh_token: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                            // Unknown expiry is treated as already expired
                            expires_at: parse_ts(row.get(5)?).unwrap_or_else(Utc::now),
                            location_id,
                        })
                    };
                    Ok(CrmAccount {
                        tenant_id: row.get(0)?,
                        credentials,
                        active: active != 0,
                    })
                },
            )
            .optional()?;
        Ok(account)
    }

    fn save_tokens(&self, tenant_id: &str, tokens: &OAuthTokens) -> Result<()> {
        let changed = self.conn()?.execute(
            r#"
            UPDATE crm_accounts
            SET auth_type = 'oauth', api_key = NULL, access_token = ?2, refresh_token = ?3,
                expires_at = ?4, location_id = COALESCE(?5, location_id), updated_at = ?6
            WHERE tenant_id = ?1
            "#,
            params![
                tenant_id,
                tokens.access_token,
                tokens.refresh_token,
                tokens.expires_at.to_rfc3339(),
                tokens.location_id,
                now_str(),
            ],
        )?;
        if changed == 0 {
            return Err(SyncError::NoAccount(tenant_id.to_string()));
        }
        Ok(())
    }
}

impl RecordStore for SyncLedger {
    fn get_contact(&self, tenant_id: &str, contact_id: &str) -> Result<Option<LocalContact>> {
        let conn = self.conn()?;
        let contact = conn
            .query_row(
                "SELECT id, first_name, last_name, email, phone FROM local_contacts \
                 WHERE tenant_id = ?1 AND id = ?2",
                params![tenant_id, contact_id],
                |row| {
                    Ok(LocalContact {
                        id: row.get(0)?,
                        first_name: row.get(1)?,
                        last_name: row.get(2)?,
                        email: row.get(3)?,
                        phone: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(contact)
    }

    fn upsert_contact(&self, tenant_id: &str, contact: &LocalContact) -> Result<()> {
        self.conn()?.execute(
            r#"
            INSERT INTO local_contacts (tenant_id, id, first_name, last_name, email, phone, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(tenant_id, id) DO UPDATE SET
                first_name = excluded.first_name,
                last_name = excluded.last_name,
                email = excluded.email,
                phone = excluded.phone,
                updated_at = excluded.updated_at
            "#,
            params![
                tenant_id,
                contact.id,
                contact.first_name,
                contact.last_name,
                contact.email,
                contact.phone,
                now_str(),
            ],
        )?;
        Ok(())
    }

    fn get_appointment(
        &self,
        tenant_id: &str,
        appointment_id: &str,
    ) -> Result<Option<LocalAppointment>> {
        let conn = self.conn()?;
        let appointment = conn
            .query_row(
                "SELECT id, contact_id, title, start_at, end_at, status, appointment_type \
                 FROM local_appointments WHERE tenant_id = ?1 AND id = ?2",
                params![tenant_id, appointment_id],
                |row| {
                    Ok(LocalAppointment {
                        id: row.get(0)?,
                        contact_id: row.get(1)?,
                        title: row.get(2)?,
                        start: parse_ts_col(row, 3)?,
                        end: parse_ts_col(row, 4)?,
                        status: row.get(5)?,
                        appointment_type: parse_col::<AppointmentType>(row, 6)?,
                    })
                },
            )
            .optional()?;
        Ok(appointment)
    }

    fn upsert_appointment(&self, tenant_id: &str, appointment: &LocalAppointment) -> Result<()> {
        self.conn()?.execute(
            r#"
            INSERT INTO local_appointments
                (tenant_id, id, contact_id, title, start_at, end_at, status, appointment_type, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(tenant_id, id) DO UPDATE SET
                contact_id = excluded.contact_id,
                title = excluded.title,
                start_at = excluded.start_at,
                end_at = excluded.end_at,
                status = excluded.status,
                appointment_type = excluded.appointment_type,
                updated_at = excluded.updated_at
            "#,
            params![
                tenant_id,
                appointment.id,
                appointment.contact_id,
                appointment.title,
                appointment.start.to_rfc3339(),
                appointment.end.to_rfc3339(),
                appointment.status,
                appointment.appointment_type.as_str(),
                now_str(),
            ],
        )?;
        Ok(())
    }
}

fn now_str() -> String {
    Utc::now().to_rfc3339()
}

fn missing(local_id: &str) -> SyncError {
    SyncError::Storage(format!("ledger row for {} vanished during write", local_id))
}

fn parse_ts(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let value: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    let value: String = row.get(idx)?;
    value
        .parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn fetch_contact(
    conn: &Connection,
    tenant_id: &str,
    local_contact_id: &str,
) -> Result<Option<ContactSyncRecord>> {
    let sql = format!(
        "SELECT {} FROM contact_sync WHERE tenant_id = ?1 AND local_contact_id = ?2",
        CONTACT_COLUMNS
    );
    let record = conn
        .query_row(&sql, params![tenant_id, local_contact_id], contact_from_row)
        .optional()?;
    Ok(record)
}

/// Real local ids sort ahead of placeholders sharing the remote id
fn fetch_contact_by_remote(
    conn: &Connection,
    tenant_id: &str,
    remote_contact_id: &str,
) -> Result<Option<ContactSyncRecord>> {
    let sql = format!(
        "SELECT {} FROM contact_sync WHERE tenant_id = ?1 AND remote_contact_id = ?2 \
         ORDER BY local_contact_id = ?3, id LIMIT 1",
        CONTACT_COLUMNS
    );
    let record = conn
        .query_row(
            &sql,
            params![tenant_id, remote_contact_id, placeholder_local_id(remote_contact_id)],
            contact_from_row,
        )
        .optional()?;
    Ok(record)
}

fn fetch_appointment_by_remote(
    conn: &Connection,
    tenant_id: &str,
    remote_event_id: &str,
) -> Result<Option<AppointmentSyncRecord>> {
    let sql = format!(
        "SELECT {} FROM appointment_sync WHERE tenant_id = ?1 AND remote_event_id = ?2 \
         ORDER BY local_appointment_id = ?3, id LIMIT 1",
        APPOINTMENT_COLUMNS
    );
    let record = conn
        .query_row(
            &sql,
            params![tenant_id, remote_event_id, placeholder_local_id(remote_event_id)],
            appointment_from_row,
        )
        .optional()?;
    Ok(record)
}

fn rekey(
    conn: &Connection,
    entity: EntityKind,
    tenant_id: &str,
    from_local_id: &str,
    to_local_id: &str,
) -> Result<bool> {
    let (table, column) = match entity {
        EntityKind::Contact => ("contact_sync", "local_contact_id"),
        EntityKind::Appointment => ("appointment_sync", "local_appointment_id"),
    };
    let taken: bool = conn.query_row(
        &format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE tenant_id = ?1 AND {} = ?2)",
            table, column
        ),
        params![tenant_id, to_local_id],
        |row| row.get(0),
    )?;

    let changed = if taken {
        conn.execute(
            &format!("DELETE FROM {} WHERE tenant_id = ?1 AND {} = ?2", table, column),
            params![tenant_id, from_local_id],
        )?
    } else {
        conn.execute(
            &format!(
                "UPDATE {} SET {} = ?3, updated_at = ?4 WHERE tenant_id = ?1 AND {} = ?2",
                table, column, column
            ),
            params![tenant_id, from_local_id, to_local_id, now_str()],
        )?
    };

    conn.execute(
        "UPDATE sync_activity SET local_id = ?4 WHERE tenant_id = ?1 AND entity = ?2 AND local_id = ?3",
        params![tenant_id, entity.as_str(), from_local_id, to_local_id],
    )?;
    Ok(changed > 0)
}

fn fetch_appointment(
    conn: &Connection,
    tenant_id: &str,
    local_appointment_id: &str,
) -> Result<Option<AppointmentSyncRecord>> {
    let sql = format!(
        "SELECT {} FROM appointment_sync WHERE tenant_id = ?1 AND local_appointment_id = ?2",
        APPOINTMENT_COLUMNS
    );
    let record = conn
        .query_row(
            &sql,
            params![tenant_id, local_appointment_id],
            appointment_from_row,
        )
        .optional()?;
    Ok(record)
}

fn contact_from_row(row: &Row<'_>) -> rusqlite::Result<ContactSyncRecord> {
    let attempts: i64 = row.get(9)?;
    Ok(ContactSyncRecord {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        local_contact_id: row.get(2)?,
        remote_contact_id: row.get(3)?,
        email: row.get(4)?,
        phone: row.get(5)?,
        sync_status: parse_col(row, 6)?,
        sync_direction: parse_col(row, 7)?,
        sync_error: row.get(8)?,
        attempt_count: attempts.max(0) as u32,
        last_synced_at: parse_ts(row.get(10)?),
        updated_at: parse_ts(row.get(11)?).unwrap_or_else(Utc::now),
    })
}

fn appointment_from_row(row: &Row<'_>) -> rusqlite::Result<AppointmentSyncRecord> {
    let attempts: i64 = row.get(14)?;
    Ok(AppointmentSyncRecord {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        local_appointment_id: row.get(2)?,
        local_contact_id: row.get(3)?,
        remote_event_id: row.get(4)?,
        remote_calendar_id: row.get(5)?,
        scheduled_start: parse_ts(row.get(6)?),
        scheduled_end: parse_ts(row.get(7)?),
        title: row.get(8)?,
        status: row.get(9)?,
        appointment_type: parse_col(row, 10)?,
        sync_status: parse_col(row, 11)?,
        sync_direction: parse_col(row, 12)?,
        sync_error: row.get(13)?,
        attempt_count: attempts.max(0) as u32,
        last_synced_at: parse_ts(row.get(15)?),
        updated_at: parse_ts(row.get(16)?).unwrap_or_else(Utc::now),
    })
}
