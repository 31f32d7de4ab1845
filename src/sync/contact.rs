//! Contact reconciliation
//!
//! [`ensure_remote_contact`] guarantees a live, correctly linked remote
//! contact for a local one: verify the stored link, heal it when the remote
//! record is gone, search by email then phone, and only then create.

use super::metrics;
use super::session::TenantSession;
use crate::ledger::{
    ActivityAction, ContactSyncRecord, EntityKind, LocalContact, SyncDirection, SyncStatus,
};
use crate::remote::{ContactLookup, ContactPayload};
use crate::{Result, SyncError};
use tracing::{debug, info, warn};

/// How the remote link was established
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactOutcome {
    /// Stored link still resolves
    Verified,
    /// Stored link resolves and queued local changes were pushed
    Updated,
    /// Matched an existing remote contact by email or phone
    Found,
    /// Created a new remote contact
    Created,
}

impl ContactOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContactOutcome::Verified => "verified",
            ContactOutcome::Updated => "updated",
            ContactOutcome::Found => "found",
            ContactOutcome::Created => "created",
        }
    }
}

/// Result of a successful contact reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactSync {
    pub local_contact_id: String,
    pub remote_contact_id: String,
    pub outcome: ContactOutcome,
    /// Stale remote id this reconciliation replaced
    pub replaced: Option<String>,
}

/// Make sure a local contact has a verified remote counterpart
///
/// Failures are recorded on the ledger row and in the activity trail before
/// being returned. Callers treat an `Err` as "do not message this contact".
pub async fn ensure_remote_contact(
    session: &TenantSession,
    local_contact_id: &str,
) -> Result<ContactSync> {
    if !session.tenant.sync_contacts_enabled {
        metrics::record_reconcile("contact", "not_enabled");
        return Err(SyncError::NotEnabled("contact"));
    }

    let _guard = session
        .locks
        .lock(session.tenant_id(), local_contact_id)
        .await;
    ensure_locked(session, local_contact_id).await
}

/// Body of [`ensure_remote_contact`] for callers already holding the contact lock
pub(crate) async fn ensure_locked(
    session: &TenantSession,
    local_contact_id: &str,
) -> Result<ContactSync> {
    let result = reconcile(session, local_contact_id).await;

    match &result {
        Ok(sync) => {
            metrics::record_reconcile("contact", sync.outcome.as_str());
        }
        Err(e) => {
            let code = e.code();
            metrics::record_reconcile("contact", &code.to_string());
            warn!(
                tenant = %session.tenant_id(),
                local_contact_id,
                code = %code,
                "Contact reconciliation failed: {}",
                e
            );

            match session.ledger.record_contact_failure(
                session.tenant_id(),
                local_contact_id,
                code,
                &e.to_string(),
                session.max_attempts,
            ) {
                Ok(Some(status)) => debug!(local_contact_id, status = %status, "Recorded failure"),
                Ok(None) => {}
                Err(store_err) => warn!(
                    tenant = %session.tenant_id(),
                    local_contact_id,
                    "Failed to record contact failure: {}",
                    store_err
                ),
            }

            // The no-identifiers branch already wrote its own entry
            if !matches!(e, SyncError::Validation(ref m) if m == NO_IDENTIFIERS) {
                session.activity(
                    EntityKind::Contact,
                    local_contact_id,
                    None,
                    ActivityAction::Failed,
                    format!("{}: {}", code, e),
                );
            }
        }
    }

    result
}

const NO_IDENTIFIERS: &str = "no identifiers";

async fn reconcile(session: &TenantSession, local_contact_id: &str) -> Result<ContactSync> {
    let tenant_id = session.tenant_id();
    let contact = session
        .records
        .get_contact(tenant_id, local_contact_id)?
        .ok_or_else(|| {
            SyncError::Validation(format!("local contact {} not found", local_contact_id))
        })?;

    let record = session.ledger.ensure_contact_record(
        tenant_id,
        local_contact_id,
        contact.email(),
        contact.phone(),
    )?;

    // Verify the stored link, clearing it if the remote record is gone
    let mut stale_id = None;
    if let Some(remote_id) = record.remote_contact_id.clone() {
        match verify_link(session, &record, &contact, &remote_id).await {
            Ok(sync) => return Ok(sync),
            Err(e) if e.is_gone() => {
                session.ledger.clear_contact_link(tenant_id, local_contact_id)?;
                session.activity(
                    EntityKind::Contact,
                    local_contact_id,
                    Some(&remote_id),
                    ActivityAction::Stale,
                    "stale, re-syncing",
                );
                warn!(
                    tenant = %tenant_id,
                    local_contact_id,
                    remote_id = %remote_id,
                    "Linked remote contact is gone, re-syncing"
                );
                stale_id = Some(remote_id);
            }
            Err(e) => return Err(e),
        }
    }

    // Nothing to search or create with
    if !contact.has_identifiers() {
        session.activity(
            EntityKind::Contact,
            local_contact_id,
            None,
            ActivityAction::NoIdentifiers,
            NO_IDENTIFIERS,
        );
        return Err(SyncError::Validation(NO_IDENTIFIERS.to_string()));
    }

    // Email is the stronger identifier
    let lookups = [
        contact.email().map(ContactLookup::Email),
        contact.phone().map(ContactLookup::Phone),
    ];
    for lookup in lookups.into_iter().flatten() {
        if let Some(found) = session.crm.search_contact(lookup).await? {
            debug!(
                tenant = %tenant_id,
                local_contact_id,
                remote_id = %found.id,
                by = lookup.field(),
                "Matched existing remote contact"
            );
            return link(
                session,
                local_contact_id,
                &found.id,
                ContactOutcome::Found,
                format!("found by {}", lookup.field()),
                stale_id,
            );
        }
    }

    let payload = ContactPayload {
        location_id: session.crm.location_id().await?,
        tags: vec![session.tenant.lead_source_tag.clone()],
        source: Some(session.tenant.source_tag.clone()),
        ..contact_payload(&contact)
    };
    let created = session.crm.create_contact(&payload).await?;
    info!(
        tenant = %tenant_id,
        local_contact_id,
        remote_id = %created.id,
        "Created remote contact"
    );
    link(
        session,
        local_contact_id,
        &created.id,
        ContactOutcome::Created,
        "created".to_string(),
        stale_id,
    )
}

/// GET the linked contact; push queued local changes if the row is pending
async fn verify_link(
    session: &TenantSession,
    record: &ContactSyncRecord,
    contact: &LocalContact,
    remote_id: &str,
) -> Result<ContactSync> {
    let tenant_id = session.tenant_id();
    session.crm.get_contact(remote_id).await?;

    let outcome = if record.sync_status == SyncStatus::PendingRemote {
        let payload = contact_payload(contact);
        session.crm.update_contact(remote_id, &payload).await?;
        session
            .ledger
            .link_contact(tenant_id, &record.local_contact_id, remote_id, SyncDirection::LocalToRemote)?;
        session.activity(
            EntityKind::Contact,
            &record.local_contact_id,
            Some(remote_id),
            ActivityAction::Updated,
            "updated",
        );
        ContactOutcome::Updated
    } else {
        if record.sync_status != SyncStatus::Synced {
            session.ledger.link_contact(
                tenant_id,
                &record.local_contact_id,
                remote_id,
                record.sync_direction,
            )?;
        }
        session.activity(
            EntityKind::Contact,
            &record.local_contact_id,
            Some(remote_id),
            ActivityAction::Verified,
            "verified",
        );
        ContactOutcome::Verified
    };

    Ok(ContactSync {
        local_contact_id: record.local_contact_id.clone(),
        remote_contact_id: remote_id.to_string(),
        outcome,
        replaced: None,
    })
}

fn link(
    session: &TenantSession,
    local_contact_id: &str,
    remote_id: &str,
    outcome: ContactOutcome,
    message: String,
    stale_id: Option<String>,
) -> Result<ContactSync> {
    session.ledger.link_contact(
        session.tenant_id(),
        local_contact_id,
        remote_id,
        SyncDirection::LocalToRemote,
    )?;

    if let Some(ref old) = stale_id {
        session.activity(
            EntityKind::Contact,
            local_contact_id,
            Some(remote_id),
            ActivityAction::StaleReplaced,
            format!("stale id {} replaced by {}", old, remote_id),
        );
    }

    let action = match outcome {
        ContactOutcome::Found => ActivityAction::Found,
        _ => ActivityAction::Created,
    };
    session.activity(EntityKind::Contact, local_contact_id, Some(remote_id), action, message);

    Ok(ContactSync {
        local_contact_id: local_contact_id.to_string(),
        remote_contact_id: remote_id.to_string(),
        outcome,
        replaced: stale_id,
    })
}

/// Name and identifiers of a local contact, without location, source or tags
fn contact_payload(contact: &LocalContact) -> ContactPayload {
    ContactPayload {
        first_name: contact.first_name.clone(),
        last_name: contact.last_name.clone(),
        name: contact.full_name(),
        email: contact.email().map(str::to_string),
        phone: contact.phone().map(str::to_string),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::testing::{api_key_session, contact_json};
    use crate::ledger::RecordStore;
    use crate::remote::transport::RequestBody;
    use crate::remote::ScriptedTransport;
    use reqwest::Method;
    use serde_json::{json, Value};

    fn activities(session: &TenantSession, local_id: &str) -> Vec<ActivityAction> {
        session
            .ledger
            .activities_for(session.tenant_id(), EntityKind::Contact, local_id)
            .unwrap()
            .into_iter()
            .map(|a| a.action)
            .collect()
    }

    #[tokio::test]
    async fn test_creates_when_search_finds_nothing() {
        let (session, transport) = api_key_session();
        session
            .records
            .upsert_contact("d1", &LocalContact::new("c1").with_name("Ada", "L").with_email("a@b.com"))
            .unwrap();
        transport.respond_json(Method::POST, "/contacts/search", 200, json!({"contacts": []}));
        transport.respond_json(Method::POST, "/contacts/", 200, contact_json("R1"));

        let sync = ensure_remote_contact(&session, "c1").await.unwrap();
        assert_eq!(sync.remote_contact_id, "R1");
        assert_eq!(sync.outcome, ContactOutcome::Created);

        let create = transport
            .requests()
            .into_iter()
            .find(|r| r.method == Method::POST && r.path() == "/contacts/")
            .unwrap();
        let Some(RequestBody::Json(body)) = create.body else {
            panic!("expected JSON body");
        };
        assert_eq!(body["locationId"], "loc-1");
        assert_eq!(body["source"], "dealersync");
        assert_eq!(body["tags"], json!(["dealership-crm"]));
        assert_eq!(body["name"], "Ada L");

        let record = session.ledger.get_contact_record("d1", "c1").unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Synced);
        assert_eq!(activities(&session, "c1"), vec![ActivityAction::Created]);
    }

    #[tokio::test]
    async fn test_linked_contact_is_idempotent() {
        let (session, transport) = api_key_session();
        session
            .records
            .upsert_contact("d1", &LocalContact::new("c1").with_email("a@b.com"))
            .unwrap();
        session
            .ledger
            .link_contact("d1", "c1", "R1", SyncDirection::LocalToRemote)
            .unwrap();
        transport.respond_json(Method::GET, "/contacts/R1", 200, json!({"contact": contact_json("R1")}));

        let first = ensure_remote_contact(&session, "c1").await.unwrap();
        let second = ensure_remote_contact(&session, "c1").await.unwrap();

        assert_eq!(first.remote_contact_id, "R1");
        assert_eq!(second.remote_contact_id, "R1");
        assert_eq!(second.outcome, ContactOutcome::Verified);
        assert_eq!(transport.write_calls(), 0);
        assert_eq!(transport.calls(Method::GET, "/contacts/R1"), 2);
    }

    #[tokio::test]
    async fn test_stale_link_self_heals() {
        let (session, transport) = api_key_session();
        session
            .records
            .upsert_contact("d1", &LocalContact::new("c1").with_email("a@b.com"))
            .unwrap();
        session
            .ledger
            .link_contact("d1", "c1", "R-old", SyncDirection::LocalToRemote)
            .unwrap();
        transport.respond_json(Method::GET, "/contacts/R-old", 404, json!({"message": "gone"}));
        transport.respond_json(Method::POST, "/contacts/search", 200, json!({"contacts": []}));
        transport.respond_json(Method::POST, "/contacts/", 201, json!({"contact": contact_json("R-new")}));
        transport.respond_json(Method::GET, "/contacts/R-new", 200, json!({"contact": contact_json("R-new")}));

        let sync = ensure_remote_contact(&session, "c1").await.unwrap();
        assert_eq!(sync.remote_contact_id, "R-new");
        assert_eq!(sync.replaced.as_deref(), Some("R-old"));

        let record = session.ledger.get_contact_record("d1", "c1").unwrap().unwrap();
        assert_eq!(record.remote_contact_id.as_deref(), Some("R-new"));
        assert_eq!(record.sync_status, SyncStatus::Synced);
        assert_eq!(
            activities(&session, "c1"),
            vec![
                ActivityAction::Stale,
                ActivityAction::StaleReplaced,
                ActivityAction::Created
            ]
        );

        // New id resolves
        let again = ensure_remote_contact(&session, "c1").await.unwrap();
        assert_eq!(again.outcome, ContactOutcome::Verified);
    }

    /// Email and phone searches answered by body field, each with its own id
    fn script_searches(transport: &ScriptedTransport, by_email: Value, by_phone: Value) {
        transport.respond_when(Method::POST, "/contacts/search", "email", "a@b.com", 200, by_email);
        transport.respond_when(Method::POST, "/contacts/search", "phone", "555-0100", 200, by_phone);
    }

    #[tokio::test]
    async fn test_email_match_wins_over_phone() {
        let (session, transport) = api_key_session();
        session
            .records
            .upsert_contact(
                "d1",
                &LocalContact::new("c1").with_email("a@b.com").with_phone("555-0100"),
            )
            .unwrap();
        script_searches(
            &transport,
            json!({"contacts": [contact_json("R-email")]}),
            json!({"contacts": [contact_json("R-phone")]}),
        );

        let sync = ensure_remote_contact(&session, "c1").await.unwrap();
        assert_eq!(sync.remote_contact_id, "R-email");
        assert_eq!(sync.outcome, ContactOutcome::Found);
        assert_eq!(transport.calls(Method::POST, "/contacts/search"), 1);

        let search = &transport.requests()[0];
        let Some(RequestBody::Json(ref body)) = search.body else {
            panic!("expected JSON body");
        };
        assert_eq!(body["email"], "a@b.com");
        assert!(body.get("phone").is_none());
    }

    #[tokio::test]
    async fn test_phone_search_when_email_misses() {
        let (session, transport) = api_key_session();
        session
            .records
            .upsert_contact(
                "d1",
                &LocalContact::new("c1").with_email("a@b.com").with_phone("555-0100"),
            )
            .unwrap();
        script_searches(
            &transport,
            json!({"contacts": []}),
            json!({"contacts": [contact_json("R-phone")]}),
        );

        let sync = ensure_remote_contact(&session, "c1").await.unwrap();
        assert_eq!(sync.remote_contact_id, "R-phone");
        assert_eq!(transport.calls(Method::POST, "/contacts/search"), 2);
        assert_eq!(transport.calls(Method::POST, "/contacts/"), 0);
    }

    #[tokio::test]
    async fn test_concurrent_calls_create_once() {
        let (session, transport) = api_key_session();
        session
            .records
            .upsert_contact("d1", &LocalContact::new("c1").with_email("a@b.com"))
            .unwrap();
        session.ledger.enqueue_contact("d1", "c1", Some("a@b.com"), None).unwrap();
        transport.respond_json(Method::POST, "/contacts/search", 200, json!({"contacts": []}));
        transport.respond_json(Method::POST, "/contacts/", 200, json!({"contact": contact_json("R1")}));
        transport.respond_json(Method::GET, "/contacts/R1", 200, json!({"contact": contact_json("R1")}));

        let (first, second) = tokio::join!(
            ensure_remote_contact(&session, "c1"),
            ensure_remote_contact(&session, "c1")
        );
        let (first, second) = (first.unwrap(), second.unwrap());
        assert_eq!(first.remote_contact_id, "R1");
        assert_eq!(second.remote_contact_id, "R1");
        assert_eq!(transport.calls(Method::POST, "/contacts/"), 1);

        let outcomes = [first.outcome, second.outcome];
        assert!(outcomes.contains(&ContactOutcome::Created));
        assert!(outcomes.contains(&ContactOutcome::Verified));
        let record = session.ledger.get_contact_record("d1", "c1").unwrap().unwrap();
        assert!(record.is_linked());
    }

    #[tokio::test]
    async fn test_no_identifiers_is_validation_error() {
        let (session, transport) = api_key_session();
        session
            .records
            .upsert_contact("d1", &LocalContact::new("c1").with_name("No", "Contact"))
            .unwrap();

        let err = ensure_remote_contact(&session, "c1").await.unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::Validation);
        assert_eq!(transport.total_calls(), 0);

        let record = session.ledger.get_contact_record("d1", "c1").unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Error);
        assert!(record.sync_error.unwrap().contains("no identifiers"));
        assert_eq!(activities(&session, "c1"), vec![ActivityAction::NoIdentifiers]);
    }

    #[tokio::test]
    async fn test_disabled_contact_sync() {
        let (mut session, transport) = api_key_session();
        session.tenant.sync_contacts_enabled = false;

        let err = ensure_remote_contact(&session, "c1").await.unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::NotEnabled);
        assert_eq!(transport.total_calls(), 0);
        assert!(session.ledger.get_contact_record("d1", "c1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pending_local_edit_is_pushed() {
        let (session, transport) = api_key_session();
        let contact = LocalContact::new("c1").with_email("new@b.com");
        session.records.upsert_contact("d1", &contact).unwrap();
        session
            .ledger
            .link_contact("d1", "c1", "R1", SyncDirection::LocalToRemote)
            .unwrap();
        session
            .ledger
            .enqueue_contact("d1", "c1", contact.email(), None)
            .unwrap();
        transport.respond_json(Method::GET, "/contacts/R1", 200, json!({"contact": contact_json("R1")}));
        transport.respond_json(Method::PUT, "/contacts/R1", 200, json!({"contact": contact_json("R1")}));

        let sync = ensure_remote_contact(&session, "c1").await.unwrap();
        assert_eq!(sync.outcome, ContactOutcome::Updated);
        assert_eq!(transport.calls(Method::PUT, "/contacts/R1"), 1);
        assert_eq!(
            session.ledger.get_contact_record("d1", "c1").unwrap().unwrap().sync_status,
            SyncStatus::Synced
        );
    }

    #[tokio::test]
    async fn test_transient_failure_keeps_row_pending() {
        let (session, transport) = api_key_session();
        session
            .records
            .upsert_contact("d1", &LocalContact::new("c1").with_email("a@b.com"))
            .unwrap();
        transport.respond(
            Method::POST,
            "/contacts/search",
            crate::remote::ApiResponse::new(429, ""),
        );

        let err = ensure_remote_contact(&session, "c1").await.unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::RateLimited);

        let record = session.ledger.get_contact_record("d1", "c1").unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::PendingRemote);
        assert_eq!(record.attempt_count, 1);
        assert_eq!(activities(&session, "c1"), vec![ActivityAction::Failed]);
    }
}
