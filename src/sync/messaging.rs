//! Outbound messaging guard
//!
//! Messages only go to contacts that hold a verified remote link.

use super::contact::ensure_remote_contact;
use super::session::TenantSession;
use crate::remote::MessageKind;
use crate::{Result, SyncError};
use tracing::{info, warn};

/// A message accepted by the remote CRM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub remote_contact_id: String,
    pub message_id: Option<String>,
}

/// Reconcile the contact, then send it a message
///
/// Any reconciliation failure is reported as `CONTACT_NOT_SYNCED`; the
/// underlying cause is already on the ledger row.
pub async fn send_message(
    session: &TenantSession,
    local_contact_id: &str,
    kind: MessageKind,
    body: &str,
) -> Result<SentMessage> {
    let remote_contact_id = match ensure_remote_contact(session, local_contact_id).await {
        Ok(sync) => sync.remote_contact_id,
        Err(e) => {
            warn!(
                tenant = %session.tenant_id(),
                local_contact_id,
                "Not messaging contact without a verified remote link: {}",
                e
            );
            return Err(SyncError::ContactNotSynced(format!(
                "{} ({})",
                local_contact_id,
                e.code()
            )));
        }
    };

    let message_id = session
        .crm
        .send_message(kind, &remote_contact_id, body)
        .await?;
    info!(
        tenant = %session.tenant_id(),
        local_contact_id,
        remote_id = %remote_contact_id,
        kind = kind.as_str(),
        "Message sent"
    );

    Ok(SentMessage {
        remote_contact_id,
        message_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{LocalContact, RecordStore};
    use crate::sync::testing::{api_key_session, contact_json, linked_contact};
    use crate::ErrorCode;
    use reqwest::Method;
    use serde_json::json;

    #[tokio::test]
    async fn test_sends_to_verified_contact() {
        let (session, transport) = api_key_session();
        linked_contact(&session, "c1", "R1");
        transport.respond_json(Method::GET, "/contacts/R1", 200, json!({"contact": contact_json("R1")}));
        transport.respond_json(
            Method::POST,
            "/conversations/messages",
            200,
            json!({"messageId": "M1"}),
        );

        let sent = send_message(&session, "c1", MessageKind::Sms, "Your car is ready")
            .await
            .unwrap();
        assert_eq!(sent.remote_contact_id, "R1");
        assert_eq!(sent.message_id.as_deref(), Some("M1"));
    }

    #[tokio::test]
    async fn test_refuses_unsyncable_contact() {
        let (session, transport) = api_key_session();
        session
            .records
            .upsert_contact("d1", &LocalContact::new("c1"))
            .unwrap();

        let err = send_message(&session, "c1", MessageKind::Email, "hi")
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ContactNotSynced);
        assert_eq!(transport.calls(Method::POST, "/conversations/messages"), 0);
    }
}
