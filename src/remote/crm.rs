//! Typed remote CRM endpoints
//!
//! Thin wrappers over [`ApiClient`] for the contact, calendar and conversation
//! APIs. Responses wrap the entity in an envelope (`{"contact": {...}}`), which
//! is unwrapped here.

use super::client::ApiClient;
use crate::{Result, SyncError};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Search results wanted per identifier, only the first is used
const SEARCH_LIMIT: u32 = 1;

/// Contact as returned by the remote CRM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteContact {
    pub id: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Contact body for create and update
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactPayload {
    pub location_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Identifier used to search for an existing remote contact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactLookup<'a> {
    Email(&'a str),
    Phone(&'a str),
}

impl ContactLookup<'_> {
    pub fn field(&self) -> &'static str {
        match self {
            ContactLookup::Email(_) => "email",
            ContactLookup::Phone(_) => "phone",
        }
    }

    pub fn value(&self) -> &str {
        match self {
            ContactLookup::Email(v) | ContactLookup::Phone(v) => v,
        }
    }
}

/// Calendar event (appointment) as returned by the remote CRM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEvent {
    pub id: String,
    pub calendar_id: String,
    #[serde(default)]
    pub contact_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub appointment_status: Option<String>,
}

/// Event body for create and update
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    pub calendar_id: String,
    pub location_id: String,
    pub contact_id: String,
    pub title: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub appointment_status: String,
}

/// Outbound message channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    #[serde(rename = "SMS")]
    Sms,
    Email,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Sms => "SMS",
            MessageKind::Email => "Email",
        }
    }
}

impl std::str::FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sms" => Ok(MessageKind::Sms),
            "email" => Ok(MessageKind::Email),
            other => Err(format!("unknown message kind: {}", other)),
        }
    }
}

/// Remote CRM API for one tenant
pub struct CrmApi {
    client: ApiClient,
}

impl CrmApi {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    /// Location the tenant's credentials are scoped to
    pub async fn location_id(&self) -> Result<String> {
        self.client.location_id().await
    }

    /// `GET /contacts/{id}`
    pub async fn get_contact(&self, contact_id: &str) -> Result<RemoteContact> {
        let value = self
            .client
            .get(&format!("/contacts/{}", urlencoding::encode(contact_id)))
            .await?;
        unwrap_envelope(value, &["contact"])
    }

    /// `POST /contacts/search`, first match wins
    pub async fn search_contact(&self, lookup: ContactLookup<'_>) -> Result<Option<RemoteContact>> {
        let mut body = json!({
            "locationId": self.location_id().await?,
            "limit": SEARCH_LIMIT,
        });
        body[lookup.field()] = Value::String(lookup.value().to_string());

        let value = self.client.post("/contacts/search", body).await?;
        let contacts: Vec<RemoteContact> = unwrap_envelope(value, &["contacts"])?;
        Ok(contacts.into_iter().next())
    }

    /// `POST /contacts/`
    pub async fn create_contact(&self, payload: &ContactPayload) -> Result<RemoteContact> {
        let value = self
            .client
            .post("/contacts/", serde_json::to_value(payload)?)
            .await?;
        unwrap_envelope(value, &["contact"])
    }

    /// `PUT /contacts/{id}`
    pub async fn update_contact(
        &self,
        contact_id: &str,
        payload: &ContactPayload,
    ) -> Result<RemoteContact> {
        let mut body = serde_json::to_value(payload)?;
        // locationId is fixed at creation
        if let Some(map) = body.as_object_mut() {
            map.remove("locationId");
        }
        let value = self
            .client
            .put(&format!("/contacts/{}", urlencoding::encode(contact_id)), body)
            .await?;
        unwrap_envelope(value, &["contact"])
    }

    /// `GET /calendars/events/appointments/{id}`
    pub async fn get_event(&self, event_id: &str) -> Result<RemoteEvent> {
        let value = self
            .client
            .get(&format!(
                "/calendars/events/appointments/{}",
                urlencoding::encode(event_id)
            ))
            .await?;
        unwrap_envelope(value, &["appointment", "event"])
    }

    /// `POST /calendars/events/appointments`
    pub async fn create_event(&self, payload: &EventPayload) -> Result<RemoteEvent> {
        let value = self
            .client
            .post("/calendars/events/appointments", serde_json::to_value(payload)?)
            .await?;
        unwrap_envelope(value, &["appointment", "event"])
    }

    /// `PUT /calendars/events/appointments/{id}`
    pub async fn update_event(&self, event_id: &str, payload: &EventPayload) -> Result<RemoteEvent> {
        let value = self
            .client
            .put(
                &format!(
                    "/calendars/events/appointments/{}",
                    urlencoding::encode(event_id)
                ),
                serde_json::to_value(payload)?,
            )
            .await?;
        unwrap_envelope(value, &["appointment", "event"])
    }

    /// `DELETE /calendars/events/{id}`
    pub async fn delete_event(&self, event_id: &str) -> Result<()> {
        self.client
            .delete(&format!("/calendars/events/{}", urlencoding::encode(event_id)))
            .await?;
        Ok(())
    }

    /// `POST /conversations/messages`, returns the message id if one came back
    pub async fn send_message(
        &self,
        kind: MessageKind,
        contact_id: &str,
        message: &str,
    ) -> Result<Option<String>> {
        let body = json!({
            "type": kind.as_str(),
            "contactId": contact_id,
            "message": message,
        });
        let value = self.client.post("/conversations/messages", body).await?;
        Ok(value
            .get("messageId")
            .and_then(Value::as_str)
            .map(str::to_string))
    }
}

/// Take the entity out of `{"<key>": ...}`, or use the body as is
fn unwrap_envelope<T: DeserializeOwned>(value: Value, keys: &[&str]) -> Result<T> {
    let inner = match value {
        Value::Object(mut map) => {
            match keys.iter().find_map(|key| map.remove(*key)) {
                Some(inner) => inner,
                None => Value::Object(map),
            }
        }
        other => other,
    };
    serde_json::from_value(inner)
        .map_err(|e| SyncError::Other(format!("unexpected remote CRM response: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{CredentialResolver, CrmAccount, Credentials};
    use crate::ledger::SyncLedger;
    use crate::remote::retry::RetryConfig;
    use crate::remote::scripted::ScriptedTransport;
    use crate::remote::transport::RequestBody;
    use reqwest::Method;
    use std::sync::Arc;

    fn api(transport: Arc<ScriptedTransport>) -> CrmApi {
        let ledger = Arc::new(SyncLedger::in_memory().unwrap());
        ledger
            .upsert_account(&CrmAccount::new("d1", Credentials::api_key("key", "loc-1")))
            .unwrap();
        let resolver = Arc::new(CredentialResolver::new("d1", ledger, None));
        CrmApi::new(
            ApiClient::new("https://crm.test", transport, resolver).with_retry(RetryConfig::quick()),
        )
    }

    fn json_body(body: &Option<RequestBody>) -> Value {
        match body {
            Some(RequestBody::Json(v)) => v.clone(),
            _ => Value::Null,
        }
    }

    #[tokio::test]
    async fn test_search_sends_location_and_field() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond_json(
            Method::POST,
            "/contacts/search",
            200,
            json!({"contacts": [{"id": "R1", "email": "a@b.com"}, {"id": "R2"}]}),
        );
        let crm = api(transport.clone());

        let found = crm
            .search_contact(ContactLookup::Email("a@b.com"))
            .await
            .unwrap();
        assert_eq!(found.map(|c| c.id).as_deref(), Some("R1"));

        let body = json_body(&transport.requests()[0].body);
        assert_eq!(body["locationId"], "loc-1");
        assert_eq!(body["email"], "a@b.com");
        assert!(body.get("phone").is_none());
    }

    #[tokio::test]
    async fn test_search_without_match() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond_json(Method::POST, "/contacts/search", 200, json!({"contacts": []}));
        let crm = api(transport);
        assert!(crm
            .search_contact(ContactLookup::Phone("555"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_update_contact_drops_location() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond_json(Method::PUT, "/contacts/R1", 200, json!({"contact": {"id": "R1"}}));
        let crm = api(transport.clone());

        let payload = ContactPayload {
            location_id: "loc-1".into(),
            email: Some("a@b.com".into()),
            ..Default::default()
        };
        crm.update_contact("R1", &payload).await.unwrap();

        let body = json_body(&transport.requests()[0].body);
        assert!(body.get("locationId").is_none());
        assert_eq!(body["email"], "a@b.com");
    }

    #[tokio::test]
    async fn test_event_round_trip_shapes() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond_json(
            Method::POST,
            "/calendars/events/appointments",
            200,
            json!({
                "id": "E1",
                "calendarId": "cal-1",
                "contactId": "R1",
                "title": "Service",
                "startTime": "2026-11-02T10:00:00-05:00",
                "endTime": "2026-11-02T11:00:00-05:00",
                "appointmentStatus": "confirmed"
            }),
        );
        let crm = api(transport.clone());

        let start = "2026-11-02T15:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let event = crm
            .create_event(&EventPayload {
                calendar_id: "cal-1".into(),
                location_id: "loc-1".into(),
                contact_id: "R1".into(),
                title: "Service".into(),
                start_time: start,
                end_time: start + chrono::Duration::hours(1),
                appointment_status: "confirmed".into(),
            })
            .await
            .unwrap();
        assert_eq!(event.id, "E1");
        assert_eq!(event.start_time, start);

        let body = json_body(&transport.requests()[0].body);
        assert_eq!(body["calendarId"], "cal-1");
        assert_eq!(body["contactId"], "R1");
    }

    #[tokio::test]
    async fn test_send_message() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond_json(
            Method::POST,
            "/conversations/messages",
            200,
            json!({"messageId": "M1"}),
        );
        let crm = api(transport.clone());

        let id = crm.send_message(MessageKind::Sms, "R1", "hi").await.unwrap();
        assert_eq!(id.as_deref(), Some("M1"));
        let body = json_body(&transport.requests()[0].body);
        assert_eq!(body["type"], "SMS");
    }

    #[test]
    fn test_unwrap_envelope() {
        let wrapped: RemoteContact =
            unwrap_envelope(json!({"contact": {"id": "R1"}}), &["contact"]).unwrap();
        assert_eq!(wrapped.id, "R1");
        let bare: RemoteContact = unwrap_envelope(json!({"id": "R2"}), &["contact"]).unwrap();
        assert_eq!(bare.id, "R2");
        assert!(unwrap_envelope::<RemoteContact>(json!({"nope": 1}), &["contact"]).is_err());
    }
}
